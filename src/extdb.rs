use crate::rows::{decode_cell, normalize_row, RawRow};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;

/// Connection settings for the external student records database, read from
/// the `setup.datesync` section. Field names mirror the legacy integration's
/// configuration surface; which fields a driver actually uses is up to it
/// (the sqlite driver reads only `db_name`, as the database file path).
#[derive(Clone, Debug)]
pub struct ExtDbConfig {
    pub db_type: String,
    #[allow(dead_code)]
    pub db_host: String,
    #[allow(dead_code)]
    pub db_user: String,
    #[allow(dead_code)]
    pub db_pass: String,
    pub db_name: String,
    pub setup_sql: String,
    pub assessments_table: String,
    pub extensions_table: String,
    pub encoding: String,
    pub quoting: String,
    pub debug: bool,
}

fn section_str(section: &Value, key: &str) -> String {
    section
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

impl ExtDbConfig {
    pub fn from_section(section: &Value) -> Self {
        ExtDbConfig {
            db_type: section_str(section, "dbType"),
            db_host: section_str(section, "dbHost"),
            db_user: section_str(section, "dbUser"),
            db_pass: section_str(section, "dbPass"),
            db_name: section_str(section, "dbName"),
            setup_sql: section_str(section, "dbSetupSql"),
            assessments_table: section_str(section, "assessmentsTable"),
            extensions_table: section_str(section, "extensionsTable"),
            encoding: section_str(section, "dbEncoding"),
            quoting: section_str(section, "dbQuoting"),
            debug: section
                .get("debugDb")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }

    /// The fields without which a run must not attempt any I/O.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.db_type.is_empty() {
            missing.push("dbType");
        }
        if self.assessments_table.is_empty() {
            missing.push("assessmentsTable");
        }
        if self.extensions_table.is_empty() {
            missing.push("extensionsTable");
        }
        missing
    }
}

pub fn connect(cfg: &ExtDbConfig) -> anyhow::Result<Connection> {
    let conn = match cfg.db_type.to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => Connection::open(&cfg.db_name)?,
        other => anyhow::bail!("unsupported external db driver: {}", other),
    };
    if !cfg.setup_sql.is_empty() {
        conn.execute_batch(&cfg.setup_sql)?;
    }
    Ok(conn)
}

/// Table names come from configuration and cannot be bound as parameters, so
/// they are quoted as identifiers per the configured quoting mode.
pub fn quote_ident(quoting: &str, name: &str) -> String {
    if quoting.eq_ignore_ascii_case("sybase") {
        format!("[{}]", name.replace(']', "]]"))
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Reads a whole external table as normalized rows. Cell values are decoded
/// from the declared encoding; NULL reads as the empty string.
pub fn fetch_table_rows(
    conn: &Connection,
    table: &str,
    quoting: &str,
    encoding: &str,
) -> anyhow::Result<Vec<RawRow>> {
    let sql = format!("SELECT * FROM {}", quote_ident(quoting, table));
    let mut stmt = conn.prepare(&sql)?;
    let col_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let mut out = Vec::new();
    let mut raw_rows = stmt.query([])?;
    while let Some(row) = raw_rows.next()? {
        let mut cells = Vec::with_capacity(col_names.len());
        for (i, name) in col_names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => String::new(),
                ValueRef::Integer(v) => v.to_string(),
                ValueRef::Real(v) => v.to_string(),
                ValueRef::Text(bytes) => decode_cell(bytes, encoding),
                ValueRef::Blob(bytes) => decode_cell(bytes, encoding),
            };
            cells.push((name.clone(), value));
        }
        out.push(normalize_row(cells));
    }
    Ok(out)
}
