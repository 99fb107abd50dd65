use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Datesync,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "datesync" => Some(Self::Datesync),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Datesync => "setup.datesync",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Datesync => json!({
            "dbType": "",
            "dbHost": "",
            "dbUser": "",
            "dbPass": "",
            "dbName": "",
            "dbSetupSql": "",
            "assessmentsTable": "",
            "extensionsTable": "",
            "dbEncoding": "",
            "dbQuoting": "ansi",
            "debugDb": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be a boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max: usize) -> Result<String, String> {
    let Some(s) = v.as_str() else {
        return Err(format!("{} must be a string", key));
    };
    if s.chars().count() > max {
        return Err(format!("{} must be at most {} characters", key, max));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Datesync => match k.as_str() {
                "dbType" | "dbHost" | "dbUser" | "dbName" | "dbEncoding" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "dbPass" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "dbSetupSql" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 600)?));
                }
                "assessmentsTable" | "extensionsTable" => {
                    let s = parse_string_max(v, k, 120)?;
                    if s.contains('\'') || s.contains(';') {
                        return Err(format!("{} must be a plain table name", k));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "dbQuoting" => {
                    let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if s != "ansi" && s != "sybase" {
                        return Err("dbQuoting must be one of: ansi, sybase".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "debugDb" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown datesync field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &rusqlite::Connection, section_name: &str) -> anyhow::Result<Value> {
    let section = SetupSection::parse(section_name)
        .ok_or_else(|| anyhow::anyhow!("unknown setup section: {}", section_name))?;
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let datesync = match load_section(conn, "datesync") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "datesync": datesync }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section_raw) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
