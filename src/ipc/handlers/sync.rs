use crate::extdb::{self, ExtDbConfig};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use crate::rows::{AssessmentRow, ExtensionRow};
use crate::sync;
use rusqlite::Connection;
use serde_json::{json, Value};

/// Everything read from the external store for one run. The connection is
/// kept for the apply phase and closed when this drops, on every path.
struct RunInput {
    cfg: ExtDbConfig,
    ext: Connection,
    assessments: Vec<AssessmentRow>,
    extensions: Vec<ExtensionRow>,
}

/// Configuration check, connection, and table reads, with the legacy status
/// codes carried in details.status: 0 = missing configuration (before any
/// I/O), 1 = connection failure, 4 = table read failure (connection released
/// before reporting).
fn gather(conn: &Connection, req_id: &str) -> Result<RunInput, Value> {
    let section = match setup::load_section(conn, "datesync") {
        Ok(v) => v,
        Err(e) => return Err(err(req_id, "db_query_failed", e.to_string(), None)),
    };
    let cfg = ExtDbConfig::from_section(&section);

    let missing = cfg.missing_fields();
    if !missing.is_empty() {
        return Err(err(
            req_id,
            "config_missing",
            format!("missing required configuration: {}", missing.join(", ")),
            Some(json!({ "status": 0, "missing": missing })),
        ));
    }

    let ext = match extdb::connect(&cfg) {
        Ok(c) => c,
        Err(e) => {
            return Err(err(
                req_id,
                "connect_failed",
                e.to_string(),
                Some(json!({ "status": 1 })),
            ))
        }
    };

    let assessments =
        match extdb::fetch_table_rows(&ext, &cfg.assessments_table, &cfg.quoting, &cfg.encoding) {
            Ok(rows) => rows.iter().map(AssessmentRow::from_raw).collect(),
            Err(e) => {
                return Err(err(
                    req_id,
                    "read_failed",
                    e.to_string(),
                    Some(json!({ "status": 4, "table": cfg.assessments_table })),
                ))
            }
        };

    let extensions =
        match extdb::fetch_table_rows(&ext, &cfg.extensions_table, &cfg.quoting, &cfg.encoding) {
            Ok(rows) => rows.iter().map(ExtensionRow::from_raw).collect(),
            Err(e) => {
                return Err(err(
                    req_id,
                    "read_failed",
                    e.to_string(),
                    Some(json!({ "status": 4, "table": cfg.extensions_table })),
                ))
            }
        };

    Ok(RunInput {
        cfg,
        ext,
        assessments,
        extensions,
    })
}

struct Prepared {
    input: RunInput,
    plan: sync::Plan,
    warnings: Vec<Value>,
}

fn prepare(conn: &Connection, req_id: &str) -> Result<Prepared, Value> {
    let input = gather(conn, req_id)?;

    // One full internal snapshot before any write.
    let snapshot = match sync::load_snapshot(conn) {
        Ok(s) => s,
        Err(e) => return Err(err(req_id, "db_query_failed", e.to_string(), None)),
    };

    let (index, mut warnings) = sync::build_activity_index(&snapshot.activities);
    let (ext_index, ext_warnings) = sync::build_extension_index(&input.extensions);
    warnings.extend(ext_warnings);

    let plan = sync::build_plan(
        &index,
        &snapshot.users,
        &snapshot.overrides,
        &input.assessments,
        &ext_index,
    );
    warnings.extend(plan.warnings.iter().cloned());

    Ok(Prepared {
        input,
        plan,
        warnings,
    })
}

fn handle_dates_preview(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let prepared = match prepare(conn, &req.id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let plan = &prepared.plan;

    ok(
        &req.id,
        json!({
            "assessmentsTotal": plan.assessments_total,
            "matched": plan.matched,
            "skippedUnmatched": plan.skipped_unmatched,
            "extensionsQualifying": plan.extensions_qualifying,
            "skippedUnresolved": plan.skipped_unresolved,
            "extensionsUnchanged": plan.extensions_unchanged,
            "plan": sync::plan_to_json(plan),
            "warnings": prepared.warnings,
        }),
    )
}

fn handle_dates_run(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let prepared = match prepare(conn, &req.id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let plan = &prepared.plan;

    let summary = match sync::apply_plan(conn, &prepared.input.ext, &prepared.input.cfg, plan) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    let mut result = json!({
        "assessmentsTotal": plan.assessments_total,
        "matched": plan.matched,
        "skippedUnmatched": plan.skipped_unmatched,
        "dueWritesIssued": summary.due_writes_issued,
        "feedbackWritesIssued": summary.feedback_writes_issued,
        "extensionsQualifying": plan.extensions_qualifying,
        "extensionsCreated": summary.extensions_created,
        "extensionsUpdated": summary.extensions_updated,
        "extensionsUnchanged": plan.extensions_unchanged,
        "skippedUnresolved": plan.skipped_unresolved,
        "warnings": prepared.warnings,
    });
    if prepared.input.cfg.debug {
        result["plan"] = sync::plan_to_json(plan);
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "dates.preview" => Some(handle_dates_preview(state, req)),
        "dates.run" => Some(handle_dates_run(state, req)),
        _ => None,
    }
}
