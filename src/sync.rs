use crate::extdb::{quote_ident, ExtDbConfig};
use crate::rows::{AssessmentRow, ExtensionRow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Policy clock-times substituted for any stored time-of-day when a calendar
/// date crosses between the two stores.
pub const SUBMISSION_TIME: &str = "18:00:00";
pub const FEEDBACK_TIME: &str = "09:00:00";

/// External usernames are the student code with this prefix.
const USERNAME_PREFIX: &str = "s";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityKind {
    Assignment,
    Quiz,
}

impl ActivityKind {
    fn label(self) -> &'static str {
        match self {
            ActivityKind::Assignment => "assignment",
            ActivityKind::Quiz => "quiz",
        }
    }
}

/// Internal activity snapshot row. Quizzes never carry a grading-due instant.
#[derive(Clone, Debug)]
pub struct Activity {
    pub id: String,
    pub course_id: String,
    pub link_code: String,
    pub name: String,
    pub kind: ActivityKind,
    pub due_at: i64,
    pub grading_due_at: Option<i64>,
}

/// One in-memory snapshot of the internal store, read in full before any
/// write so this run's writes never feed its own comparisons.
pub struct Snapshot {
    pub activities: Vec<Activity>,
    /// username -> user id
    pub users: HashMap<String, String>,
    /// (user id, activity id) -> (override id, stored extension instant)
    pub overrides: HashMap<(String, String), (String, i64)>,
}

pub fn load_snapshot(conn: &Connection) -> anyhow::Result<Snapshot> {
    let mut activities = Vec::new();

    // Assignments first, quizzes after: under a cross-kind link-code
    // collision the quiz entry overwrites the assignment entry.
    let mut stmt = conn.prepare(
        "SELECT id, course_id, link_code, name, due_at, grading_due_at
         FROM assignments
         WHERE link_code IS NOT NULL AND link_code != ''
         ORDER BY rowid",
    )?;
    let assignment_rows = stmt.query_map([], |r| {
        Ok(Activity {
            id: r.get(0)?,
            course_id: r.get(1)?,
            link_code: r.get(2)?,
            name: r.get(3)?,
            kind: ActivityKind::Assignment,
            due_at: r.get(4)?,
            grading_due_at: r.get(5)?,
        })
    })?;
    for row in assignment_rows {
        activities.push(row?);
    }

    let mut stmt = conn.prepare(
        "SELECT id, course_id, link_code, name, due_at
         FROM quizzes
         WHERE link_code IS NOT NULL AND link_code != ''
         ORDER BY rowid",
    )?;
    let quiz_rows = stmt.query_map([], |r| {
        Ok(Activity {
            id: r.get(0)?,
            course_id: r.get(1)?,
            link_code: r.get(2)?,
            name: r.get(3)?,
            kind: ActivityKind::Quiz,
            due_at: r.get(4)?,
            grading_due_at: None,
        })
    })?;
    for row in quiz_rows {
        activities.push(row?);
    }

    let mut users = HashMap::new();
    let mut stmt = conn.prepare("SELECT username, id FROM users")?;
    let user_rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    for row in user_rows {
        let (username, id) = row?;
        users.insert(username, id);
    }

    let mut overrides = HashMap::new();
    let mut stmt =
        conn.prepare("SELECT user_id, activity_id, id, extension_due_at FROM user_date_overrides")?;
    let override_rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, i64>(3)?,
        ))
    })?;
    for row in override_rows {
        let (user_id, activity_id, id, stored) = row?;
        overrides.insert((user_id, activity_id), (id, stored));
    }

    Ok(Snapshot {
        activities,
        users,
        overrides,
    })
}

/// Combines a `YYYY-MM-DD` date and an `HH:MM[:SS]` time into a unix instant.
pub fn combine_date_time(date: &str, time: &str) -> Option<i64> {
    let d = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let t = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M"))
        .ok()?;
    Some(NaiveDateTime::new(d, t).and_utc().timestamp())
}

pub fn date_part(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Builds the link-code index over the activity snapshot. Duplicate link
/// codes are last-write-wins, flagged as warnings rather than resolved.
pub fn build_activity_index(
    activities: &[Activity],
) -> (HashMap<String, Activity>, Vec<Value>) {
    let mut index = HashMap::new();
    let mut warnings = Vec::new();
    for activity in activities {
        if let Some(prev) = index.insert(activity.link_code.clone(), activity.clone()) {
            warnings.push(json!({
                "code": "duplicate_link_code",
                "linkCode": activity.link_code,
                "courseId": activity.course_id,
                "message": format!(
                    "link code is shared by {} '{}' and {} '{}'; the later entry wins",
                    prev.kind.label(), prev.name, activity.kind.label(), activity.name
                )
            }));
        }
    }
    (index, warnings)
}

/// Builds the (student code, link code) index over the extension rows,
/// keeping only qualifying rows. Duplicate keys are last-write-wins.
pub fn build_extension_index(
    extensions: &[ExtensionRow],
) -> (HashMap<(String, String), ExtensionRow>, Vec<Value>) {
    let mut index = HashMap::new();
    let mut warnings = Vec::new();
    for ext in extensions {
        if !ext.qualifies() {
            continue;
        }
        let key = (ext.student_code.clone(), ext.idcode.clone());
        if index.insert(key, ext.clone()).is_some() {
            warnings.push(json!({
                "code": "duplicate_extension_key",
                "studentCode": ext.student_code,
                "linkCode": ext.idcode,
                "message": "more than one qualifying extension row for this student and assessment; the later row wins"
            }));
        }
    }
    (index, warnings)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DueWriteReason {
    /// The external store had no due date; the internal value is exported.
    Export,
    /// The external pair disagreed with (local date, submission time).
    Correct,
}

impl DueWriteReason {
    fn label(&self) -> &'static str {
        match self {
            DueWriteReason::Export => "export",
            DueWriteReason::Correct => "correct",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DueWrite {
    pub link_code: String,
    pub due_date: String,
    pub due_time: String,
    pub reason: DueWriteReason,
}

#[derive(Clone, Debug)]
pub struct FeedbackWrite {
    pub activity_id: String,
    pub link_code: String,
    pub grading_due_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertAction {
    Create,
    Update,
}

impl UpsertAction {
    fn label(&self) -> &'static str {
        match self {
            UpsertAction::Create => "create",
            UpsertAction::Update => "update",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExtensionUpsert {
    pub username: String,
    pub user_id: String,
    pub activity_id: String,
    pub link_code: String,
    pub extension_due_at: i64,
    pub action: UpsertAction,
    /// Present for updates: the existing override row.
    pub override_id: Option<String>,
}

/// The corrective writes one run has decided on, plus its bookkeeping.
/// Building the plan touches nothing; applying it is a separate step.
#[derive(Default)]
pub struct Plan {
    pub due_writes: Vec<DueWrite>,
    pub feedback_writes: Vec<FeedbackWrite>,
    pub extension_upserts: Vec<ExtensionUpsert>,
    pub warnings: Vec<Value>,
    pub assessments_total: usize,
    pub matched: usize,
    pub skipped_unmatched: usize,
    pub extensions_qualifying: usize,
    pub skipped_unresolved: usize,
    pub extensions_unchanged: usize,
}

pub fn build_plan(
    index: &HashMap<String, Activity>,
    users: &HashMap<String, String>,
    overrides: &HashMap<(String, String), (String, i64)>,
    assessments: &[AssessmentRow],
    extension_index: &HashMap<(String, String), ExtensionRow>,
) -> Plan {
    let mut plan = Plan::default();
    plan.assessments_total = assessments.len();
    plan.extensions_qualifying = extension_index.len();

    for a in assessments {
        let Some(activity) = index.get(&a.idcode) else {
            // Unmatched join keys are a silent skip, not an error.
            plan.skipped_unmatched += 1;
            continue;
        };
        plan.matched += 1;

        // Due dates: the internal side is authoritative, and the external
        // time-of-day is always forced to the submission-time policy.
        let local_due_date = date_part(activity.due_at);
        if !a.due_date.is_empty() {
            if a.due_date != local_due_date || a.due_time != SUBMISSION_TIME {
                plan.due_writes.push(DueWrite {
                    link_code: activity.link_code.clone(),
                    due_date: local_due_date,
                    due_time: SUBMISSION_TIME.to_string(),
                    reason: DueWriteReason::Correct,
                });
            }
        } else {
            plan.due_writes.push(DueWrite {
                link_code: activity.link_code.clone(),
                due_date: local_due_date,
                due_time: SUBMISSION_TIME.to_string(),
                reason: DueWriteReason::Export,
            });
        }

        // Feedback dates flow the other way: the external date, combined with
        // the feedback-time policy, overwrites grading-due and cutoff.
        // Quizzes have no grading-due and never take this branch.
        if let Some(grading_due_at) = activity.grading_due_at {
            let local_fb_date = date_part(grading_due_at);
            if local_fb_date != a.feedback_date || FEEDBACK_TIME != a.feedback_time {
                match combine_date_time(&a.feedback_date, FEEDBACK_TIME) {
                    Some(ts) => plan.feedback_writes.push(FeedbackWrite {
                        activity_id: activity.id.clone(),
                        link_code: activity.link_code.clone(),
                        grading_due_at: ts,
                    }),
                    None => plan.warnings.push(json!({
                        "code": "feedback_date_unparseable",
                        "linkCode": activity.link_code,
                        "value": a.feedback_date,
                    })),
                }
            }
        }
    }

    // Stable order for reporting; the map itself is unordered.
    let mut ext_keys: Vec<&(String, String)> = extension_index.keys().collect();
    ext_keys.sort();
    for key in ext_keys {
        let ext = &extension_index[key];
        let username = format!("{}{}", USERNAME_PREFIX, ext.student_code);
        let (Some(user_id), Some(activity)) = (users.get(&username), index.get(&ext.idcode))
        else {
            plan.skipped_unresolved += 1;
            continue;
        };

        // The per-student extension time is read from the external row but
        // never used: the instant is always date + submission-time policy.
        let Some(extension_due_at) = combine_date_time(&ext.ext_due_date, SUBMISSION_TIME) else {
            plan.warnings.push(json!({
                "code": "extension_date_unparseable",
                "studentCode": ext.student_code,
                "linkCode": ext.idcode,
                "value": ext.ext_due_date,
            }));
            continue;
        };

        match overrides.get(&(user_id.clone(), activity.id.clone())) {
            Some((_, stored)) if *stored == extension_due_at => {
                plan.extensions_unchanged += 1;
            }
            Some((override_id, _)) => plan.extension_upserts.push(ExtensionUpsert {
                username,
                user_id: user_id.clone(),
                activity_id: activity.id.clone(),
                link_code: ext.idcode.clone(),
                extension_due_at,
                action: UpsertAction::Update,
                override_id: Some(override_id.clone()),
            }),
            None => plan.extension_upserts.push(ExtensionUpsert {
                username,
                user_id: user_id.clone(),
                activity_id: activity.id.clone(),
                link_code: ext.idcode.clone(),
                extension_due_at,
                action: UpsertAction::Create,
                override_id: None,
            }),
        }
    }

    plan
}

pub struct ApplySummary {
    pub due_writes_issued: usize,
    pub feedback_writes_issued: usize,
    pub extensions_created: usize,
    pub extensions_updated: usize,
}

/// Applies the plan: each corrective write is an independent statement, no
/// transaction grouping. External write results are not checked; the next
/// scheduled run is the only retry mechanism.
pub fn apply_plan(
    conn: &Connection,
    ext: &Connection,
    cfg: &ExtDbConfig,
    plan: &Plan,
) -> anyhow::Result<ApplySummary> {
    let assessments_table = quote_ident(&cfg.quoting, &cfg.assessments_table);
    let extensions_table = quote_ident(&cfg.quoting, &cfg.extensions_table);

    let mut summary = ApplySummary {
        due_writes_issued: 0,
        feedback_writes_issued: 0,
        extensions_created: 0,
        extensions_updated: 0,
    };

    let due_sql = format!(
        "UPDATE {} SET assessment_duedate = ?1, assessment_duetime = ?2,
                assessment_changebymoodle = 1
         WHERE assessment_idcode = ?3",
        assessments_table
    );
    for w in &plan.due_writes {
        let _ = ext.execute(&due_sql, (&w.due_date, &w.due_time, &w.link_code));
        summary.due_writes_issued += 1;
    }

    for w in &plan.feedback_writes {
        conn.execute(
            "UPDATE assignments SET grading_due_at = ?1, cutoff_at = ?1 WHERE id = ?2",
            (w.grading_due_at, &w.activity_id),
        )?;
        summary.feedback_writes_issued += 1;
    }

    for u in &plan.extension_upserts {
        match &u.action {
            UpsertAction::Update => {
                let Some(override_id) = u.override_id.as_ref() else {
                    continue;
                };
                conn.execute(
                    "UPDATE user_date_overrides SET extension_due_at = ? WHERE id = ?",
                    (u.extension_due_at, override_id),
                )?;
                summary.extensions_updated += 1;
            }
            UpsertAction::Create => {
                conn.execute(
                    "INSERT INTO user_date_overrides(
                        id, user_id, activity_id, extension_due_at,
                        locked, notified, workflow_state, assigned_marker)
                     VALUES(?, ?, ?, ?, 0, 0, NULL, NULL)",
                    (
                        Uuid::new_v4().to_string(),
                        &u.user_id,
                        &u.activity_id,
                        u.extension_due_at,
                    ),
                )?;
                summary.extensions_created += 1;
            }
        }
    }

    // End of run: acknowledge the external system's change flags.
    let _ = ext.execute(
        &format!(
            "UPDATE {} SET assessment_changebydw = 0 WHERE assessment_changebydw = 1",
            extensions_table
        ),
        [],
    );
    let _ = ext.execute(
        &format!(
            "UPDATE {} SET assessment_changebydw = 0 WHERE assessment_changebydw = 1",
            assessments_table
        ),
        [],
    );

    Ok(summary)
}

pub fn plan_to_json(plan: &Plan) -> Value {
    json!({
        "dueWrites": plan.due_writes.iter().map(|w| json!({
            "linkCode": w.link_code,
            "dueDate": w.due_date,
            "dueTime": w.due_time,
            "reason": w.reason.label(),
        })).collect::<Vec<_>>(),
        "feedbackWrites": plan.feedback_writes.iter().map(|w| json!({
            "linkCode": w.link_code,
            "activityId": w.activity_id,
            "gradingDueAt": w.grading_due_at,
        })).collect::<Vec<_>>(),
        "extensionUpserts": plan.extension_upserts.iter().map(|u| json!({
            "username": u.username,
            "userId": u.user_id,
            "activityId": u.activity_id,
            "linkCode": u.link_code,
            "extensionDueAt": u.extension_due_at,
            "action": u.action.label(),
        })).collect::<Vec<_>>(),
    })
}
