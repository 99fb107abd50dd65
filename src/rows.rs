use std::collections::HashMap;

/// A raw external row after normalization: column names case-folded to
/// lowercase, every cell decoded to a UTF-8 string. Absent and NULL cells are
/// empty strings, matching how the external extracts represent "no value".
pub type RawRow = HashMap<String, String>;

pub fn normalize_row(cells: Vec<(String, String)>) -> RawRow {
    let mut row = RawRow::new();
    for (name, value) in cells {
        row.insert(name.trim().to_ascii_lowercase(), value);
    }
    row
}

/// Decodes one cell from the declared external encoding. Encoding identity
/// (empty or utf-8) is a no-op; latin1 is mapped byte-for-byte; anything else
/// falls back to lossy UTF-8 rather than failing the row.
pub fn decode_cell(bytes: &[u8], encoding: &str) -> String {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | "utf-8" | "utf8" => String::from_utf8_lossy(bytes).into_owned(),
        "latin1" | "iso-8859-1" | "windows-1252" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn field(row: &RawRow, name: &str) -> String {
    row.get(name).map(|s| s.trim().to_string()).unwrap_or_default()
}

/// One row of the external assessments table.
#[derive(Clone, Debug)]
pub struct AssessmentRow {
    pub idcode: String,
    #[allow(dead_code)]
    pub name: String,
    pub due_date: String,
    pub due_time: String,
    pub feedback_date: String,
    pub feedback_time: String,
    #[allow(dead_code)]
    pub markscheme: String,
}

impl AssessmentRow {
    pub fn from_raw(row: &RawRow) -> Self {
        AssessmentRow {
            idcode: field(row, "assessment_idcode"),
            name: field(row, "assessment_name"),
            due_date: field(row, "assessment_duedate"),
            due_time: field(row, "assessment_duetime"),
            feedback_date: field(row, "assessment_feedbackdate"),
            feedback_time: field(row, "assessment_feedbacktime"),
            markscheme: field(row, "assessment_markscheme_code"),
        }
    }
}

/// One row of the external per-student extensions table.
#[derive(Clone, Debug)]
pub struct ExtensionRow {
    pub student_code: String,
    pub idcode: String,
    pub ext_due_date: String,
    /// Read from the extract but never fed into the computed instant.
    pub ext_due_time: String,
    #[allow(dead_code)]
    pub fb_due_date: String,
    #[allow(dead_code)]
    pub fb_due_time: String,
}

impl ExtensionRow {
    pub fn from_raw(row: &RawRow) -> Self {
        ExtensionRow {
            student_code: field(row, "student_code"),
            idcode: field(row, "assessment_idcode"),
            ext_due_date: field(row, "student_ext_duedate"),
            ext_due_time: field(row, "student_ext_duetime"),
            fb_due_date: field(row, "student_fbdue_date"),
            fb_due_time: field(row, "student_fbdue_time"),
        }
    }

    /// An extension row only takes part in the run when it is linked to an
    /// assessment and carries some due override.
    pub fn qualifies(&self) -> bool {
        !self.idcode.is_empty() && (!self.ext_due_date.is_empty() || !self.ext_due_time.is_empty())
    }
}
