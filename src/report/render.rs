use crate::violation::ViolationRecord;
use serde::Serialize;

/// Suffix appended to the cross-validation summary line
pub const MISSED_SUFFIX: &str = " not found by the static analyzer";

/// Structured form of a report for `.json` output
#[derive(Serialize)]
struct JsonReport<'a> {
    total: usize,
    violations: Vec<JsonEntry<'a>>,
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    key: String,
    count: usize,
    #[serde(flatten)]
    record: &'a ViolationRecord,
}

pub fn total_occurrences(records: &[ViolationRecord]) -> usize {
    records.iter().map(|r| r.count()).sum()
}

/// `Found N violation.` / `Found N violations.` with an optional qualifier
pub fn summary_line(count: usize, suffix: &str) -> String {
    format!(
        "Found {} violation{}{}.",
        count,
        if count == 1 { "" } else { "s" },
        suffix
    )
}

/// Count line followed by one one-indexed entry per record, in the given order
pub fn format_report(records: &[ViolationRecord]) -> Vec<String> {
    let mut lines = Vec::with_capacity(records.len() + 1);
    lines.push(summary_line(total_occurrences(records), ""));
    for (i, record) in records.iter().enumerate() {
        let location = match &record.resolved {
            Some(source) => source.to_string(),
            None => record.runtime.to_string(),
        };
        lines.push(format!(
            "{}. source: {}, violations: [{}]",
            i + 1,
            location,
            record.samples.join("\n")
        ));
    }
    lines
}

/// Report of violations the static analyzer did not flag
pub fn format_missed(missed: &[ViolationRecord]) -> Vec<String> {
    let mut lines = Vec::with_capacity(missed.len() + 1);
    lines.push(summary_line(missed.len(), MISSED_SUFFIX));
    for (i, record) in missed.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, record));
    }
    lines
}

pub fn format_json(records: &[ViolationRecord]) -> serde_json::Result<String> {
    let report = JsonReport {
        total: total_occurrences(records),
        violations: records
            .iter()
            .map(|record| JsonEntry {
                key: record.key(),
                count: record.count(),
                record,
            })
            .collect(),
    };
    serde_json::to_string_pretty(&report)
}
