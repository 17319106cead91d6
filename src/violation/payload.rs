use crate::types::RuntimeLocation;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

/// Reporting API entry type carrying a policy violation
const CSP_VIOLATION_TYPE: &str = "csp-violation";

/// Body of a legacy `report-uri` delivery (`application/csp-report`)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LegacyReport {
    source_file: Option<String>,
    line_number: Option<u64>,
    column_number: Option<u64>,
    script_sample: Option<String>,
}

/// Body of a Reporting API `csp-violation` entry (`application/reports+json`)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportingApiBody {
    source_file: Option<String>,
    line_number: Option<u64>,
    column_number: Option<u64>,
    sample: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportingApiEntry {
    #[serde(rename = "type")]
    kind: String,
    body: Value,
}

/// A single well-formed violation occurrence extracted from a raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedViolation {
    pub location: RuntimeLocation,
    pub sample: String,
}

/// Extract every violation occurrence from a raw report payload.
///
/// Returns an empty list for anything that is not a recognizable report;
/// delivery is best-effort and the content is page-influenced.
pub fn parse_payload(raw: &str) -> Vec<ReportedViolation> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping unparseable report payload: {}", e);
            return vec![];
        }
    };

    match value {
        Value::Object(mut map) => {
            if let Some(report) = map.remove("csp-report") {
                parse_legacy(report).into_iter().collect()
            } else {
                parse_reporting_api_entry(Value::Object(map))
                    .into_iter()
                    .collect()
            }
        }
        Value::Array(entries) => entries
            .into_iter()
            .filter_map(parse_reporting_api_entry)
            .collect(),
        _ => {
            debug!("Skipping report payload without a report envelope");
            vec![]
        }
    }
}

fn parse_legacy(report: Value) -> Option<ReportedViolation> {
    let report: LegacyReport = match serde_json::from_value(report) {
        Ok(r) => r,
        Err(e) => {
            debug!("Skipping malformed csp-report: {}", e);
            return None;
        }
    };
    build(
        report.source_file,
        report.line_number,
        report.column_number,
        report.script_sample,
    )
}

fn parse_reporting_api_entry(entry: Value) -> Option<ReportedViolation> {
    let entry: ReportingApiEntry = serde_json::from_value(entry).ok()?;
    if entry.kind != CSP_VIOLATION_TYPE {
        trace!("Ignoring report entry of type '{}'", entry.kind);
        return None;
    }
    let body: ReportingApiBody = match serde_json::from_value(entry.body) {
        Ok(b) => b,
        Err(e) => {
            debug!("Skipping malformed csp-violation body: {}", e);
            return None;
        }
    };
    build(body.source_file, body.line_number, body.column_number, body.sample)
}

fn build(
    source_file: Option<String>,
    line: Option<u64>,
    column: Option<u64>,
    sample: Option<String>,
) -> Option<ReportedViolation> {
    let url = source_file.filter(|s| !s.is_empty())?;
    let line = u32::try_from(line?).ok().filter(|l| *l >= 1)?;
    let column = u32::try_from(column?).ok().filter(|c| *c >= 1)?;
    Some(ReportedViolation {
        location: RuntimeLocation::new(url, line, column),
        sample: sample.unwrap_or_default(),
    })
}
