use crate::types::SourceLocation;
use crate::violation::ViolationRecord;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};

/// tsec diagnostic code for Trusted Types violations
pub const DEFAULT_DIAGNOSTIC_CODE: &str = "TS21228";

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x1b\x{9b}][\[()#;?]*(?:[0-9]{1,4}(?:;[0-9]{0,4})*)?[0-9A-ORZcf-nqry=><]")
        .expect("valid ANSI escape regex")
});

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

/// Locations of every analyzer diagnostic carrying `diagnostic_code`.
///
/// Only the leading `path:line:column` field of each line is used; lines
/// that do not start with one are skipped.
pub fn parse_analyzer_output(output: &str, diagnostic_code: &str) -> Vec<SourceLocation> {
    output
        .lines()
        .filter(|line| line.contains(diagnostic_code))
        .filter_map(|line| {
            let clean = strip_ansi(line);
            let parsed = parse_location_field(&clean);
            if parsed.is_none() {
                debug!("Skipping analyzer line without a location: {}", clean);
            }
            parsed
        })
        .collect()
}

fn parse_location_field(line: &str) -> Option<SourceLocation> {
    let field = line.split_whitespace().next()?.trim_end_matches(':');
    let mut parts = field.rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    let path = parts.next().filter(|p| !p.is_empty())?;
    Some(SourceLocation::new(path, line, column))
}

/// Known violations that no analyzer diagnostic points at exactly
pub fn find_missed(
    analyzer_output: &[u8],
    known: &[ViolationRecord],
    diagnostic_code: &str,
) -> Vec<ViolationRecord> {
    let output = String::from_utf8_lossy(analyzer_output);
    let reported = parse_analyzer_output(&output, diagnostic_code);
    info!(
        "Analyzer reported {} {} diagnostics",
        reported.len(),
        diagnostic_code
    );

    known
        .iter()
        .filter(|record| reported.iter().all(|loc| !record.location_equals(loc)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuntimeLocation;

    fn resolved(path: &str, line: u32, column: u32) -> ViolationRecord {
        let mut r = ViolationRecord::new(RuntimeLocation::new("http://h/app.js", 1, 1));
        r.attach_resolved(SourceLocation::new(path, line, column));
        r.add_occurrence("sample");
        r
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(
            strip_ansi("\x1b[96msrc/a.ts\x1b[0m:\x1b[93m10\x1b[0m:\x1b[93m5\x1b[0m"),
            "src/a.ts:10:5"
        );
    }

    #[test]
    fn test_parse_analyzer_output_filters_by_code() {
        let output = "\
src/a.ts:10:5 - error TS21228: Assigning directly to Element#innerHTML can result in XSS.
src/b.ts:3:1 - error TS2322: Type 'string' is not assignable.
\x1b[96msrc/c.ts\x1b[0m:\x1b[93m7\x1b[0m:\x1b[93m2\x1b[0m - \x1b[91merror\x1b[0m TS21228: eval
Found 2 errors mentioning TS21228.
";
        let locations = parse_analyzer_output(output, DEFAULT_DIAGNOSTIC_CODE);
        assert_eq!(
            locations,
            vec![SourceLocation::new("src/a.ts", 10, 5), SourceLocation::new("src/c.ts", 7, 2)]
        );
    }

    #[test]
    fn test_parse_location_field_variants() {
        assert_eq!(
            parse_location_field("a.ts:10:5: error"),
            Some(SourceLocation::new("a.ts", 10, 5))
        );
        assert_eq!(
            parse_location_field("  C:/proj/a.ts:1:2 x"),
            Some(SourceLocation::new("C:/proj/a.ts", 1, 2))
        );
        assert_eq!(parse_location_field("a.ts:x:5"), None);
        assert_eq!(parse_location_field(":1:2"), None);
        assert_eq!(parse_location_field(""), None);
    }

    #[test]
    fn test_exact_match_is_not_missed() {
        let known = vec![resolved("a.ts", 10, 5)];
        let missed = find_missed(
            b"a.ts:10:5: error TS21228 innerHTML",
            &known,
            DEFAULT_DIAGNOSTIC_CODE,
        );
        assert!(missed.is_empty());
    }

    #[test]
    fn test_off_by_one_is_missed() {
        let known = vec![resolved("a.ts", 10, 5)];
        for output in [
            "a.ts:11:5: error TS21228",
            "a.ts:9:5: error TS21228",
            "a.ts:10:6: error TS21228",
            "a.ts:10:4: error TS21228",
        ] {
            let missed = find_missed(output.as_bytes(), &known, DEFAULT_DIAGNOSTIC_CODE);
            assert_eq!(missed, known, "{}", output);
        }
    }

    #[test]
    fn test_only_unmatched_records_are_returned() {
        let known = vec![resolved("a.ts", 1, 1), resolved("b.ts", 2, 2), resolved("c.ts", 3, 3)];
        let output = "b.ts:2:2 - error TS21228: x\na.ts:1:1 - error TS9999: other code\n";
        let missed = find_missed(output.as_bytes(), &known, DEFAULT_DIAGNOSTIC_CODE);
        let keys: Vec<_> = missed.iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec!["a.ts:1:1", "c.ts:3:3"]);
    }
}
