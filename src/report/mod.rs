pub mod render;

use crate::resolve::{LocationResolver, Resolution};
use crate::violation::{Collector, ViolationRecord};
use anyhow::{Context, bail};
use tracing::{debug, info};

/// Sort records by key and resolve them all, each source map loaded once.
///
/// Results are attached in the pre-computed order, so the outcome does not
/// depend on arrival order or on which resolution finishes first.
pub async fn resolve_all(
    records: &[ViolationRecord],
    resolver: &LocationResolver,
) -> Vec<ViolationRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by_cached_key(|r| r.key());

    debug!("Resolving {} locations", sorted.len());
    let locations: Vec<_> = sorted.iter().map(|r| &r.runtime).collect();
    let resolutions = resolver.resolve_many(&locations).await;

    let (mut resolved, mut no_map, mut unmapped, mut failed) = (0, 0, 0, 0);
    for (record, resolution) in sorted.iter_mut().zip(resolutions) {
        match resolution {
            Resolution::Resolved(source) => {
                resolved += 1;
                record.attach_resolved(source);
            }
            Resolution::NoMap => no_map += 1,
            Resolution::Unmapped => unmapped += 1,
            Resolution::Failed => failed += 1,
        }
    }
    info!(
        "Resolution complete: {} resolved, {} without map, {} unmapped, {} failed",
        resolved, no_map, unmapped, failed
    );

    sorted
}

/// Resolve every collected record and render the report lines
pub async fn resolve_and_render(
    collector: &Collector,
    resolver: &LocationResolver,
) -> (Vec<ViolationRecord>, Vec<String>) {
    let records = resolve_all(collector.records(), resolver).await;
    let lines = render::format_report(&records);
    (records, lines)
}

/// Print report lines to stderr, or write them to a `.md` / `.json` file
pub fn emit(
    lines: &[String],
    records: &[ViolationRecord],
    output: Option<&str>,
) -> anyhow::Result<()> {
    let Some(path) = output else {
        for line in lines {
            eprintln!("{}", line);
        }
        return Ok(());
    };

    let content = if path.ends_with(".json") {
        render::format_json(records)?
    } else if path.ends_with(".md") {
        lines.join("\n")
    } else {
        bail!("Output file must end with .md or .json");
    };

    std::fs::write(path, content).with_context(|| format!("Failed to write output file {}", path))?;
    info!("Results written to {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceLocation;
    use std::fs;
    use tempfile::TempDir;

    fn legacy(url: &str, line: u32, column: u32, sample: &str) -> String {
        serde_json::json!({
            "csp-report": {
                "source-file": url,
                "line-number": line,
                "column-number": column,
                "script-sample": sample,
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_end_to_end_three_payloads() {
        let dir = TempDir::new().unwrap();
        let resolver = LocationResolver::new(dir.path());
        let mut collector = Collector::new();
        collector.ingest(&legacy("app.js", 12, 3, "first"));
        collector.ingest(&legacy("app.js", 12, 3, "second"));
        collector.ingest(&legacy("app.js", 40, 1, "third"));

        assert_eq!(collector.len(), 2);
        let record = collector
            .records()
            .iter()
            .find(|r| r.key() == "app.js:12:3")
            .unwrap();
        assert_eq!(record.count(), 2);

        let (_, lines) = resolve_and_render(&collector, &resolver).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Found 3 violations.");
        assert!(lines[1].starts_with("1. source: app.js:12:3,"));
        assert!(lines[2].starts_with("2. source: app.js:40:1,"));
    }

    #[tokio::test]
    async fn test_render_is_independent_of_arrival_order() {
        let dir = TempDir::new().unwrap();
        let resolver = LocationResolver::new(dir.path());
        // Repeated locations repeat their sample, so both orders yield the same evidence
        let payloads = [
            legacy("http://h/b.js", 3, 1, "x"),
            legacy("http://h/a.js", 9, 9, "y"),
            legacy("http://h/a.js", 10, 1, "z"),
            legacy("http://h/b.js", 3, 1, "x"),
        ];

        let mut forward = Collector::new();
        payloads.iter().for_each(|p| forward.ingest(p));
        let mut backward = Collector::new();
        payloads.iter().rev().for_each(|p| backward.ingest(p));
        assert_ne!(forward.records(), backward.records());

        let (_, a) = resolve_and_render(&forward, &resolver).await;
        let (records, b) = resolve_and_render(&backward, &resolver).await;
        assert_eq!(a.join("\n"), b.join("\n"));

        let keys: Vec<_> = records.iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec!["http://h/a.js:10:1", "http://h/a.js:9:9", "http://h/b.js:3:1"]);
    }

    #[tokio::test]
    async fn test_resolve_all_attaches_sources_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.js"), "x\n").unwrap();
        fs::write(
            dir.path().join("app.js.map"),
            r#"{"version":3,"sources":["src/app.ts"],"mappings":"AAAA,EACE"}"#,
        )
        .unwrap();
        let resolver = LocationResolver::new(dir.path());
        let mut collector = Collector::new();
        collector.ingest(&legacy("http://h/app.js", 1, 3, "late"));
        collector.ingest(&legacy("http://h/app.js", 1, 1, "early"));
        collector.ingest(&legacy("http://h/other.js", 1, 1, "nomap"));

        let records = resolve_all(collector.records(), &resolver).await;
        assert_eq!(records[0].resolved, Some(SourceLocation::new("src/app.ts", 1, 1)));
        assert_eq!(records[0].samples, vec!["early"]);
        assert_eq!(records[1].resolved, Some(SourceLocation::new("src/app.ts", 2, 3)));
        assert_eq!(records[2].resolved, None);
    }

    #[test]
    fn test_emit_rejects_unknown_extension() {
        let err = emit(&[], &[], Some("report.txt")).unwrap_err();
        assert!(err.to_string().contains(".md or .json"));
    }

    #[test]
    fn test_emit_writes_markdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.md");
        let lines = vec!["Found 0 violations.".to_string()];
        emit(&lines, &[], path.to_str()).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "Found 0 violations.");
    }
}
