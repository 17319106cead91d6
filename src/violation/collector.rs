use super::payload::{self, ReportedViolation};
use super::record::ViolationRecord;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use tracing::{debug, error, trace, warn};

/// Deduplicates raw violation reports into one record per runtime location
#[derive(Debug, Default)]
pub struct Collector {
    /// Runtime key -> position in `records`
    index: HashMap<String, usize>,
    /// Records in first-sighting order
    records: Vec<ViolationRecord>,
    exclude: Option<GlobSet>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector that drops reports whose source URL matches any of the patterns
    pub fn with_exclusions(patterns: &[String]) -> Self {
        Self {
            exclude: build_globset(patterns),
            ..Self::new()
        }
    }

    /// Ingest one raw report payload.
    ///
    /// Malformed payloads are skipped without surfacing an error. A payload may
    /// carry several occurrences (Reporting API batches); each one is counted.
    pub fn ingest(&mut self, raw: &str) {
        for violation in payload::parse_payload(raw) {
            self.record_occurrence(violation);
        }
    }

    fn record_occurrence(&mut self, violation: ReportedViolation) {
        let ReportedViolation { location, sample } = violation;
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&location.url) {
                trace!("Excluded report from {}", location.url);
                return;
            }
        }

        let key = ViolationRecord::key_for(&location.url, location.line, location.column);
        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None => {
                debug!("New violation location: {}", key);
                self.records.push(ViolationRecord::new(location));
                let idx = self.records.len() - 1;
                self.index.insert(key, idx);
                idx
            }
        };
        self.records[idx].add_occurrence(sample);
    }

    pub fn records(&self) -> &[ViolationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of raw occurrences across all records
    pub fn total_occurrences(&self) -> usize {
        self.records.iter().map(|r| r.count()).sum()
    }
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => builder.add(glob),
            Err(e) => {
                warn!("Invalid exclude pattern '{}': {}", pattern, e);
                continue;
            }
        };
    }
    match builder.build() {
        Ok(gs) => Some(gs),
        Err(e) => {
            error!("Failed to build exclude globset: {}", e);
            None
        }
    }
}
