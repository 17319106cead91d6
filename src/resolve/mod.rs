pub mod mapping;

use crate::types::{RuntimeLocation, SourceLocation};
use futures::future::join_all;
use mapping::PositionMap;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, error, trace};

/// Suffix of a source map sitting next to its build artifact
const SIBLING_MAP_SUFFIX: &str = ".map";
/// How many trailing lines of an artifact are searched for a map directive
const MAP_DIRECTIVE_SCAN_LINES: usize = 5;

static MAP_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*//[#@]\s*sourceMappingURL\s*=\s*(\S+)\s*$").expect("valid directive regex")
});

/// Outcome of resolving one runtime location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(SourceLocation),
    /// No source map exists for the artifact (not instrumented)
    NoMap,
    /// The map exists but has no original position for this location
    Unmapped,
    /// Reading or decoding the map failed
    Failed,
}

impl Resolution {
    pub fn into_source(self) -> Option<SourceLocation> {
        match self {
            Resolution::Resolved(source) => Some(source),
            _ => None,
        }
    }
}

/// Maps served script locations back to original sources through source maps
#[derive(Debug, Clone)]
pub struct LocationResolver {
    project_root: PathBuf,
    /// Directory under the project root the static files are served from
    static_dir: Option<PathBuf>,
    /// URL prefix under which static files are served
    static_prefix: Option<String>,
}

impl LocationResolver {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            static_dir: None,
            static_prefix: None,
        }
    }

    pub fn static_dir(mut self, dir: Option<impl Into<PathBuf>>) -> Self {
        self.static_dir = dir.map(Into::into);
        self
    }

    pub fn static_prefix(mut self, prefix: Option<impl Into<String>>) -> Self {
        self.static_prefix = prefix.map(Into::into);
        self
    }

    /// Translate a served URL to the build artifact on disk.
    ///
    /// Without a configured prefix, scheme and authority are stripped. Query
    /// and fragment are dropped. Paths escaping the project root are refused.
    pub fn artifact_path(&self, url: &str) -> Option<PathBuf> {
        let rest = match &self.static_prefix {
            Some(prefix) if url.starts_with(prefix.as_str()) => &url[prefix.len()..],
            _ => match url.split_once("://") {
                Some((_, after_scheme)) => after_scheme.split_once('/')?.1,
                None => url,
            },
        };
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return None;
        }

        let relative = Path::new(rest);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            debug!("Refusing artifact path outside project root: {}", url);
            return None;
        }

        let mut path = self.project_root.clone();
        if let Some(dir) = &self.static_dir {
            path.push(dir);
        }
        path.push(relative);
        Some(path)
    }

    /// Find the source map for an artifact: sibling `.map` first, then the
    /// trailing `sourceMappingURL` directive relative to the artifact.
    async fn find_map(&self, artifact: &Path) -> Option<PathBuf> {
        let mut sibling = artifact.as_os_str().to_owned();
        sibling.push(SIBLING_MAP_SUFFIX);
        let sibling = PathBuf::from(sibling);
        if tokio::fs::try_exists(&sibling).await.unwrap_or(false) {
            trace!("Using sibling map {}", sibling.display());
            return Some(sibling);
        }

        let content = tokio::fs::read_to_string(artifact).await.ok()?;
        let reference = map_directive(&content)?;
        if reference.starts_with("data:") {
            debug!("Inline source map in {} is not supported", artifact.display());
            return None;
        }
        let reference = reference.split(['?', '#']).next().unwrap_or_default();
        let candidate = artifact.parent()?.join(reference);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            trace!("Using referenced map {}", candidate.display());
            Some(candidate)
        } else {
            debug!(
                "Map {} referenced by {} does not exist",
                candidate.display(),
                artifact.display()
            );
            None
        }
    }

    /// Locate the source map of the script served at `url`
    pub async fn locate_map(&self, url: &str) -> Option<PathBuf> {
        let Some(artifact) = self.artifact_path(url) else {
            debug!("No local artifact for {}", url);
            return None;
        };
        let map = self.find_map(&artifact).await;
        if map.is_none() {
            debug!("No source map for {}", artifact.display());
        }
        map
    }

    /// Resolve a runtime location to its original source location.
    ///
    /// Never fails: missing maps yield `NoMap`, broken ones are logged and
    /// yield `Failed`.
    pub async fn resolve(&self, location: &RuntimeLocation) -> Resolution {
        match self.locate_map(&location.url).await {
            Some(path) => LoadedMap::load(&path).await.resolve(location),
            None => Resolution::NoMap,
        }
    }

    /// Resolve many locations, reading and decoding each distinct map once.
    ///
    /// Results are returned in the order of `locations`.
    pub async fn resolve_many(&self, locations: &[&RuntimeLocation]) -> Vec<Resolution> {
        let mut urls: Vec<&str> = locations.iter().map(|l| l.url.as_str()).collect();
        urls.sort_unstable();
        urls.dedup();
        let found = join_all(urls.iter().map(|url| self.locate_map(url))).await;
        let map_by_url: HashMap<&str, Option<PathBuf>> = urls.into_iter().zip(found).collect();

        let mut paths: Vec<&PathBuf> = map_by_url.values().flatten().collect();
        paths.sort_unstable();
        paths.dedup();
        let loaded = join_all(paths.iter().map(|path| LoadedMap::load(path))).await;
        debug!("Loaded {} distinct source maps", loaded.len());
        let maps: HashMap<&PathBuf, LoadedMap> = paths.into_iter().zip(loaded).collect();

        locations
            .iter()
            .map(|location| {
                match map_by_url.get(location.url.as_str()).and_then(Option::as_ref) {
                    Some(path) => maps
                        .get(path)
                        .map_or(Resolution::Failed, |map| map.resolve(location)),
                    None => Resolution::NoMap,
                }
            })
            .collect()
    }
}

/// A source map read from disk, or the reason it is unusable
#[derive(Debug)]
enum LoadedMap {
    Ready { path: PathBuf, map: PositionMap },
    Broken,
}

impl LoadedMap {
    async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to read source map {}: {}", path.display(), e);
                return LoadedMap::Broken;
            }
        };
        match PositionMap::parse(&raw) {
            Ok(map) => LoadedMap::Ready {
                path: path.to_path_buf(),
                map,
            },
            Err(e) => {
                error!("Failed to parse source map {}: {}", path.display(), e);
                LoadedMap::Broken
            }
        }
    }

    fn resolve(&self, location: &RuntimeLocation) -> Resolution {
        let LoadedMap::Ready { path, map } = self else {
            return Resolution::Failed;
        };
        // Maps are 0-based, report positions are 1-based
        match map.lookup(
            location.line.saturating_sub(1),
            location.column.saturating_sub(1),
        ) {
            Some(original) => Resolution::Resolved(SourceLocation::new(
                original.source,
                original.line + 1,
                original.column + 1,
            )),
            None => {
                debug!("No original position for {} in {}", location, path.display());
                Resolution::Unmapped
            }
        }
    }
}

/// Map reference from a `//# sourceMappingURL=` line near the end of a file
fn map_directive(content: &str) -> Option<&str> {
    content
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(MAP_DIRECTIVE_SCAN_LINES)
        .find_map(|line| MAP_DIRECTIVE.captures(line)?.get(1))
        .map(|m| m.as_str())
}
