use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub resolve: ResolveConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
}

/// When a report request is handed to the collector
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterceptStage {
    /// Ingest as soon as the report arrives and answer it locally
    #[default]
    Request,
    /// Forward the report to the application and ingest once it answered
    Response,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CaptureConfig {
    /// Address the capture proxy listens on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Application under test
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Path on the proxy that receives violation reports
    #[serde(default = "default_report_path")]
    pub report_path: String,
    /// report-uri placed in the injected header (defaults to the proxy's report path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_uri: Option<String>,
    #[serde(default)]
    pub stage: InterceptStage,
    /// End the scan after this many seconds (runs until interrupted otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Glob patterns of report source URLs to ignore
    #[serde(default = "default_exclude_sources")]
    pub exclude_sources: Vec<String>,
    /// Largest request or response body the proxy buffers; larger upstream
    /// responses are answered with 502
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: default_upstream(),
            report_path: default_report_path(),
            report_uri: None,
            stage: InterceptStage::default(),
            timeout_secs: None,
            exclude_sources: default_exclude_sources(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl CaptureConfig {
    /// report-uri advertised to the browser
    pub fn effective_report_uri(&self) -> String {
        self.report_uri
            .clone()
            .unwrap_or_else(|| format!("http://{}{}", self.listen, self.report_path))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ResolveConfig {
    /// Root of the project whose build is served
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Directory under the project root that holds the served files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
    /// URL prefix stripped from script URLs (defaults to scheme and host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_prefix: Option<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            static_dir: None,
            static_prefix: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ValidateConfig {
    /// Analyzer diagnostic code marking relevant lines
    #[serde(default = "default_diagnostic_code")]
    pub diagnostic_code: String,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            diagnostic_code: default_diagnostic_code(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8787".into()
}

fn default_upstream() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_report_path() -> String {
    "/__ttscan/report".into()
}

fn default_exclude_sources() -> Vec<String> {
    vec![
        "chrome-extension://*".into(),
        "moz-extension://*".into(),
    ]
}

fn default_max_body_bytes() -> usize {
    // 32 MiB
    32 * 1024 * 1024
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_diagnostic_code() -> String {
    crate::validate::DEFAULT_DIAGNOSTIC_CODE.into()
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            debug!("Config {} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let config = toml::from_str(&content).with_context(|| format!("Invalid config {}", path))?;
        Ok(config)
    }

    /// Load and apply `key.path=value` overrides
    pub fn load_with_overrides(path: &str, overrides: &[String]) -> anyhow::Result<Self> {
        let config = Self::load(path)?;
        if overrides.is_empty() {
            return Ok(config);
        }
        let mut value = toml::Value::try_from(&config)?;
        for item in overrides {
            apply_override(&mut value, item)?;
        }
        Ok(value.try_into()?)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Set a dotted key in a TOML tree. The value is parsed as TOML if possible
/// (numbers, booleans, arrays), otherwise taken as a string.
fn apply_override(root: &mut toml::Value, item: &str) -> anyhow::Result<()> {
    let Some((key, raw)) = item.split_once('=') else {
        bail!("Invalid override '{}', expected key.path=value", item);
    };
    let parsed = toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()));

    let mut parts = key.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        let Some(table) = current.as_table_mut() else {
            bail!("Cannot override '{}': '{}' is not a table", key, part);
        };
        if parts.peek().is_none() {
            table.insert(part.to_string(), parsed);
            return Ok(());
        }
        current = table
            .entry(part.to_string())
            .or_insert(toml::Value::Table(toml::Table::new()));
    }
    bail!("Invalid override '{}': empty key", item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load("/nonexistent/ttscan.toml").unwrap();
        assert_eq!(config.capture.listen, "127.0.0.1:8787");
        assert_eq!(config.capture.stage, InterceptStage::Request);
        assert_eq!(config.validate.diagnostic_code, "TS21228");
        assert_eq!(
            config.capture.effective_report_uri(),
            "http://127.0.0.1:8787/__ttscan/report"
        );
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttscan.toml");
        std::fs::write(
            &path,
            "[capture]\nstage = \"response\"\ntimeout_secs = 30\n\n[resolve]\nstatic_dir = \"dist\"\n",
        )
        .unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.capture.stage, InterceptStage::Response);
        assert_eq!(config.capture.timeout_secs, Some(30));
        assert_eq!(config.capture.upstream, "http://127.0.0.1:8080");
        assert_eq!(config.resolve.static_dir, Some(PathBuf::from("dist")));
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.capture.report_path, "/__ttscan/report");
        assert_eq!(parsed.capture.exclude_sources.len(), 2);
    }

    #[test]
    fn test_overrides() {
        let config = Config::load_with_overrides(
            "/nonexistent/ttscan.toml",
            &[
                "capture.timeout_secs=5".into(),
                "capture.upstream=http://localhost:3000".into(),
                "capture.stage=\"response\"".into(),
                "validate.diagnostic_code=TS9999".into(),
            ],
        )
        .unwrap();
        assert_eq!(config.capture.timeout_secs, Some(5));
        assert_eq!(config.capture.upstream, "http://localhost:3000");
        assert_eq!(config.capture.stage, InterceptStage::Response);
        assert_eq!(config.validate.diagnostic_code, "TS9999");
    }

    #[test]
    fn test_invalid_override() {
        assert!(
            Config::load_with_overrides("/nonexistent/ttscan.toml", &["nokey".into()]).is_err()
        );
    }
}
