use serde::Deserialize;
use std::fmt;

/// Only revision 3 source maps are understood
const SUPPORTED_VERSION: u32 = 3;

const VLQ_BASE_SHIFT: u32 = 5;
const VLQ_CONTINUATION_BIT: i64 = 1 << VLQ_BASE_SHIFT;
const VLQ_BASE_MASK: i64 = VLQ_CONTINUATION_BIT - 1;
// A u32-range value never needs more than 7 base64 digits
const VLQ_MAX_DIGITS: usize = 7;

#[derive(Debug)]
pub enum MapError {
    Json(serde_json::Error),
    UnsupportedVersion(u32),
    IndexMap,
    InvalidBase64(char),
    TruncatedVlq,
    InvalidSegment(usize),
    SourceOutOfRange(i64),
    NegativeValue,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Json(e) => write!(f, "Invalid source map JSON: {}", e),
            MapError::UnsupportedVersion(v) => write!(f, "Unsupported source map version {}", v),
            MapError::IndexMap => write!(f, "Indexed source maps (sections) are not supported"),
            MapError::InvalidBase64(c) => write!(f, "Invalid base64 digit '{}' in mappings", c),
            MapError::TruncatedVlq => write!(f, "Truncated VLQ value in mappings"),
            MapError::InvalidSegment(n) => write!(f, "Mapping segment with {} fields", n),
            MapError::SourceOutOfRange(i) => write!(f, "Source index {} out of range", i),
            MapError::NegativeValue => write!(f, "Mapping decodes to a negative position"),
        }
    }
}

impl std::error::Error for MapError {}

impl From<serde_json::Error> for MapError {
    fn from(e: serde_json::Error) -> Self {
        MapError::Json(e)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    mappings: String,
    #[serde(default)]
    sections: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    generated_column: u32,
    /// (source index, line, column), all 0-based
    original: Option<(u32, u32, u32)>,
}

/// Original position for a generated one, 0-based line and column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

/// Decoded source map: per generated line, segments ordered by generated column
#[derive(Debug)]
pub struct PositionMap {
    sources: Vec<Option<String>>,
    lines: Vec<Vec<Segment>>,
}

impl PositionMap {
    pub fn parse(json: &str) -> Result<Self, MapError> {
        let raw: RawSourceMap = serde_json::from_str(json)?;
        if raw.sections.is_some() {
            return Err(MapError::IndexMap);
        }
        if raw.version != SUPPORTED_VERSION {
            return Err(MapError::UnsupportedVersion(raw.version));
        }

        let root = raw.source_root.as_deref().filter(|r| !r.is_empty());
        let sources = raw
            .sources
            .into_iter()
            .map(|s| s.filter(|s| !s.is_empty()).map(|s| source_path(root, &s)))
            .collect::<Vec<_>>();

        let lines = decode_mappings(&raw.mappings, sources.len())?;
        Ok(Self { sources, lines })
    }

    /// Look up a 0-based generated position.
    ///
    /// Picks the closest segment at or before `column` on `line`. Segments
    /// without an original position, and unnamed sources, yield `None`.
    pub fn lookup(&self, line: u32, column: u32) -> Option<OriginalPosition> {
        let segments = self.lines.get(line as usize)?;
        let idx = segments.partition_point(|s| s.generated_column <= column);
        let segment = segments.get(idx.checked_sub(1)?)?;
        let (source, line, column) = segment.original?;
        let source = self.sources.get(source as usize)?.clone()?;
        Some(OriginalPosition {
            source,
            line,
            column,
        })
    }
}

/// Join a source entry onto `sourceRoot` and normalize the result.
///
/// Absolute entries (a URL, or a path starting with `/`) ignore the root.
fn source_path(root: Option<&str>, source: &str) -> String {
    let joined = match root {
        Some(_) if url_authority_end(source).is_some() || source.starts_with('/') => {
            source.to_string()
        }
        Some(root) if root.ends_with('/') => format!("{}{}", root, source),
        Some(root) => format!("{}/{}", root, source),
        None => source.to_string(),
    };
    normalize_source(&joined)
}

/// Byte offset where the path of `scheme://authority/path` begins
fn url_authority_end(url: &str) -> Option<usize> {
    let (scheme, rest) = url.split_once("://")?;
    let mut chars = scheme.chars();
    let valid_scheme = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid_scheme {
        return None;
    }
    let authority = rest.find('/').unwrap_or(rest.len());
    Some(scheme.len() + 3 + authority)
}

/// Drop `.` and empty segments and fold `dir/..`, keeping any URL prefix
fn normalize_source(source: &str) -> String {
    let split = url_authority_end(source).unwrap_or(0);
    let (prefix, path) = source.split_at(split);
    let absolute = path.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                // `..` above the root of an absolute path stays at the root
                _ if absolute => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("{}/{}", prefix, joined),
        (false, true) if prefix.is_empty() => ".".to_string(),
        (false, _) => format!("{}{}", prefix, joined),
    }
}

fn decode_mappings(mappings: &str, source_count: usize) -> Result<Vec<Vec<Segment>>, MapError> {
    let mut lines = Vec::new();
    // Everything except the generated column carries over between lines.
    // The optional fifth field (name index) is not needed for positions.
    let mut source: i64 = 0;
    let mut original_line: i64 = 0;
    let mut original_column: i64 = 0;

    for line in mappings.split(';') {
        let mut generated_column: i64 = 0;
        let mut segments = Vec::new();

        for encoded in line.split(',').filter(|s| !s.is_empty()) {
            let fields = decode_vlq_segment(encoded)?;
            generated_column += fields[0];
            let original = match fields.len() {
                1 => None,
                4 | 5 => {
                    source += fields[1];
                    original_line += fields[2];
                    original_column += fields[3];
                    if source < 0 || source as usize >= source_count {
                        return Err(MapError::SourceOutOfRange(source));
                    }
                    Some((
                        to_u32(source)?,
                        to_u32(original_line)?,
                        to_u32(original_column)?,
                    ))
                }
                n => return Err(MapError::InvalidSegment(n)),
            };
            segments.push(Segment {
                generated_column: to_u32(generated_column)?,
                original,
            });
        }

        segments.sort_by_key(|s| s.generated_column);
        lines.push(segments);
    }

    Ok(lines)
}

fn to_u32(value: i64) -> Result<u32, MapError> {
    u32::try_from(value).map_err(|_| MapError::NegativeValue)
}

fn decode_vlq_segment(encoded: &str) -> Result<Vec<i64>, MapError> {
    let mut values = Vec::with_capacity(5);
    let mut value: i64 = 0;
    let mut shift: u32 = 0;
    let mut digits = 0;

    for c in encoded.chars() {
        let digit = base64_value(c).ok_or(MapError::InvalidBase64(c))?;
        digits += 1;
        if digits > VLQ_MAX_DIGITS {
            return Err(MapError::TruncatedVlq);
        }
        value += (digit & VLQ_BASE_MASK) << shift;
        if digit & VLQ_CONTINUATION_BIT != 0 {
            shift += VLQ_BASE_SHIFT;
            continue;
        }
        // Lowest bit is the sign
        let magnitude = value >> 1;
        values.push(if value & 1 == 1 { -magnitude } else { magnitude });
        value = 0;
        shift = 0;
        digits = 0;
    }

    if digits != 0 {
        return Err(MapError::TruncatedVlq);
    }
    Ok(values)
}

fn base64_value(c: char) -> Option<i64> {
    let v = match c {
        'A'..='Z' => c as u32 - 'A' as u32,
        'a'..='z' => c as u32 - 'a' as u32 + 26,
        '0'..='9' => c as u32 - '0' as u32 + 52,
        '+' => 62,
        '/' => 63,
        _ => return None,
    };
    Some(v as i64)
}
