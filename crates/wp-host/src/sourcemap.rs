//! Source-map decoding and stack remapping.
//!
//! The bundler emits version-3 source maps beside its artifacts. Error
//! stacks coming out of the page point into the bundled output; remapping
//! walks each `url:line:column` frame back to the original source so
//! host-side reports name the file the user actually wrote.

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Deserialize)]
struct RawMap {
    version: u32,
    sources: Vec<String>,
    #[serde(default)]
    #[serde(rename = "sourceRoot")]
    source_root: Option<String>,
    mappings: String,
}

/// One decoded mapping segment within a generated line.
#[derive(Debug, Clone, Copy)]
struct Segment {
    generated_column: u32,
    source: usize,
    line: u32,
    column: u32,
}

/// An original-source position, 1-based line, 0-based column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

/// A parsed version-3 source map.
pub struct SourceMap {
    sources: Vec<String>,
    lines: Vec<Vec<Segment>>,
}

impl SourceMap {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: RawMap = serde_json::from_slice(bytes)?;
        if raw.version != 3 {
            return Err(Error::SourceMap(format!(
                "unsupported version {}",
                raw.version
            )));
        }
        let sources = match &raw.source_root {
            Some(root) if !root.is_empty() => raw
                .sources
                .iter()
                .map(|source| format!("{}/{}", root.trim_end_matches('/'), source))
                .collect(),
            _ => raw.sources.clone(),
        };

        let mut lines = Vec::new();
        let mut source = 0i64;
        let mut line = 0i64;
        let mut column = 0i64;
        for group in raw.mappings.split(';') {
            let mut segments = Vec::new();
            let mut generated_column = 0i64;
            for segment in group.split(',').filter(|s| !s.is_empty()) {
                let fields = decode_vlq(segment)?;
                if fields.is_empty() {
                    continue;
                }
                generated_column += fields[0];
                if fields.len() >= 4 {
                    source += fields[1];
                    line += fields[2];
                    column += fields[3];
                    if generated_column < 0 || source < 0 || line < 0 || column < 0 {
                        return Err(Error::SourceMap("negative mapping field".into()));
                    }
                    segments.push(Segment {
                        generated_column: generated_column as u32,
                        source: source as usize,
                        line: line as u32,
                        column: column as u32,
                    });
                }
            }
            lines.push(segments);
        }

        Ok(Self { sources, lines })
    }

    /// Maps a generated position (1-based line, 0-based column) to its
    /// original source.
    pub fn lookup(&self, line: u32, column: u32) -> Option<Position> {
        let segments = self.lines.get(line.checked_sub(1)? as usize)?;
        let segment = segments
            .iter()
            .rev()
            .find(|segment| segment.generated_column <= column)?;
        let source = self.sources.get(segment.source)?.clone();
        Some(Position {
            source,
            line: segment.line + 1,
            column: segment.column,
        })
    }
}

const VLQ_CONTINUATION: i64 = 32;

fn decode_vlq(input: &str) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    let mut value = 0i64;
    let mut shift = 0u32;
    for c in input.chars() {
        let digit = base64_value(c)
            .ok_or_else(|| Error::SourceMap(format!("invalid VLQ character {c:?}")))? as i64;
        value += (digit & (VLQ_CONTINUATION - 1)) << shift;
        if digit & VLQ_CONTINUATION != 0 {
            shift += 5;
            continue;
        }
        let negative = value & 1 != 0;
        let magnitude = value >> 1;
        out.push(if negative { -magnitude } else { magnitude });
        value = 0;
        shift = 0;
    }
    if shift != 0 {
        return Err(Error::SourceMap("truncated VLQ sequence".into()));
    }
    Ok(out)
}

fn base64_value(c: char) -> Option<u8> {
    match c {
        'A'..='Z' => Some(c as u8 - b'A'),
        'a'..='z' => Some(c as u8 - b'a' + 26),
        '0'..='9' => Some(c as u8 - b'0' + 52),
        '+' => Some(62),
        '/' => Some(63),
        _ => None,
    }
}

/// Rewrites `url:line:column` frames in a stack trace through the maps the
/// resolver provides (keyed by the artifact's URL path).
pub fn remap_stack(stack: &str, resolve: impl Fn(&str) -> Option<SourceMap>) -> String {
    let frame =
        regex_lite::Regex::new(r"(https?://[^\s):]+):(\d+):(\d+)").expect("static frame regex");
    frame
        .replace_all(stack, |caps: &regex_lite::Captures| {
            let url = &caps[1];
            let line: u32 = caps[2].parse().unwrap_or(0);
            let column: u32 = caps[3].parse().unwrap_or(0);
            let path = url::Url::parse(url)
                .map(|parsed| parsed.path().to_owned())
                .unwrap_or_default();
            match resolve(&path).and_then(|map| map.lookup(line, column)) {
                Some(position) => {
                    format!("{}:{}:{}", position.source, position.line, position.column)
                }
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}
