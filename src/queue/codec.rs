//! Buffer key encoding for dimension tuples.
//!
//! A key is the version tag followed by every tuple field, joined by
//! [`SEPARATOR`]. Absent fields are written as [`ABSENT`]. Separator,
//! sentinel and escape characters inside field values are escaped, so
//! encoding is injective for a fixed arity.

use thiserror::Error;

use super::dimension::{normalize_fields, DimensionRecord, EventKind};

/// Field separator.
pub const SEPARATOR: char = '|';

/// Placeholder for a null or empty field.
pub const ABSENT: char = '~';

/// Escape prefix for reserved characters inside field values.
pub const ESCAPE: char = '\\';

/// Encoding version, always the first segment of a key.
pub const KEY_VERSION: &str = "v1";

/// Irregularities found while decoding a key. None of them fail a flush.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeAnomaly {
    #[error("key has no {KEY_VERSION} tag, decoded positionally")]
    Unversioned,

    #[error("key has {found} fields, expected {expected}; missing fields set to null")]
    Short { expected: usize, found: usize },

    #[error("key has {found} fields, expected {expected}; extra fields ignored")]
    Long { expected: usize, found: usize },
}

/// Result of decoding one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub record: DimensionRecord,
    pub anomalies: Vec<DecodeAnomaly>,
}

/// Encodes a tuple into its buffer key, normalizing it first.
pub fn encode(record: &DimensionRecord) -> String {
    encode_fields(record.kind(), &record.fields())
}

/// Encodes raw wire-order fields for the given kind.
pub fn encode_fields(kind: EventKind, fields: &[Option<&str>]) -> String {
    let normalized = normalize_fields(kind, fields);
    let mut key = String::with_capacity(
        KEY_VERSION.len()
            + normalized
                .iter()
                .map(|f| f.as_ref().map_or(1, String::len) + 1)
                .sum::<usize>(),
    );
    key.push_str(KEY_VERSION);

    for field in &normalized {
        key.push(SEPARATOR);
        match field {
            None => key.push(ABSENT),
            Some(value) => {
                for ch in value.chars() {
                    if ch == SEPARATOR || ch == ABSENT || ch == ESCAPE {
                        key.push(ESCAPE);
                    }
                    key.push(ch);
                }
            }
        }
    }

    key
}

/// Decodes a buffer key into a tuple of the given kind.
///
/// Never fails: sentinel and empty segments become null, short keys are
/// padded with null, and extra segments are dropped.
pub fn decode(kind: EventKind, key: &str) -> Decoded {
    let mut segments = split(key);
    let mut anomalies = Vec::new();

    let tagged = matches!(segments.first(), Some(Segment { text, escaped: false }) if text == KEY_VERSION);
    if tagged {
        segments.remove(0);
    } else {
        anomalies.push(DecodeAnomaly::Unversioned);
    }

    let expected = kind.arity();
    let found = segments.len();
    if found < expected {
        anomalies.push(DecodeAnomaly::Short { expected, found });
    } else if found > expected {
        anomalies.push(DecodeAnomaly::Long { expected, found });
    }

    let fields = segments
        .into_iter()
        .take(expected)
        .map(Segment::into_field)
        .collect::<Vec<_>>();

    Decoded {
        record: DimensionRecord::from_fields(kind, fields),
        anomalies,
    }
}

/// One raw segment of a key.
#[derive(Debug)]
struct Segment {
    text: String,
    /// Whether any character in this segment was escaped.
    escaped: bool,
}

impl Segment {
    fn into_field(self) -> Option<String> {
        if self.text.is_empty() {
            return None;
        }
        if !self.escaped && self.text.len() == ABSENT.len_utf8() && self.text.starts_with(ABSENT) {
            return None;
        }
        Some(self.text)
    }
}

fn split(key: &str) -> Vec<Segment> {
    let mut segments = Vec::with_capacity(PAGE_SEGMENT_HINT);
    let mut current = Segment {
        text: String::new(),
        escaped: false,
    };
    let mut chars = key.chars();

    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => match chars.next() {
                Some(next) => {
                    current.text.push(next);
                    current.escaped = true;
                }
                // Dangling escape at end of input, keep it literally.
                None => current.text.push(ESCAPE),
            },
            SEPARATOR => {
                segments.push(std::mem::replace(
                    &mut current,
                    Segment {
                        text: String::new(),
                        escaped: false,
                    },
                ));
            }
            _ => current.text.push(ch),
        }
    }
    segments.push(current);

    segments
}

const PAGE_SEGMENT_HINT: usize = 10;
