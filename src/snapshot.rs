//! Snapshot capture and wire codec.
//!
//! A [`Snapshot`] is one point-in-time capture of a monitored instance's
//! field set. Types opt into monitoring by implementing [`Sampled`], which
//! returns the current fields as an ordered list of `(name, value)` pairs.
//!
//! The codec produces a flat, human-readable text line:
//!
//! ```text
//! Counter 140234181180032 count=0,label=idle
//! ```
//!
//! Field separators appearing inside names or values are backslash-escaped,
//! so a value containing `,` or `=` cannot corrupt the stream. Encoding is
//! deterministic: the same snapshot always yields the same bytes. A decode
//! path is provided for the collector side and for tests.

use thiserror::Error;

/// Capability every monitorable type must expose: its current field set as
/// an ordered sequence of `(name, textual value)` pairs.
///
/// The registry reads fields through a shared reference while the owning
/// application may still be mutating the instance, so implementors use
/// interior mutability (atomics, locks) for fields that change after
/// enrollment.
pub trait Sampled: Send + Sync + 'static {
    /// Current field set. Order is chosen by the implementor and preserved
    /// through encoding.
    fn fields(&self) -> Vec<(String, String)>;
}

/// Errors produced when decoding a snapshot line.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload is not valid UTF-8.
    #[error("snapshot payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Line structure does not match `class id fields`.
    #[error("malformed snapshot line: {0}")]
    Malformed(String),

    /// Instance id is not a number.
    #[error("invalid instance id: {0}")]
    InvalidId(String),
}

/// One point-in-time capture of an instance's field set.
///
/// Produced fresh on every sampling tick and consumed immediately by
/// encode + send; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Label of the monitored class.
    pub class: String,
    /// Opaque identifier, stable for the instance's lifetime.
    pub instance_id: u64,
    /// Ordered `(name, value)` pairs.
    pub fields: Vec<(String, String)>,
}

impl Snapshot {
    /// Capture the current field set of `instance`.
    pub fn capture(class: &str, instance_id: u64, instance: &dyn Sampled) -> Self {
        Self {
            class: class.to_owned(),
            instance_id,
            fields: instance.fields(),
        }
    }

    /// Encode as a flat text line. Deterministic for a given snapshot value.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = String::new();
        escape_into(&self.class, &mut line);
        line.push(' ');
        line.push_str(&self.instance_id.to_string());
        line.push(' ');
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            escape_into(name, &mut line);
            line.push('=');
            escape_into(value, &mut line);
        }
        line.into_bytes()
    }

    /// Decode a line produced by [`Snapshot::encode`].
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let line = std::str::from_utf8(payload)?;
        let mut tokens = split_unescaped(line, ' ').into_iter();

        let class = match tokens.next() {
            Some(c) if !c.is_empty() => unescape(&c),
            _ => return Err(CodecError::Malformed("missing class label".into())),
        };
        let id_token = tokens
            .next()
            .ok_or_else(|| CodecError::Malformed("missing instance id".into()))?;
        let instance_id = id_token
            .parse::<u64>()
            .map_err(|_| CodecError::InvalidId(id_token.clone()))?;
        let field_part = tokens.next().unwrap_or_default();
        if tokens.next().is_some() {
            return Err(CodecError::Malformed("trailing tokens".into()));
        }

        let mut fields = Vec::new();
        if !field_part.is_empty() {
            for pair in split_unescaped(&field_part, ',') {
                let mut kv = split_unescaped(&pair, '=').into_iter();
                match (kv.next(), kv.next(), kv.next()) {
                    (Some(name), Some(value), None) => {
                        fields.push((unescape(&name), unescape(&value)));
                    }
                    _ => {
                        return Err(CodecError::Malformed(format!(
                            "field pair is not name=value: {pair}"
                        )));
                    }
                }
            }
        }

        Ok(Self {
            class,
            instance_id,
            fields,
        })
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "class {} instance {}:", self.class, self.instance_id)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

/// Characters that delimit the line structure and therefore need escaping.
const RESERVED: [char; 4] = [' ', '=', ',', '\n'];

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        if c == '\\' || RESERVED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on `sep`, treating backslash-escaped occurrences as literal.
/// Returned tokens keep their escape sequences.
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            tokens.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    tokens.push(current);
    tokens
}
