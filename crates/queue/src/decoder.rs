//! Turn delivery payloads into records.
//!
//! Structured payloads pass through untouched, whatever their value. Raw payloads are sanitized
//! (invalid UTF-8 replaced, NUL bytes and a leading BOM dropped) and parsed
//! as JSON. Failures are logged, counted and reported as
//! [`Decoded::Unusable`]; nothing escapes this module as an error.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use crate::broker::Payload;
use crate::metrics::{Metric, Metrics};

/// An immutable decoded message, shared between the buffer and the batch.
pub type Record = Arc<Value>;

/// Outcome of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Record(Record),
    /// Blank raw payload, or raw JSON `null`/`false`: nothing to drain, not
    /// an error.
    Empty,
    /// Malformed payload. Already logged and counted.
    Unusable,
}

impl Decoded {
    pub fn into_record(self) -> Option<Record> {
        match self {
            Decoded::Record(record) => Some(record),
            Decoded::Empty | Decoded::Unusable => None,
        }
    }
}

pub struct Decoder {
    metrics: Arc<dyn Metrics>,
}

impl Decoder {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self { metrics }
    }

    pub fn decode(&self, payload: &Payload) -> Decoded {
        match payload {
            Payload::Structured(value) => Decoded::Record(Arc::new(value.clone())),
            Payload::Raw(bytes) => {
                let text = sanitize(bytes);
                if text.trim().is_empty() {
                    return Decoded::Empty;
                }
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) => Self::classify(value),
                    Err(e) => {
                        error!(
                            error = %e,
                            payload = %String::from_utf8_lossy(bytes),
                            stage = "queue:decode",
                            "payload could not be decoded"
                        );
                        self.metrics.mark(Metric::DecodeError);
                        Decoded::Unusable
                    }
                }
            }
        }
    }

    fn classify(value: Value) -> Decoded {
        match value {
            Value::Null | Value::Bool(false) => Decoded::Empty,
            value => Decoded::Record(Arc::new(value)),
        }
    }
}

/// Repair invalid UTF-8 and drop characters JSON parsers choke on.
fn sanitize(bytes: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.strip_prefix('\u{feff}').unwrap_or(&text);
    if trimmed.len() == text.len() && !trimmed.contains('\0') {
        return text;
    }
    Cow::Owned(trimmed.replace('\0', ""))
}
