//! Reassembly of JSON replies arriving on the control characteristic.

use log::warn;

use crate::protocol::decode_response;
use crate::types::ControlResponse;

/// Incrementally assembles control-channel fragments into complete JSON.
///
/// The headset splits its JSON replies across several notifications, e.g.
/// `{"fw":"4.`, `1.2","rc":0`, `}`.  Fragments are buffered in order and the
/// whole object is returned the moment its top-level `}` closes.
///
/// ```
/// # use athena_rs::control::ControlAccumulator;
/// let mut acc = ControlAccumulator::new();
/// assert!(acc.push(r#"{"fw":"4."#).is_none());
/// assert_eq!(acc.push(r#"1"}"#).unwrap(), r#"{"fw":"4.1"}"#);
/// ```
///
/// Characters before the first `{` are discarded so trailing garbage from a
/// previous reply cannot corrupt the next one.
#[derive(Debug, Default)]
pub struct ControlAccumulator {
    buffer: String,
    /// Brace nesting depth; 0 outside any object.
    depth: usize,
}

impl ControlAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded fragment.  Returns the complete JSON text once the
    /// top-level object closes, then starts over.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        for ch in fragment.chars() {
            match ch {
                '{' => {
                    if self.depth == 0 {
                        self.buffer.clear();
                    }
                    self.depth += 1;
                    self.buffer.push(ch);
                }
                '}' if self.depth > 0 => {
                    self.buffer.push(ch);
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(std::mem::take(&mut self.buffer));
                    }
                }
                _ if self.depth > 0 => self.buffer.push(ch),
                _ => {}
            }
        }
        None
    }

    /// Feed one raw control notification and parse any completed reply.
    ///
    /// Non-object JSON and parse failures are logged and dropped.
    pub fn push_notification(&mut self, bytes: &[u8]) -> Option<ControlResponse> {
        let json = self.push(&decode_response(bytes))?;
        match serde_json::from_str::<serde_json::Value>(&json) {
            Ok(serde_json::Value::Object(fields)) => Some(ControlResponse { raw: json, fields }),
            Ok(_) => None,
            Err(e) => {
                warn!("Athena control JSON error: {e} | raw: {json}");
                None
            }
        }
    }
}
