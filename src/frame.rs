use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::types::Protocol;

/// Payloads are hex text: every captured byte occupies two characters.
pub const HEX_CHARS_PER_BYTE: usize = 2;

/// How to peel length-prefixed messages off a payload for one protocol.
///
/// The dissector reports `length_field` for each message, which counts the
/// bytes after a fixed header of `overhead` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingRule {
    pub protocol: Protocol,
    pub length_field: String,
    pub overhead: usize,
}

impl FramingRule {
    pub fn new(protocol: Protocol, length_field: impl Into<String>, overhead: usize) -> Self {
        FramingRule {
            protocol,
            length_field: length_field.into(),
            overhead,
        }
    }

    /// Fully qualified dissector field name, e.g. `mysql.packet_length`.
    pub fn dissector_field(&self) -> String {
        format!("{}.{}", self.protocol, self.length_field)
    }

    /// Size in hex characters of a message whose declared length is `declared_bytes`.
    pub fn frame_hex_len(&self, declared_bytes: usize) -> usize {
        declared_bytes
            .saturating_add(self.overhead)
            .saturating_mul(HEX_CHARS_PER_BYTE)
    }
}

impl fmt::Display for FramingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.length_field, self.overhead)
    }
}

/// Parses `PROTO:FIELD:OVERHEAD`, e.g. `mysql:packet_length:4`.
impl FromStr for FramingRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(proto), Some(field), Some(overhead)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("invalid framing rule '{s}': expected PROTO:FIELD:OVERHEAD"));
        };
        let protocol: Protocol = proto.parse()?;
        if !protocol.is_known() {
            return Err("cannot register a framing rule for 'unknown'".into());
        }
        if field.is_empty() {
            return Err(format!("invalid framing rule '{s}': empty length field"));
        }
        let overhead = overhead
            .parse()
            .map_err(|e| format!("invalid framing overhead '{overhead}': {e}"))?;
        Ok(FramingRule::new(protocol, field, overhead))
    }
}

/// Ordered protocol to framing-rule table.
///
/// Registration order is significant: it is the order in which the length
/// fields are requested from the dissector and therefore trail each row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingTable {
    rules: Vec<FramingRule>,
}

impl Default for FramingTable {
    fn default() -> Self {
        FramingTable {
            rules: vec![
                FramingRule::new(Protocol::Mysql, "packet_length", 4),
                FramingRule::new(Protocol::Pgsql, "length", 1),
                // AMQP as spoken by RabbitMQ
                FramingRule::new(Protocol::Amqp, "length", 8),
            ],
        }
    }
}

impl FramingTable {
    pub fn empty() -> Self {
        FramingTable { rules: Vec::new() }
    }

    /// Add a rule, replacing any existing rule for the same protocol in place.
    pub fn register(&mut self, rule: FramingRule) {
        match self.rules.iter_mut().find(|r| r.protocol == rule.protocol) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn get(&self, protocol: Protocol) -> Option<&FramingRule> {
        self.rules.iter().find(|r| r.protocol == protocol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FramingRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Split one hex payload into the messages it carries.
    ///
    /// `lengths` are the per-message lengths the dissector reported, in bytes.
    /// Without a rule for `protocol` or without lengths the whole payload is a
    /// single message. Splitting stops once the payload is consumed, and a
    /// message that would run past the end of the payload is dropped rather
    /// than returned truncated.
    pub fn split<'a>(
        &self,
        payload: &'a str,
        lengths: Option<&[usize]>,
        protocol: Protocol,
    ) -> Vec<&'a str> {
        let (rule, lengths) = match (self.get(protocol), lengths) {
            (Some(rule), Some(lengths)) if !lengths.is_empty() => (rule, lengths),
            _ => return vec![payload],
        };

        let mut frames = Vec::with_capacity(lengths.len());
        // Both offset and frame sizes are in hex characters, never bytes.
        let mut offset_hex = 0usize;
        for &declared_bytes in lengths {
            if offset_hex >= payload.len() {
                break;
            }
            let frame_hex = rule.frame_hex_len(declared_bytes);
            let end_hex = offset_hex.saturating_add(frame_hex);
            match payload.get(offset_hex..end_hex) {
                Some(frame) => frames.push(frame),
                None => {
                    trace!(
                        %protocol,
                        offset_hex,
                        frame_hex,
                        payload_hex = payload.len(),
                        "message runs past captured payload, dropping"
                    );
                    break;
                }
            }
            offset_hex = end_hex;
        }
        frames
    }
}
