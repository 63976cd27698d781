// W3C trace-context propagation
//
// Carrier adapters share one inject/extract pair so HTTP headers, message
// headers and event-detail maps all speak the same `traceparent` wire
// format. Exporter wiring is out of scope; extracted ids are recorded as
// span fields for correlation in logs.

use serde_json::Value;
use std::collections::HashMap;

pub const TRACEPARENT: &str = "traceparent";

const VERSION: &str = "00";

/// Parsed `traceparent` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 16-byte trace id, lowercase hex
    pub trace_id: String,
    /// 8-byte parent span id, lowercase hex
    pub parent_id: String,
    /// Trace flags (bit 0 = sampled)
    pub flags: u8,
}

impl TraceContext {
    /// Parse a `traceparent` header value. Returns None for malformed or
    /// all-zero ids, per the W3C rules.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_id = parts.next()?;
        let flags = parts.next()?;

        if version.len() != 2 || trace_id.len() != 32 || parent_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !is_lower_hex(trace_id) || !is_lower_hex(parent_id) || !is_lower_hex(flags) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || parent_id.bytes().all(|b| b == b'0') {
            return None;
        }

        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(Self {
            trace_id: trace_id.to_string(),
            parent_id: parent_id.to_string(),
            flags,
        })
    }

    /// Fresh sampled root context.
    pub fn generate() -> Self {
        let trace = uuid::Uuid::new_v4();
        let span = uuid::Uuid::new_v4();
        Self {
            trace_id: hex::encode(trace.as_bytes()),
            parent_id: hex::encode(&span.as_bytes()[..8]),
            flags: 0x01,
        }
    }

    /// Child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        let span = uuid::Uuid::new_v4();
        Self {
            trace_id: self.trace_id.clone(),
            parent_id: hex::encode(&span.as_bytes()[..8]),
            flags: self.flags,
        }
    }

    pub fn to_header_value(&self) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            VERSION, self.trace_id, self.parent_id, self.flags
        )
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Key/value carrier a trace context can be injected into or extracted from.
pub trait Carrier {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
}

impl Carrier for http::HeaderMap {
    fn get(&self, key: &str) -> Option<String> {
        http::HeaderMap::get(self, key)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(key),
            http::header::HeaderValue::try_from(value),
        ) {
            self.insert(name, value);
        }
    }
}

impl Carrier for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl Carrier for serde_json::Map<String, Value> {
    fn get(&self, key: &str) -> Option<String> {
        serde_json::Map::get(self, key)
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), Value::String(value));
    }
}

/// Read the trace context out of a carrier, if present and valid.
pub fn extract(carrier: &impl Carrier) -> Option<TraceContext> {
    TraceContext::parse(&carrier.get(TRACEPARENT)?)
}

/// Write the trace context into a carrier.
pub fn inject(ctx: &TraceContext, carrier: &mut impl Carrier) {
    carrier.set(TRACEPARENT, ctx.to_header_value());
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn test_parse_valid() {
        let ctx = TraceContext::parse(SAMPLE).unwrap();
        assert_eq!(ctx.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.parent_id, "b7ad6b7169203331");
        assert_eq!(ctx.flags, 1);
        assert_eq!(ctx.to_header_value(), SAMPLE);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(TraceContext::parse("").is_none());
        assert!(TraceContext::parse("00-short-b7ad6b7169203331-01").is_none());
        assert!(TraceContext::parse(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
        assert!(TraceContext::parse(
            "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01"
        )
        .is_none());
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let root = TraceContext::parse(SAMPLE).unwrap();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.parent_id, root.parent_id);
    }

    #[test]
    fn test_header_map_round_trip() {
        let ctx = TraceContext::generate();
        let mut headers = http::HeaderMap::new();
        inject(&ctx, &mut headers);
        assert_eq!(extract(&headers), Some(ctx));
    }

    #[test]
    fn test_string_map_round_trip() {
        let ctx = TraceContext::generate();
        let mut headers: HashMap<String, String> = HashMap::new();
        inject(&ctx, &mut headers);
        assert_eq!(extract(&headers), Some(ctx));
    }

    #[test]
    fn test_json_map_round_trip() {
        let ctx = TraceContext::generate();
        let mut detail = serde_json::Map::new();
        inject(&ctx, &mut detail);
        assert_eq!(extract(&detail), Some(ctx));
    }
}
