// Per-invocation pipeline context
//
// The context never outlives the trigger call that created it. Metadata
// carries cross-step primitives under reserved underscore keys; trigger
// data is the original event payload and is read-only by convention.

use serde_json::Value;

use crate::value::{DataMap, DataMapExt};

/// Original HTTP request snapshot (method, path, headers, query)
pub const META_HTTP_REQUEST: &str = "_http_request";
/// Raw request body bytes as a string, kept for signature verification
pub const META_RAW_BODY: &str = "_raw_body";
/// Set by response-writing steps; suppresses the trigger's 202 fallback
pub const META_RESPONSE_HANDLED: &str = "_response_handled";
/// Response status a step wants committed
pub const META_RESPONSE_STATUS: &str = "_response_status";
/// Response headers a step wants committed (object of string values)
pub const META_RESPONSE_HEADERS: &str = "_response_headers";
/// Response body a step wants committed (string or JSON value)
pub const META_RESPONSE_BODY: &str = "_response_body";
/// W3C trace context of the triggering event
pub const META_TRACEPARENT: &str = "_traceparent";

/// Scratchpad shared by the steps of one pipeline invocation.
#[derive(Debug, Default, Clone)]
pub struct PipelineContext {
    /// Working values steps read and write freely
    pub current: DataMap,
    /// Outputs of completed steps, keyed by step name
    pub step_outputs: std::collections::HashMap<String, DataMap>,
    /// Original event payload
    pub trigger_data: DataMap,
    /// Cross-step primitives (reserved underscore keys above)
    pub metadata: DataMap,
}

impl PipelineContext {
    pub fn new(trigger_data: DataMap) -> Self {
        Self {
            current: DataMap::new(),
            step_outputs: std::collections::HashMap::new(),
            trigger_data,
            metadata: DataMap::new(),
        }
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn response_handled(&self) -> bool {
        self.metadata.get_bool(META_RESPONSE_HANDLED).unwrap_or(false)
    }
}
