use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

const LOG_PREVIEW_CHARS: usize = 4000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugState {
    pub upstream: Option<Value>,
    pub mapped: Option<Value>,
    pub mapping_error: Option<String>,
}

/// Last payloads seen by the forwarder, kept for operators.
#[derive(Default)]
pub struct DebugMirror {
    state: Mutex<DebugState>,
}

impl DebugMirror {
    pub fn record_upstream(&self, payload: &Value) {
        let payload = if payload.is_object() {
            payload.clone()
        } else {
            json!({ "_raw": payload })
        };
        let mut state = self.state.lock();
        state.upstream = Some(payload);
        state.mapping_error = None;
    }

    pub fn record_mapped(&self, payload: &Value) {
        self.state.lock().mapped = Some(payload.clone());
    }

    pub fn record_error(&self, error: String) {
        self.state.lock().mapping_error = Some(error);
    }

    pub fn snapshot(&self) -> DebugState {
        self.state.lock().clone()
    }
}

pub fn log_payload(label: &str, data: &Value) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let text = data.to_string();
    let preview: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    log::debug!("[debug] {label}: {preview}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_object_payloads_are_wrapped() {
        let mirror = DebugMirror::default();
        mirror.record_upstream(&json!([1, 2]));
        assert_eq!(mirror.snapshot().upstream, Some(json!({"_raw": [1, 2]})));
    }

    #[test]
    fn new_upstream_payload_clears_error() {
        let mirror = DebugMirror::default();
        mirror.record_error("bad json".to_string());
        assert_eq!(mirror.snapshot().mapping_error.as_deref(), Some("bad json"));
        mirror.record_upstream(&json!({"id": "x"}));
        let state = mirror.snapshot();
        assert!(state.mapping_error.is_none());
        assert_eq!(state.upstream, Some(json!({"id": "x"})));
    }
}
