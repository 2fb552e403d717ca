use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

const MAX_PENDING_LINE_BYTES: usize = 1024 * 1024;

/// Usage and model last seen in a relayed response.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamCapture {
    pub usage: Option<Value>,
    pub model: Option<String>,
}

impl StreamCapture {
    /// Both halves are needed for a billable record.
    pub fn into_billable(self) -> Option<(String, Value)> {
        match (self.model, self.usage) {
            (Some(model), Some(usage)) => Some((model, usage)),
            _ => None,
        }
    }

    /// Folds one decoded `data:` payload into the capture. Later values win.
    pub fn observe(&mut self, payload: &Value) {
        let nested = payload.get("response");
        let model = payload
            .get("model")
            .or_else(|| nested.and_then(|r| r.get("model")))
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty());
        if let Some(model) = model {
            self.model = Some(model.to_string());
        }

        let usage = payload
            .get("usage")
            .filter(|u| is_present(u))
            .or_else(|| nested.and_then(|r| r.get("usage")).filter(|u| is_present(u)));
        if let Some(usage) = usage {
            self.usage = Some(usage.clone());
        }
    }
}

/// JSON truthiness: null, false, zero and empty containers are absent.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Splits relayed bytes into lines and inspects `data:` lines.
#[derive(Default)]
pub struct SseScanner {
    pending: BytesMut,
    // Prefix of `pending` already known to hold no newline.
    scanned: usize,
    capture: StreamCapture,
}

impl SseScanner {
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(offset) = self.pending[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let pos = self.scanned + offset;
            let line = self.pending.split_to(pos + 1);
            self.scanned = 0;
            self.inspect_line(&line[..pos]);
        }
        self.scanned = self.pending.len();
        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            log::warn!("[stream] dropping oversized partial line");
            self.pending.clear();
            self.scanned = 0;
        }
    }

    /// Inspects a trailing line that never saw its newline.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            let line = self.pending.split();
            self.scanned = 0;
            self.inspect_line(&line);
        }
    }

    fn inspect_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(data) = line.strip_prefix(b"data:") else {
            return;
        };
        let data = data.trim_ascii();
        if data.is_empty() || data == b"[DONE]" {
            return;
        }
        if let Ok(payload) = serde_json::from_slice::<Value>(data) {
            self.capture.observe(&payload);
        }
    }

    pub fn take_capture(&mut self) -> StreamCapture {
        std::mem::take(&mut self.capture)
    }
}

/// Relays an upstream byte stream unchanged while scanning it for usage.
///
/// Whatever was captured is sent exactly once: when the upstream ends, when
/// it errors, or when the tap is dropped because the client went away.
pub struct UsageTap<S> {
    inner: Option<S>,
    scanner: SseScanner,
    done: Option<oneshot::Sender<StreamCapture>>,
}

impl<S> UsageTap<S> {
    pub fn new(inner: S) -> (Self, oneshot::Receiver<StreamCapture>) {
        let (tx, rx) = oneshot::channel();
        let tap = Self {
            inner: Some(inner),
            scanner: SseScanner::default(),
            done: Some(tx),
        };
        (tap, rx)
    }

    fn finish(&mut self) {
        // Release the upstream connection before handing off the capture.
        self.inner = None;
        if let Some(tx) = self.done.take() {
            self.scanner.flush();
            let _ = tx.send(self.scanner.take_capture());
        }
    }
}

impl<S> Drop for UsageTap<S> {
    fn drop(&mut self) {
        if self.done.is_some() {
            log::info!("[stream] client disconnected");
        }
        self.finish();
    }
}

impl<S, E> Stream for UsageTap<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_next(cx),
            None => return Poll::Ready(None),
        };
        match polled {
            Poll::Ready(Some(Ok(chunk))) => {
                self.scanner.feed(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                log::warn!("[stream] upstream stream error: {err}");
                self.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use serde_json::json;
    use std::io;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        let items: Vec<Result<Bytes, io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(items)
    }

    #[test]
    fn scanner_handles_lines_split_across_chunks() {
        let mut scanner = SseScanner::default();
        scanner.feed(b"data: {\"model\":\"gpt-4o-2024-08-06\",\"usa");
        scanner.feed(b"ge\":null}\n\ndata: {\"usage\":{\"prompt_tokens\":3}}\r\n");
        scanner.feed(b"data: [DONE]\n");
        assert_eq!(
            scanner.take_capture(),
            StreamCapture {
                usage: Some(json!({"prompt_tokens": 3})),
                model: Some("gpt-4o-2024-08-06".to_string()),
            }
        );
    }

    #[test]
    fn scanner_handles_a_line_fed_one_byte_at_a_time() {
        let mut scanner = SseScanner::default();
        let line = b"data: {\"model\":\"m\",\"usage\":{\"total_tokens\":8}}\n";
        for byte in line.chunks(1) {
            scanner.feed(byte);
            assert!(scanner.scanned <= scanner.pending.len());
        }
        assert!(scanner.pending.is_empty());
        assert_eq!(scanner.scanned, 0);

        scanner.feed(b"data: {\"model\":\"n\"}\ndata: {\"usa");
        assert_eq!(scanner.scanned, scanner.pending.len());
        scanner.feed(b"ge\":{\"total_tokens\":9}}\n");
        assert_eq!(
            scanner.take_capture(),
            StreamCapture {
                usage: Some(json!({"total_tokens": 9})),
                model: Some("n".to_string()),
            }
        );
    }

    #[test]
    fn scanner_ignores_non_json_and_non_data_lines() {
        let mut scanner = SseScanner::default();
        scanner.feed(b"event: ping\n: comment\ndata: not json\ndata:\n");
        assert_eq!(scanner.take_capture(), StreamCapture::default());
    }

    #[test]
    fn scanner_reads_responses_api_completion_event() {
        let mut scanner = SseScanner::default();
        scanner.feed(
            b"data: {\"type\":\"response.completed\",\"response\":{\"model\":\"o1\",\"usage\":{\"input_tokens\":4}}}\n",
        );
        let (model, usage) = scanner.take_capture().into_billable().unwrap();
        assert_eq!(model, "o1");
        assert_eq!(usage, json!({"input_tokens": 4}));
    }

    #[test]
    fn empty_usage_objects_do_not_replace_candidates() {
        let mut capture = StreamCapture::default();
        capture.observe(&json!({"usage": {"total_tokens": 9}}));
        capture.observe(&json!({"usage": {}}));
        capture.observe(&json!({"model": ""}));
        assert_eq!(capture.usage, Some(json!({"total_tokens": 9})));
        assert!(capture.model.is_none());
        assert!(capture.into_billable().is_none());
    }

    #[tokio::test]
    async fn tap_relays_bytes_unchanged_and_keeps_last_usage() {
        let parts = [
            "data: {\"model\":\"m\",\"usage\":{\"prompt_tokens\":1}}\n\n",
            "data: {\"model\":\"m\",\"usage\":{\"prompt_tokens\":2}}\n\n",
            "data: [DONE]",
        ];
        let (tap, rx) = UsageTap::new(chunks(&parts));
        let relayed: Vec<Bytes> = tap.map(|c| c.unwrap()).collect().await;
        assert_eq!(relayed.concat(), parts.concat().into_bytes());

        let capture = rx.await.unwrap();
        assert_eq!(capture.usage, Some(json!({"prompt_tokens": 2})));
        assert_eq!(capture.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn dropped_tap_still_reports_what_it_saw() {
        let parts = [
            "data: {\"model\":\"m\",\"choices\":[]}\n\n",
            "data: {\"model\":\"m\",\"usage\":{\"prompt_tokens\":2}}\n\n",
        ];
        let (mut tap, rx) = UsageTap::new(chunks(&parts));
        tap.next().await.unwrap().unwrap();
        drop(tap);

        let capture = rx.await.unwrap();
        assert_eq!(capture.model.as_deref(), Some("m"));
        assert!(capture.usage.is_none());
        assert!(capture.into_billable().is_none());
    }

    #[tokio::test]
    async fn upstream_error_ends_stream_and_reports_once() {
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"model\":\"m\",\"usage\":{\"total_tokens\":5}}\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: {\"usage\":{\"total_tokens\":99}}\n")),
        ];
        let (mut tap, rx) = UsageTap::new(stream::iter(items));
        assert!(tap.next().await.unwrap().is_ok());
        assert!(tap.next().await.unwrap().is_err());
        assert!(tap.next().await.is_none());
        drop(tap);

        let capture = rx.await.unwrap();
        assert_eq!(capture.usage, Some(json!({"total_tokens": 5})));
    }
}
