use std::convert::Infallible;

use axum::body::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::FutureExt;
use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{ProtocolAdapter, Usage};

type EventStream = BoxStream<'static, Result<Event, EventStreamError<Infallible>>>;

/// Watches a relayed stream and accumulates reported token usage.
/// Each relayed chunk is copied into an `eventsource-stream` parser; the
/// bytes handed to the caller are never touched.
pub struct UsageScanner {
    adapter: &'static dyn ProtocolAdapter,
    tx: Option<mpsc::UnboundedSender<Result<Bytes, Infallible>>>,
    events: EventStream,
    usage: Usage,
    bytes: usize,
}

impl UsageScanner {
    pub fn new(adapter: &'static dyn ProtocolAdapter) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            tx: Some(tx),
            events: UnboundedReceiverStream::new(rx).eventsource().boxed(),
            usage: Usage::default(),
            bytes: 0,
        }
    }

    pub fn feed(&mut self, chunk: &Bytes) {
        self.bytes += chunk.len();
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(chunk.clone()));
        }
        self.drain();
    }

    /// Closes the parser and returns whatever usage was seen.
    pub fn finish(&mut self) -> Usage {
        self.tx = None;
        self.drain();
        self.usage
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    // 只取已就绪的事件，通道为空时立即返回
    fn drain(&mut self) {
        while let Some(Some(item)) = self.events.next().now_or_never() {
            match item {
                Ok(event) => self.apply(&event),
                Err(e) => tracing::debug!("unparseable SSE event: {}", e),
            }
        }
    }

    fn apply(&mut self, event: &Event) {
        if event.data.trim() == "[DONE]" {
            return;
        }
        // 未声明 event 字段时解析器给出默认的 "message"
        let name = Some(event.event.as_str()).filter(|name| !name.is_empty() && *name != "message");
        if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
            self.adapter.scan_stream_event(name, &value, &mut self.usage);
        }
    }
}
