//! Per-session server-to-caller channels.
//!
//! Each session owns one bounded channel. The sending half stays in the
//! table; the receiving half is taken by the single open server stream. Removing
//! the entry drops the sender, which ends that stream. Messages pushed while the
//! buffer is full (no stream attached, or a stalled reader) are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::operations::LogSink;

/// Pending server-to-caller messages kept per session.
pub const STREAM_BUFFER: usize = 64;

#[derive(Debug)]
pub struct SessionTransport {
    pub session_id: String,
    tx: Sender<Value>,
    rx: Mutex<Option<Receiver<Value>>>,
}

impl SessionTransport {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        Arc::new(Self { session_id: session_id.into(), tx, rx: Mutex::new(Some(rx)) })
    }

    pub fn log_sink(&self) -> LogSink { LogSink::to_stream(self.tx.clone()) }

    /// Take the receiving half; `None` if a stream is already attached.
    pub fn open_stream(&self) -> Option<Receiver<Value>> { self.rx.lock().take() }

    /// `false` when the message was dropped (buffer full or stream gone).
    pub fn push(&self, message: Value) -> bool { self.tx.try_send(message).is_ok() }
}

#[derive(Debug, Default)]
pub struct TransportTable {
    map: Mutex<HashMap<String, Arc<SessionTransport>>>,
}

impl TransportTable {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, transport: Arc<SessionTransport>) {
        self.map.lock().insert(transport.session_id.clone(), transport);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionTransport>> { self.map.lock().get(session_id).cloned() }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionTransport>> { self.map.lock().remove(session_id) }

    /// Drop every transport, ending all open streams.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.map.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize { self.map.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_ends_when_transport_released() {
        let table = TransportTable::new();
        let t = SessionTransport::new("s1");
        table.insert(t.clone());
        let mut rx = t.open_stream().unwrap();
        assert!(t.open_stream().is_none());
        assert!(t.push(serde_json::json!({"n": 1})));
        drop(t);
        assert_eq!(rx.recv().await.unwrap()["n"], 1);
        table.remove("s1");
        assert!(rx.recv().await.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn unattached_session_buffers_at_most_the_bound() {
        let t = SessionTransport::new("s2");
        for i in 0..STREAM_BUFFER {
            assert!(t.push(serde_json::json!({"n": i})));
        }
        assert!(!t.push(serde_json::json!({"n": "overflow"})));
        t.log_sink().log("info", "also dropped");
        let mut rx = t.open_stream().unwrap();
        let mut seen = 0;
        while rx.try_recv().is_ok() { seen += 1; }
        assert_eq!(seen, STREAM_BUFFER);
    }

    #[tokio::test]
    async fn clear_ends_every_stream() {
        let table = TransportTable::new();
        let a = SessionTransport::new("a");
        let b = SessionTransport::new("b");
        let mut ra = a.open_stream().unwrap();
        let mut rb = b.open_stream().unwrap();
        table.insert(a);
        table.insert(b);
        assert_eq!(table.clear(), 2);
        assert!(ra.recv().await.is_none());
        assert!(rb.recv().await.is_none());
    }
}
