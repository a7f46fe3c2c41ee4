use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use relay_core::events::{Blob, Content};

/// Input for a live (bidirectional) run.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveRequest {
    Content(Content),
    Realtime(Blob),
    /// Ends the live run.
    Close,
}

/// Caller-side queue feeding a live run.
///
/// Clones share one channel. Sends after the run has ended are discarded.
#[derive(Clone)]
pub struct LiveRequestQueue {
    tx: mpsc::UnboundedSender<LiveRequest>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<LiveRequest>>>,
}

impl LiveRequestQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn send(&self, request: LiveRequest) {
        let _ = self.tx.send(request);
    }

    pub fn send_content(&self, content: Content) {
        self.send(LiveRequest::Content(content));
    }

    pub fn send_realtime(&self, blob: Blob) {
        self.send(LiveRequest::Realtime(blob));
    }

    pub fn close(&self) {
        self.send(LiveRequest::Close);
    }

    /// Waits for the next request. Cancel-safe.
    pub async fn recv(&self) -> Option<LiveRequest> {
        self.rx.lock().await.recv().await
    }
}

impl Default for LiveRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
