use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::Dispatch;
use tracing_subscriber::layer::SubscriberExt;

use crate::capture::{CaptureLayer, CapturedLogs};

/// Logging capability handed to runners and services.
///
/// Wraps a tracing dispatcher. Work scoped to a logger emits through that
/// dispatcher regardless of the process-wide default.
#[derive(Clone, Debug)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// The dispatcher active on the calling thread.
    pub fn current() -> Self {
        tracing::dispatcher::get_default(|dispatch| Self {
            dispatch: dispatch.clone(),
        })
    }

    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// A logger that records into memory, for tests.
    pub fn capture() -> (Self, CapturedLogs) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(logs.clone()));
        (
            Self {
                dispatch: Dispatch::new(subscriber),
            },
            logs,
        )
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn scope_future<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }

    /// Every poll of the returned stream runs under this logger.
    pub fn scope_stream<S: Stream>(&self, stream: S) -> Scoped<S> {
        Scoped {
            inner: stream,
            dispatch: self.dispatch.clone(),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::current()
    }
}

pin_project! {
    /// Stream adapter returned by [`Logger::scope_stream`].
    pub struct Scoped<S> {
        #[pin]
        inner: S,
        dispatch: Dispatch,
    }
}

impl<S: Stream> Stream for Scoped<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let inner = this.inner;
        tracing::dispatcher::with_default(this.dispatch, || inner.poll_next(cx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tracing::{info, warn};

    #[test]
    fn capture_records_events_in_scope() {
        let (logger, logs) = Logger::capture();
        logger.in_scope(|| {
            info!(session_id = "sess_1", "session created");
            warn!(count = 3, "slow append");
        });
        assert_eq!(logs.len(), 2);
        let records = logs.records();
        assert_eq!(records[0].message, "session created");
        assert_eq!(records[0].session_id.as_deref(), Some("sess_1"));
        assert_eq!(records[1].fields["count"], 3);
        assert_eq!(logs.with_level("warn").len(), 1);
    }

    #[test]
    fn events_outside_scope_are_not_captured() {
        let (_logger, logs) = Logger::capture();
        info!("not captured");
        assert!(logs.is_empty());
    }

    #[test]
    fn span_fields_propagate_to_events() {
        let (logger, logs) = Logger::capture();
        logger.in_scope(|| {
            let span = tracing::info_span!("run", invocation_id = "inv_9");
            let _entered = span.enter();
            info!("inside run");
        });
        assert_eq!(logs.records()[0].invocation_id.as_deref(), Some("inv_9"));
    }

    #[tokio::test]
    async fn scoped_stream_logs_through_logger() {
        let (logger, logs) = Logger::capture();
        let stream = futures::stream::iter(1..=3).map(|n| {
            info!(n, "item");
            n
        });
        let items: Vec<i32> = logger.scope_stream(stream).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(logs.len(), 3);
    }

    #[tokio::test]
    async fn scoped_future_logs_through_logger() {
        let (logger, logs) = Logger::capture();
        logger
            .scope_future(async {
                info!("from future");
            })
            .await;
        assert!(logs.contains("from future"));
        logs.clear();
        assert!(logs.is_empty());
    }
}
