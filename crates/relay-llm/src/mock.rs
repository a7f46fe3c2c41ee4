use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use relay_core::errors::ModelError;
use relay_core::events::{Blob, Content, FunctionCall, Part, Role};
use relay_core::model::{LiveConnection, LlmRequest, LlmResponse, Model, ResponseStream};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of responses.
    Responses(Vec<LlmResponse>),
    /// Fail the `generate` call itself.
    Error(ModelError),
    /// Yield the responses, then fail mid-stream.
    Interrupted(Vec<LlmResponse>, ModelError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Responses(vec![LlmResponse::text(text)])
    }

    /// Partial chunks followed by the aggregated final response.
    pub fn streamed_text(chunks: &[&str]) -> Self {
        let mut responses: Vec<LlmResponse> =
            chunks.iter().map(|c| LlmResponse::partial_text(*c)).collect();
        responses.push(LlmResponse::text(chunks.concat()));
        Self::Responses(responses)
    }

    pub fn function_call(name: &str, args: Value) -> Self {
        Self::function_calls(vec![(name, args)])
    }

    /// One model turn requesting several tool calls.
    pub fn function_calls(calls: Vec<(&str, Value)>) -> Self {
        let parts = calls
            .into_iter()
            .map(|(name, args)| Part::FunctionCall(FunctionCall::new(name, args)))
            .collect();
        Self::Responses(vec![LlmResponse::new(Content::new(Role::Model, parts))])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock model that returns pre-programmed responses in sequence and records requests.
pub struct MockModel {
    name: String,
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
    live_script: Option<Vec<LlmResponse>>,
    live_inputs: Arc<Mutex<Vec<Content>>>,
}

impl MockModel {
    pub fn new(name: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        Self {
            name: name.into(),
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            live_script: None,
            live_inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Enable live connections that answer each input with the next scripted response.
    pub fn with_live(mut self, script: Vec<LlmResponse>) -> Self {
        self.live_script = Some(script);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request passed to `generate`, in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().last().cloned()
    }

    /// Content sent over live connections.
    pub fn live_inputs(&self) -> Vec<Content> {
        self.live_inputs.lock().clone()
    }
}

#[async_trait]
impl Model for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: LlmRequest, stream: bool) -> Result<ResponseStream, ModelError> {
        self.requests.lock().push(request);
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = self.responses.get(idx).cloned().ok_or_else(|| {
            ModelError::InvalidRequest(format!(
                "MockModel: no response configured for call {idx}"
            ))
        })?;
        resolve_response(response, stream).await
    }

    async fn connect(&self, request: LlmRequest) -> Result<Box<dyn LiveConnection>, ModelError> {
        let script = self.live_script.clone().ok_or_else(|| {
            ModelError::Unsupported(format!("live connections for model {}", self.name))
        })?;
        self.requests.lock().push(request);
        Ok(Box::new(MockLiveConnection {
            script: script.into(),
            inputs: Arc::clone(&self.live_inputs),
            unlocked: 0,
            closed: false,
        }))
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse, stream: bool) -> Result<ResponseStream, ModelError> {
    let keep = move |r: &LlmResponse| stream || !r.partial;
    let mut current = response;
    loop {
        match current {
            MockResponse::Responses(responses) => {
                let items: Vec<_> = responses.into_iter().filter(keep).map(Ok).collect();
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::Interrupted(responses, error) => {
                let mut items: Vec<_> = responses.into_iter().filter(keep).map(Ok).collect();
                items.push(Err(error));
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

/// Live connection that releases one scripted response per input received.
pub struct MockLiveConnection {
    script: VecDeque<LlmResponse>,
    inputs: Arc<Mutex<Vec<Content>>>,
    unlocked: usize,
    closed: bool,
}

#[async_trait]
impl LiveConnection for MockLiveConnection {
    async fn send_content(&mut self, content: Content) -> Result<(), ModelError> {
        if self.closed {
            return Err(ModelError::StreamInterrupted("connection closed".into()));
        }
        self.inputs.lock().push(content);
        self.unlocked += 1;
        Ok(())
    }

    async fn send_realtime(&mut self, blob: Blob) -> Result<(), ModelError> {
        self.send_content(Content::new(Role::User, vec![Part::InlineData(blob)]))
            .await
    }

    async fn receive(&mut self) -> Option<Result<LlmResponse, ModelError>> {
        if self.closed {
            return None;
        }
        if self.unlocked == 0 || self.script.is_empty() {
            return futures::future::pending().await;
        }
        self.unlocked -= 1;
        self.script.pop_front().map(Ok)
    }

    async fn close(&mut self) -> Result<(), ModelError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    async fn collect(stream: ResponseStream) -> Vec<Result<LlmResponse, ModelError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn text_response() {
        let mock = MockModel::new("mock", vec![MockResponse::text("hello world")]);
        let responses = collect(mock.generate(LlmRequest::new("mock"), false).await.unwrap()).await;
        assert_eq!(responses.len(), 1);
        let first = responses[0].as_ref().unwrap();
        assert_eq!(first.content.as_ref().and_then(Content::text).as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn streamed_text_drops_chunks_when_not_streaming() {
        let mock = MockModel::new(
            "mock",
            vec![
                MockResponse::streamed_text(&["hel", "lo"]),
                MockResponse::streamed_text(&["hel", "lo"]),
            ],
        );
        let streamed = collect(mock.generate(LlmRequest::new("mock"), true).await.unwrap()).await;
        assert_eq!(streamed.len(), 3);
        assert!(streamed[0].as_ref().unwrap().partial);

        let whole = collect(mock.generate(LlmRequest::new("mock"), false).await.unwrap()).await;
        assert_eq!(whole.len(), 1);
        assert!(!whole[0].as_ref().unwrap().partial);
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockModel::new(
            "mock",
            vec![MockResponse::Error(ModelError::AuthenticationFailed("bad".into()))],
        );
        assert!(mock.generate(LlmRequest::new("mock"), false).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_stream_ends_with_error() {
        let mock = MockModel::new(
            "mock",
            vec![MockResponse::Interrupted(
                vec![LlmResponse::partial_text("par")],
                ModelError::StreamInterrupted("eof".into()),
            )],
        );
        let items = collect(mock.generate(LlmRequest::new("mock"), true).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn exhausted_script_is_an_error() {
        let mock = MockModel::new("mock", vec![]);
        let result = mock.generate(LlmRequest::new("mock"), false).await;
        assert!(matches!(result, Err(ModelError::InvalidRequest(_))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn records_requests() {
        let mock = MockModel::new(
            "mock",
            vec![MockResponse::function_call("lookup", json!({"q": "x"}))],
        );
        let mut request = LlmRequest::new("mock");
        request.append_instruction("be brief");
        let _ = mock.generate(request, false).await.unwrap();
        let recorded = mock.last_request().unwrap();
        assert_eq!(recorded.system_instruction.as_deref(), Some("be brief"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockModel::new(
            "mock",
            vec![MockResponse::delayed(Duration::from_secs(5), MockResponse::text("late"))],
        );
        let start = tokio::time::Instant::now();
        let _ = mock.generate(LlmRequest::new("mock"), false).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn live_connection_answers_each_input() {
        let mock = MockModel::new("mock", vec![]).with_live(vec![LlmResponse::text("pong")]);
        let mut conn = mock.connect(LlmRequest::new("mock")).await.unwrap();
        conn.send_content(Content::user_text("ping")).await.unwrap();
        let response = conn.receive().await.unwrap().unwrap();
        assert_eq!(response.content.and_then(|c| c.text()).as_deref(), Some("pong"));
        conn.close().await.unwrap();
        assert!(conn.receive().await.is_none());
        assert_eq!(mock.live_inputs().len(), 1);
    }

    #[tokio::test]
    async fn live_requires_script() {
        let mock = MockModel::new("mock", vec![]);
        assert!(matches!(
            mock.connect(LlmRequest::new("mock")).await,
            Err(ModelError::Unsupported(_))
        ));
    }
}
