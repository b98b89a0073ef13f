use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use shinobi_core::errors::GatewayError;
use shinobi_core::gateway::{Completion, CompletionRequest, ModelGateway};
use shinobi_core::messages::ToolCallBlock;
use shinobi_core::usage::TokenUsage;

const EMBED_DIMS: usize = 8;

/// Pre-programmed responses for deterministic runs without a provider.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Reply(Completion),
    Error(GatewayError),
    /// Wait, then resolve the inner response. The wait honours cancellation.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(Completion::text(text))
    }

    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::Reply(Completion::tool_calls(vec![ToolCallBlock::new(name, arguments)]))
    }

    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        Self::Reply(Completion::tool_calls(
            calls
                .into_iter()
                .map(|(name, args)| ToolCallBlock::new(name, args))
                .collect(),
        ))
    }

    pub fn input_required(question: &str) -> Self {
        Self::Reply(Completion::input_required(question))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// Attach usage counters to a reply (no-op for errors).
    #[must_use]
    pub fn with_usage(self, usage: TokenUsage) -> Self {
        match self {
            Self::Reply(c) => Self::Reply(c.with_usage(usage)),
            Self::Delay(d, inner) => Self::Delay(d, Box::new(inner.with_usage(usage))),
            other => other,
        }
    }
}

type Handler = Box<dyn Fn(&CompletionRequest) -> MockResponse + Send + Sync>;

enum Source {
    Script(Mutex<VecDeque<MockResponse>>),
    Handler(Handler),
}

/// Gateway double: answers from a FIFO script or from a request handler.
///
/// Scripts suit a single sequential run. Handlers suit concurrent runs, where
/// the order in which branches reach the gateway is not fixed.
pub struct MockGateway {
    name: String,
    source: Source,
    default_usage: Option<TokenUsage>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockGateway {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::from_source(Source::Script(Mutex::new(responses.into())))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CompletionRequest) -> MockResponse + Send + Sync + 'static,
    {
        Self::from_source(Source::Handler(Box::new(handler)))
    }

    fn from_source(source: Source) -> Self {
        Self {
            name: "mock".into(),
            source,
            default_usage: None,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Usage attached to every reply that does not carry its own.
    #[must_use]
    pub fn with_default_usage(mut self, usage: TokenUsage) -> Self {
        self.default_usage = Some(usage);
        self
    }

    /// Append to the script. Ignored for handler-backed mocks.
    pub fn push(&self, response: MockResponse) {
        if let Source::Script(queue) = &self.source {
            queue.lock().push_back(response);
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn remaining(&self) -> usize {
        match &self.source {
            Source::Script(queue) => queue.lock().len(),
            Source::Handler(_) => 0,
        }
    }

    fn next_response(&self, request: &CompletionRequest, idx: usize) -> MockResponse {
        match &self.source {
            Source::Handler(handler) => handler(request),
            Source::Script(queue) => queue.lock().pop_front().unwrap_or_else(|| {
                MockResponse::Error(GatewayError::InvalidRequest(format!(
                    "MockGateway: no response configured for call {idx}"
                )))
            }),
        }
    }
}

async fn resolve(
    response: MockResponse,
    cancel: &CancellationToken,
) -> Result<Completion, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Reply(completion) => return Ok(completion),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => {}
                    () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                }
                current = *inner;
            }
        }
    }
}

#[async_trait]
impl ModelGateway for MockGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let response = self.next_response(request, idx);
        let mut completion = resolve(response, cancel).await?;
        if completion.usage.is_none() {
            completion.usage = self.default_usage;
        }
        Ok(completion)
    }

    /// Deterministic unit-length vector derived from the text bytes.
    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let mut v = vec![0.0_f32; EMBED_DIMS];
        for (i, b) in text.bytes().enumerate() {
            v[i % EMBED_DIMS] += f32::from(b);
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shinobi_core::gateway::StopReason;

    fn req(text: &str) -> CompletionRequest {
        let mut r = CompletionRequest::new("mock-model");
        r.messages.push(shinobi_core::messages::Message::user_text(text));
        r
    }

    #[tokio::test]
    async fn returns_script_in_order() {
        let mock = MockGateway::new(vec![
            MockResponse::tool_call("add", json!({"a": 2, "b": 3})),
            MockResponse::text("done"),
        ]);
        let cancel = CancellationToken::new();

        let first = mock.complete(&req("q"), &cancel).await.unwrap();
        assert_eq!(first.stop_reason, StopReason::ToolUse);
        assert_eq!(first.tool_calls[0].name, "add");

        let second = mock.complete(&req("q"), &cancel).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("done"));
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.remaining(), 0);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let mock = MockGateway::new(vec![]);
        let err = mock
            .complete(&req("q"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn handler_sees_request() {
        let mock = MockGateway::with_handler(|r| {
            MockResponse::text(&format!("echo: {}", r.last_user_text().unwrap_or("")))
        });
        let out = mock.complete(&req("hello"), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.content.as_deref(), Some("echo: hello"));
        assert_eq!(mock.last_request().unwrap().model, "mock-model");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_honours_cancellation() {
        let mock = MockGateway::new(vec![MockResponse::delayed(
            Duration::from_secs(60),
            MockResponse::text("late"),
        )]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = mock.complete(&req("q"), &cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn default_usage_fills_gaps() {
        let mock = MockGateway::new(vec![
            MockResponse::text("a"),
            MockResponse::text("b").with_usage(TokenUsage::new(1, 1)),
        ])
        .with_default_usage(TokenUsage::new(10, 5));
        let cancel = CancellationToken::new();
        let a = mock.complete(&req("q"), &cancel).await.unwrap();
        let b = mock.complete(&req("q"), &cancel).await.unwrap();
        assert_eq!(a.usage, Some(TokenUsage::new(10, 5)));
        assert_eq!(b.usage, Some(TokenUsage::new(1, 1)));
    }

    #[tokio::test]
    async fn embed_is_deterministic_and_normalised() {
        let mock = MockGateway::new(vec![]);
        let cancel = CancellationToken::new();
        let a = mock.embed("shuriken", &cancel).await.unwrap();
        let b = mock.embed("shuriken", &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBED_DIMS);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(mock.embed("", &cancel).await.unwrap().iter().all(|x| *x == 0.0));
    }
}
