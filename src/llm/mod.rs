//! Chat-completion provider abstraction and fail-over router
//!
//! Backends (local and remote) implement [`ChatProvider`]; the router owns
//! the registered set with priorities, tries the configured default first,
//! and fails over on transient transport errors. An `InvalidRequest` never
//! fails over — a malformed prompt would be malformed everywhere, and
//! silently retrying it elsewhere only hides the bug.
//!
//! Every call takes a cancellation token; providers race the HTTP request
//! against it so an in-flight call aborts promptly on session stop.
//! Provider configuration is hot-reloadable: swapping the default or the
//! set does not interrupt a call already in flight (it holds its own
//! handles).

pub mod providers;

pub use providers::{build_provider, AnthropicProvider, OllamaProvider, OpenAiCompatProvider};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between background health probes
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Typed provider failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Malformed request; never failed over
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response arrived but did not match the expected schema
    #[error("Response schema violation: {0}")]
    SchemaViolation(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Should the router try the next provider?
    pub fn should_fail_over(&self) -> bool {
        matches!(
            self,
            ProviderError::ConnectionRefused(_)
                | ProviderError::Timeout(_)
                | ProviderError::ServiceUnavailable(_)
                | ProviderError::ModelNotLoaded(_)
                | ProviderError::RateLimited(_)
        )
    }
}

/// One chat message
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request knobs shared across backends
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// Health probe result
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderHealth {
    Healthy { latency_ms: u64 },
    Unhealthy { reason: String },
}

/// A chat-completion backend
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn health(&self) -> ProviderHealth;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    async fn chat_simple(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.chat(
            &[ChatMessage::user(prompt)],
            &ChatParams::default(),
            cancel,
        )
        .await
    }
}

/// Fail-over order within the registered set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderPriority {
    Primary,
    Secondary,
    Tertiary,
}

struct Registered {
    priority: ProviderPriority,
    provider: Arc<dyn ChatProvider>,
}

/// A completed, routed chat call
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub provider: String,
    pub content: String,
}

/// Cached health status, consumed by the insight engine and UI adapters
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub name: String,
    pub priority: ProviderPriority,
    pub is_default: bool,
    pub health: ProviderHealth,
}

struct RouterInner {
    providers: Vec<(String, Registered)>,
    default_name: String,
}

/// Routes chat calls across registered providers with fail-over
pub struct ProviderRouter {
    inner: RwLock<RouterInner>,
    health: RwLock<HashMap<String, ProviderHealth>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RouterInner {
                providers: Vec::new(),
                default_name: String::new(),
            }),
            health: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        priority: ProviderPriority,
        provider: Arc<dyn ChatProvider>,
    ) {
        let name = name.into();
        let mut inner = self.inner.write().await;
        inner.providers.retain(|(n, _)| *n != name);
        inner.providers.push((
            name.clone(),
            Registered { priority, provider },
        ));
        inner
            .providers
            .sort_by_key(|(_, registered)| registered.priority);
        if inner.default_name.is_empty() {
            inner.default_name = name;
        }
    }

    /// Hot-swap the default provider. In-flight calls keep the handles they
    /// resolved at dispatch time and are not interrupted.
    pub async fn set_default(&self, name: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.write().await;
        if !inner.providers.iter().any(|(n, _)| n == name) {
            return Err(ProviderError::Other(format!(
                "unknown provider: {}",
                name
            )));
        }
        info!("Default LLM provider is now {}", name);
        inner.default_name = name.to_string();
        Ok(())
    }

    /// Replace the whole provider set (hot reload from configuration).
    pub async fn reload(
        &self,
        providers: Vec<(String, ProviderPriority, Arc<dyn ChatProvider>)>,
        default_name: &str,
    ) {
        let mut inner = self.inner.write().await;
        inner.providers = providers
            .into_iter()
            .map(|(name, priority, provider)| (name, Registered { priority, provider }))
            .collect();
        inner
            .providers
            .sort_by_key(|(_, registered)| registered.priority);
        inner.default_name = default_name.to_string();
        self.health.write().await.clear();
    }

    /// Snapshot of the attempt order: default first, then by priority.
    async fn dispatch_order(&self) -> Vec<(String, Arc<dyn ChatProvider>)> {
        let inner = self.inner.read().await;
        let mut order: Vec<(String, Arc<dyn ChatProvider>)> = Vec::new();
        if let Some((name, registered)) = inner
            .providers
            .iter()
            .find(|(n, _)| *n == inner.default_name)
        {
            order.push((name.clone(), Arc::clone(&registered.provider)));
        }
        for (name, registered) in &inner.providers {
            if *name != inner.default_name {
                order.push((name.clone(), Arc::clone(&registered.provider)));
            }
        }
        order
    }

    /// Route a chat call. Transient failures fall through to the next
    /// provider; `InvalidRequest` (and schema violations) surface at once.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse, ProviderError> {
        let order = self.dispatch_order().await;
        if order.is_empty() {
            return Err(ProviderError::Other("no providers registered".to_string()));
        }

        let mut last_error = ProviderError::Other("no provider attempted".to_string());
        for (name, provider) in order {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            debug!("Dispatching chat to provider {}", name);
            match provider.chat(messages, params, cancel).await {
                Ok(content) => {
                    return Ok(RoutedResponse {
                        provider: name,
                        content,
                    })
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) if e.should_fail_over() => {
                    warn!("Provider {} failed ({}), trying next", name, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    pub async fn chat_simple(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse, ProviderError> {
        self.chat(&[ChatMessage::user(prompt)], &ChatParams::default(), cancel)
            .await
    }

    /// Probe every provider now and refresh the cache.
    pub async fn check_health(&self) -> Vec<ProviderStatus> {
        let inner_snapshot: Vec<(String, ProviderPriority, Arc<dyn ChatProvider>, bool)> = {
            let inner = self.inner.read().await;
            inner
                .providers
                .iter()
                .map(|(name, registered)| {
                    (
                        name.clone(),
                        registered.priority,
                        Arc::clone(&registered.provider),
                        *name == inner.default_name,
                    )
                })
                .collect()
        };

        let mut statuses = Vec::with_capacity(inner_snapshot.len());
        for (name, priority, provider, is_default) in inner_snapshot {
            let health = provider.health().await;
            self.health
                .write()
                .await
                .insert(name.clone(), health.clone());
            statuses.push(ProviderStatus {
                name,
                priority,
                is_default,
                health,
            });
        }
        statuses
    }

    /// Last cached health for a provider, if any probe has run.
    pub async fn cached_health(&self, name: &str) -> Option<ProviderHealth> {
        self.health.read().await.get(name).cloned()
    }

    /// Background probe loop; runs until the token is cancelled.
    pub async fn run_health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let statuses = self.check_health().await;
                    for status in &statuses {
                        if let ProviderHealth::Unhealthy { reason } = &status.health {
                            debug!("Provider {} unhealthy: {}", status.name, reason);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Health loop stopped");
                    return;
                }
            }
        }
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider for router tests
    struct Scripted {
        name: String,
        outcomes: Vec<Result<String, ProviderError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &str, outcomes: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcomes,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn health(&self) -> ProviderHealth {
            ProviderHealth::Healthy { latency_ms: 1 }
        }

        async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec!["scripted".to_string()])
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _params: &ChatParams,
            _cancel: &CancellationToken,
        ) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes[call.min(self.outcomes.len() - 1)].clone()
        }
    }

    #[tokio::test]
    async fn fails_over_on_transient_error() {
        let router = ProviderRouter::new();
        let flaky = Scripted::new(
            "flaky",
            vec![Err(ProviderError::ConnectionRefused("down".to_string()))],
        );
        let solid = Scripted::new("solid", vec![Ok("answer".to_string())]);
        router
            .register("flaky", ProviderPriority::Primary, flaky.clone())
            .await;
        router
            .register("solid", ProviderPriority::Secondary, solid.clone())
            .await;

        let response = router
            .chat_simple("hello", &CancellationToken::new())
            .await
            .expect("fallback should succeed");
        assert_eq!(response.provider, "solid");
        assert_eq!(response.content, "answer");
        assert_eq!(flaky.calls(), 1);
        assert_eq!(solid.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_request_does_not_fail_over() {
        let router = ProviderRouter::new();
        let picky = Scripted::new(
            "picky",
            vec![Err(ProviderError::InvalidRequest("bad prompt".to_string()))],
        );
        let never = Scripted::new("never", vec![Ok("unused".to_string())]);
        router
            .register("picky", ProviderPriority::Primary, picky)
            .await;
        router
            .register("never", ProviderPriority::Secondary, never.clone())
            .await;

        match router.chat_simple("hello", &CancellationToken::new()).await {
            Err(ProviderError::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {:?}", other),
        }
        assert_eq!(never.calls(), 0);
    }

    #[tokio::test]
    async fn all_transient_failures_surface_the_last_error() {
        let router = ProviderRouter::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            router
                .register(
                    *name,
                    match i {
                        0 => ProviderPriority::Primary,
                        1 => ProviderPriority::Secondary,
                        _ => ProviderPriority::Tertiary,
                    },
                    Scripted::new(
                        name,
                        vec![Err(ProviderError::ServiceUnavailable(format!(
                            "{} down",
                            name
                        )))],
                    ),
                )
                .await;
        }

        match router.chat_simple("hello", &CancellationToken::new()).await {
            Err(ProviderError::ServiceUnavailable(msg)) => assert_eq!(msg, "c down"),
            other => panic!("expected ServiceUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn default_provider_is_tried_first_even_with_lower_priority() {
        let router = ProviderRouter::new();
        let primary = Scripted::new("primary", vec![Ok("from primary".to_string())]);
        let preferred = Scripted::new("preferred", vec![Ok("from preferred".to_string())]);
        router
            .register("primary", ProviderPriority::Primary, primary.clone())
            .await;
        router
            .register("preferred", ProviderPriority::Tertiary, preferred.clone())
            .await;
        router.set_default("preferred").await.unwrap();

        let response = router
            .chat_simple("hello", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.provider, "preferred");
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let router = ProviderRouter::new();
        router
            .register(
                "any",
                ProviderPriority::Primary,
                Scripted::new("any", vec![Ok("unused".to_string())]),
            )
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        match router.chat_simple("hello", &cancel).await {
            Err(ProviderError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }
}
