//! The coalescing engine: entry point used by the transport layer.
//!
//! ```text
//! request ─► upgrade? ─► blacklisted? ─► fingerprint ─► registry.acquire
//!              │              │               │              │
//!              └──────────────┴───── bypass ──┘      ┌───────┴────────┐
//!                                                    ▼                ▼
//!                                                 leader           follower
//!                                           (spawned handler,   (subscribe to
//!                                            publish, release)     ticket)
//! ```

use crate::blacklist::SharedBlacklist;
use crate::error::{CoalesceError, ContractViolation};
use crate::fingerprint::{DedupKey, Fingerprinter, Sha256Fingerprinter};
use crate::registry::{
    Acquired, BypassReason, CoalescingRegistry, LeaderHandle, RegistryConfig, StreamAttachPolicy,
};
use crate::reply::{ChunkStream, HandlerOutput, Reply};
use crate::request::RequestDescriptor;
use crate::stats::{CoalescerStats, StatsInner};
use futures::StreamExt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::Instrument;

/// Configuration for the coalescing engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master switch. When false every request is executed directly.
    pub enabled: bool,
    /// Maximum number of in-flight tickets.
    pub max_in_flight: usize,
    /// Late-attach policy for streaming responses.
    pub stream_attach: StreamAttachPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            enabled: true,
            max_in_flight: registry.max_in_flight,
            stream_attach: registry.stream_attach,
        }
    }
}

/// How a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Executed the handler on behalf of every attached caller.
    Leader,
    /// Shared the result of another request's execution.
    Follower,
    /// Executed the handler directly, outside the registry.
    Bypass(BypassReason),
}

impl Role {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Bypass(_) => "bypass",
        }
    }
}

/// Outcome of [`CoalescingEngine::dispatch`].
#[derive(Debug)]
pub struct Handled<T, E> {
    /// How the request was served.
    pub role: Role,
    /// The dedup key, when one was computed.
    pub key: Option<DedupKey>,
    /// The reply, or the failure every attached caller observed.
    pub result: Result<Reply<T, E>, CoalesceError<E>>,
}

/// Merges concurrent identical requests into one handler execution.
///
/// `T` is the response value (or streamed response head) and `E` the
/// handler error. Both are cloned once per attached caller.
///
/// The engine must be used inside a tokio runtime: a leader's handler is
/// spawned so that it runs to completion even if the leader's own caller
/// stops waiting.
///
/// # Example
///
/// ```
/// use stampede_core::{CoalescingEngine, HandlerOutput, Method, Reply, RequestDescriptor};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = CoalescingEngine::<String, String>::with_defaults();
/// let request = RequestDescriptor::new(Method::Get, "/items").with_query([("limit", "10")]);
///
/// let reply = engine
///     .handle(&request, || async { Ok(HandlerOutput::Value("items".to_string())) })
///     .await
///     .unwrap();
///
/// assert!(matches!(reply, Reply::Value(v) if v == "items"));
/// # }
/// ```
pub struct CoalescingEngine<T, E> {
    config: EngineConfig,
    blacklist: SharedBlacklist,
    fingerprinter: Arc<dyn Fingerprinter>,
    registry: CoalescingRegistry<T, E>,
    stats: Arc<StatsInner>,
}

impl<T, E> Clone for CoalescingEngine<T, E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            blacklist: self.blacklist.clone(),
            fingerprinter: Arc::clone(&self.fingerprinter),
            registry: self.registry.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T, E> CoalescingEngine<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Starts an engine builder.
    pub fn builder() -> EngineBuilder<T, E> {
        EngineBuilder::default()
    }

    /// Creates an engine with no blacklist and the SHA-256 fingerprinter.
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Creates an engine with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    /// Handles a request, returning the reply every equivalent concurrent
    /// caller also receives.
    ///
    /// `invoke` runs the underlying handler. It is called at most once, and
    /// only if this request leads or bypasses.
    ///
    /// # Errors
    ///
    /// Returns the handler's error verbatim (to the leader and every
    /// follower), or [`CoalesceError::LeaderLost`] if the leading execution
    /// panicked before publishing.
    pub async fn handle<F, Fut>(
        &self,
        request: &RequestDescriptor,
        invoke: F,
    ) -> Result<Reply<T, E>, CoalesceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutput<T, E>, E>> + Send + 'static,
    {
        self.dispatch(request, invoke).await.result
    }

    /// Like [`handle`](Self::handle), but also reports the role the request played.
    pub async fn dispatch<F, Fut>(&self, request: &RequestDescriptor, invoke: F) -> Handled<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutput<T, E>, E>> + Send + 'static,
    {
        StatsInner::incr(&self.stats.total_requests);

        let key = match self.classify(request) {
            Ok(key) => key,
            Err(reason) => return self.bypass(reason, None, invoke).await,
        };

        match self.registry.acquire(key) {
            Acquired::Leader(leader) => {
                StatsInner::incr(&self.stats.leader_executions);
                tracing::debug!(key = %key, path = %request.path(), "Leading execution");

                let own = leader.subscribe();
                let span = tracing::debug_span!("coalesce_leader", key = %key);
                tokio::spawn(lead(leader, invoke()).instrument(span));

                Handled {
                    role: Role::Leader,
                    key: Some(key),
                    result: own.outcome().await,
                }
            }
            Acquired::Follower(subscriber) => {
                StatsInner::incr(&self.stats.coalesced_requests);
                tracing::debug!(
                    key = %key,
                    path = %request.path(),
                    waiters = subscriber.ticket().waiter_count(),
                    "Attached to in-flight execution"
                );

                Handled {
                    role: Role::Follower,
                    key: Some(key),
                    result: subscriber.outcome().await,
                }
            }
            Acquired::Bypass(reason) => self.bypass(reason, Some(key), invoke).await,
        }
    }

    fn classify(&self, request: &RequestDescriptor) -> Result<DedupKey, BypassReason> {
        if !self.config.enabled {
            return Err(BypassReason::Disabled);
        }
        if request.is_upgrade() {
            return Err(BypassReason::Upgrade);
        }
        if self.blacklist.is_excluded(request.method(), request.path()) {
            return Err(BypassReason::Blacklisted);
        }

        self.fingerprinter.fingerprint(request).map_err(|error| {
            tracing::warn!(
                method = %request.method(),
                path = %request.path(),
                error = %error,
                "Request could not be fingerprinted, executing without coalescing"
            );
            BypassReason::Unfingerprintable
        })
    }

    async fn bypass<F, Fut>(
        &self,
        reason: BypassReason,
        key: Option<DedupKey>,
        invoke: F,
    ) -> Handled<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerOutput<T, E>, E>> + Send + 'static,
    {
        StatsInner::incr(&self.stats.bypassed_requests);
        tracing::trace!(reason = reason.as_str(), "Bypassing coalescing");

        let result = match invoke().await {
            Ok(HandlerOutput::Value(value)) => Ok(Reply::Value(value)),
            Ok(HandlerOutput::Stream { head, body }) => Ok(Reply::Stream {
                head,
                chunks: ChunkStream::passthrough(body),
            }),
            Err(error) => Err(CoalesceError::Handler(error)),
        };

        Handled {
            role: Role::Bypass(reason),
            key,
            result,
        }
    }

    /// Returns the current statistics.
    pub fn stats(&self) -> CoalescerStats {
        self.stats.snapshot(self.registry.in_flight())
    }

    /// The registry of in-flight tickets.
    pub fn registry(&self) -> &CoalescingRegistry<T, E> {
        &self.registry
    }

    /// The blacklist, which can be extended at runtime.
    pub fn blacklist(&self) -> &SharedBlacklist {
        &self.blacklist
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<T, E> std::fmt::Debug for CoalescingEngine<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Drives a leader's handler to completion and publishes into its ticket.
///
/// The handle is dropped on return, which releases the ticket (and marks it
/// abandoned if the handler panicked or nothing terminal was published).
async fn lead<T, E, Fut>(leader: LeaderHandle<T, E>, execution: Fut)
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput<T, E>, E>> + Send + 'static,
{
    let output = execution.await;
    if let Err(violation) = publish(&leader, output).await {
        tracing::error!(key = %leader.key(), error = %violation, "Leader failed to publish result");
    }
}

async fn publish<T, E>(
    leader: &LeaderHandle<T, E>,
    output: Result<HandlerOutput<T, E>, E>,
) -> Result<(), ContractViolation>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    match output {
        Ok(HandlerOutput::Value(value)) => leader.publish_success(value),
        Ok(HandlerOutput::Stream { head, mut body }) => {
            leader.begin_stream(head)?;
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => leader.publish_chunk(chunk)?,
                    Err(error) => return leader.publish_failure(error),
                }
            }
            leader.publish_end()
        }
        Err(error) => leader.publish_failure(error),
    }
}

/// Builder for [`CoalescingEngine`].
///
/// The response and error types are fixed when the builder is created, so
/// `CoalescingEngine::<T, E>::builder()` builds exactly that engine.
pub struct EngineBuilder<T, E> {
    config: EngineConfig,
    blacklist: SharedBlacklist,
    fingerprinter: Arc<dyn Fingerprinter>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Default for EngineBuilder<T, E> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            blacklist: SharedBlacklist::default(),
            fingerprinter: Arc::new(Sha256Fingerprinter),
            _marker: PhantomData,
        }
    }
}

impl<T, E> EngineBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Sets the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the routes exempt from coalescing.
    pub fn blacklist(mut self, blacklist: impl Into<SharedBlacklist>) -> Self {
        self.blacklist = blacklist.into();
        self
    }

    /// Replaces the fingerprinter.
    pub fn fingerprinter(mut self, fingerprinter: impl Fingerprinter + 'static) -> Self {
        self.fingerprinter = Arc::new(fingerprinter);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> CoalescingEngine<T, E> {
        let registry = CoalescingRegistry::new(RegistryConfig {
            max_in_flight: self.config.max_in_flight,
            stream_attach: self.config.stream_attach,
        });

        CoalescingEngine {
            config: self.config,
            blacklist: self.blacklist,
            fingerprinter: self.fingerprinter,
            registry,
            stats: Arc::new(StatsInner::default()),
        }
    }
}
