//! Registry of in-flight tickets keyed by dedup key.

use crate::error::ContractViolation;
use crate::fingerprint::DedupKey;
use crate::ticket::{Subscriber, Ticket, TicketState};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What happens to a request that arrives while a matching response is
/// already streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAttachPolicy {
    /// Attach and replay every chunk from the first one.
    #[default]
    Replay,
    /// Do not attach; run the handler independently.
    Passthrough,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of tickets tracked at once. New keys beyond this
    /// limit are executed without coalescing.
    pub max_in_flight: usize,
    /// Late-attach policy for streaming tickets.
    pub stream_attach: StreamAttachPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10_000,
            stream_attach: StreamAttachPolicy::Replay,
        }
    }
}

/// Why a request was executed without coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BypassReason {
    /// Coalescing is switched off.
    Disabled,
    /// Protocol upgrade (e.g. WebSocket).
    Upgrade,
    /// The route is blacklisted.
    Blacklisted,
    /// The request could not be fingerprinted.
    Unfingerprintable,
    /// The registry is at capacity.
    AtCapacity,
    /// A matching response is already streaming and the policy is passthrough.
    StreamInProgress,
}

impl BypassReason {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            BypassReason::Disabled => "disabled",
            BypassReason::Upgrade => "upgrade",
            BypassReason::Blacklisted => "blacklisted",
            BypassReason::Unfingerprintable => "unfingerprintable",
            BypassReason::AtCapacity => "at_capacity",
            BypassReason::StreamInProgress => "stream_in_progress",
        }
    }
}

/// Result of [`CoalescingRegistry::acquire`].
pub enum Acquired<T, E> {
    /// The caller created the ticket and must execute the handler.
    Leader(LeaderHandle<T, E>),
    /// The caller attached to a running ticket.
    Follower(Subscriber<T, E>),
    /// The caller must execute the handler on its own.
    Bypass(BypassReason),
}

impl<T, E> std::fmt::Debug for Acquired<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquired::Leader(_) => f.write_str("Leader"),
            Acquired::Follower(_) => f.write_str("Follower"),
            Acquired::Bypass(reason) => f.debug_tuple("Bypass").field(reason).finish(),
        }
    }
}

type TicketMap<T, E> = HashMap<DedupKey, Arc<Ticket<T, E>>>;

struct Shared<T, E> {
    tickets: Mutex<TicketMap<T, E>>,
    config: RegistryConfig,
}

/// Map from dedup key to live ticket.
///
/// The check-or-create decision for a key happens under a single lock
/// acquisition, so concurrent callers for the same key always see exactly
/// one leader. The lock is never held across an await point.
pub struct CoalescingRegistry<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for CoalescingRegistry<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> CoalescingRegistry<T, E> {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                tickets: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Creates a registry with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Atomically becomes the leader for `key` or attaches to its running ticket.
    ///
    /// A ticket that already reached a terminal state but has not been
    /// released yet is replaced: the caller becomes a fresh leader instead of
    /// attaching to a result that is about to disappear.
    pub fn acquire(&self, key: DedupKey) -> Acquired<T, E> {
        let mut tickets = self.shared.tickets.lock();

        match tickets.get(&key).map(|ticket| (ticket.state(), ticket)) {
            Some((TicketState::Running, ticket)) => return Acquired::Follower(ticket.attach()),
            Some((TicketState::Streaming, ticket)) => {
                return match self.shared.config.stream_attach {
                    StreamAttachPolicy::Replay => Acquired::Follower(ticket.attach()),
                    StreamAttachPolicy::Passthrough => {
                        Acquired::Bypass(BypassReason::StreamInProgress)
                    }
                };
            }
            Some(_) => {
                tracing::debug!(key = %key, "Replacing completed ticket");
            }
            None => {
                if tickets.len() >= self.shared.config.max_in_flight {
                    return Acquired::Bypass(BypassReason::AtCapacity);
                }
            }
        }

        let ticket = Arc::new(Ticket::new(key));
        tickets.insert(key, Arc::clone(&ticket));

        Acquired::Leader(LeaderHandle {
            ticket,
            registry: self.clone(),
        })
    }

    /// Removes `ticket` from the map if it is still the one registered for `key`.
    ///
    /// Returns false if the entry was already removed or replaced by a newer
    /// ticket.
    pub fn release(&self, key: &DedupKey, ticket: &Arc<Ticket<T, E>>) -> bool {
        let mut tickets = self.shared.tickets.lock();
        match tickets.get(key) {
            Some(current) if Arc::ptr_eq(current, ticket) => {
                tickets.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of tickets currently registered.
    pub fn in_flight(&self) -> usize {
        self.shared.tickets.lock().len()
    }

    /// Returns true if a ticket is registered for `key`.
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.shared.tickets.lock().contains_key(key)
    }

    /// Returns the ticket registered for `key`, if any.
    pub fn get(&self, key: &DedupKey) -> Option<Arc<Ticket<T, E>>> {
        self.shared.tickets.lock().get(key).cloned()
    }
}

impl<T, E> std::fmt::Debug for CoalescingRegistry<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingRegistry")
            .field("in_flight", &self.shared.tickets.lock().len())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Write access to a ticket, held by the leader.
///
/// Dropping the handle releases the ticket from the registry. If nothing
/// terminal was published, subscribers are told the leader was lost.
pub struct LeaderHandle<T, E> {
    ticket: Arc<Ticket<T, E>>,
    registry: CoalescingRegistry<T, E>,
}

impl<T, E> LeaderHandle<T, E> {
    /// The key being led.
    pub fn key(&self) -> DedupKey {
        self.ticket.key()
    }

    /// The ticket being led.
    pub fn ticket(&self) -> &Arc<Ticket<T, E>> {
        &self.ticket
    }

    /// Attaches the leader's own caller as a consumer of the ticket.
    pub fn subscribe(&self) -> Subscriber<T, E> {
        self.ticket.attach()
    }

    /// Publishes a complete value.
    pub fn publish_success(&self, value: T) -> Result<(), ContractViolation> {
        self.ticket.publish_success(value)
    }

    /// Publishes a handler failure, before or during streaming.
    pub fn publish_failure(&self, error: E) -> Result<(), ContractViolation> {
        self.ticket.publish_failure(error)
    }

    /// Publishes the head of a streamed response.
    pub fn begin_stream(&self, head: T) -> Result<(), ContractViolation> {
        self.ticket.begin_stream(head)
    }

    /// Publishes the next body chunk.
    pub fn publish_chunk(&self, chunk: Bytes) -> Result<(), ContractViolation> {
        self.ticket.publish_chunk(chunk)
    }

    /// Publishes the end-of-stream marker.
    pub fn publish_end(&self) -> Result<(), ContractViolation> {
        self.ticket.publish_end()
    }

    /// Releases the ticket. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<T, E> Drop for LeaderHandle<T, E> {
    fn drop(&mut self) {
        if self.ticket.abandon() {
            tracing::warn!(
                key = %self.ticket.key(),
                waiters = self.ticket.waiter_count(),
                "Leader dropped before publishing a result"
            );
        }
        self.registry.release(&self.ticket.key(), &self.ticket);
    }
}
