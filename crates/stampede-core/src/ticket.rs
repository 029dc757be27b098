//! Tickets: one in-flight execution shared by a leader and its followers.
//!
//! A ticket is a write-once cell published through a `watch` channel. The
//! leader is the single writer; every subscriber holds its own receiver and
//! reads the cell at its own pace. Streamed bodies are kept in the cell as
//! a growing list of refcounted chunks so a subscriber that attaches late
//! still replays the body from the first chunk.

use crate::error::{CoalesceError, ContractViolation};
use crate::fingerprint::DedupKey;
use crate::reply::{ChunkStream, Reply};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Externally visible state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// The handler is running; nothing has been published.
    Running,
    /// A stream head was published and chunks are still being produced.
    Streaming,
    /// A value, or a complete stream, was published.
    Succeeded,
    /// The handler failed (before or during streaming).
    Failed,
    /// The leader went away without publishing a terminal result.
    Abandoned,
}

impl TicketState {
    /// Returns true once no further publication can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TicketState::Succeeded | TicketState::Failed | TicketState::Abandoned
        )
    }
}

enum StreamEnd<E> {
    Complete,
    Failed(E),
    Abandoned,
}

enum Progress<T, E> {
    Running,
    Value(T),
    Streaming {
        head: T,
        chunks: Vec<Bytes>,
        end: Option<StreamEnd<E>>,
    },
    Failed(E),
    Abandoned,
}

impl<T, E> Progress<T, E> {
    fn state(&self) -> TicketState {
        match self {
            Progress::Running => TicketState::Running,
            Progress::Value(_) => TicketState::Succeeded,
            Progress::Streaming { end: None, .. } => TicketState::Streaming,
            Progress::Streaming {
                end: Some(StreamEnd::Complete),
                ..
            } => TicketState::Succeeded,
            Progress::Streaming {
                end: Some(StreamEnd::Failed(_)),
                ..
            } => TicketState::Failed,
            Progress::Streaming {
                end: Some(StreamEnd::Abandoned),
                ..
            } => TicketState::Abandoned,
            Progress::Failed(_) => TicketState::Failed,
            Progress::Abandoned => TicketState::Abandoned,
        }
    }
}

/// The shared record of one execution.
pub struct Ticket<T, E> {
    key: DedupKey,
    progress: watch::Sender<Progress<T, E>>,
    waiters: AtomicUsize,
}

impl<T, E> Ticket<T, E> {
    pub(crate) fn new(key: DedupKey) -> Self {
        Self {
            key,
            progress: watch::Sender::new(Progress::Running),
            waiters: AtomicUsize::new(0),
        }
    }

    /// The key this ticket was created for.
    pub fn key(&self) -> DedupKey {
        self.key
    }

    /// Current state.
    pub fn state(&self) -> TicketState {
        self.progress.borrow().state()
    }

    /// Number of attached consumers, the leader's own caller included.
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Number of body chunks published so far.
    pub fn chunk_count(&self) -> usize {
        match &*self.progress.borrow() {
            Progress::Streaming { chunks, .. } => chunks.len(),
            _ => 0,
        }
    }

    /// Attaches a new consumer.
    pub(crate) fn attach(self: &Arc<Self>) -> Subscriber<T, E> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        Subscriber {
            rx: self.progress.subscribe(),
            guard: WaiterGuard {
                ticket: Arc::clone(self),
            },
        }
    }

    pub(crate) fn publish_success(&self, value: T) -> Result<(), ContractViolation> {
        self.transition("publish_success", |progress| match progress {
            Progress::Running => {
                *progress = Progress::Value(value);
                Ok(())
            }
            Progress::Streaming { end: None, .. } => Err(ContractViolation::StreamAlreadyStarted),
            _ => Err(ContractViolation::AlreadyCompleted),
        })
    }

    pub(crate) fn publish_failure(&self, error: E) -> Result<(), ContractViolation> {
        self.transition("publish_failure", |progress| match progress {
            Progress::Running => {
                *progress = Progress::Failed(error);
                Ok(())
            }
            Progress::Streaming { end: end @ None, .. } => {
                *end = Some(StreamEnd::Failed(error));
                Ok(())
            }
            _ => Err(ContractViolation::AlreadyCompleted),
        })
    }

    pub(crate) fn begin_stream(&self, head: T) -> Result<(), ContractViolation> {
        self.transition("begin_stream", |progress| match progress {
            Progress::Running => {
                *progress = Progress::Streaming {
                    head,
                    chunks: Vec::new(),
                    end: None,
                };
                Ok(())
            }
            Progress::Streaming { end: None, .. } => Err(ContractViolation::StreamAlreadyStarted),
            _ => Err(ContractViolation::AlreadyCompleted),
        })
    }

    pub(crate) fn publish_chunk(&self, chunk: Bytes) -> Result<(), ContractViolation> {
        self.transition("publish_chunk", |progress| match progress {
            Progress::Streaming {
                chunks, end: None, ..
            } => {
                chunks.push(chunk);
                Ok(())
            }
            Progress::Running => Err(ContractViolation::StreamNotStarted),
            _ => Err(ContractViolation::AlreadyCompleted),
        })
    }

    pub(crate) fn publish_end(&self) -> Result<(), ContractViolation> {
        self.transition("publish_end", |progress| match progress {
            Progress::Streaming { end: end @ None, .. } => {
                *end = Some(StreamEnd::Complete);
                Ok(())
            }
            Progress::Running => Err(ContractViolation::StreamNotStarted),
            _ => Err(ContractViolation::AlreadyCompleted),
        })
    }

    /// Marks a non-terminal ticket as abandoned. Returns false if it was
    /// already terminal.
    pub(crate) fn abandon(&self) -> bool {
        self.progress.send_if_modified(|progress| match progress {
            Progress::Running => {
                *progress = Progress::Abandoned;
                true
            }
            Progress::Streaming { end: end @ None, .. } => {
                *end = Some(StreamEnd::Abandoned);
                true
            }
            _ => false,
        })
    }

    fn transition<F>(&self, op: &'static str, apply: F) -> Result<(), ContractViolation>
    where
        F: FnOnce(&mut Progress<T, E>) -> Result<(), ContractViolation>,
    {
        let mut outcome = Ok(());
        self.progress.send_if_modified(|progress| match apply(progress) {
            Ok(()) => true,
            Err(violation) => {
                outcome = Err(violation);
                false
            }
        });

        if let Err(violation) = outcome {
            tracing::error!(
                key = %self.key,
                op,
                error = %violation,
                "Ticket publish protocol violated"
            );
        }
        outcome
    }
}

impl<T, E> std::fmt::Debug for Ticket<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("key", &self.key)
            .field("state", &self.progress.borrow().state())
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

struct WaiterGuard<T, E> {
    ticket: Arc<Ticket<T, E>>,
}

impl<T, E> Drop for WaiterGuard<T, E> {
    fn drop(&mut self) {
        self.ticket.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Read-only view of a ticket.
///
/// Dropping a subscriber (or the [`ChunkStream`] it produced) detaches it.
pub struct Subscriber<T, E> {
    rx: watch::Receiver<Progress<T, E>>,
    guard: WaiterGuard<T, E>,
}

enum Step<T, E> {
    Wait,
    Done(Result<Reply<T, E>, CoalesceError<E>>),
    Stream(T),
}

impl<T, E> Subscriber<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The ticket this subscriber is attached to.
    pub fn ticket(&self) -> &Arc<Ticket<T, E>> {
        &self.guard.ticket
    }

    /// Waits until the leader publishes a value, a failure, or a stream head.
    ///
    /// # Errors
    ///
    /// Returns the leader's handler error verbatim, or
    /// [`CoalesceError::LeaderLost`] if the leader went away.
    pub async fn outcome(mut self) -> Result<Reply<T, E>, CoalesceError<E>> {
        loop {
            let step = match &*self.rx.borrow_and_update() {
                Progress::Running => Step::Wait,
                Progress::Value(value) => Step::Done(Ok(Reply::Value(value.clone()))),
                Progress::Failed(error) => Step::Done(Err(CoalesceError::Handler(error.clone()))),
                Progress::Abandoned => Step::Done(Err(CoalesceError::LeaderLost)),
                Progress::Streaming { head, .. } => Step::Stream(head.clone()),
            };

            match step {
                Step::Wait => {
                    if self.rx.changed().await.is_err() {
                        return Err(CoalesceError::LeaderLost);
                    }
                }
                Step::Done(result) => return result,
                Step::Stream(head) => {
                    return Ok(Reply::Stream {
                        head,
                        chunks: self.replay(),
                    })
                }
            }
        }
    }

    fn replay(self) -> ChunkStream<E> {
        let state = Replay {
            rx: self.rx,
            cursor: 0,
            _guard: self.guard,
        };

        let chunks = stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                let step = match &*state.rx.borrow_and_update() {
                    Progress::Streaming { chunks, end, .. } => match chunks.get(state.cursor) {
                        Some(chunk) => ReplayStep::Chunk(chunk.clone()),
                        None => match end {
                            None => ReplayStep::Wait,
                            Some(StreamEnd::Complete) => ReplayStep::End,
                            Some(StreamEnd::Failed(error)) => {
                                ReplayStep::Fail(CoalesceError::Handler(error.clone()))
                            }
                            Some(StreamEnd::Abandoned) => {
                                ReplayStep::Fail(CoalesceError::LeaderLost)
                            }
                        },
                    },
                    // A streaming ticket never leaves the Streaming variant.
                    _ => ReplayStep::Fail(CoalesceError::LeaderLost),
                };

                match step {
                    ReplayStep::Chunk(chunk) => {
                        state.cursor += 1;
                        return Some((Ok(chunk), Some(state)));
                    }
                    ReplayStep::End => return None,
                    ReplayStep::Fail(error) => return Some((Err(error), None)),
                    ReplayStep::Wait => {
                        if state.rx.changed().await.is_err() {
                            return Some((Err(CoalesceError::LeaderLost), None));
                        }
                    }
                }
            }
        });

        ChunkStream::from_boxed(chunks.boxed())
    }
}

struct Replay<T, E> {
    rx: watch::Receiver<Progress<T, E>>,
    cursor: usize,
    _guard: WaiterGuard<T, E>,
}

enum ReplayStep<E> {
    Wait,
    Chunk(Bytes),
    End,
    Fail(CoalesceError<E>),
}
