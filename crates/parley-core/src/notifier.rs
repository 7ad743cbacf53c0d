//! Event notifier.
//!
//! Every state change of the client is published as one [`Event`] on a
//! broadcast channel. Subscribers either poll an [`EventStream`] or attach an
//! [`EventSink`] callback. Publishing never waits for subscribers: a
//! subscriber that falls behind loses its oldest events and is told how many
//! it missed, and a subscriber that is gone is pruned.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::conversation::ConversationId;
use crate::message::Message;

/// Default broadcast capacity per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Identifies a subscription.
pub type SubscriptionId = u64;

/// A state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A conversation became known, created locally or joined via welcome.
    ConversationCreated {
        conversation_id: ConversationId,
        name: String,
        members: Vec<String>,
    },
    /// A member joined a known conversation.
    MemberAdded {
        conversation_id: ConversationId,
        username: String,
    },
    /// A member left or was removed from a known conversation.
    MemberRemoved {
        conversation_id: ConversationId,
        username: String,
    },
    /// A message was added to a conversation's history.
    MessageReceived { message: Message },
    /// The local read marker of a conversation moved.
    MarkedRead {
        conversation_id: ConversationId,
        position: u64,
    },
}

impl Event {
    /// The conversation this event belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Event::ConversationCreated {
                conversation_id, ..
            }
            | Event::MemberAdded {
                conversation_id, ..
            }
            | Event::MemberRemoved {
                conversation_id, ..
            }
            | Event::MarkedRead {
                conversation_id, ..
            } => *conversation_id,
            Event::MessageReceived { message } => message.conversation_id,
        }
    }

    /// Short event name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ConversationCreated { .. } => "conversation_created",
            Event::MemberAdded { .. } => "member_added",
            Event::MemberRemoved { .. } => "member_removed",
            Event::MessageReceived { .. } => "message_received",
            Event::MarkedRead { .. } => "marked_read",
        }
    }
}

/// An event stamped with its position in the client's event order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Strictly increasing, starting at 1.
    pub sequence: u64,
    pub event: Event,
}

/// Why a stream produced no event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The subscriber fell behind and the oldest events were dropped.
    #[error("Subscriber fell behind, {0} events dropped")]
    Lagged(u64),

    /// The notifier is gone; no further events will arrive.
    #[error("Notifier closed")]
    Closed,
}

/// A pollable subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventStream {
    id: SubscriptionId,
    receiver: broadcast::Receiver<Arc<EventEnvelope>>,
}

impl EventStream {
    /// Get the subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// `StreamError::Lagged` if events were dropped since the last call (the
    /// stream stays usable), `StreamError::Closed` once the notifier is gone.
    pub async fn recv(&mut self) -> Result<Arc<EventEnvelope>, StreamError> {
        self.receiver.recv().await.map_err(|e| match e {
            RecvError::Lagged(n) => StreamError::Lagged(n),
            RecvError::Closed => StreamError::Closed,
        })
    }

    /// Take the next event if one is ready.
    ///
    /// # Errors
    ///
    /// Same as [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Option<Arc<EventEnvelope>>, StreamError> {
        match self.receiver.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(n)) => Err(StreamError::Lagged(n)),
            Err(TryRecvError::Closed) => Err(StreamError::Closed),
        }
    }
}

/// A push-style subscriber.
///
/// Callbacks run on a runtime task owned by the notifier and must not block.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver one event. Return `false` if the subscriber is gone.
    fn deliver(&self, envelope: &EventEnvelope) -> bool;

    /// Report that `count` events were dropped for this subscriber.
    /// Return `false` if the subscriber is gone.
    fn missed(&self, count: u64) -> bool {
        let _ = count;
        true
    }
}

/// Broadcasts client events to every subscriber.
#[derive(Debug)]
pub struct Notifier {
    sender: broadcast::Sender<Arc<EventEnvelope>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    /// Active sink forwarders.
    sinks: Arc<DashMap<SubscriptionId, Option<AbortHandle>>>,
    capacity: usize,
}

impl Notifier {
    /// Create a notifier with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a notifier whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
            sinks: Arc::new(DashMap::new()),
            capacity,
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        self.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a pollable subscription. It sees every event emitted after
    /// this call.
    pub fn register_stream(&self) -> EventStream {
        let id = self.allocate_id();
        debug!(subscription = id, "Event stream registered");
        EventStream {
            id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Attach a callback subscriber.
    ///
    /// Must be called from within a Tokio runtime. The sink is pruned the
    /// first time it reports itself gone.
    pub fn register_sink(&self, sink: impl EventSink) -> SubscriptionId {
        let id = self.allocate_id();
        let mut receiver = self.sender.subscribe();
        let sinks = Arc::clone(&self.sinks);
        self.sinks.insert(id, None);

        let handle = tokio::spawn(async move {
            loop {
                let alive = match receiver.recv().await {
                    Ok(envelope) => sink.deliver(&envelope),
                    Err(RecvError::Lagged(n)) => {
                        warn!(subscription = id, missed = n, "Event sink fell behind");
                        sink.missed(n)
                    }
                    Err(RecvError::Closed) => break,
                };
                if !alive {
                    debug!(subscription = id, "Event sink gone, pruning");
                    break;
                }
            }
            sinks.remove(&id);
        });

        // The forwarder may already have finished and removed its entry.
        if let Some(mut entry) = self.sinks.get_mut(&id) {
            *entry = Some(handle.abort_handle());
        }
        debug!(subscription = id, "Event sink registered");
        id
    }

    /// Detach a callback subscriber.
    ///
    /// Returns `true` if it was still attached.
    pub fn unregister_sink(&self, id: SubscriptionId) -> bool {
        match self.sinks.remove(&id) {
            Some((_, handle)) => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                debug!(subscription = id, "Event sink unregistered");
                true
            }
            None => false,
        }
    }

    /// Publish an event to every subscriber.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn emit(&self, event: Event) -> usize {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(
            sequence,
            kind = event.kind(),
            conversation = %event.conversation_id(),
            "Emitting event"
        );
        self.sender
            .send(Arc::new(EventEnvelope { sequence, event }))
            .unwrap_or_default()
    }

    /// Number of live subscribers (streams and sinks).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of attached sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Sequence number of the last emitted event (0 if none).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Get the per-subscriber capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
