//! services/api/src/hub.rs
//!
//! The broadcast hub: fans state snapshots out to every live subscriber of a session.
//!
//! One actor task owns the session → subscribers registry and handles subscribe,
//! unsubscribe, publish and count commands in arrival order, so the registry needs
//! no lock. The command mailbox is unbounded and every subscriber has its own
//! bounded queue. Publishing only ever attempts a non-blocking enqueue: when a
//! subscriber's queue is full the NEWEST snapshot is dropped for that subscriber
//! alone, and nobody waits for slow consumers.

use async_stream::stream;
use futures::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tinyquiz_core::state::StateUpdate;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default number of snapshots a subscriber may have pending.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Snapshots are shared between subscribers rather than cloned for each one.
pub type SharedUpdate = Arc<StateUpdate>;

/// Error returned when the hub task is no longer running.
#[derive(Debug, thiserror::Error)]
#[error("the broadcast hub has stopped")]
pub struct HubClosed;

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub dropped: usize,
}

//=========================================================================================
// Actor Commands
//=========================================================================================

enum Command {
    Subscribe {
        session_id: Uuid,
        reply: oneshot::Sender<(u64, mpsc::WeakSender<SharedUpdate>, mpsc::Receiver<SharedUpdate>)>,
    },
    Unsubscribe {
        session_id: Uuid,
        subscriber_id: u64,
    },
    Publish {
        session_id: Uuid,
        update: SharedUpdate,
        reply: oneshot::Sender<Delivery>,
    },
    Count {
        reply: oneshot::Sender<(usize, usize)>,
    },
}

//=========================================================================================
// Handle
//=========================================================================================

/// A cheap, cloneable handle to the hub actor.
///
/// The actor stops once every handle and every subscription is dropped.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
}

impl Hub {
    /// Spawns the hub actor on the current tokio runtime.
    pub fn spawn(queue_capacity: usize) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        tokio::spawn(run(mailbox, queue_capacity.max(1)));
        Self { commands }
    }

    /// Registers a new bounded queue under the session.
    pub async fn subscribe(&self, session_id: Uuid) -> Result<Subscription, HubClosed> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { session_id, reply })
            .map_err(|_| HubClosed)?;
        let (id, sender, receiver) = response.await.map_err(|_| HubClosed)?;
        Ok(Subscription {
            id,
            session_id,
            hub: self.clone(),
            sender,
            receiver,
        })
    }

    /// Removes exactly one subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, session_id: Uuid, subscriber_id: u64) {
        let _ = self.commands.send(Command::Unsubscribe {
            session_id,
            subscriber_id,
        });
    }

    /// Offers the update to every subscriber of the session and reports what happened.
    pub async fn publish(&self, session_id: Uuid, update: StateUpdate) -> Delivery {
        let (reply, response) = oneshot::channel();
        let command = Command::Publish {
            session_id,
            update: Arc::new(update),
            reply,
        };
        if self.commands.send(command).is_err() {
            warn!(%session_id, "publish after the hub stopped");
            return Delivery::default();
        }
        response.await.unwrap_or_default()
    }

    /// Number of sessions with subscribers and total number of subscribers.
    pub async fn count(&self) -> Result<(usize, usize), HubClosed> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Count { reply })
            .map_err(|_| HubClosed)?;
        response.await.map_err(|_| HubClosed)
    }
}

//=========================================================================================
// Subscription
//=========================================================================================

/// A live registration in the hub. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    session_id: Uuid,
    hub: Hub,
    /// Weak so the queue closes as soon as the hub forgets this subscriber.
    sender: mpsc::WeakSender<SharedUpdate>,
    receiver: mpsc::Receiver<SharedUpdate>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueues an update for this subscriber only, without blocking.
    /// Returns `false` if the queue was full and the update was dropped.
    pub fn offer(&self, update: StateUpdate) -> bool {
        match self.sender.upgrade() {
            Some(sender) => sender.try_send(Arc::new(update)).is_ok(),
            None => false,
        }
    }

    /// Waits for the next snapshot. `None` once the hub has stopped or dropped
    /// this subscriber.
    pub async fn recv(&mut self) -> Option<SharedUpdate> {
        self.receiver.recv().await
    }

    /// Turns the subscription into a stream of snapshots. The subscription is
    /// released when the stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = SharedUpdate> + Send {
        let mut subscription = self;
        stream! {
            while let Some(update) = subscription.recv().await {
                yield update;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.session_id, self.id);
    }
}

//=========================================================================================
// Actor Loop
//=========================================================================================

async fn run(mut mailbox: mpsc::UnboundedReceiver<Command>, queue_capacity: usize) {
    let mut sessions: HashMap<Uuid, HashMap<u64, mpsc::Sender<SharedUpdate>>> = HashMap::new();
    let mut next_id: u64 = 0;

    while let Some(command) = mailbox.recv().await {
        match command {
            Command::Subscribe { session_id, reply } => {
                next_id += 1;
                let (sender, receiver) = mpsc::channel(queue_capacity);
                sessions
                    .entry(session_id)
                    .or_default()
                    .insert(next_id, sender.clone());
                debug!(%session_id, subscriber_id = next_id, "subscriber registered");
                if reply.send((next_id, sender.downgrade(), receiver)).is_err() {
                    remove(&mut sessions, session_id, next_id);
                }
            }
            Command::Unsubscribe {
                session_id,
                subscriber_id,
            } => {
                if remove(&mut sessions, session_id, subscriber_id) {
                    debug!(%session_id, subscriber_id, "subscriber removed");
                }
            }
            Command::Publish {
                session_id,
                update,
                reply,
            } => {
                let mut delivery = Delivery::default();
                if let Some(subscribers) = sessions.get(&session_id) {
                    for (subscriber_id, queue) in subscribers {
                        match queue.try_send(update.clone()) {
                            Ok(()) => delivery.sent += 1,
                            Err(_) => {
                                trace!(%session_id, subscriber_id, "queue full, update dropped");
                                delivery.dropped += 1;
                            }
                        }
                    }
                }
                if delivery.dropped > 0 {
                    warn!(
                        %session_id,
                        sent = delivery.sent,
                        dropped = delivery.dropped,
                        "state update not delivered to every subscriber"
                    );
                }
                let _ = reply.send(delivery);
            }
            Command::Count { reply } => {
                let subscribers = sessions.values().map(HashMap::len).sum();
                let _ = reply.send((sessions.len(), subscribers));
            }
        }
    }
    info!("broadcast hub stopped");
}

/// Removes one subscriber and forgets sessions left without any.
fn remove(
    sessions: &mut HashMap<Uuid, HashMap<u64, mpsc::Sender<SharedUpdate>>>,
    session_id: Uuid,
    subscriber_id: u64,
) -> bool {
    let Some(subscribers) = sessions.get_mut(&session_id) else {
        return false;
    };
    let removed = subscribers.remove(&subscriber_id).is_some();
    if subscribers.is_empty() {
        sessions.remove(&session_id);
    }
    removed
}
