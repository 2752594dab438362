//! Delivery channels: the server half of each client's duplex channel.
//!
//! Frames are JSON objects, one per wire frame; the transport that
//! carries them is out of scope. Every subscriber of a page sees the
//! same ordered delta stream. Broadcasting never blocks the reducer
//! path: a subscriber that cannot keep up is disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use aide_core::entity::{Entity, EntityId, ParentRef};
use aide_core::event::PageEvent;
use aide_core::id::PageId;
use aide_core::primitive::{EntityCreate, Primitive};
use aide_core::prop::PropValue;
use aide_core::state::PageState;
use aide_core::{Source, Timestamp};

use crate::LOG_TARGET;

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        content: String,
        message_id: String,
    },
    DirectEdit {
        entity_id: EntityId,
        field: String,
        value: PropValue,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnDiagnostic {
    pub code: String,
    pub primitive: String,
    pub detail: String,
}

/// Frames the server pushes to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename = "snapshot.start")]
    SnapshotStart,
    Snapshot {
        event: PageEvent,
    },
    #[serde(rename = "snapshot.end")]
    SnapshotEnd,
    #[serde(rename = "stream.start")]
    StreamStart,
    #[serde(rename = "stream.end")]
    StreamEnd,
    Delta {
        event: PageEvent,
    },
    Voice {
        text: String,
    },
    Clarify {
        prompt: String,
        options: Vec<String>,
    },
    #[serde(rename = "direct_edit.ack")]
    DirectEditAck {
        entity_id: EntityId,
        field: String,
    },
    #[serde(rename = "direct_edit.error")]
    DirectEditError {
        entity_id: EntityId,
        message: String,
    },
    Diagnostics {
        errors: Vec<TurnDiagnostic>,
    },
    Error {
        message: String,
    },
}

/// Per-subscriber frame buffer; a laggard loses its channel, not the turn.
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
pub struct Subscriptions {
    inner: Mutex<HashMap<PageId, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new client to a page.
    ///
    /// The receiver is pre-loaded with a snapshot replay of the current
    /// state, then receives live frames as they are broadcast.
    pub fn subscribe(&self, page_id: PageId, state: &PageState) -> mpsc::Receiver<ServerFrame> {
        let mut replay = vec![ServerFrame::SnapshotStart];
        replay.extend(
            snapshot_events(state)
                .into_iter()
                .map(|event| ServerFrame::Snapshot { event }),
        );
        replay.push(ServerFrame::SnapshotEnd);

        // Size the channel so the whole replay fits up front.
        let (tx, rx) = mpsc::channel(replay.len() + SUBSCRIBER_BUFFER);
        for frame in replay {
            let _ = tx.try_send(frame);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("Locking failed")
            .entry(page_id)
            .or_default()
            .push(Subscriber { id, tx });
        debug!(target: LOG_TARGET, page_id = %page_id, subscriber = id, "Subscribed");
        rx
    }

    /// Push one frame to every subscriber of the page, in order.
    pub fn broadcast(&self, page_id: PageId, frame: &ServerFrame) {
        let mut map = self.inner.lock().expect("Locking failed");
        let Some(subscribers) = map.get_mut(&page_id) else {
            return;
        };
        subscribers.retain(|subscriber| match subscriber.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: LOG_TARGET,
                    page_id = %page_id,
                    subscriber = subscriber.id,
                    "Subscriber gone, dropping"
                );
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target: LOG_TARGET,
                    page_id = %page_id,
                    subscriber = subscriber.id,
                    "Subscriber lagging, disconnecting"
                );
                false
            }
        });
        if subscribers.is_empty() {
            map.remove(&page_id);
        }
    }

    pub fn subscriber_count(&self, page_id: PageId) -> usize {
        self.inner
            .lock()
            .expect("Locking failed")
            .get(&page_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Synthetic `entity.create` events describing the current live tree,
/// parent-before-children, for catch-up replay of a new subscriber.
pub fn snapshot_events(state: &PageState) -> Vec<PageEvent> {
    let mut events = Vec::new();
    for entity in state.live_children_of(&ParentRef::Root) {
        push_snapshot_entity(state, entity, &mut events);
    }
    events
}

fn push_snapshot_entity(state: &PageState, entity: &Entity, events: &mut Vec<PageEvent>) {
    events.push(
        PageEvent::builder()
            .sequence(entity.created_seq)
            .timestamp(Timestamp::now())
            .actor("system")
            .source(Source::System)
            .primitive(Primitive::EntityCreate(EntityCreate {
                id: entity.id.clone(),
                parent: entity.parent.clone(),
                display: entity.display,
                props: entity.props.clone(),
            }))
            .build(),
    );
    for child in state.live_children_of(&ParentRef::Entity(entity.id.clone())) {
        push_snapshot_entity(state, child, events);
    }
}
