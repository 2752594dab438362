//! The event envelope: one applied primitive plus its metadata.
//!
//! The event log is authoritative; replaying it from the empty state
//! reproduces the stored snapshot exactly.

use serde::{Deserialize, Serialize};

use crate::id::EventRecordId;
use crate::primitive::Primitive;
use crate::{Sequence, Source, Timestamp};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageEvent {
    pub id: EventRecordId,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub actor: String,
    pub source: Source,
    #[serde(flatten)]
    pub primitive: Primitive,
}

#[bon::bon]
impl PageEvent {
    #[builder]
    pub fn new(
        id: Option<EventRecordId>,
        sequence: Sequence,
        timestamp: Timestamp,
        actor: impl Into<String>,
        source: Source,
        primitive: Primitive,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(EventRecordId::generate),
            sequence,
            timestamp,
            actor: actor.into(),
            source,
            primitive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, ParentRef};
    use crate::primitive::EntityCreate;
    use crate::prop::Props;

    #[test]
    fn envelope_flattens_primitive_tag() {
        let event = PageEvent::builder()
            .sequence(Sequence(1))
            .timestamp(Timestamp::now())
            .actor("user_1")
            .source(Source::Web)
            .primitive(Primitive::EntityCreate(EntityCreate {
                id: EntityId::new("grocery").expect("valid"),
                parent: ParentRef::Root,
                display: None,
                props: Props::new(),
            }))
            .build();

        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["type"], "entity.create");
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["source"], "web");
        assert!(json["payload"].is_object());

        let back: PageEvent = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, event);
    }
}
