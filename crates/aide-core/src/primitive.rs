//! The closed set of mutation primitives, signals and batch markers.
//!
//! Every payload is structurally validated before it reaches the reducer;
//! rejections carry a stable SCREAMING_SNAKE code so callers and clients
//! can dispatch on them without string matching.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::entity::{DisplayHint, EntityId, ParentRef};
use crate::limits::{LimitKind, Limits, Warning};
use crate::prop::{find_reserved_key, PropValue, Props};
use crate::state::{is_valid_timezone, Cardinality, ConstraintRule, ConstraintScope, Visibility};
use crate::TierLevel;

/// Maximum container nesting inside a single prop value: a list of
/// primitives, or a mapping that may itself hold one more container.
pub const MAX_PROP_VALUE_DEPTH: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimitiveKind {
    /// Reduced into the page state and logged as an event.
    Mutation,
    /// Routed to the delivery channel and the orchestrator; reducer no-op.
    Signal,
    /// Brackets a delivery flush; never an event.
    Marker,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityCreate {
    pub id: EntityId,
    pub parent: ParentRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayHint>,
    #[serde(default, skip_serializing_if = "Props::is_empty")]
    pub props: Props,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    #[serde(rename = "ref")]
    pub target: EntityId,
    #[serde(default, skip_serializing_if = "Props::is_empty")]
    pub props: Props,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRemove {
    #[serde(rename = "ref")]
    pub target: ParentRef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMove {
    #[serde(rename = "ref")]
    pub target: ParentRef,
    pub parent: ParentRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityReorder {
    #[serde(rename = "ref")]
    pub target: ParentRef,
    pub children: Vec<EntityId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelSet {
    pub from: EntityId,
    pub to: EntityId,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelRemove {
    pub from: EntityId,
    pub to: EntityId,
    #[serde(rename = "type")]
    pub rel_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StyleSet {
    pub props: Props,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StyleEntity {
    #[serde(rename = "ref")]
    pub target: EntityId,
    pub props: Props,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaAnnotate {
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaConstrain {
    pub id: String,
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<PropValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "ConstraintScope::is_empty")]
    pub scope: ConstraintScope,
}

impl MetaConstrain {
    pub fn parsed_rule(&self) -> Option<ConstraintRule> {
        ConstraintRule::from_name(&self.rule)
    }
}

/// Short state reflection text; streamed to subscribers verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub text: String,
}

/// Tier jump request emitted mid-stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Escalate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<TierLevel>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
}

/// Disambiguation prompt for the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clarify {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Primitive {
    #[serde(rename = "entity.create")]
    EntityCreate(EntityCreate),
    #[serde(rename = "entity.update")]
    EntityUpdate(EntityUpdate),
    #[serde(rename = "entity.remove")]
    EntityRemove(EntityRemove),
    #[serde(rename = "entity.move")]
    EntityMove(EntityMove),
    #[serde(rename = "entity.reorder")]
    EntityReorder(EntityReorder),
    #[serde(rename = "rel.set")]
    RelSet(RelSet),
    #[serde(rename = "rel.remove")]
    RelRemove(RelRemove),
    #[serde(rename = "style.set")]
    StyleSet(StyleSet),
    #[serde(rename = "style.entity")]
    StyleEntity(StyleEntity),
    #[serde(rename = "meta.set")]
    MetaSet(MetaSet),
    #[serde(rename = "meta.annotate")]
    MetaAnnotate(MetaAnnotate),
    #[serde(rename = "meta.constrain")]
    MetaConstrain(MetaConstrain),
    #[serde(rename = "voice")]
    Voice(Voice),
    #[serde(rename = "escalate")]
    Escalate(Escalate),
    #[serde(rename = "clarify")]
    Clarify(Clarify),
    #[serde(rename = "batch.start")]
    BatchStart,
    #[serde(rename = "batch.end")]
    BatchEnd,
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::EntityCreate(_) => "entity.create",
            Primitive::EntityUpdate(_) => "entity.update",
            Primitive::EntityRemove(_) => "entity.remove",
            Primitive::EntityMove(_) => "entity.move",
            Primitive::EntityReorder(_) => "entity.reorder",
            Primitive::RelSet(_) => "rel.set",
            Primitive::RelRemove(_) => "rel.remove",
            Primitive::StyleSet(_) => "style.set",
            Primitive::StyleEntity(_) => "style.entity",
            Primitive::MetaSet(_) => "meta.set",
            Primitive::MetaAnnotate(_) => "meta.annotate",
            Primitive::MetaConstrain(_) => "meta.constrain",
            Primitive::Voice(_) => "voice",
            Primitive::Escalate(_) => "escalate",
            Primitive::Clarify(_) => "clarify",
            Primitive::BatchStart => "batch.start",
            Primitive::BatchEnd => "batch.end",
        }
    }

    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Primitive::EntityCreate(_)
            | Primitive::EntityUpdate(_)
            | Primitive::EntityRemove(_)
            | Primitive::EntityMove(_)
            | Primitive::EntityReorder(_)
            | Primitive::RelSet(_)
            | Primitive::RelRemove(_)
            | Primitive::StyleSet(_)
            | Primitive::StyleEntity(_)
            | Primitive::MetaSet(_)
            | Primitive::MetaAnnotate(_)
            | Primitive::MetaConstrain(_) => PrimitiveKind::Mutation,
            Primitive::Voice(_) | Primitive::Escalate(_) | Primitive::Clarify(_) => {
                PrimitiveKind::Signal
            }
            Primitive::BatchStart | Primitive::BatchEnd => PrimitiveKind::Marker,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.kind() == PrimitiveKind::Mutation
    }

    /// State-independent structural validation.
    ///
    /// State-dependent checks (missing refs, cycles, post-merge field
    /// counts) belong to the reducer.
    pub fn validate(&self, limits: &Limits) -> Result<Vec<Warning>, ValidateError> {
        let mut warnings = Vec::new();
        match self {
            Primitive::EntityCreate(create) => {
                validate_props(&create.props, limits, Some(&create.id), &mut warnings)?;
                let fields = create.props.len();
                if limits.fields_hard < fields {
                    return FieldsExceededSnafu {
                        count: fields,
                        limit: limits.fields_hard,
                    }
                    .fail();
                }
                Limits::soft_check(
                    &mut warnings,
                    LimitKind::Fields,
                    fields,
                    limits.fields_soft,
                    Some(&create.id),
                );
            }
            Primitive::EntityUpdate(update) => {
                validate_props(&update.props, limits, Some(&update.target), &mut warnings)?;
            }
            Primitive::StyleSet(style) => {
                if let Some(key) = find_reserved_key(&style.props) {
                    return ReservedKeySnafu { key }.fail();
                }
            }
            Primitive::StyleEntity(style) => {
                if let Some(key) = find_reserved_key(&style.props) {
                    return ReservedKeySnafu { key }.fail();
                }
            }
            Primitive::MetaSet(meta) => {
                if let Some(tz) = &meta.timezone {
                    if !is_valid_timezone(tz) {
                        return InvalidTimezoneSnafu { tz }.fail();
                    }
                }
            }
            Primitive::MetaAnnotate(annotate) => {
                if annotate.note.trim().is_empty() {
                    return NoteMissingSnafu.fail();
                }
            }
            Primitive::MetaConstrain(constrain) => {
                if constrain.parsed_rule().is_none() {
                    return UnknownRuleSnafu {
                        rule: &constrain.rule,
                    }
                    .fail();
                }
            }
            Primitive::RelSet(rel) => {
                if rel.rel_type.trim().is_empty() {
                    return RelTypeEmptySnafu.fail();
                }
            }
            Primitive::RelRemove(rel) => {
                if rel.rel_type.trim().is_empty() {
                    return RelTypeEmptySnafu.fail();
                }
            }
            Primitive::EntityRemove(_)
            | Primitive::EntityMove(_)
            | Primitive::EntityReorder(_)
            | Primitive::Voice(_)
            | Primitive::Escalate(_)
            | Primitive::Clarify(_)
            | Primitive::BatchStart
            | Primitive::BatchEnd => {}
        }
        Ok(warnings)
    }
}

fn validate_props(
    props: &Props,
    limits: &Limits,
    entity: Option<&EntityId>,
    warnings: &mut Vec<Warning>,
) -> Result<(), ValidateError> {
    if let Some(key) = find_reserved_key(props) {
        return ReservedKeySnafu { key }.fail();
    }
    for (key, value) in props {
        if MAX_PROP_VALUE_DEPTH < value.depth() {
            return NestingTooDeepSnafu { key }.fail();
        }
        if let PropValue::List(items) = value {
            if items.iter().any(|item| !item.is_scalar()) {
                return ListNotScalarSnafu { key }.fail();
            }
            if limits.list_hard < items.len() {
                return ListTooLongSnafu {
                    key,
                    len: items.len(),
                    limit: limits.list_hard,
                }
                .fail();
            }
            Limits::soft_check(
                warnings,
                LimitKind::ListProps,
                items.len(),
                limits.list_soft,
                entity,
            );
        }
    }
    Ok(())
}

#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub))]
pub enum ValidateError {
    #[snafu(display("Prop key `{key}` uses the reserved `_` prefix"))]
    ReservedKey { key: String },
    #[snafu(display("Prop `{key}` nests deeper than values allow"))]
    NestingTooDeep { key: String },
    #[snafu(display("List prop `{key}` holds non-primitive elements"))]
    ListNotScalar { key: String },
    #[snafu(display("List prop `{key}` has {len} elements, hard limit {limit}"))]
    ListTooLong {
        key: String,
        len: usize,
        limit: usize,
    },
    #[snafu(display("{count} fields on one entity, hard limit {limit}"))]
    FieldsExceeded { count: usize, limit: usize },
    #[snafu(display("Annotation note is missing"))]
    NoteMissing,
    #[snafu(display("Unknown constraint rule `{rule}`"))]
    UnknownRule { rule: String },
    #[snafu(display("Timezone `{tz}` is not a recognised IANA name"))]
    InvalidTimezone { tz: String },
    #[snafu(display("Relationship type is empty"))]
    RelTypeEmpty,
}

impl ValidateError {
    /// Stable machine-readable rejection code.
    pub fn code(&self) -> &'static str {
        match self {
            ValidateError::ReservedKey { .. } => "RESERVED_KEY",
            ValidateError::NestingTooDeep { .. } => "NESTING_TOO_DEEP",
            ValidateError::ListNotScalar { .. } => "LIST_NOT_SCALAR",
            ValidateError::ListTooLong { .. } => "LIMIT_EXCEEDED",
            ValidateError::FieldsExceeded { .. } => "LIMIT_EXCEEDED",
            ValidateError::NoteMissing => "NOTE_MISSING",
            ValidateError::UnknownRule { .. } => "UNKNOWN_RULE",
            ValidateError::InvalidTimezone { .. } => "INVALID_TIMEZONE",
            ValidateError::RelTypeEmpty => "REL_TYPE_EMPTY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> EntityId {
        EntityId::new(s).expect("valid id")
    }

    #[test]
    fn serde_uses_dotted_type_tags() {
        let p = Primitive::EntityCreate(EntityCreate {
            id: eid("grocery"),
            parent: ParentRef::Root,
            display: Some(DisplayHint::Table),
            props: Props::new(),
        });
        let json = serde_json::to_value(&p).expect("serializes");
        assert_eq!(json["type"], "entity.create");
        assert_eq!(json["payload"]["parent"], "root");

        let back: Primitive = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, p);
    }

    #[test]
    fn markers_have_no_payload() {
        let json = serde_json::to_value(Primitive::BatchStart).expect("serializes");
        assert_eq!(json, serde_json::json!({"type": "batch.start"}));
    }

    #[test]
    fn reserved_prop_keys_rejected() {
        let mut props = Props::new();
        props.insert("_removed".into(), PropValue::Bool(true));
        let p = Primitive::EntityUpdate(EntityUpdate {
            target: eid("a"),
            props,
        });
        let err = p.validate(&Limits::default()).expect_err("rejected");
        assert_eq!(err.code(), "RESERVED_KEY");
    }

    #[test]
    fn long_list_props_hard_reject_soft_warn() {
        let limits = Limits::default();

        let mut props = Props::new();
        props.insert(
            "tags".into(),
            PropValue::List(vec![PropValue::Number(0.0); limits.list_soft + 1]),
        );
        let p = Primitive::EntityUpdate(EntityUpdate {
            target: eid("a"),
            props: props.clone(),
        });
        let warnings = p.validate(&limits).expect("applies with warning");
        assert_eq!(warnings.len(), 1);

        props.insert(
            "tags".into(),
            PropValue::List(vec![PropValue::Number(0.0); limits.list_hard + 1]),
        );
        let p = Primitive::EntityUpdate(EntityUpdate {
            target: eid("a"),
            props,
        });
        let err = p.validate(&limits).expect_err("rejected");
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
    }

    #[test]
    fn bad_timezone_rejected() {
        let p = Primitive::MetaSet(MetaSet {
            timezone: Some("Moon/Crater".into()),
            ..MetaSet::default()
        });
        let err = p.validate(&Limits::default()).expect_err("rejected");
        assert_eq!(err.code(), "INVALID_TIMEZONE");
    }

    #[test]
    fn unknown_rule_rejected() {
        let p = Primitive::MetaConstrain(MetaConstrain {
            id: "c1".into(),
            rule: "regex".into(),
            value: None,
            message: None,
            scope: ConstraintScope::default(),
        });
        let err = p.validate(&Limits::default()).expect_err("rejected");
        assert_eq!(err.code(), "UNKNOWN_RULE");
    }

    #[test]
    fn missing_note_rejected() {
        let p = Primitive::MetaAnnotate(MetaAnnotate {
            note: "  ".into(),
            pinned: false,
        });
        let err = p.validate(&Limits::default()).expect_err("rejected");
        assert_eq!(err.code(), "NOTE_MISSING");
    }
}
