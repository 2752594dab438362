//! Expansion of completed tool calls into primitives.
//!
//! Two tool shapes mutate state (`mutate_entity`, `set_relationship`);
//! the signal tools map straight onto their signal primitives.

use serde::Deserialize;
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use aide_core::entity::{DisplayHint, EntityId, EntityIdError, ParentRef};
use aide_core::primitive::{
    Clarify, EntityCreate, EntityMove, EntityRemove, EntityReorder, EntityUpdate, Escalate,
    MetaConstrain, Primitive, RelRemove, RelSet, Voice,
};
use aide_core::prop::Props;
use aide_core::state::{Cardinality, ConstraintScope};

#[derive(Debug, Snafu)]
pub enum DecomposeError {
    #[snafu(display("Unknown tool `{name}`"))]
    UnknownTool { name: String },
    #[snafu(display("Tool `{name}` input is not valid JSON: {source}"))]
    BadInput {
        name: String,
        source: serde_json::Error,
    },
    #[snafu(display("Tool `{name}` has unknown action `{action}`"))]
    UnknownAction { name: String, action: String },
    #[snafu(display("Tool `{name}` action `{action}` is missing `{field}`"))]
    MissingField {
        name: String,
        action: String,
        field: &'static str,
    },
    #[snafu(display("Unknown display `{display}`"))]
    UnknownDisplay { display: String },
    #[snafu(transparent)]
    InvalidEntityId { source: EntityIdError },
    #[snafu(display("Unknown cardinality `{cardinality}`"))]
    UnknownCardinality { cardinality: String },
}

pub type DecomposeResult<T> = std::result::Result<T, DecomposeError>;

impl DecomposeError {
    /// Stable machine-readable code, same register as reducer codes.
    pub fn code(&self) -> &'static str {
        match self {
            DecomposeError::UnknownTool { .. } => "UNKNOWN_TOOL",
            DecomposeError::BadInput { .. } => "BAD_TOOL_JSON",
            DecomposeError::UnknownAction { .. } => "UNKNOWN_ACTION",
            DecomposeError::MissingField { .. } => "MISSING_FIELD",
            DecomposeError::UnknownDisplay { .. } => "UNKNOWN_DISPLAY",
            DecomposeError::InvalidEntityId { .. } => "INVALID_ENTITY_ID",
            DecomposeError::UnknownCardinality { .. } => "UNKNOWN_CARDINALITY",
        }
    }
}

#[derive(Debug, Deserialize)]
struct MutateEntityInput {
    action: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "ref", default)]
    target: Option<String>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    props: Option<Props>,
    #[serde(default)]
    position: Option<usize>,
    #[serde(default)]
    children: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SetRelationshipInput {
    action: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(rename = "type", default)]
    rel_type: Option<String>,
    #[serde(default)]
    cardinality: Option<String>,
    // Constrain-shaped extras.
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    value: Option<aide_core::prop::PropValue>,
    #[serde(default)]
    message: Option<String>,
}

/// Expand one buffered tool call into a primitive.
pub fn decompose_tool(name: &str, input_json: &str) -> DecomposeResult<Primitive> {
    // An empty input buffer means the model sent the tool with no
    // arguments at all; normalize to `{}` so the error talks about
    // missing fields, not JSON syntax.
    let input_json = if input_json.trim().is_empty() {
        "{}"
    } else {
        input_json
    };
    match name {
        "mutate_entity" => {
            let input: MutateEntityInput =
                serde_json::from_str(input_json).context(BadInputSnafu { name })?;
            mutate_entity(input)
        }
        "set_relationship" => {
            let input: SetRelationshipInput =
                serde_json::from_str(input_json).context(BadInputSnafu { name })?;
            set_relationship(input)
        }
        "voice" => {
            let voice: Voice = serde_json::from_str(input_json).context(BadInputSnafu { name })?;
            Ok(Primitive::Voice(voice))
        }
        "escalate" => {
            let escalate: Escalate =
                serde_json::from_str(input_json).context(BadInputSnafu { name })?;
            Ok(Primitive::Escalate(escalate))
        }
        "clarify" => {
            let clarify: Clarify =
                serde_json::from_str(input_json).context(BadInputSnafu { name })?;
            Ok(Primitive::Clarify(clarify))
        }
        "batch.start" | "batch_start" => Ok(Primitive::BatchStart),
        "batch.end" | "batch_end" => Ok(Primitive::BatchEnd),
        _ => UnknownToolSnafu { name }.fail(),
    }
}

fn mutate_entity(input: MutateEntityInput) -> DecomposeResult<Primitive> {
    const NAME: &str = "mutate_entity";
    let action = input.action.as_str();

    let required = |field: &'static str, value: &Option<String>| -> DecomposeResult<String> {
        value.clone().context(MissingFieldSnafu {
            name: NAME,
            action,
            field,
        })
    };

    match action {
        "create" => {
            let id = EntityId::new(required("id", &input.id)?)?;
            let parent = parse_parent(input.parent.as_deref())?;
            let display = input
                .display
                .as_deref()
                .map(parse_display)
                .transpose()?;
            Ok(Primitive::EntityCreate(EntityCreate {
                id,
                parent,
                display,
                props: input.props.unwrap_or_default(),
            }))
        }
        "update" => {
            // Models sometimes put the target in `id`; accept either.
            let target = input.target.or(input.id);
            let target = EntityId::new(required("ref", &target)?)?;
            Ok(Primitive::EntityUpdate(EntityUpdate {
                target,
                props: input.props.unwrap_or_default(),
            }))
        }
        "remove" => {
            let target = input.target.or(input.id);
            let target: ParentRef = required("ref", &target)?.parse()?;
            Ok(Primitive::EntityRemove(EntityRemove { target }))
        }
        "move" => {
            let target = input.target.or(input.id);
            let target: ParentRef = required("ref", &target)?.parse()?;
            let parent = parse_parent(Some(&required("parent", &input.parent)?))?;
            Ok(Primitive::EntityMove(EntityMove {
                target,
                parent,
                position: input.position,
            }))
        }
        "reorder" => {
            let target: ParentRef = input
                .target
                .or(input.id)
                .unwrap_or_else(|| "root".to_owned())
                .parse()?;
            let children = input.children.context(MissingFieldSnafu {
                name: NAME,
                action,
                field: "children",
            })?;
            let children = children
                .into_iter()
                .map(EntityId::new)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Primitive::EntityReorder(EntityReorder { target, children }))
        }
        _ => UnknownActionSnafu { name: NAME, action }.fail(),
    }
}

fn set_relationship(input: SetRelationshipInput) -> DecomposeResult<Primitive> {
    const NAME: &str = "set_relationship";
    let action = input.action.as_str();

    let required = |field: &'static str, value: &Option<String>| -> DecomposeResult<String> {
        value.clone().context(MissingFieldSnafu {
            name: NAME,
            action,
            field,
        })
    };

    match action {
        "set" => Ok(Primitive::RelSet(RelSet {
            from: EntityId::new(required("from", &input.from)?)?,
            to: EntityId::new(required("to", &input.to)?)?,
            rel_type: required("type", &input.rel_type)?,
            cardinality: input
                .cardinality
                .as_deref()
                .map(parse_cardinality)
                .transpose()?,
        })),
        "remove" => Ok(Primitive::RelRemove(RelRemove {
            from: EntityId::new(required("from", &input.from)?)?,
            to: EntityId::new(required("to", &input.to)?)?,
            rel_type: required("type", &input.rel_type)?,
        })),
        "constrain" => {
            let id = input
                .id
                .or_else(|| input.rel_type.clone())
                .context(MissingFieldSnafu {
                    name: NAME,
                    action,
                    field: "id",
                })?;
            let rule = input.rule.context(MissingFieldSnafu {
                name: NAME,
                action,
                field: "rule",
            })?;
            let scope = ConstraintScope {
                entity: input
                    .from
                    .map(EntityId::new)
                    .transpose()?,
                field: None,
            };
            Ok(Primitive::MetaConstrain(MetaConstrain {
                id,
                rule,
                value: input.value,
                message: input.message,
                scope,
            }))
        }
        _ => UnknownActionSnafu { name: NAME, action }.fail(),
    }
}

fn parse_parent(parent: Option<&str>) -> DecomposeResult<ParentRef> {
    match parent {
        None => Ok(ParentRef::Root),
        Some(s) => Ok(s.parse()?),
    }
}

fn parse_display(display: &str) -> DecomposeResult<DisplayHint> {
    display
        .parse()
        .ok()
        .context(UnknownDisplaySnafu { display })
}

fn parse_cardinality(cardinality: &str) -> DecomposeResult<Cardinality> {
    match cardinality {
        "many_to_one" => Ok(Cardinality::ManyToOne),
        "one_to_one" => Ok(Cardinality::OneToOne),
        "many_to_many" => Ok(Cardinality::ManyToMany),
        _ => UnknownCardinalitySnafu { cardinality }.fail(),
    }
}
