//! Entities: the nodes of the page tree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::prop::Props;
use crate::Sequence;

/// Sentinel naming the page root in parent references.
pub const ROOT: &str = "root";

/// Maximum length of an entity id, in bytes.
pub const MAX_ENTITY_ID_LEN: usize = 64;

/// Stable entity identifier: lowercase, `a-z0-9_`, ≤64 chars, unique
/// within a page. The `root` sentinel is not a valid entity id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(String);

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum EntityIdError {
    #[snafu(display("Entity id is empty"))]
    Empty,
    #[snafu(display("Entity id `{id}` is longer than {MAX_ENTITY_ID_LEN} chars"))]
    TooLong { id: String },
    #[snafu(display("Entity id `{id}` contains `{ch}`; only a-z, 0-9 and _ are allowed"))]
    BadChar { id: String, ch: char },
    #[snafu(display("`root` is reserved"))]
    Reserved,
}

impl EntityId {
    pub fn new(id: impl Into<String>) -> Result<Self, EntityIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(EntityIdError::Empty);
        }
        if MAX_ENTITY_ID_LEN < id.len() {
            return Err(EntityIdError::TooLong { id });
        }
        if let Some(ch) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
        {
            return Err(EntityIdError::BadChar { id, ch });
        }
        if id == ROOT {
            return Err(EntityIdError::Reserved);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for EntityId {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// A parent reference: either the root sentinel or another entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParentRef {
    Root,
    Entity(EntityId),
}

impl ParentRef {
    pub fn as_entity(&self) -> Option<&EntityId> {
        match self {
            ParentRef::Root => None,
            ParentRef::Entity(id) => Some(id),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, ParentRef::Root)
    }
}

impl From<EntityId> for ParentRef {
    fn from(id: EntityId) -> Self {
        ParentRef::Entity(id)
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentRef::Root => f.write_str(ROOT),
            ParentRef::Entity(id) => id.fmt(f),
        }
    }
}

impl FromStr for ParentRef {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ROOT {
            Ok(ParentRef::Root)
        } else {
            Ok(ParentRef::Entity(EntityId::new(s)?))
        }
    }
}

impl Serialize for ParentRef {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ParentRef {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Render hint, drawn from a closed set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayHint {
    Page,
    Section,
    Card,
    List,
    Table,
    Checklist,
    Metric,
    Text,
    Image,
    Row,
}

impl DisplayHint {
    pub const ALL: &'static [DisplayHint] = &[
        DisplayHint::Page,
        DisplayHint::Section,
        DisplayHint::Card,
        DisplayHint::List,
        DisplayHint::Table,
        DisplayHint::Checklist,
        DisplayHint::Metric,
        DisplayHint::Text,
        DisplayHint::Image,
        DisplayHint::Row,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DisplayHint::Page => "page",
            DisplayHint::Section => "section",
            DisplayHint::Card => "card",
            DisplayHint::List => "list",
            DisplayHint::Table => "table",
            DisplayHint::Checklist => "checklist",
            DisplayHint::Metric => "metric",
            DisplayHint::Text => "text",
            DisplayHint::Image => "image",
            DisplayHint::Row => "row",
        }
    }
}

impl fmt::Display for DisplayHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Unknown display `{name}`"))]
pub struct DisplayHintParseError {
    pub name: String,
}

impl FromStr for DisplayHint {
    type Err = DisplayHintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DisplayHint::ALL
            .iter()
            .copied()
            .find(|d| d.name() == s)
            .ok_or_else(|| DisplayHintParseError { name: s.into() })
    }
}

/// Soft-delete state. Removed entities stay addressable so undo and
/// history keep working, but are invisible to the renderer and to
/// child iteration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EntityState {
    #[default]
    Live,
    Removed,
}

impl EntityState {
    pub fn is_live(&self) -> bool {
        matches!(self, EntityState::Live)
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, EntityState::Removed)
    }
}

// `_removed` is a plain bool in stored snapshots.
impl Serialize for EntityState {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_bool(self.is_removed())
    }
}

impl<'de> Deserialize<'de> for EntityState {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(if bool::deserialize(d)? {
            EntityState::Removed
        } else {
            EntityState::Live
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub parent: ParentRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayHint>,
    #[serde(default, skip_serializing_if = "Props::is_empty")]
    pub props: Props,
    #[serde(
        rename = "_styles",
        default,
        skip_serializing_if = "Props::is_empty"
    )]
    pub styles: Props,
    #[serde(
        rename = "_removed",
        default,
        skip_serializing_if = "EntityState::is_live"
    )]
    pub state: EntityState,
    #[serde(rename = "_created_seq")]
    pub created_seq: Sequence,
    #[serde(rename = "_updated_seq")]
    pub updated_seq: Sequence,
    /// Child order, authoritative. Appends on create, splices on move,
    /// permutations on reorder. May contain removed children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<EntityId>,
}

impl Entity {
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }
}
