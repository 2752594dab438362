//! The materialized page state: a rooted tree of entities plus
//! relationships, annotations, constraints and styles.

use std::collections::BTreeMap;
use std::str::FromStr as _;

use serde::{Deserialize, Serialize};

use crate::entity::{DisplayHint, Entity, EntityId, ParentRef};
use crate::prop::Props;
use crate::Timestamp;

/// Snapshot format version embedded in every stored document.
pub const STATE_VERSION: u32 = 3;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub title: String,
    /// Voice/topic string the tiers write in.
    #[serde(default)]
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ManyToOne,
    OneToOne,
    ManyToMany,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from: EntityId,
    pub to: EntityId,
    #[serde(rename = "type")]
    pub rel_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub note: String,
    #[serde(default)]
    pub pinned: bool,
    pub timestamp: Timestamp,
}

/// Closed set of constraint rules a page may declare.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintRule {
    Required,
    Unique,
    MinValue,
    MaxValue,
    AllowedValues,
    MaxChildren,
    Immutable,
}

impl ConstraintRule {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "required" => Some(Self::Required),
            "unique" => Some(Self::Unique),
            "min_value" => Some(Self::MinValue),
            "max_value" => Some(Self::MaxValue),
            "allowed_values" => Some(Self::AllowedValues),
            "max_children" => Some(Self::MaxChildren),
            "immutable" => Some(Self::Immutable),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ConstraintScope {
    pub fn is_empty(&self) -> bool {
        self.entity.is_none() && self.field.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub rule: ConstraintRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<crate::prop::PropValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "ConstraintScope::is_empty")]
    pub scope: ConstraintScope,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub entities: BTreeMap<EntityId, Entity>,
    /// Order of the root's direct children.
    #[serde(default)]
    pub root_children: Vec<EntityId>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub relationship_types: BTreeMap<String, Cardinality>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub styles: Props,
    pub version: u32,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            meta: PageMeta::default(),
            entities: BTreeMap::new(),
            root_children: Vec::new(),
            relationships: Vec::new(),
            relationship_types: BTreeMap::new(),
            annotations: Vec::new(),
            constraints: Vec::new(),
            styles: Props::new(),
            version: STATE_VERSION,
        }
    }
}

impl PageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn live_entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id).filter(|e| e.is_live())
    }

    pub fn live_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| e.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.live_entities().count()
    }

    /// Whether the parent reference resolves to the root or a live entity.
    pub fn parent_exists(&self, parent: &ParentRef) -> bool {
        match parent {
            ParentRef::Root => true,
            ParentRef::Entity(id) => self.live_entity(id).is_some(),
        }
    }

    /// Child order under `parent`, removed children included.
    pub fn children_of(&self, parent: &ParentRef) -> &[EntityId] {
        match parent {
            ParentRef::Root => &self.root_children,
            ParentRef::Entity(id) => self
                .entities
                .get(id)
                .map(|e| e.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    /// Live children under `parent`, in child order.
    pub fn live_children_of(&self, parent: &ParentRef) -> Vec<&Entity> {
        self.children_of(parent)
            .iter()
            .filter_map(|id| self.live_entity(id))
            .collect()
    }

    /// Walks the parent chain of `id`; true if `ancestor` is on it.
    pub fn is_ancestor(&self, ancestor: &EntityId, id: &EntityId) -> bool {
        let mut cursor = self.entities.get(id).map(|e| &e.parent);
        while let Some(parent) = cursor {
            match parent {
                ParentRef::Root => return false,
                ParentRef::Entity(pid) => {
                    if pid == ancestor {
                        return true;
                    }
                    cursor = self.entities.get(pid).map(|e| &e.parent);
                }
            }
        }
        false
    }

    /// Nesting depth: root children sit at depth 1.
    pub fn depth_of(&self, parent: &ParentRef) -> usize {
        let mut depth = 1;
        let mut cursor = parent;
        while let ParentRef::Entity(id) = cursor {
            depth += 1;
            match self.entities.get(id) {
                Some(e) => cursor = &e.parent,
                None => break,
            }
        }
        depth
    }

    /// Height of the live subtree rooted at `id` (1 for a leaf).
    pub fn subtree_height(&self, id: &EntityId) -> usize {
        let parent = ParentRef::Entity(id.clone());
        1 + self
            .live_children_of(&parent)
            .iter()
            .map(|c| self.subtree_height(&c.id))
            .max()
            .unwrap_or(0)
    }

    /// Live root children rendered as sections.
    pub fn section_count(&self) -> usize {
        self.live_children_of(&ParentRef::Root)
            .iter()
            .filter(|e| e.display == Some(DisplayHint::Section))
            .count()
    }

    pub fn relationships_from<'s>(
        &'s self,
        from: &'s EntityId,
        rel_type: &'s str,
    ) -> impl Iterator<Item = &'s Relationship> {
        self.relationships
            .iter()
            .filter(move |r| &r.from == from && r.rel_type == rel_type)
    }

    pub fn relationships_to<'s>(
        &'s self,
        to: &'s EntityId,
        rel_type: &'s str,
    ) -> impl Iterator<Item = &'s Relationship> {
        self.relationships
            .iter()
            .filter(move |r| &r.to == to && r.rel_type == rel_type)
    }

    pub fn has_edge(&self, from: &EntityId, to: &EntityId, rel_type: &str) -> bool {
        self.relationships
            .iter()
            .any(|r| &r.from == from && &r.to == to && r.rel_type == rel_type)
    }
}

/// IANA timezone check used at the primitive boundary.
pub fn is_valid_timezone(tz: &str) -> bool {
    chrono_tz::Tz::from_str(tz).is_ok()
}
