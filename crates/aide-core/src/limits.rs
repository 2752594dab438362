//! Per-page capacity limits.
//!
//! Soft breaches surface as warnings on the reduction; hard breaches
//! reject the offending primitive with `LIMIT_EXCEEDED`.

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Entities,
    Fields,
    Children,
    Sections,
    ListProps,
    Depth,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftLimit {
    pub kind: LimitKind,
    pub value: usize,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
}

/// A non-fatal observation attached to an applied reduction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    SoftLimit(SoftLimit),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub entities_soft: usize,
    pub entities_hard: usize,
    pub fields_soft: usize,
    pub fields_hard: usize,
    pub children_soft: usize,
    pub children_hard: usize,
    pub sections_soft: usize,
    pub sections_hard: usize,
    pub list_soft: usize,
    pub list_hard: usize,
    pub depth_soft: usize,
    pub depth_hard: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            entities_soft: 200,
            entities_hard: 500,
            fields_soft: 15,
            fields_hard: 20,
            children_soft: 50,
            children_hard: 150,
            sections_soft: 4,
            sections_hard: 8,
            list_soft: 20,
            list_hard: 50,
            depth_soft: 2,
            depth_hard: 3,
        }
    }
}

impl Limits {
    /// Soft-limit check helper: pushes a warning when `value` crosses
    /// `soft` (but not `hard`, which the caller rejects separately).
    pub(crate) fn soft_check(
        warnings: &mut Vec<Warning>,
        kind: LimitKind,
        value: usize,
        soft: usize,
        entity: Option<&EntityId>,
    ) {
        if soft < value {
            warnings.push(Warning::SoftLimit(SoftLimit {
                kind,
                value,
                limit: soft,
                entity: entity.cloned(),
            }));
        }
    }
}
