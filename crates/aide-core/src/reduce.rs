//! The reducer: a pure total function from `(state, event)` to a new
//! state plus the deltas observable on the wire.
//!
//! No I/O, no clock reads; timestamps and sequences come from the event.
//! Rejections leave the state untouched and carry a stable code.

use std::collections::BTreeSet;

use snafu::Snafu;
use tracing::trace;

use crate::entity::{DisplayHint, Entity, EntityId, EntityState, ParentRef};
use crate::event::PageEvent;
use crate::limits::{LimitKind, Limits, Warning};
use crate::primitive::{Primitive, RelRemove, ValidateError};
use crate::prop::merge_props;
use crate::state::{Annotation, Cardinality, Constraint, PageState, Relationship};
use crate::Sequence;

const LOG_TARGET: &str = "aide::reduce";

#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub))]
pub enum ReduceError {
    #[snafu(transparent)]
    Validate { source: ValidateError },
    #[snafu(display("Entity id `{id}` already exists"))]
    IdAlreadyExists { id: EntityId },
    #[snafu(display("Parent `{parent}` not found"))]
    ParentNotFound { parent: ParentRef },
    #[snafu(display("Entity `{id}` not found"))]
    EntityNotFound { id: EntityId },
    #[snafu(display("Entity `{id}` is removed"))]
    EntityRemoved { id: EntityId },
    #[snafu(display("The root cannot be removed or moved"))]
    RootImmutable,
    #[snafu(display("Moving `{id}` under `{parent}` would create a cycle"))]
    Cycle { id: EntityId, parent: EntityId },
    #[snafu(display("Children are not a permutation of the live children of `{parent}`"))]
    NotAPermutation { parent: ParentRef },
    #[snafu(display("Relationship endpoint `{id}` not found"))]
    EndpointNotFound { id: EntityId },
    #[snafu(display(
        "Relationship type `{rel_type}` is registered as {registered:?}, not {requested:?}"
    ))]
    CardinalityConflict {
        rel_type: String,
        registered: Cardinality,
        requested: Cardinality,
    },
    #[snafu(display("No `{rel_type}` edge from `{from}` to `{to}`"))]
    EdgeNotFound {
        from: EntityId,
        to: EntityId,
        rel_type: String,
    },
    #[snafu(display("{kind:?} limit exceeded: {value} over hard limit {limit}"))]
    LimitExceeded {
        kind: LimitKind,
        value: usize,
        limit: usize,
    },
}

impl ReduceError {
    /// Stable machine-readable rejection code.
    pub fn code(&self) -> &'static str {
        match self {
            ReduceError::Validate { source } => source.code(),
            ReduceError::IdAlreadyExists { .. } => "ID_ALREADY_EXISTS",
            ReduceError::ParentNotFound { .. } => "PARENT_NOT_FOUND",
            ReduceError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            ReduceError::EntityRemoved { .. } => "ENTITY_REMOVED",
            ReduceError::RootImmutable => "ROOT_IMMUTABLE",
            ReduceError::Cycle { .. } => "CYCLE",
            ReduceError::NotAPermutation { .. } => "NOT_A_PERMUTATION",
            ReduceError::EndpointNotFound { .. } => "ENDPOINT_NOT_FOUND",
            ReduceError::CardinalityConflict { .. } => "CARDINALITY_CONFLICT",
            ReduceError::EdgeNotFound { .. } => "EDGE_NOT_FOUND",
            ReduceError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
        }
    }
}

pub type ReduceResult<T> = std::result::Result<T, ReduceError>;

/// Result of reducing a single event.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Applied {
        state: PageState,
        /// Wire-observable events in emission order: cardinality-swap
        /// removals synthesized inside the same atomic step come first,
        /// then the applied event itself. Only the applied event enters
        /// the log.
        deltas: Vec<PageEvent>,
        warnings: Vec<Warning>,
    },
    /// Signals and markers: reducer no-op, surfaced elsewhere.
    Noop,
    Rejected {
        error: ReduceError,
    },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }

    fn rejected(error: ReduceError) -> Self {
        Outcome::Rejected { error }
    }
}

/// Batch application with partial progress: rejection of event *k* does
/// not skip the events after it.
#[derive(Clone, Debug, Default)]
pub struct Applied {
    pub state: PageState,
    pub applied: Vec<PageEvent>,
    /// Wire-observable events, superset of `applied`, in order.
    pub deltas: Vec<PageEvent>,
    pub rejected: Vec<(PageEvent, ReduceError)>,
    pub warnings: Vec<Warning>,
}

pub fn apply(state: &PageState, events: &[PageEvent], limits: &Limits) -> Applied {
    let mut out = Applied {
        state: state.clone(),
        ..Applied::default()
    };
    for event in events {
        match reduce(&out.state, event, limits) {
            Outcome::Applied {
                state,
                deltas,
                warnings,
            } => {
                out.state = state;
                out.applied.push(event.clone());
                out.deltas.extend(deltas);
                out.warnings.extend(warnings);
            }
            Outcome::Noop => {}
            Outcome::Rejected { error } => {
                trace!(
                    target: LOG_TARGET,
                    sequence = %event.sequence,
                    primitive = event.primitive.name(),
                    code = error.code(),
                    "Rejected event"
                );
                out.rejected.push((event.clone(), error));
            }
        }
    }
    out
}

#[derive(Debug, Snafu, Clone, PartialEq)]
pub enum ReplayError {
    #[snafu(display("Event {sequence} rejected during replay: {source}"))]
    Rejected {
        sequence: Sequence,
        source: ReduceError,
    },
}

/// Rebuild state by folding the whole log over the empty state.
///
/// A log written by this kernel contains only applied events, so any
/// rejection here means the log is corrupt.
pub fn replay(events: &[PageEvent], limits: &Limits) -> Result<PageState, ReplayError> {
    let mut state = PageState::new();
    for event in events {
        match reduce(&state, event, limits) {
            Outcome::Applied { state: next, .. } => state = next,
            Outcome::Noop => {}
            Outcome::Rejected { error } => {
                return Err(ReplayError::Rejected {
                    sequence: event.sequence,
                    source: error,
                });
            }
        }
    }
    Ok(state)
}

pub fn reduce(state: &PageState, event: &PageEvent, limits: &Limits) -> Outcome {
    if !event.primitive.is_mutation() {
        return Outcome::Noop;
    }

    let warnings = match event.primitive.validate(limits) {
        Ok(warnings) => warnings,
        Err(source) => return Outcome::rejected(ReduceError::Validate { source }),
    };

    let mut next = state.clone();
    let mut swap_removals = Vec::new();
    let result = match &event.primitive {
        Primitive::EntityCreate(p) => reduce_create(&mut next, p, event.sequence, limits),
        Primitive::EntityUpdate(p) => reduce_update(&mut next, p, event.sequence, limits),
        Primitive::EntityRemove(p) => reduce_remove(&mut next, p, event.sequence),
        Primitive::EntityMove(p) => reduce_move(&mut next, p, event.sequence, limits),
        Primitive::EntityReorder(p) => reduce_reorder(&mut next, p, event.sequence),
        Primitive::RelSet(p) => reduce_rel_set(&mut next, p, &mut swap_removals),
        Primitive::RelRemove(p) => reduce_rel_remove(&mut next, p),
        Primitive::StyleSet(p) => {
            merge_props(&mut next.styles, &p.props);
            Ok(Vec::new())
        }
        Primitive::StyleEntity(p) => reduce_style_entity(&mut next, p, event.sequence),
        Primitive::MetaSet(p) => {
            if let Some(title) = &p.title {
                next.meta.title = title.clone();
            }
            if let Some(identity) = &p.identity {
                next.meta.identity = identity.clone();
            }
            if let Some(timezone) = &p.timezone {
                next.meta.timezone = Some(timezone.clone());
            }
            if let Some(visibility) = p.visibility {
                next.meta.visibility = visibility;
            }
            Ok(Vec::new())
        }
        Primitive::MetaAnnotate(p) => {
            next.annotations.push(Annotation {
                note: p.note.clone(),
                pinned: p.pinned,
                timestamp: event.timestamp,
            });
            Ok(Vec::new())
        }
        Primitive::MetaConstrain(p) => reduce_constrain(&mut next, p),
        Primitive::Voice(_)
        | Primitive::Escalate(_)
        | Primitive::Clarify(_)
        | Primitive::BatchStart
        | Primitive::BatchEnd => unreachable!("filtered above"),
    };

    match result {
        Ok(more_warnings) => {
            let mut all_warnings = warnings;
            all_warnings.extend(more_warnings);

            let mut deltas: Vec<PageEvent> = swap_removals
                .into_iter()
                .map(|rel| {
                    PageEvent::builder()
                        .sequence(event.sequence)
                        .timestamp(event.timestamp)
                        .actor(event.actor.clone())
                        .source(event.source)
                        .primitive(Primitive::RelRemove(rel))
                        .build()
                })
                .collect();
            deltas.push(event.clone());

            Outcome::Applied {
                state: next,
                deltas,
                warnings: all_warnings,
            }
        }
        Err(error) => Outcome::rejected(error),
    }
}

fn reduce_create(
    state: &mut PageState,
    p: &crate::primitive::EntityCreate,
    seq: Sequence,
    limits: &Limits,
) -> ReduceResult<Vec<Warning>> {
    if state.entities.contains_key(&p.id) {
        return IdAlreadyExistsSnafu { id: p.id.clone() }.fail();
    }
    if !state.parent_exists(&p.parent) {
        return ParentNotFoundSnafu {
            parent: p.parent.clone(),
        }
        .fail();
    }

    let total = state.entities.len() + 1;
    if limits.entities_hard < total {
        return LimitExceededSnafu {
            kind: LimitKind::Entities,
            value: total,
            limit: limits.entities_hard,
        }
        .fail();
    }
    let siblings = state.live_children_of(&p.parent).len() + 1;
    if limits.children_hard < siblings {
        return LimitExceededSnafu {
            kind: LimitKind::Children,
            value: siblings,
            limit: limits.children_hard,
        }
        .fail();
    }
    let depth = state.depth_of(&p.parent);
    if limits.depth_hard < depth {
        return LimitExceededSnafu {
            kind: LimitKind::Depth,
            value: depth,
            limit: limits.depth_hard,
        }
        .fail();
    }
    let is_section = p.parent.is_root() && p.display == Some(DisplayHint::Section);
    let sections = state.section_count() + usize::from(is_section);
    if limits.sections_hard < sections {
        return LimitExceededSnafu {
            kind: LimitKind::Sections,
            value: sections,
            limit: limits.sections_hard,
        }
        .fail();
    }

    let mut warnings = Vec::new();
    Limits::soft_check(
        &mut warnings,
        LimitKind::Entities,
        total,
        limits.entities_soft,
        None,
    );
    Limits::soft_check(
        &mut warnings,
        LimitKind::Children,
        siblings,
        limits.children_soft,
        p.parent.as_entity(),
    );
    Limits::soft_check(
        &mut warnings,
        LimitKind::Depth,
        depth,
        limits.depth_soft,
        Some(&p.id),
    );
    if is_section {
        Limits::soft_check(
            &mut warnings,
            LimitKind::Sections,
            sections,
            limits.sections_soft,
            None,
        );
    }

    state.entities.insert(
        p.id.clone(),
        Entity {
            id: p.id.clone(),
            parent: p.parent.clone(),
            display: p.display,
            props: p.props.clone(),
            styles: Default::default(),
            state: EntityState::Live,
            created_seq: seq,
            updated_seq: seq,
            children: Vec::new(),
        },
    );
    children_mut(state, &p.parent).push(p.id.clone());
    Ok(warnings)
}

fn reduce_update(
    state: &mut PageState,
    p: &crate::primitive::EntityUpdate,
    seq: Sequence,
    limits: &Limits,
) -> ReduceResult<Vec<Warning>> {
    let merged_fields = {
        let entity = live_entity(state, &p.target)?;
        let existing: BTreeSet<&String> = entity.props.keys().collect();
        existing.union(&p.props.keys().collect()).count()
    };
    if limits.fields_hard < merged_fields {
        return LimitExceededSnafu {
            kind: LimitKind::Fields,
            value: merged_fields,
            limit: limits.fields_hard,
        }
        .fail();
    }
    let mut warnings = Vec::new();
    Limits::soft_check(
        &mut warnings,
        LimitKind::Fields,
        merged_fields,
        limits.fields_soft,
        Some(&p.target),
    );

    let entity = state
        .entities
        .get_mut(&p.target)
        .expect("Checked existence above");
    merge_props(&mut entity.props, &p.props);
    entity.updated_seq = seq;
    Ok(warnings)
}

fn reduce_remove(
    state: &mut PageState,
    p: &crate::primitive::EntityRemove,
    seq: Sequence,
) -> ReduceResult<Vec<Warning>> {
    let id = match &p.target {
        ParentRef::Root => return RootImmutableSnafu.fail(),
        ParentRef::Entity(id) => id,
    };
    live_entity(state, id)?;
    let entity = state.entities.get_mut(id).expect("Checked existence above");
    entity.state = EntityState::Removed;
    entity.updated_seq = seq;
    Ok(Vec::new())
}

fn reduce_move(
    state: &mut PageState,
    p: &crate::primitive::EntityMove,
    seq: Sequence,
    limits: &Limits,
) -> ReduceResult<Vec<Warning>> {
    let id = match &p.target {
        ParentRef::Root => return RootImmutableSnafu.fail(),
        ParentRef::Entity(id) => id.clone(),
    };
    let old_parent = live_entity(state, &id)?.parent.clone();
    if !state.parent_exists(&p.parent) {
        return ParentNotFoundSnafu {
            parent: p.parent.clone(),
        }
        .fail();
    }
    if let Some(new_parent) = p.parent.as_entity() {
        if *new_parent == id || state.is_ancestor(&id, new_parent) {
            return CycleSnafu {
                id,
                parent: new_parent.clone(),
            }
            .fail();
        }
    }

    let new_depth = state.depth_of(&p.parent) + state.subtree_height(&id) - 1;
    if limits.depth_hard < new_depth {
        return LimitExceededSnafu {
            kind: LimitKind::Depth,
            value: new_depth,
            limit: limits.depth_hard,
        }
        .fail();
    }

    let mut warnings = Vec::new();
    let parent_changed = old_parent != p.parent;
    if parent_changed {
        let siblings = state.live_children_of(&p.parent).len() + 1;
        if limits.children_hard < siblings {
            return LimitExceededSnafu {
                kind: LimitKind::Children,
                value: siblings,
                limit: limits.children_hard,
            }
            .fail();
        }
        Limits::soft_check(
            &mut warnings,
            LimitKind::Children,
            siblings,
            limits.children_soft,
            p.parent.as_entity(),
        );
    }
    Limits::soft_check(
        &mut warnings,
        LimitKind::Depth,
        new_depth,
        limits.depth_soft,
        Some(&id),
    );

    // Splice out of the old parent, in at the requested live position.
    children_mut(state, &old_parent).retain(|c| *c != id);
    let insert_idx = live_insert_index(state, &p.parent, p.position);
    children_mut(state, &p.parent).insert(insert_idx, id.clone());

    let entity = state
        .entities
        .get_mut(&id)
        .expect("Checked existence above");
    entity.parent = p.parent.clone();
    entity.updated_seq = seq;
    Ok(warnings)
}

fn reduce_reorder(
    state: &mut PageState,
    p: &crate::primitive::EntityReorder,
    seq: Sequence,
) -> ReduceResult<Vec<Warning>> {
    if let Some(id) = p.target.as_entity() {
        live_entity(state, id)?;
    }

    let current = state.children_of(&p.target).to_vec();
    let live: Vec<EntityId> = current
        .iter()
        .filter(|c| state.live_entity(c).is_some())
        .cloned()
        .collect();

    let given: BTreeSet<&EntityId> = p.children.iter().collect();
    let expected: BTreeSet<&EntityId> = live.iter().collect();
    if p.children.len() != live.len() || given != expected {
        return NotAPermutationSnafu {
            parent: p.target.clone(),
        }
        .fail();
    }

    // Removed children keep their relative order, tucked after the
    // permuted live ones; they are invisible either way.
    let mut next_children = p.children.clone();
    next_children.extend(
        current
            .iter()
            .filter(|c| state.live_entity(c).is_none())
            .cloned(),
    );
    *children_mut(state, &p.target) = next_children;

    if let Some(id) = p.target.as_entity() {
        let entity = state.entities.get_mut(id).expect("Checked existence above");
        entity.updated_seq = seq;
    }
    Ok(Vec::new())
}

fn reduce_rel_set(
    state: &mut PageState,
    p: &crate::primitive::RelSet,
    swap_removals: &mut Vec<RelRemove>,
) -> ReduceResult<Vec<Warning>> {
    for endpoint in [&p.from, &p.to] {
        if !state.entities.contains_key(endpoint) {
            return EndpointNotFoundSnafu {
                id: endpoint.clone(),
            }
            .fail();
        }
    }

    let cardinality = match state.relationship_types.get(&p.rel_type) {
        Some(registered) => {
            if let Some(requested) = p.cardinality {
                if requested != *registered {
                    return CardinalityConflictSnafu {
                        rel_type: p.rel_type.clone(),
                        registered: *registered,
                        requested,
                    }
                    .fail();
                }
            }
            *registered
        }
        None => {
            let cardinality = p.cardinality.unwrap_or(Cardinality::ManyToMany);
            state
                .relationship_types
                .insert(p.rel_type.clone(), cardinality);
            cardinality
        }
    };

    // Cardinality-appropriate replacement, atomic with the insertion.
    let evict = |r: &Relationship| -> bool {
        if r.rel_type != p.rel_type {
            return false;
        }
        if r.from == p.from && r.to == p.to {
            return false;
        }
        match cardinality {
            Cardinality::ManyToOne => r.from == p.from,
            Cardinality::OneToOne => r.from == p.from || r.to == p.to,
            Cardinality::ManyToMany => false,
        }
    };
    for rel in state.relationships.iter().filter(|r| evict(r)) {
        swap_removals.push(RelRemove {
            from: rel.from.clone(),
            to: rel.to.clone(),
            rel_type: rel.rel_type.clone(),
        });
    }
    state.relationships.retain(|r| !evict(r));

    if !state.has_edge(&p.from, &p.to, &p.rel_type) {
        state.relationships.push(Relationship {
            from: p.from.clone(),
            to: p.to.clone(),
            rel_type: p.rel_type.clone(),
        });
    }
    Ok(Vec::new())
}

fn reduce_rel_remove(
    state: &mut PageState,
    p: &crate::primitive::RelRemove,
) -> ReduceResult<Vec<Warning>> {
    let idx = state
        .relationships
        .iter()
        .position(|r| r.from == p.from && r.to == p.to && r.rel_type == p.rel_type);
    match idx {
        Some(idx) => {
            state.relationships.remove(idx);
            Ok(Vec::new())
        }
        None => EdgeNotFoundSnafu {
            from: p.from.clone(),
            to: p.to.clone(),
            rel_type: p.rel_type.clone(),
        }
        .fail(),
    }
}

fn reduce_style_entity(
    state: &mut PageState,
    p: &crate::primitive::StyleEntity,
    seq: Sequence,
) -> ReduceResult<Vec<Warning>> {
    live_entity(state, &p.target)?;
    let entity = state
        .entities
        .get_mut(&p.target)
        .expect("Checked existence above");
    merge_props(&mut entity.styles, &p.props);
    entity.updated_seq = seq;
    Ok(Vec::new())
}

fn reduce_constrain(
    state: &mut PageState,
    p: &crate::primitive::MetaConstrain,
) -> ReduceResult<Vec<Warning>> {
    let rule = p.parsed_rule().expect("Validated before reduction");
    let constraint = Constraint {
        id: p.id.clone(),
        rule,
        value: p.value.clone(),
        message: p.message.clone(),
        scope: p.scope.clone(),
    };
    match state.constraints.iter_mut().find(|c| c.id == p.id) {
        Some(existing) => *existing = constraint,
        None => state.constraints.push(constraint),
    }
    Ok(Vec::new())
}

fn live_entity<'s>(state: &'s PageState, id: &EntityId) -> ReduceResult<&'s Entity> {
    match state.entities.get(id) {
        None => EntityNotFoundSnafu { id: id.clone() }.fail(),
        Some(e) if e.state.is_removed() => EntityRemovedSnafu { id: id.clone() }.fail(),
        Some(e) => Ok(e),
    }
}

fn children_mut<'s>(state: &'s mut PageState, parent: &ParentRef) -> &'s mut Vec<EntityId> {
    match parent {
        ParentRef::Root => &mut state.root_children,
        ParentRef::Entity(id) => {
            &mut state
                .entities
                .get_mut(id)
                .expect("Caller resolved the parent")
                .children
        }
    }
}

/// Map a position among live children onto an index in the full child
/// vector (which may contain removed entries).
fn live_insert_index(state: &PageState, parent: &ParentRef, position: Option<usize>) -> usize {
    let children = state.children_of(parent);
    let Some(position) = position else {
        return children.len();
    };
    let mut live_seen = 0;
    for (idx, child) in children.iter().enumerate() {
        if state.live_entity(child).is_some() {
            if live_seen == position {
                return idx;
            }
            live_seen += 1;
        }
    }
    children.len()
}
