//! Enumeration of every primitive the kernel understands.
//!
//! The decomposer and the test suite look primitives up by their dotted
//! name; the table is the single place a new primitive gets registered.

use crate::primitive::PrimitiveKind;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveSpec {
    pub name: &'static str,
    pub kind: PrimitiveKind,
}

pub const REGISTRY: &[PrimitiveSpec] = &[
    PrimitiveSpec {
        name: "entity.create",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "entity.update",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "entity.remove",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "entity.move",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "entity.reorder",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "rel.set",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "rel.remove",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "style.set",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "style.entity",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "meta.set",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "meta.annotate",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "meta.constrain",
        kind: PrimitiveKind::Mutation,
    },
    PrimitiveSpec {
        name: "voice",
        kind: PrimitiveKind::Signal,
    },
    PrimitiveSpec {
        name: "escalate",
        kind: PrimitiveKind::Signal,
    },
    PrimitiveSpec {
        name: "clarify",
        kind: PrimitiveKind::Signal,
    },
    PrimitiveSpec {
        name: "batch.start",
        kind: PrimitiveKind::Marker,
    },
    PrimitiveSpec {
        name: "batch.end",
        kind: PrimitiveKind::Marker,
    },
];

pub fn lookup(name: &str) -> Option<&'static PrimitiveSpec> {
    REGISTRY.iter().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        assert_eq!(
            lookup("entity.create").map(|s| s.kind),
            Some(PrimitiveKind::Mutation)
        );
        assert_eq!(lookup("voice").map(|s| s.kind), Some(PrimitiveKind::Signal));
        assert_eq!(lookup("entity.explode"), None);
    }

    #[test]
    fn registry_covers_every_primitive() {
        // One spec per enum variant; duplicates would shadow each other.
        let mut names: Vec<_> = REGISTRY.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), REGISTRY.len());
        assert_eq!(REGISTRY.len(), 17);
    }
}
