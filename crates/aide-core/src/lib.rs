pub mod entity;
pub mod event;
pub mod id;
pub mod limits;
mod macros;
pub mod primitive;
pub mod prop;
pub mod reduce;
pub mod registry;
pub mod state;


use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Monotonic per-page event counter.
///
/// Assigned when an event is stamped for application, starting at `1`.
/// `Sequence::ZERO` is the empty-page marker, never carried by an event.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wall-clock instant attached to events and annotations.
///
/// Always comes from the event envelope, never from a clock read inside
/// the reducer, so reduction stays a pure function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct Timestamp(#[serde(with = "time::serde::rfc3339")] pub time::OffsetDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(time::OffsetDateTime::now_utc())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.format(&time::format_description::well_known::Rfc3339) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// The authenticated caller, handed in from outside the kernel.
///
/// The kernel has no authority over session identity; it only carries
/// the actor through events and flight records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub tier: ActorTier,
}

impl Actor {
    pub fn new(id: impl Into<String>, tier: ActorTier) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorTier {
    #[default]
    Free,
    Paid,
}

/// Where a mutation originated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Web,
    Signal,
    Api,
    System,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Web => "web",
            Source::Signal => "signal",
            Source::Api => "api",
            Source::System => "system",
        };
        f.write_str(s)
    }
}

/// Model invocation level.
///
/// `L2` compiler, `L3` architect, `L4` analyst. Ordering matters:
/// escalation only ever jumps to a strictly higher level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub enum TierLevel {
    L2,
    L3,
    L4,
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TierLevel::L2 => "L2",
            TierLevel::L3 => "L3",
            TierLevel::L4 => "L4",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Unknown tier `{name}`"))]
pub struct TierLevelParseError {
    name: String,
}

impl FromStr for TierLevel {
    type Err = TierLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L2" | "l2" => Ok(TierLevel::L2),
            "L3" | "l3" => Ok(TierLevel::L3),
            "L4" | "l4" => Ok(TierLevel::L4),
            _ => Err(TierLevelParseError { name: s.into() }),
        }
    }
}
