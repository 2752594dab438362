//! The tier seam: three model-invocation levels behind one interface.
//!
//! A tier takes a request and returns the raw transport byte stream;
//! `aide-stream` does the decoding. Concrete provider transports live
//! outside the kernel; tests script the stream directly.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use aide_core::TierLevel;

pub type TierStream = Pin<Box<dyn Stream<Item = io::Result<bytes::Bytes>> + Send>>;

#[derive(Clone, Debug, PartialEq)]
pub struct TierRequest {
    pub level: TierLevel,
    pub model: String,
    pub system_prompt: String,
    pub user_message: String,
    /// The packed page document the model reads as context.
    pub page_html: String,
    /// Focused context carried over from an escalation.
    pub focus: Option<String>,
}

#[async_trait]
pub trait Tier: Send + Sync {
    async fn call(&self, request: TierRequest) -> io::Result<TierStream>;
}

#[derive(Clone)]
pub struct TierEntry {
    pub tier: Arc<dyn Tier>,
    pub model: String,
    pub system_prompt: String,
    /// Shadow model invoked after the production call, if configured.
    pub shadow: Option<(Arc<dyn Tier>, String)>,
}

/// The configured tiers, keyed by level.
#[derive(Clone)]
pub struct TierSet {
    tiers: BTreeMap<TierLevel, TierEntry>,
    timeouts: BTreeMap<TierLevel, Duration>,
    default_timeout: Duration,
}

impl TierSet {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tiers: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            default_timeout,
        }
    }

    pub fn insert(&mut self, level: TierLevel, entry: TierEntry) -> &mut Self {
        self.tiers.insert(level, entry);
        self
    }

    pub fn with_timeout(&mut self, level: TierLevel, timeout: Duration) -> &mut Self {
        self.timeouts.insert(level, timeout);
        self
    }

    pub fn get(&self, level: TierLevel) -> Option<&TierEntry> {
        self.tiers.get(&level)
    }

    pub fn timeout_for(&self, level: TierLevel) -> Duration {
        self.timeouts
            .get(&level)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// The next strictly-higher configured level, for escalations.
    pub fn next_above(&self, level: TierLevel) -> Option<TierLevel> {
        self.tiers
            .keys()
            .copied()
            .find(|candidate| level < *candidate)
    }
}

impl std::fmt::Debug for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierSet")
            .field("levels", &self.tiers.keys().collect::<Vec<_>>())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
