//! Assembly: the I/O-bound lifecycle of a page document.
//!
//! A page lives as one self-describing HTML document per store key. This
//! crate parses stored documents back into state + events + blueprint,
//! re-packs them, and handles create / fork / publish / compact /
//! integrity concerns. It never locks; the orchestrator guarantees one
//! writer per page.

pub mod store;


use std::sync::Arc;

use snafu::{Location, OptionExt as _, ResultExt as _, Snafu};
use tracing::{debug, warn};

use aide_core::entity::EntityId;
use aide_core::event::PageEvent;
use aide_core::id::PageId;
use aide_core::limits::{Limits, Warning};
use aide_core::primitive::Primitive;
use aide_core::reduce::{self, Outcome, ReduceError, ReplayError};
use aide_core::state::PageState;
use aide_core::{Actor, ActorTier, Sequence, Source, Timestamp};
use aide_util_error::FmtCompact as _;
use aide_render::{parse, Blueprint, ParseDocError, RenderOptions};

use crate::store::{Document, DocumentStore, StoreError};

const LOG_TARGET: &str = "aide::assembly";

/// Event-log length past which a published copy drops its log.
pub const PUBLISH_EVENT_STRIP_THRESHOLD: usize = 500;
/// Event-log length past which the workspace copy wants compaction.
pub const COMPACT_EVENT_THRESHOLD: usize = 500;
/// Packed-document size past which the workspace copy wants compaction.
pub const COMPACT_SIZE_THRESHOLD: usize = 200 * 1024;

pub const DEFAULT_SLUG_LEN: usize = 8;

const FREE_TIER_FOOTER: &str = "Made with AIde";

pub fn workspace_key(page_id: PageId) -> String {
    format!("pages/{page_id}.html")
}

pub fn public_key(slug: &str) -> String {
    format!("p/{slug}.html")
}

/// One loaded page: snapshot, log, blueprint and the packed form.
#[derive(Clone, Debug)]
pub struct AideFile {
    pub page_id: PageId,
    pub state: PageState,
    pub events: Vec<PageEvent>,
    pub blueprint: Blueprint,
    pub html: String,
    pub last_sequence: Sequence,
    pub byte_size: usize,
}

impl AideFile {
    /// Re-pack the document from the current state and log.
    pub fn render(&mut self) {
        self.html = aide_render::render(&self.state, &self.blueprint, &self.events);
        self.byte_size = self.html.len();
    }

    /// True once either compaction threshold is crossed.
    pub fn needs_compaction(&self) -> bool {
        COMPACT_EVENT_THRESHOLD < self.events.len() || COMPACT_SIZE_THRESHOLD < self.byte_size
    }
}

#[derive(Debug, Snafu)]
pub enum AssemblyError {
    #[snafu(display("Page `{page_id}` not found"))]
    PageNotFound { page_id: PageId },
    #[snafu(transparent)]
    ParseDoc { source: ParseDocError },
    #[snafu(display("Log does not replay: {source}"))]
    Replay { source: ReplayError },
    #[snafu(transparent)]
    Store {
        source: StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Save failed after retry"))]
    SaveFailed {
        source: StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Slug `{slug}` is not lowercase alphanumeric"))]
    SlugInvalid { slug: String },
    #[snafu(display("Custom slugs are a paid-tier feature"))]
    SlugNotAllowed,
}

pub type AssemblyResult<T> = std::result::Result<T, AssemblyError>;

/// Outcome of applying a batch of primitives to a file.
#[derive(Clone, Debug, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<PageEvent>,
    /// Wire-observable deltas, including cardinality-swap removals.
    pub deltas: Vec<PageEvent>,
    pub rejected: Vec<(Primitive, ReduceError)>,
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub slug: String,
    pub url: String,
}

pub struct Assembly {
    workspace: Arc<dyn DocumentStore>,
    public: Arc<dyn DocumentStore>,
    limits: Limits,
}

#[bon::bon]
impl Assembly {
    #[builder]
    pub fn new(
        workspace: Arc<dyn DocumentStore>,
        public: Arc<dyn DocumentStore>,
        limits: Option<Limits>,
    ) -> Self {
        Self {
            workspace,
            public,
            limits: limits.unwrap_or_default(),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Fetch and unpack a page document.
    ///
    /// A missing snapshot block is recovered by replaying the log; a
    /// missing log is fine (compacted or forked documents).
    pub async fn load(&self, page_id: PageId) -> AssemblyResult<AideFile> {
        let key = workspace_key(page_id);
        let document = self
            .workspace
            .get(&key)
            .await?
            .context(PageNotFoundSnafu { page_id })?;

        let parsed = parse(&document.body)?;
        let state = match parsed.snapshot {
            Some(state) => state,
            None => reduce::replay(&parsed.events, &self.limits).context(ReplaySnafu)?,
        };
        let last_sequence = derive_last_sequence(&state, &parsed.events);

        debug!(
            target: LOG_TARGET,
            page_id = %page_id,
            events = parsed.events.len(),
            last_sequence = %last_sequence,
            "Loaded page"
        );
        Ok(AideFile {
            page_id,
            state,
            events: parsed.events,
            blueprint: parsed.blueprint.unwrap_or_default(),
            byte_size: document.body.len(),
            html: document.body,
            last_sequence,
        })
    }

    /// A fresh page: empty state, blueprint embedded, rendered, unsaved.
    pub fn create(&self, blueprint: Blueprint) -> AideFile {
        let mut file = AideFile {
            page_id: PageId::generate(),
            state: PageState::new(),
            events: Vec::new(),
            blueprint,
            html: String::new(),
            last_sequence: Sequence::ZERO,
            byte_size: 0,
        };
        file.render();
        file
    }

    /// Stamp and reduce one primitive against the file.
    ///
    /// Signals and markers are ignored (`Ok(None)`); mutations either
    /// advance the file or come back as the rejection. Does not re-pack
    /// the document; `save` does.
    pub fn apply_one(
        &self,
        file: &mut AideFile,
        primitive: Primitive,
        actor: &str,
        source: Source,
    ) -> Result<Option<AppliedOne>, ReduceError> {
        if !primitive.is_mutation() {
            return Ok(None);
        }
        let event = PageEvent::builder()
            .sequence(file.last_sequence.next())
            .timestamp(Timestamp::now())
            .actor(actor)
            .source(source)
            .primitive(primitive)
            .build();
        match reduce::reduce(&file.state, &event, &self.limits) {
            Outcome::Applied {
                state,
                deltas,
                warnings,
            } => {
                file.state = state;
                file.last_sequence = event.sequence;
                file.events.push(event.clone());
                Ok(Some(AppliedOne {
                    event,
                    deltas,
                    warnings,
                }))
            }
            Outcome::Noop => Ok(None),
            Outcome::Rejected { error } => Err(error),
        }
    }

    /// Batch apply with partial progress, then re-pack if anything stuck.
    pub fn apply(
        &self,
        file: &mut AideFile,
        primitives: Vec<Primitive>,
        actor: &str,
        source: Source,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for primitive in primitives {
            match self.apply_one(file, primitive.clone(), actor, source) {
                Ok(Some(applied)) => {
                    outcome.applied.push(applied.event);
                    outcome.deltas.extend(applied.deltas);
                    outcome.warnings.extend(applied.warnings);
                }
                Ok(None) => {}
                Err(error) => outcome.rejected.push((primitive, error)),
            }
        }
        if !outcome.applied.is_empty() {
            file.render();
        }
        outcome
    }

    /// Atomic write of the packed document; one retry on failure.
    pub async fn save(&self, file: &mut AideFile) -> AssemblyResult<()> {
        file.render();
        let key = workspace_key(file.page_id);
        let document = Document::workspace_html(file.html.clone());

        if let Err(err) = self.workspace.put(&key, document.clone()).await {
            warn!(
                target: LOG_TARGET,
                page_id = %file.page_id,
                err = %err.fmt_compact(),
                "Save failed, retrying once"
            );
            self.workspace
                .put(&key, document)
                .await
                .context(SaveFailedSnafu)?;
        }
        Ok(())
    }

    pub async fn delete(&self, page_id: PageId) -> AssemblyResult<()> {
        self.workspace.delete(&workspace_key(page_id)).await?;
        Ok(())
    }

    /// Write a public copy: long logs stripped, free-tier footer, slug key.
    ///
    /// A custom slug is a paid-tier feature; everyone else gets a
    /// generated one. Use `republish` to refresh an already-assigned slug.
    pub async fn publish(
        &self,
        file: &AideFile,
        actor: &Actor,
        custom_slug: Option<String>,
    ) -> AssemblyResult<Published> {
        let slug = match custom_slug {
            Some(slug) => {
                if actor.tier != ActorTier::Paid {
                    return SlugNotAllowedSnafu.fail();
                }
                if slug.is_empty()
                    || !slug
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                {
                    return SlugInvalidSnafu { slug }.fail();
                }
                slug
            }
            None => generate_slug(DEFAULT_SLUG_LEN),
        };
        self.publish_as(file, actor, slug).await
    }

    /// Refresh the public copy under a slug this page already owns.
    pub async fn republish(
        &self,
        file: &AideFile,
        actor: &Actor,
        slug: &str,
    ) -> AssemblyResult<Published> {
        self.publish_as(file, actor, slug.to_owned()).await
    }

    async fn publish_as(
        &self,
        file: &AideFile,
        actor: &Actor,
        slug: String,
    ) -> AssemblyResult<Published> {
        let options = RenderOptions {
            omit_events: PUBLISH_EVENT_STRIP_THRESHOLD < file.events.len(),
            footer: (actor.tier == ActorTier::Free).then(|| FREE_TIER_FOOTER.to_owned()),
        };
        let body = aide_render::render_with(&file.state, &file.blueprint, &file.events, &options);
        self.public
            .put(&public_key(&slug), Document::public_html(body))
            .await?;

        debug!(target: LOG_TARGET, page_id = %file.page_id, slug, "Published page");
        Ok(Published {
            url: format!("/p/{slug}"),
            slug,
        })
    }

    /// Deep copy under a new page id, with the history left behind.
    pub async fn fork(&self, page_id: PageId) -> AssemblyResult<AideFile> {
        let source = self.load(page_id).await?;
        let mut state = source.state;
        for entity in state.entities.values_mut() {
            entity.created_seq = Sequence::ZERO;
            entity.updated_seq = Sequence::ZERO;
        }
        let mut file = AideFile {
            page_id: PageId::generate(),
            state,
            events: Vec::new(),
            blueprint: source.blueprint,
            html: String::new(),
            last_sequence: Sequence::ZERO,
            byte_size: 0,
        };
        file.render();
        Ok(file)
    }

    /// Drop prefix events, keeping the last `keep_recent`. The snapshot
    /// is unchanged; only history shrinks.
    pub fn compact(&self, file: &mut AideFile, keep_recent: usize) {
        if file.events.len() <= keep_recent {
            return;
        }
        let dropped = file.events.len() - keep_recent;
        file.events.drain(..dropped);
        file.render();
        debug!(
            target: LOG_TARGET,
            page_id = %file.page_id,
            dropped,
            kept = file.events.len(),
            "Compacted event log"
        );
    }

    /// Replay the log and cross-check the snapshot and references.
    pub fn check_integrity(&self, file: &AideFile) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        for pair in file.events.windows(2) {
            let (a, b) = (pair[0].sequence, pair[1].sequence);
            if b.0 != a.0 + 1 {
                report.sequence_gaps.push((a, b));
            }
        }

        // Replay only proves anything when the log is complete.
        let full_log = file
            .events
            .first()
            .is_some_and(|e| e.sequence == Sequence(1));
        if full_log {
            report.replay_matches =
                Some(match reduce::replay(&file.events, &self.limits) {
                    Ok(replayed) => replayed == file.state,
                    Err(_) => false,
                });
        }

        for entity in file.state.live_entities() {
            if !file.state.parent_exists(&entity.parent) {
                report.broken_parents.push(entity.id.clone());
            }
        }
        for rel in &file.state.relationships {
            for endpoint in [&rel.from, &rel.to] {
                if !file.state.entities.contains_key(endpoint)
                    && !report.broken_endpoints.contains(endpoint)
                {
                    report.broken_endpoints.push(endpoint.clone());
                }
            }
        }
        report
    }

    /// Rebuild the snapshot by replay and re-pack the document.
    pub fn repair(&self, file: &mut AideFile) -> AssemblyResult<()> {
        let full_log = file
            .events
            .first()
            .is_some_and(|e| e.sequence == Sequence(1));
        if full_log {
            file.state = reduce::replay(&file.events, &self.limits).context(ReplaySnafu)?;
            file.last_sequence = derive_last_sequence(&file.state, &file.events);
        }
        file.render();
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AppliedOne {
    pub event: PageEvent,
    pub deltas: Vec<PageEvent>,
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegrityReport {
    /// `None` when the log is partial (compacted/forked) and replay
    /// proves nothing.
    pub replay_matches: Option<bool>,
    pub sequence_gaps: Vec<(Sequence, Sequence)>,
    pub broken_parents: Vec<EntityId>,
    pub broken_endpoints: Vec<EntityId>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.replay_matches != Some(false)
            && self.sequence_gaps.is_empty()
            && self.broken_parents.is_empty()
            && self.broken_endpoints.is_empty()
    }
}

/// Highest sequence the page has seen, whether or not the log is whole.
fn derive_last_sequence(state: &PageState, events: &[PageEvent]) -> Sequence {
    let from_events = events.last().map(|e| e.sequence).unwrap_or(Sequence::ZERO);
    let from_state = state
        .entities
        .values()
        .map(|e| e.created_seq.max(e.updated_seq))
        .max()
        .unwrap_or(Sequence::ZERO);
    from_events.max(from_state)
}

fn generate_slug(len: usize) -> String {
    use rand::Rng as _;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}
