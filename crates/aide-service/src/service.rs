//! The per-turn orchestrator.
//!
//! One turn: acquire the page's writer lock, load fresh, stream a tier
//! call, decompose, validate+reduce each primitive as it completes,
//! fan deltas out, honor escalations, save, record. Partial state is
//! still correct state: an interrupted stream keeps everything applied
//! so far.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt as _;
use snafu::Snafu;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use aide_assembly::{AideFile, Assembly, AssemblyError};
use aide_core::entity::EntityId;
use aide_core::id::{PageId, TurnId};
use aide_core::primitive::{EntityUpdate, Escalate, Primitive};
use aide_core::prop::{PropValue, Props};
use aide_core::state::Visibility;
use aide_core::{Actor, Source, TierLevel, Timestamp};
use aide_render::Blueprint;
use aide_stream::{StreamItem, StreamParser};
use aide_util_error::FmtCompact as _;

use crate::delivery::{ClientFrame, ServerFrame, Subscriptions, TurnDiagnostic};
use crate::recorder::{FlightRecord, FlightRecorder, ModelCall};
use crate::page_lock::PageLocks;
use crate::tier::{TierEntry, TierRequest, TierSet};
use crate::LOG_TARGET;

/// Events kept per page when a turn triggers compaction.
pub const COMPACT_KEEP_RECENT: usize = 100;

const SOFT_LIMIT_CODE: &str = "SOFT_LIMIT";

#[derive(Debug, Snafu)]
pub enum TurnError {
    #[snafu(display("Service is draining, no new turns"))]
    ShuttingDown,
    #[snafu(display("No tier configured for {level}"))]
    TierUnavailable { level: TierLevel },
    #[snafu(display("A direct edit needs an existing page"))]
    PageRequired,
    #[snafu(transparent)]
    Assembly { source: AssemblyError },
}

pub type TurnResult<T> = std::result::Result<T, TurnError>;

/// What a finished turn looked like from the outside.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub page_id: PageId,
    pub applied_count: usize,
    pub diagnostics: Vec<TurnDiagnostic>,
    pub escalations: u32,
    /// Set when the stream was cut short (timeout, transport failure).
    /// Primitives applied before the cut were kept and saved.
    pub interrupted: Option<String>,
}

pub struct Service {
    assembly: Arc<Assembly>,
    tiers: TierSet,
    subscriptions: Arc<Subscriptions>,
    recorder: Arc<FlightRecorder>,
    page_locks: PageLocks,
    slugs: Mutex<HashMap<PageId, String>>,
    default_blueprint: Blueprint,
    default_visibility: Visibility,
    draining: AtomicBool,
    in_flight: Arc<InFlight>,
}

#[bon::bon]
impl Service {
    #[builder]
    pub fn new(
        assembly: Arc<Assembly>,
        tiers: TierSet,
        recorder: Arc<FlightRecorder>,
        subscriptions: Option<Arc<Subscriptions>>,
        default_blueprint: Option<Blueprint>,
        default_visibility: Option<Visibility>,
    ) -> Self {
        Self {
            assembly,
            tiers,
            subscriptions: subscriptions.unwrap_or_default(),
            recorder,
            page_locks: PageLocks::new(),
            slugs: Mutex::new(HashMap::new()),
            default_blueprint: default_blueprint.unwrap_or_default(),
            default_visibility: default_visibility.unwrap_or_default(),
            draining: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
        }
    }
}

impl Service {
    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.subscriptions
    }

    /// Attach a client to a page: snapshot replay first, live after.
    pub async fn subscribe(
        &self,
        page_id: PageId,
    ) -> TurnResult<tokio::sync::mpsc::Receiver<ServerFrame>> {
        let file = self.assembly.load(page_id).await?;
        Ok(self.subscriptions.subscribe(page_id, &file.state))
    }

    /// One user message: the full LOAD → STREAM → APPLY → SAVE turn.
    ///
    /// With no `page_id` a page is created first and the turn continues
    /// on it; the outcome carries the new id.
    #[instrument(name = "turn", skip(self, content), fields(actor = %actor.id))]
    pub async fn handle_message(
        &self,
        actor: &Actor,
        page_id: Option<PageId>,
        content: &str,
        source: Source,
    ) -> TurnResult<TurnOutcome> {
        if self.draining.load(Ordering::SeqCst) {
            return ShuttingDownSnafu.fail();
        }
        let _in_flight = InFlightGuard::enter(&self.in_flight);

        // Lock before load; every turn starts from freshly-loaded state.
        let (mut file, _guard) = match page_id {
            Some(page_id) => {
                let guard = self.page_locks.acquire(page_id).await;
                let file = match self.assembly.load(page_id).await {
                    Ok(file) => file,
                    Err(err) => {
                        self.subscriptions.broadcast(
                            page_id,
                            &ServerFrame::Error {
                                message: "Could not load the page".into(),
                            },
                        );
                        return Err(err.into());
                    }
                };
                (file, guard)
            }
            None => {
                let file = self.assembly.create(self.default_blueprint.clone());
                let guard = self.page_locks.acquire(file.page_id).await;
                (file, guard)
            }
        };

        let mut turn = Turn::new(file.page_id, actor, source, content, &file);
        if page_id.is_none() && self.default_visibility != Visibility::Private {
            // Default visibility is an event like any other mutation.
            let set = Primitive::MetaSet(aide_core::primitive::MetaSet {
                visibility: Some(self.default_visibility),
                ..Default::default()
            });
            turn.emitted.push(set.clone());
            self.apply_primitive(&mut turn, &mut file, set);
        }

        self.send(&mut turn, ServerFrame::StreamStart);
        let tier_error = self.run_tier_calls(&mut turn, &mut file, content).await;
        let outcome = self.finish_turn(turn, file, actor).await?;
        match tier_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Dispatch one decoded client frame to its turn path.
    ///
    /// The wire transport that carries frames is out of scope; whatever
    /// it is, it decodes `ClientFrame`s and hands them here.
    pub async fn handle_client_frame(
        &self,
        actor: &Actor,
        page_id: Option<PageId>,
        frame: ClientFrame,
    ) -> TurnResult<TurnOutcome> {
        match frame {
            ClientFrame::Message {
                content,
                message_id,
            } => {
                debug!(target: LOG_TARGET, message_id, "Client message");
                self.handle_message(actor, page_id, &content, Source::Web)
                    .await
            }
            ClientFrame::DirectEdit {
                entity_id,
                field,
                value,
            } => {
                let Some(page_id) = page_id else {
                    return PageRequiredSnafu.fail();
                };
                self.handle_direct_edit(actor, page_id, entity_id, field, value)
                    .await
            }
        }
    }

    /// A direct edit from the page UI: a synthetic single-primitive
    /// turn following the same path as model-emitted mutations.
    #[instrument(name = "direct-edit", skip(self, value), fields(actor = %actor.id))]
    pub async fn handle_direct_edit(
        &self,
        actor: &Actor,
        page_id: PageId,
        entity_id: EntityId,
        field: String,
        value: PropValue,
    ) -> TurnResult<TurnOutcome> {
        if self.draining.load(Ordering::SeqCst) {
            return ShuttingDownSnafu.fail();
        }
        let _in_flight = InFlightGuard::enter(&self.in_flight);

        let _guard = self.page_locks.acquire(page_id).await;
        let mut file = self.assembly.load(page_id).await?;

        let mut props = Props::new();
        props.insert(field.clone(), value);
        let primitive = Primitive::EntityUpdate(EntityUpdate {
            target: entity_id.clone(),
            props,
        });

        let mut turn = Turn::new(page_id, actor, Source::Web, "", &file);
        turn.emitted.push(primitive.clone());
        let applied = self.apply_primitive(&mut turn, &mut file, primitive);
        if applied {
            self.send(
                &mut turn,
                ServerFrame::DirectEditAck {
                    entity_id,
                    field,
                },
            );
        } else {
            let message = turn
                .diagnostics
                .last()
                .map(|d| d.detail.clone())
                .unwrap_or_default();
            self.send(&mut turn, ServerFrame::DirectEditError { entity_id, message });
        }
        self.finish_turn(turn, file, actor).await
    }

    /// Drain: accept no new turns, let in-flight turns finalize, flush
    /// the recorder.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        info!(target: LOG_TARGET, "Draining");
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        self.recorder.shutdown().await;
        info!(target: LOG_TARGET, "Drained");
    }

    fn select_tier(file: &AideFile) -> TierLevel {
        // First contact and empty pages get the analyst; routine edits
        // go to the architect. L2 is reserved for explicit demotion.
        if file.state.live_count() == 0 {
            TierLevel::L4
        } else {
            TierLevel::L3
        }
    }

    async fn run_tier_calls(
        &self,
        turn: &mut Turn,
        file: &mut AideFile,
        content: &str,
    ) -> Option<TurnError> {
        let mut level = Self::select_tier(file);
        let mut focus: Option<String> = None;

        loop {
            let Some(entry) = self.tiers.get(level).cloned() else {
                // Missing the first tier is a configuration fault; a
                // missing escalation target just ends the turn.
                if turn.model_calls.is_empty() {
                    turn.interrupted = Some(format!("No tier configured for {level}"));
                    return Some(TurnError::TierUnavailable { level });
                }
                return None;
            };

            file.render();
            let request = TierRequest {
                level,
                model: entry.model.clone(),
                system_prompt: entry.system_prompt.clone(),
                user_message: content.to_owned(),
                page_html: file.html.clone(),
                focus: focus.take(),
            };
            self.run_one_call(turn, file, &entry, request).await;

            match turn.pending_escalation.take() {
                Some(escalate) if turn.interrupted.is_none() => {
                    let target = escalate
                        .tier
                        .filter(|t| level < *t)
                        .or_else(|| self.tiers.next_above(level));
                    let Some(target) = target else {
                        warn!(
                            target: LOG_TARGET,
                            from = %level,
                            reason = %escalate.reason,
                            "Escalation requested but no higher tier exists"
                        );
                        return None;
                    };
                    info!(
                        target: LOG_TARGET,
                        from = %level,
                        to = %target,
                        reason = %escalate.reason,
                        "Escalating"
                    );
                    turn.escalations += 1;
                    level = target;
                    focus = escalate.extract;
                }
                _ => return None,
            }
        }
    }

    async fn run_one_call(
        &self,
        turn: &mut Turn,
        file: &mut AideFile,
        entry: &TierEntry,
        request: TierRequest,
    ) {
        let level = request.level;
        let timeout = self.tiers.timeout_for(level);
        let call_started = Instant::now();
        let deadline = call_started + timeout;
        let prompt = call_prompt(&request);
        turn.response_text.clear();
        let primitives_before = turn.emitted.len();

        let mut stream = match entry.tier.call(request).await {
            Ok(stream) => stream,
            Err(err) => {
                turn.interrupted = Some(format!("{level} call failed to start"));
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), %level, "Tier call failed");
                turn.push_model_call(level, entry, prompt, call_started, primitives_before);
                return;
            }
        };

        let mut parser = StreamParser::new();
        let mut done = false;
        while !done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let items = match tokio::time::timeout(remaining, stream.next()).await {
                Err(_elapsed) => {
                    turn.interrupted =
                        Some(format!("{level} call timed out after {}s", timeout.as_secs()));
                    parser.finish()
                }
                Ok(None) => {
                    done = true;
                    parser.finish()
                }
                Ok(Some(Err(err))) => {
                    turn.interrupted = Some(format!("{level} stream failed mid-turn"));
                    warn!(target: LOG_TARGET, err = %err.fmt_compact(), %level, "Stream error");
                    parser.finish()
                }
                Ok(Some(Ok(bytes))) => parser.push(&bytes),
            };
            for item in items {
                if matches!(item, StreamItem::StreamEnd) {
                    done = true;
                }
                self.process_item(turn, file, item);
            }
            if turn.interrupted.is_some() {
                break;
            }
        }

        turn.push_model_call(level, entry, prompt, call_started, primitives_before);
    }

    fn process_item(
        &self,
        turn: &mut Turn,
        file: &mut AideFile,
        item: StreamItem,
    ) {
        match item {
            StreamItem::Voice(text) => {
                turn.response_text.push_str(&text);
                turn.response_text.push('\n');
                self.send(turn, ServerFrame::Voice { text });
            }
            StreamItem::Primitive(primitive) => {
                turn.emitted.push(primitive.clone());
                self.apply_primitive(turn, file, primitive);
            }
            StreamItem::Escalate(escalate) => {
                turn.pending_escalation = Some(escalate);
            }
            StreamItem::Clarify(clarify) => {
                self.send(
                    turn,
                    ServerFrame::Clarify {
                        prompt: clarify.prompt,
                        options: clarify.options,
                    },
                );
            }
            StreamItem::BatchStart => {
                turn.batch_buf = Some(Vec::new());
            }
            StreamItem::BatchEnd => {
                if let Some(frames) = turn.batch_buf.take() {
                    for frame in frames {
                        self.subscriptions.broadcast(turn.page_id, &frame);
                    }
                }
            }
            StreamItem::ParseError { code, detail, raw } => {
                debug!(target: LOG_TARGET, code, detail, raw, "Skipping malformed block");
                turn.diagnostics.push(TurnDiagnostic {
                    code: code.into(),
                    primitive: String::new(),
                    detail,
                });
            }
            StreamItem::StreamEnd => {}
        }
    }

    /// Validate and reduce one mutation; broadcast its deltas in order.
    fn apply_primitive(
        &self,
        turn: &mut Turn,
        file: &mut AideFile,
        primitive: Primitive,
    ) -> bool {
        let name = primitive.name();
        match self
            .assembly
            .apply_one(file, primitive, &turn.actor, turn.source)
        {
            Ok(Some(applied)) => {
                turn.applied_count += 1;
                for warning in &applied.warnings {
                    turn.diagnostics.push(TurnDiagnostic {
                        code: SOFT_LIMIT_CODE.into(),
                        primitive: name.into(),
                        detail: format!("{warning:?}"),
                    });
                }
                for delta in applied.deltas {
                    self.send(turn, ServerFrame::Delta { event: delta });
                }
                true
            }
            Ok(None) => true,
            Err(error) => {
                debug!(
                    target: LOG_TARGET,
                    code = error.code(),
                    primitive = name,
                    "Rejected primitive"
                );
                turn.rejected_count += 1;
                turn.diagnostics.push(TurnDiagnostic {
                    code: error.code().into(),
                    primitive: name.into(),
                    detail: error.to_string(),
                });
                false
            }
        }
    }

    /// A frame goes straight out, unless a batch is being collected.
    fn send(&self, turn: &mut Turn, frame: ServerFrame) {
        match &mut turn.batch_buf {
            Some(buf) => buf.push(frame),
            None => self.subscriptions.broadcast(turn.page_id, &frame),
        }
    }

    /// FINALIZE → SAVE → PUBLISH? → RECORD.
    async fn finish_turn(
        &self,
        mut turn: Turn,
        mut file: AideFile,
        actor: &Actor,
    ) -> TurnResult<TurnOutcome> {
        // An unclosed batch still reaches subscribers.
        if let Some(frames) = turn.batch_buf.take() {
            for frame in frames {
                self.subscriptions.broadcast(turn.page_id, &frame);
            }
        }
        if !turn.diagnostics.is_empty() {
            let frame = ServerFrame::Diagnostics {
                errors: turn.diagnostics.clone(),
            };
            self.subscriptions.broadcast(turn.page_id, &frame);
        }
        if let Some(message) = &turn.interrupted {
            self.subscriptions.broadcast(
                turn.page_id,
                &ServerFrame::Error {
                    message: message.clone(),
                },
            );
        }
        self.subscriptions
            .broadcast(turn.page_id, &ServerFrame::StreamEnd);

        let mut save_error = None;
        if 0 < turn.applied_count {
            if file.needs_compaction() {
                self.assembly.compact(&mut file, COMPACT_KEEP_RECENT);
            }
            match self.assembly.save(&mut file).await {
                Ok(()) => {
                    if file.state.meta.visibility == Visibility::Public {
                        self.publish(&file, actor).await;
                    }
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        page_id = %turn.page_id,
                        err = %err.fmt_compact(),
                        "Save failed; discarding in-memory state"
                    );
                    self.subscriptions.broadcast(
                        turn.page_id,
                        &ServerFrame::Error {
                            message: "Could not save the page".into(),
                        },
                    );
                    save_error = Some(err);
                }
            }
        }

        let outcome = TurnOutcome {
            turn_id: turn.turn_id,
            page_id: turn.page_id,
            applied_count: turn.applied_count,
            diagnostics: turn.diagnostics.clone(),
            escalations: turn.escalations,
            interrupted: turn.interrupted.clone(),
        };
        self.record_turn(turn, &file, actor);

        match save_error {
            Some(err) => Err(err.into()),
            None => Ok(outcome),
        }
    }

    async fn publish(&self, file: &AideFile, actor: &Actor) {
        let existing = self
            .slugs
            .lock()
            .expect("Locking failed")
            .get(&file.page_id)
            .cloned();
        let result = match existing {
            Some(slug) => self.assembly.republish(file, actor, &slug).await,
            None => self.assembly.publish(file, actor, None).await,
        };
        match result {
            Ok(published) => {
                self.slugs
                    .lock()
                    .expect("Locking failed")
                    .insert(file.page_id, published.slug);
            }
            Err(err) => {
                // Publishing is best-effort; the workspace copy is saved.
                warn!(
                    target: LOG_TARGET,
                    page_id = %file.page_id,
                    err = %err.fmt_compact(),
                    "Publish failed"
                );
            }
        }
    }

    /// Enqueue the flight record; if a shadow tier is configured for
    /// the last level used, run it first on a detached task so the
    /// user-visible path never waits for it. The task carries its own
    /// in-flight token: a drain waits for the enqueue, not just the turn.
    fn record_turn(&self, turn: Turn, file: &AideFile, _actor: &Actor) {
        let shadow = turn
            .model_calls
            .last()
            .map(|call| call.tier)
            .and_then(|level| self.tiers.get(level))
            .and_then(|entry| {
                entry
                    .shadow
                    .clone()
                    .map(|(tier, model)| (tier, model, entry.system_prompt.clone()))
            });

        let mut record = FlightRecord {
            turn_id: turn.turn_id,
            page_id: turn.page_id,
            actor: turn.actor,
            source: turn.source,
            started_at: turn.started_at,
            user_message: turn.user_message,
            snapshot_before: turn.snapshot_before,
            snapshot_after: file.state.clone(),
            model_calls: turn.model_calls,
            primitives: turn.emitted,
            applied_count: turn.applied_count,
            rejected_count: turn.rejected_count,
            total_latency_ms: turn.started.elapsed().as_millis() as u64,
        };

        let Some((shadow_tier, shadow_model, system_prompt)) = shadow else {
            self.recorder.enqueue(record);
            return;
        };

        let recorder = self.recorder.clone();
        let request = TierRequest {
            level: record
                .model_calls
                .last()
                .map(|c| c.tier)
                .unwrap_or(TierLevel::L4),
            model: shadow_model.clone(),
            system_prompt,
            user_message: record.user_message.clone(),
            page_html: file.html.clone(),
            focus: None,
        };
        let token = InFlightGuard::enter(&self.in_flight);
        tokio::spawn(async move {
            let call = run_shadow_call(shadow_tier, shadow_model, request).await;
            record.model_calls.push(call);
            recorder.enqueue(record);
            drop(token);
        });
    }
}

/// Consume a shadow stream off the hot path: primitives and text are
/// collected for the record, applied nowhere, broadcast to no one.
async fn run_shadow_call(
    tier: Arc<dyn crate::tier::Tier>,
    model: String,
    request: TierRequest,
) -> ModelCall {
    let level = request.level;
    let prompt = call_prompt(&request);
    let started = Instant::now();
    let mut primitives = Vec::new();
    let mut response_text = String::new();

    match tier.call(request).await {
        Ok(mut stream) => {
            let mut parser = StreamParser::new();
            let mut handle = |items: Vec<StreamItem>| {
                for item in items {
                    match item {
                        StreamItem::Voice(text) => {
                            response_text.push_str(&text);
                            response_text.push('\n');
                        }
                        StreamItem::Primitive(primitive) => primitives.push(primitive),
                        _ => {}
                    }
                }
            };
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => handle(parser.push(&bytes)),
                    Err(err) => {
                        debug!(target: LOG_TARGET, err = %err.fmt_compact(), "Shadow stream error");
                        break;
                    }
                }
            }
            handle(parser.finish());
        }
        Err(err) => {
            debug!(target: LOG_TARGET, err = %err.fmt_compact(), "Shadow call failed");
        }
    }

    ModelCall {
        tier: level,
        model,
        prompt,
        response_text,
        input_tokens: None,
        output_tokens: None,
        latency_ms: started.elapsed().as_millis() as u64,
        shadow: true,
        primitives,
    }
}

fn call_prompt(request: &TierRequest) -> String {
    match &request.focus {
        Some(focus) => format!("{}\n[focus] {focus}", request.user_message),
        None => request.user_message.clone(),
    }
}

/// Everything a turn accumulates while its stream runs.
struct Turn {
    turn_id: TurnId,
    page_id: PageId,
    actor: String,
    source: Source,
    user_message: String,
    started: Instant,
    started_at: Timestamp,
    snapshot_before: aide_core::state::PageState,
    emitted: Vec<Primitive>,
    diagnostics: Vec<TurnDiagnostic>,
    model_calls: Vec<ModelCall>,
    applied_count: usize,
    rejected_count: usize,
    escalations: u32,
    response_text: String,
    batch_buf: Option<Vec<ServerFrame>>,
    pending_escalation: Option<Escalate>,
    interrupted: Option<String>,
}

impl Turn {
    fn new(
        page_id: PageId,
        actor: &Actor,
        source: Source,
        user_message: &str,
        file: &AideFile,
    ) -> Self {
        Self {
            turn_id: TurnId::generate(),
            page_id,
            actor: actor.id.clone(),
            source,
            user_message: user_message.to_owned(),
            started: Instant::now(),
            started_at: Timestamp::now(),
            snapshot_before: file.state.clone(),
            emitted: Vec::new(),
            diagnostics: Vec::new(),
            model_calls: Vec::new(),
            applied_count: 0,
            rejected_count: 0,
            escalations: 0,
            response_text: String::new(),
            batch_buf: None,
            pending_escalation: None,
            interrupted: None,
        }
    }

    fn push_model_call(
        &mut self,
        level: TierLevel,
        entry: &TierEntry,
        prompt: String,
        started: Instant,
        primitives_before: usize,
    ) {
        self.model_calls.push(ModelCall {
            tier: level,
            model: entry.model.clone(),
            prompt,
            response_text: std::mem::take(&mut self.response_text),
            input_tokens: None,
            output_tokens: None,
            latency_ms: started.elapsed().as_millis() as u64,
            shadow: false,
            primitives: self.emitted[primitives_before..].to_vec(),
        });
    }
}

/// Work the drain must wait for: turns, and the detached tasks a turn
/// leaves behind (shadow recording).
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: tokio::sync::Notify,
}

/// Owning token; `shutdown` cannot complete while one is alive.
struct InFlightGuard {
    inner: Arc<InFlight>,
}

impl InFlightGuard {
    fn enter(inner: &Arc<InFlight>) -> Self {
        inner.count.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.count.fetch_sub(1, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
    }
}
