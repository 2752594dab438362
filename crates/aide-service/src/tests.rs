use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use aide_assembly::store::MemoryStore;
use aide_assembly::Assembly;
use aide_core::entity::{DisplayHint, EntityId};
use aide_core::primitive::{EntityCreate, Primitive};
use aide_core::prop::{PropValue, Props};
use aide_core::{Actor, ActorTier, Sequence, Source, TierLevel};
use aide_render::Blueprint;

use crate::delivery::{ClientFrame, ServerFrame};
use crate::recorder::{FlightRecorder, MemorySink};
use crate::service::{Service, TurnError};
use crate::tier::{Tier, TierEntry, TierRequest, TierSet, TierStream};

fn eid(s: &str) -> EntityId {
    EntityId::new(s).expect("valid id")
}

fn actor() -> Actor {
    Actor::new("user_1", ActorTier::Free)
}

// --- transport script helpers -------------------------------------------

fn line(value: serde_json::Value) -> Vec<u8> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}

fn text_block(text: &str) -> Vec<u8> {
    let mut bytes = line(serde_json::json!({
        "type": "content_block_start", "content_block": {"type": "text"}
    }));
    bytes.extend(line(serde_json::json!({
        "type": "content_block_delta", "delta": {"type": "text_delta", "text": text}
    })));
    bytes.extend(line(serde_json::json!({"type": "content_block_stop"})));
    bytes
}

fn tool_block(name: &str, input: serde_json::Value) -> Vec<u8> {
    let mut bytes = line(serde_json::json!({
        "type": "content_block_start", "content_block": {"type": "tool_use", "name": name}
    }));
    bytes.extend(line(serde_json::json!({
        "type": "content_block_delta",
        "delta": {"type": "input_json_delta", "partial_json": input.to_string()}
    })));
    bytes.extend(line(serde_json::json!({"type": "content_block_stop"})));
    bytes
}

fn message_stop() -> Vec<u8> {
    line(serde_json::json!({"type": "message_stop"}))
}

fn create_tool(id: &str, parent: &str, display: &str, props: serde_json::Value) -> Vec<u8> {
    tool_block(
        "mutate_entity",
        serde_json::json!({
            "action": "create", "id": id, "parent": parent,
            "display": display, "props": props
        }),
    )
}

// --- scripted tiers ------------------------------------------------------

#[derive(Default)]
struct TierProbe {
    seen: Mutex<Vec<TierRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard(Arc<TierProbe>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

type Script = Box<dyn Fn(&TierRequest) -> Vec<io::Result<Bytes>> + Send + Sync>;

struct ScriptedTier {
    script: Script,
    chunk_delay: Duration,
    /// Never finish the stream after the scripted chunks.
    stall_after: bool,
    probe: Arc<TierProbe>,
}

impl ScriptedTier {
    fn new(script: impl Fn(&TierRequest) -> Vec<io::Result<Bytes>> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            chunk_delay: Duration::ZERO,
            stall_after: false,
            probe: Arc::new(TierProbe::default()),
        }
    }

    fn fixed(chunks: Vec<Vec<u8>>) -> Self {
        Self::new(move |_| chunks.iter().cloned().map(Bytes::from).map(Ok).collect())
    }
}

struct ScriptState {
    chunks: VecDeque<io::Result<Bytes>>,
    delay: Duration,
    stall: bool,
    _guard: ActiveGuard,
}

#[async_trait]
impl Tier for ScriptedTier {
    async fn call(&self, request: TierRequest) -> io::Result<TierStream> {
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(active, Ordering::SeqCst);
        let chunks = (self.script)(&request);
        self.probe
            .seen
            .lock()
            .expect("Locking failed")
            .push(request);

        let state = ScriptState {
            chunks: chunks.into(),
            delay: self.chunk_delay,
            stall: self.stall_after,
            _guard: ActiveGuard(self.probe.clone()),
        };
        Ok(Box::pin(futures::stream::unfold(state, |mut state| async {
            if let Some(chunk) = state.chunks.pop_front() {
                if !state.delay.is_zero() {
                    tokio::time::sleep(state.delay).await;
                }
                return Some((chunk, state));
            }
            if state.stall {
                futures::future::pending::<()>().await;
            }
            None
        })))
    }
}

fn entry(tier: ScriptedTier, model: &str) -> (TierEntry, Arc<TierProbe>) {
    let probe = tier.probe.clone();
    (
        TierEntry {
            tier: Arc::new(tier),
            model: model.into(),
            system_prompt: "You edit the living page.".into(),
            shadow: None,
        },
        probe,
    )
}

// --- fixture -------------------------------------------------------------

struct Fixture {
    service: Arc<Service>,
    assembly: Arc<Assembly>,
    sink: Arc<MemorySink>,
    recorder: Arc<FlightRecorder>,
}

fn fixture(tiers: TierSet) -> Fixture {
    let assembly = Arc::new(
        Assembly::builder()
            .workspace(Arc::new(MemoryStore::new()))
            .public(Arc::new(MemoryStore::new()))
            .build(),
    );
    let sink = Arc::new(MemorySink::default());
    let recorder = Arc::new(FlightRecorder::spawn(
        sink.clone(),
        1_000,
        100,
        Duration::from_secs(3600),
    ));
    let service = Arc::new(
        Service::builder()
            .assembly(assembly.clone())
            .tiers(tiers)
            .recorder(recorder.clone())
            .build(),
    );
    Fixture {
        service,
        assembly,
        sink,
        recorder,
    }
}

async fn drain_frames(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(250), rx.recv()).await
    {
        frames.push(frame);
    }
    frames
}

fn delta_entity_ids(frames: &[ServerFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerFrame::Delta { event } => match &event.primitive {
                Primitive::EntityCreate(create) => Some(create.id.to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

// --- tests ---------------------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn streaming_turn_end_to_end() {
    // First contact: empty page routes to L4, which builds the roster.
    let (l4, _) = entry(
        ScriptedTier::fixed(vec![
            create_tool("roster", "root", "table", serde_json::json!({"title": "Roster"})),
            message_stop(),
        ]),
        "analyst-xl",
    );
    // Follow-up turns route to L3.
    let (l3, _) = entry(
        ScriptedTier::fixed(vec![
            text_block("Building roster."),
            create_tool(
                "player_alice",
                "roster",
                "row",
                serde_json::json!({"name": "Alice", "wins": 0}),
            ),
            message_stop(),
        ]),
        "architect-l",
    );
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L4, l4).insert(TierLevel::L3, l3);
    let fx = fixture(tiers);

    let first = fx
        .service
        .handle_message(&actor(), None, "Start a game roster", Source::Web)
        .await
        .expect("turn completes");
    assert_eq!(first.applied_count, 1);
    let page_id = first.page_id;

    let mut rx = fx.service.subscribe(page_id).await.expect("subscribes");

    let second = fx
        .service
        .handle_message(&actor(), Some(page_id), "Add Alice", Source::Web)
        .await
        .expect("turn completes");
    assert_eq!(second.applied_count, 1);
    assert!(second.interrupted.is_none());

    let frames = drain_frames(&mut rx).await;
    let expected_shape = [
        "snapshot.start",
        "snapshot",
        "snapshot.end",
        "stream.start",
        "voice",
        "delta",
        "stream.end",
    ];
    let shapes: Vec<&str> = frames
        .iter()
        .map(|f| match f {
            ServerFrame::SnapshotStart => "snapshot.start",
            ServerFrame::Snapshot { .. } => "snapshot",
            ServerFrame::SnapshotEnd => "snapshot.end",
            ServerFrame::StreamStart => "stream.start",
            ServerFrame::Voice { .. } => "voice",
            ServerFrame::Delta { .. } => "delta",
            ServerFrame::StreamEnd => "stream.end",
            other => panic!("Unexpected frame {other:?}"),
        })
        .collect();
    assert_eq!(shapes, expected_shape);
    assert_eq!(delta_entity_ids(&frames), vec!["player_alice"]);

    // The stored page has both entities and a gapless log.
    let file = fx.assembly.load(page_id).await.expect("loads");
    assert_eq!(file.state.live_count(), 2);
    assert!(file.state.live_entity(&eid("player_alice")).is_some());
    let seqs: Vec<u64> = file.events.iter().map(|e| e.sequence.0).collect();
    assert_eq!(seqs, vec![1, 2]);

    // Two turns, two flight records; the second carries one primitive.
    fx.recorder.flush().await;
    let records = fx.sink.records.lock().expect("Locking failed").clone();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].primitives.len(), 1);
    assert_eq!(records[1].applied_count, 1);
    assert_eq!(records[1].model_calls.len(), 1);
    assert_eq!(records[1].model_calls[0].tier, TierLevel::L3);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn escalation_keeps_partial_work() {
    let (l3, _) = entry(
        ScriptedTier::fixed(vec![
            tool_block(
                "mutate_entity",
                serde_json::json!({
                    "action": "update", "ref": "base", "props": {"status": "warming up"}
                }),
            ),
            tool_block(
                "escalate",
                serde_json::json!({
                    "tier": "L4", "reason": "structural_change",
                    "extract": "needs restructure"
                }),
            ),
            message_stop(),
        ]),
        "architect-l",
    );
    let (l4, l4_probe) = entry(
        ScriptedTier::new(|request: &TierRequest| {
            let bytes = if request.focus.is_some() {
                let mut b =
                    create_tool("extra", "root", "card", serde_json::json!({"title": "Extra"}));
                b.extend(message_stop());
                b
            } else {
                let mut b =
                    create_tool("base", "root", "card", serde_json::json!({"title": "Base"}));
                b.extend(message_stop());
                b
            };
            vec![Ok(Bytes::from(bytes))]
        }),
        "analyst-xl",
    );
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L3, l3).insert(TierLevel::L4, l4);
    let fx = fixture(tiers);

    let first = fx
        .service
        .handle_message(&actor(), None, "Set up the page", Source::Web)
        .await
        .expect("turn completes");

    let second = fx
        .service
        .handle_message(&actor(), Some(first.page_id), "Restructure", Source::Web)
        .await
        .expect("turn completes");
    assert_eq!(second.escalations, 1);
    assert_eq!(second.applied_count, 2);

    // Both the pre-escalation update and the L4 continuation persisted.
    let file = fx.assembly.load(first.page_id).await.expect("loads");
    let base = file.state.live_entity(&eid("base")).expect("base lives");
    assert_eq!(
        base.props["status"],
        PropValue::String("warming up".into())
    );
    assert!(file.state.live_entity(&eid("extra")).is_some());

    // The escalated call carried the extract as focused context.
    let seen = l4_probe.seen.lock().expect("Locking failed");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].focus.as_deref(), Some("needs restructure"));
    assert_eq!(seen[1].level, TierLevel::L4);
    drop(seen);

    // One flight record covering both model calls.
    fx.recorder.flush().await;
    let records = fx.sink.records.lock().expect("Locking failed").clone();
    let record = records.last().expect("record exists");
    assert_eq!(record.model_calls.len(), 2);
    assert_eq!(record.model_calls[0].tier, TierLevel::L3);
    assert_eq!(record.model_calls[1].tier, TierLevel::L4);
    assert!(record.model_calls[1].prompt.contains("needs restructure"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn timeout_keeps_partial_work_and_surfaces_error() {
    let mut stall = ScriptedTier::fixed(vec![create_tool(
        "first",
        "root",
        "card",
        serde_json::json!({"title": "First"}),
    )]);
    stall.stall_after = true;
    let (l3, _) = entry(stall, "architect-l");
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L3, l3);
    tiers.with_timeout(TierLevel::L3, Duration::from_millis(150));
    let fx = fixture(tiers);

    // Seed a page so the turn routes to the stalling L3.
    let mut file = fx.assembly.create(Blueprint::default());
    let seed = Primitive::EntityCreate(EntityCreate {
        id: eid("seed"),
        parent: "root".parse().expect("valid"),
        display: Some(DisplayHint::Card),
        props: Props::new(),
    });
    fx.assembly.apply(&mut file, vec![seed], "system", Source::System);
    fx.assembly.save(&mut file).await.expect("saves");
    let page_id = file.page_id;

    let mut rx = fx.service.subscribe(page_id).await.expect("subscribes");
    let outcome = fx
        .service
        .handle_message(&actor(), Some(page_id), "Add things", Source::Web)
        .await
        .expect("turn completes despite timeout");

    let interrupted = outcome.interrupted.expect("interrupted");
    assert!(interrupted.contains("timed out"), "got: {interrupted}");
    assert_eq!(outcome.applied_count, 1);

    // The primitive parsed before the cut was applied and saved.
    let file = fx.assembly.load(page_id).await.expect("loads");
    assert!(file.state.live_entity(&eid("first")).is_some());

    let frames = drain_frames(&mut rx).await;
    assert!(frames
        .iter()
        .any(|f| matches!(f, ServerFrame::Error { message } if message.contains("timed out"))));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn same_page_serializes_different_pages_run_in_parallel() {
    let counter = Arc::new(AtomicUsize::new(0));
    let tier_counter = counter.clone();
    let mut tier = ScriptedTier::new(move |_| {
        let n = tier_counter.fetch_add(1, Ordering::SeqCst);
        let mut bytes = create_tool(
            &format!("item_{n}"),
            "root",
            "card",
            serde_json::json!({"n": n}),
        );
        bytes.extend(message_stop());
        // Two chunks with a delay in between keeps the call open long
        // enough for overlap to be observable.
        vec![Ok(Bytes::from(bytes))]
    });
    tier.chunk_delay = Duration::from_millis(100);
    let (entry_both, probe) = entry(tier, "analyst-xl");
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers
        .insert(TierLevel::L4, entry_both.clone())
        .insert(TierLevel::L3, entry_both);
    let fx = fixture(tiers);

    // Seed one page.
    let first = fx
        .service
        .handle_message(&actor(), None, "seed", Source::Web)
        .await
        .expect("turn completes");
    let page_a = first.page_id;

    // Two concurrent turns on the same page serialize.
    let actor_id = actor();
    let (r1, r2) = tokio::join!(
        fx.service
            .handle_message(&actor_id, Some(page_a), "one", Source::Web),
        fx.service
            .handle_message(&actor_id, Some(page_a), "two", Source::Web),
    );
    r1.expect("turn completes");
    r2.expect("turn completes");
    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);

    let file = fx.assembly.load(page_a).await.expect("loads");
    let seqs: Vec<u64> = file.events.iter().map(|e| e.sequence.0).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    // Two concurrent turns on different pages overlap.
    let second = fx
        .service
        .handle_message(&actor(), None, "other page", Source::Web)
        .await
        .expect("turn completes");
    let page_b = second.page_id;
    let (r1, r2) = tokio::join!(
        fx.service
            .handle_message(&actor_id, Some(page_a), "three", Source::Web),
        fx.service
            .handle_message(&actor_id, Some(page_b), "one", Source::Web),
    );
    r1.expect("turn completes");
    r2.expect("turn completes");
    assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn direct_edit_is_a_synthetic_turn() {
    // No tiers involved at all.
    let fx = fixture(TierSet::new(Duration::from_secs(5)));

    let mut file = fx.assembly.create(Blueprint::default());
    let seed = Primitive::EntityCreate(EntityCreate {
        id: eid("grocery_milk"),
        parent: "root".parse().expect("valid"),
        display: Some(DisplayHint::Row),
        props: [("done".to_string(), PropValue::Bool(false))].into(),
    });
    fx.assembly.apply(&mut file, vec![seed], "system", Source::System);
    fx.assembly.save(&mut file).await.expect("saves");
    let page_id = file.page_id;

    let mut rx = fx.service.subscribe(page_id).await.expect("subscribes");
    let outcome = fx
        .service
        .handle_client_frame(
            &actor(),
            Some(page_id),
            ClientFrame::DirectEdit {
                entity_id: eid("grocery_milk"),
                field: "done".into(),
                value: PropValue::Bool(true),
            },
        )
        .await
        .expect("edit applies");
    assert_eq!(outcome.applied_count, 1);

    let frames = drain_frames(&mut rx).await;
    assert!(frames
        .iter()
        .any(|f| matches!(f, ServerFrame::Delta { event } if event.source == Source::Web)));
    assert!(frames.iter().any(|f| matches!(
        f,
        ServerFrame::DirectEditAck { entity_id, field }
            if *entity_id == eid("grocery_milk") && field == "done"
    )));

    let file = fx.assembly.load(page_id).await.expect("loads");
    assert_eq!(
        file.state.live_entity(&eid("grocery_milk")).expect("lives").props["done"],
        PropValue::Bool(true)
    );

    // Editing a missing entity yields an error frame, not a crash.
    let mut rx = fx.service.subscribe(page_id).await.expect("subscribes");
    let outcome = fx
        .service
        .handle_direct_edit(
            &actor(),
            page_id,
            eid("nope"),
            "done".into(),
            PropValue::Bool(true),
        )
        .await
        .expect("turn completes");
    assert_eq!(outcome.applied_count, 0);
    assert_eq!(outcome.diagnostics[0].code, "ENTITY_NOT_FOUND");
    let frames = drain_frames(&mut rx).await;
    assert!(frames
        .iter()
        .any(|f| matches!(f, ServerFrame::DirectEditError { .. })));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn batch_markers_flush_contiguously() {
    let mut script = Vec::new();
    script.push(tool_block("batch_start", serde_json::json!({})));
    script.push(create_tool("a", "root", "card", serde_json::json!({})));
    script.push(create_tool("b", "root", "card", serde_json::json!({})));
    script.push(tool_block("batch_end", serde_json::json!({})));
    script.push(message_stop());
    let (l3, _) = entry(ScriptedTier::fixed(script), "architect-l");
    let (l4, _) = entry(
        ScriptedTier::fixed(vec![
            create_tool("seed", "root", "card", serde_json::json!({})),
            message_stop(),
        ]),
        "analyst-xl",
    );
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L3, l3).insert(TierLevel::L4, l4);
    let fx = fixture(tiers);

    let first = fx
        .service
        .handle_message(&actor(), None, "seed", Source::Web)
        .await
        .expect("turn completes");
    let mut rx = fx.service.subscribe(first.page_id).await.expect("subscribes");

    fx.service
        .handle_message(&actor(), Some(first.page_id), "batch", Source::Web)
        .await
        .expect("turn completes");

    let frames = drain_frames(&mut rx).await;
    assert_eq!(delta_entity_ids(&frames), vec!["a", "b"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn shadow_call_is_recorded_but_never_applied() {
    let (mut l4, _) = entry(
        ScriptedTier::fixed(vec![
            create_tool("real", "root", "card", serde_json::json!({})),
            message_stop(),
        ]),
        "analyst-xl",
    );
    let shadow = ScriptedTier::fixed(vec![
        text_block("Shadow thinking."),
        create_tool("shadow_only", "root", "card", serde_json::json!({})),
        message_stop(),
    ]);
    l4.shadow = Some((Arc::new(shadow), "analyst-xxl".into()));
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L4, l4);
    let fx = fixture(tiers);

    let outcome = fx
        .service
        .handle_message(&actor(), None, "hello", Source::Web)
        .await
        .expect("turn completes");

    // Shadow output never mutates state.
    let file = fx.assembly.load(outcome.page_id).await.expect("loads");
    assert!(file.state.live_entity(&eid("real")).is_some());
    assert!(file.state.entity(&eid("shadow_only")).is_none());

    // The record lands once the shadow finishes, with both calls.
    let record = 'wait: {
        for _ in 0..100 {
            fx.recorder.flush().await;
            let records = fx.sink.records.lock().expect("Locking failed");
            if let Some(record) = records.last().cloned() {
                break 'wait record;
            }
            drop(records);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Shadow record never arrived");
    };
    assert_eq!(record.model_calls.len(), 2);
    let shadow_call = &record.model_calls[1];
    assert!(shadow_call.shadow);
    assert_eq!(shadow_call.model, "analyst-xxl");
    assert_eq!(shadow_call.primitives.len(), 1);
    assert!(shadow_call.response_text.contains("Shadow thinking."));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn shutdown_waits_for_shadow_recording() {
    let (mut l4, _) = entry(
        ScriptedTier::fixed(vec![
            create_tool("real", "root", "card", serde_json::json!({})),
            message_stop(),
        ]),
        "analyst-xl",
    );
    let mut shadow = ScriptedTier::fixed(vec![
        text_block("Late shadow."),
        create_tool("shadow_only", "root", "card", serde_json::json!({})),
        message_stop(),
    ]);
    shadow.chunk_delay = Duration::from_millis(150);
    l4.shadow = Some((Arc::new(shadow), "analyst-xxl".into()));
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L4, l4);
    let fx = fixture(tiers);

    let outcome = fx
        .service
        .handle_message(&actor(), None, "hello", Source::Web)
        .await
        .expect("turn completes");

    // The turn has returned while the shadow is still streaming; the
    // drain must wait for its enqueue before it stops the flusher.
    fx.service.shutdown().await;

    let records = fx.sink.records.lock().expect("Locking failed");
    let record = records
        .iter()
        .find(|r| r.turn_id == outcome.turn_id)
        .expect("record survived the drain");
    assert_eq!(record.model_calls.len(), 2);
    assert!(record.model_calls[1].shadow);
    assert_eq!(record.model_calls[1].primitives.len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn shutdown_drains_in_flight_turns() {
    let mut tier = ScriptedTier::fixed(vec![
        create_tool("slow", "root", "card", serde_json::json!({})),
        message_stop(),
    ]);
    tier.chunk_delay = Duration::from_millis(200);
    let (l4, _) = entry(tier, "analyst-xl");
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L4, l4);
    let fx = fixture(tiers);

    let service = fx.service.clone();
    let turn = tokio::spawn(async move {
        service
            .handle_message(&actor(), None, "slow turn", Source::Web)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.service.shutdown().await;

    // The in-flight turn finalized before the drain completed.
    let outcome = turn.await.expect("task finishes").expect("turn completes");
    assert_eq!(outcome.applied_count, 1);
    assert!(fx
        .sink
        .records
        .lock()
        .expect("Locking failed")
        .iter()
        .any(|r| r.turn_id == outcome.turn_id));

    // New work is refused.
    let err = fx
        .service
        .handle_message(&actor(), None, "too late", Source::Web)
        .await
        .expect_err("draining");
    assert!(matches!(err, TurnError::ShuttingDown));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn rejected_primitives_surface_as_diagnostics() {
    let (l4, _) = entry(
        ScriptedTier::fixed(vec![
            create_tool("a", "root", "card", serde_json::json!({})),
            // Duplicate id: rejected, later primitives still apply.
            create_tool("a", "root", "card", serde_json::json!({})),
            create_tool("b", "root", "card", serde_json::json!({})),
            message_stop(),
        ]),
        "analyst-xl",
    );
    let mut tiers = TierSet::new(Duration::from_secs(5));
    tiers.insert(TierLevel::L4, l4);
    let fx = fixture(tiers);

    let outcome = fx
        .service
        .handle_message(&actor(), None, "dup", Source::Web)
        .await
        .expect("turn completes");
    assert_eq!(outcome.applied_count, 2);
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].code, "ID_ALREADY_EXISTS");

    let file = fx.assembly.load(outcome.page_id).await.expect("loads");
    assert_eq!(file.state.live_count(), 2);
    assert_eq!(file.last_sequence, Sequence(2));
}
