//! End-to-end tests for the execution bridge.
//!
//! Each test starts a real dispatcher with a scripted engine and a live
//! front end task, then checks ordering, overlap, confirmation and progress
//! behaviour through the recorded respondable calls and engine timeline.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use buddy_bridge::{
    Artifact, BridgeConfig, ConfirmationError, ConfirmationGate, DeliveryError, DispatchError,
    EngineError, FrontEnd, ImportEngine, ImportJob, JobDispatcher, JobResult, OverwriteFn,
    PackImport, Payload, Respondable, SongImport,
};
use buddy_core::events::{BridgeEvent, EventBus};
use buddy_core::types::{ConfirmationOutcome, JobKind, RequestId, UserId};

// =============================================================================
// Helpers
// =============================================================================

/// What the scripted engine does for a given source.
#[derive(Clone)]
enum Step {
    /// Write `units` progress lines, sleeping `unit` between them.
    Work { units: u32, unit: Duration },
    /// Write each chunk and flush it, without sleeping.
    Emit(Vec<&'static str>),
    /// Ask to overwrite an existing item, then finish.
    Collide,
    Fail(&'static str),
}

#[derive(Debug, Clone)]
struct Span {
    source: String,
    start: Instant,
    end: Instant,
}

struct ScriptedEngine {
    script: HashMap<&'static str, Step>,
    timeline: Mutex<Vec<Span>>,
}

impl ScriptedEngine {
    fn new(script: Vec<(&'static str, Step)>) -> Arc<Self> {
        Arc::new(Self {
            script: script.into_iter().collect(),
            timeline: Mutex::new(Vec::new()),
        })
    }

    fn timeline(&self) -> Vec<Span> {
        self.timeline.lock().unwrap().clone()
    }

    fn span(&self, source: &str) -> Span {
        self.timeline()
            .into_iter()
            .find(|s| s.source == source)
            .unwrap_or_else(|| panic!("{} never ran", source))
    }

    fn run(
        &self,
        source: &str,
        dest: &Path,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<Artifact, EngineError> {
        let start = Instant::now();
        let artifact = Artifact::new(source, dest.join(source));
        let step = self
            .script
            .get(source)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedSource(source.to_string()))?;

        let result = match step {
            Step::Work { units, unit } => {
                for i in 1..=units {
                    thread::sleep(unit);
                    write!(progress, "{}%", i * 100 / units)?;
                    progress.flush()?;
                }
                Ok(artifact)
            }
            Step::Emit(chunks) => {
                for chunk in chunks {
                    progress.write_all(chunk.as_bytes())?;
                    progress.flush()?;
                }
                Ok(artifact)
            }
            Step::Collide => {
                let existing = Artifact::new(source, Path::new("/installed").join(source));
                if overwrite(&artifact, &existing) {
                    Ok(artifact)
                } else {
                    Err(EngineError::OverwriteDenied)
                }
            }
            Step::Fail(message) => Err(EngineError::Failed(message.to_string())),
        };

        self.timeline.lock().unwrap().push(Span {
            source: source.to_string(),
            start,
            end: Instant::now(),
        });
        result
    }
}

impl ImportEngine for ScriptedEngine {
    fn add_pack(
        &self,
        source: &str,
        packs: &Path,
        _courses: &Path,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<PackImport, EngineError> {
        let pack = self.run(source, packs, progress, overwrite)?;
        Ok(PackImport {
            pack,
            course_count: 1,
        })
    }

    fn add_song(
        &self,
        source: &str,
        singles: &Path,
        _cache: Option<&Path>,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<SongImport, EngineError> {
        let song = self.run(source, singles, progress, overwrite)?;
        Ok(SongImport {
            stored_path: song.path.join("song.ssc"),
            song,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Edit(Payload),
    ClearPrompt,
    DeleteOrReplace,
    SendFinal(Payload),
}

struct TestRespondable {
    user: UserId,
    calls: Mutex<Vec<Call>>,
}

impl TestRespondable {
    fn new(user: &str) -> Arc<Self> {
        Arc::new(Self {
            user: UserId::new(user),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn progress_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Edit(Payload::Progress { text }) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }

    fn record(&self, call: Call) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Respondable for TestRespondable {
    fn user(&self) -> &UserId {
        &self.user
    }

    async fn defer(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn edit(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.record(Call::Edit(payload))
    }

    async fn clear_prompt(&self) -> Result<(), DeliveryError> {
        self.record(Call::ClearPrompt)
    }

    async fn delete_or_replace(&self) -> Result<(), DeliveryError> {
        self.record(Call::DeleteOrReplace)
    }

    async fn send_final(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.record(Call::SendFinal(payload))
    }
}

/// A running dispatcher plus its front end.
struct Harness {
    dispatcher: JobDispatcher,
    gate: Arc<ConfirmationGate>,
    events: EventBus,
    front_end: JoinHandle<()>,
}

impl Harness {
    fn start(engine: Arc<ScriptedEngine>, config: BridgeConfig) -> Self {
        let (tx, rx) = buddy_bridge::frontend::channel();
        let gate = Arc::new(ConfirmationGate::new());
        let front_end = tokio::spawn(FrontEnd::new(rx, Arc::clone(&gate)).run());
        let events = EventBus::new(256);
        let dispatcher = JobDispatcher::start(engine, config, tx, events.clone()).unwrap();
        Self {
            dispatcher,
            gate,
            events,
            front_end,
        }
    }

    fn pack(&self, source: &str, respondable: &Arc<TestRespondable>) -> buddy_bridge::JobHandle {
        let job = ImportJob::pack(source, "/songs", "/courses", respondable.clone());
        self.dispatcher.submit(job).unwrap()
    }

    fn song(&self, source: &str, respondable: &Arc<TestRespondable>) -> buddy_bridge::JobHandle {
        let job = ImportJob::song(source, "/songs/Singles", None, respondable.clone());
        self.dispatcher.submit(job).unwrap()
    }

    /// Drain the workers, then wait for the front end to deliver everything.
    async fn finish(self) {
        let mut dispatcher = self.dispatcher;
        tokio::task::spawn_blocking(move || dispatcher.shutdown())
            .await
            .unwrap();
        self.front_end.await.unwrap();
    }
}

fn fast_config() -> BridgeConfig {
    BridgeConfig {
        progress_throttle: Duration::from_millis(1000),
        confirmation_timeout: Duration::from_secs(5),
        max_queue_depth: 32,
    }
}

/// Wait for the next confirmation request and for the gate to list it.
async fn next_prompt(
    events: &mut tokio::sync::broadcast::Receiver<BridgeEvent>,
    gate: &ConfirmationGate,
) -> RequestId {
    let request_id = loop {
        if let BridgeEvent::ConfirmationRequested { request_id, .. } = events.recv().await.unwrap()
        {
            break request_id;
        }
    };
    for _ in 0..200 {
        if gate.get(request_id).is_some() {
            return request_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("prompt {} never reached the gate", request_id);
}

fn overlaps(a: &Span, b: &Span) -> bool {
    a.start < b.end && b.start < a.end
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_scenario_a_second_pack_waits_for_first() {
    let unit = Duration::from_millis(30);
    let engine = ScriptedEngine::new(vec![
        ("P1", Step::Work { units: 5, unit }),
        ("P2", Step::Work { units: 1, unit }),
    ]);
    let harness = Harness::start(Arc::clone(&engine), fast_config());
    let respondable = TestRespondable::new("alice");

    let p1 = harness.pack("P1", &respondable);
    let p2 = harness.pack("P2", &respondable);
    assert!(matches!(p1.await.unwrap(), JobResult::Success { .. }));
    assert!(matches!(p2.await.unwrap(), JobResult::Success { .. }));
    harness.finish().await;

    let first = engine.span("P1");
    let second = engine.span("P2");
    assert!(second.start >= first.end);
    assert!(first.end.duration_since(first.start) >= unit * 5);
}

#[tokio::test]
async fn test_same_kind_runs_in_submission_order() {
    let unit = Duration::from_millis(5);
    let sources = ["S1", "S2", "S3", "S4", "S5"];
    let engine = ScriptedEngine::new(
        sources
            .iter()
            .map(|s| (*s, Step::Work { units: 2, unit }))
            .collect(),
    );
    let harness = Harness::start(Arc::clone(&engine), fast_config());
    let respondable = TestRespondable::new("alice");

    let handles: Vec<_> = sources.iter().map(|s| harness.song(s, &respondable)).collect();
    for handle in handles {
        handle.await.unwrap();
    }
    harness.finish().await;

    let timeline = engine.timeline();
    let order: Vec<&str> = timeline.iter().map(|s| s.source.as_str()).collect();
    assert_eq!(order, sources);
    for pair in timeline.windows(2) {
        assert!(!overlaps(&pair[0], &pair[1]));
    }
}

#[tokio::test]
async fn test_scenario_d_pack_and_song_overlap() {
    let unit = Duration::from_millis(40);
    let engine = ScriptedEngine::new(vec![
        ("Pack", Step::Work { units: 5, unit }),
        ("Song", Step::Work { units: 5, unit }),
    ]);
    let harness = Harness::start(Arc::clone(&engine), fast_config());
    let respondable = TestRespondable::new("alice");

    let pack = harness.pack("Pack", &respondable);
    let song = harness.song("Song", &respondable);
    assert!(matches!(pack.await.unwrap(), JobResult::Success { .. }));
    assert!(matches!(song.await.unwrap(), JobResult::Success { .. }));
    harness.finish().await;

    assert!(overlaps(&engine.span("Pack"), &engine.span("Song")));
}

// =============================================================================
// Results
// =============================================================================

#[tokio::test]
async fn test_success_replaces_progress_with_final_message() {
    let engine = ScriptedEngine::new(vec![(
        "Bad Apple",
        Step::Work {
            units: 1,
            unit: Duration::from_millis(1),
        },
    )]);
    let harness = Harness::start(engine, fast_config());
    let respondable = TestRespondable::new("alice");

    harness.song("Bad Apple", &respondable).await.unwrap();
    harness.finish().await;

    let calls = respondable.calls();
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail[0], Call::DeleteOrReplace);
    assert_eq!(
        tail[1],
        Call::SendFinal(Payload::SongAdded {
            song: Artifact::new("Bad Apple", "/songs/Singles/Bad Apple/song.ssc"),
            added_by: UserId::new("alice"),
        })
    );
}

#[tokio::test]
async fn test_failure_keeps_text_and_worker_continues() {
    let engine = ScriptedEngine::new(vec![
        ("broken", Step::Fail("No .sm or .ssc file found in archive")),
        (
            "fine",
            Step::Work {
                units: 1,
                unit: Duration::from_millis(1),
            },
        ),
    ]);
    let harness = Harness::start(engine, fast_config());
    let broken_msg = TestRespondable::new("alice");
    let fine_msg = TestRespondable::new("alice");

    let broken = harness.pack("broken", &broken_msg);
    let fine = harness.pack("fine", &fine_msg);
    assert_eq!(
        broken.await.unwrap(),
        JobResult::Failed("No .sm or .ssc file found in archive".into())
    );
    assert!(matches!(fine.await.unwrap(), JobResult::Success { .. }));
    harness.finish().await;

    assert!(broken_msg.calls().contains(&Call::Edit(Payload::Error {
        message: "No .sm or .ssc file found in archive".into()
    })));
    assert!(fine_msg
        .calls()
        .iter()
        .any(|c| matches!(c, Call::SendFinal(Payload::PackAdded { .. }))));
}

// =============================================================================
// Confirmation
// =============================================================================

#[tokio::test]
async fn test_scenario_b_unanswered_prompt_cancels_once() {
    let engine = ScriptedEngine::new(vec![("Pack", Step::Collide)]);
    let config = BridgeConfig {
        confirmation_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let harness = Harness::start(engine, config);
    let mut events = harness.events.subscribe();
    let respondable = TestRespondable::new("alice");

    let started = Instant::now();
    let result = harness.pack("Pack", &respondable).await.unwrap();
    assert_eq!(result, JobResult::Cancelled);
    assert!(started.elapsed() >= Duration::from_millis(100));

    // Let the front-end timer fire as well.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let gate = Arc::clone(&harness.gate);
    harness.finish().await;

    let mut outcomes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::ConfirmationResolved { outcome, .. } = event {
            outcomes.push(outcome);
        }
    }
    assert_eq!(outcomes, vec![ConfirmationOutcome::TimedOut]);
    assert_eq!(respondable.count(&Call::Edit(Payload::Cancelled)), 1);
    assert!(respondable.calls().contains(&Call::ClearPrompt));
    assert_eq!(gate.pending_count(), 0);
}

#[tokio::test]
async fn test_owner_allows_overwrite() {
    let engine = ScriptedEngine::new(vec![("Song", Step::Collide)]);
    let harness = Harness::start(engine, fast_config());
    let mut events = harness.events.subscribe();
    let respondable = TestRespondable::new("alice");

    let handle = harness.song("Song", &respondable);
    let request_id = next_prompt(&mut events, &harness.gate).await;
    assert!(respondable
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Edit(Payload::OverwritePrompt { .. }))));

    let outcome = harness
        .gate
        .approve(request_id, &UserId::new("alice"))
        .unwrap();
    assert_eq!(outcome, ConfirmationOutcome::Allow);
    assert!(matches!(handle.await.unwrap(), JobResult::Success { .. }));
    harness.finish().await;
}

#[tokio::test]
async fn test_other_user_cannot_answer() {
    let engine = ScriptedEngine::new(vec![("Pack", Step::Collide)]);
    let harness = Harness::start(engine, fast_config());
    let mut events = harness.events.subscribe();
    let respondable = TestRespondable::new("alice");

    let handle = harness.pack("Pack", &respondable);
    let request_id = next_prompt(&mut events, &harness.gate).await;

    let err = harness
        .gate
        .approve(request_id, &UserId::new("mallory"))
        .unwrap_err();
    assert!(matches!(err, ConfirmationError::Unauthorized { .. }));
    assert_eq!(err.to_string(), "The command was initiated by <@alice>");
    assert_eq!(harness.gate.pending_count(), 1);

    harness.gate.deny(request_id, &UserId::new("alice")).unwrap();
    assert_eq!(handle.await.unwrap(), JobResult::Cancelled);
    harness.finish().await;

    assert_eq!(respondable.count(&Call::Edit(Payload::Cancelled)), 1);
}

// =============================================================================
// Progress
// =============================================================================

#[tokio::test]
async fn test_scenario_c_one_update_per_window() {
    let engine = ScriptedEngine::new(vec![("Pack", Step::Emit(vec!["...12%...", "...45%..."]))]);
    let harness = Harness::start(engine, fast_config());
    let respondable = TestRespondable::new("alice");

    harness.pack("Pack", &respondable).await.unwrap();
    harness.finish().await;

    assert_eq!(respondable.progress_texts(), vec!["...12%...".to_string()]);
}

#[tokio::test]
async fn test_progress_without_marker_is_not_relayed() {
    let engine = ScriptedEngine::new(vec![(
        "Pack",
        Step::Emit(vec!["Resolving host", "Extracting files"]),
    )]);
    let harness = Harness::start(engine, fast_config());
    let respondable = TestRespondable::new("alice");

    harness.pack("Pack", &respondable).await.unwrap();
    harness.finish().await;

    assert!(respondable.progress_texts().is_empty());
}

// =============================================================================
// Queue limits
// =============================================================================

#[tokio::test]
async fn test_queue_full_is_reported_without_blocking() {
    let unit = Duration::from_millis(50);
    let engine = ScriptedEngine::new(vec![
        ("A", Step::Work { units: 2, unit }),
        ("B", Step::Work { units: 1, unit }),
        ("C", Step::Work { units: 1, unit }),
    ]);
    let config = BridgeConfig {
        max_queue_depth: 2,
        ..fast_config()
    };
    let harness = Harness::start(engine, config);
    let respondable = TestRespondable::new("alice");

    let a = harness.pack("A", &respondable);
    let b = harness.pack("B", &respondable);
    let job = ImportJob::pack("C", "/songs", "/courses", respondable.clone());
    let submitted = Instant::now();
    let err = harness.dispatcher.submit(job).unwrap_err();
    assert!(submitted.elapsed() < Duration::from_millis(50));
    assert!(matches!(
        err,
        DispatchError::QueueFull {
            kind: JobKind::Pack,
            depth: 2
        }
    ));

    a.await.unwrap();
    b.await.unwrap();
    harness.finish().await;
}
