//! Hunt scheduler and AI pipeline integration tests.
//!
//! Hunts run against a fake step executor; AI streaming runs against a
//! scripted driver. Event ordering is asserted on a bus subscription
//! opened before the hunt starts.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nighthound::ai::{
    AiDriver, AiDriverError, AiPipeline, AiSettings, ChunkStream, ReportChunk,
};
use nighthound::assets::{Asset, OsType};
use nighthound::db::Database;
use nighthound::events::{EventBus, EventKind, Room, Subscription};
use nighthound::hunt::{
    HuntRepository, HuntScheduler, HuntStatus, ModuleRegistry, StepExecutor,
};
use nighthound::intelligence::{FindingStore, TimelineRecorder};
use nighthound::ssh::{ExecOutcome, ExecRequest, ExitStatus, SshError};

mod common;
use common::sample_asset;

const SLEEPER_MODULE: &str = r#"---
id: sleeper
name: Sleeper
description: One slow step
os_types: [linux]
---

### long_sleep
**description**: Sleep for a minute
**command**: `sleep 60`
**timeout**: 2
"#;

const SUDO_MODULE: &str = r#"---
id: sudo_probe
name: Sudo Probe
description: Step requiring elevation
os_types: [linux]
---

### read_shadow
**description**: Read the shadow file
**command**: `cat /etc/shadow`
**timeout**: 5
**requires_sudo**: true
"#;

struct Harness {
    bus: Arc<EventBus>,
    scheduler: Arc<HuntScheduler>,
    hunts: HuntRepository,
    findings: FindingStore,
    modules_dir: std::path::PathBuf,
}

async fn harness(driver: Option<Arc<dyn AiDriver>>) -> Harness {
    let db = Database::in_memory().await.unwrap();
    for sql in [
        "INSERT INTO assets (id, hostname, os_type, created_at, updated_at) VALUES ('linux-1', 'h', 'linux', '', '')",
        "INSERT INTO sessions (id, asset_id, analyst_id, state, created_at) VALUES ('s1', 'linux-1', 'alice', 'RUNNING', '')",
    ] {
        sqlx::query(sql).execute(db.pool()).await.unwrap();
    }

    let bus = Arc::new(EventBus::new());
    let hunts = HuntRepository::new(db.pool().clone());
    let findings = FindingStore::new(db.pool().clone());
    let timeline = TimelineRecorder::new(db.pool().clone(), bus.clone());

    let modules_dir = common::test_modules_dir();
    std::fs::write(modules_dir.join("sleeper.md"), SLEEPER_MODULE).unwrap();
    std::fs::write(modules_dir.join("sudo_probe.md"), SUDO_MODULE).unwrap();
    let modules = Arc::new(ModuleRegistry::new(&modules_dir));

    let pipeline = driver.map(|driver| {
        Arc::new(AiPipeline::new(
            driver,
            bus.clone(),
            hunts.clone(),
            findings.clone(),
            timeline.clone(),
            AiSettings::default(),
        ))
    });

    let scheduler = Arc::new(HuntScheduler::new(
        bus.clone(),
        hunts.clone(),
        timeline.clone(),
        modules,
        pipeline,
        1,
    ));

    Harness {
        bus,
        scheduler,
        hunts,
        findings,
        modules_dir,
    }
}

fn linux_asset() -> Asset {
    let mut asset = sample_asset("linux-1");
    asset.os_type = OsType::Linux;
    asset
}

/// Drain session-room events until a terminal hunt event arrives.
async fn collect_until_terminal(sub: &Subscription) -> Vec<EventKind> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(20), sub.recv())
            .await
            .expect("timed out waiting for terminal hunt event");
        let kind = event.kind;
        let terminal = matches!(
            kind,
            EventKind::HuntCompleted { .. }
                | EventKind::HuntFailed { .. }
                | EventKind::HuntCancelled { .. }
        );
        events.push(kind);
        if terminal {
            return events;
        }
    }
}

// ── Fake executors ──────────────────────────────────────────────────────────

/// Succeeds every step, echoing the command.
struct EchoExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, request: ExecRequest, _analyst: &str) -> Result<ExecOutcome, SshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecOutcome {
            stdout: format!("ok: {}", request.command),
            stderr: String::new(),
            exit: ExitStatus::Code(0),
            duration_ms: 12,
            stdout_truncated: false,
            stderr_truncated: false,
        })
    }
}

/// Returns scripted outcomes in order.
struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<ExecOutcome, SshError>>>,
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, _request: ExecRequest, _analyst: &str) -> Result<ExecOutcome, SshError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted")
    }
}

/// Blocks until the request's cancel signal fires.
struct HangingExecutor;

#[async_trait]
impl StepExecutor for HangingExecutor {
    async fn execute(&self, request: ExecRequest, _analyst: &str) -> Result<ExecOutcome, SshError> {
        let mut cancel = request.cancel.expect("hunt exec carries a cancel signal");
        loop {
            if *cancel.borrow() {
                return Err(SshError::Cancelled);
            }
            if cancel.changed().await.is_err() {
                return Err(SshError::Cancelled);
            }
        }
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn linux_hunt_happy_path_event_order() {
    let h = harness(None).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let executor = Arc::new(EchoExecutor {
        calls: AtomicU32::new(0),
    });
    let record = h
        .scheduler
        .start(
            executor.clone(),
            "s1",
            linux_asset(),
            "linux_network",
            false,
            "alice",
        )
        .await
        .unwrap();

    let events = collect_until_terminal(&sub).await;

    // hunt.started first, then two full step cycles, then hunt.completed.
    assert!(matches!(events[0], EventKind::HuntStarted { .. }));
    let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "hunt.started",
            "hunt.step_started",
            "hunt.observation",
            "hunt.step_completed",
            "hunt.step_started",
            "hunt.observation",
            "hunt.step_completed",
            "hunt.completed",
        ]
    );

    // Steps ran in module order.
    let step_ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            EventKind::HuntStepStarted { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(step_ids, vec!["check_listening_ports", "check_hosts_file"]);

    match events.last().unwrap() {
        EventKind::HuntCompleted { findings_count, .. } => assert_eq!(*findings_count, 0),
        other => panic!("unexpected terminal event: {other:?}"),
    }

    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    let hunt = h.hunts.get(&record.id).await.unwrap().unwrap();
    assert_eq!(hunt.status, HuntStatus::Completed);
    assert_eq!(h.hunts.observations(&record.id).await.unwrap().len(), 2);

    std::fs::remove_dir_all(&h.modules_dir).ok();
}

#[tokio::test]
async fn step_timeout_does_not_fail_the_hunt() {
    let h = harness(None).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let executor = Arc::new(ScriptedExecutor {
        script: Mutex::new(VecDeque::from([Ok(ExecOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit: ExitStatus::Timeout,
            duration_ms: 2100,
            stdout_truncated: false,
            stderr_truncated: false,
        })])),
    });

    let record = h
        .scheduler
        .start(executor, "s1", linux_asset(), "sleeper", false, "alice")
        .await
        .unwrap();

    let events = collect_until_terminal(&sub).await;
    assert!(matches!(
        events.last().unwrap(),
        EventKind::HuntCompleted { .. }
    ));

    let observations = h.hunts.observations(&record.id).await.unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].exit, ExitStatus::Timeout);
    assert!((2000..=2500).contains(&observations[0].wall_ms));

    let hunt = h.hunts.get(&record.id).await.unwrap().unwrap();
    assert_eq!(hunt.status, HuntStatus::Completed);

    std::fs::remove_dir_all(&h.modules_dir).ok();
}

#[tokio::test]
async fn os_mismatch_fails_fast_without_events() {
    let h = harness(None).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let executor = Arc::new(EchoExecutor {
        calls: AtomicU32::new(0),
    });
    let result = h
        .scheduler
        .start(
            executor,
            "s1",
            linux_asset(),
            "windows_persistence",
            false,
            "alice",
        )
        .await;

    assert!(matches!(
        result,
        Err(nighthound::hunt::SchedulerError::IncompatibleOs { .. })
    ));
    // No hunt.started was published.
    assert!(sub.try_recv().is_none());

    std::fs::remove_dir_all(&h.modules_dir).ok();
}

#[tokio::test]
async fn concurrency_cap_returns_busy() {
    let h = harness(None).await;

    let hanging = Arc::new(HangingExecutor);
    let first = h
        .scheduler
        .start(
            hanging.clone(),
            "s1",
            linux_asset(),
            "linux_network",
            false,
            "alice",
        )
        .await
        .unwrap();

    // The first hunt occupies the session's only slot.
    let second = h
        .scheduler
        .start(
            hanging,
            "s1",
            linux_asset(),
            "linux_network",
            false,
            "alice",
        )
        .await;
    assert!(matches!(
        second,
        Err(nighthound::hunt::SchedulerError::Busy(_))
    ));

    h.scheduler.cancel(&first.id).unwrap();
    std::fs::remove_dir_all(&h.modules_dir).ok();
}

#[tokio::test]
async fn cancel_interrupts_inflight_step() {
    let h = harness(None).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let record = h
        .scheduler
        .start(
            Arc::new(HangingExecutor),
            "s1",
            linux_asset(),
            "linux_network",
            false,
            "alice",
        )
        .await
        .unwrap();

    // Let the first step get in flight before cancelling.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.scheduler.cancel(&record.id).unwrap();

    let events = collect_until_terminal(&sub).await;
    assert!(matches!(
        events.last().unwrap(),
        EventKind::HuntCancelled { .. }
    ));
    // The second step never started.
    let starts = events
        .iter()
        .filter(|e| matches!(e, EventKind::HuntStepStarted { .. }))
        .count();
    assert_eq!(starts, 1);

    let hunt = h.hunts.get(&record.id).await.unwrap().unwrap();
    assert_eq!(hunt.status, HuntStatus::Cancelled);

    std::fs::remove_dir_all(&h.modules_dir).ok();
}

#[tokio::test]
async fn sudo_step_without_policy_is_skipped() {
    let h = harness(None).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let executor = Arc::new(EchoExecutor {
        calls: AtomicU32::new(0),
    });
    let record = h
        .scheduler
        .start(
            executor.clone(),
            "s1",
            linux_asset(), // no sudo method configured
            "sudo_probe",
            false,
            "alice",
        )
        .await
        .unwrap();

    let events = collect_until_terminal(&sub).await;
    assert!(matches!(
        events.last().unwrap(),
        EventKind::HuntCompleted { .. }
    ));

    // Nothing was executed; the observation records the skip.
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    let observations = h.hunts.observations(&record.id).await.unwrap();
    assert_eq!(
        observations[0].exit,
        ExitStatus::Skipped("no_sudo".to_string())
    );

    std::fs::remove_dir_all(&h.modules_dir).ok();
}

// ── AI pipeline scenarios ───────────────────────────────────────────────────

/// Streams scripted chunks with a pacing delay, then optionally errors.
/// Optionally fails the first N stream attempts outright.
struct ScriptedDriver {
    chunks: Vec<&'static str>,
    error_after_chunks: Option<AiDriverError>,
    fail_attempts: AtomicU32,
}

#[async_trait]
impl AiDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream_report(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _max_tokens: u32,
    ) -> Result<ChunkStream, AiDriverError> {
        if self.fail_attempts.load(Ordering::SeqCst) > 0 {
            self.fail_attempts.fetch_sub(1, Ordering::SeqCst);
            return Err(AiDriverError::Unavailable("scripted outage".into()));
        }

        let chunks = self.chunks.clone();
        let error = self.error_after_chunks.clone();
        let stream = futures::stream::unfold(
            (chunks.into_iter(), error, false),
            |(mut chunks, error, done)| async move {
                if done {
                    return None;
                }
                // Pace chunks apart so batching flushes them individually.
                tokio::time::sleep(Duration::from_millis(170)).await;
                match chunks.next() {
                    Some(text) => Some((
                        Ok(ReportChunk {
                            text: text.to_string(),
                            phase: None,
                        }),
                        (chunks, error, false),
                    )),
                    None => error.map(|err| (Err(err), (chunks, None, true))),
                }
            },
        );
        Ok(Box::pin(stream) as ChunkStream)
    }
}

#[tokio::test]
async fn driver_drop_preserves_partial_report() {
    let driver = Arc::new(ScriptedDriver {
        chunks: vec!["Analyzing ", "the listening ", "sockets now."],
        error_after_chunks: Some(AiDriverError::Transport("connection reset".into())),
        fail_attempts: AtomicU32::new(0),
    });
    let h = harness(Some(driver)).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let executor = Arc::new(EchoExecutor {
        calls: AtomicU32::new(0),
    });
    let record = h
        .scheduler
        .start(
            executor,
            "s1",
            linux_asset(),
            "linux_network",
            true,
            "alice",
        )
        .await
        .unwrap();

    let events = collect_until_terminal(&sub).await;

    // ai.reasoning_started, three paced chunks, then a non-retryable error.
    assert!(events
        .iter()
        .any(|e| matches!(e, EventKind::AiReasoningStarted { .. })));
    let chunk_events: Vec<&EventKind> = events
        .iter()
        .filter(|e| matches!(e, EventKind::AiReasoningChunk { .. }))
        .collect();
    assert_eq!(chunk_events.len(), 3);
    assert!(events.iter().any(|e| matches!(
        e,
        EventKind::AiError { retryable, .. } if !retryable
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EventKind::AiReasoningCompleted { .. })));

    // The saved report equals the concatenation of the streamed chunks,
    // and the hunt still completed because all steps succeeded.
    let hunt = h.hunts.get(&record.id).await.unwrap().unwrap();
    assert_eq!(hunt.status, HuntStatus::Completed);
    assert_eq!(
        hunt.ai_report_text.as_deref(),
        Some("Analyzing the listening sockets now.")
    );
    assert!(matches!(
        events.last().unwrap(),
        EventKind::HuntCompleted { findings_count: 0, .. }
    ));

    std::fs::remove_dir_all(&h.modules_dir).ok();
}

#[tokio::test]
async fn transient_outage_retries_then_extracts_findings() {
    const REPORT_TAIL: &str = "\n```json\n{\"summary\": \"one issue\", \"overall_risk\": \"high\", \"findings\": [{\"title\": \"Reverse shell in cron\", \"severity\": \"high\", \"confidence\": 0.9, \"description\": \"d\", \"technique_ids\": [\"T1053.003\"], \"indicators\": [{\"type\": \"ip\", \"value\": \"203.0.113.9\", \"context\": \"\"}], \"remediation_steps\": [\"Remove the cron entry\"], \"raw_evidence\": \"x\"}]}\n```";

    let driver = Arc::new(ScriptedDriver {
        chunks: vec!["# Executive Summary\nOne bad cron entry.\n", REPORT_TAIL],
        error_after_chunks: None,
        // First attempt fails before any chunk: retryable.
        fail_attempts: AtomicU32::new(1),
    });
    let h = harness(Some(driver)).await;
    let sub = h.bus.subscribe_default(Room::Session("s1".into()), "test");

    let executor = Arc::new(EchoExecutor {
        calls: AtomicU32::new(0),
    });
    let record = h
        .scheduler
        .start(
            executor,
            "s1",
            linux_asset(),
            "linux_network",
            true,
            "alice",
        )
        .await
        .unwrap();

    let events = collect_until_terminal(&sub).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, EventKind::AiReasoningCompleted { .. })));
    let generated: Vec<&EventKind> = events
        .iter()
        .filter(|e| matches!(e, EventKind::AiFindingGenerated { .. }))
        .collect();
    assert_eq!(generated.len(), 1);

    match events.last().unwrap() {
        EventKind::HuntCompleted { findings_count, .. } => assert_eq!(*findings_count, 1),
        other => panic!("unexpected terminal event: {other:?}"),
    }

    // The finding landed in the store with its STIX bundle.
    let findings = h.findings.list(Some("linux-1"), None).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Reverse shell in cron");
    assert!(findings[0].stix_bundle.is_some());
    assert_eq!(findings[0].technique_ids.0, vec!["T1053.003"]);

    let hunt = h.hunts.get(&record.id).await.unwrap().unwrap();
    assert_eq!(hunt.status, HuntStatus::Completed);
    assert_eq!(hunt.findings_count, 1);

    std::fs::remove_dir_all(&h.modules_dir).ok();
}
