//! Test Catalog & Orchestrator: schedules catalog tests per device,
//! enforces destructive gating and the per-device run lock, executes
//! through the Tool Invoker, folds parsed results into the scoring
//! engine and the fake detector, and emits progress throughout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{definition, profile_tests, TestDefinition};
use crate::config::{EngineConfig, ToolPaths, BADBLOCKS_BLOCKS_AT_ONCE, BADBLOCKS_BLOCK_SIZE};
use crate::error::{EngineError, Result};
use crate::fake::FakeDetector;
use crate::invoker::{extract_percentage, ToolInvoker};
use crate::models::{
    AccessPattern, Confirmation, Device, DiagnosticProfile, DiagnosticReport, HealthAssessment,
    NormalizedResult, ProgressEvent, SessionState, SmartData, TestKind, TestRun, TestState,
};
use crate::parsers::{capacity, defects, smart, speed};
use crate::remediation;
use crate::scoring;
use crate::utils::progress::ProgressReporter;
use crate::utils::task_manager::{CancelFlag, SessionRegistry};

/// smartctl driver fallbacks tried in order for USB bridges.
const SMARTCTL_DRIVERS: &[&str] = &["", "sat", "scsi", "ata"];
const SELF_TEST_POLL: Duration = Duration::from_secs(10);
const READ_SAMPLES: u32 = 10;
const SAMPLE_BYTES: u64 = 1024 * 1024;
const SPEED_CHUNKS: u32 = 5;
const SPEED_CHUNK_MB: u64 = 20;

/// A device is a serialization domain: one async mutex per device id,
/// held for exactly one TestRun and released on every exit path.
struct DeviceLocks {
    inner: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeviceLocks {
    fn new() -> Self {
        DeviceLocks {
            inner: StdMutex::new(HashMap::new()),
        }
    }

    fn for_device(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().expect("device lock table poisoned");
        map.entry(device_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Cheap identifier kept by callers after a session moves into the
/// runner, for cancellation and enumeration syncing.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub device_id: String,
}

/// Groups the TestRuns for one device and one user-initiated diagnostic
/// invocation. Owns its runs; destroyed when the report is produced.
pub struct DiagnosticSession {
    pub id: Uuid,
    pub device: Device,
    pub profile: DiagnosticProfile,
    pub state: SessionState,
    pub runs: Vec<TestRun>,
    pub results: Vec<NormalizedResult>,
    pub health: Option<HealthAssessment>,
    detector: FakeDetector,
    cancel: CancelFlag,
    device_lost: Arc<AtomicBool>,
}

impl DiagnosticSession {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            device_id: self.device.id.clone(),
        }
    }
}

struct RunCtx {
    session_id: Uuid,
    device_id: String,
    kind: TestKind,
}

enum RunVerdict {
    Completed {
        result: Option<NormalizedResult>,
        message: String,
    },
    Skipped(String),
}

struct RunExecution {
    raw: Option<String>,
    verdict: Result<RunVerdict>,
}

impl RunExecution {
    fn ok(raw: Option<String>, result: Option<NormalizedResult>, message: impl Into<String>) -> Self {
        RunExecution {
            raw,
            verdict: Ok(RunVerdict::Completed {
                result,
                message: message.into(),
            }),
        }
    }

    fn skip(raw: Option<String>, message: impl Into<String>) -> Self {
        RunExecution {
            raw,
            verdict: Ok(RunVerdict::Skipped(message.into())),
        }
    }

    fn err(raw: Option<String>, err: EngineError) -> Self {
        RunExecution {
            raw,
            verdict: Err(err),
        }
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    tools: ToolPaths,
    progress: ProgressReporter,
    locks: DeviceLocks,
    semaphore: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, tools: ToolPaths) -> Self {
        let permits = config.max_parallel_devices.max(1);
        Orchestrator {
            config,
            tools,
            progress: ProgressReporter::new(),
            locks: DeviceLocks::new(),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Attach a progress consumer (presentation collaborator).
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Build a session with the profile's auto-scheduled tests.
    pub fn plan_session(&self, device: Device, profile: DiagnosticProfile) -> DiagnosticSession {
        let id = Uuid::new_v4();
        let (cancel, device_lost) = SessionRegistry::register(id);
        let runs = profile_tests(profile, device.class)
            .into_iter()
            .map(|def| TestRun::new(&device.id, def.kind))
            .collect();
        info!(session = %id, device = %device.id, ?profile, "session planned");
        DiagnosticSession {
            id,
            detector: FakeDetector::new(&device.id, self.config.capacity_tolerance_pct),
            device,
            profile,
            state: SessionState::Collecting,
            runs,
            results: Vec::new(),
            health: None,
            cancel,
            device_lost,
        }
    }

    /// Build an empty session for a manual test selection.
    pub fn plan_empty(&self, device: Device, profile: DiagnosticProfile) -> DiagnosticSession {
        let mut session = self.plan_session(device, profile);
        session.runs.clear();
        session
    }

    /// Schedule one more test on a session. Destructive tests are
    /// rejected synchronously unless the caller presents a confirmation
    /// for this exact run; they are never auto-scheduled.
    pub fn request_test(
        &self,
        session: &mut DiagnosticSession,
        kind: TestKind,
        confirm: Option<Confirmation>,
    ) -> Result<()> {
        if session.state != SessionState::Collecting {
            return Err(EngineError::InvalidParameter(
                "session is no longer collecting".to_string(),
            ));
        }
        let def = definition(kind);
        if !def.applies_to.contains(&session.device.class) {
            return Err(EngineError::InvalidParameter(format!(
                "{} does not apply to this device class",
                def.label
            )));
        }
        if def.destructive && confirm.is_none() {
            return Err(EngineError::PreconditionViolation(format!(
                "destructive test '{}' requires explicit confirmation",
                def.label
            )));
        }
        let mut run = TestRun::new(&session.device.id, kind);
        run.destructive_confirmed = confirm.is_some();
        session.runs.push(run);
        Ok(())
    }

    /// Signal session-level cancellation: pending runs become Cancelled,
    /// the running invocation's child process is killed.
    pub fn cancel_session(handle: &SessionHandle) -> bool {
        SessionRegistry::cancel(&handle.id)
    }

    /// Enumeration tick: abort sessions whose device disappeared.
    pub fn sync_devices(handles: &[SessionHandle], present: &[Device]) {
        for handle in handles {
            if !present.iter().any(|d| d.id == handle.device_id) {
                warn!(device = %handle.device_id, "device disappeared mid-session");
                SessionRegistry::mark_device_lost(&handle.id);
            }
        }
    }

    /// Run every scheduled test of the session to a terminal state and
    /// produce the diagnostic report.
    pub async fn run_session(&self, session: &mut DiagnosticSession) -> Result<DiagnosticReport> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| EngineError::SystemError(e.to_string()))?;

        for idx in 0..session.runs.len() {
            if session.cancel.is_cancelled() {
                break;
            }
            self.execute_one(session, idx).await;
        }

        self.finalize_leftovers(session);

        let device_lost = session.device_lost.load(Ordering::Relaxed);
        let all_skipped = !session.runs.is_empty()
            && session.runs.iter().all(|r| r.state == TestState::Skipped);
        session.state = if session.cancel.is_cancelled() || device_lost || all_skipped {
            SessionState::Aborted
        } else {
            SessionState::Complete
        };
        SessionRegistry::unregister(&session.id);
        info!(session = %session.id, state = ?session.state, "session finished");

        if !session.results.is_empty() {
            session.health = Some(scoring::calculate_health(
                &session.device,
                &session.results,
                &self.config.scoring,
            ));
        }

        Ok(self.build_report(session))
    }

    /// Run the sessions concurrently, bounded by the configured device
    /// parallelism. Runs for one device stay strictly ordered because
    /// each session acquires that device's run lock per test.
    pub async fn run_all(
        self: Arc<Self>,
        sessions: Vec<DiagnosticSession>,
    ) -> Vec<Result<DiagnosticReport>> {
        let mut tasks = Vec::new();
        for mut session in sessions {
            let orch = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                orch.run_session(&mut session).await
            }));
        }
        let mut reports = Vec::new();
        for task in tasks {
            reports.push(
                task.await
                    .unwrap_or_else(|e| Err(EngineError::SystemError(e.to_string()))),
            );
        }
        reports
    }

    async fn execute_one(&self, session: &mut DiagnosticSession, idx: usize) {
        let kind = session.runs[idx].test;
        let def = definition(kind);
        let ctx = RunCtx {
            session_id: session.id,
            device_id: session.device.id.clone(),
            kind,
        };

        // Preconditions, checked before the run may enter Running.
        if let Some(tool) = def.tool {
            if self.tools.get(tool).is_none() {
                let reason = format!("tool unavailable: {}", tool.name());
                let run = &mut session.runs[idx];
                run.error = Some(reason.clone());
                run.finish(TestState::Failed, reason);
                self.emit(&ctx, TestState::Failed, None, &session.runs[idx].message);
                return;
            }
        }
        if def.requires_privilege && !self.config.privileged {
            session.runs[idx].finish(
                TestState::Skipped,
                "skipped: insufficient privilege".to_string(),
            );
            self.emit(&ctx, TestState::Skipped, None, &session.runs[idx].message);
            return;
        }
        if def.requires_unmount && session.device.mounted {
            let run = &mut session.runs[idx];
            run.error = Some("device is mounted".to_string());
            run.finish(
                TestState::Failed,
                format!("device is mounted; unmount {} first", session.device.path),
            );
            self.emit(&ctx, TestState::Failed, None, &session.runs[idx].message);
            return;
        }
        if def.destructive && !session.runs[idx].destructive_confirmed {
            // Scheduling already rejects this; refuse again rather than
            // ever letting an unconfirmed destructive run start.
            let run = &mut session.runs[idx];
            run.error = Some("missing destructive confirmation".to_string());
            run.finish(TestState::Failed, "destructive test lacked confirmation");
            self.emit(&ctx, TestState::Failed, None, &session.runs[idx].message);
            return;
        }

        // The per-device run lock serializes runs across sessions. The
        // guard lives until this run has reached its terminal state and
        // emitted it, and is released on every exit path.
        let lock = self.locks.for_device(&session.device.id);
        let _guard = lock.lock().await;

        session.runs[idx].start();
        self.emit(&ctx, TestState::Running, Some(0), def.label);

        let execution = if kind == TestKind::HealthCheck {
            self.run_health_check(&session.device, &session.results)
        } else {
            self.execute_kind(&ctx, &session.device, def, &session.cancel)
                .await
        };

        let device_lost = session.device_lost.load(Ordering::Relaxed);
        let run = &mut session.runs[idx];
        run.raw_output = execution.raw;
        match execution.verdict {
            Ok(RunVerdict::Completed { result, message }) => {
                run.result = result;
                run.finish(TestState::Succeeded, message);
            }
            Ok(RunVerdict::Skipped(message)) => {
                run.finish(TestState::Skipped, message);
            }
            Err(EngineError::Cancelled) if device_lost => {
                run.error = Some("device disappeared".to_string());
                run.finish(TestState::Failed, "device disappeared during test");
            }
            Err(EngineError::Cancelled) => {
                run.finish(TestState::Cancelled, "cancelled");
            }
            Err(EngineError::ToolTimeout(secs, tool)) => {
                run.error = Some(format!("{} exceeded {}s", tool, secs));
                run.finish(TestState::TimedOut, format!("timed out after {}s", secs));
            }
            Err(EngineError::PrivilegeInsufficient(msg)) => {
                run.finish(TestState::Skipped, format!("skipped: {}", msg));
            }
            Err(err) => {
                run.error = Some(err.to_string());
                run.finish(TestState::Failed, err.to_string());
            }
        }

        let terminal = session.runs[idx].state;
        let percent = if terminal == TestState::Succeeded { Some(100) } else { None };
        self.emit(&ctx, terminal, percent, &session.runs[idx].message.clone());

        // Fold the normalized result into the session's knowledge.
        if let Some(result) = session.runs[idx].result.clone() {
            if let NormalizedResult::CapacityProbe(probe) = &result {
                session
                    .detector
                    .observe_capacity_probe(&session.device, probe);
            }
            session.results.push(result);
        }
    }

    /// Pending runs left after a break transition straight to Cancelled,
    /// or to Failed when the device itself went away.
    fn finalize_leftovers(&self, session: &mut DiagnosticSession) {
        let device_lost = session.device_lost.load(Ordering::Relaxed);
        for run in &mut session.runs {
            if run.state.is_terminal() {
                continue;
            }
            let ctx = RunCtx {
                session_id: session.id,
                device_id: session.device.id.clone(),
                kind: run.test,
            };
            if device_lost {
                run.error = Some("device disappeared".to_string());
                run.finish(TestState::Failed, "device disappeared");
            } else {
                run.finish(TestState::Cancelled, "session cancelled");
            }
            self.emit(&ctx, run.state, None, &run.message);
        }
    }

    fn build_report(&self, session: &DiagnosticSession) -> DiagnosticReport {
        let fake = session.detector.assessment();
        let last_probe = session.results.iter().rev().find_map(|r| match r {
            NormalizedResult::CapacityProbe(p) => Some(p),
            _ => None,
        });
        let actions = remediation::advise(&fake, last_probe, &session.device, &self.tools);
        DiagnosticReport {
            session_id: session.id,
            generated_at: Utc::now(),
            device: session.device.clone(),
            session_state: session.state,
            health: session.health.clone(),
            fake,
            runs: session.runs.iter().map(Into::into).collect(),
            actions,
        }
    }

    fn emit(&self, ctx: &RunCtx, state: TestState, percent: Option<u8>, message: &str) {
        self.progress.report_status(
            ctx.session_id,
            &ctx.device_id,
            ctx.kind,
            state,
            percent,
            message,
        );
    }

    fn tool(&self, def: &TestDefinition) -> Result<PathBuf> {
        let kind = def
            .tool
            .ok_or_else(|| EngineError::SystemError("test has no backing tool".to_string()))?;
        self.tools
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::ToolUnavailable(kind.name().to_string()))
    }

    async fn execute_kind(
        &self,
        ctx: &RunCtx,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        match def.kind {
            TestKind::SmartInfo => self.run_smart_info(device, def, cancel).await,
            TestKind::FakeQuick => self.run_fake_quick(device, def, cancel).await,
            TestKind::SmartShort | TestKind::SmartExtended => {
                self.run_self_test(ctx, device, def, cancel).await
            }
            TestKind::ReadSample => self.run_read_sample(ctx, device, def, cancel).await,
            TestKind::SpeedTest => self.run_speed_test(device, def, cancel).await,
            TestKind::F3Probe => self.run_f3probe(device, def, cancel).await,
            TestKind::BadblocksRo | TestKind::BadblocksRw | TestKind::BadblocksWipe => {
                self.run_badblocks(ctx, device, def, cancel).await
            }
            TestKind::HealthCheck => unreachable!("health check handled by the caller"),
        }
    }

    /// Collect `smartctl -a`, retrying across driver hints for USB
    /// bridges the way the underlying tool expects.
    async fn run_smart_info(
        &self,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let smartctl = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };

        let mut combined = String::new();
        for driver in SMARTCTL_DRIVERS {
            let mut args: Vec<String> = vec!["-a".to_string()];
            if !driver.is_empty() {
                args.push("-d".to_string());
                args.push(driver.to_string());
            }
            args.push(device.path.clone());

            match ToolInvoker::execute(&smartctl, &args, def.timeout, cancel).await {
                Ok(out) => {
                    combined = out.combined();
                    if !combined.contains("Unknown USB bridge") {
                        break;
                    }
                }
                Err(e) => return RunExecution::err(None, e),
            }
        }

        match smart::parse_smart(&combined) {
            Ok(data) => {
                let message = if data.model.is_empty() {
                    "SMART data collected".to_string()
                } else {
                    format!("SMART data collected: {}", data.model)
                };
                RunExecution::ok(
                    Some(combined),
                    Some(NormalizedResult::SmartAttributes(data)),
                    message,
                )
            }
            Err(e) => RunExecution::err(Some(combined), e.into()),
        }
    }

    /// Pure: folds the results gathered so far into a health score.
    fn run_health_check(&self, device: &Device, results: &[NormalizedResult]) -> RunExecution {
        let has_smart = results
            .iter()
            .any(|r| matches!(r, NormalizedResult::SmartAttributes(_)));
        if !has_smart {
            return RunExecution::err(
                None,
                EngineError::InvalidParameter("no SMART data collected".to_string()),
            );
        }
        let assessment = scoring::calculate_health(device, results, &self.config.scoring);
        let message = format!("Health: {:?} ({}%)", assessment.level, assessment.score);
        RunExecution::ok(None, None, message)
    }

    async fn run_fake_quick(
        &self,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let hdparm = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };
        let args = vec!["-N".to_string(), device.path.clone()];
        let out = match ToolInvoker::execute(&hdparm, &args, def.timeout, cancel).await {
            Ok(out) => out,
            Err(e) => return RunExecution::err(None, e),
        };
        let combined = out.combined();
        match capacity::parse_hdparm_hpa(&combined) {
            Ok(probe) => {
                let message = match probe.hpa_hidden_sectors() {
                    Some(hidden) => format!("HPA detected: {} sectors hidden", hidden),
                    None => "no hidden area; capacity consistent".to_string(),
                };
                RunExecution::ok(
                    Some(combined),
                    Some(NormalizedResult::CapacityProbe(probe)),
                    message,
                )
            }
            Err(e) => RunExecution::err(Some(combined), e.into()),
        }
    }

    /// Kick off a drive self-test, then poll the self-test log until it
    /// completes, checking cancellation every poll cycle.
    async fn run_self_test(
        &self,
        ctx: &RunCtx,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let smartctl = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };
        let routine = if def.kind == TestKind::SmartExtended { "long" } else { "short" };

        let mut started = false;
        let mut last_output = String::new();
        for driver in SMARTCTL_DRIVERS {
            let mut args: Vec<String> = vec!["-t".to_string(), routine.to_string()];
            if !driver.is_empty() {
                args.push("-d".to_string());
                args.push(driver.to_string());
            }
            args.push(device.path.clone());

            match ToolInvoker::execute(&smartctl, &args, Duration::from_secs(30), cancel).await {
                Ok(out) => {
                    last_output = out.combined();
                    if last_output.contains("Testing has begun")
                        || last_output.contains("Self-test routine")
                    {
                        started = true;
                        break;
                    }
                    if !last_output.contains("Unknown USB bridge") && out.exit_code == 0 {
                        started = true;
                        break;
                    }
                }
                Err(e) => return RunExecution::err(None, e),
            }
        }

        if !started {
            let lower = last_output.to_lowercase();
            if lower.contains("already in progress") || lower.contains("aborting current test") {
                return RunExecution::skip(Some(last_output), "self-test already in progress");
            }
            if lower.contains("invalid") || lower.contains("not supported") {
                return RunExecution::skip(
                    Some(last_output),
                    "self-test not supported on this device",
                );
            }
            return RunExecution::err(
                Some(last_output),
                EngineError::SystemError("failed to start self-test".to_string()),
            );
        }

        let estimated = def.estimated.as_secs_f64();
        let started_at = Instant::now();
        let log_args = vec![
            "-l".to_string(),
            "selftest".to_string(),
            device.path.clone(),
        ];
        loop {
            if cancel.is_cancelled() {
                return RunExecution::err(None, EngineError::Cancelled);
            }
            if started_at.elapsed() > def.timeout {
                return RunExecution::err(
                    None,
                    EngineError::ToolTimeout(def.timeout.as_secs(), "smartctl selftest".to_string()),
                );
            }
            tokio::time::sleep(SELF_TEST_POLL).await;

            let elapsed = started_at.elapsed().as_secs_f64();
            let percent = (10.0 + (elapsed / estimated) * 85.0).min(95.0) as u8;
            self.emit(
                ctx,
                TestState::Running,
                Some(percent),
                &format!(
                    "self-test running... ({})",
                    crate::utils::format_duration(elapsed)
                ),
            );

            let out = match ToolInvoker::execute(
                &smartctl,
                &log_args,
                Duration::from_secs(15),
                cancel,
            )
            .await
            {
                Ok(out) => out,
                Err(EngineError::Cancelled) => {
                    return RunExecution::err(None, EngineError::Cancelled)
                }
                Err(_) => continue, // transient log read failure
            };
            let log = out.combined();
            match smart::parse_self_test_log(&log) {
                smart::SelfTestStatus::Passed => {
                    let data = SmartData {
                        self_test_passed: Some(true),
                        ..SmartData::default()
                    };
                    return RunExecution::ok(
                        Some(log),
                        Some(NormalizedResult::SmartAttributes(data)),
                        "self-test completed without error",
                    );
                }
                smart::SelfTestStatus::Failed => {
                    let data = SmartData {
                        self_test_passed: Some(false),
                        ..SmartData::default()
                    };
                    return RunExecution::ok(
                        Some(log),
                        Some(NormalizedResult::SmartAttributes(data)),
                        "self-test detected problems",
                    );
                }
                smart::SelfTestStatus::InProgress(remaining) => {
                    if let Some(rem) = remaining {
                        self.emit(
                            ctx,
                            TestState::Running,
                            Some(100u8.saturating_sub(rem).min(95)),
                            "self-test running...",
                        );
                    }
                }
                smart::SelfTestStatus::Unknown => {
                    // Some bridges never expose the log; report what we
                    // know once the estimate is well past.
                    if started_at.elapsed().as_secs_f64() > estimated + 60.0 {
                        return RunExecution::ok(
                            Some(log),
                            None,
                            "self-test started; check results later",
                        );
                    }
                }
            }
        }
    }

    /// Random 1 MiB reads spread across the device.
    async fn run_read_sample(
        &self,
        ctx: &RunCtx,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let dd = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };
        if device.capacity_bytes < SAMPLE_BYTES {
            return RunExecution::skip(None, "device too small for sampled reads");
        }

        let max_block = (device.capacity_bytes / SAMPLE_BYTES).saturating_sub(1).max(1);
        let mut speeds = Vec::new();
        let mut errors = 0u32;
        let mut raw = String::new();

        for i in 0..READ_SAMPLES {
            if cancel.is_cancelled() {
                return RunExecution::err(Some(raw), EngineError::Cancelled);
            }
            let skip = rand::thread_rng().gen_range(0..max_block);
            let args = vec![
                format!("if={}", device.path),
                "of=/dev/null".to_string(),
                "bs=1M".to_string(),
                "count=1".to_string(),
                format!("skip={}", skip),
                "iflag=direct".to_string(),
            ];
            let percent = (10 + i * 85 / READ_SAMPLES) as u8;
            self.emit(
                ctx,
                TestState::Running,
                Some(percent),
                &format!("reading sample {}/{}", i + 1, READ_SAMPLES),
            );

            match ToolInvoker::execute(&dd, &args, Duration::from_secs(30), cancel).await {
                Ok(out) if out.exit_code == 0 => {
                    raw.push_str(&out.stderr);
                    if let Ok(mbps) = speed::parse_dd_speed(&out.stderr) {
                        speeds.push(mbps);
                    }
                }
                Ok(out) => {
                    raw.push_str(&out.stderr);
                    errors += 1;
                }
                Err(EngineError::Cancelled) => {
                    return RunExecution::err(Some(raw), EngineError::Cancelled)
                }
                Err(EngineError::ToolTimeout(_, _)) => errors += 1,
                Err(e) => return RunExecution::err(Some(raw), e),
            }
        }

        let sample = speed::aggregate_samples(&speeds, AccessPattern::Random, errors);
        let message = if errors > 0 {
            format!("{} read errors in {} samples", errors, READ_SAMPLES)
        } else {
            format!(
                "all {} samples read ({:.1} MB/s avg)",
                READ_SAMPLES, sample.mean_mbps
            )
        };
        RunExecution::ok(
            Some(raw),
            Some(NormalizedResult::SpeedSample(sample)),
            message,
        )
    }

    /// Timed sequential reads over several regions; the parser trims
    /// hiccups before averaging.
    async fn run_speed_test(
        &self,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let dd = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };

        let mut speeds = Vec::new();
        let mut errors = 0u32;
        let mut raw = String::new();
        for i in 0..SPEED_CHUNKS {
            if cancel.is_cancelled() {
                return RunExecution::err(Some(raw), EngineError::Cancelled);
            }
            let args = vec![
                format!("if={}", device.path),
                "of=/dev/null".to_string(),
                "bs=1M".to_string(),
                format!("count={}", SPEED_CHUNK_MB),
                format!("skip={}", i as u64 * SPEED_CHUNK_MB),
                "iflag=direct".to_string(),
            ];
            match ToolInvoker::execute(&dd, &args, Duration::from_secs(60), cancel).await {
                Ok(out) if out.exit_code == 0 => {
                    raw.push_str(&out.stderr);
                    if let Ok(mbps) = speed::parse_dd_speed(&out.stderr) {
                        speeds.push(mbps);
                    }
                }
                Ok(out) => {
                    raw.push_str(&out.stderr);
                    errors += 1;
                }
                Err(EngineError::Cancelled) => {
                    return RunExecution::err(Some(raw), EngineError::Cancelled)
                }
                Err(e) => return RunExecution::err(Some(raw), e),
            }
        }

        if speeds.is_empty() {
            return RunExecution::err(
                Some(raw),
                EngineError::SystemError("could not read from device".to_string()),
            );
        }
        let sample = speed::aggregate_samples(&speeds, AccessPattern::Sequential, errors);
        let label = if sample.mean_mbps > 100.0 {
            "excellent"
        } else if sample.mean_mbps > 50.0 {
            "good"
        } else if sample.mean_mbps > 20.0 {
            "acceptable"
        } else {
            "slow"
        };
        let message = format!("read speed {:.1} MB/s ({})", sample.mean_mbps, label);
        RunExecution::ok(
            Some(raw),
            Some(NormalizedResult::SpeedSample(sample)),
            message,
        )
    }

    /// Destructive full-capacity probe. The probe's exit code carries
    /// its verdict; the run succeeds either way and the result decides.
    async fn run_f3probe(
        &self,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let f3probe = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };
        let args = vec![
            "--destructive".to_string(),
            "--time-ops".to_string(),
            device.path.clone(),
        ];
        let out = match ToolInvoker::execute(&f3probe, &args, def.timeout, cancel).await {
            Ok(out) => out,
            Err(e) => return RunExecution::err(None, e),
        };
        let combined = out.combined();
        if combined.to_lowercase().contains("permission denied") {
            return RunExecution::err(
                Some(combined),
                EngineError::PrivilegeInsufficient("f3probe needs elevated access".to_string()),
            );
        }
        match capacity::parse_f3probe(&combined, out.exit_code) {
            Ok(probe) => {
                let message = match probe.fake_reported {
                    Some(true) => "counterfeit device detected".to_string(),
                    Some(false) => "device verified genuine".to_string(),
                    None => "probe inconclusive".to_string(),
                };
                RunExecution::ok(
                    Some(combined),
                    Some(NormalizedResult::CapacityProbe(probe)),
                    message,
                )
            }
            Err(e) => RunExecution::err(Some(combined), e.into()),
        }
    }

    /// badblocks scan; "% done" lines stream from stderr into progress
    /// events while the child runs.
    async fn run_badblocks(
        &self,
        ctx: &RunCtx,
        device: &Device,
        def: &TestDefinition,
        cancel: &CancelFlag,
    ) -> RunExecution {
        let badblocks = match self.tool(def) {
            Ok(p) => p,
            Err(e) => return RunExecution::err(None, e),
        };
        let mut args = vec![
            "-s".to_string(),
            "-v".to_string(),
            "-b".to_string(),
            BADBLOCKS_BLOCK_SIZE.to_string(),
            "-c".to_string(),
            BADBLOCKS_BLOCKS_AT_ONCE.to_string(),
        ];
        match def.kind {
            TestKind::BadblocksRw => args.push("-n".to_string()),
            TestKind::BadblocksWipe => args.push("-w".to_string()),
            _ => {}
        }
        args.push(device.path.clone());

        let out = match ToolInvoker::execute_streaming(
            &badblocks,
            &args,
            def.timeout,
            cancel,
            |line| {
                if line.contains("done") {
                    if let Some(pct) = extract_percentage(line) {
                        self.emit(
                            ctx,
                            TestState::Running,
                            Some(pct.min(99.0) as u8),
                            &format!("scanning... {:.0}%", pct),
                        );
                    }
                }
            },
        )
        .await
        {
            Ok(out) => out,
            Err(e) => return RunExecution::err(None, e),
        };

        match defects::parse_badblocks(&out.stdout, BADBLOCKS_BLOCK_SIZE) {
            Ok(list) => {
                let message = if list.bad_blocks == 0 {
                    "no defective blocks".to_string()
                } else {
                    format!("{} defective blocks found", list.bad_blocks)
                };
                RunExecution::ok(
                    Some(out.combined()),
                    Some(NormalizedResult::DefectList(list)),
                    message,
                )
            }
            Err(e) => RunExecution::err(Some(out.combined()), e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceClass, FakeVerdict};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    const SMART_FIXTURE: &str = "\
Device Model:     WDC WD40EFRX-68N32N0
Serial Number:    WD-WCC7K1234567
User Capacity:    240,057,409,536 bytes [240 GB]
SMART support is: Available - device has SMART capability.
SMART support is: Enabled
SMART overall-health self-assessment test result: PASSED

ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  5 Reallocated_Sector_Ct   0x0033   200   200   140    Pre-fail  Always       -       0
  9 Power_On_Hours          0x0032   099   099   000    Old_age   Always       -       1250
194 Temperature_Celsius     0x0022   117   106   000    Old_age   Always       -       33
197 Current_Pending_Sector  0x0032   200   200   000    Old_age   Always       -       0
";

    // 468862128 sectors * 512 = the device capacity below.
    const HDPARM_FIXTURE: &str =
        "/dev/sdb:\n max sectors   = 468862128/468862128, HPA is disabled\n";

    fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn fixture_tool(dir: &Path, name: &str, fixture: &str) -> PathBuf {
        write_tool(dir, name, &format!("cat <<'FIXTURE'\n{}\nFIXTURE", fixture))
    }

    fn device(class: DeviceClass) -> Device {
        Device {
            id: "sdb".to_string(),
            path: "/dev/sdb".to_string(),
            capacity_bytes: 468_862_128 * 512,
            bus: "SATA".to_string(),
            class,
            model: "WDC WD40EFRX".to_string(),
            serial: "WD-WCC7K1234567".to_string(),
            mounted: false,
        }
    }

    fn test_config(report_dir: &Path) -> EngineConfig {
        EngineConfig {
            max_parallel_devices: 4,
            capacity_tolerance_pct: 5.0,
            scoring: Default::default(),
            report_dir: report_dir.to_path_buf(),
            privileged: true,
        }
    }

    fn quick_tools(dir: &Path) -> ToolPaths {
        ToolPaths {
            smartctl: Some(fixture_tool(dir, "smartctl", SMART_FIXTURE)),
            hdparm: Some(fixture_tool(dir, "hdparm", HDPARM_FIXTURE)),
            ..ToolPaths::default()
        }
    }

    #[tokio::test]
    async fn quick_session_runs_to_complete() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(dir.path()), quick_tools(dir.path()));
        let mut session = orch.plan_session(device(DeviceClass::Hdd), DiagnosticProfile::Quick);

        let report = orch.run_session(&mut session).await.unwrap();

        assert_eq!(session.state, SessionState::Complete);
        let states: Vec<TestState> = session.runs.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![TestState::Succeeded, TestState::Succeeded, TestState::Succeeded]
        );
        let health = report.health.expect("health assessment present");
        assert!(health.score >= 90);
        assert_eq!(report.fake.verdict, FakeVerdict::LikelyGenuine);
        assert_eq!(report.runs.len(), 3);
    }

    #[tokio::test]
    async fn missing_tool_fails_run_but_session_completes() {
        let dir = TempDir::new().unwrap();
        let tools = ToolPaths {
            smartctl: Some(fixture_tool(dir.path(), "smartctl", SMART_FIXTURE)),
            hdparm: None,
            ..ToolPaths::default()
        };
        let orch = Orchestrator::new(test_config(dir.path()), tools);
        let mut session = orch.plan_session(device(DeviceClass::Hdd), DiagnosticProfile::Quick);

        orch.run_session(&mut session).await.unwrap();

        assert_eq!(session.state, SessionState::Complete);
        let fake_quick = session
            .runs
            .iter()
            .find(|r| r.test == TestKind::FakeQuick)
            .unwrap();
        assert_eq!(fake_quick.state, TestState::Failed);
        assert!(fake_quick.message.contains("tool unavailable"));
        assert!(session
            .runs
            .iter()
            .filter(|r| r.test != TestKind::FakeQuick)
            .all(|r| r.state == TestState::Succeeded));
    }

    #[tokio::test]
    async fn destructive_tests_are_rejected_without_confirmation() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(dir.path()), quick_tools(dir.path()));
        for class in [
            DeviceClass::Hdd,
            DeviceClass::Ssd,
            DeviceClass::Nvme,
            DeviceClass::Unknown,
        ] {
            let mut session = orch.plan_session(device(class), DiagnosticProfile::Quick);
            let err = orch
                .request_test(&mut session, TestKind::F3Probe, None)
                .unwrap_err();
            assert!(matches!(err, EngineError::PreconditionViolation(_)));
            assert!(session.runs.iter().all(|r| r.test != TestKind::F3Probe));
        }
    }

    #[tokio::test]
    async fn confirmed_destructive_request_is_scheduled() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(dir.path()), quick_tools(dir.path()));
        let mut session = orch.plan_session(device(DeviceClass::Hdd), DiagnosticProfile::Quick);
        orch.request_test(
            &mut session,
            TestKind::F3Probe,
            Some(Confirmation::acknowledge_data_loss()),
        )
        .unwrap();
        let run = session
            .runs
            .iter()
            .find(|r| r.test == TestKind::F3Probe)
            .unwrap();
        assert!(run.destructive_confirmed);
        assert_eq!(run.state, TestState::Pending);
    }

    #[tokio::test]
    async fn privilege_requiring_runs_are_skipped_not_failed() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.privileged = false;
        let orch = Orchestrator::new(config, quick_tools(dir.path()));
        let mut session = orch.plan_session(device(DeviceClass::Hdd), DiagnosticProfile::Quick);

        orch.run_session(&mut session).await.unwrap();

        let smart_info = session
            .runs
            .iter()
            .find(|r| r.test == TestKind::SmartInfo)
            .unwrap();
        assert_eq!(smart_info.state, TestState::Skipped);
        assert!(smart_info.message.contains("insufficient privilege"));
        // The pure health check ran (and failed for lack of data), so
        // not every run was skipped: the session still completes.
        assert_eq!(session.state, SessionState::Complete);
    }

    #[tokio::test]
    async fn session_with_every_run_skipped_aborts() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.privileged = false;
        let orch = Orchestrator::new(config, quick_tools(dir.path()));
        let mut session = orch.plan_empty(device(DeviceClass::Hdd), DiagnosticProfile::Quick);
        orch.request_test(&mut session, TestKind::SmartInfo, None).unwrap();
        orch.request_test(&mut session, TestKind::FakeQuick, None).unwrap();

        orch.run_session(&mut session).await.unwrap();

        assert!(session.runs.iter().all(|r| r.state == TestState::Skipped));
        assert_eq!(session.state, SessionState::Aborted);
    }

    #[tokio::test]
    async fn cancellation_marks_running_and_pending_runs_cancelled() {
        let dir = TempDir::new().unwrap();
        let tools = ToolPaths {
            smartctl: Some(write_tool(dir.path(), "smartctl", "sleep 30")),
            hdparm: Some(fixture_tool(dir.path(), "hdparm", HDPARM_FIXTURE)),
            ..ToolPaths::default()
        };
        let orch = Orchestrator::new(test_config(dir.path()), tools);
        let mut session = orch.plan_session(device(DeviceClass::Hdd), DiagnosticProfile::Quick);
        let handle = session.handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Orchestrator::cancel_session(&handle);
        });

        let started = Instant::now();
        orch.run_session(&mut session).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        assert_eq!(session.state, SessionState::Aborted);
        let smart_info = session
            .runs
            .iter()
            .find(|r| r.test == TestKind::SmartInfo)
            .unwrap();
        assert_eq!(smart_info.state, TestState::Cancelled);
        assert!(session
            .runs
            .iter()
            .all(|r| r.state == TestState::Cancelled));
    }

    #[tokio::test]
    async fn lost_device_fails_runs_and_aborts_session() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(test_config(dir.path()), quick_tools(dir.path()));
        let mut session = orch.plan_session(device(DeviceClass::Hdd), DiagnosticProfile::Quick);
        let handle = session.handle();

        // Enumeration tick without our device.
        Orchestrator::sync_devices(&[handle], &[]);
        orch.run_session(&mut session).await.unwrap();

        assert_eq!(session.state, SessionState::Aborted);
        assert!(session.runs.iter().all(|r| r.state == TestState::Failed));
        assert!(session.runs[0].message.contains("device disappeared"));
    }

    #[tokio::test]
    async fn at_most_one_run_per_device_at_a_time() {
        let dir = TempDir::new().unwrap();
        let tools = ToolPaths {
            smartctl: Some(write_tool(
                dir.path(),
                "smartctl",
                &format!("sleep 0.4\ncat <<'FIXTURE'\n{}\nFIXTURE", SMART_FIXTURE),
            )),
            ..ToolPaths::default()
        };
        let orch = Arc::new(Orchestrator::new(test_config(dir.path()), tools));
        let mut rx = orch.subscribe();

        let mut a = orch.plan_empty(device(DeviceClass::Hdd), DiagnosticProfile::Quick);
        orch.request_test(&mut a, TestKind::SmartInfo, None).unwrap();
        let mut b = orch.plan_empty(device(DeviceClass::Hdd), DiagnosticProfile::Quick);
        orch.request_test(&mut b, TestKind::SmartInfo, None).unwrap();

        let reports = Arc::clone(&orch).run_all(vec![a, b]).await;
        assert_eq!(reports.len(), 2);

        // Replay the event stream: Running intervals for one device must
        // never nest.
        let mut depth = 0i32;
        while let Ok(event) = rx.try_recv() {
            match event.state {
                TestState::Running if event.percent == Some(0) => {
                    depth += 1;
                    assert_eq!(depth, 1, "second run started while one was running");
                }
                TestState::Succeeded
                | TestState::Failed
                | TestState::Cancelled
                | TestState::TimedOut
                | TestState::Skipped => depth -= 1,
                _ => {}
            }
        }
        assert_eq!(depth, 0);
    }
}
