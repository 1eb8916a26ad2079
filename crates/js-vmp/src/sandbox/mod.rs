//! Isolated execution of short untrusted snippets.
//!
//! Every request runs in a fresh realm, normally inside a `js-vmp-sandbox`
//! child process. The realm's loop budget gives a soft timeout; at
//! `timeout_ms + grace_ms` the child is killed and its slot released. With
//! thread isolation the worker can only be abandoned at that point, and it
//! keeps its limiter slot until it exits.

mod limiter;
#[cfg(feature = "js-sandbox")]
mod realm;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{Isolation, SandboxConfig};

pub use limiter::{Limiter, Permit};

/// File name of the worker executable, without platform suffix.
pub const WORKER_PROGRAM: &str = "js-vmp-sandbox";

/// What string-to-code entry points (`eval`, `Function`, prototype
/// constructors) do inside the realm. Neither mode compiles anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicCodePolicy {
    /// Throw an `EvalError`
    #[default]
    Deny,
    /// Return the would-be source text to the caller
    Capture,
}

impl DynamicCodePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DynamicCodePolicy::Deny => "deny",
            DynamicCodePolicy::Capture => "capture",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxExecuteRequest {
    pub code: String,
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    pub dynamic_code: DynamicCodePolicy,
}

impl Default for SandboxExecuteRequest {
    fn default() -> Self {
        Self::with_defaults(String::new(), &SandboxConfig::default())
    }
}

impl SandboxExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into(), ..Self::default() }
    }

    fn with_defaults(code: String, config: &SandboxConfig) -> Self {
        Self {
            code,
            timeout_ms: config.default_timeout_ms,
            memory_limit_mb: config.default_memory_limit_mb,
            dynamic_code: DynamicCodePolicy::Deny,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_memory_limit(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    pub fn with_dynamic_code(mut self, policy: DynamicCodePolicy) -> Self {
        self.dynamic_code = policy;
        self
    }
}

/// Either `ok` with an optional output, or not `ok` with an error and/or
/// `timed_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxExecuteResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl SandboxExecuteResult {
    fn succeeded(output: Option<serde_json::Value>, started: Instant) -> Self {
        Self {
            ok: true,
            output,
            error: None,
            timed_out: false,
            duration_ms: elapsed_ms(started),
        }
    }

    fn failed(error: impl Into<String>, started: Instant) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error.into()),
            timed_out: false,
            duration_ms: elapsed_ms(started),
        }
    }

    fn timed_out(error: impl Into<String>, started: Instant) -> Self {
        Self { timed_out: true, ..Self::failed(error, started) }
    }

    /// String output, if the snippet produced one.
    pub fn output_str(&self) -> Option<&str> {
        self.output.as_ref().and_then(|v| v.as_str())
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

/// Worker executable named by the config, or found next to the current
/// executable (or one directory up, where test harnesses keep binaries).
fn locate_worker(config: &SandboxConfig) -> Option<PathBuf> {
    if let Some(program) = &config.worker_program {
        return Some(program.clone());
    }
    let exe = std::env::current_exe().ok()?;
    let file_name = format!("{}{}", WORKER_PROGRAM, std::env::consts::EXE_SUFFIX);
    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    limiter: Arc<Limiter>,
    worker: Option<PathBuf>,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        let limiter = Limiter::new(config.max_concurrency);
        let worker = match config.isolation {
            Isolation::Thread => None,
            Isolation::Auto | Isolation::Process => locate_worker(&config),
        };
        debug!(isolation = ?config.isolation, worker = ?worker, "sandbox configured");
        Self { config, limiter, worker }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Worker executable used for process isolation, if any.
    pub fn worker_program(&self) -> Option<&Path> {
        self.worker.as_deref()
    }

    /// Request for `code` with this sandbox's default timeout and memory limit.
    pub fn request(&self, code: impl Into<String>) -> SandboxExecuteRequest {
        SandboxExecuteRequest::with_defaults(code.into(), &self.config)
    }

    /// Slots currently held by running or abandoned workers.
    pub fn active_workers(&self) -> usize {
        self.limiter.in_use()
    }

    /// Runs `request.code` and always returns within
    /// `timeout_ms + grace_ms`.
    #[instrument(
        skip_all,
        fields(code_len = request.code.len(), timeout_ms = request.timeout_ms)
    )]
    pub fn execute(&self, request: &SandboxExecuteRequest) -> SandboxExecuteResult {
        let started = Instant::now();
        if request.code.len() > self.config.max_code_bytes {
            return SandboxExecuteResult::failed(
                format!(
                    "code of {} bytes exceeds the {} byte limit",
                    request.code.len(),
                    self.config.max_code_bytes
                ),
                started,
            );
        }
        let hard_ms = request.timeout_ms.saturating_add(self.config.grace_ms);
        let deadline = started + Duration::from_millis(hard_ms);
        let Some(permit) = self.limiter.acquire_until(deadline) else {
            warn!(capacity = self.limiter.capacity(), "sandbox admission timed out");
            return SandboxExecuteResult::timed_out(
                "no sandbox slot became free before the deadline",
                started,
            );
        };
        let result = self.dispatch(request, permit, deadline, started);
        debug!(
            ok = result.ok,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            "sandbox finished"
        );
        result
    }

    #[cfg(feature = "js-sandbox")]
    fn dispatch(
        &self,
        request: &SandboxExecuteRequest,
        permit: Permit,
        deadline: Instant,
        started: Instant,
    ) -> SandboxExecuteResult {
        let limits = realm::RealmLimits {
            loop_iterations: request
                .timeout_ms
                .saturating_mul(self.config.loop_iterations_per_ms)
                .max(1_000),
            recursion: self.config.recursion_limit,
            stack_size: 1024 * 1024,
            max_string_length: request.memory_limit_mb.saturating_mul(1024 * 1024) / 2,
            dynamic_code: request.dynamic_code,
        };
        let outcome = match (&self.worker, self.config.isolation) {
            (Some(program), _) => {
                let outcome = process::run(program, &request.code, &limits, deadline);
                drop(permit);
                outcome
            }
            (None, Isolation::Process) => {
                return SandboxExecuteResult::failed(
                    format!("sandbox worker program {} not found", WORKER_PROGRAM),
                    started,
                );
            }
            (None, _) => self.run_thread(&request.code, limits, permit, deadline),
        };
        match outcome {
            WorkerOutcome::Realm(realm::RealmOutcome::Completed(output)) => {
                SandboxExecuteResult::succeeded(output, started)
            }
            WorkerOutcome::Realm(realm::RealmOutcome::Failed(error)) => {
                SandboxExecuteResult::failed(error, started)
            }
            WorkerOutcome::Realm(realm::RealmOutcome::LimitExceeded(error)) => {
                let error = format!("execution limit reached: {}", error);
                SandboxExecuteResult::timed_out(error, started)
            }
            WorkerOutcome::Deadline => {
                warn!(
                    timeout_ms = request.timeout_ms,
                    grace_ms = self.config.grace_ms,
                    "sandbox worker stopped at the hard deadline"
                );
                SandboxExecuteResult::timed_out(
                    format!(
                        "no response within {} ms",
                        request.timeout_ms.saturating_add(self.config.grace_ms)
                    ),
                    started,
                )
            }
            WorkerOutcome::Crashed(error) => SandboxExecuteResult::failed(error, started),
        }
    }

    /// Realm on a thread of this process. The permit moves into the thread.
    #[cfg(feature = "js-sandbox")]
    fn run_thread(
        &self,
        code: &str,
        limits: realm::RealmLimits,
        permit: Permit,
        deadline: Instant,
    ) -> WorkerOutcome {
        use std::sync::mpsc::{self, RecvTimeoutError};

        let code = code.to_string();
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("js-vmp-sandbox".into())
            .stack_size(self.config.worker_stack_bytes)
            .spawn(move || {
                let _permit = permit;
                let _ = tx.send(realm::run(&code, &limits));
            });
        if let Err(err) = spawned {
            return WorkerOutcome::Crashed(format!("failed to start sandbox worker: {}", err));
        }
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(outcome) => WorkerOutcome::Realm(outcome),
            Err(RecvTimeoutError::Timeout) => WorkerOutcome::Deadline,
            Err(RecvTimeoutError::Disconnected) => {
                WorkerOutcome::Crashed("sandbox worker exited unexpectedly".into())
            }
        }
    }

    #[cfg(not(feature = "js-sandbox"))]
    fn dispatch(
        &self,
        _request: &SandboxExecuteRequest,
        _permit: Permit,
        _deadline: Instant,
        started: Instant,
    ) -> SandboxExecuteResult {
        SandboxExecuteResult::failed("sandbox support not compiled", started)
    }
}

#[cfg(feature = "js-sandbox")]
enum WorkerOutcome {
    Realm(realm::RealmOutcome),
    Deadline,
    Crashed(String),
}

/// Child-process workers. The parent writes one JSON request to the child's
/// stdin and reads one JSON outcome from its stdout.
#[cfg(feature = "js-sandbox")]
mod process {
    use std::io::{Read, Write};
    use std::path::Path;
    use std::process::{Command, Stdio};
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::time::Instant;

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    use super::realm::{self, RealmLimits, RealmOutcome};
    use super::WorkerOutcome;

    #[derive(Serialize, Deserialize)]
    pub(super) struct WorkerRequest {
        pub code: String,
        pub limits: RealmLimits,
    }

    pub(super) fn run(
        program: &Path,
        code: &str,
        limits: &RealmLimits,
        deadline: Instant,
    ) -> WorkerOutcome {
        let request = WorkerRequest { code: code.to_string(), limits: *limits };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(err) => {
                return WorkerOutcome::Crashed(format!("failed to encode sandbox request: {}", err))
            }
        };
        let spawned = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return WorkerOutcome::Crashed(format!(
                    "failed to start sandbox worker {}: {}",
                    program.display(),
                    err
                ))
            }
        };
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return WorkerOutcome::Crashed("sandbox worker pipes unavailable".into());
        };

        let (tx, rx) = mpsc::channel();
        let io = std::thread::Builder::new().name("js-vmp-sandbox-io".into()).spawn(move || {
            let exchange = || -> Result<RealmOutcome> {
                stdin.write_all(&payload).context("writing sandbox request")?;
                drop(stdin);
                let mut reply = String::new();
                stdout.read_to_string(&mut reply).context("reading sandbox reply")?;
                serde_json::from_str(&reply).context("decoding sandbox reply")
            };
            let _ = tx.send(exchange());
        });
        if let Err(err) = io {
            let _ = child.kill();
            let _ = child.wait();
            return WorkerOutcome::Crashed(format!("failed to start sandbox io thread: {}", err));
        }

        let outcome = match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(outcome)) => WorkerOutcome::Realm(outcome),
            Ok(Err(err)) => {
                let _ = child.kill();
                let status = child.wait().map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                return WorkerOutcome::Crashed(format!(
                    "sandbox worker exited unexpectedly ({}): {:#}",
                    status, err
                ));
            }
            Err(RecvTimeoutError::Timeout) => WorkerOutcome::Deadline,
            Err(RecvTimeoutError::Disconnected) => {
                WorkerOutcome::Crashed("sandbox io thread exited unexpectedly".into())
            }
        };
        if let Err(err) = child.kill() {
            debug!(error = %err, "sandbox worker already exited");
        }
        let _ = child.wait();
        outcome
    }

    /// Worker side: one request from `input`, one outcome to `output`.
    pub(super) fn serve(mut input: impl Read, mut output: impl Write) -> Result<()> {
        let mut raw = String::new();
        input.read_to_string(&mut raw).context("reading sandbox request")?;
        let request: WorkerRequest =
            serde_json::from_str(&raw).context("decoding sandbox request")?;
        let outcome = realm::run(&request.code, &request.limits);
        serde_json::to_writer(&mut output, &outcome).context("writing sandbox reply")?;
        output.flush().context("flushing sandbox reply")
    }
}

/// Entry point of the `js-vmp-sandbox` worker executable.
#[cfg(feature = "js-sandbox")]
pub fn serve_worker(
    input: impl std::io::Read,
    output: impl std::io::Write,
) -> anyhow::Result<()> {
    process::serve(input, output)
}
