//! Scripted in-memory backend
//!
//! Stands in for isolate in tests and local development. The submitted
//! source is interpreted as a tiny line-oriented script:
//!
//! - `print("text")` / `eprint("text")` write a line to stdout / stderr
//! - `input()` or `echo_stdin` copies stdin to stdout
//! - `sleep(ms)` waits, honoring kill and the time limit
//! - `while True: pass` or `loop` spins until killed or timed out
//! - `hang` never returns and ignores kill
//! - `alloc(mb)` uses memory, breaching the ceiling if above the limit
//! - `spam(n)` writes `n` bytes to stdout
//! - `exit(n)`, `crash` (SIGSEGV), `infra_error` (backend failure)
//!
//! Unrecognized lines are ignored. A compile step fails when the source
//! contains `compile_error`, runs out of memory on a `compile_oom` line and
//! takes `ms` milliseconds for a `compile_sleep(ms)` line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until};
use uuid::Uuid;

use super::backend::{
    ExecIo, ExecOutcome, ExecSpec, ProcessExit, SandboxBackend, SandboxHandle, SandboxSpec,
};

const COMPILERS: &[&str] = &["gcc", "g++", "javac", "rustc", "go"];
const SPAM_CHUNK: usize = 4096;
const BASELINE_MEMORY_KB: u64 = 1024;

#[derive(Debug, Default)]
struct FakeState {
    unavailable: AtomicBool,
    failing_creates: AtomicUsize,
    live: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    creation_order: Mutex<Vec<Uuid>>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the answer of `check_available`
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `create` fail
    pub fn fail_next_creates(&self, n: usize) {
        self.state.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Sandboxes created and not yet destroyed
    pub fn live_sandboxes(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Commands currently executing
    pub fn active_execs(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of commands ever executing at once
    pub fn peak_active(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Execution ids in the order their sandboxes were created
    pub fn creation_order(&self) -> Vec<Uuid> {
        lock(&self.state.creation_order).clone()
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn check_available(&self) -> Result<()> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            bail!("fake backend marked unavailable");
        }
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Box<dyn SandboxHandle>> {
        let should_fail = self
            .state
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!("fake backend refused to create a sandbox");
        }

        self.state.live.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.creation_order).push(spec.execution_id);
        let (killed, _) = watch::channel(false);

        Ok(Box::new(FakeSandbox {
            label: format!("fake-{}", spec.execution_id),
            state: Arc::clone(&self.state),
            files: Mutex::new(HashMap::new()),
            last_written: Mutex::new(None),
            killed,
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeSandbox {
    label: String,
    state: Arc<FakeState>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    last_written: Mutex<Option<String>>,
    killed: watch::Sender<bool>,
    destroyed: AtomicBool,
}

/// Decrements the active counter even when the exec future is aborted
struct ActiveGuard(Arc<FakeState>);

impl ActiveGuard {
    fn enter(state: &Arc<FakeState>) -> Self {
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Wait {
    Elapsed,
    Killed,
    TimedOut,
}

impl FakeSandbox {
    fn script(&self) -> String {
        let name = lock(&self.last_written).clone();
        let files = lock(&self.files);
        name.and_then(|n| files.get(&n).cloned())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    async fn wait(&self, duration: Option<Duration>, deadline: Instant) -> Wait {
        let mut killed = self.killed.subscribe();
        let nap = async {
            match duration {
                Some(d) => sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = killed.wait_for(|k| *k) => Wait::Killed,
            _ = sleep_until(deadline.into()) => Wait::TimedOut,
            _ = nap => Wait::Elapsed,
        }
    }

    async fn compile(&self, spec: &ExecSpec, io: &ExecIo, started: Instant) -> (ProcessExit, u64) {
        let script = self.script();
        if script.contains("compile_error") {
            io.stderr.push(b"main: error: expected ';' before '}' token\n");
            return (ProcessExit::Exited(1), BASELINE_MEMORY_KB);
        }

        for line in script.lines().map(str::trim) {
            if line == "compile_oom" {
                return (ProcessExit::MemoryExceeded, spec.memory_limit_mb * 1024);
            }
            if let Some(ms) = call_arg(line, "compile_sleep").and_then(|v| v.parse().ok()) {
                let deadline = started + spec.time_limit;
                match self.wait(Some(Duration::from_millis(ms)), deadline).await {
                    Wait::Elapsed => {}
                    Wait::Killed => return (ProcessExit::Signaled(9), BASELINE_MEMORY_KB),
                    Wait::TimedOut => return (ProcessExit::TimedOut, BASELINE_MEMORY_KB),
                }
            }
        }
        (ProcessExit::Exited(0), BASELINE_MEMORY_KB)
    }

    async fn run_script(
        &self,
        spec: &ExecSpec,
        io: &ExecIo,
        started: Instant,
    ) -> Result<(ProcessExit, u64)> {
        let deadline = started + spec.time_limit;
        let mut memory_kb = BASELINE_MEMORY_KB;

        for line in self.script().lines().map(str::trim) {
            if let Some(text) = call_arg(line, "print") {
                io.stdout.push(format!("{}\n", text).as_bytes());
            } else if let Some(text) = call_arg(line, "eprint") {
                io.stderr.push(format!("{}\n", text).as_bytes());
            } else if line == "input()" || line == "echo_stdin" {
                if let Some(input) = &io.stdin {
                    io.stdout.push(input);
                }
            } else if let Some(ms) = call_arg(line, "sleep").and_then(|v| v.parse().ok()) {
                match self.wait(Some(Duration::from_millis(ms)), deadline).await {
                    Wait::Elapsed => {}
                    Wait::Killed => return Ok((ProcessExit::Signaled(9), memory_kb)),
                    Wait::TimedOut => return Ok((ProcessExit::TimedOut, memory_kb)),
                }
            } else if line == "loop" || line.starts_with("while True") {
                match self.wait(None, deadline).await {
                    Wait::Killed | Wait::Elapsed => {
                        return Ok((ProcessExit::Signaled(9), memory_kb))
                    }
                    Wait::TimedOut => return Ok((ProcessExit::TimedOut, memory_kb)),
                }
            } else if line == "hang" {
                std::future::pending::<()>().await;
            } else if let Some(mb) = call_arg(line, "alloc").and_then(|v| v.parse::<u64>().ok()) {
                if mb > spec.memory_limit_mb {
                    return Ok((ProcessExit::MemoryExceeded, spec.memory_limit_mb * 1024));
                }
                memory_kb = memory_kb.max(mb * 1024);
            } else if let Some(n) = call_arg(line, "spam").and_then(|v| v.parse::<usize>().ok()) {
                let chunk = [b'x'; SPAM_CHUNK];
                let mut left = n;
                while left > 0 {
                    let take = left.min(SPAM_CHUNK);
                    io.stdout.push(&chunk[..take]);
                    left -= take;
                }
            } else if let Some(code) = call_arg(line, "exit").and_then(|v| v.parse().ok()) {
                return Ok((ProcessExit::Exited(code), memory_kb));
            } else if line == "crash" {
                return Ok((ProcessExit::Signaled(11), memory_kb));
            } else if line == "infra_error" {
                bail!("fake backend infrastructure failure");
            }
        }

        Ok((ProcessExit::Exited(0), memory_kb))
    }
}

#[async_trait]
impl SandboxHandle for FakeSandbox {
    fn id(&self) -> &str {
        &self.label
    }

    async fn write_file(&self, name: &str, content: &[u8]) -> Result<()> {
        lock(&self.files).insert(name.to_string(), content.to_vec());
        *lock(&self.last_written) = Some(name.to_string());
        Ok(())
    }

    async fn exec(&self, spec: &ExecSpec, io: ExecIo) -> Result<ExecOutcome> {
        if self.destroyed.load(Ordering::SeqCst) {
            bail!("exec on destroyed sandbox {}", self.label);
        }
        let _active = ActiveGuard::enter(&self.state);
        let started = Instant::now();

        let is_compile = spec
            .command
            .first()
            .is_some_and(|program| COMPILERS.contains(&program.as_str()));

        let (exit, memory_kb) = if is_compile {
            self.compile(spec, &io, started).await
        } else {
            self.run_script(spec, &io, started).await?
        };

        Ok(ExecOutcome {
            exit,
            time_ms: started.elapsed().as_millis() as u64,
            memory_kb: Some(memory_kb),
        })
    }

    async fn kill(&self) -> Result<()> {
        self.killed.send_replace(true);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.killed.send_replace(true);
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// `name(arg)` -> `arg`, with surrounding quotes removed
fn call_arg<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let inner = line
        .strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')?
        .trim();
    Some(
        inner
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(inner),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
