//! Isolate box management
//!
//! Backend built on the isolate sandbox (https://github.com/ioi/isolate).
//! Each handle owns one box: initialized on create, cleaned up on destroy.
//! Programs run as isolate's unprivileged box user, without network unless
//! configured, with read-only system directories and a writable box dir.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{
    ExecIo, ExecOutcome, ExecSpec, ProcessExit, SandboxBackend, SandboxHandle, SandboxSpec,
};
use super::config::{BoxIdPool, IsolateSettings};
use super::meta::{parse_meta, IsolateStatus};
use super::output::pump;

/// Image reference meaning "use the host's system directories"
pub const HOST_IMAGE: &str = "host";
/// Mount point of a toolchain root inside the box
const TOOLCHAIN_MOUNT: &str = "/toolchain";

pub struct IsolateBackend {
    settings: Arc<IsolateSettings>,
    pool: Arc<BoxIdPool>,
}

impl IsolateBackend {
    pub fn new(settings: IsolateSettings) -> Self {
        let pool = BoxIdPool::new(settings.box_id_range());
        Self {
            settings: Arc::new(settings),
            pool: Arc::new(pool),
        }
    }

    pub fn settings(&self) -> &IsolateSettings {
        &self.settings
    }

    /// Initialize a box, returning its directory
    async fn init_box(&self, box_id: u32) -> Result<String> {
        // Clean up any box left behind by a crashed process
        let _ = cleanup_box(&self.settings, box_id).await;

        let mut args = vec!["--box-id".to_string(), box_id.to_string()];
        if self.settings.use_cgroups {
            args.push("--cg".to_string());
        }
        args.push("--init".to_string());

        let output = Command::new(&self.settings.isolate_bin)
            .args(&args)
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box {}: {}", box_id, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    fn name(&self) -> &str {
        "isolate"
    }

    async fn check_available(&self) -> Result<()> {
        let box_id = self
            .pool
            .acquire()
            .context("No free isolate box for the availability check")?;
        let init = self.init_box(box_id).await;
        let cleanup = cleanup_box(&self.settings, box_id).await;
        self.pool.release(box_id);

        init.with_context(|| {
            format!(
                "Isolate is not usable (cgroups required: {})",
                self.settings.use_cgroups
            )
        })?;
        cleanup
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Box<dyn SandboxHandle>> {
        let box_id = self.pool.acquire().context("All isolate boxes are in use")?;

        let box_path = match self.init_box(box_id).await {
            Ok(path) => path,
            Err(e) => {
                self.pool.release(box_id);
                return Err(e);
            }
        };
        info!(
            "Initialized isolate box {} at {} for execution {} (cgroups: {})",
            box_id, box_path, spec.execution_id, self.settings.use_cgroups
        );

        Ok(Box::new(IsolateSandbox {
            label: format!("isolate-{}", box_id),
            box_id,
            box_path: PathBuf::from(box_path),
            spec: spec.clone(),
            settings: Arc::clone(&self.settings),
            pool: Arc::clone(&self.pool),
            child_pid: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// One isolate box, owned by a single execution
pub struct IsolateSandbox {
    label: String,
    box_id: u32,
    box_path: PathBuf,
    spec: SandboxSpec,
    settings: Arc<IsolateSettings>,
    pool: Arc<BoxIdPool>,
    /// Pid of the `isolate --run` keeper while a command is running
    child_pid: Mutex<Option<u32>>,
    destroyed: AtomicBool,
}

impl IsolateSandbox {
    /// Working directory for programs (the box/box subdirectory)
    pub fn work_dir(&self) -> PathBuf {
        self.box_path.join("box")
    }

    fn set_child_pid(&self, pid: Option<u32>) {
        match self.child_pid.lock() {
            Ok(mut guard) => *guard = pid,
            Err(poisoned) => *poisoned.into_inner() = pid,
        }
    }

    fn child_pid(&self) -> Option<u32> {
        match self.child_pid.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SandboxHandle for IsolateSandbox {
    fn id(&self) -> &str {
        &self.label
    }

    async fn write_file(&self, name: &str, content: &[u8]) -> Result<()> {
        if !is_safe_file_name(name) {
            anyhow::bail!("Refusing to write unsafe file name {:?}", name);
        }
        let dest = self.work_dir().join(name);
        fs::write(&dest, content)
            .await
            .with_context(|| format!("Failed to write {:?}", dest))
    }

    async fn exec(&self, spec: &ExecSpec, io: ExecIo) -> Result<ExecOutcome> {
        let meta_path = tempfile::Builder::new()
            .prefix(&format!("isolate_meta_{}_", self.box_id))
            .suffix(".txt")
            .tempfile()
            .context("Failed to create isolate meta file")?
            .into_temp_path();

        let args = build_run_args(&self.settings, self.box_id, &self.spec, spec, &meta_path);
        debug!("Running isolate with args: {:?}", args);

        let mut child = Command::new(&self.settings.isolate_bin)
            .args(&args)
            .stdin(if io.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to run isolate")?;
        self.set_child_pid(child.id());

        let stdout = child.stdout.take().context("isolate stdout not captured")?;
        let stderr = child.stderr.take().context("isolate stderr not captured")?;
        let stdout_task = tokio::spawn(pump(stdout, io.stdout.clone()));
        let stderr_task = tokio::spawn(pump(stderr, io.stderr.clone()));

        if let (Some(input), Some(mut pipe)) = (io.stdin, child.stdin.take()) {
            // The program may exit without reading its input; EPIPE is expected then.
            tokio::spawn(async move {
                let _ = pipe.write_all(&input).await;
            });
        }

        let status = child.wait().await;
        self.set_child_pid(None);
        let status = status.context("Failed to wait for isolate")?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let meta_content = fs::read_to_string(&meta_path).await.unwrap_or_default();
        if meta_content.trim().is_empty() {
            anyhow::bail!(
                "isolate exited with {} without writing a meta file (box {})",
                status,
                self.box_id
            );
        }
        let meta = parse_meta(&meta_content);

        let memory_limit_kb = spec.memory_limit_mb * 1024;
        let exit = if meta.memory_exceeded(memory_limit_kb) {
            ProcessExit::MemoryExceeded
        } else {
            match meta.status {
                IsolateStatus::Ok | IsolateStatus::RuntimeError => {
                    ProcessExit::Exited(meta.exit_code)
                }
                IsolateStatus::TimeOut => ProcessExit::TimedOut,
                IsolateStatus::Signal(sig) => ProcessExit::Signaled(sig),
                IsolateStatus::InternalError => anyhow::bail!(
                    "isolate internal error in box {}: {}",
                    self.box_id,
                    meta.message.as_deref().unwrap_or("no message")
                ),
            }
        };

        Ok(ExecOutcome {
            exit,
            time_ms: meta.time_ms.max(meta.wall_time_ms),
            memory_kb: (meta.memory_kb > 0).then_some(meta.memory_kb),
        })
    }

    async fn kill(&self) -> Result<()> {
        let Some(pid) = self.child_pid() else {
            return Ok(());
        };
        warn!("Killing isolate keeper {} for box {}", pid, self.box_id);
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to signal isolate keeper {}", pid)),
        }
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let settings = Arc::clone(&self.settings);
        let box_id = self.box_id;
        let cleanup = release_after(Arc::clone(&self.pool), box_id, async move {
            cleanup_box(&settings, box_id).await
        });
        cleanup
            .await
            .with_context(|| format!("Cleanup task for box {} failed", box_id))??;
        info!("Cleaned up isolate box {}", box_id);
        Ok(())
    }
}

impl Drop for IsolateSandbox {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        warn!("Isolate box {} dropped without destroy, cleaning up", self.box_id);
        let settings = Arc::clone(&self.settings);
        let pool = Arc::clone(&self.pool);
        let box_id = self.box_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cleanup_box(&settings, box_id).await {
                        warn!("Deferred cleanup of box {} failed: {:#}", box_id, e);
                    }
                    pool.release(box_id);
                });
            }
            // The next init of this id cleans it up first.
            Err(_) => pool.release(box_id),
        }
    }
}

/// Run `cleanup` in its own task and return the id to the pool when it ends.
/// The task outlives a caller that stops waiting, so the id is never lost.
fn release_after<F>(pool: Arc<BoxIdPool>, box_id: u32, cleanup: F) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = cleanup.await;
        if let Err(e) = &result {
            warn!("Cleanup of box {} failed: {:#}", box_id, e);
        }
        pool.release(box_id);
        result
    })
}

/// Cleanup an isolate box, killing anything still running in it
async fn cleanup_box(settings: &IsolateSettings, box_id: u32) -> Result<()> {
    let mut args = vec!["--box-id".to_string(), box_id.to_string()];
    if settings.use_cgroups {
        args.push("--cg".to_string());
    }
    args.push("--cleanup".to_string());

    let output = Command::new(&settings.isolate_bin)
        .args(&args)
        .output()
        .await
        .context("Failed to run isolate --cleanup")?;
    if !output.status.success() {
        anyhow::bail!(
            "isolate --cleanup failed for box {}: {}",
            box_id,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Build the `isolate --run` argument list
fn build_run_args(
    settings: &IsolateSettings,
    box_id: u32,
    sandbox: &SandboxSpec,
    exec: &ExecSpec,
    meta_path: &Path,
) -> Vec<String> {
    let time_limit_secs = exec.time_limit.as_secs_f64();
    let memory_limit_kb = exec.memory_limit_mb * 1024;
    let toolchain = (!sandbox.image_ref.is_empty() && sandbox.image_ref != HOST_IMAGE)
        .then_some(sandbox.image_ref.as_str());

    let mut args = vec![
        "--box-id".to_string(),
        box_id.to_string(),
        "--silent".to_string(),
    ];

    if settings.use_cgroups {
        args.push("--cg".to_string());
        args.push(format!("--cg-mem={}", memory_limit_kb));
    } else {
        args.push(format!("--mem={}", memory_limit_kb));
    }

    args.extend([
        format!("--time={}", time_limit_secs),
        format!("--wall-time={}", time_limit_secs),
        format!("--meta={}", meta_path.display()),
        format!("--processes={}", settings.processes),
        format!("--open-files={}", settings.open_files),
        format!("--fsize={}", settings.fsize_kb),
    ]);

    if sandbox.allow_network {
        args.push("--share-net".to_string());
    }

    args.extend(settings.dirs.iter().map(|dir| format!("--dir={}", dir)));
    if let Some(root) = toolchain {
        args.push(format!("--dir={}={}", TOOLCHAIN_MOUNT, root));
    }

    for var in &settings.env {
        match (toolchain, var.strip_prefix("PATH=")) {
            (Some(_), Some(path)) => {
                args.push(format!("--env=PATH={}/bin:{}", TOOLCHAIN_MOUNT, path))
            }
            _ => args.push(format!("--env={}", var)),
        }
    }

    args.push("--run".to_string());
    args.push("--".to_string());

    // isolate does not search PATH; resolve bare program names
    let mut cmd_iter = exec.command.iter();
    if let Some(cmd) = cmd_iter.next() {
        if cmd.starts_with('/') || cmd.starts_with("./") {
            args.push(cmd.clone());
        } else if toolchain.is_some() {
            args.push(format!("{}/bin/{}", TOOLCHAIN_MOUNT, cmd));
        } else {
            args.push(format!("/usr/bin/{}", cmd));
        }
        args.extend(cmd_iter.cloned());
    }

    args
}

/// Plain file name inside the box: no separators, no traversal
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn sandbox_spec(image_ref: &str, allow_network: bool) -> SandboxSpec {
        SandboxSpec {
            execution_id: Uuid::nil(),
            image_ref: image_ref.to_string(),
            memory_limit_mb: 128,
            allow_network,
        }
    }

    fn exec_spec(command: &[&str]) -> ExecSpec {
        ExecSpec {
            command: command.iter().map(|s| s.to_string()).collect(),
            time_limit: Duration::from_millis(2500),
            memory_limit_mb: 128,
        }
    }

    #[test]
    fn test_run_args_for_host_image() {
        let settings = IsolateSettings::default();
        let args = build_run_args(
            &settings,
            7,
            &sandbox_spec(HOST_IMAGE, false),
            &exec_spec(&["python3", "main.py"]),
            Path::new("/tmp/meta.txt"),
        );

        assert_eq!(&args[..3], &["--box-id", "7", "--silent"]);
        assert!(args.contains(&"--cg-mem=131072".to_string()));
        assert!(args.contains(&"--wall-time=2.5".to_string()));
        assert!(args.contains(&"--meta=/tmp/meta.txt".to_string()));
        assert!(args.contains(&"--dir=/usr".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
        assert_eq!(&args[args.len() - 3..], &["--", "/usr/bin/python3", "main.py"]);
    }

    #[test]
    fn test_run_args_for_toolchain_image() {
        let settings = IsolateSettings::default();
        let args = build_run_args(
            &settings,
            1,
            &sandbox_spec("/opt/toolchains/node20", true),
            &exec_spec(&["node", "main.js"]),
            Path::new("/tmp/meta.txt"),
        );

        assert!(args.contains(&"--dir=/toolchain=/opt/toolchains/node20".to_string()));
        assert!(args.contains(&"--share-net".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--env=PATH=/toolchain/bin:")));
        assert_eq!(&args[args.len() - 2..], &["/toolchain/bin/node", "main.js"]);
    }

    #[test]
    fn test_run_args_keep_relative_binaries() {
        let args = build_run_args(
            &IsolateSettings::default(),
            1,
            &sandbox_spec(HOST_IMAGE, false),
            &exec_spec(&["./main"]),
            Path::new("/tmp/meta.txt"),
        );
        assert_eq!(args.last().map(String::as_str), Some("./main"));
    }

    #[test]
    fn test_run_args_without_cgroups_use_address_space_limit() {
        let settings = IsolateSettings {
            use_cgroups: false,
            ..IsolateSettings::default()
        };
        let args = build_run_args(
            &settings,
            1,
            &sandbox_spec(HOST_IMAGE, false),
            &exec_spec(&["./main"]),
            Path::new("/tmp/meta.txt"),
        );
        assert!(args.contains(&"--mem=131072".to_string()));
        assert!(!args.iter().any(|a| a == "--cg"));
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("main.py"));
        assert!(is_safe_file_name("Main.java"));
        assert!(!is_safe_file_name("../etc/passwd"));
        assert!(!is_safe_file_name("dir/main.py"));
        assert!(!is_safe_file_name(".."));
        assert!(!is_safe_file_name(""));
    }

    #[tokio::test]
    async fn test_box_id_returns_after_caller_stops_waiting() {
        let pool = Arc::new(BoxIdPool::new(5..6));
        let box_id = pool.acquire().unwrap();

        let cleanup = release_after(Arc::clone(&pool), box_id, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        });
        // Like a destroy bounded by the kill grace
        let waited = tokio::time::timeout(Duration::from_millis(10), cleanup).await;
        assert!(waited.is_err());
        assert_eq!(pool.available(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.acquire(), Some(5));
    }

    #[tokio::test]
    async fn test_box_id_returns_after_failed_cleanup() {
        let pool = Arc::new(BoxIdPool::new(5..6));
        let box_id = pool.acquire().unwrap();

        let result = release_after(Arc::clone(&pool), box_id, async {
            anyhow::bail!("isolate --cleanup failed")
        })
        .await
        .unwrap();
        assert!(result.is_err());
        assert_eq!(pool.acquire(), Some(5));
    }

    /// Needs a working isolate installation with cgroups.
    #[tokio::test]
    #[ignore]
    async fn test_isolate_available() {
        let backend = IsolateBackend::new(IsolateSettings::with_worker_id(9));
        backend.check_available().await.unwrap();
    }
}
