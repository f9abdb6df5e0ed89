//! Isolate backend configuration and box id allocation

use std::collections::VecDeque;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

/// Isolate only supports box IDs 0-9999; each worker gets a range of 1000.
pub const MAX_WORKERS: u32 = 10;
pub const BOXES_PER_WORKER: u32 = 1000;

/// Isolate backend configuration
#[derive(Debug, Clone)]
pub struct IsolateSettings {
    /// Path or name of the isolate binary
    pub isolate_bin: PathBuf,
    /// Worker ID for box ID allocation (0-9)
    pub worker_id: u32,
    /// Require cgroup support (needed for memory accounting)
    pub use_cgroups: bool,
    /// Maximum number of processes
    pub processes: u32,
    /// Maximum open files
    pub open_files: u32,
    /// Maximum file size in KB
    pub fsize_kb: u32,
    /// Read-only directory rules passed as `--dir=`
    pub dirs: Vec<String>,
    /// Environment passed as `--env=`
    pub env: Vec<String>,
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self {
            isolate_bin: PathBuf::from("isolate"),
            worker_id: 0,
            use_cgroups: true,
            processes: 64,
            open_files: 256,
            fsize_kb: 262144, // 256MB
            dirs: vec![
                "/usr".to_string(),
                "/lib".to_string(),
                "/lib64".to_string(),
                "/etc:noexec".to_string(),
                "/tmp:tmp".to_string(),
            ],
            env: vec![
                "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
                "HOME=/box".to_string(),
                "JAVA_HOME=/usr/lib/jvm/java-17-openjdk-amd64".to_string(),
            ],
        }
    }
}

impl IsolateSettings {
    /// Settings for a dynamically assigned worker_id, `ISOLATE_BIN` overrides the binary
    pub fn with_worker_id(worker_id: u32) -> Self {
        let mut settings = Self::default();
        if worker_id >= MAX_WORKERS {
            warn!(
                "worker_id {} outside 0-{}, wrapping",
                worker_id,
                MAX_WORKERS - 1
            );
        }
        settings.worker_id = worker_id % MAX_WORKERS;
        if let Ok(bin) = std::env::var("ISOLATE_BIN") {
            settings.isolate_bin = PathBuf::from(bin);
        }
        settings
    }

    /// Box ids owned by this worker
    pub fn box_id_range(&self) -> Range<u32> {
        let start = (self.worker_id % MAX_WORKERS) * BOXES_PER_WORKER;
        start..start + BOXES_PER_WORKER
    }
}

/// Free list of box ids; an id is never handed out twice while in use
#[derive(Debug)]
pub struct BoxIdPool {
    free: Mutex<VecDeque<u32>>,
}

impl BoxIdPool {
    pub fn new(range: Range<u32>) -> Self {
        Self {
            free: Mutex::new(range.collect()),
        }
    }

    pub fn acquire(&self) -> Option<u32> {
        self.lock().pop_front()
    }

    /// Released ids go to the back so they rest before reuse
    pub fn release(&self, box_id: u32) {
        self.lock().push_back(box_id);
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<u32>> {
        match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
