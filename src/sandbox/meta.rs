//! Isolate meta file parser
//!
//! Parses the `--meta` file isolate writes after each run.

/// Raw execution status from isolate
#[derive(Debug, Clone, PartialEq)]
pub enum IsolateStatus {
    /// Program exited normally
    Ok,
    /// Time limit exceeded
    TimeOut,
    /// Killed by signal
    Signal(i32),
    /// Runtime error (non-zero exit)
    RuntimeError,
    /// Internal error in isolate
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone)]
pub struct IsolateMeta {
    /// CPU time used in milliseconds
    pub time_ms: u64,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Peak memory in KB (max of cg-mem and max-rss)
    pub memory_kb: u64,
    pub exit_code: i32,
    pub status: IsolateStatus,
    /// Set when the cgroup OOM killer fired
    pub oom_killed: bool,
    /// Human-readable message from isolate, if any
    pub message: Option<String>,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: 0,
            status: IsolateStatus::Ok,
            oom_killed: false,
            message: None,
        }
    }
}

impl IsolateMeta {
    /// Memory ceiling breached, either by OOM kill or peak usage at the limit
    pub fn memory_exceeded(&self, memory_limit_kb: u64) -> bool {
        self.oom_killed || (memory_limit_kb > 0 && self.memory_kb >= memory_limit_kb)
    }
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = String::new();
    let mut exit_signal = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.time_ms = (t * 1000.0) as u64;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = (t * 1000.0) as u64;
                }
            }
            "cg-mem" | "max-rss" => {
                // both in KB
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "cg-oom-killed" => {
                meta.oom_killed = value == "1";
            }
            "status" => {
                status_str = value.to_string();
            }
            "exitcode" => {
                meta.exit_code = value.parse().unwrap_or(0);
            }
            "exitsig" => {
                exit_signal = value.parse::<i32>().ok();
            }
            "message" => {
                meta.message = Some(value.to_string());
            }
            _ => {}
        }
    }

    meta.status = match (status_str.as_str(), exit_signal) {
        ("TO", _) => IsolateStatus::TimeOut,
        ("XX", _) => IsolateStatus::InternalError,
        (_, Some(sig)) => IsolateStatus::Signal(sig),
        ("SG", None) => IsolateStatus::Signal(0),
        ("", None) if meta.exit_code == 0 => IsolateStatus::Ok,
        _ => IsolateStatus::RuntimeError,
    };

    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_success() {
        let content = "time:0.015\ntime-wall:0.020\ncg-mem:1024\nmax-rss:900\nexitcode:0\n";
        let meta = parse_meta(content);

        assert_eq!(meta.time_ms, 15);
        assert_eq!(meta.wall_time_ms, 20);
        assert_eq!(meta.memory_kb, 1024);
        assert_eq!(meta.exit_code, 0);
        assert_eq!(meta.status, IsolateStatus::Ok);
        assert!(!meta.memory_exceeded(256 * 1024));
    }

    #[test]
    fn test_parse_meta_timeout() {
        let content = "time:1.000\ntime-wall:2.001\nstatus:TO\nmessage:Time limit exceeded (wall clock)\n";
        let meta = parse_meta(content);

        assert_eq!(meta.time_ms, 1000);
        assert_eq!(meta.status, IsolateStatus::TimeOut);
        assert_eq!(meta.message.as_deref(), Some("Time limit exceeded (wall clock)"));
    }

    #[test]
    fn test_parse_meta_signal() {
        let content = "status:SG\nexitsig:11\n";
        let meta = parse_meta(content);

        assert_eq!(meta.status, IsolateStatus::Signal(11));
    }

    #[test]
    fn test_parse_meta_nonzero_exit() {
        let meta = parse_meta("status:RE\nexitcode:3\n");
        assert_eq!(meta.status, IsolateStatus::RuntimeError);
        assert_eq!(meta.exit_code, 3);
    }

    #[test]
    fn test_parse_meta_oom() {
        let meta = parse_meta("status:SG\nexitsig:9\ncg-oom-killed:1\ncg-mem:65536\n");
        assert!(meta.memory_exceeded(64 * 1024));
        assert!(meta.oom_killed);
    }

    #[test]
    fn test_parse_meta_internal_error() {
        let meta = parse_meta("status:XX\nmessage:Cannot run proxy\n");
        assert_eq!(meta.status, IsolateStatus::InternalError);
    }
}
