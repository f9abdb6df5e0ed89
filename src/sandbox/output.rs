//! Bounded output capture
//!
//! Sinks keep at most `cap` bytes per stream. Anything beyond is read and
//! discarded so the writer never blocks, and the captured text gets an
//! explicit truncation marker.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

pub const TRUNCATION_MARKER: &str = "...[output truncated]";

const READ_CHUNK: usize = 8192;

#[derive(Debug)]
struct Capture {
    buf: Vec<u8>,
    cap: usize,
    dropped: u64,
}

/// Shared, size-capped byte buffer for one output stream
#[derive(Debug, Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Capture>>,
}

/// Text captured from a sink
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

impl OutputSink {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Capture {
                buf: Vec::new(),
                cap,
                dropped: 0,
            })),
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut capture = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let room = capture.cap.saturating_sub(capture.buf.len());
        let kept = room.min(bytes.len());
        capture.buf.extend_from_slice(&bytes[..kept]);
        capture.dropped += (bytes.len() - kept) as u64;
    }

    pub fn len(&self) -> usize {
        self.with_capture(|c| c.buf.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.with_capture(|c| c.dropped > 0)
    }

    /// Current contents as text, with the marker appended if bytes were dropped.
    /// A character split by the cap is dropped whole.
    pub fn snapshot(&self) -> CapturedOutput {
        self.with_capture(|c| {
            let truncated = c.dropped > 0;
            let kept = if truncated {
                complete_utf8_len(&c.buf)
            } else {
                c.buf.len()
            };
            let mut text = String::from_utf8_lossy(&c.buf[..kept]).into_owned();
            if truncated {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                let omitted = c.dropped + (c.buf.len() - kept) as u64;
                text.push_str(&format!("{} {} bytes omitted", TRUNCATION_MARKER, omitted));
            }
            CapturedOutput { text, truncated }
        })
    }

    fn with_capture<T>(&self, f: impl FnOnce(&Capture) -> T) -> T {
        match self.inner.lock() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

/// Length of `buf` without a trailing incomplete UTF-8 sequence
fn complete_utf8_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

/// Copy a stream into a sink chunk by chunk until EOF
pub async fn pump<R>(mut reader: R, sink: OutputSink) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.push(&chunk[..n]);
    }
}
