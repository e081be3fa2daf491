//! Progress reporting for in-flight transfers

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::humanize::ByteSize;

/// Bytes received so far, plus the total when the server announced one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_so_far: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_so_far as f64 * 100.0 / total as f64),
            None => None,
        }
    }
}

/// Receives a callback after every chunk written to disk
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, target: &str, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, Progress) + Send + Sync,
{
    fn on_progress(&self, target: &str, progress: Progress) {
        self(target, progress)
    }
}

/// Step size for transfers without a known length
const UNKNOWN_LENGTH_STEP: u64 = 64 * 1024 * 1024;

/// Default sink: one debug line per 10% step (or per 64MB without a length)
#[derive(Debug, Default)]
pub struct LogProgress {
    last_step: Mutex<HashMap<String, u64>>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn step(progress: &Progress) -> u64 {
        match progress.percent() {
            Some(pct) => (pct / 10.0) as u64,
            None => progress.bytes_so_far / UNKNOWN_LENGTH_STEP,
        }
    }
}

impl ProgressSink for LogProgress {
    fn on_progress(&self, target: &str, progress: Progress) {
        let step = Self::step(&progress);
        let Ok(mut last) = self.last_step.lock() else {
            return;
        };

        if last.get(target) == Some(&step) {
            return;
        }
        last.insert(target.to_string(), step);
        drop(last);

        match progress.percent() {
            Some(pct) => debug!(
                target_name = target,
                downloaded = %ByteSize(progress.bytes_so_far),
                percent = format_args!("{pct:.1}"),
                "Download progress"
            ),
            None => debug!(
                target_name = target,
                downloaded = %ByteSize(progress.bytes_so_far),
                "Download progress"
            ),
        }
    }
}

/// Sink that drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _target: &str, _progress: Progress) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_percent() {
        let p = Progress {
            bytes_so_far: 25,
            total: Some(100),
        };
        assert_eq!(p.percent(), Some(25.0));

        let unknown = Progress {
            bytes_so_far: 25,
            total: None,
        };
        assert_eq!(unknown.percent(), None);
    }

    #[test]
    fn test_closure_sink() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = move |_: &str, _: Progress| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        sink.on_progress("a", Progress { bytes_so_far: 1, total: None });
        sink.on_progress("a", Progress { bytes_so_far: 2, total: None });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_log_progress_steps() {
        let sink = LogProgress::new();
        for bytes in [0, 5, 10, 55, 100] {
            sink.on_progress("iso", Progress { bytes_so_far: bytes, total: Some(100) });
        }
        let last = sink.last_step.lock().unwrap();
        assert_eq!(last.get("iso"), Some(&10));
    }
}
