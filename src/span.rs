//! Run-span capture for profiling the job-graph layer.
//!
//! When enabled, every executed job slice records which worker ran which
//! element range and when. Capture is off by default; the recorder is a
//! plain mutex-guarded buffer drained by the caller between frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// One executed job slice: which worker ran which element range, and when.
#[derive(Clone, Debug)]
pub struct RunSpan {
    /// Pool thread that executed the slice.
    pub thread_index: usize,
    /// Name of the owning job.
    pub name: Arc<str>,
    /// First element index of the slice (inclusive).
    pub begin: u32,
    /// Last element index of the slice (exclusive).
    pub end: u32,
    pub started: Instant,
    pub finished: Instant,
}

pub(crate) struct SpanRecorder {
    enabled: AtomicBool,
    spans: Mutex<Vec<RunSpan>>,
}

impl SpanRecorder {
    pub fn new(enabled: bool) -> Self {
        SpanRecorder {
            enabled: AtomicBool::new(enabled),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record(&self, span: RunSpan) {
        self.spans.lock().push(span);
    }

    pub fn take(&self) -> Vec<RunSpan> {
        std::mem::take(&mut *self.spans.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(begin: u32, end: u32) -> RunSpan {
        let now = Instant::now();
        RunSpan {
            thread_index: 0,
            name: Arc::from("test"),
            begin,
            end,
            started: now,
            finished: now,
        }
    }

    #[test]
    fn take_drains_recorded_spans() {
        let recorder = SpanRecorder::new(true);
        recorder.record(span(0, 4));
        recorder.record(span(4, 8));
        let spans = recorder.take();
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].begin, spans[0].end), (0, 4));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn toggle() {
        let recorder = SpanRecorder::new(false);
        assert!(!recorder.is_enabled());
        recorder.set_enabled(true);
        assert!(recorder.is_enabled());
    }
}
