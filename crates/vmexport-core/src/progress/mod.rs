//! Typed progress events and the bandwidth-throttled byte stream wrapper.

mod throttle;

pub use throttle::ThrottledReader;

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sink for phase/percent/byte-level progress. [`crate::jobs::manager::JobManager`]
/// binds one per job; the export pipeline drives it.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Set the human-readable current phase.
    async fn describe(&self, phase: &str);

    /// Monotonic-within-phase percent complete, 0.0-100.0.
    async fn update(&self, percent: f32);

    /// Primary byte-level signal.
    async fn report_bytes(
        &self,
        current: u64,
        total: Option<u64>,
        file_name: Option<&str>,
        file_idx: Option<u32>,
        file_total: Option<u32>,
    );
}

/// A single coalesced delivery, handed to whatever downstream observer is
/// subscribed (WebSocket push, TUI, etc. — all out of scope here; the core
/// only produces the event).
#[derive(Debug, Clone, Default)]
pub struct ProgressEvent {
    pub phase: String,
    pub percent_complete: f32,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub current_file: Option<String>,
    pub files_completed: Option<u32>,
    pub files_total: Option<u32>,
}

/// Coalesces deliveries to at most one per 100ms per (job, phase), always
/// delivering the final event of a phase. Wraps an arbitrary sink function.
pub struct CoalescingReporter<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    sink: F,
    state: Mutex<CoalesceState>,
    interval: Duration,
}

struct CoalesceState {
    last_sent: Option<Instant>,
    pending: Option<ProgressEvent>,
    current: ProgressEvent,
}

impl<F> CoalescingReporter<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    pub fn new(sink: F) -> Self {
        Self::with_interval(sink, Duration::from_millis(100))
    }

    pub fn with_interval(sink: F, interval: Duration) -> Self {
        Self {
            sink,
            state: Mutex::new(CoalesceState {
                last_sent: None,
                pending: None,
                current: ProgressEvent::default(),
            }),
            interval,
        }
    }

    fn emit(&self, event: ProgressEvent, phase_changed: bool) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.current = event.clone();

        let now = Instant::now();
        let due = state
            .last_sent
            .map(|last| now.duration_since(last) >= self.interval)
            .unwrap_or(true);

        if due || phase_changed {
            state.last_sent = Some(now);
            state.pending = None;
            drop(state);
            (self.sink)(event);
        } else {
            state.pending = Some(event);
        }
    }

    /// Force the last-known event through, regardless of cadence. Callers
    /// invoke this at phase boundaries so the final event of a phase is
    /// never swallowed by the throttle.
    pub fn flush(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        if let Some(event) = state.pending.take() {
            state.last_sent = Some(Instant::now());
            drop(state);
            (self.sink)(event);
        }
    }

    pub fn snapshot(&self) -> ProgressEvent {
        self.state.lock().expect("progress mutex poisoned").current.clone()
    }
}

#[async_trait]
impl<F> ProgressReporter for CoalescingReporter<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    async fn describe(&self, phase: &str) {
        let mut event = self.snapshot();
        let phase_changed = event.phase != phase;
        if phase_changed {
            self.flush();
            event.percent_complete = 0.0;
        }
        event.phase = phase.to_string();
        self.emit(event, phase_changed);
    }

    async fn update(&self, percent: f32) {
        let mut event = self.snapshot();
        event.percent_complete = event.percent_complete.max(percent);
        self.emit(event, false);
    }

    async fn report_bytes(
        &self,
        current: u64,
        total: Option<u64>,
        file_name: Option<&str>,
        file_idx: Option<u32>,
        file_total: Option<u32>,
    ) {
        let mut event = self.snapshot();
        event.bytes_transferred = current;
        event.bytes_total = total.or(event.bytes_total);
        if let Some(name) = file_name {
            event.current_file = Some(name.to_string());
        }
        event.files_completed = file_idx.or(event.files_completed);
        event.files_total = file_total.or(event.files_total);
        if let Some(total) = event.bytes_total {
            if total > 0 {
                event.percent_complete = event.percent_complete.max((current as f64 / total as f64 * 100.0) as f32);
            }
        }
        self.emit(event, false);
    }
}

/// No-op reporter for code paths (tests, dry runs) that don't care about progress.
pub struct NullProgressReporter;

#[async_trait]
impl ProgressReporter for NullProgressReporter {
    async fn describe(&self, _phase: &str) {}
    async fn update(&self, _percent: f32) {}
    async fn report_bytes(&self, _current: u64, _total: Option<u64>, _file_name: Option<&str>, _file_idx: Option<u32>, _file_total: Option<u32>) {}
}

/// Records every delivered event, for tests.
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("mutex poisoned").clone()
    }
}

impl Default for RecordingReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressReporter for RecordingReporter {
    async fn describe(&self, phase: &str) {
        let mut events = self.events.lock().expect("mutex poisoned");
        let mut event = events.last().cloned().unwrap_or_default();
        event.phase = phase.to_string();
        events.push(event);
    }

    async fn update(&self, percent: f32) {
        let mut events = self.events.lock().expect("mutex poisoned");
        let mut event = events.last().cloned().unwrap_or_default();
        event.percent_complete = event.percent_complete.max(percent);
        events.push(event);
    }

    async fn report_bytes(&self, current: u64, total: Option<u64>, file_name: Option<&str>, file_idx: Option<u32>, file_total: Option<u32>) {
        let mut events = self.events.lock().expect("mutex poisoned");
        let mut event = events.last().cloned().unwrap_or_default();
        event.bytes_transferred = current;
        event.bytes_total = total.or(event.bytes_total);
        event.current_file = file_name.map(String::from).or(event.current_file);
        event.files_completed = file_idx.or(event.files_completed);
        event.files_total = file_total.or(event.files_total);
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn coalesces_rapid_updates_within_window() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let reporter = CoalescingReporter::with_interval(move |_| { count2.fetch_add(1, Ordering::SeqCst); }, Duration::from_millis(50));

        reporter.describe("transfer").await;
        for i in 0..20 {
            reporter.update(i as f32).await;
        }
        // first describe + at most one update went through inside the window
        assert!(count.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn final_event_of_phase_is_always_delivered() {
        let delivered: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let d2 = delivered.clone();
        let reporter = CoalescingReporter::with_interval(move |e| d2.lock().unwrap().push(e), Duration::from_secs(10));

        reporter.describe("transfer").await;
        reporter.update(50.0).await;
        reporter.flush();

        let events = delivered.lock().unwrap();
        assert_eq!(events.last().unwrap().percent_complete, 50.0);
    }

    #[tokio::test]
    async fn recording_reporter_captures_sequence() {
        let reporter = RecordingReporter::new();
        reporter.describe("discover").await;
        reporter.report_bytes(10, Some(100), Some("disk.vmdk"), Some(1), Some(2)).await;
        let events = reporter.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].bytes_transferred, 10);
        assert_eq!(events[1].current_file.as_deref(), Some("disk.vmdk"));
    }
}
