// Module: Perf
// Deferred reporting of per-request timing events.
//
// A captured event is held until the next request (or scenario end) so the
// eventual failure state of the step it belongs to can be attached. Each
// event is reported exactly once.

use std::sync::Arc;

/// One HTTP timing record.
#[derive(Clone, Debug)]
pub struct PerfEvent {
    pub name: String,
    pub start_millis: i64,
    pub duration_millis: u64,
    pub status: u16,
    pub failed: bool,
    pub message: Option<String>,
}

/// Gatling-style hook implemented by the perf harness.
pub trait PerfHook: Send + Sync {
    /// Names the event for a request; `None` suppresses capture.
    fn perf_event_name(&self, method: &str, url: &str) -> Option<String> {
        Some(format!("{} {}", method, url))
    }

    fn report_perf_event(&self, event: PerfEvent);
}

/// Per-scenario pipeline holding the previous request's event.
pub struct PerfPipeline {
    hook: Option<Arc<dyn PerfHook>>,
    prev: Option<PerfEvent>,
}

impl PerfPipeline {
    pub fn new(hook: Option<Arc<dyn PerfHook>>) -> Self {
        Self { hook, prev: None }
    }

    pub fn active(&self) -> bool {
        self.hook.is_some()
    }

    pub fn event_name(&self, method: &str, url: &str) -> Option<String> {
        self.hook.as_ref()?.perf_event_name(method, url)
    }

    /// Holds a new event, first flushing the previous one. This ordering is
    /// what guarantees event N is reported before event N+1 is captured.
    pub fn capture(&mut self, event: PerfEvent) {
        self.flush(None);
        self.prev = Some(event);
    }

    /// Reports the held event, attaching the scenario's failure message when
    /// one is supplied. Idempotent: the slot is taken on first flush.
    pub fn flush(&mut self, failure: Option<&str>) {
        let Some(mut event) = self.prev.take() else {
            return;
        };
        if let Some(message) = failure {
            event.failed = true;
            event.message = Some(message.to_string());
        }
        if let Some(hook) = &self.hook {
            hook.report_perf_event(event);
        }
    }
}

impl Drop for PerfPipeline {
    fn drop(&mut self) {
        self.flush(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHook {
        events: Mutex<Vec<PerfEvent>>,
    }

    impl PerfHook for RecordingHook {
        fn report_perf_event(&self, event: PerfEvent) {
            self.events.lock().push(event);
        }
    }

    fn event(name: &str) -> PerfEvent {
        PerfEvent {
            name: name.to_string(),
            start_millis: 0,
            duration_millis: 5,
            status: 200,
            failed: false,
            message: None,
        }
    }

    #[test]
    fn capture_flushes_the_previous_event_first() {
        let hook = Arc::new(RecordingHook::default());
        let mut pipeline = PerfPipeline::new(Some(hook.clone()));
        pipeline.capture(event("first"));
        assert!(hook.events.lock().is_empty());
        pipeline.capture(event("second"));
        let names: Vec<String> = hook.events.lock().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["first"]);
        pipeline.flush(None);
        assert_eq!(hook.events.lock().len(), 2);
    }

    #[test]
    fn flush_is_exactly_once() {
        let hook = Arc::new(RecordingHook::default());
        let mut pipeline = PerfPipeline::new(Some(hook.clone()));
        pipeline.capture(event("only"));
        pipeline.flush(None);
        pipeline.flush(None);
        assert_eq!(hook.events.lock().len(), 1);
    }

    #[test]
    fn final_flush_attaches_the_failure_message() {
        let hook = Arc::new(RecordingHook::default());
        let mut pipeline = PerfPipeline::new(Some(hook.clone()));
        pipeline.capture(event("last"));
        pipeline.flush(Some("scenario failed"));
        let events = hook.events.lock();
        assert!(events[0].failed);
        assert_eq!(events[0].message.as_deref(), Some("scenario failed"));
    }

    #[test]
    fn drop_reports_a_still_held_event() {
        let hook = Arc::new(RecordingHook::default());
        {
            let mut pipeline = PerfPipeline::new(Some(hook.clone()));
            pipeline.capture(event("dangling"));
        }
        assert_eq!(hook.events.lock().len(), 1);
    }
}
