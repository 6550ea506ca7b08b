// Module: Listener
// Result fan-out. Workers emit events into an unbounded channel; a single
// drainer task invokes every registered listener. The suite joins the
// drainer before returning, so listener side effects are complete when
// `run()` hands back the result.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::results::{FeatureResult, SuiteResult};

#[derive(Clone, Debug)]
pub struct SuiteMeta {
    pub env: Option<String>,
    pub thread_count: usize,
    pub feature_count: usize,
    pub start_millis: i64,
}

#[derive(Clone, Debug)]
pub struct ScenarioInfo {
    pub feature_path: String,
    pub name: String,
    pub line: usize,
    /// Set on exit events.
    pub failed: Option<bool>,
}

pub enum SuiteEvent {
    SuiteStart(SuiteMeta),
    ScenarioEnter(ScenarioInfo),
    ScenarioExit(ScenarioInfo),
    FeatureEnd(Box<FeatureResult>),
    SuiteEnd(Box<SuiteResult>),
}

pub trait ResultListener: Send + Sync {
    fn on_suite_start(&self, _meta: &SuiteMeta) {}
    fn on_scenario_enter(&self, _info: &ScenarioInfo) {}
    fn on_scenario_exit(&self, _info: &ScenarioInfo) {}
    fn on_feature_end(&self, _result: &FeatureResult) {}
    fn on_suite_end(&self, _result: &SuiteResult) {}
}

/// Channel front of the listener registry.
pub struct ListenerBus {
    sender: UnboundedSender<SuiteEvent>,
    drainer: JoinHandle<()>,
}

impl ListenerBus {
    pub fn start(listeners: Vec<Arc<dyn ResultListener>>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<SuiteEvent>();
        let drainer = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                for listener in &listeners {
                    match &event {
                        SuiteEvent::SuiteStart(meta) => listener.on_suite_start(meta),
                        SuiteEvent::ScenarioEnter(info) => listener.on_scenario_enter(info),
                        SuiteEvent::ScenarioExit(info) => listener.on_scenario_exit(info),
                        SuiteEvent::FeatureEnd(result) => listener.on_feature_end(result),
                        SuiteEvent::SuiteEnd(result) => listener.on_suite_end(result),
                    }
                }
            }
        });
        Self { sender, drainer }
    }

    pub fn emit(&self, event: SuiteEvent) {
        // a dropped receiver just means the bus already shut down
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> UnboundedSender<SuiteEvent> {
        self.sender.clone()
    }

    /// Closes the channel and waits for all queued events to be delivered.
    pub async fn join(self) {
        drop(self.sender);
        if let Err(e) = self.drainer.await {
            warn!(error = %e, "listener drainer panicked");
        }
    }
}

/// Streams one JSON object per line into `karate-results.ndjson`.
pub struct NdjsonListener {
    file: Mutex<std::fs::File>,
}

impl NdjsonListener {
    pub fn create(output_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        let file = std::fs::File::create(output_dir.join("karate-results.ndjson"))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write_line(&self, value: serde_json::Value) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", value) {
            warn!(error = %e, "ndjson write failed");
        }
    }
}

impl ResultListener for NdjsonListener {
    fn on_suite_start(&self, meta: &SuiteMeta) {
        self.write_line(json!({
            "t": "suite",
            "env": meta.env,
            "threads": meta.thread_count,
            "features": meta.feature_count,
            "start": meta.start_millis,
        }));
    }

    fn on_feature_end(&self, result: &FeatureResult) {
        let scenarios: Vec<serde_json::Value> = result
            .scenario_results
            .iter()
            .map(|r| {
                json!({
                    "name": r.scenario.name,
                    "ref": r.scenario.ref_id(),
                    "status": r.status(),
                    "durationMillis": r.duration_millis(),
                    "error": r.error_message(),
                })
            })
            .collect();
        self.write_line(json!({
            "t": "feature",
            "path": result.feature_path,
            "name": result.feature_name,
            "passed": result.passed_count(),
            "failed": result.failed_count(),
            "durationMillis": result.duration_millis(),
            "scenarios": scenarios,
        }));
    }

    fn on_suite_end(&self, result: &SuiteResult) {
        self.write_line(json!({
            "t": "suite_end",
            "featuresPassed": result.features_passed(),
            "featuresFailed": result.features_failed(),
            "scenariosPassed": result.scenarios_passed(),
            "scenariosFailed": result.scenarios_failed(),
            "durationMillis": result.duration_millis(),
        }));
    }
}

/// Writes the aggregate `karate-summary.json` when the suite ends.
pub struct SummaryListener {
    path: PathBuf,
}

impl SummaryListener {
    pub fn create(output_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        Ok(Self {
            path: output_dir.join("karate-summary.json"),
        })
    }
}

impl ResultListener for SummaryListener {
    fn on_suite_end(&self, result: &SuiteResult) {
        let features: Vec<serde_json::Value> = result
            .feature_results
            .iter()
            .map(|f| {
                json!({
                    "path": f.feature_path,
                    "name": f.feature_name,
                    "scenarioCount": f.scenario_count(),
                    "passed": f.passed_count(),
                    "failed": f.failed_count(),
                    "durationMillis": f.duration_millis(),
                })
            })
            .collect();
        let summary = json!({
            "threads": result.thread_count,
            "featuresPassed": result.features_passed(),
            "featuresFailed": result.features_failed(),
            "scenariosPassed": result.scenarios_passed(),
            "scenariosFailed": result.scenarios_failed(),
            "totalTime": result.duration_millis(),
            "features": features,
        });
        let text = serde_json::to_string_pretty(&summary).unwrap_or_default();
        if let Err(e) = std::fs::write(&self.path, text) {
            warn!(path = %self.path.display(), error = %e, "summary write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::now_millis;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        events: AtomicUsize,
    }

    impl ResultListener for CountingListener {
        fn on_suite_start(&self, _meta: &SuiteMeta) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_suite_end(&self, _result: &SuiteResult) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn bus_delivers_all_events_before_join_returns() {
        let listener = Arc::new(CountingListener::default());
        let bus = ListenerBus::start(vec![listener.clone()]);
        bus.emit(SuiteEvent::SuiteStart(SuiteMeta {
            env: None,
            thread_count: 1,
            feature_count: 0,
            start_millis: now_millis(),
        }));
        bus.emit(SuiteEvent::SuiteEnd(Box::new(SuiteResult::default())));
        bus.join().await;
        assert_eq!(listener.events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ndjson_listener_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Arc::new(NdjsonListener::create(dir.path()).unwrap());
        let bus = ListenerBus::start(vec![listener]);
        bus.emit(SuiteEvent::SuiteStart(SuiteMeta {
            env: Some("dev".into()),
            thread_count: 2,
            feature_count: 1,
            start_millis: 0,
        }));
        bus.emit(SuiteEvent::FeatureEnd(Box::new(FeatureResult::new(
            "f",
            "f.feature",
        ))));
        bus.emit(SuiteEvent::SuiteEnd(Box::new(SuiteResult::default())));
        bus.join().await;

        let text = std::fs::read_to_string(dir.path().join("karate-results.ndjson")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["t"], "suite");
        let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["t"], "suite_end");
    }
}
