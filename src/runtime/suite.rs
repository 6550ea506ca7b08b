// Suite: the parallel dispatcher. Emits work units in feature order (outline
// rows expanded lazily), runs each scenario on its own blocking worker
// bounded by the thread count, aggregates results in emission order and
// fans events out to listeners.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::CallSingleCache;
use crate::driver::DriverProvider;
use crate::errors::{EngineError, Result};
use crate::feature::tags::TagSelector;
use crate::feature::{Feature, Scenario, Step};
use crate::listener::{ListenerBus, ResultListener, SuiteEvent, SuiteMeta};
use crate::locks::ScenarioLockManager;
use crate::perf::PerfHook;
use crate::resource;
use crate::results::{now_millis, FeatureResult, ScenarioResult, StepResult, SuiteResult};
use crate::runtime::feature::{FeatureCaches, FeatureRuntime};
use crate::runtime::scenario::ScenarioRuntime;

/// Before/after callbacks, invoked in-thread around the work they wrap.
/// `before_scenario` and `before_step` veto by returning false.
pub trait RuntimeHook: Send + Sync {
    fn before_suite(&self, _meta: &SuiteMeta) {}
    fn after_suite(&self, _result: &SuiteResult) {}
    fn before_feature(&self, _feature: &Feature) {}
    fn after_feature(&self, _result: &FeatureResult) {}
    fn before_scenario(&self, _scenario: &Scenario) -> bool {
        true
    }
    fn after_scenario(&self, _result: &ScenarioResult) {}
    fn before_step(&self, _step: &Step) -> bool {
        true
    }
    fn after_step(&self, _result: &StepResult) {}
}

#[derive(Clone, Debug)]
pub struct SuiteOptions {
    pub paths: Vec<String>,
    pub env: Option<String>,
    pub tag_selector: Option<String>,
    pub thread_count: usize,
    pub suite_root: PathBuf,
    pub config_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub build_dir: PathBuf,
    pub dry_run: bool,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            env: None,
            tag_selector: None,
            thread_count: 1,
            suite_root: PathBuf::from("."),
            config_dir: None,
            output_dir: PathBuf::from("target/karate-reports"),
            build_dir: PathBuf::from("target"),
            dry_run: false,
        }
    }
}

pub struct Suite {
    pub env: Option<String>,
    pub thread_count: usize,
    pub suite_root: PathBuf,
    pub config_dir: PathBuf,
    pub output_dir: PathBuf,
    pub build_dir: PathBuf,
    pub dry_run: bool,
    pub features: Vec<Arc<Feature>>,
    feature_lines: Vec<Vec<usize>>,
    pub tag_selector: TagSelector,
    pub lock_manager: ScenarioLockManager,
    pub call_single_cache: CallSingleCache,
    feature_caches: Mutex<HashMap<String, Arc<FeatureCaches>>>,
    pub hooks: Vec<Arc<dyn RuntimeHook>>,
    pub listeners: Vec<Arc<dyn ResultListener>>,
    pub perf_hook: Option<Arc<dyn PerfHook>>,
    pub driver_provider: Option<Arc<dyn DriverProvider>>,
    pub properties: Map<String, Value>,
    abort_flag: AtomicBool,
    events: Mutex<Option<UnboundedSender<SuiteEvent>>>,
}

impl Suite {
    /// Builds a suite by resolving every path option: directories are walked
    /// for `*.feature` files, single paths may carry `:line` suffixes.
    pub fn new(options: SuiteOptions) -> Result<Self> {
        let mut suite = Self::empty(options.clone());
        for raw_path in &options.paths {
            let target = resource::parse_call_target(raw_path);
            let path = options.suite_root.join(&target.path);
            if path.is_dir() {
                let mut found = Vec::new();
                collect_feature_files(&path, &mut found)?;
                found.sort();
                for file in found {
                    let feature = Feature::read(&file)?;
                    suite.push_feature(feature, Vec::new());
                }
            } else {
                let feature = Feature::read(&path)?;
                suite.push_feature(feature, target.lines.clone());
            }
        }
        Ok(suite)
    }

    /// A suite with no features; tests and embedders add them directly.
    pub fn empty(options: SuiteOptions) -> Self {
        let config_dir = options
            .config_dir
            .clone()
            .unwrap_or_else(|| options.suite_root.clone());
        let mut properties = Map::new();
        for (key, value) in std::env::vars() {
            properties.insert(key, Value::String(value));
        }
        Self {
            env: options.env,
            thread_count: options.thread_count.max(1),
            suite_root: options.suite_root,
            config_dir,
            output_dir: options.output_dir,
            build_dir: options.build_dir,
            dry_run: options.dry_run,
            features: Vec::new(),
            feature_lines: Vec::new(),
            tag_selector: TagSelector::parse(options.tag_selector.as_deref().unwrap_or("")),
            lock_manager: ScenarioLockManager::default(),
            call_single_cache: CallSingleCache::default(),
            feature_caches: Mutex::new(HashMap::new()),
            hooks: Vec::new(),
            listeners: Vec::new(),
            perf_hook: None,
            driver_provider: None,
            properties,
            abort_flag: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    pub fn push_feature(&mut self, feature: Feature, lines: Vec<usize>) {
        self.features.push(Arc::new(feature));
        self.feature_lines.push(lines);
    }

    pub fn add_hook(&mut self, hook: Arc<dyn RuntimeHook>) {
        self.hooks.push(hook);
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ResultListener>) {
        self.listeners.push(listener);
    }

    /// Feature-scoped caches, created on first use and kept for the suite's
    /// lifetime so nested calls to the same feature file share them.
    pub fn caches_for(&self, feature_path: &str) -> Arc<FeatureCaches> {
        let mut map = self.feature_caches.lock();
        map.entry(feature_path.to_string())
            .or_insert_with(|| Arc::new(FeatureCaches::default()))
            .clone()
    }

    pub fn emit(&self, event: SuiteEvent) {
        if let Some(sender) = self.events.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    pub fn request_abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    pub fn karate_temp_dir(&self) -> PathBuf {
        self.build_dir.join("karate-temp")
    }

    /// Runs everything. Scenario dispatch order follows feature order then
    /// outline row order; completion order is unconstrained.
    pub async fn run(self) -> SuiteResult {
        let suite = Arc::new(self);
        let _ = std::fs::create_dir_all(suite.karate_temp_dir());
        let bus = ListenerBus::start(suite.listeners.clone());
        *suite.events.lock() = Some(bus.sender());

        let start_millis = now_millis();
        let meta = SuiteMeta {
            env: suite.env.clone(),
            thread_count: suite.thread_count,
            feature_count: suite.features.len(),
            start_millis,
        };
        for hook in &suite.hooks {
            hook.before_suite(&meta);
        }
        bus.emit(SuiteEvent::SuiteStart(meta));

        struct Unit {
            feature_index: usize,
            seq: usize,
            scenario: Scenario,
        }
        let mut units = Vec::new();
        for (feature_index, feature) in suite.features.iter().enumerate() {
            for hook in &suite.hooks {
                hook.before_feature(feature);
            }
            let mut runtime = FeatureRuntime::new(suite.clone(), feature.clone());
            runtime.selector.lines = suite
                .feature_lines
                .get(feature_index)
                .cloned()
                .unwrap_or_default();
            for (seq, scenario) in runtime.scenarios().enumerate() {
                units.push(Unit {
                    feature_index,
                    seq,
                    scenario,
                });
            }
        }
        info!(
            features = suite.features.len(),
            scenarios = units.len(),
            threads = suite.thread_count,
            "suite starting"
        );

        let semaphore = Arc::new(Semaphore::new(suite.thread_count));
        let mut join_set: JoinSet<(usize, usize, ScenarioResult)> = JoinSet::new();
        for unit in units {
            let suite = suite.clone();
            let semaphore = semaphore.clone();
            let feature = suite.features[unit.feature_index].clone();
            join_set.spawn(async move {
                let permit = semaphore.acquire_owned().await;
                if permit.is_err() {
                    return (
                        unit.feature_index,
                        unit.seq,
                        skipped_result(&feature, unit.scenario),
                    );
                }
                let scenario = unit.scenario;
                let fallback = scenario.clone();
                let worker_suite = suite.clone();
                let worker_feature = feature.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    run_worker(worker_suite, worker_feature, scenario)
                })
                .await;
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "scenario worker did not complete");
                        fatal_result(fallback, &EngineError::Fatal(e.to_string()))
                    }
                };
                (unit.feature_index, unit.seq, result)
            });
        }

        let mut collected: Vec<Vec<(usize, ScenarioResult)>> =
            (0..suite.features.len()).map(|_| Vec::new()).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((feature_index, seq, result)) => collected[feature_index].push((seq, result)),
                Err(e) => warn!(error = %e, "worker task join failed"),
            }
        }

        let mut suite_result = SuiteResult {
            feature_results: Vec::with_capacity(suite.features.len()),
            start_millis,
            end_millis: 0,
            thread_count: suite.thread_count,
        };
        for (feature_index, feature) in suite.features.iter().enumerate() {
            let mut entries = std::mem::take(&mut collected[feature_index]);
            entries.sort_by_key(|(seq, _)| *seq);
            let mut feature_result =
                FeatureResult::new(feature.name.clone(), feature.relative_path.clone());
            for (_, result) in entries {
                feature_result.add_result(result);
            }
            for hook in &suite.hooks {
                hook.after_feature(&feature_result);
            }
            bus.emit(SuiteEvent::FeatureEnd(Box::new(feature_result.clone())));
            suite_result.feature_results.push(feature_result);
        }
        suite_result.end_millis = now_millis();

        for hook in &suite.hooks {
            hook.after_suite(&suite_result);
        }
        bus.emit(SuiteEvent::SuiteEnd(Box::new(suite_result.clone())));
        *suite.events.lock() = None;
        bus.join().await;
        info!(
            passed = suite_result.scenarios_passed(),
            failed = suite_result.scenarios_failed(),
            "suite finished"
        );
        suite_result
    }
}

fn collect_feature_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::io(format!("failed to list {}: {}", dir.display(), e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_feature_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("feature") {
            out.push(path);
        }
    }
    Ok(())
}

/// One scenario on one worker thread. The lock handle is released on every
/// exit path: normally by the explicit drop, on panic by unwinding through
/// `catch_unwind`.
fn run_worker(suite: Arc<Suite>, feature: Arc<Feature>, scenario: Scenario) -> ScenarioResult {
    if suite.abort_requested() {
        return skipped_result(&feature, scenario);
    }
    let lock_spec = scenario.lock_spec();
    let lock_handle = suite.lock_manager.acquire(lock_spec.as_ref());

    let fallback = scenario.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        match ScenarioRuntime::new(suite.clone(), feature.clone(), scenario, None) {
            Ok(runtime) => {
                let finished = runtime.call();
                if finished.result.is_failed() && finished.config.abort_suite_on_failure {
                    suite.request_abort();
                }
                finished.result
            }
            Err(e) => fatal_result(fallback.clone(), &e),
        }
    }));
    drop(lock_handle);

    match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic);
            error!(message = %message, "worker panicked");
            fatal_result(fallback, &EngineError::Fatal(message))
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn skipped_result(feature: &Arc<Feature>, scenario: Scenario) -> ScenarioResult {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("main")
        .to_string();
    let mut result = ScenarioResult::new(scenario.clone(), thread_name);
    result.start_millis = now_millis();
    for step in feature.background.iter().chain(scenario.steps.iter()) {
        result.add_step_result(StepResult::skipped(step.clone()));
    }
    result.end_millis = now_millis();
    result
}

fn fatal_result(scenario: Scenario, error: &EngineError) -> ScenarioResult {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("main")
        .to_string();
    let mut result = ScenarioResult::new(scenario, thread_name);
    result.start_millis = now_millis();
    let synthetic = Step {
        line: 0,
        prefix: "*".to_string(),
        text: "scenario".to_string(),
        docstring: None,
        table: None,
    };
    result.add_step_result(StepResult::failed(synthetic, now_millis(), 0, error));
    result.end_millis = now_millis();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::StepStatus;
    use std::sync::atomic::AtomicUsize;

    fn write_feature(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    async fn run_features(
        dir: &Path,
        names: &[&str],
        threads: usize,
        tag_selector: Option<&str>,
    ) -> SuiteResult {
        let options = SuiteOptions {
            paths: names.iter().map(|n| n.to_string()).collect(),
            thread_count: threads,
            suite_root: dir.to_path_buf(),
            output_dir: dir.join("reports"),
            build_dir: dir.join("build"),
            tag_selector: tag_selector.map(str::to_string),
            ..SuiteOptions::default()
        };
        Suite::new(options).unwrap().run().await
    }

    /// In-process HTTP fixture that counts requests and answers JSON.
    struct CountingServer {
        port: u16,
        hits: Arc<AtomicUsize>,
    }

    fn start_server(body: &'static str) -> CountingServer {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = match server.server_addr() {
            tiny_http::ListenAddr::IP(addr) => addr.port(),
            _ => panic!("expected a tcp listener"),
        };
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = hits.clone();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                hits_inner.fetch_add(1, Ordering::SeqCst);
                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"application/json"[..],
                )
                .unwrap();
                let response = tiny_http::Response::from_string(body).with_header(header);
                let _ = request.respond(response);
            }
        });
        CountingServer { port, hits }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outline_rows_pass_and_fail_independently() {
        // E1: two outline rows, one assertion that only row one satisfies
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "e1.feature",
            "Feature: e1\nScenario Outline: row\n* match <x> == 1\nExamples:\n| x |\n| 1 |\n| 2 |\n",
        );
        let result = run_features(dir.path(), &["e1.feature"], 1, None).await;
        assert_eq!(result.feature_results.len(), 1);
        let feature = &result.feature_results[0];
        assert_eq!(feature.scenario_count(), 2);
        assert_eq!(feature.passed_count(), 1);
        assert_eq!(feature.failed_count(), 1);
        assert!(feature.is_failed());
        assert!(result.is_failed());
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lock_tag_serializes_scenarios() {
        // E2: two @lock=a scenarios sleeping 50 ms never overlap, so the
        // wall clock is at least 100 ms even with five workers
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "e2.feature",
            "Feature: e2\n@lock=a\nScenario: one\n* sleep 50\n@lock=a\nScenario: two\n* sleep 50\n",
        );
        let started = std::time::Instant::now();
        let result = run_features(dir.path(), &["e2.feature"], 5, None).await;
        assert!(!result.is_failed());
        assert!(started.elapsed() >= std::time::Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn call_single_runs_once_across_parallel_scenarios() {
        // E3: ten parallel scenarios, one callSingle body, one upstream hit
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(r#"{ "token": "abc" }"#);
        write_feature(
            dir.path(),
            "token.feature",
            &format!(
                "Feature: token\nScenario: fetch\n* url 'http://127.0.0.1:{}'\n* method get\n* status 200\n* def auth = response\n",
                server.port
            ),
        );
        let mut rows = String::from("Feature: e3\nScenario Outline: consumer <n>\n* def creds = karate.callSingle('token.feature')\n* match creds.auth == {{ token: 'abc' }}\n* eval creds.auth.token = 'mutated-' + <n>\n* match creds.auth.token == 'mutated-' + <n>\nExamples:\n| n |\n".replace("{{", "{").replace("}}", "}"));
        for n in 0..10 {
            rows.push_str(&format!("| {} |\n", n));
        }
        write_feature(dir.path(), "e3.feature", &rows);
        let result = run_features(dir.path(), &["e3.feature"], 10, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert_eq!(result.scenarios_passed(), 10);
        // the callSingle body (and its single HTTP request) ran exactly once
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signal_listen_round_trip() {
        // E4 variant: a pre-arrived signal is handed to listen immediately
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "e4.feature",
            "Feature: e4\nScenario: rendezvous\n* eval karate.signal({ ok: true })\n* def result = karate.listen(5000)\n* match result == { ok: true }\n",
        );
        let started = std::time::Instant::now();
        let result = run_features(dir.path(), &["e4.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn configure_ssl_reports_in_config_and_rebuilds_client() {
        // E5: the rebuild path runs between configure and the next request
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(r#"{ "up": true }"#);
        write_feature(
            dir.path(),
            "e5.feature",
            &format!(
                "Feature: e5\nScenario: ssl\n* url 'http://127.0.0.1:{}'\n* method get\n* status 200\n* configure ssl = true\n* match karate.config.sslEnabled == true\n* match karate.config.sslTrustAll == true\n* method get\n* status 200\n",
                server.port
            ),
        );
        let result = run_features(dir.path(), &["e5.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fail_tag_inverts_scenario_but_not_steps() {
        // E6
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "e6.feature",
            "Feature: e6\n@fail\nScenario: should fail overall\n* match 1 == 1\n",
        );
        let result = run_features(dir.path(), &["e6.feature"], 1, None).await;
        let scenario = &result.feature_results[0].scenario_results[0];
        assert_eq!(scenario.status(), StepStatus::Failed);
        assert_eq!(scenario.step_results[0].status, StepStatus::Passed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn isolated_call_does_not_leak_mutations_to_the_caller() {
        // P10: a callee mutating an inherited map leaves the caller's copy
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "callee.feature",
            "Feature: callee\nScenario: mutate\n* eval data.x = 99\n* match data.x == 99\n",
        );
        write_feature(
            dir.path(),
            "caller.feature",
            "Feature: caller\nScenario: isolation\n* def data = { x: 1 }\n* def out = call read('callee.feature')\n* match data.x == 1\n* match out.data.x == 99\n",
        );
        let result = run_features(dir.path(), &["caller.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shared_scope_call_updates_caller_variables() {
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "shared.feature",
            "Feature: shared\nScenario: set\n* def token = 'from-callee'\n",
        );
        write_feature(
            dir.path(),
            "caller.feature",
            "Feature: caller\nScenario: shared scope\n* call read('shared.feature')\n* match token == 'from-callee'\n",
        );
        let result = run_features(dir.path(), &["caller.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callonce_caches_per_feature() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(r#"{ "n": 1 }"#);
        write_feature(
            dir.path(),
            "once.feature",
            &format!(
                "Feature: once\nScenario: hit\n* url 'http://127.0.0.1:{}'\n* method get\n* def data = response\n",
                server.port
            ),
        );
        write_feature(
            dir.path(),
            "main.feature",
            "Feature: main\nScenario: a\n* def r = callonce read('once.feature')\n* match r.data.n == 1\nScenario: b\n* def r = callonce read('once.feature')\n* match r.data.n == 1\n",
        );
        let result = run_features(dir.path(), &["main.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_steps_run_before_every_scenario() {
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "bg.feature",
            "Feature: bg\nBackground:\n* def base = 10\nScenario: one\n* match base == 10\nScenario: two\n* match base + 1 == 11\n",
        );
        let result = run_features(dir.path(), &["bg.feature"], 2, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert_eq!(result.scenarios_passed(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn continue_on_step_failure_defers_the_first_error() {
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "continue.feature",
            "Feature: continue\nScenario: keeps going\n* configure continueOnStepFailure = true\n* match 1 == 2\n* def after = 'ran'\n* match after == 'ran'\n",
        );
        let result = run_features(dir.path(), &["continue.feature"], 1, None).await;
        let scenario = &result.feature_results[0].scenario_results[0];
        // the failing step is recorded but later steps still ran
        assert_eq!(scenario.step_results[1].status, StepStatus::Failed);
        assert_eq!(scenario.step_results[2].status, StepStatus::Passed);
        assert_eq!(scenario.step_results[3].status, StepStatus::Passed);
        assert!(scenario.is_failed());
        assert!(scenario.error_message().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_skips_remaining_steps_by_default() {
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "stop.feature",
            "Feature: stop\nScenario: stops\n* match 1 == 2\n* def never = true\n",
        );
        let result = run_features(dir.path(), &["stop.feature"], 1, None).await;
        let scenario = &result.feature_results[0].scenario_results[0];
        assert_eq!(scenario.step_results[0].status, StepStatus::Failed);
        assert_eq!(scenario.step_results[1].status, StepStatus::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_skips_the_rest_and_passes_by_default() {
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "abort.feature",
            "Feature: abort\nScenario: early exit\n* def x = 1\n* eval karate.abort()\n* match x == 2\n",
        );
        let result = run_features(dir.path(), &["abort.feature"], 1, None).await;
        let scenario = &result.feature_results[0].scenario_results[0];
        assert_eq!(scenario.status(), StepStatus::Passed);
        assert_eq!(scenario.step_results[2].status, StepStatus::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_flow_with_cookies_headers_and_json_body() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(r#"{ "echo": true }"#);
        write_feature(
            dir.path(),
            "http.feature",
            &format!(
                "Feature: http\nScenario: post\n* url 'http://127.0.0.1:{}'\n* path 'things'\n* param verbose = 'true'\n* header X-Request-Id = karate.uuid()\n* request {{ name: 'widget' }}\n* method post\n* status 200\n* match response == {{ echo: true }}\n* match responseHeaders['content-type'][0] contains 'json'\n",
                server.port
            ),
        );
        let result = run_features(dir.path(), &["http.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn setup_once_is_memoized_per_feature() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(r#"{ "seed": 7 }"#);
        write_feature(
            dir.path(),
            "setup.feature",
            &format!(
                "Feature: setup\n@setup\nScenario: init\n* url 'http://127.0.0.1:{}'\n* method get\n* def seed = response.seed\nScenario: first\n* def s = karate.setupOnce()\n* match s.seed == 7\nScenario: second\n* def s = karate.setupOnce()\n* match s.seed == 7\n",
                server.port
            ),
        );
        let result = run_features(dir.path(), &["setup.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert_eq!(result.scenarios_passed(), 2);
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn karate_config_bootstraps_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("karate-config.js"),
            "function fn() { return { appUrl: 'http://config', helper: function (n) { return n * 2 } } }",
        )
        .unwrap();
        write_feature(
            dir.path(),
            "config.feature",
            "Feature: config\nScenario: uses config\n* match appUrl == 'http://config'\n* match helper(21) == 42\n",
        );
        let result = run_features(dir.path(), &["config.feature"], 1, None).await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn env_selects_the_environment_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("karate-config.js"), "({ env: 'base' })").unwrap();
        std::fs::write(dir.path().join("karate-config-dev.js"), "({ env: 'dev' })").unwrap();
        write_feature(
            dir.path(),
            "env.feature",
            "Feature: env\nScenario: env wins\n* match env == 'dev'\n* match karate.env == 'dev'\n",
        );
        let options = SuiteOptions {
            paths: vec!["env.feature".to_string()],
            env: Some("dev".to_string()),
            suite_root: dir.path().to_path_buf(),
            output_dir: dir.path().join("reports"),
            build_dir: dir.path().join("build"),
            ..SuiteOptions::default()
        };
        let result = Suite::new(options).unwrap().run().await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
    }

    fn first_error(result: &SuiteResult) -> Option<String> {
        result
            .feature_results
            .iter()
            .find_map(|f| f.first_error_message())
    }

    #[derive(Default)]
    struct RecordingPerfHook {
        events: Mutex<Vec<crate::perf::PerfEvent>>,
    }

    impl crate::perf::PerfHook for RecordingPerfHook {
        fn report_perf_event(&self, event: crate::perf::PerfEvent) {
            self.events.lock().push(event);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn perf_mode_reports_one_event_per_request() {
        // P7: after the scenario completes, exactly one event per request
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(r#"{ "ok": true }"#);
        write_feature(
            dir.path(),
            "perf.feature",
            &format!(
                "Feature: perf\nScenario: two calls\n* url 'http://127.0.0.1:{}'\n* method get\n* status 200\n* method get\n* status 200\n",
                server.port
            ),
        );
        let options = SuiteOptions {
            paths: vec!["perf.feature".to_string()],
            suite_root: dir.path().to_path_buf(),
            output_dir: dir.path().join("reports"),
            build_dir: dir.path().join("build"),
            ..SuiteOptions::default()
        };
        let hook = Arc::new(RecordingPerfHook::default());
        let mut suite = Suite::new(options).unwrap();
        suite.perf_hook = Some(hook.clone());
        let result = suite.run().await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        let events = hook.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].name.starts_with("GET "));
        assert!(!events[0].failed);
    }

    struct PoolDriver {
        terminated: bool,
    }

    impl crate::driver::Driver for PoolDriver {
        fn click(&mut self, _locator: &str) -> crate::errors::Result<()> {
            Ok(())
        }

        fn input(&mut self, _locator: &str, _value: &str) -> crate::errors::Result<()> {
            Ok(())
        }

        fn is_terminated(&self) -> bool {
            self.terminated
        }

        fn quit(&mut self) {
            self.terminated = true;
        }
    }

    #[derive(Default)]
    struct PoolProvider {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl crate::driver::DriverProvider for PoolProvider {
        fn acquire(
            &self,
            _options: &serde_json::Map<String, Value>,
        ) -> crate::errors::Result<Box<dyn crate::driver::Driver>> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(PoolDriver { terminated: false }))
        }

        fn release(&self, _driver: Box<dyn crate::driver::Driver>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scenario_scoped_driver_returns_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        write_feature(
            dir.path(),
            "driver.feature",
            "Feature: driver\nScenario: uses a driver\n* configure driver = { scope: 'scenario' }\n* driver\n* def x = 1\n",
        );
        let options = SuiteOptions {
            paths: vec!["driver.feature".to_string()],
            suite_root: dir.path().to_path_buf(),
            output_dir: dir.path().join("reports"),
            build_dir: dir.path().join("build"),
            ..SuiteOptions::default()
        };
        let provider = Arc::new(PoolProvider::default());
        let mut suite = Suite::new(options).unwrap();
        suite.driver_provider = Some(provider.clone());
        let result = suite.run().await;
        assert!(!result.is_failed(), "{:?}", first_error(&result));
        assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }
}
