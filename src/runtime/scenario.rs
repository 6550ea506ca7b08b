// ScenarioRuntime: one scenario's lifecycle. Owns the script engine, the
// HTTP state, the config, the perf pipeline and the driver handle. Exactly
// one worker drives a runtime; nothing here is shared until the scenario is
// fully drained.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::bridge;
use crate::config::RuntimeConfig;
use crate::driver::{DriverHandle, DriverScope};
use crate::errors::{EngineError, Result};
use crate::feature::{tags, Feature, Scenario, Step};
use crate::http::{self, CookieJar, HttpRequestBuilder, HttpResponse, PreparedRequest};
use crate::listener::{ScenarioInfo, SuiteEvent};
use crate::perf::{PerfEvent, PerfPipeline};
use crate::resource;
use crate::results::{now_millis, FeatureResult, ScenarioResult, StepResult};
use crate::runtime::feature::{FeatureCaches, FeatureRuntime};
use crate::runtime::step;
use crate::runtime::suite::Suite;
use crate::script::{Binding, ScriptEngine};

const MAX_CALL_DEPTH: usize = 25;

/// One-shot rendezvous bridging async producers into step flow. Resettable:
/// a successful wait drains the slot for the next cycle.
#[derive(Default)]
pub struct Rendezvous {
    slot: Mutex<Option<Value>>,
    latch: Condvar,
}

impl Rendezvous {
    pub fn signal(&self, value: Value) {
        let mut slot = self.slot.lock();
        *slot = Some(value);
        self.latch.notify_all();
    }

    pub fn wait(&self, timeout_ms: u64) -> Result<Value> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::ListenTimeout(timeout_ms));
            }
            self.latch.wait_for(&mut slot, deadline - now);
        }
    }
}

/// Mutable scenario state shared between the step executor and the script
/// bridge's host functions. Confined to the scenario's worker thread.
pub struct ScenarioState {
    pub suite: Arc<Suite>,
    pub feature: Arc<Feature>,
    pub caches: Arc<FeatureCaches>,
    pub scenario: Scenario,
    pub config: RuntimeConfig,
    pub client: Option<reqwest::blocking::Client>,
    pub client_dirty: bool,
    pub builder: HttpRequestBuilder,
    pub cookie_jar: CookieJar,
    pub last_response: Option<HttpResponse>,
    pub prev_request: Option<PreparedRequest>,
    pub perf: PerfPipeline,
    pub error: Option<EngineError>,
    pub deferred_error: Option<EngineError>,
    pub stopped: bool,
    pub aborted: bool,
    pub driver: Option<DriverHandle>,
    pub driver_inherited: bool,
    pub rendezvous: Arc<Rendezvous>,
    pub call_depth: usize,
    pub step_log: Vec<String>,
}

/// Context a caller hands to a nested scenario.
pub struct CallContext {
    pub arg: Option<Value>,
    pub loop_index: Option<usize>,
    pub shared_scope: bool,
    pub bindings: Vec<(String, Binding)>,
    pub config: RuntimeConfig,
    pub driver: Option<DriverHandle>,
    pub depth: usize,
}

/// Everything a finished scenario exports. `result` may only be read after
/// `call()` has returned, which this type makes structural.
pub struct FinishedScenario {
    pub result: ScenarioResult,
    pub vars: Map<String, Value>,
    pub bindings: Vec<(String, Binding)>,
    pub config: RuntimeConfig,
    pub driver: Option<DriverHandle>,
    pub error: Option<EngineError>,
}

pub struct ScenarioRuntime {
    pub engine: ScriptEngine,
    pub state: Rc<RefCell<ScenarioState>>,
}

impl ScenarioRuntime {
    pub fn new(
        suite: Arc<Suite>,
        feature: Arc<Feature>,
        scenario: Scenario,
        call: Option<CallContext>,
    ) -> Result<Self> {
        let engine = ScriptEngine::new()?;
        let caches = suite.caches_for(&feature.relative_path);
        let perf = PerfPipeline::new(suite.perf_hook.clone());
        let (config, depth, driver, driver_inherited) = match &call {
            Some(ctx) => (ctx.config.copy(), ctx.depth, None, ctx.driver.is_some()),
            None => (RuntimeConfig::default(), 0, None, false),
        };
        let example_data = scenario.example_data.clone();
        let example_index = scenario.example_index;

        let state = Rc::new(RefCell::new(ScenarioState {
            suite: suite.clone(),
            feature,
            caches,
            scenario,
            config,
            client: None,
            client_dirty: false,
            builder: HttpRequestBuilder::default(),
            cookie_jar: CookieJar::default(),
            last_response: None,
            prev_request: None,
            perf,
            error: None,
            deferred_error: None,
            stopped: false,
            aborted: false,
            driver,
            driver_inherited,
            rendezvous: Arc::new(Rendezvous::default()),
            call_depth: depth,
            step_log: Vec::new(),
        }));

        bridge::install(&engine, state.clone())?;

        let runtime = Self { engine, state };
        match call {
            Some(ctx) => runtime.apply_call_context(ctx)?,
            None => runtime.evaluate_config_scripts(),
        }

        if !example_data.is_empty() {
            for (name, value) in &example_data {
                runtime.engine.put(name, value)?;
            }
            runtime
                .engine
                .put("__row", &Value::Object(example_data))?;
        }
        if let Some(index) = example_index {
            runtime.engine.put("__num", &Value::from(index))?;
        }
        Ok(runtime)
    }

    fn apply_call_context(&self, ctx: CallContext) -> Result<()> {
        for (name, binding) in &ctx.bindings {
            if matches!(name.as_str(), "karate" | "read" | "match") {
                continue;
            }
            self.engine.put_binding(name, binding)?;
        }
        match &ctx.arg {
            Some(arg) => {
                self.engine.put("__arg", arg)?;
                if let Value::Object(map) = arg {
                    for (name, value) in map {
                        self.engine.put(name, value)?;
                    }
                }
            }
            None => self.engine.put("__arg", &Value::Null)?,
        }
        if let Some(index) = ctx.loop_index {
            self.engine.put("__loop", &Value::from(index))?;
        }
        if let Some(driver) = ctx.driver {
            let mut st = self.state.borrow_mut();
            st.driver = Some(driver);
            st.driver_inherited = true;
        }
        Ok(())
    }

    /// Evaluates karate-base.js, karate-config.js and karate-config-<env>.js
    /// in order. Each may be (a) a function definition, invoked; (b) an
    /// object literal; (c) a self-invoking body. The returned map is applied
    /// key-by-key as variables, functions preserved inside the engine.
    fn evaluate_config_scripts(&self) {
        let (config_dir, env) = {
            let st = self.state.borrow();
            (st.suite.config_dir.clone(), st.suite.env.clone())
        };
        let mut names = vec!["karate-base.js".to_string(), "karate-config.js".to_string()];
        if let Some(env) = &env {
            names.push(format!("karate-config-{}.js", env));
        }
        for name in names {
            let path = config_dir.join(&name);
            if !path.exists() {
                continue;
            }
            let outcome = resource::read_text(&path).and_then(|source| {
                let trimmed = source.trim();
                let wrapped = if trimmed.starts_with("function") {
                    format!("({})()", trimmed)
                } else {
                    format!("({})", trimmed)
                };
                let script = format!(
                    "(function () {{ var cfg = {}; if (cfg && typeof cfg === 'object') {{ \
                     for (var k in cfg) {{ globalThis[k] = cfg[k]; }} return Object.keys(cfg); }} \
                     return []; }})()",
                    wrapped
                );
                self.engine.eval(&script)
            });
            match outcome {
                Ok(sv) => {
                    if let Value::Array(keys) = sv.value {
                        for key in keys.iter().filter_map(Value::as_str) {
                            self.engine.track(key);
                        }
                    }
                    debug!(script = %name, "config script applied");
                }
                Err(e) => {
                    let mut st = self.state.borrow_mut();
                    st.error = Some(EngineError::ConfigEvaluationFailed(format!(
                        "{}: {}",
                        name, e
                    )));
                    st.stopped = true;
                    return;
                }
            }
        }
    }

    /// Runs background and scenario steps and drains the runtime. The result
    /// is only reachable through the returned `FinishedScenario`.
    pub fn call(self) -> FinishedScenario {
        let (scenario, suite, depth, dry_run) = {
            let st = self.state.borrow();
            (
                st.scenario.clone(),
                st.suite.clone(),
                st.call_depth,
                st.suite.dry_run,
            )
        };
        let thread_name = std::thread::current()
            .name()
            .unwrap_or("main")
            .to_string();
        let mut result = ScenarioResult::new(scenario.clone(), thread_name);
        result.start_millis = now_millis();

        let mut vetoed = false;
        for hook in &suite.hooks {
            if !hook.before_scenario(&scenario) {
                vetoed = true;
            }
        }
        if depth == 0 {
            suite.emit(SuiteEvent::ScenarioEnter(ScenarioInfo {
                feature_path: scenario.feature_path.clone(),
                name: scenario.name.clone(),
                line: scenario.line,
                failed: None,
            }));
        }

        // a config bootstrap failure surfaces as a failed synthetic step
        let pre_error = self.state.borrow().error.clone();
        if let Some(err) = &pre_error {
            let synthetic = Step {
                line: 0,
                prefix: "*".to_string(),
                text: "karate-config".to_string(),
                docstring: None,
                table: None,
            };
            result.add_step_result(StepResult::failed(synthetic, now_millis(), 0, err));
        }

        let mut steps: Vec<Step> = Vec::new();
        {
            let st = self.state.borrow();
            steps.extend(st.feature.background.iter().cloned());
        }
        steps.extend(scenario.steps.iter().cloned());

        for step in steps {
            let blocked = {
                let st = self.state.borrow();
                st.stopped
            };
            if vetoed || dry_run || blocked {
                result.add_step_result(StepResult::skipped(step));
                continue;
            }
            let mut proceed = true;
            for hook in &suite.hooks {
                if !hook.before_step(&step) {
                    proceed = false;
                }
            }
            let step_result = if proceed {
                step::execute(&self, &step)
            } else {
                StepResult::skipped(step)
            };
            for hook in &suite.hooks {
                hook.after_step(&step_result);
            }
            result.add_step_result(step_result);
        }

        // surface the first deferred error at scenario end
        {
            let mut st = self.state.borrow_mut();
            if st.error.is_none() {
                if let Some(deferred) = st.deferred_error.take() {
                    st.error = Some(deferred);
                }
            }
        }

        // backtick scenario names are template literals, evaluated for reports
        if scenario.name.starts_with('`') && scenario.name.ends_with('`') {
            if let Ok(sv) = self.engine.eval(&scenario.name) {
                if let Value::String(evaluated) = sv.value {
                    result.scenario.name = evaluated;
                }
            }
        }

        for hook in &suite.hooks {
            hook.after_scenario(&result);
        }
        if depth == 0 {
            suite.emit(SuiteEvent::ScenarioExit(ScenarioInfo {
                feature_path: scenario.feature_path.clone(),
                name: result.scenario.name.clone(),
                line: scenario.line,
                failed: Some(result.is_failed()),
            }));
        }

        let after_scenario = self.state.borrow().config.after_scenario.clone();
        if let Some(source) = after_scenario {
            if let Err(e) = self.engine.invoke_function(&source, &[]) {
                warn!(error = %e, "afterScenario hook failed");
            }
        }

        // finally: perf flush, driver release, fail-tag inversion
        let error = self.state.borrow().error.clone();
        let failure_message = error.as_ref().map(|e| e.to_string());
        {
            let mut st = self.state.borrow_mut();
            st.perf.flush(failure_message.as_deref());
        }

        let (driver, driver_inherited) = {
            let mut st = self.state.borrow_mut();
            (st.driver.take(), st.driver_inherited)
        };
        let out_driver = match driver {
            None => None,
            // an inherited driver always goes back to its owner untouched
            Some(handle) if driver_inherited => Some(handle),
            // caller scope transfers ownership upward
            Some(handle) if depth > 0 && handle.scope == DriverScope::Caller => Some(handle),
            Some(handle) => {
                let provider = suite.driver_provider.clone();
                handle.release(provider.as_deref());
                None
            }
        };

        result.apply_fail_tag();
        result.end_millis = now_millis();

        let vars = self.engine.vars_as_map();
        let bindings = self.engine.bindings();
        let config = self.state.borrow().config.copy();

        FinishedScenario {
            result,
            vars,
            bindings,
            config,
            driver: out_driver,
            error,
        }
    }
}

/// Lazy driver init from `configure driver`. A pooled handle comes from the
/// suite's provider; scope decides who releases it at scenario end. Idempotent
/// once a driver is attached (inherited ones included).
pub fn init_driver(state: &Rc<RefCell<ScenarioState>>) -> Result<()> {
    let (attached, options, provider) = {
        let st = state.borrow();
        (
            st.driver.is_some(),
            st.config.driver.clone(),
            st.suite.driver_provider.clone(),
        )
    };
    if attached {
        return Ok(());
    }
    let options = options.unwrap_or_default();
    let provider = provider
        .ok_or_else(|| EngineError::step("no driver provider registered with the suite"))?;
    let driver = provider.acquire(&options)?;
    let scope = DriverScope::from_options(&options);
    let mut st = state.borrow_mut();
    st.driver = Some(DriverHandle::new(driver, scope, true));
    st.driver_inherited = false;
    Ok(())
}

/// Applies one configure key to the scenario's config, marking the client
/// dirty when the key demands a transport rebuild. Toggling
/// `continueOnStepFailure` off surfaces the first deferred error immediately.
pub fn apply_configure(
    state: &Rc<RefCell<ScenarioState>>,
    key: &str,
    value: crate::config::ConfigValue,
) -> Result<()> {
    let mut st = state.borrow_mut();
    let rebuild = st.config.configure(key, &value)?;
    if rebuild {
        st.client_dirty = true;
    }
    if key == "continueOnStepFailure" && !st.config.continue_on_step_failure {
        if let Some(deferred) = st.deferred_error.take() {
            st.error = Some(deferred.clone());
            st.stopped = true;
            return Err(deferred);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// call machinery, shared by the step executor and the script bridge
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Call,
    CallOnce,
    CallSingle,
}

/// What a nested call hands back to its caller.
pub struct CallOutcome {
    pub value: Value,
    pub bindings: Vec<(String, Binding)>,
    pub config: Option<RuntimeConfig>,
    pub driver: Option<DriverHandle>,
    pub feature_result: Option<FeatureResult>,
}

/// Caller context captured outside any engine borrow.
pub struct CallerSnapshot {
    pub suite: Arc<Suite>,
    pub feature: Arc<Feature>,
    pub caches: Arc<FeatureCaches>,
    pub config: RuntimeConfig,
    pub depth: usize,
}

pub fn snapshot(state: &Rc<RefCell<ScenarioState>>) -> CallerSnapshot {
    let st = state.borrow();
    CallerSnapshot {
        suite: st.suite.clone(),
        feature: st.feature.clone(),
        caches: st.caches.clone(),
        config: st.config.copy(),
        depth: st.call_depth,
    }
}

pub fn execute_call(
    snapshot: &CallerSnapshot,
    bindings: Vec<(String, Binding)>,
    raw_target: &str,
    arg: Option<Value>,
    shared_scope: bool,
    kind: CallKind,
    driver: Option<DriverHandle>,
) -> Result<CallOutcome> {
    match kind {
        CallKind::Call => run_call_target(snapshot, bindings, raw_target, arg, shared_scope, driver),
        CallKind::CallOnce => {
            let key = format!("callonce:{}", raw_target);
            let caches = snapshot.caches.clone();
            let mut passthrough_driver = driver;
            let value = caches.callonce.get_or_compute(&key, || {
                let outcome = run_call_target(
                    snapshot,
                    bindings,
                    raw_target,
                    arg,
                    false,
                    passthrough_driver.take(),
                )?;
                Ok(outcome.value)
            })?;
            Ok(CallOutcome {
                value,
                bindings: Vec::new(),
                config: None,
                driver: passthrough_driver,
                feature_result: None,
            })
        }
        CallKind::CallSingle => {
            let target = resource::parse_call_target(raw_target);
            let key = target.cache_key();
            let minutes = snapshot.config.call_single_cache.minutes;
            let dir = snapshot
                .suite
                .suite_root
                .join(&snapshot.config.call_single_cache.dir);
            let mut passthrough_driver = driver;
            let value = snapshot.suite.call_single_cache.get_or_compute(
                &key,
                minutes,
                &dir,
                || {
                    let outcome = run_call_target(
                        snapshot,
                        bindings,
                        raw_target,
                        arg,
                        false,
                        passthrough_driver.take(),
                    )?;
                    Ok(outcome.value)
                },
            )?;
            Ok(CallOutcome {
                value,
                bindings: Vec::new(),
                config: None,
                driver: passthrough_driver,
                feature_result: None,
            })
        }
    }
}

fn run_call_target(
    snapshot: &CallerSnapshot,
    bindings: Vec<(String, Binding)>,
    raw_target: &str,
    arg: Option<Value>,
    shared_scope: bool,
    driver: Option<DriverHandle>,
) -> Result<CallOutcome> {
    if snapshot.depth + 1 > MAX_CALL_DEPTH {
        return Err(EngineError::CallFailed(format!(
            "call depth exceeded {} at '{}'",
            MAX_CALL_DEPTH, raw_target
        )));
    }
    let target = resource::parse_call_target(raw_target);
    if target.path.ends_with(".js") {
        return run_js_call(snapshot, bindings, &target.path, arg, driver);
    }

    let feature = if target.is_current_feature() {
        snapshot.feature.clone()
    } else {
        let path = resource::resolve(
            &snapshot.suite.suite_root,
            snapshot.feature.path.parent(),
            &target.path,
        );
        Arc::new(Feature::read(&path)?)
    };
    let runtime = FeatureRuntime::for_call(
        snapshot.suite.clone(),
        feature.clone(),
        target.tag.clone(),
        target.lines.clone(),
    );

    match arg {
        // a list argument loops the call once per element
        Some(Value::Array(items)) => {
            let mut results = Vec::with_capacity(items.len());
            let mut feature_result =
                FeatureResult::new(feature.name.clone(), feature.relative_path.clone());
            let mut passthrough = driver;
            for (index, item) in items.into_iter().enumerate() {
                let run = run_selected(
                    snapshot,
                    &runtime,
                    bindings.clone(),
                    Some(item),
                    Some(index),
                    passthrough.take(),
                )?;
                passthrough = run.driver;
                for r in run.feature_result.scenario_results {
                    feature_result.add_result(r);
                }
                results.push(Value::Object(run.vars));
            }
            Ok(CallOutcome {
                value: Value::Array(results),
                bindings: Vec::new(),
                config: None,
                driver: passthrough,
                feature_result: Some(feature_result),
            })
        }
        other => {
            let run = run_selected(snapshot, &runtime, bindings, other, None, driver)?;
            Ok(CallOutcome {
                value: Value::Object(run.vars),
                bindings: if shared_scope {
                    run.bindings
                } else {
                    Vec::new()
                },
                config: shared_scope.then_some(run.config),
                driver: run.driver,
                feature_result: Some(run.feature_result),
            })
        }
    }
}

struct SelectedRun {
    vars: Map<String, Value>,
    bindings: Vec<(String, Binding)>,
    config: RuntimeConfig,
    driver: Option<DriverHandle>,
    feature_result: FeatureResult,
}

/// Runs every selected scenario of the callee in order, chaining variables
/// from one scenario into the next. A fresh FeatureRuntime per call keeps the
/// Feature -> Scenario -> Feature graph acyclic at runtime.
fn run_selected(
    snapshot: &CallerSnapshot,
    runtime: &FeatureRuntime,
    bindings: Vec<(String, Binding)>,
    arg: Option<Value>,
    loop_index: Option<usize>,
    driver: Option<DriverHandle>,
) -> Result<SelectedRun> {
    let mut current_bindings = bindings;
    let mut current_config = snapshot.config.copy();
    let mut current_driver = driver;
    let mut vars = Map::new();
    let mut feature_result = FeatureResult::new(
        runtime.feature.name.clone(),
        runtime.feature.relative_path.clone(),
    );
    let mut ran_any = false;

    let scenarios: Vec<Scenario> = runtime.scenarios().collect();
    for scenario in scenarios {
        let ctx = CallContext {
            arg: arg.clone(),
            loop_index,
            shared_scope: false,
            bindings: current_bindings.clone(),
            config: current_config.copy(),
            driver: current_driver.take(),
            depth: snapshot.depth + 1,
        };
        let nested = ScenarioRuntime::new(
            snapshot.suite.clone(),
            runtime.feature.clone(),
            scenario,
            Some(ctx),
        )?;
        let finished = nested.call();
        current_driver = finished.driver;
        let failed = finished.error.is_some() || finished.result.is_failed();
        let message = finished.result.error_message();
        feature_result.add_result(finished.result);
        if failed {
            if let Some(handle) = current_driver.take() {
                let provider = snapshot.suite.driver_provider.clone();
                handle.release(provider.as_deref());
            }
            return Err(EngineError::CallFailed(message.unwrap_or_else(|| {
                format!("called feature failed: {}", runtime.feature.relative_path)
            })));
        }
        current_bindings = finished.bindings;
        current_config = finished.config;
        vars = finished.vars;
        ran_any = true;
    }

    if !ran_any {
        return Err(EngineError::CallFailed(format!(
            "no scenario selected in called feature: {}",
            runtime.feature.relative_path
        )));
    }

    Ok(SelectedRun {
        vars,
        bindings: current_bindings,
        config: current_config,
        driver: current_driver,
        feature_result,
    })
}

/// Runs a .js call target inside a nested runtime so the script sees the
/// full bridge surface. The file's completion value (a function is invoked
/// with the arg) becomes the call result.
fn run_js_call(
    snapshot: &CallerSnapshot,
    bindings: Vec<(String, Binding)>,
    path: &str,
    arg: Option<Value>,
    driver: Option<DriverHandle>,
) -> Result<CallOutcome> {
    let resolved = resource::resolve(
        &snapshot.suite.suite_root,
        snapshot.feature.path.parent(),
        path,
    );
    let source = resource::read_text(&resolved)?;
    let pseudo = Scenario {
        feature_name: snapshot.feature.name.clone(),
        feature_path: snapshot.feature.relative_path.clone(),
        name: format!("call {}", path),
        description: String::new(),
        line: 0,
        tags: Vec::new(),
        section_index: 0,
        example_index: None,
        example_data: Map::new(),
        steps: Vec::new(),
        is_fail: false,
    };
    let ctx = CallContext {
        arg: arg.clone(),
        loop_index: None,
        shared_scope: false,
        bindings,
        config: snapshot.config.copy(),
        driver,
        depth: snapshot.depth + 1,
    };
    let nested = ScenarioRuntime::new(
        snapshot.suite.clone(),
        snapshot.feature.clone(),
        pseudo,
        Some(ctx),
    )?;
    let trimmed = source.trim();
    let sv = if trimmed.starts_with("function") {
        // an anonymous function file is an expression, not a declaration
        nested.engine.eval(&format!("({})", trimmed))?
    } else {
        nested.engine.eval_expression(trimmed)?
    };
    let value = match sv.function_source {
        Some(func) => {
            let args: Vec<Value> = arg.into_iter().collect();
            nested.engine.invoke_function(&func, &args)?.value
        }
        None => sv.value,
    };
    let finished = nested.call();
    Ok(CallOutcome {
        value,
        bindings: Vec::new(),
        config: None,
        driver: finished.driver,
        feature_result: None,
    })
}

/// Runs a `@setup` scenario of the current feature, optionally memoized per
/// feature under `setuponce:<name or __default__>`.
pub fn run_setup(
    snapshot: &CallerSnapshot,
    bindings: Vec<(String, Binding)>,
    name: &str,
    once: bool,
) -> Result<Value> {
    let scenario = find_setup_scenario(&snapshot.feature, name).ok_or_else(|| {
        EngineError::step(format!(
            "no @setup scenario{} found in {}",
            if name.is_empty() {
                String::new()
            } else {
                format!(" named '{}'", name)
            },
            snapshot.feature.relative_path
        ))
    })?;

    let body = {
        let snapshot_ref = snapshot;
        let scenario = scenario.clone();
        move || -> Result<Value> {
            let ctx = CallContext {
                arg: None,
                loop_index: None,
                shared_scope: false,
                bindings,
                config: snapshot_ref.config.copy(),
                driver: None,
                depth: snapshot_ref.depth + 1,
            };
            let nested = ScenarioRuntime::new(
                snapshot_ref.suite.clone(),
                snapshot_ref.feature.clone(),
                scenario,
                Some(ctx),
            )?;
            let finished = nested.call();
            if let Some(error) = finished.error {
                return Err(EngineError::CallFailed(
                    finished
                        .result
                        .error_message()
                        .unwrap_or_else(|| error.to_string()),
                ));
            }
            Ok(Value::Object(finished.vars))
        }
    };

    if once {
        let key = format!(
            "setuponce:{}",
            if name.is_empty() { "__default__" } else { name }
        );
        snapshot.caches.setuponce.get_or_compute(&key, body)
    } else {
        body()
    }
}

fn find_setup_scenario(feature: &Arc<Feature>, name: &str) -> Option<Scenario> {
    for (index, section) in feature.sections.iter().enumerate() {
        if let crate::feature::Section::Scenario(def) = section {
            let scenario = def.build(feature, index);
            if !scenario.is_setup() {
                continue;
            }
            if name.is_empty()
                || scenario.name == name
                || tags::tag_values(&scenario.tags, "setup").contains(&name)
            {
                return Some(scenario);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// HTTP core shared by the step executor and the bridge's fluent builder
// ---------------------------------------------------------------------------

/// Sends one prepared request: flushes the held perf event, rebuilds the
/// client if config demanded it, sends, merges cookies, captures the new
/// perf event, and records the request as `prevRequest`.
pub fn send_prepared(
    state: &Rc<RefCell<ScenarioState>>,
    prepared: PreparedRequest,
) -> Result<HttpResponse> {
    let client = {
        let mut st = state.borrow_mut();
        st.perf.flush(None);
        if st.client.is_none() || st.client_dirty {
            st.client = Some(http::build_client(&st.config)?);
            st.client_dirty = false;
        }
        match &st.client {
            Some(client) => client.clone(),
            None => return Err(EngineError::Fatal("http client missing".to_string())),
        }
    };

    let response = http::send(&client, &prepared);

    let mut st = state.borrow_mut();
    st.prev_request = Some(prepared.clone());
    st.builder.clear_transients();
    let response = response?;
    st.cookie_jar.merge_response(&response);
    if st.perf.active() {
        if let Some(name) = st.perf.event_name(&prepared.method, &prepared.url) {
            st.perf.capture(PerfEvent {
                name,
                start_millis: response.start_millis,
                duration_millis: response.duration_nanos / 1_000_000,
                status: response.status,
                failed: false,
                message: None,
            });
        }
    }
    st.last_response = Some(response.clone());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn rendezvous_round_trip_resets_for_reuse() {
        let rendezvous = Arc::new(Rendezvous::default());
        let producer = rendezvous.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.signal(json!({ "ok": true }));
        });
        let value = rendezvous.wait(5000).unwrap();
        assert_eq!(value, json!({ "ok": true }));
        handle.join().unwrap();

        // slot was drained; a second wait times out rather than re-reading
        let err = rendezvous.wait(30).unwrap_err();
        assert!(matches!(err, EngineError::ListenTimeout(30)));

        // and the cycle works again
        rendezvous.signal(json!(2));
        assert_eq!(rendezvous.wait(1000).unwrap(), json!(2));
    }

    #[test]
    fn rendezvous_signal_before_wait_is_not_lost() {
        let rendezvous = Rendezvous::default();
        rendezvous.signal(json!("early"));
        assert_eq!(rendezvous.wait(10).unwrap(), json!("early"));
    }
}
