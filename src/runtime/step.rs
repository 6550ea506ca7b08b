// Step dispatch: one entry point that turns a parsed step into a StepResult.
// Keyword-based dispatch; anything unrecognized is evaluated as a script
// expression, which is what makes `* karate.log('x')` a valid step.

use std::time::Instant;

use serde_json::{Map, Value};
use tracing::info;

use crate::config::{ConfigValue, HeadersConfig};
use crate::errors::{EngineError, Result};
use crate::feature::Step;
use crate::http;
use crate::matching::{self, MatchSpec};
use crate::results::{now_millis, FeatureResult, StepResult};
use crate::runtime::scenario::{self, CallKind, ScenarioRuntime};
use crate::script::ScriptValue;

/// Runs one step to completion and folds failures through the scenario's
/// error gates (`continueOnStepFailure`, abort).
pub fn execute(rt: &ScenarioRuntime, step: &Step) -> StepResult {
    let start_millis = now_millis();
    let started = Instant::now();
    rt.state.borrow_mut().step_log.clear();

    let outcome = dispatch(rt, step);

    let duration_nanos = started.elapsed().as_nanos() as u64;
    let log = std::mem::take(&mut rt.state.borrow_mut().step_log);

    let mut result = match outcome {
        Ok(call_results) => {
            let (aborted, pass_on_abort) = {
                let st = rt.state.borrow();
                (st.aborted, st.config.aborted_steps_should_pass)
            };
            if aborted && !pass_on_abort {
                let error = EngineError::step("scenario aborted");
                let mut st = rt.state.borrow_mut();
                if st.error.is_none() {
                    st.error = Some(error.clone());
                }
                drop(st);
                StepResult::failed(step.clone(), start_millis, duration_nanos, &error)
            } else {
                let mut result =
                    StepResult::passed(step.clone(), start_millis, duration_nanos);
                for call_result in call_results {
                    result.add_call_result(call_result);
                }
                result
            }
        }
        Err(e) => {
            let aborted = rt.state.borrow().aborted;
            if aborted {
                let pass_on_abort = rt.state.borrow().config.aborted_steps_should_pass;
                if pass_on_abort {
                    StepResult::passed(step.clone(), start_millis, duration_nanos)
                } else {
                    let error = EngineError::step("scenario aborted");
                    rt.state.borrow_mut().error = Some(error.clone());
                    StepResult::failed(step.clone(), start_millis, duration_nanos, &error)
                }
            } else {
                let mut st = rt.state.borrow_mut();
                if st.config.continue_on_step_failure {
                    if st.deferred_error.is_none() {
                        st.deferred_error = Some(e.clone());
                    }
                } else if st.error.is_none() {
                    st.error = Some(e.clone());
                    st.stopped = true;
                } else {
                    st.stopped = true;
                }
                drop(st);
                StepResult::failed(step.clone(), start_millis, duration_nanos, &e)
            }
        }
    };
    for line in log {
        result.append_log(line);
    }
    result
}

fn dispatch(rt: &ScenarioRuntime, step: &Step) -> Result<Vec<FeatureResult>> {
    let text = step.text.trim();
    let (keyword, rest) = match text.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (text, ""),
    };
    match keyword {
        "def" => assignment(rt, rest, step),
        "text" => {
            let (name, _) = parse_assignment(rest)?;
            let body = step
                .docstring
                .clone()
                .ok_or_else(|| EngineError::step("text requires a docstring"))?;
            rt.engine.put(&name, &Value::String(body))?;
            Ok(Vec::new())
        }
        "json" => {
            let (name, rhs) = parse_assignment(rest)?;
            let value = match &step.docstring {
                Some(doc) => serde_json::from_str(doc)
                    .map_err(|e| EngineError::step(format!("invalid json: {}", e)))?,
                None => {
                    let sv = rt.engine.eval_expression(&rhs)?;
                    match sv.value {
                        Value::String(s) => serde_json::from_str(&s)
                            .map_err(|e| EngineError::step(format!("invalid json: {}", e)))?,
                        other => other,
                    }
                }
            };
            rt.engine.put(&name, &value)?;
            Ok(Vec::new())
        }
        "xml" => {
            let (name, rhs) = parse_assignment(rest)?;
            let body = match &step.docstring {
                Some(doc) => Value::String(doc.clone()),
                None => rt.engine.eval_expression(&rhs)?.value,
            };
            rt.engine.put(&name, &body)?;
            Ok(Vec::new())
        }
        "copy" => {
            let (name, rhs) = parse_assignment(rest)?;
            rt.engine.eval(&format!(
                "globalThis[{:?}] = JSON.parse(JSON.stringify({}));",
                name, rhs
            ))?;
            rt.engine.track(&name);
            Ok(Vec::new())
        }
        "string" => {
            let (name, rhs) = parse_assignment(rest)?;
            rt.engine.eval(&format!(
                "globalThis[{:?}] = (function () {{ var v = ({}); \
                 return typeof v === 'string' ? v : JSON.stringify(v); }})();",
                name, rhs
            ))?;
            rt.engine.track(&name);
            Ok(Vec::new())
        }
        "table" => {
            let name = rest.trim();
            let table = step
                .table
                .as_ref()
                .ok_or_else(|| EngineError::step("table requires rows"))?;
            let mut list = Vec::new();
            for row in table.rows_as_maps() {
                let mut out = Map::new();
                for (column, cell) in row {
                    let cell_text = cell.as_str().unwrap_or_default();
                    if cell_text.is_empty() {
                        continue;
                    }
                    let value = rt.engine.eval_expression(cell_text)?.value;
                    out.insert(column, value);
                }
                list.push(Value::Object(out));
            }
            rt.engine.put(name, &Value::Array(list))?;
            Ok(Vec::new())
        }
        "set" => {
            let root: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect();
            if !root.is_empty() && rt.engine.get(&root).is_none() {
                rt.engine.put(&root, &Value::Object(Map::new()))?;
            }
            rt.engine.eval(rest)?;
            if !root.is_empty() {
                rt.engine.track(&root);
            }
            Ok(Vec::new())
        }
        "remove" => {
            rt.engine.eval(&format!("delete {}", rest))?;
            Ok(Vec::new())
        }
        "replace" => replace_step(rt, rest),
        "assert" => {
            let sv = rt.engine.eval(&format!("!!({})", rest))?;
            if sv.value == Value::Bool(true) {
                Ok(Vec::new())
            } else {
                Err(EngineError::step(format!("assert failed: {}", rest)))
            }
        }
        "print" => {
            let sv = rt.engine.eval(&format!("[{}]", rest))?;
            let rendered = match sv.value {
                Value::Array(items) => items
                    .iter()
                    .map(render_value)
                    .collect::<Vec<_>>()
                    .join(" "),
                other => render_value(&other),
            };
            info!(target: "karate", "[print] {}", rendered);
            rt.state.borrow_mut().step_log.push(rendered);
            Ok(Vec::new())
        }
        "configure" => {
            let (key, rhs) = parse_assignment(rest)?;
            let sv = rt.engine.eval_expression(&rhs)?;
            let value = to_config_value(sv);
            scenario::apply_configure(&rt.state, &key, value)?;
            Ok(Vec::new())
        }
        "url" => {
            let url = eval_to_string(rt, rest)?;
            rt.state.borrow_mut().builder.url = Some(url);
            Ok(Vec::new())
        }
        "path" => {
            let sv = rt.engine.eval(&format!("[{}]", rest))?;
            if let Value::Array(segments) = sv.value {
                let mut st = rt.state.borrow_mut();
                for segment in &segments {
                    st.builder.paths.push(value_to_text(segment));
                }
            }
            Ok(Vec::new())
        }
        "param" => {
            let (name, rhs) = parse_assignment(rest)?;
            let value = rt.engine.eval_expression(&rhs)?.value;
            let mut st = rt.state.borrow_mut();
            match value {
                Value::Array(items) => {
                    for item in &items {
                        st.builder.params.push((name.clone(), value_to_text(item)));
                    }
                }
                other => st.builder.params.push((name, value_to_text(&other))),
            }
            Ok(Vec::new())
        }
        "params" => {
            let value = rt.engine.eval_expression(rest)?.value;
            if let Value::Object(map) = value {
                let mut st = rt.state.borrow_mut();
                for (name, item) in map {
                    match item {
                        Value::Null => {}
                        Value::Array(items) => {
                            for item in &items {
                                st.builder.params.push((name.clone(), value_to_text(item)));
                            }
                        }
                        other => st.builder.params.push((name, value_to_text(&other))),
                    }
                }
            }
            Ok(Vec::new())
        }
        "header" => {
            let (name, rhs) = parse_assignment(rest)?;
            let value = eval_to_string(rt, &rhs)?;
            rt.state.borrow_mut().builder.headers.push((name, value));
            Ok(Vec::new())
        }
        "headers" => {
            let value = rt.engine.eval_expression(rest)?.value;
            if let Value::Object(map) = value {
                let mut st = rt.state.borrow_mut();
                for (name, item) in map {
                    if !item.is_null() {
                        st.builder.headers.push((name, value_to_text(&item)));
                    }
                }
            }
            Ok(Vec::new())
        }
        "cookie" => {
            let (name, rhs) = parse_assignment(rest)?;
            let value = eval_to_string(rt, &rhs)?;
            rt.state.borrow_mut().builder.cookies.push((name, value));
            Ok(Vec::new())
        }
        "cookies" => {
            let value = rt.engine.eval_expression(rest)?.value;
            if let Value::Object(map) = value {
                let mut st = rt.state.borrow_mut();
                for (name, item) in map {
                    if !item.is_null() {
                        st.builder.cookies.push((name, value_to_text(&item)));
                    }
                }
            }
            Ok(Vec::new())
        }
        "form" => {
            let rest = rest
                .strip_prefix("field")
                .map(str::trim)
                .ok_or_else(|| EngineError::step("expected 'form field <name> = <value>'"))?;
            let (name, rhs) = parse_assignment(rest)?;
            let value = eval_to_string(rt, &rhs)?;
            rt.state
                .borrow_mut()
                .builder
                .form_fields
                .push((name, value));
            Ok(Vec::new())
        }
        "request" => {
            match &step.docstring {
                Some(doc) => {
                    let mut st = rt.state.borrow_mut();
                    match serde_json::from_str::<Value>(doc) {
                        Ok(value) => st.builder.body = Some(value),
                        Err(_) => st.builder.body_text = Some(doc.clone()),
                    }
                }
                None => {
                    let value = rt.engine.eval_expression(rest)?.value;
                    let mut st = rt.state.borrow_mut();
                    match value {
                        Value::String(text) => st.builder.body_text = Some(text),
                        other => st.builder.body = Some(other),
                    }
                }
            }
            Ok(Vec::new())
        }
        "method" => http_method(rt, rest),
        "status" => {
            let expected: u16 = rest
                .trim()
                .parse()
                .map_err(|_| EngineError::step(format!("invalid status '{}'", rest)))?;
            let actual = {
                let st = rt.state.borrow();
                st.last_response
                    .as_ref()
                    .map(|r| (r.status, r.body_string()))
            };
            match actual {
                None => Err(EngineError::step("status check before any http call")),
                Some((status, _)) if status == expected => Ok(Vec::new()),
                Some((status, body)) => Err(EngineError::step(format!(
                    "status code was: {}, expected: {}, response: {}",
                    status,
                    expected,
                    truncate(&body, 300)
                ))),
            }
        }
        "retry" => {
            let condition = rest
                .strip_prefix("until")
                .map(str::trim)
                .ok_or_else(|| EngineError::step("expected 'retry until <condition>'"))?;
            rt.state.borrow_mut().builder.retry_until = Some(condition.to_string());
            Ok(Vec::new())
        }
        "sleep" => {
            let value = rt.engine.eval_expression(rest)?.value;
            let millis = value.as_u64().or_else(|| value.as_f64().map(|f| f as u64));
            match millis {
                Some(ms) => {
                    std::thread::sleep(std::time::Duration::from_millis(ms));
                    Ok(Vec::new())
                }
                None => Err(EngineError::step(format!("invalid sleep value '{}'", rest))),
            }
        }
        "eval" => {
            rt.engine.eval(rest)?;
            Ok(Vec::new())
        }
        "match" => match_step(rt, rest, step),
        "call" => call_step(rt, rest, CallKind::Call),
        "callonce" => call_step(rt, rest, CallKind::CallOnce),
        "driver" => {
            if !rest.is_empty() {
                // `driver '<url>'` folds the url into the driver options
                let value = rt.engine.eval_expression(rest)?.value;
                let mut st = rt.state.borrow_mut();
                let mut options = st.config.driver.take().unwrap_or_default();
                match value {
                    Value::String(url) => {
                        options.insert("url".to_string(), Value::String(url));
                    }
                    Value::Object(map) => options.extend(map),
                    _ => {}
                }
                st.config.driver = Some(options);
            }
            scenario::init_driver(&rt.state)?;
            Ok(Vec::new())
        }
        "soap" | "multipart" => Err(EngineError::step(format!(
            "'{}' steps are not supported",
            keyword
        ))),
        _ => {
            rt.engine.eval(text)?;
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn parse_assignment(text: &str) -> Result<(String, String)> {
    let (name, rhs) = text
        .split_once('=')
        .ok_or_else(|| EngineError::step(format!("expected '<name> = <value>' in '{}'", text)))?;
    Ok((name.trim().to_string(), rhs.trim().to_string()))
}

fn eval_to_string(rt: &ScenarioRuntime, expr: &str) -> Result<String> {
    let value = rt.engine.eval_expression(expr)?.value;
    Ok(value_to_text(&value))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() > max {
        format!("{}...", &text[..max])
    } else {
        text.to_string()
    }
}

fn to_config_value(sv: ScriptValue) -> ConfigValue {
    match sv.function_source {
        Some(source) => ConfigValue::Function(source),
        None => ConfigValue::Json(sv.value),
    }
}

/// Splits `<target> <arg?>` at the first top-level whitespace, respecting
/// quotes and brackets, so `call read('a.feature') { x: 1 }` parses.
fn split_call_text(text: &str) -> (String, Option<String>) {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                c if c.is_whitespace() && depth == 0 => {
                    let arg = text[i..].trim();
                    return (
                        text[..i].to_string(),
                        if arg.is_empty() {
                            None
                        } else {
                            Some(arg.to_string())
                        },
                    );
                }
                _ => {}
            },
        }
    }
    (text.to_string(), None)
}

/// Resolves a call target expression to a feature path, or invokes it
/// directly when it evaluates to a function.
enum CallTargetValue {
    Path(String),
    Function(String),
}

fn eval_call_target(rt: &ScenarioRuntime, target_expr: &str) -> Result<CallTargetValue> {
    let sv = rt.engine.eval_expression(target_expr)?;
    if let Some(source) = sv.function_source {
        return Ok(CallTargetValue::Function(source));
    }
    match sv.value {
        Value::String(path) => Ok(CallTargetValue::Path(path)),
        Value::Object(map) => match map.get("__feature").and_then(Value::as_str) {
            Some(path) => Ok(CallTargetValue::Path(path.to_string())),
            None => Err(EngineError::step(format!(
                "call target is not a feature or function: {}",
                target_expr
            ))),
        },
        other => Err(EngineError::step(format!(
            "call target is not callable: {}",
            other
        ))),
    }
}

fn assignment(rt: &ScenarioRuntime, rest: &str, step: &Step) -> Result<Vec<FeatureResult>> {
    let (name, rhs) = parse_assignment(rest)?;
    for (kind, prefix) in [
        (CallKind::CallOnce, "callonce "),
        (CallKind::Call, "call "),
    ] {
        if let Some(call_text) = rhs.strip_prefix(prefix) {
            let (value, results) = run_call(rt, call_text.trim(), kind, false)?;
            rt.engine.put(&name, &value)?;
            return Ok(results);
        }
    }
    if rhs.is_empty() {
        let doc = step
            .docstring
            .clone()
            .ok_or_else(|| EngineError::step("def requires a value"))?;
        let value =
            serde_json::from_str(&doc).unwrap_or(Value::String(doc));
        rt.engine.put(&name, &value)?;
        return Ok(Vec::new());
    }
    rt.engine
        .eval(&format!("globalThis[{:?}] = ({});", name, rhs))?;
    rt.engine.track(&name);
    Ok(Vec::new())
}

fn call_step(rt: &ScenarioRuntime, rest: &str, kind: CallKind) -> Result<Vec<FeatureResult>> {
    let shared = true;
    let (value, results) = run_call(rt, rest, kind, shared)?;
    // a cached shared call can only re-apply its exported variables
    if let Value::Object(map) = value {
        for (name, item) in &map {
            rt.engine.put(name, item)?;
        }
    }
    Ok(results)
}

fn run_call(
    rt: &ScenarioRuntime,
    call_text: &str,
    kind: CallKind,
    shared: bool,
) -> Result<(Value, Vec<FeatureResult>)> {
    let (target_expr, arg_expr) = split_call_text(call_text);
    let arg = match arg_expr {
        Some(expr) => match rt.engine.eval_expression(&expr)?.value {
            Value::Null => None,
            value => Some(value),
        },
        None => None,
    };

    match eval_call_target(rt, &target_expr)? {
        CallTargetValue::Function(source) => {
            let args: Vec<Value> = arg.into_iter().collect();
            let value = rt.engine.invoke_function(&source, &args)?.value;
            Ok((value, Vec::new()))
        }
        CallTargetValue::Path(path) => {
            let bindings = rt.engine.bindings();
            let snap = scenario::snapshot(&rt.state);
            let driver = rt.state.borrow_mut().driver.take();
            let outcome =
                scenario::execute_call(&snap, bindings, &path, arg, shared, kind, driver)?;
            if outcome.driver.is_some() {
                rt.state.borrow_mut().driver = outcome.driver;
            }
            if shared {
                for (name, binding) in &outcome.bindings {
                    if matches!(name.as_str(), "karate" | "read" | "match") {
                        continue;
                    }
                    rt.engine.put_binding(name, binding)?;
                }
                if let Some(config) = outcome.config {
                    let mut st = rt.state.borrow_mut();
                    st.config = config;
                    st.client_dirty = true;
                }
            }
            let results = outcome.feature_result.into_iter().collect();
            Ok((outcome.value, results))
        }
    }
}

fn replace_step(rt: &ScenarioRuntime, rest: &str) -> Result<Vec<FeatureResult>> {
    let (lhs, rhs) = parse_assignment(rest)?;
    let (name, token) = lhs
        .split_once('.')
        .ok_or_else(|| EngineError::step("expected 'replace <var>.<token> = <value>'"))?;
    let replacement = eval_to_string(rt, &rhs)?;
    let current = rt
        .engine
        .get(name)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| EngineError::step(format!("'{}' is not a string variable", name)))?;
    let updated = current.replace(&format!("<{}>", token), &replacement);
    rt.engine.put(name, &Value::String(updated))?;
    Ok(Vec::new())
}

fn match_step(rt: &ScenarioRuntime, rest: &str, step: &Step) -> Result<Vec<FeatureResult>> {
    let mut text = rest.trim();
    let mut each = false;
    if let Some(stripped) = text.strip_prefix("each ") {
        each = true;
        text = stripped.trim();
    }
    // longer contains-variants first so the leftmost hit is also the longest
    const OPS: [&str; 7] = [
        " contains only ",
        " contains any ",
        " contains deep ",
        " !contains ",
        " contains ",
        " == ",
        " != ",
    ];
    let mut found: Option<(usize, &str)> = None;
    for op in OPS {
        if let Some(index) = text.find(op) {
            if found.map(|(at, _)| index < at).unwrap_or(true) {
                found = Some((index, op));
            }
        }
    }
    let (index, op) = found.ok_or_else(|| {
        EngineError::step(format!("invalid match expression: {}", rest))
    })?;
    let lhs = text[..index].trim();
    let rhs = text[index + op.len()..].trim();

    let lhs = normalize_lhs(lhs);
    let actual = rt.engine.eval_expression(&lhs)?.value;
    let expected = if rhs.is_empty() {
        let doc = step
            .docstring
            .clone()
            .ok_or_else(|| EngineError::step("match needs an expected value"))?;
        serde_json::from_str(&doc).unwrap_or(Value::String(doc))
    } else {
        rt.engine.eval_expression(rhs)?.value
    };

    let spec_text = format!("{}{}", if each { "each " } else { "" }, op.trim());
    let spec = MatchSpec::parse(&spec_text)
        .ok_or_else(|| EngineError::step(format!("invalid match operator '{}'", spec_text)))?;
    let each_empty_allowed = rt.state.borrow().config.match_each_empty_allowed;
    let result = matching::execute(spec, &actual, &expected, each_empty_allowed);
    if result.pass {
        Ok(Vec::new())
    } else {
        Err(EngineError::step(
            result
                .message
                .unwrap_or_else(|| "match failed".to_string()),
        ))
    }
}

/// `$` addresses the response root in match expressions.
fn normalize_lhs(lhs: &str) -> String {
    if lhs == "$" {
        return "response".to_string();
    }
    if let Some(rest) = lhs.strip_prefix("$.") {
        return format!("response.{}", rest);
    }
    if let Some(rest) = lhs.strip_prefix("$[") {
        return format!("response[{}", rest);
    }
    lhs.to_string()
}

fn http_method(rt: &ScenarioRuntime, verb: &str) -> Result<Vec<FeatureResult>> {
    let method = verb.trim();
    if method.is_empty() {
        return Err(EngineError::step("method requires an http verb"));
    }

    let headers_config = rt.state.borrow().config.headers.clone();
    let config_headers: Option<Map<String, Value>> = match headers_config {
        HeadersConfig::None => None,
        HeadersConfig::Map(map) => Some(map),
        HeadersConfig::Function(source) => match rt.engine.invoke_function(&source, &[])?.value {
            Value::Object(map) => Some(map),
            _ => None,
        },
    };

    let (prepared, retry_until, attempts, interval_ms) = {
        let st = rt.state.borrow();
        let prepared = http::prepare(
            &st.builder,
            &st.config,
            &st.cookie_jar,
            config_headers.as_ref(),
            method,
        )?;
        let retry_until = st.builder.retry_until.clone();
        let attempts = if retry_until.is_some() {
            st.config.retry.count.max(1)
        } else {
            1
        };
        (prepared, retry_until, attempts, st.config.retry.interval_ms)
    };

    for attempt in 0..attempts {
        let response = scenario::send_prepared(&rt.state, prepared.clone())?;
        publish_response(rt, &response)?;
        let Some(condition) = &retry_until else {
            return Ok(Vec::new());
        };
        let satisfied = rt.engine.eval(&format!("!!({})", condition))?.value == Value::Bool(true);
        if satisfied {
            return Ok(Vec::new());
        }
        if attempt + 1 < attempts {
            std::thread::sleep(std::time::Duration::from_millis(interval_ms));
        }
    }
    Err(EngineError::step(format!(
        "retry condition not satisfied after {} attempts: {}",
        attempts,
        retry_until.unwrap_or_default()
    )))
}

fn publish_response(rt: &ScenarioRuntime, response: &crate::http::HttpResponse) -> Result<()> {
    rt.engine.put("response", &response.body_value())?;
    rt.engine
        .put("responseStatus", &Value::from(response.status))?;
    rt.engine
        .put("responseHeaders", &Value::Object(response.header_map()))?;
    let cookies = rt.state.borrow().cookie_jar.as_map();
    rt.engine
        .put("responseCookies", &Value::Object(cookies))?;
    rt.engine.put(
        "responseTime",
        &Value::from(response.duration_nanos / 1_000_000),
    )?;
    Ok(())
}
