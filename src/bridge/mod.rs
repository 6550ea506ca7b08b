// Module: Bridge
// The `karate` object exposed to scripts. Pure helpers live in the JS
// prelude; everything that touches runtime state goes through host functions
// installed here. Host calls exchange JSON strings in an { ok } / { err }
// envelope, which keeps the host closures free of engine value lifetimes.

use std::cell::RefCell;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use rquickjs::{Function, Object};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::{ConfigValue, HeadersConfig};
use crate::errors::{EngineError, Result};
use crate::http::HttpRequestBuilder;
use crate::matching::{self, MatchSpec};
use crate::resource;
use crate::runtime::scenario::{self, CallKind, ScenarioState};
use crate::script::{Binding, ScriptEngine};

const PRELUDE: &str = include_str!("prelude.js");

type StateRef = Rc<RefCell<ScenarioState>>;

fn ok(value: Value) -> String {
    json!({ "ok": value }).to_string()
}

fn fail(message: impl std::fmt::Display) -> String {
    json!({ "err": message.to_string() }).to_string()
}

fn envelope(result: Result<Value>) -> String {
    match result {
        Ok(value) => ok(value),
        Err(e) => fail(e),
    }
}

fn parse_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

/// Installs the `__host` object and evaluates the prelude, publishing
/// `karate`, `read` and `match` as globals.
pub fn install(engine: &ScriptEngine, state: StateRef) -> Result<()> {
    let names = engine.names_handle();
    engine
        .with_context(|ctx: rquickjs::Ctx<'_>| -> rquickjs::Result<()> {
            let host = Object::new(ctx.clone())?;

            {
                let state = state.clone();
                host.set(
                    "info",
                    Function::new(ctx.clone(), move |kind: String| -> String {
                        envelope(host_info(&state, &kind))
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "read",
                    Function::new(ctx.clone(), move |path: String| -> String {
                        envelope(host_read(&state, &path))
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "call",
                    Function::new(
                        ctx.clone(),
                        move |target: String, arg: String, once: String, vars: String| -> String {
                            envelope(host_call(&state, &target, &arg, &once, &vars))
                        },
                    )?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "setup",
                    Function::new(
                        ctx.clone(),
                        move |name: String, once: bool, vars: String| -> String {
                            envelope(host_setup(&state, &name, once, &vars))
                        },
                    )?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "http",
                    Function::new(ctx.clone(), move |payload: String| -> String {
                        envelope(host_http(&state, &payload))
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "config_headers",
                    Function::new(ctx.clone(), move || -> String {
                        let headers = state.borrow().config.headers.clone();
                        let value = match headers {
                            HeadersConfig::None => json!({ "kind": "none" }),
                            HeadersConfig::Map(map) => json!({ "kind": "map", "value": map }),
                            HeadersConfig::Function(source) => {
                                json!({ "kind": "fn", "source": source })
                            }
                        };
                        ok(value)
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "configure",
                    Function::new(
                        ctx.clone(),
                        move |key: String, value: String, fn_source: String| -> String {
                            envelope(
                                host_configure(&state, &key, &value, &fn_source)
                                    .map(|_| Value::Null),
                            )
                        },
                    )?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "match_values",
                    Function::new(
                        ctx.clone(),
                        move |actual: String, expected: String, op: String| -> String {
                            envelope(host_match(&state, &actual, &expected, &op))
                        },
                    )?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "log",
                    Function::new(ctx.clone(), move |message: String| -> String {
                        info!(target: "karate", "{}", message);
                        state.borrow_mut().step_log.push(message);
                        ok(Value::Null)
                    })?,
                )?;
            }
            {
                let names = names.clone();
                host.set(
                    "track",
                    Function::new(ctx.clone(), move |csv: String| -> String {
                        let mut set = names.borrow_mut();
                        for name in csv.split(',').filter(|n| !n.is_empty()) {
                            set.insert(name.to_string());
                        }
                        ok(Value::Null)
                    })?,
                )?;
            }
            {
                let names = names.clone();
                host.set(
                    "var_names",
                    Function::new(ctx.clone(), move || -> String {
                        let list: Vec<Value> = names
                            .borrow()
                            .iter()
                            .map(|n| Value::String(n.clone()))
                            .collect();
                        ok(Value::Array(list))
                    })?,
                )?;
            }
            host.set(
                "uuid",
                Function::new(ctx.clone(), move || -> String {
                    ok(Value::String(uuid::Uuid::new_v4().to_string()))
                })?,
            )?;
            host.set(
                "url_encode",
                Function::new(ctx.clone(), move |s: String| -> String {
                    ok(Value::String(urlencoding::encode(&s).to_string()))
                })?,
            )?;
            host.set(
                "url_decode",
                Function::new(ctx.clone(), move |s: String| -> String {
                    match urlencoding::decode(&s) {
                        Ok(decoded) => ok(Value::String(decoded.to_string())),
                        Err(e) => fail(format!("urlDecode failed: {}", e)),
                    }
                })?,
            )?;
            host.set(
                "to_csv",
                Function::new(ctx.clone(), move |list: String| -> String {
                    envelope(host_to_csv(&parse_json(&list)))
                })?,
            )?;
            host.set(
                "json_path",
                Function::new(ctx.clone(), move |doc: String, path: String| -> String {
                    envelope(host_json_path(&parse_json(&doc), &path))
                })?,
            )?;
            host.set(
                "xml_path",
                Function::new(ctx.clone(), move |xml: String, path: String| -> String {
                    envelope(host_xml_path(&xml, &path))
                })?,
            )?;
            host.set(
                "pause",
                Function::new(ctx.clone(), move |ms: f64| -> String {
                    std::thread::sleep(Duration::from_millis(ms.max(0.0) as u64));
                    ok(Value::Null)
                })?,
            )?;
            {
                let state = state.clone();
                host.set(
                    "wait_for_http",
                    Function::new(ctx.clone(), move |url: String| -> String {
                        envelope(host_wait_for_http(&state, &url))
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "wait_for_port",
                    Function::new(ctx.clone(), move |host_name: String, port: f64| -> String {
                        envelope(host_wait_for_port(&state, &host_name, port as u16))
                    })?,
                )?;
            }
            host.set(
                "stop",
                Function::new(ctx.clone(), move |port: f64| -> String {
                    envelope(host_stop(port as u16))
                })?,
            )?;
            {
                let state = state.clone();
                host.set(
                    "signal",
                    Function::new(ctx.clone(), move |value: String| -> String {
                        let rendezvous = state.borrow().rendezvous.clone();
                        rendezvous.signal(parse_json(&value));
                        ok(Value::Null)
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "listen",
                    Function::new(ctx.clone(), move |timeout_ms: f64| -> String {
                        let rendezvous = state.borrow().rendezvous.clone();
                        envelope(rendezvous.wait(timeout_ms.max(0.0) as u64))
                    })?,
                )?;
            }
            {
                let state = state.clone();
                host.set(
                    "abort",
                    Function::new(ctx.clone(), move || -> String {
                        let mut st = state.borrow_mut();
                        st.aborted = true;
                        st.stopped = true;
                        ok(Value::Null)
                    })?,
                )?;
            }

            ctx.globals().set("__host", host)?;
            Ok(())
        })
        .map_err(|e| EngineError::Fatal(format!("bridge install failed: {}", e)))?;

    engine.eval(PRELUDE)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// host implementations
// ---------------------------------------------------------------------------

fn host_info(state: &StateRef, kind: &str) -> Result<Value> {
    let st = state.borrow();
    let value = match kind {
        "env" => st
            .suite
            .env
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        "os" => json!({ "type": std::env::consts::OS, "name": std::env::consts::OS }),
        "properties" => Value::Object(st.suite.properties.clone()),
        "scenario" => json!({
            "name": st.scenario.name,
            "line": st.scenario.line,
            "ref": st.scenario.ref_id(),
            "exampleIndex": st.scenario.example_index.map(|i| i as i64).unwrap_or(-1),
            "exampleData": st.scenario.example_data,
        }),
        "feature" => json!({
            "name": st.feature.name,
            "path": st.feature.relative_path,
        }),
        "info" => json!({
            "scenarioName": st.scenario.name,
            "scenarioRef": st.scenario.ref_id(),
            "featureFileName": st.feature.relative_path,
            "errorMessage": st.error.as_ref().map(|e| e.to_string()),
        }),
        "tags" => Value::Array(
            st.scenario
                .tags
                .iter()
                .map(|t| Value::String(t.name.clone()))
                .collect(),
        ),
        "tagValues" => {
            let mut map = Map::new();
            for tag in &st.scenario.tags {
                let values: Vec<Value> = tag
                    .values
                    .iter()
                    .map(|v| Value::String(v.clone()))
                    .collect();
                map.insert(tag.name.clone(), Value::Array(values));
            }
            Value::Object(map)
        }
        "config" => {
            let c = &st.config;
            json!({
                "url": c.url,
                "readTimeout": c.read_timeout_ms,
                "connectTimeout": c.connect_timeout_ms,
                "followRedirects": c.follow_redirects,
                "charset": c.charset,
                "sslEnabled": c.ssl.is_some(),
                "sslTrustAll": c.ssl.as_ref().map(|s| s.trust_all).unwrap_or(false),
                "retryCount": c.retry.count,
                "retryInterval": c.retry.interval_ms,
                "httpRetryEnabled": c.http_retry_enabled,
                "continueOnStepFailure": c.continue_on_step_failure,
                "abortedStepsShouldPass": c.aborted_steps_should_pass,
                "abortSuiteOnFailure": c.abort_suite_on_failure,
                "matchEachEmptyAllowed": c.match_each_empty_allowed,
                "cors": c.cors,
                "callSingleCacheMinutes": c.call_single_cache.minutes,
                "callSingleCacheDir": c.call_single_cache.dir,
            })
        }
        "prevRequest" => st
            .prev_request
            .as_ref()
            .map(|r| r.as_value())
            .unwrap_or(Value::Null),
        other => return Err(EngineError::step(format!("unknown info kind '{}'", other))),
    };
    Ok(value)
}

fn host_read(state: &StateRef, path: &str) -> Result<Value> {
    let (suite_root, feature_path) = {
        let st = state.borrow();
        (st.suite.suite_root.clone(), st.feature.path.clone())
    };
    let resolved = resource::resolve(&suite_root, feature_path.parent(), path);
    let extension = resolved
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "feature" => Ok(json!({ "__kind": "feature", "path": resolved.display().to_string() })),
        "js" => {
            let source = resource::read_text(&resolved)?;
            Ok(json!({ "__kind": "js", "source": source }))
        }
        "json" => {
            let text = resource::read_text(&resolved)?;
            let value: Value = serde_json::from_str(&text).map_err(|e| {
                EngineError::io(format!("invalid json in {}: {}", resolved.display(), e))
            })?;
            Ok(json!({ "__kind": "value", "value": value }))
        }
        "csv" => {
            let text = resource::read_text(&resolved)?;
            Ok(json!({ "__kind": "value", "value": Value::Array(parse_csv(&text)) }))
        }
        _ => {
            let text = resource::read_text(&resolved)?;
            Ok(json!({ "__kind": "value", "value": Value::String(text) }))
        }
    }
}

/// Minimal quote-aware CSV reader: one map per row, first row is the header.
fn parse_csv(text: &str) -> Vec<Value> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut cells = Vec::new();
        let mut cell = String::new();
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes && chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => {
                    cells.push(cell.trim().to_string());
                    cell = String::new();
                }
                other => cell.push(other),
            }
        }
        cells.push(cell.trim().to_string());
        rows.push(cells);
    }
    let Some(header) = rows.first().cloned() else {
        return Vec::new();
    };
    rows[1..]
        .iter()
        .map(|row| {
            let mut map = Map::new();
            for (i, name) in header.iter().enumerate() {
                let cell = row.get(i).cloned().unwrap_or_default();
                map.insert(name.clone(), Value::String(cell));
            }
            Value::Object(map)
        })
        .collect()
}

fn parse_bindings(vars_json: &str) -> Vec<(String, Binding)> {
    let mut bindings = Vec::new();
    if let Value::Object(map) = parse_json(vars_json) {
        for (name, value) in map {
            match name.strip_prefix("__fn:") {
                Some(real_name) => {
                    if let Value::String(source) = value {
                        bindings.push((real_name.to_string(), Binding::Function(source)));
                    }
                }
                None => bindings.push((name, Binding::Json(value))),
            }
        }
    }
    bindings
}

fn host_call(
    state: &StateRef,
    target: &str,
    arg_json: &str,
    once: &str,
    vars_json: &str,
) -> Result<Value> {
    let kind = match once {
        "callonce" => CallKind::CallOnce,
        "callSingle" => CallKind::CallSingle,
        _ => CallKind::Call,
    };
    let arg = match parse_json(arg_json) {
        Value::Null => None,
        value => Some(value),
    };
    let bindings = parse_bindings(vars_json);
    let snap = scenario::snapshot(state);
    let driver = state.borrow_mut().driver.take();
    let outcome = scenario::execute_call(&snap, bindings, target, arg, false, kind, driver);
    match outcome {
        Ok(outcome) => {
            if outcome.driver.is_some() {
                state.borrow_mut().driver = outcome.driver;
            }
            Ok(outcome.value)
        }
        Err(e) => Err(e),
    }
}

fn host_setup(state: &StateRef, name: &str, once: bool, vars_json: &str) -> Result<Value> {
    let snap = scenario::snapshot(state);
    let bindings = parse_bindings(vars_json);
    scenario::run_setup(&snap, bindings, name, once)
}

fn host_http(state: &StateRef, payload_json: &str) -> Result<Value> {
    let payload = parse_json(payload_json);
    let method = payload
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("get")
        .to_string();

    let prepared = {
        let st = state.borrow();
        let mut builder = HttpRequestBuilder {
            url: payload
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| st.builder.url.clone()),
            ..Default::default()
        };
        if let Some(paths) = payload.get("paths").and_then(Value::as_array) {
            for p in paths.iter().filter_map(Value::as_str) {
                builder.paths.push(p.to_string());
            }
        }
        if let Some(params) = payload.get("params").and_then(Value::as_object) {
            for (name, value) in params {
                if let Some(text) = value.as_str() {
                    builder.params.push((name.clone(), text.to_string()));
                }
            }
        }
        if let Some(headers) = payload.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(text) = value.as_str() {
                    builder.headers.push((name.clone(), text.to_string()));
                }
            }
        }
        if payload
            .get("hasBody")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            match payload.get("body") {
                Some(Value::String(text)) => builder.body_text = Some(text.clone()),
                Some(body) => builder.body = Some(body.clone()),
                None => {}
            }
        }
        crate::http::prepare(&builder, &st.config, &st.cookie_jar, None, &method)?
    };

    let response = scenario::send_prepared(state, prepared)?;
    let cookies = state.borrow().cookie_jar.as_map();
    Ok(json!({
        "status": response.status,
        "body": response.body_value(),
        "headers": response.header_map(),
        "cookies": cookies,
        "time": response.duration_nanos / 1_000_000,
    }))
}

fn host_configure(state: &StateRef, key: &str, value_json: &str, fn_source: &str) -> Result<()> {
    let value = if fn_source.is_empty() {
        ConfigValue::Json(parse_json(value_json))
    } else {
        ConfigValue::Function(fn_source.to_string())
    };
    scenario::apply_configure(state, key, value)
}

fn host_match(state: &StateRef, actual_json: &str, expected_json: &str, op: &str) -> Result<Value> {
    let spec = MatchSpec::parse(op)
        .ok_or_else(|| EngineError::step(format!("invalid match operator '{}'", op)))?;
    let each_empty_allowed = state.borrow().config.match_each_empty_allowed;
    let result = matching::execute(
        spec,
        &parse_json(actual_json),
        &parse_json(expected_json),
        each_empty_allowed,
    );
    Ok(json!({ "pass": result.pass, "message": result.message }))
}

fn host_to_csv(value: &Value) -> Result<Value> {
    let rows = value
        .as_array()
        .ok_or_else(|| EngineError::step("toCsv expects a list of maps"))?;
    let mut header: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }
    }
    let mut out = String::new();
    out.push_str(&header.iter().map(|h| csv_escape(h)).collect::<Vec<_>>().join(","));
    out.push('\n');
    for row in rows {
        let map = row.as_object();
        let line: Vec<String> = header
            .iter()
            .map(|key| {
                let cell = map.and_then(|m| m.get(key)).cloned().unwrap_or(Value::Null);
                let text = match cell {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                csv_escape(&text)
            })
            .collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    Ok(Value::String(out))
}

fn csv_escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn host_json_path(doc: &Value, path: &str) -> Result<Value> {
    let found = jsonpath_lib::select(doc, path)
        .map_err(|e| EngineError::step(format!("jsonPath '{}' failed: {}", path, e)))?;
    let multi = path.contains('*') || path.contains("..") || path.contains("[?");
    let mut values: Vec<Value> = found.into_iter().cloned().collect();
    if multi {
        Ok(Value::Array(values))
    } else {
        match values.len() {
            0 => Ok(Value::Null),
            1 => Ok(values.remove(0)),
            _ => Ok(Value::Array(values)),
        }
    }
}

fn host_xml_path(xml: &str, path: &str) -> Result<Value> {
    let doc = xml_to_value(xml)?;
    Ok(xml_path_lookup(&doc, path))
}

/// Parses XML into a JSON shape: elements become maps (attributes prefixed
/// with `@`), repeated children become arrays, text-only elements become
/// strings.
fn xml_to_value(text: &str) -> Result<Value> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(text);
    let mut stack: Vec<(String, Map<String, Value>, Option<String>)> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut map = Map::new();
                for attr in e.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    map.insert(
                        key,
                        Value::String(String::from_utf8_lossy(&attr.value).to_string()),
                    );
                }
                stack.push((name, map, None));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut map = Map::new();
                for attr in e.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    map.insert(
                        key,
                        Value::String(String::from_utf8_lossy(&attr.value).to_string()),
                    );
                }
                let value = element_value(map, None);
                attach_element(&mut stack, &mut root, name, value);
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if text.trim().is_empty() {
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.2 = Some(text.trim().to_string());
                }
            }
            Ok(Event::End(_)) => {
                let Some((name, map, text)) = stack.pop() else {
                    break;
                };
                let value = element_value(map, text);
                attach_element(&mut stack, &mut root, name, value);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EngineError::step(format!("invalid xml: {}", e))),
            Ok(_) => {}
        }
    }

    match root {
        Some((name, value)) => {
            let mut map = Map::new();
            map.insert(name, value);
            Ok(Value::Object(map))
        }
        None => Err(EngineError::step("invalid xml: no root element")),
    }
}

fn element_value(map: Map<String, Value>, text: Option<String>) -> Value {
    match (map.is_empty(), text) {
        (true, Some(text)) => Value::String(text),
        (true, None) => Value::Null,
        (false, Some(text)) => {
            let mut map = map;
            map.insert("#text".to_string(), Value::String(text));
            Value::Object(map)
        }
        (false, None) => Value::Object(map),
    }
}

fn attach_element(
    stack: &mut [(String, Map<String, Value>, Option<String>)],
    root: &mut Option<(String, Value)>,
    name: String,
    value: Value,
) {
    match stack.last_mut() {
        Some(parent) => match parent.1.get_mut(&name) {
            Some(Value::Array(list)) => list.push(value),
            Some(existing) => {
                let first = existing.take();
                parent.1.insert(name, Value::Array(vec![first, value]));
            }
            None => {
                parent.1.insert(name, value);
            }
        },
        None => {
            if root.is_none() {
                *root = Some((name, value));
            }
        }
    }
}

/// Navigates a simple absolute path like `/root/items/item[2]/name`.
/// Indexes are 1-based.
fn xml_path_lookup(doc: &Value, path: &str) -> Value {
    let mut current = doc.clone();
    for segment in path.trim_start_matches('/').split('/') {
        if segment.is_empty() {
            continue;
        }
        let (name, index) = match segment.split_once('[') {
            Some((name, rest)) => {
                let index = rest
                    .trim_end_matches(']')
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| i.checked_sub(1));
                (name, index)
            }
            None => (segment, None),
        };
        current = match &current {
            Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if let Some(index) = index {
            current = match &current {
                Value::Array(list) => list.get(index).cloned().unwrap_or(Value::Null),
                other if index == 0 => other.clone(),
                _ => Value::Null,
            };
        }
        if current.is_null() {
            return Value::Null;
        }
    }
    current
}

fn host_wait_for_http(state: &StateRef, url: &str) -> Result<Value> {
    let (count, interval_ms) = {
        let st = state.borrow();
        (st.config.retry.count.max(1), st.config.retry.interval_ms)
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(interval_ms.max(1000)))
        .build()
        .map_err(|e| EngineError::step(format!("waitForHttp client failed: {}", e)))?;
    for attempt in 0..count {
        match client.get(url).send() {
            Ok(response) if response.status().as_u16() < 400 => {
                return Ok(Value::Bool(true));
            }
            _ => {
                if attempt + 1 < count {
                    std::thread::sleep(Duration::from_millis(interval_ms));
                }
            }
        }
    }
    Err(EngineError::step(format!(
        "waitForHttp failed after {} attempts: {}",
        count, url
    )))
}

fn host_wait_for_port(state: &StateRef, host: &str, port: u16) -> Result<Value> {
    let (count, interval_ms) = {
        let st = state.borrow();
        (st.config.retry.count.max(1), st.config.retry.interval_ms)
    };
    for attempt in 0..count {
        let address = format!("{}:{}", host, port);
        let connected = address
            .parse()
            .ok()
            .and_then(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(1)).ok())
            .is_some();
        if connected {
            return Ok(Value::Bool(true));
        }
        if attempt + 1 < count {
            std::thread::sleep(Duration::from_millis(interval_ms));
        }
    }
    Err(EngineError::step(format!(
        "waitForPort failed after {} attempts: {}:{}",
        count, host, port
    )))
}

fn host_stop(port: u16) -> Result<Value> {
    if port == 0 {
        return Err(EngineError::step("stop() requires a port"));
    }
    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|e| EngineError::step(format!("stop({}) bind failed: {}", port, e)))?;
    info!(port = port, "paused, waiting for a connection to resume");
    let _ = listener
        .accept()
        .map_err(|e| EngineError::step(format!("stop({}) accept failed: {}", port, e)))?;
    Ok(Value::Null)
}
