// Module: Script
// Wrapper around the embedded QuickJS engine.
//
// One engine per scenario, used from a single worker thread. Values cross
// the boundary as serde_json; JS functions cross as their source text so
// they survive inheritance into a different engine.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Function, Runtime};
use serde_json::Value;

use crate::errors::{EngineError, Result};

/// A value produced by the engine. `function_source` is set when the result
/// was a JS function; `value` is its JSON projection (null for functions).
#[derive(Clone, Debug)]
pub struct ScriptValue {
    pub value: Value,
    pub function_source: Option<String>,
}

impl ScriptValue {
    pub fn json(value: Value) -> Self {
        Self {
            value,
            function_source: None,
        }
    }

    pub fn is_function(&self) -> bool {
        self.function_source.is_some()
    }
}

/// A variable captured out of an engine, suitable for re-binding elsewhere.
#[derive(Clone, Debug)]
pub enum Binding {
    Json(Value),
    Function(String),
}

pub struct ScriptEngine {
    // dropped last; the context borrows from it
    _runtime: Runtime,
    context: Context,
    // shared with the bridge so host functions can snapshot variables
    var_names: Rc<RefCell<BTreeSet<String>>>,
}

impl ScriptEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| EngineError::Fatal(format!("failed to create script runtime: {}", e)))?;
        let context = Context::full(&runtime)
            .map_err(|e| EngineError::Fatal(format!("failed to create script context: {}", e)))?;
        Ok(Self {
            _runtime: runtime,
            context,
            var_names: Rc::new(RefCell::new(BTreeSet::new())),
        })
    }

    /// Handle to the tracked-variable name set, shared with host functions.
    pub fn names_handle(&self) -> Rc<RefCell<BTreeSet<String>>> {
        self.var_names.clone()
    }

    /// Runs a script and returns its completion value.
    pub fn eval(&self, source: &str) -> Result<ScriptValue> {
        self.context.with(|ctx| {
            match ctx.eval::<rquickjs::Value, _>(source.as_bytes().to_vec()) {
                Ok(v) => Ok(script_value(&ctx, &v)),
                Err(e) => Err(EngineError::step(exception_message(&ctx, e))),
            }
        })
    }

    /// Evaluates a single expression. JSON-style literals (`{...}`, `[...]`)
    /// are wrapped in parentheses so they parse as expressions, not blocks.
    pub fn eval_expression(&self, source: &str) -> Result<ScriptValue> {
        let trimmed = source.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            self.eval(&format!("({})", trimmed))
        } else {
            self.eval(trimmed)
        }
    }

    /// Binds a user variable as a global and records its name.
    pub fn put(&self, name: &str, value: &Value) -> Result<()> {
        self.put_root(name, value)?;
        self.var_names.borrow_mut().insert(name.to_string());
        Ok(())
    }

    /// Binds a global without tracking it as a user variable (e.g. the
    /// bridge object itself).
    pub fn put_root(&self, name: &str, value: &Value) -> Result<()> {
        self.context.with(|ctx| {
            let js = json_to_js(&ctx, value)
                .map_err(|e| EngineError::Fatal(format!("engine bind failed: {}", e)))?;
            ctx.globals()
                .set(name, js)
                .map_err(|e| EngineError::Fatal(format!("engine bind failed: {}", e)))
        })
    }

    /// Re-binds a captured variable, functions included.
    pub fn put_binding(&self, name: &str, binding: &Binding) -> Result<()> {
        match binding {
            Binding::Json(value) => self.put(name, value),
            Binding::Function(source) => {
                self.eval(&format!("globalThis[{:?}] = ({});", name, source))?;
                self.var_names.borrow_mut().insert(name.to_string());
                Ok(())
            }
        }
    }

    /// Marks a name as a user variable without touching its current engine
    /// value (used when a script created the global itself).
    pub fn track(&self, name: &str) {
        self.var_names.borrow_mut().insert(name.to_string());
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.context.with(|ctx| {
            let v: rquickjs::Value = ctx.globals().get(name).ok()?;
            if v.is_undefined() {
                return None;
            }
            Some(js_to_json(&ctx, &v))
        })
    }

    pub fn get_script_value(&self, name: &str) -> Option<ScriptValue> {
        self.context.with(|ctx| {
            let v: rquickjs::Value = ctx.globals().get(name).ok()?;
            if v.is_undefined() {
                return None;
            }
            Some(script_value(&ctx, &v))
        })
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.eval(&format!("delete globalThis[{:?}];", name))?;
        self.var_names.borrow_mut().remove(name);
        Ok(())
    }

    pub fn var_names(&self) -> Vec<String> {
        self.var_names.borrow().iter().cloned().collect()
    }

    /// Snapshots every tracked user variable.
    pub fn bindings(&self) -> Vec<(String, Binding)> {
        let names = self.var_names();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(sv) = self.get_script_value(&name) {
                let binding = match sv.function_source {
                    Some(source) => Binding::Function(source),
                    None => Binding::Json(sv.value),
                };
                out.push((name, binding));
            }
        }
        out
    }

    /// Tracked variables as a plain JSON map (functions excluded).
    pub fn vars_as_map(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for (name, binding) in self.bindings() {
            if let Binding::Json(value) = binding {
                map.insert(name, value);
            }
        }
        map
    }

    /// Evaluates `source` as a function expression and invokes it.
    pub fn invoke_function(&self, source: &str, args: &[Value]) -> Result<ScriptValue> {
        self.context.with(|ctx| {
            let func: Function = ctx
                .eval(format!("({})", source).into_bytes())
                .map_err(|e| EngineError::step(exception_message(&ctx, e)))?;
            let mut js_args = Vec::with_capacity(args.len());
            for arg in args {
                let js = json_to_js(&ctx, arg)
                    .map_err(|e| EngineError::Fatal(format!("argument bind failed: {}", e)))?;
                js_args.push(js);
            }
            match func.call::<_, rquickjs::Value>((Rest(js_args),)) {
                Ok(v) => Ok(script_value(&ctx, &v)),
                Err(e) => Err(EngineError::step(exception_message(&ctx, e))),
            }
        })
    }

    /// Escape hatch for the bridge to install host functions.
    pub fn with_context<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        self.context.with(f)
    }
}

fn script_value<'js>(ctx: &Ctx<'js>, v: &rquickjs::Value<'js>) -> ScriptValue {
    if v.type_of() == rquickjs::Type::Function {
        return ScriptValue {
            value: Value::Null,
            function_source: function_source(ctx, v),
        };
    }
    ScriptValue::json(js_to_json(ctx, v))
}

fn function_source<'js>(ctx: &Ctx<'js>, v: &rquickjs::Value<'js>) -> Option<String> {
    let helper: Function = ctx.eval(b"(f => String(f))".to_vec()).ok()?;
    helper.call::<_, String>((v.clone(),)).ok()
}

pub fn exception_message(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if matches!(err, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        if let Some(obj) = caught.as_object() {
            if let Ok(message) = obj.get::<_, String>("message") {
                if !message.is_empty() {
                    return message;
                }
            }
        }
        if let Some(text) = caught.as_string().and_then(|s| s.to_string().ok()) {
            return text;
        }
        return "script error".to_string();
    }
    err.to_string()
}

pub fn js_to_json<'js>(ctx: &Ctx<'js>, v: &rquickjs::Value<'js>) -> Value {
    use rquickjs::Type;
    match v.type_of() {
        Type::Undefined | Type::Uninitialized | Type::Null => Value::Null,
        Type::Bool => Value::Bool(v.as_bool().unwrap_or(false)),
        Type::Int => Value::from(v.as_int().unwrap_or(0)),
        Type::Float => v
            .as_number()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Type::String => v
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map(Value::String)
            .unwrap_or(Value::Null),
        Type::Array | Type::Object | Type::Exception => match ctx.json_stringify(v.clone()) {
            Ok(Some(text)) => text
                .to_string()
                .ok()
                .and_then(|t| serde_json::from_str(&t).ok())
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

pub fn json_to_js<'js>(ctx: &Ctx<'js>, v: &Value) -> rquickjs::Result<rquickjs::Value<'js>> {
    match v {
        Value::Null => Ok(rquickjs::Value::new_null(ctx.clone())),
        Value::Bool(b) => Ok(rquickjs::Value::new_bool(ctx.clone(), *b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if (i32::MIN as i64..=i32::MAX as i64).contains(&i) {
                    return Ok(rquickjs::Value::new_int(ctx.clone(), i as i32));
                }
            }
            Ok(rquickjs::Value::new_float(
                ctx.clone(),
                n.as_f64().unwrap_or(0.0),
            ))
        }
        Value::String(s) => Ok(rquickjs::String::from_str(ctx.clone(), s)?.into_value()),
        _ => {
            let text = serde_json::to_string(v).unwrap_or_else(|_| "null".to_string());
            ctx.json_parse(text.into_bytes())
        }
    }
}
