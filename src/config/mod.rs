// Module: Config
// Typed per-scenario configuration with transport-rebuild signaling.
//
// `configure(key, value)` returns whether the HTTP client must be rebuilt
// before the next request. Keys that touch the transport (ssl, proxy,
// timeouts, redirects, local address, charset, retry gating, NTLM auth)
// signal a rebuild; everything else mutates in place.

use serde_json::{Map, Value};

use crate::errors::{EngineError, Result};

/// A configure value as it leaves the script engine: either plain JSON or a
/// JS function carried by source so it survives `copy()` across engines.
#[derive(Clone, Debug)]
pub enum ConfigValue {
    Json(Value),
    Function(String),
}

impl ConfigValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ConfigValue::Json(v) => Some(v),
            ConfigValue::Function(_) => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Function(_) => "function",
            ConfigValue::Json(Value::Null) => "null",
            ConfigValue::Json(Value::Bool(_)) => "boolean",
            ConfigValue::Json(Value::Number(_)) => "number",
            ConfigValue::Json(Value::String(_)) => "string",
            ConfigValue::Json(Value::Array(_)) => "array",
            ConfigValue::Json(Value::Object(_)) => "object",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SslConfig {
    pub trust_all: bool,
    pub algorithm: Option<String>,
    pub key_store: Option<String>,
    pub key_store_password: Option<String>,
    pub trust_store: Option<String>,
    pub trust_store_password: Option<String>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            trust_all: true,
            algorithm: None,
            key_store: None,
            key_store_password: None,
            trust_store: None,
            trust_store_password: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub non_proxy_hosts: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthType {
    Basic,
    Bearer,
    OAuth2,
    Ntlm,
    Other(String),
}

impl AuthType {
    fn parse(raw: &str) -> Self {
        match raw {
            "basic" => AuthType::Basic,
            "bearer" => AuthType::Bearer,
            "oauth2" => AuthType::OAuth2,
            "ntlm" => AuthType::Ntlm,
            other => AuthType::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub auth_type: AuthType,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub domain: Option<String>,
    pub workstation: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub count: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: 3,
            interval_ms: 3000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReportConfig {
    pub show_log: bool,
    pub show_all_steps: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            show_log: true,
            show_all_steps: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallSingleCacheConfig {
    pub minutes: u64,
    pub dir: String,
}

impl Default for CallSingleCacheConfig {
    fn default() -> Self {
        Self {
            minutes: 0,
            dir: "target".to_string(),
        }
    }
}

/// `configure headers` accepts a map applied to every request or a JS
/// function invoked per request.
#[derive(Clone, Debug, Default)]
pub enum HeadersConfig {
    #[default]
    None,
    Map(Map<String, Value>),
    Function(String),
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub url: Option<String>,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub follow_redirects: bool,
    pub local_address: Option<String>,
    pub charset: Option<String>,
    pub ssl: Option<SslConfig>,
    pub proxy: Option<ProxyConfig>,
    pub auth: Option<AuthConfig>,
    pub retry: RetryConfig,
    pub http_retry_enabled: bool,
    pub report: ReportConfig,
    pub call_single_cache: CallSingleCacheConfig,
    pub headers: HeadersConfig,
    pub cookies: Option<Map<String, Value>>,
    pub response_headers: Option<Value>,
    pub cors: bool,
    pub continue_on_step_failure: bool,
    pub aborted_steps_should_pass: bool,
    pub abort_suite_on_failure: bool,
    pub match_each_empty_allowed: bool,
    pub driver: Option<Map<String, Value>>,
    pub after_scenario: Option<String>,
    pub after_scenario_outline: Option<String>,
    pub after_feature: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            read_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            follow_redirects: true,
            local_address: None,
            charset: Some("utf-8".to_string()),
            ssl: None,
            proxy: None,
            auth: None,
            retry: RetryConfig::default(),
            http_retry_enabled: false,
            report: ReportConfig::default(),
            call_single_cache: CallSingleCacheConfig::default(),
            headers: HeadersConfig::None,
            cookies: None,
            response_headers: None,
            cors: false,
            continue_on_step_failure: false,
            aborted_steps_should_pass: true,
            abort_suite_on_failure: false,
            match_each_empty_allowed: false,
            driver: None,
            after_scenario: None,
            after_scenario_outline: None,
            after_feature: None,
        }
    }
}

fn mismatch(key: &str, message: impl Into<String>) -> EngineError {
    EngineError::ConfigTypeMismatch {
        key: key.to_string(),
        message: message.into(),
    }
}

fn expect_bool(key: &str, value: &ConfigValue) -> Result<bool> {
    match value.as_json() {
        Some(Value::Bool(b)) => Ok(*b),
        _ => Err(mismatch(
            key,
            format!("expected boolean, got {}", value.type_name()),
        )),
    }
}

fn expect_u64(key: &str, value: &ConfigValue) -> Result<u64> {
    match value.as_json() {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f as u64))
            .ok_or_else(|| mismatch(key, "expected a non-negative number")),
        _ => Err(mismatch(
            key,
            format!("expected number, got {}", value.type_name()),
        )),
    }
}

fn expect_string(key: &str, value: &ConfigValue) -> Result<String> {
    match value.as_json() {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(mismatch(
            key,
            format!("expected string, got {}", value.type_name()),
        )),
    }
}

fn get_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

impl RuntimeConfig {
    /// Applies one configure key. Returns whether the HTTP transport must be
    /// rebuilt before the next request.
    pub fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<bool> {
        match key {
            "url" => {
                self.url = Some(expect_string(key, value)?);
                Ok(false)
            }
            "readTimeout" => {
                self.read_timeout_ms = expect_u64(key, value)?;
                Ok(true)
            }
            "connectTimeout" => {
                self.connect_timeout_ms = expect_u64(key, value)?;
                Ok(true)
            }
            "followRedirects" => {
                self.follow_redirects = expect_bool(key, value)?;
                Ok(true)
            }
            "localAddress" => {
                self.local_address = Some(expect_string(key, value)?);
                Ok(true)
            }
            "charset" => {
                // null disables auto-charset instead of failing
                match value.as_json() {
                    Some(Value::Null) => self.charset = None,
                    _ => self.charset = Some(expect_string(key, value)?),
                }
                Ok(true)
            }
            "ssl" => {
                self.ssl = parse_ssl(key, value)?;
                Ok(true)
            }
            "proxy" => {
                self.proxy = parse_proxy(key, value)?;
                Ok(true)
            }
            "auth" => {
                self.auth = parse_auth(key, value)?;
                Ok(matches!(
                    self.auth.as_ref().map(|a| &a.auth_type),
                    Some(AuthType::Ntlm)
                ))
            }
            "ntlmAuth" => {
                // legacy form of auth with type ntlm
                let mut auth = parse_auth_fields(key, value)?;
                auth.auth_type = AuthType::Ntlm;
                self.auth = Some(auth);
                Ok(true)
            }
            "headers" => {
                self.headers = match value {
                    ConfigValue::Function(src) => HeadersConfig::Function(src.clone()),
                    ConfigValue::Json(Value::Object(map)) => HeadersConfig::Map(map.clone()),
                    ConfigValue::Json(Value::Null) => HeadersConfig::None,
                    other => {
                        return Err(mismatch(
                            key,
                            format!("expected map or function, got {}", other.type_name()),
                        ))
                    }
                };
                Ok(false)
            }
            "cookies" => {
                self.cookies = match value.as_json() {
                    Some(Value::Object(map)) => Some(map.clone()),
                    Some(Value::Null) => None,
                    _ => {
                        return Err(mismatch(
                            key,
                            format!("expected map, got {}", value.type_name()),
                        ))
                    }
                };
                Ok(false)
            }
            "retry" => {
                let map = match value.as_json() {
                    Some(Value::Object(map)) => map,
                    _ => {
                        return Err(mismatch(
                            key,
                            format!("expected map, got {}", value.type_name()),
                        ))
                    }
                };
                if let Some(count) = map.get("count").and_then(Value::as_u64) {
                    self.retry.count = count as u32;
                }
                if let Some(interval) = map.get("interval").and_then(Value::as_u64) {
                    self.retry.interval_ms = interval;
                }
                Ok(false)
            }
            "httpRetryEnabled" => {
                self.http_retry_enabled = expect_bool(key, value)?;
                Ok(true)
            }
            "report" => {
                match value.as_json() {
                    Some(Value::Bool(b)) => {
                        self.report.show_log = *b;
                        self.report.show_all_steps = *b;
                    }
                    Some(Value::Object(map)) => {
                        if let Some(show_log) = map.get("showLog").and_then(Value::as_bool) {
                            self.report.show_log = show_log;
                        }
                        if let Some(show_all) = map.get("showAllSteps").and_then(Value::as_bool) {
                            self.report.show_all_steps = show_all;
                        }
                    }
                    _ => {
                        return Err(mismatch(
                            key,
                            format!("expected boolean or map, got {}", value.type_name()),
                        ))
                    }
                }
                Ok(false)
            }
            "callSingleCache" => {
                let map = match value.as_json() {
                    Some(Value::Object(map)) => map,
                    _ => {
                        return Err(mismatch(
                            key,
                            format!("expected map, got {}", value.type_name()),
                        ))
                    }
                };
                if let Some(minutes) = map.get("minutes").and_then(Value::as_u64) {
                    self.call_single_cache.minutes = minutes;
                }
                if let Some(dir) = get_str(map, "dir") {
                    self.call_single_cache.dir = dir;
                }
                Ok(false)
            }
            "continueOnStepFailure" => {
                self.continue_on_step_failure = expect_bool(key, value)?;
                Ok(false)
            }
            "abortedStepsShouldPass" => {
                self.aborted_steps_should_pass = expect_bool(key, value)?;
                Ok(false)
            }
            "abortSuiteOnFailure" => {
                self.abort_suite_on_failure = expect_bool(key, value)?;
                Ok(false)
            }
            "matchEachEmptyAllowed" => {
                self.match_each_empty_allowed = expect_bool(key, value)?;
                Ok(false)
            }
            "cors" => {
                self.cors = expect_bool(key, value)?;
                Ok(false)
            }
            "responseHeaders" => {
                self.response_headers = value.as_json().cloned();
                Ok(false)
            }
            "afterScenario" => {
                self.after_scenario = function_source(key, value)?;
                Ok(false)
            }
            "afterScenarioOutline" => {
                self.after_scenario_outline = function_source(key, value)?;
                Ok(false)
            }
            "afterFeature" => {
                self.after_feature = function_source(key, value)?;
                Ok(false)
            }
            "driver" => {
                self.driver = match value.as_json() {
                    Some(Value::Object(map)) => Some(map.clone()),
                    Some(Value::Null) => None,
                    _ => {
                        return Err(mismatch(
                            key,
                            format!("expected map, got {}", value.type_name()),
                        ))
                    }
                };
                Ok(false)
            }
            unknown => Err(EngineError::ConfigUnknownKey(unknown.to_string())),
        }
    }

    /// Deep copy; every collection is owned, so a clone is a deep copy.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn copy_from(&mut self, other: &Self) {
        *self = other.clone();
    }
}

fn function_source(key: &str, value: &ConfigValue) -> Result<Option<String>> {
    match value {
        ConfigValue::Function(src) => Ok(Some(src.clone())),
        ConfigValue::Json(Value::Null) => Ok(None),
        other => Err(mismatch(
            key,
            format!("expected function, got {}", other.type_name()),
        )),
    }
}

fn parse_ssl(key: &str, value: &ConfigValue) -> Result<Option<SslConfig>> {
    match value.as_json() {
        Some(Value::Bool(true)) => Ok(Some(SslConfig::default())),
        Some(Value::Bool(false)) | Some(Value::Null) => Ok(None),
        Some(Value::String(algorithm)) => Ok(Some(SslConfig {
            algorithm: Some(algorithm.clone()),
            ..SslConfig::default()
        })),
        Some(Value::Object(map)) => Ok(Some(SslConfig {
            trust_all: map
                .get("trustAll")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            algorithm: get_str(map, "algorithm"),
            key_store: get_str(map, "keyStore"),
            key_store_password: get_str(map, "keyStorePassword"),
            trust_store: get_str(map, "trustStore"),
            trust_store_password: get_str(map, "trustStorePassword"),
        })),
        _ => Err(mismatch(
            key,
            format!(
                "expected boolean, string or map, got {}",
                value.type_name()
            ),
        )),
    }
}

fn parse_proxy(key: &str, value: &ConfigValue) -> Result<Option<ProxyConfig>> {
    match value.as_json() {
        Some(Value::Null) => Ok(None),
        Some(Value::String(uri)) => Ok(Some(ProxyConfig {
            uri: uri.clone(),
            ..ProxyConfig::default()
        })),
        Some(Value::Object(map)) => {
            let uri = get_str(map, "uri")
                .ok_or_else(|| mismatch(key, "proxy map requires a 'uri'"))?;
            let non_proxy_hosts = map
                .get("nonProxyHosts")
                .and_then(Value::as_array)
                .map(|hosts| {
                    hosts
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(ProxyConfig {
                uri,
                username: get_str(map, "username"),
                password: get_str(map, "password"),
                non_proxy_hosts,
            }))
        }
        _ => Err(mismatch(
            key,
            format!("expected string or map, got {}", value.type_name()),
        )),
    }
}

fn parse_auth(key: &str, value: &ConfigValue) -> Result<Option<AuthConfig>> {
    match value.as_json() {
        Some(Value::Null) => Ok(None),
        Some(Value::Object(_)) => Ok(Some(parse_auth_fields(key, value)?)),
        _ => Err(mismatch(
            key,
            format!("expected map, got {}", value.type_name()),
        )),
    }
}

fn parse_auth_fields(key: &str, value: &ConfigValue) -> Result<AuthConfig> {
    let map = match value.as_json() {
        Some(Value::Object(map)) => map,
        _ => {
            return Err(mismatch(
                key,
                format!("expected map, got {}", value.type_name()),
            ))
        }
    };
    let auth_type = get_str(map, "type")
        .map(|t| AuthType::parse(&t))
        .unwrap_or(AuthType::Basic);
    let known = !matches!(auth_type, AuthType::Other(_));
    Ok(AuthConfig {
        // unknown types retain only the type
        username: known.then(|| get_str(map, "username")).flatten(),
        password: known.then(|| get_str(map, "password")).flatten(),
        token: known.then(|| get_str(map, "token")).flatten(),
        domain: known.then(|| get_str(map, "domain")).flatten(),
        workstation: known.then(|| get_str(map, "workstation")).flatten(),
        auth_type,
    })
}
