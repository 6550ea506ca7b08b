// Module: Http
// Request building, config-driven client construction and response capture
// on top of the blocking reqwest client.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use serde_json::{Map, Value};

use crate::config::{AuthType, RuntimeConfig};
use crate::errors::{EngineError, Result};
use crate::results::now_millis;

/// Accumulates the pieces of the next request: `url`, `path`, `param`,
/// `header`, `cookie`, `form field`, `request`. Cleared after each send;
/// the url sticks for the scenario.
#[derive(Clone, Debug, Default)]
pub struct HttpRequestBuilder {
    pub url: Option<String>,
    pub paths: Vec<String>,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub form_fields: Vec<(String, String)>,
    pub body: Option<Value>,
    pub body_text: Option<String>,
    pub retry_until: Option<String>,
}

impl HttpRequestBuilder {
    /// Clears everything request-scoped; the base url survives.
    pub fn clear_transients(&mut self) {
        self.paths.clear();
        self.params.clear();
        self.headers.clear();
        self.cookies.clear();
        self.form_fields.clear();
        self.body = None;
        self.body_text = None;
        self.retry_until = None;
    }
}

#[derive(Clone, Debug)]
pub enum RequestBody {
    Json(Value),
    Text(String),
    Form(Vec<(String, String)>),
}

#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl PreparedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Snapshot published to scripts as `karate.prevRequest`.
    pub fn as_value(&self) -> Value {
        let mut headers = Map::new();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), Value::String(value.clone()));
        }
        let body = match &self.body {
            Some(RequestBody::Json(v)) => v.clone(),
            Some(RequestBody::Text(t)) => Value::String(t.clone()),
            Some(RequestBody::Form(fields)) => {
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), Value::String(v.clone()));
                }
                Value::Object(map)
            }
            None => Value::Null,
        };
        serde_json::json!({
            "method": self.method,
            "url": self.url,
            "headers": headers,
            "body": body,
        })
    }
}

/// Builds the final request from the accumulated builder state, the active
/// config and the cookie jar. `config_headers` is the already-evaluated
/// `configure headers` contribution (maps come straight from config, header
/// functions are invoked by the caller who owns the engine).
pub fn prepare(
    builder: &HttpRequestBuilder,
    config: &RuntimeConfig,
    jar: &CookieJar,
    config_headers: Option<&Map<String, Value>>,
    method: &str,
) -> Result<PreparedRequest> {
    let base = builder
        .url
        .clone()
        .or_else(|| config.url.clone())
        .ok_or_else(|| EngineError::step("no url set, use the 'url' keyword or configure one"))?;

    let mut url = base.trim_end_matches('/').to_string();
    for segment in &builder.paths {
        url.push('/');
        url.push_str(&urlencoding::encode(segment.trim_matches('/')).replace("%2F", "/"));
    }
    if !builder.params.is_empty() {
        let query: Vec<String> = builder
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        url.push('?');
        url.push_str(&query.join("&"));
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(map) = config_headers {
        for (name, value) in map {
            if let Some(text) = header_text(value) {
                headers.push((name.clone(), text));
            }
        }
    }
    for (name, value) in &builder.headers {
        upsert_header(&mut headers, name, value.clone());
    }

    if let Some(auth) = &config.auth {
        match auth.auth_type {
            AuthType::Basic => {
                let user = auth.username.as_deref().unwrap_or_default();
                let pass = auth.password.as_deref().unwrap_or_default();
                let token = BASE64.encode(format!("{}:{}", user, pass));
                upsert_header(&mut headers, "Authorization", format!("Basic {}", token));
            }
            AuthType::Bearer | AuthType::OAuth2 => {
                if let Some(token) = &auth.token {
                    upsert_header(&mut headers, "Authorization", format!("Bearer {}", token));
                }
            }
            // the NTLM handshake belongs to a custom transport
            AuthType::Ntlm | AuthType::Other(_) => {}
        }
    }

    let mut cookie_pairs: Vec<(String, String)> = jar.pairs();
    if let Some(config_cookies) = &config.cookies {
        for (name, value) in config_cookies {
            if let Some(text) = header_text(value) {
                cookie_pairs.push((name.clone(), text));
            }
        }
    }
    cookie_pairs.extend(builder.cookies.iter().cloned());
    if !cookie_pairs.is_empty() {
        let cookie_header = cookie_pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        upsert_header(&mut headers, "Cookie", cookie_header);
    }

    let body = if !builder.form_fields.is_empty() {
        Some(RequestBody::Form(builder.form_fields.clone()))
    } else if let Some(text) = &builder.body_text {
        Some(RequestBody::Text(text.clone()))
    } else {
        builder.body.clone().map(RequestBody::Json)
    };

    match &body {
        Some(RequestBody::Json(_)) => {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                let content_type = match &config.charset {
                    Some(charset) => format!("application/json; charset={}", charset),
                    None => "application/json".to_string(),
                };
                headers.push(("Content-Type".to_string(), content_type));
            }
        }
        Some(RequestBody::Text(_)) => {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "text/plain".to_string()));
            }
        }
        _ => {}
    }

    Ok(PreparedRequest {
        method: method.to_uppercase(),
        url,
        headers,
        body,
    })
}

fn header_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn upsert_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(slot) => slot.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

/// Builds a blocking client from the transport bucket of the config. Called
/// once up front and again whenever a configure key signals a rebuild.
pub fn build_client(config: &RuntimeConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_millis(config.read_timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    builder = if config.follow_redirects {
        builder.redirect(Policy::limited(10))
    } else {
        builder.redirect(Policy::none())
    };
    if let Some(ssl) = &config.ssl {
        if ssl.trust_all {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }
    if let Some(proxy_config) = &config.proxy {
        let mut proxy = reqwest::Proxy::all(&proxy_config.uri)
            .map_err(|e| EngineError::step(format!("invalid proxy uri: {}", e)))?;
        if let (Some(user), Some(pass)) = (&proxy_config.username, &proxy_config.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        if !proxy_config.non_proxy_hosts.is_empty() {
            proxy = proxy.no_proxy(reqwest::NoProxy::from_string(
                &proxy_config.non_proxy_hosts.join(","),
            ));
        }
        builder = builder.proxy(proxy);
    }
    if let Some(address) = &config.local_address {
        let ip: std::net::IpAddr = address
            .parse()
            .map_err(|_| EngineError::step(format!("invalid local address '{}'", address)))?;
        builder = builder.local_address(ip);
    }
    builder
        .build()
        .map_err(|e| EngineError::step(format!("failed to build http client: {}", e)))
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub start_millis: i64,
    pub duration_nanos: u64,
}

impl HttpResponse {
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// The response body as a value: JSON when it parses, a string otherwise.
    pub fn body_value(&self) -> Value {
        let text = self.body_string();
        let trimmed = text.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(v) = serde_json::from_str(trimmed) {
                return v;
            }
        }
        Value::String(text)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Headers as a map of name to list-of-values.
    pub fn header_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (name, value) in &self.headers {
            match map.get_mut(name) {
                Some(Value::Array(list)) => list.push(Value::String(value.clone())),
                _ => {
                    map.insert(
                        name.clone(),
                        Value::Array(vec![Value::String(value.clone())]),
                    );
                }
            }
        }
        map
    }

    /// Parsed `Set-Cookie` headers: name plus attribute map.
    pub fn set_cookies(&self) -> Vec<(String, Map<String, Value>)> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, raw)| parse_set_cookie(raw))
            .collect()
    }
}

fn parse_set_cookie(raw: &str) -> Option<(String, Map<String, Value>)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let mut cookie = Map::new();
    cookie.insert("name".to_string(), Value::String(name.trim().to_string()));
    cookie.insert("value".to_string(), Value::String(value.trim().to_string()));
    for attr in parts {
        let attr = attr.trim();
        match attr.split_once('=') {
            Some((k, v)) => {
                cookie.insert(k.trim().to_lowercase(), Value::String(v.trim().to_string()));
            }
            None => {
                cookie.insert(attr.to_lowercase(), Value::Bool(true));
            }
        }
    }
    Some((name.trim().to_string(), cookie))
}

/// Per-scenario cookie jar, merged from responses and `configure cookies`.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    cookies: Map<String, Value>,
}

impl CookieJar {
    pub fn merge_response(&mut self, response: &HttpResponse) {
        for (name, cookie) in response.set_cookies() {
            self.cookies.insert(name, Value::Object(cookie));
        }
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        self.cookies
            .iter()
            .filter_map(|(name, cookie)| {
                let value = match cookie {
                    Value::Object(map) => map.get("value").and_then(Value::as_str)?.to_string(),
                    Value::String(s) => s.clone(),
                    _ => return None,
                };
                Some((name.clone(), value))
            })
            .collect()
    }

    /// The `responseCookies` projection.
    pub fn as_map(&self) -> Map<String, Value> {
        self.cookies.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Sends one prepared request, measuring wall time.
pub fn send(client: &Client, request: &PreparedRequest) -> Result<HttpResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| EngineError::step(format!("invalid http method '{}'", request.method)))?;
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    builder = match &request.body {
        Some(RequestBody::Json(v)) => builder.body(serde_json::to_string(v).unwrap_or_default()),
        Some(RequestBody::Text(t)) => builder.body(t.clone()),
        Some(RequestBody::Form(fields)) => builder.form(fields),
        None => builder,
    };

    let start_millis = now_millis();
    let started = Instant::now();
    let response = builder.send().map_err(|e| {
        EngineError::step(format!("http call failed: {} {}: {}", request.method, request.url, e))
    })?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .map_err(|e| EngineError::step(format!("failed to read response body: {}", e)))?
        .to_vec();
    let duration_nanos = started.elapsed().as_nanos() as u64;

    Ok(HttpResponse {
        status,
        headers,
        body,
        start_millis,
        duration_nanos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jar() -> CookieJar {
        CookieJar::default()
    }

    #[test]
    fn prepare_joins_url_paths_and_params() {
        let mut builder = HttpRequestBuilder {
            url: Some("http://localhost:8080/".into()),
            ..Default::default()
        };
        builder.paths.push("users".into());
        builder.paths.push("1".into());
        builder.params.push(("q".into(), "a b".into()));
        let request = prepare(&builder, &RuntimeConfig::default(), &jar(), None, "get").unwrap();
        assert_eq!(request.url, "http://localhost:8080/users/1?q=a%20b");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn prepare_falls_back_to_config_url() {
        let mut config = RuntimeConfig::default();
        config.url = Some("http://example.com".into());
        let request =
            prepare(&HttpRequestBuilder::default(), &config, &jar(), None, "get").unwrap();
        assert_eq!(request.url, "http://example.com");
    }

    #[test]
    fn prepare_without_any_url_fails() {
        let err = prepare(
            &HttpRequestBuilder::default(),
            &RuntimeConfig::default(),
            &jar(),
            None,
            "get",
        )
        .unwrap_err();
        assert!(err.to_string().contains("no url"));
    }

    #[test]
    fn builder_headers_override_config_headers() {
        let mut builder = HttpRequestBuilder {
            url: Some("http://x".into()),
            ..Default::default()
        };
        builder
            .headers
            .push(("X-Token".into(), "step-level".into()));
        let mut config_headers = Map::new();
        config_headers.insert("X-Token".into(), json!("config-level"));
        config_headers.insert("X-Extra".into(), json!("kept"));
        let request = prepare(
            &builder,
            &RuntimeConfig::default(),
            &jar(),
            Some(&config_headers),
            "get",
        )
        .unwrap();
        assert_eq!(request.header("X-Token"), Some("step-level"));
        assert_eq!(request.header("X-Extra"), Some("kept"));
    }

    #[test]
    fn basic_auth_header_is_derived_from_config() {
        use crate::config::ConfigValue;
        let mut config = RuntimeConfig::default();
        config
            .configure(
                "auth",
                &ConfigValue::Json(json!({ "type": "basic", "username": "u", "password": "p" })),
            )
            .unwrap();
        let builder = HttpRequestBuilder {
            url: Some("http://x".into()),
            ..Default::default()
        };
        let request = prepare(&builder, &config, &jar(), None, "get").unwrap();
        assert_eq!(request.header("Authorization"), Some("Basic dTpw"));
    }

    #[test]
    fn json_body_gets_content_type_with_charset() {
        let builder = HttpRequestBuilder {
            url: Some("http://x".into()),
            body: Some(json!({ "a": 1 })),
            ..Default::default()
        };
        let request = prepare(&builder, &RuntimeConfig::default(), &jar(), None, "post").unwrap();
        assert_eq!(
            request.header("Content-Type"),
            Some("application/json; charset=utf-8")
        );
    }

    #[test]
    fn cleared_charset_drops_the_charset_suffix() {
        use crate::config::ConfigValue;
        let mut config = RuntimeConfig::default();
        config
            .configure("charset", &ConfigValue::Json(Value::Null))
            .unwrap();
        let builder = HttpRequestBuilder {
            url: Some("http://x".into()),
            body: Some(json!({})),
            ..Default::default()
        };
        let request = prepare(&builder, &config, &jar(), None, "post").unwrap();
        assert_eq!(request.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn set_cookie_headers_land_in_the_jar() {
        let response = HttpResponse {
            status: 200,
            headers: vec![
                (
                    "set-cookie".into(),
                    "session=abc123; Path=/; HttpOnly".into(),
                ),
                ("set-cookie".into(), "theme=dark".into()),
            ],
            body: Vec::new(),
            start_millis: 0,
            duration_nanos: 0,
        };
        let mut jar = CookieJar::default();
        jar.merge_response(&response);
        let pairs = jar.pairs();
        assert!(pairs.contains(&("session".into(), "abc123".into())));
        assert!(pairs.contains(&("theme".into(), "dark".into())));
        let session = jar.as_map()["session"].as_object().unwrap().clone();
        assert_eq!(session["httponly"], json!(true));
        assert_eq!(session["path"], json!("/"));
    }

    #[test]
    fn cookie_jar_flows_into_the_request_header() {
        let mut jar = CookieJar::default();
        jar.merge_response(&HttpResponse {
            status: 200,
            headers: vec![("set-cookie".into(), "sid=1".into())],
            body: Vec::new(),
            start_millis: 0,
            duration_nanos: 0,
        });
        let builder = HttpRequestBuilder {
            url: Some("http://x".into()),
            ..Default::default()
        };
        let request = prepare(&builder, &RuntimeConfig::default(), &jar, None, "get").unwrap();
        assert_eq!(request.header("Cookie"), Some("sid=1"));
    }

    #[test]
    fn body_value_detects_json() {
        let response = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: br#"{ "ok": true }"#.to_vec(),
            start_millis: 0,
            duration_nanos: 0,
        };
        assert_eq!(response.body_value(), json!({ "ok": true }));

        let text = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: b"plain text".to_vec(),
            start_millis: 0,
            duration_nanos: 0,
        };
        assert_eq!(text.body_value(), json!("plain text"));
    }

    #[test]
    fn trust_all_client_builds() {
        use crate::config::ConfigValue;
        let mut config = RuntimeConfig::default();
        config.configure("ssl", &ConfigValue::Json(json!(true))).unwrap();
        assert!(build_client(&config).is_ok());
    }
}
