// Module: Matching
// Deep JSON matching with fuzzy marker support.
//
// Expected values may embed markers: #ignore, #null, #notnull, #present,
// #notpresent, #array, #object, #boolean, #number, #string, #uuid,
// #regex <pattern>, #[n] (array length). A ## prefix makes a marker optional:
// null or missing actuals pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid uuid regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    ContainsOnly,
    ContainsAny,
    ContainsDeep,
}

/// A parsed match operation, e.g. `each contains only`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchSpec {
    pub each: bool,
    pub op: MatchOp,
}

impl MatchSpec {
    pub fn parse(text: &str) -> Option<MatchSpec> {
        let trimmed = text.trim();
        let (each, rest) = match trimmed.strip_prefix("each ") {
            Some(rest) => (true, rest.trim()),
            None => (false, trimmed),
        };
        let op = match rest {
            "==" => MatchOp::Equals,
            "!=" => MatchOp::NotEquals,
            "contains" => MatchOp::Contains,
            "!contains" => MatchOp::NotContains,
            "contains only" => MatchOp::ContainsOnly,
            "contains any" => MatchOp::ContainsAny,
            "contains deep" => MatchOp::ContainsDeep,
            _ => return None,
        };
        Some(MatchSpec { each, op })
    }
}

#[derive(Clone, Debug)]
pub struct MatchResult {
    pub pass: bool,
    pub message: Option<String>,
}

impl MatchResult {
    fn pass() -> Self {
        Self {
            pass: true,
            message: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            pass: false,
            message: Some(message),
        }
    }
}

struct Failure {
    path: String,
    reason: String,
}

impl Failure {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

type MatchCheck = std::result::Result<(), Failure>;

pub fn execute(
    spec: MatchSpec,
    actual: &Value,
    expected: &Value,
    each_empty_allowed: bool,
) -> MatchResult {
    let outcome = if spec.each {
        match actual {
            Value::Array(items) => {
                if items.is_empty() && !each_empty_allowed {
                    Err(Failure::new("$", "match each with empty list"))
                } else {
                    items.iter().enumerate().try_for_each(|(i, item)| {
                        apply_op(spec.op, item, expected, &format!("$[{}]", i))
                    })
                }
            }
            _ => Err(Failure::new("$", "match each requires a list actual")),
        }
    } else {
        apply_op(spec.op, actual, expected, "$")
    };
    match outcome {
        Ok(()) => MatchResult::pass(),
        Err(failure) => MatchResult::fail(format!(
            "match failed: path {}, reason: {}, actual: {}, expected: {}",
            failure.path,
            failure.reason,
            render(actual),
            render(expected)
        )),
    }
}

fn render(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > 400 {
        format!("{}...", &text[..400])
    } else {
        text
    }
}

fn apply_op(op: MatchOp, actual: &Value, expected: &Value, path: &str) -> MatchCheck {
    match op {
        MatchOp::Equals => equals(actual, expected, path),
        MatchOp::NotEquals => match equals(actual, expected, path) {
            Ok(()) => Err(Failure::new(path, "values are equal")),
            Err(_) => Ok(()),
        },
        MatchOp::Contains => contains(actual, expected, path, false),
        MatchOp::NotContains => match contains(actual, expected, path, false) {
            Ok(()) => Err(Failure::new(path, "actual contains expected")),
            Err(_) => Ok(()),
        },
        MatchOp::ContainsOnly => contains_only(actual, expected, path),
        MatchOp::ContainsAny => contains_any(actual, expected, path),
        MatchOp::ContainsDeep => contains(actual, expected, path, true),
    }
}

enum Marker<'a> {
    Ignore,
    Null,
    NotNull,
    Present,
    NotPresent,
    TypeIs(&'a str),
    Uuid,
    Regex(&'a str),
    ArrayLen(Option<usize>),
    Optional(Box<Marker<'a>>),
}

fn parse_marker(text: &str) -> Option<Marker<'_>> {
    if text.starts_with("##") {
        // `##marker` is the optional form of `#marker`
        return parse_marker(&text[1..]).map(|m| Marker::Optional(Box::new(m)));
    }
    let body = text.strip_prefix('#')?;
    Some(match body {
        "ignore" => Marker::Ignore,
        "null" => Marker::Null,
        "notnull" => Marker::NotNull,
        "present" => Marker::Present,
        "notpresent" => Marker::NotPresent,
        "array" | "object" | "boolean" | "number" | "string" => Marker::TypeIs(body),
        "uuid" => Marker::Uuid,
        _ => {
            if let Some(pattern) = body.strip_prefix("regex ") {
                Marker::Regex(pattern)
            } else if let Some(len) = body.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
                let len = len.trim();
                if len.is_empty() {
                    Marker::ArrayLen(None)
                } else {
                    Marker::ArrayLen(Some(len.parse().ok()?))
                }
            } else {
                return None;
            }
        }
    })
}

fn check_marker(marker: &Marker<'_>, actual: Option<&Value>, path: &str) -> MatchCheck {
    match marker {
        Marker::Optional(inner) => match actual {
            None | Some(Value::Null) => Ok(()),
            Some(_) => check_marker(inner, actual, path),
        },
        Marker::Ignore => Ok(()),
        Marker::NotPresent => match actual {
            None => Ok(()),
            Some(_) => Err(Failure::new(path, "value should not be present")),
        },
        Marker::Present => match actual {
            Some(_) => Ok(()),
            None => Err(Failure::new(path, "value is not present")),
        },
        _ => {
            let actual = match actual {
                Some(v) => v,
                None => return Err(Failure::new(path, "value is not present")),
            };
            match marker {
                Marker::Null => match actual {
                    Value::Null => Ok(()),
                    _ => Err(Failure::new(path, "expected null")),
                },
                Marker::NotNull => match actual {
                    Value::Null => Err(Failure::new(path, "expected not-null")),
                    _ => Ok(()),
                },
                Marker::TypeIs(kind) => {
                    let ok = match *kind {
                        "array" => actual.is_array(),
                        "object" => actual.is_object(),
                        "boolean" => actual.is_boolean(),
                        "number" => actual.is_number(),
                        "string" => actual.is_string(),
                        _ => false,
                    };
                    if ok {
                        Ok(())
                    } else {
                        Err(Failure::new(path, format!("expected type {}", kind)))
                    }
                }
                Marker::Uuid => match actual.as_str() {
                    Some(s) if UUID_RE.is_match(s) => Ok(()),
                    _ => Err(Failure::new(path, "expected a uuid string")),
                },
                Marker::Regex(pattern) => {
                    let re = Regex::new(pattern)
                        .map_err(|e| Failure::new(path, format!("bad regex: {}", e)))?;
                    match actual.as_str() {
                        Some(s) if re.is_match(s) => Ok(()),
                        _ => Err(Failure::new(
                            path,
                            format!("did not match regex '{}'", pattern),
                        )),
                    }
                }
                Marker::ArrayLen(expected_len) => match actual {
                    Value::Array(items) => match expected_len {
                        Some(len) if items.len() != *len => Err(Failure::new(
                            path,
                            format!("expected array length {}, got {}", len, items.len()),
                        )),
                        _ => Ok(()),
                    },
                    _ => Err(Failure::new(path, "expected an array")),
                },
                _ => Ok(()),
            }
        }
    }
}

fn marker_of(expected: &Value) -> Option<Marker<'_>> {
    expected.as_str().and_then(parse_marker)
}

fn equals(actual: &Value, expected: &Value, path: &str) -> MatchCheck {
    if let Some(marker) = marker_of(expected) {
        return check_marker(&marker, Some(actual), path);
    }
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => {
            for (key, expected_value) in e {
                let child_path = format!("{}.{}", path, key);
                match marker_of(expected_value) {
                    Some(marker) => check_marker(&marker, a.get(key), &child_path)?,
                    None => match a.get(key) {
                        Some(actual_value) => equals(actual_value, expected_value, &child_path)?,
                        None => return Err(Failure::new(&child_path, "value is not present")),
                    },
                }
            }
            for key in a.keys() {
                if !e.contains_key(key) {
                    return Err(Failure::new(
                        &format!("{}.{}", path, key),
                        "actual has unexpected key",
                    ));
                }
            }
            Ok(())
        }
        (Value::Array(a), Value::Array(e)) => {
            if a.len() != e.len() {
                return Err(Failure::new(
                    path,
                    format!("array lengths differ, expected {} got {}", e.len(), a.len()),
                ));
            }
            for (i, (actual_item, expected_item)) in a.iter().zip(e.iter()).enumerate() {
                equals(actual_item, expected_item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        (Value::Number(a), Value::Number(e)) => {
            let (a, e) = (a.as_f64(), e.as_f64());
            if a.is_some() && a == e {
                Ok(())
            } else {
                Err(Failure::new(path, "numbers differ"))
            }
        }
        _ => {
            if actual == expected {
                Ok(())
            } else {
                Err(Failure::new(path, "not equal"))
            }
        }
    }
}

fn contains(actual: &Value, expected: &Value, path: &str, deep: bool) -> MatchCheck {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => {
            for (key, expected_value) in e {
                let child_path = format!("{}.{}", path, key);
                match marker_of(expected_value) {
                    Some(marker) => check_marker(&marker, a.get(key), &child_path)?,
                    None => match a.get(key) {
                        Some(actual_value) => {
                            if deep
                                && (expected_value.is_object() || expected_value.is_array())
                            {
                                contains(actual_value, expected_value, &child_path, true)?
                            } else {
                                equals(actual_value, expected_value, &child_path)?
                            }
                        }
                        None => return Err(Failure::new(&child_path, "value is not present")),
                    },
                }
            }
            Ok(())
        }
        (Value::Array(a), Value::Array(e)) => {
            for expected_item in e {
                let found = a.iter().any(|actual_item| {
                    if deep {
                        contains(actual_item, expected_item, path, true).is_ok()
                            || equals(actual_item, expected_item, path).is_ok()
                    } else {
                        equals(actual_item, expected_item, path).is_ok()
                    }
                });
                if !found {
                    return Err(Failure::new(
                        path,
                        format!("list does not contain {}", render(expected_item)),
                    ));
                }
            }
            Ok(())
        }
        // a single expected element against a list actual
        (Value::Array(_), _) => contains(
            actual,
            &Value::Array(vec![expected.clone()]),
            path,
            deep,
        ),
        (Value::String(a), Value::String(e)) => {
            if a.contains(e.as_str()) {
                Ok(())
            } else {
                Err(Failure::new(path, "string does not contain expected"))
            }
        }
        _ => equals(actual, expected, path),
    }
}

fn contains_only(actual: &Value, expected: &Value, path: &str) -> MatchCheck {
    let (a, e) = match (actual, expected) {
        (Value::Array(a), Value::Array(e)) => (a, e),
        _ => return Err(Failure::new(path, "contains only requires two lists")),
    };
    if a.len() != e.len() {
        return Err(Failure::new(
            path,
            format!("list lengths differ, expected {} got {}", e.len(), a.len()),
        ));
    }
    let mut used = vec![false; a.len()];
    for expected_item in e {
        let slot = a.iter().enumerate().find(|(i, actual_item)| {
            !used[*i] && equals(actual_item, expected_item, path).is_ok()
        });
        match slot {
            Some((i, _)) => used[i] = true,
            None => {
                return Err(Failure::new(
                    path,
                    format!("list does not contain {}", render(expected_item)),
                ))
            }
        }
    }
    Ok(())
}

fn contains_any(actual: &Value, expected: &Value, path: &str) -> MatchCheck {
    match (actual, expected) {
        (Value::Array(a), Value::Array(e)) => {
            let found = e
                .iter()
                .any(|item| a.iter().any(|actual_item| equals(actual_item, item, path).is_ok()));
            if found {
                Ok(())
            } else {
                Err(Failure::new(path, "list contains none of the expected"))
            }
        }
        (Value::Object(a), Value::Object(e)) => {
            let found = e.iter().any(|(key, expected_value)| {
                a.get(key)
                    .map(|actual_value| equals(actual_value, expected_value, path).is_ok())
                    .unwrap_or(false)
            });
            if found {
                Ok(())
            } else {
                Err(Failure::new(path, "map contains none of the expected"))
            }
        }
        _ => Err(Failure::new(path, "contains any requires lists or maps")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(op: &str, actual: Value, expected: Value) -> MatchResult {
        let spec = MatchSpec::parse(op).expect("valid op");
        execute(spec, &actual, &expected, false)
    }

    #[test]
    fn equals_is_deep_and_numeric_tolerant() {
        assert!(run("==", json!({ "a": 1, "b": [1, 2] }), json!({ "a": 1.0, "b": [1, 2] })).pass);
        assert!(!run("==", json!({ "a": 1 }), json!({ "a": 2 })).pass);
    }

    #[test]
    fn equals_rejects_unexpected_keys() {
        let result = run("==", json!({ "a": 1, "b": 2 }), json!({ "a": 1 }));
        assert!(!result.pass);
        assert!(result.message.unwrap().contains("unexpected key"));
    }

    #[test]
    fn fuzzy_markers_check_types_and_presence() {
        assert!(run("==", json!({ "id": "x" }), json!({ "id": "#string" })).pass);
        assert!(run("==", json!({ "n": 5 }), json!({ "n": "#number" })).pass);
        assert!(run("==", json!({}), json!({ "gone": "#notpresent" })).pass);
        assert!(!run("==", json!({ "gone": 1 }), json!({ "gone": "#notpresent" })).pass);
        assert!(run("==", json!({ "x": null }), json!({ "x": "##string" })).pass);
        assert!(run("==", json!({}), json!({ "x": "##string" })).pass);
        assert!(!run("==", json!({ "x": 5 }), json!({ "x": "##string" })).pass);
    }

    #[test]
    fn regex_and_uuid_markers() {
        assert!(run("==", json!("AB1234"), json!("#regex ^[A-Z]{2}\\d{4}$")).pass);
        assert!(!run("==", json!("nope"), json!("#regex ^\\d+$")).pass);
        assert!(run(
            "==",
            json!("1fd0d8b4-0db4-4ba5-8a09-a0f0e6786d7a"),
            json!("#uuid")
        )
        .pass);
    }

    #[test]
    fn array_length_marker() {
        assert!(run("==", json!([1, 2, 3]), json!("#[3]")).pass);
        assert!(run("==", json!([1, 2]), json!("#[]")).pass);
        assert!(!run("==", json!([1, 2]), json!("#[3]")).pass);
    }

    #[test]
    fn contains_is_a_subset_check() {
        assert!(run("contains", json!({ "a": 1, "b": 2 }), json!({ "a": 1 })).pass);
        assert!(run("contains", json!([1, 2, 3]), json!([3, 1])).pass);
        assert!(run("contains", json!([1, 2, 3]), json!(2)).pass);
        assert!(!run("contains", json!([1, 2]), json!([4])).pass);
        assert!(run("!contains", json!([1, 2]), json!([4])).pass);
    }

    #[test]
    fn contains_only_ignores_order_but_not_multiplicity() {
        assert!(run("contains only", json!([1, 2, 3]), json!([3, 2, 1])).pass);
        assert!(!run("contains only", json!([1, 2, 2]), json!([1, 1, 2])).pass);
        assert!(!run("contains only", json!([1, 2, 3]), json!([1, 2])).pass);
    }

    #[test]
    fn contains_any_needs_one_hit() {
        assert!(run("contains any", json!([1, 2]), json!([9, 2])).pass);
        assert!(!run("contains any", json!([1, 2]), json!([8, 9])).pass);
        assert!(run("contains any", json!({ "a": 1 }), json!({ "a": 1, "z": 9 })).pass);
    }

    #[test]
    fn contains_deep_descends_into_nests() {
        let actual = json!({ "a": { "b": { "c": 1, "d": 2 }, "list": [{ "x": 1, "y": 2 }] } });
        let expected = json!({ "a": { "b": { "c": 1 }, "list": [{ "x": 1 }] } });
        assert!(run("contains deep", actual.clone(), expected).pass);
        assert!(!run("contains", actual, json!({ "a": { "b": { "c": 1 } } })).pass);
    }

    #[test]
    fn each_applies_to_every_element() {
        assert!(run("each ==", json!([1, 2, 3]), json!("#number")).pass);
        assert!(!run("each ==", json!([1, "x"]), json!("#number")).pass);
    }

    #[test]
    fn each_on_empty_list_is_gated_by_config() {
        let spec = MatchSpec::parse("each ==").unwrap();
        assert!(!execute(spec, &json!([]), &json!("#number"), false).pass);
        assert!(execute(spec, &json!([]), &json!("#number"), true).pass);
    }

    #[test]
    fn string_contains_is_substring() {
        assert!(run("contains", json!("hello world"), json!("world")).pass);
    }

    #[test]
    fn failure_message_names_the_path() {
        let result = run("==", json!({ "a": { "b": 1 } }), json!({ "a": { "b": 2 } }));
        assert!(result.message.unwrap().contains("$.a.b"));
    }
}
