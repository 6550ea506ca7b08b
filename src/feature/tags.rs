// Tag model, selector grammar and lock-tag extraction.

/// A parsed `@name` or `@name=v1,v2` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub raw: String,
    pub name: String,
    pub values: Vec<String>,
}

impl Tag {
    pub fn parse(raw: &str) -> Self {
        let body = raw.trim_start_matches('@');
        let (name, values) = match body.split_once('=') {
            Some((name, values)) => (
                name.to_string(),
                values
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect(),
            ),
            None => (body.to_string(), Vec::new()),
        };
        Self {
            raw: raw.to_string(),
            name,
            values,
        }
    }
}

/// Extracts every tag token from a tag line such as `@smoke @lock=users`.
pub fn parse_tag_line(line: &str) -> Vec<Tag> {
    line.split_whitespace()
        .filter(|token| token.starts_with('@'))
        .map(Tag::parse)
        .collect()
}

pub fn has_tag(tags: &[Tag], name: &str) -> bool {
    tags.iter().any(|t| t.name == name)
}

pub fn tag_values<'a>(tags: &'a [Tag], name: &str) -> Vec<&'a str> {
    tags.iter()
        .filter(|t| t.name == name)
        .flat_map(|t| t.values.iter().map(String::as_str))
        .collect()
}

/// Locking requirement derived from `@lock=` tags. `@lock=*` is strictly
/// dominant; named locks on the same scenario are ignored when present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockSpec {
    Exclusive,
    Named(Vec<String>),
}

pub fn lock_spec(tags: &[Tag]) -> Option<LockSpec> {
    let values = tag_values(tags, "lock");
    if values.is_empty() {
        return None;
    }
    if values.iter().any(|v| *v == "*") {
        return Some(LockSpec::Exclusive);
    }
    let mut names: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    names.sort();
    names.dedup();
    Some(LockSpec::Named(names))
}

/// One clause of a tag selector. `~` negates; `name=value` requires the value
/// to be present among the tag's values.
#[derive(Clone, Debug)]
struct Clause {
    negate: bool,
    name: String,
    value: Option<String>,
}

impl Clause {
    fn matches(&self, tags: &[Tag]) -> bool {
        tags.iter().any(|t| {
            t.name == self.name
                && match &self.value {
                    Some(v) => t.values.iter().any(|tv| tv == v),
                    None => true,
                }
        })
    }
}

/// Comma-separated tag selector: `@smoke,@fast,~@wip`. All negated clauses
/// must hold; if any positive clause exists, at least one must match.
/// Whitespace is not significant.
#[derive(Clone, Debug, Default)]
pub struct TagSelector {
    clauses: Vec<Clause>,
}

impl TagSelector {
    pub fn parse(expr: &str) -> Self {
        let clauses = expr
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| {
                let (negate, body) = match c.strip_prefix('~') {
                    Some(rest) => (true, rest),
                    None => (false, c),
                };
                let body = body.trim_start_matches('@');
                let (name, value) = match body.split_once('=') {
                    Some((n, v)) => (n.to_string(), Some(v.to_string())),
                    None => (body.to_string(), None),
                };
                Clause {
                    negate,
                    name,
                    value,
                }
            })
            .collect();
        Self { clauses }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn evaluate(&self, tags: &[Tag]) -> bool {
        let mut any_positive = false;
        let mut positive_hit = false;
        for clause in &self.clauses {
            if clause.negate {
                if clause.matches(tags) {
                    return false;
                }
            } else {
                any_positive = true;
                if clause.matches(tags) {
                    positive_hit = true;
                }
            }
        }
        !any_positive || positive_hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&str]) -> Vec<Tag> {
        raw.iter().map(|r| Tag::parse(r)).collect()
    }

    #[test]
    fn parses_name_and_values() {
        let tag = Tag::parse("@env=dev,qa");
        assert_eq!(tag.name, "env");
        assert_eq!(tag.values, vec!["dev", "qa"]);
    }

    #[test]
    fn selector_negation_drops_matching_scenario() {
        let selector = TagSelector::parse("~@wip");
        assert!(!selector.evaluate(&tags(&["@smoke", "@wip"])));
        assert!(selector.evaluate(&tags(&["@smoke"])));
    }

    #[test]
    fn selector_positive_clauses_are_a_union() {
        let selector = TagSelector::parse("@smoke,@fast");
        assert!(selector.evaluate(&tags(&["@fast"])));
        assert!(!selector.evaluate(&tags(&["@slow"])));
    }

    #[test]
    fn selector_name_value_requires_value_presence() {
        let selector = TagSelector::parse("@env=dev");
        assert!(selector.evaluate(&tags(&["@env=dev,qa"])));
        assert!(!selector.evaluate(&tags(&["@env=qa"])));
    }

    #[test]
    fn empty_selector_selects_everything() {
        let selector = TagSelector::parse("");
        assert!(selector.evaluate(&tags(&["@anything"])));
        assert!(selector.evaluate(&[]));
    }

    #[test]
    fn star_lock_dominates_named_locks() {
        let spec = lock_spec(&tags(&["@lock=a", "@lock=*"]));
        assert_eq!(spec, Some(LockSpec::Exclusive));
    }

    #[test]
    fn named_locks_are_sorted_and_deduped() {
        let spec = lock_spec(&tags(&["@lock=b", "@lock=a,b"]));
        assert_eq!(
            spec,
            Some(LockSpec::Named(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn no_lock_tags_is_a_fast_none() {
        assert_eq!(lock_spec(&tags(&["@smoke"])), None);
    }
}
