// FeatureRuntime: scenario iteration with lazy outline expansion, tag-based
// selection and the feature-scoped caches.

use std::sync::Arc;

use crate::cache::CallCache;
use crate::feature::tags::TagSelector;
use crate::feature::{Feature, Scenario, Section};
use crate::runtime::suite::Suite;

/// The callonce and setuponce caches, scoped to one feature file for the
/// lifetime of the suite.
#[derive(Default)]
pub struct FeatureCaches {
    pub callonce: CallCache,
    pub setuponce: CallCache,
}

/// How scenarios of a feature are selected for one iteration pass.
#[derive(Clone, Debug, Default)]
pub struct ScenarioSelector {
    /// Tag selector from a `path.feature@tag` call target.
    pub call_tag: Option<String>,
    /// Line filters from a `path.feature:10` target.
    pub lines: Vec<usize>,
    /// When true, the suite's tag selector applies (top-level iteration).
    pub use_suite_selector: bool,
}

pub struct FeatureRuntime {
    pub suite: Arc<Suite>,
    pub feature: Arc<Feature>,
    pub caches: Arc<FeatureCaches>,
    pub selector: ScenarioSelector,
}

impl FeatureRuntime {
    /// Top-level runtime: suite tag selection applies.
    pub fn new(suite: Arc<Suite>, feature: Arc<Feature>) -> Self {
        let caches = suite.caches_for(&feature.relative_path);
        Self {
            suite,
            feature,
            caches,
            selector: ScenarioSelector {
                use_suite_selector: true,
                ..Default::default()
            },
        }
    }

    /// Runtime for a nested call; selection comes from the call target, and
    /// `@setup` scenarios become callable when addressed by tag.
    pub fn for_call(
        suite: Arc<Suite>,
        feature: Arc<Feature>,
        call_tag: Option<String>,
        lines: Vec<usize>,
    ) -> Self {
        let caches = suite.caches_for(&feature.relative_path);
        Self {
            suite,
            feature,
            caches,
            selector: ScenarioSelector {
                call_tag,
                lines,
                use_suite_selector: false,
            },
        }
    }

    pub fn scenarios(&self) -> ScenarioIter<'_> {
        ScenarioIter {
            runtime: self,
            section_index: 0,
            table_index: 0,
            row_index: 0,
            example_counter: 0,
        }
    }

    fn should_select(&self, scenario: &Scenario) -> bool {
        if scenario.is_ignored() {
            return false;
        }
        if !self.selector.lines.is_empty() {
            let hit = self.selector.lines.iter().any(|line| {
                *line == scenario.line || scenario.steps.iter().any(|s| s.line == *line)
            });
            if !hit {
                return false;
            }
        }
        if let Some(call_tag) = &self.selector.call_tag {
            return TagSelector::parse(call_tag).evaluate(&scenario.tags);
        }
        // setup scenarios never run in the normal flow
        if scenario.is_setup() {
            return false;
        }
        if self.selector.use_suite_selector {
            return self.suite.tag_selector.evaluate(&scenario.tags);
        }
        true
    }
}

/// Lazy scenario iterator. State: (section, table, row). Plain sections emit
/// once; outlines emit one scenario per examples row, tables in order, with a
/// running example index per section.
pub struct ScenarioIter<'a> {
    runtime: &'a FeatureRuntime,
    section_index: usize,
    table_index: usize,
    row_index: usize,
    example_counter: usize,
}

impl Iterator for ScenarioIter<'_> {
    type Item = Scenario;

    fn next(&mut self) -> Option<Scenario> {
        let feature = &self.runtime.feature;
        loop {
            let section = feature.sections.get(self.section_index)?;
            match section {
                Section::Scenario(def) => {
                    let scenario = def.build(feature, self.section_index);
                    self.section_index += 1;
                    self.table_index = 0;
                    self.row_index = 0;
                    self.example_counter = 0;
                    if self.runtime.should_select(&scenario) {
                        return Some(scenario);
                    }
                }
                Section::Outline(outline) => {
                    let table = match outline.examples.get(self.table_index) {
                        Some(table) => table,
                        None => {
                            self.section_index += 1;
                            self.table_index = 0;
                            self.row_index = 0;
                            self.example_counter = 0;
                            continue;
                        }
                    };
                    if self.row_index >= table.rows.len() {
                        self.table_index += 1;
                        self.row_index = 0;
                        continue;
                    }
                    let scenario = outline.build_row(
                        feature,
                        self.section_index,
                        self.example_counter,
                        table,
                        self.row_index,
                    );
                    self.row_index += 1;
                    self.example_counter += 1;
                    if self.runtime.should_select(&scenario) {
                        return Some(scenario);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::suite::{Suite, SuiteOptions};
    use std::path::Path;

    fn suite_with_selector(selector: &str) -> Arc<Suite> {
        let options = SuiteOptions {
            tag_selector: if selector.is_empty() {
                None
            } else {
                Some(selector.to_string())
            },
            ..SuiteOptions::default()
        };
        Arc::new(Suite::empty(options))
    }

    fn feature(text: &str) -> Arc<Feature> {
        Arc::new(Feature::parse(text, Path::new("iter.feature")).unwrap())
    }

    const OUTLINE_FEATURE: &str = r#"
Feature: outline expansion

Scenario: plain
* def x = 1

Scenario Outline: row <n>
* def n = <n>

Examples:
| n |
| 1 |
| 2 |

Examples:
| n |
| 3 |
"#;

    #[test]
    fn outline_emits_one_scenario_per_row_across_tables() {
        let runtime = FeatureRuntime::new(suite_with_selector(""), feature(OUTLINE_FEATURE));
        let scenarios: Vec<Scenario> = runtime.scenarios().collect();
        assert_eq!(scenarios.len(), 4);
        assert_eq!(scenarios[0].example_index, None);
        let indexes: Vec<Option<usize>> =
            scenarios[1..].iter().map(|s| s.example_index).collect();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(scenarios[3].example_data["n"], serde_json::json!("3"));
        assert_eq!(scenarios[3].name, "row 3");
    }

    #[test]
    fn emission_order_is_deterministic() {
        let runtime = FeatureRuntime::new(suite_with_selector(""), feature(OUTLINE_FEATURE));
        let first: Vec<String> = runtime.scenarios().map(|s| s.ref_id()).collect();
        let second: Vec<String> = runtime.scenarios().map(|s| s.ref_id()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["[1]", "[2.1]", "[2.2]", "[2.3]"]);
    }

    #[test]
    fn ignore_tag_always_drops() {
        let runtime = FeatureRuntime::new(
            suite_with_selector(""),
            feature("Feature: f\n@ignore\nScenario: skipped\n* def x = 1\nScenario: kept\n* def y = 1\n"),
        );
        let names: Vec<String> = runtime.scenarios().map(|s| s.name).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[test]
    fn suite_tag_selector_filters() {
        let runtime = FeatureRuntime::new(
            suite_with_selector("@smoke"),
            feature("Feature: f\n@smoke\nScenario: a\n* def x = 1\nScenario: b\n* def y = 1\n"),
        );
        let names: Vec<String> = runtime.scenarios().map(|s| s.name).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn setup_scenarios_are_skipped_unless_called_by_tag() {
        let text = "Feature: f\n@setup\nScenario: init\n* def x = 1\nScenario: real\n* def y = 1\n";
        let runtime = FeatureRuntime::new(suite_with_selector(""), feature(text));
        let names: Vec<String> = runtime.scenarios().map(|s| s.name).collect();
        assert_eq!(names, vec!["real"]);

        let called = FeatureRuntime::for_call(
            suite_with_selector(""),
            feature(text),
            Some("setup".to_string()),
            Vec::new(),
        );
        let names: Vec<String> = called.scenarios().map(|s| s.name).collect();
        assert_eq!(names, vec!["init"]);
    }

    #[test]
    fn line_filter_selects_by_scenario_or_step_line() {
        let text = "Feature: f\nScenario: a\n* def x = 1\nScenario: b\n* def y = 1\n";
        let runtime = FeatureRuntime::for_call(
            suite_with_selector(""),
            feature(text),
            None,
            vec![4],
        );
        let names: Vec<String> = runtime.scenarios().map(|s| s.name).collect();
        assert_eq!(names, vec!["b"]);
    }
}
