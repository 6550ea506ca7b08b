// Module: Feature
// Data model and reader for the Gherkin dialect consumed by the engine.
//
// The dialect differs from stock Gherkin in two ways that matter to the
// reader: a bare `*` is a first-class step keyword (a feature may open with
// `* def x = 1` and no Given/When/Then at all), and expression-bearing lines
// are passed through verbatim for the script engine to evaluate later.

pub mod tags;

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::errors::{EngineError, Result};
use tags::Tag;

const STEP_PREFIXES: [&str; 6] = ["*", "Given", "When", "Then", "And", "But"];

/// A parsed feature file: top-level tags, optional background, and an ordered
/// list of sections (plain scenarios or outlines).
#[derive(Clone, Debug)]
pub struct Feature {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub relative_path: String,
    pub line: usize,
    pub tags: Vec<Tag>,
    pub background: Vec<Step>,
    pub sections: Vec<Section>,
}

#[derive(Clone, Debug)]
pub enum Section {
    Scenario(ScenarioDef),
    Outline(OutlineDef),
}

#[derive(Clone, Debug)]
pub struct ScenarioDef {
    pub name: String,
    pub description: String,
    pub line: usize,
    pub tags: Vec<Tag>,
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug)]
pub struct OutlineDef {
    pub name: String,
    pub description: String,
    pub line: usize,
    pub tags: Vec<Tag>,
    pub steps: Vec<Step>,
    pub examples: Vec<ExamplesTable>,
}

#[derive(Clone, Debug)]
pub struct ExamplesTable {
    pub line: usize,
    pub tags: Vec<Tag>,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ExamplesTable {
    /// Converts one row into a variable map. A column whose header ends with
    /// `!` has its cells parsed as JSON; everything else stays a string.
    pub fn row_map(&self, row_index: usize) -> Map<String, Value> {
        let mut map = Map::new();
        let row = match self.rows.get(row_index) {
            Some(row) => row,
            None => return map,
        };
        for (col, header) in self.header.iter().enumerate() {
            let cell = row.get(col).map(String::as_str).unwrap_or("");
            match header.strip_suffix('!') {
                Some(name) => {
                    let value = serde_json::from_str(cell)
                        .unwrap_or_else(|_| Value::String(cell.to_string()));
                    map.insert(name.to_string(), value);
                }
                None => {
                    map.insert(header.clone(), Value::String(cell.to_string()));
                }
            }
        }
        map
    }
}

/// One executable line of a scenario.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Step {
    pub line: usize,
    pub prefix: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<StepTable>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct StepTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl StepTable {
    /// Rows as raw-string maps; cell evaluation is the executor's business.
    pub fn rows_as_maps(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                let mut map = Map::new();
                for (col, header) in self.header.iter().enumerate() {
                    let cell = row.get(col).map(String::as_str).unwrap_or("");
                    map.insert(header.clone(), Value::String(cell.to_string()));
                }
                map
            })
            .collect()
    }
}

impl Step {
    pub fn display(&self) -> String {
        format!("{} {}", self.prefix, self.text)
    }
}

/// A runnable scenario: either a plain section or one expanded outline row.
/// Mutable only until a runtime attaches it.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub feature_name: String,
    pub feature_path: String,
    pub name: String,
    pub description: String,
    pub line: usize,
    pub tags: Vec<Tag>,
    pub section_index: usize,
    pub example_index: Option<usize>,
    pub example_data: Map<String, Value>,
    pub steps: Vec<Step>,
    pub is_fail: bool,
}

impl Scenario {
    pub fn ref_id(&self) -> String {
        match self.example_index {
            Some(example) => format!("[{}.{}]", self.section_index + 1, example + 1),
            None => format!("[{}]", self.section_index + 1),
        }
    }

    pub fn is_setup(&self) -> bool {
        tags::has_tag(&self.tags, "setup")
    }

    pub fn is_ignored(&self) -> bool {
        tags::has_tag(&self.tags, "ignore")
    }

    pub fn lock_spec(&self) -> Option<tags::LockSpec> {
        tags::lock_spec(&self.tags)
    }
}

impl ScenarioDef {
    pub fn build(&self, feature: &Feature, section_index: usize) -> Scenario {
        let mut tags = feature.tags.clone();
        tags.extend(self.tags.iter().cloned());
        let is_fail = tags::has_tag(&tags, "fail");
        Scenario {
            feature_name: feature.name.clone(),
            feature_path: feature.relative_path.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            line: self.line,
            tags,
            section_index,
            example_index: None,
            example_data: Map::new(),
            steps: self.steps.clone(),
            is_fail,
        }
    }
}

impl OutlineDef {
    /// Derives the scenario for one examples row. Placeholders of the form
    /// `<name>` are substituted into the name and step text; the full row map
    /// is carried as `example_data` for the runtime to publish as variables.
    pub fn build_row(
        &self,
        feature: &Feature,
        section_index: usize,
        example_index: usize,
        table: &ExamplesTable,
        row_index: usize,
    ) -> Scenario {
        let row = table.row_map(row_index);
        let mut tags = feature.tags.clone();
        tags.extend(self.tags.iter().cloned());
        tags.extend(table.tags.iter().cloned());
        let is_fail = tags::has_tag(&tags, "fail");
        let steps = self
            .steps
            .iter()
            .map(|s| {
                let mut step = s.clone();
                step.text = substitute_placeholders(&step.text, &row);
                if let Some(doc) = &step.docstring {
                    step.docstring = Some(substitute_placeholders(doc, &row));
                }
                step
            })
            .collect();
        Scenario {
            feature_name: feature.name.clone(),
            feature_path: feature.relative_path.clone(),
            name: substitute_placeholders(&self.name, &row),
            description: self.description.clone(),
            line: table
                .line
                .checked_add(row_index + 1)
                .unwrap_or(self.line),
            tags,
            section_index,
            example_index: Some(example_index),
            example_data: row,
            steps,
            is_fail,
        }
    }
}

fn substitute_placeholders(text: &str, row: &Map<String, Value>) -> String {
    let mut out = text.to_string();
    for (key, value) in row {
        let token = format!("<{}>", key);
        if out.contains(&token) {
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&token, &replacement);
        }
    }
    out
}

impl Feature {
    pub fn read(path: &Path) -> Result<Feature> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Feature> {
        Parser::new(text, path).run()
    }
}

enum Block {
    Preamble,
    FeatureHeader,
    Background,
    Scenario,
    Outline,
    Examples,
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    path: PathBuf,
    index: usize,
    pending_tags: Vec<Tag>,
    block: Block,
    feature_name: String,
    feature_description: Vec<String>,
    feature_line: usize,
    feature_tags: Vec<Tag>,
    background: Vec<Step>,
    sections: Vec<Section>,
    scenario: Option<ScenarioDef>,
    outline: Option<OutlineDef>,
    table_header_seen: bool,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, path: &Path) -> Self {
        Self {
            lines: text.trim_start_matches('\u{feff}').lines().collect(),
            path: path.to_path_buf(),
            index: 0,
            pending_tags: Vec::new(),
            block: Block::Preamble,
            feature_name: String::new(),
            feature_description: Vec::new(),
            feature_line: 0,
            feature_tags: Vec::new(),
            background: Vec::new(),
            sections: Vec::new(),
            scenario: None,
            outline: None,
            table_header_seen: false,
        }
    }

    fn fail(&self, line: usize, message: impl Into<String>) -> EngineError {
        EngineError::Parse {
            path: self.path.display().to_string(),
            line,
            message: message.into(),
        }
    }

    fn run(mut self) -> Result<Feature> {
        while self.index < self.lines.len() {
            let raw = self.lines[self.index];
            let line_no = self.index + 1;
            let trimmed = raw.trim();
            self.index += 1;

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('@') {
                self.pending_tags.extend(tags::parse_tag_line(trimmed));
                continue;
            }
            if let Some(name) = trimmed.strip_prefix("Feature:") {
                if self.feature_line != 0 {
                    return Err(self.fail(line_no, "duplicate Feature declaration"));
                }
                self.feature_name = name.trim().to_string();
                self.feature_line = line_no;
                self.feature_tags = std::mem::take(&mut self.pending_tags);
                self.block = Block::FeatureHeader;
                continue;
            }
            if self.feature_line == 0 {
                return Err(self.fail(line_no, "expected a Feature declaration"));
            }
            if trimmed.strip_prefix("Background:").is_some() {
                self.flush_section();
                self.pending_tags.clear();
                self.block = Block::Background;
                continue;
            }
            if let Some(name) = trimmed.strip_prefix("Scenario Outline:") {
                self.flush_section();
                self.outline = Some(OutlineDef {
                    name: name.trim().to_string(),
                    description: String::new(),
                    line: line_no,
                    tags: std::mem::take(&mut self.pending_tags),
                    steps: Vec::new(),
                    examples: Vec::new(),
                });
                self.block = Block::Outline;
                continue;
            }
            if let Some(name) = trimmed.strip_prefix("Scenario:") {
                self.flush_section();
                self.scenario = Some(ScenarioDef {
                    name: name.trim().to_string(),
                    description: String::new(),
                    line: line_no,
                    tags: std::mem::take(&mut self.pending_tags),
                    steps: Vec::new(),
                });
                self.block = Block::Scenario;
                continue;
            }
            if trimmed.strip_prefix("Examples:").is_some() {
                let outline = match self.outline.as_mut() {
                    Some(outline) => outline,
                    None => return Err(self.fail(line_no, "Examples outside a Scenario Outline")),
                };
                outline.examples.push(ExamplesTable {
                    line: line_no,
                    tags: std::mem::take(&mut self.pending_tags),
                    header: Vec::new(),
                    rows: Vec::new(),
                });
                self.block = Block::Examples;
                continue;
            }
            if trimmed.starts_with('|') {
                self.table_row(line_no, trimmed)?;
                continue;
            }
            if trimmed.starts_with("\"\"\"") {
                self.docstring(raw, line_no)?;
                continue;
            }
            if let Some((prefix, text)) = split_step(trimmed) {
                self.step(line_no, prefix, text)?;
                continue;
            }
            self.description_line(trimmed);
        }
        self.flush_section();
        if self.feature_line == 0 {
            return Err(self.fail(self.lines.len().max(1), "expected a Feature declaration"));
        }
        let relative_path = self.path.display().to_string();
        Ok(Feature {
            name: self.feature_name,
            description: self.feature_description.join("\n"),
            path: self.path.clone(),
            relative_path,
            line: self.feature_line,
            tags: self.feature_tags,
            background: self.background,
            sections: self.sections,
        })
    }

    fn step(&mut self, line_no: usize, prefix: &str, text: &str) -> Result<()> {
        let step = Step {
            line: line_no,
            prefix: prefix.to_string(),
            text: text.to_string(),
            docstring: None,
            table: None,
        };
        self.table_header_seen = false;
        match self.block {
            Block::Background => self.background.push(step),
            Block::Scenario => match self.scenario.as_mut() {
                Some(scenario) => scenario.steps.push(step),
                None => return Err(self.fail(line_no, "step outside a scenario")),
            },
            Block::Outline => match self.outline.as_mut() {
                Some(outline) => outline.steps.push(step),
                None => return Err(self.fail(line_no, "step outside a scenario")),
            },
            _ => return Err(self.fail(line_no, "step outside a scenario")),
        }
        Ok(())
    }

    fn current_steps(&mut self) -> Option<&mut Vec<Step>> {
        match self.block {
            Block::Background => Some(&mut self.background),
            Block::Scenario => self.scenario.as_mut().map(|s| &mut s.steps),
            Block::Outline => self.outline.as_mut().map(|o| &mut o.steps),
            _ => None,
        }
    }

    fn table_row(&mut self, line_no: usize, trimmed: &str) -> Result<()> {
        let cells: Vec<String> = {
            let inner = trimmed.trim_matches('|');
            inner.split('|').map(|c| c.trim().to_string()).collect()
        };
        if let Block::Examples = self.block {
            let table = match self.outline.as_mut().and_then(|o| o.examples.last_mut()) {
                Some(table) => table,
                None => return Err(self.fail(line_no, "table row outside an Examples block")),
            };
            if table.header.is_empty() {
                table.header = cells;
            } else {
                table.rows.push(cells);
            }
            return Ok(());
        }
        let header_seen = self.table_header_seen;
        let step = match self.current_steps().and_then(|steps| steps.last_mut()) {
            Some(step) => step,
            None => return Err(self.fail(line_no, "table row without a preceding step")),
        };
        if !header_seen {
            step.table = Some(StepTable {
                header: cells,
                rows: Vec::new(),
            });
            self.table_header_seen = true;
        } else if let Some(table) = step.table.as_mut() {
            table.rows.push(cells);
        }
        Ok(())
    }

    fn docstring(&mut self, raw_open: &str, line_no: usize) -> Result<()> {
        let indent = raw_open.len() - raw_open.trim_start().len();
        let mut body: Vec<String> = Vec::new();
        loop {
            if self.index >= self.lines.len() {
                return Err(self.fail(line_no, "unterminated docstring"));
            }
            let raw = self.lines[self.index];
            self.index += 1;
            if raw.trim() == "\"\"\"" {
                break;
            }
            let stripped = if raw.len() >= indent && raw[..indent.min(raw.len())].trim().is_empty()
            {
                &raw[indent.min(raw.len())..]
            } else {
                raw.trim_start()
            };
            body.push(stripped.to_string());
        }
        let step = match self.current_steps().and_then(|steps| steps.last_mut()) {
            Some(step) => step,
            None => return Err(self.fail(line_no, "docstring without a preceding step")),
        };
        step.docstring = Some(body.join("\n"));
        Ok(())
    }

    fn description_line(&mut self, trimmed: &str) {
        match self.block {
            Block::FeatureHeader => self.feature_description.push(trimmed.to_string()),
            Block::Scenario => {
                if let Some(scenario) = self.scenario.as_mut() {
                    push_description(&mut scenario.description, trimmed);
                }
            }
            Block::Outline => {
                if let Some(outline) = self.outline.as_mut() {
                    push_description(&mut outline.description, trimmed);
                }
            }
            _ => {}
        }
    }

    fn flush_section(&mut self) {
        if let Some(scenario) = self.scenario.take() {
            self.sections.push(Section::Scenario(scenario));
        }
        if let Some(outline) = self.outline.take() {
            self.sections.push(Section::Outline(outline));
        }
        self.table_header_seen = false;
    }
}

fn push_description(target: &mut String, line: &str) {
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(line);
}

fn split_step(trimmed: &str) -> Option<(&str, &str)> {
    for prefix in STEP_PREFIXES {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            if let Some(text) = rest.strip_prefix(' ') {
                return Some((prefix, text.trim()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Feature {
        Feature::parse(text, Path::new("test.feature")).expect("feature should parse")
    }

    #[test]
    fn parses_feature_with_background_and_scenarios() {
        let feature = parse(
            r#"
@smoke
Feature: user api
  exercises the user endpoints

Background:
  * url 'http://localhost:8080'

Scenario: get a user
  Given path 'users', '1'
  When method get
  Then status 200

@slow
Scenario: delete a user
  * def id = 1
"#,
        );
        assert_eq!(feature.name, "user api");
        assert_eq!(feature.tags[0].name, "smoke");
        assert_eq!(feature.background.len(), 1);
        assert_eq!(feature.sections.len(), 2);
        match &feature.sections[0] {
            Section::Scenario(s) => {
                assert_eq!(s.name, "get a user");
                assert_eq!(s.steps.len(), 3);
                assert_eq!(s.steps[1].prefix, "When");
                assert_eq!(s.steps[1].text, "method get");
            }
            _ => panic!("expected a plain scenario"),
        }
        match &feature.sections[1] {
            Section::Scenario(s) => assert_eq!(s.tags[0].name, "slow"),
            _ => panic!("expected a plain scenario"),
        }
    }

    #[test]
    fn bare_star_steps_parse_without_given_when_then() {
        let feature = parse("Feature: f\nScenario: s\n* def x = 1\n* match x == 1\n");
        match &feature.sections[0] {
            Section::Scenario(s) => {
                assert_eq!(s.steps.len(), 2);
                assert_eq!(s.steps[0].prefix, "*");
            }
            _ => panic!("expected a plain scenario"),
        }
    }

    #[test]
    fn parses_outline_with_two_tables() {
        let feature = parse(
            r#"
Feature: outlines
Scenario Outline: row <x>
  * match <x> == 1

Examples:
  | x |
  | 1 |
  | 2 |

@second
Examples:
  | x |
  | 3 |
"#,
        );
        match &feature.sections[0] {
            Section::Outline(o) => {
                assert_eq!(o.examples.len(), 2);
                assert_eq!(o.examples[0].rows.len(), 2);
                assert_eq!(o.examples[1].tags[0].name, "second");
            }
            _ => panic!("expected an outline"),
        }
    }

    #[test]
    fn outline_rows_substitute_placeholders_and_carry_row_data() {
        let feature = parse(
            "Feature: f\nScenario Outline: o\n* match x == <expected>\nExamples:\n| expected! |\n| 42 |\n",
        );
        let outline = match &feature.sections[0] {
            Section::Outline(o) => o.clone(),
            _ => panic!("expected an outline"),
        };
        let scenario = outline.build_row(&feature, 0, 0, &outline.examples[0], 0);
        assert_eq!(scenario.steps[0].text, "match x == 42");
        assert_eq!(scenario.example_index, Some(0));
        assert_eq!(scenario.example_data["expected"], Value::from(42));
    }

    #[test]
    fn docstring_attaches_to_the_preceding_step() {
        let feature = parse(
            "Feature: f\nScenario: s\n* text payload =\n  \"\"\"\n  line one\n  line two\n  \"\"\"\n",
        );
        match &feature.sections[0] {
            Section::Scenario(s) => {
                assert_eq!(s.steps[0].docstring.as_deref(), Some("line one\nline two"));
            }
            _ => panic!("expected a plain scenario"),
        }
    }

    #[test]
    fn step_table_rows_attach_to_the_step() {
        let feature = parse(
            "Feature: f\nScenario: s\n* table cats\n| name  | age |\n| 'Bob' | 2   |\n",
        );
        match &feature.sections[0] {
            Section::Scenario(s) => {
                let table = s.steps[0].table.as_ref().expect("step table");
                assert_eq!(table.header, vec!["name", "age"]);
                assert_eq!(table.rows.len(), 1);
            }
            _ => panic!("expected a plain scenario"),
        }
    }

    #[test]
    fn missing_feature_line_is_a_parse_error() {
        let err = Feature::parse("Scenario: s\n* def x = 1\n", Path::new("bad.feature"))
            .expect_err("should fail");
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn fail_tag_marks_the_scenario() {
        let feature = parse("Feature: f\n@fail\nScenario: s\n* def x = 1\n");
        let scenario = match &feature.sections[0] {
            Section::Scenario(s) => s.build(&feature, 0),
            _ => panic!("expected a plain scenario"),
        };
        assert!(scenario.is_fail);
    }
}
