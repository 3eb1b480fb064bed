//! Plan-time validation: lint rules and diagnostics.
//!
//! Rules check the step graph of a [`WorkflowConfig`] before anything runs.
//! Call [`validate`] for every diagnostic or [`validate_or_raise`] to fail
//! with a configuration error when any rule reports an `Error`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;

use stepflow_types::{Result, StepflowError};

use crate::condition::Operand;
use crate::config::{FieldMap, OutputSpec, StepKind, ValueSource, WorkflowConfig};
use crate::reference::{root, segments};
use crate::schema::StateSchema;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic>;
}

fn error(rule: &dyn LintRule, step: Option<&str>, message: String, fix: Option<String>) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity: Severity::Error,
        message,
        step_id: step.map(String::from),
        fix,
    }
}

fn warning(rule: &dyn LintRule, step: Option<&str>, message: String, fix: Option<String>) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        ..error(rule, step, message, fix)
    }
}

/// Every reference path a workflow declares, with the step that owns it.
fn reference_paths(config: &WorkflowConfig) -> Vec<(Option<&str>, &str)> {
    fn from_fields<'a>(owner: Option<&'a str>, fields: &'a FieldMap, out: &mut Vec<(Option<&'a str>, &'a str)>) {
        for spec in fields.values() {
            if let Some(path) = spec.reference_path() {
                out.push((owner, path));
            }
            if let Some(nested) = &spec.schema {
                from_fields(owner, nested, out);
            }
        }
    }

    let mut out = Vec::new();
    match &config.agent.output {
        OutputSpec::Reference(path) => out.push((None, path.as_str())),
        OutputSpec::Fields(fields) => from_fields(None, fields, &mut out),
    }
    for step in &config.steps {
        let owner = Some(step.id.as_str());
        match &step.kind {
            StepKind::Plain(p) => {
                from_fields(owner, &p.input, &mut out);
                from_fields(owner, &p.output, &mut out);
            }
            StepKind::Condition(c) => {
                let router = &c.router;
                for clause in std::iter::once(&router.if_branch)
                    .chain(router.elif_branches.iter())
                    .flat_map(|b| b.clauses.iter())
                {
                    out.push((owner, clause.operand_path.as_str()));
                    if let Operand::Reference(path) = &clause.right {
                        out.push((owner, path.as_str()));
                    }
                }
            }
            StepKind::LoopAggregation(a) => {
                for spec in a.aggregation.values() {
                    out.push((owner, spec.reference.as_str()));
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        if config.steps.is_empty() {
            vec![error(
                self,
                None,
                "Workflow declares no steps".into(),
                Some("Add at least one entry to 'nodes'".into()),
            )]
        } else {
            vec![]
        }
    }
}

struct UniqueIdsRule;
impl LintRule for UniqueIdsRule {
    fn name(&self) -> &str { "unique_ids" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order = Vec::new();
        for step in &config.steps {
            let count = counts.entry(step.id.as_str()).or_insert(0);
            *count += 1;
            if *count == 2 {
                order.push(step.id.as_str());
            }
        }
        order
            .into_iter()
            .map(|id| {
                error(
                    self,
                    Some(id),
                    format!("Step id '{id}' is declared {} times", counts[id]),
                    Some(format!("Rename the duplicate '{id}' steps")),
                )
            })
            .collect()
    }
}

struct EntryStepRule;
impl LintRule for EntryStepRule {
    fn name(&self) -> &str { "entry_step" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        match config.steps.first() {
            Some(first) if first.is_condition() => vec![error(
                self,
                Some(&first.id),
                format!("First step '{}' is a condition step and cannot be the entry", first.id),
                Some("Declare a plain or loop_aggregation step first".into()),
            )],
            _ => vec![],
        }
    }
}

struct TargetExistsRule;
impl LintRule for TargetExistsRule {
    fn name(&self) -> &str { "target_exists" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let ids: HashSet<&str> = config.steps.iter().map(|s| s.id.as_str()).collect();
        let mut diags = Vec::new();
        for step in &config.steps {
            let targets: Vec<&String> = match &step.kind {
                StepKind::Condition(c) => c.router.all_targets().collect(),
                _ => step.direct_targets().iter().collect(),
            };
            for target in targets {
                if !ids.contains(target.as_str()) {
                    diags.push(error(
                        self,
                        Some(&step.id),
                        format!("Step '{}' targets non-existent step '{target}'", step.id),
                        Some(format!("Add step '{target}' or fix the target")),
                    ));
                } else if step.is_condition() && config.step(target).is_some_and(|t| t.is_condition()) {
                    diags.push(error(
                        self,
                        Some(&step.id),
                        format!("Condition step '{}' branches to condition step '{target}'", step.id),
                        Some(format!("Branch to the step that '{target}' follows instead")),
                    ));
                }
            }
        }
        diags
    }
}

struct ConditionPrevRule;
impl LintRule for ConditionPrevRule {
    fn name(&self) -> &str { "condition_prev" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (pos, step) in config.steps.iter().enumerate() {
            let StepKind::Condition(c) = &step.kind else { continue };
            match config.position(&c.prev) {
                None => diags.push(error(
                    self,
                    Some(&step.id),
                    format!("Condition step '{}' has unknown prev '{}'", step.id, c.prev),
                    Some("Point 'prev' at the step whose output is being tested".into()),
                )),
                Some(prev_pos) if prev_pos >= pos => diags.push(error(
                    self,
                    Some(&step.id),
                    format!(
                        "Condition step '{}' must be declared after its prev '{}'",
                        step.id, c.prev
                    ),
                    Some(format!("Move '{}' below '{}'", step.id, c.prev)),
                )),
                Some(prev_pos) if config.steps[prev_pos].is_condition() => diags.push(error(
                    self,
                    Some(&step.id),
                    format!(
                        "Condition step '{}' has another condition step '{}' as prev",
                        step.id, c.prev
                    ),
                    None,
                )),
                Some(_) => {}
            }
        }
        diags
    }
}

struct NextToConditionRule;
impl LintRule for NextToConditionRule {
    fn name(&self) -> &str { "next_to_condition" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in &config.steps {
            for target in step.direct_targets() {
                let Some(target_step) = config.step(target) else { continue };
                let StepKind::Condition(c) = &target_step.kind else { continue };
                if c.prev != step.id {
                    diags.push(error(
                        self,
                        Some(&step.id),
                        format!(
                            "Step '{}' names condition step '{target}' as next, but its prev is '{}'",
                            step.id, c.prev
                        ),
                        Some(format!("Set prev: {} on '{target}' or change the next target", step.id)),
                    ));
                }
            }
            if let StepKind::Plain(p) = &step.kind {
                if p.routed_by_condition && config.conditions_after(&step.id).next().is_none() {
                    diags.push(warning(
                        self,
                        Some(&step.id),
                        format!(
                            "Step '{}' declares next_type condition but no condition step has it as prev",
                            step.id
                        ),
                        None,
                    ));
                }
            }
        }
        diags
    }
}

fn segment_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\w-]+$").ok()).as_ref()
}

struct FieldSpecRule;
impl LintRule for FieldSpecRule {
    fn name(&self) -> &str { "field_spec" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in &config.steps {
            let StepKind::Plain(p) = &step.kind else { continue };
            for (name, spec) in p.input.iter().chain(p.output.iter()) {
                if spec.required && spec.value == ValueSource::Unset && spec.schema.is_none() {
                    diags.push(error(
                        self,
                        Some(&step.id),
                        format!("Required field '{name}' of step '{}' has neither value nor reference", step.id),
                        Some(format!("Give '{name}' a value or a reference")),
                    ));
                }
            }
        }
        let segment = segment_pattern();
        for (owner, path) in reference_paths(config) {
            if let Err(e) = segments(path) {
                diags.push(error(self, owner, e.to_string(), None));
                continue;
            }
            let bad = segment.and_then(|re| path.split('.').find(|seg| !re.is_match(seg)));
            if let Some(seg) = bad {
                diags.push(error(
                    self,
                    owner,
                    format!("Reference '{path}' has an invalid segment '{seg}'"),
                    None,
                ));
            }
        }
        diags
    }
}

struct ReservedSlotRule;
impl LintRule for ReservedSlotRule {
    fn name(&self) -> &str { "reserved_slot" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let segment = segment_pattern();
        for step in &config.steps {
            if matches!(step.kind, StepKind::Condition(_)) {
                continue;
            }
            if segment.is_some_and(|re| !re.is_match(&step.id)) {
                diags.push(error(
                    self,
                    Some(&step.id),
                    format!("Step id '{}' cannot be used in a reference path", step.id),
                    Some("Use only letters, digits, '_' and '-' in step ids".into()),
                ));
            }
        }

        // Same-id duplicates are reported by unique_ids.
        let schema = StateSchema::synthesize(&config.steps);
        let mut owners: HashMap<&str, Option<&str>> = HashMap::new();
        for field in &schema.fields {
            let owner = field.step.as_deref();
            match owners.get(field.name.as_str()) {
                Some(first) if *first != owner => {
                    let taken_by = match first {
                        Some(other) => format!("step '{other}'"),
                        None => "the workflow".to_string(),
                    };
                    diags.push(error(
                        self,
                        owner,
                        format!(
                            "Slot '{}' of step '{}' is already written by {taken_by}",
                            field.name,
                            owner.unwrap_or_default()
                        ),
                        Some("Rename the step".into()),
                    ));
                }
                Some(_) => {}
                None => {
                    owners.insert(field.name.as_str(), owner);
                }
            }
        }
        diags
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let Some(first) = config.steps.first() else {
            return vec![];
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(first.id.as_str());
        queue.push_back(first.id.as_str());

        while let Some(current) = queue.pop_front() {
            let Some(step) = config.step(current) else { continue };
            let mut successors: Vec<&str> = step.direct_targets().iter().map(String::as_str).collect();
            if let StepKind::Condition(c) = &step.kind {
                successors.extend(c.router.all_targets().map(String::as_str));
            }
            successors.extend(config.conditions_after(current).map(|c| c.id.as_str()));
            for next in successors {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        config
            .steps
            .iter()
            .filter(|s| !visited.contains(s.id.as_str()))
            .map(|s| {
                warning(
                    self,
                    Some(&s.id),
                    format!("Step '{}' is not reachable from the entry step", s.id),
                    Some(format!("Add a next leading to '{}' or remove it", s.id)),
                )
            })
            .collect()
    }
}

struct DanglingReferenceRule;
impl LintRule for DanglingReferenceRule {
    fn name(&self) -> &str { "dangling_reference" }
    fn apply(&self, config: &WorkflowConfig) -> Vec<Diagnostic> {
        let schema = StateSchema::synthesize(&config.steps);
        reference_paths(config)
            .into_iter()
            .filter_map(|(owner, path)| {
                let slot = root(path)?;
                if schema.contains(slot) {
                    return None;
                }
                Some(warning(
                    self,
                    owner,
                    format!("Reference '{path}' reads '{slot}', which no step writes"),
                    Some("Use workflow_input or a {step}_input / {step}_output slot".into()),
                ))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all lint rules and return every diagnostic.
pub fn validate(config: &WorkflowConfig) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NonEmptyRule),
        Box::new(UniqueIdsRule),
        Box::new(EntryStepRule),
        Box::new(TargetExistsRule),
        Box::new(ConditionPrevRule),
        Box::new(NextToConditionRule),
        Box::new(FieldSpecRule),
        Box::new(ReservedSlotRule),
        Box::new(ReachabilityRule),
        Box::new(DanglingReferenceRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(config));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(config: &WorkflowConfig) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(config);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(StepflowError::Config(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
