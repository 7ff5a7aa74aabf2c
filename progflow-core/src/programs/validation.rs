//! Static checks run before a program is allowed to execute.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::error::HandlerKind;
use crate::programs::expressions::ExpressionEvaluator;
use crate::programs::registry::HandlerRegistry;
use crate::programs::template;
use crate::programs::types::{Program, Step, TriggerType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidStepId,
    DuplicateStepId,
    UnknownSuccessor,
    Cycle,
    MissingEntryPoint,
    UnreachableStep,
    MissingCondition,
    MalformedCondition,
    UnknownFunction,
    UnknownStepType,
    UnknownTriggerType,
    UnknownActionType,
    StepTypeRule,
    InvalidExecutionConfig,
    ProgramMismatch,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::InvalidStepId => "invalid_step_id",
            IssueKind::DuplicateStepId => "duplicate_step_id",
            IssueKind::UnknownSuccessor => "unknown_successor",
            IssueKind::Cycle => "cycle",
            IssueKind::MissingEntryPoint => "missing_entry_point",
            IssueKind::UnreachableStep => "unreachable_step",
            IssueKind::MissingCondition => "missing_condition",
            IssueKind::MalformedCondition => "malformed_condition",
            IssueKind::UnknownFunction => "unknown_function",
            IssueKind::UnknownStepType => "unknown_step_type",
            IssueKind::UnknownTriggerType => "unknown_trigger_type",
            IssueKind::UnknownActionType => "unknown_action_type",
            IssueKind::StepTypeRule => "step_type_rule",
            IssueKind::InvalidExecutionConfig => "invalid_execution_config",
            IssueKind::ProgramMismatch => "program_mismatch",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            IssueKind::UnreachableStep => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Issues that reject a run before it starts. The rest surface as
    /// failed or skipped steps.
    pub fn blocks_execution(self) -> bool {
        !matches!(
            self,
            IssueKind::UnreachableStep
                | IssueKind::UnknownStepType
                | IssueKind::UnknownTriggerType
                | IssueKind::UnknownActionType
                | IssueKind::StepTypeRule
        )
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: IssueKind, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            step_id: step_id.map(str::to_owned),
            message: message.into(),
        }
    }

    fn for_step(kind: IssueKind, step_id: &str, message: impl Into<String>) -> Self {
        Self::new(kind, Some(step_id), message)
    }

    pub fn blocks_execution(&self) -> bool {
        self.kind.blocks_execution()
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step_id) => write!(f, "[{}] step '{step_id}': {}", self.kind, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Successor and predecessor lists for the steps of a program, keyed by step
/// id. Edges to unknown steps are dropped.
#[derive(Debug, Clone)]
pub struct StepGraph {
    order: Vec<String>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
}

impl StepGraph {
    pub fn build(program: &Program) -> Self {
        let mut order = Vec::with_capacity(program.steps.len());
        let mut known = HashSet::new();
        for step in &program.steps {
            if known.insert(step.id.as_str()) {
                order.push(step.id.clone());
            }
        }

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for id in &order {
            successors.entry(id.clone()).or_default();
            predecessors.entry(id.clone()).or_default();
        }
        for step in &program.steps {
            for next in &step.next {
                if !known.contains(next.as_str()) {
                    continue;
                }
                let edges = successors.entry(step.id.clone()).or_default();
                if edges.contains(next) {
                    continue;
                }
                edges.push(next.clone());
                predecessors
                    .entry(next.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        Self {
            order,
            successors,
            predecessors,
        }
    }

    /// Step ids in declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn successors(&self, step_id: &str) -> &[String] {
        self.successors.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, step_id: &str) -> &[String] {
        self.predecessors.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Root steps whose trigger is fired from outside the run.
    pub fn entry_points(&self, program: &Program) -> Vec<String> {
        let mut seen = HashSet::new();
        program
            .steps
            .iter()
            .filter(|step| self.predecessors(&step.id).is_empty())
            .filter(|step| step.trigger.trigger_type.is_entry_capable())
            .filter(|step| seen.insert(step.id.as_str()))
            .map(|step| step.id.clone())
            .collect()
    }

    pub fn reachable(&self, entry_points: &[String]) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<&str> = entry_points.iter().map(String::as_str).collect();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.to_owned()) {
                continue;
            }
            for next in self.successors(current) {
                if !seen.contains(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Steps where a back edge closes a cycle, in declaration order.
    pub fn cycle_members(&self) -> Vec<String> {
        fn dfs<'a>(
            node: &'a str,
            graph: &'a StepGraph,
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
            found: &mut BTreeSet<&'a str>,
        ) {
            if visited.contains(node) {
                return;
            }
            visiting.insert(node);
            for next in graph.successors(node) {
                if visiting.contains(next.as_str()) {
                    found.insert(next.as_str());
                } else {
                    dfs(next, graph, visiting, visited, found);
                }
            }
            visiting.remove(node);
            visited.insert(node);
        }

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        let mut found = BTreeSet::new();
        for node in &self.order {
            dfs(node, self, &mut visiting, &mut visited, &mut found);
        }
        self.order
            .iter()
            .filter(|id| found.contains(id.as_str()))
            .cloned()
            .collect()
    }
}

/// Every detectable issue in `program`. An empty list means the program is
/// well formed.
pub fn validate_program(
    program: &Program,
    registry: &HandlerRegistry,
    evaluator: &ExpressionEvaluator,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check_execution_config(program, &mut issues);
    check_structure(program, &mut issues);
    for step in &program.steps {
        check_step(program, step, registry, evaluator, &mut issues);
    }
    issues
}

fn check_execution_config(program: &Program, issues: &mut Vec<ValidationIssue>) {
    let execution = &program.execution;
    if execution.parallel_limit == 0 {
        issues.push(ValidationIssue::new(
            IssueKind::InvalidExecutionConfig,
            None,
            "parallel_limit must be at least 1",
        ));
    }
    if execution.timeout_seconds == 0 {
        issues.push(ValidationIssue::new(
            IssueKind::InvalidExecutionConfig,
            None,
            "timeout_seconds must be greater than zero",
        ));
    }
    if execution.run_deadline_seconds == Some(0) {
        issues.push(ValidationIssue::new(
            IssueKind::InvalidExecutionConfig,
            None,
            "run_deadline_seconds must be greater than zero when set",
        ));
    }
    for step in program.steps.iter().filter(|step| step.timeout_seconds == Some(0)) {
        issues.push(ValidationIssue::for_step(
            IssueKind::InvalidExecutionConfig,
            &step.id,
            "step timeout_seconds must be greater than zero when set",
        ));
    }
}

fn check_structure(program: &Program, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    for step in &program.steps {
        if step.id.trim().is_empty() {
            issues.push(ValidationIssue::new(
                IssueKind::InvalidStepId,
                None,
                "step id must be non-empty",
            ));
        } else if !seen.insert(step.id.as_str()) {
            issues.push(ValidationIssue::for_step(
                IssueKind::DuplicateStepId,
                &step.id,
                "step id is declared more than once",
            ));
        }
    }

    for step in &program.steps {
        for next in &step.next {
            if !seen.contains(next.as_str()) {
                issues.push(ValidationIssue::for_step(
                    IssueKind::UnknownSuccessor,
                    &step.id,
                    format!("successor '{next}' does not exist"),
                ));
            }
        }
    }

    if program.steps.is_empty() {
        issues.push(ValidationIssue::new(
            IssueKind::MissingEntryPoint,
            None,
            "program has no steps",
        ));
        return;
    }

    let graph = StepGraph::build(program);
    for member in graph.cycle_members() {
        issues.push(ValidationIssue::for_step(
            IssueKind::Cycle,
            &member,
            "step is part of a cycle",
        ));
    }

    let entry_points = graph.entry_points(program);
    if entry_points.is_empty() {
        issues.push(ValidationIssue::new(
            IssueKind::MissingEntryPoint,
            None,
            "no root step has an immediate, user_action or time_based trigger",
        ));
        return;
    }

    let reachable = graph.reachable(&entry_points);
    for id in graph.order() {
        if !reachable.contains(id) {
            issues.push(ValidationIssue::for_step(
                IssueKind::UnreachableStep,
                id,
                "step cannot be reached from any entry point",
            ));
        }
    }
}

fn check_step(
    program: &Program,
    step: &Step,
    registry: &HandlerRegistry,
    evaluator: &ExpressionEvaluator,
    issues: &mut Vec<ValidationIssue>,
) {
    if !step.program_id.is_empty() && step.program_id != program.id {
        issues.push(ValidationIssue::for_step(
            IssueKind::ProgramMismatch,
            &step.id,
            format!(
                "step belongs to program '{}', not '{}'",
                step.program_id, program.id
            ),
        ));
    }

    if step.trigger.trigger_type == TriggerType::ConditionBased {
        match step.trigger.condition.as_deref() {
            Some(condition) if !condition.trim().is_empty() => {
                check_expression(step, condition, "condition", evaluator, issues);
            }
            _ => issues.push(ValidationIssue::for_step(
                IssueKind::MissingCondition,
                &step.id,
                "condition_based trigger has no condition",
            )),
        }
    }

    let mut expressions = Vec::new();
    collect_placeholders(&step.action.params, &mut expressions);
    for expression in expressions {
        check_expression(step, &expression, "placeholder", evaluator, issues);
    }

    let step_type = step.step_type.as_str();
    match registry.step(step_type) {
        Ok(handler) => push_rules(step, handler.validate(step), issues),
        Err(_) => issues.push(unknown_type(step, HandlerKind::Step, step_type)),
    }

    let trigger_type = step.trigger.trigger_type.as_str();
    match registry.trigger(trigger_type) {
        Ok(handler) => push_rules(step, handler.validate(step, evaluator), issues),
        Err(_) => issues.push(unknown_type(step, HandlerKind::Trigger, trigger_type)),
    }

    let action_type = step.action.action_type.as_str();
    match registry.action(action_type) {
        Ok(handler) => push_rules(step, handler.validate(step), issues),
        Err(_) => issues.push(unknown_type(step, HandlerKind::Action, action_type)),
    }
}

fn check_expression(
    step: &Step,
    expression: &str,
    label: &str,
    evaluator: &ExpressionEvaluator,
    issues: &mut Vec<ValidationIssue>,
) {
    match evaluator.parse(expression) {
        Ok(parsed) => {
            for function in parsed.functions() {
                if !evaluator.has_function(&function) {
                    issues.push(ValidationIssue::for_step(
                        IssueKind::UnknownFunction,
                        &step.id,
                        format!("{label} '{expression}' calls unknown function {function}()"),
                    ));
                }
            }
        }
        Err(err) => issues.push(ValidationIssue::for_step(
            IssueKind::MalformedCondition,
            &step.id,
            format!("{label} '{expression}' does not parse: {err}"),
        )),
    }
}

fn collect_placeholders(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.extend(template::placeholders(text).into_iter().map(str::to_owned)),
        Value::Array(items) => items.iter().for_each(|item| collect_placeholders(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_placeholders(item, out)),
        _ => {}
    }
}

fn push_rules(step: &Step, messages: Vec<String>, issues: &mut Vec<ValidationIssue>) {
    issues.extend(
        messages
            .into_iter()
            .map(|message| ValidationIssue::for_step(IssueKind::StepTypeRule, &step.id, message)),
    );
}

fn unknown_type(step: &Step, kind: HandlerKind, type_id: &str) -> ValidationIssue {
    let issue_kind = match kind {
        HandlerKind::Step => IssueKind::UnknownStepType,
        HandlerKind::Trigger => IssueKind::UnknownTriggerType,
        HandlerKind::Action => IssueKind::UnknownActionType,
    };
    ValidationIssue::for_step(
        issue_kind,
        &step.id,
        format!("no {kind} handler registered for '{type_id}'"),
    )
}
