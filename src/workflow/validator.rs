//! Workflow Validation
//!
//! Structural, semantic and security validation of a workflow document
//! before anything is executed:
//! - Required sections and metadata fields
//! - Naming conventions (snake_case, semver schema versions)
//! - Step configuration and dependency graph (no cycles)
//! - Static template reference checking
//! - Input specs, conditions and security policy
//! - Hardcoded secrets
//!
//! Validation never performs a network call and lists every violation
//! instead of stopping at the first one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::condition::Check;
use super::inputs;
use super::model::{
    Condition, DuplicatePolicy, Operation, ParamSpec, Step, Strategy, WorkflowDefinition,
};
use super::planner::{DependencyGraph, PlanError};
use super::template::{self, Reference};

static SNAKE_CASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("snake_case pattern is valid"));

static WORKFLOW_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("workflow id pattern is valid")
});

static SEMVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.\-]+)?(\+[0-9A-Za-z.\-]+)?$").expect("semver pattern is valid")
});

const REQUIRED_SECTIONS: &[&str] = &["metadata", "security", "steps"];

const KNOWN_SECTIONS: &[&str] = &[
    "metadata",
    "inputs",
    "security",
    "validation",
    "steps",
    "execution_config",
    "observability",
    "documentation",
];

const SECRET_MARKERS: &[&str] = &["password", "passwd", "token", "api_key", "apikey", "secret"];

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingSection,
    MissingField,
    InvalidFormat,
    EmptyWorkflow,
    DuplicateStepId,
    UnknownDependency,
    CyclicDependency,
    UnresolvedReference,
    TemplateSyntax,
    InvalidStepConfig,
    InvalidInputSpec,
    InvalidCondition,
    SecurityInconsistency,
    HardcodedSecret,
    BestPractice,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSection => "missing_section",
            Self::MissingField => "missing_field",
            Self::InvalidFormat => "invalid_format",
            Self::EmptyWorkflow => "empty_workflow",
            Self::DuplicateStepId => "duplicate_step_id",
            Self::UnknownDependency => "unknown_dependency",
            Self::CyclicDependency => "cyclic_dependency",
            Self::UnresolvedReference => "unresolved_reference",
            Self::TemplateSyntax => "template_syntax",
            Self::InvalidStepConfig => "invalid_step_config",
            Self::InvalidInputSpec => "invalid_input_spec",
            Self::InvalidCondition => "invalid_condition",
            Self::SecurityInconsistency => "security_inconsistency",
            Self::HardcodedSecret => "hardcoded_secret",
            Self::BestPractice => "best_practice",
        }
    }
}

/// One finding, located by a dotted document path such as `steps.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub location: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind.as_str(), self.location, self.message)
    }
}

/// Outcome of validating a document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub info: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Promotes every warning to an error.
    pub fn strict(mut self) -> Self {
        self.errors.append(&mut self.warnings);
        self
    }

    /// True when any error of the given kind was reported.
    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    fn error(&mut self, kind: IssueKind, location: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            kind,
            location: location.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, kind: IssueKind, location: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            kind,
            location: location.into(),
            message: message.into(),
        });
    }

    fn note(&mut self, message: impl Into<String>) {
        self.info.push(message.into());
    }

    fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.info.extend(other.info);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error(s), {} warning(s)",
            self.errors.len(),
            self.warnings.len()
        )?;
        for issue in &self.errors {
            write!(f, "\n  error: {}", issue)?;
        }
        for issue in &self.warnings {
            write!(f, "\n  warning: {}", issue)?;
        }
        Ok(())
    }
}

/// Validates a raw document, including the checks typed parsing cannot express.
pub fn validate_value(document: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    let Some(sections) = document.as_object() else {
        report.error(IssueKind::MissingSection, "$", "document must be a mapping of sections");
        return report;
    };

    for section in REQUIRED_SECTIONS {
        if !sections.contains_key(*section) {
            report.error(
                IssueKind::MissingSection,
                *section,
                format!("required section '{}' is missing", section),
            );
        }
    }
    for key in sections.keys() {
        if !KNOWN_SECTIONS.contains(&key.as_str()) {
            report.warn(IssueKind::BestPractice, key.as_str(), "unknown top-level section");
        }
    }
    if !report.is_valid() {
        return report;
    }

    match serde_json::from_value::<WorkflowDefinition>(document.clone()) {
        Ok(definition) => report.merge(validate(&definition)),
        Err(e) => report.error(IssueKind::InvalidFormat, "$", e.to_string()),
    }
    report
}

/// Validates a parsed workflow definition.
pub fn validate(definition: &WorkflowDefinition) -> ValidationReport {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.metadata.workflow_id,
        definition.steps.len()
    );

    let mut report = ValidationReport::default();

    check_metadata(definition, &mut report);
    check_inputs(definition, &mut report);
    check_security(definition, &mut report);

    if definition.steps.is_empty() {
        report.error(IssueKind::EmptyWorkflow, "steps", "workflow has no steps");
    }

    let graph = check_graph(definition, &mut report);

    for step in &definition.steps {
        check_step(definition, step, &mut report);
        check_step_templates(definition, step, graph.as_ref(), &mut report);
        check_secrets(&format!("steps.{}.inputs", step.id), &Value::Object(step.inputs.clone()), &mut report);
    }

    check_conditions(definition, &mut report);
    check_execution_config(definition, &mut report);

    debug!(
        "Validation finished: {} errors, {} warnings",
        report.errors.len(),
        report.warnings.len()
    );
    report
}

fn check_metadata(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let meta = &definition.metadata;
    let fields = [
        ("workflow_name", &meta.workflow_name),
        ("workflow_id", &meta.workflow_id),
        ("platform", &meta.platform),
        ("schema_version", &meta.schema_version),
    ];
    for (field, value) in fields {
        if value.trim().is_empty() {
            report.error(
                IssueKind::MissingField,
                format!("metadata.{}", field),
                "field is required",
            );
        }
    }

    if !meta.workflow_name.is_empty() && !SNAKE_CASE.is_match(&meta.workflow_name) {
        report.error(
            IssueKind::InvalidFormat,
            "metadata.workflow_name",
            format!("'{}' is not snake_case", meta.workflow_name),
        );
    }
    if !meta.workflow_id.is_empty() && !WORKFLOW_ID.is_match(&meta.workflow_id) {
        report.error(
            IssueKind::InvalidFormat,
            "metadata.workflow_id",
            format!("'{}' must be dotted snake_case, e.g. vendure.create_promotion", meta.workflow_id),
        );
    }
    if !meta.schema_version.is_empty() && !SEMVER.is_match(&meta.schema_version) {
        report.error(
            IssueKind::InvalidFormat,
            "metadata.schema_version",
            format!("'{}' is not a semantic version", meta.schema_version),
        );
    }
    if meta.idempotent.is_none() {
        report.warn(
            IssueKind::BestPractice,
            "metadata.idempotent",
            "declare whether the workflow is idempotent",
        );
    }
    if definition.documentation.is_none() {
        report.note("no documentation section");
    }
}

fn check_inputs(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let spec = &definition.inputs;

    for name in spec.required.keys().filter(|n| spec.optional.contains_key(*n)) {
        report.error(
            IssueKind::InvalidInputSpec,
            format!("inputs.{}", name),
            "declared as both required and optional",
        );
    }

    let params = spec
        .required
        .iter()
        .map(|(n, p)| ("required", n, p))
        .chain(spec.optional.iter().map(|(n, p)| ("optional", n, p)));

    for (group, name, param) in params {
        check_param(&format!("inputs.{}.{}", group, name), name, param, report);
    }
}

fn check_param(location: &str, name: &str, param: &ParamSpec, report: &mut ValidationReport) {
    if !SNAKE_CASE.is_match(name) {
        report.error(IssueKind::InvalidFormat, location, format!("'{}' is not snake_case", name));
    }

    let Some(param_type) = param.param_type else {
        report.error(IssueKind::InvalidInputSpec, location, "parameter has no type");
        return;
    };

    if param.description.is_none() {
        report.warn(IssueKind::BestPractice, location, "input is undocumented");
    }

    if let Some(default) = &param.default {
        if !param_type.accepts(default) {
            report.error(
                IssueKind::InvalidInputSpec,
                location,
                format!("default {} does not match type {:?}", default, param_type),
            );
        }
    }

    if let Some(rule) = &param.validation {
        if let Some(pattern) = &rule.pattern {
            if let Err(e) = inputs::compiled(pattern) {
                report.error(IssueKind::InvalidInputSpec, location, format!("invalid pattern: {}", e));
            }
        }
        if let (Some(min), Some(max)) = (rule.min_length, rule.max_length) {
            if min > max {
                report.error(IssueKind::InvalidInputSpec, location, "min_length exceeds max_length");
            }
        }
        if let (Some(min), Some(max)) = (rule.minimum, rule.maximum) {
            if min > max {
                report.error(IssueKind::InvalidInputSpec, location, "minimum exceeds maximum");
            }
        }
    }
}

fn check_security(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let security = &definition.security;

    match security.auth_required {
        None => report.error(
            IssueKind::SecurityInconsistency,
            "security.auth_required",
            "auth_required must be declared",
        ),
        Some(true) if security.secrets_handling.is_none() => report.error(
            IssueKind::SecurityInconsistency,
            "security.secrets_handling",
            "secrets_handling must be declared when auth is required",
        ),
        _ => {}
    }

    let audit = &definition.observability.audit;
    if (audit.log_inputs || audit.log_outputs) && security.pii_fields.is_empty() {
        report.error(
            IssueKind::SecurityInconsistency,
            "security.pii_fields",
            "pii_fields must be declared when audit logging of inputs or outputs is enabled",
        );
    }

    match &security.rate_limit {
        None => report.warn(
            IssueKind::BestPractice,
            "security.rate_limit",
            "no rate limit declared",
        ),
        Some(limit) if limit.max_requests == 0 || limit.per_seconds == 0 => report.error(
            IssueKind::SecurityInconsistency,
            "security.rate_limit",
            "max_requests and per_seconds must be positive",
        ),
        Some(_) => {}
    }

    if security.minimum_role.is_none() {
        report.note("no minimum_role declared");
    }
}

/// Reports duplicate ids, unknown dependencies and cycles.
///
/// Returns the graph when it is sound enough for ancestor queries.
fn check_graph(definition: &WorkflowDefinition, report: &mut ValidationReport) -> Option<DependencyGraph> {
    let mut seen = HashSet::new();
    let mut sound = true;

    for step in &definition.steps {
        if step.id.is_empty() {
            report.error(IssueKind::MissingField, "steps", "step has an empty id");
            sound = false;
            continue;
        }
        if !SNAKE_CASE.is_match(&step.id) {
            report.error(
                IssueKind::InvalidFormat,
                format!("steps.{}", step.id),
                "step id is not snake_case",
            );
        }
        if !seen.insert(step.id.as_str()) {
            report.error(
                IssueKind::DuplicateStepId,
                format!("steps.{}", step.id),
                format!("duplicate step id '{}'", step.id),
            );
            sound = false;
        }
    }

    for step in &definition.steps {
        for dep in step.depends_on.iter().filter(|d| !seen.contains(d.as_str())) {
            report.error(
                IssueKind::UnknownDependency,
                format!("steps.{}.depends_on", step.id),
                format!("unknown step '{}'", dep),
            );
            sound = false;
        }
    }

    if !sound {
        return None;
    }

    let graph = match DependencyGraph::new(&definition.steps) {
        Ok(graph) => graph,
        Err(PlanError::DuplicateStep(_) | PlanError::UnknownDependency { .. }) => return None,
        Err(PlanError::Cyclic(cycle)) => {
            report.error(IssueKind::CyclicDependency, "steps", cycle.to_string());
            return None;
        }
    };

    match graph.plan(definition.execution_config.parallel) {
        Ok(plan) => {
            report.note(format!(
                "{} steps in {} batch(es)",
                plan.len(),
                plan.batches.len()
            ));
            Some(graph)
        }
        Err(cycle) => {
            report.error(IssueKind::CyclicDependency, "steps", cycle.to_string());
            None
        }
    }
}

fn check_step(definition: &WorkflowDefinition, step: &Step, report: &mut ValidationReport) {
    let location = format!("steps.{}", step.id);
    let handling = step.handling();

    match step.operation {
        Operation::Workflow if step.workflow_ref.as_deref().map_or(true, str::is_empty) => {
            report.error(
                IssueKind::InvalidStepConfig,
                &location,
                "workflow step needs a workflow_ref",
            );
        }
        Operation::Workflow => {}
        _ if step.api_endpoint.is_empty() => {
            report.error(IssueKind::InvalidStepConfig, &location, "api_endpoint is required");
        }
        _ => {}
    }

    if step.timeout_ms == Some(0) {
        report.error(IssueKind::InvalidStepConfig, &location, "timeout_ms must be positive");
    }

    match (handling.strategy, &handling.fallback) {
        (Strategy::Fallback, None) => report.error(
            IssueKind::InvalidStepConfig,
            &location,
            "fallback strategy without a fallback step",
        ),
        (Strategy::Fallback, Some(fallback)) if fallback.api_endpoint.is_empty() && fallback.workflow_ref.is_none() => {
            report.error(
                IssueKind::InvalidStepConfig,
                format!("{}.error_handling.fallback", location),
                "fallback step needs an api_endpoint",
            )
        }
        (strategy, Some(_)) if strategy != Strategy::Fallback => report.warn(
            IssueKind::BestPractice,
            &location,
            "fallback step is ignored unless strategy is fallback",
        ),
        _ => {}
    }

    if handling.on_duplicate == DuplicatePolicy::FetchExisting {
        match &handling.fetch_existing {
            None => report.error(
                IssueKind::InvalidStepConfig,
                &location,
                "on_duplicate fetch_existing without a fetch_existing lookup",
            ),
            Some(lookup) if lookup.api_endpoint.is_empty() => report.error(
                IssueKind::InvalidStepConfig,
                format!("{}.error_handling.fetch_existing", location),
                "lookup needs an api_endpoint",
            ),
            Some(lookup) if lookup.outputs.is_empty() && !step.outputs.is_empty() => report.warn(
                IssueKind::BestPractice,
                format!("{}.error_handling.fetch_existing", location),
                "lookup declares no outputs; the step's own output paths will be applied to its result",
            ),
            Some(_) => {}
        }
    }

    if let Some(max) = handling.max_retries.filter(|&m| m > 10) {
        report.warn(
            IssueKind::BestPractice,
            &location,
            format!("max_retries {} is unusually high", max),
        );
    }

    if let Some(rollback) = &step.rollback_operation {
        if rollback.api_endpoint.is_empty() {
            report.error(
                IssueKind::InvalidStepConfig,
                format!("{}.rollback_operation", location),
                "api_endpoint is required",
            );
        }
        if !step.operation.has_side_effects() && step.operation != Operation::Workflow {
            report.warn(
                IssueKind::BestPractice,
                &location,
                "rollback_operation on a step without side effects is never used",
            );
        }
    }

    for (name, path) in &step.outputs {
        if let Err(e) = super::path::JsonPath::parse(path) {
            report.error(
                IssueKind::InvalidStepConfig,
                format!("{}.outputs.{}", location, name),
                e.to_string(),
            );
        }
    }

    if step.operation == Operation::Mutation {
        if step.outputs.is_empty() {
            report.warn(IssueKind::BestPractice, &location, "mutation declares no outputs");
        }
        if step.error_handling.is_none() {
            report.warn(IssueKind::BestPractice, &location, "mutation has no error_handling");
        }
        if definition.execution_config.rollback_supported && step.rollback_operation.is_none() {
            report.warn(
                IssueKind::BestPractice,
                &location,
                "rollback is supported but this mutation has no rollback_operation",
            );
        }
    }
}

/// Step ids a template may reference from a given place.
enum Scope<'a> {
    /// Any declared step (post-conditions)
    AnyStep,
    /// Only these steps
    Steps(&'a HashSet<String>),
    /// Graph unavailable; only existence is checked
    Unchecked,
}

fn check_templates(
    definition: &WorkflowDefinition,
    location: &str,
    value: &Value,
    scope: &Scope<'_>,
    report: &mut ValidationReport,
) {
    let references = match template::references(value) {
        Ok(references) => references,
        Err(e) => {
            report.error(IssueKind::TemplateSyntax, location, e.to_string());
            return;
        }
    };

    for reference in references {
        match &reference {
            Reference::Input { name, .. } if !definition.declares_input(name) => {
                report.error(
                    IssueKind::UnresolvedReference,
                    location,
                    format!("'{}' refers to an undeclared input", reference),
                );
            }
            Reference::StepOutput { step, name, .. } => {
                let Some(target) = definition.get_step(step) else {
                    report.error(
                        IssueKind::UnresolvedReference,
                        location,
                        format!("'{}' refers to unknown step '{}'", reference, step),
                    );
                    continue;
                };

                if let Scope::Steps(allowed) = scope {
                    if !allowed.contains(step) {
                        report.error(
                            IssueKind::UnresolvedReference,
                            location,
                            format!("'{}' refers to step '{}' which is not a dependency", reference, step),
                        );
                        continue;
                    }
                }

                if !declared_outputs(target).contains(name.as_str()) {
                    report.error(
                        IssueKind::UnresolvedReference,
                        location,
                        format!("step '{}' declares no output '{}'", step, name),
                    );
                }
            }
            _ => {}
        }
    }
}

fn declared_outputs(step: &Step) -> HashSet<&str> {
    let mut names: HashSet<&str> = step.outputs.keys().map(String::as_str).collect();
    if let Some(fallback) = step.error_handling.as_ref().and_then(|h| h.fallback.as_ref()) {
        names.extend(fallback.outputs.keys().map(String::as_str));
    }
    if let Some(lookup) = step.error_handling.as_ref().and_then(|h| h.fetch_existing.as_ref()) {
        names.extend(lookup.outputs.keys().map(String::as_str));
    }
    names
}

fn check_step_templates(
    definition: &WorkflowDefinition,
    step: &Step,
    graph: Option<&DependencyGraph>,
    report: &mut ValidationReport,
) {
    let location = format!("steps.{}", step.id);
    let ancestors = graph.map(|g| g.ancestors(&step.id));
    let with_self = ancestors.as_ref().map(|a| {
        let mut set = a.clone();
        set.insert(step.id.clone());
        set
    });

    let scope = match &ancestors {
        Some(set) => Scope::Steps(set),
        None => Scope::Unchecked,
    };

    check_templates(
        definition,
        &format!("{}.inputs", location),
        &Value::Object(step.inputs.clone()),
        &scope,
        report,
    );

    let handling = step.handling();
    if let Some(lookup) = &handling.fetch_existing {
        check_templates(
            definition,
            &format!("{}.error_handling.fetch_existing", location),
            &Value::Object(lookup.inputs.clone()),
            &scope,
            report,
        );
    }
    if let Some(fallback) = &handling.fallback {
        let fallback_location = format!("{}.error_handling.fallback", location);
        check_templates(
            definition,
            &fallback_location,
            &Value::Object(fallback.inputs.clone()),
            &scope,
            report,
        );
        check_secrets(&fallback_location, &Value::Object(fallback.inputs.clone()), report);
    }

    let rollback_scope = match &with_self {
        Some(set) => Scope::Steps(set),
        None => Scope::Unchecked,
    };
    let inverses = step
        .rollback_operation
        .iter()
        .map(|r| (r, "rollback_operation"))
        .chain(
            handling
                .fallback
                .as_ref()
                .and_then(|f| f.rollback_operation.as_ref())
                .map(|r| (r, "error_handling.fallback.rollback_operation")),
        );
    for (rollback, field) in inverses {
        let rollback_location = format!("{}.{}", location, field);
        check_templates(
            definition,
            &rollback_location,
            &Value::Object(rollback.inputs.clone()),
            &rollback_scope,
            report,
        );
        check_secrets(&rollback_location, &Value::Object(rollback.inputs.clone()), report);
    }
}

fn check_conditions(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let rules = &definition.validation;
    let no_steps = HashSet::new();
    let mut ids: BTreeMap<&str, usize> = BTreeMap::new();

    let all = rules
        .pre_conditions
        .iter()
        .map(|c| ("pre_conditions", c))
        .chain(rules.post_conditions.iter().map(|c| ("post_conditions", c)));

    for (group, condition) in all {
        let location = format!("validation.{}.{}", group, condition.id);
        *ids.entry(condition.id.as_str()).or_default() += 1;

        if condition.id.is_empty() {
            report.error(IssueKind::InvalidCondition, format!("validation.{}", group), "condition has no id");
        }
        if let Err(e) = Check::parse(&condition.check) {
            report.error(IssueKind::InvalidCondition, &location, e.to_string());
        }

        let pre = group == "pre_conditions";
        check_condition_target(definition, condition, pre, &location, report);

        if let Some(query) = &condition.query {
            if query.api_endpoint.is_empty() {
                report.error(IssueKind::InvalidCondition, &location, "query needs an api_endpoint");
            }
            let scope = if pre { Scope::Steps(&no_steps) } else { Scope::AnyStep };
            check_templates(
                definition,
                &format!("{}.query", location),
                &Value::Object(query.inputs.clone()),
                &scope,
                report,
            );
        }
    }

    for (id, count) in ids {
        if count > 1 && !id.is_empty() {
            report.error(
                IssueKind::InvalidCondition,
                "validation",
                format!("duplicate condition id '{}'", id),
            );
        }
    }
}

fn check_condition_target(
    definition: &WorkflowDefinition,
    condition: &Condition,
    pre: bool,
    location: &str,
    report: &mut ValidationReport,
) {
    match (&condition.after_step, pre) {
        (Some(_), true) => report.error(
            IssueKind::InvalidCondition,
            location,
            "pre-conditions cannot name an after_step",
        ),
        (Some(step), false) if definition.get_step(step).is_none() => report.error(
            IssueKind::InvalidCondition,
            location,
            format!("after_step '{}' is not a step", step),
        ),
        _ => {}
    }
}

fn check_execution_config(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let config = &definition.execution_config;
    let policy = &config.retry_policy;

    if policy.multiplier < 1.0 {
        report.error(
            IssueKind::InvalidFormat,
            "execution_config.retry_policy.multiplier",
            "multiplier must be at least 1.0",
        );
    }
    if policy.initial_backoff_ms > policy.max_backoff_ms {
        report.warn(
            IssueKind::BestPractice,
            "execution_config.retry_policy",
            "initial_backoff_ms exceeds max_backoff_ms",
        );
    }
    if config.timeout_seconds == Some(0) {
        report.error(
            IssueKind::InvalidFormat,
            "execution_config.timeout_seconds",
            "timeout must be positive",
        );
    }
    if config.max_parallel == Some(0) {
        report.error(
            IssueKind::InvalidFormat,
            "execution_config.max_parallel",
            "max_parallel must be positive",
        );
    }
    if !config.dry_run_supported {
        report.note("dry run is not declared as supported");
    }
    if !config.parallel && definition.root_steps().len() > 1 {
        report.note("several root steps could run in parallel");
    }
}

/// Flags literal values stored under secret-looking keys.
fn check_secrets(location: &str, value: &Value, report: &mut ValidationReport) {
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                let lowered = key.to_lowercase();
                let secret_key = SECRET_MARKERS.iter().any(|m| lowered.contains(m));
                match item {
                    Value::String(s) if secret_key && !s.is_empty() && !s.contains("{{") => {
                        report.error(
                            IssueKind::HardcodedSecret,
                            format!("{}.{}", location, key),
                            "secret-like key holds a literal value; use a template reference",
                        );
                    }
                    nested => check_secrets(&format!("{}.{}", location, key), nested, report),
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_secrets(&format!("{}[{}]", location, i), item, report);
            }
        }
        _ => {}
    }
}
