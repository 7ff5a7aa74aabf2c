use crate::cli::OutputFormat;
use progflow_core::analytics::{TraceEvent, TraceEventKind};
use progflow_core::programs::{Program, RunResult, StepStatus, ValidationIssue};

pub struct Renderer {
    output_format: OutputFormat,
}

impl Renderer {
    pub fn new(output_format: OutputFormat) -> Self {
        Self { output_format }
    }

    pub fn render_event(&self, event: &TraceEvent) {
        match self.output_format {
            OutputFormat::Text => println!("{}", Self::event_line(event)),
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(event).unwrap_or_default())
            }
        }
    }

    fn event_line(event: &TraceEvent) -> String {
        let step = event
            .step_id
            .as_deref()
            .map(|step_id| match event.attempt {
                Some(attempt) => format!(" {step_id}#{attempt}"),
                None => format!(" {step_id}"),
            })
            .unwrap_or_default();
        let detail = match &event.kind {
            TraceEventKind::RunStarted {
                program_id,
                version,
                strategy,
            } => format!("{program_id} v{version} ({strategy})"),
            TraceEventKind::ConditionEvaluated {
                expression,
                result,
                error,
                ..
            } => match (result, error) {
                (_, Some(error)) => format!("{expression} -> error: {error}"),
                (Some(result), None) => format!("{expression} -> {result}"),
                (None, None) => expression.clone(),
            },
            TraceEventKind::HandlerInvoked { handler } => handler.clone(),
            TraceEventKind::HandlerReturned {
                handler,
                duration_ms,
            } => format!("{handler} in {duration_ms}ms"),
            TraceEventKind::HandlerError { handler, message } => format!("{handler}: {message}"),
            TraceEventKind::StepRetried {
                error,
                next_delay_ms,
            } => format!("{} ({}), retrying in {next_delay_ms}ms", error.message, error.kind),
            TraceEventKind::StepCompleted {
                branch,
                duration_ms,
            } => format!("branch={branch} in {duration_ms}ms"),
            TraceEventKind::StepSkipped { branch, reason } => match reason {
                Some(reason) => format!("branch={branch}: {reason}"),
                None => format!("branch={branch}"),
            },
            TraceEventKind::StepFailed { branch, error, .. } => {
                format!("branch={branch} {}: {}", error.kind, error.message)
            }
            TraceEventKind::RunCompleted {
                status,
                failure_reason,
                elapsed_ms,
            } => match failure_reason {
                Some(reason) => format!("{status:?} in {elapsed_ms}ms: {reason}"),
                None => format!("{status:?} in {elapsed_ms}ms"),
            },
            TraceEventKind::StepStarted | TraceEventKind::RunCancelled => String::new(),
        };
        format!(
            "[{:>4}] {}{step} {detail}",
            event.sequence,
            event.kind.name()
        )
        .trim_end()
        .to_owned()
    }

    pub fn render_result(&self, result: &RunResult) {
        if self.output_format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
            return;
        }

        println!(
            "Run {} of {} v{}: {:?} in {}ms",
            result.run_id, result.program_id, result.version, result.status, result.elapsed_ms
        );
        if let Some(reason) = &result.failure_reason {
            println!("  reason: {reason}");
        }
        for step in &result.steps {
            let marker = match step.status {
                StepStatus::Completed => "ok",
                StepStatus::Skipped => "--",
                StepStatus::Failed | StepStatus::Retried => "!!",
            };
            print!(
                "  [{marker}] {} ({}, branch={}, attempts={})",
                step.step_id,
                step.status.as_str(),
                step.trigger.branch,
                step.attempts
            );
            match &step.error {
                Some(error) => println!(" {}: {}", error.kind, error.message),
                None => println!(),
            }
        }
    }

    /// Returns whether the program has any blocking issue.
    pub fn render_issues(&self, program: &Program, issues: &[ValidationIssue]) -> bool {
        let blocking = issues.iter().any(ValidationIssue::blocks_execution);
        match self.output_format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "program_id": program.id,
                    "version": program.version,
                    "valid": !blocking,
                    "issues": issues,
                });
                println!("{}", serde_json::to_string(&output).unwrap_or_default());
            }
            OutputFormat::Text => {
                let verdict = if blocking { "INVALID" } else { "OK" };
                println!("{} v{}: {verdict}", program.id, program.version);
                for issue in issues {
                    println!("  {:?} {issue}", issue.severity);
                }
            }
        }
        blocking
    }
}
