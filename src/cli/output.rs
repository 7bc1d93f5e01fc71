//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; JSON output is the serde form of the
//! underlying value.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{Manifest, ValidationResult};
use crate::engine::{DriftKind, DriftReport};
use crate::graph::ResourceGraph;
use crate::planner::{ApplyReport, ChangeAction, Plan, PlannedStep, StepStatus};
use crate::state::{StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Time")]
    duration: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Serial")]
    serial: u64,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan {}", plan.id.dimmed());
        if !plan.config_hash.is_empty() {
            let _ = writeln!(output, "   Config hash: {}", short(&plan.config_hash, 12));
        }
        let _ = writeln!(output, "   State serial: {}\n", plan.state_serial);

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.action != ChangeAction::NoOp)
            .map(|(i, s)| PlanStepRow {
                index: i,
                action: Self::format_action(s),
                resource: s.address.to_string(),
                after: s
                    .wait_for
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for (i, step) in plan.steps.iter().enumerate() {
                if step.changes.is_empty() || step.action == ChangeAction::Delete {
                    continue;
                }
                let _ = writeln!(output, "\n  {i}. {}", step.address.to_string().bold());
                for change in &step.changes {
                    let _ = writeln!(output, "       {change}");
                }
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().magenta(),
            plan.delete_count().to_string().red()
        );

        output
    }

    fn format_action(step: &PlannedStep) -> String {
        match (step.action, step.replace) {
            (ChangeAction::Create, false) => "+create".green().to_string(),
            (ChangeAction::Create, true) => "+create (replace)".magenta().to_string(),
            (ChangeAction::Update, _) => "~update".yellow().to_string(),
            (ChangeAction::Delete, false) => "-delete".red().to_string(),
            (ChangeAction::Delete, true) => "-delete (replace)".magenta().to_string(),
            (ChangeAction::NoOp, _) => "no-op".dimmed().to_string(),
        }
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.action != ChangeAction::NoOp || o.status != StepStatus::Applied)
            .map(|o| OutcomeRow {
                resource: o.address.to_string(),
                action: o.action.to_string(),
                status: Self::format_status(&o.status),
                id: o.id.as_deref().map(|id| short(id, 16)).unwrap_or_default(),
                duration: format!("{}ms", o.duration_ms),
            })
            .collect();

        let mut output = String::new();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let headline = if report.is_complete() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply partially failed", "✗".red())
        };
        let _ = writeln!(output, "\n{headline}: {report}");

        output
    }

    fn format_status(status: &StepStatus) -> String {
        match status {
            StepStatus::Applied => "applied".green().to_string(),
            StepStatus::Failed { error } => format!("{} {}", "failed:".red(), truncate(error, 60)),
            StepStatus::Skipped { cause } => format!("{} ({cause})", "skipped".yellow()),
            StepStatus::Cancelled => "cancelled".dimmed().to_string(),
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resources in sync.\n",
                        "✓".green(),
                        report.entries.len()
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in report.drifted() {
                    match &entry.kind {
                        DriftKind::Changed { changes } => {
                            let _ = writeln!(output, "   {} {}", "~".yellow(), entry.address);
                            for change in changes {
                                let _ = writeln!(output, "       {change}");
                            }
                        }
                        DriftKind::Missing => {
                            let _ = writeln!(output, "   {} {} (deleted outside provisio)", "-".red(), entry.address);
                        }
                        DriftKind::Error { message } => {
                            let _ = writeln!(output, "   {} {}: {message}", "!".red(), entry.address);
                        }
                        DriftKind::InSync => {}
                    }
                }

                if !report.dry_run {
                    output.push_str("\nState updated.\n");
                }
                output
            }
        }
    }

    /// Formats a resource graph in dependency order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        #[derive(Serialize)]
        struct NodeJson<'a> {
            address: String,
            provider: &'a str,
            dependencies: Vec<String>,
        }

        let dependencies = |deps: &std::collections::BTreeSet<crate::graph::ResourceAddress>| {
            deps.iter().map(ToString::to_string).collect::<Vec<_>>()
        };

        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<NodeJson<'_>> = graph
                    .in_dependency_order()
                    .map(|n| NodeJson {
                        address: n.address.to_string(),
                        provider: &n.provider,
                        dependencies: dependencies(&n.dependencies),
                    })
                    .collect();
                Self::json(&nodes)
            }
            OutputFormat::Text => {
                let rows: Vec<NodeRow> = graph
                    .in_dependency_order()
                    .enumerate()
                    .map(|(i, n)| NodeRow {
                        index: i,
                        resource: n.address.to_string(),
                        provider: n.provider.clone(),
                        dependencies: dependencies(&n.dependencies).join(", "),
                    })
                    .collect();
                format!("{}\n{} resources\n", Table::new(rows), graph.len())
            }
        }
    }

    /// Formats the recorded resources.
    #[must_use]
    pub fn format_state_list(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(snapshot),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState {} (serial {})", short(&snapshot.lineage, 8), snapshot.serial);
                let _ = writeln!(output, "   Last updated: {}\n", snapshot.last_updated);

                if snapshot.is_empty() {
                    output.push_str("   No resources recorded.\n");
                } else {
                    let rows: Vec<RecordRow> = snapshot
                        .records
                        .values()
                        .map(|r| RecordRow {
                            address: r.address.to_string(),
                            provider: r.provider.clone(),
                            id: short(&r.id, 20),
                            serial: r.serial,
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats one record.
    #[must_use]
    pub fn format_record(&self, record: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => Self::json(record),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{}", record.address.to_string().bold());
                let _ = writeln!(output, "   id:       {}", record.id);
                let _ = writeln!(output, "   provider: {}", record.provider);
                let _ = writeln!(output, "   serial:   {}", record.serial);
                let _ = writeln!(output, "   created:  {}", record.created_at);
                let _ = writeln!(output, "   updated:  {}", record.updated_at);

                for (title, values) in [("attributes", &record.attributes), ("outputs", &record.outputs)] {
                    if values.is_empty() {
                        continue;
                    }
                    let _ = writeln!(output, "   {title}:");
                    for (key, value) in values {
                        let _ = writeln!(output, "     {key} = {value}");
                    }
                }

                if !record.dependencies.is_empty() {
                    let deps: Vec<String> = record.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   depends on: {}", deps.join(", "));
                }

                output
            }
        }
    }

    /// Formats validation results.
    #[must_use]
    pub fn format_validation(&self, manifest: &Manifest, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "resources": manifest.instance_count(),
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration has {} errors:", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", manifest.project.name);
                let _ = writeln!(output, "   Environment: {}", manifest.project.environment);
                let _ = writeln!(output, "   State backend: {:?}", manifest.state.backend);
                let _ = writeln!(output, "   Resources: {}", manifest.instance_count());
                output
            }
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red(), message)
    }

    fn message(&self, status: &str, icon: &colored::ColoredString, message: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{icon} {message}"),
        }
    }
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn short(s: &str, len: usize) -> String {
    s.chars().take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::provider::ProviderRegistry;
    use serde_json::json;

    fn sample_plan() -> Plan {
        let resources = vec![
            ResourceConfig::new("null_resource", "a"),
            ResourceConfig::new("null_resource", "b").with_attribute("a", json!("${null_resource.a.id}")),
        ];
        let registry = ProviderRegistry::with_builtin();
        let graph = GraphBuilder::new().build(&resources).unwrap();
        let snapshot = StateSnapshot::new();
        let set = DiffEngine::new(&registry).compute_diff(&graph, &snapshot).unwrap();
        Plan::from_change_set(&set, "abcdef0123456789", &snapshot, false).unwrap()
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer message", 10), "a much ...");
    }

    #[test]
    fn test_plan_text_lists_steps() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&sample_plan(), true);
        assert!(text.contains("null_resource.a"));
        assert!(text.contains("(known after apply)"));
        assert!(text.contains("2 to create"));
    }

    #[test]
    fn test_plan_json_round_trips() {
        let plan = sample_plan();
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let parsed: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn test_empty_state_list() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_state_list(&StateSnapshot::new());
        assert!(text.contains("No resources recorded"));
    }
}
