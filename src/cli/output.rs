//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::model::State;
use crate::planner::{DiffKind, DiffResult};
use crate::reconciler::CycleReport;
use crate::state::{HistoryRow, Lifecycle, WriteSummary};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Diff row for table display.
#[derive(Tabled)]
struct DiffRow {
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Deployment")]
    deployment: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Instances")]
    instances: String,
}

/// Deployment row for table display.
#[derive(Tabled)]
struct DeploymentRow {
    #[tabled(rename = "Deployment")]
    deployment: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Instances")]
    instances: u32,
    #[tabled(rename = "CPUs")]
    cpus: String,
    #[tabled(rename = "Memory")]
    memory: String,
}

/// History row for table display.
#[derive(Tabled)]
struct HistoryTableRow {
    #[tabled(rename = "Rev")]
    revision: i64,
    #[tabled(rename = "Lifecycle")]
    lifecycle: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Instances")]
    instances: u32,
    #[tabled(rename = "Written by")]
    written_by: String,
    #[tabled(rename = "At")]
    written_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a set of diffs.
    #[must_use]
    pub fn format_diffs(&self, diffs: &DiffResult, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(diffs)),
            OutputFormat::Text => Self::format_diffs_text(diffs, detailed),
        }
    }

    fn format_diffs_text(diffs: &DiffResult, detailed: bool) -> String {
        if !diffs.has_changes() {
            return format!(
                "{} No changes required, {} deployments converged.\n",
                "✓".green(),
                diffs.same
            );
        }

        let mut output = String::from("\nPlan\n\n");
        let rows: Vec<DiffRow> = diffs
            .actionable_diffs()
            .into_iter()
            .map(|d| {
                let subject = d.subject();
                let (version, instances) = match (d.prior(), d.post()) {
                    (Some(prior), Some(post)) => (
                        transition(&prior.source_id.version, &post.source_id.version),
                        transition(&prior.num_instances, &post.num_instances),
                    ),
                    _ => (
                        subject.source_id.version.to_string(),
                        subject.num_instances.to_string(),
                    ),
                };
                DiffRow {
                    change: Self::format_kind(d.kind()),
                    deployment: d.id.to_string(),
                    version,
                    instances,
                }
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanged fields:\n");
            for d in diffs.actionable_diffs() {
                let fields = d.changed_fields();
                if !fields.is_empty() {
                    let _ = writeln!(output, "   {}: {}", d.id, fields.join(", "));
                }
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged",
            diffs.added.to_string().green(),
            diffs.modified.to_string().yellow(),
            diffs.removed.to_string().red(),
            diffs.same
        );
        output
    }

    /// Formats a cycle report.
    #[must_use]
    pub fn format_report(&self, report: &CycleReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                if let Some(error) = &report.read_error {
                    let _ = writeln!(output, "   Could not read state: {error}");
                    return output;
                }

                let _ = writeln!(output, "   Desired: {}", report.desired);
                let _ = writeln!(output, "   Running: {}", report.observed);
                let _ = writeln!(output, "   Created: {}", report.created);
                let _ = writeln!(output, "   Updated: {}", report.updated);
                let _ = writeln!(output, "   Deleted: {}", report.deleted);
                let _ = writeln!(output, "   Unchanged: {}", report.unchanged);
                if report.superseded > 0 {
                    let _ = writeln!(output, "   Superseded: {}", report.superseded);
                }
                if report.out_of_scope > 0 {
                    let _ = writeln!(output, "   Out of scope: {}", report.out_of_scope);
                }
                let _ = writeln!(
                    output,
                    "   Took: {}ms",
                    report.duration().num_milliseconds()
                );

                if !report.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &report.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                output
            }
        }
    }

    /// Formats the desired state.
    #[must_use]
    pub fn format_state(&self, state: &State) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::from("\nClusters\n\n");
                for cluster in state.defs.clusters.values() {
                    let _ = writeln!(
                        output,
                        "   {} ({}) {}",
                        cluster.name.bold(),
                        cluster.kind,
                        cluster.base_url
                    );
                }

                output.push_str("\nDeployments\n\n");
                if state.deployments.is_empty() {
                    output.push_str("   No deployments desired.\n");
                    return output;
                }

                let rows: Vec<DeploymentRow> = state
                    .deployments
                    .iter()
                    .map(|(id, d)| DeploymentRow {
                        deployment: id.to_string(),
                        version: d.source_id.version.to_string(),
                        kind: d.kind.to_string(),
                        instances: d.num_instances,
                        cpus: d.resources.get(crate::model::CPUS).unwrap_or("-").to_string(),
                        memory: d.resources.get(crate::model::MEMORY).unwrap_or("-").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats the history of one deployment.
    #[must_use]
    pub fn format_history(&self, rows: &[HistoryRow]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&rows),
            OutputFormat::Text => {
                if rows.is_empty() {
                    return String::from("No history recorded.\n");
                }
                let rows: Vec<HistoryTableRow> = rows
                    .iter()
                    .map(|row| HistoryTableRow {
                        revision: row.revision,
                        lifecycle: match row.lifecycle {
                            Lifecycle::Active => "active".green().to_string(),
                            Lifecycle::Decommissioned => "decommissioned".red().to_string(),
                        },
                        version: row.deployment.source_id.version.to_string(),
                        instances: row.deployment.num_instances,
                        written_by: row.written_by.clone(),
                        written_at: row.written_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats the result of a state write.
    #[must_use]
    pub fn format_write(&self, summary: &WriteSummary, dry_run: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(summary),
            OutputFormat::Text => {
                let verb = if dry_run { "Would write" } else { "Wrote" };
                format!(
                    "{} {verb}: {} updated, {} decommissioned, {} unchanged\n",
                    "✓".green(),
                    summary.updated,
                    summary.decommissioned,
                    summary.unchanged
                )
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: result.warnings.clone(),
            }),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Manifest is valid.\n", "✓".green())
                } else {
                    let mut output =
                        format!("{} {} errors found:\n", "✗".red(), result.error_count());
                    for issue in &result.errors {
                        let _ = writeln!(output, "   - {issue}");
                    }
                    output
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a diff kind with color.
    fn format_kind(kind: DiffKind) -> String {
        match kind {
            DiffKind::Added => "+create".green().to_string(),
            DiffKind::Modified => "~update".yellow().to_string(),
            DiffKind::Removed => "-delete".red().to_string(),
            DiffKind::Same => "same".dimmed().to_string(),
        }
    }
}

fn transition<T: PartialEq + std::fmt::Display>(prior: &T, post: &T) -> String {
    if prior == post {
        post.to_string()
    } else {
        format!("{prior} -> {post}")
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    added: usize,
    modified: usize,
    removed: usize,
    same: usize,
    diffs: Vec<DiffJson>,
}

#[derive(Serialize)]
struct DiffJson {
    id: String,
    kind: String,
    changed_fields: Vec<&'static str>,
}

#[derive(Serialize)]
struct ValidationJson {
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl From<&DiffResult> for PlanJson {
    fn from(diffs: &DiffResult) -> Self {
        Self {
            added: diffs.added,
            modified: diffs.modified,
            removed: diffs.removed,
            same: diffs.same,
            diffs: diffs
                .actionable_diffs()
                .into_iter()
                .map(|d| DiffJson {
                    id: d.id.to_string(),
                    kind: d.kind().to_string(),
                    changed_fields: d.changed_fields(),
                })
                .collect(),
        }
    }
}
