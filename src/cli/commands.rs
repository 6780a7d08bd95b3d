//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::model::{DeploymentId, ResolveFilter, SourceLocation};

/// Converge - continuous reconciliation of declared deployments.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the service configuration file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile continuously until interrupted.
    Run {
        /// Seconds between cycle starts, overriding the configuration.
        #[arg(long)]
        interval: Option<u64>,

        /// Scope of the reconciliation.
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Run a single reconciliation cycle.
    Rectify {
        /// Scope of the reconciliation.
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Show the differences between desired and running state.
    Plan {
        /// Show which fields changed.
        #[arg(short, long)]
        detailed: bool,

        /// Scope of the plan.
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Replace the desired state with the contents of a manifest file.
    Update {
        /// Manifest file to write.
        manifest: PathBuf,

        /// Show what would be written without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the revision history of one deployment.
    History {
        /// Cluster name.
        cluster: String,

        /// Source repository.
        repo: String,

        /// Directory within the repository.
        #[arg(long, default_value = "")]
        dir: String,

        /// Flavor.
        #[arg(long, default_value = "")]
        flavor: String,
    },

    /// Validate a manifest file.
    Validate {
        /// Manifest file to check.
        manifest: PathBuf,

        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Inspect the desired-state store.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the current desired state.
    Show,

    /// Print the current desired state as a manifest file.
    Export,
}

/// Scope filter arguments.
#[derive(Args, Debug, Clone, Default)]
pub struct ScopeArgs {
    /// Only this cluster.
    #[arg(long)]
    pub cluster: Option<String>,

    /// Only this repository.
    #[arg(long)]
    pub repo: Option<String>,

    /// Only this directory.
    #[arg(long)]
    pub dir: Option<String>,

    /// Only this flavor.
    #[arg(long)]
    pub flavor: Option<String>,

    /// Only this version.
    #[arg(long)]
    pub tag: Option<String>,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl ScopeArgs {
    /// Narrows `base` with every argument given on the command line.
    #[must_use]
    pub fn apply(self, base: ResolveFilter) -> ResolveFilter {
        ResolveFilter {
            cluster: self.cluster.or(base.cluster),
            repo: self.repo.or(base.repo),
            dir: self.dir.or(base.dir),
            flavor: self.flavor.or(base.flavor),
            tag: self.tag.or(base.tag),
        }
    }
}

impl Commands {
    /// The deployment a `history` command refers to.
    #[must_use]
    pub fn history_id(&self) -> Option<DeploymentId> {
        match self {
            Self::History {
                cluster,
                repo,
                dir,
                flavor,
            } => Some(DeploymentId::new(
                cluster.clone(),
                SourceLocation::new(repo.clone(), dir.clone()),
                flavor.clone(),
            )),
            _ => None,
        }
    }
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_history() {
        let cli = Cli::try_parse_from([
            "converge",
            "history",
            "east",
            "github.com/acme/web",
            "--flavor",
            "canary",
        ])
        .unwrap();
        let id = cli.command.history_id().unwrap();
        assert_eq!(id.to_string(), "east:github.com/acme/web~canary");
    }

    #[test]
    fn test_scope_args_override_configured_scope() {
        let cli = Cli::try_parse_from([
            "converge", "--output", "json", "rectify", "--cluster", "west",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);

        let Commands::Rectify { scope } = cli.command else {
            panic!("expected rectify");
        };
        let base = ResolveFilter::all().with_cluster("east").with_repo("github.com/acme/web");
        let filter = scope.apply(base);
        assert_eq!(filter.cluster.as_deref(), Some("west"));
        assert_eq!(filter.repo.as_deref(), Some("github.com/acme/web"));
    }
}
