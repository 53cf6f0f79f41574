use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wslctl")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative, idempotent configuration of WSL distributions", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Make every distribution match the manifest
    Apply(ApplyArgs),

    /// Show what apply would change, without changing anything
    Plan(PlanArgs),

    /// List registered distributions
    List,

    /// Check whether a path exists inside a distribution
    Exists {
        /// Distribution name
        distribution: String,
        /// Absolute path inside the distribution
        path: String,
    },

    /// Read a file from a distribution
    Slurp {
        /// Distribution name
        distribution: String,
        /// Absolute path inside the distribution
        path: String,
        /// Write the decoded content to stdout instead of a summary
        #[arg(long)]
        raw: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Shared arguments
// ============================================================================

#[derive(Args, Clone)]
pub struct ManifestArgs {
    /// Manifest file (TOML or JSON); defaults to ~/.config/wslctl/manifest.toml
    #[arg(short, long, env = "WSLCTL_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Only entities in this distribution
    #[arg(short, long)]
    pub distribution: Option<String>,

    /// Parallel distributions (default: 4 or the manifest's `jobs`)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Preview changes without applying (same as `plan`)
    #[arg(long)]
    pub dry_run: bool,

    /// Stop at the first distribution group that fails
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Show content diffs for files
    #[arg(long)]
    pub diff: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_flags() {
        let cli = Cli::parse_from([
            "wslctl", "-vv", "apply", "--dry-run", "-j", "2", "-m", "site.toml",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Apply(args) => {
                assert!(args.dry_run);
                assert_eq!(args.manifest.jobs, Some(2));
                assert_eq!(args.manifest.manifest, Some(PathBuf::from("site.toml")));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_json_flag_is_global() {
        let cli = Cli::parse_from(["wslctl", "list", "--json"]);
        assert!(cli.json);
    }
}
