//! Clap derive structures for the `dplink` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// dplink: inspect device profiles and manage local device configuration
#[derive(Debug, Parser)]
#[command(
    name = "dplink",
    version,
    about = "Inspect datapoint device profiles and manage local device config",
    long_about = "Tools for locally controlled datapoint-protocol devices.\n\n\
        Validates and lists the profile catalog, ranks profiles against a\n\
        captured datapoint bag, and manages per-device local keys.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Directory of profile YAML files (overrides config)
    #[arg(long, env = "DPLINK_PROFILES_DIR", global = true)]
    pub profiles_dir: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "DPLINK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Skip confirmation prompts
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect the profile catalog
    #[command(alias = "p")]
    Profiles(ProfilesArgs),

    /// Rank profiles against a captured datapoint bag
    Detect(DetectArgs),

    /// Manage CLI configuration and local keys
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Profiles ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ProfilesArgs {
    #[command(subcommand)]
    pub command: ProfilesCommand,
}

#[derive(Debug, Subcommand)]
pub enum ProfilesCommand {
    /// List every profile in the catalog
    #[command(alias = "ls")]
    List,

    /// Show one profile with its entities and datapoints
    Show {
        /// Profile config id (file stem)
        config_id: String,
    },

    /// Parse profiles and report the first error
    Validate {
        /// Files to check instead of the whole catalog directory
        files: Vec<PathBuf>,
    },
}

// ── Detect ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DetectArgs {
    /// JSON file holding a dps object or a `{"dps": {...}}` reply; `-` reads stdin
    pub input: PathBuf,

    /// Show only the best match
    #[arg(long)]
    pub best: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the effective configuration (local keys redacted)
    Show,

    /// Store a device's local key
    SetKey {
        /// Device name from the config
        device: String,

        /// Read the key from stdin instead of prompting
        #[arg(long)]
        stdin: bool,

        /// Write the key into the config file instead of the system keyring
        #[arg(long)]
        plaintext: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
