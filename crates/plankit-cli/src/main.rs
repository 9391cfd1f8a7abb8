mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::backup::BackupSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "plankit",
    about = "Upgrade, back up, and migrate an installed plankit toolkit",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .plankit/ or .git/)
    #[arg(long, global = true, env = "PLANKIT_ROOT")]
    root: Option<PathBuf>,

    /// Package registry base URL (default: config.yaml upgrade.registry, then npm)
    #[arg(long, global = true, env = "PLANKIT_REGISTRY_URL")]
    registry: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log stage transitions and source probes
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the installed version and the newest available one
    Status,

    /// Upgrade the installation to the newest available version
    Upgrade {
        /// Registry package (`name` or `name@1.2.3`) or a local toolkit directory
        #[arg(long)]
        source: Option<String>,

        /// Show what would change without touching anything
        #[arg(long)]
        dry_run: bool,

        /// Apply without asking for confirmation
        #[arg(long, short = 'y')]
        force: bool,

        /// Do not install helper-script dependencies after upgrading
        #[arg(long)]
        skip_deps: bool,
    },

    /// Manage installation backups
    Backup {
        #[command(subcommand)]
        subcommand: BackupSubcommand,
    },

    /// List migrations that apply between two versions
    Migrations {
        /// Starting version (exclusive; default: installed version)
        #[arg(long)]
        from: Option<String>,

        /// Target version (inclusive; default: newest registered)
        #[arg(long)]
        to: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Status => cmd::status::run(&root, cli.registry, cli.json),
        Commands::Upgrade {
            source,
            dry_run,
            force,
            skip_deps,
        } => cmd::upgrade::run(
            &root,
            cli.registry,
            cmd::upgrade::UpgradeArgs {
                source,
                dry_run,
                force,
                skip_deps,
            },
            cli.json,
        ),
        Commands::Backup { subcommand } => cmd::backup::run(&root, subcommand, cli.json),
        Commands::Migrations { from, to } => {
            cmd::migrations::run(&root, from.as_deref(), to.as_deref(), cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
