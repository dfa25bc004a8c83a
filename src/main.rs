mod colors;
mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use pourover::{ApiClient, Config, IndexKind};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pour")]
#[command(author, version, about = "Pour and relocate Homebrew bottles", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the bottle tag of this machine
    Tag,

    /// Show the ELF metadata of a binary
    Elf {
        file: PathBuf,

        /// Also resolve needed libraries with ldd
        #[arg(long)]
        resolve: bool,
    },

    /// Move every reference to OLD inside a keg to NEW
    Relocate {
        keg: PathBuf,
        old: String,
        new: String,
    },

    /// Replace install locations in a keg with bottle placeholders
    BottlePrep { keg: PathBuf },

    /// Unpack a local bottle into the cellar and relocate it
    Pour {
        bottle: PathBuf,
        name: String,
        version: String,

        /// Cellar the bottle was built for (`:any`, `:any_skip_relocation` or a path)
        #[arg(long, default_value = ":any")]
        cellar: String,
    },

    /// Download and pour the bottle of a formula
    Install { name: String },

    /// Refresh the formula and/or cask index
    Update {
        /// `formula` or `cask` (both if omitted)
        kind: Option<IndexKind>,

        /// Discard cached manifests and name files first
        #[arg(long)]
        force: bool,
    },

    /// Show information about a formula or cask
    Info {
        name: String,

        /// Look the name up as a cask
        #[arg(long)]
        cask: bool,
    },

    /// Generate shell completions
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    colors::init_colors();

    let config = Config::from_env();

    match cli.command {
        Commands::Tag => commands::tag()?,
        Commands::Elf { file, resolve } => commands::elf(&file, resolve)?,
        Commands::Relocate { keg, old, new } => commands::relocate(config, &keg, &old, &new)?,
        Commands::BottlePrep { keg } => commands::bottle_prep(config, &keg)?,
        Commands::Pour {
            bottle,
            name,
            version,
            cellar,
        } => commands::pour(config, &bottle, &name, &version, &cellar)?,
        Commands::Install { name } => commands::install(ApiClient::new(config)?, &name).await?,
        Commands::Update { kind, force } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => vec![IndexKind::Formula, IndexKind::Cask],
            };
            commands::update(ApiClient::new(config)?, &kinds, force).await?;
        }
        Commands::Info { name, cask } => {
            let kind = if cask { IndexKind::Cask } else { IndexKind::Formula };
            commands::info(ApiClient::new(config)?, &name, kind).await?;
        }
        Commands::Completions { shell } => commands::completions(shell),
    }

    Ok(())
}
