use std::path::PathBuf;
use std::sync::Arc;

use addonpm::commands::{self, Config, Options, build_manager};
use addonpm::config::{CONFIG_DIR_ENV, DEFAULT_PROFILE, Flavour};
use addonpm::definition::Strategy;
use addonpm::matcher::MatcherKind;
use addonpm::runtime::RealRuntime;
use anyhow::Result;
use clap::Parser;

/// addonpm - add-on package manager
///
/// Installs, updates and removes game add-ons from GitHub releases,
/// CurseForge and WoWInterface, and adopts add-ons already on disk.
///
/// Definitions are written as `source:alias`, e.g. `curse:molinari` or
/// `github:owner/repo`, or as an add-on's web page URL.
///
/// GITHUB_TOKEN and CFCORE_API_KEY override the stored access tokens.
#[derive(Parser, Debug)]
#[command(author, version = env!("ADDONPM_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (also via ADDONPM_CONFIG_DIR)
    #[arg(long, env = CONFIG_DIR_ENV, value_name = "PATH", global = true)]
    config_dir: Option<PathBuf>,

    /// Profile to operate on
    #[arg(long, short = 'p', default_value = DEFAULT_PROFILE, global = true)]
    profile: String,

    /// Add-on directory; saves it to the profile
    #[arg(long, value_name = "PATH", global = true)]
    addon_dir: Option<PathBuf>,

    /// Game flavour: retail, vanilla_classic or classic
    #[arg(long, value_name = "FLAVOUR", global = true)]
    flavour: Option<Flavour>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Resolve definitions without installing anything
    Resolve {
        #[arg(required = true, value_name = "DEFINITION")]
        defs: Vec<String>,

        /// Strategy for every definition, e.g. latest or version=1.2.3
        #[arg(long)]
        strategy: Option<Strategy>,

        /// Also resolve dependencies
        #[arg(long)]
        deps: bool,
    },

    /// Install add-ons
    Install {
        #[arg(required = true, value_name = "DEFINITION")]
        defs: Vec<String>,

        #[arg(long)]
        strategy: Option<Strategy>,

        /// Overwrite folders that no package owns
        #[arg(long)]
        replace: bool,

        /// Also install missing dependencies
        #[arg(long)]
        deps: bool,
    },

    /// Update installed add-ons (all when none are given)
    Update {
        #[arg(value_name = "DEFINITION")]
        defs: Vec<String>,
    },

    /// Install another version of an installed add-on
    Rollback {
        #[arg(value_name = "DEFINITION")]
        def: String,

        version: String,
    },

    /// Remove installed add-ons
    Remove {
        #[arg(required = true, value_name = "DEFINITION")]
        defs: Vec<String>,

        /// Forget the add-ons but leave their folders on disk
        #[arg(long)]
        keep_folders: bool,
    },

    /// Pin installed add-ons to their current version
    Pin {
        #[arg(required = true, value_name = "DEFINITION")]
        defs: Vec<String>,

        /// Unpin instead
        #[arg(long)]
        undo: bool,
    },

    /// List installed add-ons
    List,

    /// Match add-on folders no package owns against known add-ons
    Reconcile {
        /// Install the first match of each group
        #[arg(long)]
        auto: bool,

        /// Matchers to run (default: all)
        #[arg(long, value_delimiter = ',')]
        matchers: Vec<MatcherKind>,
    },

    /// Refresh the cached add-on catalogue used by reconcile
    RefreshCatalogue,

    /// Authorise GitHub access with the device flow
    GithubAuth {
        /// OAuth app client ID
        #[arg(long, env = "ADDONPM_GITHUB_CLIENT_ID")]
        client_id: String,
    },
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            config_dir: self.config_dir.clone(),
            profile: self.profile.clone(),
            addon_dir: self.addon_dir.clone(),
            flavour: self.flavour,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = Arc::new(RealRuntime);
    let config = Config::load(runtime.as_ref(), &cli.options())?;
    let manager = build_manager(runtime, config)?;

    match cli.command {
        Commands::Resolve { defs, strategy, deps } => {
            commands::resolve(&manager, &defs, strategy, deps).await
        }
        Commands::Install { defs, strategy, replace, deps } => {
            commands::install(&manager, &defs, strategy, replace, deps).await
        }
        Commands::Update { defs } => commands::update(&manager, &defs).await,
        Commands::Rollback { def, version } => commands::rollback(&manager, &def, &version).await,
        Commands::Remove { defs, keep_folders } => {
            commands::remove(&manager, &defs, keep_folders).await
        }
        Commands::Pin { defs, undo } => commands::pin(&manager, &defs, undo).await,
        Commands::List => commands::list(&manager),
        Commands::Reconcile { auto, matchers } => {
            commands::reconcile(&manager, &matchers, auto).await
        }
        Commands::RefreshCatalogue => commands::refresh_catalogue(&manager).await,
        Commands::GithubAuth { client_id } => commands::github_auth(&manager, &client_id).await,
    }
}
