use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use bookmark_mirror::auth::FileTokenValidator;
use bookmark_mirror::coordinator::{RunCoordinator, Trigger};
use bookmark_mirror::local_store::{LocalNode, LocalStore, SqliteStore};
use bookmark_mirror::notify::LogNotifier;
use bookmark_mirror::remote::RemoteApiClient;
use bookmark_mirror::scheduler::{self, SchedulerConfig, DEFAULT_CRON};
use bookmark_mirror::settings;
use bookmark_mirror::state::MirrorState;

#[derive(Parser)]
#[command(name = "bookmark-mirror")]
#[command(about = "Mirrors a cloud bookmark service into a local bookmark tree", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the persisted mirror state (identity map + settings)
    #[arg(long, default_value = "~/.bookmark-mirror/state.json")]
    state: String,

    /// Path to the local bookmark database
    #[arg(long, default_value = "~/.bookmark-mirror/bookmarks.db")]
    db: String,

    /// Path to the access token left by the OAuth flow
    #[arg(long, default_value = "~/.bookmark-mirror/token.json")]
    token_file: String,

    /// Base URL of the remote bookmark API
    #[arg(long, default_value = "https://api.raindrop.io/rest/v1")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull the remote tree and converge the local mirror
    Pull {
        /// Report this pull as coming from the global keyboard command
        #[arg(long)]
        command: bool,
    },

    /// Discard all mappings and the mirrored subtree, then re-pull from scratch
    Reset {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Run periodic alarm-triggered pulls
    Schedule {
        /// Cron expression (default: every 10 minutes)
        #[arg(short, long, default_value = DEFAULT_CRON)]
        cron: String,

        /// Run as daemon
        #[arg(short, long)]
        daemon: bool,
    },

    /// Show last pull time, mapping counts and root placement
    Status,

    /// Print the mirrored local tree
    Tree,

    /// Move the mirror root under a different local folder
    SetParent {
        /// Local folder id the mirror root should live under
        folder_id: String,
    },

    /// Rename the mirror root folder
    RenameRoot {
        /// New name for the mirror root
        name: String,
    },
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn build_coordinator(cli: &Cli) -> Result<RunCoordinator<RemoteApiClient, SqliteStore>> {
    let state_path = expand_home(&cli.state);
    let state = MirrorState::load(&state_path)?;
    let store = SqliteStore::open(&expand_home(&cli.db)).context("Failed to open local store")?;

    let validator = FileTokenValidator::new(expand_home(&cli.token_file));
    let remote = RemoteApiClient::new(&cli.api_url, &validator.access_token())
        .context("Failed to build remote API client")?;

    Ok(RunCoordinator::new(
        remote,
        store,
        state,
        state_path,
        Box::new(validator),
        Box::new(LogNotifier),
    ))
}

fn print_tree(store: &SqliteStore, folder_id: &str, depth: usize) -> Result<()> {
    for child in store.get_children(folder_id)? {
        let indent = "  ".repeat(depth);
        match &child {
            LocalNode::Folder(f) => {
                println!("{}📁 {}", indent, f.title);
                print_tree(store, &f.id, depth + 1)?;
            }
            LocalNode::Bookmark(b) => {
                println!("{}🔖 {} ({})", indent, b.title, b.url);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Pull { command } => {
            let trigger = if *command { Trigger::Command } else { Trigger::Manual };
            let coordinator = build_coordinator(&cli)?;
            let stats = coordinator.run_mirror_pull(trigger).await?;
            info!("📊 {}", stats.summary());
        }

        Commands::Reset { yes } => {
            if !yes {
                print!("This deletes the mirrored folder and all mappings. Continue? (y/N): ");
                use std::io::{self, Write};
                io::stdout().flush().ok();

                let mut input = String::new();
                io::stdin().read_line(&mut input).ok();

                if !input.trim().eq_ignore_ascii_case("y") {
                    info!("❌ Cancelled");
                    return Ok(());
                }
            }

            let coordinator = build_coordinator(&cli)?;
            let stats = coordinator.run_mirror_pull(Trigger::Reset).await?;
            info!("📊 Rebuilt mirror: {}", stats.summary());
        }

        Commands::Schedule { cron, daemon } => {
            info!("⏰ Starting scheduler with cron: {}", cron);
            let coordinator = Arc::new(build_coordinator(&cli)?);
            let config = SchedulerConfig::new(cron.clone(), *daemon);
            scheduler::start_scheduler(coordinator, config).await?;
        }

        Commands::Status => {
            let state = MirrorState::load(&expand_home(&cli.state))?;
            println!("\n📊 Mirror Status");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            match state.last_pulled_at {
                Some(t) => println!("  Last pulled:      {}", t.to_rfc3339()),
                None => println!("  Last pulled:      never"),
            }
            println!("  Mapped folders:   {}", state.identity.collections.len());
            println!("  Mapped bookmarks: {}", state.identity.items.len());
            println!(
                "  Mirror root:      '{}' under folder {}",
                state.settings.root_folder_name, state.settings.parent_folder_id
            );
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
        }

        Commands::Tree => {
            let state = MirrorState::load(&expand_home(&cli.state))?;
            let store = SqliteStore::open(&expand_home(&cli.db))?;
            match &state.identity.root_folder_id {
                Some(root) if store.get_folder(root).is_some() => {
                    println!("📁 {}", state.settings.root_folder_name);
                    print_tree(&store, root, 1)?;
                }
                _ => println!("No mirror root yet. Run `bookmark-mirror pull` first."),
            }
        }

        Commands::SetParent { folder_id } => {
            let state_path = expand_home(&cli.state);
            let mut state = MirrorState::load(&state_path)?;
            let mut store = SqliteStore::open(&expand_home(&cli.db))?;
            settings::apply_parent_folder_change(&mut store, &mut state, &state_path, folder_id)?;
            info!("✅ Parent folder updated");
        }

        Commands::RenameRoot { name } => {
            let state_path = expand_home(&cli.state);
            let mut state = MirrorState::load(&state_path)?;
            let mut store = SqliteStore::open(&expand_home(&cli.db))?;
            settings::apply_root_folder_rename(&mut store, &mut state, &state_path, name)?;
            info!("✅ Mirror root renamed");
        }
    }

    Ok(())
}
