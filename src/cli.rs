//! # Command Line Interface
//!
//! Argument parsing and the implementations behind each subcommand.
//!
//! ## Commands
//!
//! - `init` - Write the node configuration and generate the peer identity
//! - `id` - Display this peer's id
//! - `hash` - Print the content fingerprint of a file
//! - `snapshot` - Record the fingerprints of everything below a directory
//! - `diff` - Compare a directory against a recorded snapshot
//! - `demo` - Two in-memory peers sharing one profile

use crate::config::Config;
use crate::crypto::{CryptoProvider, Identity, SignedEnvelope};
use crate::dht::MemoryDht;
use crate::fingerprint;
use crate::node::PeerNode;
use crate::notification::{FileEvent, FileEventKind};
use crate::operations::{FileOperation, FileOperations};
use crate::process::LoggingListener;
use crate::snapshot::{FileTreeSnapshot, META_FILE_NAME};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sharetree")]
#[command(about = "Shared file index kept consistent across the peers of one user")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write the configuration and generate this peer's identity
    Init {
        /// Local directory to share
        root: PathBuf,
        /// Overlay key of the shared profile
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Display this peer's id
    Id,

    /// Print the content fingerprint of a file
    Hash {
        path: PathBuf,
    },

    /// Record the fingerprints of everything below a directory
    Snapshot {
        path: PathBuf,
        /// Where to write the snapshot (defaults to <path>/.sharetree)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare a directory against a recorded snapshot
    Diff {
        path: PathBuf,
        /// Snapshot to compare against (defaults to <path>/.sharetree)
        snapshot: Option<PathBuf>,
    },

    /// Run two in-memory peers and show the notifications between them
    Demo,
}

pub async fn init(root: PathBuf, profile: Option<String>) -> Result<()> {
    info!("Initializing sharetree...");

    let root = if root.is_absolute() {
        root
    } else {
        std::env::current_dir()
            .context("Could not determine the current directory")?
            .join(root)
    };
    tokio::fs::create_dir_all(&root).await?;

    let identity = Identity::generate();
    let mut config = Config::init(identity.peer_id().to_string(), root).await?;
    if let Some(profile) = profile {
        config.profile_location = profile;
        config.save().await?;
    }
    info!("Configuration initialized at: {}", config.config_path().display());

    identity.save(&config.identity_path())?;
    info!("Peer identity saved to: {}", config.identity_path().display());

    println!("{} sharetree initialized", "✔".green().bold());
    println!("  Peer ID: {}", config.peer_id);
    println!("  Root:    {}", config.root.display());
    println!("  Profile: {}", config.profile_location);

    Ok(())
}

pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let identity = Identity::load(&config.identity_path())?;

    println!("{}", identity.peer_id());
    Ok(())
}

pub async fn hash(path: PathBuf) -> Result<()> {
    if path.is_dir() {
        anyhow::bail!("{} is a directory; use 'sharetree snapshot' instead", path.display());
    }
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }

    let digest = fingerprint::fingerprint_file_async(&path).await?;
    println!("{}  {}", digest, path.display());
    Ok(())
}

pub async fn snapshot(path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| path.join(META_FILE_NAME));
    let snapshot = capture(&path).await?;
    snapshot.save(&output).await?;

    let folders = snapshot.entries.keys().filter(|k| k.ends_with('/')).count();
    println!(
        "{} Recorded {} file(s) and {} folder(s) to {}",
        "✔".green().bold(),
        snapshot.len() - folders,
        folders,
        output.display()
    );
    Ok(())
}

pub async fn diff(path: PathBuf, snapshot: Option<PathBuf>) -> Result<()> {
    let recorded_at = snapshot.unwrap_or_else(|| path.join(META_FILE_NAME));
    let recorded = FileTreeSnapshot::load(&recorded_at)
        .await
        .with_context(|| format!("Could not load snapshot {}", recorded_at.display()))?;
    let current = capture(&path).await?;

    let changes = recorded.diff(&current);
    if changes.is_empty() {
        println!("No changes since {}", recorded.taken_at.format("%Y-%m-%d %H:%M:%S"));
        return Ok(());
    }

    let moves = recorded.moved_candidates(&current, &changes);
    for (from, to) in &moves {
        println!("{} {} -> {}", "R".cyan().bold(), from, to);
    }
    let moved_from = |p: &String| moves.iter().any(|(from, _)| from == p);
    let moved_to = |p: &String| moves.iter().any(|(_, to)| to == p);

    for path in changes.added.iter().filter(|p| !moved_to(p)) {
        println!("{} {}", "A".green().bold(), path);
    }
    for path in &changes.modified {
        println!("{} {}", "M".yellow().bold(), path);
    }
    for path in changes.removed.iter().filter(|p| !moved_from(p)) {
        println!("{} {}", "D".red().bold(), path);
    }
    Ok(())
}

async fn capture(path: &Path) -> Result<FileTreeSnapshot> {
    if !path.is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }
    let root = path.to_path_buf();
    let snapshot = tokio::task::spawn_blocking(move || FileTreeSnapshot::capture(&root)).await??;
    Ok(snapshot)
}

/// Two peers of one user, each with its own directory, on an in-memory
/// overlay. The laptop changes files; the phone follows the notifications.
pub async fn run_demo() -> Result<()> {
    let workspace = std::env::temp_dir().join(format!("sharetree-demo-{}", uuid::Uuid::new_v4()));
    let result = demo_in(&workspace).await;
    if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
        warn!("Could not clean up {}: {}", workspace.display(), e);
    }
    result
}

/// Configuration for one demo peer sharing `profile:demo` from `workspace/<name>`.
fn demo_config(workspace: &Path, name: &str) -> Config {
    let mut config = Config::new(
        Identity::generate().peer_id().to_string(),
        workspace.join(name),
        workspace.join(format!("{}.toml", name)),
    );
    config.profile_location = "profile:demo".to_string();
    config
}

async fn demo_in(workspace: &Path) -> Result<()> {
    let laptop_config = demo_config(workspace, "laptop");
    let phone_config = demo_config(workspace, "phone");
    let laptop_root = laptop_config.root.clone();
    let phone_root = phone_config.root.clone();
    tokio::fs::create_dir_all(&laptop_root).await?;
    tokio::fs::create_dir_all(&phone_root).await?;

    let dht = MemoryDht::new();
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SignedEnvelope::generate());
    let (laptop, _) = PeerNode::from_config(&laptop_config, Arc::new(dht.clone()), crypto.clone());
    let (phone, mut phone_events) = PeerNode::from_config(&phone_config, Arc::new(dht.clone()), crypto);
    let _laptop_inbox = laptop.listen(dht.register_peer(laptop.peer_id()));
    let _phone_inbox = phone.listen(dht.register_peer(phone.peer_id()));

    laptop
        .login(&laptop_config.profile_location, "demo", laptop_root.clone())
        .await?;
    phone
        .login(&phone_config.profile_location, "demo", phone_root.clone())
        .await?;
    println!("{} laptop {}", "●".blue(), laptop.peer_id());
    println!("{} phone  {}\n", "●".blue(), phone.peer_id());

    let ops = laptop.file_operations()?;
    let mirror = Mirror {
        from: laptop_root.clone(),
        to: phone_root.clone(),
    };

    let notes = laptop_root.join("notes.txt");
    tokio::fs::write(&notes, "first draft").await?;
    demo_step(&ops, ops.add(&notes)?, &mirror, &mut phone_events).await?;

    tokio::fs::write(&notes, "second draft").await?;
    demo_step(&ops, ops.update(&notes)?, &mirror, &mut phone_events).await?;

    let archive = laptop_root.join("archive");
    tokio::fs::create_dir_all(&archive).await?;
    demo_step(&ops, ops.add(&archive)?, &mirror, &mut phone_events).await?;

    let archived = archive.join("notes.txt");
    tokio::fs::rename(&notes, &archived).await?;
    demo_step(&ops, ops.move_to(&notes, &archived)?, &mirror, &mut phone_events).await?;

    tokio::fs::remove_file(&archived).await?;
    demo_step(&ops, ops.remove(&archived)?, &mirror, &mut phone_events).await?;

    let profile = laptop.session()?.refresh().await?;
    println!(
        "\n{} profile at {} with {} node(s)",
        "✔".green().bold(),
        profile.version().map(|v| v.to_string()).unwrap_or_default(),
        profile.tree.len()
    );
    Ok(())
}

async fn demo_step(
    ops: &FileOperations,
    operation: FileOperation,
    mirror: &Mirror,
    events: &mut mpsc::UnboundedReceiver<FileEvent>,
) -> Result<()> {
    let name = operation.name().to_string();
    let report = ops.execute(operation, Arc::new(LoggingListener)).await;
    match &report.outcome {
        Ok(()) => println!("{} laptop: {}", "→".cyan(), name),
        Err(failure) => {
            println!("{} laptop: {} ({})", "✘".red(), name, failure);
            return Ok(());
        }
    }

    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(event)) => {
            println!("{} phone:  {}", "←".magenta(), describe(&event, &mirror.to));
            mirror.apply(&event).await?;
        }
        Ok(None) => anyhow::bail!("phone stopped listening"),
        Err(_) => println!("{} phone:  nothing to do", "←".magenta()),
    }
    Ok(())
}

fn describe(event: &FileEvent, root: &Path) -> String {
    let show = |p: &Path| p.strip_prefix(root).unwrap_or(p).display().to_string();
    match &event.kind {
        FileEventKind::Added => format!("added {}", show(&event.path)),
        FileEventKind::Removed => format!("removed {}", show(&event.path)),
        FileEventKind::Updated => format!("updated {}", show(&event.path)),
        FileEventKind::Moved { from } => format!("moved {} to {}", show(from), show(&event.path)),
    }
}

/// Applies file events by copying from the peer that made the change.
struct Mirror {
    from: PathBuf,
    to: PathBuf,
}

impl Mirror {
    async fn apply(&self, event: &FileEvent) -> Result<()> {
        match &event.kind {
            FileEventKind::Added | FileEventKind::Updated if !event.is_file => {
                tokio::fs::create_dir_all(&event.path).await?;
            }
            FileEventKind::Added | FileEventKind::Updated => {
                let source = self.from.join(event.path.strip_prefix(&self.to)?);
                if let Some(parent) = event.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&source, &event.path).await?;
            }
            FileEventKind::Moved { from } => {
                tokio::fs::rename(from, &event.path).await?;
            }
            FileEventKind::Removed if event.is_file => tokio::fs::remove_file(&event.path).await?,
            FileEventKind::Removed => tokio::fs::remove_dir_all(&event.path).await?,
        }
        Ok(())
    }
}
