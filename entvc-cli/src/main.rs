//! EntVC command-line administration tool

mod repo;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use entvc_core::{ConflictChoice, ConflictResolution, EntityKey, FileWrite};
use repo::{PendingMerge, Repo};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "entvc")]
#[command(author = "EntVC Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Change-control engine for structured file content")]
struct Cli {
    /// Repository directory
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Use a deterministic clock with this seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Record new content for a file in the active version
    Write {
        file_id: String,
        /// Logical path used to pick the plugin
        path: String,
        /// Source file, `-` for stdin
        src: String,
    },

    /// Commit the working changes of the active version
    Commit,

    /// Create a version from the active one (or `--from`)
    Fork {
        name: String,
        #[arg(long)]
        from: Option<String>,
    },

    /// Make another version active
    Switch { name: String },

    /// Merge a version into the active one
    Merge {
        #[arg(required_unless_present = "abort")]
        source: Option<String>,
        /// Drop the pending merge and its resolutions
        #[arg(long, conflicts_with = "source")]
        abort: bool,
    },

    /// Settle one conflict of the pending merge
    Resolve {
        file_id: String,
        schema_key: String,
        entity_id: String,
        #[arg(value_enum)]
        choice: Choice,
        /// Content file for the `content` choice
        #[arg(long)]
        content: Option<PathBuf>,
    },

    /// Print the current bytes of a file
    Read { file_id: String },

    /// Show commits reachable from the active version
    Log {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Rebuild the state cache
    Rebuild {
        #[arg(long)]
        all: bool,
    },

    /// Check every version's state cache against the log
    Verify,

    /// Print changes appended after a cursor as JSON
    ChangesSince {
        #[arg(default_value_t = 0)]
        cursor: i64,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Choice {
    Source,
    Target,
    Delete,
    Content,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { seed } => {
            let repo = Repo::init(&cli.repo, seed)?;
            info!("initialized repository at {}", cli.repo.display());
            let main = repo.engine.active_version()?;
            println!("Initialized repository at {}", cli.repo.display());
            println!("Active version: {} ({})", main.name, main.id);
        }

        Commands::Write { file_id, path, src } => {
            let data = read_source(&src)?;
            let mut repo = Repo::open(&cli.repo)?;
            let active = repo.active_id();
            repo.ensure_no_pending_merge(&active)?;
            let report = repo
                .engine
                .write_files(&active, &[FileWrite::new(file_id, path, data)])?;
            for written in &report.written {
                println!(
                    "{}: {} change(s) via {}",
                    written.file_id,
                    written.changes.len(),
                    written.plugin_key
                );
            }
            for file_id in &report.unmatched {
                println!("{file_id}: no plugin matches this path");
            }
            if let Some(failure) = report.failures.first() {
                bail!("{failure}");
            }
        }

        Commands::Commit => {
            let mut repo = Repo::open(&cli.repo)?;
            let active = repo.active_id();
            repo.ensure_no_pending_merge(&active)?;
            let commit = repo.engine.commit(&active)?;
            println!("Committed {}", commit.id);
        }

        Commands::Fork { name, from } => {
            let mut repo = Repo::open(&cli.repo)?;
            let from_id = match from {
                Some(from) => repo.version_id(&from)?,
                None => repo.active_id(),
            };
            let version = repo.engine.fork(&from_id, &name)?;
            println!("Created version {} ({}) at {}", version.name, version.id, version.tip_commit_id);
        }

        Commands::Switch { name } => {
            let mut repo = Repo::open(&cli.repo)?;
            let id = repo.version_id(&name)?;
            repo.set_active(&id)?;
            println!("Switched to {name}");
        }

        Commands::Merge { source, abort } => {
            let mut repo = Repo::open(&cli.repo)?;
            if abort {
                if !repo.clear_pending_merge()? {
                    bail!("no merge is pending");
                }
                println!("Pending merge aborted");
                return Ok(());
            }
            let Some(source) = source else {
                bail!("a source version is required");
            };
            if repo.pending_merge()?.is_some() {
                bail!("a merge is already pending; resolve its conflicts or run `entvc merge --abort`");
            }
            let source_id = repo.version_id(&source)?;
            let target_id = repo.active_id();
            let merge = repo.engine.merge(&source_id, &target_id)?;
            if merge.is_clean() {
                let commit = repo.engine.commit_merge(&merge, &[])?;
                println!("Merged {source} ({} change(s)): {}", merge.elements.len(), commit.id);
            } else {
                for conflict in &merge.conflicts {
                    println!("CONFLICT ({:?}) {}", conflict.kind, conflict.key);
                }
                let count = merge.conflicts.len();
                repo.save_pending_merge(&PendingMerge {
                    merge,
                    resolutions: Vec::new(),
                })?;
                println!("{count} conflict(s) need `entvc resolve`");
            }
        }

        Commands::Resolve {
            file_id,
            schema_key,
            entity_id,
            choice,
            content,
        } => {
            let mut repo = Repo::open(&cli.repo)?;
            let Some(mut pending) = repo.pending_merge()? else {
                bail!("no merge is pending");
            };
            let key = EntityKey::new(entity_id, file_id, schema_key);
            if !pending.merge.conflicts.iter().any(|c| c.key == key) {
                bail!("{key} is not in conflict");
            }
            let choice = match choice {
                Choice::Source => ConflictChoice::TakeSource,
                Choice::Target => ConflictChoice::TakeTarget,
                Choice::Delete => ConflictChoice::Delete,
                Choice::Content => {
                    let Some(content) = content else {
                        bail!("--content <file> is required for the content choice");
                    };
                    let bytes = std::fs::read(&content)
                        .with_context(|| format!("Failed to read {}", content.display()))?;
                    ConflictChoice::Content(bytes)
                }
            };
            pending.resolutions.retain(|r| r.key != key);
            pending.resolutions.push(ConflictResolution::new(key, choice));

            let open = pending.open_conflicts();
            if open > 0 {
                repo.save_pending_merge(&pending)?;
                println!("{open} conflict(s) left");
            } else {
                let commit = repo.engine.commit_merge(&pending.merge, &pending.resolutions)?;
                repo.clear_pending_merge()?;
                println!("Merge committed: {}", commit.id);
            }
        }

        Commands::Read { file_id } => {
            let mut repo = Repo::open(&cli.repo)?;
            let active = repo.active_id();
            match repo.engine.read_file(&active, &file_id)? {
                Some(bytes) => std::io::stdout().write_all(&bytes)?,
                None => bail!("file '{file_id}' has no content in this version"),
            }
        }

        Commands::Log { limit } => {
            let repo = Repo::open(&cli.repo)?;
            for commit in repo.engine.log(&repo.active_id(), limit)? {
                let parents = if commit.parent_ids.is_empty() {
                    "(root)".to_string()
                } else {
                    commit.parent_ids.join(", ")
                };
                println!("{}  {}  parents: {}", commit.id, commit.created_at, parents);
            }
        }

        Commands::Rebuild { all } => {
            let mut repo = Repo::open(&cli.repo)?;
            let outcomes = if all {
                repo.engine.rebuild_all()?
            } else {
                let active = repo.active_id();
                vec![repo.engine.rebuild(&active)?]
            };
            for outcome in outcomes {
                println!("{}: {} row(s)", outcome.version_id, outcome.rows);
            }
        }

        Commands::Verify => {
            let repo = Repo::open(&cli.repo)?;
            let mut failures = 0;
            for version in repo.engine.versions()? {
                match repo.engine.verify_cache(&version.id) {
                    Ok(()) => println!("{}: ok", version.name),
                    Err(e) => {
                        failures += 1;
                        println!("{}: {e}", version.name);
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} version(s) have an inconsistent cache; run `entvc rebuild --all`");
            }
        }

        Commands::ChangesSince { cursor, limit } => {
            let repo = Repo::open(&cli.repo)?;
            let batch = repo.engine.changes_since(cursor, limit)?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
    }

    Ok(())
}

fn read_source(src: &str) -> Result<Vec<u8>> {
    if src == "-" {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        return Ok(data);
    }
    std::fs::read(src).with_context(|| format!("Failed to read {src}"))
}
