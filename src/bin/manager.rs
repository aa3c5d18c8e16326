use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sandbox_gateway::config::CacheOptions;
use sandbox_gateway::registry::{
    dir_size, parse_id, remove_dir, reset_dir, sandbox_dir, SandboxRegistry,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-manager", author, version, about = "Sandbox record and file maintenance")]
struct Cli {
    /// Registry file holding sandbox records
    #[arg(long, env = "SANDBOX_REGISTRY", default_value = "sandboxes.json", global = true)]
    registry: PathBuf,
    /// Directory holding one subdirectory per sandbox
    #[arg(long, env = "SANDBOX_CLIENTS_DIR", default_value = "clients", global = true)]
    clients_dir: PathBuf,
    #[command(flatten)]
    cache: CacheOptions,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered sandboxes with their measured size
    #[command(alias = "ls")]
    List,
    /// Show one sandbox record
    Show { id: String },
    /// Remove every file in the sandbox directory
    Reset { id: String },
    /// Remove the sandbox directory, its record and its cached address
    #[command(alias = "rm")]
    Delete { id: String },
    /// Set the sandbox quota in bytes
    Quota { id: String, bytes: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut registry = SandboxRegistry::load(&cli.registry)
        .with_context(|| format!("failed to load registry {}", cli.registry.display()))?;

    match cli.command.unwrap_or(Command::List) {
        Command::List => {
            let mut any = false;
            for record in registry.records() {
                any = true;
                let size = dir_size(&sandbox_dir(&cli.clients_dir, &record.sandbox_id));
                println!(
                    "{}\tuser={}\tquota={}\tused={}",
                    record.sandbox_id,
                    record.user_id.as_deref().unwrap_or("none"),
                    record.quota_bytes,
                    size
                );
            }
            if !any {
                println!("No sandboxes registered");
            }
        }
        Command::Show { id } => {
            let id = parse_id(&id)?;
            let Some(record) = registry.get(&id) else {
                bail!("sandbox {id} not found");
            };
            let path = sandbox_dir(&cli.clients_dir, &id);
            println!("Sandbox: {}", record.sandbox_id);
            println!("User ID: {}", record.user_id.as_deref().unwrap_or("(none)"));
            println!("Quota: {}", record.quota_bytes);
            println!("Used (recorded): {}", record.used_bytes);
            println!("Created: {}", record.created_at.to_rfc3339());
            if path.is_dir() {
                println!("Path: {}", path.display());
            } else {
                println!("Path: (missing)");
            }
            println!("Actual size: {}", dir_size(&path));
        }
        Command::Reset { id } => {
            let id = parse_id(&id)?;
            if reset_dir(&sandbox_dir(&cli.clients_dir, &id))? {
                if let Some(record) = registry.get_mut(&id) {
                    record.used_bytes = 0;
                    registry.save()?;
                }
                println!("Reset sandbox files for {id}");
            } else {
                println!("Sandbox path not found");
            }
        }
        Command::Delete { id } => {
            let id = parse_id(&id)?;
            remove_dir(&sandbox_dir(&cli.clients_dir, &id))?;
            if registry.remove(&id).is_some() {
                registry.save()?;
            }
            cli.cache.connect().await.invalidate(&id).await;
            println!("Deleted sandbox {id}");
        }
        Command::Quota { id, bytes } => {
            let id = parse_id(&id)?;
            registry.get_or_insert(&id).quota_bytes = bytes;
            registry.save()?;
            println!("Quota for {id} set to {bytes}");
        }
    }

    Ok(())
}
