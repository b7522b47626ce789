//! GraphiVault - CLI
//!
//! Command-line interface for vault operations. Every command runs in its own
//! process, so each one that touches records unlocks first and locks on exit.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use graphivault::{
    ImageMetadata, RekeyControl, SecretPassword, SessionPhase, Vault, VaultConfig,
};

#[derive(Parser)]
#[command(name = "graphivault")]
#[command(version = graphivault::VERSION)]
#[command(about = "GraphiVault - offline encrypted image vault")]
struct Cli {
    /// Vault path
    #[arg(short, long, default_value = "./vault")]
    vault: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Master password (prompted when omitted)
    #[arg(short, long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Init,

    /// Show vault and session state
    Status,

    /// Add an image
    Add {
        /// Image path
        path: PathBuf,

        /// Tag to attach (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
    },

    /// Decrypt an image to a file
    Get {
        /// Record ID
        id: String,

        /// Output path
        output: PathBuf,
    },

    /// Delete an image
    Delete {
        /// Record ID
        id: String,
    },

    /// List images
    List,

    /// Change the master password and re-encrypt every record
    Rekey {
        /// New password (prompted when omitted)
        #[arg(long)]
        new_password: Option<String>,
    },

    /// Finish interrupted deletes
    Purge,

    /// Decrypt every record and report damage
    Verify,

    /// Show the audit trail
    Audit {
        /// Number of entries
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Verify the hash chain
        #[arg(long)]
        verify: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VaultConfig::default(),
    };
    let vault = Vault::open(&cli.vault, config)
        .with_context(|| format!("opening vault {}", cli.vault.display()))?;

    match cli.command {
        Commands::Init => {
            println!("🔐 Creating new GraphiVault...");
            let password = match cli.password {
                Some(p) => SecretPassword::from(p),
                None => prompt_new("Master password: ")?,
            };
            let vault_id = vault.initialize_vault(&password)?;
            println!("✅ Vault created at: {}", cli.vault.display());
            println!("   ID: {}", vault_id);
        }

        Commands::Status => {
            let status = vault.get_status();
            println!("📊 GraphiVault Status");
            println!("{:-<40}", "");
            println!("Initialized:      {}", status.initialized);
            if let Some(id) = &status.vault_id {
                println!("Vault ID:         {}", id);
            }
            if let Some(epoch) = status.manifest_epoch {
                println!("Key epoch:        {}", epoch);
            }
            println!("Session:          {:?}", status.session.state);
            println!("Failed attempts:  {}", status.session.failed_attempts);
            if let Some(secs) = status.session.retry_after_secs {
                println!("Retry after:      {}s", secs);
            }
            if status.rotation_pending {
                println!("⚠️ A key rotation is pending; rerun rekey with the same new password");
            }
        }

        Commands::Add { path, tag } => {
            println!("📥 Adding image: {}", path.display());
            unlock(&vault, cli.password)?;

            let data = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let mut metadata = ImageMetadata::named(file_name(&path));
            metadata.tags = tag;

            let id = vault.add_record(&data, metadata)?;
            println!("✅ Image added with ID: {}", id);
        }

        Commands::Get { id, output } => {
            println!("📤 Exporting image: {}", id);
            unlock(&vault, cli.password)?;

            let record = vault.get_record(&id)?;
            std::fs::write(&output, &record.data)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("✅ Image written to: {}", output.display());
        }

        Commands::Delete { id } => {
            println!("🗑️ Deleting image: {}", id);
            unlock(&vault, cli.password)?;
            vault.delete_record(&id)?;
            println!("✅ Image deleted!");
        }

        Commands::List => {
            unlock(&vault, cli.password)?;
            let records = vault.list_records()?;

            if records.is_empty() {
                println!("📭 No images in vault");
            } else {
                println!("📷 Images in vault ({}):", records.len());
                println!("{:-<60}", "");
                for record in records {
                    let flag = if record.integrity_ok { "  " } else { "❌" };
                    let name = record
                        .metadata
                        .as_ref()
                        .and_then(|m| m.name.clone())
                        .unwrap_or_else(|| "?".into());
                    println!(
                        "{} {} - {} ({} bytes)",
                        flag, record.record_id, name, record.plaintext_len
                    );
                }
            }

            let stale = vault.stale_records()?;
            if !stale.is_empty() {
                println!("⚠️ {} record(s) still under an old key", stale.len());
            }
        }

        Commands::Rekey { new_password } => {
            println!("🔄 Rotating master key...");
            unlock(&vault, cli.password)?;

            let new_password = match new_password {
                Some(p) => SecretPassword::from(p),
                None => prompt_new("New master password: ")?,
            };

            let report = vault.rekey_with(&new_password, &RekeyControl::new())?;
            println!("✅ Key epoch {} → {}", report.from_epoch, report.to_epoch);
            println!("   Records re-encrypted: {}", report.rekeyed);
            if report.resumed {
                println!("   Resumed an interrupted rotation");
            }
            if !report.failed.is_empty() {
                println!("⚠️ {} record(s) failed authentication:", report.failed.len());
                for id in &report.failed {
                    println!("   - {}", id);
                }
            }
        }

        Commands::Purge => {
            unlock(&vault, cli.password)?;
            let purged = vault.purge()?;
            println!("✅ Purged {} record(s)", purged);
        }

        Commands::Verify => {
            println!("🔍 Verifying vault integrity...");
            unlock(&vault, cli.password)?;

            let report = vault.verify_integrity()?;
            println!("   Records verified: {}", report.checked);
            for id in &report.failed {
                println!("❌ {} failed authentication", id);
            }
            for id in &report.stale {
                println!("⚠️ {} is still under an old key", id);
            }
            for id in &report.pending {
                println!("⚠️ {} was moved by an unfinished rotation", id);
            }
            for name in &report.orphans {
                println!("⚠️ Orphaned payload file: {}", name);
            }
            if report.is_healthy() {
                println!("💚 Vault is healthy");
            }
        }

        Commands::Audit { limit, verify } => {
            for entry in vault.audit_events(limit)? {
                println!(
                    "#{:<5} {} {:?} {:?}",
                    entry.seq,
                    entry.timestamp.to_rfc3339(),
                    entry.event,
                    entry.detail
                );
            }

            if verify {
                match vault.verify_audit()? {
                    Some(result) if result.is_intact() => {
                        println!("💚 Audit chain intact ({} entries)", result.entries)
                    }
                    Some(result) => println!(
                        "❌ Audit chain broken at line {}",
                        result.first_broken.unwrap_or_default()
                    ),
                    None => println!("Audit trail disabled"),
                }
            }
        }
    }

    vault.lock();
    Ok(())
}

fn unlock(vault: &Vault, password: Option<String>) -> Result<()> {
    if vault.get_status().session.state == SessionPhase::Uninitialized {
        bail!("no vault here yet; run `graphivault init` first");
    }

    let password = match password {
        Some(p) => SecretPassword::from(p),
        None => SecretPassword::from(rpassword::prompt_password("Master password: ")?),
    };
    vault.unlock(&password).context("unlock failed")?;
    Ok(())
}

fn prompt_new(prompt: &str) -> Result<SecretPassword> {
    let first = SecretPassword::from(rpassword::prompt_password(prompt)?);
    let second = SecretPassword::from(rpassword::prompt_password("Confirm: ")?);

    if first.expose() != second.expose() {
        bail!("passwords do not match");
    }
    Ok(first)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
