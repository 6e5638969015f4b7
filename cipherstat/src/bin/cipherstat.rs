use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cipherstat::{
    inspect, Config, Decryptor, Encryptor, Job, JobEngine, JobResult, Policy, RawTable, Schema,
    TableStore,
};
use cipherstat_he::keys::{EVAL_KEY_FILE, PUBLIC_KEY_FILE, SECRET_KEY_FILE};
use cipherstat_he::wire::atomic_write;
use cipherstat_he::{KeyManager, MockCkksBackend, Profile, ProfileId};

#[derive(Debug, Parser)]
#[command(
    name = "cipherstat",
    version,
    about = "Aggregation jobs over homomorphically encrypted columnar data"
)]
struct Cli {
    /// Optional TOML configuration with default profile and directories.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a key set for a parameter profile.
    Keygen {
        /// Parameter profile id (A, B or T).
        #[arg(long)]
        profile: Option<String>,
        /// Directory receiving secret.key, public.key and eval.key.
        #[arg(long)]
        key_dir: Option<PathBuf>,
        /// Replace existing key material.
        #[arg(long)]
        overwrite: bool,
    },
    /// Encrypt a raw JSON table under a schema into a table directory.
    Encrypt {
        /// Schema JSON describing the table columns.
        #[arg(long)]
        schema: PathBuf,
        /// Raw columnar data JSON.
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        key_dir: Option<PathBuf>,
        /// Output table directory; must not exist yet.
        #[arg(long)]
        out: PathBuf,
    },
    /// Evaluate a job JSON against an encrypted table.
    Run {
        /// Job description JSON.
        #[arg(long)]
        job: PathBuf,
        /// Published table directory.
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        key_dir: Option<PathBuf>,
        /// Output path for the encrypted result artifact.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Decrypt a result artifact (or one table column) with the secret key.
    Decrypt {
        /// Encrypted result artifact.
        #[arg(long, conflicts_with_all = ["table", "column"])]
        result: Option<PathBuf>,
        /// Published table directory, paired with --column.
        #[arg(long, requires = "column")]
        table: Option<PathBuf>,
        /// Column to decrypt out of --table.
        #[arg(long, requires = "table")]
        column: Option<String>,
        #[arg(long)]
        key_dir: Option<PathBuf>,
        /// Release policy JSON applied to the result before output.
        #[arg(long, conflicts_with = "table")]
        policy: Option<PathBuf>,
        /// Write the decrypted JSON here instead of printing to stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Describe an artifact (key, ciphertext, result or table) without keys.
    Inspect { path: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path).context("loading configuration")?,
        None => Config::default(),
    };

    match cli.command {
        Command::Keygen {
            profile,
            key_dir,
            overwrite,
        } => {
            let profile =
                Profile::resolve_str(profile.as_deref().unwrap_or(&config.pipeline.profile))?;
            let backend = MockCkksBackend::new(profile);
            let dir = key_dir.unwrap_or_else(|| config.pipeline.key_dir.clone());
            let keys = KeyManager::keygen(&backend, &dir, overwrite)?;
            println!("generated key set {} for {profile}", keys.secret.key_id);
        }
        Command::Encrypt {
            schema,
            data,
            key_dir,
            out,
        } => {
            let dir = key_dir.unwrap_or_else(|| config.pipeline.key_dir.clone());
            let public = KeyManager::load_public(&dir.join(PUBLIC_KEY_FILE))?;
            let backend = backend_for(public.profile);
            let schema = Schema::load(&schema)?;
            let raw = RawTable::load(&data)?;
            let encryptor = Encryptor::new(&backend, &public)?;
            let table = encryptor.encrypt_table(&schema, &raw)?;
            TableStore::publish(&out, &table)?;
            println!(
                "encrypted table {} ({} rows, {} blocks) -> {}",
                schema.name,
                table.metadata.rows,
                table.metadata.block_count,
                out.display()
            );
        }
        Command::Run {
            job,
            table,
            key_dir,
            out,
        } => {
            let parsed = Job::load(&job)?;
            info!(job = %parsed.id, operation = %parsed.operation, "parsed job");
            let dir = key_dir.unwrap_or_else(|| config.pipeline.key_dir.clone());
            let eval = KeyManager::load_eval(&dir.join(EVAL_KEY_FILE))?;
            let backend = backend_for(eval.profile);
            let store = TableStore::open(&table)?;
            let engine = JobEngine::new(&backend, &eval)?;
            let out = out.unwrap_or_else(|| {
                config
                    .pipeline
                    .results_dir
                    .join(format!("{}.result", parsed.id))
            });
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            engine.run_to_file(&parsed, &store, &out)?;
            println!("job {} done -> {}", parsed.id, out.display());
        }
        Command::Decrypt {
            result,
            table,
            column,
            key_dir,
            policy,
            out,
        } => {
            let dir = key_dir.unwrap_or_else(|| config.pipeline.key_dir.clone());
            let secret = KeyManager::load_secret(&dir.join(SECRET_KEY_FILE))?;
            let backend = backend_for(secret.profile);
            let decryptor = Decryptor::new(&backend, &secret)?;
            match (result, table, column) {
                (Some(result), _, _) => {
                    let result = JobResult::load(&result)?;
                    let decrypted = decryptor.decrypt_result(&result)?;
                    match policy {
                        Some(policy) => {
                            let release = Policy::load(&policy)?.apply(&decrypted);
                            emit_json(&release, out.as_deref())?;
                        }
                        None => match out {
                            Some(path) => {
                                decrypted.save(&path)?;
                                println!("decrypted result -> {}", path.display());
                            }
                            None => println!("{}", serde_json::to_string_pretty(&decrypted)?),
                        },
                    }
                }
                (None, Some(table), Some(column)) => {
                    let store = TableStore::open(&table)?;
                    let values = decryptor.decrypt_column(&store, &column)?;
                    emit_json(&values, out.as_deref())?;
                }
                _ => anyhow::bail!("pass either --result or --table with --column"),
            }
        }
        Command::Inspect { path } => {
            println!("{}", inspect(&path)?);
        }
    }
    Ok(())
}

fn backend_for(profile: ProfileId) -> MockCkksBackend {
    MockCkksBackend::new(Profile::resolve(profile))
}

/// Print `value` as pretty JSON, or write it atomically when `out` is set.
fn emit_json<T: serde::Serialize>(value: &T, out: Option<&std::path::Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            atomic_write(path, rendered.as_bytes())?;
            println!("decrypted result -> {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
