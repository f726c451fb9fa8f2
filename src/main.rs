use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tracing::info;

use scribed::account::storage::FileAccountStorage;
use scribed::account::AccountRegistry;
use scribed::config::ServerConfig;
use scribed::directory::{Directory, DirectoryOptions};
use scribed::plugin::PluginRegistry;
use scribed::server;
use scribed::storage::FsStorage;
use scribed::text::TextPlugin;

#[derive(Parser)]
#[command(
    name = "scribed",
    about = "Scribe Host — collaborative note directory daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Directory server port
    #[arg(long, env = "SCRIBED_PORT")]
    port: Option<u16>,

    /// Data directory for the note tree, accounts, and config
    #[arg(long, env = "SCRIBED_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SCRIBED_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SCRIBED_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the directory server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(ServerConfig::new(args.port, args.data_dir, args.log));
    let _log_guard = init_tracing(&config.log, args.log_file.as_deref())?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Arc<ServerConfig>) -> Result<()> {
    std::fs::create_dir_all(config.tree_dir())
        .with_context(|| format!("cannot create {}", config.tree_dir().display()))?;

    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(TextPlugin));

    let storage = Arc::new(FsStorage::new(config.tree_dir()));
    let accounts = AccountRegistry::new(Some(Arc::new(FileAccountStorage::new(
        config.accounts_file(),
    ))));
    let signing_key = config
        .signing_key
        .as_deref()
        .map(load_or_generate_signing_key)
        .transpose()?;
    if signing_key.is_none() {
        info!("no signing key configured; account creation is unsupported");
    }

    let (mut directory, events, event_rx) = Directory::new(
        DirectoryOptions {
            idle_save: Duration::from_secs(config.idle_save_secs),
            chat_enabled: config.chat_enabled,
        },
        plugins,
        Some(storage),
        accounts,
        signing_key,
    );
    directory
        .bootstrap()
        .await
        .context("directory bootstrap failed")?;
    tokio::spawn(directory.run(event_rx));

    server::run(config, events).await
}

/// Read the hex-encoded ed25519 issuing key, generating one on first use.
fn load_or_generate_signing_key(path: &Path) -> Result<SigningKey> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let bytes = hex::decode(contents.trim())
                .with_context(|| format!("bad signing key in {}", path.display()))?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("signing key in {} is not 32 bytes", path.display()))?;
            Ok(SigningKey::from_bytes(&bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = SigningKey::generate(&mut OsRng);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, hex::encode(key.to_bytes()))
                .with_context(|| format!("cannot write {}", path.display()))?;
            info!(path = %path.display(), "generated new signing key");
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
    }
}

/// Tracing to stderr, optionally teed into a daily-rotated file.
fn init_tracing(
    log: &str,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_new(log)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path.file_name().unwrap_or_else(|| "scribed.log".as_ref());
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}
