//! tvault: encrypted chunked file vault CLI
//!
//! Commands:
//!   login <phone>               - create a session with the remote store
//!   setup [--channel <id>]      - create or select the storage channel
//!   upload <file>...            - chunk, compress, encrypt and upload files
//!   download <query> [<output>] - fetch a file by id or name
//!   list                        - list files in the vault
//!   search <query>              - case-insensitive name search
//!   delete <query>              - remove a file and all of its chunks
//!   status                      - totals and compression ratio
//!   config show                 - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tvault_core::{FileMetadata, VaultConfig};
use tvault_store::{build_store, expand_home, OpendalStore};
use tvault_transfer::{TransferOptions, TransferUpdate, Vault};

/// Environment variable consulted before prompting for the vault password
const PASSWORD_ENV: &str = "TVAULT_PASSWORD";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tvault",
    version,
    about = "Encrypted chunked file vault",
    long_about = "tvault: store files as compressed, encrypted chunks in a message store"
)]
struct Cli {
    /// Path to tvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TVAULT_CONFIG",
        default_value = "~/.config/tvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "TVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "TVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to the remote store
    Login {
        /// Account phone number
        phone: String,
    },

    /// Create a storage channel, or adopt an existing one
    Setup {
        /// Existing channel id (default: create a new channel)
        #[arg(long)]
        channel: Option<i64>,
    },

    /// Upload one or more files
    ///
    /// The password is read from TVAULT_PASSWORD, or prompted for.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Do not encrypt, even if encryption is enabled in the config
        #[arg(long)]
        plain: bool,
    },

    /// Download a file by id or name
    Download {
        /// File id, exact name, or unique part of a name
        query: String,
        /// Destination file or directory (default: current directory)
        output: Option<PathBuf>,
    },

    /// List files in the vault
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Search file names (case-insensitive)
    Search { query: String },

    /// Delete a file and its chunks
    Delete {
        /// File id or exact name
        query: String,
    },

    /// Show vault totals
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_home(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    // Ctrl-C cancels the running transfer between chunks
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            trigger.cancel();
        }
    });

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Login { phone } => cmd_login(config, &config_path, &phone).await,
        Commands::Setup { channel } => cmd_setup(config, &config_path, channel).await,
        Commands::Upload { files, plain } => {
            let vault = open_vault(config, &config_path).await?;
            cmd_upload(&vault, &files, plain, &cancel).await
        }
        Commands::Download { query, output } => {
            let vault = open_vault(config, &config_path).await?;
            cmd_download(&vault, &query, output.as_deref(), &cancel).await
        }
        Commands::List { json } => {
            let vault = open_vault(config, &config_path).await?;
            let files = vault.list_files().await.context("listing files")?;
            print_files(&files, json)
        }
        Commands::Search { query } => {
            let vault = open_vault(config, &config_path).await?;
            let files = vault
                .search(&query)
                .await
                .with_context(|| format!("searching for '{query}'"))?;
            print_files(&files, false)
        }
        Commands::Delete { query } => {
            let vault = open_vault(config, &config_path).await?;
            cmd_delete(&vault, &query).await
        }
        Commands::Status { json } => {
            let vault = open_vault(config, &config_path).await?;
            cmd_status(&vault, json).await
        }
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so they never interleave with command output
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Config and session ────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<VaultConfig> {
    VaultConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

async fn connect(
    config: VaultConfig,
    config_path: &Path,
    skip_channel: bool,
) -> Result<Vault<OpendalStore>> {
    let store = build_store(&config.store).context("building store")?;
    let mut vault = Vault::new(store, config)
        .context("initializing vault")?
        .with_config_path(config_path);
    vault
        .connect(skip_channel)
        .await
        .context("connecting to remote store")?;
    Ok(vault)
}

async fn open_vault(config: VaultConfig, config_path: &Path) -> Result<Vault<OpendalStore>> {
    connect(config, config_path, false).await
}

/// Password from `TVAULT_PASSWORD`, else an interactive prompt.
fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password(prompt).context("reading password")?;
    if pw.is_empty() {
        anyhow::bail!("empty password (set {PASSWORD_ENV} or type one at the prompt)");
    }
    Ok(SecretString::from(pw))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .context("progress template")?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn track(pb: &ProgressBar) -> impl Fn(&TransferUpdate) + Send + Sync + 'static {
    let pb = pb.clone();
    move |u: &TransferUpdate| {
        pb.set_length(u.total_size);
        pb.set_position(u.transferred_size);
        pb.set_message(format!(
            "{} chunk {}/{}",
            u.file_name, u.completed_chunks, u.total_chunks
        ));
    }
}

// ── `tvault login` / `tvault setup` ───────────────────────────────────────────

async fn cmd_login(config: VaultConfig, config_path: &Path, phone: &str) -> Result<()> {
    let mut vault = connect(config, config_path, true).await?;
    if vault.is_authenticated().await? {
        println!("Already logged in.");
        return Ok(());
    }
    vault.login(phone).await.context("logging in")?;
    println!("Logged in as {phone}.");
    if vault.channel_id().is_none() {
        println!("Next: run `tvault setup` to create a storage channel.");
    }
    Ok(())
}

async fn cmd_setup(config: VaultConfig, config_path: &Path, channel: Option<i64>) -> Result<()> {
    let mut vault = connect(config, config_path, true).await?;
    let info = vault
        .setup_channel(channel)
        .await
        .context("configuring storage channel")?;
    println!("Storage channel: {} ({})", info.title, info.id);
    println!("Saved to {}", config_path.display());
    Ok(())
}

// ── `tvault upload` ───────────────────────────────────────────────────────────

async fn cmd_upload(
    vault: &Vault<OpendalStore>,
    files: &[PathBuf],
    plain: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut opts = TransferOptions::default().with_cancel(cancel.clone());
    if vault.config().vault.encryption && !plain {
        opts = opts.with_password(read_password("Vault password: ")?);
    }

    for file in files {
        let pb = make_progress_bar("upload")?;
        pb.set_message(file.display().to_string());
        let file_opts = opts.clone().with_progress(track(&pb));

        let meta = match vault.upload(file, &file_opts).await {
            Ok(meta) => meta,
            Err(e) => {
                pb.abandon();
                return Err(e).with_context(|| format!("uploading {}", file.display()));
            }
        };
        pb.finish_with_message("done".to_string());

        println!("  id:      {}", meta.id);
        println!("  name:    {}", meta.name);
        println!("  bytes:   {}", fmt_bytes(meta.size));
        println!("  stored:  {}", fmt_bytes(meta.total_stored_size()));
        println!("  chunks:  {}", meta.chunk_count());
        println!("  flags:   {}", flags(&meta));
    }
    Ok(())
}

// ── `tvault download` ─────────────────────────────────────────────────────────

async fn cmd_download(
    vault: &Vault<OpendalStore>,
    query: &str,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let meta = vault
        .resolve(query)
        .await
        .with_context(|| format!("finding '{query}'"))?;

    let mut opts = TransferOptions::default().with_cancel(cancel.clone());
    if meta.encrypted {
        opts = opts.with_password(read_password("Vault password: ")?);
    }

    let pb = make_progress_bar("download")?;
    pb.set_message(meta.name.clone());
    let opts = opts.with_progress(track(&pb));

    let path = match vault.download(&meta.id, output, &opts).await {
        Ok(path) => path,
        Err(e) => {
            pb.abandon();
            return Err(e).with_context(|| format!("downloading {}", meta.name));
        }
    };
    pb.finish_with_message("done".to_string());

    println!();
    println!("Downloaded:");
    println!("  local:  {}", path.display());
    println!("  bytes:  {}", fmt_bytes(meta.size));
    Ok(())
}

// ── `tvault list` / `tvault search` ───────────────────────────────────────────

fn print_files(files: &[FileMetadata], json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(files).context("serializing file list")?
        );
        return Ok(());
    }
    if files.is_empty() {
        println!("No files.");
        return Ok(());
    }
    println!("{:<12}  {:>10}  {:>6}  {:<5}  NAME", "ID", "SIZE", "CHUNKS", "FLAGS");
    for meta in files {
        println!(
            "{:<12}  {:>10}  {:>6}  {:<5}  {}",
            meta.id,
            fmt_bytes(meta.size),
            meta.chunk_count(),
            flags(meta),
            meta.name
        );
    }
    Ok(())
}

/// `C` compressed, `E` encrypted.
fn flags(meta: &FileMetadata) -> String {
    let mut s = String::new();
    s.push(if meta.compressed { 'C' } else { '-' });
    s.push(if meta.encrypted { 'E' } else { '-' });
    s
}

// ── `tvault delete` ───────────────────────────────────────────────────────────

async fn cmd_delete(vault: &Vault<OpendalStore>, query: &str) -> Result<()> {
    let deleted = vault
        .delete(query)
        .await
        .with_context(|| format!("deleting '{query}'"))?;
    if deleted {
        println!("Deleted {query}.");
    } else {
        println!("No file matches '{query}'.");
    }
    Ok(())
}

// ── `tvault status` ───────────────────────────────────────────────────────────

async fn cmd_status(vault: &Vault<OpendalStore>, json: bool) -> Result<()> {
    let status = vault.status().await.context("reading vault status")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serializing status")?
        );
        return Ok(());
    }
    println!("tvault v{}", env!("CARGO_PKG_VERSION"));
    println!("  channel:     {}", status.channel_id);
    println!("  files:       {}", status.file_count);
    println!("  total size:  {}", fmt_bytes(status.total_size));
    println!("  stored size: {}", fmt_bytes(status.stored_size));
    println!("  ratio:       {:.2}", status.compression_ratio);
    Ok(())
}

// ── `tvault config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &VaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
