//! sigbak: encrypted messenger backup tool
//!
//! Commands:
//!   dump <backup>                         - list frames with rebuilt SQL
//!   decrypt <backup> -o <db>              - write the database (and payload files)
//!   reencrypt <backup> <out>              - clean up and re-encrypt a backup
//!   desktop unwrap -o <db>                - decrypt the desktop client's database
//!   desktop attachment <file> --key <b64> - decrypt one desktop attachment
//!   config show                           - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sigbak_core::config::SigbakConfig;
use sigbak_crypto::{BackupKdfParams, SafeStoragePlatform};
use sigbak_frames::Frame;
use sigbak_store::{
    desktop, LoadOptions, RelationalStore, SignalBackup, SqliteStore, TABLE_LINKS,
};
use sigbak_stream::{BackupReader, BackupWriter, ReaderOptions};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sigbak",
    version,
    about = "Encrypted messenger backup tool",
    long_about = "sigbak: decrypt, inspect, clean up and re-encrypt messenger backups"
)]
struct Cli {
    /// Path to config.toml
    #[arg(long, short = 'c', env = "SIGBAK_CONFIG", default_value = "~/.config/sigbak/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "SIGBAK_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "SIGBAK_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every frame of a backup
    Dump {
        backup: PathBuf,
        #[command(flatten)]
        pass: PassphraseArgs,
    },

    /// Decrypt a backup into a plain SQLite database
    Decrypt {
        backup: PathBuf,
        /// Output database file
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Also write attachment, sticker and avatar payloads here
        #[arg(long)]
        attachments: Option<PathBuf>,
        #[command(flatten)]
        pass: PassphraseArgs,
    },

    /// Load a backup, drop damaged parts and write it back out encrypted
    Reencrypt {
        backup: PathBuf,
        output: PathBuf,
        /// Close gaps in table ids before exporting
        #[arg(long)]
        compact: bool,
        /// Passphrase for the new backup (default: same as the input)
        #[arg(long, env = "SIGBAK_NEW_PASSPHRASE", hide_env_values = true)]
        new_passphrase: Option<String>,
        #[command(flatten)]
        pass: PassphraseArgs,
    },

    /// Desktop client database and attachments
    Desktop {
        #[command(subcommand)]
        action: DesktopAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct PassphraseArgs {
    /// 30-digit backup passphrase (prompted for when absent)
    #[arg(long, short = 'p', env = "SIGBAK_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
}

#[derive(Subcommand, Debug)]
enum DesktopAction {
    /// Decrypt sql/db.sqlite of a desktop profile
    Unwrap {
        /// Profile directory (overrides config desktop.config_dir)
        #[arg(long)]
        config_dir: Option<PathBuf>,
        /// Output database file
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Safe-storage secret (default: looked up in the OS keychain)
        #[arg(long, env = "SIGBAK_SAFE_STORAGE_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Decrypt one attachment file of a desktop profile
    Attachment {
        file: PathBuf,
        /// Base64 attachment key (64 bytes)
        #[arg(long)]
        key: String,
        /// Plaintext size, to strip padding
        #[arg(long)]
        size: Option<usize>,
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    match cli.command {
        Commands::Dump { backup, pass } => cmd_dump(&config, &backup, &pass),
        Commands::Decrypt { backup, output, attachments, pass } => {
            cmd_decrypt(&config, &backup, &output, attachments.as_deref(), &pass)
        }
        Commands::Reencrypt { backup, output, compact, new_passphrase, pass } => {
            cmd_reencrypt(&config, &backup, &output, compact, new_passphrase, &pass)
        }
        Commands::Desktop { action: DesktopAction::Unwrap { config_dir, output, secret } } => {
            cmd_desktop_unwrap(&config, config_dir, &output, secret)
        }
        Commands::Desktop { action: DesktopAction::Attachment { file, key, size, output } } => {
            cmd_desktop_attachment(&file, &key, size, &output)
        }
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

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

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SigbakConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(SigbakConfig::default())
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn read_passphrase(args: &PassphraseArgs, prompt: &str) -> Result<SecretString> {
    match &args.passphrase {
        Some(p) => Ok(SecretString::from(p.as_str())),
        None => {
            let entered = rpassword::prompt_password(prompt).context("reading passphrase")?;
            Ok(SecretString::from(entered))
        }
    }
}

fn kdf_params(config: &SigbakConfig) -> BackupKdfParams {
    BackupKdfParams { rounds: config.backup.kdf_rounds }
}

fn open_backup(
    config: &SigbakConfig,
    path: &Path,
    passphrase: &SecretString,
) -> Result<BackupReader<std::io::BufReader<File>>> {
    let spinner = make_spinner("open");
    spinner.set_message("deriving backup key");
    let reader = BackupReader::open(
        path,
        passphrase,
        &kdf_params(config),
        ReaderOptions::from(&config.backup),
    )
    .with_context(|| format!("opening backup: {}", path.display()));
    spinner.finish_and_clear();
    reader
}

fn load_backup(config: &SigbakConfig, path: &Path, passphrase: &SecretString) -> Result<SignalBackup> {
    let mut reader = open_backup(config, path, passphrase)?;
    let spinner = make_spinner("load");
    spinner.set_message(path.display().to_string());
    let backup = SignalBackup::load(
        SqliteStore::in_memory()?,
        &mut reader,
        &LoadOptions::from(&config.backup),
    )
    .with_context(|| format!("loading backup: {}", path.display()));
    spinner.finish_and_clear();
    backup
}

// ── `sigbak dump` ─────────────────────────────────────────────────────────────

fn cmd_dump(config: &SigbakConfig, path: &Path, pass: &PassphraseArgs) -> Result<()> {
    let passphrase = read_passphrase(pass, "Backup passphrase: ")?;
    let mut reader = open_backup(config, path, &passphrase)?;

    let header = reader.header();
    println!(
        "# {} (format version {})",
        path.display(),
        header.version.unwrap_or(0)
    );

    let mut count = 0u64;
    loop {
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_frame_local() => {
                println!("{:>10}  <bad frame: {e}>", reader.offset());
                continue;
            }
            Err(e) => return Err(e).context("reading frame"),
        };
        count += 1;
        match &frame {
            Frame::Statement(statement) => println!("{:>6}  {}", count, statement.build_statement()),
            Frame::DatabaseVersion(v) => {
                println!("{:>6}  DatabaseVersion {}", count, v.version.unwrap_or(0))
            }
            other => match other.payload_length() {
                Some(len) => println!("{:>6}  {} ({len} bytes)", count, other.name()),
                None => println!("{:>6}  {}", count, other.name()),
            },
        }
    }

    println!("# {count} frames, {} bad", reader.bad_frames().len());
    for bad in reader.bad_frames() {
        println!("#   offset {}: {} ({})", bad.offset, bad.frame.name(), bad.reason);
    }
    Ok(())
}

// ── `sigbak decrypt` ──────────────────────────────────────────────────────────

fn cmd_decrypt(
    config: &SigbakConfig,
    path: &Path,
    output: &Path,
    attachments: Option<&Path>,
    pass: &PassphraseArgs,
) -> Result<()> {
    let passphrase = read_passphrase(pass, "Backup passphrase: ")?;
    let backup = load_backup(config, path, &passphrase)?;

    backup
        .store()
        .save_to(output)
        .with_context(|| format!("writing database: {}", output.display()))?;
    println!("database → {}", output.display());

    if let Some(dir) = attachments {
        let written = write_payloads(&backup, dir)?;
        println!("{written} payload files → {}", dir.display());
    }
    if !backup.bad_attachments().is_empty() {
        println!("{} attachments failed authentication", backup.bad_attachments().len());
    }
    Ok(())
}

fn write_payloads(backup: &SignalBackup, dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let pb = make_spinner("payloads");
    let mut written = 0;

    let mut write = |name: String, data: sigbak_core::SigbakResult<Vec<u8>>| -> Result<()> {
        let data = data.with_context(|| format!("decrypting {name}"))?;
        let target = dir.join(&name);
        std::fs::write(&target, data).with_context(|| format!("writing {}", target.display()))?;
        pb.set_message(name);
        written += 1;
        Ok(())
    };

    for (key, frame) in backup.attachments() {
        write(format!("{}_{}.bin", key.row_id, key.unique_id), frame.payload.load())?;
    }
    for (row_id, frame) in backup.stickers() {
        write(format!("sticker_{row_id}.bin"), frame.payload.load())?;
    }
    for (recipient, frame) in backup.avatars() {
        write(format!("avatar_{recipient}.bin"), frame.payload.load())?;
    }

    pb.finish_and_clear();
    Ok(written)
}

// ── `sigbak reencrypt` ────────────────────────────────────────────────────────

fn cmd_reencrypt(
    config: &SigbakConfig,
    path: &Path,
    output: &Path,
    compact: bool,
    new_passphrase: Option<String>,
    pass: &PassphraseArgs,
) -> Result<()> {
    let passphrase = read_passphrase(pass, "Backup passphrase: ")?;
    let mut backup = load_backup(config, path, &passphrase)?;

    let dropped = backup.drop_bad_frames().context("dropping bad frames")?;
    if dropped > 0 {
        println!("dropped {dropped} attachments that failed authentication");
    }
    if config.export.clean_attachments {
        backup.clean_attachments().context("cleaning attachments")?;
    }
    if config.export.separate_dates {
        backup
            .separate_colliding_dates()
            .context("separating message dates")?;
    }
    if compact || config.export.compact_ids {
        for link in TABLE_LINKS.iter().filter(|l| l.compactable()) {
            if backup.store().contains_table(link.table)? {
                backup
                    .compact_ids(link.table)
                    .with_context(|| format!("compacting {}", link.table))?;
            }
        }
    }
    let orphans = backup.check_attachment_invariant()?;
    if !orphans.is_empty() {
        tracing::warn!(count = orphans.len(), "payloads without a row in the database");
    }

    let new_passphrase = new_passphrase.map(SecretString::from).unwrap_or(passphrase);
    let version = config
        .export
        .format_version
        .or(backup.header().and_then(|h| h.version))
        .unwrap_or(1);

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let writer = BackupWriter::create_random(
        BufWriter::new(file),
        &new_passphrase,
        version,
        &kdf_params(config),
    )
    .context("starting backup stream")?;

    let spinner = make_spinner("export");
    spinner.set_message(output.display().to_string());
    let (_, stats) = backup.export(writer).context("exporting backup")?;
    spinner.finish_and_clear();

    println!(
        "{} tables, {} rows, {} attachments, {} stickers → {}",
        stats.tables,
        stats.rows,
        stats.attachments,
        stats.stickers,
        output.display()
    );
    if stats.missing_payloads > 0 {
        println!("{} rows had no payload", stats.missing_payloads);
    }
    Ok(())
}

// ── `sigbak desktop` ──────────────────────────────────────────────────────────

fn cmd_desktop_unwrap(
    config: &SigbakConfig,
    config_dir: Option<PathBuf>,
    output: &Path,
    secret: Option<String>,
) -> Result<()> {
    let platform = SafeStoragePlatform::from_name(&config.desktop.platform)?;
    let dir = config_dir
        .or_else(|| config.desktop.config_dir.clone())
        .or_else(|| desktop::default_config_dir(platform))
        .context("no desktop profile directory; use --config-dir or set desktop.config_dir")?;

    let file = desktop::DesktopConfigFile::read(&dir)
        .with_context(|| format!("reading desktop config in {}", dir.display()))?;

    let secret = match (&file.key, secret) {
        (Some(_), _) => None,
        (None, Some(s)) => Some(SecretString::from(s)),
        (None, None) => sigbak_secrets::fetch_secret(
            &config.desktop.secret_service,
            &config.desktop.secret_account,
        )?
        .map(SecretString::from),
    };

    let key = desktop::resolve_database_key(&file, secret.as_ref(), platform)
        .context("resolving database key")?;
    let spinner = make_spinner("unwrap");
    let store = desktop::unwrap_database(&dir, &key, config.desktop.sqlcipher_version, output)
        .with_context(|| format!("decrypting {}", dir.join(desktop::DATABASE_FILE).display()));
    spinner.finish_and_clear();
    let store = store?;

    println!("{} tables → {}", store.tables()?.len(), output.display());
    Ok(())
}

fn cmd_desktop_attachment(file: &Path, key: &str, size: Option<usize>, output: &Path) -> Result<()> {
    let blob = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let plain = sigbak_crypto::open_desktop_attachment(key, &blob, size)
        .with_context(|| format!("decrypting {}", file.display()))?;
    std::fs::write(output, &plain).with_context(|| format!("writing {}", output.display()))?;
    println!("{} bytes → {}", plain.len(), output.display());
    Ok(())
}

// ── `sigbak config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SigbakConfig, config_path: &Path) -> Result<()> {
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
