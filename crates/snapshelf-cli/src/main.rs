//! Snapshelf CLI - move a photo library between devices

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use snapshelf_core::Error;
use snapshelf_core::config::Config;
use snapshelf_core::storage::FileStore;
use snapshelf_core::sync::{
    AttachmentSink, DeviceIdentityManager, DirectoryAttachmentSink, FileScanner, ImportOutcome,
    LibrarySnapshot, PlainTextRenderer, SyncManager, TransferSettings, write_codes,
};
use tracing::info;
use uuid::Uuid;


#[derive(Parser)]
#[command(name = "snapshelf")]
#[command(author, version, about = "Move a photo library between devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export a library as visual-code texts
    Export {
        /// Library snapshot JSON file
        #[arg(short, long)]
        library: PathBuf,
        /// Directory receiving one file per code
        #[arg(short, long)]
        out: PathBuf,
        /// Characters per code, header included
        #[arg(long)]
        max_fragment_size: Option<usize>,
        /// Most codes one export may produce
        #[arg(long)]
        max_fragments: Option<usize>,
    },

    /// Export a library as a JSON attachment
    ExportFile {
        /// Library snapshot JSON file
        #[arg(short, long)]
        library: PathBuf,
        /// Directory receiving the attachment
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Import scanned code texts
    Import {
        /// Continue a pending session
        #[arg(short, long)]
        session: Option<Uuid>,
        /// Write the received library here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Files holding one scanned code each
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Import a JSON attachment
    ImportFile {
        /// Attachment file
        file: PathBuf,
        /// Write the received library here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage pending import sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show or rename this device
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// List sessions waiting for more codes
    List,
    /// Drop a pending session
    Abandon { id: Uuid },
}

#[derive(Subcommand, Debug)]
enum DeviceAction {
    /// Show the device identity
    Show,
    /// Change the device name
    Rename { name: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("snapshelf=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;

    if let Err(err) = &result {
        if let Some(core) = err.downcast_ref::<Error>() {
            if let Some(hint) = core.suggestion() {
                eprintln!("Hint: {}", hint);
            }
        }
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (format, quiet) = (cli.format, cli.quiet);
    match cli.command {
        Commands::Config { action } => cmd_config(action, quiet),
        Commands::Export {
            library,
            out,
            max_fragment_size,
            max_fragments,
        } => {
            let mut config = Config::load()?;
            if let Some(size) = max_fragment_size {
                config.transfer.max_fragment_size = size;
            }
            if let Some(count) = max_fragments {
                config.transfer.max_fragments = count;
            }
            config.validate()?;
            let manager = open_manager(&config).await?;
            cmd_export(&manager, &library, &out, format, quiet).await
        }
        Commands::ExportFile { library, out } => {
            let manager = open_manager(&Config::load()?).await?;
            cmd_export_file(&manager, &library, &out, format, quiet).await
        }
        Commands::Import {
            session,
            output,
            files,
        } => {
            let manager = open_manager(&Config::load()?).await?;
            cmd_import(&manager, session, files, output.as_deref(), format, quiet).await
        }
        Commands::ImportFile { file, output } => {
            let manager = open_manager(&Config::load()?).await?;
            cmd_import_file(&manager, &file, output.as_deref(), format, quiet).await
        }
        Commands::Sessions { action } => {
            let manager = open_manager(&Config::load()?).await?;
            cmd_sessions(&manager, action, format, quiet).await
        }
        Commands::Device { action } => {
            let manager = open_manager(&Config::load()?).await?;
            cmd_device(manager.identity(), action, format, quiet).await
        }
    }
}

async fn open_manager(config: &Config) -> anyhow::Result<SyncManager> {
    let data_dir = config.data_dir()?;
    let store = Arc::new(FileStore::open(&data_dir).await?);
    let mut identity = DeviceIdentityManager::new(store.clone());
    if let Some(name) = &config.device.default_name {
        identity = identity.with_default_name(name.clone());
    }
    Ok(SyncManager::new(store, TransferSettings::from(config)).with_identity(identity))
}

fn read_library(path: &Path) -> anyhow::Result<LibrarySnapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read library file: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse library file: {}", path.display()))
}

fn write_library(path: &Path, snapshot: &LibrarySnapshot) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write library file: {}", path.display()))
}

async fn cmd_export(
    manager: &SyncManager,
    library: &Path,
    out: &Path,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let snapshot = read_library(library)?;
    let bundle = manager.export_codes(&snapshot).await?;
    let paths = write_codes(&PlainTextRenderer, &bundle.codes, out).await?;

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "mode": bundle.mode,
                "codes": paths,
                "envelope": bundle.metadata,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text if !quiet => {
            println!("Exported {} code(s) ({})", paths.len(), bundle.mode);
            println!("  Items: {}", bundle.metadata.items);
            println!("  Groups: {}", bundle.metadata.groups);
            println!("  Tags: {}", bundle.metadata.tags);
            for path in &paths {
                println!("  {}", path.display());
            }
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

async fn cmd_export_file(
    manager: &SyncManager,
    library: &Path,
    out: &Path,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let snapshot = read_library(library)?;
    let attachment = manager.export_attachment(&snapshot).await?;
    let sink = DirectoryAttachmentSink::new(out);
    sink.deliver(&attachment).await?;
    let path = sink.path_for(&attachment);

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "path": path,
                "subject": attachment.subject,
                "body": attachment.body,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text if !quiet => {
            println!("Saved {}", path.display());
            println!("  Subject: {}", attachment.subject);
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

async fn cmd_import(
    manager: &SyncManager,
    session: Option<Uuid>,
    files: Vec<PathBuf>,
    output: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let id = match session {
        Some(id) => {
            manager.resume_import(id).await?;
            id
        }
        None => manager.begin_import().await?,
    };

    let scanner = FileScanner::new(files);
    let outcome = match manager.scan_until_complete(id, &scanner).await {
        Ok(outcome) => outcome,
        Err(Error::IncompleteTransfer { missing }) => {
            let missing: Vec<String> = missing.iter().map(|i| (i + 1).to_string()).collect();
            return Err(anyhow!(
                "Import session {} still needs code(s) {}. Continue with `snapshelf import --session {} <files>`",
                id,
                missing.join(", "),
                id
            ));
        }
        Err(err) => return Err(err.into()),
    };

    report_outcome(&outcome, output, format, quiet)
}

async fn cmd_import_file(
    manager: &SyncManager,
    file: &Path,
    output: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read attachment: {}", file.display()))?;
    let outcome = manager.import_attachment(&bytes).await?;
    report_outcome(&outcome, output, format, quiet)
}

fn report_outcome(
    outcome: &ImportOutcome,
    output: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    if let Some(path) = output {
        write_library(path, &outcome.snapshot)?;
        info!(path = %path.display(), "Wrote received library");
    }

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "deviceId": outcome.device_id,
                "version": outcome.version,
                "exportedAt": outcome.exported_at,
                "fragments": outcome.fragments,
                "items": outcome.snapshot.items.len(),
                "groups": outcome.snapshot.groups.len(),
                "tags": outcome.snapshot.tags.len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text if !quiet => {
            println!("Import complete");
            println!("  From device: {}", outcome.device_id);
            println!("  Format: {}", outcome.version);
            println!("  Items: {}", outcome.snapshot.items.len());
            println!("  Groups: {}", outcome.snapshot.groups.len());
            println!("  Tags: {}", outcome.snapshot.tags.len());
            if let Some(path) = output {
                println!("  Written to: {}", path.display());
            }
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

async fn cmd_sessions(
    manager: &SyncManager,
    action: SessionAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        SessionAction::List => {
            let sessions = manager.pending_sessions().await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                if !quiet {
                    println!("No pending import sessions.");
                }
            } else {
                for session in sessions {
                    let total = session
                        .total
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "{}  {}  {}/{}  {}",
                        session.id,
                        session.state,
                        session.received,
                        total,
                        session.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        SessionAction::Abandon { id } => {
            manager.abandon_import(id).await?;
            if !quiet {
                println!("Abandoned import session {}", id);
            }
        }
    }
    Ok(())
}

async fn cmd_device(
    identity: &DeviceIdentityManager,
    action: DeviceAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let device = match action {
        DeviceAction::Show => identity.load_or_create().await?,
        DeviceAction::Rename { name } => identity.rename(&name).await?,
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&device)?),
        OutputFormat::Text if !quiet => {
            println!("Device: {}", device.device_name);
            println!("  ID: {}", device.device_id);
            match device.last_sync_timestamp {
                Some(ts) => println!("  Last sync: {}", ts),
                None => println!("  Last sync: never"),
            }
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
