use std::{error::Error, io::Write, path::PathBuf, process::ExitCode, sync::Arc};

use adb_explorer::{
    Session, SessionEvent, SettingsHandler, TaskId, TaskOutput,
    logging::setup_logging,
    models::{FileEntry, Listing, TransportBackend},
    navigation,
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use mimalloc::MiMalloc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "adb-explorer", version, about = "Browse and manage files on Android devices")]
struct Cli {
    /// Directory holding settings.json and logs
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    /// Transport backend, overrides the saved setting
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// adb executable, overrides the saved setting
    #[arg(long, global = true)]
    adb: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Process,
    Session,
}

impl From<Backend> for TransportBackend {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Process => TransportBackend::Process,
            Backend::Session => TransportBackend::Session,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached devices
    Devices,
    /// Connect to a device over the network
    Connect { target: String },
    /// List a directory
    Ls {
        device: String,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show a single entry
    Stat { device: String, path: String },
    /// Download a file or directory
    Pull { device: String, path: String, destination: Option<PathBuf> },
    /// Upload a file or directory
    Push {
        device: String,
        local: PathBuf,
        #[arg(default_value = "/sdcard")]
        remote_dir: String,
    },
    /// Create a directory
    Mkdir { device: String, path: String },
    /// Delete a file or directory
    Rm { device: String, path: String },
    /// Rename an entry within its directory
    Mv { device: String, path: String, new_name: String },
    /// Print a file
    Cat { device: String, path: String },
}

impl Command {
    fn device(&self) -> Option<&str> {
        match self {
            Self::Devices | Self::Connect { .. } => None,
            Self::Ls { device, .. }
            | Self::Stat { device, .. }
            | Self::Pull { device, .. }
            | Self::Push { device, .. }
            | Self::Mkdir { device, .. }
            | Self::Rm { device, .. }
            | Self::Mv { device, .. }
            | Self::Cat { device, .. } => Some(device),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let app_dir = match cli.app_dir.clone().or_else(|| dirs::data_dir().map(|d| d.join("adb-explorer"))) {
        Some(dir) => dir,
        None => {
            eprintln!("Failed to determine the app directory, pass --app-dir");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match setup_logging(&app_dir.join("logs")) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to setup logging: {e:#}");
            None
        }
    };
    info!(version = env!("CARGO_PKG_VERSION"), "Starting adb-explorer");

    match run(cli, app_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = e.as_ref() as &dyn Error, "Command failed");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, app_dir: PathBuf) -> Result<()> {
    let mut settings = (*SettingsHandler::new(app_dir).load()).clone();
    if let Some(backend) = cli.backend {
        settings.backend = backend.into();
    }
    if let Some(adb) = cli.adb {
        settings.adb_path = adb;
    }

    let mut session = Session::new(Arc::new(settings))?;
    session.start().await?;

    if let Some(device) = cli.command.device() {
        let id = session.request_devices()?;
        wait(&mut session, &id).await?;
        session.select_device(device)?;
    }
    let result = execute(&mut session, cli.command).await;
    if let Err(e) = session.shutdown().await {
        error!(error = e.as_ref() as &dyn Error, "Failed to stop adb server");
    }
    result
}

async fn execute(session: &mut Session, command: Command) -> Result<()> {
    match command {
        Command::Devices => {
            let id = session.request_devices()?;
            wait(session, &id).await?;
            for device in session.devices() {
                println!("{:<24} {:<14} {}", device.id, device.state.to_string(), device.display_name);
            }
        }
        Command::Connect { target } => {
            let id = session.connect(&target)?;
            wait(session, &id).await?;
        }
        Command::Ls { path, .. } => {
            ensure_directory(session, &path)?;
            let id = session.list()?;
            if let TaskOutput::Listing(listing) = wait(session, &id).await? {
                print_listing(&listing);
            }
        }
        Command::Stat { path, .. } => {
            let entry = stat(session, &path).await?;
            print_entry(&entry);
        }
        Command::Pull { path, destination, .. } => {
            let entry = stat(session, &path).await?;
            let id = session.download(&entry, destination)?;
            wait(session, &id).await?;
        }
        Command::Push { local, remote_dir, .. } => {
            ensure_directory(session, &remote_dir)?;
            let id = session.upload(&local)?;
            wait(session, &id).await?;
        }
        Command::Mkdir { path, .. } => {
            let path = navigation::normalize(&path);
            let (parent, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
            ensure_directory(session, if parent.is_empty() { "/" } else { parent })?;
            let id = session.create_directory(name)?;
            wait(session, &id).await?;
        }
        Command::Rm { path, .. } => {
            let entry = stat(session, &path).await?;
            let id = session.delete(&entry)?;
            wait(session, &id).await?;
        }
        Command::Mv { path, new_name, .. } => {
            let entry = stat(session, &path).await?;
            let id = session.rename(&entry, &new_name)?;
            wait(session, &id).await?;
        }
        Command::Cat { path, .. } => {
            let entry = stat(session, &path).await?;
            let id = session.read_file(&entry)?;
            if let TaskOutput::Text(text) = wait(session, &id).await? {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(text.as_bytes()).context("Failed to write to stdout")?;
                stdout.flush().context("Failed to write to stdout")?;
            }
        }
    }
    Ok(())
}

fn ensure_directory(session: &mut Session, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("'{path}' is not an absolute path");
    }
    session.jump_to_path(path);
    Ok(())
}

async fn stat(session: &mut Session, path: &str) -> Result<FileEntry> {
    let id = session.stat(&navigation::normalize(path))?;
    match wait(session, &id).await? {
        TaskOutput::Entry(entry) => Ok(entry),
        other => Err(anyhow!("Unexpected result {other:?}")),
    }
}

/// Drives the session until `id` finishes, printing its progress and the final notification
async fn wait(session: &mut Session, id: &TaskId) -> Result<TaskOutput> {
    while let Some(event) = session.next_event().await {
        if event.id() != id {
            continue;
        }
        let notification = event.notification();
        match event {
            SessionEvent::Started { .. } => {}
            SessionEvent::Progress { progress, .. } => {
                eprint!("\r{} {:>3}% {}", progress.label, progress.percent(), progress.amount_text());
                if progress.percent() == 100 {
                    eprintln!();
                }
            }
            SessionEvent::Completed { output, .. } => {
                if let Some(notification) = notification {
                    eprintln!("{notification}");
                }
                return Ok(output);
            }
            SessionEvent::Failed { error, .. } => {
                return Err(error.context(format!("Failed to {id}")));
            }
        }
    }
    bail!("Task queue closed before {id} finished")
}

fn print_listing(listing: &Listing) {
    for entry in &listing.entries {
        print_entry(entry);
    }
    if let Some(diagnostics) = &listing.diagnostics {
        eprintln!("{diagnostics}");
    }
}

fn print_entry(entry: &FileEntry) {
    let mut line = format!(
        "{} {:>10} {:<16} {}",
        entry.permissions,
        entry.human_size(),
        entry.human_date_now(),
        entry.name
    );
    if let Some(target) = &entry.link_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    println!("{line}");
}
