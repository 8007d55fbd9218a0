use std::{
    collections::HashSet,
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing::{debug, info, instrument, trace};

use crate::{
    adb::{Transport, shell},
    error::{ExplorerError, precondition},
    models::{Device, FileEntry, FileKind, Listing, Settings},
    navigation::{self, NavigationState},
    task::{Job, ProgressSender},
    utils::sanitize_name,
};

/// Kind of a link target judged from the output of [`shell::link_kind_check`]
pub fn link_kind_from_listing(output: &str) -> FileKind {
    if output.trim_start().starts_with('d') {
        FileKind::Directory
    } else if output.to_lowercase().contains("not a directory") {
        FileKind::File
    } else {
        FileKind::Unknown
    }
}

/// Follows the link at `path` as a directory. Transport errors give [`FileKind::Unknown`].
#[instrument(level = "debug", skip(transport))]
pub async fn resolve_link_kind(transport: &dyn Transport, serial: &str, path: &str) -> FileKind {
    match transport.execute(serial, &shell::link_kind_check(path)).await {
        Ok(output) => link_kind_from_listing(&format!("{}{}", output.stdout, output.stderr)),
        Err(e) => {
            debug!(error = e.as_ref() as &dyn Error, path, "Link kind check failed");
            FileKind::Unknown
        }
    }
}

/// Sets the target kind of every link in `listing` from a single listing of the
/// directory's subdirectories
#[instrument(level = "debug", skip(transport, listing), fields(directory = %listing.directory))]
pub async fn resolve_link_kinds(transport: &dyn Transport, serial: &str, listing: &mut Listing) {
    if !listing.entries.iter().any(FileEntry::is_link) {
        return;
    }
    let directories: Option<HashSet<String>> =
        match transport.execute(serial, &shell::list_directories(&listing.directory)).await {
            Ok(output) if output.listing_ok() => Some(
                output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(navigation::normalize)
                    .collect(),
            ),
            Ok(output) => {
                debug!(exit_code = output.exit_code, message = %output.message(), "Directory listing failed");
                None
            }
            Err(e) => {
                debug!(error = e.as_ref() as &dyn Error, "Directory listing failed");
                None
            }
        };

    for entry in listing.entries.iter_mut().filter(|e| e.is_link()) {
        entry.link_target_kind = Some(match &directories {
            Some(directories) if directories.contains(&entry.path) => FileKind::Directory,
            Some(_) => FileKind::File,
            None => FileKind::Unknown,
        });
    }
}

/// Runs a command that prints nothing on success
async fn run_quiet(transport: &dyn Transport, serial: &str, argv: &[String]) -> Result<()> {
    let output = transport.execute(serial, argv).await?;
    trace!(?output, "Command finished");
    if output.success() && output.stdout.trim().is_empty() && output.stderr.trim().is_empty() {
        Ok(())
    } else {
        Err(output.failure(argv).into())
    }
}

/// Rejects names that would address anything but a direct child. Names are used
/// exactly as given.
fn validate_name(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(precondition("Name can't be empty"));
    }
    if name.trim() != name {
        return Err(precondition(format!("'{name}' starts or ends with whitespace")));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(precondition(format!("'{name}' contains a path separator")));
    }
    if !navigation::is_plain_name(name) {
        return Err(precondition(format!("'{name}' is not a valid name")));
    }
    Ok(name.to_string())
}

/// File operations on the active device, rooted at the current navigation path.
///
/// Every operation validates synchronously and hands back a [`Job`] to run on a worker.
#[derive(Debug)]
pub struct FileRepository {
    transport: Arc<dyn Transport>,
    settings: Arc<Settings>,
    device: Option<Device>,
    navigation: NavigationState,
}

impl FileRepository {
    pub fn new(transport: Arc<dyn Transport>, settings: Arc<Settings>) -> Self {
        Self { transport, settings, device: None, navigation: NavigationState::new() }
    }

    /// Switches to `device`, or to none. Navigation starts over at `/` either way.
    pub fn set_device(&mut self, device: Option<Device>) {
        self.device = device;
        self.navigation.reset();
    }

    /// Refreshes the active device's details, keeping the navigation path
    pub fn update_device(&mut self, device: Device) {
        if self.device.as_ref().is_some_and(|d| d.id == device.id) {
            self.device = Some(device);
        }
    }

    pub fn active_device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn navigation(&self) -> &NavigationState {
        &self.navigation
    }

    pub fn current_path(&self) -> String {
        self.navigation.current_path()
    }

    pub fn descend_into(&mut self, entry: &FileEntry) -> bool {
        self.device.is_some() && self.navigation.descend_into(entry)
    }

    pub fn ascend(&mut self) -> bool {
        self.navigation.ascend()
    }

    pub fn jump_to(&mut self, entry: &FileEntry) -> bool {
        self.device.is_some() && self.navigation.jump_to(entry)
    }

    /// Serial of the active device if it can take commands
    fn ready_serial(&self) -> Result<String> {
        let device = self.device.as_ref().ok_or_else(|| precondition("No device selected"))?;
        if !device.is_available() {
            return Err(ExplorerError::DeviceUnavailable(format!(
                "{} is {}",
                device.display_name, device.state
            ))
            .into());
        }
        Ok(device.id.clone())
    }

    /// Contents of the current directory
    pub fn list(&self) -> Result<Job<Listing>> {
        let serial = self.ready_serial()?;
        let directory = self.current_path();
        let transport = self.transport.clone();
        Ok(async move {
            let mut listing = transport
                .list(&serial, &directory)
                .await
                .with_context(|| format!("Failed to list {directory}"))?;
            resolve_link_kinds(transport.as_ref(), &serial, &mut listing).await;
            info!(%directory, count = listing.entries.len(), "Listed directory");
            Ok(listing)
        }
        .boxed())
    }

    /// Properties of one node, link target kind included
    pub fn stat(&self, path: &str) -> Result<Job<FileEntry>> {
        let serial = self.ready_serial()?;
        if path.trim().is_empty() {
            return Err(precondition("Path can't be empty"));
        }
        let path = if path.starts_with('/') {
            navigation::normalize(path)
        } else {
            navigation::join(&self.current_path(), path)
        };
        let transport = self.transport.clone();
        Ok(async move {
            let mut entry = transport.stat(&serial, &path).await?;
            if entry.is_link() {
                entry.link_target_kind =
                    Some(resolve_link_kind(transport.as_ref(), &serial, &entry.path).await);
            }
            Ok(entry)
        }
        .boxed())
    }

    pub fn rename(&self, entry: &FileEntry, new_name: &str) -> Result<Job<String>> {
        let new_name = validate_name(new_name)?;
        let serial = self.ready_serial()?;
        let from = entry.path.clone();
        let to = navigation::join(&entry.location(), &new_name);
        let transport = self.transport.clone();
        Ok(async move {
            run_quiet(transport.as_ref(), &serial, &shell::rename(&from, &to)).await?;
            Ok(format!("Renamed '{from}' to '{to}'"))
        }
        .boxed())
    }

    /// Deletes `entry`, recursively when it is a directory
    pub fn remove(&self, entry: &FileEntry) -> Result<Job<String>> {
        let serial = self.ready_serial()?;
        let path = navigation::normalize(&entry.path);
        if path == "/" {
            return Err(precondition("Can't delete the root directory"));
        }
        let is_directory = entry.kind() == FileKind::Directory;
        let transport = self.transport.clone();
        Ok(async move {
            run_quiet(transport.as_ref(), &serial, &shell::remove(&path, is_directory)).await?;
            Ok(if is_directory {
                format!("Folder '{path}' has been deleted")
            } else {
                format!("File '{path}' has been deleted")
            })
        }
        .boxed())
    }

    /// Creates `name` in the current directory
    pub fn mkdir(&self, name: &str) -> Result<Job<String>> {
        let name = validate_name(name)?;
        let serial = self.ready_serial()?;
        let path = navigation::join(&self.current_path(), &name);
        let transport = self.transport.clone();
        Ok(async move {
            run_quiet(transport.as_ref(), &serial, &shell::mkdir(&path)).await?;
            Ok(format!("Folder '{path}' has been created"))
        }
        .boxed())
    }

    /// Default download folder for the active device
    fn default_destination(&self) -> Option<PathBuf> {
        let device = self.device.as_ref()?;
        Some(Path::new(&self.settings.downloads_location).join(sanitize_name(&device.display_name)))
    }

    /// Copies `entry` into `destination`, or the device's download folder when `None`
    pub fn download(
        &self,
        entry: &FileEntry,
        destination: Option<PathBuf>,
        progress: ProgressSender,
    ) -> Result<Job<String>> {
        let serial = self.ready_serial()?;
        let destination = match destination {
            Some(destination) => destination,
            None => self.default_destination().ok_or_else(|| precondition("No device selected"))?,
        };
        let remote = entry.path.clone();
        let transport = self.transport.clone();
        Ok(async move {
            fs_err::tokio::create_dir_all(&destination)
                .await
                .context("Failed to create download folder")?;
            transport.pull(&serial, &remote, &destination, &progress).await
        }
        .boxed())
    }

    /// Copies the local file or folder `local` into the current directory
    pub fn upload(&self, local: &Path, progress: ProgressSender) -> Result<Job<String>> {
        let serial = self.ready_serial()?;
        if !local.exists() {
            return Err(precondition(format!("{} does not exist", local.display())));
        }
        let local = local.to_path_buf();
        let remote_dir = self.current_path();
        let transport = self.transport.clone();
        Ok(async move { transport.push(&serial, &local, &remote_dir, &progress).await }.boxed())
    }

    /// Text contents of a file
    pub fn read_file(&self, entry: &FileEntry) -> Result<Job<String>> {
        let serial = self.ready_serial()?;
        if entry.is_directory() {
            return Err(precondition(format!("Can't open. {} is a directory", entry.name)));
        }
        let path = entry.path.clone();
        let transport = self.transport.clone();
        Ok(async move {
            let argv = shell::cat(&path);
            transport.execute(&serial, &argv).await?.into_checked(&argv)
        }
        .boxed())
    }
}
