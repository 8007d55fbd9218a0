use std::{fmt::Debug, path::Path, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::{
    error::ExplorerError,
    listing::parse_listing,
    models::{ConnectTarget, DeviceRecord, FileEntry, Listing, Settings, TransportBackend},
    navigation,
    task::ProgressSender,
};

pub mod process;
pub mod session;
pub mod shell;
pub mod sync;
#[cfg(test)]
pub(crate) mod testing;

/// Result of one device command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Exit code 1 from a listing means it ran but may be partial or empty
    pub fn listing_ok(&self) -> bool {
        matches!(self.exit_code, 0 | 1)
    }

    /// stderr if there is any, stdout otherwise
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() { self.stdout.trim().to_string() } else { stderr.to_string() }
    }

    pub fn failure(&self, argv: &[String]) -> ExplorerError {
        ExplorerError::CommandFailed {
            command: argv.join(" "),
            code: self.exit_code,
            message: self.message(),
        }
    }

    /// stdout on exit code 0, [`ExplorerError::CommandFailed`] otherwise
    pub fn into_checked(self, argv: &[String]) -> Result<String> {
        if self.success() { Ok(self.stdout) } else { Err(self.failure(argv).into()) }
    }
}

/// Way of talking to devices through adb.
///
/// `argv` tokens are handed to the device shell verbatim, see [`shell`] for builders.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    fn backend(&self) -> TransportBackend;

    /// Version string of the adb tool or server
    async fn version(&self) -> Result<String>;

    async fn start_server(&self) -> Result<()>;

    async fn kill_server(&self) -> Result<()>;

    async fn devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Dials a network device. Returns the serial the device is listed under.
    async fn connect(&self, target: &ConnectTarget) -> Result<String>;

    async fn disconnect(&self, serial: &str) -> Result<String>;

    async fn execute(&self, serial: &str, argv: &[String]) -> Result<CommandOutput>;

    /// Like [`execute`](Self::execute), calling `on_line` for each stdout line as it arrives
    async fn execute_streaming(
        &self,
        serial: &str,
        argv: &[String],
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<CommandOutput> {
        let output = self.execute(serial, argv).await?;
        output.stdout.lines().for_each(&mut *on_line);
        Ok(output)
    }

    async fn list(&self, serial: &str, directory: &str) -> Result<Listing> {
        shell_listing(self, serial, directory).await
    }

    async fn stat(&self, serial: &str, path: &str) -> Result<FileEntry> {
        shell_stat(self, serial, path).await
    }

    /// Copies `remote` (file or directory) into `local_dir`. Returns a success message.
    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local_dir: &Path,
        progress: &ProgressSender,
    ) -> Result<String>;

    /// Copies `local` (file or directory) into `remote_dir`. Returns a success message.
    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote_dir: &str,
        progress: &ProgressSender,
    ) -> Result<String>;
}

/// Picks the backend named in the settings
#[instrument(level = "debug", skip(settings), fields(backend = ?settings.backend), err)]
pub fn create_transport(settings: &Settings) -> Result<Arc<dyn Transport>> {
    info!("Creating transport");
    Ok(match settings.backend {
        TransportBackend::Process => Arc::new(process::ProcessTransport::new(settings)?),
        TransportBackend::Session => Arc::new(session::SessionTransport::new(settings)),
    })
}

/// Builds a [`Listing`] from the output of a listing-class command
pub(crate) fn listing_from_output(
    output: CommandOutput,
    directory: &str,
    argv: &[String],
) -> Result<Listing> {
    if !output.listing_ok() {
        return Err(output.failure(argv).into());
    }
    let entries = parse_listing(&output.stdout, directory);
    let diagnostics = (!output.success() || !output.stderr.trim().is_empty())
        .then(|| output.message())
        .filter(|m| !m.is_empty());
    if let Some(diagnostics) = &diagnostics {
        debug!(directory, %diagnostics, "Listing finished with diagnostics");
    }
    Ok(Listing { directory: navigation::normalize(directory), entries, diagnostics })
}

/// `ls -a -l` through [`Transport::execute`]
pub(crate) async fn shell_listing<T: Transport + ?Sized>(
    transport: &T,
    serial: &str,
    directory: &str,
) -> Result<Listing> {
    let argv = shell::list(directory);
    let output = transport.execute(serial, &argv).await?;
    listing_from_output(output, directory, &argv)
}

/// `ls -l -d` through [`Transport::execute`]
pub(crate) async fn shell_stat<T: Transport + ?Sized>(
    transport: &T,
    serial: &str,
    path: &str,
) -> Result<FileEntry> {
    let path = navigation::normalize(path);
    let argv = shell::stat(&path);
    let output = transport.execute(serial, &argv).await?;
    if !output.listing_ok() {
        return Err(output.failure(&argv).into());
    }
    let parent = FileEntry::directory_at(&path).location();
    let mut entry = parse_listing(&output.stdout, &parent)
        .into_iter()
        .next()
        .ok_or_else(|| output.failure(&argv))?;
    entry.name = if path == "/" { path.clone() } else { FileEntry::directory_at(&path).name };
    entry.path = path;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::{testing::ScriptedTransport, *};
    use crate::{error::ErrorKind, models::FileKind};

    #[tokio::test(flavor = "multi_thread")]
    async fn exit_code_one_is_a_partial_listing() {
        let transport = ScriptedTransport::new();
        transport.script(
            "ls -a -l '/sdcard/'",
            CommandOutput {
                exit_code: 1,
                stdout: "drwxrwx--x 2 root sdcard_rw 4096 2024-01-01 00:00 Download\n".into(),
                stderr: "ls: /sdcard/secret: Permission denied".into(),
            },
        );
        let listing = transport.list("emulator-5554", "/sdcard").await.unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.diagnostics.as_deref(), Some("ls: /sdcard/secret: Permission denied"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_exit_codes_fail_the_listing() {
        let transport = ScriptedTransport::new();
        transport.script(
            "ls -a -l '/nope/'",
            CommandOutput { exit_code: 2, stdout: String::new(), stderr: "No such file".into() },
        );
        let err = transport.list("emulator-5554", "/nope").await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::CommandFailed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stat_uses_requested_path() {
        let transport = ScriptedTransport::new();
        transport.script_ok(
            "ls -l -d '/sdcard/cache'",
            "lrwxrwxrwx 1 root root 11 2024-01-01 00:00 /sdcard/cache -> /data/cache\n",
        );
        let entry = transport.stat("emulator-5554", "/sdcard//cache/").await.unwrap();
        assert_eq!(entry.path, "/sdcard/cache");
        assert_eq!(entry.name, "cache");
        assert_eq!(entry.kind(), FileKind::Link);
        assert_eq!(entry.link_target.as_deref(), Some("/data/cache"));
    }

    #[test]
    fn checked_output() {
        let argv = shell::mkdir("/a");
        let ok = CommandOutput { exit_code: 0, stdout: "x".into(), stderr: String::new() };
        assert_eq!(ok.into_checked(&argv).unwrap(), "x");
        let failed = CommandOutput { exit_code: 1, stdout: String::new(), stderr: "denied".into() };
        let err = failed.into_checked(&argv).unwrap_err();
        assert_eq!(format!("{err}"), "Command `mkdir '/a'` failed with exit code 1: denied");
    }
}
