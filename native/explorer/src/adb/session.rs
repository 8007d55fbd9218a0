use std::{
    collections::HashMap,
    error::Error,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use derive_more::Debug;
use forensic_adb::{DeviceState as AdbDeviceState, DirectoryTransferProgress, UnixPath};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
    process::Command,
    sync::{Mutex, mpsc},
    time::timeout,
};
use tracing::{Instrument, Span, debug, info, instrument, trace, warn};

use super::{CommandOutput, Transport, shell, shell_listing, sync};
use crate::{
    error::{ErrorKind, ExplorerError},
    listing::{RawEntry, entry_from_raw, parse_listing},
    models::{
        ConnectTarget, DeviceRecord, FileEntry, FileKind, Listing, ProgressAmount, Settings,
        TransferProgress, TransportBackend,
    },
    navigation,
    task::ProgressSender,
    utils::resolve_binary_path,
};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// Transport that keeps one session per device open on the adb server
#[derive(Debug)]
pub struct SessionTransport {
    #[debug(skip)]
    host: forensic_adb::Host,
    /// `host:port` of the adb server
    server: String,
    adb_path: String,
    privileged: bool,
    preserve_timestamps: bool,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
}

impl SessionTransport {
    pub fn new(settings: &Settings) -> Self {
        let host = forensic_adb::Host {
            host: Some("127.0.0.1".to_string()),
            port: Some(settings.server_port),
        };
        Self {
            host,
            server: format!("127.0.0.1:{}", settings.server_port),
            adb_path: settings.adb_path.clone(),
            privileged: settings.run_privileged,
            preserve_timestamps: settings.preserve_timestamps,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Cached session for `serial`, opened on first use
    async fn session(&self, serial: &str) -> Result<Arc<DeviceSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(serial) {
            return Ok(session.clone());
        }
        let session = Arc::new(DeviceSession::open(&self.host, &self.server, serial).await?);
        sessions.insert(serial.to_string(), session.clone());
        Ok(session)
    }

    /// Drops the cached session when `result` failed for a reason other than a reported
    /// command failure, so the next call starts a fresh one
    async fn evict_on_failure<T>(&self, serial: &str, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if ErrorKind::of(&e) != ErrorKind::Other => Err(e),
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, serial, "Device session failed, evicting");
                self.sessions.lock().await.remove(serial);
                Err(e.context(ExplorerError::DeviceUnavailable(format!("{serial}: session lost"))))
            }
        }
    }

    async fn is_server_running(&self) -> bool {
        match timeout(Duration::from_millis(1000), self.host.check_host_running()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = &e as &dyn Error, "ADB server check failed");
                false
            }
            Err(_) => {
                debug!("Timed out while checking ADB server status (likely not running)");
                false
            }
        }
    }

    fn resolve_adb(&self) -> Result<PathBuf> {
        resolve_binary_path(Some(&self.adb_path), "adb")
            .map_err(|e| ExplorerError::TransportUnavailable(format!("{e:#}")).into())
    }

    async fn host_query(&self, request: &str) -> Result<String> {
        sync::host_query(&self.server, request).await.map_err(|e| {
            if e.chain().any(|c| c.downcast_ref::<io::Error>().is_some()) {
                e.context(ExplorerError::TransportUnavailable(format!(
                    "adb server at {} is not reachable",
                    self.server
                )))
            } else {
                e
            }
        })
    }
}

#[async_trait]
impl Transport for SessionTransport {
    fn backend(&self) -> TransportBackend {
        TransportBackend::Session
    }

    async fn version(&self) -> Result<String> {
        let reply = self.host_query("host:version").await?;
        let version = u32::from_str_radix(reply.trim(), 16).context("Invalid server version")?;
        Ok(format!("Android Debug Bridge server protocol version {version}"))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn start_server(&self) -> Result<()> {
        if self.is_server_running().await {
            return Ok(());
        }
        let adb_path = self.resolve_adb()?;
        info!(path = %adb_path.display(), "ADB server not running, starting it");
        let mut command = Command::new(&adb_path);
        command.args(["-P", &self.host.port.unwrap_or(5037).to_string(), "start-server"]);
        #[cfg(target_os = "windows")]
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW
        let output = timeout(Duration::from_secs(10), command.output())
            .await
            .map_err(|_| anyhow!("Timed out while starting ADB server"))?
            .context("Failed to start ADB server")?;
        if !output.status.success() {
            bail!("Failed to start ADB server: {}", String::from_utf8_lossy(&output.stderr));
        }
        info!("ADB server started successfully");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn kill_server(&self) -> Result<()> {
        self.sessions.lock().await.clear();
        let adb_path = self.resolve_adb().ok().map(|p| p.to_string_lossy().to_string());
        self.host.kill_server(adb_path.as_deref()).await.context("Failed to kill ADB server")?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn devices(&self) -> Result<Vec<DeviceRecord>> {
        let devices = self.host.devices::<Vec<_>>().await.map_err(|e| {
            anyhow::Error::new(e).context(ExplorerError::TransportUnavailable(format!(
                "adb server at {} is not reachable",
                self.server
            )))
        })?;
        Ok(devices
            .into_iter()
            .map(|d| DeviceRecord {
                state: state_name(&d.state),
                serial: d.serial,
                properties: d.info.into_iter().collect(),
            })
            .collect())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn connect(&self, target: &ConnectTarget) -> Result<String> {
        let serial = target.serial();
        if let ConnectTarget::Serial(_) = target {
            return Ok(serial);
        }
        let reply = self.host_query(&format!("host:connect:{serial}")).await?;
        if reply.contains("connected to") {
            debug!(serial, %reply, "Connected");
            Ok(serial)
        } else {
            Err(ExplorerError::CommandFailed {
                command: format!("connect {serial}"),
                code: 1,
                message: reply.trim().to_string(),
            }
            .into())
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn disconnect(&self, serial: &str) -> Result<String> {
        self.sessions.lock().await.remove(serial);
        let reply = self.host_query(&format!("host:disconnect:{serial}")).await?;
        Ok(reply.trim().to_string())
    }

    async fn execute(&self, serial: &str, argv: &[String]) -> Result<CommandOutput> {
        let argv = shell::wrap(argv, self.privileged);
        let result = async { self.session(serial).await?.shell_with_status(&argv).await }.await;
        self.evict_on_failure(serial, result).await
    }

    /// Sync protocol listing. Privileged sessions list through `su` instead since the
    /// sync service runs as the shell user.
    #[instrument(level = "debug", skip(self), err)]
    async fn list(&self, serial: &str, directory: &str) -> Result<Listing> {
        if self.privileged {
            return shell_listing(self, serial, directory).await;
        }
        let directory = navigation::normalize(directory);
        let result = async {
            let session = self.session(serial).await?;
            let mut entries = session.sync.list(&directory).await?;
            resolve_link_targets(&session, &directory, &mut entries).await;
            Ok::<_, anyhow::Error>(entries)
        }
        .await;
        let entries = self.evict_on_failure(serial, result).await?;
        Ok(Listing { directory, entries, diagnostics: None })
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn stat(&self, serial: &str, path: &str) -> Result<FileEntry> {
        let path = navigation::normalize(path);
        let result = async {
            let session = self.session(serial).await?;
            let mut entry = session.sync.entry(&path).await?;
            let parent = entry.location();
            resolve_link_targets(&session, &parent, std::slice::from_mut(&mut entry)).await;
            Ok::<_, anyhow::Error>(entry)
        }
        .await;
        self.evict_on_failure(serial, result).await
    }

    #[instrument(level = "debug", skip(self, progress), err)]
    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local_dir: &Path,
        progress: &ProgressSender,
    ) -> Result<String> {
        let remote = navigation::normalize(remote);
        let result = async {
            let session = self.session(serial).await?;
            session.pull(&remote, local_dir, self.preserve_timestamps, progress).await
        }
        .await;
        let local = self.evict_on_failure(serial, result).await?;
        Ok(format!("Downloaded '{remote}' to {}", local.display()))
    }

    #[instrument(level = "debug", skip(self, progress), err)]
    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote_dir: &str,
        progress: &ProgressSender,
    ) -> Result<String> {
        let remote_dir = navigation::normalize(remote_dir);
        let result = async {
            let session = self.session(serial).await?;
            session.push(local, &remote_dir, progress).await
        }
        .await;
        let remote = self.evict_on_failure(serial, result).await?;
        Ok(format!("Uploaded '{}' to {remote}", local.display()))
    }
}

fn state_name(state: &AdbDeviceState) -> String {
    match state {
        AdbDeviceState::Device => "device".to_string(),
        AdbDeviceState::Unauthorized => "unauthorized".to_string(),
        AdbDeviceState::Offline => "offline".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Fills in the targets of the links in `entries`, all of them inside `directory`, with
/// a single `ls -l -d`. The sync protocol only reports their mode.
async fn resolve_link_targets(session: &DeviceSession, directory: &str, entries: &mut [FileEntry]) {
    let links: Vec<&str> =
        entries.iter().filter(|e| e.kind() == FileKind::Link).map(|e| e.path.as_str()).collect();
    if links.is_empty() {
        return;
    }
    let argv = shell::stat_all(&links);
    match session.shell_with_status(&argv).await {
        Ok(output) if output.listing_ok() => apply_link_targets(entries, &output.stdout, directory),
        Ok(output) => debug!(directory, message = %output.message(), "Link targets unavailable"),
        Err(e) => debug!(error = e.as_ref() as &dyn Error, directory, "Link targets unavailable"),
    }
}

/// Copies the targets printed by `ls -l` onto the links of the same name
fn apply_link_targets(entries: &mut [FileEntry], output: &str, directory: &str) {
    let targets: HashMap<String, String> = parse_listing(output, directory)
        .into_iter()
        .filter_map(|e| Some((e.name, e.link_target?)))
        .collect();
    for entry in entries.iter_mut().filter(|e| e.kind() == FileKind::Link) {
        if let Some(target) = targets.get(&entry.name) {
            entry.link_target = Some(target.clone());
        }
    }
}

/// Splits output of a command followed by `printf '\n%s' $?` into the command's own
/// output and its exit code
fn split_exit_status(output: &str) -> Option<(&str, i32)> {
    let (stdout, code) = output.rsplit_once('\n').unwrap_or(("", output));
    Some((stdout, code.trim().parse().ok()?))
}

fn not_found(command: &str, path: &str) -> ExplorerError {
    ExplorerError::CommandFailed {
        command: format!("{command} {path}"),
        code: 1,
        message: format!("{path}: No such file or directory"),
    }
}

/// Sync service of one device. Every request opens its own server connection, so it
/// never waits behind a transfer.
#[derive(Debug, Clone)]
pub struct SyncClient {
    server: String,
    serial: String,
}

impl SyncClient {
    pub fn new(server: &str, serial: &str) -> Self {
        Self { server: server.to_string(), serial: serial.to_string() }
    }

    /// `lstat` of `path`
    pub async fn stat(&self, path: &str) -> Result<RawEntry> {
        let mut stream = sync::connect(&self.server, &self.serial).await?;
        let raw = sync::stat(&mut stream, path).await?;
        let _ = sync::quit(&mut stream).await;
        if raw.mode == 0 {
            return Err(not_found("stat", path).into());
        }
        Ok(raw)
    }

    /// `path` as an entry named after its last component
    pub async fn entry(&self, path: &str) -> Result<FileEntry> {
        let raw = self.stat(path).await?;
        let parent = FileEntry::directory_at(path).location();
        let mut entry =
            entry_from_raw(raw, &parent).ok_or_else(|| anyhow!("Can't stat {path}"))?;
        entry.name = if path == "/" { path.to_string() } else { FileEntry::directory_at(path).name };
        entry.path = path.to_string();
        Ok(entry)
    }

    /// Entries of `directory`, without `.` and `..`
    pub async fn list(&self, directory: &str) -> Result<Vec<FileEntry>> {
        let mut stream = sync::connect(&self.server, &self.serial).await?;
        let raw = sync::list(&mut stream, directory).await?;
        let _ = sync::quit(&mut stream).await;
        Ok(raw.into_iter().filter_map(|r| entry_from_raw(r, directory)).collect())
    }
}

/// An open device on the adb server
#[derive(Debug)]
pub struct DeviceSession {
    #[debug(skip)]
    inner: forensic_adb::Device,
    sync: SyncClient,
}

impl DeviceSession {
    #[instrument(level = "debug", skip(host), err)]
    async fn open(host: &forensic_adb::Host, server: &str, serial: &str) -> Result<Self> {
        let devices = host.devices::<Vec<_>>().await.context("Failed to list devices")?;
        let Some(info) = devices.into_iter().find(|d| d.serial == serial) else {
            return Err(ExplorerError::DeviceUnavailable(format!("{serial} is not attached")).into());
        };
        if info.state != AdbDeviceState::Device {
            return Err(ExplorerError::DeviceUnavailable(format!(
                "{serial} is {}",
                state_name(&info.state)
            ))
            .into());
        }
        let inner = forensic_adb::Device::new(host.clone(), info.serial.clone(), info.info.clone())
            .await
            .context("Failed to open device")?;
        info!(serial, "Opened device session");
        Ok(Self { inner, sync: SyncClient::new(server, serial) })
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn shell(&self, command: &str) -> Result<String> {
        self.inner
            .execute_host_shell_command(command)
            .await
            .context("Failed to execute shell command")
            .inspect(|v| trace!(output = ?v, "Shell command executed"))
    }

    /// Runs `argv` and recovers its exit code by appending `; printf '\n%s' $?`.
    /// stdout and stderr arrive interleaved in `stdout`.
    pub async fn shell_with_status(&self, argv: &[String]) -> Result<CommandOutput> {
        let command = argv.join(" ");
        let output = self.shell(&format!("{command} ; printf '\\n%s' $?")).await?;
        let (stdout, exit_code) = split_exit_status(&output)
            .with_context(|| format!("Failed to extract exit code of `{command}`"))?;
        Ok(CommandOutput { exit_code, stdout: stdout.to_string(), stderr: String::new() })
    }

    /// Pulls `remote` into `local_dir`, returning the local path written
    async fn pull(
        &self,
        remote: &str,
        local_dir: &Path,
        preserve_timestamps: bool,
        progress: &ProgressSender,
    ) -> Result<PathBuf> {
        let raw = self.sync.stat(remote).await?;
        let name = FileEntry::directory_at(remote).name;
        let local = local_dir.join(&name);
        let source = UnixPath::new(remote);

        if raw.mode & S_IFMT == S_IFDIR {
            fs::create_dir_all(&local).await.with_context(|| {
                format!("Failed to create destination directory: {}", local.display())
            })?;
            self.inner.pull_dir(source, &local).await.context("Failed to pull directory")?;
            progress.send(TransferProgress {
                label: remote.to_string(),
                amount: ProgressAmount::Percent(100),
            });
            return Ok(local);
        }

        let file = File::create(&local)
            .await
            .with_context(|| format!("Failed to create {}", local.display()))?;
        let mut writer = ProgressWriter::new(file, raw.size, remote, progress.clone());
        self.inner.pull(source, &mut writer).await.context("Failed to pull file")?;
        let mut file = writer.into_inner();
        file.flush().await?;
        if preserve_timestamps {
            let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(raw.mtime.max(0) as u64);
            let file = file.into_std().await;
            if let Err(e) = file.set_modified(modified) {
                warn!(error = &e as &dyn Error, path = %local.display(), "Failed to set modification time");
            }
        }
        Ok(local)
    }

    /// Pushes `local` into `remote_dir`, returning the remote path written
    async fn push(&self, local: &Path, remote_dir: &str, progress: &ProgressSender) -> Result<String> {
        let name = local
            .file_name()
            .context("Source path has no file name")?
            .to_str()
            .context("Source file name is not valid UTF-8")?;
        let remote = navigation::join(remote_dir, name);
        let metadata = fs::metadata(local)
            .await
            .with_context(|| format!("Can't read {}", local.display()))?;

        if metadata.is_dir() {
            let (tx, mut rx) = mpsc::unbounded_channel::<DirectoryTransferProgress>();
            let forward = tokio::spawn(
                {
                    let progress = progress.clone();
                    let label = remote.clone();
                    async move {
                        while let Some(update) = rx.recv().await {
                            progress.send(TransferProgress {
                                label: label.clone(),
                                amount: ProgressAmount::Bytes {
                                    done: update.transferred_bytes as u64,
                                    total: update.total_bytes as u64,
                                },
                            });
                        }
                    }
                }
                .instrument(Span::current()),
            );
            let result = self
                .inner
                .push_dir_with_progress(local, UnixPath::new(&remote), 0o777, tx)
                .await
                .context("Failed to push directory");
            let _ = forward.await;
            result?;
            return Ok(remote);
        }

        let file = File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;
        let mut reader =
            BufReader::new(ProgressReader::new(file, metadata.len(), &remote, progress.clone()));
        self.inner
            .push(&mut reader, UnixPath::new(&remote), 0o777)
            .await
            .context("Failed to push file")?;
        Ok(remote)
    }
}

/// Reports byte progress for whatever flows through it
#[derive(Debug)]
struct Metered<T> {
    #[debug(skip)]
    inner: T,
    done: u64,
    total: u64,
    label: String,
    last_percent: Option<u8>,
    progress: ProgressSender,
}

impl<T> Metered<T> {
    fn new(inner: T, total: u64, label: &str, progress: ProgressSender) -> Self {
        Self { inner, done: 0, total, label: label.to_string(), last_percent: None, progress }
    }

    fn into_inner(self) -> T {
        self.inner
    }

    fn advance(&mut self, bytes: usize) {
        self.done += bytes as u64;
        let update = TransferProgress {
            label: self.label.clone(),
            amount: ProgressAmount::Bytes { done: self.done, total: self.total },
        };
        // One update per percent is plenty
        let percent = update.percent();
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            self.progress.send(update);
        }
    }
}

type ProgressReader<R> = Metered<R>;
type ProgressWriter<W> = Metered<W>;

impl<R: AsyncRead + Unpin> AsyncRead for Metered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.advance(read);
            }
        }
        poll
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Metered<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll
            && written > 0
        {
            self.advance(written);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncReadExt, sync::mpsc::unbounded_channel};

    use super::*;
    use crate::task::{TaskId, WorkerMessage};

    #[tokio::test(flavor = "multi_thread")]
    async fn metered_reader_reports_each_percent_once() {
        let (tx, mut rx) = unbounded_channel();
        let progress = ProgressSender::new(TaskId::Upload, 1, tx);
        let data = vec![7u8; 1000];
        let mut reader = ProgressReader::new(&data[..], 1000, "/sdcard/a.bin", progress);
        let mut sink = Vec::new();
        let mut chunk = [0u8; 100];
        loop {
            let read = reader.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            sink.extend_from_slice(&chunk[..read]);
        }
        drop(reader);
        assert_eq!(sink.len(), 1000);

        let mut percents = Vec::new();
        while let Some(WorkerMessage::Progress { progress, .. }) = rx.recv().await {
            percents.push(progress.percent());
        }
        assert_eq!(percents, [10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metered_writer_passes_bytes_through() {
        let progress = ProgressSender::detached(TaskId::Download("/a".into()));
        let mut writer = ProgressWriter::new(Vec::new(), 3, "/a", progress);
        writer.write_all(b"abc").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.done, 3);
        assert_eq!(writer.into_inner(), b"abc");
    }

    #[test]
    fn session_transport_uses_configured_port() {
        let settings = Settings { server_port: 5038, ..Settings::default() };
        let transport = SessionTransport::new(&settings);
        assert_eq!(transport.server, "127.0.0.1:5038");
        assert_eq!(transport.backend(), TransportBackend::Session);
    }

    #[test]
    fn exit_status_is_split_from_output() {
        assert_eq!(split_exit_status("a\nb\n\n0"), Some(("a\nb\n", 0)));
        assert_eq!(split_exit_status("partial\n2"), Some(("partial", 2)));
        assert_eq!(split_exit_status("\n1"), Some(("", 1)));
        assert_eq!(split_exit_status("0"), Some(("", 0)));
        assert_eq!(split_exit_status("no status here"), None);
    }

    #[test]
    fn link_targets_come_from_one_listing() {
        let link = |name: &str| {
            entry_from_raw(RawEntry { mode: 0o120777, size: 21, mtime: 0, name: name.into() }, "/")
                .unwrap()
        };
        let mut entries = vec![
            link("sdcard"),
            link("d"),
            entry_from_raw(RawEntry { mode: 0o040755, size: 0, mtime: 0, name: "etc".into() }, "/")
                .unwrap(),
        ];
        let output = "lrwxrwxrwx 1 root root 21 2009-01-01 00:00 /sdcard -> /storage/self/primary\n\
                      ls: /d: Permission denied\n";
        apply_link_targets(&mut entries, output, "/");
        assert_eq!(entries[0].link_target.as_deref(), Some("/storage/self/primary"));
        assert_eq!(entries[1].link_target, None);
        assert_eq!(entries[2].link_target, None);
    }

    fn dent(mode: u32, size: u32, name: &str) -> Vec<u8> {
        let mut bytes = b"DENT".to_vec();
        for value in [mode, size, 1_700_000_000, name.len() as u32] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    /// adb server that serves one sync request per reply, `None` hanging up instead of
    /// answering
    async fn fake_server(replies: Vec<Option<Vec<u8>>>) -> u16 {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                assert_eq!(sync::read_hex_prefixed(&mut stream).await.unwrap(), "host:transport:R58N");
                stream.write_all(b"OKAY").await.unwrap();
                assert_eq!(sync::read_hex_prefixed(&mut stream).await.unwrap(), "sync:");
                stream.write_all(b"OKAY").await.unwrap();
                let mut header = [0u8; 8];
                stream.read_exact(&mut header).await.unwrap();
                let mut path = vec![0u8; u32::from_le_bytes(header[4..].try_into().unwrap()) as usize];
                stream.read_exact(&mut path).await.unwrap();
                let Some(reply) = reply else {
                    continue;
                };
                stream.write_all(&reply).await.unwrap();
                let _ = stream.read_to_end(&mut Vec::new()).await;
            }
        });
        port
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn sync_client_lists_and_stats() {
        let mut listing = dent(0o040771, 4096, ".");
        listing.extend(dent(0o040771, 4096, ".."));
        listing.extend(dent(0o040771, 4096, "Download"));
        listing.extend(dent(0o100644, 12, "notes.txt"));
        listing.extend(dent(0o120777, 21, "cache"));
        listing.extend_from_slice(b"DONE");
        listing.extend_from_slice(&[0u8; 16]);
        let mut missing = b"STAT".to_vec();
        missing.extend_from_slice(&[0u8; 12]);
        let mut file = b"STAT".to_vec();
        for value in [0o100644u32, 12, 1_700_000_000] {
            file.extend_from_slice(&value.to_le_bytes());
        }
        let port = fake_server(vec![Some(listing), Some(missing), Some(file)]).await;
        let client = SyncClient::new(&format!("127.0.0.1:{port}"), "R58N");

        let entries = client.list("/sdcard").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Download", "notes.txt", "cache"]);
        assert_eq!(entries[0].kind(), FileKind::Directory);
        assert_eq!(entries[1].path, "/sdcard/notes.txt");
        assert_eq!(entries[1].size, 12);
        assert_eq!(entries[2].kind(), FileKind::Link);

        let err = client.stat("/sdcard/nope").await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::CommandFailed);

        let entry = client.entry("/sdcard/notes.txt").await.unwrap();
        assert_eq!(entry.name, "notes.txt");
        assert_eq!(entry.path, "/sdcard/notes.txt");
        assert_eq!(entry.permissions, "-rw-r--r--");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn dropped_connection_is_device_unavailable() {
        let port = fake_server(vec![None]).await;
        let settings = Settings { server_port: port, ..Settings::default() };
        let transport = SessionTransport::new(&settings);
        let client = SyncClient::new(&transport.server, "R58N");

        let result = client.list("/sdcard").await;
        let err = transport.evict_on_failure("R58N", result).await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::DeviceUnavailable);
        assert!(!transport.sessions.lock().await.contains_key("R58N"));

        // Failures the device reported are passed through untouched
        let reported: Result<()> = Err(not_found("stat", "/x").into());
        let err = transport.evict_on_failure("R58N", reported).await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::CommandFailed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_server_is_transport_unavailable() {
        // Grab a free port and close it again so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let settings = Settings { server_port: port, ..Settings::default() };
        let transport = SessionTransport::new(&settings);
        let err = transport.version().await.unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::TransportUnavailable);
    }
}
