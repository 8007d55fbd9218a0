use std::{
    error::Error,
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lazy_regex::{Lazy, Regex, lazy_regex};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Command,
    time::timeout,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{CommandOutput, Transport, listing_from_output, shell};
use crate::{
    error::ExplorerError,
    models::{
        ConnectTarget, DeviceRecord, Listing, ProgressAmount, Settings, TransferProgress,
        TransportBackend, parse_device_table,
    },
    task::ProgressSender,
    utils::resolve_binary_path,
};

static PROGRESS_LINE: Lazy<Regex> = lazy_regex!(r"^\[\s*(\d{1,3})%\]\s+(.+)$");

/// Parses `[ 42%] /sdcard/file` as printed by `adb push` and `adb pull`
pub fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    let caps = PROGRESS_LINE.captures(line.trim())?;
    let percent: u8 = caps[1].parse().ok()?;
    Some(TransferProgress {
        label: caps[2].trim().to_string(),
        amount: ProgressAmount::Percent(percent.min(100)),
    })
}

/// Transport that runs the `adb` executable once per command
#[derive(Debug)]
pub struct ProcessTransport {
    adb_path: PathBuf,
    privileged: bool,
    preserve_timestamps: bool,
}

impl ProcessTransport {
    #[instrument(level = "debug", skip(settings), err)]
    pub fn new(settings: &Settings) -> Result<Self> {
        let adb_path = resolve_binary_path(Some(&settings.adb_path), "adb")
            .map_err(|e| ExplorerError::TransportUnavailable(format!("{e:#}")))?;
        info!(path = %adb_path.display(), "Using adb executable");
        Ok(Self {
            adb_path,
            privileged: settings.run_privileged,
            preserve_timestamps: settings.preserve_timestamps,
        })
    }

    fn command<S: AsRef<OsStr>>(&self, args: &[S]) -> Command {
        let mut command = Command::new(&self.adb_path);
        command.kill_on_drop(true);

        #[cfg(target_os = "windows")]
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW

        command.args(args);
        trace!(command = ?command, "Constructed adb command");
        command
    }

    fn spawn_error(&self, e: io::Error) -> anyhow::Error {
        if e.kind() == io::ErrorKind::NotFound {
            ExplorerError::TransportUnavailable(format!("{} not found", self.adb_path.display()))
                .into()
        } else {
            anyhow::Error::new(e).context("Failed to run adb")
        }
    }

    #[instrument(level = "debug", skip(self, args), err)]
    async fn run<S: AsRef<OsStr> + std::fmt::Debug>(&self, args: &[S]) -> Result<CommandOutput> {
        let output = self.command(args).output().await.map_err(|e| self.spawn_error(e))?;
        let output = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        trace!(?args, exit_code = output.exit_code, "adb finished");
        Ok(output)
    }

    async fn run_streaming<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<CommandOutput> {
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = child.stdout.take().context("Failed to capture adb stdout")?;
        let mut stderr = child.stderr.take().context("Failed to capture adb stderr")?;

        let (stdout, stderr) = tokio::try_join!(read_lines(stdout, on_line), async {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| String::from_utf8_lossy(&buf).to_string())
        })
        .context("Failed to read adb output")?;
        let status = child.wait().await.context("Failed to wait for adb")?;
        Ok(CommandOutput { exit_code: status.code().unwrap_or(-1), stdout, stderr })
    }

    fn shell_args(&self, serial: &str, argv: &[String]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), serial.to_string(), "shell".to_string()];
        args.extend(shell::wrap(argv, self.privileged));
        args
    }

    /// Runs a push or pull, forwarding progress lines and collecting everything else
    async fn transfer(
        &self,
        args: &[OsString],
        progress: &ProgressSender,
    ) -> Result<(CommandOutput, Vec<String>)> {
        let mut notes = Vec::new();
        let output = self
            .run_streaming(args, &mut |line: &str| match parse_progress_line(line) {
                Some(update) => progress.send(update),
                None => notes.push(line.to_string()),
            })
            .await?;
        notes.extend(output.stderr.lines().filter(|l| !l.trim().is_empty()).map(str::to_string));
        Ok((output, notes))
    }
}

/// Reads `reader` to the end, splitting on `\n` and on the `\r` adb uses to redraw progress
async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    on_line: &mut (dyn FnMut(&str) + Send),
) -> io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();
    let mut flush = |line: &mut Vec<u8>, collected: &mut String| {
        if !line.is_empty() {
            let text = String::from_utf8_lossy(line).to_string();
            on_line(&text);
            collected.push_str(&text);
            collected.push('\n');
            line.clear();
        }
    };
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        for &byte in buf {
            match byte {
                b'\n' | b'\r' => flush(&mut line, &mut collected),
                other => line.push(other),
            }
        }
        reader.consume(len);
    }
    flush(&mut line, &mut collected);
    Ok(collected)
}

#[async_trait]
impl Transport for ProcessTransport {
    fn backend(&self) -> TransportBackend {
        TransportBackend::Process
    }

    async fn version(&self) -> Result<String> {
        let argv = ["version".to_string()];
        let stdout = self.run(&argv).await?.into_checked(&argv)?;
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn start_server(&self) -> Result<()> {
        let argv = ["start-server".to_string()];
        let output = timeout(Duration::from_secs(10), self.run(&argv))
            .await
            .map_err(|_| anyhow!("Timed out while starting ADB server"))??;
        output.into_checked(&argv).context("Failed to start ADB server")?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn kill_server(&self) -> Result<()> {
        let argv = ["kill-server".to_string()];
        self.run(&argv).await?.into_checked(&argv)?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn devices(&self) -> Result<Vec<DeviceRecord>> {
        let argv = ["devices".to_string(), "-l".to_string()];
        let stdout = self.run(&argv).await?.into_checked(&argv)?;
        Ok(parse_device_table(&stdout))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn connect(&self, target: &ConnectTarget) -> Result<String> {
        let serial = target.serial();
        if let ConnectTarget::Serial(_) = target {
            return Ok(serial);
        }
        let argv = ["connect".to_string(), serial.clone()];
        let output = self.run(&argv).await?;
        // adb exits with 0 even when the connection was refused
        if output.success() && output.stdout.contains("connected to") {
            debug!(serial, output = output.stdout.trim(), "Connected");
            Ok(serial)
        } else {
            Err(ExplorerError::CommandFailed {
                command: argv.join(" "),
                code: output.exit_code,
                message: format!("{} {}", output.stdout.trim(), output.stderr.trim())
                    .trim()
                    .to_string(),
            }
            .into())
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn disconnect(&self, serial: &str) -> Result<String> {
        let argv = ["disconnect".to_string(), serial.to_string()];
        let stdout = self.run(&argv).await?.into_checked(&argv)?;
        Ok(stdout.trim().to_string())
    }

    async fn execute(&self, serial: &str, argv: &[String]) -> Result<CommandOutput> {
        self.run(&self.shell_args(serial, argv)).await
    }

    async fn execute_streaming(
        &self,
        serial: &str,
        argv: &[String],
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<CommandOutput> {
        self.run_streaming(&self.shell_args(serial, argv), on_line).await
    }

    /// Falls back to `adb ls` when the device shell cannot list the directory.
    ///
    /// `adb ls` prints nothing for a directory it can't read, so an empty fallback
    /// reports the shell's failure instead.
    #[instrument(level = "debug", skip(self), err)]
    async fn list(&self, serial: &str, directory: &str) -> Result<Listing> {
        let argv = shell::list(directory);
        let output = self.execute(serial, &argv).await?;
        if output.listing_ok() {
            return listing_from_output(output, directory, &argv);
        }
        warn!(
            exit_code = output.exit_code,
            message = %output.message(),
            "Shell listing failed, falling back to adb ls"
        );
        let fallback = ["-s", serial, "ls", directory].map(str::to_string);
        let fallback_output = self.run(&fallback).await?;
        match listing_from_output(fallback_output, directory, &fallback) {
            Ok(mut listing) if !listing.is_empty() => {
                let message = output.message();
                listing.diagnostics = match listing.diagnostics.take() {
                    Some(more) if !message.is_empty() => Some(format!("{message}\n{more}")),
                    Some(more) => Some(more),
                    None => Some(message).filter(|m| !m.is_empty()),
                };
                Ok(listing)
            }
            Ok(_) => Err(output.failure(&argv).into()),
            Err(e) => {
                debug!(error = e.as_ref() as &dyn Error, "adb ls failed too");
                Err(output.failure(&argv).into())
            }
        }
    }

    #[instrument(level = "debug", skip(self, progress), err)]
    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local_dir: &Path,
        progress: &ProgressSender,
    ) -> Result<String> {
        let mut args: Vec<OsString> = vec!["-s".into(), serial.into(), "pull".into()];
        if self.preserve_timestamps {
            args.push("-a".into());
        }
        args.push(remote.into());
        args.push(local_dir.into());

        let (output, notes) = self.transfer(&args, progress).await?;
        if !output.success() {
            return Err(ExplorerError::CommandFailed {
                command: format!("pull {remote}"),
                code: output.exit_code,
                message: notes.join("\n"),
            }
            .into());
        }
        Ok(with_notes(format!("Downloaded '{remote}' to {}", local_dir.display()), &notes))
    }

    #[instrument(level = "debug", skip(self, progress), err)]
    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote_dir: &str,
        progress: &ProgressSender,
    ) -> Result<String> {
        let args: Vec<OsString> =
            vec!["-s".into(), serial.into(), "push".into(), local.into(), remote_dir.into()];

        let (output, notes) = self.transfer(&args, progress).await?;
        if !output.success() {
            return Err(ExplorerError::CommandFailed {
                command: format!("push {}", local.display()),
                code: output.exit_code,
                message: notes.join("\n"),
            }
            .into());
        }
        Ok(with_notes(format!("Uploaded '{}' to {remote_dir}", local.display()), &notes))
    }
}

fn with_notes(message: String, notes: &[String]) -> String {
    if notes.is_empty() { message } else { format!("{message}\n{}", notes.join("\n")) }
}
