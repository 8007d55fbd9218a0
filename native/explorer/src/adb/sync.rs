//! Minimal client for the adb server's host and sync protocols.
//!
//! Host requests are a 4 hex digit length followed by the payload and answered with
//! `OKAY` or `FAIL` plus a length-prefixed message. After `host:transport:<serial>` and
//! `sync:` the socket speaks the sync protocol: 4 byte ids followed by little-endian `u32`s.

use anyhow::{Context, Result, bail, ensure};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{instrument, trace};

use crate::listing::RawEntry;

const OKAY: &[u8; 4] = b"OKAY";
const FAIL: &[u8; 4] = b"FAIL";
const STAT: &[u8; 4] = b"STAT";
const LIST: &[u8; 4] = b"LIST";
const DENT: &[u8; 4] = b"DENT";
const DONE: &[u8; 4] = b"DONE";
const QUIT: &[u8; 4] = b"QUIT";

/// Longest path the sync protocol accepts
const MAX_PATH_LENGTH: usize = 1024;

/// Writes one host request
pub async fn send_request<S: AsyncWrite + Unpin>(stream: &mut S, request: &str) -> Result<()> {
    ensure!(request.len() <= 0xffff, "Host request too long");
    let message = format!("{:04x}{request}", request.len());
    stream.write_all(message.as_bytes()).await.context("Failed to send host request")?;
    stream.flush().await?;
    Ok(())
}

/// Reads `OKAY`, or turns `FAIL` into an error carrying the server's message
pub async fn read_status<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await.context("Failed to read host status")?;
    match &status {
        OKAY => Ok(()),
        FAIL => {
            let message = read_hex_prefixed(stream).await?;
            bail!("adb server refused request: {message}")
        }
        other => bail!("Unexpected host status {:?}", String::from_utf8_lossy(other)),
    }
}

/// Reads a payload prefixed by its length as 4 hex digits
pub async fn read_hex_prefixed<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length).await.context("Failed to read payload length")?;
    let length = usize::from_str_radix(std::str::from_utf8(&length)?, 16)
        .context("Invalid payload length")?;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.context("Failed to read payload")?;
    Ok(String::from_utf8_lossy(&payload).to_string())
}

/// One-shot host query such as `host:version` or `host:connect:<addr>`
#[instrument(level = "debug", err)]
pub async fn host_query(server: &str, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("Failed to reach adb server at {server}"))?;
    send_request(&mut stream, request).await?;
    read_status(&mut stream).await?;
    read_hex_prefixed(&mut stream).await
}

/// Switches a fresh server connection to `serial`'s sync service
pub async fn open_sync<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, serial: &str) -> Result<()> {
    send_request(stream, &format!("host:transport:{serial}")).await?;
    read_status(stream).await.context("Failed to select device")?;
    send_request(stream, "sync:").await?;
    read_status(stream).await.context("Failed to start sync service")?;
    Ok(())
}

/// Opens a sync connection to `serial` through the server at `server`
pub async fn connect(server: &str, serial: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("Failed to reach adb server at {server}"))?;
    open_sync(&mut stream, serial).await?;
    Ok(stream)
}

async fn send_packet<S: AsyncWrite + Unpin>(stream: &mut S, id: &[u8; 4], path: &str) -> Result<()> {
    ensure!(path.len() <= MAX_PATH_LENGTH, "Path too long: {path}");
    let mut packet = Vec::with_capacity(8 + path.len());
    packet.extend_from_slice(id);
    packet.extend_from_slice(&(path.len() as u32).to_le_bytes());
    packet.extend_from_slice(path.as_bytes());
    stream.write_all(&packet).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_id<S: AsyncRead + Unpin>(stream: &mut S) -> Result<[u8; 4]> {
    let mut id = [0u8; 4];
    stream.read_exact(&mut id).await.context("Failed to read sync response")?;
    Ok(id)
}

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u32> {
    Ok(stream.read_u32_le().await?)
}

async fn read_failure<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let length = read_u32(stream).await? as usize;
    let mut message = vec![0u8; length];
    stream.read_exact(&mut message).await?;
    Ok(String::from_utf8_lossy(&message).to_string())
}

/// `lstat` of `path`. A missing file comes back as mode 0.
#[instrument(level = "debug", skip(stream), err)]
pub async fn stat<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, path: &str) -> Result<RawEntry> {
    send_packet(stream, STAT, path).await?;
    match &read_id(stream).await? {
        STAT => {
            let mode = read_u32(stream).await?;
            let size = read_u32(stream).await?;
            let mtime = read_u32(stream).await?;
            Ok(RawEntry { mode, size: size.into(), mtime: mtime.into(), name: path.to_string() })
        }
        FAIL => bail!("stat {path} failed: {}", read_failure(stream).await?),
        other => bail!("Unexpected sync response {:?}", String::from_utf8_lossy(other)),
    }
}

/// Entries of the directory at `path`, `.` and `..` included
#[instrument(level = "debug", skip(stream), err)]
pub async fn list<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    path: &str,
) -> Result<Vec<RawEntry>> {
    send_packet(stream, LIST, path).await?;
    let mut entries = Vec::new();
    loop {
        match &read_id(stream).await? {
            DENT => {
                let mode = read_u32(stream).await?;
                let size = read_u32(stream).await?;
                let mtime = read_u32(stream).await?;
                let length = read_u32(stream).await? as usize;
                let mut name = vec![0u8; length];
                stream.read_exact(&mut name).await?;
                entries.push(RawEntry {
                    mode,
                    size: size.into(),
                    mtime: mtime.into(),
                    name: String::from_utf8_lossy(&name).to_string(),
                });
            }
            DONE => {
                // DONE carries the same 16 bytes as a DENT, all zero
                let mut rest = [0u8; 16];
                stream.read_exact(&mut rest).await?;
                trace!(path, count = entries.len(), "Sync listing done");
                return Ok(entries);
            }
            FAIL => bail!("list {path} failed: {}", read_failure(stream).await?),
            other => bail!("Unexpected sync response {:?}", String::from_utf8_lossy(other)),
        }
    }
}

/// Ends the sync session
pub async fn quit<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let mut packet = Vec::with_capacity(8);
    packet.extend_from_slice(QUIT);
    packet.extend_from_slice(&0u32.to_le_bytes());
    stream.write_all(&packet).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn dent(mode: u32, size: u32, mtime: u32, name: &str) -> Vec<u8> {
        let mut bytes = DENT.to_vec();
        for value in [mode, size, mtime, name.len() as u32] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    async fn read_request<S: AsyncRead + Unpin>(server: &mut S) -> String {
        read_hex_prefixed(server).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn opens_sync_and_lists() {
        let (mut client, mut server) = duplex(4096);
        let device = tokio::spawn(async move {
            assert_eq!(read_request(&mut server).await, "host:transport:emulator-5554");
            server.write_all(OKAY).await.unwrap();
            assert_eq!(read_request(&mut server).await, "sync:");
            server.write_all(OKAY).await.unwrap();

            let mut header = [0u8; 8];
            server.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..4], LIST);
            let mut path = vec![0u8; u32::from_le_bytes(header[4..].try_into().unwrap()) as usize];
            server.read_exact(&mut path).await.unwrap();
            assert_eq!(path, b"/sdcard");

            let mut reply = dent(0o040771, 4096, 1_700_000_000, ".");
            reply.extend(dent(0o040771, 4096, 1_700_000_000, "Download"));
            reply.extend(dent(0o100644, 12, 1_700_000_100, "notes.txt"));
            reply.extend_from_slice(DONE);
            reply.extend_from_slice(&[0u8; 16]);
            server.write_all(&reply).await.unwrap();
        });

        open_sync(&mut client, "emulator-5554").await.unwrap();
        let entries = list(&mut client, "/sdcard").await.unwrap();
        device.await.unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].name, "Download");
        assert_eq!(entries[2].size, 12);
        assert_eq!(entries[2].mtime, 1_700_000_100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn host_failure_carries_message() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            server.write_all(b"FAIL0012device offline (x)").await.unwrap();
        });
        let err = open_sync(&mut client, "R58N").await.unwrap_err();
        assert!(format!("{err:#}").contains("device offline (x)"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stat_reply() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut header = [0u8; 8];
            server.read_exact(&mut header).await.unwrap();
            let mut path = vec![0u8; u32::from_le_bytes(header[4..].try_into().unwrap()) as usize];
            server.read_exact(&mut path).await.unwrap();
            let mut reply = STAT.to_vec();
            for value in [0o100600u32, 3, 1_600_000_000] {
                reply.extend_from_slice(&value.to_le_bytes());
            }
            server.write_all(&reply).await.unwrap();
        });
        let entry = stat(&mut client, "/data/local/tmp/x").await.unwrap();
        assert_eq!(entry.mode, 0o100600);
        assert_eq!(entry.size, 3);
        assert_eq!(entry.name, "/data/local/tmp/x");
    }
}
