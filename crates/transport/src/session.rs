//! A live remote agent: upload, exec, speak the line protocol, clean up.

use std::time::Duration;

use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use rand::RngCore as _;
use tokio::sync::{mpsc, Mutex};

use sprync_core::protocol::{self, Request, Response, MAX_LINE};
use sprync_core::ManifestEntry;

use crate::api::Client;
use crate::wsconn::WsConn;

/// How long `close` waits for the agent to exit after `quit`.
const QUIT_WAIT: Duration = Duration::from_secs(5);

pub struct Session {
    client: Client,
    sprite: String,
    remote_bin: String,
    io: Mutex<SessionIo>,
    pub version: String,
    pub pid: u32,
}

struct SessionIo {
    conn: WsConn,
    scanner: LineScanner,
}

#[derive(Debug)]
pub struct PackResult {
    pub dest: String,
    pub size: u64,
    pub count: usize,
}

#[derive(Debug)]
pub struct TransferResult {
    pub count: usize,
    pub size: u64,
    pub dest: String,
}

impl Session {
    /// Upload `binary` to a fresh scratch path in the sprite, start it
    /// over the exec WebSocket, and wait for its `ready` line.
    ///
    /// # Errors
    /// Returns an error if upload, dial, or the ready handshake fails.
    pub async fn open(client: Client, sprite: &str, binary: &[u8]) -> Result<Session> {
        let remote_bin = scratch_path("-spryncd");
        client
            .fs_write(sprite, &remote_bin, Some("0755"), false, binary.to_vec())
            .await
            .wrap_err("upload agent")?;

        let ws = client
            .exec_websocket(sprite, &[remote_bin.clone()], true)
            .await
            .wrap_err("exec agent")?;

        let mut conn = WsConn::new(ws);
        tokio::spawn(drain_stderr(conn.take_stderr()));
        let scanner = LineScanner::new(conn.take_stdout());

        let mut io = SessionIo { conn, scanner };
        let ready = match io.read_response().await {
            Ok(resp) => resp,
            Err(e) => {
                io.conn.close().await;
                return Err(e);
            }
        };
        let (version, pid) = match ready {
            Response::Ready { version, pid } => (version, pid),
            other => {
                io.conn.close().await;
                bail!("expected ready, got {other:?}");
            }
        };

        Ok(Session {
            client,
            sprite: sprite.to_string(),
            remote_bin,
            io: Mutex::new(io),
            version,
            pid,
        })
    }

    /// Stream the remote manifest of `dir`. Returns the entries, whether
    /// the directory exists, and the agent-side elapsed time.
    ///
    /// # Errors
    /// Returns the agent's fatal message or a transport error.
    pub async fn manifest(
        &self,
        dir: &str,
        excludes: &[String],
    ) -> Result<(Vec<ManifestEntry>, bool, Duration)> {
        let mut io = self.io.lock().await;
        io.send(&Request::Manifest {
            dir: dir.to_string(),
            excludes: excludes.to_vec(),
        })
        .await?;

        let mut entries = Vec::new();
        loop {
            match io.read_response().await? {
                Response::Entry {
                    path,
                    hash,
                    mode,
                    size,
                } => entries.push(ManifestEntry {
                    path,
                    hash,
                    mode,
                    size,
                }),
                Response::ManifestDone {
                    exists, elapsed_ms, ..
                } => {
                    return Ok((entries, exists, Duration::from_millis(elapsed_ms)));
                }
                Response::Error { message, fatal } => {
                    if fatal {
                        bail!("{message}");
                    }
                    tracing::debug!("agent: {message}");
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }
    }

    /// Pack `paths` under `dir` into a fresh remote scratch tar.
    ///
    /// # Errors
    /// Returns the agent's fatal message or a transport error.
    pub async fn pack(&self, dir: &str, paths: &[String], compress: bool) -> Result<PackResult> {
        let dest = scratch_path(tar_ext(compress));

        let mut io = self.io.lock().await;
        io.send(&Request::Pack {
            dir: dir.to_string(),
            paths: paths.to_vec(),
            dest,
            compress,
        })
        .await?;

        loop {
            match io.read_response().await? {
                Response::PackDone { dest, size, count } => {
                    return Ok(PackResult { dest, size, count });
                }
                Response::Error { message, fatal } => {
                    if fatal {
                        bail!("{message}");
                    }
                    tracing::debug!("agent: {message}");
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }
    }

    /// Extract the scratch tar `src` into `dir` on the sprite.
    ///
    /// # Errors
    /// Returns the agent's fatal message or a transport error.
    pub async fn extract(&self, dir: &str, src: &str, compress: bool) -> Result<usize> {
        let mut io = self.io.lock().await;
        io.send(&Request::Extract {
            dir: dir.to_string(),
            src: src.to_string(),
            compress,
        })
        .await?;

        loop {
            match io.read_response().await? {
                Response::ExtractDone { count } => return Ok(count),
                Response::Error { message, fatal } => {
                    if fatal {
                        bail!("{message}");
                    }
                    tracing::debug!("agent: {message}");
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }
    }

    /// Delete `paths` under `dir` on the sprite.
    ///
    /// # Errors
    /// Returns the agent's fatal message or a transport error.
    pub async fn delete(&self, dir: &str, paths: &[String]) -> Result<usize> {
        let mut io = self.io.lock().await;
        io.send(&Request::Delete {
            dir: dir.to_string(),
            paths: paths.to_vec(),
        })
        .await?;

        loop {
            match io.read_response().await? {
                Response::DeleteDone { count } => return Ok(count),
                Response::Error { message, fatal } => {
                    if fatal {
                        bail!("{message}");
                    }
                    tracing::debug!("agent: {message}");
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }
    }

    /// Have the agent stream a tar of `paths` straight to `dest_url`
    /// (an FSWrite URL of another sprite).
    ///
    /// # Errors
    /// Returns the agent's fatal message or a transport error.
    pub async fn transfer(
        &self,
        dir: &str,
        paths: &[String],
        compress: bool,
        dest_url: &str,
        token: &str,
    ) -> Result<TransferResult> {
        let mut io = self.io.lock().await;
        io.send(&Request::Transfer {
            dir: dir.to_string(),
            paths: paths.to_vec(),
            compress,
            url: dest_url.to_string(),
            token: token.to_string(),
        })
        .await?;

        loop {
            match io.read_response().await? {
                Response::TransferDone { count, size, dest } => {
                    return Ok(TransferResult { count, size, dest });
                }
                Response::Error { message, fatal } => {
                    if fatal {
                        bail!("{message}");
                    }
                    tracing::debug!("agent: {message}");
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }
    }

    /// Ask the agent to quit, wait briefly for its exit, tear the
    /// channel down, and best-effort remove the uploaded binary.
    pub async fn close(&self) {
        let io = self.io.lock().await;
        let _ = io.send(&Request::Quit).await;
        let _ = tokio::time::timeout(QUIT_WAIT, io.conn.done()).await;
        io.conn.close().await;
        drop(io);

        let _ = self
            .client
            .exec_http(&self.sprite, &["rm", "-f", &self.remote_bin], None)
            .await;
    }
}

impl SessionIo {
    async fn send(&self, req: &Request) -> Result<()> {
        let line = protocol::encode_line(req)?;
        self.conn.write_stdin(line.as_bytes()).await
    }

    async fn read_response(&mut self) -> Result<Response> {
        match self.scanner.next_line().await? {
            Some(line) => protocol::parse_response(line.trim()),
            None => Err(eyre!("unexpected EOF")),
        }
    }
}

async fn drain_stderr(mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            tracing::debug!("spryncd stderr: {}", line.trim_end());
        }
    }
    if !buf.is_empty() {
        tracing::debug!("spryncd stderr: {}", String::from_utf8_lossy(&buf));
    }
}

/// Assemble newline-delimited lines from a chunk stream, enforcing the
/// per-line budget.
struct LineScanner {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    eof: bool,
}

impl LineScanner {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                return Ok(Some(String::from_utf8_lossy(line).into_owned()));
            }
            if self.buf.len() > MAX_LINE {
                bail!("response line exceeds {MAX_LINE} bytes");
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                return Ok(Some(line));
            }
            match self.rx.recv().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.eof = true,
            }
        }
    }
}

/// A fresh `/tmp/sprync-<16 hex><suffix>` scratch path.
#[must_use]
pub fn scratch_path(suffix: &str) -> String {
    let mut b = [0u8; 8];
    rand::rng().fill_bytes(&mut b);
    format!("/tmp/sprync-{}{suffix}", hex::encode(b))
}

/// The scratch extension for a tar, compressed or not.
#[must_use]
pub fn tar_ext(compress: bool) -> &'static str {
    if compress {
        ".tar.gz"
    } else {
        ".tar"
    }
}
