//! spryncd: the remote half of sprync.
//!
//! Uploaded into a sprite's /tmp and driven over stdio: one JSON request
//! per line in, one JSON response per line out. Requests run strictly
//! sequentially; a fatal error ends the current request but never the
//! process, so the driver can keep the session after a refused request.

mod pipe;

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

use sprync_core::protocol::{self, Request, Response, MAX_LINE};
use sprync_core::{archive, manifest, paths, ExcludeMatcher};

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    Agent::new().run()
}

struct Agent {
    /// Scratch files owned by this process; removed at shutdown.
    tracked: Vec<PathBuf>,
    stdout: std::io::Stdout,
}

impl Drop for Agent {
    fn drop(&mut self) {
        for f in &self.tracked {
            let _ = paths::remove_path(f);
        }
    }
}

impl Agent {
    fn new() -> Self {
        Self {
            tracked: Vec::new(),
            stdout: std::io::stdout(),
        }
    }

    fn run(&mut self) -> Result<()> {
        self.send(&Response::Ready {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        })?;

        let stdin = std::io::stdin();
        let mut reader = stdin.lock();

        loop {
            let line = match read_line_capped(&mut reader, MAX_LINE) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin read: {e}");
                    break;
                }
            };
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let req = match protocol::parse_request(line) {
                Ok(req) => req,
                Err(e) => {
                    self.fatal(format!("{e:#}"))?;
                    continue;
                }
            };

            match req {
                Request::Manifest { dir, excludes } => self.handle_manifest(&dir, &excludes)?,
                Request::Pack {
                    dir,
                    paths,
                    dest,
                    compress,
                } => self.handle_pack(&dir, &paths, &dest, compress)?,
                Request::Extract { dir, src, compress } => {
                    self.handle_extract(&dir, &src, compress)?;
                }
                Request::Delete { dir, paths } => self.handle_delete(&dir, &paths)?,
                Request::Transfer {
                    dir,
                    paths,
                    compress,
                    url,
                    token,
                } => self.handle_transfer(dir, paths, compress, &url, &token)?,
                Request::Quit => break,
            }
        }

        Ok(())
    }

    fn send(&mut self, resp: &Response) -> Result<()> {
        let line = protocol::encode_line(resp)?;
        let mut out = self.stdout.lock();
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn fatal(&mut self, message: String) -> Result<()> {
        self.send(&Response::Error {
            message,
            fatal: true,
        })
    }

    fn non_fatal(&mut self, message: String) -> Result<()> {
        self.send(&Response::Error {
            message,
            fatal: false,
        })
    }

    fn handle_manifest(&mut self, dir: &str, excludes: &[String]) -> Result<()> {
        let start = Instant::now();

        let root = Path::new(dir);
        if dir.is_empty() || !root.is_dir() {
            return self.send(&Response::ManifestDone {
                exists: false,
                count: 0,
                elapsed_ms: 0,
            });
        }

        let matcher = ExcludeMatcher::new(excludes);
        let mut buf = vec![0u8; sprync_core::hash::HASH_BUF_SIZE];
        let mut count = 0;

        let mut it = walkdir::WalkDir::new(root).follow_links(false).into_iter();
        while let Some(item) = it.next() {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    self.non_fatal(format!("walk: {e}"))?;
                    continue;
                }
            };
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel = rel.to_string_lossy().into_owned();

            if matcher.is_match(&rel) {
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            match manifest::hash_file(entry.path(), &rel, &mut buf) {
                Ok(e) => {
                    self.send(&Response::Entry {
                        path: e.path,
                        hash: e.hash,
                        mode: e.mode,
                        size: e.size,
                    })?;
                    count += 1;
                }
                Err(e) => self.non_fatal(format!("hash {rel}: {e:#}"))?,
            }
        }

        self.send(&Response::ManifestDone {
            exists: true,
            count,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn handle_pack(
        &mut self,
        dir: &str,
        file_paths: &[String],
        dest: &str,
        compress: bool,
    ) -> Result<()> {
        if let Err(msg) = validate_dir(dir) {
            return self.fatal(msg);
        }
        if let Err(msg) = validate_paths(file_paths) {
            return self.fatal(msg);
        }
        if !valid_tmp_path(dest) {
            return self.fatal("dest must be under /tmp/".to_string());
        }
        if let Err(msg) = check_containment(dir, file_paths) {
            return self.fatal(msg);
        }

        self.tracked.push(PathBuf::from(dest));

        let file = match std::fs::File::create(dest) {
            Ok(f) => f,
            Err(e) => return self.fatal(format!("create dest: {e}")),
        };

        let count = match archive::pack_tar(Path::new(dir), file_paths, file, compress) {
            Ok(count) => count,
            Err(e) => {
                let _ = std::fs::remove_file(dest);
                return self.fatal(format!("pack: {e:#}"));
            }
        };

        let size = match std::fs::metadata(dest) {
            Ok(meta) => meta.len(),
            Err(e) => return self.fatal(format!("stat dest: {e}")),
        };

        self.send(&Response::PackDone {
            dest: dest.to_string(),
            size,
            count,
        })
    }

    fn handle_extract(&mut self, dir: &str, src: &str, compress: bool) -> Result<()> {
        if dir.is_empty() {
            return self.fatal("missing dir".to_string());
        }
        if !valid_tmp_path(src) {
            return self.fatal("src must be under /tmp/".to_string());
        }

        let file = match std::fs::File::open(src) {
            Ok(f) => f,
            Err(e) => return self.fatal(format!("open src: {e}")),
        };

        let count = match archive::unpack_tar(file, Path::new(dir), compress) {
            Ok(count) => count,
            Err(e) => return self.fatal(format!("extract: {e:#}")),
        };

        let _ = std::fs::remove_file(src);

        self.send(&Response::ExtractDone { count })
    }

    fn handle_delete(&mut self, dir: &str, file_paths: &[String]) -> Result<()> {
        if let Err(msg) = validate_dir(dir) {
            return self.fatal(msg);
        }
        for p in file_paths {
            if let Err(e) = paths::validate_rel_path(p) {
                return self.fatal(format!("invalid path: {e:#}"));
            }
        }
        if let Err(msg) = check_containment(dir, file_paths) {
            return self.fatal(msg);
        }

        let mut count = 0;
        for p in file_paths {
            let full = Path::new(dir).join(p);
            match paths::remove_path(&full) {
                Ok(()) => count += 1,
                Err(e) => self.non_fatal(format!("delete {p}: {e}"))?,
            }
        }

        self.send(&Response::DeleteDone { count })
    }

    fn handle_transfer(
        &mut self,
        dir: String,
        file_paths: Vec<String>,
        compress: bool,
        url: &str,
        token: &str,
    ) -> Result<()> {
        if let Err(msg) = validate_dir(&dir) {
            return self.fatal(msg);
        }
        if let Err(msg) = validate_paths(&file_paths) {
            return self.fatal(msg);
        }
        if let Err(msg) = check_containment(&dir, &file_paths) {
            return self.fatal(msg);
        }
        if url.is_empty() {
            return self.fatal("missing url".to_string());
        }
        if token.is_empty() {
            return self.fatal("missing token".to_string());
        }

        let (writer, reader) = pipe::pipe();

        let packer = std::thread::spawn(move || -> Result<usize> {
            let mut writer = writer;
            match archive::pack_tar(Path::new(&dir), &file_paths, &mut writer, compress) {
                Ok(count) => Ok(count),
                Err(e) => {
                    writer.poison(format!("{e:#}"));
                    Err(e)
                }
            }
        });

        let sent = Arc::new(AtomicU64::new(0));
        let body = CountingReader {
            inner: reader,
            count: Arc::clone(&sent),
        };

        let client = reqwest::blocking::Client::new();
        let result = client
            .put(url)
            .bearer_auth(token)
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::blocking::Body::new(body))
            .send();

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                let _ = packer.join();
                return self.fatal(format!("transfer: {e}"));
            }
        };
        let status = resp.status().as_u16();
        let _ = resp.bytes();
        if status >= 400 {
            let _ = packer.join();
            return self.fatal(format!("transfer http {status}"));
        }

        let count = match packer.join() {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => return self.fatal(format!("pack: {e:#}")),
            Err(_) => return self.fatal("pack worker panicked".to_string()),
        };

        self.send(&Response::TransferDone {
            count,
            size: sent.load(Ordering::Relaxed),
            dest: extract_path_param(url),
        })
    }
}

struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn validate_dir(dir: &str) -> std::result::Result<(), String> {
    if dir.is_empty() {
        return Err("missing dir".to_string());
    }
    match std::fs::metadata(dir) {
        Err(_) => Err(format!("dir not found: {dir}")),
        Ok(meta) if !meta.is_dir() => Err(format!("not a directory: {dir}")),
        Ok(_) => Ok(()),
    }
}

fn validate_paths(file_paths: &[String]) -> std::result::Result<(), String> {
    for p in file_paths {
        if let Err(e) = paths::validate_rel_path(p) {
            return Err(format!("invalid path: {e:#}"));
        }
    }
    Ok(())
}

fn check_containment(dir: &str, file_paths: &[String]) -> std::result::Result<(), String> {
    let base = Path::new(dir);
    for p in file_paths {
        if !paths::is_within_dir(base, &base.join(p)) {
            return Err(format!("path escapes dir: {p}"));
        }
    }
    Ok(())
}

fn valid_tmp_path(p: &str) -> bool {
    !p.is_empty() && p.starts_with("/tmp/")
}

fn extract_path_param(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return String::new();
    };
    parsed
        .query_pairs()
        .find(|(k, _)| k == "path")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Read one newline-terminated line, enforcing the per-line budget.
/// Returns `None` at end of input; a final unterminated line is
/// returned as a line.
fn read_line_capped(
    r: &mut impl BufRead,
    max: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
        let buf = r.fill_buf()?;
        if buf.is_empty() {
            return Ok(if line.is_empty() { None } else { Some(line) });
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if line.len() + pos > max {
                return Err(line_too_long(max));
            }
            line.extend_from_slice(&buf[..pos]);
            r.consume(pos + 1);
            return Ok(Some(line));
        }
        if line.len() + buf.len() > max {
            return Err(line_too_long(max));
        }
        line.extend_from_slice(buf);
        let n = buf.len();
        r.consume(n);
    }
}

fn line_too_long(max: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("request line exceeds {max} bytes"),
    )
}
