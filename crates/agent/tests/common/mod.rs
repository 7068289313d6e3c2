//! Test harness: drive the real spryncd binary over plain stdio.
#![allow(dead_code)] // each test binary uses a different slice of this

//!
//! The line protocol here is byte-identical to what the driver speaks
//! through the WebSocket splice, so these tests exercise the same code
//! the remote path runs.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use sprync_core::protocol::{self, Request, Response};
use sprync_core::{Manifest, ManifestEntry};

pub struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pub version: String,
    pub pid: u32,
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
    pub fn start() -> Session {
        let mut child = Command::new(env!("CARGO_BIN_EXE_spryncd"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn spryncd");

        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());

        let mut s = Session {
            child,
            stdin,
            stdout,
            version: String::new(),
            pid: 0,
        };

        match s.read_response().expect("read ready") {
            Response::Ready { version, pid } => {
                s.version = version;
                s.pid = pid;
            }
            other => panic!("expected ready, got {other:?}"),
        }
        s
    }

    fn send(&mut self, req: &Request) {
        let line = protocol::encode_line(req).expect("encode request");
        self.stdin.write_all(line.as_bytes()).expect("write request");
        self.stdin.flush().expect("flush request");
    }

    fn read_response(&mut self) -> Result<Response, String> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("unexpected EOF".to_string());
        }
        protocol::parse_response(line.trim()).map_err(|e| format!("{e:#}"))
    }

    /// Streamed manifest: entries, whether the root exists, elapsed.
    pub fn manifest(
        &mut self,
        dir: &str,
        excludes: &[&str],
    ) -> Result<(Vec<ManifestEntry>, bool, Duration), String> {
        self.send(&Request::Manifest {
            dir: dir.to_string(),
            excludes: excludes.iter().map(|s| (*s).to_string()).collect(),
        });

        let mut entries = Vec::new();
        loop {
            match self.read_response()? {
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
                        return Err(message);
                    }
                }
                other => return Err(format!("unexpected response: {other:?}")),
            }
        }
    }

    pub fn manifest_map(&mut self, dir: &str, excludes: &[&str]) -> Manifest {
        let (entries, _, _) = self.manifest(dir, excludes).expect("manifest");
        sprync_core::to_manifest(entries)
    }

    pub fn pack(
        &mut self,
        dir: &str,
        paths: &[&str],
        dest: &str,
        compress: bool,
    ) -> Result<PackResult, String> {
        self.send(&Request::Pack {
            dir: dir.to_string(),
            paths: paths.iter().map(|s| (*s).to_string()).collect(),
            dest: dest.to_string(),
            compress,
        });

        loop {
            match self.read_response()? {
                Response::PackDone { dest, size, count } => {
                    return Ok(PackResult { dest, size, count });
                }
                Response::Error { message, fatal } => {
                    if fatal {
                        return Err(message);
                    }
                }
                other => return Err(format!("unexpected response: {other:?}")),
            }
        }
    }

    pub fn extract(&mut self, dir: &str, src: &str, compress: bool) -> Result<usize, String> {
        self.send(&Request::Extract {
            dir: dir.to_string(),
            src: src.to_string(),
            compress,
        });

        loop {
            match self.read_response()? {
                Response::ExtractDone { count } => return Ok(count),
                Response::Error { message, fatal } => {
                    if fatal {
                        return Err(message);
                    }
                }
                other => return Err(format!("unexpected response: {other:?}")),
            }
        }
    }

    pub fn delete(&mut self, dir: &str, paths: &[&str]) -> Result<usize, String> {
        self.send(&Request::Delete {
            dir: dir.to_string(),
            paths: paths.iter().map(|s| (*s).to_string()).collect(),
        });

        loop {
            match self.read_response()? {
                Response::DeleteDone { count } => return Ok(count),
                Response::Error { message, fatal } => {
                    if fatal {
                        return Err(message);
                    }
                }
                other => return Err(format!("unexpected response: {other:?}")),
            }
        }
    }

    pub fn transfer(
        &mut self,
        dir: &str,
        paths: &[&str],
        compress: bool,
        url: &str,
        token: &str,
    ) -> Result<TransferResult, String> {
        self.send(&Request::Transfer {
            dir: dir.to_string(),
            paths: paths.iter().map(|s| (*s).to_string()).collect(),
            compress,
            url: url.to_string(),
            token: token.to_string(),
        });

        loop {
            match self.read_response()? {
                Response::TransferDone { count, size, dest } => {
                    return Ok(TransferResult { count, size, dest });
                }
                Response::Error { message, fatal } => {
                    if fatal {
                        return Err(message);
                    }
                }
                other => return Err(format!("unexpected response: {other:?}")),
            }
        }
    }

    pub fn quit(mut self) {
        self.send(&Request::Quit);
        let _ = self.child.wait();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Build a tree of (relative path, contents) under `dir`.
pub fn make_tree(dir: &std::path::Path, files: &[(&str, &str)]) {
    for (rel, contents) in files {
        let full = dir.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }
}

/// A scratch tar path in real /tmp with a unique suffix per test.
pub fn scratch_tar(tag: &str) -> String {
    format!("/tmp/sprync-test-{tag}-{}.tar.gz", std::process::id())
}
