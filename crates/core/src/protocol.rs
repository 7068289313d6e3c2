//! Wire protocol between the driver and the remote agent.
//!
//! One JSON object per line in each direction. Requests are tagged by
//! `cmd`, responses by `type`; a manifest request streams `entry`
//! responses before its `manifest_done`, so consumers match on the
//! variant rather than expecting a single reply.

use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Per-line budget on both ends of the channel. Large enough for a
/// manifest entry for any plausible path, small enough to bound memory.
pub const MAX_LINE: usize = 16 << 20;

/// A request line from driver to agent.
///
/// Fields default when omitted so that, for example, a `manifest` of an
/// empty `dir` still parses and is answered with `exists: false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Manifest {
        #[serde(default)]
        dir: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excludes: Vec<String>,
    },
    Pack {
        #[serde(default)]
        dir: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
        #[serde(default)]
        dest: String,
        #[serde(default)]
        compress: bool,
    },
    Extract {
        #[serde(default)]
        dir: String,
        #[serde(default)]
        src: String,
        #[serde(default)]
        compress: bool,
    },
    Delete {
        #[serde(default)]
        dir: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
    },
    Transfer {
        #[serde(default)]
        dir: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
        #[serde(default)]
        compress: bool,
        #[serde(default)]
        url: String,
        #[serde(default)]
        token: String,
    },
    Quit,
}

/// A response line from agent to driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready {
        version: String,
        pid: u32,
    },
    Entry {
        path: String,
        hash: ContentHash,
        mode: u32,
        size: u64,
    },
    ManifestDone {
        exists: bool,
        #[serde(default)]
        count: usize,
        #[serde(default)]
        elapsed_ms: u64,
    },
    PackDone {
        dest: String,
        size: u64,
        count: usize,
    },
    ExtractDone {
        count: usize,
    },
    DeleteDone {
        count: usize,
    },
    TransferDone {
        count: usize,
        size: u64,
        dest: String,
    },
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

/// Parse one request line.
///
/// # Errors
/// Returns an error for malformed JSON or an unknown `cmd`.
pub fn parse_request(line: &str) -> Result<Request> {
    serde_json::from_str(line).wrap_err("parse request")
}

/// Parse one response line.
///
/// # Errors
/// Returns an error for malformed JSON or an unknown `type`.
pub fn parse_response(line: &str) -> Result<Response> {
    serde_json::from_str(line).wrap_err("parse response")
}

/// Encode a message as a single newline-terminated line.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut s = serde_json::to_string(msg).wrap_err("encode")?;
    s.push('\n');
    Ok(s)
}
