//! Demux of the exec WebSocket into stdin/stdout/stderr/exit streams.
//!
//! Binary frames carry a one-byte stream prefix; text frames carry
//! out-of-band JSON. A read pump feeds stdout and stderr chunk channels
//! and fires `done` exactly once when exit is observed, either as a
//! `0x03` frame or an `exit` text message.

use std::sync::{Arc, Mutex};

use color_eyre::eyre::{eyre, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::api::WsStream;

pub const PREFIX_STDIN: u8 = 0x00;
pub const PREFIX_STDOUT: u8 = 0x01;
pub const PREFIX_STDERR: u8 = 0x02;
pub const PREFIX_EXIT: u8 = 0x03;
pub const PREFIX_STDIN_EOF: u8 = 0x04;

/// Chunks buffered per output stream before the pump backpressures.
const STREAM_DEPTH: usize = 64;

pub struct WsConn {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stdout: Option<mpsc::Receiver<Vec<u8>>>,
    stderr: Option<mpsc::Receiver<Vec<u8>>>,
    done: watch::Receiver<Option<i32>>,
    session_id: Arc<Mutex<String>>,
    pump: tokio::task::JoinHandle<()>,
}

impl WsConn {
    #[must_use]
    pub fn new(ws: WsStream) -> Self {
        let (write_half, read_half) = ws.split();
        let (stdout_tx, stdout_rx) = mpsc::channel(STREAM_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel(STREAM_DEPTH);
        let (done_tx, done_rx) = watch::channel(None);
        let session_id = Arc::new(Mutex::new(String::new()));

        let pump = tokio::spawn(read_pump(
            read_half,
            stdout_tx,
            stderr_tx,
            done_tx,
            Arc::clone(&session_id),
        ));

        Self {
            writer: tokio::sync::Mutex::new(write_half),
            stdout: Some(stdout_rx),
            stderr: Some(stderr_rx),
            done: done_rx,
            session_id,
            pump,
        }
    }

    /// Agent stdout as a stream of raw chunks. Takeable once.
    pub fn take_stdout(&mut self) -> mpsc::Receiver<Vec<u8>> {
        self.stdout.take().expect("stdout already taken")
    }

    /// Agent stderr as a stream of raw chunks. Takeable once.
    pub fn take_stderr(&mut self) -> mpsc::Receiver<Vec<u8>> {
        self.stderr.take().expect("stderr already taken")
    }

    /// Frame `data` as agent stdin and send it as one message.
    ///
    /// # Errors
    /// Returns an error if the socket write fails.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut msg = Vec::with_capacity(1 + data.len());
        msg.push(PREFIX_STDIN);
        msg.extend_from_slice(data);
        self.writer
            .lock()
            .await
            .send(Message::Binary(msg.into()))
            .await
            .map_err(|e| eyre!("write stdin: {e}"))
    }

    /// Signal stdin end-of-stream to the agent.
    ///
    /// # Errors
    /// Returns an error if the socket write fails.
    pub async fn close_stdin(&self) -> Result<()> {
        self.writer
            .lock()
            .await
            .send(Message::Binary(vec![PREFIX_STDIN_EOF].into()))
            .await
            .map_err(|e| eyre!("close stdin: {e}"))
    }

    /// Wait until the agent's exit is observed; returns the exit code.
    pub async fn done(&self) -> i32 {
        let mut done = self.done.clone();
        let result = match done.wait_for(Option::is_some).await {
            Ok(v) => v.unwrap_or(-1),
            // Pump gone without an exit frame; treat as abnormal exit.
            Err(_) => -1,
        };
        result
    }

    /// Exit code if already observed.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.done.borrow()
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.session_id.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Tear the connection down: cancel in-flight reads (pending readers
    /// see end-of-stream) and close the socket.
    pub async fn close(&self) {
        self.pump.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.close().await;
    }
}

#[derive(Debug, Deserialize)]
struct TextFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    exit_code: i32,
}

async fn read_pump(
    mut read_half: SplitStream<WsStream>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    done_tx: watch::Sender<Option<i32>>,
    session_id: Arc<Mutex<String>>,
) {
    while let Some(item) = read_half.next().await {
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("websocket read: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                handle_text_frame(text.as_bytes(), &done_tx, &session_id);
                if done_tx.borrow().is_some() {
                    break;
                }
            }
            Message::Binary(data) => {
                let Some((&prefix, rest)) = data.split_first() else {
                    continue;
                };
                match prefix {
                    PREFIX_STDOUT => {
                        if stdout_tx.send(rest.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    PREFIX_STDERR => {
                        if stderr_tx.send(rest.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    PREFIX_EXIT => {
                        let code = rest.first().map_or(0, |&b| i32::from(b));
                        let _ = done_tx.send(Some(code));
                        return;
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    // Dropping the senders EOFs both readers.
}

fn handle_text_frame(
    data: &[u8],
    done_tx: &watch::Sender<Option<i32>>,
    session_id: &Arc<Mutex<String>>,
) {
    let Ok(frame) = serde_json::from_slice::<TextFrame>(data) else {
        return;
    };
    match frame.kind.as_str() {
        "session_info" => {
            if let Ok(mut s) = session_id.lock() {
                *s = frame.session_id;
            }
        }
        "exit" => {
            // Only the first exit report wins.
            done_tx.send_if_modified(|v| {
                if v.is_none() {
                    *v = Some(frame.exit_code);
                    true
                } else {
                    false
                }
            });
        }
        other => {
            tracing::debug!(
                "unknown ws text frame type={other} data={}",
                String::from_utf8_lossy(data)
            );
        }
    }
}
