//! In-process fake of the sprite control API for transport tests.
//!
//! Serves FSWrite/FSRead/GetSprite/exec against a scratch root
//! directory. The exec WebSocket speaks the same one-byte stream
//! framing as the hosted API and runs the uploaded program for real,
//! so a shell-script stand-in for the agent exercises the whole
//! session path.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub struct FakeServer {
    pub addr: SocketAddr,
    pub root: PathBuf,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(root: PathBuf) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_root = root.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let root = accept_root.clone();
                tokio::spawn(async move {
                    let _ = handle_conn(stream, root).await;
                });
            }
        });

        FakeServer { addr, root, handle }
    }

    /// Base URL in the shape the driver builds: `…/v1/sprites`.
    pub fn base_url(&self) -> String {
        format!("http://{}/v1/sprites", self.addr)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Head {
    method: String,
    url: reqwest::Url,
    headers: Vec<(String, String)>,
}

impl Head {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn query(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn query_all(&self, name: &str) -> Vec<String> {
        self.url
            .query_pairs()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .collect()
    }

    fn is_websocket(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }
}

async fn read_head(reader: &mut BufReader<TcpStream>) -> std::io::Result<Head> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let url = reqwest::Url::parse(&format!("http://fake{target}"))
        .map_err(|e| std::io::Error::other(format!("bad target: {e}")))?;
    Ok(Head {
        method,
        url,
        headers,
    })
}

fn resolve(root: &Path, p: &str) -> PathBuf {
    root.join(p.trim_start_matches('/'))
}

async fn respond(
    reader: BufReader<TcpStream>,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let mut stream = reader.into_inner();
    let reason = if status < 400 { "OK" } else { "Error" };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn handle_conn(stream: TcpStream, root: PathBuf) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await?;
    let path = head.url.path().to_string();

    if path.ends_with("/fs/write") && head.method == "PUT" {
        return handle_fs_write(reader, &head, &root).await;
    }
    if path.ends_with("/fs/read") && head.method == "GET" {
        return handle_fs_read(reader, &head, &root).await;
    }
    if path.ends_with("/exec") {
        if head.is_websocket() {
            return handle_exec_ws(reader, &head, &root).await;
        }
        return handle_exec_http(reader, &head, &root).await;
    }
    if head.method == "GET" && path.starts_with("/v1/sprites/") {
        let name = path.trim_start_matches("/v1/sprites/");
        let body = format!(r#"{{"name":"{name}","status":"running"}}"#);
        return respond(reader, 200, "application/json", body.as_bytes()).await;
    }
    respond(reader, 404, "text/plain", b"not found").await
}

async fn read_body(reader: &mut BufReader<TcpStream>, head: &Head) -> std::io::Result<Vec<u8>> {
    let len: usize = head
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn handle_fs_write(
    mut reader: BufReader<TcpStream>,
    head: &Head,
    root: &Path,
) -> std::io::Result<()> {
    let Some(path) = head.query("path") else {
        return respond(reader, 400, "text/plain", b"missing path").await;
    };
    let body = read_body(&mut reader, head).await?;

    let target = resolve(root, &path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, &body)?;

    #[cfg(unix)]
    if let Some(mode) = head.query("mode") {
        use std::os::unix::fs::PermissionsExt as _;
        if let Ok(bits) = u32::from_str_radix(&mode, 8) {
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(bits))?;
        }
    }

    let resp = format!(r#"{{"path":"{path}","size":{}}}"#, body.len());
    respond(reader, 200, "application/json", resp.as_bytes()).await
}

async fn handle_fs_read(
    reader: BufReader<TcpStream>,
    head: &Head,
    root: &Path,
) -> std::io::Result<()> {
    let Some(path) = head.query("path") else {
        return respond(reader, 400, "text/plain", b"missing path").await;
    };
    match std::fs::read(resolve(root, &path)) {
        Ok(body) => respond(reader, 200, "application/octet-stream", &body).await,
        Err(e) => respond(reader, 404, "text/plain", e.to_string().as_bytes()).await,
    }
}

async fn handle_exec_http(
    mut reader: BufReader<TcpStream>,
    head: &Head,
    root: &Path,
) -> std::io::Result<()> {
    let cmd = head.query_all("cmd");
    if cmd.is_empty() {
        return respond(reader, 400, "text/plain", b"missing cmd").await;
    }
    let stdin = read_body(&mut reader, head).await?;

    let mut command = std::process::Command::new(resolve(root, &cmd[0]));
    command
        .args(&cmd[1..])
        .current_dir(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return respond(reader, 500, "text/plain", e.to_string().as_bytes()).await;
        }
    };
    if let Some(mut child_stdin) = child.stdin.take() {
        use std::io::Write as _;
        let _ = child_stdin.write_all(&stdin);
    }
    let output = child.wait_with_output()?;

    let mut body = output.stdout;
    body.extend_from_slice(&output.stderr);
    let status = if output.status.success() { 200 } else { 500 };
    respond(reader, status, "application/octet-stream", &body).await
}

async fn handle_exec_ws(
    reader: BufReader<TcpStream>,
    head: &Head,
    root: &Path,
) -> std::io::Result<()> {
    let cmd = head.query_all("cmd");
    let Some(key) = head.header("sec-websocket-key") else {
        return respond(reader, 400, "text/plain", b"missing websocket key").await;
    };
    let accept = derive_accept_key(key.as_bytes());

    let mut stream = reader.into_inner();
    let resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {accept}\r\n\r\n"
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.flush().await?;

    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    run_exec_ws(ws, cmd, root).await;
    Ok(())
}

async fn run_exec_ws(ws: WebSocketStream<TcpStream>, cmd: Vec<String>, root: &Path) {
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut child = match tokio::process::Command::new(resolve(root, &cmd[0]))
        .args(&cmd[1..])
        .current_dir(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = tx
                .send(Message::Binary(
                    [&[0x02][..], e.to_string().as_bytes()].concat(),
                ))
                .await;
            let _ = tx.send(Message::Binary(vec![0x03, 127])).await;
            return;
        }
    };

    let info = r#"{"type":"session_info","session_id":"fake-session-1","is_owner":true,"tty":false}"#;
    let _ = tx.send(Message::Text(info.to_string())).await;

    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();
    let mut stdin = child.stdin.take();

    let out_pump = tokio::spawn(pump_output(stdout, 0x01, tx.clone()));
    let err_pump = tokio::spawn(pump_output(stderr, 0x02, tx.clone()));

    let input = tokio::spawn(async move {
        while let Some(Ok(msg)) = source.next().await {
            if let Message::Binary(data) = msg {
                match data.split_first() {
                    Some((0x00, rest)) => {
                        if let Some(stdin) = stdin.as_mut() {
                            if stdin.write_all(rest).await.is_err() {
                                break;
                            }
                            let _ = stdin.flush().await;
                        }
                    }
                    Some((0x04, _)) => {
                        stdin.take();
                    }
                    _ => {}
                }
            }
        }
    });

    let _ = out_pump.await;
    let _ = err_pump.await;
    let code = child
        .wait()
        .await
        .ok()
        .and_then(|s| s.code())
        .unwrap_or(-1);

    let _ = tx.send(Message::Binary(vec![0x03, code as u8])).await;
    let exit = format!(r#"{{"type":"exit","exit_code":{code}}}"#);
    let _ = tx.send(Message::Text(exit)).await;

    drop(tx);
    let _ = writer.await;
    input.abort();
}

async fn pump_output(
    mut from: impl tokio::io::AsyncRead + Unpin,
    prefix: u8,
    tx: mpsc::Sender<Message>,
) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut msg = Vec::with_capacity(1 + n);
                msg.push(prefix);
                msg.extend_from_slice(&buf[..n]);
                if tx.send(Message::Binary(msg)).await.is_err() {
                    break;
                }
            }
        }
    }
}
