//! Thin client for the hosted sprite control API.
//!
//! Five operations: FSWrite, FSRead, GetSprite, exec over HTTP, and exec
//! over WebSocket. All are bearer-authenticated; API error bodies of the
//! shape `{"error": …, "code": …}` are folded into the returned error.

use bytes::Bytes;
use color_eyre::eyre::{eyre, Result, WrapErr};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use sprync_core::MAX_LINE;

/// The exec WebSocket stream type handed to [`crate::WsConn`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpriteInfo {
    pub name: String,
    pub status: String,
}

impl Client {
    /// `base_url` is the sprites collection root, e.g.
    /// `https://api.sprites.dev/v1/sprites`.
    #[must_use]
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    fn sprite_url(&self, sprite: &str, path: &str) -> String {
        format!("{}/{sprite}{path}", self.base_url)
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.as_u16() < 400 {
            return Ok(resp);
        }
        let body = resp.bytes().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    /// Upload an octet stream to an absolute path inside the sprite.
    ///
    /// # Errors
    /// Returns an error on transport failure or a non-2xx status.
    pub async fn fs_write(
        &self,
        sprite: &str,
        path: &str,
        mode: Option<&str>,
        mkdir: bool,
        body: impl Into<reqwest::Body>,
    ) -> Result<()> {
        let url = self.fs_write_url_with(sprite, path, mode, mkdir)?;
        let resp = self
            .http
            .put(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .wrap_err("fs write")?;
        self.check(resp).await?;
        Ok(())
    }

    /// The absolute FSWrite URL for `path`, as handed to a source agent
    /// for sprite-to-sprite transfer.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse.
    pub fn fs_write_url(&self, sprite: &str, path: &str) -> Result<String> {
        Ok(self
            .fs_write_url_with(sprite, path, None, false)?
            .to_string())
    }

    fn fs_write_url_with(
        &self,
        sprite: &str,
        path: &str,
        mode: Option<&str>,
        mkdir: bool,
    ) -> Result<Url> {
        let mut url =
            Url::parse(&self.sprite_url(sprite, "/fs/write")).wrap_err("fs write url")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("path", path);
            if let Some(mode) = mode {
                q.append_pair("mode", mode);
            }
            if !mkdir {
                q.append_pair("mkdir", "false");
            }
        }
        Ok(url)
    }

    /// Download the file at an absolute path inside the sprite.
    ///
    /// # Errors
    /// Returns an error on transport failure or a non-2xx status.
    pub async fn fs_read(&self, sprite: &str, path: &str) -> Result<Bytes> {
        let mut url = Url::parse(&self.sprite_url(sprite, "/fs/read")).wrap_err("fs read url")?;
        url.query_pairs_mut().append_pair("path", path);

        let resp = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .wrap_err("fs read")?;
        let resp = self.check(resp).await?;
        resp.bytes().await.wrap_err("fs read body")
    }

    /// Reachability probe.
    ///
    /// # Errors
    /// Returns an error on transport failure, a non-2xx status, or an
    /// unparseable body.
    pub async fn get_sprite(&self, sprite: &str) -> Result<SpriteInfo> {
        let resp = self
            .http
            .get(self.sprite_url(sprite, ""))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .wrap_err("get sprite")?;
        let resp = self.check(resp).await?;
        resp.json().await.wrap_err("sprite info body")
    }

    /// Run a command to completion over plain HTTP, returning combined
    /// output. Used for best-effort cleanup; most work goes over the
    /// WebSocket instead.
    ///
    /// # Errors
    /// Returns an error on transport failure or a non-2xx status.
    pub async fn exec_http(
        &self,
        sprite: &str,
        cmd: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<Bytes> {
        let mut url = Url::parse(&self.sprite_url(sprite, "/exec")).wrap_err("exec url")?;
        {
            let mut q = url.query_pairs_mut();
            for arg in cmd {
                q.append_pair("cmd", arg);
            }
        }

        let mut req = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token));
        if let Some(stdin) = stdin {
            req = req.body(stdin);
        }
        let resp = req.send().await.wrap_err("exec")?;
        let resp = self.check(resp).await?;
        resp.bytes().await.wrap_err("exec body")
    }

    /// Open the exec WebSocket for `cmd` with the §framing of
    /// [`crate::wsconn`].
    ///
    /// # Errors
    /// Returns an error if the URL does not parse or the dial fails.
    pub async fn exec_websocket(
        &self,
        sprite: &str,
        cmd: &[String],
        stdin: bool,
    ) -> Result<WsStream> {
        let mut url = Url::parse(&self.sprite_url(sprite, "/exec")).wrap_err("exec url")?;
        {
            let mut q = url.query_pairs_mut();
            for arg in cmd {
                q.append_pair("cmd", arg);
            }
            if stdin {
                q.append_pair("stdin", "true");
            }
        }

        let ws_url = http_to_ws(url.as_str());
        let mut request = ws_url
            .into_client_request()
            .wrap_err("websocket request")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {}", self.token)
                .parse()
                .map_err(|e| eyre!("authorization header: {e}"))?,
        );

        let config = WebSocketConfig {
            max_message_size: Some(MAX_LINE),
            max_frame_size: Some(MAX_LINE),
            ..WebSocketConfig::default()
        };
        let (ws, _resp) = connect_async_with_config(request, Some(config), false)
            .await
            .wrap_err("websocket dial")?;
        Ok(ws)
    }
}

fn http_to_ws(u: &str) -> String {
    if let Some(rest) = u.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    if let Some(rest) = u.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    u.to_string()
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: String,
}

fn api_error(status: StatusCode, body: &[u8]) -> color_eyre::eyre::Report {
    if let Ok(parsed) = serde_json::from_slice::<ApiErrorBody>(body) {
        if !parsed.error.is_empty() {
            return if parsed.code.is_empty() {
                eyre!("api {}: {}", status.as_u16(), parsed.error)
            } else {
                eyre!("api {} ({}): {}", status.as_u16(), parsed.code, parsed.error)
            };
        }
    }
    let msg = String::from_utf8_lossy(body);
    let msg = msg.trim();
    if msg.is_empty() {
        eyre!(
            "api {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("error")
        )
    } else {
        eyre!("api {}: {msg}", status.as_u16())
    }
}
