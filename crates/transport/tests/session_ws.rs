//! Session and frame-demux behavior over the fake sprite API.

mod support;

use support::FakeServer;

use sprync_transport::{Client, Session, WsConn};

/// A shell stand-in for the agent: speaks just enough of the line
/// protocol to exercise open, streaming, fatal errors, and quit.
const STUB_AGENT: &str = r#"#!/bin/sh
echo "stub agent starting" >&2
printf '%s\n' '{"type":"ready","version":"stub","pid":7}'
while IFS= read -r line; do
  case "$line" in
    *'"cmd":"manifest"'*)
      printf '%s\n' '{"type":"entry","path":"a.txt","hash":"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa","mode":420,"size":5}'
      printf '%s\n' '{"type":"error","message":"hash skip.txt: denied","fatal":false}'
      printf '%s\n' '{"type":"entry","path":"b/c.txt","hash":"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb","mode":493,"size":9}'
      printf '%s\n' '{"type":"manifest_done","exists":true,"count":2,"elapsed_ms":12}'
      ;;
    *'"cmd":"delete"'*)
      printf '%s\n' '{"type":"error","message":"path escapes dir: ../x","fatal":true}'
      ;;
    *'"cmd":"quit"'*)
      exit 0
      ;;
    *)
      printf '%s\n' '{"type":"error","message":"unknown command","fatal":true}'
      ;;
  esac
done
"#;

async fn start() -> (FakeServer, Client, tempfile::TempDir) {
    let root = tempfile::TempDir::new().unwrap();
    let server = FakeServer::start(root.path().to_path_buf()).await;
    let client = Client::new(&server.base_url(), "test-token");
    (server, client, root)
}

#[tokio::test]
async fn test_session_open_and_streamed_manifest() {
    let (_server, client, root) = start().await;

    let session = Session::open(client, "test-sprite", STUB_AGENT.as_bytes())
        .await
        .unwrap();
    assert_eq!(session.version, "stub");
    assert_eq!(session.pid, 7);

    // The agent binary landed under the fake sprite's /tmp, executable.
    let tmp = root.path().join("tmp");
    let uploaded: Vec<_> = std::fs::read_dir(&tmp)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("sprync-"))
        .collect();
    assert_eq!(uploaded.len(), 1);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mode = uploaded[0].metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    let (entries, exists, elapsed) = session.manifest("/work", &[]).await.unwrap();
    assert!(exists);
    assert_eq!(elapsed.as_millis(), 12);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, "a.txt");
    assert_eq!(entries[0].mode, 0o644);
    assert_eq!(entries[1].path, "b/c.txt");
    assert_eq!(entries[1].mode, 0o755);

    session.close().await;
}

#[tokio::test]
async fn test_session_survives_fatal_error() {
    let (_server, client, _root) = start().await;

    let session = Session::open(client, "test-sprite", STUB_AGENT.as_bytes())
        .await
        .unwrap();

    let err = session
        .delete("/work", &["../x".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("escapes"), "{err}");

    // Same channel, next request still answered.
    let (entries, exists, _) = session.manifest("/work", &[]).await.unwrap();
    assert!(exists);
    assert_eq!(entries.len(), 2);

    session.close().await;
}

#[tokio::test]
async fn test_session_close_completes_after_quit() {
    let (_server, client, _root) = start().await;

    let session = Session::open(client, "test-sprite", STUB_AGENT.as_bytes())
        .await
        .unwrap();
    // Close must return promptly: quit makes the stub exit, the exit
    // frame fires done, and teardown proceeds without the 5s fallback.
    let begin = std::time::Instant::now();
    session.close().await;
    assert!(begin.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn test_wsconn_demuxes_streams_and_exit() {
    let (_server, client, root) = start().await;

    std::fs::write(
        root.path().join("probe.sh"),
        "#!/bin/sh\necho out-line\necho err-line >&2\nexit 3\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(
            root.path().join("probe.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }

    let ws = client
        .exec_websocket("test-sprite", &["/probe.sh".to_string()], true)
        .await
        .unwrap();
    let mut conn = WsConn::new(ws);
    let mut stdout = conn.take_stdout();
    let mut stderr = conn.take_stderr();

    let mut out = Vec::new();
    while let Some(chunk) = stdout.recv().await {
        out.extend_from_slice(&chunk);
    }
    assert_eq!(String::from_utf8_lossy(&out), "out-line\n");

    let mut err = Vec::new();
    while let Some(chunk) = stderr.recv().await {
        err.extend_from_slice(&chunk);
    }
    assert_eq!(String::from_utf8_lossy(&err), "err-line\n");

    assert_eq!(conn.done().await, 3);
    assert_eq!(conn.session_id(), "fake-session-1");
    conn.close().await;
}

#[tokio::test]
async fn test_wsconn_stdin_framing_and_eof() {
    let (_server, client, root) = start().await;

    std::fs::write(root.path().join("echo.sh"), "#!/bin/sh\nexec cat\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(
            root.path().join("echo.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
    }

    let ws = client
        .exec_websocket("test-sprite", &["/echo.sh".to_string()], true)
        .await
        .unwrap();
    let mut conn = WsConn::new(ws);
    let mut stdout = conn.take_stdout();
    let _stderr = conn.take_stderr();

    conn.write_stdin(b"echoed through cat").await.unwrap();
    conn.close_stdin().await.unwrap();

    let mut out = Vec::new();
    while let Some(chunk) = stdout.recv().await {
        out.extend_from_slice(&chunk);
    }
    assert_eq!(String::from_utf8_lossy(&out), "echoed through cat");

    assert_eq!(conn.done().await, 0);
    assert_eq!(conn.exit_code(), Some(0));
    conn.close().await;
}

#[tokio::test]
async fn test_fs_write_read_roundtrip_and_sprite_info() {
    let (_server, client, root) = start().await;

    client
        .fs_write("test-sprite", "/tmp/blob.bin", None, false, vec![1u8, 2, 3])
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(root.path().join("tmp/blob.bin")).unwrap(),
        [1, 2, 3]
    );

    let back = client.fs_read("test-sprite", "/tmp/blob.bin").await.unwrap();
    assert_eq!(&back[..], [1, 2, 3]);

    let info = client.get_sprite("test-sprite").await.unwrap();
    assert_eq!(info.name, "test-sprite");
    assert_eq!(info.status, "running");

    let err = client.fs_read("test-sprite", "/tmp/missing").await.unwrap_err();
    assert!(err.to_string().starts_with("api 404"), "{err}");
}
