//! Doctor: check API reachability, session bring-up, and manifests.

use std::time::Instant;

use color_eyre::eyre::{eyre, Result};

use sprync_transport::Session;

use crate::{embedded, human_bytes, App};

pub async fn run(app: &App, sprite: &str) -> Result<()> {
    let client = app.client_for(sprite).await?;

    println!("Sprite: {sprite}");

    let info = match client.get_sprite(sprite).await {
        Ok(info) => info,
        Err(e) => {
            println!("  API: FAIL ({e})");
            return Err(eyre!("sprite check failed"));
        }
    };
    println!("  Status: {}", info.status);
    println!("  API: ok");

    let binary = embedded::agent_binary()?;
    let started = Instant::now();
    let sess = match Session::open(client.clone(), sprite, binary).await {
        Ok(sess) => sess,
        Err(e) => {
            println!("  Session: FAIL ({e:#})");
            return Err(eyre!("session check failed"));
        }
    };
    let connect_ms = started.elapsed().as_millis();

    println!(
        "  Upload: ok (spryncd {}, {})",
        sess.version,
        human_bytes(binary.len() as u64)
    );
    println!("  Exec: ok (ready in {connect_ms}ms)");

    let result = sess.manifest("/tmp", &[]).await;
    match &result {
        Ok((entries, _, elapsed)) => {
            println!(
                "  Manifest: ok ({} entries in /tmp, {}ms)",
                entries.len(),
                elapsed.as_millis()
            );
        }
        Err(e) => println!("  Manifest: FAIL ({e:#})"),
    }
    sess.close().await;
    if result.is_err() {
        return Err(eyre!("manifest check failed"));
    }

    println!("\nAll checks passed.");
    Ok(())
}
