//! Pull: sprite→local.

use std::path::Path;

use color_eyre::eyre::{eyre, Result, WrapErr};

use sprync_core::{archive, compute_diff, paths, walk_local, Manifest};

use crate::{open_session, parse_target, print_changes, summary_line, transfer_size, App, SyncFlags};

pub async fn run(app: &App, target: &str, local_dir: &str, flags: &SyncFlags) -> Result<()> {
    let (sprite, remote_dir) = parse_target(target)?;

    let client = app.client_for(&sprite).await?;
    let sess = open_session(&client, &sprite).await?;
    let result = pull_with_session(&client, &sess, &sprite, &remote_dir, local_dir, flags).await;
    sess.close().await;
    result
}

async fn pull_with_session(
    client: &sprync_transport::Client,
    sess: &sprync_transport::Session,
    sprite: &str,
    remote_dir: &str,
    local_dir: &str,
    flags: &SyncFlags,
) -> Result<()> {
    let (remote, local) = tokio::join!(
        sess.manifest(remote_dir, &flags.exclude),
        local_manifest_or_empty(local_dir, &flags.exclude),
    );
    let (entries, exists, elapsed) = remote.wrap_err("remote manifest")?;
    tracing::debug!(
        "remote manifest: count={} exists={exists} elapsed={elapsed:?}",
        entries.len()
    );
    if !exists {
        return Err(eyre!("remote directory {remote_dir} does not exist"));
    }
    let remote_m = sprync_core::to_manifest(entries);
    let local_m = local?;
    tracing::debug!("local manifest: count={}", local_m.len());

    // Pull is a push with the remote as source.
    let diff = compute_diff(&remote_m, &local_m, flags.delete);
    let downloads = diff.uploads;
    let deletes = diff.deletes;

    if downloads.is_empty() && deletes.is_empty() {
        println!("Already in sync.");
        return Ok(());
    }

    println!("Pulling from {sprite}:{remote_dir}");
    print_changes(&downloads, &deletes, &remote_m, &local_m);

    let size = transfer_size(&downloads, &remote_m);
    println!("{}", summary_line(downloads.len(), size, deletes.len()));

    if flags.dry_run {
        return Ok(());
    }

    if !downloads.is_empty() {
        let packed = sess
            .pack(remote_dir, &downloads, flags.compress)
            .await
            .wrap_err("remote pack")?;
        tracing::debug!(
            "packed: dest={} size={} count={}",
            packed.dest,
            packed.size,
            packed.count
        );

        let body = client
            .fs_read(sprite, &packed.dest)
            .await
            .wrap_err("download")?;

        let count = unpack_local_task(body, local_dir, flags.compress).await?;
        println!("Transferred {count} files ({})", crate::human_bytes(size));
    }

    if !deletes.is_empty() {
        let mut deleted = 0;
        for p in &deletes {
            let target = Path::new(local_dir).join(p);
            match paths::remove_path(&target) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!("delete failed: path={p} err={e}"),
            }
        }
        println!("Deleted {deleted} files");
    }

    Ok(())
}

/// Local manifest for pull/diff: a missing local directory is just an
/// empty tree, not an error.
pub(crate) async fn local_manifest_or_empty(dir: &str, excludes: &[String]) -> Result<Manifest> {
    if !Path::new(dir).is_dir() {
        return Ok(Manifest::new());
    }
    let dir = dir.to_string();
    let excludes = excludes.to_vec();
    tokio::task::spawn_blocking(move || walk_local(Path::new(&dir), &excludes))
        .await
        .map_err(|e| eyre!("walk task: {e}"))?
        .wrap_err("walk local")
}

async fn unpack_local_task(body: bytes::Bytes, dir: &str, compress: bool) -> Result<usize> {
    let dir = dir.to_string();
    tokio::task::spawn_blocking(move || {
        archive::unpack_tar(&body[..], Path::new(&dir), compress).wrap_err("unpack")
    })
    .await
    .map_err(|e| eyre!("unpack task: {e}"))?
}
