//! Push: local→sprite, or sprite→sprite without touching this host.

use std::path::Path;

use color_eyre::eyre::{eyre, Result, WrapErr};

use sprync_core::{archive, compute_diff, walk_local, Manifest};
use sprync_transport::{scratch_path, tar_ext, Client, Session};

use crate::{
    open_session, parse_target, print_changes, summary_line, transfer_size, App, SyncFlags,
};

pub async fn run(app: &App, source: &str, target: &str, flags: &SyncFlags) -> Result<()> {
    let (sprite, remote_dir) = parse_target(target)?;

    // A source that parses as sprite:dir and is not a directory here is
    // another sprite; bulk data then moves sprite-to-sprite directly.
    if let Ok((src_sprite, src_dir)) = parse_target(source) {
        if !Path::new(source).is_dir() {
            return run_sprite_to_sprite(app, &src_sprite, &src_dir, &sprite, &remote_dir, flags)
                .await;
        }
    }

    let client = app.client_for(&sprite).await?;
    let sess = open_session(&client, &sprite).await?;
    let result = push_with_session(&client, &sess, source, &sprite, &remote_dir, flags).await;
    sess.close().await;
    result
}

async fn push_with_session(
    client: &Client,
    sess: &Session,
    local_dir: &str,
    sprite: &str,
    remote_dir: &str,
    flags: &SyncFlags,
) -> Result<()> {
    let (remote, local) = tokio::join!(
        sess.manifest(remote_dir, &flags.exclude),
        walk_local_task(local_dir, &flags.exclude),
    );
    let (entries, exists, elapsed) = remote.wrap_err("remote manifest")?;
    tracing::debug!(
        "remote manifest: count={} exists={exists} elapsed={elapsed:?}",
        entries.len()
    );
    let remote_m = sprync_core::to_manifest(entries);

    let local_m = local.wrap_err("walk local")?;
    tracing::debug!("local manifest: count={}", local_m.len());

    let (uploads, deletes) = plan_push(&local_m, &remote_m, exists, flags.delete);

    if uploads.is_empty() && deletes.is_empty() {
        println!("Already in sync.");
        return Ok(());
    }

    let tag = if exists { "" } else { " (new)" };
    println!("Pushing to {sprite}:{remote_dir}{tag}");
    print_changes(&uploads, &deletes, &local_m, &remote_m);

    let size = transfer_size(&uploads, &local_m);
    println!("{}", summary_line(uploads.len(), size, deletes.len()));

    if flags.dry_run {
        return Ok(());
    }

    if !uploads.is_empty() {
        let tar = pack_local_task(local_dir, &uploads, flags.compress).await?;

        let dest = scratch_path(tar_ext(flags.compress));
        client
            .fs_write(sprite, &dest, None, false, tar)
            .await
            .wrap_err("upload")?;

        let count = sess
            .extract(remote_dir, &dest, flags.compress)
            .await
            .wrap_err("extract")?;
        println!("Transferred {count} files ({})", crate::human_bytes(size));
    }

    if !deletes.is_empty() {
        let count = sess.delete(remote_dir, &deletes).await.wrap_err("delete")?;
        println!("Deleted {count} files");
    }

    Ok(())
}

async fn run_sprite_to_sprite(
    app: &App,
    src_sprite: &str,
    src_dir: &str,
    dst_sprite: &str,
    dst_dir: &str,
    flags: &SyncFlags,
) -> Result<()> {
    let client = app.client_for(src_sprite).await?;

    let src_sess = open_session(&client, src_sprite).await?;
    let dst_sess = match open_session(&client, dst_sprite).await {
        Ok(sess) => sess,
        Err(e) => {
            src_sess.close().await;
            return Err(e);
        }
    };

    let result = transfer_between(
        &client, &src_sess, &dst_sess, src_sprite, src_dir, dst_sprite, dst_dir, flags,
    )
    .await;

    src_sess.close().await;
    dst_sess.close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn transfer_between(
    client: &Client,
    src_sess: &Session,
    dst_sess: &Session,
    src_sprite: &str,
    src_dir: &str,
    dst_sprite: &str,
    dst_dir: &str,
    flags: &SyncFlags,
) -> Result<()> {
    let (src, dst) = tokio::join!(
        src_sess.manifest(src_dir, &flags.exclude),
        dst_sess.manifest(dst_dir, &flags.exclude),
    );
    let (src_entries, src_exists, _) = src.wrap_err("source manifest")?;
    if !src_exists {
        return Err(eyre!("source directory {src_sprite}:{src_dir} does not exist"));
    }
    let (dst_entries, dst_exists, _) = dst.wrap_err("target manifest")?;

    let src_m = sprync_core::to_manifest(src_entries);
    let dst_m = sprync_core::to_manifest(dst_entries);

    let (uploads, deletes) = plan_push(&src_m, &dst_m, dst_exists, flags.delete);

    if uploads.is_empty() && deletes.is_empty() {
        println!("Already in sync.");
        return Ok(());
    }

    let tag = if dst_exists { "" } else { " (new)" };
    println!("Pushing {src_sprite}:{src_dir} to {dst_sprite}:{dst_dir}{tag}");
    print_changes(&uploads, &deletes, &src_m, &dst_m);

    let size = transfer_size(&uploads, &src_m);
    println!("{}", summary_line(uploads.len(), size, deletes.len()));

    if flags.dry_run {
        return Ok(());
    }

    if !uploads.is_empty() {
        let scratch = scratch_path(tar_ext(flags.compress));
        let url = client.fs_write_url(dst_sprite, &scratch)?;

        let result = src_sess
            .transfer(src_dir, &uploads, flags.compress, &url, client.token())
            .await
            .wrap_err("transfer")?;
        tracing::debug!(
            "transferred: dest={} size={} count={}",
            result.dest,
            result.size,
            result.count
        );

        let count = dst_sess
            .extract(dst_dir, &scratch, flags.compress)
            .await
            .wrap_err("extract")?;
        println!("Transferred {count} files ({})", crate::human_bytes(size));
    }

    if !deletes.is_empty() {
        let count = dst_sess.delete(dst_dir, &deletes).await.wrap_err("delete")?;
        println!("Deleted {count} files");
    }

    Ok(())
}

/// Upload/delete plan: a blind target takes every source path.
fn plan_push(
    source: &Manifest,
    target: &Manifest,
    target_exists: bool,
    delete: bool,
) -> (Vec<String>, Vec<String>) {
    if target_exists {
        let diff = compute_diff(source, target, delete);
        (diff.uploads, diff.deletes)
    } else {
        let mut uploads: Vec<String> = source.keys().cloned().collect();
        uploads.sort();
        (uploads, Vec::new())
    }
}

async fn walk_local_task(dir: &str, excludes: &[String]) -> Result<Manifest> {
    let dir = dir.to_string();
    let excludes = excludes.to_vec();
    tokio::task::spawn_blocking(move || walk_local(Path::new(&dir), &excludes))
        .await
        .map_err(|e| eyre!("walk task: {e}"))?
}

async fn pack_local_task(dir: &str, paths: &[String], compress: bool) -> Result<Vec<u8>> {
    let dir = dir.to_string();
    let paths = paths.to_vec();
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        archive::pack_tar(Path::new(&dir), &paths, &mut buf, compress).wrap_err("pack")?;
        Ok(buf)
    })
    .await
    .map_err(|e| eyre!("pack task: {e}"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprync_core::{to_manifest, ContentHash, ManifestEntry};

    fn entry(path: &str, contents: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            hash: ContentHash::from_bytes(contents.as_bytes()),
            mode: 0o644,
            size: contents.len() as u64,
        }
    }

    #[test]
    fn test_plan_push_blind_target_uploads_everything() {
        let source = to_manifest(vec![entry("b.txt", "b"), entry("a.txt", "a")]);
        let target = Manifest::new();

        let (uploads, deletes) = plan_push(&source, &target, false, true);
        assert_eq!(uploads, vec!["a.txt", "b.txt"]);
        assert!(deletes.is_empty());
    }

    #[test]
    fn test_plan_push_existing_target_diffs() {
        let source = to_manifest(vec![entry("a.txt", "new")]);
        let target = to_manifest(vec![entry("a.txt", "old"), entry("gone.txt", "x")]);

        let (uploads, deletes) = plan_push(&source, &target, true, true);
        assert_eq!(uploads, vec!["a.txt"]);
        assert_eq!(deletes, vec!["gone.txt"]);
    }
}
