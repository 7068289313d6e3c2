//! Diff: report what push or pull would do, as text or JSON.

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::Serialize;

use sprync_core::{compute_diff, DiffResult, Manifest};

use crate::pull::local_manifest_or_empty;
use crate::{open_session, parse_target, print_changes, summary_line, transfer_size, App, SyncFlags};

#[derive(Serialize)]
struct DiffJson {
    transfers: Vec<DiffTransfer>,
    deletes: Vec<String>,
    summary: DiffSummary,
}

#[derive(Serialize)]
struct DiffTransfer {
    path: String,
    size: u64,
    reason: &'static str,
}

#[derive(Serialize)]
struct DiffSummary {
    transfer_count: usize,
    transfer_bytes: u64,
    delete_count: usize,
}

pub async fn run(
    app: &App,
    local_dir: &str,
    target: &str,
    flags: &SyncFlags,
    mode: &str,
    json: bool,
) -> Result<()> {
    if mode != "push" && mode != "pull" {
        return Err(eyre!("--mode must be push or pull"));
    }
    let (sprite, remote_dir) = parse_target(target)?;

    let client = app.client_for(&sprite).await?;
    let sess = open_session(&client, &sprite).await?;
    let result = diff_with_session(&sess, &remote_dir, local_dir, flags, mode, json).await;
    sess.close().await;
    result
}

async fn diff_with_session(
    sess: &sprync_transport::Session,
    remote_dir: &str,
    local_dir: &str,
    flags: &SyncFlags,
    mode: &str,
    json: bool,
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
    let remote_m = sprync_core::to_manifest(entries);
    let local_m = local?;

    let (source_m, target_m) = if mode == "push" {
        (&local_m, &remote_m)
    } else {
        if !exists {
            return Err(eyre!("remote directory does not exist"));
        }
        (&remote_m, &local_m)
    };

    let diff = compute_diff(source_m, target_m, flags.delete);

    if json {
        return print_json(&diff, source_m, target_m);
    }

    if diff.is_empty() {
        println!("Already in sync.");
        return Ok(());
    }

    print_changes(&diff.uploads, &diff.deletes, source_m, target_m);
    println!("---");
    let size = transfer_size(&diff.uploads, source_m);
    println!("{}", summary_line(diff.uploads.len(), size, diff.deletes.len()));
    Ok(())
}

fn print_json(diff: &DiffResult, source_m: &Manifest, target_m: &Manifest) -> Result<()> {
    let out = render_json(diff, source_m, target_m);
    println!("{}", serde_json::to_string_pretty(&out).wrap_err("encode diff")?);
    Ok(())
}

fn render_json(diff: &DiffResult, source_m: &Manifest, target_m: &Manifest) -> DiffJson {
    let mut out = DiffJson {
        transfers: Vec::with_capacity(diff.uploads.len()),
        deletes: diff.deletes.clone(),
        summary: DiffSummary {
            transfer_count: diff.uploads.len(),
            transfer_bytes: 0,
            delete_count: diff.deletes.len(),
        },
    };

    for p in &diff.uploads {
        let reason = if target_m.contains_key(p) { "changed" } else { "new" };
        let size = source_m.get(p).map_or(0, |e| e.size);
        out.transfers.push(DiffTransfer {
            path: p.clone(),
            size,
            reason,
        });
        out.summary.transfer_bytes += size;
    }
    out
}
