//! Directory manifests: walk a tree, hash every regular file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::exclude::ExcludeMatcher;
use crate::hash::{ContentHash, HASH_BUF_SIZE};

/// One regular file under a sync root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Root-relative path, forward slashes
    pub path: String,
    /// SHA-256 of the file contents
    pub hash: ContentHash,
    /// Low nine bits of the POSIX mode
    pub mode: u32,
    /// File size in bytes
    pub size: u64,
}

/// All regular files under a root, keyed by relative path.
pub type Manifest = HashMap<String, ManifestEntry>;

/// Collect entries into a [`Manifest`].
#[must_use]
pub fn to_manifest(entries: Vec<ManifestEntry>) -> Manifest {
    entries.into_iter().map(|e| (e.path.clone(), e)).collect()
}

struct FileJob {
    rel_path: String,
    abs_path: PathBuf,
}

/// Walk `dir` and hash every regular file not excluded by `excludes`.
///
/// Directories matching the exclude list are pruned; symlinks are never
/// followed and never appear in the result. Jobs are collected first,
/// then hashed on a pool of `min(cpus, jobs)` workers, each owning a
/// 1 MiB read buffer. The first worker error aborts the walk.
///
/// # Errors
/// Returns an error if the root cannot be walked or any file fails to
/// hash.
pub fn walk_local(dir: &Path, excludes: &[String]) -> Result<Manifest> {
    let matcher = ExcludeMatcher::new(excludes);
    let jobs = collect_jobs(dir, &matcher)?;

    let workers = num_cpus::get().min(jobs.len());
    if workers == 0 {
        return Ok(Manifest::new());
    }

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<FileJob>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<Result<ManifestEntry>>();
    for job in jobs {
        // Unbounded and pre-filled, so this cannot block.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    std::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || {
                let mut buf = vec![0u8; HASH_BUF_SIZE];
                for job in job_rx {
                    let _ = result_tx.send(hash_file(&job.abs_path, &job.rel_path, &mut buf));
                }
            });
        }
    });
    drop(result_tx);

    let mut manifest = Manifest::new();
    for result in result_rx {
        let entry = result?;
        manifest.insert(entry.path.clone(), entry);
    }
    Ok(manifest)
}

fn collect_jobs(dir: &Path, matcher: &ExcludeMatcher) -> Result<Vec<FileJob>> {
    let mut jobs = Vec::new();
    let mut it = walkdir::WalkDir::new(dir).follow_links(false).into_iter();

    while let Some(entry) = it.next() {
        let entry = entry.wrap_err("walk")?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| eyre!("relative path: {e}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel.to_string_lossy().into_owned();

        if matcher.is_match(&rel) {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }
        // file_type() reports the symlink itself since links are not
        // followed, so anything non-file drops out here.
        if !entry.file_type().is_file() {
            continue;
        }
        jobs.push(FileJob {
            rel_path: rel,
            abs_path: entry.into_path(),
        });
    }
    Ok(jobs)
}

/// Hash one file into a [`ManifestEntry`], reusing `buf` across calls.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn hash_file(abs_path: &Path, rel_path: &str, buf: &mut [u8]) -> Result<ManifestEntry> {
    let file = std::fs::File::open(abs_path).wrap_err_with(|| format!("open {rel_path}"))?;
    let meta = file
        .metadata()
        .wrap_err_with(|| format!("stat {rel_path}"))?;
    let hash = ContentHash::from_reader(&file, buf)
        .wrap_err_with(|| format!("read {rel_path}"))?;

    Ok(ManifestEntry {
        path: rel_path.to_string(),
        hash,
        mode: permission_bits(&meta),
        size: meta.len(),
    })
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(_meta: &std::fs::Metadata) -> u32 {
    0o644
}
