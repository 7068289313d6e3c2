//! Tar packing and safe extraction of change sets.
//!
//! Output is deterministic for a given tree: zeroed mtimes, directory
//! headers in first-use order, file entries in caller order. Extraction
//! refuses anything that would land outside the destination root.

use std::io::{Read, Write};
use std::path::Path;

use color_eyre::eyre::{bail, Result, WrapErr};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::paths;

/// Stream a tar of `file_paths` (relative to `dir`) into `w`, optionally
/// gzipped. Returns the number of file entries written.
///
/// # Errors
/// Fatal on any invalid or root-escaping path, unreadable file, or
/// writer failure.
pub fn pack_tar(
    dir: &Path,
    file_paths: &[String],
    w: impl Write,
    compress: bool,
) -> Result<usize> {
    if compress {
        let gz = GzEncoder::new(w, Compression::default());
        let mut tw = tar::Builder::new(gz);
        let count = append_entries(&mut tw, dir, file_paths)?;
        let gz = tw.into_inner().wrap_err("finish tar")?;
        let _ = gz.finish().wrap_err("finish gzip")?;
        Ok(count)
    } else {
        let mut tw = tar::Builder::new(w);
        let count = append_entries(&mut tw, dir, file_paths)?;
        let _ = tw.into_inner().wrap_err("finish tar")?;
        Ok(count)
    }
}

fn append_entries<W: Write>(
    tw: &mut tar::Builder<W>,
    dir: &Path,
    file_paths: &[String],
) -> Result<usize> {
    for d in collect_dirs(file_paths) {
        let mut hdr = tar::Header::new_ustar();
        hdr.set_entry_type(tar::EntryType::Directory);
        hdr.set_mode(0o755);
        hdr.set_mtime(0);
        hdr.set_size(0);
        tw.append_data(&mut hdr, format!("{d}/"), std::io::empty())
            .wrap_err_with(|| format!("write dir header {d}"))?;
    }

    let mut count = 0;
    for rel in file_paths {
        paths::validate_rel_path(rel).wrap_err_with(|| format!("invalid path {rel}"))?;
        let abs = dir.join(rel);
        if !paths::is_within_dir(dir, &abs) {
            bail!("path escapes dir: {rel}");
        }
        append_file(tw, &abs, rel)?;
        count += 1;
    }
    Ok(count)
}

fn append_file<W: Write>(tw: &mut tar::Builder<W>, abs: &Path, rel: &str) -> Result<()> {
    let mut file = std::fs::File::open(abs).wrap_err_with(|| format!("open {rel}"))?;
    let meta = file.metadata().wrap_err_with(|| format!("stat {rel}"))?;

    let mut hdr = tar::Header::new_ustar();
    hdr.set_entry_type(tar::EntryType::Regular);
    hdr.set_mode(permission_bits(&meta));
    hdr.set_size(meta.len());
    hdr.set_mtime(0);
    tw.append_data(&mut hdr, rel, &mut file)
        .wrap_err_with(|| format!("write {rel}"))?;
    Ok(())
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

/// Every ancestor directory of any listed file, parent chains in
/// first-use order, each directory once.
fn collect_dirs(file_paths: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for p in file_paths {
        let Some((dir, _file)) = p.rsplit_once('/') else {
            continue;
        };
        let mut prefix = String::new();
        for part in dir.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if seen.insert(prefix.clone()) {
                result.push(prefix.clone());
            }
        }
    }
    result
}

/// Extract a tar (optionally gzipped) from `r` into `dir`, creating it
/// first. Returns the number of regular files written.
///
/// Directory headers become 0755 directories regardless of archive mode;
/// regular files land with permission bits = header mode & 0o777,
/// truncating anything already at that path. Other typeflags are
/// ignored. Not atomic: a mid-stream failure leaves partial files.
///
/// # Errors
/// Fatal on absolute names, `..` segments, names escaping `dir`, or I/O
/// failure.
pub fn unpack_tar(r: impl Read, dir: &Path, compress: bool) -> Result<usize> {
    std::fs::create_dir_all(dir).wrap_err("create dir")?;

    if compress {
        extract_entries(tar::Archive::new(GzDecoder::new(r)), dir)
    } else {
        extract_entries(tar::Archive::new(r), dir)
    }
}

fn extract_entries<R: Read>(mut archive: tar::Archive<R>, dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in archive.entries().wrap_err("read tar")? {
        let mut entry = entry.wrap_err("read tar")?;
        let name = entry.path_bytes();
        let name = String::from_utf8_lossy(&name).into_owned();
        let cleaned = paths::clean_rel_path(&name);
        validate_tar_path(&cleaned)?;

        let target = dir.join(&cleaned);
        if !paths::is_within_dir(dir, &target) {
            bail!("path escapes dir: {name}");
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .wrap_err_with(|| format!("mkdir {name}"))?;
            }
            tar::EntryType::Regular => {
                let mode = entry.header().mode().wrap_err_with(|| format!("mode {name}"))? & 0o777;
                write_file(&mut entry, &target, mode).wrap_err_with(|| format!("write {name}"))?;
                count += 1;
            }
            _ => {}
        }
    }
    Ok(count)
}

fn write_file(entry: &mut impl Read, target: &Path, mode: u32) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut opts = std::fs::OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = opts.open(target)?;
    std::io::copy(entry, &mut file)?;
    Ok(())
}

fn validate_tar_path(cleaned: &str) -> Result<()> {
    if cleaned.is_empty() || cleaned == "." {
        return Ok(());
    }
    if cleaned.starts_with('/') {
        bail!("absolute path in tar: {cleaned}");
    }
    if cleaned == ".." || cleaned.starts_with("../") || cleaned.split('/').any(|p| p == "..") {
        bail!("path traversal in tar: {cleaned}");
    }
    Ok(())
}
