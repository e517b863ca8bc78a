//! Disk pair provisioning.
//!
//! The guest boots from two raw images:
//!
//! ```text
//! root_archive (gzip) ──decompress──► root.img   replaceable, re-derived when missing
//!                                     data.img   persistent, created once, never overwritten
//! ```
//!
//! All file work runs on the blocking pool; callers only await the result.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use tracing::{info, warn};

use crate::config::DiskLayout;

/// Whether this launch has to create the data image.
pub fn is_first_launch(layout: &DiskLayout) -> bool {
    !layout.data_image.exists()
}

/// Decompress the packaged artifact into the root image unless it already
/// exists. Returns `true` when the image was derived.
pub async fn ensure_root_image(layout: &DiskLayout) -> Result<bool> {
    if layout.root_image.exists() {
        return Ok(false);
    }
    let archive = layout.root_archive.clone();
    let target = layout.root_image.clone();

    let bytes = tokio::task::spawn_blocking(move || decompress_into_place(&archive, &target))
        .await
        .context("root image decompression task panicked")??;

    info!(path = %layout.root_image.display(), bytes, "root image derived");
    Ok(true)
}

/// Create a sparse data image of `size_mb` megabytes unless one exists.
/// Returns `true` when the image was created.
pub async fn ensure_data_image(path: &Path, size_mb: u64) -> Result<bool> {
    let path = path.to_path_buf();
    let created = tokio::task::spawn_blocking(move || create_sparse_image(&path, size_mb))
        .await
        .context("data image task panicked")??;
    Ok(created)
}

/// Delete both images. Missing files are not an error.
pub async fn remove_disks(layout: &DiskLayout) -> Result<()> {
    for path in [&layout.root_image, &layout.data_image] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!(path = %path.display(), "disk image removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("remove {}", path.display()));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocking helpers
// ---------------------------------------------------------------------------

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

fn partial_path(target: &Path) -> PathBuf {
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".partial-{}-{seq}", std::process::id()));
    target.with_file_name(name)
}

/// Decompress into a sibling temp file, then rename over `target`, so a
/// failed or abandoned run never leaves a truncated image behind.
fn decompress_into_place(archive: &Path, target: &Path) -> Result<u64> {
    if !archive.exists() {
        bail!("packaged root image not found: {}", archive.display());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create disk directory {}", parent.display()))?;
    }

    let partial = partial_path(target);
    let result = (|| -> Result<u64> {
        let input = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
        let mut decoder = GzDecoder::new(BufReader::new(input));
        let output = File::create(&partial)
            .with_context(|| format!("create {}", partial.display()))?;
        let mut writer = BufWriter::new(output);

        let bytes = std::io::copy(&mut decoder, &mut writer)
            .with_context(|| format!("decompress {}", archive.display()))?;
        writer.flush().context("flush root image")?;
        writer
            .get_ref()
            .sync_all()
            .context("sync root image")?;
        Ok(bytes)
    })();

    match result {
        Ok(bytes) => {
            std::fs::rename(&partial, target).with_context(|| {
                format!("rename {} to {}", partial.display(), target.display())
            })?;
            Ok(bytes)
        }
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_file(&partial) {
                warn!(path = %partial.display(), error = %cleanup, "could not remove partial root image");
            }
            Err(e)
        }
    }
}

fn create_sparse_image(path: &Path, size_mb: u64) -> Result<bool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create disk directory {}", parent.display()))?;
    }

    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
    };

    file.set_len(size_mb * 1024 * 1024)
        .with_context(|| format!("size {} to {size_mb} MB", path.display()))?;
    info!(path = %path.display(), size_mb, "data image created");
    Ok(true)
}
