use std::{
    fs::{self, File},
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Prefix of in-progress directories under the store root.
pub(crate) const STAGING_PREFIX: &str = ".partial-";

/// SHA-256 of a file's bytes, hex encoded.
pub fn hash_of_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Key for an already materialized environment: SHA-256 of its canonical path.
pub fn hash_of_path_identity(path: &Path) -> Result<String> {
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("environment directory {} is missing", path.display()))?;
    if !canonical.is_dir() {
        return Err(anyhow!(
            "environment path {} is not a directory",
            canonical.display()
        ));
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Unpacks a `.tar` or `.tar.gz` archive into `root`.
///
/// The archive is extracted into a sibling staging directory which is
/// renamed into place only once unpacking succeeds; on failure the staging
/// directory is discarded and `root` is left untouched.
pub(crate) fn materialize_archive(archive: &Path, root: &Path) -> Result<()> {
    let parent = root
        .parent()
        .ok_or_else(|| anyhow!("environment root {} has no parent", root.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent)
        .with_context(|| format!("failed to create staging dir in {}", parent.display()))?;

    let mut file =
        File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    let mut magic = [0u8; 2];
    let compressed = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    file.seek(SeekFrom::Start(0))?;
    let reader = BufReader::new(file);
    let unpacked = if compressed {
        Archive::new(GzDecoder::new(reader)).unpack(staging.path())
    } else {
        Archive::new(reader).unpack(staging.path())
    };
    unpacked.with_context(|| format!("failed to unpack {}", archive.display()))?;

    let staged = staging.keep();
    if let Err(err) = fs::rename(&staged, root) {
        // Clean the staging directory on failure for predictable retries.
        let _ = fs::remove_dir_all(&staged);
        return Err(err)
            .with_context(|| format!("moving environment into place at {}", root.display()));
    }
    debug!(archive = %archive.display(), root = %root.display(), "environment materialized");
    Ok(())
}
