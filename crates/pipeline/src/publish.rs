//! Publisher module for moving finished assets into the served tree.
//!
//! A job builds its asset under `<output_root>/.staging/<short_id>` and makes
//! it visible with a single directory rename to `<output_root>/<short_id>`.
//! Readers therefore see either no asset or a complete one.

use crate::playlist::MASTER_PLAYLIST;
use crate::thumbnail::THUMBNAIL_FILE;
use rand::distributions::Uniform;
use rand::Rng;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Hidden directory under the output root holding in-progress assets.
pub const STAGING_DIR: &str = ".staging";
/// Length of a public asset identifier.
pub const SHORT_ID_LEN: usize = 8;

const SHORT_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The published path is already taken.
    #[error("asset directory {0} already exists")]
    AlreadyExists(PathBuf),

    /// Failed to create the output root.
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The final rename failed; staging is left in place.
    #[error("failed to move {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Random 8-character `[a-z0-9]` identifier.
pub fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    let pick = Uniform::from(0..SHORT_ID_ALPHABET.len());
    (0..SHORT_ID_LEN)
        .map(|_| SHORT_ID_ALPHABET[rng.sample(pick)] as char)
        .collect()
}

/// Whether `id` has the shape of a short id. Guards path joins on user input.
pub fn is_valid_short_id(id: &str) -> bool {
    id.len() == SHORT_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

pub fn staging_dir(output_root: &Path, short_id: &str) -> PathBuf {
    output_root.join(STAGING_DIR).join(short_id)
}

pub fn published_dir(output_root: &Path, short_id: &str) -> PathBuf {
    output_root.join(short_id)
}

/// Generates short ids until one is free in both the staging and the
/// published namespace.
pub fn allocate_short_id(output_root: &Path) -> String {
    loop {
        let id = generate_short_id();
        if !published_dir(output_root, &id).exists() && !staging_dir(output_root, &id).exists() {
            return id;
        }
    }
}

/// Claims a staging directory, starting from `preferred`.
///
/// The directory is created exclusively; on collision with another job or a
/// published asset a fresh id is drawn. Returns the id actually claimed.
pub fn claim_staging(output_root: &Path, preferred: &str) -> Result<(String, PathBuf), PublishError> {
    let parent = output_root.join(STAGING_DIR);
    fs::create_dir_all(&parent).map_err(|source| PublishError::Prepare {
        path: parent.clone(),
        source,
    })?;

    let mut id = preferred.to_string();
    loop {
        let dir = staging_dir(output_root, &id);
        if !published_dir(output_root, &id).exists() {
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(PublishError::Prepare { path: dir, source }),
            }
        }
        id = generate_short_id();
    }
}

/// Moves `staging` to `target` with one rename.
///
/// Refuses to overwrite an existing target. On Unix the target name is
/// first reserved with an exclusive `mkdir` and the rename then replaces
/// that empty directory, so two publishers can never both succeed. Readers
/// may briefly see the empty reservation, which has no master playlist.
/// On failure the staging directory is untouched.
pub fn publish(staging: &Path, target: &Path) -> Result<(), PublishError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| PublishError::Prepare {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    reserve_target(target)?;
    fs::rename(staging, target).map_err(|source| {
        release_target(target);
        PublishError::Rename {
            from: staging.to_path_buf(),
            to: target.to_path_buf(),
            source,
        }
    })
}

#[cfg(unix)]
fn reserve_target(target: &Path) -> Result<(), PublishError> {
    match fs::create_dir(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(PublishError::AlreadyExists(target.to_path_buf()))
        }
        Err(source) => Err(PublishError::Prepare {
            path: target.to_path_buf(),
            source,
        }),
    }
}

#[cfg(not(unix))]
fn reserve_target(target: &Path) -> Result<(), PublishError> {
    if target.exists() {
        return Err(PublishError::AlreadyExists(target.to_path_buf()));
    }
    Ok(())
}

/// Removes our empty reservation after a failed rename.
fn release_target(target: &Path) {
    if cfg!(unix) {
        let _ = fs::remove_dir(target);
    }
}

/// Removes a staging directory. Missing directories are not an error.
pub fn discard_staging(staging: &Path) -> io::Result<()> {
    match fs::remove_dir_all(staging) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Paths a downstream player needs for one published asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetPaths {
    pub id: String,
    pub dir: PathBuf,
    pub master_playlist: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

impl AssetPaths {
    /// Resolves a published asset; `None` for malformed ids, missing
    /// directories and assets without a master playlist.
    pub fn locate(output_root: &Path, id: &str) -> Option<Self> {
        if !is_valid_short_id(id) {
            return None;
        }
        let dir = published_dir(output_root, id);
        let master_playlist = dir.join(MASTER_PLAYLIST);
        if !master_playlist.is_file() {
            return None;
        }
        let thumbnail = Some(dir.join(THUMBNAIL_FILE)).filter(|p| p.is_file());
        Some(Self {
            id: id.to_string(),
            dir,
            master_playlist,
            thumbnail,
        })
    }
}
