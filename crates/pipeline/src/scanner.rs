//! Catalog scanner for discovering orphaned assets in the published tree.
//!
//! Walks the immediate children of the output root and reports asset
//! directories the catalog does not know about, together with which of their
//! renditions pass playlist validation. The scanner never writes.

use crate::playlist::{
    validate_rendition_dir, MasterPlaylist, SegmentPolicy, ValidatedRendition, MASTER_PLAYLIST,
    MEDIA_PLAYLIST,
};
use crate::thumbnail::THUMBNAIL_FILE;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A rendition directory that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableRendition {
    pub label: String,
    pub height: u32,
    pub segment_count: usize,
    pub total_duration: f64,
}

/// A rendition directory that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRendition {
    pub label: String,
    pub reason: String,
}

/// An asset directory unknown to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanCandidate {
    pub id: String,
    pub dir: PathBuf,
    pub has_master: bool,
    /// Ascending by height.
    pub available_renditions: Vec<AvailableRendition>,
    pub rejected_renditions: Vec<RejectedRendition>,
    pub has_thumbnail: bool,
}

impl OrphanCandidate {
    /// Playable: a master playlist and at least one valid rendition.
    pub fn is_importable(&self) -> bool {
        self.has_master && !self.available_renditions.is_empty()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Height for a rendition label such as `720p`.
fn label_height(label: &str) -> Option<u32> {
    label.strip_suffix('p').and_then(|h| h.parse().ok())
}

/// Inspects one asset directory.
///
/// Renditions are the subdirectories holding a media playlist. Heights come
/// from the master playlist when it lists the rendition, else from the label.
pub fn inspect_asset_dir(id: &str, dir: &Path, policy: &SegmentPolicy) -> OrphanCandidate {
    let master = fs::read_to_string(dir.join(MASTER_PLAYLIST))
        .ok()
        .and_then(|contents| MasterPlaylist::parse(&contents).ok());

    let mut available = Vec::new();
    let mut rejected = Vec::new();

    let rendition_dirs = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.path().join(MEDIA_PLAYLIST).is_file());

    for entry in rendition_dirs {
        let label = entry.file_name().to_string_lossy().into_owned();
        let height = master
            .as_ref()
            .and_then(|m| {
                let prefix = format!("{}/", label);
                m.variants.iter().find(|v| v.uri.starts_with(&prefix))
            })
            .map(|v| v.height)
            .or_else(|| label_height(&label))
            .unwrap_or(0);

        match validate_rendition_dir(entry.path(), policy) {
            Ok(ValidatedRendition {
                segment_count,
                total_duration,
            }) => available.push(AvailableRendition {
                label,
                height,
                segment_count,
                total_duration,
            }),
            Err(err) => rejected.push(RejectedRendition {
                label,
                reason: err.to_string(),
            }),
        }
    }

    available.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.label.cmp(&b.label)));

    OrphanCandidate {
        id: id.to_string(),
        dir: dir.to_path_buf(),
        has_master: master.is_some(),
        available_renditions: available,
        rejected_renditions: rejected,
        has_thumbnail: dir.join(THUMBNAIL_FILE).is_file(),
    }
}

/// Read-only scanner over a published asset tree.
#[derive(Debug, Clone)]
pub struct CatalogScanner {
    root: PathBuf,
    policy: SegmentPolicy,
}

impl CatalogScanner {
    pub fn new(root: impl Into<PathBuf>, policy: SegmentPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily yields orphan candidates in name order.
    ///
    /// This function:
    /// - Lists immediate subdirectories of the root only
    /// - Skips hidden directories, which excludes in-progress staging
    /// - Skips ids present in `known_ids`
    /// - Validates each candidate's renditions as it is yielded
    ///
    /// Each call re-walks the tree; a missing root yields nothing.
    pub fn scan<'a>(
        &'a self,
        known_ids: &'a HashSet<String>,
    ) -> impl Iterator<Item = OrphanCandidate> + 'a {
        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| {
                let id = e.file_name().to_str()?.to_string();
                Some((id, e.into_path()))
            })
            .filter(move |(id, _)| !known_ids.contains(id))
            .map(move |(id, dir)| inspect_asset_dir(&id, &dir, &self.policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::VariantStream;
    use crate::testing::write_rendition;
    use tempfile::TempDir;

    fn policy() -> SegmentPolicy {
        SegmentPolicy::new(6, 1.0)
    }

    fn write_asset(root: &Path, id: &str, labels: &[(&str, u32)]) -> PathBuf {
        let dir = root.join(id);
        for (label, _) in labels {
            write_rendition(&dir.join(label), &[6.0, 6.0, 2.5]);
        }
        let master = MasterPlaylist::new(
            labels
                .iter()
                .map(|(label, height)| VariantStream {
                    bandwidth: 500_000,
                    width: height * 16 / 9,
                    height: *height,
                    uri: format!("{}/playlist.m3u8", label),
                })
                .collect(),
        );
        master.write_to_dir(&dir).unwrap();
        fs::write(dir.join(THUMBNAIL_FILE), b"jpg").unwrap();
        dir
    }

    #[test]
    fn test_reports_unknown_assets_only() {
        let tmp = TempDir::new().unwrap();
        write_asset(tmp.path(), "aaaa1111", &[("240p", 240)]);
        write_asset(tmp.path(), "bbbb2222", &[("240p", 240), ("720p", 720)]);

        let known: HashSet<String> = ["aaaa1111".to_string()].into_iter().collect();
        let scanner = CatalogScanner::new(tmp.path(), policy());
        let found: Vec<OrphanCandidate> = scanner.scan(&known).collect();

        assert_eq!(found.len(), 1);
        let orphan = &found[0];
        assert_eq!(orphan.id, "bbbb2222");
        assert!(orphan.has_master);
        assert!(orphan.has_thumbnail);
        assert!(orphan.is_importable());
        assert_eq!(
            orphan
                .available_renditions
                .iter()
                .map(|r| r.height)
                .collect::<Vec<_>>(),
            vec![240, 720]
        );
    }

    #[test]
    fn test_hidden_and_staging_dirs_are_skipped() {
        let tmp = TempDir::new().unwrap();
        write_asset(&tmp.path().join(".staging"), "cccc3333", &[("240p", 240)]);
        write_asset(tmp.path(), ".trash", &[("240p", 240)]);
        fs::write(tmp.path().join("stray.txt"), b"not an asset").unwrap();

        let scanner = CatalogScanner::new(tmp.path(), policy());
        assert_eq!(scanner.scan(&HashSet::new()).count(), 0);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_asset(tmp.path(), "zz000001", &[("360p", 360)]);
        write_asset(tmp.path(), "aa000002", &[("240p", 240), ("480p", 480)]);
        write_asset(tmp.path(), "mm000003", &[("720p", 720)]);

        let scanner = CatalogScanner::new(tmp.path(), policy());
        let known = HashSet::new();
        let first: Vec<OrphanCandidate> = scanner.scan(&known).collect();
        let second: Vec<OrphanCandidate> = scanner.scan(&known).collect();

        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["aa000002", "mm000003", "zz000001"]
        );
    }

    #[test]
    fn test_segment_count_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = write_asset(tmp.path(), "dddd4444", &[("240p", 240), ("480p", 480)]);
        fs::write(dir.join("480p").join("segment_0009.ts"), b"stray").unwrap();

        let scanner = CatalogScanner::new(tmp.path(), policy());
        let orphan = scanner.scan(&HashSet::new()).next().unwrap();

        assert_eq!(orphan.available_renditions.len(), 1);
        assert_eq!(orphan.available_renditions[0].label, "240p");
        assert_eq!(orphan.rejected_renditions.len(), 1);
        assert_eq!(orphan.rejected_renditions[0].label, "480p");
    }

    #[test]
    fn test_duration_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = write_asset(tmp.path(), "eeee5555", &[("360p", 360)]);
        write_rendition(&dir.join("360p"), &[6.0, 1.5, 6.0, 2.0]);

        let scanner = CatalogScanner::new(tmp.path(), policy());
        let orphan = scanner.scan(&HashSet::new()).next().unwrap();

        assert!(orphan.available_renditions.is_empty());
        assert!(!orphan.is_importable());
        assert!(orphan.rejected_renditions[0].reason.contains("segment 1"));
    }

    #[test]
    fn test_missing_master_uses_label_heights() {
        let tmp = TempDir::new().unwrap();
        let dir = write_asset(tmp.path(), "ffff6666", &[("1080p", 1080), ("240p", 240)]);
        fs::remove_file(dir.join(MASTER_PLAYLIST)).unwrap();

        let orphan = inspect_asset_dir("ffff6666", &dir, &policy());
        assert!(!orphan.has_master);
        assert!(!orphan.is_importable());
        assert_eq!(
            orphan
                .available_renditions
                .iter()
                .map(|r| r.height)
                .collect::<Vec<_>>(),
            vec![240, 1080]
        );
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let scanner = CatalogScanner::new(tmp.path().join("absent"), policy());
        assert_eq!(scanner.scan(&HashSet::new()).count(), 0);
    }
}
