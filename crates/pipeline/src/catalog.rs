//! Catalog collaborator interface.
//!
//! The pipeline only needs two things from the video catalog: the set of
//! asset ids it already knows, and a way to register new ones. [`JsonCatalog`]
//! is a small file-backed implementation used by the CLI and tests.

use crate::orchestrator::PublishedAsset;
use crate::scanner::OrphanCandidate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog IO error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog file is corrupt: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("asset {0} is already registered")]
    Duplicate(String),

    #[error("catalog lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// A catalog entry for one published asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub title: String,
    pub owner: String,
    pub visibility: Visibility,
    /// Rendition labels, ascending by height
    pub renditions: Vec<String>,
    pub thumbnail_present: bool,
    pub duration_secs: Option<f64>,
    pub registered_unix_ms: i64,
}

impl Registration {
    pub fn from_published(
        asset: &PublishedAsset,
        title: &str,
        owner: &str,
        visibility: Visibility,
    ) -> Self {
        Self {
            id: asset.short_id.clone(),
            title: title.to_string(),
            owner: owner.to_string(),
            visibility,
            renditions: asset.renditions.iter().map(|r| r.spec.label.clone()).collect(),
            thumbnail_present: asset.thumbnail.is_some(),
            duration_secs: asset.duration_secs,
            registered_unix_ms: now_unix_ms(),
        }
    }

    /// Imported orphans are private and titled by their id.
    pub fn from_orphan(candidate: &OrphanCandidate, owner: &str) -> Self {
        Self {
            id: candidate.id.clone(),
            title: candidate.id.clone(),
            owner: owner.to_string(),
            visibility: Visibility::Private,
            renditions: candidate
                .available_renditions
                .iter()
                .map(|r| r.label.clone())
                .collect(),
            thumbnail_present: candidate.has_thumbnail,
            duration_secs: candidate
                .available_renditions
                .last()
                .map(|r| r.total_duration),
            registered_unix_ms: now_unix_ms(),
        }
    }
}

pub trait Catalog: Send + Sync {
    fn known_ids(&self) -> Result<HashSet<String>, CatalogError>;

    fn register(&self, registration: Registration) -> Result<(), CatalogError>;
}

/// Catalog persisted as a pretty-printed JSON array.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    entries: Mutex<Vec<Registration>>,
}

impl JsonCatalog {
    /// Opens `path`, starting empty when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<Registration>, CatalogError> {
        Ok(self.entries.lock().map_err(|_| CatalogError::Poisoned)?.clone())
    }

    fn save(&self, entries: &[Registration]) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Catalog for JsonCatalog {
    fn known_ids(&self) -> Result<HashSet<String>, CatalogError> {
        let entries = self.entries.lock().map_err(|_| CatalogError::Poisoned)?;
        Ok(entries.iter().map(|e| e.id.clone()).collect())
    }

    fn register(&self, registration: Registration) -> Result<(), CatalogError> {
        let mut entries = self.entries.lock().map_err(|_| CatalogError::Poisoned)?;
        if entries.iter().any(|e| e.id == registration.id) {
            return Err(CatalogError::Duplicate(registration.id));
        }
        entries.push(registration);
        if let Err(e) = self.save(&entries) {
            entries.pop();
            return Err(e);
        }
        Ok(())
    }
}

/// Outcome of an orphan import run.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// Id and reason for each candidate left alone
    pub skipped: Vec<(String, String)>,
}

/// Registers every importable orphan with `catalog`.
///
/// Candidates without a master playlist or without a valid rendition are
/// skipped. Registration errors other than duplicates abort the run.
pub fn import_orphans<I>(
    candidates: I,
    catalog: &dyn Catalog,
    owner: &str,
) -> Result<ImportReport, CatalogError>
where
    I: IntoIterator<Item = OrphanCandidate>,
{
    let mut report = ImportReport::default();

    for candidate in candidates {
        if !candidate.has_master {
            report
                .skipped
                .push((candidate.id, "missing master playlist".to_string()));
            continue;
        }
        if candidate.available_renditions.is_empty() {
            report
                .skipped
                .push((candidate.id, "no valid rendition".to_string()));
            continue;
        }

        match catalog.register(Registration::from_orphan(&candidate, owner)) {
            Ok(()) => {
                info!(asset = %candidate.id, renditions = candidate.available_renditions.len(), "imported orphan");
                report.imported.push(candidate.id);
            }
            Err(CatalogError::Duplicate(id)) => {
                warn!(asset = %id, "orphan already registered");
                report.skipped.push((id, "already registered".to_string()));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::AvailableRendition;
    use tempfile::TempDir;

    fn candidate(id: &str, has_master: bool, renditions: &[&str]) -> OrphanCandidate {
        OrphanCandidate {
            id: id.to_string(),
            dir: PathBuf::from("/srv/videos").join(id),
            has_master,
            available_renditions: renditions
                .iter()
                .map(|label| AvailableRendition {
                    label: label.to_string(),
                    height: label.trim_end_matches('p').parse().unwrap(),
                    segment_count: 3,
                    total_duration: 14.0,
                })
                .collect(),
            rejected_renditions: Vec::new(),
            has_thumbnail: true,
        }
    }

    #[test]
    fn test_visibility_parsing() {
        assert_eq!("PUBLIC".parse::<Visibility>(), Ok(Visibility::Public));
        assert_eq!("private".parse::<Visibility>(), Ok(Visibility::Private));
        assert!("unlisted".parse::<Visibility>().is_err());
        assert_eq!(Visibility::default(), Visibility::Private);
    }

    #[test]
    fn test_json_catalog_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.json");

        let catalog = JsonCatalog::open(&path).unwrap();
        assert!(catalog.known_ids().unwrap().is_empty());
        catalog
            .register(Registration::from_orphan(&candidate("abcd1234", true, &["240p"]), "admin"))
            .unwrap();

        let reopened = JsonCatalog::open(&path).unwrap();
        assert!(reopened.known_ids().unwrap().contains("abcd1234"));
        let entries = reopened.entries().unwrap();
        assert_eq!(entries[0].visibility, Visibility::Private);
        assert_eq!(entries[0].title, "abcd1234");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let catalog = JsonCatalog::open(tmp.path().join("catalog.json")).unwrap();
        let reg = Registration::from_orphan(&candidate("abcd1234", true, &["240p"]), "admin");

        catalog.register(reg.clone()).unwrap();
        assert!(matches!(catalog.register(reg), Err(CatalogError::Duplicate(_))));
        assert_eq!(catalog.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_catalog_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonCatalog::open(&path), Err(CatalogError::Parse(_))));
    }

    #[test]
    fn test_import_registers_only_playable_orphans() {
        let tmp = TempDir::new().unwrap();
        let catalog = JsonCatalog::open(tmp.path().join("catalog.json")).unwrap();
        catalog
            .register(Registration::from_orphan(&candidate("dup00000", true, &["240p"]), "admin"))
            .unwrap();

        let report = import_orphans(
            vec![
                candidate("good0001", true, &["240p", "720p"]),
                candidate("nomaster", false, &["240p"]),
                candidate("empty000", true, &[]),
                candidate("dup00000", true, &["240p"]),
            ],
            &catalog,
            "admin",
        )
        .unwrap();

        assert_eq!(report.imported, vec!["good0001".to_string()]);
        assert_eq!(report.skipped.len(), 3);

        let entries = catalog.entries().unwrap();
        let imported = entries.iter().find(|e| e.id == "good0001").unwrap();
        assert_eq!(imported.renditions, vec!["240p", "720p"]);
        assert_eq!(imported.owner, "admin");
        assert_eq!(imported.visibility, Visibility::Private);
    }
}
