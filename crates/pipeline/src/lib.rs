//! hlsforge
//!
//! Ingestion pipeline that turns an uploaded video into a published,
//! adaptive-bitrate HLS asset: probe, ladder planning, parallel rendition
//! encodes, master playlist, thumbnail and an atomic publish. Also scans the
//! published tree for assets the catalog does not know about.

pub mod catalog;
pub mod concurrency;
pub mod encode;
pub mod exec;
pub mod ladder;
pub mod orchestrator;
pub mod playlist;
pub mod probe;
pub mod progress;
pub mod publish;
pub mod scanner;
pub mod service;
pub mod startup;
pub mod thumbnail;

#[cfg(test)]
mod testing;

pub use catalog::{import_orphans, Catalog, CatalogError, ImportReport, JsonCatalog, Registration, Visibility};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use encode::{build_encode_invocation, EncodeError, EncodeSettings, EncodeWorker, RenditionOutput, RenditionState};
pub use exec::{CommandRunner, ExecError, Invocation, ProcessOutput, SystemRunner};
pub use hlsforge_config as config;
pub use hlsforge_config::Config;
pub use ladder::{RenditionPlanner, RenditionSpec};
pub use orchestrator::{JobError, JobState, PublishedAsset, TranscodeJob, TranscodeOrchestrator};
pub use playlist::{MasterPlaylist, MediaPlaylist, PlaylistError, SegmentPolicy};
pub use probe::{ProbeError, ProbeService, SourceAsset};
pub use progress::{new_shared_progress, JobProgress, ProgressSnapshot, SharedProgress};
pub use publish::{AssetPaths, PublishError};
pub use scanner::{CatalogScanner, OrphanCandidate};
pub use service::{IngestRequest, IngestService, ServiceError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, StartupReport};
pub use thumbnail::{ThumbnailError, ThumbnailGenerator};
