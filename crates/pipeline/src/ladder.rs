//! Rendition ladder planning.
//!
//! Picks which quality tiers to encode for a source. Tiers above the source
//! height are never planned; a source smaller than every tier still gets a
//! single rendition at its own height.

use crate::config::{is_valid_label, LadderTier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One planned output tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenditionSpec {
    pub height: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
    pub label: String,
}

impl RenditionSpec {
    /// Advertised bandwidth in bits per second (video + audio).
    pub fn bandwidth(&self) -> u64 {
        (self.video_kbps as u64 + self.audio_kbps as u64) * 1000
    }
}

impl From<&LadderTier> for RenditionSpec {
    fn from(tier: &LadderTier) -> Self {
        Self {
            height: tier.height,
            video_kbps: tier.video_kbps,
            audio_kbps: tier.audio_kbps,
            label: tier.label(),
        }
    }
}

/// Computes rendition ladders from a fixed candidate table.
#[derive(Debug, Clone)]
pub struct RenditionPlanner {
    /// Candidate tiers sorted ascending by height, one per height and
    /// one per label.
    tiers: Vec<LadderTier>,
}

impl RenditionPlanner {
    /// Keeps the lowest tier for each height and for each label; tiers with
    /// a zero height or an unusable label are dropped.
    pub fn new(mut tiers: Vec<LadderTier>) -> Self {
        tiers.retain(|t| t.height > 0 && is_valid_label(&t.label()));
        tiers.sort_by_key(|t| t.height);
        tiers.dedup_by_key(|t| t.height);
        let mut labels = HashSet::new();
        tiers.retain(|t| labels.insert(t.label().to_ascii_lowercase()));
        Self { tiers }
    }

    pub fn tiers(&self) -> &[LadderTier] {
        &self.tiers
    }

    /// Plans every tier not taller than the source.
    ///
    /// `source_bitrate` is in bits per second and only shapes the fallback
    /// tier. The result is never empty and strictly ascending by height.
    pub fn plan(&self, source_height: u32, source_bitrate: Option<u64>) -> Vec<RenditionSpec> {
        let specs: Vec<RenditionSpec> = self
            .tiers
            .iter()
            .filter(|t| t.height <= source_height)
            .map(RenditionSpec::from)
            .collect();

        if specs.is_empty() {
            vec![self.fallback(source_height, source_bitrate)]
        } else {
            specs
        }
    }

    /// Like [`plan`](Self::plan), restricted to the requested labels.
    ///
    /// Unknown labels are ignored. When nothing requested fits the source the
    /// fallback tier is used, so an upload never ends up with zero renditions.
    pub fn plan_selected(
        &self,
        source_height: u32,
        source_bitrate: Option<u64>,
        labels: &[String],
    ) -> Vec<RenditionSpec> {
        if labels.is_empty() {
            return self.plan(source_height, source_bitrate);
        }
        let selected: Vec<RenditionSpec> = self
            .plan(source_height, source_bitrate)
            .into_iter()
            .filter(|spec| labels.iter().any(|l| l.eq_ignore_ascii_case(&spec.label)))
            .collect();

        if selected.is_empty() {
            vec![self.fallback_for_selection(source_height, source_bitrate)]
        } else {
            selected
        }
    }

    /// Highest tier that fits, or the source-height tier.
    fn fallback_for_selection(&self, source_height: u32, source_bitrate: Option<u64>) -> RenditionSpec {
        self.plan(source_height, source_bitrate)
            .pop()
            .unwrap_or_else(|| self.fallback(source_height, source_bitrate))
    }

    /// Single tier at the source's own height, using the smallest tier's
    /// bitrates capped by the source bitrate.
    fn fallback(&self, source_height: u32, source_bitrate: Option<u64>) -> RenditionSpec {
        // Even when possible, never above the source
        let height = (source_height - source_height % 2).max(2).min(source_height.max(1));
        let (mut video_kbps, audio_kbps) = self
            .tiers
            .first()
            .map(|t| (t.video_kbps, t.audio_kbps))
            .unwrap_or((400, 64));

        if let Some(bps) = source_bitrate {
            let source_kbps = (bps / 1000).max(1) as u32;
            video_kbps = video_kbps.min(source_kbps);
        }

        RenditionSpec {
            height,
            video_kbps,
            audio_kbps,
            label: format!("{}p", height),
        }
    }
}
