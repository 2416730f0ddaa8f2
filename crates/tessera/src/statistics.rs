//! Map statistics.

use serde::Serialize;

use crate::scheduler::{CacheCounters, CacheSnapshot};

/// Number of LODs tracked by the per-LOD counters. Deeper tiles count
/// towards the last slot.
pub const MAX_LODS: usize = 25;

/// Camera navigation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationMode {
    #[default]
    Azimuthal,
    Free,
    Dynamic,
    Seamless,
}

/// Counters describing the work done by the map.
///
/// Per-frame values are reset at the start of every render tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapStatistics {
    pub nodes_rendered_per_lod: [u32; MAX_LODS],
    pub meta_nodes_traversed_per_lod: [u32; MAX_LODS],
    pub nodes_rendered_total: u32,
    pub meta_nodes_traversed_total: u32,
    pub resources_downloaded: u64,
    pub resources_disk_loaded: u64,
    pub resources_processed: u64,
    pub resources_created: u64,
    pub resources_released: u64,
    pub resources_failed: u64,
    pub render_ticks: u64,
    pub data_ticks: u64,
    #[serde(rename = "currentGpuMemUseKB")]
    pub current_gpu_mem_use_kb: usize,
    #[serde(rename = "currentRamMemUseKB")]
    pub current_ram_mem_use_kb: usize,
    pub resources_active: usize,
    pub resources_downloading: usize,
    pub resources_preparing: usize,
    pub current_node_meta_updates: u32,
    pub current_node_draws_updates: u32,
    pub current_navigation_mode: NavigationMode,
    #[serde(skip)]
    seen: CacheCounters,
}

impl Default for MapStatistics {
    fn default() -> Self {
        Self {
            nodes_rendered_per_lod: [0; MAX_LODS],
            meta_nodes_traversed_per_lod: [0; MAX_LODS],
            nodes_rendered_total: 0,
            meta_nodes_traversed_total: 0,
            resources_downloaded: 0,
            resources_disk_loaded: 0,
            resources_processed: 0,
            resources_created: 0,
            resources_released: 0,
            resources_failed: 0,
            render_ticks: 0,
            data_ticks: 0,
            current_gpu_mem_use_kb: 0,
            current_ram_mem_use_kb: 0,
            resources_active: 0,
            resources_downloading: 0,
            resources_preparing: 0,
            current_node_meta_updates: 0,
            current_node_draws_updates: 0,
            current_navigation_mode: NavigationMode::default(),
            seen: CacheCounters::default(),
        }
    }
}

impl MapStatistics {
    /// Clear the per-frame counters.
    pub fn reset_frame(&mut self) {
        self.current_node_meta_updates = 0;
        self.current_node_draws_updates = 0;
        self.nodes_rendered_total = 0;
        self.meta_nodes_traversed_total = 0;
        self.nodes_rendered_per_lod = [0; MAX_LODS];
        self.meta_nodes_traversed_per_lod = [0; MAX_LODS];
    }

    /// Clear everything, including cumulative counters.
    pub fn reset_all(&mut self) {
        let seen = self.seen;
        *self = Self {
            seen,
            ..Self::default()
        };
    }

    pub fn record_meta_node(&mut self, lod: u32) {
        self.meta_nodes_traversed_per_lod[lod_slot(lod)] += 1;
        self.meta_nodes_traversed_total += 1;
    }

    pub fn record_rendered_node(&mut self, lod: u32) {
        self.nodes_rendered_per_lod[lod_slot(lod)] += 1;
        self.nodes_rendered_total += 1;
    }

    /// Fold in the cache counters accumulated since the last call and copy
    /// its current totals.
    pub fn record_cache(&mut self, snapshot: &CacheSnapshot) {
        let now = snapshot.counters;
        let seen = self.seen;
        self.resources_created += now.created.saturating_sub(seen.created);
        self.resources_downloaded += now.downloaded.saturating_sub(seen.downloaded);
        self.resources_disk_loaded += now.disk_loaded.saturating_sub(seen.disk_loaded);
        self.resources_processed += now.processed.saturating_sub(seen.processed);
        self.resources_released += now.released.saturating_sub(seen.released);
        self.resources_failed += now.failed.saturating_sub(seen.failed);
        self.seen = now;

        self.resources_active = snapshot.active;
        self.resources_downloading = snapshot.downloading;
        self.resources_preparing = snapshot.preparing;
        self.current_gpu_mem_use_kb = snapshot.gpu_memory_bytes / 1024;
        self.current_ram_mem_use_kb = snapshot.ram_memory_bytes / 1024;
    }

    /// Serialize to a flat JSON object.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn lod_slot(lod: u32) -> usize {
    (lod as usize).min(MAX_LODS - 1)
}
