//! Map options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::CacheLimits;
use crate::search::DEFAULT_SEARCH_URL;

/// Options fixed when the map is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCreateOptions {
    /// Identifies the embedding application in request user agents.
    pub client_id: String,
    /// Skip the in-memory byte cache.
    pub disable_cache: bool,
    /// Byte cache capacity.
    pub cache_capacity: usize,
}

impl Default for MapCreateOptions {
    fn default() -> Self {
        Self {
            client_id: "tessera".to_string(),
            disable_cache: false,
            cache_capacity: 256 * 1024 * 1024,
        }
    }
}

/// Options that may change while the map runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapOptions {
    /// Geocoder URL template with a `{query}` token.
    pub search_url: String,
    /// Post-process search results.
    pub search_results_filter: bool,
    pub max_concurrent_downloads: usize,
    pub max_resource_processes_per_tick: usize,
    pub max_gpu_uploads_per_tick: usize,
    /// Milliseconds of work a tick may do before deferring the rest.
    pub tick_time_budget: u64,
    pub resource_retention_ticks: u64,
    #[serde(rename = "targetGpuMemoryKB")]
    pub target_gpu_memory_kb: usize,
    #[serde(rename = "targetRamMemoryKB")]
    pub target_ram_memory_kb: usize,
    pub debug_flat_shading: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        let limits = CacheLimits::default();
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            search_results_filter: true,
            max_concurrent_downloads: limits.max_concurrent_downloads,
            max_resource_processes_per_tick: limits.max_resource_processes_per_tick,
            max_gpu_uploads_per_tick: limits.max_gpu_uploads_per_tick,
            tick_time_budget: 10,
            resource_retention_ticks: limits.resource_retention_ticks,
            target_gpu_memory_kb: limits.target_gpu_memory_kb,
            target_ram_memory_kb: limits.target_ram_memory_kb,
            debug_flat_shading: false,
        }
    }
}

impl MapOptions {
    /// Scheduler limits derived from these options.
    #[must_use]
    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_concurrent_downloads: self.max_concurrent_downloads,
            max_resource_processes_per_tick: self.max_resource_processes_per_tick,
            max_gpu_uploads_per_tick: self.max_gpu_uploads_per_tick,
            tick_time_budget: Duration::from_millis(self.tick_time_budget),
            resource_retention_ticks: self.resource_retention_ticks,
            target_gpu_memory_kb: self.target_gpu_memory_kb,
            target_ram_memory_kb: self.target_ram_memory_kb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cache_limits() {
        assert_eq!(MapOptions::default().cache_limits(), CacheLimits::default());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options: MapOptions =
            serde_json::from_str(r#"{ "maxConcurrentDownloads": 2, "debugFlatShading": true }"#)
                .unwrap();
        assert_eq!(options.max_concurrent_downloads, 2);
        assert!(options.debug_flat_shading);
        assert!(options.search_results_filter);
        assert_eq!(options.search_url, DEFAULT_SEARCH_URL);
        assert_eq!(options.cache_limits().tick_time_budget, Duration::from_millis(10));
    }
}
