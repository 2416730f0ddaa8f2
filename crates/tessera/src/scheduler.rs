//! The resource cache and its two tick phases.
//!
//! [`ResourceCache`] owns every live [`Resource`] keyed by name. Query paths
//! create and touch resources concurrently; the ticks advance them:
//!
//! - [`ResourceCache::data_tick`] drains finished fetches, decodes within
//!   the per-tick budget and dispatches new fetches in priority order.
//! - [`ResourceCache::render_tick`] uploads decoded payloads through a
//!   [`GpuBackend`] and evicts resources nobody references any more.
//!
//! Neither tick blocks. Fetch futures run on a [`TaskSpawner`] and report
//! back over a channel that is only read by the data tick.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use web_time::Instant;

use crate::async_runtime::TaskSpawner;
use crate::error::Result;
use crate::fetch::{FetchReply, FetchRequest, Fetcher};
use crate::gpu::{GpuBackend, GpuHandle, GpuMesh, GpuTexture};
use crate::resource::{CpuPayload, Decoded, Payload, Resource, ResourceKind, ResourceState, Validity};

/// Per-tick work limits and memory targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_concurrent_downloads: usize,
    pub max_resource_processes_per_tick: usize,
    pub max_gpu_uploads_per_tick: usize,
    pub tick_time_budget: Duration,
    /// Render ticks an unreferenced resource survives without being touched.
    pub resource_retention_ticks: u64,
    pub target_gpu_memory_kb: usize,
    pub target_ram_memory_kb: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 10,
            max_resource_processes_per_tick: 10,
            max_gpu_uploads_per_tick: 10,
            tick_time_budget: Duration::from_millis(10),
            resource_retention_ticks: 100,
            target_gpu_memory_kb: 512 * 1024,
            target_ram_memory_kb: 512 * 1024,
        }
    }
}

/// Cumulative resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub created: u64,
    pub downloaded: u64,
    /// Downloads answered by a local byte cache.
    pub disk_loaded: u64,
    pub processed: u64,
    pub released: u64,
    pub failed: u64,
}

/// Point-in-time view of the cache for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub counters: CacheCounters,
    pub active: usize,
    pub downloading: usize,
    /// Downloaded or decoded but not yet usable.
    pub preparing: usize,
    pub gpu_memory_bytes: usize,
    pub ram_memory_bytes: usize,
}

struct Completion {
    name: String,
    incarnation: u64,
    result: Result<FetchReply>,
}

/// Owns all live resources and schedules their loading.
pub struct ResourceCache {
    resources: DashMap<String, Arc<Resource>>,
    fetcher: Arc<dyn Fetcher>,
    spawner: Arc<dyn TaskSpawner>,
    completion_tx: async_channel::Sender<Completion>,
    completion_rx: async_channel::Receiver<Completion>,
    limits: RwLock<CacheLimits>,
    counters: Mutex<CacheCounters>,
    tick: AtomicU64,
    generation: AtomicU64,
    next_incarnation: AtomicU64,
}

impl ResourceCache {
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, spawner: Arc<dyn TaskSpawner>) -> Self {
        let (completion_tx, completion_rx) = async_channel::unbounded();
        Self {
            resources: DashMap::new(),
            fetcher,
            spawner,
            completion_tx,
            completion_rx,
            limits: RwLock::new(CacheLimits::default()),
            counters: Mutex::new(CacheCounters::default()),
            tick: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            next_incarnation: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn limits(&self) -> CacheLimits {
        *self.limits.read()
    }

    pub fn set_limits(&self, limits: CacheLimits) {
        *self.limits.write() = limits;
    }

    /// Current render tick number.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Current traversal cache generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Get the resource with the given name, creating it on first reference.
    pub fn get_or_create(&self, name: &str, kind: ResourceKind) -> Arc<Resource> {
        self.get_or_create_with_headers(name, kind, Vec::new())
    }

    /// Like [`Self::get_or_create`], attaching request headers to a newly
    /// created resource.
    pub fn get_or_create_with_headers(
        &self,
        name: &str,
        kind: ResourceKind,
        headers: Vec<(String, String)>,
    ) -> Arc<Resource> {
        if let Some(existing) = self.resources.get(name) {
            return Arc::clone(existing.value());
        }

        let mut created = false;
        let resource = {
            let entry = self.resources.entry(name.to_string()).or_insert_with(|| {
                created = true;
                let incarnation = self.next_incarnation.fetch_add(1, Ordering::Relaxed);
                Arc::new(Resource::new(
                    name.to_string(),
                    kind,
                    incarnation,
                    headers,
                    self.tick(),
                    self.generation(),
                ))
            });
            Arc::clone(entry.value())
        };
        // Counters are never locked while a map shard is held.
        if created {
            self.counters.lock().created += 1;
            tracing::debug!(name, %kind, "resource created");
        }
        resource
    }

    /// Look up a resource without creating it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Validity of a resource. Also marks it as used this tick.
    pub fn validity(&self, resource: &Resource) -> Validity {
        resource.touch(self.tick(), self.generation());
        resource.validity()
    }

    /// Invalidate the traversal cache.
    ///
    /// Resources not touched again before the next render tick are released
    /// once unreferenced. Failed resources are forgotten so that the next
    /// reference retries them.
    pub fn purge_traverse_cache(&self) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.resources
            .retain(|_, r| !matches!(*r.state(), ResourceState::Failed));
        tracing::debug!(generation, "traverse cache purged");
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Run the data phase: drain completions, decode, dispatch fetches.
    ///
    /// Returns whether any resource is still in progress.
    pub fn data_tick(&self) -> bool {
        let limits = self.limits();
        let start = Instant::now();

        self.drain_completions();
        self.decode_downloaded(&limits, start);
        self.dispatch_fetches(&limits);
        self.decay_priorities();

        self.resources.iter().any(|r| {
            !matches!(
                *r.value().state(),
                ResourceState::Ready(_) | ResourceState::Failed
            )
        })
    }

    /// Run the render phase: upload, evict.
    ///
    /// Resources touched since the previous render tick belong to the frame
    /// being rendered and are never released for memory pressure.
    pub fn render_tick(&self, gpu: &mut dyn GpuBackend) {
        let limits = self.limits();
        let start = Instant::now();
        let frame = self.tick.fetch_add(1, Ordering::Relaxed);

        self.upload_decoded(gpu, &limits, start);
        self.evict(gpu, &limits, frame);
    }

    /// Release every uploaded texture and mesh and forget all resources.
    ///
    /// Fetches still in flight complete into the void.
    pub fn release_all(&self, gpu: &mut dyn GpuBackend) {
        let mut released = Vec::new();
        self.resources.retain(|_, r| {
            released.push(Arc::clone(r));
            false
        });

        let mut handles = 0;
        for r in &released {
            if let Some(handle) = gpu_handle(r) {
                gpu.release(handle);
                handles += 1;
            }
        }
        self.counters.lock().released += released.len() as u64;
        tracing::info!(resources = released.len(), handles, "resource cache finalized");
    }

    /// Counters and current totals.
    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        let counters = *self.counters.lock();
        let mut snapshot = CacheSnapshot {
            counters,
            active: self.resources.len(),
            ..Default::default()
        };
        for entry in &self.resources {
            let r = entry.value();
            match *r.state() {
                ResourceState::Downloading => snapshot.downloading += 1,
                ResourceState::Downloaded(_) | ResourceState::Decoded(_) => {
                    snapshot.preparing += 1;
                }
                _ => {}
            }
            snapshot.gpu_memory_bytes += r.gpu_bytes();
            snapshot.ram_memory_bytes += r.ram_bytes();
        }
        snapshot
    }

    /// Resources currently in the given state class, highest priority first,
    /// oldest first within equal priority.
    fn collect_by_priority(&self, filter: impl Fn(&ResourceState) -> bool) -> Vec<Arc<Resource>> {
        let mut out: Vec<Arc<Resource>> = self
            .resources
            .iter()
            .filter(|r| filter(&r.value().state()))
            .map(|r| Arc::clone(r.value()))
            .collect();
        out.sort_by(|a, b| by_priority(a, b));
        out
    }

    fn drain_completions(&self) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            let Completion {
                name,
                incarnation,
                result,
            } = completion;

            let Some(resource) = self.get(&name) else {
                tracing::debug!(name = %name, "dropping completion for evicted resource");
                continue;
            };
            if resource.incarnation() != incarnation {
                tracing::debug!(name = %name, "dropping stale completion");
                continue;
            }

            let mut state = resource.state();
            if !matches!(*state, ResourceState::Downloading) {
                continue;
            }

            match result {
                Ok(reply) => {
                    tracing::debug!(name = %name, bytes = reply.data.len(), "downloaded");
                    let mut counters = self.counters.lock();
                    counters.downloaded += 1;
                    if reply.from_cache {
                        counters.disk_loaded += 1;
                    }
                    resource.set_memory(reply.data.len(), 0);
                    *state = ResourceState::Downloaded(reply.data);
                }
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "failed to fetch resource");
                    self.counters.lock().failed += 1;
                    *state = ResourceState::Failed;
                }
            }
        }
    }

    fn decode_downloaded(&self, limits: &CacheLimits, start: Instant) {
        let candidates =
            self.collect_by_priority(|s| matches!(s, ResourceState::Downloaded(_)));

        for (processed, resource) in candidates.into_iter().enumerate() {
            if processed >= limits.max_resource_processes_per_tick
                || (processed > 0 && start.elapsed() >= limits.tick_time_budget)
            {
                break;
            }

            let mut state = resource.state();
            let ResourceState::Downloaded(bytes) = std::mem::take(&mut *state) else {
                continue;
            };

            let name = resource.name();
            match resource.kind().decode(bytes) {
                Ok(Decoded::Ready(payload)) => {
                    resource.set_memory(payload_ram_bytes(&payload), 0);
                    *state = ResourceState::Ready(payload);
                    tracing::debug!(name, "resource ready");
                }
                Ok(Decoded::Upload(cpu)) => {
                    resource.set_memory(cpu.byte_size(), 0);
                    *state = ResourceState::Decoded(cpu);
                    tracing::debug!(name, "resource decoded");
                }
                Err(e) => {
                    tracing::warn!(name, error = %e, "failed to decode resource");
                    self.counters.lock().failed += 1;
                    resource.set_memory(0, 0);
                    *state = ResourceState::Failed;
                    continue;
                }
            }
            self.counters.lock().processed += 1;
        }
    }

    fn dispatch_fetches(&self, limits: &CacheLimits) {
        let in_flight = self
            .resources
            .iter()
            .filter(|r| matches!(*r.value().state(), ResourceState::Downloading))
            .count();
        let slots = limits.max_concurrent_downloads.saturating_sub(in_flight);
        if slots == 0 {
            return;
        }

        let candidates = self.collect_by_priority(|s| matches!(s, ResourceState::Initializing));
        for resource in candidates.into_iter().take(slots) {
            {
                let mut state = resource.state();
                if !matches!(*state, ResourceState::Initializing) {
                    continue;
                }
                *state = ResourceState::Downloading;
            }
            resource.reset_priority();

            let request = FetchRequest {
                name: resource.name().to_string(),
                headers: resource.headers().to_vec(),
            };
            tracing::debug!(name = %request.name, kind = %resource.kind(), "dispatching fetch");

            let future = self.fetcher.fetch(request);
            let tx = self.completion_tx.clone();
            let name = resource.name().to_string();
            let incarnation = resource.incarnation();
            self.spawner.spawn(Box::pin(async move {
                let result = future.await;
                let _ = tx
                    .send(Completion {
                        name,
                        incarnation,
                        result,
                    })
                    .await;
            }));
        }
    }

    /// Let priority hints reflect only the latest traversal. Infinite
    /// priorities are permanent.
    fn decay_priorities(&self) {
        for entry in &self.resources {
            let r = entry.value();
            if r.priority().is_finite() {
                r.reset_priority();
            }
        }
    }

    fn upload_decoded(&self, gpu: &mut dyn GpuBackend, limits: &CacheLimits, start: Instant) {
        let candidates = self.collect_by_priority(|s| matches!(s, ResourceState::Decoded(_)));

        for (uploaded, resource) in candidates.into_iter().enumerate() {
            if uploaded >= limits.max_gpu_uploads_per_tick
                || (uploaded > 0 && start.elapsed() >= limits.tick_time_budget)
            {
                break;
            }

            let mut state = resource.state();
            let ResourceState::Decoded(cpu) = std::mem::take(&mut *state) else {
                continue;
            };

            let (payload, gpu_bytes) = match cpu {
                CpuPayload::Texture(spec) => {
                    let handle = gpu.load_texture(&spec);
                    let texture = GpuTexture {
                        handle,
                        width: spec.width,
                        height: spec.height,
                        components: spec.components,
                    };
                    (Payload::Texture(texture), spec.byte_size())
                }
                CpuPayload::Mesh(spec) => {
                    let handle = gpu.load_mesh(&spec);
                    let mesh = GpuMesh {
                        handle,
                        vertex_count: spec.vertex_count,
                        index_count: spec.index_count,
                    };
                    (Payload::Mesh(mesh), spec.byte_size())
                }
            };

            resource.set_memory(0, gpu_bytes);
            *state = ResourceState::Ready(payload);
            tracing::debug!(name = resource.name(), gpu_bytes, "resource uploaded");
        }
    }

    fn evict(&self, gpu: &mut dyn GpuBackend, limits: &CacheLimits, frame: u64) {
        let tick = self.tick();
        let generation = self.generation();
        let mut released = Vec::new();

        self.resources.retain(|_, r| {
            let unreferenced = Arc::strong_count(r) == 1;
            let expired = tick.saturating_sub(r.last_access_tick()) > limits.resource_retention_ticks;
            let stale = r.last_access_generation() < generation;
            if unreferenced && (expired || stale) {
                released.push(Arc::clone(r));
                false
            } else {
                true
            }
        });

        let snapshot = self.snapshot();
        let mut gpu_used = snapshot.gpu_memory_bytes;
        let mut ram_used = snapshot.ram_memory_bytes;
        let gpu_target = limits.target_gpu_memory_kb * 1024;
        let ram_target = limits.target_ram_memory_kb * 1024;

        if gpu_used > gpu_target || ram_used > ram_target {
            let mut candidates: Vec<Arc<Resource>> = self
                .resources
                .iter()
                .filter(|r| {
                    Arc::strong_count(r.value()) == 1
                        && r.value().priority().is_finite()
                        && r.value().last_access_tick() < frame
                })
                .map(|r| Arc::clone(r.value()))
                .collect();
            candidates.sort_by_key(|r| r.last_access_tick());

            for r in candidates {
                if gpu_used <= gpu_target && ram_used <= ram_target {
                    break;
                }
                // The candidate list holds a second reference, hence 2.
                let removed = self
                    .resources
                    .remove_if(r.name(), |_, v| Arc::ptr_eq(v, &r) && Arc::strong_count(v) == 2);
                if removed.is_some() {
                    gpu_used = gpu_used.saturating_sub(r.gpu_bytes());
                    ram_used = ram_used.saturating_sub(r.ram_bytes());
                    released.push(r);
                }
            }
        }

        if released.is_empty() {
            return;
        }

        for r in &released {
            if let Some(handle) = gpu_handle(r) {
                gpu.release(handle);
            }
            tracing::debug!(name = r.name(), "resource released");
        }
        self.counters.lock().released += released.len() as u64;
    }
}

fn by_priority(a: &Resource, b: &Resource) -> CmpOrdering {
    b.priority()
        .total_cmp(&a.priority())
        .then_with(|| a.incarnation().cmp(&b.incarnation()))
}

fn payload_ram_bytes(payload: &Payload) -> usize {
    match payload {
        Payload::MetaTile(flags) => flags.len(),
        Payload::Raw(bytes) => bytes.len(),
        Payload::TilesetMapping(table) => {
            table.iter().map(|e| e.len() * std::mem::size_of::<u16>()).sum()
        }
        // Rough: configuration documents are small.
        Payload::Json(_) => 1024,
        Payload::Texture(_) | Payload::Mesh(_) => 0,
    }
}

fn gpu_handle(resource: &Resource) -> Option<GpuHandle> {
    match resource.payload()? {
        Payload::Texture(t) => Some(t.handle),
        Payload::Mesh(m) => Some(m.handle),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NullGpu;
    use crate::testing::{InlineSpawner, StaticFetcher, TRIANGLE_OBJ, init_tracing, texture_png};

    fn cache(fetcher: &Arc<StaticFetcher>, spawner: Arc<InlineSpawner>) -> ResourceCache {
        ResourceCache::new(Arc::clone(fetcher) as Arc<dyn Fetcher>, spawner)
    }

    #[test]
    fn test_get_or_create_deduplicates() {
        let fetcher = StaticFetcher::new();
        let cache = cache(&fetcher, InlineSpawner::new());
        let a = cache.get_or_create("https://x/a", ResourceKind::Mesh);
        let b = cache.get_or_create("https://x/a", ResourceKind::Mesh);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot().counters.created, 1);
    }

    #[test]
    fn test_mesh_loads_through_both_phases() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/m.obj", TRIANGLE_OBJ);
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();

        let mesh = cache.get_or_create("https://x/m.obj", ResourceKind::Mesh);
        assert_eq!(cache.validity(&mesh), Validity::Indeterminate);

        // Dispatch, then drain and decode.
        assert!(cache.data_tick());
        assert!(cache.data_tick());
        assert_eq!(cache.validity(&mesh), Validity::Indeterminate);
        assert_eq!(cache.snapshot().preparing, 1);

        cache.render_tick(&mut gpu);
        assert_eq!(cache.validity(&mesh), Validity::Valid);
        assert_eq!(gpu.meshes_loaded, 1);
        assert_eq!(mesh.mesh().unwrap().index_count, 3);
        assert!(mesh.gpu_bytes() > 0);

        let counters = cache.snapshot().counters;
        assert_eq!(counters.downloaded, 1);
        assert_eq!(counters.processed, 1);
        assert!(!cache.data_tick());
    }

    #[test]
    fn test_failed_fetch_is_invalid_and_terminal() {
        let fetcher = StaticFetcher::new();
        let cache = cache(&fetcher, InlineSpawner::new());
        let missing = cache.get_or_create("https://x/missing.png", ResourceKind::Texture);

        cache.data_tick();
        cache.data_tick();
        assert_eq!(cache.validity(&missing), Validity::Invalid);
        assert_eq!(cache.snapshot().counters.failed, 1);

        // No retry while it stays referenced.
        cache.data_tick();
        assert_eq!(fetcher.requests().len(), 1);
        assert_eq!(cache.validity(&missing), Validity::Invalid);
    }

    #[test]
    fn test_decode_failure_is_invalid() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/bad.png", b"not an image".to_vec());
        let cache = cache(&fetcher, InlineSpawner::new());
        let texture = cache.get_or_create("https://x/bad.png", ResourceKind::Texture);

        cache.data_tick();
        cache.data_tick();
        assert_eq!(cache.validity(&texture), Validity::Invalid);
    }

    #[test]
    fn test_validity_is_monotonic_until_purge() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/t.png", texture_png(2, 2));
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();
        let texture = cache.get_or_create("https://x/t.png", ResourceKind::Texture);

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(cache.validity(&texture));
            cache.data_tick();
            cache.render_tick(&mut gpu);
        }
        seen.push(cache.validity(&texture));

        let first_valid = seen.iter().position(|v| *v == Validity::Valid).unwrap();
        assert!(seen[..first_valid].iter().all(|v| *v == Validity::Indeterminate));
        assert!(seen[first_valid..].iter().all(|v| *v == Validity::Valid));
        assert_eq!(texture.texture().unwrap().width, 2);
    }

    #[test]
    fn test_dispatch_respects_concurrency_and_priority() {
        let fetcher = StaticFetcher::new();
        let spawner = InlineSpawner::deferred();
        let cache = cache(&fetcher, Arc::clone(&spawner));
        cache.set_limits(CacheLimits {
            max_concurrent_downloads: 2,
            ..CacheLimits::default()
        });

        let low = cache.get_or_create("https://x/low", ResourceKind::Mesh);
        let high = cache.get_or_create("https://x/high", ResourceKind::Mesh);
        let mid = cache.get_or_create("https://x/mid", ResourceKind::Mesh);
        low.update_priority(1.0);
        high.update_priority(10.0);
        mid.update_priority(5.0);

        cache.data_tick();
        assert_eq!(fetcher.requests(), vec!["https://x/high", "https://x/mid"]);
        assert_eq!(cache.snapshot().downloading, 2);

        // Still saturated while the fetches are in flight.
        cache.data_tick();
        assert_eq!(fetcher.requests().len(), 2);

        spawner.run_pending();
        cache.data_tick();
        assert_eq!(fetcher.requests().len(), 3);
        assert_eq!(cache.validity(&low), Validity::Indeterminate);
        assert_eq!(cache.validity(&high), Validity::Invalid);
    }

    #[test]
    fn test_decode_respects_per_tick_limit() {
        let fetcher = StaticFetcher::new();
        for i in 0..3 {
            fetcher.insert(&format!("https://x/{i}"), b"[]".to_vec());
        }
        let cache = cache(&fetcher, InlineSpawner::new());
        cache.set_limits(CacheLimits {
            max_resource_processes_per_tick: 1,
            ..CacheLimits::default()
        });
        let resources: Vec<_> = (0..3)
            .map(|i| cache.get_or_create(&format!("https://x/{i}"), ResourceKind::Search))
            .collect();

        cache.data_tick();
        cache.data_tick();
        let valid = resources
            .iter()
            .filter(|r| r.validity() == Validity::Valid)
            .count();
        assert_eq!(valid, 1);

        cache.data_tick();
        cache.data_tick();
        assert!(resources.iter().all(|r| r.validity() == Validity::Valid));
    }

    #[test]
    fn test_stale_completion_is_dropped() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/a", b"[]".to_vec());
        let spawner = InlineSpawner::deferred();
        let cache = cache(&fetcher, Arc::clone(&spawner));
        let mut gpu = NullGpu::new();

        let first = cache.get_or_create("https://x/a", ResourceKind::Search);
        cache.data_tick();
        let first_incarnation = first.incarnation();
        drop(first);

        // Evict the unreferenced resource while its fetch is still in flight.
        cache.purge_traverse_cache();
        cache.render_tick(&mut gpu);
        assert!(cache.is_empty());

        let second = cache.get_or_create("https://x/a", ResourceKind::Search);
        assert_ne!(second.incarnation(), first_incarnation);

        // The first fetch completes now and must not touch the new instance.
        spawner.run_pending();
        cache.data_tick();
        assert_eq!(cache.validity(&second), Validity::Indeterminate);
        assert_eq!(cache.snapshot().counters.downloaded, 0);

        spawner.run_pending();
        cache.data_tick();
        assert_eq!(cache.validity(&second), Validity::Valid);
    }

    #[test]
    fn test_referenced_resources_survive_purge() {
        let fetcher = StaticFetcher::new();
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();

        let held = cache.get_or_create("https://x/held", ResourceKind::Mesh);
        let _ = cache.get_or_create("https://x/dropped", ResourceKind::Mesh);

        cache.purge_traverse_cache();
        cache.render_tick(&mut gpu);

        assert!(cache.get("https://x/held").is_some());
        assert!(cache.get("https://x/dropped").is_none());
        assert_eq!(cache.snapshot().counters.released, 1);
        drop(held);
    }

    #[test]
    fn test_retention_window_expires_unused_resources() {
        let fetcher = StaticFetcher::new();
        let cache = cache(&fetcher, InlineSpawner::new());
        cache.set_limits(CacheLimits {
            resource_retention_ticks: 3,
            ..CacheLimits::default()
        });
        let mut gpu = NullGpu::new();

        let _ = cache.get_or_create("https://x/a", ResourceKind::Mesh);
        for _ in 0..3 {
            cache.render_tick(&mut gpu);
            assert_eq!(cache.len(), 1);
        }
        cache.render_tick(&mut gpu);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_budget_evicts_least_recently_used_first() {
        let fetcher = StaticFetcher::new();
        for name in ["a", "b", "c"] {
            fetcher.insert(&format!("https://x/{name}"), texture_png(64, 64));
        }
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();

        let a = cache.get_or_create("https://x/a", ResourceKind::Texture);
        let b = cache.get_or_create("https://x/b", ResourceKind::Texture);
        let c = cache.get_or_create("https://x/c", ResourceKind::Texture);
        for _ in 0..3 {
            cache.data_tick();
            cache.render_tick(&mut gpu);
        }
        assert_eq!(gpu.textures_loaded, 3);

        // a is oldest, b was used a frame later, c is used by the frame
        // about to be rendered.
        cache.validity(&a);
        cache.render_tick(&mut gpu);
        cache.validity(&b);
        cache.render_tick(&mut gpu);
        cache.validity(&c);
        let texture_kb = c.gpu_bytes() / 1024;
        drop((a, b, c));

        // Room for exactly one texture.
        cache.set_limits(CacheLimits {
            target_gpu_memory_kb: texture_kb,
            ..CacheLimits::default()
        });
        cache.render_tick(&mut gpu);

        assert!(cache.get("https://x/a").is_none());
        assert!(cache.get("https://x/b").is_none());
        assert!(cache.get("https://x/c").is_some());
        assert_eq!(gpu.released, 2);
    }

    #[test]
    fn test_budget_spares_resources_of_the_rendered_frame() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/mesh", TRIANGLE_OBJ);
        fetcher.insert("https://x/old", TRIANGLE_OBJ);
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();

        let mesh = cache.get_or_create("https://x/mesh", ResourceKind::Mesh);
        let old = cache.get_or_create("https://x/old", ResourceKind::Mesh);
        cache.data_tick();
        cache.data_tick();
        cache.render_tick(&mut gpu);
        drop((mesh, old));

        cache.set_limits(CacheLimits {
            target_gpu_memory_kb: 0,
            ..CacheLimits::default()
        });
        for _ in 0..3 {
            // Traversal uses the mesh and lets go of it before rendering.
            let mesh = cache.get("https://x/mesh").unwrap();
            assert_eq!(cache.validity(&mesh), Validity::Valid);
            drop(mesh);
            cache.render_tick(&mut gpu);
            assert!(cache.get("https://x/mesh").is_some());
        }
        assert!(cache.get("https://x/old").is_none());
        assert_eq!(gpu.released, 1);

        // Not used by this frame, so it goes too.
        cache.render_tick(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.released, 2);
    }

    #[test]
    fn test_infinite_priority_survives_budget_pressure() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/config.json", b"{}".to_vec());
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();

        let config = cache.get_or_create("https://x/config.json", ResourceKind::MapConfig);
        cache.data_tick();
        cache.data_tick();
        assert_eq!(cache.validity(&config), Validity::Valid);
        drop(config);

        cache.set_limits(CacheLimits {
            target_ram_memory_kb: 0,
            ..CacheLimits::default()
        });
        cache.render_tick(&mut gpu);
        cache.render_tick(&mut gpu);
        assert!(cache.get("https://x/config.json").is_some());
    }

    #[test]
    fn test_release_all_frees_uploads_and_forgets_resources() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("https://x/m.obj", TRIANGLE_OBJ);
        fetcher.insert("https://x/t.png", texture_png(2, 2));
        let cache = cache(&fetcher, InlineSpawner::new());
        let mut gpu = NullGpu::new();

        let mesh = cache.get_or_create("https://x/m.obj", ResourceKind::Mesh);
        let texture = cache.get_or_create("https://x/t.png", ResourceKind::Texture);
        let _missing = cache.get_or_create("https://x/missing", ResourceKind::Search);
        cache.data_tick();
        cache.data_tick();
        cache.render_tick(&mut gpu);
        assert_eq!(cache.validity(&mesh), Validity::Valid);
        assert_eq!(cache.validity(&texture), Validity::Valid);

        cache.release_all(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.released, 2);
        assert_eq!(cache.snapshot().counters.released, 3);

        let again = cache.get_or_create("https://x/m.obj", ResourceKind::Mesh);
        assert!(!Arc::ptr_eq(&mesh, &again));
    }

    #[test]
    fn test_purge_forgets_failed_resources() {
        let fetcher = StaticFetcher::new();
        let cache = cache(&fetcher, InlineSpawner::new());
        let missing = cache.get_or_create("https://x/late", ResourceKind::Search);
        cache.data_tick();
        cache.data_tick();
        assert_eq!(missing.validity(), Validity::Invalid);

        fetcher.insert("https://x/late", b"[]".to_vec());
        cache.purge_traverse_cache();
        let retry = cache.get_or_create("https://x/late", ResourceKind::Search);
        assert!(!Arc::ptr_eq(&missing, &retry));

        cache.data_tick();
        cache.data_tick();
        assert_eq!(cache.validity(&retry), Validity::Valid);
    }

    #[test]
    fn test_priority_hints_do_not_outlive_their_traversal() {
        let fetcher = StaticFetcher::new();
        let cache = cache(&fetcher, InlineSpawner::deferred());
        cache.set_limits(CacheLimits {
            max_concurrent_downloads: 0,
            ..CacheLimits::default()
        });

        let stale = cache.get_or_create("https://x/stale", ResourceKind::Mesh);
        let fresh = cache.get_or_create("https://x/fresh", ResourceKind::Mesh);
        stale.update_priority(10.0);
        fresh.update_priority(5.0);
        cache.data_tick();
        assert!(fetcher.requests().is_empty());
        assert_eq!(stale.priority(), 0.0);

        // Only the fresh resource is asked for again.
        fresh.update_priority(5.0);
        cache.set_limits(CacheLimits {
            max_concurrent_downloads: 1,
            ..CacheLimits::default()
        });
        cache.data_tick();
        assert_eq!(fetcher.requests(), vec!["https://x/fresh"]);
    }

    #[test]
    fn test_concurrent_traversal_and_ticks() {
        init_tracing();
        let fetcher = StaticFetcher::new();
        for i in 0..8 {
            fetcher.insert(&format!("https://x/{i}.obj"), TRIANGLE_OBJ);
        }
        let cache = cache(&fetcher, InlineSpawner::new());

        let held: Vec<Arc<Resource>> = [0, 1, 8, 9]
            .iter()
            .map(|i| cache.get_or_create(&format!("https://x/{i}.obj"), ResourceKind::Mesh))
            .collect();

        let seen = std::thread::scope(|scope| {
            let traversal = scope.spawn(|| {
                let mut seen = vec![Vec::new(); held.len()];
                for i in 0..200_u16 {
                    let name = format!("https://x/{}.obj", i % 12);
                    let r = cache.get_or_create(&name, ResourceKind::Mesh);
                    r.update_priority(f32::from(i % 7));
                    cache.validity(&r);
                    for (r, seen) in held.iter().zip(&mut seen) {
                        seen.push(cache.validity(r));
                    }
                    std::thread::yield_now();
                }
                seen
            });

            let mut gpu = NullGpu::new();
            for i in 0..100 {
                cache.data_tick();
                cache.render_tick(&mut gpu);
                if i % 10 == 0 {
                    cache.purge_traverse_cache();
                }
                std::thread::yield_now();
            }
            traversal.join().unwrap()
        });

        for (r, seen) in held.iter().zip(&seen) {
            let settled = seen.iter().position(|v| *v != Validity::Indeterminate);
            if let Some(first) = settled {
                assert!(
                    seen[first..].iter().all(|v| *v == seen[first]),
                    "{} changed validity after settling: {seen:?}",
                    r.name()
                );
            }
        }

        // Drain whatever the traversal left behind.
        let mut gpu = NullGpu::new();
        for _ in 0..4 {
            cache.data_tick();
            cache.render_tick(&mut gpu);
        }
        assert_eq!(cache.validity(&held[0]), Validity::Valid);
        assert_eq!(cache.validity(&held[2]), Validity::Invalid);
    }
}
