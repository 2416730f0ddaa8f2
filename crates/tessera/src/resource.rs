//! Named, lazily loaded resources and their validity protocol.
//!
//! A [`Resource`] moves through [`ResourceState`] strictly forward:
//!
//! ```text
//! Initializing -> Downloading -> Downloaded -> [Decoded ->] Ready
//!                       \              \             \
//!                        +--------------+-------------+--> Failed
//! ```
//!
//! Only the scheduler ticks advance the state. Everything else observes it
//! through [`Resource::validity`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tessera_decode::{
    decode_bound_meta_tile, decode_image, decode_mesh, deserialize_tileset_mapping,
};

use crate::error::Result;
use crate::gpu::{GpuMesh, GpuMeshSpec, GpuTexture, GpuTextureSpec};

/// Tri-state answer to "is this usable right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validity {
    /// Not loaded yet; ask again on a later tick.
    Indeterminate,
    /// Failed or rejected; will not change until invalidated.
    Invalid,
    /// Loaded and usable this frame.
    Valid,
}

impl Validity {
    /// Combine the validity of several dependencies: any `Invalid` wins,
    /// then any `Indeterminate`.
    #[must_use]
    pub fn combine(self, other: Validity) -> Validity {
        match (self, other) {
            (Validity::Invalid, _) | (_, Validity::Invalid) => Validity::Invalid,
            (Validity::Indeterminate, _) | (_, Validity::Indeterminate) => {
                Validity::Indeterminate
            }
            _ => Validity::Valid,
        }
    }
}

/// What a resource holds once loaded; selects its decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    MapConfig,
    BoundLayerConfig,
    TilesetMapping,
    BoundMetaTile,
    Texture,
    Mesh,
    Search,
}

impl ResourceKind {
    /// Priority a resource of this kind starts with.
    ///
    /// Configuration resources gate everything else and are never evicted
    /// by memory pressure.
    #[must_use]
    pub fn default_priority(self) -> f32 {
        match self {
            ResourceKind::MapConfig
            | ResourceKind::BoundLayerConfig
            | ResourceKind::TilesetMapping => f32::INFINITY,
            _ => 0.0,
        }
    }

    /// Whether the decoded payload still needs a GPU upload.
    #[must_use]
    pub fn needs_upload(self) -> bool {
        matches!(self, ResourceKind::Texture | ResourceKind::Mesh)
    }

    /// Decode downloaded bytes into the next state for this kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed.
    pub fn decode(self, bytes: Vec<u8>) -> Result<Decoded> {
        Ok(match self {
            ResourceKind::MapConfig | ResourceKind::BoundLayerConfig => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                Decoded::Ready(Payload::Json(Arc::new(value)))
            }
            ResourceKind::TilesetMapping => Decoded::Ready(Payload::TilesetMapping(Arc::new(
                deserialize_tileset_mapping(&bytes)?,
            ))),
            ResourceKind::BoundMetaTile => {
                Decoded::Ready(Payload::MetaTile(decode_bound_meta_tile(&bytes)?.into()))
            }
            ResourceKind::Texture => Decoded::Upload(CpuPayload::Texture(
                GpuTextureSpec::from_image(decode_image(&bytes)?),
            )),
            ResourceKind::Mesh => Decoded::Upload(CpuPayload::Mesh(GpuMeshSpec::from_mesh(
                &decode_mesh(&bytes)?,
            ))),
            ResourceKind::Search => Decoded::Ready(Payload::Raw(bytes.into())),
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::MapConfig => "map config",
            ResourceKind::BoundLayerConfig => "bound layer config",
            ResourceKind::TilesetMapping => "tileset mapping",
            ResourceKind::BoundMetaTile => "bound meta tile",
            ResourceKind::Texture => "texture",
            ResourceKind::Mesh => "mesh",
            ResourceKind::Search => "search",
        };
        f.write_str(name)
    }
}

/// Decoded data waiting for the render phase to upload it.
#[derive(Debug, Clone)]
pub enum CpuPayload {
    Texture(GpuTextureSpec),
    Mesh(GpuMeshSpec),
}

impl CpuPayload {
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match self {
            CpuPayload::Texture(spec) => spec.byte_size(),
            CpuPayload::Mesh(spec) => spec.byte_size(),
        }
    }
}

/// The usable content of a `Valid` resource. Cheap to clone.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Arc<serde_json::Value>),
    TilesetMapping(Arc<Vec<Vec<u16>>>),
    /// `256 * 256` flag bytes, row-major.
    MetaTile(Arc<[u8]>),
    Texture(GpuTexture),
    Mesh(GpuMesh),
    Raw(Arc<[u8]>),
}

/// Outcome of running a decoder.
#[derive(Debug)]
pub enum Decoded {
    /// Usable as is.
    Ready(Payload),
    /// Needs a GPU upload first.
    Upload(CpuPayload),
}

/// Loading progress of a resource.
#[derive(Debug, Default)]
pub enum ResourceState {
    #[default]
    Initializing,
    Downloading,
    Downloaded(Vec<u8>),
    Decoded(CpuPayload),
    Ready(Payload),
    Failed,
}

impl ResourceState {
    #[must_use]
    pub fn validity(&self) -> Validity {
        match self {
            ResourceState::Ready(_) => Validity::Valid,
            ResourceState::Failed => Validity::Invalid,
            _ => Validity::Indeterminate,
        }
    }

    /// Short label for logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ResourceState::Initializing => "initializing",
            ResourceState::Downloading => "downloading",
            ResourceState::Downloaded(_) => "downloaded",
            ResourceState::Decoded(_) => "decoded",
            ResourceState::Ready(_) => "ready",
            ResourceState::Failed => "failed",
        }
    }
}

/// A named unit of downloadable data.
///
/// Shared as `Arc<Resource>` between the cache and everything that uses it.
/// The cache only evicts a resource once it holds the last reference.
pub struct Resource {
    name: String,
    kind: ResourceKind,
    incarnation: u64,
    headers: Vec<(String, String)>,
    state: Mutex<ResourceState>,
    /// `f32` bits.
    priority: AtomicU32,
    last_access_tick: AtomicU64,
    last_access_generation: AtomicU64,
    ram_bytes: AtomicUsize,
    gpu_bytes: AtomicUsize,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state.lock().label())
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

impl Resource {
    pub(crate) fn new(
        name: String,
        kind: ResourceKind,
        incarnation: u64,
        headers: Vec<(String, String)>,
        tick: u64,
        generation: u64,
    ) -> Self {
        Self {
            name,
            kind,
            incarnation,
            headers,
            state: Mutex::new(ResourceState::Initializing),
            priority: AtomicU32::new(kind.default_priority().to_bits()),
            last_access_tick: AtomicU64::new(tick),
            last_access_generation: AtomicU64::new(generation),
            ram_bytes: AtomicUsize::new(0),
            gpu_bytes: AtomicUsize::new(0),
        }
    }

    /// The resource name, usually its URL.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Identifies this particular instance among all resources ever created
    /// under the same name.
    #[must_use]
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Extra request headers sent with the fetch.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Current validity, without touching the access bookkeeping.
    ///
    /// Renderers should go through
    /// [`ResourceCache::validity`](crate::ResourceCache::validity), which
    /// also keeps the resource alive.
    #[must_use]
    pub fn validity(&self) -> Validity {
        self.state.lock().validity()
    }

    /// The payload of a `Valid` resource.
    #[must_use]
    pub fn payload(&self) -> Option<Payload> {
        match &*self.state.lock() {
            ResourceState::Ready(payload) => Some(payload.clone()),
            _ => None,
        }
    }

    /// Meta tile flags, if this is a loaded meta tile.
    #[must_use]
    pub fn meta_flags(&self) -> Option<Arc<[u8]>> {
        match self.payload()? {
            Payload::MetaTile(flags) => Some(flags),
            _ => None,
        }
    }

    /// Raw tileset mapping table, if this is a loaded tileset mapping.
    #[must_use]
    pub fn tileset_mapping(&self) -> Option<Arc<Vec<Vec<u16>>>> {
        match self.payload()? {
            Payload::TilesetMapping(table) => Some(table),
            _ => None,
        }
    }

    /// Parsed JSON document, if this is a loaded configuration.
    #[must_use]
    pub fn json(&self) -> Option<Arc<serde_json::Value>> {
        match self.payload()? {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Raw response body, if this is a loaded search.
    #[must_use]
    pub fn raw(&self) -> Option<Arc<[u8]>> {
        match self.payload()? {
            Payload::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub fn texture(&self) -> Option<GpuTexture> {
        match self.payload()? {
            Payload::Texture(texture) => Some(texture),
            _ => None,
        }
    }

    #[must_use]
    pub fn mesh(&self) -> Option<GpuMesh> {
        match self.payload()? {
            Payload::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    #[must_use]
    pub fn priority(&self) -> f32 {
        f32::from_bits(self.priority.load(Ordering::Relaxed))
    }

    /// Raise the priority hint to at least `priority`.
    pub fn update_priority(&self, priority: f32) {
        if priority.is_nan() {
            return;
        }
        let _ = self
            .priority
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                (priority > f32::from_bits(bits)).then_some(priority.to_bits())
            });
    }

    pub(crate) fn reset_priority(&self) {
        self.priority
            .store(self.kind.default_priority().to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn touch(&self, tick: u64, generation: u64) {
        self.last_access_tick.fetch_max(tick, Ordering::Relaxed);
        self.last_access_generation
            .fetch_max(generation, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_access_tick(&self) -> u64 {
        self.last_access_tick.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_access_generation(&self) -> u64 {
        self.last_access_generation.load(Ordering::Relaxed)
    }

    /// Estimated CPU memory held, in bytes.
    #[must_use]
    pub fn ram_bytes(&self) -> usize {
        self.ram_bytes.load(Ordering::Relaxed)
    }

    /// Estimated GPU memory held, in bytes.
    #[must_use]
    pub fn gpu_bytes(&self) -> usize {
        self.gpu_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn set_memory(&self, ram: usize, gpu: usize) {
        self.ram_bytes.store(ram, Ordering::Relaxed);
        self.gpu_bytes.store(gpu, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, ResourceState> {
        self.state.lock()
    }
}
