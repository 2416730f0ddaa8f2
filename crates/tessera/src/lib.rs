//! Resource pipeline of a streaming tiled map client.
//!
//! This crate loads a map configuration, fetches and decodes the tiles it
//! references, uploads them to the GPU and composes them into per-frame
//! draw lists. The embedding application owns the renderer and the
//! executor; the library only needs a [`TaskSpawner`] to run fetches and a
//! [`GpuBackend`] to upload into.
//!
//! # Design principles
//!
//! - **Tick driven**: all state changes happen in [`Map::data_tick`] and
//!   [`Map::render_tick`], fetches complete in the background
//! - **Runtime-agnostic**: fetch futures run on any executor through
//!   [`TaskSpawner`]
//! - **Web-compatible**: HTTP and Tokio are only used off WASM
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessera::{Map, MapCreateOptions, TokioSpawner};
//!
//! let spawner = Arc::new(TokioSpawner::current().unwrap());
//! let mut map = Map::with_http(MapCreateOptions::default(), spawner)?;
//! map.set_map_config_path("https://maps.example/mapConfig.json");
//!
//! loop {
//!     map.data_tick();
//!     map.update_draws(&tiles, &camera);
//!     map.render_tick(&mut gpu);
//!     let rendered = map.statistics().nodes_rendered_total;
//! }
//!
//! map.render_finalize(&mut gpu);
//! ```

mod async_runtime;
pub mod bound;
pub mod cache;
pub mod draws;
mod error;
pub mod fetch;
pub mod gpu;
pub mod map;
pub mod options;
pub mod position;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod search;
pub mod statistics;
#[cfg(test)]
mod testing;
pub mod tile;
pub mod tileset;

pub use async_runtime::{BoxTask, TaskSpawner};
#[cfg(not(target_family = "wasm"))]
pub use async_runtime::TokioSpawner;
pub use cache::{ByteCache, MemoryCache, NoCache};
pub use draws::{DrawTask, FrameCamera, MapDraws, RenderTask};
pub use error::{Error, Result};
pub use fetch::{FetchReply, FetchRequest, Fetcher};
#[cfg(not(target_family = "wasm"))]
pub use fetch::HttpFetcher;
pub use gpu::{GpuBackend, GpuMesh, GpuTexture, NullGpu};
pub use map::{Map, TileRef};
pub use options::{MapCreateOptions, MapOptions};
pub use position::Position;
pub use registry::{MapConfig, MapView, View};
pub use resource::{Resource, ResourceKind, Validity};
pub use scheduler::{CacheLimits, ResourceCache};
pub use search::{SearchItem, SearchTask};
pub use statistics::MapStatistics;
pub use tile::{NodeInfo, TileId};

// Re-export decode types for convenience.
pub use tessera_decode::{DecodedImage, DecodedMesh, MetaFlags};
