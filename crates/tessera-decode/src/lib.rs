//! Decode raw map resources into in-memory specs.
//!
//! This crate provides pure synchronous decoding functions for the binary
//! and text formats a streaming map client downloads: imagery, meshes,
//! bound-layer meta tiles and tileset mappings. All functions are designed
//! to be called from any threading context - the library user controls
//! parallelism.
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives
//! - **User-controlled parallelism**: The resource scheduler decides when and
//!   where decoding runs
//! - **Web-compatible**: Compiles to WASM

mod error;
pub mod mesh;
pub mod meta;
pub mod texture;
pub mod tileset;
mod varint;

pub use error::{DecodeError, DecodeResult};
pub use mesh::{DecodedMesh, MeshVertex, decode_mesh};
pub use meta::{META_TILE_SIZE, MetaFlags, decode_bound_meta_tile};
pub use texture::{DecodedImage, ImageFormat, decode_image};
pub use tileset::{deserialize_tileset_mapping, serialize_tileset_mapping};
pub use varint::{read_varint, write_varint};
