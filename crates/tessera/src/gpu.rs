//! GPU upload contract.
//!
//! The data phase turns downloaded bytes into CPU-side specs; the render phase
//! hands those specs to a [`GpuBackend`] in a single upload step and keeps
//! the returned opaque handle.

use tessera_decode::{DecodedImage, DecodedMesh, MeshVertex};

/// Opaque handle to an uploaded texture or mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u64);

/// A texture ready for upload.
#[derive(Debug, Clone)]
pub struct GpuTextureSpec {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    /// Tightly packed pixel rows, top row first.
    pub data: Vec<u8>,
    /// Upload rows bottom-up.
    pub vertical_flip: bool,
}

impl GpuTextureSpec {
    /// Build the upload spec for a decoded image. Map imagery is always
    /// flipped on upload.
    #[must_use]
    pub fn from_image(image: DecodedImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            components: image.components,
            data: image.data,
            vertical_flip: true,
        }
    }

    /// Size of the pixel data in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Primitive assembly mode of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceMode {
    Points,
    Lines,
    #[default]
    Triangles,
}

/// Component type of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeType {
    #[default]
    Float,
    UnsignedByte,
    UnsignedShort,
}

/// Layout of one vertex attribute within the interleaved vertex buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexAttribute {
    pub enable: bool,
    pub offset: u32,
    pub stride: u32,
    pub components: u32,
    pub kind: AttributeType,
    pub normalized: bool,
}

/// A mesh ready for upload.
#[derive(Debug, Clone, Default)]
pub struct GpuMeshSpec {
    pub face_mode: FaceMode,
    /// Interleaved vertex data.
    pub vertices: Vec<u8>,
    pub indices: Vec<u16>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub attributes: [VertexAttribute; 4],
}

impl GpuMeshSpec {
    /// Build the upload spec for a decoded mesh.
    ///
    /// Attribute 0 is the position, attribute 1 the texture coordinates.
    /// Attribute 2 repeats the texture coordinates for shaders that sample
    /// an external (bound layer) texture.
    #[must_use]
    pub fn from_mesh(mesh: &DecodedMesh) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let stride = MeshVertex::STRIDE as u32;

        let position = VertexAttribute {
            enable: true,
            stride,
            components: 3,
            ..Default::default()
        };
        let uv = VertexAttribute {
            enable: true,
            stride,
            components: 2,
            offset: 3 * 4,
            ..Default::default()
        };

        #[allow(clippy::cast_possible_truncation)]
        Self {
            face_mode: FaceMode::Triangles,
            vertices: mesh.vertex_bytes(),
            indices: mesh.indices.clone(),
            vertex_count: mesh.vertex_count() as u32,
            index_count: mesh.index_count() as u32,
            attributes: [position, uv, uv, VertexAttribute::default()],
        }
    }

    /// Size of the vertex and index data in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.vertices.len() + self.indices.len() * std::mem::size_of::<u16>()
    }
}

/// An uploaded texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuTexture {
    pub handle: GpuHandle,
    pub width: u32,
    pub height: u32,
    pub components: u8,
}

/// An uploaded mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMesh {
    pub handle: GpuHandle,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// The renderer side of the upload contract.
///
/// Only the render phase calls into the backend, so implementations need
/// not be thread-safe.
pub trait GpuBackend {
    /// Upload a texture and return its handle.
    fn load_texture(&mut self, spec: &GpuTextureSpec) -> GpuHandle;

    /// Upload a mesh and return its handle.
    fn load_mesh(&mut self, spec: &GpuMeshSpec) -> GpuHandle;

    /// Free a previously uploaded texture or mesh.
    fn release(&mut self, handle: GpuHandle) {
        let _ = handle;
    }
}

/// A backend that uploads nothing and only counts calls.
///
/// Used for headless sessions and tests.
#[derive(Debug, Default)]
pub struct NullGpu {
    next_handle: u64,
    pub textures_loaded: usize,
    pub meshes_loaded: usize,
    pub released: usize,
    pub bytes_loaded: usize,
}

impl NullGpu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> GpuHandle {
        self.next_handle += 1;
        GpuHandle(self.next_handle)
    }
}

impl GpuBackend for NullGpu {
    fn load_texture(&mut self, spec: &GpuTextureSpec) -> GpuHandle {
        self.textures_loaded += 1;
        self.bytes_loaded += spec.byte_size();
        self.allocate()
    }

    fn load_mesh(&mut self, spec: &GpuMeshSpec) -> GpuHandle {
        self.meshes_loaded += 1;
        self.bytes_loaded += spec.byte_size();
        self.allocate()
    }

    fn release(&mut self, _handle: GpuHandle) {
        self.released += 1;
    }
}
