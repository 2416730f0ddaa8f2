//! Draw lists handed to the renderer.
//!
//! Traversal produces [`RenderTask`]s that still reference resources. Once
//! every resource of a task is valid, it is flattened into a [`DrawTask`]
//! holding only plain floats and GPU handles.

use std::sync::Arc;

use glam::{DMat4, DVec3, DVec4, Mat3, Vec4};

use crate::gpu::{GpuMesh, GpuTexture};
use crate::options::MapOptions;
use crate::resource::{Resource, Validity};

/// A mesh with its textures and transforms, as found by traversal.
#[derive(Debug, Clone)]
pub struct RenderTask {
    pub mesh: Arc<Resource>,
    /// Mesh aggregate the mesh is part of, if any.
    pub mesh_agg: Option<Arc<Resource>>,
    pub texture_color: Option<Arc<Resource>>,
    pub texture_mask: Option<Arc<Resource>>,
    /// Model matrix, physical coordinates.
    pub model: DMat4,
    /// Texture coordinate transform.
    pub uvm: Mat3,
    pub color: Vec4,
    /// Texture coordinates come from an external bound layer.
    pub external_uv: bool,
    pub flat_shading: bool,
    /// Drawn after the opaque pass.
    pub transparent: bool,
}

impl RenderTask {
    #[must_use]
    pub fn new(mesh: Arc<Resource>) -> Self {
        Self {
            mesh,
            mesh_agg: None,
            texture_color: None,
            texture_mask: None,
            model: DMat4::IDENTITY,
            uvm: Mat3::IDENTITY,
            color: Vec4::ONE,
            external_uv: false,
            flat_shading: false,
            transparent: false,
        }
    }

    /// Whether every referenced resource is valid.
    #[must_use]
    pub fn ready(&self) -> bool {
        let valid = |r: &Option<Arc<Resource>>| {
            r.as_ref()
                .is_none_or(|r| r.validity() == Validity::Valid)
        };
        valid(&self.mesh_agg)
            && self.mesh.validity() == Validity::Valid
            && valid(&self.texture_color)
            && valid(&self.texture_mask)
    }
}

/// A renderer-ready draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawTask {
    pub mesh: Option<GpuMesh>,
    pub tex_color: Option<GpuTexture>,
    pub tex_mask: Option<GpuTexture>,
    /// Model-view matrix, column-major.
    pub mv: [f32; 16],
    /// Texture coordinate transform, column-major.
    pub uvm: [f32; 9],
    pub color: [f32; 4],
    /// Visible part of the texture: min u, min v, max u, max v.
    pub uv_clip: [f32; 4],
    /// Mesh origin in physical coordinates.
    pub center: [f32; 3],
    pub external_uv: bool,
    pub flat_shading: bool,
}

impl DrawTask {
    /// Flatten `task` for the camera `view` matrix.
    #[must_use]
    pub fn new(task: &RenderTask, view: &DMat4, options: &MapOptions) -> Self {
        let mv = (*view * task.model).as_mat4();
        let center = (task.model * DVec4::W).truncate().as_vec3();
        Self {
            mesh: task.mesh.mesh(),
            tex_color: task.texture_color.as_ref().and_then(|r| r.texture()),
            tex_mask: task.texture_mask.as_ref().and_then(|r| r.texture()),
            mv: mv.to_cols_array(),
            uvm: task.uvm.to_cols_array(),
            color: task.color.to_array(),
            uv_clip: [0.0, 0.0, 1.0, 1.0],
            center: center.to_array(),
            external_uv: task.external_uv,
            flat_shading: task.flat_shading || options.debug_flat_shading,
        }
    }

    /// Restrict drawing to a part of the texture.
    #[must_use]
    pub fn with_clip(mut self, uv_clip: [f32; 4]) -> Self {
        self.uv_clip = uv_clip;
        self
    }
}

/// Camera used to build a frame's draws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameCamera {
    pub view: DMat4,
    pub proj: DMat4,
    /// Eye position in physical coordinates.
    pub eye: DVec3,
}

impl Default for FrameCamera {
    fn default() -> Self {
        Self {
            view: DMat4::IDENTITY,
            proj: DMat4::IDENTITY,
            eye: DVec3::ZERO,
        }
    }
}

/// Camera state for the frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraDraws {
    pub view: [f32; 16],
    pub proj: [f32; 16],
    /// Eye position in physical coordinates.
    pub eye: [f64; 3],
}

/// Everything the renderer draws in one frame.
#[derive(Debug, Clone, Default)]
pub struct MapDraws {
    pub opaque: Vec<DrawTask>,
    pub transparent: Vec<DrawTask>,
    pub camera: CameraDraws,
}

impl From<&FrameCamera> for CameraDraws {
    fn from(camera: &FrameCamera) -> Self {
        Self {
            view: camera.view.as_mat4().to_cols_array(),
            proj: camera.proj.as_mat4().to_cols_array(),
            eye: camera.eye.to_array(),
        }
    }
}

impl MapDraws {
    #[must_use]
    pub fn len(&self) -> usize {
        self.opaque.len() + self.transparent.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.transparent.is_empty()
    }

    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
    }

    /// Sort opaque draws by distance from the eye, nearest first.
    pub fn sort_opaque_front_to_back(&mut self) {
        let eye = DVec3::from_array(self.camera.eye);
        self.opaque.sort_by(|a, b| {
            let da = DVec3::from(a.center.map(f64::from)).distance_squared(eye);
            let db = DVec3::from(b.center.map(f64::from)).distance_squared(eye);
            da.total_cmp(&db)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NullGpu;
    use crate::resource::ResourceKind;
    use crate::scheduler::ResourceCache;
    use crate::testing::{InlineSpawner, StaticFetcher, TRIANGLE_OBJ, texture_png};

    fn load(names: &[(&str, ResourceKind)]) -> (ResourceCache, Vec<Arc<Resource>>) {
        let fetcher = StaticFetcher::new();
        fetcher.insert("mesh.obj", TRIANGLE_OBJ);
        fetcher.insert("color.png", texture_png(4, 4));
        let cache = ResourceCache::new(fetcher as _, InlineSpawner::new());
        let resources = names
            .iter()
            .map(|(n, k)| cache.get_or_create(n, *k))
            .collect();
        cache.data_tick();
        cache.data_tick();
        cache.render_tick(&mut NullGpu::new());
        (cache, resources)
    }

    #[test]
    fn test_ready_requires_every_resource() {
        let (_cache, r) = load(&[
            ("mesh.obj", ResourceKind::Mesh),
            ("color.png", ResourceKind::Texture),
            ("missing.png", ResourceKind::Texture),
        ]);
        let mut task = RenderTask::new(Arc::clone(&r[0]));
        assert!(task.ready());

        task.texture_color = Some(Arc::clone(&r[1]));
        assert!(task.ready());

        task.texture_mask = Some(Arc::clone(&r[2]));
        assert!(!task.ready());
    }

    #[test]
    fn test_draw_task_flattens_render_task() {
        let (_cache, r) = load(&[
            ("mesh.obj", ResourceKind::Mesh),
            ("color.png", ResourceKind::Texture),
        ]);
        let mut task = RenderTask::new(Arc::clone(&r[0]));
        task.texture_color = Some(Arc::clone(&r[1]));
        task.model = DMat4::from_translation(DVec3::new(10.0, 20.0, 30.0));
        let view = DMat4::from_translation(DVec3::new(-10.0, 0.0, 0.0));

        let options = MapOptions {
            debug_flat_shading: true,
            ..MapOptions::default()
        };
        let draw = DrawTask::new(&task, &view, &options);
        assert_eq!(draw.center, [10.0, 20.0, 30.0]);
        assert_eq!(&draw.mv[12..15], &[0.0, 20.0, 30.0]);
        assert_eq!(draw.uv_clip, [0.0, 0.0, 1.0, 1.0]);
        assert!(draw.flat_shading);
        assert_eq!(draw.mesh.unwrap().index_count, 3);
        assert_eq!(draw.tex_color.unwrap().width, 4);
        assert!(draw.tex_mask.is_none());

        let clipped = draw.with_clip([0.25, 0.25, 0.5, 0.5]);
        assert_eq!(clipped.uv_clip, [0.25, 0.25, 0.5, 0.5]);
    }

    #[test]
    fn test_sort_front_to_back() {
        let (_cache, r) = load(&[("mesh.obj", ResourceKind::Mesh)]);
        let view = DMat4::IDENTITY;
        let options = MapOptions::default();
        let at = |x: f64| {
            let mut task = RenderTask::new(Arc::clone(&r[0]));
            task.model = DMat4::from_translation(DVec3::new(x, 0.0, 0.0));
            DrawTask::new(&task, &view, &options)
        };

        let mut draws = MapDraws {
            opaque: vec![at(50.0), at(-3.0), at(12.0)],
            ..MapDraws::default()
        };
        draws.camera.eye = [10.0, 0.0, 0.0];
        draws.sort_opaque_front_to_back();
        let xs: Vec<f32> = draws.opaque.iter().map(|d| d.center[0]).collect();
        assert_eq!(xs, [12.0, -3.0, 50.0]);

        draws.clear();
        assert!(draws.opaque.is_empty());
    }
}
