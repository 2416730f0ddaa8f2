//! Surface stacks.
//!
//! A surface stack is the ordered list of surfaces and glues that traversal
//! draws from. It comes either from a virtual surface's tileset mapping or,
//! for views without one, straight from the map configuration.

use std::sync::Arc;

use glam::Vec3;

use crate::registry::{GlueDef, MapConfig, SurfaceCommon, SurfaceDef, View, resolve_url};
use crate::tile::{LodRange, TileRange, UrlTemplate};

/// A surface or glue definition copied out of the map configuration, with
/// URLs resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceInfo {
    /// Surface names, one for a surface, all glued surfaces for a glue.
    pub name: Vec<String>,
    pub mesh_url: UrlTemplate,
    pub texture_url: Option<UrlTemplate>,
    pub lod_range: LodRange,
    pub tile_range: TileRange,
    pub is_glue: bool,
}

impl SurfaceInfo {
    fn from_common(common: &SurfaceCommon, name: Vec<String>, is_glue: bool, base: &str) -> Self {
        let resolve = |t: &UrlTemplate| UrlTemplate::new(resolve_url(base, t.as_str()));
        Self {
            name,
            mesh_url: resolve(&common.mesh_url),
            texture_url: common.texture_url.as_ref().map(resolve),
            lod_range: common.lod_range,
            tile_range: common.tile_range,
            is_glue,
        }
    }

    #[must_use]
    pub fn from_surface(def: &SurfaceDef, base: &str) -> Self {
        Self::from_common(&def.common, vec![def.id.clone()], false, base)
    }

    #[must_use]
    pub fn from_glue(def: &GlueDef, base: &str) -> Self {
        Self::from_common(&def.common, def.id.clone(), true, base)
    }

    /// The surface whose view entry decides the bound layers: the only one
    /// for a surface, the topmost for a glue.
    #[must_use]
    pub fn top_surface(&self) -> Option<&str> {
        self.name.last().map(String::as_str)
    }
}

/// One entry of a surface stack.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurfaceStackItem {
    /// `None` for the sentinel.
    pub surface: Option<Arc<SurfaceInfo>>,
    /// Debug color.
    pub color: Vec3,
    /// Set when the entry references a definition the configuration lacks.
    pub alien: bool,
}

impl SurfaceStackItem {
    fn new(surface: SurfaceInfo) -> Self {
        Self {
            surface: Some(Arc::new(surface)),
            ..Self::default()
        }
    }

    fn alien() -> Self {
        Self {
            alien: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.surface.is_none() && !self.alien
    }
}

/// The decoded tileset mapping of a virtual surface and the stack built
/// from it.
#[derive(Debug, Clone, Default)]
pub struct TilesetMapping {
    data_raw: Arc<Vec<Vec<u16>>>,
    surface_stack: Vec<SurfaceStackItem>,
}

impl TilesetMapping {
    #[must_use]
    pub fn new(data_raw: Arc<Vec<Vec<u16>>>) -> Self {
        Self {
            data_raw,
            surface_stack: Vec::new(),
        }
    }

    #[must_use]
    pub fn data_raw(&self) -> &[Vec<u16>] {
        &self.data_raw
    }

    #[must_use]
    pub fn surface_stack(&self) -> &[SurfaceStackItem] {
        &self.surface_stack
    }

    /// Rebuild the surface stack.
    ///
    /// `vs_id` lists the surfaces of the virtual surface; mapping entries
    /// refer to them one-based. Stack index 0 is a sentinel so that stack
    /// indices match the source references stored in tiles.
    pub fn update(&mut self, vs_id: &[String], config: &MapConfig, base_url: &str) {
        let mut stack = Vec::with_capacity(self.data_raw.len() + 1);
        stack.push(SurfaceStackItem::default());

        for entry in self.data_raw.iter() {
            let names: Option<Vec<String>> = entry
                .iter()
                .map(|&i| {
                    usize::from(i)
                        .checked_sub(1)
                        .and_then(|i| vs_id.get(i))
                        .cloned()
                })
                .collect();
            let Some(names) = names else {
                tracing::warn!(?entry, "tileset mapping index out of range");
                stack.push(SurfaceStackItem::alien());
                continue;
            };

            let item = if let [name] = names.as_slice() {
                config
                    .find_surface(name)
                    .map(|def| SurfaceStackItem::new(SurfaceInfo::from_surface(def, base_url)))
            } else {
                config
                    .find_glue(&names)
                    .map(|def| SurfaceStackItem::new(SurfaceInfo::from_glue(def, base_url)))
            };
            stack.push(item.unwrap_or_else(|| {
                tracing::warn!(?names, "tileset mapping references unknown surface");
                SurfaceStackItem::alien()
            }));
        }

        colorize_surface_stack(&mut stack);
        self.surface_stack = stack;
    }
}

/// Assign every non-sentinel entry a distinct hue, in stack order. Alien
/// entries get a darker shade.
pub fn colorize_surface_stack(stack: &mut [SurfaceStackItem]) {
    let count = stack.iter().filter(|s| !s.is_sentinel()).count();
    let mut index = 0usize;
    for item in stack.iter_mut() {
        if item.is_sentinel() {
            item.color = Vec3::ZERO;
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let hue = index as f32 / count as f32;
        let value = if item.alien { 0.5 } else { 1.0 };
        item.color = hsv_to_rgb(hue, 1.0, value);
        index += 1;
    }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Vec3 {
    let h6 = (h.fract() * 6.0).max(0.0);
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    match sector as u32 {
        0 => Vec3::new(v, t, p),
        1 => Vec3::new(q, v, p),
        2 => Vec3::new(p, v, t),
        3 => Vec3::new(p, q, v),
        4 => Vec3::new(t, p, v),
        _ => Vec3::new(v, p, q),
    }
}

impl MapConfig {
    /// Build the surface stack for a view without a virtual surface.
    ///
    /// Glues whose surfaces are all part of the view come first, longest
    /// first and then by name sequence, followed by the view's surfaces.
    #[must_use]
    pub fn generate_surface_stack(&self, view: &View, base_url: &str) -> Vec<SurfaceStackItem> {
        let mut glues: Vec<&GlueDef> = self
            .glues
            .iter()
            .filter(|g| g.id.iter().all(|id| view.surfaces.contains_key(id)))
            .collect();
        glues.sort_by(|a, b| b.id.len().cmp(&a.id.len()).then_with(|| a.id.cmp(&b.id)));

        let mut stack: Vec<SurfaceStackItem> = glues
            .into_iter()
            .map(|g| SurfaceStackItem::new(SurfaceInfo::from_glue(g, base_url)))
            .collect();

        for id in view.surfaces.keys() {
            match self.find_surface(id) {
                Some(def) => stack.push(SurfaceStackItem::new(SurfaceInfo::from_surface(def, base_url))),
                None => tracing::warn!(id = %id, "view references unknown surface"),
            }
        }

        colorize_surface_stack(&mut stack);
        stack
    }
}
