//! Per-tile bound layer resolution.
//!
//! [`BoundParamInfo`] answers whether a bound layer can texture a given
//! tile, and how. Tiles finer than the layer's maximum LOD borrow the
//! imagery of their ancestor at that LOD; [`BoundParamInfo::uv_matrix`]
//! then crops the ancestor texture down to the tile.

use std::sync::Arc;

use glam::{Mat3, Vec3};
use tessera_decode::{META_TILE_SIZE, MetaFlags};

use crate::registry::{BoundInfo, BoundLayerParams, BoundLayers};
use crate::resource::{ResourceKind, Validity};
use crate::scheduler::ResourceCache;
use crate::tile::{NodeInfo, TileId, UrlVars};

/// Bound layer parameters for one (tile, layer, sub-mesh) triple.
///
/// Computed during traversal and thrown away afterwards.
#[derive(Debug, Clone)]
pub struct BoundParamInfo {
    pub params: BoundLayerParams,
    /// Variables of the requested tile.
    pub orig: UrlVars,
    /// Variables after ancestor fallback.
    pub vars: UrlVars,
    pub bound: Option<Arc<BoundInfo>>,
    /// Levels of ancestor fallback applied.
    pub depth: u32,
    pub watertight: bool,
    pub transparent: bool,
}

impl BoundParamInfo {
    #[must_use]
    pub fn new(params: BoundLayerParams) -> Self {
        let zero = UrlVars {
            tile_id: TileId::default(),
            local_id: TileId::default(),
            sub_mesh: 0,
        };
        Self {
            params,
            orig: zero,
            vars: zero,
            bound: None,
            depth: 0,
            watertight: true,
            transparent: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.params.id
    }

    /// Opacity of the layer in this view.
    #[must_use]
    pub fn alpha(&self) -> f32 {
        #[allow(clippy::cast_possible_truncation)]
        self.params.alpha.map_or(1.0, |a| a as f32)
    }

    /// Maps the UV space of the tile onto the fetched (possibly ancestor)
    /// texture. Rows are flipped: the result already accounts for textures
    /// being uploaded bottom-up.
    #[must_use]
    pub fn uv_matrix(&self) -> Mat3 {
        let depth = self.depth;
        if depth == 0 {
            return Mat3::IDENTITY;
        }

        let scale = 1.0 / f64::from(1u32 << depth);
        let local = self.orig.local_id;
        let tx = scale * f64::from(local.x - ((local.x >> depth) << depth));
        let ty = scale * f64::from(local.y - ((local.y >> depth) << depth));
        let ty = 1.0 - scale - ty;

        #[allow(clippy::cast_possible_truncation)]
        let (scale, tx, ty) = (scale as f32, tx as f32, ty as f32);
        Mat3::from_cols(
            Vec3::new(scale, 0.0, 0.0),
            Vec3::new(0.0, scale, 0.0),
            Vec3::new(tx, ty, 1.0),
        )
    }

    /// Resolve the layer for `node`.
    ///
    /// Returns `Indeterminate` while the layer definition or its meta tile
    /// is loading, `Invalid` if the layer does not cover the tile, and
    /// `Valid` once [`Self::vars`] and the flags are usable.
    pub fn prepare(
        &mut self,
        node: &NodeInfo,
        layers: &BoundLayers,
        cache: &ResourceCache,
        sub_mesh: u32,
        priority: f32,
    ) -> Validity {
        self.bound = layers.get_bound_info(&self.params.id, cache);
        let Some(bound) = self.bound.clone() else {
            return Validity::Indeterminate;
        };

        let tile = node.node_id;
        let min = bound.lod_range.min;
        if tile.lod < min {
            return Validity::Invalid;
        }
        let at_min = tile.ancestor(tile.lod - min);
        if !bound.tile_range.contains(at_min.x, at_min.y) {
            return Validity::Invalid;
        }

        self.orig = UrlVars::new(node, sub_mesh);
        self.depth = tile.lod.saturating_sub(bound.lod_range.max);
        self.vars = self.orig.ancestor(self.depth);

        if let Some(meta_url) = &bound.meta_url {
            let name = meta_url.expand(&self.vars.aligned(256));
            let meta = cache.get_or_create(&name, ResourceKind::BoundMetaTile);
            meta.update_priority(priority);
            match cache.validity(&meta) {
                Validity::Indeterminate => return Validity::Indeterminate,
                Validity::Invalid => return Validity::Invalid,
                Validity::Valid => {}
            }

            let Some(flags) = meta.meta_flags() else {
                return Validity::Invalid;
            };
            let x = (self.vars.tile_id.x & 255) as usize;
            let y = (self.vars.tile_id.y & 255) as usize;
            let f = flags[y * META_TILE_SIZE + x];
            if f & MetaFlags::AVAILABLE != MetaFlags::AVAILABLE {
                return Validity::Invalid;
            }
            self.watertight = f & MetaFlags::WATERTIGHT == MetaFlags::WATERTIGHT;
        }

        self.transparent = bound.is_transparent || self.params.alpha.is_some_and(|a| a < 1.0);

        Validity::Valid
    }

    /// URL of the color texture for the prepared tile.
    #[must_use]
    pub fn texture_url(&self) -> Option<String> {
        self.bound.as_ref().map(|b| b.url.expand(&self.vars))
    }

    /// URL of the mask texture, for layers that have one and tiles that are
    /// not fully covered.
    #[must_use]
    pub fn mask_url(&self) -> Option<String> {
        if self.watertight {
            return None;
        }
        let bound = self.bound.as_ref()?;
        bound.mask_url.as_ref().map(|m| m.expand(&self.vars))
    }
}
