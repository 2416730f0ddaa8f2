//! Map configuration model.
//!
//! The map configuration is a JSON document describing the surfaces, glues,
//! virtual surfaces, bound layers and views of a map. It is loaded as an
//! infinite-priority resource and parsed into [`MapConfig`]. External bound
//! layers are resolved lazily through their own resources by
//! [`BoundLayers`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::position::Position;
use crate::resource::{ResourceKind, Validity};
use crate::scheduler::ResourceCache;
use crate::tile::{LodRange, TileRange, UrlTemplate};

/// Kind of spatial reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrsKind {
    Cartesian,
    #[default]
    Projected,
    Geographic,
}

/// The navigation SRS of a map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SrsInfo {
    #[serde(rename = "type", default)]
    pub kind: SrsKind,
    /// Body radius used for geodesic distances, in meters.
    #[serde(default = "default_radius")]
    pub radius: f64,
}

fn default_radius() -> f64 {
    6_378_137.0
}

impl Default for SrsInfo {
    fn default() -> Self {
        Self {
            kind: SrsKind::default(),
            radius: default_radius(),
        }
    }
}

/// Fields shared by surfaces and glues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceCommon {
    pub mesh_url: UrlTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_url: Option<UrlTemplate>,
    pub lod_range: LodRange,
    pub tile_range: TileRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceDef {
    pub id: String,
    #[serde(flatten)]
    pub common: SurfaceCommon,
}

/// A merge of several surfaces where they overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlueDef {
    /// Names of the glued surfaces, in stack order.
    pub id: Vec<String>,
    #[serde(flatten)]
    pub common: SurfaceCommon,
}

/// A precomputed combination of surfaces with its own tileset mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualSurfaceDef {
    pub id: Vec<String>,
    /// URL of the tileset mapping resource.
    pub mapping: String,
}

/// A resolved bound layer definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundInfo {
    #[serde(default)]
    pub id: String,
    pub url: UrlTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_url: Option<UrlTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_url: Option<UrlTemplate>,
    pub lod_range: LodRange,
    pub tile_range: TileRange,
    #[serde(default)]
    pub is_transparent: bool,
}

impl BoundInfo {
    /// Resolve every URL template against `base`.
    #[must_use]
    pub fn resolved(mut self, base: &str) -> Self {
        let resolve = |t: &UrlTemplate| UrlTemplate::new(resolve_url(base, t.as_str()));
        self.url = resolve(&self.url);
        self.meta_url = self.meta_url.as_ref().map(resolve);
        self.mask_url = self.mask_url.as_ref().map(resolve);
        self
    }
}

/// A bound layer entry of the map configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundLayerDef {
    /// Defined in its own document.
    #[serde(rename_all = "camelCase")]
    External { id: String, external_url: String },
    Inline(BoundInfo),
}

impl BoundLayerDef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            BoundLayerDef::External { id, .. } => id,
            BoundLayerDef::Inline(info) => &info.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FreeLayerDef {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Reference to a bound layer from a view, with optional opacity.
///
/// In JSON either a bare id string or `{"id": ..., "alpha": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BoundLayerParamsRepr", into = "BoundLayerParamsRepr")]
pub struct BoundLayerParams {
    pub id: String,
    pub alpha: Option<f64>,
}

impl BoundLayerParams {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alpha: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BoundLayerParamsRepr {
    Id(String),
    Full {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alpha: Option<f64>,
    },
}

impl From<BoundLayerParamsRepr> for BoundLayerParams {
    fn from(r: BoundLayerParamsRepr) -> Self {
        match r {
            BoundLayerParamsRepr::Id(id) => Self { id, alpha: None },
            BoundLayerParamsRepr::Full { id, alpha } => Self { id, alpha },
        }
    }
}

impl From<BoundLayerParams> for BoundLayerParamsRepr {
    fn from(p: BoundLayerParams) -> Self {
        match p.alpha {
            None => BoundLayerParamsRepr::Id(p.id),
            alpha => BoundLayerParamsRepr::Full { id: p.id, alpha },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeLayerParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bound_layers: Vec<BoundLayerParams>,
}

/// Which surfaces and layers are shown, and with which bound layers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Surface id to its bound layers, bottom first.
    #[serde(default)]
    pub surfaces: BTreeMap<String, Vec<BoundLayerParams>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub free_layers: BTreeMap<String, FreeLayerParams>,
}

impl View {
    /// Parse a view document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid view json: {e}")))
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// API-facing bound layer entry of a [`MapView`].
#[derive(Debug, Clone, PartialEq)]
pub struct BoundLayerInfo {
    pub id: String,
    /// Opacity, `1` when unset.
    pub alpha: f64,
}

impl BoundLayerInfo {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurfaceView {
    pub bound_layers: Vec<BoundLayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FreeLayerView {
    pub style: String,
    pub bound_layers: Vec<BoundLayerInfo>,
}

/// API-facing copy of a [`View`] with defaults filled in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapView {
    pub description: String,
    pub surfaces: BTreeMap<String, SurfaceView>,
    pub free_layers: BTreeMap<String, FreeLayerView>,
}

fn to_infos(params: &[BoundLayerParams]) -> Vec<BoundLayerInfo> {
    params
        .iter()
        .map(|p| BoundLayerInfo {
            id: p.id.clone(),
            alpha: p.alpha.unwrap_or(1.0),
        })
        .collect()
}

fn to_params(infos: &[BoundLayerInfo]) -> Vec<BoundLayerParams> {
    infos
        .iter()
        .map(|b| BoundLayerParams {
            id: b.id.clone(),
            alpha: (b.alpha < 1.0 - 1e-7).then_some(b.alpha),
        })
        .collect()
}

impl From<&View> for MapView {
    fn from(view: &View) -> Self {
        MapView {
            description: view.description.clone().unwrap_or_default(),
            surfaces: view
                .surfaces
                .iter()
                .map(|(id, layers)| {
                    let s = SurfaceView {
                        bound_layers: to_infos(layers),
                    };
                    (id.clone(), s)
                })
                .collect(),
            free_layers: view
                .free_layers
                .iter()
                .map(|(id, f)| {
                    let v = FreeLayerView {
                        style: f.style.clone().unwrap_or_default(),
                        bound_layers: to_infos(&f.bound_layers),
                    };
                    (id.clone(), v)
                })
                .collect(),
        }
    }
}

impl From<&MapView> for View {
    fn from(value: &MapView) -> Self {
        View {
            description: (!value.description.is_empty()).then(|| value.description.clone()),
            surfaces: value
                .surfaces
                .iter()
                .map(|(id, s)| (id.clone(), to_params(&s.bound_layers)))
                .collect(),
            free_layers: value
                .free_layers
                .iter()
                .map(|(id, f)| {
                    let p = FreeLayerParams {
                        style: (!f.style.is_empty()).then(|| f.style.clone()),
                        bound_layers: to_params(&f.bound_layers),
                    };
                    (id.clone(), p)
                })
                .collect(),
        }
    }
}

/// The parsed map configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub navigation_srs: SrsInfo,
    #[serde(default)]
    pub surfaces: Vec<SurfaceDef>,
    #[serde(default)]
    pub glues: Vec<GlueDef>,
    #[serde(default)]
    pub virtual_surfaces: Vec<VirtualSurfaceDef>,
    #[serde(default)]
    pub bound_layers: Vec<BoundLayerDef>,
    #[serde(default)]
    pub free_layers: BTreeMap<String, FreeLayerDef>,
    #[serde(default)]
    pub view: View,
    #[serde(default)]
    pub named_views: BTreeMap<String, View>,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_url: Option<String>,
}

impl MapConfig {
    /// Build the configuration from a parsed JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the document does not describe a map.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        MapConfig::deserialize(value).map_err(|e| Error::Json {
            context: "map config",
            message: e.to_string(),
        })
    }

    #[must_use]
    pub fn find_surface(&self, id: &str) -> Option<&SurfaceDef> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn find_glue(&self, ids: &[String]) -> Option<&GlueDef> {
        self.glues.iter().find(|g| g.id == ids)
    }

    /// The virtual surface composed of exactly the surfaces of `view`.
    #[must_use]
    pub fn find_virtual_surface(&self, view: &View) -> Option<&VirtualSurfaceDef> {
        self.virtual_surfaces.iter().find(|vs| {
            vs.id.len() == view.surfaces.len()
                && vs.id.iter().all(|id| view.surfaces.contains_key(id))
        })
    }
}

/// Resolves bound layer ids to definitions, loading external ones on demand.
pub struct BoundLayers {
    defs: HashMap<String, BoundLayerDef>,
    base_url: String,
    resolved: Mutex<HashMap<String, Arc<BoundInfo>>>,
}

impl BoundLayers {
    /// Index the bound layers of a configuration loaded from `base_url`.
    #[must_use]
    pub fn new(defs: &[BoundLayerDef], base_url: &str) -> Self {
        let mut resolved = HashMap::new();
        let mut by_id = HashMap::new();
        for def in defs {
            if let BoundLayerDef::Inline(info) = def {
                resolved.insert(
                    info.id.clone(),
                    Arc::new(info.clone().resolved(base_url)),
                );
            }
            by_id.insert(def.id().to_string(), def.clone());
        }
        Self {
            defs: by_id,
            base_url: base_url.to_string(),
            resolved: Mutex::new(resolved),
        }
    }

    /// The definition of a bound layer, or `None` if it is unknown or its
    /// external definition is still loading.
    pub fn get_bound_info(&self, id: &str, cache: &ResourceCache) -> Option<Arc<BoundInfo>> {
        if let Some(info) = self.resolved.lock().get(id) {
            return Some(Arc::clone(info));
        }

        let BoundLayerDef::External { external_url, .. } = self.defs.get(id)? else {
            return None;
        };

        let url = resolve_url(&self.base_url, external_url);
        let resource = cache.get_or_create(&url, ResourceKind::BoundLayerConfig);
        if cache.validity(&resource) != Validity::Valid {
            return None;
        }

        let json = resource.json()?;
        match BoundInfo::deserialize(json.as_ref()) {
            Ok(mut info) => {
                info.id = id.to_string();
                let info = Arc::new(info.resolved(&url));
                tracing::info!(id, url = %url, "external bound layer loaded");
                self.resolved
                    .lock()
                    .insert(id.to_string(), Arc::clone(&info));
                Some(info)
            }
            Err(e) => {
                tracing::warn!(id, url = %url, error = %e, "invalid external bound layer");
                None
            }
        }
    }

    /// Ids of all configured bound layers.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.defs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Resolve a possibly relative URL against the URL of the document that
/// referenced it.
#[must_use]
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.contains("://") {
        return url.to_string();
    }

    let scheme_end = base.find("://");
    if let Some(rest) = url.strip_prefix("//") {
        let scheme = scheme_end.map_or("https", |i| &base[..i]);
        return format!("{scheme}://{rest}");
    }

    if url.starts_with('/') {
        let origin_end = scheme_end
            .and_then(|i| base[i + 3..].find('/').map(|j| i + 3 + j))
            .unwrap_or(base.len());
        return format!("{}{url}", &base[..origin_end]);
    }

    let path_end = base.find(['?', '#']).unwrap_or(base.len());
    match base[..path_end].rfind('/') {
        Some(i) if scheme_end.is_none_or(|s| i > s + 2) => format!("{}{url}", &base[..=i]),
        _ if scheme_end.is_some() => format!("{}/{url}", &base[..path_end]),
        _ => url.to_string(),
    }
}
