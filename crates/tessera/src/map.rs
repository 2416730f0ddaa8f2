//! The map session.
//!
//! [`Map`] ties the pieces together: it loads the map configuration as a
//! resource, keeps the current position and views, builds the surface
//! stack, advances searches and turns traversed tiles into draws. An
//! embedding application drives it by calling [`Map::data_tick`] and
//! [`Map::render_tick`] every frame.

use std::sync::{Arc, Weak};

use glam::{DMat4, Vec4};

use crate::async_runtime::TaskSpawner;
use crate::bound::BoundParamInfo;
use crate::draws::{DrawTask, FrameCamera, MapDraws, RenderTask};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::gpu::GpuBackend;
use crate::options::{MapCreateOptions, MapOptions};
use crate::position::{Position, PositionKind};
use crate::registry::{BoundLayers, MapConfig, MapView, View, resolve_url};
use crate::resource::{Resource, ResourceKind, Validity};
use crate::scheduler::ResourceCache;
use crate::search::{SearchTask, update_searches};
use crate::statistics::MapStatistics;
use crate::tile::{NodeInfo, UrlVars};
use crate::tileset::{SurfaceStackItem, TilesetMapping};

/// A tile selected by traversal for drawing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRef {
    pub node: NodeInfo,
    /// Index into [`Map::surface_stack`].
    pub surface_index: usize,
    pub sub_mesh: u32,
    /// Model matrix of the tile mesh.
    pub model: DMat4,
    pub priority: f32,
}

/// A loaded map configuration and everything derived from it.
struct LoadedConfig {
    config: MapConfig,
    bound_layers: BoundLayers,
    current_view: String,
}

/// A map session.
pub struct Map {
    create_options: MapCreateOptions,
    options: MapOptions,
    cache: ResourceCache,
    statistics: MapStatistics,
    draws: MapDraws,
    /// Tiles of the last [`Map::update_draws`] still waiting for resources.
    pending_tiles: usize,

    config_path: String,
    config_resource: Option<Arc<Resource>>,
    config_failed: bool,
    loaded: Option<LoadedConfig>,

    surface_stack: Vec<SurfaceStackItem>,
    surface_stack_dirty: bool,
    mapping_resource: Option<Arc<Resource>>,

    searches: Vec<Weak<SearchTask>>,
}

impl Map {
    /// Create a map fetching through `fetcher` and running fetches on
    /// `spawner`.
    #[must_use]
    pub fn new(
        create_options: MapCreateOptions,
        fetcher: Arc<dyn Fetcher>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        let options = MapOptions::default();
        let cache = ResourceCache::new(fetcher, spawner);
        cache.set_limits(options.cache_limits());
        Self {
            create_options,
            options,
            cache,
            statistics: MapStatistics::default(),
            draws: MapDraws::default(),
            pending_tiles: 0,
            config_path: String::new(),
            config_resource: None,
            config_failed: false,
            loaded: None,
            surface_stack: Vec::new(),
            surface_stack_dirty: true,
            mapping_resource: None,
            searches: Vec::new(),
        }
    }

    /// Create a map fetching over HTTP on the given spawner, with the byte
    /// cache configured by `create_options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    #[cfg(not(target_family = "wasm"))]
    pub fn with_http(
        create_options: MapCreateOptions,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Result<Self> {
        use crate::cache::{ByteCache, MemoryCache, NoCache};
        use crate::fetch::HttpFetcher;

        let cache: Arc<dyn ByteCache> = if create_options.disable_cache {
            Arc::new(NoCache)
        } else {
            Arc::new(MemoryCache::with_max_size(create_options.cache_capacity))
        };
        let fetcher = HttpFetcher::with_client_id(&create_options.client_id, cache)?;
        Ok(Self::new(create_options, Arc::new(fetcher), spawner))
    }

    #[must_use]
    pub fn create_options(&self) -> &MapCreateOptions {
        &self.create_options
    }

    #[must_use]
    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut MapOptions {
        &mut self.options
    }

    #[must_use]
    pub fn statistics(&self) -> &MapStatistics {
        &self.statistics
    }

    pub fn statistics_mut(&mut self) -> &mut MapStatistics {
        &mut self.statistics
    }

    #[must_use]
    pub fn draws(&self) -> &MapDraws {
        &self.draws
    }

    #[must_use]
    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    // Configuration.

    /// Switch to another map configuration. Everything derived from the
    /// previous one is dropped.
    pub fn set_map_config_path(&mut self, path: &str) {
        tracing::info!(path, "setting map config path");
        self.config_path = path.to_string();
        self.loaded = None;
        self.config_failed = false;
        self.surface_stack.clear();
        self.surface_stack_dirty = true;
        self.mapping_resource = None;
        self.searches.clear();
        self.draws.clear();
        self.pending_tiles = 0;
        self.statistics.reset_all();
        self.cache.purge_traverse_cache();
        self.config_resource = (!path.is_empty())
            .then(|| self.cache.get_or_create(path, ResourceKind::MapConfig));
    }

    #[must_use]
    pub fn map_config_path(&self) -> &str {
        &self.config_path
    }

    #[must_use]
    pub fn is_map_config_ready(&self) -> bool {
        self.loaded.is_some()
    }

    /// The loaded map configuration.
    #[must_use]
    pub fn map_config(&self) -> Option<&MapConfig> {
        self.loaded.as_ref().map(|l| &l.config)
    }

    fn update_map_config(&mut self) {
        if self.loaded.is_some() || self.config_failed {
            return;
        }
        let Some(resource) = self.config_resource.clone() else {
            return;
        };

        match self.cache.validity(&resource) {
            Validity::Indeterminate => {}
            Validity::Invalid => {
                tracing::error!(path = %self.config_path, "failed to load map config");
                self.config_failed = true;
            }
            Validity::Valid => {
                let parsed = resource
                    .json()
                    .ok_or(Error::NotReady)
                    .and_then(|json| MapConfig::from_json(&json));
                match parsed {
                    Ok(config) => self.config_loaded(config),
                    Err(e) => {
                        tracing::error!(path = %self.config_path, error = %e, "invalid map config");
                        self.config_failed = true;
                    }
                }
            }
        }
    }

    fn config_loaded(&mut self, config: MapConfig) {
        tracing::info!(
            path = %self.config_path,
            name = %config.name,
            surfaces = config.surfaces.len(),
            bound_layers = config.bound_layers.len(),
            "map config loaded"
        );
        if let Some(url) = &config.search_url {
            self.options.search_url.clone_from(url);
        }
        let bound_layers = BoundLayers::new(&config.bound_layers, &self.config_path);
        self.loaded = Some(LoadedConfig {
            config,
            bound_layers,
            current_view: String::new(),
        });
        self.surface_stack_dirty = true;
    }

    // Ticks.

    /// Run the data phase. Returns whether work remains.
    pub fn data_tick(&mut self) -> bool {
        self.statistics.data_ticks += 1;
        self.cache.set_limits(self.options.cache_limits());

        let pending = self.cache.data_tick();
        self.update_map_config();
        self.update_surface_stack();

        if let Some(loaded) = &self.loaded {
            update_searches(
                &mut self.searches,
                &self.cache,
                &loaded.config.navigation_srs,
                self.options.search_results_filter,
            );
        }

        pending || !self.searches.is_empty()
    }

    /// Run the render phase: upload decoded resources and release unused
    /// ones.
    pub fn render_tick(&mut self, gpu: &mut dyn GpuBackend) {
        self.statistics.render_ticks += 1;
        self.cache.render_tick(gpu);
        self.statistics.record_cache(&self.cache.snapshot());
    }

    /// Release every GPU resource the map holds. The map keeps its
    /// configuration and reloads tiles on the next ticks.
    pub fn render_finalize(&mut self, gpu: &mut dyn GpuBackend) {
        self.draws.clear();
        self.pending_tiles = 0;
        self.mapping_resource = None;
        self.surface_stack_dirty = true;
        self.cache.release_all(gpu);
        self.statistics.record_cache(&self.cache.snapshot());
    }

    /// Whether the last frame drew everything traversal asked for and no
    /// resource is still being prepared.
    #[must_use]
    pub fn is_map_render_complete(&self) -> bool {
        self.is_map_config_ready()
            && !self.draws.is_empty()
            && self.pending_tiles == 0
            && self.statistics.resources_preparing == 0
    }

    /// Rough progress of the current view towards a complete render, in
    /// `[0, 1]`.
    #[must_use]
    pub fn map_render_progress(&self) -> f64 {
        if !self.is_map_config_ready() {
            return 0.0;
        }
        if self.is_map_render_complete() {
            return 1.0;
        }
        let drawn = self.draws.len();
        let total = drawn + self.pending_tiles;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = drawn as f64 / total as f64;
        ratio.min(0.99)
    }

    /// Invalidate everything derived from the current view. Resources not
    /// used again are released by the next render tick.
    pub fn purge_traverse_cache(&mut self) {
        if !self.is_map_config_ready() {
            return;
        }
        self.cache.purge_traverse_cache();
        self.surface_stack_dirty = true;
    }

    // Surface stack.

    /// The current surface stack.
    #[must_use]
    pub fn surface_stack(&self) -> &[SurfaceStackItem] {
        &self.surface_stack
    }

    fn update_surface_stack(&mut self) {
        if !self.surface_stack_dirty {
            return;
        }
        let Some(loaded) = &self.loaded else {
            return;
        };
        let config = &loaded.config;

        let Some(vs) = config.find_virtual_surface(&config.view) else {
            self.surface_stack = config.generate_surface_stack(&config.view, &self.config_path);
            self.mapping_resource = None;
            self.surface_stack_dirty = false;
            return;
        };

        let url = resolve_url(&self.config_path, &vs.mapping);
        let resource = match &self.mapping_resource {
            Some(r) if r.name() == url => Arc::clone(r),
            _ => self.cache.get_or_create(&url, ResourceKind::TilesetMapping),
        };
        self.mapping_resource = Some(Arc::clone(&resource));

        match self.cache.validity(&resource) {
            Validity::Indeterminate => return,
            Validity::Invalid => {
                tracing::warn!(url = %url, "tileset mapping unavailable, composing surfaces directly");
                self.surface_stack = config.generate_surface_stack(&config.view, &self.config_path);
            }
            Validity::Valid => {
                let Some(raw) = resource.tileset_mapping() else {
                    return;
                };
                let mut mapping = TilesetMapping::new(raw);
                mapping.update(&vs.id, config, &self.config_path);
                self.surface_stack = mapping.surface_stack().to_vec();
            }
        }
        self.surface_stack_dirty = false;
        tracing::debug!(items = self.surface_stack.len(), "surface stack updated");
    }

    // Position.

    /// The current position; the default position until the configuration
    /// is loaded.
    #[must_use]
    pub fn position(&self) -> Position {
        self.loaded
            .as_ref()
            .map_or_else(Position::default, |l| l.config.position)
    }

    fn position_mut(&mut self) -> Option<&mut Position> {
        self.loaded.as_mut().map(|l| &mut l.config.position)
    }

    pub fn set_position_point(&mut self, point: [f64; 3]) {
        if let Some(p) = self.position_mut() {
            p.point = point;
        }
    }

    /// Set yaw, pitch and roll in degrees.
    pub fn set_position_rotation(&mut self, rotation: [f64; 3]) {
        if let Some(p) = self.position_mut() {
            p.orientation = rotation;
        }
    }

    pub fn set_position_view_extent(&mut self, extent: f64) {
        if !(extent.is_finite() && extent > 0.0) {
            tracing::error!(extent, "ignoring invalid view extent");
            return;
        }
        if let Some(p) = self.position_mut() {
            p.vertical_extent = extent;
        }
    }

    pub fn set_position_fov(&mut self, fov: f64) {
        if !(fov > 0.0 && fov < 180.0) {
            tracing::error!(fov, "ignoring invalid field of view");
            return;
        }
        if let Some(p) = self.position_mut() {
            p.vertical_fov = fov;
        }
    }

    pub fn set_position_subjective(&mut self, subjective: bool) {
        if let Some(p) = self.position_mut() {
            p.kind = if subjective {
                PositionKind::Subjective
            } else {
                PositionKind::Objective
            };
        }
    }

    #[must_use]
    pub fn position_subjective(&self) -> bool {
        self.position().is_subjective()
    }

    /// The position as JSON; empty until the configuration is loaded.
    #[must_use]
    pub fn position_json(&self) -> String {
        self.loaded
            .as_ref()
            .map(|l| l.config.position.to_json())
            .unwrap_or_default()
    }

    /// Replace the position from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] before the configuration is loaded and
    /// [`Error::Config`] for malformed JSON.
    pub fn set_position_json(&mut self, json: &str) -> Result<()> {
        let position = self.position_mut().ok_or(Error::NotReady)?;
        *position = Position::from_json(json)?;
        Ok(())
    }

    // Views.

    fn loaded(&self) -> Result<&LoadedConfig> {
        self.loaded.as_ref().ok_or(Error::NotReady)
    }

    fn loaded_mut(&mut self) -> Result<&mut LoadedConfig> {
        self.loaded.as_mut().ok_or(Error::NotReady)
    }

    /// Names of the named views, sorted.
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        self.loaded
            .as_ref()
            .map(|l| l.config.named_views.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Name of the named view last made current, empty if none.
    #[must_use]
    pub fn view_current(&self) -> String {
        self.loaded
            .as_ref()
            .map(|l| l.current_view.clone())
            .unwrap_or_default()
    }

    /// Make a named view current.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there is no view called `name`.
    pub fn set_view_current(&mut self, name: &str) -> Result<()> {
        let loaded = self.loaded_mut()?;
        let view = loaded
            .config
            .named_views
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown view {name:?}")))?;
        loaded.config.view = view;
        self.purge_traverse_cache();
        if let Some(loaded) = &mut self.loaded {
            loaded.current_view = name.to_string();
        }
        Ok(())
    }

    fn view(&self, name: &str) -> Result<&View> {
        let config = &self.loaded()?.config;
        if name.is_empty() {
            return Ok(&config.view);
        }
        config
            .named_views
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown view {name:?}")))
    }

    fn store_view(&mut self, name: &str, view: View) -> Result<()> {
        let loaded = self.loaded_mut()?;
        if name.is_empty() {
            loaded.config.view = view;
            self.purge_traverse_cache();
        } else {
            loaded.config.named_views.insert(name.to_string(), view);
        }
        Ok(())
    }

    /// The view called `name`, or the current view for an empty name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there is no view called `name`.
    pub fn view_data(&self, name: &str) -> Result<MapView> {
        self.view(name).map(MapView::from)
    }

    /// Store a view under `name`, or replace the current view for an empty
    /// name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] before the configuration is loaded.
    pub fn set_view_data(&mut self, name: &str, view: &MapView) -> Result<()> {
        self.store_view(name, View::from(view))
    }

    /// Like [`Self::view_data`], as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there is no view called `name`.
    pub fn view_json(&self, name: &str) -> Result<String> {
        self.view(name).map(View::to_json)
    }

    /// Like [`Self::set_view_data`], from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed JSON.
    pub fn set_view_json(&mut self, name: &str, json: &str) -> Result<()> {
        self.loaded()?;
        let view = View::from_json(json)?;
        self.store_view(name, view)
    }

    // Resource listing.

    #[must_use]
    pub fn resource_surfaces(&self) -> Vec<String> {
        self.loaded
            .as_ref()
            .map(|l| l.config.surfaces.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn resource_bound_layers(&self) -> Vec<String> {
        self.loaded
            .as_ref()
            .map(|l| {
                l.config
                    .bound_layers
                    .iter()
                    .map(|b| b.id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn resource_free_layers(&self) -> Vec<String> {
        self.loaded
            .as_ref()
            .map(|l| l.config.free_layers.keys().cloned().collect())
            .unwrap_or_default()
    }

    // Search.

    /// Search around the current position. `None` until the configuration
    /// is loaded.
    pub fn search(&mut self, query: &str) -> Option<Arc<SearchTask>> {
        let point = self.loaded.as_ref()?.config.position.point;
        self.search_at(query, point)
    }

    /// Search around `point`. `None` until the configuration is loaded.
    pub fn search_at(&mut self, query: &str, point: [f64; 3]) -> Option<Arc<SearchTask>> {
        self.loaded.as_ref()?;
        let task = Arc::new(SearchTask::new(
            query,
            point,
            &self.options.search_url,
            &self.cache,
        ));
        self.searches.push(Arc::downgrade(&task));
        Some(task)
    }

    // Traversal.

    /// Resolve the mesh and the topmost usable bound layer of one tile.
    ///
    /// The render task is only returned once every resource it needs is
    /// valid.
    pub fn prepare_tile(
        &mut self,
        node: &NodeInfo,
        surface_index: usize,
        sub_mesh: u32,
        priority: f32,
    ) -> (Validity, Option<RenderTask>) {
        let Some(loaded) = &self.loaded else {
            return (Validity::Indeterminate, None);
        };
        if self.surface_stack_dirty {
            return (Validity::Indeterminate, None);
        }
        self.statistics.current_node_draws_updates += 1;

        let Some(item) = self.surface_stack.get(surface_index) else {
            return (Validity::Invalid, None);
        };
        let Some(surface) = item.surface.clone() else {
            return (Validity::Invalid, None);
        };

        let tile = node.node_id;
        if tile.lod < surface.lod_range.min || tile.lod > surface.lod_range.max {
            return (Validity::Invalid, None);
        }
        let at_min = tile.ancestor(tile.lod - surface.lod_range.min);
        if !surface.tile_range.contains(at_min.x, at_min.y) {
            return (Validity::Invalid, None);
        }

        let vars = UrlVars::new(node, sub_mesh);
        let mesh = self.cache.get_or_create(&surface.mesh_url.expand(&vars), ResourceKind::Mesh);
        mesh.update_priority(priority);
        let mut validity = self.cache.validity(&mesh);
        if validity == Validity::Invalid {
            return (Validity::Invalid, None);
        }

        let mut task = RenderTask::new(mesh);
        task.color = item.color.extend(1.0);

        let layers = surface
            .top_surface()
            .and_then(|id| loaded.config.view.surfaces.get(id))
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut chosen = None;
        for params in layers.iter().rev() {
            let mut info = BoundParamInfo::new(params.clone());
            match info.prepare(node, &loaded.bound_layers, &self.cache, sub_mesh, priority) {
                Validity::Invalid => {}
                Validity::Indeterminate => return (Validity::Indeterminate, None),
                Validity::Valid => {
                    if info.bound.as_ref().is_some_and(|b| b.meta_url.is_some()) {
                        self.statistics.current_node_meta_updates += 1;
                    }
                    chosen = Some(info);
                    break;
                }
            }
        }

        let texture = |url: String| {
            let r = self.cache.get_or_create(&url, ResourceKind::Texture);
            r.update_priority(priority);
            r
        };
        if let Some(info) = chosen {
            if let Some(url) = info.texture_url() {
                task.texture_color = Some(texture(url));
            }
            task.texture_mask = info.mask_url().map(texture);
            task.uvm = info.uv_matrix();
            task.external_uv = true;
            task.color = Vec4::new(1.0, 1.0, 1.0, info.alpha());
            task.transparent = info.transparent;
        } else if let Some(url) = &surface.texture_url {
            task.texture_color = Some(texture(url.expand(&vars)));
        }

        for r in [&task.texture_color, &task.texture_mask].into_iter().flatten() {
            validity = validity.combine(self.cache.validity(r));
        }

        match validity {
            Validity::Valid if task.ready() => (Validity::Valid, Some(task)),
            Validity::Valid => (Validity::Indeterminate, None),
            other => (other, None),
        }
    }

    /// Build this frame's draws from the tiles traversal selected.
    pub fn update_draws(&mut self, tiles: &[TileRef], camera: &FrameCamera) {
        self.statistics.reset_frame();
        self.draws.clear();
        self.draws.camera = camera.into();
        self.pending_tiles = 0;

        for tile in tiles {
            self.statistics.record_meta_node(tile.node.node_id.lod);
            let (validity, task) =
                self.prepare_tile(&tile.node, tile.surface_index, tile.sub_mesh, tile.priority);
            let Some(mut task) = task else {
                if validity == Validity::Indeterminate {
                    self.pending_tiles += 1;
                }
                continue;
            };
            task.model = tile.model;
            let draw = DrawTask::new(&task, &camera.view, &self.options);
            if task.transparent {
                self.draws.transparent.push(draw);
            } else {
                self.draws.opaque.push(draw);
            }
            self.statistics.record_rendered_node(tile.node.node_id.lod);
        }

        self.draws.sort_opaque_front_to_back();
    }

    /// Log the configuration path, position, views and surface stack.
    pub fn print_debug_info(&self) {
        tracing::info!(path = %self.config_path, "map config path");
        let Some(loaded) = &self.loaded else {
            tracing::info!("map config not ready");
            return;
        };
        tracing::info!(position = %self.position_json(), "position");
        tracing::info!(views = %self.view_names().join(", "), "named views");
        tracing::info!(view = %loaded.current_view, "current view name");
        tracing::info!(view = %loaded.config.view.to_json(), "current view data");
        for (i, item) in self.surface_stack.iter().enumerate() {
            let name = item
                .surface
                .as_ref()
                .map(|s| s.name.join(" | "))
                .unwrap_or_default();
            tracing::info!(index = i, name = %name, alien = item.alien, "surface stack item");
        }
    }
}
