//! Removal of map artifacts owned by a route.
//!
//! The rendering engine has no "remove everything belonging to X" call, so
//! route-owned layers and sources are found by id: a table of known naming
//! templates plus a whole-token match on the route id. Layers go first,
//! sources after the engine has settled, then the view is redrawn.
//!
//! Overlays drawn outside the engine (climb flags, line labels, POI pins) are
//! owned by [`OverlayRegistry`] implementations and removed through them. The
//! selector-based marker sweep in [`MapCleanupCoordinator::clear_all`] is only
//! a last-resort net for overlays nobody registered.
//!
//! Every engine call here is best effort: errors are logged and counted, never
//! returned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::error::Result;
use crate::{Bounds, CameraState};

// ============================================================================
// Naming Templates
// ============================================================================

/// `{route_id}{suffix}`
static ROUTE_SUFFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "-main",
        "-main-line",
        "-main-border",
        "-line",
        "-border",
        "-hover",
        "-unpaved",
        "-unpaved-line",
        "-source",
        "-surface",
        "-outline",
        "-fill",
        "-symbol",
        "-label",
    ]
    .into_iter()
    .collect()
});

/// `{prefix}{route_id}`, optionally followed by a known suffix.
const ROUTE_PREFIXES: [&str; 5] = [
    "route-",
    "render-route-",
    "unpaved-sections-",
    "unpaved-sections-layer-",
    "unpaved-section-layer-",
];

/// `{prefix}{route_id}-{index}`, one per unpaved stretch.
const INDEXED_PREFIXES: [&str; 2] = ["unpaved-section-", "unpaved-section-layer-"];

const TOKEN_DELIMITERS: [char; 3] = ['-', '_', ':'];

fn matches_suffix_template(rest: &str) -> bool {
    rest.is_empty() || ROUTE_SUFFIXES.contains(rest)
}

fn is_index_suffix(rest: &str) -> bool {
    rest.strip_prefix('-')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Whether `route_id` occurs in `id` bounded by delimiters or the ends.
fn contains_token(id: &str, route_id: &str) -> bool {
    if route_id.is_empty() {
        return false;
    }
    id.match_indices(route_id).any(|(start, _)| {
        let end = start + route_id.len();
        let before_ok = id[..start]
            .chars()
            .next_back()
            .map_or(true, |c| TOKEN_DELIMITERS.contains(&c));
        let after_ok = id[end..]
            .chars()
            .next()
            .map_or(true, |c| TOKEN_DELIMITERS.contains(&c));
        before_ok && after_ok
    })
}

/// Whether a layer or source id belongs to `route_id`.
pub fn is_route_artifact(id: &str, route_id: &str) -> bool {
    if route_id.is_empty() {
        return false;
    }
    if let Some(rest) = id.strip_prefix(route_id) {
        if matches_suffix_template(rest) {
            return true;
        }
    }
    for prefix in ROUTE_PREFIXES {
        if let Some(rest) = id
            .strip_prefix(prefix)
            .and_then(|s| s.strip_prefix(route_id))
        {
            if matches_suffix_template(rest) {
                return true;
            }
        }
    }
    for prefix in INDEXED_PREFIXES {
        if let Some(rest) = id
            .strip_prefix(prefix)
            .and_then(|s| s.strip_prefix(route_id))
        {
            if is_index_suffix(rest) {
                return true;
            }
        }
    }
    contains_token(id, route_id)
}

// ============================================================================
// Engine Seam
// ============================================================================

/// A style layer as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    pub id: String,
    pub source: Option<String>,
}

impl LayerInfo {
    pub fn new(id: impl Into<String>, source: Option<&str>) -> Self {
        Self {
            id: id.into(),
            source: source.map(str::to_string),
        }
    }
}

/// Current style of the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StyleSnapshot {
    pub name: Option<String>,
    pub layers: Vec<LayerInfo>,
    pub sources: Vec<String>,
}

/// Point in the cleanup sequence where the engine must catch up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlePhase {
    LayersRemoved,
    SourcesRemoved,
    StyleReloaded,
}

/// Handle on the map rendering engine.
pub trait MapEngine: Send + Sync {
    /// Current style, or `None` while the style is still loading.
    fn style(&self) -> Option<StyleSnapshot>;
    fn has_layer(&self, id: &str) -> bool;
    fn has_source(&self, id: &str) -> bool;
    fn remove_layer(&self, id: &str) -> Result<()>;
    fn remove_source(&self, id: &str) -> Result<()>;
    /// Detach handlers bound to `layer_id` for `event`.
    fn off(&self, event: &str, layer_id: &str);
    fn camera(&self) -> CameraState;
    fn set_camera(&self, camera: CameraState);
    fn set_style(&self, style: &str) -> Result<()>;
    fn fit_bounds(&self, bounds: &Bounds);
    fn resize(&self);

    /// Completion signal for `phase`. Engines without one return `None` and
    /// the coordinator falls back to a fixed delay.
    fn settled(&self, _phase: SettlePhase) -> Option<BoxFuture<'_, ()>> {
        None
    }

    /// Remove stray marker elements matching `selectors`. Returns how many
    /// were removed.
    fn sweep_markers(&self, _selectors: &[String]) -> usize {
        0
    }
}

/// Owner of overlays rendered outside the engine's layer system.
pub trait OverlayRegistry: Send + Sync {
    fn name(&self) -> &str;
    /// Remove overlays belonging to `route_id`. Returns how many were removed.
    fn remove_route(&self, route_id: &str) -> usize;
    /// Remove every overlay. Returns how many were removed.
    fn clear(&self) -> usize;
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for map cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupConfig {
    /// Fallback wait between removing layers and removing their sources.
    /// Default: 100ms
    pub layer_settle_delay: Duration,

    /// Fallback wait for a style reload to complete.
    /// Default: 200ms
    pub style_settle_delay: Duration,

    /// Sources that belong to the base map and are never removed.
    pub base_sources: Vec<String>,

    /// Layer events the app binds handlers to.
    pub listener_events: Vec<String>,

    /// Selectors for overlay markers mounted outside the engine.
    pub marker_selectors: Vec<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        let strings = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            layer_settle_delay: Duration::from_millis(100),
            style_settle_delay: Duration::from_millis(200),
            base_sources: strings(&["composite", "mapbox", "mapbox-dem", "mapbox-terrain"]),
            listener_events: strings(&["click", "mouseenter", "mouseleave", "mousemove"]),
            marker_selectors: strings(&[
                ".climb-marker",
                ".line-marker",
                ".line-marker-label",
                ".poi-marker",
                ".photo-marker",
                ".photo-cluster",
            ]),
        }
    }
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanupReport {
    pub layers_removed: Vec<String>,
    pub sources_removed: Vec<String>,
    pub overlays_removed: usize,
    pub markers_swept: usize,
    /// Engine operations that failed and were skipped
    pub errors: usize,
}

// ============================================================================
// Cleanup Coordinator
// ============================================================================

/// Removes route-owned artifacts from the engine and overlay registries.
#[derive(Clone)]
pub struct MapCleanupCoordinator {
    engine: Arc<dyn MapEngine>,
    overlays: Vec<Arc<dyn OverlayRegistry>>,
    config: CleanupConfig,
}

impl MapCleanupCoordinator {
    pub fn new(engine: Arc<dyn MapEngine>) -> Self {
        Self::with_config(engine, Vec::new(), CleanupConfig::default())
    }

    pub fn with_config(
        engine: Arc<dyn MapEngine>,
        overlays: Vec<Arc<dyn OverlayRegistry>>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            engine,
            overlays,
            config,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    async fn settle(&self, phase: SettlePhase) {
        if let Some(signal) = self.engine.settled(phase) {
            signal.await;
            return;
        }
        let delay = match phase {
            SettlePhase::StyleReloaded => self.config.style_settle_delay,
            _ => self.config.layer_settle_delay,
        };
        if !delay.is_zero() {
            // Fixed delays are a stand-in for a missing completion signal
            debug!("[MapCleanup] No settle signal for {:?}, waiting {:?}", phase, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Remove layers, then sources, counting failures into `report`.
    async fn remove_layers_then_sources(
        &self,
        layers: &[String],
        sources: &[String],
        report: &mut CleanupReport,
    ) {
        for layer_id in layers {
            for event in &self.config.listener_events {
                self.engine.off(event, layer_id);
            }
        }

        for layer_id in layers {
            if !self.engine.has_layer(layer_id) {
                continue;
            }
            match self.engine.remove_layer(layer_id) {
                Ok(()) => report.layers_removed.push(layer_id.clone()),
                Err(e) => {
                    warn!("[MapCleanup] Error removing layer {}: {}", layer_id, e);
                    report.errors += 1;
                }
            }
        }

        if !sources.is_empty() {
            self.settle(SettlePhase::LayersRemoved).await;
        }

        for source_id in sources {
            if !self.engine.has_source(source_id) {
                continue;
            }
            match self.engine.remove_source(source_id) {
                Ok(()) => report.sources_removed.push(source_id.clone()),
                Err(e) => {
                    warn!("[MapCleanup] Error removing source {}: {}", source_id, e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Remove every layer, source and overlay belonging to `route_id`.
    pub async fn remove_route_artifacts(&self, route_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let Some(style) = self.engine.style() else {
            debug!("[MapCleanup] Style not loaded, nothing to remove for {}", route_id);
            report.overlays_removed = self.remove_route_overlays(route_id);
            return report;
        };

        let sources: Vec<String> = style
            .sources
            .iter()
            .filter(|id| is_route_artifact(id, route_id))
            .cloned()
            .collect();

        // A source cannot go while any layer still reads from it
        let layers: Vec<String> = style
            .layers
            .iter()
            .filter(|layer| {
                is_route_artifact(&layer.id, route_id)
                    || layer.source.as_ref().is_some_and(|s| sources.contains(s))
            })
            .map(|layer| layer.id.clone())
            .collect();

        debug!(
            "[MapCleanup] Route {}: {} layers, {} sources to remove",
            route_id,
            layers.len(),
            sources.len()
        );

        self.remove_layers_then_sources(&layers, &sources, &mut report)
            .await;

        self.settle(SettlePhase::SourcesRemoved).await;
        self.engine.resize();

        report.overlays_removed = self.remove_route_overlays(route_id);

        info!(
            "[MapCleanup] Removed {} layers, {} sources, {} overlays for route {}",
            report.layers_removed.len(),
            report.sources_removed.len(),
            report.overlays_removed,
            route_id
        );
        report
    }

    fn remove_route_overlays(&self, route_id: &str) -> usize {
        self.overlays
            .iter()
            .map(|registry| {
                let removed = registry.remove_route(route_id);
                if removed > 0 {
                    debug!("[MapCleanup] {} removed {} overlays", registry.name(), removed);
                }
                removed
            })
            .sum()
    }

    fn is_base_source(&self, source: &str) -> bool {
        self.config.base_sources.iter().any(|s| s == source)
    }

    /// Remove everything that is not part of the base map and reload the
    /// style, keeping the camera where it was.
    pub async fn clear_all(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let style = self.engine.style();

        if let Some(style) = &style {
            let sources: Vec<String> = style
                .sources
                .iter()
                .filter(|s| !self.is_base_source(s))
                .cloned()
                .collect();
            let layers: Vec<String> = style
                .layers
                .iter()
                .filter(|l| l.source.as_ref().is_some_and(|s| !self.is_base_source(s)))
                .map(|l| l.id.clone())
                .collect();

            self.remove_layers_then_sources(&layers, &sources, &mut report)
                .await;
        }

        match style.and_then(|s| s.name) {
            Some(style_name) => {
                let camera = self.engine.camera();
                match self.engine.set_style(&style_name) {
                    Ok(()) => {
                        self.settle(SettlePhase::StyleReloaded).await;
                        self.engine.set_camera(camera);
                    }
                    Err(e) => {
                        warn!("[MapCleanup] Error resetting style {}: {}", style_name, e);
                        report.errors += 1;
                    }
                }
            }
            // Still loading: the incoming style is clean already
            None => debug!("[MapCleanup] No style name known, skipping style reload"),
        }
        self.engine.resize();

        report.overlays_removed = self
            .overlays
            .iter()
            .map(|registry| registry.clear())
            .sum();

        report.markers_swept = self.engine.sweep_markers(&self.config.marker_selectors);
        if report.markers_swept > 0 {
            warn!(
                "[MapCleanup] Swept {} unregistered markers",
                report.markers_swept
            );
        }

        info!(
            "[MapCleanup] Cleared {} layers, {} sources, {} overlays",
            report.layers_removed.len(),
            report.sources_removed.len(),
            report.overlays_removed
        );
        report
    }
}
