//! # Route Coordinator
//!
//! Headless save/load coordination for a cycling and hiking route-mapping app.
//!
//! This library provides:
//! - Change tracking over the sections of a route document
//! - Minimal partial-update assembly for the route backend
//! - Promotion of locally held photos and logos to permanent URLs
//! - Cleanup of map layers, sources and overlays owned by a route
//!
//! ## Features
//!
//! - **`http`** - Enable the REST route service and asset upload client
//! - **`persistence`** - Enable the SQLite store for local route drafts
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_coordinator::{ChangeSet, PayloadAssembler, RouteDocument, Segment};
//!
//! let mut route = RouteDocument::new("Sunday loop");
//! route.routes.push(Segment::from_coordinates(
//!     "route-1",
//!     "Stage 1",
//!     &[[147.32, -42.88], [147.33, -42.87], [147.34, -42.86]],
//! ));
//!
//! // A draft has no persistent id yet, so everything is sent.
//! let payload = PayloadAssembler::default().assemble(&route, &ChangeSet::default(), true);
//! assert!(payload.contains("routes"));
//! assert!(payload.contains("headerSettings"));
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Unified error handling
pub mod error;
pub use error::{CoordinatorError, OptionExt, Result, AUTH_REQUIRED_MESSAGE};

// Change tracking over document sections
pub mod changes;
pub use changes::{ChangeSet, ChangeTracker, PhotoChangeKind, SectionName};

// Derived route statistics
pub mod summary;
pub use summary::{compute_route_summary, RouteSummary};

// Partial update assembly
pub mod payload;
pub use payload::{PartialUpdate, PayloadAssembler, PayloadConfig};

// Local asset promotion
pub mod assets;
pub use assets::{AssetUploadService, AssetUploader, LogoUpload, UploadedAsset};

// Map layer/source/overlay cleanup
pub mod cleanup;
pub use cleanup::{
    CleanupConfig, CleanupReport, LayerInfo, MapCleanupCoordinator, MapEngine, OverlayRegistry,
    SettlePhase, StyleSnapshot,
};

// Backend contract
pub mod service;
pub use service::{RouteFilters, RouteService, SaveResponse, SavedRouteSummary};

// Sibling stores cleared on workspace teardown
pub mod stores;
pub use stores::{ClimbMarkerStore, LineStore, PhotoStore, PoiStore, WorkspaceStores};

// Session coordinator (public API)
pub mod coordinator;
pub use coordinator::{CoordinatorConfig, RouteCoordinator, SaveResult, SessionState};

// HTTP backend and upload client
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{CloudinaryUploader, HttpConfig, HttpRouteService};

// SQLite store for local drafts
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::LocalRouteStore;

// ============================================================================
// Core Types
// ============================================================================

/// Kind of route document, as shown in the route index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Single,
    Tourism,
    Event,
    Bikepacking,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Single => "single",
            RouteType::Tourism => "tourism",
            RouteType::Event => "event",
            RouteType::Bikepacking => "bikepacking",
        }
    }
}

/// Bounding box over `[lng, lat]` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from `[lng, lat]` coordinates.
    pub fn from_coordinates<'a>(coords: impl IntoIterator<Item = &'a [f64; 2]>) -> Option<Self> {
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;
        let mut any = false;

        for c in coords {
            if !c[0].is_finite() || !c[1].is_finite() {
                continue;
            }
            any = true;
            min_lng = min_lng.min(c[0]);
            max_lng = max_lng.max(c[0]);
            min_lat = min_lat.min(c[1]);
            max_lat = max_lat.max(c[1]);
        }

        if !any {
            return None;
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Bounds covering every segment's geometry.
    pub fn from_segments(segments: &[Segment]) -> Option<Self> {
        let coords: Vec<[f64; 2]> = segments.iter().flat_map(|s| s.coordinates()).collect();
        Self::from_coordinates(&coords)
    }

    /// Get the center point of the bounds as `[lng, lat]`.
    pub fn center(&self) -> [f64; 2] {
        [
            (self.min_lng + self.max_lng) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        ]
    }
}

/// Live camera of the rendering engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    pub zoom: f64,
    /// `[lng, lat]`
    pub center: [f64; 2],
    pub bearing: f64,
    pub pitch: f64,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            zoom: 0.0,
            center: [0.0, 0.0],
            bearing: 0.0,
            pitch: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Padding {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

/// Camera snapshot persisted with a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapState {
    pub zoom: f64,
    /// `[lng, lat]`
    pub center: [f64; 2],
    pub bearing: f64,
    pub pitch: f64,
    #[serde(default)]
    pub padding: Padding,
    #[serde(default = "MapState::world_bbox")]
    pub bbox: [f64; 4],
    pub style: String,
}

impl MapState {
    fn world_bbox() -> [f64; 4] {
        [-180.0, -90.0, 180.0, 90.0]
    }

    /// Snapshot a live camera together with the active style name.
    pub fn from_camera(camera: CameraState, style: impl Into<String>) -> Self {
        Self {
            zoom: camera.zoom,
            center: camera.center,
            bearing: camera.bearing,
            pitch: camera.pitch,
            padding: Padding::default(),
            bbox: Self::world_bbox(),
            style: style.into(),
        }
    }

    pub fn camera(&self) -> CameraState {
        CameraState {
            zoom: self.zoom,
            center: self.center,
            bearing: self.bearing,
            pitch: self.pitch,
        }
    }
}

impl Default for MapState {
    fn default() -> Self {
        Self::from_camera(CameraState::default(), "default")
    }
}

/// Stretch of a segment without a sealed surface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpavedSection {
    pub start_index: usize,
    pub end_index: usize,
    /// `[lng, lat]` pairs
    pub coordinates: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_type: Option<String>,
}

/// Location tags attached to a segment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SegmentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lga: Option<String>,
}

/// Per-segment statistics computed on import.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentStatistics {
    /// Distance in meters
    pub total_distance: f64,
    /// Elevation gain in meters
    pub elevation_gain: f64,
    /// Elevation loss in meters
    pub elevation_loss: f64,
}

/// One contiguous track within a multi-segment route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub route_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// GeoJSON FeatureCollection; the first feature's LineString is the track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geojson: Option<Value>,
    #[serde(default)]
    pub unpaved_sections: Vec<UnpavedSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SegmentMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<SegmentStatistics>,
    /// UI focus, never persisted
    #[serde(skip)]
    pub is_focused: bool,
}

impl Segment {
    pub fn new(route_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            name: name.into(),
            color: None,
            geojson: None,
            unpaved_sections: Vec::new(),
            description: None,
            metadata: None,
            statistics: None,
            is_focused: false,
        }
    }

    /// Create a segment whose geometry is a single LineString feature.
    pub fn from_coordinates(
        route_id: impl Into<String>,
        name: impl Into<String>,
        coords: &[[f64; 2]],
    ) -> Self {
        let mut segment = Self::new(route_id, name);
        segment.geojson = Some(serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": { "type": "LineString", "coordinates": coords }
            }]
        }));
        segment
    }

    /// Track coordinates as `[lng, lat]`, dropping elevation and malformed entries.
    pub fn coordinates(&self) -> Vec<[f64; 2]> {
        let Some(geojson) = &self.geojson else {
            return Vec::new();
        };
        let coords = geojson
            .pointer("/features/0/geometry/coordinates")
            .or_else(|| geojson.pointer("/geometry/coordinates"))
            .and_then(Value::as_array);

        coords
            .map(|list| {
                list.iter()
                    .filter_map(|c| {
                        let pair = c.as_array()?;
                        Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a field patch. Returns true if anything was set.
    pub fn apply(&mut self, patch: SegmentPatch) -> bool {
        let touched = !patch.is_empty();
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(color) = patch.color {
            self.color = Some(color);
        }
        if let Some(geojson) = patch.geojson {
            self.geojson = Some(geojson);
        }
        if let Some(unpaved) = patch.unpaved_sections {
            self.unpaved_sections = unpaved;
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = Some(metadata);
        }
        if let Some(statistics) = patch.statistics {
            self.statistics = Some(statistics);
        }
        touched
    }
}

/// Partial update of a segment passed to `update_route`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentPatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub geojson: Option<Value>,
    pub unpaved_sections: Option<Vec<UnpavedSection>>,
    pub description: Option<String>,
    pub metadata: Option<SegmentMetadata>,
    pub statistics: Option<SegmentStatistics>,
}

impl SegmentPatch {
    pub fn description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn metadata(metadata: SegmentMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// In-memory binary held by the editing session (never serialized).
#[derive(Debug, Clone, PartialEq)]
pub struct AssetFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Arc<[u8]>,
}

impl AssetFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Resized variants produced on the client before upload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssetBlobs {
    pub original: Option<AssetFile>,
    pub large: Option<AssetFile>,
}

/// A geotagged photo attached to the route.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// `[lng, lat]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<[f64; 2]>,
    #[serde(skip)]
    pub original_file: Option<AssetFile>,
    #[serde(skip)]
    pub blobs: Option<AssetBlobs>,
}

impl Photo {
    /// A photo that so far only exists in session memory.
    pub fn local(id: impl Into<String>, preview_url: impl Into<String>, file: AssetFile) -> Self {
        Self {
            id: id.into(),
            url: preview_url.into(),
            is_local: true,
            original_file: Some(file),
            ..Self::default()
        }
    }

    /// Binary to upload: the compressed original first, then the large blob.
    pub fn upload_source(&self) -> Option<&AssetFile> {
        self.original_file
            .as_ref()
            .or_else(|| self.blobs.as_ref().and_then(|b| b.large.as_ref()))
    }
}

/// Point of interest pinned on the map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poi {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// `[lng, lat]`
    pub coordinates: [f64; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoiCollection {
    pub draggable: Vec<Poi>,
    pub places: Vec<Poi>,
}

impl PoiCollection {
    pub fn len(&self) -> usize {
        self.draggable.len() + self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Annotated line drawn over the map (climb labels, callouts).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMarker {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub coordinates: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Logo picked in the header editor but not yet uploaded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogoData {
    pub file: Option<AssetFile>,
    pub blobs: Option<AssetBlobs>,
}

/// Branding shown in the map header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSettings {
    pub color: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub logo_public_id: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(skip)]
    pub logo_blob: Option<AssetFile>,
    #[serde(skip)]
    pub logo_data: Option<LogoData>,
    #[serde(skip)]
    pub logo_file: Option<AssetFile>,
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self {
            color: "#000000".to_string(),
            logo_url: None,
            logo_public_id: None,
            username: String::new(),
            logo_blob: None,
            logo_data: None,
            logo_file: None,
        }
    }
}

impl HeaderSettings {
    /// Logo binary to upload, in fixed priority order.
    pub fn logo_source(&self) -> Option<&AssetFile> {
        self.logo_blob
            .as_ref()
            .or_else(|| {
                self.logo_data
                    .as_ref()
                    .and_then(|d| d.blobs.as_ref())
                    .and_then(|b| b.original.as_ref())
            })
            .or_else(|| self.logo_data.as_ref().and_then(|d| d.file.as_ref()))
            .or(self.logo_file.as_ref())
    }

    /// Whether the logo URL only resolves inside the current session.
    pub fn has_local_logo_url(&self) -> bool {
        self.logo_url.as_deref().is_some_and(is_local_url)
    }

    /// Whether the logo needs the uploader before it can be persisted.
    pub fn has_pending_logo(&self) -> bool {
        self.logo_source().is_some() || self.has_local_logo_url()
    }

    /// Drop in-memory logo binaries.
    pub fn clear_local_logo(&mut self) {
        self.logo_blob = None;
        self.logo_data = None;
        self.logo_file = None;
    }
}

/// Change to the header logo.
#[derive(Debug, Clone, PartialEq)]
pub enum LogoChange {
    /// Logo already hosted remotely
    Remote {
        url: String,
        public_id: Option<String>,
    },
    /// Logo picked from disk; `preview_url` is a session-only URL
    Local {
        preview_url: String,
        file: AssetFile,
    },
    Remove,
}

/// Partial update of [`HeaderSettings`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeaderSettingsPatch {
    pub color: Option<String>,
    pub username: Option<String>,
    pub logo: Option<LogoChange>,
}

impl HeaderSettings {
    pub fn apply(&mut self, patch: HeaderSettingsPatch) {
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(username) = patch.username {
            self.username = username;
        }
        match patch.logo {
            Some(LogoChange::Remote { url, public_id }) => {
                self.clear_local_logo();
                self.logo_url = Some(url);
                self.logo_public_id = public_id;
            }
            Some(LogoChange::Local { preview_url, file }) => {
                self.clear_local_logo();
                self.logo_url = Some(preview_url);
                self.logo_public_id = None;
                self.logo_file = Some(file);
            }
            Some(LogoChange::Remove) => {
                self.clear_local_logo();
                self.logo_url = None;
                self.logo_public_id = None;
            }
            None => {}
        }
    }
}

/// Overlay text panel shown over the map overview.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapOverview {
    pub description: String,
}

/// The persisted route document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub route_type: RouteType,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<String>,
    #[serde(default)]
    pub map_state: MapState,
    #[serde(default)]
    pub routes: Vec<Segment>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub pois: PoiCollection,
    #[serde(default)]
    pub lines: Vec<LineMarker>,
    #[serde(default)]
    pub header_settings: HeaderSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_overview: Option<MapOverview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_summary: Option<RouteSummary>,
}

impl RouteDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            persistent_id: None,
            name: name.into(),
            route_type: RouteType::default(),
            is_public: false,
            event_date: None,
            map_state: MapState::default(),
            routes: Vec::new(),
            photos: Vec::new(),
            pois: PoiCollection::default(),
            lines: Vec::new(),
            header_settings: HeaderSettings::default(),
            description: None,
            map_overview: None,
            route_summary: None,
        }
    }

    pub fn is_new(&self) -> bool {
        self.persistent_id.is_none()
    }
}

impl Default for RouteDocument {
    fn default() -> Self {
        Self::new("")
    }
}

/// URL schemes that only resolve inside the current session.
pub fn is_local_url(url: &str) -> bool {
    url.starts_with("blob:")
}

// ============================================================================
// Tests
// ============================================================================
