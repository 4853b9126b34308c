//! End-to-end save/load flows through the coordinator.
//!
//! Every collaborator is an in-memory fake: the backend records payloads,
//! the backend and the uploader can each be gated to hold a save mid-flight,
//! and the map engine
//! keeps a flat list of layers and sources.
//!
//! Run with: `cargo test --test save_flow`
//! Set `RUST_LOG=debug` to see the coordinator's log output.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use route_coordinator::{
    AssetFile, AssetUploadService, Bounds, CameraState, ClimbMarkerStore, CoordinatorError,
    HeaderSettingsPatch, LayerInfo, LineStore, MapEngine, OverlayRegistry, PartialUpdate, Photo,
    PhotoStore, PoiStore, Result, RouteCoordinator, RouteDocument, RouteFilters, RouteService,
    RouteType, SaveResponse, SavedRouteSummary, SectionName, Segment, SegmentPatch, SessionState,
    SettlePhase, StyleSnapshot, UploadedAsset, WorkspaceStores,
};
use serde_json::Value;
use tokio::sync::Notify;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct RecordingBackend {
    payloads: Mutex<Vec<Value>>,
    documents: Mutex<Vec<RouteDocument>>,
    index: Mutex<Vec<SavedRouteSummary>>,
    reject_auth: AtomicBool,
    /// Hold `save_route` until `release` is notified
    gated: AtomicBool,
    started: Notify,
    release: Notify,
}

impl RecordingBackend {
    fn last_payload(&self) -> Value {
        self.payloads.lock().unwrap().last().cloned().expect("no payload sent")
    }

    fn check_auth(&self) -> Result<()> {
        if self.reject_auth.load(Ordering::SeqCst) {
            Err(CoordinatorError::from_message("Authentication required"))
        } else {
            Ok(())
        }
    }
}

impl RouteService for RecordingBackend {
    fn save_route(&self, payload: PartialUpdate) -> BoxFuture<'_, Result<SaveResponse>> {
        Box::pin(async move {
            if self.gated.load(Ordering::SeqCst) {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.check_auth()?;
            let mut payloads = self.payloads.lock().unwrap();
            let persistent_id = payload
                .persistent_id()
                .map(str::to_string)
                .unwrap_or_else(|| format!("route-{}", payloads.len() + 1));

            let mut index = self.index.lock().unwrap();
            if !index.iter().any(|r| r.id == persistent_id) {
                index.push(SavedRouteSummary {
                    id: persistent_id.clone(),
                    name: payload
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    route_type: RouteType::Single,
                    is_public: true,
                    view_count: 0,
                    last_viewed: None,
                    created_at: None,
                    updated_at: None,
                });
            }
            payloads.push(payload.into_value());
            Ok(SaveResponse { persistent_id })
        })
    }

    fn load_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<RouteDocument>> {
        Box::pin(async move {
            self.check_auth()?;
            self.documents
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.persistent_id.as_deref() == Some(persistent_id))
                .cloned()
                .ok_or_else(|| CoordinatorError::RouteNotFound {
                    route_id: persistent_id.to_string(),
                })
        })
    }

    fn list_routes(
        &self,
        filters: Option<RouteFilters>,
    ) -> BoxFuture<'_, Result<Vec<SavedRouteSummary>>> {
        Box::pin(async move {
            self.check_auth()?;
            let filters = filters.unwrap_or_default();
            Ok(self
                .index
                .lock()
                .unwrap()
                .iter()
                .filter(|r| filters.matches(r))
                .cloned()
                .collect())
        })
    }

    fn delete_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_auth()?;
            self.index.lock().unwrap().retain(|r| r.id != persistent_id);
            Ok(())
        })
    }
}

/// Uploader that can hold every upload until released.
#[derive(Default)]
struct GatedUploader {
    gated: AtomicBool,
    started: Notify,
    release: Notify,
    calls: AtomicUsize,
}

impl AssetUploadService for GatedUploader {
    fn upload<'a>(&'a self, file: &'a AssetFile) -> BoxFuture<'a, Result<UploadedAsset>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated.load(Ordering::SeqCst) {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(UploadedAsset {
                url: format!("https://cdn.example/{}", file.name),
                thumbnail_url: Some(format!("https://cdn.example/t/{}", file.name)),
                medium_url: None,
                large_url: None,
                public_id: format!("uploads/{}", file.name),
            })
        })
    }
}

#[derive(Default)]
struct FakeMap {
    layers: Mutex<Vec<LayerInfo>>,
    sources: Mutex<Vec<String>>,
    camera: Mutex<CameraState>,
    styles_set: Mutex<Vec<String>>,
    fitted: Mutex<Vec<Bounds>>,
}

impl FakeMap {
    fn with_route_layers(route_ids: &[&str]) -> Self {
        let map = Self::default();
        {
            let mut layers = map.layers.lock().unwrap();
            let mut sources = map.sources.lock().unwrap();
            layers.push(LayerInfo::new("road-label", Some("composite")));
            sources.push("composite".to_string());
            for id in route_ids {
                let source = format!("{}-main", id);
                layers.push(LayerInfo::new(format!("{}-main-line", id), Some(source.as_str())));
                layers.push(LayerInfo::new(format!("{}-main-border", id), Some(source.as_str())));
                sources.push(source);
            }
        }
        map
    }

    fn layer_ids(&self) -> Vec<String> {
        self.layers.lock().unwrap().iter().map(|l| l.id.clone()).collect()
    }
}

impl MapEngine for FakeMap {
    fn style(&self) -> Option<StyleSnapshot> {
        Some(StyleSnapshot {
            name: Some("outdoors".to_string()),
            layers: self.layers.lock().unwrap().clone(),
            sources: self.sources.lock().unwrap().clone(),
        })
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layers.lock().unwrap().iter().any(|l| l.id == id)
    }

    fn has_source(&self, id: &str) -> bool {
        self.sources.lock().unwrap().iter().any(|s| s == id)
    }

    fn remove_layer(&self, id: &str) -> Result<()> {
        self.layers.lock().unwrap().retain(|l| l.id != id);
        Ok(())
    }

    fn remove_source(&self, id: &str) -> Result<()> {
        self.sources.lock().unwrap().retain(|s| s != id);
        Ok(())
    }

    fn off(&self, _event: &str, _layer_id: &str) {}

    fn camera(&self) -> CameraState {
        *self.camera.lock().unwrap()
    }

    fn set_camera(&self, camera: CameraState) {
        *self.camera.lock().unwrap() = camera;
    }

    fn set_style(&self, style: &str) -> Result<()> {
        self.styles_set.lock().unwrap().push(style.to_string());
        Ok(())
    }

    fn fit_bounds(&self, bounds: &Bounds) {
        self.fitted.lock().unwrap().push(*bounds);
    }

    fn resize(&self) {}

    fn settled(&self, _phase: SettlePhase) -> Option<BoxFuture<'_, ()>> {
        Some(Box::pin(async {}))
    }
}

#[derive(Default)]
struct ClearCounter {
    cleared: AtomicUsize,
}

impl PhotoStore for ClearCounter {
    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

impl PoiStore for ClearCounter {
    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

impl LineStore for ClearCounter {
    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

impl ClimbMarkerStore for ClearCounter {
    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct LabelOverlays {
    removed: Mutex<Vec<String>>,
    cleared: AtomicUsize,
}

impl OverlayRegistry for LabelOverlays {
    fn name(&self) -> &str {
        "line-labels"
    }

    fn remove_route(&self, route_id: &str) -> usize {
        self.removed.lock().unwrap().push(route_id.to_string());
        1
    }

    fn clear(&self) -> usize {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        1
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn segment(id: &str) -> Segment {
    Segment::from_coordinates(
        id,
        format!("Stage {}", id),
        &[[147.30, -42.88], [147.32, -42.86], [147.35, -42.85]],
    )
}

fn local_photo(id: &str) -> Photo {
    Photo::local(
        id,
        format!("blob:http://localhost/{}", id),
        AssetFile::new(format!("{}.jpg", id), "image/jpeg", vec![0xff, 0xd8, 0xff]),
    )
}

fn setup() -> (Arc<RouteCoordinator>, Arc<RecordingBackend>, Arc<GatedUploader>) {
    init_logging();
    let backend = Arc::new(RecordingBackend::default());
    let uploader = Arc::new(GatedUploader::default());
    let coordinator = Arc::new(RouteCoordinator::new(backend.clone(), uploader.clone()));
    (coordinator, backend, uploader)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_new_route_with_local_photo() {
    let (coordinator, backend, uploader) = setup();
    coordinator.add_route(segment("r1"));
    coordinator.add_photo(local_photo("p1"));

    let result = coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    assert!(result.is_new_route);

    let payload = backend.last_payload();
    assert_eq!(payload["photos"][0]["isLocal"], false);
    assert_eq!(payload["photos"][0]["url"], "https://cdn.example/p1.jpg");
    for field in ["routes", "photos", "pois", "headerSettings"] {
        assert!(payload.get(field).is_some(), "missing {}", field);
    }
    assert_eq!(payload["name"], "Test");
    assert_eq!(payload["type"], "single");
    assert_eq!(payload["isPublic"], true);

    assert_eq!(
        coordinator.current_loaded_persistent_id().as_deref(),
        Some(result.persistent_id.as_str())
    );
    assert!(!coordinator.document().photos[0].is_local);
    assert_eq!(coordinator.saved_routes().len(), 1);
    assert_eq!(coordinator.state(), SessionState::Editing);
}

#[tokio::test]
async fn test_edit_during_upload_reaches_payload() {
    let (coordinator, backend, uploader) = setup();
    coordinator.add_route(segment("r1"));
    coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();
    assert!(!coordinator.has_unsaved_changes());

    // Geometry edit, then a header edit while the save waits on its upload
    coordinator
        .update_route(
            "r1",
            SegmentPatch {
                color: Some("#ff0000".to_string()),
                ..SegmentPatch::default()
            },
        )
        .unwrap();
    coordinator.add_photo(local_photo("p2"));
    uploader.gated.store(true, Ordering::SeqCst);

    let saver = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
                .await
        })
    };

    uploader.started.notified().await;
    assert!(coordinator.is_saving());
    coordinator.update_header_settings(HeaderSettingsPatch {
        color: Some("#123456".to_string()),
        ..HeaderSettingsPatch::default()
    });
    uploader.release.notify_one();

    let result = saver.await.unwrap().unwrap();
    assert!(!result.is_new_route);

    let payload = backend.last_payload();
    assert!(payload.get("routes").is_some());
    assert_eq!(payload["headerSettings"]["color"], "#123456");
    assert_eq!(payload["photoChangeType"], "added");
    assert!(!coordinator.has_unsaved_changes());
}

#[tokio::test]
async fn test_successful_save_empties_change_set() {
    let (coordinator, _, _) = setup();
    coordinator.add_route(segment("r1"));
    coordinator.update_overall_route_name("Renamed");

    coordinator
        .save_current_state("Renamed", RouteType::Tourism, false, Vec::new(), None)
        .await
        .unwrap();

    let tracker = coordinator.change_tracker();
    assert!(tracker.snapshot().is_empty());
    tracker.reset();
    tracker.reset();
    assert!(tracker.snapshot().is_empty());
}

#[tokio::test]
async fn test_description_only_save_omits_routes() {
    let (coordinator, backend, _) = setup();
    coordinator.add_route(segment("r1"));
    coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();

    coordinator
        .update_route("r1", SegmentPatch::description("Coastal gravel"))
        .unwrap();
    coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();

    let payload = backend.last_payload();
    assert!(payload.get("routes").is_none());
    assert!(payload.get("routeSummary").is_some());
    assert_eq!(
        payload["description"]["segments"][0]["description"],
        "Coastal gravel"
    );
}

#[tokio::test]
async fn test_auth_failure_raises_alert_and_keeps_changes() {
    let (coordinator, backend, _) = setup();
    coordinator.add_route(segment("r1"));
    backend.reject_auth.store(true, Ordering::SeqCst);

    let err = coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(err.is_auth_error());
    assert!(coordinator.needs_authentication());
    assert!(coordinator
        .change_tracker()
        .has_changed(SectionName::Routes));

    let err = coordinator.list_routes(None).await.unwrap_err();
    assert_eq!(err, CoordinatorError::AuthenticationRequired);

    backend.reject_auth.store(false, Ordering::SeqCst);
    coordinator.dismiss_auth_alert();
    coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();
    assert!(!coordinator.has_unsaved_changes());
}

#[tokio::test]
async fn test_delete_route_cleans_its_map_artifacts() {
    init_logging();
    let map = Arc::new(FakeMap::with_route_layers(&["r1", "r2"]));
    let overlays = Arc::new(LabelOverlays::default());
    let coordinator = RouteCoordinator::new(
        Arc::new(RecordingBackend::default()),
        Arc::new(GatedUploader::default()),
    )
    .with_map_engine(map.clone())
    .with_overlay_registry(overlays.clone());

    coordinator.add_route(segment("r1"));
    coordinator.add_route(segment("r2"));
    coordinator.delete_route("r1").await.unwrap();

    assert_eq!(
        map.layer_ids(),
        vec!["road-label", "r2-main-line", "r2-main-border"]
    );
    assert_eq!(overlays.removed.lock().unwrap().as_slice(), ["r1"]);
    assert_eq!(coordinator.routes().len(), 1);
    assert!(matches!(
        coordinator.delete_route("r1").await,
        Err(CoordinatorError::RouteNotFound { .. })
    ));
}

#[tokio::test]
async fn test_clear_current_work_tears_everything_down() {
    init_logging();
    let map = Arc::new(FakeMap::with_route_layers(&["r1"]));
    let overlays = Arc::new(LabelOverlays::default());
    let counter = Arc::new(ClearCounter::default());
    let coordinator = RouteCoordinator::new(
        Arc::new(RecordingBackend::default()),
        Arc::new(GatedUploader::default()),
    )
    .with_map_engine(map.clone())
    .with_overlay_registry(overlays.clone())
    .with_stores(WorkspaceStores {
        photos: Some(counter.clone()),
        pois: Some(counter.clone()),
        lines: Some(counter.clone()),
        climb_markers: None,
    });

    coordinator.add_route(segment("r1"));
    coordinator.add_photo(local_photo("p1"));
    coordinator.clear_current_work().await;

    assert_eq!(coordinator.state(), SessionState::Empty);
    assert!(coordinator.routes().is_empty());
    assert!(coordinator.document().photos.is_empty());
    assert!(!coordinator.has_unsaved_changes());
    assert_eq!(map.layer_ids(), vec!["road-label"]);
    assert_eq!(map.styles_set.lock().unwrap().as_slice(), ["outdoors"]);
    assert_eq!(overlays.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(counter.cleared.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_load_defers_camera_until_map_ready() {
    init_logging();
    let backend = Arc::new(RecordingBackend::default());
    let map = Arc::new(FakeMap::default());
    let coordinator = RouteCoordinator::new(backend.clone(), Arc::new(GatedUploader::default()))
        .with_map_engine(map.clone());

    let mut saved = RouteDocument::new("Saved ride");
    saved.persistent_id = Some("route-7".to_string());
    saved.routes.push(segment("a"));
    saved.routes.push(segment("b"));
    backend.documents.lock().unwrap().push(saved);

    coordinator.add_route(segment("scratch"));
    coordinator.load_route("route-7").await.unwrap();

    assert_eq!(coordinator.state(), SessionState::Editing);
    assert_eq!(coordinator.routes().len(), 2);
    assert_eq!(coordinator.current_route().unwrap().route_id, "a");
    assert_eq!(coordinator.document().name, "Saved ride");
    assert!(!coordinator.has_unsaved_changes());
    assert!(map.fitted.lock().unwrap().is_empty());

    let pending = coordinator.pending_route_bounds().unwrap();
    assert_eq!(coordinator.notify_map_ready(), Some(pending));
    assert_eq!(map.fitted.lock().unwrap().as_slice(), [pending]);

    // Once ready, later loads fit immediately
    coordinator.load_route("route-7").await.unwrap();
    assert_eq!(map.fitted.lock().unwrap().len(), 2);
    assert!(coordinator.take_pending_route_bounds().is_none());
}

#[tokio::test]
async fn test_delete_saved_route_updates_index() {
    let (coordinator, _, _) = setup();
    coordinator.add_route(segment("r1"));
    let saved = coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(coordinator.saved_routes().len(), 1);

    coordinator
        .delete_saved_route(&saved.persistent_id)
        .await
        .unwrap();
    assert!(coordinator.saved_routes().is_empty());
}

#[tokio::test]
async fn test_clear_during_backend_call_leaves_workspace_empty() {
    let (coordinator, backend, _) = setup();
    coordinator.add_route(segment("r1"));
    backend.gated.store(true, Ordering::SeqCst);

    let saver = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .save_current_state("Old", RouteType::Single, true, Vec::new(), None)
                .await
        })
    };

    backend.started.notified().await;
    coordinator.clear_current_work().await;
    backend.release.notify_one();

    let old = saver.await.unwrap().unwrap();
    assert_eq!(old.persistent_id, "route-1");

    assert_eq!(coordinator.state(), SessionState::Empty);
    assert!(coordinator.routes().is_empty());
    assert!(coordinator.current_loaded_persistent_id().is_none());
    assert!(coordinator.loaded_state().is_none());

    // The next draft is a new route, not a partial update of the old one
    backend.gated.store(false, Ordering::SeqCst);
    coordinator.add_route(segment("r2"));
    let next = coordinator
        .save_current_state("New", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();
    assert!(next.is_new_route);
    assert_ne!(next.persistent_id, old.persistent_id);
    let payload = backend.last_payload();
    assert!(payload.get("persistentId").is_none());
    assert_eq!(payload["name"], "New");
}

#[tokio::test]
async fn test_load_during_backend_call_keeps_loaded_route() {
    let (coordinator, backend, _) = setup();
    let mut stored = RouteDocument::new("Stored ride");
    stored.persistent_id = Some("route-9".to_string());
    stored.routes.push(segment("a"));
    backend.documents.lock().unwrap().push(stored);

    coordinator.add_route(segment("draft"));
    backend.gated.store(true, Ordering::SeqCst);
    let saver = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .save_current_state("Draft", RouteType::Single, false, Vec::new(), None)
                .await
        })
    };

    backend.started.notified().await;
    coordinator.load_route("route-9").await.unwrap();
    backend.release.notify_one();
    saver.await.unwrap().unwrap();

    assert_eq!(coordinator.state(), SessionState::Editing);
    assert_eq!(
        coordinator.current_loaded_persistent_id().as_deref(),
        Some("route-9")
    );
    assert_eq!(coordinator.document().name, "Stored ride");
    assert_eq!(coordinator.loaded_state().unwrap().name, "Stored ride");
    assert_eq!(coordinator.routes()[0].route_id, "a");
}

#[tokio::test]
async fn test_same_section_edit_during_backend_call_stays_unsaved() {
    let (coordinator, backend, _) = setup();
    coordinator.add_route(segment("r1"));
    coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();

    let recolor = |color: &str| SegmentPatch {
        color: Some(color.to_string()),
        ..SegmentPatch::default()
    };
    coordinator.update_route("r1", recolor("#111111")).unwrap();
    backend.gated.store(true, Ordering::SeqCst);
    let saver = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
                .await
        })
    };

    backend.started.notified().await;
    coordinator.update_route("r1", recolor("#222222")).unwrap();
    backend.release.notify_one();
    saver.await.unwrap().unwrap();

    assert_eq!(backend.last_payload()["routes"][0]["color"], "#111111");
    assert!(coordinator.has_unsaved_changes());
    assert!(coordinator
        .change_tracker()
        .has_changed(SectionName::Routes));

    backend.gated.store(false, Ordering::SeqCst);
    coordinator
        .save_current_state("Test", RouteType::Single, true, Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(backend.last_payload()["routes"][0]["color"], "#222222");
    assert!(!coordinator.has_unsaved_changes());
}
