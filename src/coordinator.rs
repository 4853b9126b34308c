//! Route Coordinator
//!
//! Owns the single in-memory editing session: the route document being
//! edited, its change set, the saved-routes index and the deferred camera
//! position. All operations take `&self`; the session lock is never held
//! across an `.await`, so edits can land while a save is waiting on uploads.
//!
//! ## Save flow
//!
//! 1. Capture name/type/visibility/lines into the session.
//! 2. Upload local photos and the logo (per-asset failures are logged).
//! 3. Read the change set and document *after* the uploads.
//! 4. Assemble the partial update and send it.
//! 5. On success acknowledge the sent sections and refresh the index.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use crate::assets::{AssetUploadService, AssetUploader, LogoUpload};
use crate::changes::{ChangeSet, ChangeTracker, PhotoChangeKind, SectionName};
use crate::cleanup::{CleanupConfig, MapCleanupCoordinator, MapEngine, OverlayRegistry};
use crate::error::{CoordinatorError, OptionExt, Result};
use crate::payload::{PartialUpdate, PayloadAssembler, PayloadConfig};
use crate::service::{RouteFilters, RouteService, SavedRouteSummary};
use crate::stores::WorkspaceStores;
use crate::{
    Bounds, HeaderSettings, HeaderSettingsPatch, LineMarker, MapOverview, MapState, Photo,
    PoiCollection, RouteDocument, RouteType, Segment, SegmentPatch,
};

// ============================================================================
// Configuration & Results
// ============================================================================

/// Configuration for the route coordinator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoordinatorConfig {
    /// Payload assembly options.
    pub payload: PayloadConfig,
    /// Map cleanup timing and naming options.
    pub cleanup: CleanupConfig,
}

/// Lifecycle of the editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Empty,
    Editing,
    Saving,
    Loading,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveResult {
    pub persistent_id: String,
    pub is_new_route: bool,
    /// The document that was sent
    pub payload: PartialUpdate,
}

#[derive(Debug, Default)]
struct Session {
    state: SessionState,
    document: RouteDocument,
    current_route_id: Option<String>,
    saved_routes: Vec<SavedRouteSummary>,
    loaded_state: Option<RouteDocument>,
    pending_bounds: Option<Bounds>,
    map_ready: bool,
    needs_auth: bool,
    /// Bumped whenever the workspace is replaced; a save that started in an
    /// older epoch must not write back into the new one.
    epoch: u64,
}

impl Session {
    fn begin_editing(&mut self) {
        if self.state == SessionState::Empty {
            self.state = SessionState::Editing;
        }
    }

    fn segment_mut(&mut self, route_id: &str) -> Result<&mut Segment> {
        self.document
            .routes
            .iter_mut()
            .find(|s| s.route_id == route_id)
            .ok_or_route_not_found(route_id)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Save/load coordinator for one editing session.
pub struct RouteCoordinator {
    session: Mutex<Session>,
    changes: ChangeTracker,
    service: Arc<dyn RouteService>,
    uploader: AssetUploader,
    assembler: PayloadAssembler,
    engine: Option<Arc<dyn MapEngine>>,
    overlays: Vec<Arc<dyn OverlayRegistry>>,
    cleanup: Option<MapCleanupCoordinator>,
    stores: WorkspaceStores,
    config: CoordinatorConfig,
}

impl RouteCoordinator {
    pub fn new(service: Arc<dyn RouteService>, assets: Arc<dyn AssetUploadService>) -> Self {
        Self::with_config(service, assets, CoordinatorConfig::default())
    }

    pub fn with_config(
        service: Arc<dyn RouteService>,
        assets: Arc<dyn AssetUploadService>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            session: Mutex::new(Session::default()),
            changes: ChangeTracker::new(),
            service,
            uploader: AssetUploader::new(assets),
            assembler: PayloadAssembler::new(config.payload.clone()),
            engine: None,
            overlays: Vec::new(),
            cleanup: None,
            stores: WorkspaceStores::default(),
            config,
        }
    }

    /// Attach the rendering engine.
    pub fn with_map_engine(mut self, engine: Arc<dyn MapEngine>) -> Self {
        self.engine = Some(engine);
        self.rebuild_cleanup();
        self
    }

    /// Register an owner of overlays drawn outside the engine.
    pub fn with_overlay_registry(mut self, registry: Arc<dyn OverlayRegistry>) -> Self {
        self.overlays.push(registry);
        self.rebuild_cleanup();
        self
    }

    /// Attach sibling stores cleared on teardown.
    pub fn with_stores(mut self, stores: WorkspaceStores) -> Self {
        self.stores = stores;
        self
    }

    fn rebuild_cleanup(&mut self) {
        self.cleanup = self.engine.as_ref().map(|engine| {
            MapCleanupCoordinator::with_config(
                engine.clone(),
                self.overlays.clone(),
                self.config.cleanup.clone(),
            )
        });
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_error(&self, e: &CoordinatorError) {
        if e.is_auth_error() {
            warn!("[RouteCoordinator] Authentication required, raising sign-in alert");
            self.session().needs_auth = true;
        }
    }

    // ========================================================================
    // Segment editing
    // ========================================================================

    /// Add a segment, replacing any segment with the same id, and make it
    /// the current one.
    pub fn add_route(&self, segment: Segment) {
        let mut session = self.session();
        debug!(
            "[RouteCoordinator] Adding route {} ({} existing)",
            segment.route_id,
            session.document.routes.len()
        );
        session
            .document
            .routes
            .retain(|s| s.route_id != segment.route_id);
        session.current_route_id = Some(segment.route_id.clone());
        session.document.routes.push(segment);
        session.begin_editing();
        self.changes.mark_changed(SectionName::Routes);
    }

    /// Remove a segment and everything it drew on the map.
    pub async fn delete_route(&self, route_id: &str) -> Result<()> {
        {
            let mut session = self.session();
            let before = session.document.routes.len();
            session.document.routes.retain(|s| s.route_id != route_id);
            if session.document.routes.len() == before {
                return Err(CoordinatorError::RouteNotFound {
                    route_id: route_id.to_string(),
                });
            }
            if session.current_route_id.as_deref() == Some(route_id) {
                session.current_route_id = None;
            }
            self.changes.mark_changed(SectionName::Routes);
        }
        info!("[RouteCoordinator] Deleted route {}", route_id);

        match &self.cleanup {
            Some(cleanup) => {
                cleanup.remove_route_artifacts(route_id).await;
            }
            None => {
                for registry in &self.overlays {
                    registry.remove_route(route_id);
                }
            }
        }
        Ok(())
    }

    /// Apply a field patch to one segment.
    pub fn update_route(&self, route_id: &str, patch: SegmentPatch) -> Result<()> {
        let section = patch.change_section();
        let mut session = self.session();
        let segment = session.segment_mut(route_id)?;
        if segment.apply(patch) {
            self.changes.mark_changed(section);
        }
        Ok(())
    }

    /// Move the segment at `from` to position `to`.
    pub fn reorder_routes(&self, from: usize, to: usize) -> Result<()> {
        let mut session = self.session();
        let routes = &mut session.document.routes;
        if from >= routes.len() || to >= routes.len() {
            return Err(CoordinatorError::Internal {
                message: format!(
                    "Cannot move route {} to {} in a list of {}",
                    from,
                    to,
                    routes.len()
                ),
            });
        }
        if from != to {
            let segment = routes.remove(from);
            routes.insert(to, segment);
            self.changes.mark_changed(SectionName::Routes);
        }
        Ok(())
    }

    /// Focus one segment, unfocusing all others.
    pub fn focus_route(&self, route_id: &str) {
        for segment in self.session().document.routes.iter_mut() {
            segment.is_focused = segment.route_id == route_id;
        }
    }

    pub fn unfocus_route(&self, route_id: &str) {
        for segment in self.session().document.routes.iter_mut() {
            if segment.route_id == route_id {
                segment.is_focused = false;
            }
        }
    }

    pub fn set_current_route(&self, route_id: Option<&str>) -> Result<()> {
        let mut session = self.session();
        if let Some(id) = route_id {
            if !session.document.routes.iter().any(|s| s.route_id == id) {
                return Err(CoordinatorError::RouteNotFound {
                    route_id: id.to_string(),
                });
            }
        }
        session.current_route_id = route_id.map(str::to_string);
        Ok(())
    }

    // ========================================================================
    // Document editing
    // ========================================================================

    pub fn update_header_settings(&self, patch: HeaderSettingsPatch) {
        self.session().document.header_settings.apply(patch);
        self.changes.mark_changed(SectionName::HeaderSettings);
    }

    pub fn update_overall_route_name(&self, name: impl Into<String>) {
        self.session().document.name = name.into();
        self.changes.mark_changed(SectionName::OverallName);
    }

    pub fn update_map_state(&self, map_state: MapState) {
        self.session().document.map_state = map_state;
        self.changes.mark_changed(SectionName::MapState);
    }

    /// Set the route-level description.
    pub fn update_description(&self, description: Option<String>) {
        self.session().document.description = description;
        self.changes.mark_changed(SectionName::Description);
    }

    pub fn update_map_overview(&self, overview: MapOverview) {
        self.session().document.map_overview = Some(overview);
        self.changes.mark_changed(SectionName::MapOverview);
    }

    pub fn set_photos(&self, photos: Vec<Photo>, kind: PhotoChangeKind) {
        self.session().document.photos = photos;
        self.changes.mark_photos_changed(kind);
    }

    pub fn add_photo(&self, photo: Photo) {
        self.session().document.photos.push(photo);
        self.changes.mark_photos_changed(PhotoChangeKind::Added);
    }

    /// Remove a photo by id. Returns false if no such photo exists.
    pub fn remove_photo(&self, photo_id: &str) -> bool {
        let mut session = self.session();
        let before = session.document.photos.len();
        session.document.photos.retain(|p| p.id != photo_id);
        let removed = session.document.photos.len() != before;
        if removed {
            self.changes.mark_photos_changed(PhotoChangeKind::Deleted);
        }
        removed
    }

    pub fn set_pois(&self, pois: PoiCollection) {
        self.session().document.pois = pois;
        self.changes.mark_changed(SectionName::Pois);
    }

    pub fn set_lines(&self, lines: Vec<LineMarker>) {
        self.session().document.lines = lines;
        self.changes.mark_changed(SectionName::Lines);
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Persist the session. Creates the route on first save.
    pub async fn save_current_state(
        &self,
        name: &str,
        route_type: RouteType,
        is_public: bool,
        lines: Vec<LineMarker>,
        event_date: Option<String>,
    ) -> Result<SaveResult> {
        let (photos, header, epoch) = {
            let mut session = self.session();
            if session.document.routes.is_empty() {
                return Err(CoordinatorError::NoRouteData);
            }
            session.state = SessionState::Saving;
            let epoch = session.epoch;

            let doc = &mut session.document;
            if doc.name != name
                || doc.route_type != route_type
                || doc.is_public != is_public
                || doc.event_date != event_date
            {
                doc.name = name.to_string();
                doc.route_type = route_type;
                doc.is_public = is_public;
                doc.event_date = event_date;
                self.changes.mark_changed(SectionName::OverallName);
            }
            if doc.lines != lines {
                doc.lines = lines;
                self.changes.mark_changed(SectionName::Lines);
            }
            (doc.photos.clone(), doc.header_settings.clone(), epoch)
        };
        info!(
            "[RouteCoordinator] Saving '{}' ({}, public: {})",
            name,
            route_type.as_str(),
            is_public
        );

        let uploaded = self.uploader.upload_pending_photos(photos).await;
        let logo = if header.has_pending_logo() {
            Some(self.uploader.upload_logo(&header).await)
        } else {
            None
        };

        // Edits may have landed during the uploads; read everything fresh
        let (payload, sent, is_new_route, document) = {
            let mut session = self.session();
            if session.epoch != epoch {
                warn!("[RouteCoordinator] Workspace replaced during upload, abandoning save");
                return Err(CoordinatorError::Internal {
                    message: "Workspace was replaced while the save was uploading assets"
                        .to_string(),
                });
            }
            let promoted = merge_uploaded_photos(&mut session.document.photos, &uploaded);
            if promoted > 0 {
                debug!("[RouteCoordinator] Promoted {} photos to remote URLs", promoted);
            }
            if let Some(logo) = logo {
                self.apply_logo(&mut session.document.header_settings, &header, logo);
            }
            let map_state = self.capture_map_state(&session.document.map_state);
            session.document.map_state = map_state;

            let sent = self.changes.snapshot();
            let is_new_route = session.document.is_new();
            let payload = self.assembler.assemble(&session.document, &sent, is_new_route);
            (payload, sent, is_new_route, session.document.clone())
        };

        match self.service.save_route(payload.clone()).await {
            Ok(response) => {
                let persistent_id =
                    self.finish_save(&response.persistent_id, &sent, document, epoch);
                info!(
                    "[RouteCoordinator] Saved {} route {}",
                    if is_new_route { "new" } else { "existing" },
                    persistent_id
                );
                if let Err(e) = self.list_routes(None).await {
                    warn!("[RouteCoordinator] Saved, but refreshing the index failed: {}", e);
                }
                Ok(SaveResult {
                    persistent_id,
                    is_new_route,
                    payload,
                })
            }
            Err(e) => {
                error!("[RouteCoordinator] Save failed: {}", e);
                {
                    let mut session = self.session();
                    if session.epoch == epoch {
                        session.state = SessionState::Editing;
                    }
                }
                self.note_error(&e);
                Err(e)
            }
        }
    }

    fn finish_save(
        &self,
        returned_id: &str,
        sent: &ChangeSet,
        mut document: RouteDocument,
        epoch: u64,
    ) -> String {
        let mut session = self.session();
        if session.epoch != epoch {
            // The workspace was cleared or another route loaded meanwhile
            debug!(
                "[RouteCoordinator] Save of {} finished after the workspace was replaced",
                returned_id
            );
            return document
                .persistent_id
                .unwrap_or_else(|| returned_id.to_string());
        }
        let persistent_id = session
            .document
            .persistent_id
            .get_or_insert_with(|| returned_id.to_string())
            .clone();
        document.persistent_id = Some(persistent_id.clone());
        session.loaded_state = Some(document);
        session.state = SessionState::Editing;
        self.changes.acknowledge(sent);
        persistent_id
    }

    fn apply_logo(&self, current: &mut HeaderSettings, captured: &HeaderSettings, logo: LogoUpload) {
        // A logo swapped during the upload wins over the uploaded one
        if current.logo_url != captured.logo_url {
            debug!("[RouteCoordinator] Logo changed during upload, keeping the newer one");
            return;
        }
        let changed = current.logo_url != logo.url || current.logo_public_id != logo.public_id;
        logo.apply_to(current);
        if changed {
            self.changes.mark_changed(SectionName::HeaderSettings);
        }
    }

    fn capture_map_state(&self, current: &MapState) -> MapState {
        match &self.engine {
            Some(engine) => {
                let style = engine
                    .style()
                    .and_then(|s| s.name)
                    .unwrap_or_else(|| current.style.clone());
                MapState::from_camera(engine.camera(), style)
            }
            None => current.clone(),
        }
    }

    // ========================================================================
    // Load / index
    // ========================================================================

    /// Replace the session with a saved route. Unsaved work is discarded.
    pub async fn load_route(&self, persistent_id: &str) -> Result<()> {
        if self.has_unsaved_changes() {
            warn!("[RouteCoordinator] Unsaved changes will be lost");
        }
        self.clear_current_work().await;
        self.session().state = SessionState::Loading;
        info!("[RouteCoordinator] Loading route {}", persistent_id);

        let mut document = match self.service.load_route(persistent_id).await {
            Ok(document) => document,
            Err(e) => {
                error!("[RouteCoordinator] Failed to load route {}: {}", persistent_id, e);
                self.session().state = SessionState::Empty;
                self.note_error(&e);
                return Err(e);
            }
        };
        if document.persistent_id.is_none() {
            document.persistent_id = Some(persistent_id.to_string());
        }

        let bounds = Bounds::from_segments(&document.routes);
        let drain = {
            let mut session = self.session();
            session.current_route_id = document.routes.first().map(|s| s.route_id.clone());
            session.loaded_state = Some(document.clone());
            session.document = document.clone();
            session.pending_bounds = bounds;
            session.state = SessionState::Editing;
            session.map_ready
        };
        self.changes.reset();
        self.stores.load_from(&document);

        debug!(
            "[RouteCoordinator] Loaded {} segments, {} photos",
            document.routes.len(),
            document.photos.len()
        );
        if drain {
            self.notify_map_ready();
        }
        Ok(())
    }

    /// Refresh the saved-routes index.
    pub async fn list_routes(&self, filters: Option<RouteFilters>) -> Result<Vec<SavedRouteSummary>> {
        match self.service.list_routes(filters).await {
            Ok(routes) => {
                debug!("[RouteCoordinator] Listed {} saved routes", routes.len());
                self.session().saved_routes = routes.clone();
                Ok(routes)
            }
            Err(e) => {
                error!("[RouteCoordinator] Failed to list routes: {}", e);
                self.note_error(&e);
                Err(e)
            }
        }
    }

    pub async fn delete_saved_route(&self, persistent_id: &str) -> Result<()> {
        match self.service.delete_route(persistent_id).await {
            Ok(()) => {
                info!("[RouteCoordinator] Deleted saved route {}", persistent_id);
                self.session()
                    .saved_routes
                    .retain(|r| r.id != persistent_id);
                Ok(())
            }
            Err(e) => {
                error!("[RouteCoordinator] Failed to delete route {}: {}", persistent_id, e);
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Tear down the workspace: session, map artifacts and sibling stores.
    pub async fn clear_current_work(&self) {
        {
            let mut session = self.session();
            let saved_routes = std::mem::take(&mut session.saved_routes);
            let map_ready = session.map_ready;
            let needs_auth = session.needs_auth;
            let epoch = session.epoch + 1;
            *session = Session {
                saved_routes,
                map_ready,
                needs_auth,
                epoch,
                ..Session::default()
            };
        }
        self.changes.reset();
        debug!("[RouteCoordinator] Clearing current work");

        match &self.cleanup {
            Some(cleanup) => {
                cleanup.clear_all().await;
            }
            None => {
                for registry in &self.overlays {
                    registry.clear();
                }
            }
        }
        self.stores.clear_all();
    }

    // ========================================================================
    // Map readiness
    // ========================================================================

    /// The engine is mounted: apply queued camera bounds.
    pub fn notify_map_ready(&self) -> Option<Bounds> {
        let bounds = {
            let mut session = self.session();
            session.map_ready = true;
            session.pending_bounds.take()
        };
        if let (Some(bounds), Some(engine)) = (&bounds, &self.engine) {
            debug!("[RouteCoordinator] Fitting camera to queued bounds");
            engine.fit_bounds(bounds);
        }
        bounds
    }

    pub fn take_pending_route_bounds(&self) -> Option<Bounds> {
        self.session().pending_bounds.take()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn routes(&self) -> Vec<Segment> {
        self.session().document.routes.clone()
    }

    pub fn current_route(&self) -> Option<Segment> {
        let session = self.session();
        let id = session.current_route_id.as_deref()?;
        session
            .document
            .routes
            .iter()
            .find(|s| s.route_id == id)
            .cloned()
    }

    /// Snapshot of the document being edited.
    pub fn document(&self) -> RouteDocument {
        self.session().document.clone()
    }

    pub fn saved_routes(&self) -> Vec<SavedRouteSummary> {
        self.session().saved_routes.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn current_loaded_persistent_id(&self) -> Option<String> {
        self.session().document.persistent_id.clone()
    }

    /// Last saved or loaded version of the document.
    pub fn loaded_state(&self) -> Option<RouteDocument> {
        self.session().loaded_state.clone()
    }

    pub fn pending_route_bounds(&self) -> Option<Bounds> {
        self.session().pending_bounds
    }

    pub fn header_settings(&self) -> HeaderSettings {
        self.session().document.header_settings.clone()
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    pub fn is_saving(&self) -> bool {
        self.state() == SessionState::Saving
    }

    pub fn is_loading(&self) -> bool {
        self.state() == SessionState::Loading
    }

    pub fn needs_authentication(&self) -> bool {
        self.session().needs_auth
    }

    pub fn dismiss_auth_alert(&self) {
        self.session().needs_auth = false;
    }

    /// Shared handle for editors that mark changes on their own.
    pub fn change_tracker(&self) -> ChangeTracker {
        self.changes.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}

/// Copy upload results onto photos that are still local. Photos removed or
/// replaced during the upload are left alone.
fn merge_uploaded_photos(photos: &mut [Photo], uploaded: &[Photo]) -> usize {
    let mut promoted = 0;
    for photo in photos.iter_mut().filter(|p| p.is_local) {
        let Some(remote) = uploaded.iter().find(|u| u.id == photo.id && !u.is_local) else {
            continue;
        };
        photo.url = remote.url.clone();
        photo.thumbnail_url = remote.thumbnail_url.clone();
        photo.medium_url = remote.medium_url.clone();
        photo.large_url = remote.large_url.clone();
        photo.public_id = remote.public_id.clone();
        photo.is_local = false;
        photo.original_file = None;
        photo.blobs = None;
        promoted += 1;
    }
    promoted
}
