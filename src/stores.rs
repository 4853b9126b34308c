//! Sibling stores that hold view state derived from the route document.
//!
//! The coordinator owns photos, POIs and lines; these stores only mirror them
//! for their own views. Every store is optional: a host that has no POI view
//! simply does not inject one.

use std::sync::Arc;

use log::debug;

use crate::{LineMarker, Photo, PoiCollection, RouteDocument};

pub trait PhotoStore: Send + Sync {
    fn clear(&self);
    fn load(&self, _photos: &[Photo]) {}
}

pub trait PoiStore: Send + Sync {
    fn clear(&self);
    fn load(&self, _pois: &PoiCollection) {}
}

pub trait LineStore: Send + Sync {
    fn clear(&self);
    fn load(&self, _lines: &[LineMarker]) {}
}

/// Climb flags are derived from elevation and never persisted.
pub trait ClimbMarkerStore: Send + Sync {
    fn clear(&self);
}

/// The set of sibling stores attached to a coordinator.
#[derive(Clone, Default)]
pub struct WorkspaceStores {
    pub photos: Option<Arc<dyn PhotoStore>>,
    pub pois: Option<Arc<dyn PoiStore>>,
    pub lines: Option<Arc<dyn LineStore>>,
    pub climb_markers: Option<Arc<dyn ClimbMarkerStore>>,
}

impl WorkspaceStores {
    /// Clear every attached store. Returns how many were cleared.
    pub fn clear_all(&self) -> usize {
        let mut cleared = 0;
        if let Some(store) = &self.photos {
            store.clear();
            cleared += 1;
        }
        if let Some(store) = &self.pois {
            store.clear();
            cleared += 1;
        }
        if let Some(store) = &self.lines {
            store.clear();
            cleared += 1;
        }
        if let Some(store) = &self.climb_markers {
            store.clear();
            cleared += 1;
        }
        debug!("[WorkspaceStores] Cleared {} stores", cleared);
        cleared
    }

    /// Push a freshly loaded document into the attached stores.
    pub fn load_from(&self, route: &RouteDocument) {
        if let Some(store) = &self.photos {
            store.load(&route.photos);
        }
        if let Some(store) = &self.pois {
            store.load(&route.pois);
        }
        if let Some(store) = &self.lines {
            store.load(&route.lines);
        }
    }
}
