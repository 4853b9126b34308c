//! Contract of the route backend.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::payload::PartialUpdate;
use crate::{RouteDocument, RouteType};

/// Response to a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub persistent_id: String,
}

/// Entry of the saved-routes index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedRouteSummary {
    #[serde(alias = "persistentId")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub route_type: RouteType,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_viewed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Filters for the saved-routes index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFilters {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub route_type: Option<RouteType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    /// Case-insensitive substring of the route name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl RouteFilters {
    pub fn by_type(route_type: RouteType) -> Self {
        Self {
            route_type: Some(route_type),
            ..Self::default()
        }
    }

    pub fn matches(&self, route: &SavedRouteSummary) -> bool {
        if self.route_type.is_some_and(|t| t != route.route_type) {
            return false;
        }
        if self.is_public.is_some_and(|p| p != route.is_public) {
            return false;
        }
        match &self.search {
            Some(term) if !term.is_empty() => route
                .name
                .to_lowercase()
                .contains(&term.to_lowercase()),
            _ => true,
        }
    }

    /// Query string pairs for the REST API.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(t) = self.route_type {
            pairs.push(("type", t.as_str().to_string()));
        }
        if let Some(p) = self.is_public {
            pairs.push(("isPublic", p.to_string()));
        }
        if let Some(s) = &self.search {
            pairs.push(("search", s.clone()));
        }
        pairs
    }
}

/// Route backend: REST in production, SQLite for local drafts, fakes in tests.
pub trait RouteService: Send + Sync {
    /// Create or update a route. A payload without `persistentId` creates one.
    fn save_route(&self, payload: PartialUpdate) -> BoxFuture<'_, Result<SaveResponse>>;

    fn load_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<RouteDocument>>;

    fn list_routes(
        &self,
        filters: Option<RouteFilters>,
    ) -> BoxFuture<'_, Result<Vec<SavedRouteSummary>>>;

    fn delete_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<()>>;
}
