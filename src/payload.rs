//! Partial update assembly.
//!
//! Turns the session document plus its [`ChangeSet`] into the document that
//! is sent to the backend: identity fields, a fresh route summary, the photo
//! and POI arrays in full, and only the sections that changed. A route that
//! has never been saved gets everything.

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::changes::{ChangeSet, SectionName};
use crate::summary::compute_route_summary;
use crate::{RouteDocument, Segment};

/// Payload keys that identify the document rather than carry edits.
pub const IDENTITY_FIELDS: [&str; 5] = ["persistentId", "name", "type", "isPublic", "eventDate"];

/// Derived on every save; not an edit and not counted as one.
pub const SUMMARY_FIELD: &str = "routeSummary";

/// Configuration for payload assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadConfig {
    /// Decimal places kept for unpaved-section coordinates.
    /// Default: 5 (~1 meter)
    pub coordinate_precision: u32,

    /// Drop `routes` from existing-route payloads that carry few other
    /// fields. This is a size heuristic that can discard a genuine small
    /// geometry edit, so it is off unless explicitly enabled. Setting it to
    /// true restores the original save behaviour, which always applied it.
    /// Default: false
    pub small_payload_route_drop: bool,

    /// Maximum number of non-identity fields for the heuristic above.
    /// Default: 3
    pub small_payload_threshold: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            coordinate_precision: 5,
            small_payload_route_drop: false,
            small_payload_threshold: 3,
        }
    }
}

/// JSON document sent to the route backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct PartialUpdate {
    fields: Map<String, Value>,
}

impl PartialUpdate {
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    /// Fields that are neither identity nor the derived summary.
    pub fn edit_field_names(&self) -> Vec<&str> {
        self.fields
            .keys()
            .map(String::as_str)
            .filter(|k| !IDENTITY_FIELDS.contains(k) && *k != SUMMARY_FIELD)
            .collect()
    }

    pub fn persistent_id(&self) -> Option<&str> {
        self.fields.get("persistentId").and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    fn insert<T: Serialize + ?Sized>(&mut self, field: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.fields.insert(field.to_string(), v);
            }
            // Never send a placeholder over real server data
            Err(e) => warn!("[PayloadAssembler] Skipping '{}': {}", field, e),
        }
    }
}

impl From<PartialUpdate> for Value {
    fn from(update: PartialUpdate) -> Self {
        update.into_value()
    }
}

/// Builds partial or full update documents.
#[derive(Debug, Clone, Default)]
pub struct PayloadAssembler {
    config: PayloadConfig,
}

impl PayloadAssembler {
    pub fn new(config: PayloadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PayloadConfig {
        &self.config
    }

    /// Assemble the payload for `route`. Pure data shaping; never fails.
    pub fn assemble(
        &self,
        route: &RouteDocument,
        changes: &ChangeSet,
        is_new_route: bool,
    ) -> PartialUpdate {
        let mut payload = PartialUpdate::default();
        let include = |section: SectionName| is_new_route || changes.contains(section);

        // Identity
        if let Some(id) = &route.persistent_id {
            payload.insert("persistentId", id);
        }
        payload.insert("name", &route.name);
        payload.insert("type", &route.route_type);
        payload.insert("isPublic", &route.is_public);
        payload.insert("eventDate", &route.event_date);
        payload.insert(SUMMARY_FIELD, &compute_route_summary(&route.routes));

        // Always sent in full so deletions shrink the stored arrays
        payload.insert("photos", &route.photos);
        payload.insert("pois", &route.pois);

        if include(SectionName::MapState) {
            payload.insert("mapState", &route.map_state);
        }
        if include(SectionName::Routes) {
            let rounded = self.rounded_routes(&route.routes);
            payload.insert("routes", &rounded);
        }
        if include(SectionName::HeaderSettings) {
            payload.insert("headerSettings", &route.header_settings);
        }
        if include(SectionName::MapOverview) {
            payload.insert("mapOverview", &route.map_overview);
        }
        if include(SectionName::Description) {
            payload.insert("description", &description_payload(route));
        }
        if include(SectionName::Metadata) {
            payload.insert("metadata", &metadata_payload(&route.routes));
        }
        if include(SectionName::Lines) {
            payload.insert("lines", &route.lines);
        }
        if changes.contains(SectionName::PhotoChangeType) {
            if let Some(kind) = changes.photo_change() {
                payload.insert("photoChangeType", &kind);
            }
        }

        if !is_new_route {
            if changes.only(SectionName::MapOverview) && payload.remove("routes").is_some() {
                debug!("[PayloadAssembler] Map overview only edit, dropping routes");
            }
            self.apply_small_payload_heuristic(&mut payload);
        }

        debug!(
            "[PayloadAssembler] Assembled {} payload with fields {:?}",
            if is_new_route { "full" } else { "partial" },
            payload.field_names()
        );

        payload
    }

    fn apply_small_payload_heuristic(&self, payload: &mut PartialUpdate) {
        if !self.config.small_payload_route_drop || !payload.contains("routes") {
            return;
        }
        let edit_fields = payload.edit_field_names().len();
        if edit_fields <= self.config.small_payload_threshold {
            warn!(
                "[PayloadAssembler] Dropping routes from small payload ({} edit fields)",
                edit_fields
            );
            payload.remove("routes");
        }
    }

    fn rounded_routes(&self, routes: &[Segment]) -> Vec<Segment> {
        let factor = 10f64.powi(self.config.coordinate_precision as i32);
        let round = |v: f64| (v * factor).round() / factor;

        routes
            .iter()
            .map(|segment| {
                let mut segment = segment.clone();
                for section in &mut segment.unpaved_sections {
                    for coord in &mut section.coordinates {
                        *coord = [round(coord[0]), round(coord[1])];
                    }
                }
                segment
            })
            .collect()
    }
}

fn description_payload(route: &RouteDocument) -> Value {
    let segments: Vec<Value> = route
        .routes
        .iter()
        .filter_map(|s| {
            s.description
                .as_ref()
                .map(|d| json!({ "routeId": s.route_id, "description": d }))
        })
        .collect();
    json!({ "route": route.description, "segments": segments })
}

fn metadata_payload(routes: &[Segment]) -> Value {
    Value::Array(
        routes
            .iter()
            .filter_map(|s| {
                s.metadata
                    .as_ref()
                    .map(|m| json!({ "routeId": s.route_id, "metadata": m }))
            })
            .collect(),
    )
}
