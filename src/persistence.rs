//! # Local Route Store
//!
//! SQLite-backed [`RouteService`] for offline drafts and tests against a real
//! backend shape. Each route is one row: the index columns used by
//! `list_routes` plus the whole document as a MessagePack blob.
//!
//! Saves are merged the way the remote backend merges them: top-level fields
//! in the payload replace stored ones, while the `description` and `metadata`
//! envelopes are spread onto the matching segments.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::{CoordinatorError, Result};
use crate::payload::PartialUpdate;
use crate::service::{RouteFilters, RouteService, SaveResponse, SavedRouteSummary};
use crate::{RouteDocument, RouteType};

/// Prefix of ids minted by the local store.
pub const LOCAL_ID_PREFIX: &str = "local-";

// Payload fields that are instructions rather than document content
const TRANSIENT_FIELDS: [&str; 2] = ["persistentId", "photoChangeType"];

/// Route store on a local SQLite database.
pub struct LocalRouteStore {
    db: Mutex<Connection>,
}

impl LocalRouteStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                persistent_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                route_type TEXT NOT NULL DEFAULT 'single',
                is_public INTEGER NOT NULL DEFAULT 0,
                view_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                document BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_routes_type ON routes(route_type);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored routes.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM routes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn read_document(conn: &Connection, persistent_id: &str) -> Result<Option<Map<String, Value>>> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT document FROM routes WHERE persistent_id = ?",
                params![persistent_id],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            Some(bytes) => match rmp_serde::from_slice::<Value>(&bytes)? {
                Value::Object(map) => Ok(Some(map)),
                _ => Err(CoordinatorError::Serialization {
                    message: format!("Stored route {} is not an object", persistent_id),
                }),
            },
            None => Ok(None),
        }
    }

    fn save(&self, payload: PartialUpdate) -> Result<SaveResponse> {
        let conn = self.conn();
        let fields = payload.as_map();

        let (persistent_id, mut document, is_new) = match payload.persistent_id() {
            Some(id) => {
                let existing = Self::read_document(&conn, id)?.ok_or_else(|| {
                    CoordinatorError::RouteNotFound {
                        route_id: id.to_string(),
                    }
                })?;
                (id.to_string(), existing, false)
            }
            None => {
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(id), 0) + 1 FROM routes",
                    [],
                    |row| row.get(0),
                )?;
                (format!("{}{}", LOCAL_ID_PREFIX, next), Map::new(), true)
            }
        };

        merge_payload(&mut document, fields);
        document.insert("persistentId".to_string(), Value::String(persistent_id.clone()));

        let name = document.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
        let route_type = document
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(RouteType::default().as_str())
            .to_string();
        let is_public = document.get("isPublic").and_then(Value::as_bool).unwrap_or(false);
        let blob = rmp_serde::to_vec(&Value::Object(document))?;

        if is_new {
            conn.execute(
                "INSERT INTO routes (persistent_id, name, route_type, is_public, document)
                 VALUES (?, ?, ?, ?, ?)",
                params![persistent_id, name, route_type, is_public, blob],
            )?;
            info!("[LocalRouteStore] Created route {}", persistent_id);
        } else {
            conn.execute(
                "UPDATE routes
                 SET name = ?, route_type = ?, is_public = ?, document = ?,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
                 WHERE persistent_id = ?",
                params![name, route_type, is_public, blob, persistent_id],
            )?;
            debug!(
                "[LocalRouteStore] Updated route {} ({} fields)",
                persistent_id,
                fields.len()
            );
        }

        Ok(SaveResponse { persistent_id })
    }

    fn load(&self, persistent_id: &str) -> Result<RouteDocument> {
        let conn = self.conn();
        let document = Self::read_document(&conn, persistent_id)?.ok_or_else(|| {
            CoordinatorError::RouteNotFound {
                route_id: persistent_id.to_string(),
            }
        })?;
        conn.execute(
            "UPDATE routes SET view_count = view_count + 1 WHERE persistent_id = ?",
            params![persistent_id],
        )?;
        Ok(serde_json::from_value(Value::Object(document))?)
    }

    fn list(&self, filters: Option<RouteFilters>) -> Result<Vec<SavedRouteSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT persistent_id, name, route_type, is_public, view_count, created_at, updated_at
             FROM routes ORDER BY created_at DESC, id DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            let route_type: String = row.get(2)?;
            let view_count: i64 = row.get(4)?;
            Ok(SavedRouteSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                route_type: parse_route_type(&route_type),
                is_public: row.get(3)?,
                view_count: view_count.max(0) as u64,
                last_viewed: None,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;

        let filters = filters.unwrap_or_default();
        let mut routes = Vec::new();
        for row in rows {
            let summary = row?;
            if filters.matches(&summary) {
                routes.push(summary);
            }
        }
        Ok(routes)
    }

    fn delete(&self, persistent_id: &str) -> Result<()> {
        let deleted = self.conn().execute(
            "DELETE FROM routes WHERE persistent_id = ?",
            params![persistent_id],
        )?;
        if deleted == 0 {
            return Err(CoordinatorError::RouteNotFound {
                route_id: persistent_id.to_string(),
            });
        }
        info!("[LocalRouteStore] Deleted route {}", persistent_id);
        Ok(())
    }
}

impl RouteService for LocalRouteStore {
    fn save_route(&self, payload: PartialUpdate) -> BoxFuture<'_, Result<SaveResponse>> {
        Box::pin(async move { self.save(payload) })
    }

    fn load_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<RouteDocument>> {
        Box::pin(async move { self.load(persistent_id) })
    }

    fn list_routes(
        &self,
        filters: Option<RouteFilters>,
    ) -> BoxFuture<'_, Result<Vec<SavedRouteSummary>>> {
        Box::pin(async move { self.list(filters) })
    }

    fn delete_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.delete(persistent_id) })
    }
}

fn parse_route_type(value: &str) -> RouteType {
    serde_json::from_value(Value::String(value.to_string())).unwrap_or_default()
}

/// Merge a partial update into a stored document.
fn merge_payload(document: &mut Map<String, Value>, payload: &Map<String, Value>) {
    for (field, value) in payload {
        if TRANSIENT_FIELDS.contains(&field.as_str()) || field == "description" || field == "metadata" {
            continue;
        }
        document.insert(field.clone(), value.clone());
    }

    // Envelopes go last so they land on freshly replaced segments
    if let Some(description) = payload.get("description") {
        if let Some(route_text) = description.get("route") {
            document.insert("description".to_string(), route_text.clone());
        }
        if let Some(segments) = description.get("segments").and_then(Value::as_array) {
            for entry in segments {
                spread_onto_segment(document, entry, "description");
            }
        }
    }
    if let Some(entries) = payload.get("metadata").and_then(Value::as_array) {
        for entry in entries {
            spread_onto_segment(document, entry, "metadata");
        }
    }
}

fn spread_onto_segment(document: &mut Map<String, Value>, entry: &Value, field: &str) {
    let (Some(route_id), Some(value)) = (entry.get("routeId").and_then(Value::as_str), entry.get(field))
    else {
        return;
    };
    let Some(routes) = document.get_mut("routes").and_then(Value::as_array_mut) else {
        return;
    };
    for segment in routes.iter_mut() {
        if segment.get("routeId").and_then(Value::as_str) == Some(route_id) {
            if let Some(object) = segment.as_object_mut() {
                object.insert(field.to_string(), value.clone());
            }
        }
    }
}
