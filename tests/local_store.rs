//! Coordinator round trips against the SQLite route store.
//!
//! Run with: `cargo test --features persistence --test local_store`

use std::sync::Arc;

use futures::future::BoxFuture;
use route_coordinator::persistence::LOCAL_ID_PREFIX;
use route_coordinator::{
    AssetFile, AssetUploadService, CoordinatorError, LocalRouteStore, MapOverview, Result,
    RouteCoordinator, RouteFilters, RouteService, RouteType, Segment, SegmentMetadata,
    SegmentPatch, UploadedAsset,
};
use tempfile::TempDir;

struct NoUploads;

impl AssetUploadService for NoUploads {
    fn upload<'a>(&'a self, file: &'a AssetFile) -> BoxFuture<'a, Result<UploadedAsset>> {
        Box::pin(async move {
            Err(CoordinatorError::Upload {
                asset_id: file.name.clone(),
                message: "offline".to_string(),
            })
        })
    }
}

fn segment(id: &str, offset: f64) -> Segment {
    Segment::from_coordinates(
        id,
        format!("Leg {}", id),
        &[
            [147.30 + offset, -42.88],
            [147.32 + offset, -42.86],
            [147.35 + offset, -42.85],
        ],
    )
}

fn setup() -> (RouteCoordinator, Arc<LocalRouteStore>, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let store = Arc::new(
        LocalRouteStore::open(tmp_dir.path().join("routes.db")).expect("failed to open store"),
    );
    let coordinator = RouteCoordinator::new(store.clone(), Arc::new(NoUploads));
    (coordinator, store, tmp_dir)
}

#[tokio::test]
async fn test_partial_saves_merge_into_stored_document() {
    let (coordinator, store, _tmp) = setup();
    coordinator.add_route(segment("a", 0.0));
    coordinator.add_route(segment("b", 0.1));

    let first = coordinator
        .save_current_state("Huon Valley", RouteType::Bikepacking, true, Vec::new(), None)
        .await
        .unwrap();
    assert!(first.persistent_id.starts_with(LOCAL_ID_PREFIX));

    coordinator
        .update_route("b", SegmentPatch::description("River crossing"))
        .unwrap();
    coordinator
        .update_route(
            "a",
            SegmentPatch::metadata(SegmentMetadata {
                country: Some("Australia".to_string()),
                state: Some("Tasmania".to_string()),
                lga: Some("Huon Valley".to_string()),
            }),
        )
        .unwrap();
    coordinator.update_map_overview(MapOverview {
        description: "Three days south of Hobart".to_string(),
    });

    let second = coordinator
        .save_current_state("Huon Valley", RouteType::Bikepacking, true, Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(second.persistent_id, first.persistent_id);
    assert!(!second.payload.contains("routes"));

    let stored = store.load_route(&first.persistent_id).await.unwrap();
    assert_eq!(stored.name, "Huon Valley");
    assert_eq!(stored.routes.len(), 2);
    assert_eq!(stored.routes[1].description.as_deref(), Some("River crossing"));
    assert_eq!(
        stored.routes[0].metadata.as_ref().and_then(|m| m.lga.as_deref()),
        Some("Huon Valley")
    );
    assert_eq!(
        stored.map_overview.map(|o| o.description).as_deref(),
        Some("Three days south of Hobart")
    );
    let summary = stored.route_summary.unwrap();
    assert_eq!(summary.lgas, vec!["Huon Valley".to_string()]);
}

#[tokio::test]
async fn test_load_round_trip_and_index() {
    let (coordinator, _store, _tmp) = setup();
    coordinator.add_route(segment("a", 0.0));
    let saved = coordinator
        .save_current_state("Short loop", RouteType::Single, false, Vec::new(), None)
        .await
        .unwrap();

    coordinator.clear_current_work().await;
    assert!(coordinator.routes().is_empty());

    coordinator.load_route(&saved.persistent_id).await.unwrap();
    assert_eq!(coordinator.routes().len(), 1);
    assert_eq!(coordinator.document().name, "Short loop");
    assert_eq!(
        coordinator.current_loaded_persistent_id().as_deref(),
        Some(saved.persistent_id.as_str())
    );

    let index = coordinator.list_routes(None).await.unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].view_count, 1);

    let events = coordinator
        .list_routes(Some(RouteFilters::by_type(RouteType::Event)))
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_failed_photo_upload_still_saves() {
    let (coordinator, store, _tmp) = setup();
    coordinator.add_route(segment("a", 0.0));
    coordinator.add_photo(route_coordinator::Photo::local(
        "p1",
        "blob:http://localhost/p1",
        AssetFile::new("p1.jpg", "image/jpeg", vec![1, 2, 3]),
    ));

    let saved = coordinator
        .save_current_state("Offline", RouteType::Single, false, Vec::new(), None)
        .await
        .unwrap();

    assert!(coordinator.document().photos[0].is_local);
    assert_eq!(store.count().unwrap(), 1);
    let stored = store.load_route(&saved.persistent_id).await.unwrap();
    assert_eq!(stored.photos.len(), 1);
}

#[tokio::test]
async fn test_store_survives_reopen_and_delete() {
    let (coordinator, _store, tmp) = setup();
    coordinator.add_route(segment("a", 0.0));
    let saved = coordinator
        .save_current_state("Persisted", RouteType::Event, true, Vec::new(), Some("2024-11-02".to_string()))
        .await
        .unwrap();
    drop(coordinator);

    let reopened = LocalRouteStore::open(tmp.path().join("routes.db")).unwrap();
    let document = reopened.load_route(&saved.persistent_id).await.unwrap();
    assert_eq!(document.event_date.as_deref(), Some("2024-11-02"));
    assert_eq!(document.route_type, RouteType::Event);

    reopened.delete_route(&saved.persistent_id).await.unwrap();
    assert_eq!(reopened.count().unwrap(), 0);
    assert!(matches!(
        reopened.load_route(&saved.persistent_id).await,
        Err(CoordinatorError::RouteNotFound { .. })
    ));
}
