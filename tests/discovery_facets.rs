//! Facet discovery over a populated store: coverage floors, cardinality
//! caps, degenerate payload pruning, and cache behavior.

mod common;

use common::*;
use palimpsest::discovery::{FacetPayload, MetadataDiscovery};
use palimpsest::model::ContentItem;
use std::time::Duration;

async fn seed_items(store: &palimpsest::store::ArchiveStore, total: usize) {
    let sources = ["facebook", "instagram", "twitter"];
    for index in 0..total {
        let item = ContentItem {
            id: format!("item-{index}"),
            item_type: "post".into(),
            source: sources[index % sources.len()].into(),
            text: Some(format!("post body number {index} with some words in it")),
            title: None,
            // One row in ten has no timestamp.
            created_at: if index % 10 == 0 {
                0
            } else {
                1_600_000_000 + index as i64
            },
            // Authors on fewer than 5% of rows: below the coverage floor.
            author_name: if index < total / 25 {
                Some("Alex Example".into())
            } else {
                None
            },
            is_own_content: index % 4 != 0,
            thread_id: None,
            parent_id: None,
            media_refs: Vec::new(),
            metadata: serde_json::json!({}),
            uri: Some(format!("content://social/post/{index}")),
        };
        store.insert_content_item(&item).await.unwrap();
    }
}

#[tokio::test]
async fn facets_match_the_corpus_shape() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    seed_items(&store, 100).await;

    let discovery = MetadataDiscovery::new(store);
    let result = discovery.discover().await.unwrap();
    assert!(result.total_records >= 100);

    let source = result
        .facets
        .iter()
        .find(|f| f.name == "source")
        .expect("source facet present");
    assert_eq!(source.distinct_count, 3);
    let FacetPayload::Enum { values } = &source.payload else {
        panic!("source should be an enum facet");
    };
    assert_eq!(values.len(), 3);
    let total: i64 = values.iter().map(|v| v.count).sum();
    assert_eq!(total, 100);

    let created = result
        .facets
        .iter()
        .find(|f| f.name == "content_created_at")
        .expect("created_at facet present");
    assert!((created.coverage - 90.0).abs() < 0.11);
    let FacetPayload::DateRange { min, max } = created.payload else {
        panic!("created_at should be a date range");
    };
    assert!(min >= 1_600_000_000);
    assert!(max > min);

    // Below the 5% coverage floor: omitted entirely.
    assert!(result.facets.iter().all(|f| f.name != "author"));

    let own = result
        .facets
        .iter()
        .find(|f| f.name == "is_own_content")
        .expect("boolean facet present");
    let FacetPayload::Boolean {
        true_count,
        false_count,
    } = own.payload
    else {
        panic!("is_own_content should be boolean");
    };
    assert_eq!(true_count, 75);
    assert_eq!(false_count, 25);
}

#[tokio::test]
async fn one_sided_booleans_and_degenerate_ranges_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    // Every item shares one source and is own content.
    for index in 0..20 {
        let item = ContentItem {
            id: format!("solo-{index}"),
            item_type: "note".into(),
            source: "notes".into(),
            text: Some("a note".into()),
            title: None,
            created_at: 1_700_000_000,
            author_name: None,
            is_own_content: true,
            thread_id: None,
            parent_id: None,
            media_refs: Vec::new(),
            metadata: serde_json::json!({}),
            uri: None,
        };
        store.insert_content_item(&item).await.unwrap();
    }

    let discovery = MetadataDiscovery::new(store);
    let result = discovery.discover().await.unwrap();

    // All-true boolean has no filtering power.
    assert!(result.facets.iter().all(|f| f.name != "is_own_content"));
    // A single-valued enum still shows up (it has one value)...
    let source = result.facets.iter().find(|f| f.name == "source").unwrap();
    assert_eq!(source.distinct_count, 1);
    // ...and the degenerate date range (min == max) still reads as a range.
    let created = result
        .facets
        .iter()
        .find(|f| f.name == "content_created_at")
        .unwrap();
    let FacetPayload::DateRange { min, max } = created.payload else {
        panic!("expected date range");
    };
    assert_eq!(min, max);
}

#[tokio::test]
async fn cache_serves_until_invalidated() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    seed_items(&store, 25).await;

    let discovery = MetadataDiscovery::new(store.clone()).with_ttl(Duration::from_secs(3600));
    let first = discovery.discover().await.unwrap();

    // New rows are invisible while the cache is warm.
    seed_extra(&store).await;
    let cached = discovery.discover().await.unwrap();
    assert_eq!(first.discovered_at_ms, cached.discovered_at_ms);

    discovery.invalidate();
    let refreshed = discovery.discover().await.unwrap();
    assert!(refreshed.total_records > first.total_records);
}

async fn seed_extra(store: &palimpsest::store::ArchiveStore) {
    let item = ContentItem {
        id: "late-arrival".into(),
        item_type: "post".into(),
        source: "facebook".into(),
        text: Some("a late post".into()),
        title: None,
        created_at: 1_650_000_000,
        author_name: None,
        is_own_content: true,
        thread_id: None,
        parent_id: None,
        media_refs: Vec::new(),
        metadata: serde_json::json!({}),
        uri: None,
    };
    store.insert_content_item(&item).await.unwrap();
}
