use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use alder_core::metamodel::JsonMetamodelParser;
use alder_core::model::json::JsonModelParser;
use alder_core::repository::{LocalDirectoryAdapter, RepositoryAdapter};
use alder_core::{Config, IndexerState, MemoryGraph, ModelIndexer, SyncError};

const TREE_MM: &str = "http://example.org/tree";

const TREE_METAMODEL: &str = r#"{
  "uri": "http://example.org/tree",
  "version": "1",
  "types": [
    { "name": "Tree",
      "attributes": [{ "name": "label" }],
      "references": [{ "name": "children", "many": true, "containment": true }] }
  ]
}"#;

const TREE_MODEL: &str = r##"{
  "metamodel": "http://example.org/tree",
  "elements": [
    { "fragment": "t1", "type": "Tree", "root": true,
      "attributes": { "label": "root" },
      "references": { "children": ["#t2"] } },
    { "fragment": "t2", "type": "Tree", "attributes": { "label": "leaf" } }
  ]
}"##;

struct Fixture {
    indexer: Arc<ModelIndexer>,
    url: String,
    models: TempDir,
    _data: TempDir,
}

async fn create_test_fixture() -> Fixture {
    let models = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    fs::write(models.path().join("tree.metamodel.json"), TREE_METAMODEL).unwrap();

    let backend = Arc::new(MemoryGraph::new());
    let mut config = Config::default();
    config.storage.data_dir = data.path().to_string_lossy().to_string();
    config.sync.base_poll_interval_ms = 25;
    config.sync.max_poll_interval_ms = 200;
    let indexer = Arc::new(ModelIndexer::new(backend, config).unwrap());
    indexer.add_model_parser(Arc::new(JsonModelParser::new()));
    indexer.add_metamodel_parser(Arc::new(JsonMetamodelParser::new()));
    indexer
        .register_metamodel(&models.path().join("tree.metamodel.json"))
        .await
        .unwrap();

    let adapter = Arc::new(
        LocalDirectoryAdapter::new(models.path())
            .unwrap()
            .with_extensions(vec![".model.json".to_string()]),
    );
    let url = adapter.url().to_string();
    indexer.add_repository(adapter);

    Fixture {
        indexer,
        url,
        models,
        _data: data,
    }
}

#[tokio::test]
async fn test_stats_reflect_indexed_content() {
    let fixture = create_test_fixture().await;
    fixture.indexer.sync_now().await.unwrap();

    let empty = fixture.indexer.stats().unwrap();
    assert_eq!(empty.metamodels, 1);
    assert_eq!(empty.repositories, 1);
    assert_eq!(empty.files, 0);
    assert_eq!(empty.elements, 0);

    fs::write(fixture.models.path().join("tree.model.json"), TREE_MODEL).unwrap();
    fixture.indexer.sync_now().await.unwrap();

    let stats = fixture.indexer.stats().unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.elements, 2);
    assert!(fixture.indexer.metrics().cycles >= 2);
}

#[tokio::test]
async fn test_indexed_attribute_backfills_and_follows_updates() {
    let fixture = create_test_fixture().await;
    fs::write(fixture.models.path().join("tree.model.json"), TREE_MODEL).unwrap();
    fixture.indexer.sync_now().await.unwrap();

    let filled = fixture
        .indexer
        .add_indexed_attribute(TREE_MM, "Tree", "label")
        .await
        .unwrap();
    assert_eq!(filled, 2);

    let t2 = fixture
        .indexer
        .element_by_identity(&fixture.url, "tree.model.json", "t2")
        .unwrap()
        .unwrap();
    assert_eq!(
        fixture
            .indexer
            .indexed_lookup(TREE_MM, "Tree", "label", "leaf")
            .unwrap(),
        vec![t2]
    );

    // The index follows attribute updates on the next cycle.
    let updated = TREE_MODEL.replace(r#""label": "leaf""#, r#""label": "frond""#);
    fs::write(fixture.models.path().join("tree.model.json"), updated).unwrap();
    fixture.indexer.sync_now().await.unwrap();

    assert!(fixture
        .indexer
        .indexed_lookup(TREE_MM, "Tree", "label", "leaf")
        .unwrap()
        .is_empty());
    assert_eq!(
        fixture
            .indexer
            .indexed_lookup(TREE_MM, "Tree", "label", "frond")
            .unwrap(),
        vec![t2]
    );
}

#[tokio::test]
async fn test_duplicate_repository_url_is_rejected() {
    let fixture = create_test_fixture().await;
    let again = Arc::new(LocalDirectoryAdapter::new(fixture.models.path()).unwrap());
    assert!(!fixture.indexer.add_repository(again));
}

#[tokio::test]
async fn test_shutdown_rejects_further_requests() {
    let fixture = create_test_fixture().await;
    fs::write(fixture.models.path().join("tree.model.json"), TREE_MODEL).unwrap();
    fixture.indexer.sync_now().await.unwrap();

    fixture.indexer.shutdown().await;
    assert_eq!(fixture.indexer.state(), IndexerState::Stopped);

    assert!(matches!(
        fixture.indexer.sync_now().await,
        Err(SyncError::NotRunning(_))
    ));
    assert!(matches!(
        fixture.indexer.instances_of(TREE_MM, "Tree"),
        Err(SyncError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_polling_loop_indexes_new_files() {
    let fixture = create_test_fixture().await;
    let poller = fixture.indexer.start_polling();
    fs::write(fixture.models.path().join("tree.model.json"), TREE_MODEL).unwrap();

    let mut indexed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if fixture.indexer.instances_of(TREE_MM, "Tree").unwrap().len() == 2 {
            indexed = true;
            break;
        }
    }
    assert!(indexed, "polled cycles never picked the file up");

    fixture.indexer.shutdown().await;
    poller.await.unwrap();
}
