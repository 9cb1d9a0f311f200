//! End-to-end ingest and query scenarios against the in-memory fallback
//! store and a stubbed Ollama server

mod common;

use common::{mount_ollama, test_config, wait_for_completion};
use futures::StreamExt;
use ragd::{ProcessingStep, RagQuery, ServiceFactory};
use wiremock::MockServer;

#[tokio::test]
async fn markdown_ingest_and_query() {
    let server = MockServer::start().await;
    mount_ollama(
        &server,
        "The catalog lists Alpha widgets, Beta widgets and Gamma widgets.",
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);

    let factory = ServiceFactory::initialize(config).await;
    let ingest = factory.ingest().expect("ingestion available");

    let markdown = "# Test\n\n```python\nprint('secret code block')\n```\n\n\
                    - Alpha widgets are the first item in the catalog.\n\
                    - Beta widgets are the second item in the catalog.\n\
                    - Gamma widgets are the third item in the catalog.\n";

    let document_id = ingest
        .start_ingest("test.md", markdown.as_bytes().to_vec())
        .await
        .unwrap();
    wait_for_completion(&ingest, document_id).await;

    let store = factory.store().unwrap();
    let stats = store.stats().await.unwrap();
    assert!(stats.total_points >= 1);
    assert_eq!(stats.source_files, vec!["test.md"]);

    // The stripped code block must not be stored
    let summaries = store.list(10, 0).await.unwrap();
    assert_eq!(summaries[0].source_file, "test.md");

    let pipeline = factory.pipeline().expect("pipeline available");
    let response = pipeline
        .query(RagQuery::new("What are the items?"))
        .await
        .unwrap();

    assert!(response.answer.contains("Alpha"));
    assert!(response.answer.contains("Beta"));
    assert_eq!(response.sources[0].file, "test.md");
    assert!(!response.sources[0].text_preview.contains("secret code block"));
    assert_eq!(response.metadata["status"], "ready");

    factory.shutdown();
}

#[tokio::test]
async fn csv_ingest_and_query() {
    let server = MockServer::start().await;
    mount_ollama(&server, "Alice is 30 years old.").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 400);

    let factory = ServiceFactory::initialize(config).await;
    let ingest = factory.ingest().expect("ingestion available");

    let document_id = ingest
        .start_ingest("people.csv", b"Name,Age\nAlice,30\nBob,25".to_vec())
        .await
        .unwrap();
    wait_for_completion(&ingest, document_id).await;

    let store = factory.store().unwrap();
    let chunks = store.list(10, 0).await.unwrap();
    assert_eq!(chunks[0].source_file, "people.csv");

    // Retrieve the stored chunk and check the row rendering
    let results = store
        .search(&[1.0, 0.0, 0.0, 0.0], 5, 0.5, &Default::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].text.contains("Row 1: Name=Alice, Age=30"));
    assert!(results[0].text.contains("Row 2: Name=Bob, Age=25"));

    let pipeline = factory.pipeline().expect("pipeline available");
    let response = pipeline
        .query(RagQuery::new("How old is Alice?"))
        .await
        .unwrap();
    assert!(response.answer.contains("30"));

    factory.shutdown();
}

#[tokio::test]
async fn empty_collection_returns_no_results() {
    let server = MockServer::start().await;
    mount_ollama(&server, "unused").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);

    let factory = ServiceFactory::initialize(config).await;
    let pipeline = factory.pipeline().expect("pipeline available");

    let response = pipeline.query(RagQuery::new("anything")).await.unwrap();

    assert!(response.answer.starts_with("I couldn't find"));
    assert!(response.sources.is_empty());
    assert_eq!(response.metadata["status"], "no_results");

    factory.shutdown();
}

#[tokio::test]
async fn fallback_mode_serves_ingest_and_search() {
    let server = MockServer::start().await;
    mount_ollama(&server, "The note mentions fallback behavior.").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);

    // The vector database is unreachable from the start
    let factory = ServiceFactory::initialize(config).await;
    let store = factory.store().unwrap();
    assert!(store.is_fallback());

    let ingest = factory.ingest().expect("ingestion available");
    let document_id = ingest
        .start_ingest(
            "note.txt",
            b"Fallback behavior keeps the service answering questions. \
              External storage returns once the database is reachable again."
                .to_vec(),
        )
        .await
        .unwrap();
    wait_for_completion(&ingest, document_id).await;

    let stats = store.stats().await.unwrap();
    assert!(stats.total_points > 0);

    let results = store
        .search(&[1.0, 0.0, 0.0, 0.0], 5, 0.5, &Default::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    let report = factory.check_health().await;
    assert_eq!(report["overall_status"], "degraded");
    assert_eq!(
        report["services"]["vector_store"]["health_data"]["fallback_mode"],
        true
    );

    factory.shutdown();
}

#[tokio::test]
async fn progress_walks_the_state_machine() {
    let server = MockServer::start().await;
    mount_ollama(&server, "ok").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);

    let factory = ServiceFactory::initialize(config).await;
    let ingest = factory.ingest().expect("ingestion available");

    let document_id = ingest
        .start_ingest(
            "walk.txt",
            b"Progress records advance through every processing step in order. \
              Each transition can only move forward through the machine."
                .to_vec(),
        )
        .await
        .unwrap();

    let finished = wait_for_completion(&ingest, document_id).await;
    assert_eq!(finished.current_step, ProcessingStep::Completed);
    assert_eq!(finished.progress, 100.0);
    assert_eq!(finished.estimated_time_remaining, Some(0.0));

    factory.shutdown();
}

#[tokio::test]
async fn stream_concatenates_to_unary_answer() {
    let server = MockServer::start().await;
    mount_ollama(&server, "streaming equals unary output").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);

    let factory = ServiceFactory::initialize(config).await;
    let ingest = factory.ingest().expect("ingestion available");
    let document_id = ingest
        .start_ingest(
            "same.txt",
            b"Streaming output should concatenate to the unary answer text. \
              Determinism holds at temperature zero for a fixed stub."
                .to_vec(),
        )
        .await
        .unwrap();
    wait_for_completion(&ingest, document_id).await;

    let pipeline = factory.pipeline().expect("pipeline available");

    let mut query = RagQuery::new("What does the note say?");
    query.temperature = 0.0;

    let unary = pipeline.query(query.clone()).await.unwrap();

    let mut stream = pipeline.query_stream(query).await.unwrap();
    let mut assembled = String::new();
    while let Some(chunk) = stream.next().await {
        assembled.push_str(&chunk.unwrap());
    }

    assert_eq!(assembled, unary.answer);

    factory.shutdown();
}

#[tokio::test]
async fn rejected_upload_returns_error() {
    let server = MockServer::start().await;
    mount_ollama(&server, "unused").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);

    let factory = ServiceFactory::initialize(config).await;
    let ingest = factory.ingest().expect("ingestion available");

    let result = ingest
        .start_ingest("malware.exe", b"not really text".to_vec())
        .await;
    assert!(result.is_err());

    factory.shutdown();
}

#[tokio::test]
async fn duplicate_filenames_are_uniquified() {
    let server = MockServer::start().await;
    mount_ollama(&server, "ok").await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server.uri(), dir.path(), 200);
    let upload_dir = std::path::PathBuf::from(&config.storage.upload_dir);

    let factory = ServiceFactory::initialize(config).await;
    let ingest = factory.ingest().expect("ingestion available");

    let body = b"Identical uploads land under distinct file names on disk. \
                 The suffix counts upward before the extension."
        .to_vec();

    let first = ingest.start_ingest("dup.txt", body.clone()).await.unwrap();
    wait_for_completion(&ingest, first).await;
    let second = ingest.start_ingest("dup.txt", body).await.unwrap();
    wait_for_completion(&ingest, second).await;

    assert!(upload_dir.join("dup.txt").exists());
    assert!(upload_dir.join("dup_1.txt").exists());

    factory.shutdown();
}
