use chrono::{TimeZone, Utc};
use std::path::Path;
use tempfile::TempDir;

use docent::chunk::Chunker;
use docent::config::Config;
use docent::embedding::HashingEmbedder;
use docent::index::{SqliteVectorIndex, VectorIndex};
use docent::models::{Chunk, Confidentiality, Document, DocumentMetadata, DocumentStatus};
use docent::{ErrorKind, Filter, RagEngine, RagError, Upload};

const DIMS: usize = 128;

fn document(id: &str, metadata: DocumentMetadata, day: u32) -> Document {
    Document {
        id: id.to_string(),
        name: format!("{}.md", id),
        source_type: "text/markdown".to_string(),
        size_bytes: 100,
        uploaded_at: Utc.with_ymd_and_hms(2025, 6, day, 9, 30, 0).unwrap(),
        metadata,
        status: DocumentStatus::Ready,
        error_detail: None,
    }
}

fn embedded_chunks(doc_id: &str, text: &str, dims: usize) -> Vec<Chunk> {
    let embedder = HashingEmbedder::new(dims);
    let mut chunks = Chunker::new(400, 50).split(doc_id, text);
    for chunk in &mut chunks {
        chunk.embedding = embedder.embed_sync(&chunk.text);
    }
    chunks
}

async fn open(path: &Path) -> SqliteVectorIndex {
    SqliteVectorIndex::open(path, 0.05).await.unwrap()
}

const VACATION: &str = "Employees accrue vacation days monthly. Unused vacation days carry over \
                        into the next calendar year, up to a limit of five days.";
const SECURITY: &str = "Security badges must be worn at all times. Lost badges are reported to \
                        the security desk, which issues a temporary badge.";

#[tokio::test]
async fn test_chunks_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("data").join("index.sqlite");

    let doc = document(
        "vacation",
        DocumentMetadata {
            department: Some("HR".to_string()),
            tags: vec!["benefits".to_string()],
            ..Default::default()
        },
        1,
    );
    let chunks = embedded_chunks(&doc.id, VACATION, DIMS);
    {
        let index = open(&path).await;
        index.add(&doc, &chunks).await.unwrap();
        assert_eq!(index.dims(), Some(DIMS));
        index.close().await;
    }

    let index = open(&path).await;
    assert_eq!(index.dims(), Some(DIMS));
    assert_eq!(index.chunk_count().await.unwrap(), chunks.len());

    let docs = index.documents().await.unwrap();
    assert_eq!(docs, vec![doc.clone()]);

    let query = HashingEmbedder::new(DIMS).embed_sync("how many vacation days carry over");
    let results = index.query(&query, 3, &Filter::default()).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].document.id, "vacation");
    assert!(results[0].chunk.embedding.is_empty());
    assert!(results.iter().all(|r| r.similarity >= 0.05));
    assert_eq!(results[0].context_snippet, results[0].chunk.text);
}

#[tokio::test]
async fn test_reopened_index_rejects_other_dimensions() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("index.sqlite");

    let doc = document("vacation", DocumentMetadata::default(), 1);
    open(&path)
        .await
        .add(&doc, &embedded_chunks(&doc.id, VACATION, DIMS))
        .await
        .unwrap();

    let index = open(&path).await;
    let other = document("security", DocumentMetadata::default(), 2);
    let err = index
        .add(&other, &embedded_chunks(&other.id, SECURITY, 64))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::DimensionMismatch {
            expected: DIMS,
            actual: 64
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Fatal);

    let err = index
        .query(&vec![0.5; 64], 3, &Filter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::DimensionMismatch { .. }));
    assert_eq!(index.documents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_filters_pushed_down_and_rechecked() {
    let tmp = TempDir::new().unwrap();
    let index = open(&tmp.path().join("index.sqlite")).await;

    let hr = document(
        "vacation",
        DocumentMetadata {
            department: Some("Human Resources".to_string()),
            confidentiality: Confidentiality::Internal,
            ..Default::default()
        },
        1,
    );
    let sec = document(
        "security",
        DocumentMetadata {
            department: Some("Facilities".to_string()),
            tags: vec!["Badges".to_string()],
            confidentiality: Confidentiality::Restricted,
            ..Default::default()
        },
        20,
    );
    index.add(&hr, &embedded_chunks(&hr.id, VACATION, DIMS)).await.unwrap();
    index.add(&sec, &embedded_chunks(&sec.id, SECURITY, DIMS)).await.unwrap();

    let query = HashingEmbedder::new(DIMS).embed_sync("vacation days and security badges");
    let ids = |results: Vec<docent::models::SearchResult>| {
        let mut ids: Vec<String> = results.into_iter().map(|r| r.document.id).collect();
        ids.sort();
        ids.dedup();
        ids
    };

    let all = index.query(&query, 10, &Filter::default()).await.unwrap();
    assert_eq!(ids(all), vec!["security", "vacation"]);

    let cleared = Filter {
        max_confidentiality: Some(Confidentiality::Confidential),
        ..Default::default()
    };
    assert_eq!(ids(index.query(&query, 10, &cleared).await.unwrap()), vec!["vacation"]);

    let june_tenth_on = Filter {
        uploaded_after: Some(Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap()),
        ..Default::default()
    };
    assert_eq!(ids(index.query(&query, 10, &june_tenth_on).await.unwrap()), vec!["security"]);

    let exact_upload_time = Filter {
        uploaded_before: Some(hr.uploaded_at),
        ..Default::default()
    };
    assert_eq!(ids(index.query(&query, 10, &exact_upload_time).await.unwrap()), vec!["vacation"]);

    let tagged = Filter {
        tag: Some("badges".to_string()),
        department: Some("FACILITIES".to_string()),
        ..Default::default()
    };
    assert_eq!(ids(index.query(&query, 10, &tagged).await.unwrap()), vec!["security"]);

    let nothing = Filter {
        source_type: Some("text/csv".to_string()),
        ..Default::default()
    };
    assert!(index.query(&query, 10, &nothing).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replacing_and_removing_documents() {
    let tmp = TempDir::new().unwrap();
    let index = open(&tmp.path().join("index.sqlite")).await;

    let doc = document("vacation", DocumentMetadata::default(), 1);
    let long: String = format!("{}\n\n{}\n\n{}", VACATION, SECURITY, VACATION);
    index.add(&doc, &embedded_chunks(&doc.id, &long, DIMS)).await.unwrap();
    let first = index.chunk_count().await.unwrap();

    let short = embedded_chunks(&doc.id, VACATION, DIMS);
    index.add(&doc, &short).await.unwrap();
    assert!(first >= short.len());
    assert_eq!(index.chunk_count().await.unwrap(), short.len());

    assert!(index.remove_document(&doc.id).await.unwrap());
    assert!(!index.remove_document(&doc.id).await.unwrap());
    assert_eq!(index.chunk_count().await.unwrap(), 0);
    assert!(index.documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_engine_hydrates_from_sqlite() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.index.backend = "sqlite".to_string();
    config.index.path = tmp.path().join("docent.sqlite");
    config.retrieval.similarity_threshold = 0.05;

    let id = {
        let engine = RagEngine::from_config(config.clone()).await.unwrap();
        engine
            .add_document(
                Upload::new("vacation.txt", VACATION),
                DocumentMetadata {
                    author: Some("People Ops".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id
    };

    let engine = RagEngine::from_config(config).await.unwrap();
    let doc = engine.get_document(&id).unwrap();
    assert_eq!(doc.name, "vacation.txt");
    assert_eq!(doc.status, DocumentStatus::Ready);
    assert_eq!(doc.metadata.author.as_deref(), Some("People Ops"));

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.document_count, 1);
    assert!(stats.chunk_count >= 1);
    assert_eq!(stats.cache_entries, 0);

    engine.remove_document(&id).await.unwrap();
    assert_eq!(engine.index().chunk_count().await.unwrap(), 0);
}
