use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;

use docent::config::Config;
use docent::embedding::HashingEmbedder;
use docent::index::InMemoryVectorIndex;
use docent::llm::{Completion, LlmClient};
use docent::models::Usage;
use docent::transport::{Frame, FrameAssembler};
use docent::{server, RagEngine};

/// Repeats the question back, padded so answers span several frames.
struct ParrotLlm;

#[async_trait]
impl LlmClient for ParrotLlm {
    fn model_name(&self) -> &str {
        "parrot"
    }

    async fn complete(&self, prompt: &str, _max_tokens: u32, _temperature: f32) -> docent::Result<Completion> {
        let question = prompt
            .rsplit("Question:")
            .next()
            .unwrap_or_default()
            .trim_end_matches("Answer:")
            .trim();
        Ok(Completion {
            text: format!("You asked \"{}\". {}", question, "The refund window is 30 days. ".repeat(40)),
            usage: Usage::default(),
            model: "parrot".to_string(),
        })
    }
}

async fn spawn_server() -> (String, Arc<RagEngine>) {
    let mut config = Config::minimal();
    config.retrieval.similarity_threshold = 0.05;
    config.transport.max_frame_bytes = 256;
    config.transport.frame_delay_ms = 0;

    let engine = Arc::new(RagEngine::new(
        config,
        Arc::new(HashingEmbedder::new(128)),
        Arc::new(ParrotLlm),
        Arc::new(InMemoryVectorIndex::new(0.05)),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let served = engine.clone();
    tokio::spawn(async move {
        server::serve(listener, served).await.unwrap();
    });
    (base, engine)
}

async fn upload_refunds(client: &reqwest::Client, base: &str) -> Value {
    let resp = client
        .post(format!("{}/documents", base))
        .json(&json!({
            "name": "refunds.md",
            "content": "# Refunds\n\nThe refund window is 30 days from the delivery date.",
            "metadata": { "department": "Support", "tags": ["policy"] }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_health() {
    let (base, _) = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_document_lifecycle() {
    let (base, _) = spawn_server().await;
    let client = reqwest::Client::new();

    let doc = upload_refunds(&client, &base).await;
    assert_eq!(doc["status"], "ready");
    assert_eq!(doc["source_type"], "text/markdown");
    assert_eq!(doc["metadata"]["department"], "Support");
    let id = doc["id"].as_str().unwrap().to_string();

    let encoded = base64::engine::general_purpose::STANDARD
        .encode("name,days\nrefund window,30\nexchange window,60\n");
    let resp = client
        .post(format!("{}/documents", base))
        .json(&json!({ "name": "windows.csv", "content_base64": encoded }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let list: Value = client
        .get(format!("{}/documents", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["documents"].as_array().unwrap().len(), 2);

    let one: Value = client
        .get(format!("{}/documents/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["name"], "refunds.md");

    let stats: Value = client
        .get(format!("{}/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["document_count"], 2);

    let resp = client
        .delete(format!("{}/documents/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/documents/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_bad_requests() {
    let (base, _) = spawn_server().await;
    let client = reqwest::Client::new();

    let both = client
        .post(format!("{}/documents", base))
        .json(&json!({ "name": "a.txt", "content": "x", "content_base64": "eA==" }))
        .send()
        .await
        .unwrap();
    assert_eq!(both.status(), 400);

    let pdf = client
        .post(format!("{}/documents", base))
        .json(&json!({ "name": "scan.pdf", "content": "%PDF-1.7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(pdf.status(), 400);
    let body: Value = pdf.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let empty_question = client
        .post(format!("{}/query", base))
        .json(&json!({ "question": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty_question.status(), 400);

    let inverted = client
        .post(format!("{}/query", base))
        .json(&json!({
            "question": "refunds?",
            "filter": {
                "uploaded_after": "2025-02-01T00:00:00Z",
                "uploaded_before": "2025-01-01T00:00:00Z"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(inverted.status(), 400);
}

#[tokio::test]
async fn test_query_and_cache() {
    let (base, engine) = spawn_server().await;
    let client = reqwest::Client::new();
    upload_refunds(&client, &base).await;

    let ask = |question: &'static str| {
        let client = client.clone();
        let url = format!("{}/query", base);
        async move {
            let resp = client
                .post(url)
                .json(&json!({ "question": question, "filter": { "department": "support" } }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            resp.json::<Value>().await.unwrap()
        }
    };

    let first = ask("What is the refund window?").await;
    assert!(first["text"].as_str().unwrap().contains("30 days"));
    assert_eq!(first["cached"], false);
    assert_eq!(first["sources"][0]["document"]["name"], "refunds.md");

    let second = ask("what is the REFUND window?").await;
    assert_eq!(second["cached"], true);
    assert_eq!(second["text"], first["text"]);
    assert_eq!(engine.stats().await.unwrap().cache_entries, 1);
}

#[tokio::test]
async fn test_query_frames_are_bounded_json() {
    let (base, _) = spawn_server().await;
    let client = reqwest::Client::new();
    upload_refunds(&client, &base).await;

    let body: Value = client
        .post(format!("{}/query/frames", base))
        .json(&json!({ "question": "What is the refund window?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["sources"], json!(["refunds.md"]));
    assert_eq!(body["truncated"], false);

    let frames: Vec<Frame> = serde_json::from_value(body["frames"].clone()).unwrap();
    assert!(frames.len() > 1);
    let mut assembler = FrameAssembler::new();
    let mut text = None;
    for frame in frames {
        assert!(serde_json::to_vec(&frame).unwrap().len() <= 256);
        assert_eq!(frame.message_id, body["message_id"].as_str().unwrap());
        text = assembler.push(frame).unwrap().or(text);
    }
    let text = text.unwrap();
    assert!(text.starts_with("You asked \"What is the refund window?\"."));
    assert!(text.contains("30 days"));
}
