use std::sync::Arc;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tutorgate_core_sdk::{server, Gateway, Registry};

async fn spawn_server() -> String {
    let gateway = Gateway::new(Registry::in_memory().expect("registry")).expect("gateway");
    let app = server::router(Arc::new(gateway));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn provider_lifecycle_over_http() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"ok": true}));

    let resp = client
        .post(format!("{base}/api/providers"))
        .json(&json!({"name": "openai", "apiKey": "sk-abcdefghijkl", "isDefault": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["apiKey"], json!("****ijkl"));
    assert_eq!(created["family"], json!("openai-compatible"));
    assert_eq!(created["isDefault"], json!(true));

    let dup = client
        .post(format!("{base}/api/providers"))
        .json(&json!({"name": "openai"}))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), StatusCode::CONFLICT);

    let patched: Value = client
        .patch(format!("{base}/api/providers/openai"))
        .json(&json!({"priority": 7, "organizationId": "org-1", "defaults": {"temperature": 0.3}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["priority"], json!(7));
    assert_eq!(patched["organizationId"], json!("org-1"));
    assert_eq!(patched["apiKey"], json!("****ijkl"));
    assert_eq!(patched["defaults"]["temperature"], json!(0.3));

    let default: Value = client
        .get(format!("{base}/api/providers/default"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(default["name"], json!("openai"));

    let seeded: Value = client
        .post(format!("{base}/api/providers/openai/models/seed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(seeded, json!({"inserted": 5}));

    let models: Vec<Value> = client
        .get(format!("{base}/api/providers/openai/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models.len(), 5);
    assert_eq!(models[0]["modelId"], json!("gpt-4o"));
    assert_eq!(models[0]["isDefault"], json!(true));

    let missing = client
        .get(format!("{base}/api/providers/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let deleted = client
        .delete(format!("{base}/api/providers/openai"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    let listed: Vec<Value> = client
        .get(format!("{base}/api/providers?includeDisabled=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn chat_errors_map_to_status_codes() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let no_provider = client
        .post(format!("{base}/api/chat"))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(no_provider.status(), StatusCode::UNPROCESSABLE_ENTITY);

    client
        .post(format!("{base}/api/providers"))
        .json(&json!({"name": "openai", "apiKey": "sk-abcdefghijkl"}))
        .send()
        .await
        .unwrap();

    let empty = client
        .post(format!("{base}/api/chat"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let unsupported = client
        .post(format!("{base}/api/chat"))
        .json(&json!({
            "messages": [{"role": "user", "content": "hi"}],
            "model": "o1",
            "topP": 0.5
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(unsupported.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        unsupported.text().await.unwrap(),
        "Unsupported parameters for OpenAI reasoning model o1: topP"
    );
}

#[tokio::test]
async fn model_patch_and_delete_by_id() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/api/providers"))
        .json(&json!({"name": "ollama"}))
        .send()
        .await
        .unwrap();
    let resp = client
        .post(format!("{base}/api/providers/ollama/models"))
        .json(&json!({"modelId": "phi3", "description": "small", "contextLength": 4096}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let model: Value = resp.json().await.unwrap();
    let id = model["id"].as_i64().unwrap();

    let patched: Value = client
        .patch(format!("{base}/api/models/{id}"))
        .json(&json!({"description": null, "isDefault": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["description"], Value::Null);
    assert_eq!(patched["contextLength"], json!(4096));
    assert_eq!(patched["isDefault"], json!(true));

    let gone = client
        .delete(format!("{base}/api/models/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NO_CONTENT);
    let again = client
        .delete(format!("{base}/api/models/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}
