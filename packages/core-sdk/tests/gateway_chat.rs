use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tutorgate_core_sdk::models::{ChatRequest, Message, ProviderInput};
use tutorgate_core_sdk::{Gateway, GatewayError, Registry};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway() -> Gateway {
    Gateway::new(Registry::in_memory().expect("registry")).expect("gateway")
}

fn openai_body() -> Value {
    json!({
        "id": "chatcmpl-abc",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Photosynthesis turns light into sugar."},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 8, "total_tokens": 28}
    })
}

async fn last_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.expect("recording enabled");
    let last = requests.last().expect("one request");
    serde_json::from_slice(&last.body).expect("json body")
}

#[tokio::test]
async fn openai_chat_forwards_only_set_parameters_and_counts_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body()))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway();
    let provider = gw
        .registry()
        .create_provider(ProviderInput {
            base_url: Some(format!("{}/v1", server.uri())),
            api_key: Some("sk-test".into()),
            // descriptive defaults must not leak into the request
            defaults: tutorgate_core_sdk::models::GenerationDefaults {
                temperature: Some(1.3),
                max_tokens: Some(999),
                ..Default::default()
            },
            ..ProviderInput::named("openai")
        })
        .unwrap();
    gw.registry()
        .seed_common_models(provider.id, "openai")
        .unwrap();

    let request = ChatRequest {
        temperature: Some(0.2),
        ..ChatRequest::new(vec![
            Message::system("You are a biology tutor."),
            Message::user("Explain photosynthesis."),
        ])
    };
    let response = gw.chat(request).await.expect("chat");
    assert_eq!(response.content(), "Photosynthesis turns light into sugar.");
    assert_eq!(response.provider, "openai");
    assert_eq!(response.usage.total_tokens, 28);

    assert_eq!(
        last_body(&server).await,
        json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "You are a biology tutor."},
                {"role": "user", "content": "Explain photosynthesis."}
            ],
            "temperature": 0.2
        })
    );

    let after = gw.registry().get_provider("openai").unwrap().unwrap();
    assert_eq!(after.usage.total_requests, 1);
    assert_eq!(after.usage.total_tokens, 28);
    assert_eq!(after.usage.total_errors, 0);
    let model = gw
        .registry()
        .find_model(provider.id, "gpt-4o")
        .unwrap()
        .unwrap();
    assert_eq!(model.total_requests, 1);
    assert_eq!(model.total_tokens, 28);
}

#[tokio::test]
async fn unsupported_parameter_never_reaches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body()))
        .expect(0)
        .mount(&server)
        .await;

    let gw = gateway();
    gw.registry()
        .create_provider(ProviderInput {
            base_url: Some(format!("{}/v1", server.uri())),
            api_key: Some("sk-test".into()),
            ..ProviderInput::named("openai")
        })
        .unwrap();
    let request = ChatRequest {
        model: Some("o1-mini".into()),
        temperature: Some(0.7),
        stop: Some(vec!["END".into()]),
        ..ChatRequest::new(vec![Message::user("hi")])
    };
    let err = gw.chat(request).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unsupported parameters for OpenAI reasoning model o1-mini: temperature, stop"
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn reasoning_model_receives_completion_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_body()))
        .mount(&server)
        .await;

    let gw = gateway();
    gw.registry()
        .create_provider(ProviderInput {
            base_url: Some(format!("{}/v1", server.uri())),
            api_key: Some("sk-test".into()),
            ..ProviderInput::named("openai")
        })
        .unwrap();
    let request = ChatRequest {
        model: Some("o3-mini".into()),
        max_tokens: Some(256),
        ..ChatRequest::new(vec![Message::user("prove it")])
    };
    gw.chat(request).await.expect("chat");
    let body = last_body(&server).await;
    assert_eq!(body["max_completion_tokens"], json!(256));
    assert!(body.get("max_tokens").is_none());
}

#[tokio::test]
async fn backend_failure_counts_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let gw = gateway();
    gw.registry()
        .create_provider(ProviderInput {
            base_url: Some(server.uri()),
            api_key: Some("sk-ds".into()),
            ..ProviderInput::named("deepseek")
        })
        .unwrap();
    let request = ChatRequest {
        model: Some("deepseek-chat".into()),
        ..ChatRequest::new(vec![Message::user("hi")])
    };
    match gw.chat(request).await.unwrap_err() {
        GatewayError::Backend {
            provider,
            status,
            message,
        } => {
            assert_eq!(provider, "deepseek");
            assert_eq!(status, Some(500));
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    let after = gw.registry().get_provider("deepseek").unwrap().unwrap();
    assert_eq!(after.usage.total_requests, 1);
    assert_eq!(after.usage.total_errors, 1);
    assert_eq!(after.usage.total_tokens, 0);
}

#[tokio::test]
async fn default_moves_to_anthropic_and_chat_uses_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "Bonjour"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway();
    gw.registry()
        .create_provider(ProviderInput {
            is_default: Some(true),
            api_key: Some("sk-openai".into()),
            ..ProviderInput::named("openai")
        })
        .unwrap();
    gw.registry()
        .create_provider(ProviderInput {
            is_default: Some(true),
            base_url: Some(server.uri()),
            api_key: Some("sk-ant".into()),
            ..ProviderInput::named("anthropic")
        })
        .unwrap();
    let providers = gw.registry().get_providers(true).unwrap();
    let flag = |name: &str| providers.iter().find(|p| p.name == name).unwrap().is_default;
    assert!(!flag("openai"));
    assert!(flag("anthropic"));

    let request = ChatRequest {
        model: Some("claude-3-5-haiku-20241022".into()),
        ..ChatRequest::new(vec![
            Message::system("Answer in French."),
            Message::user("Hello"),
        ])
    };
    let response = gw.chat(request).await.expect("chat");
    assert_eq!(response.content(), "Bonjour");
    assert_eq!(response.usage.total_tokens, 15);

    let body = last_body(&server).await;
    assert_eq!(
        body,
        json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 4096,
            "system": "Answer in French.",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "Hello"}]}]
        })
    );
}

#[tokio::test]
async fn gemini_chat_sends_key_as_query_and_reports_zero_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .and(query_param("key", "g-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Nine."}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway();
    gw.registry()
        .create_provider(ProviderInput {
            base_url: Some(server.uri()),
            api_key: Some("g-key".into()),
            ..ProviderInput::named("gemini")
        })
        .unwrap();
    let request = ChatRequest {
        provider: Some("gemini".into()),
        model: Some("gemini-1.5-flash".into()),
        top_k: Some(20),
        ..ChatRequest::new(vec![
            Message::system("Math tutor."),
            Message::user("3 squared?"),
        ])
    };
    let response = gw.chat(request).await.expect("chat");
    assert_eq!(response.content(), "Nine.");
    assert_eq!(response.usage.total_tokens, 0);
    assert_eq!(
        last_body(&server).await,
        json!({
            "contents": [{"role": "user", "parts": [{"text": "Math tutor.\n\n3 squared?"}]}],
            "generationConfig": {"topK": 20}
        })
    );
    let after = gw.registry().get_provider("gemini").unwrap().unwrap();
    assert_eq!(after.usage.total_requests, 1);
}

#[tokio::test]
async fn ollama_chat_maps_options() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.1",
            "created_at": "2024-07-01T10:00:00.123Z",
            "message": {"role": "assistant", "content": "Mitochondria."},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 14,
            "eval_count": 5
        })))
        .mount(&server)
        .await;

    let gw = gateway();
    let p = gw
        .registry()
        .create_provider(ProviderInput {
            base_url: Some(server.uri()),
            ..ProviderInput::named("ollama")
        })
        .unwrap();
    gw.registry().seed_common_models(p.id, "ollama").unwrap();
    let request = ChatRequest {
        provider: Some("ollama".into()),
        repeat_penalty: Some(1.2),
        max_tokens: Some(50),
        ..ChatRequest::new(vec![Message::user("Powerhouse of the cell?")])
    };
    let response = gw.chat(request).await.expect("chat");
    assert_eq!(response.usage.total_tokens, 19);
    assert_eq!(
        last_body(&server).await,
        json!({
            "model": "llama3.1",
            "messages": [{"role": "user", "content": "Powerhouse of the cell?"}],
            "stream": false,
            "options": {"num_predict": 50, "repeat_penalty": 1.2}
        })
    );
}
