//! End-to-end tests of the provider contract across all five adapters.
//!
//! Each adapter is built through `ProviderFactory` and pointed at a
//! `wiremock` server, so these run without network access or credentials.

use std::sync::Arc;

use futures::StreamExt;
use switchyard_llm::{
    ChatMessage, ChatRequest, FinishReason, Framing, LLMProvider, LlmError, OllamaProvider,
    ProviderFactory, ProviderSettings, ProviderType, StreamErrorKind, StreamEvent, TokenUsage,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> ChatRequest {
    ChatRequest::new("", vec![ChatMessage::user("Say hi")]).with_max_tokens(32)
}

fn provider_for(provider_type: ProviderType, server: &MockServer) -> Arc<dyn LLMProvider> {
    let settings = ProviderSettings::new(provider_type).with_base_url(server.uri());
    let credential = (!provider_type.is_local()).then(|| "test-key".to_string());
    ProviderFactory::create(&settings, credential).expect("factory should build provider")
}

fn text_of(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn done_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_done()).count()
}

#[tokio::test]
async fn test_every_adapter_reports_http_failure_in_band() {
    for provider_type in ProviderType::ALL {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = provider_for(provider_type, &server);
        let events: Vec<StreamEvent> = provider
            .stream(&request(), CancellationToken::new())
            .collect()
            .await;

        assert_eq!(events.len(), 2, "{}: {:?}", provider_type, events);
        match &events[0] {
            StreamEvent::Error { error } => {
                assert_eq!(error.kind, StreamErrorKind::Http, "{}", provider_type);
                assert_eq!(error.status, Some(500), "{}", provider_type);
            }
            other => panic!("{}: expected error, got {:?}", provider_type, other),
        }
        assert_eq!(events[1], StreamEvent::synthetic_done(), "{}", provider_type);
    }
}

#[tokio::test]
async fn test_every_adapter_chat_maps_status() {
    for provider_type in ProviderType::ALL {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let provider = provider_for(provider_type, &server);
        let err = provider.chat(&request()).await.unwrap_err();
        assert!(
            matches!(&err, LlmError::Http { status: 401, body, .. } if body.contains("bad key")),
            "{}: {:?}",
            provider_type,
            err
        );
    }
}

#[tokio::test]
async fn test_every_adapter_stream_is_lazy() {
    for provider_type in ProviderType::ALL {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let provider = provider_for(provider_type, &server);
        let stream = provider.stream(&request(), CancellationToken::new());
        drop(stream);
        server.verify().await;
    }
}

#[tokio::test]
async fn test_cancel_before_poll_yields_nothing() {
    for provider_type in ProviderType::ALL {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let provider = provider_for(provider_type, &server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<StreamEvent> = provider.stream(&request(), cancel).collect().await;
        assert!(events.is_empty(), "{}: {:?}", provider_type, events);
    }
}

#[tokio::test]
async fn test_unreachable_backend_reports_transport_error() {
    let settings =
        ProviderSettings::new(ProviderType::Ollama).with_base_url("http://127.0.0.1:1");
    let provider = ProviderFactory::create(&settings, None).unwrap();

    let events: Vec<StreamEvent> = provider
        .stream(&request(), CancellationToken::new())
        .collect()
        .await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], StreamEvent::Error { error } if error.kind == StreamErrorKind::Transport));
    assert_eq!(events[1], StreamEvent::synthetic_done());
    assert!(!provider.validate_connection().await);
}

#[tokio::test]
async fn test_anthropic_stream_end_to_end() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-x\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let provider = provider_for(ProviderType::Anthropic, &server);
    let events: Vec<StreamEvent> = provider
        .stream(&request(), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(text_of(&events), "Hi there");
    assert_eq!(done_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(TokenUsage::new(12, 4), FinishReason::Stop))
    );
}

#[tokio::test]
async fn test_gemini_stream_end_to_end() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\" there\"}]},\"finishReason\":\"STOP\"}],",
        "\"usageMetadata\":{\"promptTokenCount\":7,\"candidatesTokenCount\":3,\"totalTokenCount\":10}}\n\n",
    );
    Mock::given(method("POST"))
        .and(path_regex(r":streamGenerateContent$"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let provider = provider_for(ProviderType::Gemini, &server);
    let events: Vec<StreamEvent> = provider
        .stream(&request(), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(text_of(&events), "Hi there");
    assert_eq!(done_count(&events), 1);
    match events.last() {
        Some(StreamEvent::Done {
            usage,
            finish_reason,
        }) => {
            assert_eq!(usage.input_tokens, 7);
            assert_eq!(usage.output_tokens, 3);
            assert_eq!(*finish_reason, FinishReason::Stop);
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ollama_ndjson_stream_records_metrics() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,",
        "\"done_reason\":\"stop\",\"prompt_eval_count\":5,\"eval_count\":2}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let provider = OllamaProvider::builder()
        .host(server.uri())
        .metrics_capacity(4)
        .build()
        .unwrap();
    let events: Vec<StreamEvent> = provider
        .stream(&request(), CancellationToken::new())
        .collect()
        .await;

    assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
    assert_eq!(text_of(&events), "Hi there");
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(TokenUsage::new(5, 2), FinishReason::Stop))
    );

    let metrics = provider.metrics();
    assert_eq!(metrics.len().await, 1);
    assert_eq!(metrics.recent(1).await[0].model_id, "llama3.2");
}

#[tokio::test]
async fn test_lmstudio_chunked_text_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain streamed reply"))
        .mount(&server)
        .await;

    let mut settings = ProviderSettings::new(ProviderType::LMStudio).with_base_url(server.uri());
    settings.framing = Some(Framing::ChunkedText);
    let provider = ProviderFactory::create(&settings, None).unwrap();

    let events: Vec<StreamEvent> = provider
        .stream(&request(), CancellationToken::new())
        .collect()
        .await;
    assert_eq!(text_of(&events), "plain streamed reply");
    assert_eq!(done_count(&events), 1);
    assert_eq!(events.last(), Some(&StreamEvent::synthetic_done()));
}

#[tokio::test]
async fn test_traced_provider_behaves_like_inner() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],",
        "\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let settings = ProviderSettings::new(ProviderType::LMStudio)
        .with_base_url(server.uri())
        .with_tracing(true);
    let provider = ProviderFactory::create(&settings, None).unwrap();

    let events: Vec<StreamEvent> = provider
        .stream(&request(), CancellationToken::new())
        .collect()
        .await;
    assert_eq!(text_of(&events), "ok");
    assert_eq!(done_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(TokenUsage::new(3, 1), FinishReason::Stop))
    );
}
