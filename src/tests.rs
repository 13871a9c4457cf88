use super::*;
use crate::recording::{ApiRecorder, PlaybackState};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// What the mock endpoint answers with
#[derive(Clone)]
enum MockReply {
    Json(StatusCode, Value),
    Text(StatusCode, String),
    Stream(Vec<Vec<u8>>),
    SlowStream(Vec<Vec<u8>>, Duration),
    BrokenStream(Vec<Vec<u8>>),
    /// Wait before sending the response headers
    Delayed(Duration, Box<MockReply>),
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    authorization: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl Captured {
    fn all(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

// Chunk collector for streaming tests
#[derive(Clone)]
struct ChunkCollector {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl ChunkCollector {
    fn new() -> Self {
        Self {
            chunks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn callback(&self) -> StreamingCallback {
        let chunks = self.chunks.clone();
        Box::new(move |chunk: &str| {
            chunks.lock().unwrap().push(chunk.to_string());
            Ok(())
        })
    }

    fn get_chunks(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }
}

fn sse_delta(content: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"delta": {"content": content}, "finish_reason": null}]})
    )
    .into_bytes()
}

fn sse_done() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

fn stream_body(chunks: Vec<Vec<u8>>) -> axum::body::Body {
    let stream = stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk))),
    );
    axum::body::Body::from_stream(stream)
}

fn event_stream(body: axum::body::Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

fn render(reply: MockReply) -> Response {
    match reply {
        MockReply::Json(status, value) => (status, Json(value)).into_response(),
        MockReply::Text(status, text) => (status, text).into_response(),
        MockReply::Stream(chunks) => event_stream(stream_body(chunks)),
        MockReply::SlowStream(chunks, delay) => {
            let stream = stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(Bytes::from(chunk))
            });
            event_stream(axum::body::Body::from_stream(stream))
        }
        MockReply::BrokenStream(chunks) => {
            let mut items: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
                chunks.into_iter().map(Ok).collect();
            items.push(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "upstream went away",
            )));
            let stream = stream::iter(items).then(|item| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                item.map(Bytes::from)
            });
            event_stream(axum::body::Body::from_stream(stream))
        }
        MockReply::Delayed(_, inner) => render(*inner),
    }
}

// Helper to create a mock server; returns the base URL and captured requests
async fn create_mock_server(reply: MockReply) -> (String, Captured) {
    let captured = Captured::default();
    let requests = captured.requests.clone();

    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let reply = reply.clone();
                let requests = requests.clone();
                async move {
                    requests.lock().unwrap().push(CapturedRequest {
                        authorization: headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string),
                        body,
                    });
                    let reply = match reply {
                        MockReply::Delayed(delay, inner) => {
                            tokio::time::sleep(delay).await;
                            *inner
                        }
                        other => other,
                    };
                    render(reply)
                }
            }),
        )
        .route(
            "/v1/models",
            get(|| async {
                Json(json!({
                    "object": "list",
                    "data": [
                        {"id": "gpt-3.5-turbo", "object": "model"},
                        {"id": "gpt-4o", "object": "model"}
                    ]
                }))
            }),
        );

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = TcpListener::bind(addr).await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{server_addr}/v1"), captured)
}

fn test_client(base_url: &str) -> OpenAIClient {
    OpenAIClient::new(
        ClientConfig::new("test-key")
            .with_base_url(base_url)
            .with_fallback_word_delay(Duration::ZERO),
    )
}

fn scenario_messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are helpful"),
        ChatMessage::user("Show top locations"),
    ]
}

const SCENARIO_FRAGMENTS: [&str; 4] = [
    "Denver ",
    "leads ",
    "sales.\n\n#PORTAL:\n",
    "{\"chart_type\":\"bar\"}",
];

#[tokio::test]
async fn non_streaming_returns_content_unmodified() -> anyhow::Result<()> {
    let content = "  Hi! How can I help you today?\n#PORTAL: {\"a\":1}  ";
    let (url, captured) = create_mock_server(MockReply::Json(
        StatusCode::OK,
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 8, "total_tokens": 18}
        }),
    ))
    .await;

    let client = test_client(&url);
    let response = client
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await?;

    assert_eq!(response.text, content);
    assert!(!response.fallback && !response.is_partial());

    let requests = captured.all();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(requests[0].body["stream"], false);
    assert_eq!(requests[0].body["model"], "gpt-3.5-turbo");
    assert_eq!(requests[0].body["messages"], json!(scenario_messages()));
    Ok(())
}

#[tokio::test]
async fn streaming_scenario_delivers_fragments_and_portal() -> anyhow::Result<()> {
    let mut chunks: Vec<Vec<u8>> = SCENARIO_FRAGMENTS.iter().map(|f| sse_delta(f)).collect();
    chunks.push(sse_done());
    let (url, captured) = create_mock_server(MockReply::Stream(chunks)).await;

    let client = test_client(&url);
    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let response = client
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await?;

    assert_eq!(collector.get_chunks(), SCENARIO_FRAGMENTS.to_vec());
    assert_eq!(response.text, SCENARIO_FRAGMENTS.concat());
    assert_eq!(captured.all()[0].body["stream"], true);

    let reply = extract_portal(&response.text);
    assert_eq!(reply.message, "Denver leads sales.");
    assert_eq!(
        reply.portal_payload.as_deref(),
        Some("{\"chart_type\":\"bar\"}")
    );
    assert_eq!(reply.parse_payload()?, json!({"chart_type": "bar"}));
    Ok(())
}

#[tokio::test]
async fn streaming_handles_lines_split_across_chunks() -> anyhow::Result<()> {
    let mut body = Vec::new();
    for fragment in ["Grüße ", "aus ", "Köln"] {
        body.extend(sse_delta(fragment));
    }
    body.extend(sse_done());
    // Cut into small pieces that split lines and multi-byte characters
    let chunks: Vec<Vec<u8>> = body.chunks(7).map(|c| c.to_vec()).collect();
    let (url, _) = create_mock_server(MockReply::Stream(chunks)).await;

    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let response = test_client(&url)
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await?;

    assert_eq!(collector.get_chunks(), vec!["Grüße ", "aus ", "Köln"]);
    assert_eq!(response.text, "Grüße aus Köln");
    Ok(())
}

#[tokio::test]
async fn malformed_stream_line_is_skipped() -> anyhow::Result<()> {
    let chunks = vec![
        sse_delta("first "),
        b"data: {\"choices\": [ this is not json\n\n".to_vec(),
        sse_delta("second "),
        sse_delta("third"),
        sse_done(),
    ];
    let (url, _) = create_mock_server(MockReply::Stream(chunks)).await;

    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let response = test_client(&url)
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await?;

    assert_eq!(collector.get_chunks(), vec!["first ", "second ", "third"]);
    assert_eq!(response.text, "first second third");
    Ok(())
}

#[tokio::test]
async fn rate_limit_streams_fallback_word_by_word() -> anyhow::Result<()> {
    let (url, _) = create_mock_server(MockReply::Json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "Rate limit reached", "type": "requests"}}),
    ))
    .await;

    let client = test_client(&url);
    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let response = client
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await?;

    assert!(response.fallback);
    assert!(response.text.contains("Show top locations"));
    let words = response.text.split(' ').count();
    let chunks = collector.get_chunks();
    assert!(chunks.len() >= words);
    assert_eq!(chunks.concat().trim_end(), response.text);
    Ok(())
}

#[tokio::test]
async fn rate_limit_without_callback_returns_fallback() -> anyhow::Result<()> {
    let (url, _) =
        create_mock_server(MockReply::Text(StatusCode::TOO_MANY_REQUESTS, String::new())).await;

    let response = test_client(&url)
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await?;

    assert!(response.fallback);
    assert_eq!(response.text, rate_limit_fallback_text(&scenario_messages()));
    Ok(())
}

#[tokio::test]
async fn missing_credential_fails_before_network() {
    let (url, captured) = create_mock_server(MockReply::Stream(vec![sse_done()])).await;
    let client = OpenAIClient::new(ClientConfig::default().with_base_url(&url));

    let err = client
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Config(_)));
    assert!(err.to_string().contains("NEXT_PUBLIC_OPENAI_KEY"));
    assert!(captured.all().is_empty());
}

#[tokio::test]
async fn empty_message_list_is_rejected() {
    let (url, captured) = create_mock_server(MockReply::Stream(vec![sse_done()])).await;
    let err = test_client(&url)
        .send_messages(&[], None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
    assert!(captured.all().is_empty());
}

#[tokio::test]
async fn error_body_message_is_surfaced() {
    let (url, _) = create_mock_server(MockReply::Json(
        StatusCode::UNAUTHORIZED,
        json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}}),
    ))
    .await;

    let err = test_client(&url)
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Api(ApiError::Authentication(ref message)) if message == "Incorrect API key provided"
    ));
}

#[tokio::test]
async fn error_without_body_uses_status_line() {
    let (url, _) =
        create_mock_server(MockReply::Text(StatusCode::SERVICE_UNAVAILABLE, String::new())).await;

    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let err = test_client(&url)
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Service error: Request failed with status 503 Service Unavailable"
    );
    assert!(collector.get_chunks().is_empty());
}

#[tokio::test]
async fn cancellation_returns_partial_text() -> anyhow::Result<()> {
    let chunks = vec![
        sse_delta("one "),
        sse_delta("two "),
        sse_delta("three "),
        sse_done(),
    ];
    let (url, _) =
        create_mock_server(MockReply::SlowStream(chunks, Duration::from_millis(100))).await;

    let cancel = CancellationToken::new();
    let collector = ChunkCollector::new();
    let chunks = collector.chunks.clone();
    let stop = cancel.clone();
    let callback: StreamingCallback = Box::new(move |chunk: &str| {
        chunks.lock().unwrap().push(chunk.to_string());
        stop.cancel();
        Ok(())
    });

    let response = test_client(&url)
        .send_messages(&scenario_messages(), Some(&callback), &cancel)
        .await?;

    assert!(response.cancelled);
    assert!(response.is_partial());
    assert_eq!(response.text, "one ");
    assert_eq!(collector.get_chunks(), vec!["one "]);
    Ok(())
}

#[tokio::test]
async fn body_error_keeps_partial_text() -> anyhow::Result<()> {
    let (url, _) =
        create_mock_server(MockReply::BrokenStream(vec![sse_delta("partial ")])).await;

    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let response = test_client(&url)
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await?;

    assert!(response.truncated);
    assert!(response.is_partial());
    assert!(!response.cancelled);
    assert_eq!(response.text, "partial ");
    Ok(())
}

#[tokio::test]
async fn recorded_stream_plays_back_without_network() -> anyhow::Result<()> {
    let mut chunks: Vec<Vec<u8>> = SCENARIO_FRAGMENTS.iter().map(|f| sse_delta(f)).collect();
    chunks.push(sse_done());
    let (url, _) = create_mock_server(MockReply::Stream(chunks)).await;

    let dir = tempfile::tempdir()?;
    let recording = dir.path().join("session.json");

    let recording_client = test_client(&url).with_recorder(&recording);
    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let live = recording_client
        .send_messages(&scenario_messages(), Some(&callback), &CancellationToken::new())
        .await?;

    // No key and an unreachable base URL: playback must not touch the network
    let playback = PlaybackState::from_file(&recording, true)?;
    assert_eq!(playback.session_count(), 1);
    let replay_client =
        OpenAIClient::new(ClientConfig::default().with_base_url("http://127.0.0.1:9"))
            .with_playback(playback);
    let replay_collector = ChunkCollector::new();
    let replay_callback = replay_collector.callback();
    let replayed = replay_client
        .send_messages(
            &scenario_messages(),
            Some(&replay_callback),
            &CancellationToken::new(),
        )
        .await?;

    assert_eq!(replayed.text, live.text);
    assert_eq!(replay_collector.get_chunks(), collector.get_chunks());

    let exhausted = replay_client
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await;
    assert!(matches!(exhausted, Err(ClientError::Config(_))));
    Ok(())
}

#[tokio::test]
async fn list_models_returns_ids() -> anyhow::Result<()> {
    let (url, _) = create_mock_server(MockReply::Stream(vec![])).await;
    let models = test_client(&url).list_models().await?;
    assert_eq!(models, vec!["gpt-3.5-turbo", "gpt-4o"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_trait_object_streams_through_event_channel() -> anyhow::Result<()> {
    let mut chunks: Vec<Vec<u8>> = SCENARIO_FRAGMENTS.iter().map(|f| sse_delta(f)).collect();
    chunks.push(sse_done());
    let (url, _) = create_mock_server(MockReply::Stream(chunks)).await;

    let provider: Arc<dyn CompletionProvider> = Arc::new(test_client(&url));
    let handle = spawn_completion(provider, scenario_messages(), PortalBoundary::EndOfText);
    let events = handle.collect().await;

    let fragments: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Fragment(text) => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(fragments, SCENARIO_FRAGMENTS.to_vec());
    assert!(events.contains(&ChatEvent::PortalStarted));

    let Some(ChatEvent::Completed { reply, .. }) = events.last() else {
        panic!("stream did not complete: {events:?}");
    };
    let resolved = reply.clone().resolve(PayloadPolicy::Ignore);
    assert_eq!(resolved.message, "Denver leads sales.");
    assert_eq!(resolved.visualization, Some(json!({"chart_type": "bar"})));
    Ok(())
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn cancellation_before_headers_returns_empty_response() -> anyhow::Result<()> {
    let (url, captured) = create_mock_server(MockReply::Delayed(
        Duration::from_secs(3),
        Box::new(MockReply::Stream(vec![sse_delta("late"), sse_done()])),
    ))
    .await;

    let started = Instant::now();
    let collector = ChunkCollector::new();
    let callback = collector.callback();
    let response = test_client(&url)
        .send_messages(
            &scenario_messages(),
            Some(&callback),
            &cancel_after(Duration::from_millis(100)),
        )
        .await?;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(response.cancelled);
    assert!(response.text.is_empty());
    assert!(collector.get_chunks().is_empty());
    assert_eq!(captured.all().len(), 1);
    Ok(())
}

#[tokio::test]
async fn cancellation_during_complete_body_read_returns_empty_response() -> anyhow::Result<()> {
    let body = json!({"choices": [{"message": {"role": "assistant", "content": "too late"}}]})
        .to_string()
        .into_bytes();
    let (head, tail) = body.split_at(10);
    let (url, _) = create_mock_server(MockReply::SlowStream(
        vec![head.to_vec(), tail.to_vec()],
        Duration::from_secs(1),
    ))
    .await;

    let started = Instant::now();
    let response = test_client(&url)
        .send_messages(
            &scenario_messages(),
            None,
            &cancel_after(Duration::from_millis(200)),
        )
        .await?;

    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(response.cancelled);
    assert!(response.text.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_requests_leave_no_recording_behind() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("failures.json");
    let recorder = ApiRecorder::new(&path);

    let (limited_url, _) = create_mock_server(MockReply::Json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "Rate limit reached"}}),
    ))
    .await;
    let response = test_client(&limited_url)
        .with_api_recorder(recorder.clone())
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await?;
    assert!(response.fallback);
    assert!(!recorder.is_recording());

    let (failing_url, _) = create_mock_server(MockReply::Json(
        StatusCode::UNAUTHORIZED,
        json!({"error": {"message": "Incorrect API key provided"}}),
    ))
    .await;
    let result = test_client(&failing_url)
        .with_api_recorder(recorder.clone())
        .send_messages(&scenario_messages(), None, &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert!(!recorder.is_recording());
    assert!(!path.exists());
    Ok(())
}

