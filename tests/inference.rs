//! Inference dispatch against mock backend servers

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use citadel_agent::broker::{EventKind, JobEvents, StreamEvent};
use citadel_agent::inference::{
    BackendRegistry, DispatcherSettings, InferenceDispatcher, OllamaPullHandler,
};
use citadel_agent::jobs::{HandlerOutcome, Job, JobHandler, JobKind, Payload};
use citadel_agent::{Error, InferenceHandler};
use serde_json::{Value, json};
use tokio::sync::Mutex;

mod common;
use common::MemoryBroker;

/// Scripted backend: answers readiness probes and replays a response body
struct Mock {
    unready_probes: AtomicUsize,
    probes: AtomicUsize,
    status: StatusCode,
    chunks: Vec<&'static str>,
    requests: Mutex<Vec<(String, Value)>>,
}

impl Mock {
    fn new(status: StatusCode, chunks: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            unready_probes: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            status,
            chunks,
            requests: Mutex::new(Vec::new()),
        })
    }
}

async fn health(State(mock): State<Arc<Mock>>) -> StatusCode {
    mock.probes.fetch_add(1, Ordering::SeqCst);
    let unready = mock
        .unready_probes
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if unready {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn generate(State(mock): State<Arc<Mock>>, uri: Uri, Json(body): Json<Value>) -> Response {
    mock.requests
        .lock()
        .await
        .push((uri.path().to_string(), body));
    let chunks: Vec<Result<&'static str, std::io::Error>> =
        mock.chunks.iter().copied().map(Ok).collect();
    (mock.status, Body::from_stream(futures::stream::iter(chunks))).into_response()
}

/// Serve `mock` on an ephemeral port as every backend at once
async fn serve(mock: Arc<Mock>) -> String {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/tags", get(health))
        .route("/v1/completions", post(generate))
        .route("/v1/chat/completions", post(generate))
        .route("/api/generate", post(generate))
        .route("/api/chat", post(generate))
        .route("/completion", post(generate))
        .route("/api/pull", post(generate))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn dispatcher(base_url: &str) -> InferenceDispatcher {
    let settings = DispatcherSettings {
        readiness_interval: Duration::from_millis(20),
        readiness_max_wait: Duration::from_secs(2),
        ..DispatcherSettings::default()
    };
    InferenceDispatcher::new(
        BackendRegistry::standard(base_url, base_url, base_url),
        settings,
    )
    .unwrap()
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

async fn events(broker: &MemoryBroker, job_id: &str) -> Vec<StreamEvent> {
    broker
        .published_on(&format!("stream:v1:{job_id}"))
        .await
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap())
        .collect()
}

fn chunks(events: &[StreamEvent]) -> Vec<(u64, String)> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::Chunk)
        .map(|e| {
            (
                e.data["index"].as_u64().unwrap(),
                e.data["content"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn relays_vllm_stream_in_order() {
    // lines deliberately split across body chunks
    let mock = Mock::new(
        StatusCode::OK,
        vec![
            "data: {\"choices\":[{\"te",
            "xt\":\"Hel\"}]}\n\ndata: {\"choices\":[{\"text\":\"lo\"}]}\n",
            "\ndata: {\"choices\":[{\"text\":\"\",\"finish_reason\":\"length\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        ],
    );
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-1");

    let result = dispatcher(&url)
        .execute(
            &payload(json!({"model": "llama-3", "prompt": "say hello", "stream": true})),
            &mut job_events,
        )
        .await
        .unwrap();

    assert_eq!(result.content, "Hello");
    assert_eq!(result.finish_reason, "length");
    assert_eq!(result.usage.total_tokens, 5);
    assert_eq!(result.model, "llama-3");

    let published = events(&broker, "job-1").await;
    assert_eq!(
        chunks(&published),
        vec![(0, "Hel".to_string()), (1, "lo".to_string())]
    );
    let ends: Vec<_> = published
        .iter()
        .filter(|e| e.kind == EventKind::End)
        .collect();
    assert_eq!(ends.len(), 1);
    assert_eq!(published.last().unwrap().kind, EventKind::End);
    assert_eq!(ends[0].data["result"]["content"], "Hello");
    assert_eq!(ends[0].data["result"]["usage"]["prompt_tokens"], 3);

    let requests = mock.requests.lock().await;
    assert_eq!(requests.len(), 1);
    let (path, body) = &requests[0];
    assert_eq!(path, "/v1/completions");
    assert_eq!(body["model"], "llama-3");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 512);
    assert_eq!(body["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn relays_llamacpp_stream() {
    let mock = Mock::new(
        StatusCode::OK,
        vec![
            "data: {\"content\":\"A\",\"stop\":false}\n\n",
            "data: {\"content\":\"B\",\"stop\":false}\n\ndata: {\"content\":\"\",",
            "\"stop\":true,\"tokens_evaluated\":3,\"tokens_predicted\":2}\n\n",
        ],
    );
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-ll");

    let result = dispatcher(&url)
        .execute(
            &payload(json!({"model": "qwen", "backend": "llamacpp", "prompt": "ab", "stream": true})),
            &mut job_events,
        )
        .await
        .unwrap();

    assert_eq!(result.content, "AB");
    assert_eq!(result.usage.prompt_tokens, 3);
    assert_eq!(result.usage.completion_tokens, 2);
    assert_eq!(result.usage.total_tokens, 5);

    let published = events(&broker, "job-ll").await;
    assert_eq!(
        chunks(&published),
        vec![(0, "A".to_string()), (1, "B".to_string())]
    );
    let ends = published
        .iter()
        .filter(|e| e.kind == EventKind::End)
        .count();
    assert_eq!(ends, 1);
    assert_eq!(published.last().unwrap().kind, EventKind::End);

    let requests = mock.requests.lock().await;
    let (path, body) = &requests[0];
    assert_eq!(path, "/completion");
    assert_eq!(body["stream"], true);
}

#[tokio::test]
async fn stream_cut_off_before_completion_is_an_error() {
    let mock = Mock::new(
        StatusCode::OK,
        vec!["data: {\"choices\":[{\"text\":\"Hel\"}]}\n\n"],
    );
    let url = serve(mock).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-cut");

    let err = dispatcher(&url)
        .execute(
            &payload(json!({"model": "m", "prompt": "hi", "stream": true})),
            &mut job_events,
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::Backend(ref m) if m.contains("without completion")),
        "{err}"
    );
    let published = events(&broker, "job-cut").await;
    assert_eq!(chunks(&published), vec![(0, "Hel".to_string())]);
    assert!(published.iter().all(|e| e.kind != EventKind::End));
}

#[tokio::test]
async fn handler_retries_stream_cut_off_before_completion() {
    let mock = Mock::new(
        StatusCode::OK,
        vec!["{\"message\":{\"content\":\"Hi\"},\"done\":false}\n"],
    );
    let url = serve(mock).await;
    let broker = MemoryBroker::new();
    let handler = InferenceHandler::new(Arc::new(dispatcher(&url)), broker.clone());

    let outcome = handler
        .handle(&job(
            "job-cut-2",
            json!({"model": "m", "backend": "ollama", "prompt": "hi", "stream": true}),
        ))
        .await;

    assert!(matches!(outcome, HandlerOutcome::Transient(_)), "{outcome:?}");
    let published = events(&broker, "job-cut-2").await;
    assert!(published.iter().all(|e| e.kind != EventKind::End));
    let error = published
        .iter()
        .find(|e| e.kind == EventKind::Error)
        .expect("error event");
    assert_eq!(error.data["recoverable"], true);
}

#[tokio::test]
async fn relays_ollama_chat_stream() {
    let mock = Mock::new(
        StatusCode::OK,
        vec![
            "{\"message\":{\"content\":\"Hi\"},\"done\":false}\n",
            "{\"message\":{\"content\":\" there\"},\"done\":false}\n{\"message\":{\"content\":\"\"},",
            "\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":4,\"eval_count\":2}\n",
        ],
    );
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-2");

    let result = dispatcher(&url)
        .execute(
            &payload(json!({
                "model": "llama3:8b",
                "backend": "ollama",
                "stream": true,
                "temperature": 0.2,
                "messages": [{"role": "user", "content": "hello"}]
            })),
            &mut job_events,
        )
        .await
        .unwrap();

    assert_eq!(result.content, "Hi there");
    assert_eq!(result.finish_reason, "stop");
    assert_eq!(result.usage.prompt_tokens, 4);
    assert_eq!(result.usage.completion_tokens, 2);
    assert_eq!(result.usage.total_tokens, 6);
    assert_eq!(
        chunks(&events(&broker, "job-2").await),
        vec![(0, "Hi".to_string()), (1, " there".to_string())]
    );

    let requests = mock.requests.lock().await;
    let (path, body) = &requests[0];
    assert_eq!(path, "/api/chat");
    assert_eq!(body["messages"][0]["content"], "hello");
    assert_eq!(body["options"]["temperature"], 0.2);
}

#[tokio::test]
async fn non_streaming_request_publishes_single_chunk() {
    let mock = Mock::new(
        StatusCode::OK,
        vec!["{\"content\":\"42\",\"stop\":true,\"tokens_evaluated\":5,\"tokens_predicted\":1}"],
    );
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-3");

    let result = dispatcher(&url)
        .execute(
            &payload(json!({"model": "qwen", "backend": "llamacpp", "prompt": "6*7?"})),
            &mut job_events,
        )
        .await
        .unwrap();

    assert_eq!(result.content, "42");
    assert_eq!(result.usage.total_tokens, 6);

    let published = events(&broker, "job-3").await;
    assert_eq!(chunks(&published), vec![(0, "42".to_string())]);
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].kind, EventKind::End);

    let requests = mock.requests.lock().await;
    let (path, body) = &requests[0];
    assert_eq!(path, "/completion");
    assert_eq!(body["prompt"], "6*7?");
    assert_eq!(body["stream"], false);
}

#[tokio::test]
async fn backend_error_status_is_reported() {
    let mock = Mock::new(StatusCode::INTERNAL_SERVER_ERROR, vec!["model not loaded"]);
    let url = serve(mock).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-4");

    let err = dispatcher(&url)
        .execute(
            &payload(json!({"model": "m", "prompt": "hi"})),
            &mut job_events,
        )
        .await
        .unwrap_err();

    match err {
        Error::Backend(message) => {
            assert!(message.contains("500"), "{message}");
            assert!(message.contains("model not loaded"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(events(&broker, "job-4").await.is_empty());
}

#[tokio::test]
async fn waits_for_backend_readiness() {
    let mock = Mock::new(
        StatusCode::OK,
        vec!["{\"choices\":[{\"text\":\" ok \",\"finish_reason\":\"stop\"}]}"],
    );
    mock.unready_probes.store(2, Ordering::SeqCst);
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-5");

    let result = dispatcher(&url)
        .execute(
            &payload(json!({"model": "m", "prompt": "hi"})),
            &mut job_events,
        )
        .await
        .unwrap();

    assert_eq!(result.content, "ok");
    assert_eq!(mock.probes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_on_backend_that_never_becomes_ready() {
    let mock = Mock::new(StatusCode::OK, vec![]);
    mock.unready_probes.store(usize::MAX, Ordering::SeqCst);
    let url = serve(mock.clone()).await;
    let settings = DispatcherSettings {
        readiness_interval: Duration::from_millis(20),
        readiness_max_wait: Duration::from_millis(150),
        ..DispatcherSettings::default()
    };
    let dispatcher =
        InferenceDispatcher::new(BackendRegistry::standard(&url, &url, &url), settings).unwrap();
    let broker = MemoryBroker::new();
    let mut job_events = JobEvents::new(broker.clone(), "job-6");

    let err = dispatcher
        .execute(
            &payload(json!({"model": "m", "prompt": "hi"})),
            &mut job_events,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Backend(ref m) if m.contains("not ready")), "{err}");
    assert!(mock.probes.load(Ordering::SeqCst) >= 2);
    assert!(mock.requests.lock().await.is_empty());
}

fn job(id: &str, payload_value: Value) -> Job {
    job_of(JobKind::LlmInference, id, payload_value)
}

fn job_of(kind: JobKind, id: &str, payload_value: Value) -> Job {
    Job {
        id: id.to_string(),
        kind,
        payload: payload(payload_value),
        fields: BTreeMap::new(),
    }
}

#[tokio::test]
async fn handler_drops_unsupported_backend() {
    let broker = MemoryBroker::new();
    let handler = InferenceHandler::new(
        Arc::new(dispatcher("http://127.0.0.1:9")),
        broker.clone(),
    );

    let outcome = handler
        .handle(&job(
            "job-7",
            json!({"model": "m", "prompt": "hi", "backend": "tgi"}),
        ))
        .await;

    assert!(matches!(outcome, HandlerOutcome::Permanent(ref m) if m.contains("tgi")));
    let published = events(&broker, "job-7").await;
    let kinds: Vec<_> = published.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Start, EventKind::Error]);
    assert_eq!(published[1].data["recoverable"], false);
}

#[tokio::test]
async fn handler_drops_invalid_payload() {
    let broker = MemoryBroker::new();
    let handler = InferenceHandler::new(
        Arc::new(dispatcher("http://127.0.0.1:9")),
        broker.clone(),
    );

    let outcome = handler.handle(&job("job-8", json!({"prompt": "hi"}))).await;
    assert!(matches!(outcome, HandlerOutcome::Permanent(_)));
}

#[tokio::test]
async fn handler_leaves_backend_failure_for_retry() {
    let mock = Mock::new(StatusCode::SERVICE_UNAVAILABLE, vec!["busy"]);
    let url = serve(mock).await;
    let broker = MemoryBroker::new();
    let handler = InferenceHandler::new(Arc::new(dispatcher(&url)), broker.clone());

    let outcome = handler
        .handle(&job("job-9", json!({"model": "m", "prompt": "hi"})))
        .await;

    assert!(matches!(outcome, HandlerOutcome::Transient(_)));
    let published = events(&broker, "job-9").await;
    let error = published
        .iter()
        .find(|e| e.kind == EventKind::Error)
        .expect("error event");
    assert_eq!(error.data["recoverable"], true);
    assert!(chunks(&published).is_empty());
}

#[tokio::test]
async fn pinned_handler_ignores_payload_backend() {
    let mock = Mock::new(
        StatusCode::OK,
        vec!["{\"choices\":[{\"text\":\"ok\",\"finish_reason\":\"stop\"}]}"],
    );
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let kind = JobKind::VllmInference;
    let handler = InferenceHandler::for_backend(
        Arc::new(dispatcher(&url)),
        broker.clone(),
        kind.pinned_backend().unwrap(),
    );

    let outcome = handler
        .handle(&job_of(
            kind,
            "job-10",
            json!({"model": "m", "prompt": "hi", "backend": "ollama"}),
        ))
        .await;

    assert_eq!(outcome, HandlerOutcome::Success);
    let requests = mock.requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "/v1/completions");
}

#[tokio::test]
async fn pull_handler_pulls_named_model() {
    let mock = Mock::new(StatusCode::OK, vec!["{\"status\":\"success\"}"]);
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let handler = OllamaPullHandler::new(&url, broker.clone()).unwrap();

    let outcome = handler
        .handle(&job_of(JobKind::OllamaPull, "job-11", json!({"model": "llama3:8b"})))
        .await;

    assert_eq!(outcome, HandlerOutcome::Success);
    let requests = mock.requests.lock().await;
    let (path, body) = &requests[0];
    assert_eq!(path, "/api/pull");
    assert_eq!(body["model"], "llama3:8b");
    assert_eq!(body["stream"], false);

    let published = events(&broker, "job-11").await;
    let kinds: Vec<_> = published.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Start, EventKind::End]);
    assert_eq!(published[1].data["result"]["model"], "llama3:8b");
    assert_eq!(published[1].data["result"]["status"], "success");
}

#[tokio::test]
async fn pull_without_model_is_dropped() {
    let mock = Mock::new(StatusCode::OK, vec!["{\"status\":\"success\"}"]);
    let url = serve(mock.clone()).await;
    let broker = MemoryBroker::new();
    let handler = OllamaPullHandler::new(&url, broker.clone()).unwrap();

    let outcome = handler
        .handle(&job_of(JobKind::OllamaPull, "job-12", json!({"model": " "})))
        .await;

    assert!(matches!(outcome, HandlerOutcome::Permanent(ref m) if m.contains("model")));
    assert!(mock.requests.lock().await.is_empty());
    let published = events(&broker, "job-12").await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].kind, EventKind::Error);
    assert_eq!(published[0].data["recoverable"], false);
}

#[tokio::test]
async fn pull_failures_are_classified() {
    let server_error = Mock::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        vec!["{\"error\":\"registry unreachable\"}"],
    );
    let url = serve(server_error).await;
    let handler = OllamaPullHandler::new(&url, MemoryBroker::new()).unwrap();
    let outcome = handler
        .handle(&job_of(JobKind::OllamaPull, "job-13", json!({"model": "m"})))
        .await;
    assert!(
        matches!(outcome, HandlerOutcome::Transient(ref m) if m.contains("registry unreachable")),
        "{outcome:?}"
    );

    let rejected = Mock::new(StatusCode::BAD_REQUEST, vec!["{\"error\":\"invalid model name\"}"]);
    let url = serve(rejected).await;
    let handler = OllamaPullHandler::new(&url, MemoryBroker::new()).unwrap();
    let outcome = handler
        .handle(&job_of(JobKind::OllamaPull, "job-14", json!({"model": "NOT A MODEL"})))
        .await;
    assert!(matches!(outcome, HandlerOutcome::Permanent(_)), "{outcome:?}");

    let unfinished = Mock::new(StatusCode::OK, vec!["{\"status\":\"pulling manifest\"}"]);
    let url = serve(unfinished).await;
    let handler = OllamaPullHandler::new(&url, MemoryBroker::new()).unwrap();
    let outcome = handler
        .handle(&job_of(JobKind::OllamaPull, "job-15", json!({"model": "m"})))
        .await;
    assert!(matches!(outcome, HandlerOutcome::Transient(_)), "{outcome:?}");
}
