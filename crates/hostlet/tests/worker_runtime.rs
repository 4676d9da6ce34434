//! Worker-runtime scenarios against a scripted pool.
//!
//! The pool role is played in-test: bind a loopback listener, point
//! `CHILD_TRANSPORT_ADDR` at it, and script the control conversation
//! frame by frame. The environment variable is process-global, so every
//! test touching it serializes on one lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use hostlet::bridge::envelope;
use hostlet::bridge::transport::{CHILD_TRANSPORT_ADDR, PoolListener, ServerSocket};
use hostlet::{
    Channel, ControlAction, ControlRequest, ControlResponse, Envelope, EnvironmentSpec, HostError,
    HostInit, HostTeardown, RpcBridge, SerializedSession, TestFileSpec, WORKER_MODULE_FILE,
    WorkerError, WorkerHost, WorkerRuntimeConfig, run_worker,
};

fn env_lock() -> &'static StdMutex<()> {
    static LOCK: OnceLock<StdMutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| StdMutex::new(()))
}

fn set_endpoint(value: Option<&str>) {
    // SAFETY: every test touching the variable holds `env_lock`.
    unsafe {
        match value {
            Some(value) => std::env::set_var(CHILD_TRANSPORT_ADDR, value),
            None => std::env::remove_var(CHILD_TRANSPORT_ADDR),
        }
    }
}

fn config() -> WorkerRuntimeConfig {
    WorkerRuntimeConfig {
        connect_timeout: Duration::from_secs(5),
        ready_timeout: Duration::from_secs(5),
        debug: false,
    }
}

fn session(file: &str) -> SerializedSession {
    SerializedSession {
        pool: "vscode".to_string(),
        worker_id: 1,
        config: json!({}),
        project_name: "proj".to_string(),
        files: vec![TestFileSpec::new(file)],
        environment: EnvironmentSpec::default(),
        provided_context: json!({}),
        invalidates: None,
    }
}

// ---------------------------------------------------------------------------
// Scripted pool
// ---------------------------------------------------------------------------

struct ScriptedPool {
    socket: ServerSocket,
}

impl ScriptedPool {
    async fn accept(listener: &PoolListener) -> Self {
        let socket = listener
            .accept_client(Duration::from_secs(5))
            .await
            .expect("worker connects");
        Self { socket }
    }

    async fn next_envelope(&mut self) -> Envelope {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return envelope::decode(text).expect("decodable frame");
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended while waiting for a frame: {other:?}"),
            }
        }
    }

    async fn expect_ready(&mut self) -> ControlRequest {
        let envelope = self.next_envelope().await;
        assert_eq!(envelope.channel, Channel::Control);
        let request = ControlRequest::from_payload(&envelope.payload).expect("control request");
        assert_eq!(request.action, ControlAction::Ready);
        assert!(request.ctx.is_none());
        request
    }

    async fn ack(&mut self, id: &str) {
        self.send_text(envelope::encode(
            Channel::Control,
            &ControlResponse::ok(id).to_payload(),
        ))
        .await;
    }

    async fn send_request(&mut self, request: ControlRequest) {
        self.send_text(envelope::encode(Channel::Control, &request.to_payload()))
            .await;
    }

    async fn send_rpc(&mut self, payload: Value) {
        self.send_text(envelope::encode(Channel::Rpc, &payload)).await;
    }

    async fn next_response(&mut self) -> ControlResponse {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.channel == Channel::Control {
                return ControlResponse::from_payload(&envelope.payload)
                    .expect("control response");
            }
        }
    }

    async fn next_rpc(&mut self) -> Value {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.channel == Channel::Rpc {
                return envelope.payload;
            }
        }
    }

    async fn send_text(&mut self, text: String) {
        self.socket
            .send(Message::Text(text))
            .await
            .expect("pool writes");
    }

    async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

// ---------------------------------------------------------------------------
// Recording host
// ---------------------------------------------------------------------------

struct RecordingHost {
    delay: Duration,
    fail_with: Option<String>,
    calls: StdMutex<Vec<String>>,
    init: StdMutex<Option<HostInit>>,
    bridge: StdMutex<Option<RpcBridge>>,
    torn_down: Arc<AtomicBool>,
}

impl RecordingHost {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::from_millis(50),
            fail_with: None,
            calls: StdMutex::new(Vec::new()),
            init: StdMutex::new(None),
            bridge: StdMutex::new(None),
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail_with: Some(message.to_string()),
            calls: StdMutex::new(Vec::new()),
            init: StdMutex::new(None),
            bridge: StdMutex::new(None),
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn bridge(&self) -> RpcBridge {
        self.bridge.lock().unwrap().clone().expect("setup ran")
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl WorkerHost for RecordingHost {
    async fn setup(&self, init: HostInit, bridge: RpcBridge) -> Result<HostTeardown, HostError> {
        *self.init.lock().unwrap() = Some(init);
        *self.bridge.lock().unwrap() = Some(bridge);
        let flag = Arc::clone(&self.torn_down);
        Ok(Box::new(move || flag.store(true, Ordering::SeqCst)))
    }

    async fn run_tests(&self, ctx: SerializedSession) -> Result<(), HostError> {
        tokio::time::sleep(self.delay).await;
        self.record(format!("run:{}", ctx.files[0].filepath));
        match &self.fail_with {
            Some(message) => Err(HostError::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn collect_tests(&self, ctx: SerializedSession) -> Result<(), HostError> {
        self.record(format!("collect:{}", ctx.files[0].filepath));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_endpoint_fails_fast() {
    let guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
    set_endpoint(None);

    let result = run_worker(RecordingHost::new(), config()).await;
    assert!(matches!(result, Err(WorkerError::MissingEndpoint)));

    set_endpoint(Some("   "));
    let result = run_worker(RecordingHost::new(), config()).await;
    assert!(matches!(result, Err(WorkerError::MissingEndpoint)));

    drop(guard);
}

#[tokio::test]
async fn full_session_answers_in_request_order() {
    let guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
    let listener = PoolListener::bind().await.unwrap();
    set_endpoint(Some(listener.endpoint()));

    let host = RecordingHost::new();
    let runtime = tokio::spawn(run_worker(Arc::clone(&host), config()));

    let mut pool = ScriptedPool::accept(&listener).await;
    let ready = pool.expect_ready().await;
    pool.ack(&ready.id).await;

    // Two runs queued back-to-back; responses must come out in order even
    // though the first is still executing when the second arrives.
    pool.send_request(ControlRequest::with_ctx(
        "A",
        ControlAction::Run,
        session("a.test.ts"),
    ))
    .await;
    pool.send_request(ControlRequest::with_ctx(
        "B",
        ControlAction::Run,
        session("b.test.ts"),
    ))
    .await;

    let first = pool.next_response().await;
    assert_eq!(first.id, "A");
    assert!(first.success);
    let second = pool.next_response().await;
    assert_eq!(second.id, "B");
    assert!(second.success);
    assert_eq!(host.calls(), vec!["run:a.test.ts", "run:b.test.ts"]);

    // Collect goes through the same queue.
    pool.send_request(ControlRequest::with_ctx(
        "C",
        ControlAction::Collect,
        session("c.test.ts"),
    ))
    .await;
    assert!(pool.next_response().await.success);
    assert_eq!(host.calls().last().unwrap(), "collect:c.test.ts");

    // Host setup observed its module location and the bridge.
    let init = host.init.lock().unwrap().clone().unwrap();
    assert!(init.worker_module.ends_with(WORKER_MODULE_FILE));

    // Rpc both ways.
    let mut inbound = host.bridge().subscribe();
    pool.send_rpc(json!({"t": "cancel"})).await;
    let seen = tokio::time::timeout(Duration::from_secs(2), inbound.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, json!({"t": "cancel"}));

    host.bridge().post(json!({"t": "task-update"})).unwrap();
    assert_eq!(pool.next_rpc().await, json!({"t": "task-update"}));

    // Ordered shutdown.
    pool.send_request(ControlRequest::new("S", ControlAction::Shutdown))
        .await;
    let response = pool.next_response().await;
    assert_eq!(response.id, "S");
    assert!(response.success);

    runtime.await.unwrap().unwrap();
    assert!(host.torn_down.load(Ordering::SeqCst));

    drop(guard);
}

#[tokio::test]
async fn run_without_ctx_is_rejected_and_session_continues() {
    let guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
    let listener = PoolListener::bind().await.unwrap();
    set_endpoint(Some(listener.endpoint()));

    let host = RecordingHost::new();
    let runtime = tokio::spawn(run_worker(Arc::clone(&host), config()));

    let mut pool = ScriptedPool::accept(&listener).await;
    let ready = pool.expect_ready().await;
    pool.ack(&ready.id).await;

    pool.send_request(ControlRequest::new("bad", ControlAction::Run))
        .await;
    let response = pool.next_response().await;
    assert_eq!(response.id, "bad");
    assert!(!response.success);
    assert!(response.error.unwrap().contains("without ctx"));
    assert!(host.calls().is_empty());

    pool.send_request(ControlRequest::new("S", ControlAction::Shutdown))
        .await;
    assert!(pool.next_response().await.success);
    runtime.await.unwrap().unwrap();

    drop(guard);
}

#[tokio::test]
async fn host_failure_travels_back_as_error_string() {
    let guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
    let listener = PoolListener::bind().await.unwrap();
    set_endpoint(Some(listener.endpoint()));

    let host = RecordingHost::failing("boom: assertion failed");
    let runtime = tokio::spawn(run_worker(Arc::clone(&host), config()));

    let mut pool = ScriptedPool::accept(&listener).await;
    let ready = pool.expect_ready().await;
    pool.ack(&ready.id).await;

    pool.send_request(ControlRequest::with_ctx(
        "F",
        ControlAction::Run,
        session("f.test.ts"),
    ))
    .await;
    let response = pool.next_response().await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("boom"));

    // A failed batch does not poison the worker.
    pool.send_request(ControlRequest::new("S", ControlAction::Shutdown))
        .await;
    assert!(pool.next_response().await.success);
    runtime.await.unwrap().unwrap();

    drop(guard);
}

#[tokio::test]
async fn missing_ready_ack_times_out() {
    let guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
    let listener = PoolListener::bind().await.unwrap();
    set_endpoint(Some(listener.endpoint()));

    let mut cfg = config();
    cfg.ready_timeout = Duration::from_millis(300);
    let runtime = tokio::spawn(run_worker(RecordingHost::new(), cfg));

    // Accept, read `ready`, never answer.
    let mut pool = ScriptedPool::accept(&listener).await;
    let _ready = pool.expect_ready().await;

    match runtime.await.unwrap() {
        Err(WorkerError::ReadyAckTimeout(bound)) => {
            assert_eq!(bound, Duration::from_millis(300));
        }
        other => panic!("expected ReadyAckTimeout, got {other:?}"),
    }

    drop(guard);
}

#[tokio::test]
async fn pool_disconnect_before_shutdown_is_an_error() {
    let guard = env_lock().lock().unwrap_or_else(|p| p.into_inner());
    let listener = PoolListener::bind().await.unwrap();
    set_endpoint(Some(listener.endpoint()));

    let host = RecordingHost::new();
    let runtime = tokio::spawn(run_worker(Arc::clone(&host), config()));

    let mut pool = ScriptedPool::accept(&listener).await;
    let ready = pool.expect_ready().await;
    pool.ack(&ready.id).await;

    // Prove the session is live, then vanish.
    pool.send_request(ControlRequest::with_ctx(
        "A",
        ControlAction::Run,
        session("a.test.ts"),
    ))
    .await;
    assert!(pool.next_response().await.success);
    pool.close().await;

    match runtime.await.unwrap() {
        Err(WorkerError::PoolDisconnected) => {}
        other => panic!("expected PoolDisconnected, got {other:?}"),
    }
    // Scoped cleanup still ran.
    assert!(host.torn_down.load(Ordering::SeqCst));

    drop(guard);
}
