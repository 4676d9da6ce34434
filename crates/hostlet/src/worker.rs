//! Worker-side runtime - runs inside the editor process.
//!
//! The editor loads the test extension, which calls [`run_worker`] once.
//! The runtime connects back to the pool endpoint from the environment,
//! performs the ready handshake, installs the injected [`WorkerHost`] and
//! then serves control requests strictly in arrival order. Rpc frames are
//! bridged verbatim between the host and the pool.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::bridge::envelope::{self, Channel, Envelope, EnvelopeError, RawFrame};
use crate::bridge::protocol::{ControlAction, ControlRequest, ControlResponse, SerializedSession};
use crate::bridge::transport::{self, CHILD_TRANSPORT_ADDR, ClientSocket, POOL_DEBUG};
use crate::scope::{DisposalStack, EventSource, Subscription};

/// Sibling module the host loads its runner entry from.
pub const WORKER_MODULE_FILE: &str = "vscode-worker.mjs";

type WsSink = SplitSink<ClientSocket, Message>;
type WsStream = SplitStream<ClientSocket>;
type InFlight = Pin<Box<dyn Future<Output = (String, Result<(), HostError>)> + Send>>;

/// Opaque host failure; the display string travels back in the control
/// response.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("CHILD_TRANSPORT_ADDR is not set or empty")]
    MissingEndpoint,
    #[error("failed to connect to pool: {0}")]
    Connect(#[source] transport::TransportError),
    #[error("no ready_ack within {0:?}")]
    ReadyAckTimeout(Duration),
    #[error("pool disconnected before shutdown")]
    PoolDisconnected,
    #[error("cannot resolve worker module location: {0}")]
    WorkerModuleUnresolvable(String),
    #[error("host setup failed: {0}")]
    Setup(#[source] HostError),
    #[error("transport write failed: {0}")]
    Write(String),
}

/// Cleanup thunk returned by [`WorkerHost::setup`].
pub type HostTeardown = Box<dyn FnOnce() + Send>;

/// One-time data handed to the host at install time.
#[derive(Debug, Clone)]
pub struct HostInit {
    /// Runner entry next to this runtime's own location, never derived
    /// from the working directory.
    pub worker_module: PathBuf,
    pub debug: bool,
}

/// The in-editor test-runner capability the runtime drives.
#[async_trait]
pub trait WorkerHost: Send + Sync + 'static {
    /// One-time environment bootstrap; returns the teardown thunk.
    async fn setup(&self, init: HostInit, bridge: RpcBridge) -> Result<HostTeardown, HostError>;

    async fn run_tests(&self, ctx: SerializedSession) -> Result<(), HostError>;

    async fn collect_tests(&self, ctx: SerializedSession) -> Result<(), HostError>;
}

/// Rpc capability handed to the host: post outbound task updates,
/// subscribe to inbound ones, tear both down when done.
#[derive(Clone)]
pub struct RpcBridge {
    events: EventSource<Value>,
    outbound: mpsc::UnboundedSender<Value>,
}

impl RpcBridge {
    fn new(outbound: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            events: EventSource::new(),
            outbound,
        }
    }

    /// Queue a payload for the pool on the rpc channel.
    pub fn post(&self, payload: Value) -> Result<(), HostError> {
        self.outbound
            .send(payload)
            .map_err(|_| HostError::new("rpc channel closed"))
    }

    /// Inbound rpc payloads from this moment on.
    pub fn subscribe(&self) -> Subscription<Value> {
        self.events.subscribe()
    }

    /// Release all subscribers.
    pub fn teardown(&self) {
        self.events.close();
    }

    /// The wire codec, for hosts that frame their own traffic.
    pub fn serialize(channel: Channel, payload: &Value) -> String {
        envelope::encode(channel, payload)
    }

    pub fn deserialize(raw: impl Into<RawFrame>) -> Result<Envelope, EnvelopeError> {
        envelope::decode(raw)
    }

    fn emit_inbound(&self, payload: &Value) {
        self.events.emit(payload);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    pub connect_timeout: Duration,
    pub ready_timeout: Duration,
    /// Mirror lifecycle events to stderr.
    pub debug: bool,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
            debug: false,
        }
    }
}

impl WorkerRuntimeConfig {
    /// Defaults plus the `POOL_DEBUG` mirror flag.
    pub fn from_env() -> Self {
        Self {
            debug: matches!(std::env::var(POOL_DEBUG).as_deref(), Ok("1")),
            ..Self::default()
        }
    }
}

/// Resolve the runner entry sibling to this runtime's own location.
pub fn sibling_worker_module() -> Result<PathBuf, WorkerError> {
    let exe = std::env::current_exe()
        .map_err(|e| WorkerError::WorkerModuleUnresolvable(e.to_string()))?;
    let dir = exe.parent().ok_or_else(|| {
        WorkerError::WorkerModuleUnresolvable("runtime location has no parent directory".to_string())
    })?;
    Ok(dir.join(WORKER_MODULE_FILE))
}

fn endpoint_from(value: Option<String>) -> Result<String, WorkerError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(WorkerError::MissingEndpoint),
    }
}

fn endpoint_from_env() -> Result<String, WorkerError> {
    endpoint_from(std::env::var(CHILD_TRANSPORT_ADDR).ok())
}

fn init_debug_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("hostlet=debug")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn raw_frame(message: Message) -> Option<RawFrame> {
    match message {
        Message::Text(text) => Some(RawFrame::Text(text)),
        Message::Binary(bytes) => Some(RawFrame::Binary(bytes)),
        _ => None,
    }
}

async fn respond(sink: &mut WsSink, response: ControlResponse) -> Result<(), WorkerError> {
    let frame = envelope::encode(Channel::Control, &response.to_payload());
    sink.send(Message::Text(frame))
        .await
        .map_err(|e| WorkerError::Write(e.to_string()))
}

/// Entry point the editor extension invokes once.
///
/// Resolves cleanly after serving a `shutdown`; any earlier peer loss is
/// [`WorkerError::PoolDisconnected`].
pub async fn run_worker<H: WorkerHost>(
    host: Arc<H>,
    config: WorkerRuntimeConfig,
) -> Result<(), WorkerError> {
    if config.debug {
        init_debug_tracing();
    }

    let endpoint = endpoint_from_env()?;
    tracing::info!(%endpoint, "worker runtime connecting");
    let socket = transport::connect(&endpoint, config.connect_timeout)
        .await
        .map_err(WorkerError::Connect)?;
    let (mut sink, mut stream) = socket.split();

    let ready_id = format!("ready_{}", uuid::Uuid::new_v4());
    let ready = ControlRequest::new(ready_id.clone(), ControlAction::Ready);
    let frame = envelope::encode(Channel::Control, &ready.to_payload());
    sink.send(Message::Text(frame))
        .await
        .map_err(|e| WorkerError::Write(e.to_string()))?;

    match tokio::time::timeout(config.ready_timeout, wait_for_ack(&mut stream, &ready_id)).await {
        Ok(Ok(())) => tracing::info!("ready_ack received"),
        Ok(Err(reason)) => {
            tracing::error!(%reason, "handshake failed");
            return Err(WorkerError::ReadyAckTimeout(config.ready_timeout));
        }
        Err(_) => return Err(WorkerError::ReadyAckTimeout(config.ready_timeout)),
    }

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let bridge = RpcBridge::new(outbound_tx);
    let init = HostInit {
        worker_module: sibling_worker_module()?,
        debug: config.debug,
    };
    let teardown = host
        .setup(init, bridge.clone())
        .await
        .map_err(WorkerError::Setup)?;

    let mut cleanup = DisposalStack::new();
    {
        let bridge = bridge.clone();
        cleanup.defer(move || bridge.teardown());
    }
    cleanup.defer(teardown);

    serve(host, bridge, sink, stream, outbound_rx, cleanup).await
}

async fn wait_for_ack(stream: &mut WsStream, ready_id: &str) -> Result<(), String> {
    loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("socket closed before ready_ack".to_string()),
        };
        let Some(raw) = raw_frame(message) else {
            continue;
        };
        match envelope::decode(raw) {
            Ok(Envelope {
                channel: Channel::Control,
                payload,
            }) if envelope::is_control_response(&payload) => {
                match ControlResponse::from_payload(&payload) {
                    Ok(response) if response.id == ready_id => {
                        if response.success {
                            return Ok(());
                        }
                        return Err(response
                            .error
                            .unwrap_or_else(|| "ready rejected".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "undecodable response during handshake"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "malformed frame during handshake dropped"),
        }
    }
}

async fn serve<H: WorkerHost>(
    host: Arc<H>,
    bridge: RpcBridge,
    mut sink: WsSink,
    mut stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Value>,
    mut cleanup: DisposalStack,
) -> Result<(), WorkerError> {
    let mut queue: VecDeque<ControlRequest> = VecDeque::new();
    let mut current: Option<InFlight> = None;

    loop {
        // Serial queue: start the next request only when none is in
        // flight, so responses go out strictly in arrival order.
        if current.is_none()
            && let Some(request) = queue.pop_front()
        {
            if let Err(reason) = request.validate() {
                tracing::warn!(%reason, "rejecting malformed control request");
                respond(&mut sink, ControlResponse::failure(request.id, reason)).await?;
                continue;
            }
            match request.action {
                ControlAction::Shutdown => {
                    tracing::info!("shutdown requested");
                    if let Err(e) = respond(&mut sink, ControlResponse::ok(request.id)).await {
                        tracing::warn!(error = %e, "failed to acknowledge shutdown");
                    }
                    cleanup.dispose();
                    let _ = sink.close().await;
                    return Ok(());
                }
                ControlAction::Run | ControlAction::Collect => {
                    // validate() guarantees ctx is present here.
                    let Some(ctx) = request.ctx else {
                        continue;
                    };
                    tracing::debug!(
                        id = %request.id,
                        action = %request.action,
                        project = %ctx.project_name,
                        files = ctx.files.len(),
                        "starting batch"
                    );
                    let host = Arc::clone(&host);
                    let id = request.id;
                    let action = request.action;
                    current = Some(Box::pin(async move {
                        let result = match action {
                            ControlAction::Run => host.run_tests(ctx).await,
                            _ => host.collect_tests(ctx).await,
                        };
                        (id, result)
                    }));
                }
                ControlAction::Ready | ControlAction::ReadyAck => {
                    tracing::warn!(action = %request.action, "handshake action after ready");
                    respond(
                        &mut sink,
                        ControlResponse::failure(request.id, "unexpected action"),
                    )
                    .await?;
                }
            }
            continue;
        }

        tokio::select! {
            biased;

            result = async { current.as_mut().expect("in-flight request").await },
                if current.is_some() =>
            {
                current = None;
                let (id, outcome) = result;
                let response = match outcome {
                    Ok(()) => ControlResponse::ok(id),
                    Err(error) => {
                        tracing::warn!(%error, "batch failed");
                        ControlResponse::failure(id, error.to_string())
                    }
                };
                respond(&mut sink, response).await?;
            }

            Some(payload) = outbound_rx.recv() => {
                let frame = envelope::encode(Channel::Rpc, &payload);
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::error!(error = %e, "failed to post rpc frame");
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(message)) => {
                        let Some(raw) = raw_frame(message) else { continue };
                        match envelope::decode(raw) {
                            Ok(Envelope { channel: Channel::Rpc, payload }) => {
                                bridge.emit_inbound(&payload);
                            }
                            Ok(Envelope { channel: Channel::Control, payload }) => {
                                if !envelope::is_control_request(&payload) {
                                    tracing::warn!("unexpected control frame (not a request), dropped");
                                    continue;
                                }
                                match ControlRequest::from_payload(&payload) {
                                    Ok(request) => queue.push_back(request),
                                    Err(e) => {
                                        tracing::error!(error = %e, "undecodable control request dropped");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "malformed envelope dropped");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "pool socket error");
                        cleanup.dispose();
                        return Err(WorkerError::PoolDisconnected);
                    }
                    None => {
                        tracing::warn!("pool closed the connection");
                        cleanup.dispose();
                        return Err(WorkerError::PoolDisconnected);
                    }
                }
            }
        }
    }
}
