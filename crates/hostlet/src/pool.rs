//! Pool-side controller - owns the transport, the child editor and the
//! single worker of a test session.
//!
//! Flow:
//! 1. Bind the loopback transport, launch the child editor with the
//!    endpoint in its environment
//! 2. Accept the session's one client, consume `ready`, answer `ready_ack`
//! 3. Run the event loop: correlate control responses by id, fan out
//!    rpc frames to subscribers
//! 4. On `stop()`: shutdown request, then unwind the disposal stack
//!    (close socket, close listener, await child exit)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::bridge::envelope::{self, Channel, Envelope, EnvelopeError, RawFrame};
use crate::bridge::protocol::{
    ControlAction, ControlRequest, ControlResponse, POOL_ID, SerializedSession, TestFileSpec,
};
use crate::bridge::transport::{PoolListener, ServerSocket};
use crate::config::PoolOptions;
use crate::launcher::{EditorLauncher, LaunchRequest};
use crate::scope::{AsyncDisposalStack, EventSource, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to bind loopback transport: {0}")]
    TransportBindFailed(#[source] crate::bridge::transport::TransportError),
    #[error("editor launch failed: {0}")]
    ChildLaunchFailed(#[source] crate::launcher::LaunchError),
    #[error("handshake failed while {phase}: {reason}")]
    HandshakeFailed { phase: &'static str, reason: String },
    #[error("worker is not ready")]
    NotReady,
    #[error("control request `{action}` timed out")]
    ControlRequestTimeout { action: ControlAction },
    #[error("worker disconnected")]
    WorkerDisconnected,
    #[error("worker stopped with the request in flight")]
    WorkerStopped,
    #[error("duplicate in-flight request id `{0}`")]
    DuplicateRequestId(String),
    #[error("`{action}` failed in worker: {message}")]
    RequestFailed {
        action: ControlAction,
        message: String,
    },
    #[error("worker stop failed: {}", causes.join("; "))]
    Stop { causes: Vec<String> },
}

/// Externally observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Handshake complete, no request outstanding.
    Ready,
    /// At least one control request in flight.
    Busy,
    /// Socket closed outside `stop()`.
    Disconnected,
    /// `stop()` ran; no further requests admissible.
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Ready,
    Disconnected,
    Disposed,
}

struct Shared {
    link: StdMutex<LinkState>,
    pending_count: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            link: StdMutex::new(LinkState::Ready),
            pending_count: AtomicUsize::new(0),
        }
    }

    fn link(&self) -> LinkState {
        match self.link.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_link(&self, state: LinkState) {
        match self.link.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

struct PendingEntry {
    action: ControlAction,
    tx: oneshot::Sender<Result<ControlResponse, PoolError>>,
}

enum PoolCommand {
    Send {
        request: ControlRequest,
        reply: oneshot::Sender<Result<ControlResponse, PoolError>>,
    },
    PostRpc {
        payload: Value,
    },
    Forget {
        id: String,
    },
    Shutdown {
        done: oneshot::Sender<usize>,
    },
}

/// One live worker: the accepted socket, the child editor handle and the
/// per-request correlation state. Exclusively owned by its pool.
pub struct Worker {
    command_tx: mpsc::UnboundedSender<PoolCommand>,
    rpc_events: EventSource<Value>,
    shared: Arc<Shared>,
    stack: Mutex<AsyncDisposalStack>,
    stopped: AtomicBool,
    request_seq: AtomicU64,
    control_timeout: Duration,
    reuse: bool,
    worker_id: u32,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Worker {
    /// Bind, launch, handshake. Resolves only after `ready_ack` went out.
    pub async fn start(
        options: &PoolOptions,
        launcher: &dyn EditorLauncher,
        worker_id: u32,
    ) -> Result<Self, PoolError> {
        tracing::debug!(worker_id, "booting worker");
        let listener = PoolListener::bind()
            .await
            .map_err(PoolError::TransportBindFailed)?;
        let endpoint = listener.endpoint().to_string();

        let request = LaunchRequest::from_options(&endpoint, options);
        let child = launcher
            .launch(&request)
            .await
            .map_err(PoolError::ChildLaunchFailed)?;

        let mut stack = AsyncDisposalStack::new();
        let exit_bound = options.control_request_timeout();
        stack.defer("await editor exit", move || reap_child(child, exit_bound));

        let handshake_bound = options.handshake_bound();
        let socket = match tokio::time::timeout(
            handshake_bound,
            handshake(&listener, handshake_bound),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(error)) => {
                stack.dispose().await;
                return Err(error);
            }
            Err(_) => {
                stack.dispose().await;
                return Err(PoolError::HandshakeFailed {
                    phase: "awaiting ready",
                    reason: format!("no ready within {handshake_bound:?}"),
                });
            }
        };
        tracing::info!(worker_id, %endpoint, "worker ready");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let rpc_events = EventSource::new();
        let shared = Arc::new(Shared::new());

        let loop_handle = tokio::spawn(run_event_loop(
            socket,
            listener,
            command_rx,
            rpc_events.clone(),
            Arc::clone(&shared),
        ));

        let tx = command_tx.clone();
        stack.defer("close transport", move || async move {
            let (done_tx, done_rx) = oneshot::channel();
            let mut stragglers = 0;
            if tx.send(PoolCommand::Shutdown { done: done_tx }).is_ok() {
                stragglers = done_rx.await.unwrap_or(0);
            }
            match loop_handle.await {
                Ok(()) if stragglers == 0 => Ok(()),
                Ok(()) => Err(format!("{stragglers} pending requests rejected")),
                Err(e) => Err(format!("event loop panicked: {e}")),
            }
        });

        Ok(Self {
            command_tx,
            rpc_events,
            shared,
            stack: Mutex::new(stack),
            stopped: AtomicBool::new(false),
            request_seq: AtomicU64::new(0),
            control_timeout: options.control_request_timeout(),
            reuse: options.reuse_worker,
            worker_id,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Whether the outer runner may keep this worker across files.
    pub fn can_reuse(&self) -> bool {
        self.reuse
    }

    pub fn state(&self) -> WorkerState {
        match self.shared.link() {
            LinkState::Disposed => WorkerState::Disposed,
            LinkState::Disconnected => WorkerState::Disconnected,
            LinkState::Ready => {
                if self.shared.pending_count.load(Ordering::SeqCst) > 0 {
                    WorkerState::Busy
                } else {
                    WorkerState::Ready
                }
            }
        }
    }

    pub fn next_request_id(&self) -> String {
        format!("req_{}", self.request_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The codec, exposed so the outer runner can decode rpc frames it
    /// observes.
    pub fn deserialize(raw: impl Into<RawFrame>) -> Result<Envelope, EnvelopeError> {
        envelope::decode(raw)
    }

    /// Write a control request and await its correlated response.
    pub async fn send(&self, request: ControlRequest) -> Result<ControlResponse, PoolError> {
        match self.state() {
            WorkerState::Ready | WorkerState::Busy => {}
            WorkerState::Disconnected => return Err(PoolError::WorkerDisconnected),
            WorkerState::Disposed => return Err(PoolError::NotReady),
        }

        let action = request.action;
        let id = request.id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(PoolCommand::Send {
                request,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::WorkerDisconnected)?;

        match tokio::time::timeout(self.control_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::WorkerDisconnected),
            Err(_) => {
                let _ = self.command_tx.send(PoolCommand::Forget { id });
                Err(PoolError::ControlRequestTimeout { action })
            }
        }
    }

    /// Subscribe to rpc-channel payloads, in arrival order from this
    /// moment on.
    pub fn subscribe_rpc(&self) -> Subscription<Value> {
        self.rpc_events.subscribe()
    }

    /// Forward an rpc payload to the worker verbatim.
    pub fn post_rpc(&self, payload: Value) -> Result<(), PoolError> {
        match self.state() {
            WorkerState::Ready | WorkerState::Busy => {}
            WorkerState::Disconnected => return Err(PoolError::WorkerDisconnected),
            WorkerState::Disposed => return Err(PoolError::NotReady),
        }
        self.command_tx
            .send(PoolCommand::PostRpc { payload })
            .map_err(|_| PoolError::WorkerDisconnected)
    }

    /// Transmit `payload` on the rpc channel when the runner's cancel
    /// token fires. Cancellation never travels as a control request.
    pub fn propagate_cancel(&self, token: CancellationToken, payload: Value) {
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            tracing::debug!("forwarding cancellation on rpc channel");
            let _ = command_tx.send(PoolCommand::PostRpc { payload });
        });
    }

    /// Ordered shutdown. Idempotent: the second call resolves immediately.
    pub async fn stop(&self) -> Result<(), PoolError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut causes = Vec::new();
        if matches!(self.state(), WorkerState::Ready | WorkerState::Busy) {
            let request = ControlRequest::new(self.next_request_id(), ControlAction::Shutdown);
            if let Err(error) = self.send(request).await {
                tracing::warn!(%error, "shutdown request failed");
                causes.push(format!("shutdown request: {error}"));
            }
        }

        let mut stack = self.stack.lock().await;
        causes.extend(stack.dispose().await);

        if causes.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Stop { causes })
        }
    }
}

async fn reap_child(mut child: Child, bound: Duration) -> Result<(), String> {
    match tokio::time::timeout(bound, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => {
            tracing::warn!(%status, "editor exited with failure status");
            Err(format!("editor exited with {status}"))
        }
        Ok(Err(e)) => Err(format!("failed to await editor exit: {e}")),
        Err(_) => {
            tracing::warn!("editor did not exit in time, killing");
            if let Err(e) = child.start_kill() {
                return Err(format!("failed to kill editor: {e}"));
            }
            match child.wait().await {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("failed to reap editor: {e}")),
            }
        }
    }
}

/// Accept the client and consume `ready`; answers `ready_ack` before
/// returning the socket.
async fn handshake(
    listener: &PoolListener,
    accept_bound: Duration,
) -> Result<ServerSocket, PoolError> {
    let mut socket =
        listener
            .accept_client(accept_bound)
            .await
            .map_err(|e| PoolError::HandshakeFailed {
                phase: "awaiting connect",
                reason: e.to_string(),
            })?;

    let ready_id = loop {
        let frame = match socket.next().await {
            Some(Ok(Message::Text(text))) => RawFrame::Text(text),
            Some(Ok(Message::Binary(bytes))) => RawFrame::Binary(bytes),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(PoolError::HandshakeFailed {
                    phase: "awaiting ready",
                    reason: e.to_string(),
                });
            }
            None => {
                return Err(PoolError::HandshakeFailed {
                    phase: "awaiting ready",
                    reason: "socket closed before ready".to_string(),
                });
            }
        };

        match envelope::decode(frame) {
            Ok(Envelope {
                channel: Channel::Control,
                payload,
            }) if envelope::is_control_request(&payload) => {
                match ControlRequest::from_payload(&payload) {
                    Ok(request) if request.action == ControlAction::Ready => break request.id,
                    Ok(request) => {
                        // Anything but `ready` is premature; tell the peer.
                        tracing::warn!(action = %request.action, "control request before ready");
                        let response = ControlResponse::failure(request.id, "not_ready");
                        let frame = envelope::encode(Channel::Control, &response.to_payload());
                        let _ = socket.send(Message::Text(frame)).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable control request during handshake");
                    }
                }
            }
            Ok(envelope) => {
                tracing::warn!(channel = %envelope.channel, "unexpected frame during handshake");
            }
            Err(e) => {
                tracing::error!(error = %e, "malformed frame during handshake dropped");
            }
        }
    };

    let ack = ControlResponse::ok(ready_id);
    let frame = envelope::encode(Channel::Control, &ack.to_payload());
    socket
        .send(Message::Text(frame))
        .await
        .map_err(|e| PoolError::HandshakeFailed {
            phase: "sending ready_ack",
            reason: e.to_string(),
        })?;

    Ok(socket)
}

async fn run_event_loop(
    socket: ServerSocket,
    listener: PoolListener,
    mut command_rx: mpsc::UnboundedReceiver<PoolCommand>,
    rpc_events: EventSource<Value>,
    shared: Arc<Shared>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut pending: HashMap<String, PendingEntry> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            command = command_rx.recv() => {
                match command {
                    Some(PoolCommand::Send { request, reply }) => {
                        if let Some(old) = pending.remove(&request.id) {
                            tracing::error!(id = %request.id, "duplicate in-flight request id");
                            shared.pending_count.fetch_sub(1, Ordering::SeqCst);
                            let _ = old
                                .tx
                                .send(Err(PoolError::DuplicateRequestId(request.id.clone())));
                        }
                        let frame = envelope::encode(Channel::Control, &request.to_payload());
                        match sink.send(Message::Text(frame)).await {
                            Ok(()) => {
                                shared.pending_count.fetch_add(1, Ordering::SeqCst);
                                pending.insert(
                                    request.id.clone(),
                                    PendingEntry { action: request.action, tx: reply },
                                );
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "failed to write control request");
                                let _ = reply.send(Err(PoolError::WorkerDisconnected));
                            }
                        }
                    }
                    Some(PoolCommand::PostRpc { payload }) => {
                        let frame = envelope::encode(Channel::Rpc, &payload);
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            tracing::error!(error = %e, "failed to write rpc frame");
                        }
                    }
                    Some(PoolCommand::Forget { id }) => {
                        if pending.remove(&id).is_some() {
                            shared.pending_count.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    Some(PoolCommand::Shutdown { done }) => {
                        let stragglers = fail_all(&mut pending, &shared, || PoolError::WorkerStopped);
                        let _ = sink.close().await;
                        shared.set_link(LinkState::Disposed);
                        rpc_events.close();
                        let _ = done.send(stragglers);
                        return;
                    }
                    None => {
                        // Worker dropped without stop(); close quietly.
                        fail_all(&mut pending, &shared, || PoolError::WorkerStopped);
                        let _ = sink.close().await;
                        shared.set_link(LinkState::Disposed);
                        rpc_events.close();
                        return;
                    }
                }
            }

            accepted = listener.accept_raw() => {
                match accepted {
                    Ok((_stream, peer)) => {
                        tracing::error!(%peer, "protocol error: unexpected additional client, dropping");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "listener accept failed");
                    }
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(message)) => {
                        handle_message(message, &mut pending, &rpc_events, &shared);
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "socket error, treating as disconnect");
                        fail_all(&mut pending, &shared, || PoolError::WorkerDisconnected);
                        shared.set_link(LinkState::Disconnected);
                        rpc_events.close();
                        return;
                    }
                    None => {
                        tracing::warn!("socket closed by worker");
                        fail_all(&mut pending, &shared, || PoolError::WorkerDisconnected);
                        shared.set_link(LinkState::Disconnected);
                        rpc_events.close();
                        return;
                    }
                }
            }
        }
    }
}

fn handle_message(
    message: Message,
    pending: &mut HashMap<String, PendingEntry>,
    rpc_events: &EventSource<Value>,
    shared: &Shared,
) {
    let raw = match message {
        Message::Text(text) => RawFrame::Text(text),
        Message::Binary(bytes) => RawFrame::Binary(bytes),
        _ => return,
    };

    match envelope::decode(raw) {
        Ok(Envelope {
            channel: Channel::Rpc,
            payload,
        }) => rpc_events.emit(&payload),
        Ok(Envelope {
            channel: Channel::Control,
            payload,
        }) => {
            if !envelope::is_control_response(&payload) {
                tracing::warn!("unexpected control frame (not a response), dropped");
                return;
            }
            match ControlResponse::from_payload(&payload) {
                Ok(response) => resolve_pending(pending, shared, response),
                Err(e) => tracing::error!(error = %e, "undecodable control response dropped"),
            }
        }
        Err(e) => {
            // Malformed or unknown channel: no id to correlate, drop it.
            tracing::error!(error = %e, "malformed envelope dropped");
        }
    }
}

fn resolve_pending(
    pending: &mut HashMap<String, PendingEntry>,
    shared: &Shared,
    response: ControlResponse,
) {
    match pending.remove(&response.id) {
        Some(entry) => {
            shared.pending_count.fetch_sub(1, Ordering::SeqCst);
            let result = if response.success {
                Ok(response)
            } else {
                Err(PoolError::RequestFailed {
                    action: entry.action,
                    message: response
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown worker error".to_string()),
                })
            };
            let _ = entry.tx.send(result);
        }
        None => {
            tracing::warn!(id = %response.id, "late control response discarded");
        }
    }
}

fn fail_all(
    pending: &mut HashMap<String, PendingEntry>,
    shared: &Shared,
    error: impl Fn() -> PoolError,
) -> usize {
    let count = pending.len();
    for (_, entry) in pending.drain() {
        shared.pending_count.fetch_sub(1, Ordering::SeqCst);
        let _ = entry.tx.send(Err(error()));
    }
    count
}

// ============================================================================
// Session-level pool
// ============================================================================

/// Per-project context shared by that project's test files.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub name: String,
    pub config: Value,
    /// `None` means the project declared no environment; the session
    /// falls back to `node`.
    pub environment: Option<crate::bridge::protocol::EnvironmentSpec>,
    pub provided_context: Value,
}

impl ProjectContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Value::Object(serde_json::Map::new()),
            environment: None,
            provided_context: Value::Object(serde_json::Map::new()),
        }
    }
}

/// One test file queued for execution or collection.
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub project: ProjectContext,
    pub filepath: String,
    pub test_locations: Vec<u32>,
}

/// Group specs into one session per project, in the order each project
/// first appears. File order within a project is preserved.
pub fn group_sessions(
    worker_id: u32,
    specs: &[TestSpec],
    invalidates: Option<&[String]>,
) -> Vec<SerializedSession> {
    let mut groups: Vec<(ProjectContext, Vec<TestFileSpec>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for spec in specs {
        let slot = match index.get(&spec.project.name) {
            Some(&i) => i,
            None => {
                groups.push((spec.project.clone(), Vec::new()));
                index.insert(spec.project.name.clone(), groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[slot].1.push(TestFileSpec {
            filepath: spec.filepath.clone(),
            test_locations: spec.test_locations.clone(),
        });
    }

    groups
        .into_iter()
        .map(|(project, files)| SerializedSession {
            pool: POOL_ID.to_string(),
            worker_id,
            config: project.config,
            project_name: project.name,
            files,
            environment: project.environment.unwrap_or_default(),
            provided_context: project.provided_context,
            invalidates: invalidates.map(<[String]>::to_vec),
        })
        .collect()
}

/// The pool instantiated once per test session on the runner side.
///
/// Owns the monotonic worker-id counter and the single live [`Worker`].
pub struct TestPool {
    options: PoolOptions,
    launcher: Arc<dyn EditorLauncher>,
    worker_seq: AtomicU32,
    worker: Mutex<Option<Worker>>,
}

impl TestPool {
    pub fn new(options: PoolOptions, launcher: Arc<dyn EditorLauncher>) -> Self {
        Self {
            options,
            launcher,
            worker_seq: AtomicU32::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Whether the runner should keep one worker across files.
    pub fn can_reuse(&self) -> bool {
        self.options.reuse_worker
    }

    /// Start the session worker if none is live.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let worker_id = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = Worker::start(&self.options, self.launcher.as_ref(), worker_id).await?;
        *guard = Some(worker);
        Ok(())
    }

    pub async fn run_tests(
        &self,
        specs: Vec<TestSpec>,
        invalidates: Option<Vec<String>>,
    ) -> Result<(), PoolError> {
        self.dispatch(ControlAction::Run, specs, invalidates).await
    }

    pub async fn collect_tests(&self, specs: Vec<TestSpec>) -> Result<(), PoolError> {
        self.dispatch(ControlAction::Collect, specs, None).await
    }

    async fn dispatch(
        &self,
        action: ControlAction,
        specs: Vec<TestSpec>,
        invalidates: Option<Vec<String>>,
    ) -> Result<(), PoolError> {
        let guard = self.worker.lock().await;
        let worker = guard.as_ref().ok_or(PoolError::NotReady)?;
        for session in group_sessions(worker.worker_id(), &specs, invalidates.as_deref()) {
            let request = ControlRequest::with_ctx(worker.next_request_id(), action, session);
            worker.send(request).await?;
        }
        Ok(())
    }

    pub async fn subscribe_rpc(&self) -> Result<Subscription<Value>, PoolError> {
        let guard = self.worker.lock().await;
        Ok(guard.as_ref().ok_or(PoolError::NotReady)?.subscribe_rpc())
    }

    pub async fn post_rpc(&self, payload: Value) -> Result<(), PoolError> {
        let guard = self.worker.lock().await;
        guard.as_ref().ok_or(PoolError::NotReady)?.post_rpc(payload)
    }

    pub async fn propagate_cancel(
        &self,
        token: CancellationToken,
        payload: Value,
    ) -> Result<(), PoolError> {
        let guard = self.worker.lock().await;
        guard
            .as_ref()
            .ok_or(PoolError::NotReady)?
            .propagate_cancel(token, payload);
        Ok(())
    }

    /// Stop and drop the session worker. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let mut guard = self.worker.lock().await;
        match guard.take() {
            Some(worker) => worker.stop().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bridge::protocol::EnvironmentSpec;

    fn spec(project: &str, filepath: &str) -> TestSpec {
        TestSpec {
            project: ProjectContext::new(project),
            filepath: filepath.to_string(),
            test_locations: Vec::new(),
        }
    }

    #[test]
    fn groups_by_project_in_first_appearance_order() {
        let specs = vec![
            spec("project-b", "b/one.test.ts"),
            spec("project-a", "a/one.test.ts"),
            spec("project-b", "b/two.test.ts"),
        ];

        let sessions = group_sessions(1, &specs, None);
        assert_eq!(sessions.len(), 2);

        assert_eq!(sessions[0].project_name, "project-b");
        assert_eq!(
            sessions[0]
                .files
                .iter()
                .map(|f| f.filepath.as_str())
                .collect::<Vec<_>>(),
            vec!["b/one.test.ts", "b/two.test.ts"]
        );
        assert_eq!(sessions[1].project_name, "project-a");
        assert_eq!(sessions[0].worker_id, 1);
        assert_eq!(sessions[0].pool, "vscode");
    }

    #[test]
    fn invalidates_pass_through_to_every_session() {
        let specs = vec![spec("a", "x.test.ts"), spec("b", "y.test.ts")];
        let invalidates = vec!["src/shared.ts".to_string()];

        let sessions = group_sessions(3, &specs, Some(&invalidates));
        for session in &sessions {
            assert_eq!(session.invalidates.as_deref(), Some(&invalidates[..]));
        }
    }

    #[test]
    fn environment_defaults_to_node_when_undeclared() {
        let sessions = group_sessions(1, &[spec("a", "x.test.ts")], None);
        assert_eq!(sessions[0].environment, EnvironmentSpec::default());
        assert_eq!(sessions[0].environment.name, "node");
    }

    #[test]
    fn declared_environment_is_preserved() {
        let mut s = spec("a", "x.test.ts");
        s.project.environment = Some(EnvironmentSpec {
            name: "jsdom".to_string(),
            options: Some(json!({"url": "http://localhost"})),
        });

        let sessions = group_sessions(1, &[s], None);
        assert_eq!(sessions[0].environment.name, "jsdom");
    }

    #[test]
    fn test_locations_are_preserved_in_order() {
        let mut s = spec("a", "x.test.ts");
        s.test_locations = vec![12, 40, 7];

        let sessions = group_sessions(1, &[s], None);
        assert_eq!(sessions[0].files[0].test_locations, vec![12, 40, 7]);
    }
}
