//! hostlet: pool/worker coordination engine for editor-hosted test runs.
//!
//! A test session gets two cooperating halves. The pool side owns a
//! loopback transport, launches a real editor as a child process and
//! forwards the runner's run/collect requests to it; the worker side runs
//! inside that editor, connects back over the transport and drives the
//! in-editor test runner. Both halves exchange channel-tagged envelopes
//! (`control` for lifecycle, `rpc` for the runner's own traffic) over a
//! single WebSocket.

pub mod bridge;
pub mod config;
pub mod launcher;
pub mod pool;
pub mod scope;
pub mod worker;

pub use bridge::envelope::{Channel, Envelope, EnvelopeError, RawFrame};
pub use bridge::protocol::{
    ControlAction, ControlRequest, ControlResponse, EnvironmentSpec, POOL_ID, SerializedSession,
    TestFileSpec,
};
pub use config::{EditorVersion, PoolOptions};
pub use launcher::{EditorLauncher, ExecutableLauncher, LaunchError, LaunchRequest};
pub use pool::{
    PoolError, ProjectContext, TestPool, TestSpec, Worker, WorkerState, group_sessions,
};
pub use tokio_util::sync::CancellationToken;
pub use worker::{
    HostError, HostInit, HostTeardown, RpcBridge, WORKER_MODULE_FILE, WorkerError, WorkerHost,
    WorkerRuntimeConfig, run_worker,
};
