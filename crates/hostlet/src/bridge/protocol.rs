//! Control-channel protocol types.
//!
//! Control traffic is request/response with per-request ids; the payloads
//! ride inside envelopes on the `control` channel. Field names follow the
//! runner's camelCase wire convention.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pool identifier stamped into every session.
pub const POOL_ID: &str = "vscode";

// ============================================================================
// Control requests and responses
// ============================================================================

/// Lifecycle actions a control request can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Ready,
    ReadyAck,
    Run,
    Collect,
    Shutdown,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::ReadyAck => "ready_ack",
            Self::Run => "run",
            Self::Collect => "collect",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control message in the request direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: String,
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<SerializedSession>,
}

impl ControlRequest {
    pub fn new(id: impl Into<String>, action: ControlAction) -> Self {
        Self {
            id: id.into(),
            action,
            ctx: None,
        }
    }

    pub fn with_ctx(id: impl Into<String>, action: ControlAction, ctx: SerializedSession) -> Self {
        Self {
            id: id.into(),
            action,
            ctx: Some(ctx),
        }
    }

    /// `ctx` is required for run/collect and forbidden otherwise.
    pub fn validate(&self) -> Result<(), String> {
        match (self.action, self.ctx.is_some()) {
            (ControlAction::Run | ControlAction::Collect, false) => {
                Err(format!("`{}` request without ctx", self.action))
            }
            (ControlAction::Ready | ControlAction::ReadyAck | ControlAction::Shutdown, true) => {
                Err(format!("`{}` request must not carry ctx", self.action))
            }
            _ => Ok(()),
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).expect("control request serializes infallibly")
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

/// Control message in the reply direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).expect("control response serializes infallibly")
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

// ============================================================================
// Serialized session (everything one run/collect batch needs)
// ============================================================================

/// One test file plus the line numbers selected in it (empty = whole file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFileSpec {
    pub filepath: String,
    #[serde(default)]
    pub test_locations: Vec<u32>,
}

impl TestFileSpec {
    pub fn new(filepath: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            test_locations: Vec::new(),
        }
    }
}

/// Test environment declared by the project; `name` defaults to `node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    #[serde(default = "default_environment_name")]
    pub name: String,
    #[serde(default)]
    pub options: Option<Value>,
}

fn default_environment_name() -> String {
    "node".to_string()
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            name: default_environment_name(),
            options: None,
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The context attached to a run/collect request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSession {
    pub pool: String,
    pub worker_id: u32,
    pub config: Value,
    pub project_name: String,
    pub files: Vec<TestFileSpec>,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default = "empty_object")]
    pub provided_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidates: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_session() -> SerializedSession {
        SerializedSession {
            pool: POOL_ID.to_string(),
            worker_id: 1,
            config: json!({"root": "/proj"}),
            project_name: "project-a".to_string(),
            files: vec![TestFileSpec::new("tests/alpha.test.ts")],
            environment: EnvironmentSpec::default(),
            provided_context: empty_object(),
            invalidates: None,
        }
    }

    #[test]
    fn action_wire_literals_are_stable() {
        for (action, literal) in [
            (ControlAction::Ready, "ready"),
            (ControlAction::ReadyAck, "ready_ack"),
            (ControlAction::Run, "run"),
            (ControlAction::Collect, "collect"),
            (ControlAction::Shutdown, "shutdown"),
        ] {
            assert_eq!(serde_json::to_value(action).unwrap(), json!(literal));
            assert_eq!(action.as_str(), literal);
        }
    }

    #[test]
    fn request_wire_shape() {
        let req = ControlRequest::new("req_1", ControlAction::Ready);
        assert_eq!(
            req.to_payload(),
            json!({"id": "req_1", "action": "ready"})
        );

        let req = ControlRequest::with_ctx("req_2", ControlAction::Collect, sample_session());
        let payload = req.to_payload();
        assert_eq!(payload["ctx"]["pool"], json!("vscode"));
        assert_eq!(payload["ctx"]["workerId"], json!(1));
        assert_eq!(
            payload["ctx"]["files"],
            json!([{"filepath": "tests/alpha.test.ts", "testLocations": []}])
        );

        assert_eq!(ControlRequest::from_payload(&payload).unwrap(), req);
    }

    #[test]
    fn response_wire_shape() {
        assert_eq!(
            ControlResponse::ok("req_1").to_payload(),
            json!({"id": "req_1", "success": true})
        );
        assert_eq!(
            ControlResponse::failure("req_2", "bad").to_payload(),
            json!({"id": "req_2", "success": false, "error": "bad"})
        );
    }

    #[test]
    fn ctx_rule_is_enforced_both_ways() {
        assert!(ControlRequest::new("a", ControlAction::Run).validate().is_err());
        assert!(ControlRequest::new("a", ControlAction::Collect).validate().is_err());
        assert!(ControlRequest::new("a", ControlAction::Shutdown).validate().is_ok());
        assert!(
            ControlRequest::with_ctx("a", ControlAction::Shutdown, sample_session())
                .validate()
                .is_err()
        );
        assert!(
            ControlRequest::with_ctx("a", ControlAction::Run, sample_session())
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn environment_name_defaults_to_node() {
        let env: EnvironmentSpec = serde_json::from_value(json!({})).unwrap();
        assert_eq!(env.name, "node");
        assert!(env.options.is_none());
    }

    #[test]
    fn session_round_trips_with_invalidates() {
        let mut session = sample_session();
        session.invalidates = Some(vec!["src/shared.ts".to_string()]);

        let payload = serde_json::to_value(&session).unwrap();
        assert_eq!(payload["invalidates"], json!(["src/shared.ts"]));
        assert_eq!(payload["projectName"], json!("project-a"));

        let back: SerializedSession = serde_json::from_value(payload).unwrap();
        assert_eq!(back, session);
    }
}
