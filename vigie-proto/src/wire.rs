//! Heartbeat wire format.
//!
//! Field names are bit-exact with every deployed agent; do not rename them.

use crate::signing::sign_body;
use crate::task::TaskKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metric snapshot as sent by a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WireStats {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub ram_total: u64,
    pub ram_free: u64,
    pub disk_total: u64,
    pub disk_free: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub uptime: u64,
    #[serde(default)]
    pub process_cpu: String,
    #[serde(default)]
    pub process_ram: String,
    #[serde(default)]
    pub external_ip: Option<String>,
}

/// Result body produced by a node. Only the i18n form exists: the node
/// names a template and its parameters, the kernel renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    I18n {
        key: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

impl ResultPayload {
    pub fn i18n(key: impl Into<String>) -> Self {
        ResultPayload::I18n { key: key.into(), params: Map::new() }
    }

    /// Builder-style parameter insertion.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        let ResultPayload::I18n { params, .. } = &mut self;
        params.insert(name.to_string(), value.into());
        self
    }

    pub fn key(&self) -> &str {
        match self {
            ResultPayload::I18n { key, .. } => key,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        match self {
            ResultPayload::I18n { params, .. } => params.get(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResult {
    pub command: TaskKind,
    pub user_id: i64,
    pub result: ResultPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    Password,
    Publickey,
}

/// A successful SSH login observed on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginEvent {
    pub user: String,
    pub ip: String,
    pub method: LoginMethod,
    pub timestamp: i64,
    pub node_time_str: String,
    pub tz_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub token: String,
    pub stats: WireStats,
    #[serde(default)]
    pub results: Vec<WireResult>,
    #[serde(default)]
    pub ssh_logins: Vec<LoginEvent>,
    pub timestamp: i64,
}

impl HeartbeatRequest {
    pub fn parse(body: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Serializes the request and signs the exact bytes that will be sent.
    pub fn to_signed_body(&self) -> Result<(Vec<u8>, String), ProtoError> {
        let body = serde_json::to_vec(self)?;
        let signature = sign_body(&self.token, &body);
        Ok((body, signature))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    pub command: TaskKind,
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default)]
    pub tasks: Vec<WireTask>,
}

impl HeartbeatResponse {
    pub fn ok(tasks: Vec<WireTask>) -> Self {
        Self { status: "ok".to_string(), tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::verify_body;
    use serde_json::json;

    fn sample_body() -> Value {
        json!({
            "token": "0123456789abcdef0123456789abcdef",
            "stats": {
                "cpu": 12.0, "ram": 34.0, "disk": 56.0,
                "ram_total": 1024, "ram_free": 512,
                "disk_total": 4096, "disk_free": 2048,
                "net_rx": 10, "net_tx": 20,
                "uptime": 3600, "process_cpu": "nginx 3%",
                "process_ram": "postgres 12%", "external_ip": null
            },
            "results": [
                { "command": "speedtest", "user_id": 7,
                  "result": { "type": "i18n", "key": "speedtest_ok",
                              "params": { "download": 94.2 } } }
            ],
            "ssh_logins": [
                { "user": "root", "ip": "203.0.113.9", "method": "publickey",
                  "timestamp": 1700000000, "node_time_str": "2023-11-14 22:13:20",
                  "tz_label": "UTC" }
            ],
            "timestamp": 1700000000
        })
    }

    #[test]
    fn test_parse_reference_body() {
        let body = serde_json::to_vec(&sample_body()).unwrap();
        let req = HeartbeatRequest::parse(&body).unwrap();
        assert_eq!(req.stats.cpu, 12.0);
        assert_eq!(req.stats.external_ip, None);
        assert_eq!(req.results[0].command, TaskKind::Speedtest);
        assert_eq!(req.results[0].result.key(), "speedtest_ok");
        assert_eq!(req.ssh_logins[0].method, LoginMethod::Publickey);
    }

    #[test]
    fn test_result_payload_shape() {
        let payload = ResultPayload::i18n("uptime_ok").with("seconds", 42);
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v, json!({"type": "i18n", "key": "uptime_ok", "params": {"seconds": 42}}));
    }

    #[test]
    fn test_unknown_command_is_malformed() {
        let mut v = sample_body();
        v["results"][0]["command"] = json!("format_disk");
        let body = serde_json::to_vec(&v).unwrap();
        assert!(HeartbeatRequest::parse(&body).is_err());
    }

    #[test]
    fn test_missing_optional_lists() {
        let mut v = sample_body();
        v.as_object_mut().unwrap().remove("results");
        v.as_object_mut().unwrap().remove("ssh_logins");
        let req = HeartbeatRequest::parse(&serde_json::to_vec(&v).unwrap()).unwrap();
        assert!(req.results.is_empty());
        assert!(req.ssh_logins.is_empty());
    }

    #[test]
    fn test_signed_body_verifies() {
        let req = HeartbeatRequest::parse(&serde_json::to_vec(&sample_body()).unwrap()).unwrap();
        let (body, sig) = req.to_signed_body().unwrap();
        assert!(verify_body(&req.token, &body, &sig));
    }

    #[test]
    fn test_response_shape() {
        let resp = HeartbeatResponse::ok(vec![WireTask { command: TaskKind::Speedtest, user_id: 7 }]);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"status": "ok", "tasks": [{"command": "speedtest", "user_id": 7}]})
        );
    }
}
