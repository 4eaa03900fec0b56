//! Heartbeat transport: signed POST to the controller with bounded retry
//! buffers.
//!
//! Results and login events survive failed cycles and ride along with the
//! next heartbeat. Each buffer holds at most `MAX_BUFFERED` items; the
//! oldest are dropped first during long outages.

use reqwest::StatusCode;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};
use vigie_proto::{
    HeartbeatRequest, HeartbeatResponse, LoginEvent, ProtoError, WireResult, WireStats, WireTask, SIGNATURE_HEADER,
};

pub const MAX_BUFFERED: usize = 100;
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("controller answered {0}")]
    Rejected(StatusCode),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

pub struct HeartbeatClient {
    http: reqwest::Client,
    url: String,
    token: String,
    results: VecDeque<WireResult>,
    logins: VecDeque<LoginEvent>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T) -> bool {
    let evicted = buf.len() >= MAX_BUFFERED;
    if evicted {
        buf.pop_front();
    }
    buf.push_back(item);
    evicted
}

impl HeartbeatClient {
    pub fn new(url: String, token: String) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(HEARTBEAT_TIMEOUT).build()?;
        Ok(Self { http, url, token, results: VecDeque::new(), logins: VecDeque::new() })
    }

    pub fn push_result(&mut self, result: WireResult) {
        if push_bounded(&mut self.results, result) {
            warn!("result buffer full, oldest result dropped");
        }
    }

    pub fn push_logins(&mut self, logins: impl IntoIterator<Item = LoginEvent>) {
        for login in logins {
            if push_bounded(&mut self.logins, login) {
                warn!("login buffer full, oldest event dropped");
            }
        }
    }

    pub fn buffered(&self) -> (usize, usize) {
        (self.results.len(), self.logins.len())
    }

    /// One heartbeat. On `200` the buffers are cleared and the controller's
    /// tasks are returned; on any failure the buffers are kept.
    pub async fn send(&mut self, stats: WireStats, timestamp: i64) -> Result<Vec<WireTask>, ClientError> {
        let request = HeartbeatRequest {
            token: self.token.clone(),
            stats,
            results: self.results.iter().cloned().collect(),
            ssh_logins: self.logins.iter().cloned().collect(),
            timestamp,
        };
        let (body, signature) = request.to_signed_body()?;

        let resp = self
            .http
            .post(&self.url)
            .header(SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(ClientError::Rejected(resp.status()));
        }
        let reply: HeartbeatResponse = resp.json().await?;

        debug!(
            "heartbeat accepted ({} results, {} logins, {} tasks)",
            request.results.len(),
            request.ssh_logins.len(),
            reply.tasks.len()
        );
        self.results.clear();
        self.logins.clear();
        Ok(reply.tasks)
    }
}
