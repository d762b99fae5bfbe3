//! Supervisor agent REST client
//!
//! Each postgres node runs a supervisor agent exposing a Patroni-style
//! REST API on port 8008: `GET /primary` and `GET /replica` answer 200
//! for the matching role (HAProxy probes these too), `GET /health`
//! reports role and state, and `POST /switchover` performs a planned
//! role change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::{ControllerError, ControllerResult};

/// Health document returned by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorHealth {
    pub role: String,

    #[serde(default)]
    pub state: String,

    /// Bytes of WAL the node has not replayed yet; primary reports 0
    #[serde(default)]
    pub lag_bytes: i64,
}

impl SupervisorHealth {
    pub fn is_primary(&self) -> bool {
        self.role == "master" || self.role == "primary"
    }

    pub fn is_running(&self) -> bool {
        self.state.is_empty() || self.state == "running" || self.state == "streaming"
    }
}

#[derive(Debug, Serialize)]
struct SwitchoverBody<'a> {
    leader: &'a str,
    candidate: &'a str,
}

/// Thin reqwest wrapper; all calls go to the host-mapped agent port.
#[derive(Clone)]
pub struct SupervisorClient {
    http: reqwest::Client,
}

impl SupervisorClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn base(&self, port: u16) -> String {
        format!("http://127.0.0.1:{}", port)
    }

    /// Role/state/lag snapshot
    pub async fn health(&self, port: u16) -> ControllerResult<SupervisorHealth> {
        let url = format!("{}/health", self.base(port));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ControllerError::Other(format!("supervisor unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(ControllerError::Other(format!(
                "supervisor health returned {}",
                response.status()
            )));
        }

        response
            .json::<SupervisorHealth>()
            .await
            .map_err(|e| ControllerError::Other(format!("bad supervisor health body: {}", e)))
    }

    /// True when `GET /primary` answers 200, matching the HAProxy probe
    pub async fn is_primary(&self, port: u16) -> bool {
        let url = format!("{}/primary", self.base(port));
        matches!(
            self.http.get(&url).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    /// True when `GET /replica` answers 200
    pub async fn is_replica(&self, port: u16) -> bool {
        let url = format!("{}/replica", self.base(port));
        matches!(
            self.http.get(&url).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    /// Planned role change: ask the current leader's agent to hand the
    /// cluster to the named candidate.
    pub async fn switchover(
        &self,
        port: u16,
        leader: &str,
        candidate: &str,
    ) -> ControllerResult<()> {
        let url = format!("{}/switchover", self.base(port));
        let response = self
            .http
            .post(&url)
            .json(&SwitchoverBody { leader, candidate })
            .send()
            .await
            .map_err(|e| ControllerError::Other(format!("switchover request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ControllerError::Other(format!(
                "switchover rejected ({}): {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}

impl Default for SupervisorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_role_detection() {
        let health = SupervisorHealth {
            role: "master".to_string(),
            state: "running".to_string(),
            lag_bytes: 0,
        };
        assert!(health.is_primary());
        assert!(health.is_running());

        let replica = SupervisorHealth {
            role: "replica".to_string(),
            state: "streaming".to_string(),
            lag_bytes: 1024,
        };
        assert!(!replica.is_primary());
        assert!(replica.is_running());
    }

    #[test]
    fn test_health_parses_minimal_body() {
        let health: SupervisorHealth = serde_json::from_str(r#"{"role":"primary"}"#).unwrap();
        assert!(health.is_primary());
        assert_eq!(health.lag_bytes, 0);
    }
}
