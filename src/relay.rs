use crate::{
    program::InstructionKind,
    rpc::DEFAULT_HTTP_TIMEOUT,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    future::Future,
    time::Duration,
};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Request(String),
    #[error("relay responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("relay acknowledgement was not JSON: {0}")]
    Payload(String),
}

/// Server-mediated broadcast used when the player has no wallet connected.
pub trait Relay: Send + Sync + 'static {
    fn relay(
        &self,
        kind: InstructionKind,
    ) -> impl Future<Output = Result<Value, RelayError>> + Send;
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct RelayRequest {
    pub instruction: &'static str,
}

impl From<InstructionKind> for RelayRequest {
    fn from(kind: InstructionKind) -> Self {
        Self {
            instruction: kind.relay_name(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpRelay {
    url: String,
    http: reqwest::Client,
}

impl HttpRelay {
    pub fn new(url: impl Into<String>) -> Result<Self, RelayError> {
        Self::with_timeout(url, DEFAULT_HTTP_TIMEOUT)
    }

    /// Relay client whose requests give up after `timeout`.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

impl Relay for HttpRelay {
    async fn relay(&self, kind: InstructionKind) -> Result<Value, RelayError> {
        let res = self
            .http
            .post(&self.url)
            .json(&RelayRequest::from(kind))
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| RelayError::Request(format!("failed to read body: {e}")))?;
        if !status.is_success() {
            return Err(RelayError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| RelayError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn relay_request__uses_camel_case_instruction_names() {
        // when
        let bodies: Vec<String> = InstructionKind::ALL
            .into_iter()
            .map(|kind| serde_json::to_string(&RelayRequest::from(kind)).unwrap())
            .collect();

        // then
        assert_eq!(
            bodies,
            vec![
                r#"{"instruction":"initialize"}"#,
                r#"{"instruction":"moveLeft"}"#,
                r#"{"instruction":"moveRight"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn relay__stalled_endpoint_fails_after_timeout() {
        // given
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/relay", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            // accept and never answer
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let relay = HttpRelay::with_timeout(url, Duration::from_millis(200)).unwrap();

        // when
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay.relay(InstructionKind::MoveLeft),
        )
        .await
        .unwrap();

        // then
        assert!(matches!(result, Err(RelayError::Request(_))));
        server.abort();
    }
}
