use crate::{
    program::{
        Address,
        Signature,
        Transaction,
    },
    rpc::DEFAULT_HTTP_TIMEOUT,
};
use reqwest::StatusCode;
use serde::Deserialize;
use std::{
    future::Future,
    time::Duration,
};
use tracing::debug;

/// Upper bound on a wallet round trip, including the user approving the prompt.
pub const SIGNING_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet rejected the transaction: {0}")]
    Rejected(String),
    #[error("wallet failed to broadcast: {0}")]
    Broadcast(String),
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}

/// External signer that authorizes and broadcasts transactions for the player.
pub trait WalletAdapter: Send + Sync + 'static {
    fn public_key(&self) -> &Address;

    fn send_transaction(
        &self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<Signature, WalletError>> + Send;
}

/// Bridge to a wallet process exposing `GET /public-key` and
/// `POST /send-transaction`.
#[derive(Clone, Debug)]
pub struct RemoteWallet {
    base_url: String,
    public_key: Address,
    http: reqwest::Client,
}

impl RemoteWallet {
    pub async fn connect(base_url: impl Into<String>) -> Result<Self, WalletError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_HTTP_TIMEOUT)
            .timeout(SIGNING_TIMEOUT)
            .build()
            .map_err(|e| WalletError::Unavailable(format!("HTTP client: {e}")))?;
        let url = format!("{base_url}/public-key");
        let res = http
            .get(url)
            .send()
            .await
            .map_err(|e| WalletError::Unavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(WalletError::Unavailable(format!(
                "wallet responded with {} to public key request",
                res.status()
            )));
        }
        let dto: PublicKeyDto = res
            .json()
            .await
            .map_err(|e| WalletError::Unavailable(format!("invalid public key payload: {e}")))?;
        let public_key = dto
            .public_key
            .parse()
            .map_err(|e| WalletError::Unavailable(format!("{e}")))?;
        debug!(%public_key, "connected to wallet");
        Ok(Self {
            base_url,
            public_key,
            http,
        })
    }
}

impl WalletAdapter for RemoteWallet {
    fn public_key(&self) -> &Address {
        &self.public_key
    }

    async fn send_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<Signature, WalletError> {
        let url = format!("{}/send-transaction", self.base_url);
        let res = self
            .http
            .post(url)
            .json(transaction)
            .send()
            .await
            .map_err(|e| WalletError::Unavailable(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| WalletError::Broadcast(format!("failed to read wallet response: {e}")))?;
        let reply: SendTransactionDto = serde_json::from_slice(&bytes).unwrap_or_default();
        classify_reply(status, reply, &bytes)
    }
}

fn classify_reply(
    status: StatusCode,
    reply: SendTransactionDto,
    raw: &[u8],
) -> Result<Signature, WalletError> {
    let reason = || {
        reply
            .error
            .clone()
            .unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned())
    };
    if status == StatusCode::FORBIDDEN || reply.error.as_deref() == Some("rejected") {
        return Err(WalletError::Rejected(reason()));
    }
    if !status.is_success() {
        return Err(WalletError::Broadcast(format!("{status}: {}", reason())));
    }
    reply
        .signature
        .map(Signature::new)
        .ok_or_else(|| WalletError::Broadcast("wallet reply carried no signature".into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyDto {
    public_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct SendTransactionDto {
    signature: Option<String>,
    error: Option<String>,
}
