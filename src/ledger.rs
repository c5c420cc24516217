use crate::program::{
    Address,
    DecodeError,
    Signature,
};
use futures::Stream;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account {0} not found")]
    NotFound(Address),
    #[error("network error: {0}")]
    Network(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed ledger response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account bytes as observed by the ledger at `slot`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawAccount {
    pub slot: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockhashInfo {
    pub blockhash: String,
    pub last_valid_block_height: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    pub confirmation_status: Option<Commitment>,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
}

impl SignatureStatus {
    pub fn reached(&self, commitment: Commitment) -> bool {
        self.confirmation_status
            .is_some_and(|status| status >= commitment)
    }
}

/// Read side of the ledger plus account change notifications.
pub trait Ledger: Send + Sync + 'static {
    fn fetch_account(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<RawAccount, LedgerError>> + Send;

    fn latest_blockhash(
        &self,
    ) -> impl Future<Output = Result<BlockhashInfo, LedgerError>> + Send;

    fn block_height(&self) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// `None` while the ledger has not seen the signature yet.
    fn signature_status(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Option<SignatureStatus>, LedgerError>> + Send;

    fn subscribe(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<AccountSubscription, LedgerError>> + Send;
}

/// Ordered stream of account notifications. Dropping or closing it stops the
/// task feeding it.
#[derive(Debug)]
pub struct AccountSubscription {
    updates: mpsc::Receiver<RawAccount>,
    feeder: Option<JoinHandle<()>>,
}

impl AccountSubscription {
    pub fn new(updates: mpsc::Receiver<RawAccount>, feeder: Option<JoinHandle<()>>) -> Self {
        Self { updates, feeder }
    }

    pub async fn close(mut self) {
        self.updates.close();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
            let _ = feeder.await;
        }
    }
}

impl Stream for AccountSubscription {
    type Item = RawAccount;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RawAccount>> {
        self.updates.poll_recv(cx)
    }
}

impl Drop for AccountSubscription {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}
