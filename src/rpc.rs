use crate::{
    ledger::{
        AccountSubscription,
        BlockhashInfo,
        Commitment,
        Ledger,
        LedgerError,
        RawAccount,
        SignatureStatus,
    },
    program::{
        Address,
        Signature,
    },
};
use base64::{
    Engine,
    engine::general_purpose::STANDARD as BASE64,
};
use futures::{
    SinkExt,
    StreamExt,
};
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
};
use tracing::{
    debug,
    warn,
};

const SUBSCRIPTION_BUFFER: usize = 32;
const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// JSON-RPC ledger client with WebSocket account notifications.
#[derive(Clone, Debug)]
pub struct RpcLedger {
    rpc_url: String,
    ws_url: String,
    commitment: Commitment,
    resubscribe_delay: Duration,
    http: reqwest::Client,
}

impl RpcLedger {
    pub fn new(
        rpc_url: impl Into<String>,
        ws_url: impl Into<String>,
        commitment: Commitment,
    ) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            rpc_url: rpc_url.into(),
            ws_url: ws_url.into(),
            commitment,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            http,
        })
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let res = self
            .http
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LedgerError::Network(format!("{method} request failed: {e}")))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| LedgerError::Network(format!("{method} body read failed: {e}")))?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(LedgerError::Network(format!(
                "{method} responded with {status}: {body}"
            )));
        }
        let envelope: RpcEnvelope<T> = serde_json::from_slice(&bytes)
            .map_err(|e| LedgerError::Malformed(format!("{method}: {e}")))?;
        envelope.into_result(method)
    }
}

impl Ledger for RpcLedger {
    async fn fetch_account(&self, address: &Address) -> Result<RawAccount, LedgerError> {
        let params = json!([
            address.to_string(),
            { "encoding": "base64", "commitment": self.commitment.as_str() },
        ]);
        let response: WithContext<Option<AccountInfoDto>> =
            self.call("getAccountInfo", params).await?;
        let info = response
            .value
            .ok_or_else(|| LedgerError::NotFound(address.clone()))?;
        Ok(RawAccount {
            slot: response.context.slot,
            data: info.decode_data()?,
        })
    }

    async fn latest_blockhash(&self) -> Result<BlockhashInfo, LedgerError> {
        let params = json!([{ "commitment": self.commitment.as_str() }]);
        let response: WithContext<BlockhashDto> =
            self.call("getLatestBlockhash", params).await?;
        Ok(BlockhashInfo {
            blockhash: response.value.blockhash,
            last_valid_block_height: response.value.last_valid_block_height,
        })
    }

    async fn block_height(&self) -> Result<u64, LedgerError> {
        let params = json!([{ "commitment": self.commitment.as_str() }]);
        self.call("getBlockHeight", params).await
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<SignatureStatus>, LedgerError> {
        let params = json!([[signature.as_str()], { "searchTransactionHistory": false }]);
        let response: WithContext<Vec<Option<SignatureStatus>>> =
            self.call("getSignatureStatuses", params).await?;
        Ok(response.value.into_iter().next().flatten())
    }

    async fn subscribe(&self, address: &Address) -> Result<AccountSubscription, LedgerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let feeder = tokio::spawn(feed_account_notifications(
            self.clone(),
            address.clone(),
            tx,
        ));
        Ok(AccountSubscription::new(rx, Some(feeder)))
    }
}

/// Keeps one account subscription alive, reconnecting after the resubscribe
/// delay whenever the socket drops, until the consumer goes away.
async fn feed_account_notifications(
    ledger: RpcLedger,
    address: Address,
    tx: mpsc::Sender<RawAccount>,
) {
    let mut resumed = false;
    loop {
        match stream_account(&ledger, &address, resumed, &tx).await {
            Ok(()) => debug!(%address, "account subscription socket closed"),
            Err(err) => warn!(%address, %err, "account subscription dropped"),
        }
        if tx.is_closed() {
            return;
        }
        resumed = true;
        tokio::time::sleep(ledger.resubscribe_delay).await;
    }
}

/// Runs one pubsub connection. Unreadable messages are skipped; only socket
/// failures and subscription errors end the connection.
async fn stream_account(
    ledger: &RpcLedger,
    address: &Address,
    resumed: bool,
    tx: &mpsc::Sender<RawAccount>,
) -> Result<(), LedgerError> {
    let network = |e: tokio_tungstenite::tungstenite::Error| {
        LedgerError::Network(format!("pubsub: {e}"))
    };
    let (mut ws, _) = connect_async(ledger.ws_url.as_str()).await.map_err(network)?;
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "accountSubscribe",
        "params": [
            address.to_string(),
            { "encoding": "base64", "commitment": ledger.commitment.as_str() },
        ],
    });
    ws.send(Message::Text(request.to_string()))
        .await
        .map_err(network)?;

    let mut subscription_id = None;
    while let Some(message) = ws.next().await {
        let text = match message.map_err(network)? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload)).await.map_err(network)?;
                continue;
            }
            Message::Close(_) => return Ok(()),
            Message::Pong(_) | Message::Frame(_) => continue,
        };
        let parsed = match parse_pubsub_message(&text) {
            Ok(parsed) => parsed,
            Err(err @ (LedgerError::Malformed(_) | LedgerError::Decode(_))) => {
                warn!(%address, %err, "skipping unreadable pubsub message");
                continue;
            }
            Err(err) => return Err(err),
        };
        let raw = match parsed {
            PubsubMessage::Subscribed(id) => {
                debug!(%address, id, "account subscription active");
                subscription_id = Some(id);
                if !resumed {
                    continue;
                }
                // notifications sent while disconnected are gone; read the
                // current state once so the consumer catches up
                match ledger.fetch_account(address).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(%address, %err, "catch-up fetch after resubscribe failed");
                        continue;
                    }
                }
            }
            PubsubMessage::Notification(raw) => raw,
            PubsubMessage::Other => continue,
        };
        if tx.send(raw).await.is_err() {
            if let Some(id) = subscription_id {
                let unsubscribe = json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "accountUnsubscribe",
                    "params": [id],
                });
                let _ = ws.send(Message::Text(unsubscribe.to_string())).await;
            }
            let _ = ws.close(None).await;
            return Ok(());
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum PubsubMessage {
    Subscribed(u64),
    Notification(RawAccount),
    Other,
}

fn parse_pubsub_message(text: &str) -> Result<PubsubMessage, LedgerError> {
    let message: PubsubDto = serde_json::from_str(text)
        .map_err(|e| LedgerError::Malformed(format!("pubsub message: {e}")))?;
    if let Some(error) = message.error {
        return Err(LedgerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    match (message.method.as_deref(), message.result, message.params) {
        (Some("accountNotification"), _, Some(params)) => {
            let notification: WithContext<AccountInfoDto> =
                serde_json::from_value(params.result).map_err(|e| {
                    LedgerError::Malformed(format!("account notification: {e}"))
                })?;
            Ok(PubsubMessage::Notification(RawAccount {
                slot: notification.context.slot,
                data: notification.value.decode_data()?,
            }))
        }
        (None, Some(Value::Number(id)), _) => id
            .as_u64()
            .map(PubsubMessage::Subscribed)
            .ok_or_else(|| LedgerError::Malformed(format!("subscription id {id}"))),
        _ => Ok(PubsubMessage::Other),
    }
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorDto>,
}

impl<T> RpcEnvelope<T> {
    fn into_result(self, method: &str) -> Result<T, LedgerError> {
        if let Some(error) = self.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        self.result
            .ok_or_else(|| LedgerError::Malformed(format!("{method}: missing result")))
    }
}

#[derive(Deserialize)]
struct RpcErrorDto {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct WithContext<T> {
    context: SlotContext,
    value: T,
}

#[derive(Deserialize)]
struct SlotContext {
    slot: u64,
}

#[derive(Deserialize)]
struct AccountInfoDto {
    data: (String, String),
}

impl AccountInfoDto {
    fn decode_data(&self) -> Result<Vec<u8>, LedgerError> {
        let (encoded, encoding) = &self.data;
        if encoding != "base64" {
            return Err(LedgerError::Malformed(format!(
                "unexpected account encoding {encoding}"
            )));
        }
        BASE64
            .decode(encoded)
            .map_err(|e| LedgerError::Malformed(format!("account data: {e}")))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashDto {
    blockhash: String,
    last_valid_block_height: u64,
}

#[derive(Deserialize)]
struct PubsubDto {
    method: Option<String>,
    result: Option<Value>,
    params: Option<NotificationParams>,
    error: Option<RpcErrorDto>,
}

#[derive(Deserialize)]
struct NotificationParams {
    result: Value,
}
