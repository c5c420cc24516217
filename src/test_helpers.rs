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
        GameDataAccount,
        InstructionKind,
        Signature,
        Transaction,
    },
    relay::{
        Relay,
        RelayError,
        RelayRequest,
    },
    wallet::{
        WalletAdapter,
        WalletError,
    },
};
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
    },
};
use tokio::sync::{
    Semaphore,
    mpsc,
};

pub fn game_account() -> Address {
    "8Zb5oRA7WcX4QCf3aGrd9gmY8o6pMNFEFa3Ws1v1aG1s"
        .parse()
        .expect("valid test address")
}

pub fn player_address() -> Address {
    "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin"
        .parse()
        .expect("valid test address")
}

pub fn raw_account(slot: u64, player_position: u8) -> RawAccount {
    RawAccount {
        slot,
        data: GameDataAccount { player_position }.encode(),
    }
}

pub fn confirmed_status(slot: u64) -> SignatureStatus {
    SignatureStatus {
        slot,
        confirmation_status: Some(Commitment::Confirmed),
        err: None,
    }
}

/// Scripted in-memory ledger.
///
/// Fetches and signature statuses pop from queues; an empty fetch queue
/// answers with a network error and an empty status queue with "not seen".
#[derive(Debug, Default)]
pub struct FakeLedger {
    fetches: Mutex<VecDeque<Result<RawAccount, LedgerError>>>,
    fetch_calls: AtomicUsize,
    statuses: Mutex<VecDeque<Option<SignatureStatus>>>,
    status_calls: AtomicUsize,
    status_gate: Mutex<Option<Arc<Semaphore>>>,
    block_height: AtomicU64,
    block_height_step: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<RawAccount>>>,
}

impl FakeLedger {
    pub const BLOCKHASH: &'static str = "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N";
    pub const LAST_VALID_BLOCK_HEIGHT: u64 = 1_000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fetch(&self, response: Result<RawAccount, LedgerError>) {
        self.fetches.lock().unwrap().push_back(response);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn push_status(&self, status: Option<SignatureStatus>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Makes every signature status query wait for a permit on `gate`.
    pub fn gate_statuses(&self, gate: Arc<Semaphore>) {
        *self.status_gate.lock().unwrap() = Some(gate);
    }

    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::SeqCst);
    }

    /// Block height grows by `step` after every query.
    pub fn set_block_height_step(&self, step: u64) {
        self.block_height_step.store(step, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Pushes a notification to every live subscriber.
    pub async fn notify(&self, raw: RawAccount) {
        let subscribers: Vec<_> = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.send(raw.clone()).await;
        }
        self.subscribers.lock().unwrap().retain(|tx| !tx.is_closed());
    }
}

impl Ledger for FakeLedger {
    async fn fetch_account(&self, _address: &Address) -> Result<RawAccount, LedgerError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LedgerError::Network("no scripted response".into())))
    }

    async fn latest_blockhash(&self) -> Result<BlockhashInfo, LedgerError> {
        Ok(BlockhashInfo {
            blockhash: Self::BLOCKHASH.to_string(),
            last_valid_block_height: Self::LAST_VALID_BLOCK_HEIGHT,
        })
    }

    async fn block_height(&self) -> Result<u64, LedgerError> {
        let step = self.block_height_step.load(Ordering::SeqCst);
        Ok(self.block_height.fetch_add(step, Ordering::SeqCst))
    }

    async fn signature_status(
        &self,
        _signature: &Signature,
    ) -> Result<Option<SignatureStatus>, LedgerError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.status_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| LedgerError::Network("gate closed".into()))?
                .forget();
        }
        Ok(self.statuses.lock().unwrap().pop_front().flatten())
    }

    async fn subscribe(&self, _address: &Address) -> Result<AccountSubscription, LedgerError> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().unwrap().push(tx);
        Ok(AccountSubscription::new(rx, None))
    }
}

/// Wallet that records every transaction it is asked to send.
#[derive(Clone, Debug)]
pub struct FakeWallet {
    public_key: Address,
    sent: Arc<Mutex<Vec<Transaction>>>,
    response: Arc<Mutex<Result<Signature, WalletError>>>,
}

impl Default for FakeWallet {
    fn default() -> Self {
        Self {
            public_key: player_address(),
            sent: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Ok(Self::signature()))),
        }
    }
}

impl FakeWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature() -> Signature {
        Signature::new(
            "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW",
        )
    }

    pub fn respond_with(&self, response: Result<Signature, WalletError>) {
        *self.response.lock().unwrap() = response;
    }

    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().unwrap().clone()
    }
}

impl WalletAdapter for FakeWallet {
    fn public_key(&self) -> &Address {
        &self.public_key
    }

    async fn send_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<Signature, WalletError> {
        self.sent.lock().unwrap().push(transaction.clone());
        self.response.lock().unwrap().clone()
    }
}

/// Relay that records request bodies as the HTTP relay would send them.
#[derive(Clone, Debug)]
pub struct FakeRelay {
    bodies: Arc<Mutex<Vec<String>>>,
    response: Arc<Mutex<Result<Value, RelayError>>>,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self {
            bodies: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Ok(serde_json::json!({ "ok": true })))),
        }
    }
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, response: Result<Value, RelayError>) {
        *self.response.lock().unwrap() = response;
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

impl Relay for FakeRelay {
    async fn relay(&self, kind: InstructionKind) -> Result<Value, RelayError> {
        let body = serde_json::to_string(&RelayRequest::from(kind))
            .map_err(|e| RelayError::Payload(e.to_string()))?;
        self.bodies.lock().unwrap().push(body);
        self.response.lock().unwrap().clone()
    }
}
