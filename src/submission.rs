use crate::{
    account::AccountClient,
    ledger::{
        Commitment,
        Ledger,
        LedgerError,
    },
    program::{
        Address,
        InstructionKind,
        ProgramError,
        Signature,
        Transaction,
    },
    relay::{
        Relay,
        RelayError,
    },
    wallet::{
        WalletAdapter,
        WalletError,
    },
};
use serde_json::Value;
use std::{
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    time,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubmissionState {
    #[default]
    Idle,
    Building,
    Signing,
    Submitted,
    Confirmed,
    Relayed,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionOutcome {
    Confirmed(Signature),
    /// Opaque acknowledgement from the relay endpoint.
    Relayed(Value),
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum SubmitError {
    #[error("{0} is already in flight")]
    Busy(InstructionKind),
    #[error("no wallet connected and no relay configured")]
    NoSigner,
    #[error("signing rejected: {0}")]
    SignRejected(String),
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    #[error("transaction {0} was not confirmed before it expired")]
    ConfirmationTimeout(Signature),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Build(#[from] ProgramError),
}

impl From<WalletError> for SubmitError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Rejected(reason) => SubmitError::SignRejected(reason),
            WalletError::Broadcast(reason) | WalletError::Unavailable(reason) => {
                SubmitError::Broadcast(reason)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub commitment: Commitment,
    pub poll_interval: Duration,
    /// Client-side bound on top of the ledger's block-height expiry.
    pub timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            commitment: Commitment::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

/// Builds, signs, broadcasts and confirms one instruction at a time.
pub struct SubmissionPipeline<L, W, R> {
    accounts: AccountClient<L>,
    game_account: Address,
    wallet: Option<W>,
    relay: Option<R>,
    policy: ConfirmationPolicy,
    in_flight: Mutex<Option<InstructionKind>>,
    state: watch::Sender<SubmissionState>,
}

struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<InstructionKind>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock_slot(self.slot) = None;
    }
}

// Ignores poisoning; the slot is a plain `Option`.
fn lock_slot(
    slot: &Mutex<Option<InstructionKind>>,
) -> MutexGuard<'_, Option<InstructionKind>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<L, W, R> SubmissionPipeline<L, W, R>
where
    L: Ledger,
    W: WalletAdapter,
    R: Relay,
{
    pub fn new(
        accounts: AccountClient<L>,
        game_account: Address,
        policy: ConfirmationPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SubmissionState::Idle);
        Self {
            accounts,
            game_account,
            wallet: None,
            relay: None,
            policy,
            in_flight: Mutex::new(None),
            state,
        }
    }

    pub fn with_wallet(mut self, wallet: W) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn with_relay(mut self, relay: R) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn wallet(&self) -> Option<&W> {
        self.wallet.as_ref()
    }

    pub fn state(&self) -> SubmissionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubmissionState> {
        self.state.subscribe()
    }

    /// The action currently being submitted, if any. Drives loading flags.
    pub fn in_flight(&self) -> Option<InstructionKind> {
        *lock_slot(&self.in_flight)
    }

    pub fn is_loading(&self, kind: InstructionKind) -> bool {
        self.in_flight() == Some(kind)
    }

    pub async fn submit(
        &self,
        kind: InstructionKind,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let _guard = self.begin(kind)?;
        let result = self.run(kind).await;
        match &result {
            Ok(SubmissionOutcome::Confirmed(signature)) => {
                info!(%kind, %signature, "transaction confirmed");
                self.set_state(SubmissionState::Confirmed);
            }
            Ok(SubmissionOutcome::Relayed(ack)) => {
                info!(%kind, %ack, "instruction relayed");
                self.set_state(SubmissionState::Relayed);
            }
            Err(err) => {
                error!(%kind, %err, "submission failed");
                self.set_state(SubmissionState::Failed);
            }
        }
        result
    }

    fn begin(&self, kind: InstructionKind) -> Result<InFlightGuard<'_>, SubmitError> {
        let mut slot = lock_slot(&self.in_flight);
        if let Some(current) = *slot {
            warn!(%kind, %current, "rejecting submission while another is in flight");
            return Err(SubmitError::Busy(current));
        }
        *slot = Some(kind);
        Ok(InFlightGuard {
            slot: &self.in_flight,
        })
    }

    async fn run(&self, kind: InstructionKind) -> Result<SubmissionOutcome, SubmitError> {
        let Some(wallet) = &self.wallet else {
            return self.relay_fallback(kind).await;
        };

        self.set_state(SubmissionState::Building);
        let blockhash = self.accounts.ledger().latest_blockhash().await?;
        let instruction = self.accounts.build_instruction(
            kind,
            &self.game_account,
            Some(wallet.public_key()),
        )?;
        let transaction = Transaction {
            fee_payer: wallet.public_key().clone(),
            recent_blockhash: blockhash.blockhash,
            last_valid_block_height: blockhash.last_valid_block_height,
            instructions: vec![instruction],
        };

        self.set_state(SubmissionState::Signing);
        let signature = wallet.send_transaction(&transaction).await?;

        self.set_state(SubmissionState::Submitted);
        debug!(%kind, %signature, "awaiting confirmation");
        time::timeout(
            self.policy.timeout,
            self.poll_confirmation(&signature, transaction.last_valid_block_height),
        )
        .await
        .map_err(|_| SubmitError::ConfirmationTimeout(signature.clone()))??;
        Ok(SubmissionOutcome::Confirmed(signature))
    }

    async fn relay_fallback(
        &self,
        kind: InstructionKind,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let relay = self.relay.as_ref().ok_or(SubmitError::NoSigner)?;
        info!(%kind, "no wallet connected, sending through relay");
        self.set_state(SubmissionState::Submitted);
        let ack = relay.relay(kind).await?;
        Ok(SubmissionOutcome::Relayed(ack))
    }

    async fn poll_confirmation(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<(), SubmitError> {
        let ledger = self.accounts.ledger();
        let mut ticker = time::interval(self.policy.poll_interval);
        loop {
            ticker.tick().await;
            match ledger.signature_status(signature).await {
                Ok(Some(status)) => {
                    if let Some(err) = status.err {
                        return Err(SubmitError::Broadcast(format!(
                            "transaction {signature} failed: {err}"
                        )));
                    }
                    if status.reached(self.policy.commitment) {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(%signature, %err, "signature status poll failed"),
            }
            match ledger.block_height().await {
                Ok(height) if height > last_valid_block_height => {
                    return Err(SubmitError::ConfirmationTimeout(signature.clone()));
                }
                Ok(_) => {}
                Err(err) => warn!(%signature, %err, "block height poll failed"),
            }
        }
    }

    fn set_state(&self, state: SubmissionState) {
        self.state.send_replace(state);
    }
}
