use crate::{
    ledger::{
        AccountSubscription,
        Ledger,
        LedgerError,
        RawAccount,
    },
    program::{
        self,
        Address,
        GameDataAccount,
        Instruction,
        InstructionKind,
        ProgramError,
    },
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchedAccount {
    pub account: GameDataAccount,
    pub slot: u64,
}

/// Reads, builds instructions for, and watches the game-data account.
#[derive(Debug)]
pub struct AccountClient<L> {
    ledger: Arc<L>,
    program_id: Address,
}

impl<L> Clone for AccountClient<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            program_id: self.program_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct SubscriptionHandle {
    address: Address,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl<L: Ledger> AccountClient<L> {
    pub fn new(ledger: Arc<L>, program_id: Address) -> Self {
        Self { ledger, program_id }
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn program_id(&self) -> &Address {
        &self.program_id
    }

    pub async fn fetch_account(
        &self,
        address: &Address,
    ) -> Result<FetchedAccount, LedgerError> {
        let raw = self.ledger.fetch_account(address).await?;
        let account = GameDataAccount::decode(&raw.data)?;
        Ok(FetchedAccount {
            account,
            slot: raw.slot,
        })
    }

    pub fn build_instruction(
        &self,
        kind: InstructionKind,
        address: &Address,
        signer: Option<&Address>,
    ) -> Result<Instruction, ProgramError> {
        program::build_instruction(kind, &self.program_id, address, signer)
    }

    pub async fn updates(
        &self,
        address: &Address,
    ) -> Result<AccountSubscription, LedgerError> {
        self.ledger.subscribe(address).await
    }

    /// Calls `on_change` for every notification, in ledger order, until
    /// [`AccountClient::unsubscribe`].
    pub async fn subscribe<F>(
        &self,
        address: &Address,
        mut on_change: F,
    ) -> Result<SubscriptionHandle, LedgerError>
    where
        F: FnMut(RawAccount) + Send + 'static,
    {
        let mut updates = self.updates(address).await?;
        let task = tokio::spawn(async move {
            while let Some(raw) = updates.next().await {
                on_change(raw);
            }
        });
        debug!(%address, "subscribed to account changes");
        Ok(SubscriptionHandle {
            address: address.clone(),
            task,
        })
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        handle.task.abort();
        let _ = handle.task.await;
        debug!(address = %handle.address, "unsubscribed from account changes");
    }
}
