use crate::{
    account::AccountClient,
    ledger::{
        AccountSubscription,
        Ledger,
        LedgerError,
        RawAccount,
    },
    program::{
        Address,
        DecodeError,
        GameDataAccount,
    },
};
use futures::StreamExt;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// `None` retries until success or cancellation.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_RETRY_BACKOFF,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
        }
    }
}

/// Local copy of the game-data account. Replaced wholesale, never patched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CachedView {
    pub account: Option<GameDataAccount>,
    /// Ledger slot the account was observed at.
    pub slot: u64,
    /// Bumped on every accepted replacement.
    pub version: u64,
}

impl CachedView {
    pub fn is_valid(&self) -> bool {
        self.account.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Replaced,
    Unchanged,
    /// Observed at an older slot than the cached view; dropped.
    Stale,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: LedgerError },
    #[error("refresh cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Ledger(LedgerError::NotFound(_)))
    }
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Owns the cached view and keeps it in step with the ledger.
pub struct Synchronizer<L> {
    accounts: AccountClient<L>,
    retry: RetryPolicy,
    view: watch::Sender<CachedView>,
    cancel: CancelToken,
}

impl<L: Ledger> Synchronizer<L> {
    pub fn new(accounts: AccountClient<L>, retry: RetryPolicy) -> Self {
        let (view, _) = watch::channel(CachedView::default());
        Self {
            accounts,
            retry,
            view,
            cancel: CancelToken::new(),
        }
    }

    pub fn view(&self) -> CachedView {
        *self.view.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<CachedView> {
        self.view.subscribe()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stops every retry loop and follower tied to this synchronizer.
    pub fn shutdown(&self) {
        info!("stopping account synchronizer");
        self.cancel.cancel();
    }

    /// Fetches and caches the account, returning the account the view holds
    /// afterwards. A failed initial attempt is returned as is; later attempts
    /// retry every `backoff` per the retry policy.
    pub async fn refresh(
        &self,
        address: &Address,
        is_initial_attempt: bool,
    ) -> Result<GameDataAccount, SyncError> {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            attempts += 1;
            debug!(%address, attempts, "fetching game data account");
            let err = match self.accounts.fetch_account(address).await {
                Ok(fetched) => {
                    if self.replace(fetched.account, fetched.slot) == Applied::Stale {
                        // a newer notification already landed; report what is cached
                        debug!(%address, slot = fetched.slot, "fetched account older than view");
                        return Ok(self.view().account.unwrap_or(fetched.account));
                    }
                    return Ok(fetched.account);
                }
                Err(err) => err,
            };
            if is_initial_attempt {
                warn!(%address, %err, "initial game data fetch failed");
                return Err(err.into());
            }
            if self.retry.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(SyncError::RetriesExhausted {
                    attempts,
                    last: err,
                });
            }
            warn!(%address, %err, attempts, "game data fetch failed, retrying");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = time::sleep(self.retry.backoff) => {}
            }
        }
    }

    /// Applies a pushed notification. A decode failure leaves the view as is.
    pub fn on_remote_change(&self, raw: &RawAccount) -> Result<Applied, DecodeError> {
        let account = GameDataAccount::decode(&raw.data)?;
        debug!(
            slot = raw.slot,
            position = account.player_position,
            "account change notification"
        );
        Ok(self.replace(account, raw.slot))
    }

    /// Applies notifications until the stream ends or the synchronizer stops.
    pub async fn follow(&self, mut updates: AccountSubscription) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = updates.next() => match next {
                    Some(raw) => {
                        if let Err(err) = self.on_remote_change(&raw) {
                            warn!(slot = raw.slot, %err, "dropping undecodable account notification");
                        }
                    }
                    None => {
                        debug!("account notification stream ended");
                        break;
                    }
                },
            }
        }
        updates.close().await;
    }

    fn replace(&self, account: GameDataAccount, slot: u64) -> Applied {
        let mut applied = Applied::Unchanged;
        self.view.send_if_modified(|view| {
            if view.is_valid() && slot < view.slot {
                applied = Applied::Stale;
                return false;
            }
            if view.account == Some(account) && view.slot == slot {
                return false;
            }
            *view = CachedView {
                account: Some(account),
                slot,
                version: view.version + 1,
            };
            applied = Applied::Replaced;
            true
        });
        if applied == Applied::Stale {
            debug!(slot, "ignoring account state older than cached view");
        }
        applied
    }
}

impl<L: Ledger> Synchronizer<L> {
    pub fn spawn_refresh(
        self: &Arc<Self>,
        address: Address,
        is_initial_attempt: bool,
    ) -> JoinHandle<Result<GameDataAccount, SyncError>> {
        let this = self.clone();
        tokio::spawn(async move { this.refresh(&address, is_initial_attempt).await })
    }

    pub fn spawn_follow(self: &Arc<Self>, updates: AccountSubscription) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.follow(updates).await })
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        FakeLedger,
        game_account,
        raw_account,
    };

    fn synchronizer(ledger: Arc<FakeLedger>, retry: RetryPolicy) -> Synchronizer<FakeLedger> {
        let accounts =
            AccountClient::new(ledger, crate::program::DEFAULT_PROGRAM_ID.parse().unwrap());
        Synchronizer::new(accounts, retry)
    }

    #[tokio::test]
    async fn refresh__replaces_view_on_success() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        ledger.push_fetch(Ok(raw_account(5, 1)));
        let sync = synchronizer(ledger, RetryPolicy::default());

        // when
        let account = sync.refresh(&game_account(), true).await.unwrap();

        // then
        assert_eq!(account.player_position, 1);
        assert_eq!(
            sync.view(),
            CachedView {
                account: Some(account),
                slot: 5,
                version: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh__bounded_policy_gives_up_after_cap() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        for _ in 0..3 {
            ledger.push_fetch(Err(LedgerError::Network("connection reset".into())));
        }
        let sync = synchronizer(
            ledger.clone(),
            RetryPolicy::bounded(Duration::from_secs(1), 3),
        );

        // when
        let result = sync.refresh(&game_account(), false).await;

        // then
        assert_eq!(
            result,
            Err(SyncError::RetriesExhausted {
                attempts: 3,
                last: LedgerError::Network("connection reset".into()),
            })
        );
        assert_eq!(ledger.fetch_calls(), 3);
        assert!(!sync.view().is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh__cancellation_stops_retry_loop() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        let sync = Arc::new(synchronizer(ledger.clone(), RetryPolicy::default()));
        let handle = sync.spawn_refresh(game_account(), false);
        time::sleep(Duration::from_millis(3500)).await;

        // when
        sync.shutdown();
        let result = handle.await.unwrap();

        // then
        assert_eq!(result, Err(SyncError::Cancelled));
        let calls = ledger.fetch_calls();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ledger.fetch_calls(), calls);
    }

    #[tokio::test]
    async fn on_remote_change__decode_failure_keeps_view() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        let sync = synchronizer(ledger, RetryPolicy::default());
        sync.on_remote_change(&raw_account(3, 2)).unwrap();
        let before = sync.view();

        // when
        let result = sync.on_remote_change(&RawAccount {
            slot: 4,
            data: vec![1, 2, 3],
        });

        // then
        assert!(result.is_err());
        assert_eq!(sync.view(), before);
    }

    #[tokio::test]
    async fn on_remote_change__older_slot_is_stale() {
        // given
        let sync = synchronizer(Arc::new(FakeLedger::new()), RetryPolicy::default());
        sync.on_remote_change(&raw_account(10, 3)).unwrap();

        // when
        let applied = sync.on_remote_change(&raw_account(9, 0)).unwrap();

        // then
        assert_eq!(applied, Applied::Stale);
        assert_eq!(sync.view().account.unwrap().player_position, 3);
    }

    #[tokio::test]
    async fn follow__survives_bad_notification_and_applies_next() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        let sync = Arc::new(synchronizer(ledger.clone(), RetryPolicy::default()));
        let mut view = sync.watch();
        let updates = ledger.subscribe(&game_account()).await.unwrap();
        let follower = sync.spawn_follow(updates);

        // when
        ledger
            .notify(RawAccount {
                slot: 1,
                data: vec![9; 2],
            })
            .await;
        ledger.notify(raw_account(2, 1)).await;
        view.changed().await.unwrap();

        // then
        assert_eq!(sync.view().account.unwrap().player_position, 1);
        sync.shutdown();
        follower.await.unwrap();
    }
}
