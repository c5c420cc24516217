use crate::{
    account::AccountClient,
    config::{
        self,
        Action,
        AppConfig,
    },
    display::PositionDisplay,
    ledger::{
        Ledger,
        LedgerError,
    },
    program::{
        Address,
        GameDataAccount,
        InstructionKind,
    },
    relay::{
        HttpRelay,
        Relay,
    },
    rpc::RpcLedger,
    submission::{
        SubmissionOutcome,
        SubmissionPipeline,
        SubmissionState,
        SubmitError,
    },
    sync::{
        CachedView,
        Synchronizer,
        SyncError,
    },
    ui,
    wallet::{
        RemoteWallet,
        WalletAdapter,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};
use tracing_appender::rolling;
use tracing_subscriber::EnvFilter;

const MAX_ERRORS: usize = 5;
const NOT_INITIALIZED: &str = "Game not initialized yet, press i to start";
const LOADING: &str = "Loading game data...";

#[derive(Clone, Debug)]
pub struct AppSnapshot {
    pub network: String,
    pub game_account: Address,
    pub wallet: Option<Address>,
    pub display: PositionDisplay,
    pub view: CachedView,
    pub in_flight: Option<InstructionKind>,
    pub submission: SubmissionState,
    pub status: String,
    pub errors: Vec<String>,
}

#[derive(Debug)]
pub enum AppEvent {
    /// Outcome of the initial load kicked off by `start`.
    Loaded(Result<GameDataAccount, SyncError>),
    LiveUpdatesUnavailable(LedgerError),
    Submitted(InstructionKind, Result<SubmissionOutcome, SubmitError>),
    Refreshed(Result<GameDataAccount, SyncError>),
}

pub struct AppController<L, W, R> {
    network: String,
    game_account: Address,
    accounts: AccountClient<L>,
    pipeline: Arc<SubmissionPipeline<L, W, R>>,
    sync: Arc<Synchronizer<L>>,
    events: mpsc::UnboundedSender<AppEvent>,
    display: PositionDisplay,
    follower: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
    pub status: String,
    errors: Vec<String>,
}

pub type RemoteController = AppController<RpcLedger, RemoteWallet, HttpRelay>;

impl RemoteController {
    pub async fn connect(
        config: &AppConfig,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self> {
        let ledger = RpcLedger::new(
            config.network.url(),
            config.ws_url.clone(),
            config.confirmation.commitment,
        )
        .wrap_err("Failed to build RPC client")?;
        let accounts = AccountClient::new(Arc::new(ledger), config.program_id.clone());

        let mut pipeline = SubmissionPipeline::new(
            accounts.clone(),
            config.game_account.clone(),
            config.confirmation,
        );
        if let Some(url) = &config.wallet_url {
            let wallet = RemoteWallet::connect(url.clone())
                .await
                .wrap_err_with(|| format!("Failed to connect wallet at {url}"))?;
            info!(public_key = %wallet.public_key(), "wallet connected");
            pipeline = pipeline.with_wallet(wallet);
        }
        if let Some(url) = &config.relay_url {
            pipeline = pipeline
                .with_relay(HttpRelay::new(url.clone()).wrap_err("Failed to build relay client")?);
        }

        let sync = Synchronizer::new(accounts.clone(), config.retry);
        Ok(AppController::new(
            config.network.to_string(),
            config.game_account.clone(),
            accounts,
            pipeline,
            sync,
            events,
        ))
    }
}

impl<L, W, R> AppController<L, W, R>
where
    L: Ledger,
    W: WalletAdapter,
    R: Relay,
{
    pub fn new(
        network: impl Into<String>,
        game_account: Address,
        accounts: AccountClient<L>,
        pipeline: SubmissionPipeline<L, W, R>,
        sync: Synchronizer<L>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            network: network.into(),
            game_account,
            accounts,
            pipeline: Arc::new(pipeline),
            sync: Arc::new(sync),
            events,
            display: PositionDisplay::default(),
            follower: None,
            refresh: None,
            status: String::from(LOADING),
            errors: Vec::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<SubmissionPipeline<L, W, R>> {
        &self.pipeline
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer<L>> {
        &self.sync
    }

    pub fn display(&self) -> &PositionDisplay {
        &self.display
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Initial load followed by the push subscription, both in the
    /// background. The load result arrives as `AppEvent::Loaded`.
    pub fn start(&mut self) {
        let sync = self.sync.clone();
        let accounts = self.accounts.clone();
        let address = self.game_account.clone();
        let events = self.events.clone();
        self.follower = Some(tokio::spawn(async move {
            let startup = async {
                let loaded = sync.refresh(&address, true).await;
                let _ = events.send(AppEvent::Loaded(loaded));
                match accounts.updates(&address).await {
                    Ok(updates) => sync.follow(updates).await,
                    Err(err) => {
                        let _ = events.send(AppEvent::LiveUpdatesUnavailable(err));
                    }
                }
            };
            tokio::select! {
                biased;
                _ = sync.cancel_token().cancelled() => {}
                _ = startup => {}
            }
        }));
    }

    pub fn apply_view(&mut self, view: CachedView) {
        let Some(account) = view.account else {
            return;
        };
        if let Err(err) = self
            .display
            .update_player_position(i64::from(account.player_position))
        {
            self.push_error(err.to_string());
        } else if self.status == NOT_INITIALIZED {
            self.set_status("Ready");
        }
    }

    pub fn submit(&mut self, kind: InstructionKind) {
        if let Some(current) = self.pipeline.in_flight() {
            self.push_error(SubmitError::Busy(current).to_string());
            return;
        }
        self.set_status(format!("Sending {kind}..."));
        let pipeline = self.pipeline.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = pipeline.submit(kind).await;
            let _ = events.send(AppEvent::Submitted(kind, result));
        });
    }

    /// Retrying refresh in the background; the result comes back as an event.
    /// At most one refresh runs at a time, later requests join the running one.
    pub fn request_refresh(&mut self) {
        if self.refresh.as_ref().is_some_and(|running| !running.is_finished()) {
            debug!("refresh already running");
            return;
        }
        let handle = self.sync.spawn_refresh(self.game_account.clone(), false);
        let events = self.events.clone();
        self.refresh = Some(tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!(%err, "refresh task failed");
                    return;
                }
            };
            let _ = events.send(AppEvent::Refreshed(result));
        }));
    }

    pub fn on_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Loaded(Ok(_)) => {
                self.apply_view(self.sync.view());
                if self.status == LOADING {
                    self.set_status("Ready");
                }
            }
            AppEvent::Loaded(Err(err)) if err.is_not_found() => {
                info!(account = %self.game_account, "game account does not exist yet");
                self.set_status(NOT_INITIALIZED);
            }
            AppEvent::Loaded(Err(SyncError::Cancelled)) => {}
            AppEvent::Loaded(Err(err)) => {
                self.push_error(format!("Loading game data failed: {err}"));
                self.request_refresh();
            }
            AppEvent::LiveUpdatesUnavailable(err) => {
                warn!(%err, "account subscription unavailable");
                self.push_error(format!("Live updates unavailable: {err}"));
            }
            AppEvent::Submitted(kind, Ok(SubmissionOutcome::Confirmed(signature))) => {
                self.set_status(format!("{kind} confirmed ({signature})"));
                self.request_refresh();
            }
            AppEvent::Submitted(kind, Ok(SubmissionOutcome::Relayed(ack))) => {
                self.set_status(format!("{kind} relayed: {ack}"));
                self.request_refresh();
            }
            AppEvent::Submitted(kind, Err(err @ SubmitError::Busy(_))) => {
                // the running submission still owns the status line
                self.push_error(format!("{kind} rejected: {err}"));
            }
            AppEvent::Submitted(kind, Err(err)) => {
                self.set_status("Ready");
                self.push_error(format!("{kind} failed: {err}"));
            }
            AppEvent::Refreshed(Ok(_)) => {
                self.apply_view(self.sync.view());
            }
            AppEvent::Refreshed(Err(SyncError::Cancelled)) => {}
            AppEvent::Refreshed(Err(err)) => {
                self.push_error(format!("Refresh failed: {err}"));
            }
        }
    }

    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            network: self.network.clone(),
            game_account: self.game_account.clone(),
            wallet: self.pipeline.wallet().map(|w| w.public_key().clone()),
            display: self.display.clone(),
            view: self.sync.view(),
            in_flight: self.pipeline.in_flight(),
            submission: self.pipeline.state(),
            status: self.status.clone(),
            errors: self.errors.clone(),
        }
    }

    pub async fn shutdown(mut self) {
        self.sync.shutdown();
        if let Some(follower) = self.follower.take() {
            let _ = follower.await;
        }
        if let Some(refresh) = self.refresh.take() {
            let _ = refresh.await;
        }
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
    }

    fn push_error(&mut self, message: String) {
        error!("{message}");
        self.errors.push(message);
        if self.errors.len() > MAX_ERRORS {
            let excess = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..excess);
        }
    }
}

pub fn init_tracing(action: Action) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if action == Action::Play {
        // the terminal belongs to the UI, so logs go to a file
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(rolling::daily(config::log_dir(), "tiny-adventure.log"))
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut controller = RemoteController::connect(&config, events_tx).await?;
    if config.action != Action::Play {
        return run_action(controller, config.action).await;
    }

    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();

    info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = async {
        ui::draw(&mut ui_state, &controller.snapshot())
            .wrap_err("initial draw failed")?;
        controller.start();
        run_loop(&mut controller, &mut ui_state, &mut input_events, events_rx).await
    }
    .await;
    ui::terminal_exit()?;
    controller.shutdown().await;
    res
}

async fn run_loop<L, W, R>(
    controller: &mut AppController<L, W, R>,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<()>
where
    L: Ledger,
    W: WalletAdapter,
    R: Relay,
{
    info!("Running app loop");
    let mut view = controller.synchronizer().watch();
    let mut submission = controller.pipeline().watch_state();
    ui::draw(ui_state, &controller.snapshot()).wrap_err("draw after start failed")?;

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    warn!("cached view channel closed");
                    break;
                }
                let latest = *view.borrow_and_update();
                controller.apply_view(latest);
            }
            changed = submission.changed() => {
                // redraw only, the loading flags come from the snapshot
                if changed.is_err() {
                    break;
                }
            }
            Some(event) = events.recv() => {
                controller.on_event(event);
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let Some(ev) = ui::interpret_event(raw_ev?) else {
                    continue;
                };
                match ev {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Initialize => controller.submit(InstructionKind::Initialize),
                    ui::UserEvent::MoveLeft => controller.submit(InstructionKind::MoveLeft),
                    ui::UserEvent::MoveRight => controller.submit(InstructionKind::MoveRight),
                    ui::UserEvent::Refresh => {
                        controller.status = String::from("Refreshing game data...");
                        controller.request_refresh();
                    }
                    ui::UserEvent::Redraw => {}
                }
            }
        }
        ui::draw(ui_state, &controller.snapshot()).wrap_err("draw failed")?;
    }
    Ok(())
}

/// One-shot action for scripting; prints the outcome to stdout.
pub async fn run_action<L, W, R>(controller: AppController<L, W, R>, action: Action) -> Result<()>
where
    L: Ledger,
    W: WalletAdapter,
    R: Relay,
{
    let kind = match action {
        Action::Play => return Err(eyre!("play is not a one-shot action")),
        Action::Status => None,
        Action::Initialize => Some(InstructionKind::Initialize),
        Action::MoveLeft => Some(InstructionKind::MoveLeft),
        Action::MoveRight => Some(InstructionKind::MoveRight),
    };

    if let Some(kind) = kind {
        let outcome = controller
            .pipeline()
            .submit(kind)
            .await
            .wrap_err_with(|| format!("{kind} failed"))?;
        match outcome {
            SubmissionOutcome::Confirmed(signature) => println!("{kind} confirmed: {signature}"),
            SubmissionOutcome::Relayed(ack) => println!("{kind} relayed: {ack}"),
        }
    }

    let sync = controller.synchronizer().clone();
    match sync.refresh(&controller.game_account, true).await {
        Ok(account) => {
            let mut display = PositionDisplay::default();
            display
                .update_player_position(i64::from(account.player_position))
                .wrap_err("Unexpected player position")?;
            println!("position {}: {}", account.player_position, display.track);
            if !display.message.is_empty() {
                println!("{}", display.message);
            }
        }
        Err(SyncError::Ledger(LedgerError::NotFound(address))) => {
            println!("game account {address} is not initialized");
        }
        Err(err) => return Err(err).wrap_err("Fetching game data failed"),
    }
    controller.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        program::DEFAULT_PROGRAM_ID,
        submission::ConfirmationPolicy,
        sync::RetryPolicy,
        test_helpers::{
            FakeLedger,
            FakeRelay,
            FakeWallet,
            confirmed_status,
            game_account,
            raw_account,
        },
    };
    use std::time::Duration;
    use tokio::time::timeout;

    type TestController = AppController<FakeLedger, FakeWallet, FakeRelay>;

    fn controller(
        ledger: Arc<FakeLedger>,
        wallet: Option<FakeWallet>,
    ) -> (TestController, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let accounts = AccountClient::new(ledger, DEFAULT_PROGRAM_ID.parse().unwrap());
        let mut pipeline = SubmissionPipeline::new(
            accounts.clone(),
            game_account(),
            ConfirmationPolicy::default(),
        )
        .with_relay(FakeRelay::new());
        if let Some(wallet) = wallet {
            pipeline = pipeline.with_wallet(wallet);
        }
        let sync = Synchronizer::new(accounts.clone(), RetryPolicy::default());
        (
            AppController::new("Local", game_account(), accounts, pipeline, sync, tx),
            rx,
        )
    }

    async fn wait_for_subscriber(ledger: &FakeLedger) {
        timeout(Duration::from_secs(1), async {
            while ledger.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn start__returns_before_the_initial_fetch_runs() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        ledger.push_fetch(Ok(raw_account(4, 2)));
        let (mut controller, mut events) = controller(ledger.clone(), None);

        // when
        controller.start();

        // then
        assert_eq!(controller.status, LOADING);
        assert_eq!(ledger.fetch_calls(), 0);
        let loaded = events.recv().await.unwrap();
        assert!(matches!(loaded, AppEvent::Loaded(Ok(_))));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn start__missing_account_prompts_initialize() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        ledger.push_fetch(Err(LedgerError::NotFound(game_account())));
        let (mut controller, mut events) = controller(ledger.clone(), None);

        // when
        controller.start();
        let loaded = events.recv().await.unwrap();
        controller.on_event(loaded);

        // then
        assert_eq!(controller.status, NOT_INITIALIZED);
        assert!(controller.errors().is_empty());
        assert_eq!(ledger.fetch_calls(), 1);
        wait_for_subscriber(&ledger).await;
        controller.shutdown().await;
        assert_eq!(ledger.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn start__existing_account_renders_position() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        ledger.push_fetch(Ok(raw_account(4, 2)));
        let (mut controller, mut events) = controller(ledger, None);

        // when
        controller.start();
        let loaded = events.recv().await.unwrap();
        controller.on_event(loaded);

        // then
        assert_eq!(controller.status, "Ready");
        assert_eq!(controller.display().track, "......o..");
        assert_eq!(controller.snapshot().view.slot, 4);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh__repeated_requests_share_one_retry_loop() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        let (mut controller, _events) = controller(ledger.clone(), None);

        // when
        for _ in 0..5 {
            controller.request_refresh();
        }
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        // then
        let calls = ledger.fetch_calls();
        assert!((10..=11).contains(&calls), "fetch calls: {calls}");
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn request_refresh__starts_again_after_previous_one_finished() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        ledger.push_fetch(Ok(raw_account(3, 1)));
        ledger.push_fetch(Ok(raw_account(4, 2)));
        let (mut controller, mut events) = controller(ledger.clone(), None);
        controller.request_refresh();
        let first = events.recv().await.unwrap();
        controller.on_event(first);
        timeout(Duration::from_secs(1), async {
            while !controller.refresh.as_ref().is_some_and(|h| h.is_finished()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // when
        controller.request_refresh();
        let second = events.recv().await.unwrap();
        controller.on_event(second);

        // then
        assert_eq!(ledger.fetch_calls(), 2);
        assert_eq!(controller.display().track, "......o..");
    }

    #[tokio::test]
    async fn on_event__confirmed_submission_refreshes_view() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        ledger.push_status(Some(confirmed_status(7)));
        ledger.push_fetch(Ok(raw_account(7, 1)));
        let (mut controller, mut events) = controller(ledger, Some(FakeWallet::new()));

        // when
        controller.submit(InstructionKind::MoveRight);
        let submitted = events.recv().await.unwrap();
        controller.on_event(submitted);
        let refreshed = events.recv().await.unwrap();
        controller.on_event(refreshed);

        // then
        assert!(controller.status.starts_with("moveRight confirmed"));
        assert_eq!(controller.display().track, "....o....");
        assert!(controller.snapshot().in_flight.is_none());
    }

    #[tokio::test]
    async fn on_event__failed_submission_surfaces_error() {
        // given
        let ledger = Arc::new(FakeLedger::new());
        let wallet = FakeWallet::new();
        wallet.respond_with(Err(crate::wallet::WalletError::Rejected(
            "user declined".into(),
        )));
        let (mut controller, mut events) = controller(ledger, Some(wallet));

        // when
        controller.submit(InstructionKind::Initialize);
        let submitted = events.recv().await.unwrap();
        controller.on_event(submitted);

        // then
        assert_eq!(controller.errors().len(), 1);
        assert!(controller.errors()[0].contains("user declined"));
        assert!(controller.snapshot().in_flight.is_none());
    }

    #[tokio::test]
    async fn on_event__busy_rejection_keeps_status_of_running_submission() {
        // given
        let (mut controller, _events) = controller(Arc::new(FakeLedger::new()), None);
        controller.status = String::from("Sending moveRight...");

        // when
        controller.on_event(AppEvent::Submitted(
            InstructionKind::MoveLeft,
            Err(SubmitError::Busy(InstructionKind::MoveRight)),
        ));

        // then
        assert_eq!(controller.status, "Sending moveRight...");
        assert_eq!(
            controller.errors(),
            ["moveLeft rejected: moveRight is already in flight"]
        );
    }

    #[tokio::test]
    async fn apply_view__invalid_position_keeps_display() {
        // given
        let (mut controller, _events) = controller(Arc::new(FakeLedger::new()), None);
        controller.apply_view(CachedView {
            account: Some(GameDataAccount { player_position: 1 }),
            slot: 1,
            version: 1,
        });

        // when
        controller.apply_view(CachedView {
            account: Some(GameDataAccount { player_position: 9 }),
            slot: 2,
            version: 2,
        });

        // then
        assert_eq!(controller.display().track, "....o....");
        assert_eq!(controller.errors(), ["invalid player position 9"]);
    }
}
