#![allow(non_snake_case)]
use std::sync::Arc;
use tiny_adventure::{
    account::AccountClient,
    program::{
        DEFAULT_PROGRAM_ID,
        InstructionKind,
    },
    submission::{
        ConfirmationPolicy,
        SubmissionOutcome,
        SubmissionPipeline,
        SubmissionState,
        SubmitError,
    },
    test_helpers::*,
};
use tokio::sync::Semaphore;

type Pipeline = SubmissionPipeline<FakeLedger, FakeWallet, FakeRelay>;

fn pipeline(ledger: &Arc<FakeLedger>) -> Pipeline {
    let accounts = AccountClient::new(ledger.clone(), DEFAULT_PROGRAM_ID.parse().unwrap());
    SubmissionPipeline::new(accounts, game_account(), ConfirmationPolicy::default())
}

#[tokio::test]
async fn submit__move_right_goes_from_idle_to_confirmed() {
    // given
    let ledger = Arc::new(FakeLedger::new());
    ledger.push_status(None);
    ledger.push_status(Some(confirmed_status(31)));
    let wallet = FakeWallet::new();
    let pipeline = pipeline(&ledger).with_wallet(wallet.clone());
    assert_eq!(pipeline.state(), SubmissionState::Idle);

    // when
    let outcome = pipeline.submit(InstructionKind::MoveRight).await.unwrap();

    // then
    assert_eq!(outcome, SubmissionOutcome::Confirmed(FakeWallet::signature()));
    assert_eq!(pipeline.state(), SubmissionState::Confirmed);
    assert_eq!(pipeline.in_flight(), None);
    assert!(!pipeline.is_loading(InstructionKind::MoveRight));
    assert_eq!(ledger.status_calls(), 2);
    let sent = wallet.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recent_blockhash, FakeLedger::BLOCKHASH);
    assert_eq!(sent[0].instructions[0].kind, InstructionKind::MoveRight);
}

#[tokio::test]
async fn submit__without_wallet_posts_once_to_relay() {
    // given
    let ledger = Arc::new(FakeLedger::new());
    let relay = FakeRelay::new();
    let pipeline = pipeline(&ledger).with_relay(relay.clone());

    // when
    let outcome = pipeline.submit(InstructionKind::Initialize).await.unwrap();

    // then
    assert!(matches!(outcome, SubmissionOutcome::Relayed(_)));
    assert_eq!(relay.bodies(), vec![r#"{"instruction":"initialize"}"#.to_string()]);
    assert_eq!(pipeline.state(), SubmissionState::Relayed);
    assert_eq!(ledger.status_calls(), 0);
}

#[tokio::test]
async fn submit__second_request_while_in_flight_is_rejected() {
    // given
    let ledger = Arc::new(FakeLedger::new());
    let gate = Arc::new(Semaphore::new(0));
    ledger.gate_statuses(gate.clone());
    let wallet = FakeWallet::new();
    let relay = FakeRelay::new();
    let pipeline = Arc::new(
        pipeline(&ledger)
            .with_wallet(wallet.clone())
            .with_relay(relay.clone()),
    );
    let mut state = pipeline.watch_state();
    let first = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.submit(InstructionKind::MoveRight).await })
    };
    state
        .wait_for(|s| *s == SubmissionState::Submitted)
        .await
        .unwrap();

    // when
    let second = pipeline.submit(InstructionKind::MoveLeft).await;

    // then
    assert_eq!(second, Err(SubmitError::Busy(InstructionKind::MoveRight)));
    assert!(pipeline.is_loading(InstructionKind::MoveRight));
    assert!(!pipeline.is_loading(InstructionKind::MoveLeft));

    ledger.push_status(Some(confirmed_status(8)));
    gate.add_permits(1);
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome, SubmissionOutcome::Confirmed(FakeWallet::signature()));
    assert_eq!(wallet.sent().len(), 1);
    assert!(relay.bodies().is_empty());
    assert_eq!(pipeline.in_flight(), None);
}

#[tokio::test]
async fn submit__same_action_twice_while_in_flight_sends_once() {
    // given
    let ledger = Arc::new(FakeLedger::new());
    let gate = Arc::new(Semaphore::new(0));
    ledger.gate_statuses(gate.clone());
    let wallet = FakeWallet::new();
    let pipeline = Arc::new(pipeline(&ledger).with_wallet(wallet.clone()));
    let mut state = pipeline.watch_state();
    let first = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.submit(InstructionKind::MoveRight).await })
    };
    state
        .wait_for(|s| *s == SubmissionState::Submitted)
        .await
        .unwrap();

    // when
    let second = pipeline.submit(InstructionKind::MoveRight).await;

    // then
    assert_eq!(second, Err(SubmitError::Busy(InstructionKind::MoveRight)));
    assert_eq!(wallet.sent().len(), 1);
    assert!(pipeline.is_loading(InstructionKind::MoveRight));

    ledger.push_status(Some(confirmed_status(12)));
    gate.add_permits(1);
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome, SubmissionOutcome::Confirmed(FakeWallet::signature()));
    assert_eq!(wallet.sent().len(), 1);
    assert_eq!(pipeline.in_flight(), None);
}
