//! End-to-end flows against the simulated card

mod common;

use std::sync::Arc;
use std::time::Duration;

use eid_flow::{
    CanExhaustion, CanFlowState, FlowConfig, FlowCoordinator, FlowHandle, FlowKind,
    FlowNotification, FlowState, NavigationRequest,
};
use eid_sim::{CardProfile, ServerOutcome, SimulatedCard};
use pretty_assertions::assert_eq;
use url::Url;

use common::{tc_token_url, wait_can_flow, wait_state, TIMEOUT};

fn spawn_change_pin(card: &Arc<SimulatedCard>, config: FlowConfig) -> FlowHandle {
    FlowCoordinator::spawn(card.clone(), FlowKind::ChangePin, config)
}

fn spawn_identify(card: &Arc<SimulatedCard>) -> FlowHandle {
    FlowCoordinator::spawn(
        card.clone(),
        FlowKind::Identify {
            tc_token_url: tc_token_url(),
        },
        FlowConfig::default(),
    )
}

async fn enter_pins(handle: &FlowHandle, old: &str, new: &str) {
    handle.enter_old_secret(old).await.unwrap();
    handle.confirm_new_pin_intro().await.unwrap();
    handle.enter_new_pin(new).await.unwrap();
    handle.confirm_new_pin(new).await.unwrap();
}

async fn navigation(
    notifications: &mut tokio::sync::broadcast::Receiver<FlowNotification>,
) -> NavigationRequest {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let FlowNotification::Navigation { request } = notifications.recv().await.unwrap() {
                return request;
            }
        }
    })
    .await
    .expect("no navigation request")
}

#[tokio::test]
async fn test_transport_pin_change_then_identification() {
    let card = Arc::new(SimulatedCard::new(
        CardProfile::default().with_transport_pin("12345"),
    ));
    let handle = spawn_change_pin(&card, FlowConfig::default());
    let mut notifications = handle.subscribe();

    handle.start(true, true).await.unwrap();
    enter_pins(&handle, "12345", "135790").await;

    let snapshot = wait_state(&handle, |state| matches!(state, FlowState::Finished { .. })).await;
    assert_eq!(snapshot.state, FlowState::Finished { redirect: None });
    assert_eq!(navigation(&mut notifications).await, NavigationRequest::StartIdentification);
    assert!(card.accepts_pin("135790"));
    assert!(!card.transport_pin_active());
}

#[tokio::test]
async fn test_wrong_pin_retry_and_can_recovery() {
    let card = Arc::new(SimulatedCard::default());
    let handle = spawn_change_pin(&card, FlowConfig::default());

    handle.start(false, false).await.unwrap();
    enter_pins(&handle, "111111", "246802").await;

    let snapshot = wait_state(&handle, |state| {
        *state
            == FlowState::OldSecretRetry {
                attempts_remaining: 2,
            }
    })
    .await;
    assert_eq!(snapshot.attempts_remaining, Some(2));

    handle.enter_old_secret("222222").await.unwrap();
    let snapshot = wait_state(&handle, |state| matches!(state, FlowState::CanRequested { .. })).await;
    assert_eq!(snapshot.can_flow, Some(CanFlowState::Intro));
    assert_eq!(card.pin_retry_counter(), 1);

    handle.confirm_can_intro().await.unwrap();
    let snapshot = handle.enter_can("654321").await.unwrap();
    assert_eq!(snapshot.can_flow, Some(CanFlowState::OldSecretInput));
    handle.reenter_old_secret("123456").await.unwrap();

    wait_state(&handle, |state| matches!(state, FlowState::Finished { .. })).await;
    assert!(card.accepts_pin("246802"));
    assert_eq!(card.pin_retry_counter(), 3);
}

#[tokio::test]
async fn test_wrong_can_is_asked_again() {
    let card = Arc::new(SimulatedCard::new(CardProfile::default().with_retry_counter(1)));
    let handle = spawn_identify(&card);

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("123456").await.unwrap();
    wait_can_flow(&handle, |snapshot| snapshot.can_flow == Some(CanFlowState::Intro)).await;

    handle.confirm_can_intro().await.unwrap();
    handle.enter_can("000000").await.unwrap();
    wait_can_flow(&handle, |snapshot| {
        snapshot.can_flow
            == Some(CanFlowState::CanIncorrect {
                attempts_remaining: 2,
            })
    })
    .await;

    handle.enter_can("654321").await.unwrap();
    wait_state(&handle, |state| matches!(state, FlowState::Finished { .. })).await;
}

#[tokio::test]
async fn test_can_exhaustion_policy() {
    for (policy, expected) in [
        (CanExhaustion::CanBlocked, FlowState::CanBlocked),
        (CanExhaustion::CardBlocked, FlowState::CardBlocked),
    ] {
        let card = Arc::new(SimulatedCard::new(CardProfile::default().with_retry_counter(1)));
        let mut config = FlowConfig::default();
        config.can.on_exhausted = policy;
        let handle = spawn_change_pin(&card, config);

        handle.start(false, false).await.unwrap();
        enter_pins(&handle, "123456", "246802").await;
        wait_can_flow(&handle, |snapshot| snapshot.can_flow == Some(CanFlowState::Intro)).await;
        handle.confirm_can_intro().await.unwrap();

        for attempts_remaining in [2, 1] {
            handle.enter_can("000000").await.unwrap();
            wait_can_flow(&handle, |snapshot| {
                snapshot.can_flow == Some(CanFlowState::CanIncorrect { attempts_remaining })
            })
            .await;
        }
        handle.enter_can("000000").await.unwrap();

        let snapshot = wait_state(&handle, |state| state.is_failure()).await;
        assert_eq!(snapshot.state, expected);
        assert_eq!(snapshot.can_flow, None);
    }
}

#[tokio::test]
async fn test_can_exhaustion_with_reinsertion() {
    let card = Arc::new(SimulatedCard::new(CardProfile {
        require_reinsertion: true,
        ..CardProfile::default().with_retry_counter(1)
    }));
    let mut config = FlowConfig::default();
    config.can.max_attempts = 2;
    let handle = FlowCoordinator::spawn(
        card.clone(),
        FlowKind::Identify {
            tc_token_url: tc_token_url(),
        },
        config,
    );

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("123456").await.unwrap();
    wait_can_flow(&handle, |snapshot| snapshot.can_flow == Some(CanFlowState::Intro)).await;
    handle.confirm_can_intro().await.unwrap();

    handle.enter_can("000000").await.unwrap();
    wait_can_flow(&handle, |snapshot| {
        snapshot.can_flow
            == Some(CanFlowState::CanIncorrect {
                attempts_remaining: 1,
            })
    })
    .await;
    handle.enter_can("000000").await.unwrap();

    let snapshot = wait_state(&handle, |state| state.is_failure()).await;
    assert_eq!(snapshot.state, FlowState::CanBlocked);
    assert_eq!(card.pin_retry_counter(), 1);
}

#[tokio::test]
async fn test_skip_can_restarts_input() {
    let card = Arc::new(SimulatedCard::new(CardProfile::default().with_retry_counter(1)));
    let handle = spawn_identify(&card);

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("123456").await.unwrap();
    wait_can_flow(&handle, |snapshot| snapshot.can_flow == Some(CanFlowState::Intro)).await;

    let snapshot = handle.skip_can().await.unwrap();
    assert_eq!(snapshot.state, FlowState::OldTransportOrPersonalPinInput);
    assert_eq!(snapshot.can_flow, None);
    assert_eq!(snapshot.pending_request, None);

    // Restarting hits the suspended card again and skips the intro
    handle.enter_old_secret("123456").await.unwrap();
    let snapshot = wait_state(&handle, |state| matches!(state, FlowState::CanRequested { .. })).await;
    assert_eq!(snapshot.state, FlowState::CanRequested { short_flow: true });
    assert_eq!(snapshot.can_flow, Some(CanFlowState::CanInput));
}

#[tokio::test]
async fn test_cancel_can_flow_cancels_task() {
    let card = Arc::new(SimulatedCard::new(CardProfile::default().with_retry_counter(1)));
    let handle = spawn_identify(&card);

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("123456").await.unwrap();
    wait_can_flow(&handle, |snapshot| snapshot.can_flow.is_some()).await;

    let snapshot = handle.cancel_can().await.unwrap();
    assert_eq!(snapshot.state, FlowState::Cancelled);
    assert!(!card.is_task_running());
}

#[tokio::test]
async fn test_blocked_card() {
    let card = Arc::new(SimulatedCard::new(CardProfile::default().with_retry_counter(0)));
    let handle = spawn_identify(&card);

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("123456").await.unwrap();
    let snapshot = wait_state(&handle, |state| state.is_failure()).await;
    assert_eq!(snapshot.state, FlowState::CardBlocked);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!card.is_task_running());
}

#[tokio::test]
async fn test_deactivated_card() {
    let card = Arc::new(SimulatedCard::new(CardProfile {
        deactivated: true,
        ..CardProfile::default()
    }));
    let handle = spawn_identify(&card);

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("123456").await.unwrap();
    let snapshot = wait_state(&handle, |state| state.is_failure()).await;
    assert_eq!(snapshot.state, FlowState::CardDeactivated);
}

#[tokio::test]
async fn test_identification_outcomes() {
    let redirect = Url::parse("https://service.example/done").unwrap();
    let failure = Url::parse("https://service.example/failed").unwrap();
    let cases = [
        (
            ServerOutcome::Redirect {
                url: redirect.clone(),
            },
            FlowState::Finished {
                redirect: Some(redirect.clone()),
            },
            NavigationRequest::OpenRedirect {
                url: redirect.clone(),
            },
        ),
        (
            ServerOutcome::NoResult,
            FlowState::Finished { redirect: None },
            NavigationRequest::Dismiss,
        ),
        (
            ServerOutcome::ProcessFailed {
                redirect: Some(failure.clone()),
            },
            FlowState::ProcessFailed {
                redirect: Some(failure.clone()),
            },
            NavigationRequest::OpenRedirect {
                url: failure.clone(),
            },
        ),
    ];

    for (outcome, expected, expected_navigation) in cases {
        let card = Arc::new(SimulatedCard::new(CardProfile::default().with_server(outcome)));
        let handle = spawn_identify(&card);
        let mut notifications = handle.subscribe();

        handle.start(false, false).await.unwrap();
        handle.enter_old_secret("123456").await.unwrap();
        let snapshot = wait_state(&handle, |state| state.is_terminal() || state.is_failure()).await;
        assert_eq!(snapshot.state, expected);

        if snapshot.state.is_failure() {
            handle.finish().await.unwrap();
        }
        assert_eq!(navigation(&mut notifications).await, expected_navigation);
    }
}

#[tokio::test]
async fn test_reinsertion_between_attempts() {
    let card = Arc::new(SimulatedCard::new(CardProfile {
        require_reinsertion: true,
        ..CardProfile::default()
    }));
    let handle = spawn_identify(&card);

    handle.start(false, false).await.unwrap();
    handle.enter_old_secret("999999").await.unwrap();
    wait_state(&handle, |state| matches!(state, FlowState::OldSecretRetry { .. })).await;

    handle.enter_old_secret("123456").await.unwrap();
    wait_state(&handle, |state| matches!(state, FlowState::Finished { .. })).await;
}

#[tokio::test]
async fn test_back_from_scan_cancels_card_task() {
    // Slow card so the flow is still on the scan screen
    let card = Arc::new(SimulatedCard::new(CardProfile {
        latency_ms: 200,
        ..CardProfile::default()
    }));
    let handle = spawn_change_pin(&card, FlowConfig::default());

    handle.start(false, false).await.unwrap();
    enter_pins(&handle, "123456", "246802").await;
    assert!(handle.snapshot().await.unwrap().state.is_scan_screen());

    let snapshot = handle.back().await.unwrap();
    assert_eq!(snapshot.state, FlowState::NewPinInput);
    assert!(!snapshot.task_running);
    assert!(!card.is_task_running());
    assert!(card.accepts_pin("123456"));

    // Entering the new PIN again starts a fresh task
    handle.enter_new_pin("246802").await.unwrap();
    handle.confirm_new_pin("246802").await.unwrap();
    wait_state(&handle, |state| matches!(state, FlowState::Finished { .. })).await;
    assert!(card.accepts_pin("246802"));
}
