mod common;

use std::sync::Arc;

use common::{shared_db, FakeNotesApi, PASSWORD, TOKEN};
use whiteboardcore::database::PASSWORD_HASH_KEY;
use whiteboardcore::passkey::{make_password_hash, Verification};
use whiteboardcore::{BoardError, GateState, PasswordGate, SetupOutcome};

#[tokio::test]
async fn test_stored_hash_verifies_without_network() {
    let db = shared_db();
    db.lock()
        .unwrap()
        .set_config(PASSWORD_HASH_KEY, &make_password_hash(PASSWORD))
        .unwrap();
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    let mut gate = PasswordGate::new(db, api.clone());

    let wrong = gate.verify_password(Some(TOKEN), "wrong").await.unwrap();
    assert_eq!(wrong, Verification::Invalid);
    assert_eq!(gate.state(), GateState::NeedsUnlock);

    let right = gate.verify_password(Some(TOKEN), PASSWORD).await.unwrap();
    assert_eq!(right, Verification::ValidLocal);
    assert_eq!(gate.state(), GateState::Unlocked);

    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn test_remote_verification_stores_hash() {
    let db = shared_db();
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    let mut gate = PasswordGate::new(db.clone(), api.clone());

    let verification = gate.verify_password(Some(TOKEN), PASSWORD).await.unwrap();

    assert_eq!(verification, Verification::ValidRemote);
    assert!(gate.is_unlocked());
    assert_eq!(api.calls_to("verify_passkey"), 1);
    assert!(gate.has_local_hash().unwrap());

    // Next check stays local
    gate.lock();
    gate.verify_password(Some(TOKEN), PASSWORD).await.unwrap();
    assert_eq!(api.calls_to("verify_passkey"), 1);
}

#[tokio::test]
async fn test_remote_rejection_is_invalid() {
    let db = shared_db();
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    let mut gate = PasswordGate::new(db.clone(), api);

    let verification = gate.verify_password(Some(TOKEN), "nope123").await.unwrap();

    assert_eq!(verification, Verification::Invalid);
    assert!(!gate.is_unlocked());
    assert!(db.lock().unwrap().get_config(PASSWORD_HASH_KEY).unwrap().is_none());
}

#[tokio::test]
async fn test_network_failure_never_unlocks() {
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    api.set_network_down(true);
    let mut gate = PasswordGate::new(shared_db(), api);

    let err = gate.verify_password(Some(TOKEN), PASSWORD).await.unwrap_err();

    assert!(matches!(err, BoardError::Network(_)));
    assert!(!gate.is_unlocked());
}

#[tokio::test]
async fn test_remote_check_needs_token() {
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    let mut gate = PasswordGate::new(shared_db(), api.clone());

    let err = gate.verify_password(None, PASSWORD).await.unwrap_err();

    assert!(err.is_auth_required());
    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn test_setup_creates_passkey_and_stores_hash() {
    let api = Arc::new(FakeNotesApi::new());
    let mut gate = PasswordGate::new(shared_db(), api.clone());

    assert_eq!(gate.refresh_state(Some(TOKEN)).await.unwrap(), GateState::NeedsSetup);

    let outcome = gate.setup_passkey(TOKEN, PASSWORD).await.unwrap();

    assert_eq!(outcome, SetupOutcome::Created);
    assert!(gate.is_unlocked());
    assert!(gate.has_local_hash().unwrap());
}

#[tokio::test]
async fn test_setup_already_set_falls_back_to_unlock() {
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    let mut gate = PasswordGate::new(shared_db(), api);

    let outcome = gate.setup_passkey(TOKEN, "another1").await.unwrap();

    assert_eq!(outcome, SetupOutcome::AlreadySet);
    assert_eq!(gate.state(), GateState::NeedsUnlock);
    assert!(!gate.has_local_hash().unwrap());
}

#[tokio::test]
async fn test_refresh_state_prefers_local_hash() {
    let db = shared_db();
    db.lock()
        .unwrap()
        .set_config(PASSWORD_HASH_KEY, &make_password_hash(PASSWORD))
        .unwrap();
    let api = Arc::new(FakeNotesApi::new());
    let mut gate = PasswordGate::new(db, api.clone());

    assert_eq!(gate.state(), GateState::Unknown);
    assert_eq!(gate.refresh_state(None).await.unwrap(), GateState::NeedsUnlock);
    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn test_forget_local_hash_relocks() {
    let api = Arc::new(FakeNotesApi::with_passkey(PASSWORD));
    let mut gate = PasswordGate::new(shared_db(), api);
    gate.verify_password(Some(TOKEN), PASSWORD).await.unwrap();

    gate.forget_local_hash().unwrap();

    assert_eq!(gate.state(), GateState::NeedsUnlock);
    assert!(!gate.has_local_hash().unwrap());
}
