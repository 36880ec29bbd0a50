mod common;

use common::{classical_device, connect, core};
use dk_core::{ConversationId, KeyError, KeyEvent, RotationKind, SessionState, TrustState};

#[tokio::test]
async fn revocation_cuts_the_device_out_and_rekeys_its_conversations() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let phone = classical_device(svc, "alice", "phone").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let conv = ConversationId::from("family");
    svc.create_conversation_key(&conv, &[laptop, phone, bob]).await.unwrap();
    let fanout = svc.distribute_conversation_key(&conv, laptop).await.unwrap();
    for share in &fanout.shares {
        svc.unwrap_share(share.target_device, share).await.unwrap();
    }
    // A message from the revoked device is still in flight.
    let in_flight = svc.seal(bob, laptop, b"late reply", b"").await.unwrap();
    let mut events = svc.subscribe();

    let outcome = svc.revoke_device(bob, "device lost").await.unwrap();
    assert!(!outcome.already_revoked);
    assert_eq!(outcome.sessions_invalidated, 2);
    assert_eq!(outcome.shares_deleted, 1);
    assert_eq!(outcome.conversations_rotated, vec![(conv.clone(), 2)]);

    assert_eq!(events.recv().await.unwrap(), KeyEvent::DeviceRevoked { device_id: bob });
    assert_eq!(
        events.recv().await.unwrap(),
        KeyEvent::SessionsInvalidated { device_id: bob, count: 2 }
    );

    assert_eq!(svc.get_verified_identity(bob).await.unwrap().trust_state, TrustState::Revoked);
    assert_eq!(svc.session_state(laptop, bob).await.unwrap(), SessionState::Invalidated);
    assert!(matches!(
        svc.open(laptop, &in_flight, b"").await,
        Err(KeyError::SessionInvalidated { .. })
    ));
    assert!(matches!(
        svc.seal(laptop, bob, b"x", b"").await,
        Err(KeyError::SessionInvalidated { .. })
    ));

    let mut members = svc.conversation_participants(&conv).await.unwrap();
    members.sort();
    let mut expected = vec![laptop, phone];
    expected.sort();
    assert_eq!(members, expected);
    assert_eq!(svc.current_conversation_version(&conv).await.unwrap(), 2);
    assert!(svc.shares_for_device(bob).await.unwrap().is_empty());

    // The first local member re-keys; the other one receives the new version.
    let receiver = laptop.max(phone);
    let received: Vec<u32> = svc
        .shares_for_device(receiver)
        .await
        .unwrap()
        .iter()
        .map(|s| s.version)
        .collect();
    assert!(received.contains(&2));
    assert!(matches!(
        svc.share_with_new_device(&conv, bob, laptop).await,
        Err(KeyError::RecipientUnavailable(_))
    ));
}

#[tokio::test]
async fn replay_then_revocation_leaves_nothing_to_send_to() {
    let core = core().await;
    let svc = &core.service;
    let a = classical_device(svc, "alice", "laptop").await;
    let b = classical_device(svc, "bob", "phone").await;
    let conv = ConversationId::from("pair");
    let key = svc.create_conversation_key(&conv, &[a, b]).await.unwrap();
    svc.begin_session(a, b).await.unwrap().complete().await.unwrap();

    let texts: [&[u8]; 3] = [b"one", b"two", b"three"];
    let mut sealed = Vec::new();
    for text in texts {
        sealed.push(svc.seal(a, b, text, b"").await.unwrap());
    }
    for (message, text) in sealed.iter().zip(texts) {
        assert_eq!(svc.open(b, message, b"").await.unwrap(), text);
    }
    assert!(matches!(
        svc.open(b, &sealed[1], b"").await,
        Err(KeyError::CounterRegression { .. })
    ));

    svc.revoke_device(b, "compromised").await.unwrap();
    assert_eq!(svc.session_state(a, b).await.unwrap(), SessionState::Invalidated);
    assert!(matches!(
        svc.wrap_for_device(&key, a, b).await,
        Err(KeyError::RecipientUnavailable(d)) if d == b
    ));
}

#[tokio::test]
async fn revoking_twice_writes_one_record() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let first = svc.revoke_device(bob, "stolen").await.unwrap();
    assert!(!first.already_revoked);
    let second = svc.revoke_device(bob, "stolen").await.unwrap();
    assert!(second.already_revoked);
    assert_eq!(second.sessions_invalidated, 0);

    let records = svc.revocation_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].device_id, bob.as_text());
    assert_eq!(records[0].reason, "stolen");
    assert_eq!(records[0].sessions_invalidated, 2);
}

#[tokio::test]
async fn revocation_without_a_local_rekeyer_only_removes_membership() {
    let core = core().await;
    let svc = &core.service;
    let bob = classical_device(svc, "bob", "phone").await;
    let conv = ConversationId::from("solo");
    svc.create_conversation_key(&conv, &[bob]).await.unwrap();

    let outcome = svc.revoke_device(bob, "retired").await.unwrap();
    assert!(outcome.conversations_rotated.is_empty());
    assert!(svc.conversation_participants(&conv).await.unwrap().is_empty());
    assert_eq!(svc.current_conversation_version(&conv).await.unwrap(), 1);
}

#[tokio::test]
async fn identity_rotation_bumps_the_generation_and_invalidates_sessions() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;
    let before = svc.get_verified_identity(bob).await.unwrap();
    let mut events = svc.subscribe();

    let generation = svc.rotate_identity_key(bob, "suspected exposure").await.unwrap();
    assert_eq!(generation, 2);
    assert_eq!(
        events.recv().await.unwrap(),
        KeyEvent::SessionsInvalidated { device_id: bob, count: 2 }
    );

    let after = svc.get_verified_identity(bob).await.unwrap();
    assert_eq!(after.generation, 2);
    assert_ne!(after.fingerprint, before.fingerprint);
    assert_eq!(svc.session_state(alice, bob).await.unwrap(), SessionState::Invalidated);

    // A fresh handshake runs against the new identity.
    connect(svc, alice, bob).await;
    assert_eq!(svc.session_state(bob, alice).await.unwrap(), SessionState::Active);

    let record = svc
        .rotation_records(Some(bob))
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.kind == RotationKind::IdentityKey)
        .unwrap();
    assert_eq!(record.old_ref.as_deref(), Some("g1"));
    assert_eq!(record.new_ref.as_deref(), Some("g2"));
}

#[tokio::test]
async fn revoked_devices_cannot_rotate_their_identity() {
    let core = core().await;
    let svc = &core.service;
    let bob = classical_device(svc, "bob", "phone").await;
    svc.revoke_device(bob, "gone").await.unwrap();
    assert!(matches!(
        svc.rotate_identity_key(bob, "late").await,
        Err(KeyError::RecipientUnavailable(_))
    ));
}

#[tokio::test]
async fn audit_chain_verifies_and_rejects_edits() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let conv = ConversationId::from("audited");
    svc.create_conversation_key(&conv, &[laptop, bob]).await.unwrap();
    svc.rotate_conversation_key(&conv, laptop).await.unwrap();
    svc.revoke_device(bob, "audit test").await.unwrap();

    let report = svc.verify_audit_chain().await.unwrap();
    assert!(report.rotation_records >= 2);
    assert_eq!(report.revocation_records, 1);

    let records = svc.rotation_records(None).await.unwrap();
    for pair in records.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
    assert!(records
        .iter()
        .any(|r| r.kind == RotationKind::ConversationKey && r.reason == "member revoked"));

    let pool = &svc.store().pool;
    assert!(sqlx::query("UPDATE key_rotation_records SET reason = 'edited'")
        .execute(pool)
        .await
        .is_err());
    assert!(sqlx::query("DELETE FROM revocation_records").execute(pool).await.is_err());
    assert_eq!(svc.verify_audit_chain().await.unwrap(), report);
}
