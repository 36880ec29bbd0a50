mod common;

use common::{classical_device, core, hybrid_device};
use dk_core::{ConversationId, DeviceCapabilities, KeyError, KeyStatus, TrustState, UserId};
use dk_crypto::identity::IdentityKeyPair;

#[tokio::test]
async fn three_devices_then_a_fourth_joins() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let phone = hybrid_device(svc, "alice", "phone").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let carol = classical_device(svc, "carol", "tablet").await;
    let conv = ConversationId::from("team-chat");

    let key = svc.create_conversation_key(&conv, &[laptop, phone, bob]).await.unwrap();
    assert_eq!(key.version, 1);
    assert_eq!(key.status, KeyStatus::Active);

    let fanout = svc.distribute_conversation_key(&conv, laptop).await.unwrap();
    assert_eq!(fanout.version, 1);
    assert_eq!(fanout.shares.len(), 2);
    assert!(fanout.skipped.is_empty());
    // Bob opens his share only after the rotation below.
    for share in fanout.shares.iter().filter(|s| s.target_device != bob) {
        let unwrapped = svc.unwrap_share(share.target_device, share).await.unwrap();
        assert_eq!(unwrapped.key_bytes(), key.key_bytes());
        assert_eq!(unwrapped.version, 1);
    }

    let old_message = svc
        .encrypt_with_conversation_key(&conv, 1, b"before carol", b"msg-1")
        .await
        .unwrap();

    let share = svc.share_with_new_device(&conv, carol, laptop).await.unwrap();
    assert_eq!(share.version, 1);
    assert_eq!(svc.unwrap_share(carol, &share).await.unwrap().key_bytes(), key.key_bytes());
    let mut participants = svc.conversation_participants(&conv).await.unwrap();
    participants.sort();
    let mut expected = vec![laptop, phone, bob, carol];
    expected.sort();
    assert_eq!(participants, expected);

    let rotated = svc.rotate_conversation_key(&conv, laptop).await.unwrap();
    assert_eq!(rotated.version, 2);
    assert_eq!(rotated.shares.len(), 3);
    assert_eq!(svc.current_conversation_version(&conv).await.unwrap(), 2);

    let v2 = svc.unwrap_share(carol, rotated.shares.iter().find(|s| s.target_device == carol).unwrap())
        .await
        .unwrap();
    assert_ne!(v2.key_bytes(), key.key_bytes());

    // Rotation keeps the earlier version's shares, and they still open.
    let phone_versions: Vec<u32> = svc.shares_for_device(phone).await.unwrap().iter().map(|s| s.version).collect();
    assert!(phone_versions.contains(&1) && phone_versions.contains(&2));
    let bob_shares = svc.shares_for_device(bob).await.unwrap();
    let bob_v1 = bob_shares.iter().find(|s| s.version == 1).unwrap();
    assert_eq!(svc.unwrap_share(bob, bob_v1).await.unwrap().key_bytes(), key.key_bytes());
    let bob_v2 = bob_shares.iter().find(|s| s.version == 2).unwrap();
    assert_eq!(svc.unwrap_share(bob, bob_v2).await.unwrap().key_bytes(), v2.key_bytes());

    // Old version: read-only, still decrypts history.
    let err = svc
        .encrypt_with_conversation_key(&conv, 1, b"late", b"")
        .await
        .unwrap_err();
    assert!(matches!(err, KeyError::StaleConversationKey { version: 1, current: 2, .. }));
    assert_eq!(
        svc.decrypt_with_conversation_key(&old_message, b"msg-1").await.unwrap(),
        b"before carol"
    );

    let new_message = svc.encrypt_with_conversation_key(&conv, 2, b"after", b"").await.unwrap();
    assert_eq!(svc.decrypt_with_conversation_key(&new_message, b"").await.unwrap(), b"after");
}

#[tokio::test]
async fn conversation_ciphertext_is_bound_to_its_associated_data() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let conv = ConversationId::from("notes");
    svc.create_conversation_key(&conv, &[laptop]).await.unwrap();

    let mut ct = svc.encrypt_with_conversation_key(&conv, 1, b"secret", b"ad").await.unwrap();
    assert!(matches!(
        svc.decrypt_with_conversation_key(&ct, b"other").await,
        Err(KeyError::AuthenticationFailed)
    ));
    ct.conversation_id = ConversationId::from("missing");
    assert!(matches!(
        svc.decrypt_with_conversation_key(&ct, b"ad").await,
        Err(KeyError::ConversationNotFound(_))
    ));
}

#[tokio::test]
async fn conversation_keys_are_created_once() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let conv = ConversationId::from("dup");
    svc.create_conversation_key(&conv, &[laptop]).await.unwrap();
    assert!(matches!(
        svc.create_conversation_key(&conv, &[laptop]).await,
        Err(KeyError::ConversationExists(_))
    ));
    assert!(matches!(
        svc.current_conversation_version(&ConversationId::from("nope")).await,
        Err(KeyError::ConversationNotFound(_))
    ));
}

#[tokio::test]
async fn untrusted_and_unreachable_participants_are_skipped() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let stranger = svc
        .register_device(
            &UserId::from("mallory"),
            &IdentityKeyPair::generate().public,
            &DeviceCapabilities::classical(),
            "unknown",
        )
        .await
        .unwrap();
    let conv = ConversationId::from("mixed");
    svc.create_conversation_key(&conv, &[laptop, bob, stranger]).await.unwrap();

    let fanout = svc.distribute_conversation_key(&conv, laptop).await.unwrap();
    assert_eq!(fanout.shares.len(), 1);
    assert_eq!(fanout.shares[0].target_device, bob);
    assert_eq!(fanout.skipped, vec![stranger]);

    let rotated = svc.rotate_conversation_key(&conv, laptop).await.unwrap();
    assert_eq!(rotated.version, 2);
    assert_eq!(rotated.skipped, vec![stranger]);
}

#[tokio::test]
async fn wrapping_for_cut_off_devices_or_self_is_refused() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let conv = ConversationId::from("c");
    let key = svc.create_conversation_key(&conv, &[laptop, bob]).await.unwrap();

    assert!(matches!(
        svc.wrap_for_device(&key, laptop, laptop).await,
        Err(KeyError::RecipientUnavailable(_))
    ));

    let share = svc.wrap_for_device(&key, laptop, bob).await.unwrap();
    assert_eq!(svc.unwrap_share(bob, &share).await.unwrap().version, 1);

    svc.set_trust_state(bob, TrustState::Compromised, "lost").await.unwrap();
    assert!(matches!(
        svc.wrap_for_device(&key, laptop, bob).await,
        Err(KeyError::RecipientUnavailable(d)) if d == bob
    ));
}

#[tokio::test]
async fn a_share_cannot_be_opened_by_another_device() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let carol = classical_device(svc, "carol", "tablet").await;
    let conv = ConversationId::from("private");
    let key = svc.create_conversation_key(&conv, &[laptop, bob]).await.unwrap();

    let share = svc.wrap_for_device(&key, laptop, bob).await.unwrap();
    assert!(matches!(
        svc.unwrap_share(carol, &share).await,
        Err(KeyError::AuthenticationFailed)
    ));

    // Re-labelling the version breaks the share's binding.
    let mut relabelled = share.clone();
    relabelled.version = 7;
    assert!(matches!(
        svc.unwrap_share(bob, &relabelled).await,
        Err(KeyError::AuthenticationFailed)
    ));
}

#[tokio::test]
async fn shares_outside_the_retention_window_are_pruned() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let phone = classical_device(svc, "alice", "phone").await;
    let conv = ConversationId::from("long-lived");
    svc.create_conversation_key(&conv, &[laptop, phone]).await.unwrap();
    svc.distribute_conversation_key(&conv, laptop).await.unwrap();

    for expected in 2..=4 {
        assert_eq!(svc.rotate_conversation_key(&conv, laptop).await.unwrap().version, expected);
    }

    let versions: Vec<u32> = svc
        .shares_for_device(phone)
        .await
        .unwrap()
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(versions, vec![2, 3, 4]);
}

#[tokio::test]
async fn rotations_from_both_ends_before_either_share_is_opened() {
    let core = core().await;
    let svc = &core.service;
    let laptop = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    let conv = ConversationId::from("crossed");
    let v1 = svc.create_conversation_key(&conv, &[laptop, bob]).await.unwrap();

    // Each side opens a session towards the other before either handshake
    // has been received.
    let first = svc.distribute_conversation_key(&conv, laptop).await.unwrap();
    let second = svc.rotate_conversation_key(&conv, bob).await.unwrap();
    assert_eq!(second.version, 2);

    let v2 = svc.unwrap_share(laptop, &second.shares[0]).await.unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(svc.unwrap_share(bob, &first.shares[0]).await.unwrap().key_bytes(), v1.key_bytes());

    let third = svc.rotate_conversation_key(&conv, laptop).await.unwrap();
    let v3 = svc.unwrap_share(bob, &third.shares[0]).await.unwrap();
    assert_eq!(v3.version, 3);

    let fourth = svc.rotate_conversation_key(&conv, bob).await.unwrap();
    let v4 = svc.unwrap_share(laptop, &fourth.shares[0]).await.unwrap();
    assert_eq!(v4.version, 4);

    let message = svc.encrypt_with_conversation_key(&conv, 4, b"settled", b"").await.unwrap();
    assert_eq!(svc.decrypt_with_conversation_key(&message, b"").await.unwrap(), b"settled");
}
