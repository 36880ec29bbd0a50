mod common;

use std::collections::HashSet;

use common::{classical_device, connect, core, core_with, hybrid_device};
use dk_core::session::MAX_SUPERSEDED_SESSIONS;
use dk_core::{DeviceId, FirstMessageSecrecy, HybridSuite, KeyError, KeyService, SessionState};
use dk_crypto::x3dh::{b64d, b64e};

#[tokio::test]
async fn seal_and_open_in_both_directions() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;

    let pending = svc.begin_session(alice, bob).await.unwrap();
    assert_eq!(pending.state(), SessionState::Pending);
    assert_eq!(pending.first_message_secrecy(), FirstMessageSecrecy::OneTimePrekey);
    let info = pending.complete().await.unwrap();
    assert_eq!(info.state, SessionState::Established);
    assert!(info.awaiting_reply);

    let first = svc.seal(alice, bob, b"hi bob", b"thread-1").await.unwrap();
    assert!(first.is_handshake());
    assert_eq!(svc.open(bob, &first, b"thread-1").await.unwrap(), b"hi bob");
    assert_eq!(svc.session_state(bob, alice).await.unwrap(), SessionState::Active);

    let reply = svc.seal(bob, alice, b"hi alice", b"thread-1").await.unwrap();
    assert!(!reply.is_handshake());
    assert_eq!(svc.open(alice, &reply, b"thread-1").await.unwrap(), b"hi alice");

    // Alice has heard back, so the handshake header is no longer attached.
    let next = svc.seal(alice, bob, b"again", b"").await.unwrap();
    assert!(!next.is_handshake());
    assert_eq!(svc.open(bob, &next, b"").await.unwrap(), b"again");

    let details = svc.session_details(alice, bob).await.unwrap().unwrap();
    assert_eq!(details.state, SessionState::Active);
    assert!(!details.awaiting_reply);
    // Counters are per chain; Alice's reply-triggered ratchet step reset them.
    assert_eq!(details.send_counter, 1);
    assert_eq!(details.recv_counter, 1);
}

#[tokio::test]
async fn tampered_ciphertext_fails_authentication_and_keeps_state() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let sealed = svc.seal(alice, bob, b"transfer 10", b"").await.unwrap();
    let mut tampered = sealed.clone();
    let mut bytes = b64d(&tampered.ciphertext).unwrap();
    bytes[0] ^= 0x01;
    tampered.ciphertext = b64e(&bytes);

    let err = svc.open(bob, &tampered, b"").await.unwrap_err();
    assert!(matches!(err, KeyError::AuthenticationFailed));
    assert_eq!(err.to_string(), "Message authentication failed");

    // The failed attempt did not advance the chain.
    assert_eq!(svc.open(bob, &sealed, b"").await.unwrap(), b"transfer 10");
}

#[tokio::test]
async fn associated_data_mismatch_fails() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let sealed = svc.seal(alice, bob, b"payload", b"conversation-a").await.unwrap();
    assert!(matches!(
        svc.open(bob, &sealed, b"conversation-b").await,
        Err(KeyError::AuthenticationFailed)
    ));
}

#[tokio::test]
async fn replayed_message_is_rejected() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let sealed = svc.seal(alice, bob, b"once", b"").await.unwrap();
    svc.open(bob, &sealed, b"").await.unwrap();
    let err = svc.open(bob, &sealed, b"").await.unwrap_err();
    assert!(matches!(err, KeyError::CounterRegression { counter: 1 }));
}

#[tokio::test]
async fn replayed_handshake_is_rejected() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();

    let first = svc.seal(alice, bob, b"first", b"").await.unwrap();
    svc.open(bob, &first, b"").await.unwrap();
    assert!(matches!(
        svc.open(bob, &first, b"").await,
        Err(KeyError::CounterRegression { .. })
    ));
}

#[tokio::test]
async fn out_of_order_messages_within_the_skip_limit_open() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();

    let m0 = svc.seal(alice, bob, b"zero", b"").await.unwrap();
    let m1 = svc.seal(alice, bob, b"one", b"").await.unwrap();
    let m2 = svc.seal(alice, bob, b"two", b"").await.unwrap();

    assert_eq!(svc.open(bob, &m2, b"").await.unwrap(), b"two");
    assert_eq!(svc.open(bob, &m0, b"").await.unwrap(), b"zero");
    assert_eq!(svc.open(bob, &m1, b"").await.unwrap(), b"one");
    assert!(matches!(svc.open(bob, &m0, b"").await, Err(KeyError::CounterRegression { .. })));
}

#[tokio::test]
async fn gap_beyond_max_skip_desynchronises_the_chain() {
    let core = core_with(|c| c.max_skip = 5).await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let mut last = None;
    for i in 0..8u8 {
        last = Some(svc.seal(alice, bob, &[i], b"").await.unwrap());
    }
    let err = svc.open(bob, &last.unwrap(), b"").await.unwrap_err();
    assert!(matches!(err, KeyError::ChainDesynchronized { skip: 7, limit: 5 }));

    // The rejected message leaves the session usable.
    assert_eq!(svc.session_state(bob, alice).await.unwrap(), SessionState::Active);
}

#[tokio::test]
async fn hybrid_suite_only_when_both_sides_support_it() {
    let core = core().await;
    let svc = &core.service;
    let h1 = hybrid_device(svc, "alice", "laptop").await;
    let h2 = hybrid_device(svc, "bob", "phone").await;
    let classic = classical_device(svc, "carol", "tablet").await;

    connect(svc, h1, h2).await;
    let hybrid = svc.session_details(h1, h2).await.unwrap().unwrap();
    assert_eq!(hybrid.suite, HybridSuite::HybridMlKem768);
    assert!(hybrid.has_kem_material);
    let peer = svc.session_details(h2, h1).await.unwrap().unwrap();
    assert_eq!(peer.suite, HybridSuite::HybridMlKem768);

    connect(svc, h1, classic).await;
    let mixed = svc.session_details(h1, classic).await.unwrap().unwrap();
    assert_eq!(mixed.suite, HybridSuite::Classical);
    assert!(!mixed.has_kem_material);
}

#[tokio::test]
async fn algorithm_tag_cannot_be_downgraded() {
    let core = core().await;
    let svc = &core.service;
    let alice = hybrid_device(svc, "alice", "laptop").await;
    let bob = hybrid_device(svc, "bob", "phone").await;
    svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();

    let mut sealed = svc.seal(alice, bob, b"pq", b"").await.unwrap();
    sealed.algorithm = HybridSuite::Classical.tag().to_string();
    assert!(matches!(svc.open(bob, &sealed, b"").await, Err(KeyError::AuthenticationFailed)));
}

#[tokio::test]
async fn forged_sender_fingerprint_is_a_security_event() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let mut sealed = svc.seal(alice, bob, b"x", b"").await.unwrap();
    sealed.sender_fingerprint = "00".repeat(32);
    let err = svc.open(bob, &sealed, b"").await.unwrap_err();
    assert!(err.is_security_event());
    assert!(matches!(err, KeyError::IdentityMismatch { device } if device == alice));
}

#[tokio::test]
async fn seal_without_session_is_not_found() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;

    assert_eq!(svc.session_state(alice, bob).await.unwrap(), SessionState::Uninitiated);
    assert!(matches!(
        svc.seal(alice, bob, b"x", b"").await,
        Err(KeyError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn new_handshake_supersedes_the_old_session() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;
    let old = svc.session_details(alice, bob).await.unwrap().unwrap();

    svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();
    let new = svc.session_details(alice, bob).await.unwrap().unwrap();
    assert_ne!(old.id, new.id);

    let sealed = svc.seal(alice, bob, b"fresh", b"").await.unwrap();
    assert!(sealed.is_handshake());
    assert_eq!(svc.open(bob, &sealed, b"").await.unwrap(), b"fresh");
}

#[tokio::test]
async fn invalidated_sessions_refuse_to_seal() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let count = svc.invalidate_sessions_for(bob, "test").await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(svc.session_state(alice, bob).await.unwrap(), SessionState::Invalidated);
    assert!(matches!(
        svc.seal(alice, bob, b"x", b"").await,
        Err(KeyError::SessionInvalidated { .. })
    ));
}

#[tokio::test]
async fn crossed_handshakes_settle_on_one_session() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;

    // Both sides initiate before either has seen the other's handshake.
    svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();
    svc.begin_session(bob, alice).await.unwrap().complete().await.unwrap();
    let from_alice = svc.seal(alice, bob, b"hi from alice", b"").await.unwrap();
    let from_bob = svc.seal(bob, alice, b"hi from bob", b"").await.unwrap();
    assert!(from_alice.is_handshake() && from_bob.is_handshake());
    assert_eq!(svc.open(bob, &from_alice, b"").await.unwrap(), b"hi from alice");
    assert_eq!(svc.open(alice, &from_bob, b"").await.unwrap(), b"hi from bob");

    for round in 0..3u8 {
        let ping = svc.seal(alice, bob, &[b'a', round], b"").await.unwrap();
        assert_eq!(svc.open(bob, &ping, b"").await.unwrap(), [b'a', round]);
        let pong = svc.seal(bob, alice, &[b'b', round], b"").await.unwrap();
        assert_eq!(svc.open(alice, &pong, b"").await.unwrap(), [b'b', round]);
    }

    // Messages that cross on the wire open too.
    let to_bob = svc.seal(alice, bob, b"crossing 1", b"").await.unwrap();
    let to_alice = svc.seal(bob, alice, b"crossing 2", b"").await.unwrap();
    assert_eq!(svc.open(bob, &to_bob, b"").await.unwrap(), b"crossing 1");
    assert_eq!(svc.open(alice, &to_alice, b"").await.unwrap(), b"crossing 2");

    assert_eq!(svc.session_state(alice, bob).await.unwrap(), SessionState::Active);
    assert_eq!(svc.session_state(bob, alice).await.unwrap(), SessionState::Active);
}

#[tokio::test]
async fn message_in_flight_on_a_replaced_session_still_opens() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;

    let late = svc.seal(bob, alice, b"sent before the re-key", b"").await.unwrap();
    svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();
    assert_eq!(svc.open(alice, &late, b"").await.unwrap(), b"sent before the re-key");
    assert!(matches!(svc.open(alice, &late, b"").await, Err(KeyError::CounterRegression { .. })));

    let next = svc.seal(alice, bob, b"after", b"").await.unwrap();
    assert_eq!(svc.open(bob, &next, b"").await.unwrap(), b"after");
    let reply = svc.seal(bob, alice, b"reply", b"").await.unwrap();
    assert_eq!(svc.open(alice, &reply, b"").await.unwrap(), b"reply");
}

#[tokio::test]
async fn superseded_sessions_are_bounded() {
    let core = core().await;
    let svc = &core.service;
    let alice = classical_device(svc, "alice", "laptop").await;
    let bob = classical_device(svc, "bob", "phone").await;
    connect(svc, alice, bob).await;
    for _ in 0..MAX_SUPERSEDED_SESSIONS + 2 {
        svc.begin_session(alice, bob).await.unwrap().complete().await.unwrap();
    }

    assert_eq!(sessions_in_state(svc, alice, "superseded").await, MAX_SUPERSEDED_SESSIONS);
    assert_eq!(sessions_in_state(svc, alice, "invalidated").await, 2);
    assert_eq!(sessions_in_state(svc, alice, "established").await, 1);

    // Invalidation wipes superseded sessions but counts only the live one
    // on each side.
    assert_eq!(svc.invalidate_sessions_for(bob, "test").await.unwrap(), 2);
    assert_eq!(sessions_in_state(svc, alice, "superseded").await, 0);
}

async fn sessions_in_state(svc: &KeyService, local: DeviceId, state: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE local_device_id = ? AND state = ?")
        .bind(local.as_text())
        .bind(state)
        .fetch_one(&svc.store().pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_seals_use_distinct_counters() {
    let core = core().await;
    let svc = core.service.clone();
    let alice = classical_device(&svc, "alice", "laptop").await;
    let bob = classical_device(&svc, "bob", "phone").await;
    connect(&svc, alice, bob).await;

    let tasks: Vec<_> = (0..16u8)
        .map(|i| {
            let svc = svc.clone();
            tokio::spawn(async move { (i, svc.seal(alice, bob, &[i], b"").await) })
        })
        .collect();
    let mut sealed = Vec::new();
    for task in tasks {
        let (i, result) = task.await.unwrap();
        sealed.push((i, result.unwrap()));
    }

    let counters: HashSet<u64> = sealed.iter().map(|(_, m)| m.counter()).collect();
    assert_eq!(counters.len(), sealed.len());

    sealed.sort_by_key(|(_, m)| m.counter());
    for (i, message) in &sealed {
        assert_eq!(svc.open(bob, message, b"").await.unwrap(), [*i]);
    }
    for (_, message) in &sealed {
        assert!(matches!(svc.open(bob, message, b"").await, Err(KeyError::CounterRegression { .. })));
    }
}
