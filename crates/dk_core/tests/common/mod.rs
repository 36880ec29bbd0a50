#![allow(dead_code)]

use dk_core::{CoreConfig, DeviceCapabilities, DeviceId, KeyService, UserId};
use dk_store::Vault;
use tempfile::TempDir;

/// A key core backed by a throwaway database.
pub struct TestCore {
    pub service: KeyService,
    _dir: TempDir,
}

pub async fn core() -> TestCore {
    core_with(|_| {}).await
}

pub async fn core_with(adjust: impl FnOnce(&mut CoreConfig)) -> TestCore {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::for_database(dir.path().join("keys.db"));
    config.one_time_prekey_batch = 20;
    config.one_time_prekey_low_watermark = 5;
    adjust(&mut config);

    let vault = Vault::with_auto_lock(0);
    vault.unlock_with_key([7u8; 32]).await.unwrap();
    let service = KeyService::connect(config, vault).await.unwrap();
    TestCore { service, _dir: dir }
}

pub async fn classical_device(service: &KeyService, user: &str, name: &str) -> DeviceId {
    service
        .provision_local_device(&UserId::from(user), name, &DeviceCapabilities::classical())
        .await
        .unwrap()
}

pub async fn hybrid_device(service: &KeyService, user: &str, name: &str) -> DeviceId {
    service
        .provision_local_device(&UserId::from(user), name, &DeviceCapabilities::hybrid())
        .await
        .unwrap()
}

/// Establish a session from `a` to `b` and deliver one message so both
/// sides hold it.
pub async fn connect(service: &KeyService, a: DeviceId, b: DeviceId) {
    let pending = service.begin_session(a, b).await.unwrap();
    pending.complete().await.unwrap();
    let hello = service.seal(a, b, b"hello", b"").await.unwrap();
    assert_eq!(service.open(b, &hello, b"").await.unwrap(), b"hello");
}
