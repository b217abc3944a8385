use super::{addr, test_config, Harness};
use crate::directory::{
    extract_devices, DeviceDirectory, DeviceRecord, DirectoryEntry, DirectoryQuery,
};
use crate::error::{CoreError, TransportError};
use async_trait::async_trait;
use courier_types::AccountId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn record(id: u16, key_index: Option<u32>) -> DeviceRecord {
    DeviceRecord { id, key_index }
}

/// Answers after a delay, counting how often it was asked.
#[derive(Default)]
struct SlowDirectory {
    calls: AtomicU32,
    fail: bool,
}

#[async_trait]
impl DirectoryQuery for SlowDirectory {
    async fn query_devices(
        &self,
        accounts: &[AccountId],
    ) -> Result<Vec<DirectoryEntry>, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fail {
            return Err(TransportError::Status(500, "internal".to_string()).into());
        }
        Ok(accounts
            .iter()
            .map(|account| DirectoryEntry {
                account: account.clone(),
                devices: vec![record(0, None), record(3, Some(3))],
                alternate: None,
            })
            .collect())
    }
}

#[test]
fn extract_skips_unsigned_companions_and_own_device() {
    let account = AccountId::primary("100");
    let devices = vec![record(0, None), record(2, Some(2)), record(3, Some(3)), record(4, None)];

    let all = extract_devices(&account, &devices, false, &[]);
    assert_eq!(all, vec![addr("100@user"), addr("100:2@user"), addr("100:3@user")]);

    let without_own = extract_devices(&account, &devices, false, &[addr("100:2@user")]);
    assert_eq!(without_own, vec![addr("100@user"), addr("100:3@user")]);

    let companions = extract_devices(&account, &devices, true, &[]);
    assert_eq!(companions, vec![addr("100:2@user"), addr("100:3@user")]);
}

#[tokio::test]
async fn cached_lists_are_reused() {
    let h = Harness::new(test_config()).await;
    let account = AccountId::primary("200");
    h.directory.register(account.clone(), &[0, 1]).await;

    let first = h
        .core
        .get_devices(&[account.clone(), account.clone()], true, false)
        .await
        .expect("devices");
    let second = h
        .core
        .get_devices(&[account.clone()], true, false)
        .await
        .expect("devices");

    assert_eq!(first, vec![addr("200@user"), addr("200:1@user")]);
    assert_eq!(first, second);
    let queries = h.directory.queries().await;
    assert_eq!(queries, vec![vec![account.clone()]]);

    h.core
        .get_devices(&[account], false, false)
        .await
        .expect("devices");
    assert_eq!(h.directory.queries().await.len(), 2);
}

#[tokio::test]
async fn own_device_is_never_returned() {
    let h = Harness::new(test_config()).await;
    h.directory
        .register(AccountId::primary("100"), &[0, 2, 3])
        .await;

    let devices = h
        .core
        .get_devices(&[AccountId::primary("100")], true, false)
        .await
        .expect("devices");

    assert_eq!(devices, vec![addr("100@user"), addr("100:3@user")]);
}

#[tokio::test]
async fn unknown_account_resolves_to_nothing() {
    let h = Harness::new(test_config()).await;

    let devices = h
        .core
        .get_devices(&[AccountId::primary("404")], true, false)
        .await
        .expect("devices");

    assert!(devices.is_empty());
}

#[tokio::test]
async fn get_devices_requires_credentials() {
    let h = Harness::unauthenticated(test_config()).await;

    let err = h
        .core
        .get_devices(&[AccountId::primary("200")], true, false)
        .await
        .expect_err("no creds");

    assert_eq!(err, CoreError::NotAuthenticated);
}

#[tokio::test(start_paused = true)]
async fn cached_list_expires_after_ttl() {
    let mut config = test_config();
    config.device_cache_ttl_ms = 1_000;
    let h = Harness::new(config).await;
    let account = AccountId::primary("200");
    h.directory.register(account.clone(), &[0]).await;

    h.core
        .get_devices(&[account.clone()], true, false)
        .await
        .expect("devices");
    tokio::time::advance(Duration::from_millis(1_500)).await;
    h.core
        .get_devices(&[account], true, false)
        .await
        .expect("devices");

    assert_eq!(h.directory.queries().await.len(), 2);
}

#[tokio::test]
async fn concurrent_lookups_share_one_query() {
    let slow = Arc::new(SlowDirectory::default());
    let directory = DeviceDirectory::new(slow.clone(), Duration::from_secs(60));
    let accounts = vec![AccountId::primary("300")];

    let (first, second) = tokio::join!(
        directory.get_devices(&accounts, true, false, &[]),
        directory.get_devices(&accounts, true, false, &[])
    );

    let first = first.expect("leader");
    let second = second.expect("follower");
    assert_eq!(first, vec![addr("300@user"), addr("300:3@user")]);
    assert_eq!(first, second);
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn leader_failure_reaches_followers() {
    let slow = Arc::new(SlowDirectory {
        calls: AtomicU32::new(0),
        fail: true,
    });
    let directory = DeviceDirectory::new(slow.clone(), Duration::from_secs(60));
    let accounts = vec![AccountId::primary("300")];

    let (first, second) = tokio::join!(
        directory.get_devices(&accounts, true, false, &[]),
        directory.get_devices(&accounts, true, false, &[])
    );

    assert!(first.expect_err("leader").is_transient());
    assert!(second.expect_err("follower").is_transient());
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn alternate_accounts_map_to_primary() {
    let h = Harness::new(test_config()).await;
    h.directory
        .put(DirectoryEntry {
            account: AccountId::primary("200"),
            devices: vec![record(0, None)],
            alternate: Some(AccountId::alternate("800")),
        })
        .await;

    h.core
        .get_devices(&[AccountId::primary("200")], true, false)
        .await
        .expect("devices");

    let directory = h.core.directory();
    assert_eq!(
        directory.map_alternate(&AccountId::alternate("800")).await,
        Some(AccountId::primary("200"))
    );
    assert_eq!(
        directory.primary_for(&AccountId::alternate("801")).await,
        AccountId::alternate("801")
    );
}

#[tokio::test(start_paused = true)]
async fn learnt_alternates_expire_with_the_device_lists() {
    let mut config = test_config();
    config.device_cache_ttl_ms = 1_000;
    let h = Harness::new(config).await;
    h.directory
        .put(DirectoryEntry {
            account: AccountId::alternate("800"),
            devices: vec![record(0, None)],
            alternate: Some(AccountId::primary("200")),
        })
        .await;

    h.core
        .get_devices(&[AccountId::alternate("800")], true, false)
        .await
        .expect("devices");
    let directory = h.core.directory();
    assert_eq!(
        directory.primary_for(&AccountId::alternate("800")).await,
        AccountId::primary("200")
    );

    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert_eq!(directory.map_alternate(&AccountId::alternate("800")).await, None);
}
