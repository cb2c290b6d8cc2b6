//! Integration tests for proxykit-deploy.
//!
//! These drive deploys and upgrades end to end against an in-memory chain, with artifacts
//! and the registry on disk. Run with: cargo test --test integration_test

use proxykit_deploy::{
    DeployError, DeploymentRegistry, ErrorKind, RegistryEntry,
    config::DEV_PRIVATE_KEY,
    test_utils::{MockChain, deploy_fixture},
};
use tempdir::TempDir;

#[tokio::test]
async fn test_deploy_then_compatible_upgrade() {
    let temp_dir = TempDir::new("proxykit-it").unwrap();
    let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;

    let deployed = fixture
        .deployer
        .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
        .await
        .unwrap();
    let a = deployed.proxy_address;
    let b = deployed.implementation_address;

    let latest = fixture.registry.latest("local", "Token").unwrap();
    assert_eq!(
        (latest.proxy_address, latest.implementation_address, latest.version.as_str()),
        (a, b, "v1")
    );

    let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;
    coordinator
        .upgrade(a, &fixture.version("v2"), &fixture.network)
        .await
        .unwrap();

    let latest = fixture.registry.latest("local", "Token").unwrap();
    let c = latest.implementation_address;
    assert_eq!(latest.proxy_address, a);
    assert_eq!(latest.version, "v2");
    assert_ne!(b, c);

    // A fresh handle on the same directory sees the same history.
    let reopened = DeploymentRegistry::new(&fixture.config.registry_dir);
    let history = reopened.history("local", "Token").unwrap();
    assert!(matches!(history[0], RegistryEntry::Deploy { .. }));
    match &history[1] {
        RegistryEntry::Upgrade { transaction, .. } => {
            assert_eq!(transaction.from_version, "v1");
            assert_eq!(transaction.to_version, "v2");
            assert_eq!(transaction.new_implementation_address, c);
            assert!(transaction.compatibility.is_compatible());
        }
        other => panic!("unexpected entry: {other:?}"),
    }
}

#[tokio::test]
async fn test_upgrade_removing_a_field_is_rejected() {
    let temp_dir = TempDir::new("proxykit-it").unwrap();
    let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;

    let before = fixture
        .deployer
        .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
        .await
        .unwrap();
    let contracts = fixture.chain.contract_count();

    let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;
    let err = coordinator
        .upgrade(before.proxy_address, &fixture.version("v2-removed"), &fixture.network)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::StorageLayoutIncompatible { .. }));
    assert_eq!(fixture.registry.latest("local", "Token").unwrap(), before);
    assert_eq!(fixture.chain.contract_count(), contracts);
    assert_eq!(
        fixture.chain.implementation_of(before.proxy_address),
        Some(before.implementation_address)
    );
}

#[tokio::test]
async fn test_concurrent_upgrades_of_one_key() {
    let temp_dir = TempDir::new("proxykit-it").unwrap();
    let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;

    let before = fixture
        .deployer
        .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
        .await
        .unwrap();

    let first = fixture.coordinator(DEV_PRIVATE_KEY).await;
    let second = fixture.coordinator(DEV_PRIVATE_KEY).await;
    let v2 = fixture.version("v2");
    let v3 = fixture.version("v3");

    let (a, b) = tokio::join!(
        first.upgrade(before.proxy_address, &v2, &fixture.network),
        second.upgrade(before.proxy_address, &v3, &fixture.network),
    );

    let outcomes = [a, b];
    let succeeded: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
    let busy = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::RegistryBusy))
        .count();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(busy, 1);

    // The history holds one deploy and exactly one upgrade, both intact.
    let history = fixture.registry.history("local", "Token").unwrap();
    assert_eq!(history.len(), 2);
    let latest = fixture.registry.latest("local", "Token").unwrap();
    assert_eq!(latest.implementation_address, succeeded[0].new_implementation_address);
    assert_eq!(latest.proxy_address, before.proxy_address);

    // The busy key is free again afterwards.
    assert!(fixture.registry.lease("local", "Token").is_ok());
}
