mod common;

use std::str::FromStr;

use bitcoin::Address;
use common::{Harness, native_multi_path, signer};
use multisig_coordinator::{
    DeviceType, Error, Network, NodeGateway, ScriptType, SignerDevice, Snapshot, StoreError, WalletRecord,
    WalletType,
};

fn testnet_address(address: &str) -> Address {
    Address::from_str(address)
        .unwrap()
        .require_network(bitcoin::Network::Testnet)
        .unwrap()
}

#[test]
fn create_is_once_per_name() {
    let h = Harness::new();
    let wallet = WalletRecord::create(&h.ctx, h.params("vault", 2, 3)).unwrap();
    assert!(!wallet.ready());
    assert_eq!(wallet.receiving_address_index(), 0);
    assert_eq!(h.node.state().loaded, vec!["vault".to_string()]);

    let again = WalletRecord::create(&h.ctx, h.params("vault", 1, 1));
    assert!(matches!(again, Err(Error::AlreadyExists(name)) if name == "vault"));
    assert_eq!(WalletRecord::list(&h.ctx).unwrap(), vec!["vault".to_string()]);
}

#[test]
fn create_loads_an_existing_node_wallet() {
    let h = Harness::new();
    h.node.state().wallets.push("vault".into());

    WalletRecord::create(&h.ctx, h.params("vault", 2, 3)).unwrap();

    let state = h.node.state();
    assert_eq!(state.wallets, vec!["vault".to_string()]);
    assert_eq!(state.loaded, vec!["vault".to_string()]);
}

#[test]
fn invalid_parameters_have_no_side_effects() {
    let h = Harness::new();
    for (m, n) in [(3, 2), (0, 2), (1, 21)] {
        let result = WalletRecord::create(&h.ctx, h.params("bad", m, n));
        assert!(matches!(result, Err(Error::Configuration(_))), "{m}-of-{n}");
    }

    let mut single = h.params("bad", 1, 2);
    single.wallet_type = WalletType::Single;
    assert!(matches!(WalletRecord::create(&h.ctx, single), Err(Error::Configuration(_))));

    let mut mismatched = h.params("bad", 2, 3);
    mismatched.node.network = Network::Regtest;
    assert!(matches!(WalletRecord::create(&h.ctx, mismatched), Err(Error::Configuration(_))));

    assert!(!h.ctx.store.exists("bad").unwrap());
    assert!(h.node.state().wallets.is_empty());
}

#[test]
fn open_unknown_wallet() {
    let h = Harness::new();
    assert!(matches!(WalletRecord::open(&h.ctx, "ghost"), Err(Error::NotFound(_))));
}

#[test]
fn enrollment_up_to_quorum() {
    let h = Harness::new();
    let mut wallet = WalletRecord::create(&h.ctx, h.params("vault", 2, 3)).unwrap();
    let path = wallet.account_path();
    assert_eq!(path.to_string().trim_start_matches("m/"), "48'/1'/0'/2'");

    for seed in 1..=3 {
        assert!(!wallet.ready());
        assert!(matches!(wallet.derive_receiving_address(), Err(Error::NotReady(_))));
        let device = signer(seed, &path);
        let enrolled = wallet.enroll(device.name(), &device).unwrap();
        assert_eq!(enrolled.fingerprint, device.fingerprint().unwrap());
        assert_eq!(enrolled.device_type, DeviceType::Software);
    }
    assert!(wallet.ready());

    let extra = signer(4, &path);
    match wallet.enroll("late", &extra) {
        Err(Error::NotReady(message)) => assert!(message.contains("already have 3 of 3")),
        other => panic!("expected NotReady, got {:?}", other.map(|s| s.name)),
    }

    let reopened = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert!(reopened.ready());
    assert_eq!(reopened.signers().len(), 3);
}

#[test]
fn duplicate_signers_are_rejected() {
    let h = Harness::new();
    let mut wallet = WalletRecord::create(&h.ctx, h.params("vault", 2, 3)).unwrap();
    let path = wallet.account_path();

    wallet.enroll("alice", &signer(1, &path)).unwrap();
    assert!(matches!(
        wallet.enroll("alice", &signer(2, &path)),
        Err(Error::DuplicateSigner(_))
    ));
    assert!(matches!(
        wallet.enroll("bob", &signer(1, &path)),
        Err(Error::DuplicateSigner(_))
    ));
    assert_eq!(wallet.signers().len(), 1);
}

#[test]
fn add_signer_checks_xpub_network() {
    let h = Harness::new();
    let mut wallet = WalletRecord::create(&h.ctx, h.params("vault", 1, 2)).unwrap();
    let path = wallet.account_path();

    let mainnet = multisig_coordinator::SoftwareSigner::from_seed("main", bitcoin::Network::Bitcoin, &[9; 32], &path)
        .unwrap()
        .key_data();
    let result = wallet.add_signer(
        "main",
        &mainnet.fingerprint,
        &mainnet.xpub,
        DeviceType::Ledger,
        &mainnet.derivation_path,
    );
    assert!(matches!(result, Err(Error::Configuration(_))));

    let test = signer(1, &path).key_data();
    wallet
        .add_signer("alice", &test.fingerprint, &test.xpub, DeviceType::Coldcard, &test.derivation_path)
        .unwrap();
    assert!(matches!(
        wallet.add_signer("bob", "zz", &test.xpub, DeviceType::Coldcard, &test.derivation_path),
        Err(Error::Configuration(_))
    ));
    assert_eq!(wallet.signers()[0].device_type, DeviceType::Coldcard);
}

#[test]
fn receiving_addresses_are_distinct_and_persisted() {
    let h = Harness::new();
    let (mut wallet, _) = h.ready_wallet(h.params("vault", 2, 3));

    let first = wallet.derive_receiving_address().unwrap();
    let second = wallet.derive_receiving_address().unwrap();
    assert_ne!(first, second);
    for address in [&first, &second] {
        assert!(address.starts_with("tb1q"));
        assert!(testnet_address(address).script_pubkey().is_p2wsh());
        assert!(h.node.is_watched(address));
    }
    assert_eq!(wallet.receiving_address_index(), 2);
    assert_eq!(wallet.change_address_index(), 0);

    let change = wallet.derive_change_address().unwrap();
    assert!(h.node.address_info(&change).unwrap().is_change);
    assert!(!h.node.address_info(&first).unwrap().is_change);

    let mut reopened = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert_eq!(reopened.receiving_address_index(), 2);
    assert_eq!(reopened.change_address_index(), 1);
    let third = reopened.derive_receiving_address().unwrap();
    assert!(third != first && third != second);
}

#[test]
fn descriptors_are_deterministic() {
    let h = Harness::new();
    let (wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    let descriptor = wallet.descriptor(false, 7).unwrap();
    assert!(descriptor.starts_with("wsh(multi(2,["));
    assert_eq!(descriptor, wallet.descriptor(false, 7).unwrap());
    assert_ne!(descriptor, wallet.descriptor(true, 7).unwrap());

    // Enrollment order does not change the address space.
    let other = Harness::new();
    let mut reversed = WalletRecord::create(&other.ctx, other.params("vault", 2, 3)).unwrap();
    for seed in (1..=3).rev() {
        let device = signer(seed, &native_multi_path());
        reversed.enroll(device.name(), &device).unwrap();
    }
    assert_eq!(reversed.descriptor(false, 7).unwrap(), descriptor);
}

#[test]
fn wrapped_and_single_wallets() {
    let h = Harness::new();

    let mut wrapped = h.params("wrapped", 2, 3);
    wrapped.script_type = ScriptType::Wrapped;
    let (mut wallet, _) = h.ready_wallet(wrapped);
    let address = wallet.derive_receiving_address().unwrap();
    assert!(address.starts_with('2'));
    assert!(testnet_address(&address).script_pubkey().is_p2sh());

    let mut single = h.params("single", 1, 1);
    single.wallet_type = WalletType::Single;
    let (mut wallet, _) = h.ready_wallet(single);
    assert_eq!(wallet.account_path().to_string().trim_start_matches("m/"), "84'/1'/0'");
    let address = wallet.derive_receiving_address().unwrap();
    assert!(testnet_address(&address).script_pubkey().is_p2wpkh());
}

#[test]
fn unwatched_address_is_fatal() {
    let h = Harness::new();
    let (mut wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    h.node.state().not_watch_only = true;

    let err = wallet.derive_receiving_address().unwrap_err();
    assert!(matches!(err, Error::ConsistencyViolation(_)));
    assert!(err.is_fatal());
    assert_eq!(wallet.receiving_address_index(), 0);
    assert_eq!(WalletRecord::open(&h.ctx, "vault").unwrap().receiving_address_index(), 0);
}

#[test]
fn unsorted_keys_are_fatal() {
    let h = Harness::new();
    let (mut wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    h.node.state().reverse_pubkeys = true;

    assert!(matches!(
        wallet.derive_change_address(),
        Err(Error::ConsistencyViolation(_))
    ));
    assert_eq!(wallet.change_address_index(), 0);
}

#[test]
fn quorum_exports_address_window() {
    let h = Harness::with_window(3);
    let (wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    assert_eq!(h.node.watched_count(), 6);
    assert_eq!(wallet.receiving_address_index(), 0);
    assert_eq!(wallet.change_address_index(), 0);

    let quiet = Harness::with_window(0);
    quiet.ready_wallet(quiet.params("vault", 2, 3));
    assert_eq!(quiet.node.watched_count(), 0);
}

#[test]
fn sync_repairs_lost_watches() {
    let h = Harness::new();
    let (mut wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    let mut issued = (0..3)
        .map(|_| wallet.derive_receiving_address().unwrap())
        .collect::<Vec<_>>();
    issued.push(wallet.derive_change_address().unwrap());

    assert_eq!(wallet.sync(false).unwrap(), 0);

    h.node.forget_watches();
    assert!(issued.iter().all(|a| !h.node.is_watched(a)));
    assert_eq!(wallet.sync(true).unwrap(), 4);
    assert!(issued.iter().all(|a| h.node.is_watched(a)));
    assert_eq!(h.node.state().rescans, 1);
    assert!(h.node.address_info(&issued[3]).unwrap().is_change);

    assert_eq!(wallet.sync(true).unwrap(), 0);
    assert_eq!(h.node.state().rescans, 1);
}

#[test]
fn reopen_round_trips_byte_for_byte() {
    let h = Harness::new();
    let (mut wallet, signers) = h.funded_wallet(h.params("vault", 2, 3), bitcoin::Amount::from_sat(500_000));
    let index = wallet
        .create_psbt(&[common::payment(common::EXTERNAL_ADDRESS, 20_000)], &[])
        .unwrap();
    wallet.sign_psbt(index, &signers[1]).unwrap();

    let stored = h.ctx.store.load("vault").unwrap().unwrap();
    let mut reopened = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert_eq!(reopened.to_json().unwrap(), stored);
    assert_eq!(reopened.psbts(), wallet.psbts());

    reopened.save().unwrap();
    let saved = h.ctx.store.load("vault").unwrap().unwrap();
    assert_eq!(reopened.to_json().unwrap(), saved);
    assert_eq!(WalletRecord::open(&h.ctx, "vault").unwrap().to_json().unwrap(), saved);
}

#[test]
fn second_handle_cannot_reissue_an_index() {
    let h = Harness::new();
    h.ready_wallet(h.params("vault", 2, 3));

    let mut first = WalletRecord::open(&h.ctx, "vault").unwrap();
    let mut second = WalletRecord::open(&h.ctx, "vault").unwrap();
    let issued = first.derive_receiving_address().unwrap();

    assert!(matches!(
        second.derive_receiving_address(),
        Err(Error::Store(StoreError::Conflict { .. }))
    ));
    assert_eq!(second.receiving_address_index(), 0);

    let mut second = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert_eq!(second.receiving_address_index(), 1);
    let next = second.derive_receiving_address().unwrap();
    assert_ne!(next, issued);
    assert_eq!(WalletRecord::open(&h.ctx, "vault").unwrap().receiving_address_index(), 2);

    // The stale handle stays unable to write.
    assert!(matches!(first.derive_change_address(), Err(Error::Store(StoreError::Conflict { .. }))));
}

#[test]
fn create_refuses_a_record_written_concurrently() {
    let h = Harness::new();
    let mut wallet = WalletRecord::create(&h.ctx, h.params("vault", 1, 2)).unwrap();
    let mut stale = WalletRecord::open(&h.ctx, "vault").unwrap();
    let path = wallet.account_path();

    wallet.enroll("alice", &signer(1, &path)).unwrap();
    assert!(matches!(
        stale.enroll("bob", &signer(2, &path)),
        Err(Error::Store(StoreError::Conflict { .. }))
    ));
    assert!(stale.signers().is_empty());
}

#[test]
fn quorum_survives_an_unreachable_node() {
    let h = Harness::with_window(2);
    let mut wallet = WalletRecord::create(&h.ctx, h.params("vault", 2, 3)).unwrap();
    let path = wallet.account_path();
    wallet.enroll("s1", &signer(1, &path)).unwrap();
    wallet.enroll("s2", &signer(2, &path)).unwrap();

    h.node.state().unavailable = true;
    wallet.enroll("s3", &signer(3, &path)).unwrap();
    assert!(wallet.ready());
    assert!(wallet.window_pending());
    assert_eq!(h.node.watched_count(), 0);

    let degraded = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert!(degraded.ready());
    assert!(degraded.window_pending());
    assert!(degraded.describe().window_pending);

    h.node.state().unavailable = false;
    let mut reopened = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert_eq!(reopened.sync(false).unwrap(), 4);
    assert_eq!(h.node.watched_count(), 4);
    assert!(!reopened.window_pending());
    assert!(!WalletRecord::open(&h.ctx, "vault").unwrap().window_pending());
    assert_eq!(reopened.sync(false).unwrap(), 0);
}

#[test]
fn reconnect_exports_an_outstanding_window() {
    let h = Harness::with_window(1);
    let mut wallet = WalletRecord::create(&h.ctx, h.params("vault", 1, 2)).unwrap();
    let path = wallet.account_path();
    wallet.enroll("s1", &signer(1, &path)).unwrap();
    h.node.state().unavailable = true;
    wallet.enroll("s2", &signer(2, &path)).unwrap();

    h.node.state().unavailable = false;
    wallet.reconnect().unwrap();
    assert!(!wallet.window_pending());
    assert_eq!(h.node.watched_count(), 2);
}

#[test]
fn unreachable_node_degrades_reads() {
    let h = Harness::new();
    let (mut wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    let address = wallet.derive_receiving_address().unwrap();
    h.node.fund(&address, bitcoin::Amount::from_sat(70_000));

    h.node.state().unavailable = true;
    let mut wallet = WalletRecord::open(&h.ctx, "vault").unwrap();
    assert!(wallet.is_degraded());
    assert!(!wallet.describe().node_linked);
    assert_eq!(wallet.balances().unwrap(), Snapshot::Unavailable);
    assert_eq!(wallet.history(10).unwrap(), Snapshot::Unavailable);
    assert!(!wallet.coins().unwrap().is_available());
    assert!(matches!(wallet.derive_receiving_address(), Err(Error::NodeUnavailable(_))));
    assert_eq!(wallet.receiving_address_index(), 1);

    h.node.state().unavailable = false;
    wallet.reconnect().unwrap();
    assert!(!wallet.is_degraded());
    let balance = wallet.balances().unwrap().live().unwrap();
    assert_eq!(balance.trusted, bitcoin::Amount::from_sat(70_000));
    let coins = wallet.coins().unwrap().live().unwrap();
    assert_eq!(coins.unspent.len(), 1);
    assert_eq!(coins.unspent[0].address.as_deref(), Some(address.as_str()));
}

#[test]
fn describe_reports_progress() {
    let h = Harness::new();
    let (mut wallet, _) = h.ready_wallet(h.params("vault", 2, 3));
    wallet.derive_receiving_address().unwrap();

    let summary = wallet.describe();
    assert!(summary.ready);
    assert!(summary.node_linked);
    assert_eq!(summary.signers.len(), 3);
    assert_eq!(summary.receiving_address_index, 1);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["signers"][0]["type"], "software");
    assert_eq!(json["network"], "testnet");
}
