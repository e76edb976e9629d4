//! Randomized invariant checks over generated wallet activity.

mod common;

use common::{address_script, faucet_tx, new_wallet, ChainSim};
use vaultd_consensus::{Amount, COIN};
use vaultd_primitives::encoding::encode_to_vec;
use vaultd_primitives::outpoint::OutPoint;
use vaultd_primitives::transaction::{Transaction, TxIn, TxOut};
use vaultd_storage::KeyValueStore;
use vaultd_wallet::{derive_child_key, CoinControl, Recipient, ISMINE_SPENDABLE};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn gen_range(&mut self, max: u64) -> u64 {
        if max == 0 {
            0
        } else {
            self.next_u64() % max
        }
    }
}

/// Seeds a wallet with `count` confirmed deposits of varying size.
fn fund_wallet(
    wallet: &common::TestWallet,
    chain: &ChainSim,
    rng: &mut Lcg,
    count: usize,
) -> Vec<(OutPoint, Amount)> {
    let mut deposits = Vec::new();
    for round in 0..count {
        let address = wallet.with_core(|core| core.new_address("").expect("address"));
        let value = (rng.gen_range(90) as Amount + 10) * COIN / 100;
        let tx = faucet_tx(0x10 + round as u8, value, address_script(&address));
        deposits.push((OutPoint::new(tx.txid(), 0), value));
        chain.mine(wallet, vec![tx], &[]);
    }
    chain.mine_until(wallet, chain.height() + 6);
    deposits
}

#[test]
fn spend_index_is_complete() {
    let mut rng = Lcg::new(11);
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();
    fund_wallet(&wallet, &chain, &mut rng, 6);

    for round in 0..4u8 {
        let recipients = vec![Recipient {
            script_pubkey: common::external_script(0xa0 + round),
            amount: (rng.gen_range(20) as Amount + 5) * COIN / 100,
            subtract_fee: false,
        }];
        let created = wallet
            .create_transaction(&chain, &recipients, &CoinControl::default(), true)
            .expect("create");
        wallet.commit_transaction(created, &chain).expect("commit");
    }

    wallet.with_core(|core| {
        for txid in core.tx_ids() {
            let wtx = core.transaction(&txid).expect("wtx");
            if wtx.is_coinbase() {
                continue;
            }
            for input in &wtx.tx.inputs {
                let group = core.spenders_of(&input.prevout).expect("indexed outpoint");
                assert!(group.contains(&txid), "spend index is missing an input");
            }
        }
    });
}

#[test]
fn balance_decomposes_over_trusted_transactions() {
    let mut rng = Lcg::new(23);
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();
    fund_wallet(&wallet, &chain, &mut rng, 5);

    for round in 0..3u8 {
        let recipients = vec![Recipient {
            script_pubkey: common::external_script(0xb0 + round),
            amount: (rng.gen_range(15) as Amount + 3) * COIN / 100,
            subtract_fee: false,
        }];
        let created = wallet
            .create_transaction(&chain, &recipients, &CoinControl::default(), true)
            .expect("create");
        wallet.commit_transaction(created, &chain).expect("commit");
    }

    wallet.with_core(|core| {
        let mut sum = 0;
        for txid in core.tx_ids() {
            if core.is_trusted(&txid, &chain) {
                sum += core.tx_available_credit(&txid, &chain, ISMINE_SPENDABLE);
            }
        }
        assert_eq!(core.balance(&chain), sum);
    });
}

#[test]
fn keypool_reserve_return_reserve_is_stable() {
    let (wallet, _store) = new_wallet();
    for internal in [false, true] {
        wallet.with_core(|core| {
            let first = core.reserve_key(internal).expect("reserve");
            let index = first.index.expect("pooled index");
            core.return_key(first);
            let second = core.reserve_key(internal).expect("re-reserve");
            assert_eq!(second.index, Some(index));
            core.return_key(second);
        });
    }
}

#[test]
fn keypool_keep_consumes_index() {
    let (wallet, _store) = new_wallet();
    wallet.with_core(|core| {
        let reserved = core.reserve_key(false).expect("reserve");
        let index = reserved.index.expect("pooled index");
        core.keep_key(&reserved).expect("keep");
        let next = core.reserve_key(false).expect("next reserve");
        assert_ne!(next.index, Some(index));
        core.return_key(next);
    });
}

#[test]
fn hd_derivation_matches_across_wallets() {
    // Same seed, chain, and counter must give identical child keys
    // regardless of which wallet instance derives them.
    let seed = [0x42u8; 32];
    for internal in [false, true] {
        for counter in [0u32, 1, 17, 1000] {
            let (_, pub_a) = derive_child_key(&seed, internal, counter).expect("derive a");
            let (_, pub_b) = derive_child_key(&seed, internal, counter).expect("derive b");
            assert_eq!(pub_a.serialize(), pub_b.serialize());
        }
    }
}

#[test]
fn self_transfer_has_exactly_one_change_output() {
    let mut rng = Lcg::new(37);
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();
    fund_wallet(&wallet, &chain, &mut rng, 3);

    // Pay our own receive address; the second output is change.
    let own_address = wallet.with_core(|core| core.new_address("").expect("address"));
    let recipients = vec![Recipient {
        script_pubkey: address_script(&own_address),
        amount: COIN / 10,
        subtract_fee: false,
    }];
    let created = wallet
        .create_transaction(&chain, &recipients, &CoinControl::default(), true)
        .expect("create");

    wallet.with_core(|core| {
        let change_outputs: Vec<&TxOut> = created
            .tx
            .outputs
            .iter()
            .filter(|out| core.is_change_output(&out.script_pubkey))
            .collect();
        assert_eq!(change_outputs.len(), 1);

        let input_total: Amount = created
            .tx
            .inputs
            .iter()
            .map(|input| {
                core.transaction(&input.prevout.txid)
                    .and_then(|parent| parent.tx.outputs.get(input.prevout.vout as usize))
                    .map(|out| out.value)
                    .expect("own input")
            })
            .sum();
        let non_change: Amount = created
            .tx
            .outputs
            .iter()
            .filter(|out| !core.is_change_output(&out.script_pubkey))
            .map(|out| out.value)
            .sum();
        assert_eq!(change_outputs[0].value, input_total - non_change - created.fee);
    });
    wallet.discard_transaction(created);
}

fn clone_store(store: &vaultd_storage::MemoryStore) -> std::sync::Arc<vaultd_storage::MemoryStore> {
    let copy = vaultd_storage::MemoryStore::new();
    for (key, value) in store.scan_prefix(&[]).expect("scan") {
        copy.put(&key, &value).expect("put");
    }
    std::sync::Arc::new(copy)
}

/// Deletes every `tx` record so a reloaded wallet starts with keys
/// but no transaction history.
fn strip_tx_records(store: &vaultd_storage::MemoryStore) {
    let prefix = [0x02, b't', b'x'];
    for (key, _) in store.scan_prefix(&prefix).expect("scan") {
        store.delete(&key).expect("delete");
    }
}

#[test]
fn rescan_in_parts_equals_full_rescan() {
    let mut rng = Lcg::new(53);

    // One funded wallet defines the chain; two fresh wallets sharing
    // its keys rescan it differently.
    let (wallet, store) = new_wallet();
    let chain = ChainSim::new();
    fund_wallet(&wallet, &chain, &mut rng, 5);
    drop(wallet);
    strip_tx_records(&store);

    let config = common::test_config();
    let network = vaultd_consensus::Network::Regtest;
    let split = common::TestWallet::load(clone_store(&store), network, config.clone())
        .expect("load split");
    let full = common::TestWallet::load(clone_store(&store), network, config).expect("load full");

    let tip = chain.height();
    let mid = tip / 2;
    {
        let reserver = split.reserve_rescan().expect("reserve");
        let stopped = split.rescan(&chain, 0, mid, &reserver).expect("first half");
        assert_eq!(stopped, mid);
        drop(reserver);
        let reserver = split.reserve_rescan().expect("re-reserve");
        split
            .rescan(&chain, mid + 1, tip, &reserver)
            .expect("second half");
    }
    {
        let reserver = full.reserve_rescan().expect("reserve");
        full.rescan(&chain, 0, tip, &reserver).expect("full");
    }

    let split_txids = split.with_core(|core| core.tx_ids());
    let full_txids = full.with_core(|core| core.tx_ids());
    assert_eq!(split_txids, full_txids);
    assert_eq!(
        split.with_core(|core| core.balance(&chain)),
        full.with_core(|core| core.balance(&chain)),
    );
}

#[test]
fn second_rescan_reservation_is_refused() {
    let (wallet, _store) = new_wallet();
    let first = wallet.reserve_rescan().expect("first");
    assert!(matches!(
        wallet.reserve_rescan(),
        Err(vaultd_wallet::WalletError::RescanInProgress)
    ));
    drop(first);
    wallet.reserve_rescan().expect("after release");
}

#[test]
fn conflict_closure_shares_an_outpoint_chain() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();
    let mut rng = Lcg::new(71);
    let deposits = fund_wallet(&wallet, &chain, &mut rng, 1);
    let (deposit_outpoint, deposit_value) = deposits[0];

    // A spends the deposit; C spends A's output; B double-spends the
    // deposit and wins.
    let own_script = {
        let address = wallet.with_core(|core| core.new_address("").expect("address"));
        address_script(&address)
    };
    let tx_a = Transaction {
        version: 1,
        inputs: vec![TxIn::from_outpoint(deposit_outpoint)],
        outputs: vec![TxOut {
            value: deposit_value - 10_000,
            script_pubkey: own_script,
        }],
        lock_time: 0,
    };
    let tx_c = Transaction {
        version: 1,
        inputs: vec![TxIn::from_outpoint(OutPoint::new(tx_a.txid(), 0))],
        outputs: vec![TxOut {
            value: deposit_value - 20_000,
            script_pubkey: common::external_script(0xcc),
        }],
        lock_time: 0,
    };
    let mut tx_b = tx_a.clone();
    tx_b.outputs[0].value = deposit_value - 30_000;

    wallet.on_tx_added_to_mempool(&tx_a);
    wallet.on_tx_added_to_mempool(&tx_c);
    chain.mine(&wallet, vec![tx_b.clone()], &[tx_a.txid()]);

    wallet.with_core(|core| {
        for txid in [tx_a.txid(), tx_c.txid()] {
            let state = core.transaction(&txid).expect("tracked").state;
            assert!(
                matches!(state, vaultd_wallet::TxState::Conflicted { .. }),
                "descendant must be conflicted"
            );
        }
        // Conflict symmetry: the marked set and the winner connect
        // through the spend index.
        let group = core.spenders_of(&deposit_outpoint).expect("group");
        assert!(group.contains(&tx_a.txid()));
        assert!(group.contains(&tx_b.txid()));
    });
}

#[test]
fn records_roundtrip_byte_exact_across_reload() {
    let mut rng = Lcg::new(97);
    let (wallet, store) = new_wallet();
    let chain = ChainSim::new();
    fund_wallet(&wallet, &chain, &mut rng, 4);
    drop(wallet);

    let before: Vec<(Vec<u8>, Vec<u8>)> = store.scan_prefix(&[]).expect("scan");
    let wallet = common::TestWallet::load(
        std::sync::Arc::clone(&store),
        vaultd_consensus::Network::Regtest,
        common::test_config(),
    )
    .expect("reload");

    // Re-persist every transaction record from in-memory state and
    // compare the full record set.
    wallet.with_core(|core| {
        for txid in core.tx_ids() {
            let encoded = encode_to_vec(core.transaction(&txid).expect("wtx"));
            let mut key = vaultd_primitives::encoding::Encoder::new();
            key.write_var_str("tx");
            key.write_bytes(&txid);
            let stored = store.get(&key.into_inner()).expect("get").expect("record");
            assert_eq!(encoded, stored, "tx record must re-encode byte-exact");
        }
    });
    let after: Vec<(Vec<u8>, Vec<u8>)> = store.scan_prefix(&[]).expect("scan");
    assert_eq!(before, after);
}
