//! End-to-end wallet flows against the in-test chain.

mod common;

use common::{address_script, external_script, faucet_tx, new_wallet, ChainSim};
use vaultd_consensus::COIN;
use vaultd_primitives::outpoint::OutPoint;
use vaultd_wallet::{CoinControl, Recipient, TxState, WalletError};

#[test]
fn deposit_confirms_at_height_100() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();

    let addresses: Vec<String> = (0..3)
        .map(|_| wallet.with_core(|core| core.new_address("").expect("address")))
        .collect();
    assert_eq!(addresses.len(), 3);

    let deposit = faucet_tx(0xf0, COIN, address_script(&addresses[1]));
    wallet.on_tx_added_to_mempool(&deposit);
    assert_eq!(wallet.with_core(|core| core.balance(&chain)), 0);

    chain.mine_until(&wallet, 99);
    assert_eq!(wallet.with_core(|core| core.balance(&chain)), 0);
    chain.mine(&wallet, vec![deposit], &[]);
    assert_eq!(chain.height(), 100);
    assert_eq!(wallet.with_core(|core| core.balance(&chain)), COIN);
}

#[test]
fn spend_with_change_and_targeted_fee() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();

    let address = wallet.with_core(|core| core.new_address("").expect("address"));
    let deposit = faucet_tx(0xf1, COIN, address_script(&address));
    let deposit_txid = deposit.txid();
    chain.mine(&wallet, vec![deposit], &[]);
    chain.mine_until(&wallet, 7);

    let recipients = vec![Recipient {
        script_pubkey: external_script(0x44),
        amount: 4 * COIN / 10,
        subtract_fee: false,
    }];
    let control = CoinControl {
        fee_rate_per_kb: Some(1000),
        ..CoinControl::default()
    };
    let created = wallet
        .create_transaction(&chain, &recipients, &control, true)
        .expect("create");

    let pay_outputs: Vec<_> = created
        .tx
        .outputs
        .iter()
        .filter(|out| out.script_pubkey == recipients[0].script_pubkey)
        .collect();
    assert_eq!(pay_outputs.len(), 1);
    assert_eq!(pay_outputs[0].value, 4 * COIN / 10);

    let change_position = created.change_position.expect("change output");
    let change_script = created.tx.outputs[change_position].script_pubkey.clone();
    assert!(wallet.with_core(|core| core.is_change_output(&change_script)));

    // At 1000 units per kB the fee equals the virtual size, give or
    // take the dummy-signature padding.
    let signed_size = created.tx.serialized_size() as i64;
    assert!(created.fee >= signed_size - 2);
    assert!(created.fee <= signed_size + 8);

    let spent = created.tx.inputs[0].prevout;
    assert_eq!(spent.txid, deposit_txid);
    let new_txid = created.tx.txid();
    wallet.commit_transaction(created, &chain).expect("commit");
    let spenders = wallet.with_core(|core| {
        core.spenders_of(&spent)
            .map(|group| group.contains(&new_txid))
            .unwrap_or(false)
    });
    assert!(spenders);
    assert_eq!(chain.broadcasts.borrow().as_slice(), &[new_txid]);
}

#[test]
fn disconnect_returns_deposit_to_unconfirmed() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();

    let address = wallet.with_core(|core| core.new_address("").expect("address"));
    let deposit = faucet_tx(0xf2, COIN, address_script(&address));
    let deposit_txid = deposit.txid();
    chain.mine(&wallet, vec![deposit], &[]);
    assert_eq!(wallet.with_core(|core| core.balance(&chain)), COIN);

    chain.disconnect_tip(&wallet);
    let state = wallet.with_core(|core| core.transaction(&deposit_txid).map(|wtx| wtx.state));
    assert_eq!(state, Some(TxState::Unconfirmed));
    assert_eq!(wallet.with_core(|core| core.balance(&chain)), 0);
}

#[test]
fn double_spend_marks_loser_conflicted() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();

    let address = wallet.with_core(|core| core.new_address("").expect("address"));
    let deposit = faucet_tx(0xf3, COIN, address_script(&address));
    let deposit_txid = deposit.txid();
    chain.mine(&wallet, vec![deposit.clone()], &[]);
    chain.mine_until(&wallet, 6);

    // Two competing spends of the same deposit output.
    let spent = OutPoint::new(deposit_txid, 0);
    let mut spend_a = faucet_tx(0, COIN - 10_000, external_script(0x55));
    spend_a.inputs[0].prevout = spent;
    let mut spend_b = faucet_tx(0, COIN - 20_000, external_script(0x66));
    spend_b.inputs[0].prevout = spent;
    spend_b.lock_time = 1;

    wallet.on_tx_added_to_mempool(&spend_a);
    wallet.on_tx_added_to_mempool(&spend_b);
    wallet.with_core(|core| {
        let group = core.spenders_of(&spent).expect("conflict group");
        assert_eq!(group.len(), 2);
    });

    // Chain confirms B and reports A displaced.
    chain.mine(&wallet, vec![spend_b.clone()], &[spend_a.txid()]);

    wallet.with_core(|core| {
        let loser = core.transaction(&spend_a.txid()).expect("loser").state;
        assert!(matches!(loser, TxState::Conflicted { .. }));
        assert!(core.tx_depth(&spend_a.txid(), &chain) < 0);
        let winner = core.transaction(&spend_b.txid()).expect("winner").state;
        assert!(matches!(winner, TxState::InBlock { .. }));
        // Metadata merged across the conflict group.
        let winner_pos = core.transaction(&spend_b.txid()).expect("winner").order_pos;
        let loser_pos = core.transaction(&spend_a.txid()).expect("loser").order_pos;
        assert_eq!(winner_pos, loser_pos);
    });
}

#[test]
fn encrypted_wallet_balances_without_signing() {
    let (wallet, store) = new_wallet();
    let chain = ChainSim::new();

    let address = wallet.with_core(|core| core.new_address("").expect("address"));
    let deposit = faucet_tx(0xf4, COIN, address_script(&address));
    chain.mine(&wallet, vec![deposit], &[]);
    chain.mine_until(&wallet, 6);

    wallet
        .with_core(|core| core.encrypt_wallet("abc"))
        .expect("encrypt");
    drop(wallet);

    // Restart from the same database.
    let wallet = common::TestWallet::load(
        store,
        vaultd_consensus::Network::Regtest,
        common::test_config(),
    )
    .expect("reload");
    assert_eq!(wallet.with_core(|core| core.balance(&chain)), COIN);

    let recipients = vec![Recipient {
        script_pubkey: external_script(0x77),
        amount: COIN / 4,
        subtract_fee: false,
    }];
    let control = CoinControl::default();
    let locked = wallet.create_transaction(&chain, &recipients, &control, true);
    assert!(matches!(locked, Err(WalletError::Locked)));

    assert!(matches!(
        wallet.with_core(|core| core.unlock("wrong")),
        Err(WalletError::BadPassphrase)
    ));
    wallet.with_core(|core| core.unlock("abc")).expect("unlock");
    let created = wallet
        .create_transaction(&chain, &recipients, &control, true)
        .expect("signed after unlock");
    assert!(!created.tx.inputs[0].script_sig.is_empty());
    wallet.discard_transaction(created);
}

#[test]
fn abandoned_tx_frees_inputs_then_unabandons_on_confirm() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();

    let address = wallet.with_core(|core| core.new_address("").expect("address"));
    let deposit = faucet_tx(0xf5, COIN, address_script(&address));
    let deposit_outpoint = OutPoint::new(deposit.txid(), 0);
    chain.mine(&wallet, vec![deposit], &[]);
    chain.mine_until(&wallet, 6);

    let recipients = vec![Recipient {
        script_pubkey: external_script(0x88),
        amount: COIN / 2,
        subtract_fee: false,
    }];
    let created = wallet
        .create_transaction(&chain, &recipients, &CoinControl::default(), true)
        .expect("create");
    let spend = created.tx.clone();
    let spend_txid = spend.txid();
    wallet.commit_transaction(created, &chain).expect("commit");

    // The deposit output is now encumbered.
    let selectable = wallet.with_core(|core| {
        core.available_coins(&chain)
            .iter()
            .any(|coin| coin.outpoint == deposit_outpoint)
    });
    assert!(!selectable);

    // The network forgets it; the user gives up on it.
    wallet.on_tx_removed_from_mempool(&spend_txid);
    wallet
        .with_core(|core| core.abandon_transaction(&chain, spend_txid))
        .expect("abandon");
    let selectable = wallet.with_core(|core| {
        core.available_coins(&chain)
            .iter()
            .any(|coin| coin.outpoint == deposit_outpoint)
    });
    assert!(selectable);

    // A miner had it after all: confirming un-abandons it.
    chain.mine(&wallet, vec![spend], &[]);
    let state = wallet.with_core(|core| core.transaction(&spend_txid).map(|wtx| wtx.state));
    assert!(matches!(state, Some(TxState::InBlock { .. })));
    let selectable = wallet.with_core(|core| {
        core.available_coins(&chain)
            .iter()
            .any(|coin| coin.outpoint == deposit_outpoint)
    });
    assert!(!selectable);
}

#[test]
fn abandon_refused_while_in_mempool_or_confirmed() {
    let (wallet, _store) = new_wallet();
    let chain = ChainSim::new();

    let address = wallet.with_core(|core| core.new_address("").expect("address"));
    let deposit = faucet_tx(0xf6, COIN, address_script(&address));
    let deposit_txid = deposit.txid();
    chain.mine(&wallet, vec![deposit], &[]);

    // Confirmed transactions cannot be abandoned.
    assert!(matches!(
        wallet.with_core(|core| core.abandon_transaction(&chain, deposit_txid)),
        Err(WalletError::NotAbandonable)
    ));
}
