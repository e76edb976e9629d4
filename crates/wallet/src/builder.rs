//! Transaction assembly: recipients in, selected coins and change
//! out, iterating until the fee matches the signed size.

use rand::seq::SliceRandom;
use rand::Rng;
use vaultd_consensus::{chain_params, money_range, Amount};
use vaultd_log::{log_debug, log_info};
use vaultd_primitives::transaction::{Transaction, TxIn, TxOut};
use vaultd_script::{p2pkh_script_sig, pubkey_hash_from_script_pubkey, signature_hash, SighashType};
use vaultd_storage::KeyValueStore;

use crate::balance::P2PKH_INPUT_BYTES;
use crate::chain::{BroadcastSink, ChainView};
use crate::coinselect::{
    fee_for_bytes, select_coins, CoinSelectionParams, EligibilityFilter, OutputCandidate,
};
use crate::error::WalletError;
use crate::wallet::{ReservedKey, Wallet, WalletCore};
use crate::wtx::TxState;

#[derive(Clone, Debug)]
pub struct Recipient {
    pub script_pubkey: Vec<u8>,
    pub amount: Amount,
    /// Pay this recipient's share of the fee out of its own amount.
    pub subtract_fee: bool,
}

/// Caller overrides for one build.
#[derive(Clone, Debug, Default)]
pub struct CoinControl {
    pub change_script: Option<Vec<u8>>,
    pub change_position: Option<usize>,
    /// Base units per 1000 bytes; falls back to the wallet config.
    pub fee_rate_per_kb: Option<Amount>,
}

#[derive(Debug)]
pub struct CreatedTransaction {
    pub tx: Transaction,
    pub fee: Amount,
    pub change_position: Option<usize>,
    /// Change key handle; consumed by commit, returned on drop paths.
    pub reserved_key: Option<ReservedKey>,
}

const MAX_FEE_ITERATIONS: usize = 50;
const DUMMY_SIG_SCRIPT_BYTES: usize = 107;
const CHANGE_OUTPUT_BYTES: usize = 34;
/// Version + locktime + both counts, before any inputs or outputs.
const TX_OVERHEAD_BYTES: usize = 10;

/// Spending cost triple used for the dust floor.
fn dust_threshold(fee_rate_per_kb: Amount) -> Amount {
    3 * fee_for_bytes(fee_rate_per_kb, CHANGE_OUTPUT_BYTES + P2PKH_INPUT_BYTES)
}

impl<S: KeyValueStore> WalletCore<S> {
    pub fn create_transaction(
        &mut self,
        chain: &dyn ChainView,
        recipients: &[Recipient],
        coin_control: &CoinControl,
        sign: bool,
    ) -> Result<CreatedTransaction, WalletError> {
        let mut reserved: Option<ReservedKey> = None;
        match self.build_transaction(chain, recipients, coin_control, sign, &mut reserved) {
            Ok(mut created) => {
                // A reserved change key that ended up unused goes
                // straight back to the pool.
                if created.change_position.is_none() {
                    if let Some(key) = reserved.take() {
                        self.return_key(key);
                    }
                }
                created.reserved_key = reserved;
                Ok(created)
            }
            Err(err) => {
                if let Some(key) = reserved {
                    self.return_key(key);
                }
                Err(err)
            }
        }
    }

    fn build_transaction(
        &mut self,
        chain: &dyn ChainView,
        recipients: &[Recipient],
        coin_control: &CoinControl,
        sign: bool,
        reserved: &mut Option<ReservedKey>,
    ) -> Result<CreatedTransaction, WalletError> {
        if recipients.is_empty() {
            return Err(WalletError::InvalidData("no recipients"));
        }
        let params = chain_params(self.network);
        let fee_rate = coin_control
            .fee_rate_per_kb
            .unwrap_or(self.config.pay_tx_fee_per_kb)
            .max(params.min_relay_fee_per_kb);
        let dust = dust_threshold(fee_rate);

        let mut total_requested: Amount = 0;
        let mut subtract_count = 0usize;
        for recipient in recipients {
            if recipient.amount <= 0 || !money_range(recipient.amount) {
                return Err(WalletError::InvalidData("recipient amount out of range"));
            }
            if !recipient.subtract_fee && recipient.amount < dust {
                return Err(WalletError::DustOutput);
            }
            total_requested += recipient.amount;
            if recipient.subtract_fee {
                subtract_count += 1;
            }
        }
        if !money_range(total_requested) {
            return Err(WalletError::InvalidData("total amount out of range"));
        }

        let change_script = match &coin_control.change_script {
            Some(script) => script.clone(),
            None => {
                let key = self.reserve_key(true)?;
                let script = key.script_pubkey();
                *reserved = Some(key);
                script
            }
        };

        let candidates = self.available_coins(chain);
        let selection_params = CoinSelectionParams {
            use_bnb: subtract_count == 0,
            change_output_size: CHANGE_OUTPUT_BYTES,
            change_spend_size: P2PKH_INPUT_BYTES,
            effective_fee_rate: fee_rate,
            long_term_fee_rate: self.config.long_term_fee_per_kb,
            tx_noinputs_size: TX_OVERHEAD_BYTES + CHANGE_OUTPUT_BYTES * (recipients.len() + 1),
        };

        let mut fee: Amount = 0;
        for _ in 0..MAX_FEE_ITERATIONS {
            let target = if subtract_count > 0 {
                total_requested
            } else {
                total_requested + fee
            };

            let selection = pick_coins(&candidates, target, &selection_params)
                .ok_or(WalletError::InsufficientFunds)?;

            // Lay out recipient outputs, charging fee shares where
            // requested.
            let mut outputs = Vec::with_capacity(recipients.len() + 1);
            let mut remaining_fee_share = if subtract_count > 0 { fee } else { 0 };
            let per_recipient_share = if subtract_count > 0 {
                fee / subtract_count as Amount
            } else {
                0
            };
            for recipient in recipients {
                let mut value = recipient.amount;
                if recipient.subtract_fee {
                    let share =
                        per_recipient_share + remainder_share(&mut remaining_fee_share, per_recipient_share, subtract_count);
                    value -= share;
                    if value < 0 {
                        return Err(WalletError::FeeTooHigh);
                    }
                    if value < dust {
                        return Err(WalletError::DustOutput);
                    }
                }
                outputs.push(TxOut {
                    value,
                    script_pubkey: recipient.script_pubkey.clone(),
                });
            }

            let mut change_position = None;
            let mut extra_fee: Amount = 0;
            let change_value = selection.total - target;
            if selection.changeless {
                // Branch-and-bound landed inside the no-change window;
                // the slack rides along as fee.
                extra_fee = change_value;
            } else if change_value < dust {
                extra_fee = change_value;
            } else if change_value > 0 {
                let position = coin_control
                    .change_position
                    .unwrap_or_else(|| rand::thread_rng().gen_range(0..=outputs.len()))
                    .min(outputs.len());
                outputs.insert(
                    position,
                    TxOut {
                        value: change_value,
                        script_pubkey: change_script.clone(),
                    },
                );
                change_position = Some(position);
            }

            let mut tx = Transaction::new();
            tx.inputs = selection
                .outpoints
                .iter()
                .map(|outpoint| TxIn::from_outpoint(*outpoint))
                .collect();
            tx.outputs = outputs;

            let vsize = dummy_signed_size(&tx);
            let mut needed_fee = fee_for_bytes(fee_rate, vsize)
                .max(fee_for_bytes(params.min_relay_fee_per_kb, vsize));
            if needed_fee > params.max_tx_fee {
                return Err(WalletError::FeeTooHigh);
            }
            // Fee absorbed from dropped or windowed change counts
            // toward the requirement.
            needed_fee = needed_fee.saturating_sub(extra_fee);

            if fee >= needed_fee {
                let paid_fee = fee + extra_fee;
                tx.inputs.shuffle(&mut rand::thread_rng());
                if sign {
                    self.sign_transaction(&mut tx)?;
                }
                log_debug!(
                    "built transaction: {} in, {} out, fee {}",
                    tx.inputs.len(),
                    tx.outputs.len(),
                    paid_fee
                );
                return Ok(CreatedTransaction {
                    tx,
                    fee: paid_fee,
                    change_position,
                    reserved_key: None,
                });
            }
            fee = needed_fee;
        }
        Err(WalletError::FeeEstimationFailed)
    }

    /// Fills real signatures for every input we own.
    pub fn sign_transaction(&mut self, tx: &mut Transaction) -> Result<(), WalletError> {
        self.keystore
            .maybe_relock(crate::wallet::current_unix_seconds());
        let prev_scripts: Vec<Vec<u8>> = tx
            .inputs
            .iter()
            .map(|input| {
                self.transaction(&input.prevout.txid)
                    .and_then(|parent| parent.tx.outputs.get(input.prevout.vout as usize))
                    .map(|out| out.script_pubkey.clone())
                    .ok_or(WalletError::SigningFailed("unknown previous output"))
            })
            .collect::<Result<_, _>>()?;

        for (index, prev_script) in prev_scripts.iter().enumerate() {
            let key_id = pubkey_hash_from_script_pubkey(prev_script)
                .ok_or(WalletError::SigningFailed("unsupported script type"))?;
            let secret = self.keystore.secret_key(&key_id)?;
            let pubkey = self
                .keystore
                .pubkey_bytes(&key_id)
                .ok_or(WalletError::SigningFailed("missing pubkey"))?
                .to_vec();

            let sighash = signature_hash(tx, index, prev_script, SighashType::all())
                .map_err(|_| WalletError::SigningFailed("sighash computation failed"))?;
            let message = secp256k1::Message::from_digest(sighash);
            let signature = vaultd_script::secp256k1_ctx().sign_ecdsa(&message, &secret);
            let mut signature_bytes = signature.serialize_der().to_vec();
            signature_bytes.push(SighashType::all().0 as u8);

            tx.inputs[index].script_sig = p2pkh_script_sig(&signature_bytes, &pubkey);
        }
        Ok(())
    }
}

/// Progressive relaxation: insist on settled coins first, then accept
/// our own pending change, then anything with one confirmation.
fn pick_coins(
    candidates: &[OutputCandidate],
    target: Amount,
    params: &CoinSelectionParams,
) -> Option<crate::coinselect::Selection> {
    const FILTERS: [EligibilityFilter; 3] = [
        EligibilityFilter::new(1, 6, 0),
        EligibilityFilter::new(1, 1, 0),
        EligibilityFilter::new(0, 1, 25),
    ];
    for filter in FILTERS {
        let eligible: Vec<OutputCandidate> = candidates
            .iter()
            .filter(|candidate| filter.accepts(candidate))
            .cloned()
            .collect();
        if eligible.is_empty() {
            continue;
        }
        if let Some(selection) = select_coins(&eligible, target, params) {
            return Some(selection);
        }
    }
    None
}

fn remainder_share(remaining: &mut Amount, per_share: Amount, count: usize) -> Amount {
    // The first subtract-fee recipient also absorbs the rounding
    // remainder.
    let remainder = *remaining - per_share * count as Amount;
    if remainder > 0 {
        *remaining -= remainder;
        remainder
    } else {
        0
    }
}

/// Serialized size assuming worst-case signatures on every input.
fn dummy_signed_size(tx: &Transaction) -> usize {
    let mut dummy = tx.clone();
    for input in &mut dummy.inputs {
        input.script_sig = vec![0u8; DUMMY_SIG_SCRIPT_BYTES];
    }
    dummy.serialized_size()
}

impl<S: KeyValueStore> Wallet<S> {
    pub fn create_transaction(
        &self,
        chain: &dyn ChainView,
        recipients: &[Recipient],
        coin_control: &CoinControl,
        sign: bool,
    ) -> Result<CreatedTransaction, WalletError> {
        self.with_core(|core| core.create_transaction(chain, recipients, coin_control, sign))
    }

    /// Persists the built transaction, consumes the change key, and
    /// hands the raw transaction to the broadcast sink. The sink is
    /// only called after the wallet lock is released.
    pub fn commit_transaction(
        &self,
        created: CreatedTransaction,
        sink: &dyn BroadcastSink,
    ) -> Result<(), WalletError> {
        let CreatedTransaction {
            tx, reserved_key, ..
        } = created;
        let txid = tx.txid();

        self.with_core(|core| -> Result<(), WalletError> {
            core.add_if_involves_me(&tx, TxState::Unconfirmed, None, None, true);
            if let Some(wtx) = core.txs.get_mut(&txid) {
                wtx.from_me = true;
            }
            if let Some(key) = reserved_key {
                core.keep_key(&key)?;
            }
            core.flush(false)?;
            Ok(())
        })?;

        let accepted = sink.accept_to_memory_pool(&tx, i64::MAX).is_ok();
        if accepted {
            sink.broadcast(&tx);
        }
        self.with_core(|core| {
            if let Some(wtx) = core.txs.get_mut(&txid) {
                wtx.in_mempool = accepted;
            }
        });
        log_info!(
            "committed wallet transaction {}",
            vaultd_consensus::hash256_to_hex(&txid)
        );
        Ok(())
    }

    /// Drops an unwanted build result, returning its change key.
    pub fn discard_transaction(&self, created: CreatedTransaction) {
        if let Some(key) = created.reserved_key {
            self.with_core(|core| core.return_key(key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dust_threshold_scales_with_rate() {
        assert_eq!(dust_threshold(0), 0);
        let at_1000 = dust_threshold(1000);
        let at_2000 = dust_threshold(2000);
        assert!(at_1000 > 0);
        assert_eq!(at_2000, at_1000 * 2);
    }

    #[test]
    fn dummy_size_counts_signatures() {
        use vaultd_primitives::outpoint::OutPoint;
        let mut tx = Transaction::new();
        tx.inputs = vec![
            TxIn::from_outpoint(OutPoint::new([1u8; 32], 0)),
            TxIn::from_outpoint(OutPoint::new([1u8; 32], 1)),
        ];
        tx.outputs = vec![TxOut {
            value: 1,
            script_pubkey: vec![0u8; 25],
        }];
        let bare = tx.serialized_size();
        let dummy = dummy_signed_size(&tx);
        assert_eq!(dummy, bare + 2 * DUMMY_SIG_SCRIPT_BYTES);
    }
}
