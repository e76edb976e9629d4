//! Coin selection: branch-and-bound for changeless matches, with a
//! stochastic knapsack fallback.

use rand::seq::SliceRandom;
use rand::thread_rng;
use vaultd_consensus::Amount;
use vaultd_primitives::outpoint::OutPoint;
use vaultd_primitives::transaction::TxOut;

/// A spendable candidate output presented to the selector.
#[derive(Clone, Debug)]
pub struct OutputCandidate {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub depth: i32,
    pub spendable: bool,
    pub solvable: bool,
    /// Safe to spend: confirmed, or an unconfirmed output of a
    /// trusted self-send.
    pub safe: bool,
    pub from_me: bool,
    /// Unconfirmed ancestor count of the parent transaction.
    pub ancestors: usize,
    /// Serialized size of an input spending this output.
    pub input_bytes: usize,
}

impl OutputCandidate {
    /// Output value minus the cost of spending it at `fee_rate`.
    pub fn effective_value(&self, fee_rate: Amount) -> Amount {
        self.txout.value - fee_for_bytes(fee_rate, self.input_bytes)
    }
}

/// Confirmation/ancestry requirements a candidate must meet.
#[derive(Clone, Copy, Debug)]
pub struct EligibilityFilter {
    pub conf_mine: i32,
    pub conf_theirs: i32,
    pub max_ancestors: usize,
    /// Accept outputs of untrusted unconfirmed parents.
    pub allow_unsafe: bool,
}

impl EligibilityFilter {
    pub const fn new(conf_mine: i32, conf_theirs: i32, max_ancestors: usize) -> Self {
        Self {
            conf_mine,
            conf_theirs,
            max_ancestors,
            allow_unsafe: false,
        }
    }

    pub fn accepts(&self, candidate: &OutputCandidate) -> bool {
        if !candidate.spendable {
            return false;
        }
        if !candidate.safe && !self.allow_unsafe {
            return false;
        }
        let required = if candidate.from_me {
            self.conf_mine
        } else {
            self.conf_theirs
        };
        candidate.depth >= required && candidate.ancestors <= self.max_ancestors
    }
}

/// Size/fee knobs for one selection round.
#[derive(Clone, Copy, Debug)]
pub struct CoinSelectionParams {
    pub use_bnb: bool,
    pub change_output_size: usize,
    pub change_spend_size: usize,
    /// Base units per 1000 bytes.
    pub effective_fee_rate: Amount,
    pub long_term_fee_rate: Amount,
    pub tx_noinputs_size: usize,
}

impl CoinSelectionParams {
    /// Fee to create the change output now plus the fee to spend it
    /// later: the window above target where no change is preferable.
    pub fn cost_of_change(&self) -> Amount {
        fee_for_bytes(self.effective_fee_rate, self.change_output_size)
            + fee_for_bytes(self.long_term_fee_rate, self.change_spend_size)
    }
}

pub fn fee_for_bytes(fee_rate_per_kb: Amount, bytes: usize) -> Amount {
    fee_rate_per_kb.saturating_mul(bytes as Amount) / 1000
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub outpoints: Vec<OutPoint>,
    pub total: Amount,
    /// True when the branch-and-bound pass produced the set, meaning
    /// no change output is needed.
    pub changeless: bool,
}

const BNB_NODE_BUDGET: usize = 100_000;
const KNAPSACK_ROUNDS: usize = 1000;

/// Depth-first search over inclusion/exclusion of each candidate,
/// looking for a subset whose effective value lands inside
/// `[target, target + cost_of_change]`.
pub fn select_coins_bnb(
    candidates: &[OutputCandidate],
    target: Amount,
    params: &CoinSelectionParams,
) -> Option<Selection> {
    let cost_of_change = params.cost_of_change();
    let upper_bound = target.checked_add(cost_of_change)?;

    // Work on effective values, largest first.
    let mut pool: Vec<(usize, Amount)> = candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| (index, candidate.effective_value(params.effective_fee_rate)))
        .filter(|(_, value)| *value > 0)
        .collect();
    pool.sort_by(|a, b| b.1.cmp(&a.1));

    let mut remaining: Amount = pool.iter().map(|(_, value)| value).sum();
    if remaining < target {
        return None;
    }

    let mut selected: Vec<bool> = vec![false; pool.len()];
    let mut best: Option<(Vec<bool>, Amount)> = None;
    let mut current: Amount = 0;
    let mut depth = 0usize;
    let mut nodes = 0usize;
    let mut backtrack;

    loop {
        nodes += 1;
        if nodes > BNB_NODE_BUDGET {
            break;
        }

        backtrack = false;
        if current + remaining < target || current > upper_bound {
            // This subtree cannot land in the window.
            backtrack = true;
        } else if current >= target {
            let better = match &best {
                Some((_, best_total)) => current < *best_total,
                None => true,
            };
            if better {
                best = Some((selected.clone(), current));
            }
            backtrack = true;
        } else if depth >= pool.len() {
            backtrack = true;
        } else {
            // Explore inclusion of the next candidate.
            remaining -= pool[depth].1;
            current += pool[depth].1;
            selected[depth] = true;
            depth += 1;
            continue;
        }

        if backtrack {
            // Walk back to the most recent inclusion and flip it to
            // an exclusion.
            while depth > 0 && !selected[depth - 1] {
                depth -= 1;
                remaining += pool[depth].1;
            }
            if depth == 0 {
                break;
            }
            depth -= 1;
            selected[depth] = false;
            current -= pool[depth].1;
            depth += 1;
        }
    }

    let (chosen, _) = best?;
    let mut outpoints = Vec::new();
    let mut total = 0;
    for (slot, taken) in chosen.iter().enumerate() {
        if *taken {
            let (index, _) = pool[slot];
            outpoints.push(candidates[index].outpoint);
            total += candidates[index].txout.value;
        }
    }
    Some(Selection {
        outpoints,
        total,
        changeless: true,
    })
}

/// Randomized greedy fallback: shuffle, fill to the target, keep the
/// round with the least excess.
pub fn select_coins_knapsack(candidates: &[OutputCandidate], target: Amount) -> Option<Selection> {
    let total_available: Amount = candidates.iter().map(|candidate| candidate.txout.value).sum();
    if total_available < target {
        return None;
    }

    // An exact single coin beats any combination.
    if let Some(exact) = candidates
        .iter()
        .find(|candidate| candidate.txout.value == target)
    {
        return Some(Selection {
            outpoints: vec![exact.outpoint],
            total: target,
            changeless: false,
        });
    }

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    let mut rng = thread_rng();
    let mut best: Option<(Vec<usize>, Amount)> = None;

    for _ in 0..KNAPSACK_ROUNDS {
        order.shuffle(&mut rng);
        let mut picked = Vec::new();
        let mut sum: Amount = 0;
        for &index in &order {
            picked.push(index);
            sum += candidates[index].txout.value;
            if sum >= target {
                break;
            }
        }
        if sum < target {
            continue;
        }
        let better = match &best {
            Some((_, best_sum)) => sum < *best_sum,
            None => true,
        };
        if better {
            best = Some((picked.clone(), sum));
        }
        if sum == target {
            break;
        }
    }

    let (picked, total) = match best {
        Some(found) => found,
        // Greedy rounds never failed with enough total value, but
        // keep the degenerate fallback of spending everything.
        None => (
            (0..candidates.len()).collect(),
            total_available,
        ),
    };

    // Prefer the single smallest coin covering the target over a
    // multi-coin set with a larger excess.
    let single = candidates
        .iter()
        .filter(|candidate| candidate.txout.value >= target)
        .min_by_key(|candidate| candidate.txout.value);
    if let Some(single) = single {
        if picked.len() > 1 && single.txout.value <= total {
            return Some(Selection {
                outpoints: vec![single.outpoint],
                total: single.txout.value,
                changeless: false,
            });
        }
    }

    Some(Selection {
        outpoints: picked
            .into_iter()
            .map(|index| candidates[index].outpoint)
            .collect(),
        total,
        changeless: false,
    })
}

/// One full selection round over an already filtered candidate set.
pub fn select_coins(
    candidates: &[OutputCandidate],
    target: Amount,
    params: &CoinSelectionParams,
) -> Option<Selection> {
    if params.use_bnb {
        let bnb_target = target + fee_for_bytes(params.effective_fee_rate, params.tx_noinputs_size);
        if let Some(selection) = select_coins_bnb(candidates, bnb_target, params) {
            return Some(selection);
        }
    }
    select_coins_knapsack(candidates, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(value: Amount, index: u32) -> OutputCandidate {
        OutputCandidate {
            outpoint: OutPoint::new([0xaa; 32], index),
            txout: TxOut {
                value,
                script_pubkey: vec![0x76, 0xa9],
            },
            depth: 6,
            spendable: true,
            solvable: true,
            safe: true,
            from_me: true,
            ancestors: 0,
            input_bytes: 148,
        }
    }

    fn zero_fee_params() -> CoinSelectionParams {
        CoinSelectionParams {
            use_bnb: true,
            change_output_size: 34,
            change_spend_size: 148,
            effective_fee_rate: 0,
            long_term_fee_rate: 0,
            tx_noinputs_size: 10,
        }
    }

    #[test]
    fn bnb_finds_exact_match() {
        let coins: Vec<OutputCandidate> = [1_000, 3_000, 5_000]
            .iter()
            .enumerate()
            .map(|(index, value)| candidate(*value, index as u32))
            .collect();
        let selection = select_coins_bnb(&coins, 4_000, &zero_fee_params()).expect("select");
        assert!(selection.changeless);
        assert_eq!(selection.total, 4_000);
        assert_eq!(selection.outpoints.len(), 2);
    }

    #[test]
    fn bnb_respects_window() {
        let mut params = zero_fee_params();
        params.effective_fee_rate = 1000;
        params.long_term_fee_rate = 1000;
        let coins: Vec<OutputCandidate> = [50_000, 30_000, 20_000]
            .iter()
            .enumerate()
            .map(|(index, value)| candidate(*value, index as u32))
            .collect();
        let target = 49_000;
        let selection = select_coins_bnb(&coins, target, &params).expect("select");
        let window = target + params.cost_of_change();
        let effective: Amount = selection
            .outpoints
            .iter()
            .map(|outpoint| {
                coins
                    .iter()
                    .find(|coin| coin.outpoint == *outpoint)
                    .expect("selected coin")
                    .effective_value(params.effective_fee_rate)
            })
            .sum();
        assert!(effective >= target);
        assert!(effective <= window);
    }

    #[test]
    fn bnb_gives_up_without_match() {
        // Nothing sums into [9_999, 9_999 + 0].
        let coins: Vec<OutputCandidate> = [5_000, 6_000]
            .iter()
            .enumerate()
            .map(|(index, value)| candidate(*value, index as u32))
            .collect();
        assert!(select_coins_bnb(&coins, 9_999, &zero_fee_params()).is_none());
    }

    #[test]
    fn knapsack_minimizes_excess() {
        let coins: Vec<OutputCandidate> = [10_000, 7_000, 2_500]
            .iter()
            .enumerate()
            .map(|(index, value)| candidate(*value, index as u32))
            .collect();
        let selection = select_coins_knapsack(&coins, 9_000).expect("select");
        assert!(selection.total >= 9_000);
        // The single 10_000 coin dominates any pair.
        assert_eq!(selection.total, 10_000);
        assert_eq!(selection.outpoints.len(), 1);
    }

    #[test]
    fn knapsack_insufficient_funds() {
        let coins = vec![candidate(1_000, 0)];
        assert!(select_coins_knapsack(&coins, 2_000).is_none());
    }

    #[test]
    fn eligibility_filter_depth_rules() {
        let filter = EligibilityFilter::new(1, 6, 10);
        let mut mine = candidate(1_000, 0);
        mine.depth = 1;
        assert!(filter.accepts(&mine));

        let mut theirs = candidate(1_000, 1);
        theirs.from_me = false;
        theirs.depth = 1;
        assert!(!filter.accepts(&theirs));
        theirs.depth = 6;
        assert!(filter.accepts(&theirs));
    }

    #[test]
    fn eligibility_filter_unsafe_and_ancestors() {
        let filter = EligibilityFilter::new(0, 0, 2);
        let mut coin = candidate(1_000, 0);
        coin.depth = 0;
        coin.ancestors = 3;
        assert!(!filter.accepts(&coin));
        coin.ancestors = 2;
        assert!(filter.accepts(&coin));
        coin.safe = false;
        assert!(!filter.accepts(&coin));
    }

    #[test]
    fn selection_covers_eligible_only() {
        let filter = EligibilityFilter::new(1, 6, 10);
        let mut coins: Vec<OutputCandidate> = [4_000, 5_000]
            .iter()
            .enumerate()
            .map(|(index, value)| candidate(*value, index as u32))
            .collect();
        coins[1].depth = 0;
        let eligible: Vec<OutputCandidate> = coins
            .iter()
            .filter(|coin| filter.accepts(coin))
            .cloned()
            .collect();
        let selection =
            select_coins(&eligible, 3_000, &zero_fee_params()).expect("select");
        assert!(selection
            .outpoints
            .iter()
            .all(|outpoint| *outpoint == coins[0].outpoint));
    }
}
