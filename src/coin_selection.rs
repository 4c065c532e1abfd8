// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::error::Error;
use crate::types::Utxo;

/// Chooses the UTXOs funding a transaction.
///
/// Among the UTXOs with at least `min_confirmations` confirmations, in order of preference:
/// 1. the smallest single UTXO worth between `target + fee` and `target + fee + dust_limit`,
///    which needs no change output,
/// 2. the smallest single UTXO worth more than `target + fee + dust_limit`,
/// 3. the largest UTXOs, accumulated until they are worth more than
///    `target + fee + dust_limit` or run out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct CoinSelector {
	pub(crate) min_confirmations: u32,
	pub(crate) dust_limit_sats: u64,
}

impl CoinSelector {
	pub(crate) fn new(min_confirmations: u32, dust_limit_sats: u64) -> Self {
		Self { min_confirmations, dust_limit_sats }
	}

	pub(crate) fn select(
		&self, utxos: &[Utxo], target_sats: u64, fee_sats: u64,
	) -> Result<Vec<Utxo>, Error> {
		let needed = target_sats.checked_add(fee_sats).ok_or(Error::InsufficientFunds)?;
		let needed_with_change = needed.saturating_add(self.dust_limit_sats);

		let mut eligible: Vec<&Utxo> =
			utxos.iter().filter(|u| u.confirmations >= self.min_confirmations).collect();
		eligible.sort_by_key(|u| u.amount_sats);

		if let Some(utxo) = eligible
			.iter()
			.find(|u| u.amount_sats >= needed && u.amount_sats <= needed_with_change)
		{
			return Ok(vec![(*utxo).clone()]);
		}

		if let Some(utxo) = eligible.iter().find(|u| u.amount_sats > needed_with_change) {
			return Ok(vec![(*utxo).clone()]);
		}

		let mut selected = Vec::new();
		let mut selected_sats = 0u64;
		for utxo in eligible.iter().rev() {
			selected_sats += utxo.amount_sats;
			selected.push((*utxo).clone());
			if selected_sats > needed_with_change {
				break;
			}
		}

		if selected_sats < needed {
			return Err(Error::InsufficientFunds);
		}
		Ok(selected)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::hashes::Hash;
	use bitcoin::{OutPoint, ScriptBuf, Txid, WPubkeyHash};
	use proptest::prelude::*;

	fn utxo(n: u8, amount_sats: u64, confirmations: u32) -> Utxo {
		Utxo {
			outpoint: OutPoint { txid: Txid::from_byte_array([n; 32]), vout: n as u32 },
			amount_sats,
			address: String::new(),
			script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20])),
			confirmations,
		}
	}

	fn amounts(selected: &[Utxo]) -> Vec<u64> {
		selected.iter().map(|u| u.amount_sats).collect()
	}

	#[test]
	fn prefers_exact_match_without_change() {
		let selector = CoinSelector::new(3, 1000);
		let utxos = vec![utxo(1, 200_000, 6), utxo(2, 50_500, 6), utxo(3, 60_000, 6)];
		let selected = selector.select(&utxos, 50_000, 300).unwrap();
		assert_eq!(amounts(&selected), vec![50_500]);
	}

	#[test]
	fn prefers_smallest_single_utxo_with_change() {
		let selector = CoinSelector::new(3, 546);
		let utxos = vec![utxo(1, 500_000, 6), utxo(2, 100_000, 6), utxo(3, 10_000, 6)];
		let selected = selector.select(&utxos, 50_000, 246).unwrap();
		assert_eq!(amounts(&selected), vec![100_000]);
	}

	#[test]
	fn accumulates_largest_first() {
		let selector = CoinSelector::new(3, 546);
		let utxos = vec![utxo(1, 10_000, 6), utxo(2, 30_000, 6), utxo(3, 20_000, 6), utxo(4, 5_000, 6)];
		let selected = selector.select(&utxos, 45_000, 500).unwrap();
		assert_eq!(amounts(&selected), vec![30_000, 20_000]);
	}

	#[test]
	fn accepts_accumulated_sum_within_dust_range() {
		let selector = CoinSelector::new(3, 1000);
		let utxos = vec![utxo(1, 30_000, 6), utxo(2, 20_200, 6)];
		let selected = selector.select(&utxos, 50_000, 100).unwrap();
		assert_eq!(amounts(&selected), vec![30_000, 20_200]);
	}

	#[test]
	fn skips_insufficiently_confirmed_utxos() {
		let selector = CoinSelector::new(3, 546);
		let utxos = vec![utxo(1, 100_000, 2), utxo(2, 100_000, 3)];
		let selected = selector.select(&utxos, 50_000, 200).unwrap();
		assert_eq!(selected[0].outpoint, utxos[1].outpoint);

		let utxos = vec![utxo(1, 100_000, 0), utxo(2, 100_000, 2)];
		assert_eq!(selector.select(&utxos, 50_000, 200), Err(Error::InsufficientFunds));
	}

	#[test]
	fn fails_when_funds_are_short() {
		let selector = CoinSelector::new(3, 546);
		let utxos = vec![utxo(1, 10_000, 6), utxo(2, 20_000, 6)];
		assert_eq!(selector.select(&utxos, 30_000, 1), Err(Error::InsufficientFunds));
		assert_eq!(selector.select(&[], 1, 1), Err(Error::InsufficientFunds));
		assert_eq!(selector.select(&utxos, u64::MAX, 1), Err(Error::InsufficientFunds));
	}

	proptest! {
		#[test]
		fn selection_covers_target_or_fails(
			coins in prop::collection::vec((1u64..2_000_000, 0u32..10), 0..12),
			target in 1u64..3_000_000,
			fee in 0u64..50_000,
			dust in 0u64..2_000,
		) {
			let utxos: Vec<Utxo> = coins
				.iter()
				.enumerate()
				.map(|(i, (amount, confs))| utxo(i as u8, *amount, *confs))
				.collect();
			let selector = CoinSelector::new(3, dust);

			match selector.select(&utxos, target, fee) {
				Ok(selected) => {
					let total: u64 = selected.iter().map(|u| u.amount_sats).sum();
					prop_assert!(total >= target + fee);
					prop_assert!(selected.iter().all(|u| u.confirmations >= 3));
				},
				Err(e) => {
					prop_assert_eq!(e, Error::InsufficientFunds);
					let eligible: u64 =
						utxos.iter().filter(|u| u.confirmations >= 3).map(|u| u.amount_sats).sum();
					prop_assert!(eligible < target + fee);
				},
			}
		}

		#[test]
		fn single_utxo_in_dust_range_is_selected_alone(
			others in prop::collection::vec(1u64..2_000_000, 0..8),
			target in 1u64..1_000_000,
			fee in 0u64..10_000,
			dust in 0u64..2_000,
			slack in 0u64..2_000,
		) {
			let exact = target + fee + slack.min(dust);
			let mut utxos: Vec<Utxo> = others
				.iter()
				.enumerate()
				.filter(|(_, amount)| **amount < target + fee || **amount > target + fee + dust)
				.map(|(i, amount)| utxo(i as u8 + 1, *amount, 6))
				.collect();
			utxos.push(utxo(0, exact, 6));

			let selected = selector_for(dust).select(&utxos, target, fee).unwrap();
			prop_assert_eq!(selected.len(), 1);
			prop_assert_eq!(selected[0].amount_sats, exact);
		}
	}

	fn selector_for(dust: u64) -> CoinSelector {
		CoinSelector::new(3, dust)
	}
}
