// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! The wallets able to fund channels.
//!
//! Every wallet offers the same capabilities: listing a sufficient set of UTXOs, handing out
//! a fresh change address and signing a transaction spending UTXOs it listed. Which of these
//! are actually supported depends on the kind of wallet.

mod external;
mod internal;
mod node;

pub(crate) use external::ExternalWallet;
pub use internal::InternalWallet;
pub(crate) use node::NodeWallet;

use crate::config::WalletKind;
use crate::error::Error;
use crate::types::Utxo;

use bitcoin::{OutPoint, Transaction};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub(crate) enum Wallet {
	Node(NodeWallet),
	Internal(Arc<InternalWallet>),
	External(ExternalWallet),
}

impl Wallet {
	pub(crate) fn kind(&self) -> WalletKind {
		match self {
			Wallet::Node(_) => WalletKind::Node,
			Wallet::Internal(_) => WalletKind::Internal,
			Wallet::External(_) => WalletKind::External,
		}
	}

	/// Selects UTXOs worth at least `amount_sats + fee_sats` that no other funding run holds,
	/// leasing them until the returned [`UtxoLease`] is dropped.
	pub(crate) async fn utxos(
		&self, amount_sats: u64, fee_sats: u64, leases: &Arc<UtxoLeases>,
	) -> Result<(Vec<Utxo>, UtxoLease), Error> {
		match self {
			Wallet::Node(wallet) => {
				let candidates = wallet.spendable_utxos().await?;
				leases.lease_selection(candidates, |available| {
					wallet.selector().select(available, amount_sats, fee_sats)
				})
			},
			Wallet::Internal(wallet) => {
				let candidates = wallet.spendable_utxos().await?;
				leases.lease_selection(candidates, |available| {
					wallet.selector().select(available, amount_sats, fee_sats)
				})
			},
			Wallet::External(wallet) => wallet.unsupported("listing UTXOs"),
		}
	}

	pub(crate) async fn change_address(&self) -> Result<String, Error> {
		match self {
			Wallet::Node(wallet) => wallet.change_address().await,
			Wallet::Internal(wallet) => wallet.new_address().map(|a| a.to_string()),
			Wallet::External(wallet) => wallet.unsupported("handing out change addresses"),
		}
	}

	/// Signs every input of `tx`. `utxos` has to describe exactly the outputs `tx` spends.
	pub(crate) async fn sign(&self, tx: Transaction, utxos: &[Utxo]) -> Result<Transaction, Error> {
		match self {
			Wallet::Node(wallet) => wallet.sign(tx, utxos).await,
			Wallet::Internal(wallet) => wallet.sign(tx, utxos),
			Wallet::External(wallet) => wallet.unsupported("signing"),
		}
	}

	/// Lets the wallet account for a transaction it funded having been broadcast.
	pub(crate) fn transaction_broadcast(&self, tx: &Transaction) -> Result<(), Error> {
		match self {
			Wallet::Internal(wallet) => wallet.transaction_broadcast(tx),
			Wallet::Node(_) | Wallet::External(_) => Ok(()),
		}
	}
}

/// Looks up the UTXO spent by every input of `tx`, failing if `utxos` lacks one.
pub(crate) fn utxos_for_inputs<'a>(
	tx: &Transaction, utxos: &'a [Utxo],
) -> Result<Vec<&'a Utxo>, OutPoint> {
	tx.input
		.iter()
		.map(|txin| {
			utxos.iter().find(|u| u.outpoint == txin.previous_output).ok_or(txin.previous_output)
		})
		.collect()
}

/// The outpoints currently selected by in-flight funding runs.
///
/// Funding runs never share their plans, but they draw from the same wallet. Leasing the
/// selected outpoints keeps two concurrent runs from spending the same coins.
#[derive(Default)]
pub(crate) struct UtxoLeases {
	leased: Mutex<HashSet<OutPoint>>,
}

impl UtxoLeases {
	/// Runs `select` over the candidates not currently leased and leases its selection.
	pub(crate) fn lease_selection<F>(
		self: &Arc<Self>, candidates: Vec<Utxo>, select: F,
	) -> Result<(Vec<Utxo>, UtxoLease), Error>
	where
		F: FnOnce(&[Utxo]) -> Result<Vec<Utxo>, Error>,
	{
		let mut leased = self.leased.lock().unwrap();
		let available: Vec<Utxo> =
			candidates.into_iter().filter(|u| !leased.contains(&u.outpoint)).collect();
		let selected = select(&available)?;

		let outpoints: Vec<OutPoint> = selected.iter().map(|u| u.outpoint).collect();
		leased.extend(outpoints.iter().copied());
		Ok((selected, UtxoLease { leases: Arc::clone(self), outpoints }))
	}

	#[cfg(test)]
	pub(crate) fn is_leased(&self, outpoint: &OutPoint) -> bool {
		self.leased.lock().unwrap().contains(outpoint)
	}
}

/// Releases the leased outpoints when dropped.
pub(crate) struct UtxoLease {
	leases: Arc<UtxoLeases>,
	outpoints: Vec<OutPoint>,
}

impl Drop for UtxoLease {
	fn drop(&mut self) {
		let mut leased = self.leases.leased.lock().unwrap();
		for outpoint in &self.outpoints {
			leased.remove(outpoint);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coin_selection::CoinSelector;

	use bitcoin::hashes::Hash;
	use bitcoin::{ScriptBuf, Txid};

	fn utxo(n: u8, amount_sats: u64) -> Utxo {
		Utxo {
			outpoint: OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 },
			amount_sats,
			address: String::new(),
			script_pubkey: ScriptBuf::new(),
			confirmations: 10,
		}
	}

	#[test]
	fn leased_utxos_are_skipped_until_released() {
		let leases = Arc::new(UtxoLeases::default());
		let selector = CoinSelector::new(3, 546);
		let candidates = vec![utxo(1, 100_000), utxo(2, 100_000)];

		let (first, first_lease) = leases
			.lease_selection(candidates.clone(), |a| selector.select(a, 50_000, 200))
			.unwrap();
		let (second, second_lease) = leases
			.lease_selection(candidates.clone(), |a| selector.select(a, 50_000, 200))
			.unwrap();
		assert_ne!(first[0].outpoint, second[0].outpoint);
		assert!(leases.is_leased(&first[0].outpoint));

		assert_eq!(
			leases
				.lease_selection(candidates.clone(), |a| selector.select(a, 50_000, 200))
				.err(),
			Some(Error::InsufficientFunds)
		);

		drop(first_lease);
		assert!(!leases.is_leased(&first[0].outpoint));
		let (third, _third_lease) =
			leases.lease_selection(candidates, |a| selector.select(a, 50_000, 200)).unwrap();
		assert_eq!(third[0].outpoint, first[0].outpoint);
		drop(second_lease);
	}

	#[test]
	fn inputs_must_be_described() {
		let utxos = vec![utxo(1, 1_000), utxo(2, 2_000)];
		let tx = Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: vec![
				bitcoin::TxIn { previous_output: utxos[1].outpoint, ..Default::default() },
				bitcoin::TxIn { previous_output: utxos[0].outpoint, ..Default::default() },
			],
			output: vec![],
		};
		let found = utxos_for_inputs(&tx, &utxos).unwrap();
		assert_eq!(found[0].amount_sats, 2_000);
		assert_eq!(utxos_for_inputs(&tx, &utxos[..1]).err(), Some(utxos[1].outpoint));
	}
}
