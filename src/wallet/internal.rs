// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use super::utxos_for_inputs;
use crate::chain::ChainSource;
use crate::coin_selection::CoinSelector;
use crate::error::Error;
use crate::io::sqlite_store::{StoredOutput, WalletStore};
use crate::logger::{log_debug, log_error, log_info, Logger};
use crate::signer::{KeysManager, SigningInput};
use crate::types::Utxo;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, Txid};

use std::sync::{Arc, Mutex};

/// A wallet holding keys derived from the peer daemon's root secret.
///
/// Outputs become known to the wallet through [`InternalWallet::import_transaction`] and
/// through the change of funding transactions it signed. Their key indexes, scripts and the
/// raw transactions are kept in the [`WalletStore`].
pub struct InternalWallet {
	chain_source: Arc<dyn ChainSource>,
	store: Arc<WalletStore>,
	keys_manager: KeysManager,
	selector: CoinSelector,
	network: Network,
	// Serializes handing out key indexes.
	address_lock: Mutex<()>,
	logger: Arc<Logger>,
}

impl InternalWallet {
	pub(crate) fn new(
		chain_source: Arc<dyn ChainSource>, store: Arc<WalletStore>, keys_manager: KeysManager,
		selector: CoinSelector, network: Network, logger: Arc<Logger>,
	) -> Self {
		let address_lock = Mutex::new(());
		Self { chain_source, store, keys_manager, selector, network, address_lock, logger }
	}

	pub(crate) fn selector(&self) -> &CoinSelector {
		&self.selector
	}

	fn persistence_failed(&self, e: std::io::Error) -> Error {
		log_error!(self.logger, "Failed to access wallet store: {}", e);
		Error::PersistenceFailed
	}

	// Derives the next key and records both its native and its wrapped script.
	fn next_key(&self) -> Result<u32, Error> {
		let _guard = self.address_lock.lock().unwrap();
		let key_index = self.store.next_key_index().map_err(|e| self.persistence_failed(e))?;
		let native = self.keys_manager.p2wpkh_script(key_index)?;
		let wrapped = ScriptBuf::new_p2sh(&native.script_hash());
		self.store.insert_address(key_index, &native).map_err(|e| self.persistence_failed(e))?;
		self.store.insert_address(key_index, &wrapped).map_err(|e| self.persistence_failed(e))?;
		Ok(key_index)
	}

	/// Returns a fresh, never used P2WPKH address.
	pub fn new_address(&self) -> Result<Address, Error> {
		let key_index = self.next_key()?;
		let address = self.keys_manager.p2wpkh_address(key_index)?;
		log_debug!(self.logger, "Handing out address {} for key {}", address, key_index);
		Ok(address)
	}

	/// Returns a fresh, never used P2SH-wrapped P2WPKH address.
	pub fn new_nested_address(&self) -> Result<Address, Error> {
		let key_index = self.next_key()?;
		let native = self.keys_manager.p2wpkh_script(key_index)?;
		let wrapped = ScriptBuf::new_p2sh(&native.script_hash());
		Address::from_script(&wrapped, self.network).map_err(|e| {
			log_error!(self.logger, "Failed to encode nested address: {}", e);
			Error::InvalidAddress
		})
	}

	/// Fetches the transaction `txid` from the node and records every output paying to one of
	/// our addresses. Returns the number of outputs recorded.
	pub async fn import_transaction(&self, txid: &Txid) -> Result<usize, Error> {
		let (tx, confirmations) = self.chain_source.get_raw_transaction(txid).await?;
		let confirmation_height = if confirmations > 0 {
			let tip = self.chain_source.get_block_count().await?;
			Some((tip + 1).saturating_sub(confirmations))
		} else {
			None
		};

		let recorded = self.record_transaction(&tx, confirmation_height)?;
		log_info!(
			self.logger,
			"Imported {} output(s) of transaction {} with {} confirmation(s)",
			recorded,
			txid,
			confirmations
		);
		Ok(recorded)
	}

	/// Returns a transaction the wallet imported or broadcast.
	pub fn recorded_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
		let raw = match self.store.get_transaction(txid).map_err(|e| self.persistence_failed(e))? {
			Some(raw) => raw,
			None => return Ok(None),
		};
		deserialize(&raw).map(Some).map_err(|e| {
			log_error!(self.logger, "Failed to decode recorded transaction {}: {}", txid, e);
			Error::PersistenceFailed
		})
	}

	fn record_transaction(
		&self, tx: &Transaction, confirmation_height: Option<u32>,
	) -> Result<usize, Error> {
		let txid = tx.compute_txid();
		self.store.insert_transaction(&txid, &serialize(tx)).map_err(|e| self.persistence_failed(e))?;

		let mut recorded = 0;
		for (vout, output) in tx.output.iter().enumerate() {
			let key_index = match self
				.store
				.key_index_for_script(&output.script_pubkey)
				.map_err(|e| self.persistence_failed(e))?
			{
				Some(key_index) => key_index,
				None => continue,
			};
			let stored = StoredOutput {
				outpoint: OutPoint { txid, vout: vout as u32 },
				value_sats: output.value.to_sat(),
				script_pubkey: output.script_pubkey.clone(),
				key_index,
				confirmation_height,
			};
			self.store.insert_output(&stored).map_err(|e| self.persistence_failed(e))?;
			recorded += 1;
		}
		Ok(recorded)
	}

	pub(crate) async fn spendable_utxos(&self) -> Result<Vec<Utxo>, Error> {
		let tip = self.chain_source.get_block_count().await?;
		let outputs = self.store.list_unspent_outputs().map_err(|e| self.persistence_failed(e))?;

		let utxos = outputs
			.into_iter()
			.map(|output| {
				let confirmations = match output.confirmation_height {
					Some(height) if height <= tip => tip - height + 1,
					_ => 0,
				};
				let address = Address::from_script(&output.script_pubkey, self.network)
					.map(|a| a.to_string())
					.unwrap_or_default();
				Utxo {
					outpoint: output.outpoint,
					amount_sats: output.value_sats,
					address,
					script_pubkey: output.script_pubkey,
					confirmations,
				}
			})
			.collect::<Vec<_>>();
		log_debug!(self.logger, "Internal wallet lists {} unspent outputs", utxos.len());
		Ok(utxos)
	}

	pub(crate) fn sign(&self, tx: Transaction, utxos: &[Utxo]) -> Result<Transaction, Error> {
		let spent = utxos_for_inputs(&tx, utxos).map_err(|outpoint| {
			log_error!(self.logger, "No UTXO known for input spending {}", outpoint);
			Error::SigningKeyNotFound
		})?;

		let mut inputs = Vec::with_capacity(spent.len());
		for (vin, utxo) in spent.iter().enumerate() {
			let stored = self
				.store
				.get_output(&utxo.outpoint)
				.map_err(|e| self.persistence_failed(e))?
				.ok_or_else(|| {
					log_error!(self.logger, "No key index recorded for {}", utxo.outpoint);
					Error::SigningKeyNotFound
				})?;
			inputs.push(SigningInput {
				vin,
				key_index: stored.key_index,
				prev_script_pubkey: stored.script_pubkey,
				amount_sats: stored.value_sats,
			});
		}

		self.keys_manager.sign_transaction(tx, &inputs)
	}

	/// Marks the inputs of a broadcast transaction as spent and records its change.
	pub(crate) fn transaction_broadcast(&self, tx: &Transaction) -> Result<(), Error> {
		let txid = tx.compute_txid();
		for txin in &tx.input {
			self.store
				.mark_spent(&txin.previous_output, &txid)
				.map_err(|e| self.persistence_failed(e))?;
		}
		let change = self.record_transaction(tx, None)?;
		log_debug!(self.logger, "Recorded broadcast of {} with {} change output(s)", txid, change);
		Ok(())
	}
}
