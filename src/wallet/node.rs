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
use crate::logger::{log_debug, log_error, Logger};
use crate::types::Utxo;

use bitcoin::Transaction;

use std::sync::Arc;

/// A wallet whose coins and keys are held by the Bitcoin node.
pub(crate) struct NodeWallet {
	chain_source: Arc<dyn ChainSource>,
	selector: CoinSelector,
	logger: Arc<Logger>,
}

impl NodeWallet {
	pub(crate) fn new(
		chain_source: Arc<dyn ChainSource>, selector: CoinSelector, logger: Arc<Logger>,
	) -> Self {
		Self { chain_source, selector, logger }
	}

	pub(crate) fn selector(&self) -> &CoinSelector {
		&self.selector
	}

	pub(crate) async fn spendable_utxos(&self) -> Result<Vec<Utxo>, Error> {
		let utxos = self.chain_source.list_unspent().await?;
		log_debug!(self.logger, "Node wallet lists {} unspent outputs", utxos.len());
		Ok(utxos)
	}

	pub(crate) async fn change_address(&self) -> Result<String, Error> {
		self.chain_source.get_change_address().await
	}

	/// Has the node sign `tx` with the keys of the addresses `utxos` pay to.
	pub(crate) async fn sign(&self, tx: Transaction, utxos: &[Utxo]) -> Result<Transaction, Error> {
		let spent = utxos_for_inputs(&tx, utxos).map_err(|outpoint| {
			log_error!(self.logger, "No UTXO known for input spending {}", outpoint);
			Error::SigningKeyNotFound
		})?;

		let mut keys = Vec::with_capacity(spent.len());
		for utxo in &spent {
			if utxo.address.is_empty() {
				log_error!(self.logger, "UTXO {} has no address to look up a key for", utxo.outpoint);
				return Err(Error::SigningKeyNotFound);
			}
			keys.push(self.chain_source.dump_private_key(&utxo.address).await?);
		}

		let prevouts: Vec<Utxo> = spent.into_iter().cloned().collect();
		let signed =
			self.chain_source.sign_raw_transaction_with_key(&tx, &keys, &prevouts).await?;

		// Signing must only ever add signatures.
		if signed.compute_ntxid() != tx.compute_ntxid() {
			log_error!(self.logger, "Node returned a different transaction when signing");
			return Err(Error::InvalidTransaction);
		}
		Ok(signed)
	}
}
