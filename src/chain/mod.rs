// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Access to the Bitcoin node.

mod bitcoind_rpc;

pub use bitcoind_rpc::BitcoindRpcClient;

use crate::error::Error;
use crate::types::Utxo;

use bitcoin::{FeeRate, PrivateKey, Transaction, Txid};

use std::future::Future;
use std::pin::Pin;

/// The result of an asynchronous call to the Bitcoin node.
pub type AsyncChainResult<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + 'a + Send>>;

/// The operations we need from the Bitcoin node.
///
/// Transport failures are reported as [`Error::NodeUnavailable`]. The node refusing a
/// transaction is reported as [`Error::BroadcastRejected`].
pub trait ChainSource: Send + Sync {
	/// Returns the node's fee rate estimate for confirmation within `target_blocks`, or `None`
	/// if the node has no estimate.
	fn estimate_fee<'a>(&'a self, target_blocks: u16) -> AsyncChainResult<'a, Option<FeeRate>>;

	/// Lists the outputs spendable by the node's wallet.
	fn list_unspent<'a>(&'a self) -> AsyncChainResult<'a, Vec<Utxo>>;

	/// Returns a fresh change address of the node's wallet.
	fn get_change_address<'a>(&'a self) -> AsyncChainResult<'a, String>;

	/// Returns the private key controlling `address`, which has to belong to the node's wallet.
	fn dump_private_key<'a>(&'a self, address: &'a str) -> AsyncChainResult<'a, PrivateKey>;

	/// Has the node sign all inputs of `tx` with the given keys.
	///
	/// `prevouts` describes the outputs spent by `tx`. Fails with
	/// [`Error::SigningKeyNotFound`] if any input remains unsigned.
	fn sign_raw_transaction_with_key<'a>(
		&'a self, tx: &'a Transaction, keys: &'a [PrivateKey], prevouts: &'a [Utxo],
	) -> AsyncChainResult<'a, Transaction>;

	/// Submits `tx` to the network, returning the id the node assigned to it.
	fn send_raw_transaction<'a>(&'a self, tx: &'a Transaction) -> AsyncChainResult<'a, Txid>;

	/// Returns the height of the node's best block.
	fn get_block_count<'a>(&'a self) -> AsyncChainResult<'a, u32>;

	/// Returns the transaction with the given id together with its number of confirmations.
	fn get_raw_transaction<'a>(&'a self, txid: &'a Txid) -> AsyncChainResult<'a, (Transaction, u32)>;
}
