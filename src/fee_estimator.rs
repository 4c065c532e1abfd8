// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Fee estimation for funding and withdrawal transactions.
//!
//! Fees are computed in two passes. The first pass runs before the inputs and the funding
//! scripts are known and charges a fixed, generous size per output. The second pass runs once
//! the plan's inputs and outputs are resolved and charges their exact virtual sizes.

use crate::chain::ChainSource;
use crate::config::Config;
use crate::logger::{log_debug, log_warn, Logger};

use bitcoin::{Amount, FeeRate, Script};

use std::sync::Arc;
use std::time::Duration;

// Size guess for the parts of a transaction that don't scale with the number of outputs.
const INITIAL_BASE_VBYTES: u64 = 160;
// Size guess per channel funding output, inputs included.
const INITIAL_CHANNEL_VBYTES: u64 = 43;
// Size guess per withdrawal destination, inputs included.
const INITIAL_DESTINATION_VBYTES: u64 = 70;

/// Version, locktime, in- and output counts and the segwit marker.
pub(crate) const TX_OVERHEAD_VBYTES: u64 = 11;

/// The kind of locking script of an input's previous output or of an output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScriptKind {
	P2pkh,
	P2sh,
	P2wpkh,
	P2wsh,
	/// Anything else, e.g. taproot. Charged at the most expensive known size.
	Other,
}

impl ScriptKind {
	pub(crate) fn of(script: &Script) -> Self {
		if script.is_p2pkh() {
			ScriptKind::P2pkh
		} else if script.is_p2sh() {
			ScriptKind::P2sh
		} else if script.is_p2wpkh() {
			ScriptKind::P2wpkh
		} else if script.is_p2wsh() {
			ScriptKind::P2wsh
		} else {
			ScriptKind::Other
		}
	}

	/// The virtual size of an output locked with this kind of script.
	pub(crate) fn output_vbytes(&self) -> u64 {
		match self {
			ScriptKind::P2pkh => 34,
			ScriptKind::P2sh => 32,
			ScriptKind::P2wpkh => 31,
			ScriptKind::P2wsh | ScriptKind::Other => 43,
		}
	}

	/// The virtual size of an input spending an output locked with this kind of script.
	///
	/// P2SH inputs are assumed to wrap P2WPKH.
	pub(crate) fn input_vbytes(&self) -> u64 {
		match self {
			ScriptKind::P2pkh | ScriptKind::Other => 149,
			ScriptKind::P2wpkh => 68,
			ScriptKind::P2sh => 93,
			ScriptKind::P2wsh => 93,
		}
	}
}

/// What the transaction a fee is estimated for does.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BatchKind {
	ChannelFunding,
	Withdrawal,
}

fn fee_for_vbytes(fee_rate: FeeRate, vbytes: u64) -> u64 {
	fee_rate.fee_vb(vbytes).unwrap_or(Amount::MAX_MONEY).to_sat()
}

/// Pass one: a conservative fee for a transaction creating `num_outputs` outputs of the given
/// kind, before anything about its inputs or scripts is known.
pub(crate) fn initial_fee(fee_rate: FeeRate, batch_kind: BatchKind, num_outputs: usize) -> u64 {
	let per_output = match batch_kind {
		BatchKind::ChannelFunding => INITIAL_CHANNEL_VBYTES,
		BatchKind::Withdrawal => INITIAL_DESTINATION_VBYTES,
	};
	fee_for_vbytes(fee_rate, INITIAL_BASE_VBYTES + per_output * num_outputs as u64)
}

/// The exact virtual size of a transaction with the given input and output script kinds.
pub(crate) fn transaction_vbytes(inputs: &[ScriptKind], outputs: &[ScriptKind]) -> u64 {
	let inputs: u64 = inputs.iter().map(|k| k.input_vbytes()).sum();
	let outputs: u64 = outputs.iter().map(|k| k.output_vbytes()).sum();
	inputs + outputs + TX_OVERHEAD_VBYTES
}

/// Pass two: the fee for a transaction with the given, resolved input and output kinds.
pub(crate) fn final_fee(fee_rate: FeeRate, inputs: &[ScriptKind], outputs: &[ScriptKind]) -> u64 {
	fee_for_vbytes(fee_rate, transaction_vbytes(inputs, outputs))
}

/// Retrieves fee rates from the node, falling back to a fixed rate when it has none.
pub(crate) struct FeeEstimator {
	chain_source: Arc<dyn ChainSource>,
	config: Arc<Config>,
	logger: Arc<Logger>,
}

impl FeeEstimator {
	pub(crate) fn new(
		chain_source: Arc<dyn ChainSource>, config: Arc<Config>, logger: Arc<Logger>,
	) -> Self {
		Self { chain_source, config, logger }
	}

	fn fallback_fee_rate(&self) -> FeeRate {
		FeeRate::from_sat_per_vb(self.config.fallback_fee_rate_sat_per_vb)
			.unwrap_or(FeeRate::BROADCAST_MIN)
	}

	/// Never fails: an unavailable, zero or timed-out estimate yields the configured fallback.
	pub(crate) async fn estimate_fee_rate(&self) -> FeeRate {
		let target = self.config.fee_target_blocks;
		let timeout = Duration::from_secs(self.config.rpc_timeout_secs);
		let estimate =
			match tokio::time::timeout(timeout, self.chain_source.estimate_fee(target)).await {
				Ok(Ok(estimate)) => estimate,
				Ok(Err(e)) => {
					log_warn!(self.logger, "Failed to retrieve fee rate estimate: {}", e);
					None
				},
				Err(e) => {
					log_warn!(self.logger, "Retrieving fee rate estimate timed out: {}", e);
					None
				},
			};

		match estimate {
			Some(fee_rate) if fee_rate > FeeRate::ZERO => {
				log_debug!(
					self.logger,
					"Using fee rate of {} sat/kwu for target of {} blocks",
					fee_rate.to_sat_per_kwu(),
					target
				);
				fee_rate
			},
			_ => {
				let fallback = self.fallback_fee_rate();
				log_warn!(
					self.logger,
					"Unable to estimate fee rate, using default of {} sat/vB",
					fallback.to_sat_per_vb_ceil()
				);
				fallback
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::AsyncChainResult;
	use crate::error::Error;
	use crate::logger::tests::test_logger;
	use crate::logger::LogLevel;
	use crate::types::Utxo;

	use bitcoin::hashes::Hash;
	use bitcoin::{PrivateKey, Transaction, Txid};

	struct FixedFeeChain(Result<Option<FeeRate>, Error>);

	impl ChainSource for FixedFeeChain {
		fn estimate_fee<'a>(&'a self, _target: u16) -> AsyncChainResult<'a, Option<FeeRate>> {
			let res = self.0;
			Box::pin(async move { res })
		}
		fn list_unspent<'a>(&'a self) -> AsyncChainResult<'a, Vec<Utxo>> {
			unimplemented!()
		}
		fn get_change_address<'a>(&'a self) -> AsyncChainResult<'a, String> {
			unimplemented!()
		}
		fn dump_private_key<'a>(&'a self, _address: &'a str) -> AsyncChainResult<'a, PrivateKey> {
			unimplemented!()
		}
		fn sign_raw_transaction_with_key<'a>(
			&'a self, _tx: &'a Transaction, _keys: &'a [PrivateKey], _prevouts: &'a [Utxo],
		) -> AsyncChainResult<'a, Transaction> {
			unimplemented!()
		}
		fn send_raw_transaction<'a>(&'a self, _tx: &'a Transaction) -> AsyncChainResult<'a, Txid> {
			unimplemented!()
		}
		fn get_block_count<'a>(&'a self) -> AsyncChainResult<'a, u32> {
			unimplemented!()
		}
		fn get_raw_transaction<'a>(
			&'a self, _txid: &'a Txid,
		) -> AsyncChainResult<'a, (Transaction, u32)> {
			unimplemented!()
		}
	}

	#[test]
	fn initial_fee_uses_generic_sizes() {
		let one_sat_vb = FeeRate::from_sat_per_vb_unchecked(1);
		assert_eq!(initial_fee(one_sat_vb, BatchKind::ChannelFunding, 2), 160 + 2 * 43);
		assert_eq!(initial_fee(one_sat_vb, BatchKind::Withdrawal, 3), 160 + 3 * 70);

		let five_sat_vb = FeeRate::from_sat_per_vb_unchecked(5);
		assert_eq!(initial_fee(five_sat_vb, BatchKind::ChannelFunding, 1), 5 * 203);
	}

	#[test]
	fn final_fee_uses_exact_sizes() {
		let one_sat_vb = FeeRate::from_sat_per_vb_unchecked(1);
		let inputs = [ScriptKind::P2wpkh];
		let outputs = [ScriptKind::P2wsh, ScriptKind::P2wsh, ScriptKind::P2wpkh];
		assert_eq!(final_fee(one_sat_vb, &inputs, &outputs), 68 + 43 + 43 + 31 + 11);

		let inputs = [ScriptKind::P2pkh, ScriptKind::P2sh];
		let outputs = [ScriptKind::P2pkh, ScriptKind::P2sh];
		assert_eq!(transaction_vbytes(&inputs, &outputs), 149 + 93 + 34 + 32 + 11);

		// Unknown kinds are charged conservatively.
		assert_eq!(transaction_vbytes(&[ScriptKind::Other], &[ScriptKind::Other]), 149 + 43 + 11);
	}

	#[test]
	fn script_kind_detection() {
		let wpkh = bitcoin::WPubkeyHash::from_byte_array([1; 20]);
		let pkh = bitcoin::PubkeyHash::from_byte_array([1; 20]);
		let sh = bitcoin::ScriptHash::from_byte_array([1; 20]);
		let wsh = bitcoin::WScriptHash::from_byte_array([1; 32]);
		assert_eq!(ScriptKind::of(&bitcoin::ScriptBuf::new_p2wpkh(&wpkh)), ScriptKind::P2wpkh);
		assert_eq!(ScriptKind::of(&bitcoin::ScriptBuf::new_p2pkh(&pkh)), ScriptKind::P2pkh);
		assert_eq!(ScriptKind::of(&bitcoin::ScriptBuf::new_p2sh(&sh)), ScriptKind::P2sh);
		assert_eq!(ScriptKind::of(&bitcoin::ScriptBuf::new_p2wsh(&wsh)), ScriptKind::P2wsh);
		assert_eq!(ScriptKind::of(&bitcoin::ScriptBuf::new()), ScriptKind::Other);
	}

	#[tokio::test]
	async fn missing_estimate_falls_back_with_warning() {
		for chain in [FixedFeeChain(Ok(None)), FixedFeeChain(Err(Error::NodeUnavailable))] {
			let (logger, writer) = test_logger();
			let estimator =
				FeeEstimator::new(Arc::new(chain), Arc::new(Config::default()), logger);
			let fee_rate = estimator.estimate_fee_rate().await;
			assert_eq!(fee_rate, FeeRate::from_sat_per_vb_unchecked(2));

			let lines = writer.lines.lock().unwrap();
			assert!(lines
				.iter()
				.any(|(level, line)| *level == LogLevel::Warn && line.contains("using default")));
		}
	}

	#[tokio::test]
	async fn available_estimate_is_used() {
		let (logger, _) = test_logger();
		let rate = FeeRate::from_sat_per_vb_unchecked(7);
		let estimator = FeeEstimator::new(
			Arc::new(FixedFeeChain(Ok(Some(rate)))),
			Arc::new(Config::default()),
			logger,
		);
		assert_eq!(estimator.estimate_fee_rate().await, rate);
	}
}
