// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Opening several channels from a single funding transaction.
//!
//! Every command runs as a funding run moving through the states of [`FundingState`]:
//!
//! 1. `Init -> Reserved`: every peer reserves a funding output, in request order.
//! 2. `Reserved -> Planned`: the fee is estimated, UTXOs are selected and the fee is refined
//!    against the selected inputs, deciding on a change output.
//! 3. `Planned -> Signed`: the transaction is assembled and signed by the wallet.
//! 4. `Signed -> Secured`: every peer is told where its funding output ended up.
//! 5. `Secured -> Broadcast`: the transaction is handed to the node.
//!
//! A failure is compensated based on the state the run reached. Before any peer finalized its
//! channel, all reservations are cancelled. Afterwards a cancellation is no longer possible and
//! every finalized channel is closed instead.

use crate::chain::ChainSource;
use crate::config::{Config, WalletKind};
use crate::error::{Error, FundingError};
use crate::fee_estimator::{final_fee, initial_fee, BatchKind, FeeEstimator, ScriptKind};
use crate::io::sqlite_store::WalletStore;
use crate::logger::{log_debug, log_error, log_info, log_warn, Logger};
use crate::peer::PeerClient;
use crate::tx_builder::{
	build_unsigned_transaction, decode_transaction_hex, encode_transaction_hex,
	find_funding_output, parse_address,
};
use crate::types::{
	ChannelRequest, ConnectChannelRequest, Destination, ExternalFundingStart, FinalizeResult,
	FundingOutput, FundingPlan, FundingResult, Recipient, RunId, Utxo, WithdrawResult,
};
use crate::wallet::{InternalWallet, UtxoLease, UtxoLeases, Wallet};

use bitcoin::secp256k1::PublicKey;
use bitcoin::{FeeRate, Transaction, Txid};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// The states of a funding run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FundingState {
	/// Nothing has been agreed with any peer yet. Reservations may be in progress.
	Init,
	/// Every peer reserved its funding output.
	Reserved,
	/// Inputs, outputs and the fee are fixed.
	Planned,
	/// The funding transaction is signed.
	Signed,
	/// At least one peer considers its channel's commitments secured.
	Secured,
	/// The funding transaction was accepted by the node.
	Broadcast,
	/// The run failed and all reservations were cancelled.
	RolledBackReserved,
	/// The run failed and all finalized channels were closed.
	RolledBackSecured,
}

// The state owned by a single invocation. Never shared between runs.
struct FundingRun {
	id: RunId,
	state: FundingState,
	outputs: Vec<FundingOutput>,
	reserved: Vec<PublicKey>,
	finalized: Vec<PublicKey>,
}

impl FundingRun {
	fn new() -> Self {
		Self::with_id(RunId::random())
	}

	fn with_id(id: RunId) -> Self {
		Self {
			id,
			state: FundingState::Init,
			outputs: Vec::new(),
			reserved: Vec::new(),
			finalized: Vec::new(),
		}
	}

	fn resume(id: RunId, outputs: Vec<FundingOutput>) -> Self {
		let reserved = outputs.iter().map(|o| o.peer_id).collect();
		Self { id, state: FundingState::Reserved, outputs, reserved, finalized: Vec::new() }
	}

	fn recipients(&self) -> Vec<Recipient> {
		self.outputs
			.iter()
			.map(|o| Recipient { address: o.address.clone(), amount_sats: o.amount_sats })
			.collect()
	}
}

struct RunFailure {
	error: Error,
	peer_id: Option<PublicKey>,
}

impl RunFailure {
	fn at_peer(error: Error, peer_id: PublicKey) -> Self {
		Self { error, peer_id: Some(peer_id) }
	}
}

impl From<Error> for RunFailure {
	fn from(error: Error) -> Self {
		Self { error, peer_id: None }
	}
}

/// The outcome of the second fee pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeeSettlement {
	pub(crate) fee_sats: u64,
	pub(crate) change_sats: Option<u64>,
}

/// Settles the fee of spending `utxos` to outputs of the given kinds worth `output_sats`.
///
/// A P2WPKH change output is added if what remains after paying the fee for it exceeds the
/// dust limit. Otherwise the whole surplus goes to the fee.
pub(crate) fn settle_fee(
	fee_rate: FeeRate, utxos: &[Utxo], output_kinds: &[ScriptKind], output_sats: u64,
	dust_limit_sats: u64,
) -> Result<FeeSettlement, Error> {
	let input_sats = utxos
		.iter()
		.try_fold(0u64, |acc, u| acc.checked_add(u.amount_sats))
		.ok_or(Error::InvalidRequest)?;
	let surplus = input_sats.checked_sub(output_sats).ok_or(Error::InsufficientFunds)?;
	let input_kinds: Vec<ScriptKind> =
		utxos.iter().map(|u| ScriptKind::of(&u.script_pubkey)).collect();

	let mut with_change = output_kinds.to_vec();
	with_change.push(ScriptKind::P2wpkh);
	let fee_with_change = final_fee(fee_rate, &input_kinds, &with_change);
	match surplus.checked_sub(fee_with_change) {
		Some(change_sats) if change_sats > dust_limit_sats => {
			return Ok(FeeSettlement { fee_sats: fee_with_change, change_sats: Some(change_sats) });
		},
		_ => {},
	}

	if surplus < final_fee(fee_rate, &input_kinds, output_kinds) {
		return Err(Error::InsufficientFunds);
	}
	Ok(FeeSettlement { fee_sats: surplus, change_sats: None })
}

fn validate_channels(channels: &[ChannelRequest]) -> Result<(), RunFailure> {
	if channels.is_empty() {
		return Err(Error::InvalidRequest.into());
	}
	let mut seen = HashSet::new();
	for channel in channels {
		if channel.amount_sats == 0 || !seen.insert(channel.peer_id) {
			return Err(RunFailure::at_peer(Error::InvalidRequest, channel.peer_id));
		}
	}
	Ok(())
}

/// Runs the funding commands against one wallet, one peer daemon and one Bitcoin node.
///
/// Runs may execute concurrently. They share nothing but the set of UTXOs currently selected
/// by some run, which keeps them from spending the same coins.
pub struct Funder {
	wallet: Wallet,
	peer_client: Arc<dyn PeerClient>,
	chain_source: Arc<dyn ChainSource>,
	fee_estimator: FeeEstimator,
	store: Arc<WalletStore>,
	utxo_leases: Arc<UtxoLeases>,
	config: Arc<Config>,
	logger: Arc<Logger>,
}

impl Funder {
	pub(crate) fn new(
		wallet: Wallet, peer_client: Arc<dyn PeerClient>, chain_source: Arc<dyn ChainSource>,
		store: Arc<WalletStore>, config: Arc<Config>, logger: Arc<Logger>,
	) -> Self {
		let fee_estimator =
			FeeEstimator::new(Arc::clone(&chain_source), Arc::clone(&config), Arc::clone(&logger));
		let utxo_leases = Arc::new(UtxoLeases::default());
		Self { wallet, peer_client, chain_source, fee_estimator, store, utxo_leases, config, logger }
	}

	/// Returns the kind of wallet funding the runs.
	pub fn wallet_kind(&self) -> WalletKind {
		self.wallet.kind()
	}

	/// Returns the internal wallet, if runs are funded from it.
	pub fn internal_wallet(&self) -> Option<Arc<InternalWallet>> {
		match &self.wallet {
			Wallet::Internal(wallet) => Some(Arc::clone(wallet)),
			_ => None,
		}
	}

	/// Returns the configuration in use.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Opens a channel with every peer in `channels`, funding all of them from one
	/// transaction.
	///
	/// Either every channel is opened and the funding transaction broadcast, or the run is
	/// rolled back and the error names the state it failed in and, if known, the channel that
	/// caused it.
	pub async fn open_multi(
		&self, channels: Vec<ChannelRequest>,
	) -> Result<FundingResult, FundingError> {
		self.run_open(FundingRun::new(), &channels).await
	}

	/// Like [`Funder::open_multi`], but first connects to every peer.
	pub async fn connect_open_multi(
		&self, requests: Vec<ConnectChannelRequest>,
	) -> Result<FundingResult, FundingError> {
		let run = FundingRun::new();
		let channels: Vec<ChannelRequest> = requests.iter().map(|r| r.channel.clone()).collect();
		if let Err(failure) = validate_channels(&channels) {
			return Err(self.roll_back(run, failure).await);
		}

		for request in &requests {
			let peer_id = request.channel.peer_id;
			log_debug!(self.logger, "Connecting to {}@{}:{}", peer_id, request.host, request.port);
			let connect = self.peer_client.connect(&peer_id, &request.host, request.port);
			if let Err(e) = self.timed("Connecting to peer", connect).await {
				return Err(self.roll_back(run, RunFailure::at_peer(e, peer_id)).await);
			}
		}
		self.run_open(run, &channels).await
	}

	async fn run_open(
		&self, mut run: FundingRun, channels: &[ChannelRequest],
	) -> Result<FundingResult, FundingError> {
		log_info!(self.logger, "Funding run {} opening {} channel(s)", run.id, channels.len());
		match self.open_channels(&mut run, channels).await {
			Ok(result) => {
				log_info!(
					self.logger,
					"Funding run {} broadcast transaction {} opening {} channel(s)",
					run.id,
					result.txid,
					result.channels.len()
				);
				Ok(result)
			},
			Err(failure) => Err(self.roll_back(run, failure).await),
		}
	}

	async fn open_channels(
		&self, run: &mut FundingRun, channels: &[ChannelRequest],
	) -> Result<FundingResult, RunFailure> {
		validate_channels(channels)?;
		if self.wallet.kind() == WalletKind::External {
			log_error!(self.logger, "Opening channels requires a wallet able to sign");
			return Err(Error::WalletOperationUnsupported.into());
		}

		self.reserve_outputs(run, channels).await?;

		let fee_rate = self.fee_estimator.estimate_fee_rate().await;
		let output_kinds: Vec<ScriptKind> =
			run.outputs.iter().map(|o| ScriptKind::of(&o.script_pubkey)).collect();
		let recipients = run.recipients();
		let (plan, _lease) = self
			.plan(run, fee_rate, BatchKind::ChannelFunding, recipients, &output_kinds)
			.await?;

		let tx = self.sign(run, &plan).await?;
		let channels = self.secure_outputs(run, &tx).await?;
		let broadcast_txid = self.broadcast(run, &tx).await?;

		Ok(FundingResult {
			txid: tx.compute_txid(),
			broadcast_txid,
			tx_hex: encode_transaction_hex(&tx),
			channels,
		})
	}

	/// Pays all `destinations` from one transaction.
	pub async fn withdraw_multi(
		&self, destinations: Vec<Destination>,
	) -> Result<WithdrawResult, FundingError> {
		let mut run = FundingRun::new();
		log_info!(
			self.logger,
			"Funding run {} paying {} destination(s)",
			run.id,
			destinations.len()
		);
		match self.withdraw(&mut run, &destinations).await {
			Ok(result) => {
				log_info!(self.logger, "Funding run {} broadcast transaction {}", run.id, result.txid);
				Ok(result)
			},
			Err(failure) => Err(self.roll_back(run, failure).await),
		}
	}

	async fn withdraw(
		&self, run: &mut FundingRun, destinations: &[Destination],
	) -> Result<WithdrawResult, RunFailure> {
		if destinations.is_empty() || destinations.iter().any(|d| d.amount_sats == 0) {
			return Err(Error::InvalidRequest.into());
		}
		let mut output_kinds = Vec::with_capacity(destinations.len());
		for destination in destinations {
			let address = parse_address(&destination.address, self.config.network).map_err(|e| {
				log_error!(self.logger, "Invalid destination address {}", destination.address);
				e
			})?;
			output_kinds.push(ScriptKind::of(&address.script_pubkey()));
		}
		if self.wallet.kind() == WalletKind::External {
			log_error!(self.logger, "Withdrawing requires a wallet able to sign");
			return Err(Error::WalletOperationUnsupported.into());
		}

		let fee_rate = match destinations.iter().filter_map(|d| d.fee_rate_hint).max() {
			Some(sat_per_vb) => {
				FeeRate::from_sat_per_vb(sat_per_vb).ok_or(Error::InvalidRequest)?
			},
			None => self.fee_estimator.estimate_fee_rate().await,
		};
		let recipients = destinations
			.iter()
			.map(|d| Recipient { address: d.address.clone(), amount_sats: d.amount_sats })
			.collect();
		let (plan, _lease) =
			self.plan(run, fee_rate, BatchKind::Withdrawal, recipients, &output_kinds).await?;

		let tx = self.sign(run, &plan).await?;
		let broadcast_txid = self.broadcast(run, &tx).await?;
		Ok(WithdrawResult {
			txid: tx.compute_txid(),
			broadcast_txid,
			tx_hex: encode_transaction_hex(&tx),
		})
	}

	/// Reserves a funding output with every peer in `channels` and returns the outputs an
	/// externally signed transaction has to create.
	///
	/// The reservations are persisted under the returned run id until the run is completed
	/// with [`Funder::complete_external`] or given up with [`Funder::cancel_external`].
	pub async fn begin_external(
		&self, channels: Vec<ChannelRequest>,
	) -> Result<ExternalFundingStart, FundingError> {
		let mut run = FundingRun::new();
		log_info!(
			self.logger,
			"Funding run {} reserving {} channel(s) for an external wallet",
			run.id,
			channels.len()
		);
		match self.reserve_external(&mut run, &channels).await {
			Ok(start) => Ok(start),
			Err(failure) => Err(self.roll_back(run, failure).await),
		}
	}

	async fn reserve_external(
		&self, run: &mut FundingRun, channels: &[ChannelRequest],
	) -> Result<ExternalFundingStart, RunFailure> {
		validate_channels(channels)?;
		self.reserve_outputs(run, channels).await?;
		self.store.insert_pending_run(&run.id, &run.outputs).map_err(|e| {
			log_error!(self.logger, "Failed to persist funding run {}: {}", run.id, e);
			Error::PersistenceFailed
		})?;
		Ok(ExternalFundingStart { run_id: run.id, outputs: run.recipients() })
	}

	/// Completes a run started with [`Funder::begin_external`] using the transaction signed by
	/// the external wallet.
	///
	/// The run is over afterwards. On failure it is rolled back like any other run.
	pub async fn complete_external(
		&self, run_id: &RunId, signed_tx_hex: &str,
	) -> Result<FundingResult, FundingError> {
		// Claiming the run removes it, so a run can only be completed or cancelled once.
		let outputs = match self.take_pending_run(run_id) {
			Ok(outputs) => outputs,
			Err(e) => return Err(self.roll_back(FundingRun::with_id(*run_id), e.into()).await),
		};

		let mut run = FundingRun::resume(*run_id, outputs);
		let res = self.complete_run(&mut run, signed_tx_hex).await;
		match res {
			Ok(result) => {
				log_info!(
					self.logger,
					"Funding run {} broadcast externally signed transaction {}",
					run_id,
					result.txid
				);
				Ok(result)
			},
			Err(failure) => Err(self.roll_back(run, failure).await),
		}
	}

	async fn complete_run(
		&self, run: &mut FundingRun, signed_tx_hex: &str,
	) -> Result<FundingResult, RunFailure> {
		let tx = decode_transaction_hex(signed_tx_hex).map_err(|e| {
			log_error!(self.logger, "Funding run {} got an undecodable transaction", run.id);
			e
		})?;
		run.state = FundingState::Signed;

		let channels = self.secure_outputs(run, &tx).await?;
		let broadcast_txid = self.broadcast(run, &tx).await?;
		Ok(FundingResult {
			txid: tx.compute_txid(),
			broadcast_txid,
			tx_hex: encode_transaction_hex(&tx),
			channels,
		})
	}

	/// Gives up a run started with [`Funder::begin_external`], cancelling its reservations.
	pub async fn cancel_external(&self, run_id: &RunId) -> Result<(), Error> {
		let outputs = self.take_pending_run(run_id)?;
		for output in &outputs {
			self.cancel_reservation(run_id, &output.peer_id).await;
		}
		log_info!(self.logger, "Funding run {} cancelled", run_id);
		Ok(())
	}

	fn take_pending_run(&self, run_id: &RunId) -> Result<Vec<FundingOutput>, Error> {
		match self.store.take_pending_run(run_id) {
			Ok(Some(outputs)) => Ok(outputs),
			Ok(None) => {
				log_error!(self.logger, "No pending funding run {}", run_id);
				Err(Error::UnknownRun)
			},
			Err(e) => {
				log_error!(self.logger, "Failed to read funding run {}: {}", run_id, e);
				Err(Error::PersistenceFailed)
			},
		}
	}

	async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T, Error>
	where
		F: Future<Output = Result<T, Error>>,
	{
		match tokio::time::timeout(self.config.rpc_timeout(), fut).await {
			Ok(res) => res,
			Err(_) => {
				log_error!(
					self.logger,
					"{} timed out after {} seconds",
					what,
					self.config.rpc_timeout_secs
				);
				Err(Error::Timeout)
			},
		}
	}

	async fn reserve_outputs(
		&self, run: &mut FundingRun, channels: &[ChannelRequest],
	) -> Result<(), RunFailure> {
		for (vout, channel) in channels.iter().enumerate() {
			let peer_id = channel.peer_id;
			let reserve = self.peer_client.reserve_funding(
				&peer_id,
				channel.amount_sats,
				channel.announce,
				channel.fee_rate_hint.as_deref(),
			);
			let address = self
				.timed("Reserving funding output", reserve)
				.await
				.map_err(|e| RunFailure::at_peer(e, peer_id))?;
			run.reserved.push(peer_id);

			let script_pubkey = parse_address(&address, self.config.network)
				.map_err(|e| {
					log_error!(self.logger, "Peer {} gave invalid funding address {}", peer_id, address);
					RunFailure::at_peer(e, peer_id)
				})?
				.script_pubkey();
			log_debug!(
				self.logger,
				"Funding run {}: {} reserved {} sats at {}",
				run.id,
				peer_id,
				channel.amount_sats,
				address
			);
			run.outputs.push(FundingOutput {
				peer_id,
				vout: vout as u32,
				amount_sats: channel.amount_sats,
				address,
				script_pubkey,
			});
		}
		run.state = FundingState::Reserved;
		Ok(())
	}

	async fn plan(
		&self, run: &mut FundingRun, fee_rate: FeeRate, batch_kind: BatchKind,
		mut recipients: Vec<Recipient>, output_kinds: &[ScriptKind],
	) -> Result<(FundingPlan, UtxoLease), RunFailure> {
		let output_sats = recipients
			.iter()
			.try_fold(0u64, |acc, r| acc.checked_add(r.amount_sats))
			.ok_or(Error::InvalidRequest)?;
		let initial_fee_sats = initial_fee(fee_rate, batch_kind, recipients.len());

		let select = self.wallet.utxos(output_sats, initial_fee_sats, &self.utxo_leases);
		let (utxos, lease) = self.timed("Selecting UTXOs", select).await.map_err(|e| {
			log_error!(
				self.logger,
				"Funding run {} failed to select UTXOs for {} sats plus {} sats fee: {}",
				run.id,
				output_sats,
				initial_fee_sats,
				e
			);
			e
		})?;

		let settlement =
			settle_fee(fee_rate, &utxos, output_kinds, output_sats, self.config.dust_limit_sats)?;
		let change_vout = match settlement.change_sats {
			Some(change_sats) => {
				let address =
					self.timed("Retrieving change address", self.wallet.change_address()).await?;
				recipients.push(Recipient { address, amount_sats: change_sats });
				Some(recipients.len() as u32 - 1)
			},
			None => None,
		};

		let plan = FundingPlan {
			outputs: run.outputs.clone(),
			recipients,
			utxos,
			fee_sats: settlement.fee_sats,
			change_vout,
		};
		debug_assert_eq!(plan.input_sats(), plan.output_sats() + plan.fee_sats);
		log_debug!(
			self.logger,
			"Funding run {} planned {} input(s) worth {} sats and {} output(s) worth {} sats paying {} sats fee",
			run.id,
			plan.utxos.len(),
			plan.input_sats(),
			plan.recipients.len(),
			plan.output_sats(),
			plan.fee_sats
		);
		run.state = FundingState::Planned;
		Ok((plan, lease))
	}

	async fn sign(&self, run: &mut FundingRun, plan: &FundingPlan) -> Result<Transaction, RunFailure> {
		let unsigned = build_unsigned_transaction(&plan.recipients, &plan.utxos, self.config.network)?;
		for output in &plan.outputs {
			let vout = find_funding_output(&unsigned, &output.script_pubkey, output.amount_sats)?;
			if vout != output.vout {
				log_error!(
					self.logger,
					"Funding run {}: output for {} landed at {} instead of {}",
					run.id,
					output.peer_id,
					vout,
					output.vout
				);
				return Err(RunFailure::at_peer(Error::InvalidTransaction, output.peer_id));
			}
		}
		let signed = self.timed("Signing", self.wallet.sign(unsigned, &plan.utxos)).await?;
		run.state = FundingState::Signed;
		Ok(signed)
	}

	async fn secure_outputs(
		&self, run: &mut FundingRun, tx: &Transaction,
	) -> Result<Vec<FinalizeResult>, RunFailure> {
		let txid = tx.compute_txid();
		let outputs = run.outputs.clone();
		let mut results = Vec::with_capacity(outputs.len());
		for output in outputs {
			let peer_id = output.peer_id;
			let vout = find_funding_output(tx, &output.script_pubkey, output.amount_sats)
				.map_err(|e| {
					log_error!(
						self.logger,
						"Funding run {}: no unique output of {} sats to {} in {}",
						run.id,
						output.amount_sats,
						output.address,
						txid
					);
					RunFailure::at_peer(e, peer_id)
				})?;

			let finalize = self.peer_client.finalize_funding(&peer_id, &txid, vout);
			let finalized = self
				.timed("Finalizing funding", finalize)
				.await
				.map_err(|e| RunFailure::at_peer(e, peer_id))?;
			run.finalized.push(peer_id);
			run.state = FundingState::Secured;

			if !finalized.commitments_secured {
				log_error!(
					self.logger,
					"Funding run {}: {} did not secure the commitments of {}",
					run.id,
					peer_id,
					finalized.channel_id
				);
				return Err(RunFailure::at_peer(Error::PeerRejected, peer_id));
			}
			results.push(FinalizeResult {
				peer_id,
				channel_id: finalized.channel_id,
				commitments_secured: finalized.commitments_secured,
				vout,
			});
		}
		Ok(results)
	}

	async fn broadcast(&self, run: &mut FundingRun, tx: &Transaction) -> Result<Txid, RunFailure> {
		let broadcast_txid =
			self.timed("Broadcasting", self.chain_source.send_raw_transaction(tx)).await?;
		run.state = FundingState::Broadcast;

		if let Err(e) = self.wallet.transaction_broadcast(tx) {
			log_warn!(
				self.logger,
				"Funding run {}: failed to record broadcast of {}: {}",
				run.id,
				broadcast_txid,
				e
			);
		}
		Ok(broadcast_txid)
	}

	async fn cancel_reservation(&self, run_id: &RunId, peer_id: &PublicKey) {
		let cancel = self.peer_client.cancel_reservation(peer_id);
		match self.timed("Cancelling reservation", cancel).await {
			Ok(()) => log_debug!(self.logger, "Funding run {}: cancelled {}", run_id, peer_id),
			Err(e) => log_error!(
				self.logger,
				"Funding run {}: failed to cancel reservation with {}: {}",
				run_id,
				peer_id,
				e
			),
		}
	}

	async fn roll_back(&self, run: FundingRun, failure: RunFailure) -> FundingError {
		let failed_in = run.state;
		log_error!(
			self.logger,
			"Funding run {} failed in state {:?}: {}",
			run.id,
			failed_in,
			failure.error
		);

		let rolled_back_to = match failed_in {
			FundingState::Secured | FundingState::Broadcast => {
				for peer_id in &run.finalized {
					let close = self.peer_client.close_channel(peer_id);
					match self.timed("Closing channel", close).await {
						Ok(()) => {
							log_info!(self.logger, "Funding run {}: closed {}", run.id, peer_id)
						},
						Err(e) => log_error!(
							self.logger,
							"Funding run {}: failed to close channel with {}: {}",
							run.id,
							peer_id,
							e
						),
					}
				}
				FundingState::RolledBackSecured
			},
			_ => {
				for peer_id in &run.reserved {
					self.cancel_reservation(&run.id, peer_id).await;
				}
				FundingState::RolledBackReserved
			},
		};

		FundingError { failed_in, rolled_back_to, peer_id: failure.peer_id, error: failure.error }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::hashes::Hash;
	use bitcoin::{OutPoint, ScriptBuf, WPubkeyHash};

	fn utxo(amount_sats: u64) -> Utxo {
		Utxo {
			outpoint: OutPoint { txid: Txid::from_byte_array([1; 32]), vout: 0 },
			amount_sats,
			address: String::new(),
			script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([2; 20])),
			confirmations: 6,
		}
	}

	fn one_sat_per_vb() -> FeeRate {
		FeeRate::from_sat_per_vb_unchecked(1)
	}

	#[test]
	fn change_takes_what_the_exact_fee_leaves() {
		let kinds = [ScriptKind::P2wsh, ScriptKind::P2wsh];
		let settlement = settle_fee(one_sat_per_vb(), &[utxo(100_000)], &kinds, 50_000, 546).unwrap();
		// 68 + 43 + 43 + 31 + 11 vbytes
		assert_eq!(settlement, FeeSettlement { fee_sats: 196, change_sats: Some(49_804) });
	}

	#[test]
	fn dust_change_goes_to_the_fee() {
		let kinds = [ScriptKind::P2wsh, ScriptKind::P2wsh];
		let settlement = settle_fee(one_sat_per_vb(), &[utxo(50_300)], &kinds, 50_000, 1_000).unwrap();
		assert_eq!(settlement, FeeSettlement { fee_sats: 300, change_sats: None });

		// At 1 sat/vB a surplus of five sats cannot pay for the transaction at all, see
		// `dust_sized_surplus_cannot_pay_a_positive_fee`. Without any fee it is simply absorbed.
		assert_eq!(
			settle_fee(one_sat_per_vb(), &[utxo(50_005)], &kinds, 50_000, 1_000),
			Err(Error::InsufficientFunds)
		);
		let settlement = settle_fee(FeeRate::ZERO, &[utxo(50_005)], &kinds, 50_000, 1_000).unwrap();
		assert_eq!(settlement, FeeSettlement { fee_sats: 5, change_sats: None });
	}

	#[test]
	fn surplus_must_cover_the_fee() {
		let kinds = [ScriptKind::P2wsh];
		assert_eq!(
			settle_fee(one_sat_per_vb(), &[utxo(20_100)], &kinds, 20_000, 546),
			Err(Error::InsufficientFunds)
		);
		assert_eq!(
			settle_fee(one_sat_per_vb(), &[utxo(10_000)], &kinds, 20_000, 546),
			Err(Error::InsufficientFunds)
		);
	}

	#[test]
	fn duplicate_peers_are_rejected() {
		let secp = bitcoin::secp256k1::Secp256k1::new();
		let sk = bitcoin::secp256k1::SecretKey::from_slice(&[3; 32]).unwrap();
		let peer_id = PublicKey::from_secret_key(&secp, &sk);
		let channel =
			ChannelRequest { peer_id, amount_sats: 10_000, fee_rate_hint: None, announce: true };

		assert!(validate_channels(&[channel.clone()]).is_ok());
		assert_eq!(validate_channels(&[]).err().map(|f| f.error), Some(Error::InvalidRequest));
		let failure = validate_channels(&[channel.clone(), channel]).err().unwrap();
		assert_eq!(failure.error, Error::InvalidRequest);
		assert_eq!(failure.peer_id, Some(peer_id));
	}
}
