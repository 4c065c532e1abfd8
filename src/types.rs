// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::error::Error;

use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, ScriptBuf, Txid};

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// A request to open a single channel as part of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
	/// The node id of the peer we open the channel with.
	pub peer_id: PublicKey,
	/// The value of the channel's funding output.
	pub amount_sats: u64,
	/// The commitment fee rate to propose to the peer, in the peer daemon's own notation
	/// (e.g. `"normal"`, `"urgent"` or `"253perkw"`).
	pub fee_rate_hint: Option<String>,
	/// Whether the channel should be announced to the network.
	pub announce: bool,
}

/// A [`ChannelRequest`] for a peer we might not yet be connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectChannelRequest {
	/// The channel to open once connected.
	pub channel: ChannelRequest,
	/// The host the peer is reachable at.
	pub host: String,
	/// The port the peer is reachable at.
	pub port: u16,
}

/// A request to pay `amount_sats` to `address` as part of a batched withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
	/// The address to pay to.
	pub address: String,
	/// The amount to pay.
	pub amount_sats: u64,
	/// A fee rate in sat/vB overriding the node's estimate. If several destinations of one
	/// withdrawal carry a hint, the highest one is used.
	pub fee_rate_hint: Option<u64>,
}

/// An output spendable by the funding wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
	/// The output being spent.
	pub outpoint: OutPoint,
	/// The value of the output.
	pub amount_sats: u64,
	/// The address the output pays to, as reported by the wallet.
	pub address: String,
	/// The locking script of the output.
	pub script_pubkey: ScriptBuf,
	/// The number of confirmations the output has.
	pub confirmations: u32,
}

/// A transaction output we intend to create. The position in a recipient list is its vout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
	/// The address to pay to.
	pub address: String,
	/// The amount to pay.
	pub amount_sats: u64,
}

/// The funding output reserved by a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingOutput {
	/// The peer which reserved the output.
	pub peer_id: PublicKey,
	/// The index the output is planned at.
	pub vout: u32,
	/// The value of the output.
	pub amount_sats: u64,
	/// The funding address given to us by the peer.
	pub address: String,
	/// The locking script of `address`.
	pub script_pubkey: ScriptBuf,
}

/// The fully-resolved intent of a single funding run.
///
/// `recipients` lists the funding outputs in request order followed by the change output, if
/// any. The ordering is fixed once the plan exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingPlan {
	/// The per-peer funding outputs.
	pub outputs: Vec<FundingOutput>,
	/// The transaction outputs, in vout order.
	pub recipients: Vec<Recipient>,
	/// The inputs, in vin order.
	pub utxos: Vec<Utxo>,
	/// The fee paid by the transaction, including any surplus absorbed as dust.
	pub fee_sats: u64,
	/// The index of the change output within `recipients`, if one was created.
	pub change_vout: Option<u32>,
}

impl FundingPlan {
	/// The sum of the values of all inputs.
	pub fn input_sats(&self) -> u64 {
		self.utxos.iter().map(|u| u.amount_sats).sum()
	}

	/// The sum of the values of all outputs, change included.
	pub fn output_sats(&self) -> u64 {
		self.recipients.iter().map(|r| r.amount_sats).sum()
	}
}

/// The peer daemon's answer to a funding finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResult {
	/// The peer the channel is opened with.
	pub peer_id: PublicKey,
	/// The channel id assigned by the peer daemon.
	pub channel_id: String,
	/// Whether the daemon considers the commitment transactions secured.
	pub commitments_secured: bool,
	/// The funding output's index in the funding transaction.
	pub vout: u32,
}

/// The result of a successful funding run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingResult {
	/// The id of the signed funding transaction.
	pub txid: Txid,
	/// The id the node reported when accepting the transaction.
	pub broadcast_txid: Txid,
	/// The signed funding transaction, hex-encoded.
	pub tx_hex: String,
	/// One entry per opened channel, in request order.
	pub channels: Vec<FinalizeResult>,
}

/// The result of a successful batched withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawResult {
	/// The id of the signed transaction.
	pub txid: Txid,
	/// The id the node reported when accepting the transaction.
	pub broadcast_txid: Txid,
	/// The signed transaction, hex-encoded.
	pub tx_hex: String,
}

/// The outputs an externally-signed funding transaction must create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFundingStart {
	/// The identifier to hand back when completing the run.
	pub run_id: RunId,
	/// The funding outputs, one per channel, in request order.
	pub outputs: Vec<Recipient>,
}

/// Identifies a pending externally-signed funding run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub [u8; 16]);

impl RunId {
	pub(crate) fn random() -> Self {
		Self(rand::random())
	}
}

impl fmt::Display for RunId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0[..].as_hex())
	}
}

impl FromStr for RunId {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let bytes = Vec::<u8>::from_hex(s).map_err(|_| Error::UnknownRun)?;
		let bytes: [u8; 16] = bytes.try_into().map_err(|_| Error::UnknownRun)?;
		Ok(RunId(bytes))
	}
}

impl Serialize for RunId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for RunId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		RunId::from_str(&s).map_err(serde::de::Error::custom)
	}
}
