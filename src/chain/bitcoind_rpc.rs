// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use super::{AsyncChainResult, ChainSource};
use crate::config::BitcoindRpcConfig;
use crate::error::Error;
use crate::logger::{log_error, log_trace, Logger};
use crate::types::Utxo;

use lightning_block_sync::http::{HttpEndpoint, JsonResponse};
use lightning_block_sync::rpc::{RpcClient, RpcError};

use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::hex::FromHex;
use bitcoin::{Amount, FeeRate, OutPoint, PrivateKey, ScriptBuf, Transaction, Txid};

use base64::prelude::{Engine, BASE64_STANDARD};

use serde::Deserialize;

use std::str::FromStr;
use std::sync::Arc;

/// A [`ChainSource`] talking to Bitcoin Core's JSON-RPC interface.
pub struct BitcoindRpcClient {
	rpc_client: Arc<RpcClient>,
	logger: Arc<Logger>,
}

impl BitcoindRpcClient {
	/// Creates a client for the node described by `rpc_config`.
	pub fn new(rpc_config: &BitcoindRpcConfig, logger: Arc<Logger>) -> Result<Self, Error> {
		let http_endpoint =
			HttpEndpoint::for_host(rpc_config.rpc_host.clone()).with_port(rpc_config.rpc_port);
		let rpc_credentials = BASE64_STANDARD
			.encode(format!("{}:{}", rpc_config.rpc_user, rpc_config.rpc_password));
		let rpc_client = RpcClient::new(&rpc_credentials, http_endpoint);
		Ok(Self { rpc_client: Arc::new(rpc_client), logger })
	}

	// Errors returned by the node itself map to `rejected`, everything else means we could not
	// talk to it.
	fn map_rpc_error(&self, method: &str, e: std::io::Error, rejected: Error) -> Error {
		match e.get_ref().and_then(|inner| inner.downcast_ref::<RpcError>()) {
			Some(rpc_error) => {
				log_error!(
					self.logger,
					"Bitcoind rejected call to {} with code {}: {}",
					method,
					rpc_error.code,
					rpc_error.message
				);
				rejected
			},
			None => {
				log_error!(self.logger, "Failed to call bitcoind method {}: {}", method, e);
				Error::NodeUnavailable
			},
		}
	}
}

fn invalid_data(msg: impl ToString) -> std::io::Error {
	std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn decode_tx_hex(tx_hex: &str) -> std::io::Result<Transaction> {
	let bytes = Vec::<u8>::from_hex(tx_hex).map_err(invalid_data)?;
	deserialize(&bytes).map_err(invalid_data)
}

pub(crate) struct FeeResponse(pub Option<FeeRate>);

impl TryInto<FeeResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<FeeResponse> {
		// Without enough data the node answers with `errors` and no `feerate`.
		let fee_rate_btc_per_kvbyte = match self.0["feerate"].as_f64() {
			Some(rate) if rate > 0.0 => rate,
			_ => return Ok(FeeResponse(None)),
		};
		// Bitcoin Core gives us a feerate in BTC/KvB.
		// Thus, we multiply by 25_000_000 (10^8 / 4) to get satoshis/kwu.
		let fee_rate = {
			let fee_rate_sat_per_kwu = (fee_rate_btc_per_kvbyte * 25_000_000.0).round() as u64;
			FeeRate::from_sat_per_kwu(fee_rate_sat_per_kwu)
		};
		Ok(FeeResponse(Some(fee_rate)))
	}
}

#[derive(Deserialize)]
struct ListUnspentEntry {
	txid: Txid,
	vout: u32,
	#[serde(default)]
	address: Option<String>,
	#[serde(rename = "scriptPubKey")]
	script_pubkey: String,
	amount: f64,
	confirmations: u32,
}

pub(crate) struct ListUnspentResponse(pub Vec<Utxo>);

impl TryInto<ListUnspentResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<ListUnspentResponse> {
		let entries: Vec<ListUnspentEntry> = serde_json::from_value(self.0).map_err(invalid_data)?;
		let mut utxos = Vec::with_capacity(entries.len());
		for entry in entries {
			let amount = Amount::from_btc(entry.amount).map_err(invalid_data)?;
			let script_pubkey = ScriptBuf::from_hex(&entry.script_pubkey).map_err(invalid_data)?;
			utxos.push(Utxo {
				outpoint: OutPoint { txid: entry.txid, vout: entry.vout },
				amount_sats: amount.to_sat(),
				address: entry.address.unwrap_or_default(),
				script_pubkey,
				confirmations: entry.confirmations,
			});
		}
		Ok(ListUnspentResponse(utxos))
	}
}

pub(crate) struct AddressResponse(pub String);

impl TryInto<AddressResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<AddressResponse> {
		let address = self.0.as_str().ok_or_else(|| invalid_data("expected an address"))?;
		Ok(AddressResponse(address.to_string()))
	}
}

pub(crate) struct PrivateKeyResponse(pub PrivateKey);

impl TryInto<PrivateKeyResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<PrivateKeyResponse> {
		let wif = self.0.as_str().ok_or_else(|| invalid_data("expected a WIF private key"))?;
		PrivateKey::from_str(wif).map(PrivateKeyResponse).map_err(invalid_data)
	}
}

pub(crate) struct SignedTransactionResponse {
	pub tx: Transaction,
	pub complete: bool,
}

impl TryInto<SignedTransactionResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<SignedTransactionResponse> {
		let hex = self.0["hex"].as_str().ok_or_else(|| invalid_data("expected a hex transaction"))?;
		let complete = self.0["complete"].as_bool().unwrap_or(false);
		Ok(SignedTransactionResponse { tx: decode_tx_hex(hex)?, complete })
	}
}

pub(crate) struct BlockCountResponse(pub u32);

impl TryInto<BlockCountResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<BlockCountResponse> {
		let height = self
			.0
			.as_u64()
			.and_then(|h| u32::try_from(h).ok())
			.ok_or_else(|| invalid_data("expected a block height"))?;
		Ok(BlockCountResponse(height))
	}
}

pub(crate) struct RawTransactionResponse {
	pub tx: Transaction,
	pub confirmations: u32,
}

impl TryInto<RawTransactionResponse> for JsonResponse {
	type Error = std::io::Error;
	fn try_into(self) -> std::io::Result<RawTransactionResponse> {
		let hex = self.0["hex"].as_str().ok_or_else(|| invalid_data("expected a hex transaction"))?;
		// Unconfirmed transactions come without a confirmation count.
		let confirmations = self.0["confirmations"].as_u64().unwrap_or(0) as u32;
		Ok(RawTransactionResponse { tx: decode_tx_hex(hex)?, confirmations })
	}
}

impl ChainSource for BitcoindRpcClient {
	fn estimate_fee<'a>(&'a self, target_blocks: u16) -> AsyncChainResult<'a, Option<FeeRate>> {
		Box::pin(async move {
			log_trace!(self.logger, "Estimating fee rate for {} blocks", target_blocks);
			let target_blocks_json = serde_json::json!(target_blocks);
			self.rpc_client
				.call_method::<FeeResponse>("estimatesmartfee", &[target_blocks_json])
				.await
				.map(|resp| resp.0)
				.map_err(|e| self.map_rpc_error("estimatesmartfee", e, Error::NodeUnavailable))
		})
	}

	fn list_unspent<'a>(&'a self) -> AsyncChainResult<'a, Vec<Utxo>> {
		Box::pin(async move {
			self.rpc_client
				.call_method::<ListUnspentResponse>("listunspent", &[])
				.await
				.map(|resp| resp.0)
				.map_err(|e| self.map_rpc_error("listunspent", e, Error::NodeUnavailable))
		})
	}

	fn get_change_address<'a>(&'a self) -> AsyncChainResult<'a, String> {
		Box::pin(async move {
			self.rpc_client
				.call_method::<AddressResponse>("getrawchangeaddress", &[serde_json::json!("bech32")])
				.await
				.map(|resp| resp.0)
				.map_err(|e| self.map_rpc_error("getrawchangeaddress", e, Error::NodeUnavailable))
		})
	}

	fn dump_private_key<'a>(&'a self, address: &'a str) -> AsyncChainResult<'a, PrivateKey> {
		Box::pin(async move {
			self.rpc_client
				.call_method::<PrivateKeyResponse>("dumpprivkey", &[serde_json::json!(address)])
				.await
				.map(|resp| resp.0)
				.map_err(|e| self.map_rpc_error("dumpprivkey", e, Error::SigningKeyNotFound))
		})
	}

	fn sign_raw_transaction_with_key<'a>(
		&'a self, tx: &'a Transaction, keys: &'a [PrivateKey], prevouts: &'a [Utxo],
	) -> AsyncChainResult<'a, Transaction> {
		Box::pin(async move {
			let wifs: Vec<String> = keys.iter().map(|k| k.to_wif()).collect();
			let prevtxs: Vec<serde_json::Value> = prevouts
				.iter()
				.map(|u| {
					serde_json::json!({
						"txid": u.outpoint.txid.to_string(),
						"vout": u.outpoint.vout,
						"scriptPubKey": u.script_pubkey.to_hex_string(),
						"amount": Amount::from_sat(u.amount_sats).to_btc(),
					})
				})
				.collect();
			let params =
				[serde_json::json!(serialize_hex(tx)), serde_json::json!(wifs), serde_json::json!(prevtxs)];

			let resp = self
				.rpc_client
				.call_method::<SignedTransactionResponse>("signrawtransactionwithkey", &params)
				.await
				.map_err(|e| {
					self.map_rpc_error("signrawtransactionwithkey", e, Error::SigningKeyNotFound)
				})?;

			if !resp.complete {
				log_error!(self.logger, "Bitcoind could not sign all inputs of {}", tx.compute_txid());
				return Err(Error::SigningKeyNotFound);
			}
			Ok(resp.tx)
		})
	}

	fn send_raw_transaction<'a>(&'a self, tx: &'a Transaction) -> AsyncChainResult<'a, Txid> {
		Box::pin(async move {
			let tx_json = serde_json::json!(serialize_hex(tx));
			self.rpc_client
				.call_method::<Txid>("sendrawtransaction", &[tx_json])
				.await
				.map_err(|e| self.map_rpc_error("sendrawtransaction", e, Error::BroadcastRejected))
		})
	}

	fn get_block_count<'a>(&'a self) -> AsyncChainResult<'a, u32> {
		Box::pin(async move {
			self.rpc_client
				.call_method::<BlockCountResponse>("getblockcount", &[])
				.await
				.map(|resp| resp.0)
				.map_err(|e| self.map_rpc_error("getblockcount", e, Error::NodeUnavailable))
		})
	}

	fn get_raw_transaction<'a>(&'a self, txid: &'a Txid) -> AsyncChainResult<'a, (Transaction, u32)> {
		Box::pin(async move {
			let params = [serde_json::json!(txid.to_string()), serde_json::json!(true)];
			self.rpc_client
				.call_method::<RawTransactionResponse>("getrawtransaction", &params)
				.await
				.map(|resp| (resp.tx, resp.confirmations))
				.map_err(|e| self.map_rpc_error("getrawtransaction", e, Error::InvalidTransaction))
		})
	}
}
