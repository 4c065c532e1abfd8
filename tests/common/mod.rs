// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

#![allow(dead_code)]

use multifund::bitcoin::hashes::Hash;
use multifund::bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use multifund::bitcoin::{
	Address, FeeRate, Network, OutPoint, PrivateKey, ScriptBuf, Transaction, Txid, WPubkeyHash,
	WScriptHash, Witness,
};
use multifund::chain::{AsyncChainResult, ChainSource};
use multifund::config::{Config, WalletKind};
use multifund::peer::{AsyncPeerResult, FundingFinalized, PeerClient};
use multifund::types::{ChannelRequest, Utxo};
use multifund::{Builder, Error, Funder};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Long enough for any configured RPC timeout to trigger.
const STALL: Duration = Duration::from_secs(30);

pub(crate) fn random_storage_path() -> PathBuf {
	let mut temp_path = std::env::temp_dir();
	temp_path.push(format!("multifund-test-{}", rand::random::<u64>()));
	temp_path
}

pub(crate) fn random_config(wallet_kind: WalletKind) -> Config {
	let mut config = Config::default();
	config.network = Network::Regtest;
	config.storage_dir_path = random_storage_path().to_string_lossy().into_owned();
	config.wallet_kind = wallet_kind;
	config.rpc_timeout_secs = 1;
	println!("Setting storage directory: {}", config.storage_dir_path);
	config
}

pub(crate) fn setup_funder(
	config: Config, chain: &std::sync::Arc<MockChain>, peers: &std::sync::Arc<MockPeers>,
) -> Funder {
	let mut builder = Builder::from_config(config);
	builder.set_chain_source(chain.clone());
	builder.set_peer_client(peers.clone());
	builder.set_root_secret_bytes([42; 32]);
	builder.build().unwrap()
}

pub(crate) fn peer_id(n: u8) -> PublicKey {
	let secp = Secp256k1::new();
	PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[n; 32]).unwrap())
}

/// The P2WSH funding address peer `n` hands out.
pub(crate) fn funding_address(n: u8) -> Address {
	let script = ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array([n; 32]));
	Address::from_script(&script, Network::Regtest).unwrap()
}

pub(crate) fn wallet_address(n: u8) -> Address {
	let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]));
	Address::from_script(&script, Network::Regtest).unwrap()
}

pub(crate) fn utxo(n: u8, amount_sats: u64, confirmations: u32) -> Utxo {
	let address = wallet_address(n);
	Utxo {
		outpoint: OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 },
		amount_sats,
		address: address.to_string(),
		script_pubkey: address.script_pubkey(),
		confirmations,
	}
}

pub(crate) fn channel(n: u8, amount_sats: u64) -> ChannelRequest {
	ChannelRequest { peer_id: peer_id(n), amount_sats, fee_rate_hint: None, announce: true }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PeerCall {
	Connect(PublicKey),
	Reserve(PublicKey),
	Finalize(PublicKey, Txid, u32),
	Cancel(PublicKey),
	Close(PublicKey),
}

/// A peer daemon recording every call it receives.
///
/// Peer `n` (as created by [`peer_id`]) hands out [`funding_address`] `n`.
#[derive(Default)]
pub(crate) struct MockPeers {
	pub(crate) calls: Mutex<Vec<PeerCall>>,
	pub(crate) funding_addresses: Mutex<HashMap<PublicKey, String>>,
	pub(crate) reject_reserve: Mutex<HashSet<PublicKey>>,
	pub(crate) reject_finalize: Mutex<HashSet<PublicKey>>,
	pub(crate) stall_finalize: Mutex<HashSet<PublicKey>>,
	pub(crate) reject_cancel: Mutex<HashSet<PublicKey>>,
}

impl MockPeers {
	pub(crate) fn with_peers(peers: &[u8]) -> Self {
		let mock = Self::default();
		{
			let mut addresses = mock.funding_addresses.lock().unwrap();
			for n in peers {
				addresses.insert(peer_id(*n), funding_address(*n).to_string());
			}
		}
		mock
	}

	pub(crate) fn calls(&self) -> Vec<PeerCall> {
		self.calls.lock().unwrap().clone()
	}

	fn record(&self, call: PeerCall) {
		self.calls.lock().unwrap().push(call);
	}
}

impl PeerClient for MockPeers {
	fn reserve_funding<'a>(
		&'a self, peer_id: &'a PublicKey, _amount_sats: u64, _announce: bool,
		_fee_rate_hint: Option<&'a str>,
	) -> AsyncPeerResult<'a, String> {
		Box::pin(async move {
			self.record(PeerCall::Reserve(*peer_id));
			tokio::task::yield_now().await;
			let reject = self.reject_reserve.lock().unwrap().contains(peer_id);
			if reject {
				return Err(Error::PeerRejected);
			}
			self.funding_addresses.lock().unwrap().get(peer_id).cloned().ok_or(Error::PeerRejected)
		})
	}

	fn finalize_funding<'a>(
		&'a self, peer_id: &'a PublicKey, txid: &'a Txid, vout: u32,
	) -> AsyncPeerResult<'a, FundingFinalized> {
		Box::pin(async move {
			self.record(PeerCall::Finalize(*peer_id, *txid, vout));
			let stall = self.stall_finalize.lock().unwrap().contains(peer_id);
			if stall {
				tokio::time::sleep(STALL).await;
			}
			tokio::task::yield_now().await;
			let reject = self.reject_finalize.lock().unwrap().contains(peer_id);
			if reject {
				return Err(Error::PeerRejected);
			}
			Ok(FundingFinalized { channel_id: format!("{}:{}", txid, vout), commitments_secured: true })
		})
	}

	fn cancel_reservation<'a>(&'a self, peer_id: &'a PublicKey) -> AsyncPeerResult<'a, ()> {
		Box::pin(async move {
			self.record(PeerCall::Cancel(*peer_id));
			if self.reject_cancel.lock().unwrap().contains(peer_id) {
				return Err(Error::PeerRejected);
			}
			Ok(())
		})
	}

	fn close_channel<'a>(&'a self, peer_id: &'a PublicKey) -> AsyncPeerResult<'a, ()> {
		Box::pin(async move {
			self.record(PeerCall::Close(*peer_id));
			Ok(())
		})
	}

	fn connect<'a>(
		&'a self, peer_id: &'a PublicKey, _host: &'a str, _port: u16,
	) -> AsyncPeerResult<'a, ()> {
		Box::pin(async move {
			self.record(PeerCall::Connect(*peer_id));
			Ok(())
		})
	}
}

/// A Bitcoin node with a fixed set of UTXOs recording what it signs and broadcasts.
pub(crate) struct MockChain {
	pub(crate) fee_rate: Mutex<Option<FeeRate>>,
	pub(crate) utxos: Mutex<Vec<Utxo>>,
	pub(crate) change_address: Address,
	pub(crate) reject_sign: Mutex<bool>,
	pub(crate) reject_broadcast: Mutex<bool>,
	pub(crate) broadcasts: Mutex<Vec<Transaction>>,
	pub(crate) transactions: Mutex<HashMap<Txid, (Transaction, u32)>>,
	pub(crate) height: Mutex<u32>,
}

impl MockChain {
	pub(crate) fn new(fee_rate: Option<FeeRate>, utxos: Vec<Utxo>) -> Self {
		Self {
			fee_rate: Mutex::new(fee_rate),
			utxos: Mutex::new(utxos),
			change_address: wallet_address(200),
			reject_sign: Mutex::new(false),
			reject_broadcast: Mutex::new(false),
			broadcasts: Mutex::new(Vec::new()),
			transactions: Mutex::new(HashMap::new()),
			height: Mutex::new(200),
		}
	}

	pub(crate) fn broadcasts(&self) -> Vec<Transaction> {
		self.broadcasts.lock().unwrap().clone()
	}
}

impl ChainSource for MockChain {
	fn estimate_fee<'a>(&'a self, _target_blocks: u16) -> AsyncChainResult<'a, Option<FeeRate>> {
		Box::pin(async move { Ok(*self.fee_rate.lock().unwrap()) })
	}

	fn list_unspent<'a>(&'a self) -> AsyncChainResult<'a, Vec<Utxo>> {
		Box::pin(async move { Ok(self.utxos.lock().unwrap().clone()) })
	}

	fn get_change_address<'a>(&'a self) -> AsyncChainResult<'a, String> {
		Box::pin(async move { Ok(self.change_address.to_string()) })
	}

	fn dump_private_key<'a>(&'a self, _address: &'a str) -> AsyncChainResult<'a, PrivateKey> {
		Box::pin(async move {
			let secret_key = SecretKey::from_slice(&[1; 32]).map_err(|_| Error::SigningKeyNotFound)?;
			Ok(PrivateKey::new(secret_key, Network::Regtest))
		})
	}

	fn sign_raw_transaction_with_key<'a>(
		&'a self, tx: &'a Transaction, keys: &'a [PrivateKey], prevouts: &'a [Utxo],
	) -> AsyncChainResult<'a, Transaction> {
		Box::pin(async move {
			assert_eq!(keys.len(), tx.input.len());
			assert_eq!(prevouts.len(), tx.input.len());
			if *self.reject_sign.lock().unwrap() {
				return Err(Error::SigningKeyNotFound);
			}
			let mut signed = tx.clone();
			for input in signed.input.iter_mut() {
				input.witness = Witness::from_slice(&[vec![1u8; 71], vec![2u8; 33]]);
			}
			Ok(signed)
		})
	}

	fn send_raw_transaction<'a>(&'a self, tx: &'a Transaction) -> AsyncChainResult<'a, Txid> {
		Box::pin(async move {
			if *self.reject_broadcast.lock().unwrap() {
				return Err(Error::BroadcastRejected);
			}
			self.broadcasts.lock().unwrap().push(tx.clone());
			Ok(tx.compute_txid())
		})
	}

	fn get_block_count<'a>(&'a self) -> AsyncChainResult<'a, u32> {
		Box::pin(async move { Ok(*self.height.lock().unwrap()) })
	}

	fn get_raw_transaction<'a>(
		&'a self, txid: &'a Txid,
	) -> AsyncChainResult<'a, (Transaction, u32)> {
		Box::pin(async move {
			self.transactions.lock().unwrap().get(txid).cloned().ok_or(Error::InvalidTransaction)
		})
	}
}
