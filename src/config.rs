// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Objects for configuring the funder.

use crate::logger::LogLevel;

use bitcoin::Network;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Config defaults
const DEFAULT_STORAGE_DIR_PATH: &str = "/tmp/multifund/";
const DEFAULT_NETWORK: Network = Network::Bitcoin;
const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// The minimum economical output value. Surplus at or below it is never turned into change.
pub const DEFAULT_DUST_LIMIT_SATS: u64 = 546;

/// UTXOs with fewer confirmations are never selected.
pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 3;

// The confirmation target handed to `estimatesmartfee`.
const DEFAULT_FEE_TARGET_BLOCKS: u16 = 100;

/// The fee rate used whenever the node cannot give us an estimate.
pub const DEFAULT_FALLBACK_FEE_RATE_SAT_PER_VB: u64 = 2;

// The time in-between peer and node RPC calls may take before we give up on them.
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

/// The name of the SQLite database the internal wallet keeps its state in.
pub const WALLET_DB_FILE_NAME: &str = "multifund_wallet.sqlite";

/// The name of the log file written below the storage directory.
pub const LOG_FILE_NAME: &str = "multifund.log";

const DEFAULT_BITCOIND_RPC_HOST: &str = "127.0.0.1";

/// Which wallet funds the channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletKind {
	/// The Bitcoin node's own wallet holds the coins and signs.
	Node,
	/// Coins are held by keys derived locally from the peer daemon's root secret.
	Internal,
	/// Coins are held and signed outside of this process.
	External,
}

/// Represents the configuration of a [`Funder`] instance.
///
/// ### Defaults
///
/// | Parameter                          | Value              |
/// |------------------------------------|--------------------|
/// | `storage_dir_path`                 | /tmp/multifund/    |
/// | `network`                          | Bitcoin            |
/// | `wallet_kind`                      | Node               |
/// | `dust_limit_sats`                  | 546                |
/// | `min_confirmations`                | 3                  |
/// | `fee_target_blocks`                | 100                |
/// | `fallback_fee_rate_sat_per_vb`     | 2                  |
/// | `rpc_timeout_secs`                 | 30                 |
/// | `log_level`                        | Debug              |
///
/// [`Funder`]: crate::Funder
#[derive(Debug, Clone)]
pub struct Config {
	/// The path where the wallet store and logs are kept.
	pub storage_dir_path: String,
	/// The network all addresses are decoded for.
	pub network: Network,
	/// The wallet funding the channels.
	pub wallet_kind: WalletKind,
	/// Change amounts at or below this value are absorbed into the fee.
	pub dust_limit_sats: u64,
	/// The number of confirmations a UTXO needs before it may be spent.
	pub min_confirmations: u32,
	/// The confirmation target (in blocks) fee estimates are requested for.
	pub fee_target_blocks: u16,
	/// The fee rate used when the node has no estimate for us.
	pub fallback_fee_rate_sat_per_vb: u64,
	/// The maximum time a single peer daemon or node call may take.
	///
	/// A call exceeding it fails the current funding run just as an explicit error would.
	pub rpc_timeout_secs: u64,
	/// The level at which we log messages.
	///
	/// Any messages below this level will be excluded from the logs.
	pub log_level: LogLevel,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			storage_dir_path: DEFAULT_STORAGE_DIR_PATH.to_string(),
			network: DEFAULT_NETWORK,
			wallet_kind: WalletKind::Node,
			dust_limit_sats: DEFAULT_DUST_LIMIT_SATS,
			min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
			fee_target_blocks: DEFAULT_FEE_TARGET_BLOCKS,
			fallback_fee_rate_sat_per_vb: DEFAULT_FALLBACK_FEE_RATE_SAT_PER_VB,
			rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
			log_level: DEFAULT_LOG_LEVEL,
		}
	}
}

impl Config {
	pub(crate) fn rpc_timeout(&self) -> Duration {
		Duration::from_secs(self.rpc_timeout_secs)
	}

	pub(crate) fn log_file_path(&self) -> PathBuf {
		Path::new(&self.storage_dir_path).join("logs").join(LOG_FILE_NAME)
	}
}

/// Connection details of the Bitcoin node's JSON-RPC interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitcoindRpcConfig {
	/// The host the RPC server listens on.
	pub rpc_host: String,
	/// The port the RPC server listens on.
	pub rpc_port: u16,
	/// The RPC user.
	pub rpc_user: String,
	/// The RPC password.
	pub rpc_password: String,
}

impl BitcoindRpcConfig {
	/// Reads the RPC connection details from the given `bitcoin.conf` file.
	pub fn from_bitcoin_conf_file(path: &Path) -> io::Result<Self> {
		let contents = fs::read_to_string(path)?;
		Self::from_bitcoin_conf(&contents)
	}

	/// Parses the RPC connection details from the contents of a `bitcoin.conf` file.
	///
	/// `rpcuser`, `rpcpassword`, `rpcbind` and `rpcport` are honored. Without an explicit
	/// `rpcport` the port is derived from a `regtest=`/`testnet=` line, falling back to the
	/// mainnet default. Cookie authentication is not supported, so `rpcuser` and
	/// `rpcpassword` are required.
	pub fn from_bitcoin_conf(contents: &str) -> io::Result<Self> {
		let mut rpc_user = None;
		let mut rpc_password = None;
		let mut rpc_host = None;
		let mut rpc_port = None;
		let mut network_port = None;

		for line in contents.lines() {
			// Everything after a '#' is a comment.
			let line = line.split('#').next().unwrap_or("").trim();
			let (key, value) = match line.split_once('=') {
				Some((key, value)) if !value.trim().is_empty() => (key.trim(), value.trim()),
				_ => continue,
			};

			match key {
				"rpcuser" => rpc_user = Some(value.to_string()),
				"rpcpassword" => rpc_password = Some(value.to_string()),
				"rpcbind" => rpc_host = Some(value.to_string()),
				"rpcport" => {
					let port = value.parse::<u16>().map_err(|e| {
						let msg = format!("Failed to parse rpcport {}: {}", value, e);
						io::Error::new(io::ErrorKind::InvalidData, msg)
					})?;
					rpc_port = Some(port);
				},
				"regtest" => network_port = Some(18443),
				"testnet" => network_port = Some(18332),
				_ => {},
			}
		}

		let (rpc_user, rpc_password) = match (rpc_user, rpc_password) {
			(Some(user), Some(password)) => (user, password),
			_ => {
				return Err(io::Error::new(
					io::ErrorKind::InvalidData,
					"Missing rpcuser or rpcpassword in bitcoin.conf",
				));
			},
		};

		Ok(Self {
			rpc_host: rpc_host.unwrap_or(DEFAULT_BITCOIND_RPC_HOST.to_string()),
			rpc_port: rpc_port.or(network_port).unwrap_or(8332),
			rpc_user,
			rpc_password,
		})
	}
}

/// Connection details of the peer daemon and, for the internal wallet, the location of the
/// root secret keys are derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningRpcConfig {
	/// The path of the peer daemon's JSON-RPC unix socket.
	pub rpc_socket_path: PathBuf,
	/// The path of the daemon's 32-byte `hsm_secret` file. Only read by the internal wallet.
	pub hsm_secret_path: Option<PathBuf>,
}

impl LightningRpcConfig {
	/// Uses the conventional `lightning-rpc` socket and `hsm_secret` file in the given
	/// network directory of the daemon.
	pub fn from_lightning_dir(lightning_dir: &Path) -> Self {
		Self {
			rpc_socket_path: lightning_dir.join("lightning-rpc"),
			hsm_secret_path: Some(lightning_dir.join("hsm_secret")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bitcoin_conf_regtest_without_port() {
		let conf = "# local node\nregtest=1\nrpcuser=alice # inline comment\nrpcpassword=s3cret\n\nserver=1\n";
		let rpc_config = BitcoindRpcConfig::from_bitcoin_conf(conf).unwrap();
		assert_eq!(
			rpc_config,
			BitcoindRpcConfig {
				rpc_host: "127.0.0.1".to_string(),
				rpc_port: 18443,
				rpc_user: "alice".to_string(),
				rpc_password: "s3cret".to_string(),
			}
		);
	}

	#[test]
	fn bitcoin_conf_explicit_values_win() {
		let conf = "testnet=1\nrpcbind=10.0.0.2\nrpcport=19000\nrpcuser=u\nrpcpassword=p\n";
		let rpc_config = BitcoindRpcConfig::from_bitcoin_conf(conf).unwrap();
		assert_eq!(rpc_config.rpc_host, "10.0.0.2");
		assert_eq!(rpc_config.rpc_port, 19000);

		let conf = "rpcuser=u\nrpcpassword=p\n";
		assert_eq!(BitcoindRpcConfig::from_bitcoin_conf(conf).unwrap().rpc_port, 8332);
	}

	#[test]
	fn bitcoin_conf_requires_credentials() {
		assert!(BitcoindRpcConfig::from_bitcoin_conf("regtest=1\nrpcuser=u\n").is_err());
		assert!(BitcoindRpcConfig::from_bitcoin_conf("rpcuser=u\nrpcpassword=p\nrpcport=x").is_err());
	}

	#[test]
	fn config_defaults() {
		let config = Config::default();
		assert_eq!(config.dust_limit_sats, 546);
		assert_eq!(config.min_confirmations, 3);
		assert_eq!(config.wallet_kind, WalletKind::Node);
		assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
		assert!(config.log_file_path().ends_with(LOG_FILE_NAME));
	}
}
