// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::chain::{BitcoindRpcClient, ChainSource};
use crate::coin_selection::CoinSelector;
use crate::config::{
	BitcoindRpcConfig, Config, LightningRpcConfig, WalletKind, WALLET_DB_FILE_NAME,
};
use crate::funder::Funder;
use crate::io::sqlite_store::WalletStore;
use crate::logger::{log_error, log_info, LogLevel, LogWriter, Logger};
use crate::peer::{ClnRpcClient, PeerClient};
use crate::signer::KeysManager;
use crate::wallet::{ExternalWallet, InternalWallet, NodeWallet, Wallet};

use bitcoin::Network;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// The length of the peer daemon's root secret.
pub const ROOT_SECRET_LEN: usize = 32;

enum ChainSourceConfig {
	BitcoindRpc(BitcoindRpcConfig),
	Custom(Arc<dyn ChainSource>),
}

enum PeerClientConfig {
	LightningRpc(LightningRpcConfig),
	Custom(Arc<dyn PeerClient>),
}

enum RootSecretConfig {
	File(PathBuf),
	Bytes([u8; ROOT_SECRET_LEN]),
}

enum LogWriterConfig {
	File { log_file_path: Option<PathBuf>, max_log_level: Option<LogLevel> },
	Log,
	Custom(Arc<dyn LogWriter>),
}

/// An error encountered during building a [`Funder`].
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
	/// No source of chain data and on-chain wallet operations was configured.
	MissingChainSource,
	/// No peer daemon was configured.
	MissingPeerClient,
	/// The root secret is missing, has an invalid length, or could not be read.
	InvalidRootSecret,
	/// We failed to setup the connection to the Bitcoin node.
	ChainSourceSetupFailed,
	/// We failed to access the given `storage_dir_path`.
	StoragePathAccessFailed,
	/// We failed to setup the wallet.
	WalletSetupFailed,
	/// We failed to setup the logger.
	LoggerSetupFailed,
}

impl fmt::Display for BuildError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Self::MissingChainSource => write!(f, "No chain source was configured."),
			Self::MissingPeerClient => write!(f, "No peer daemon was configured."),
			Self::InvalidRootSecret => write!(f, "Root secret is missing or invalid."),
			Self::ChainSourceSetupFailed => write!(f, "Failed to setup the chain source."),
			Self::StoragePathAccessFailed => write!(f, "Failed to access the given storage path."),
			Self::WalletSetupFailed => write!(f, "Failed to setup the wallet."),
			Self::LoggerSetupFailed => write!(f, "Failed to setup the logger."),
		}
	}
}

impl std::error::Error for BuildError {}

/// A builder for a [`Funder`] instance.
///
/// ### Defaults
/// - Logs are written to `logs/multifund.log` under [`Config::storage_dir_path`].
/// - The root secret of the internal wallet is read from the peer daemon's `hsm_secret`, if
///   the daemon was configured via [`Builder::set_peer_client_lightning_rpc`].
pub struct Builder {
	config: Config,
	chain_source_config: Option<ChainSourceConfig>,
	peer_client_config: Option<PeerClientConfig>,
	root_secret_config: Option<RootSecretConfig>,
	log_writer_config: Option<LogWriterConfig>,
}

impl Builder {
	/// Creates a new builder instance with the default configuration.
	pub fn new() -> Self {
		let config = Config::default();
		Self::from_config(config)
	}

	/// Creates a new builder instance from a [`Config`].
	pub fn from_config(config: Config) -> Self {
		let chain_source_config = None;
		let peer_client_config = None;
		let root_secret_config = None;
		let log_writer_config = None;
		Self { config, chain_source_config, peer_client_config, root_secret_config, log_writer_config }
	}

	/// Configures the [`Funder`] to use the Bitcoin node's JSON-RPC interface.
	pub fn set_chain_source_bitcoind_rpc(&mut self, rpc_config: BitcoindRpcConfig) -> &mut Self {
		self.chain_source_config = Some(ChainSourceConfig::BitcoindRpc(rpc_config));
		self
	}

	/// Configures the [`Funder`] to use a custom [`ChainSource`].
	pub fn set_chain_source(&mut self, chain_source: Arc<dyn ChainSource>) -> &mut Self {
		self.chain_source_config = Some(ChainSourceConfig::Custom(chain_source));
		self
	}

	/// Configures the [`Funder`] to talk to the peer daemon over its JSON-RPC socket.
	pub fn set_peer_client_lightning_rpc(&mut self, rpc_config: LightningRpcConfig) -> &mut Self {
		self.peer_client_config = Some(PeerClientConfig::LightningRpc(rpc_config));
		self
	}

	/// Configures the [`Funder`] to use a custom [`PeerClient`].
	pub fn set_peer_client(&mut self, peer_client: Arc<dyn PeerClient>) -> &mut Self {
		self.peer_client_config = Some(PeerClientConfig::Custom(peer_client));
		self
	}

	/// Configures the internal wallet to read its root secret from the given file.
	pub fn set_root_secret_path(&mut self, root_secret_path: PathBuf) -> &mut Self {
		self.root_secret_config = Some(RootSecretConfig::File(root_secret_path));
		self
	}

	/// Configures the internal wallet to use the given root secret.
	pub fn set_root_secret_bytes(&mut self, root_secret: [u8; ROOT_SECRET_LEN]) -> &mut Self {
		self.root_secret_config = Some(RootSecretConfig::Bytes(root_secret));
		self
	}

	/// Sets the used storage directory path.
	pub fn set_storage_dir_path(&mut self, storage_dir_path: String) -> &mut Self {
		self.config.storage_dir_path = storage_dir_path;
		self
	}

	/// Sets the Bitcoin network used.
	pub fn set_network(&mut self, network: Network) -> &mut Self {
		self.config.network = network;
		self
	}

	/// Sets the kind of wallet funding the runs.
	pub fn set_wallet_kind(&mut self, wallet_kind: WalletKind) -> &mut Self {
		self.config.wallet_kind = wallet_kind;
		self
	}

	/// Configures the [`Funder`] to write logs to the filesystem.
	///
	/// The `log_file_path` defaults to `logs/multifund.log` in the configured
	/// [`Config::storage_dir_path`], the `max_log_level` to [`Config::log_level`].
	pub fn set_filesystem_logger(
		&mut self, log_file_path: Option<PathBuf>, max_log_level: Option<LogLevel>,
	) -> &mut Self {
		self.log_writer_config = Some(LogWriterConfig::File { log_file_path, max_log_level });
		self
	}

	/// Configures the [`Funder`] to write logs to the [`log`](https://crates.io/crates/log) facade.
	pub fn set_log_facade_logger(&mut self) -> &mut Self {
		self.log_writer_config = Some(LogWriterConfig::Log);
		self
	}

	/// Configures the [`Funder`] to write logs to the provided custom [`LogWriter`].
	pub fn set_custom_logger(&mut self, log_writer: Arc<dyn LogWriter>) -> &mut Self {
		self.log_writer_config = Some(LogWriterConfig::Custom(log_writer));
		self
	}

	/// Builds a [`Funder`] instance according to the options previously configured.
	pub fn build(&self) -> Result<Funder, BuildError> {
		let config = Arc::new(self.config.clone());
		let logger = setup_logger(&self.log_writer_config, &config)?;

		let chain_source: Arc<dyn ChainSource> = match &self.chain_source_config {
			Some(ChainSourceConfig::BitcoindRpc(rpc_config)) => Arc::new(
				BitcoindRpcClient::new(rpc_config, Arc::clone(&logger))
					.map_err(|_| BuildError::ChainSourceSetupFailed)?,
			),
			Some(ChainSourceConfig::Custom(chain_source)) => Arc::clone(chain_source),
			None => return Err(BuildError::MissingChainSource),
		};

		let peer_client: Arc<dyn PeerClient> = match &self.peer_client_config {
			Some(PeerClientConfig::LightningRpc(rpc_config)) => Arc::new(ClnRpcClient::new(
				rpc_config.rpc_socket_path.clone(),
				Arc::clone(&logger),
			)),
			Some(PeerClientConfig::Custom(peer_client)) => Arc::clone(peer_client),
			None => return Err(BuildError::MissingPeerClient),
		};

		let store = Arc::new(
			WalletStore::new(PathBuf::from(&config.storage_dir_path), WALLET_DB_FILE_NAME)
				.map_err(|e| {
					log_error!(logger, "Failed to open wallet store: {}", e);
					BuildError::StoragePathAccessFailed
				})?,
		);

		let selector = CoinSelector::new(config.min_confirmations, config.dust_limit_sats);
		let wallet = match config.wallet_kind {
			WalletKind::Node => {
				Wallet::Node(NodeWallet::new(Arc::clone(&chain_source), selector, Arc::clone(&logger)))
			},
			WalletKind::Internal => {
				let root_secret = self.root_secret(&logger)?;
				let keys_manager =
					KeysManager::from_root_secret(&root_secret, config.network, Arc::clone(&logger))
						.map_err(|_| BuildError::WalletSetupFailed)?;
				Wallet::Internal(Arc::new(InternalWallet::new(
					Arc::clone(&chain_source),
					Arc::clone(&store),
					keys_manager,
					selector,
					config.network,
					Arc::clone(&logger),
				)))
			},
			WalletKind::External => Wallet::External(ExternalWallet::new(Arc::clone(&logger))),
		};

		log_info!(
			logger,
			"Funding with {:?} wallet on {} from {}",
			config.wallet_kind,
			config.network,
			config.storage_dir_path
		);
		Ok(Funder::new(wallet, peer_client, chain_source, store, config, logger))
	}

	fn root_secret(&self, logger: &Logger) -> Result<[u8; ROOT_SECRET_LEN], BuildError> {
		let path = match &self.root_secret_config {
			Some(RootSecretConfig::Bytes(bytes)) => return Ok(*bytes),
			Some(RootSecretConfig::File(path)) => path.clone(),
			None => match &self.peer_client_config {
				Some(PeerClientConfig::LightningRpc(LightningRpcConfig {
					hsm_secret_path: Some(path),
					..
				})) => path.clone(),
				_ => {
					log_error!(logger, "The internal wallet requires a root secret");
					return Err(BuildError::InvalidRootSecret);
				},
			},
		};

		let bytes = fs::read(&path).map_err(|e| {
			log_error!(logger, "Failed to read root secret from {}: {}", path.display(), e);
			BuildError::InvalidRootSecret
		})?;
		bytes.try_into().map_err(|bytes: Vec<u8>| {
			log_error!(
				logger,
				"Root secret in {} has {} bytes, expected {}",
				path.display(),
				bytes.len(),
				ROOT_SECRET_LEN
			);
			BuildError::InvalidRootSecret
		})
	}
}

fn setup_logger(
	log_writer_config: &Option<LogWriterConfig>, config: &Config,
) -> Result<Arc<Logger>, BuildError> {
	let logger = match log_writer_config {
		Some(LogWriterConfig::File { log_file_path, max_log_level }) => {
			let log_file_path = log_file_path.clone().unwrap_or_else(|| config.log_file_path());
			let max_log_level = max_log_level.unwrap_or(config.log_level);

			Logger::new_fs_writer(&log_file_path, max_log_level)
				.map_err(|_| BuildError::LoggerSetupFailed)?
		},
		Some(LogWriterConfig::Log) => Logger::new_log_facade(),
		Some(LogWriterConfig::Custom(custom_log_writer)) => {
			Logger::new_custom_writer(Arc::clone(custom_log_writer))
		},
		None => Logger::new_fs_writer(&config.log_file_path(), config.log_level)
			.map_err(|_| BuildError::LoggerSetupFailed)?,
	};

	Ok(Arc::new(logger))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::logger::tests::TestLogWriter;

	fn random_storage_path() -> String {
		let mut temp_path = std::env::temp_dir();
		temp_path.push(format!("multifund-builder-{}", rand::random::<u64>()));
		temp_path.to_string_lossy().into_owned()
	}

	fn builder() -> Builder {
		let mut builder = Builder::new();
		builder.set_storage_dir_path(random_storage_path());
		builder.set_custom_logger(Arc::new(TestLogWriter::default()));
		builder
	}

	#[test]
	fn collaborators_are_required() {
		assert_eq!(builder().build().err(), Some(BuildError::MissingChainSource));

		let mut builder = builder();
		builder.set_chain_source_bitcoind_rpc(BitcoindRpcConfig {
			rpc_host: "127.0.0.1".to_string(),
			rpc_port: 18443,
			rpc_user: "user".to_string(),
			rpc_password: "pass".to_string(),
		});
		assert_eq!(builder.build().err(), Some(BuildError::MissingPeerClient));

		builder.set_peer_client_lightning_rpc(LightningRpcConfig {
			rpc_socket_path: PathBuf::from("/nonexistent/lightning-rpc"),
			hsm_secret_path: None,
		});
		let funder = builder.build().unwrap();
		assert_eq!(funder.wallet_kind(), WalletKind::Node);
		assert!(funder.internal_wallet().is_none());
	}

	#[test]
	fn internal_wallet_reads_hsm_secret() {
		let storage_dir = random_storage_path();
		fs::create_dir_all(&storage_dir).unwrap();
		let hsm_secret_path = PathBuf::from(&storage_dir).join("hsm_secret");

		let mut builder = builder();
		builder.set_storage_dir_path(storage_dir);
		builder.set_wallet_kind(WalletKind::Internal);
		builder.set_chain_source_bitcoind_rpc(BitcoindRpcConfig {
			rpc_host: "127.0.0.1".to_string(),
			rpc_port: 18443,
			rpc_user: "user".to_string(),
			rpc_password: "pass".to_string(),
		});
		builder.set_peer_client_lightning_rpc(LightningRpcConfig {
			rpc_socket_path: PathBuf::from("/nonexistent/lightning-rpc"),
			hsm_secret_path: Some(hsm_secret_path.clone()),
		});
		assert_eq!(builder.build().err(), Some(BuildError::InvalidRootSecret));

		fs::write(&hsm_secret_path, [7u8; 31]).unwrap();
		assert_eq!(builder.build().err(), Some(BuildError::InvalidRootSecret));

		fs::write(&hsm_secret_path, [7u8; 32]).unwrap();
		let funder = builder.build().unwrap();
		assert_eq!(funder.wallet_kind(), WalletKind::Internal);
		assert!(funder.internal_wallet().is_some());
	}
}
