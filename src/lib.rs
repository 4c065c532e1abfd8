// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

#![crate_name = "multifund"]

//! A library opening several Lightning channels from a single on-chain funding transaction.
//!
//! Channels are negotiated through a Lightning peer daemon while coins, fee estimates and
//! broadcasting are provided by a Bitcoin node. Either all requested channels are opened and
//! the funding transaction is broadcast, or every step taken so far is compensated:
//! - reservations are cancelled as long as no peer considers its channel secured,
//! - channels already secured are closed afterwards.
//!
//! Funding runs may be paid from the Bitcoin node's wallet, from a wallet whose keys are
//! derived from the peer daemon's root secret, or from an external wallet signing the
//! transaction out of band.
//!
//! ```no_run
//! use multifund::config::{BitcoindRpcConfig, LightningRpcConfig};
//! use multifund::types::ChannelRequest;
//! use multifund::Builder;
//!
//! use std::path::Path;
//! use std::str::FromStr;
//!
//! # async fn run() {
//! let bitcoind = BitcoindRpcConfig::from_bitcoin_conf_file(Path::new("/home/user/.bitcoin/bitcoin.conf")).unwrap();
//! let lightning = LightningRpcConfig::from_lightning_dir(Path::new("/home/user/.lightning/regtest"));
//!
//! let mut builder = Builder::new();
//! builder.set_network(multifund::bitcoin::Network::Regtest);
//! builder.set_chain_source_bitcoind_rpc(bitcoind);
//! builder.set_peer_client_lightning_rpc(lightning);
//! let funder = builder.build().unwrap();
//!
//! let peer_id = multifund::bitcoin::secp256k1::PublicKey::from_str(
//! 	"02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619",
//! )
//! .unwrap();
//! let channel = ChannelRequest { peer_id, amount_sats: 100_000, fee_rate_hint: None, announce: true };
//! let result = funder.open_multi(vec![channel]).await.unwrap();
//! println!("Broadcast funding transaction {}", result.txid);
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![allow(bare_trait_objects)]
#![allow(ellipsis_inclusive_range_patterns)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod builder;
pub mod chain;
mod coin_selection;
pub mod config;
mod error;
mod fee_estimator;
mod funder;
pub mod io;
pub mod logger;
pub mod peer;
mod signer;
pub mod tx_builder;
pub mod types;
mod wallet;

pub use bitcoin;

pub use builder::{BuildError, Builder, ROOT_SECRET_LEN};
pub use error::{Error, FundingError};
pub use funder::{Funder, FundingState};
pub use wallet::InternalWallet;
