// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Access to the peer daemon which negotiates the channels.

use crate::error::Error;
use crate::logger::{log_error, log_trace, Logger};

use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;

#[cfg(unix)]
use clightningrpc::Error as ClnError;
#[cfg(unix)]
use clightningrpc::lightningrpc::LightningRPC;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// The result of an asynchronous call to the peer daemon.
pub type AsyncPeerResult<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + 'a + Send>>;

/// The peer daemon's answer to a funding finalization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FundingFinalized {
	/// The id of the channel.
	pub channel_id: String,
	/// Whether the commitment transactions are secured. From here on the channel can only be
	/// closed, not cancelled.
	pub commitments_secured: bool,
}

/// The channel funding operations of the peer daemon.
///
/// A refusal by the daemon or the remote peer is reported as [`Error::PeerRejected`], a
/// failure to reach the daemon as [`Error::NodeUnavailable`].
pub trait PeerClient: Send + Sync {
	/// Asks `peer_id` to reserve a funding output of `amount_sats`, returning the address the
	/// output has to pay to.
	fn reserve_funding<'a>(
		&'a self, peer_id: &'a PublicKey, amount_sats: u64, announce: bool,
		fee_rate_hint: Option<&'a str>,
	) -> AsyncPeerResult<'a, String>;

	/// Tells `peer_id` that its funding output is output `vout` of transaction `txid`.
	fn finalize_funding<'a>(
		&'a self, peer_id: &'a PublicKey, txid: &'a Txid, vout: u32,
	) -> AsyncPeerResult<'a, FundingFinalized>;

	/// Releases a reservation that has not been finalized.
	fn cancel_reservation<'a>(&'a self, peer_id: &'a PublicKey) -> AsyncPeerResult<'a, ()>;

	/// Requests a regular close of the channel with `peer_id`.
	fn close_channel<'a>(&'a self, peer_id: &'a PublicKey) -> AsyncPeerResult<'a, ()>;

	/// Connects to `peer_id` at `host:port`.
	fn connect<'a>(
		&'a self, peer_id: &'a PublicKey, host: &'a str, port: u16,
	) -> AsyncPeerResult<'a, ()>;
}

#[derive(Deserialize)]
struct FundChannelStartResponse {
	funding_address: String,
}

/// A [`PeerClient`] talking JSON-RPC to a c-lightning style daemon over its unix socket.
pub struct ClnRpcClient {
	#[cfg(unix)]
	rpc: Arc<LightningRPC>,
	socket_path: PathBuf,
	logger: Arc<Logger>,
}

impl ClnRpcClient {
	/// Creates a client for the daemon listening on `socket_path`.
	pub fn new(socket_path: PathBuf, logger: Arc<Logger>) -> Self {
		#[cfg(unix)]
		let rpc = Arc::new(LightningRPC::new(&socket_path));
		Self {
			#[cfg(unix)]
			rpc,
			socket_path,
			logger,
		}
	}

	// The daemon's client library is blocking, so every call runs on the blocking pool.
	#[cfg(unix)]
	async fn call_method<T: DeserializeOwned>(
		&self, method: &'static str, peer_id: &PublicKey, params: serde_json::Value,
	) -> Result<T, Error> {
		log_trace!(
			self.logger,
			"Calling {} for {} on {}",
			method,
			peer_id,
			self.socket_path.display()
		);
		let rpc = Arc::clone(&self.rpc);
		let res = tokio::task::spawn_blocking(move || {
			rpc.call::<serde_json::Value, serde_json::Value>(method, params)
		})
		.await
		.map_err(|e| {
			log_error!(self.logger, "Call to {} for {} did not complete: {}", method, peer_id, e);
			Error::NodeUnavailable
		})?;

		let result = match res {
			Ok(result) => result,
			Err(ClnError::Rpc(rpc_error)) => {
				log_error!(
					self.logger,
					"Peer daemon rejected {} for {}: {:?}",
					method,
					peer_id,
					rpc_error
				);
				return Err(Error::PeerRejected);
			},
			Err(e) => {
				log_error!(self.logger, "Failed to call {} for {}: {:?}", method, peer_id, e);
				return Err(Error::NodeUnavailable);
			},
		};
		serde_json::from_value(result).map_err(|e| {
			log_error!(self.logger, "Invalid {} response for {}: {}", method, peer_id, e);
			Error::NodeUnavailable
		})
	}

	#[cfg(not(unix))]
	async fn call_method<T: DeserializeOwned>(
		&self, method: &'static str, peer_id: &PublicKey, _params: serde_json::Value,
	) -> Result<T, Error> {
		log_error!(
			self.logger,
			"Unix sockets are unavailable, cannot call {} for {} on {}",
			method,
			peer_id,
			self.socket_path.display()
		);
		Err(Error::NodeUnavailable)
	}
}

impl PeerClient for ClnRpcClient {
	fn reserve_funding<'a>(
		&'a self, peer_id: &'a PublicKey, amount_sats: u64, announce: bool,
		fee_rate_hint: Option<&'a str>,
	) -> AsyncPeerResult<'a, String> {
		Box::pin(async move {
			let mut params = serde_json::json!({
				"id": peer_id.to_string(),
				"amount": amount_sats,
				"announce": announce,
			});
			if let Some(fee_rate) = fee_rate_hint {
				params["feerate"] = serde_json::json!(fee_rate);
			}
			let resp: FundChannelStartResponse =
				self.call_method("fundchannel_start", peer_id, params).await?;
			Ok(resp.funding_address)
		})
	}

	fn finalize_funding<'a>(
		&'a self, peer_id: &'a PublicKey, txid: &'a Txid, vout: u32,
	) -> AsyncPeerResult<'a, FundingFinalized> {
		Box::pin(async move {
			let params = serde_json::json!({
				"id": peer_id.to_string(),
				"txid": txid.to_string(),
				"txout": vout,
			});
			self.call_method("fundchannel_complete", peer_id, params).await
		})
	}

	fn cancel_reservation<'a>(&'a self, peer_id: &'a PublicKey) -> AsyncPeerResult<'a, ()> {
		Box::pin(async move {
			let params = serde_json::json!({ "id": peer_id.to_string() });
			self.call_method::<serde_json::Value>("fundchannel_cancel", peer_id, params).await.map(|_| ())
		})
	}

	fn close_channel<'a>(&'a self, peer_id: &'a PublicKey) -> AsyncPeerResult<'a, ()> {
		Box::pin(async move {
			let params = serde_json::json!({ "id": peer_id.to_string() });
			self.call_method::<serde_json::Value>("close", peer_id, params).await.map(|_| ())
		})
	}

	fn connect<'a>(
		&'a self, peer_id: &'a PublicKey, host: &'a str, port: u16,
	) -> AsyncPeerResult<'a, ()> {
		Box::pin(async move {
			let params = serde_json::json!({
				"id": peer_id.to_string(),
				"host": host,
				"port": port,
			});
			self.call_method::<serde_json::Value>("connect", peer_id, params).await.map(|_| ())
		})
	}
}
