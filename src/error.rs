// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use bitcoin::secp256k1::PublicKey;

use std::fmt;

use crate::funder::FundingState;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// An error that possibly needs to be handled by the user.
pub enum Error {
	/// The wallet does not hold enough eligible funds to cover the outputs and the fee.
	InsufficientFunds,
	/// A peer refused to reserve or to finalize a channel funding output.
	PeerRejected,
	/// An address could not be decoded for the configured network.
	InvalidAddress,
	/// A funding output could not be located unambiguously in the funding transaction.
	ScriptMismatch,
	/// No signing key or previous output could be found for a transaction input.
	SigningKeyNotFound,
	/// The Bitcoin node or the peer daemon could not be reached.
	NodeUnavailable,
	/// A call to the Bitcoin node or the peer daemon did not return in time.
	Timeout,
	/// The Bitcoin node refused to accept the funding transaction.
	BroadcastRejected,
	/// The given request is malformed, e.g., it is empty or lists the same peer twice.
	InvalidRequest,
	/// A transaction could not be decoded or is otherwise invalid.
	InvalidTransaction,
	/// No pending externally-signed funding run is known for the given identifier.
	UnknownRun,
	/// Reading or writing the local wallet store failed.
	PersistenceFailed,
	/// The configured wallet kind does not support the requested operation.
	WalletOperationUnsupported,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Self::InsufficientFunds => {
				write!(f, "There are insufficient funds to complete the given operation.")
			},
			Self::PeerRejected => write!(f, "A peer rejected the channel funding request."),
			Self::InvalidAddress => write!(f, "The given address is invalid."),
			Self::ScriptMismatch => {
				write!(f, "A funding output could not be matched in the funding transaction.")
			},
			Self::SigningKeyNotFound => {
				write!(f, "No signing key could be found for a transaction input.")
			},
			Self::NodeUnavailable => write!(f, "The remote node could not be reached."),
			Self::Timeout => write!(f, "The remote call timed out."),
			Self::BroadcastRejected => write!(f, "The funding transaction was rejected."),
			Self::InvalidRequest => write!(f, "The given request is invalid."),
			Self::InvalidTransaction => write!(f, "The given transaction is invalid."),
			Self::UnknownRun => write!(f, "No pending funding run is known for the given id."),
			Self::PersistenceFailed => write!(f, "Failed to persist data."),
			Self::WalletOperationUnsupported => {
				write!(f, "The configured wallet does not support this operation.")
			},
		}
	}
}

impl std::error::Error for Error {}

/// The terminating error of a funding run.
///
/// Carries the state the run was in when it failed, the channel which caused the failure (if
/// known), the state the run was rolled back to, and the original cause. Failures of the
/// compensating calls themselves are only logged and never replace the original cause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingError {
	/// The state the funding run was in when the failure occurred.
	pub failed_in: FundingState,
	/// The state the funding run ended up in after compensation.
	pub rolled_back_to: FundingState,
	/// The peer whose channel caused the failure, if the failure can be attributed to one.
	pub peer_id: Option<PublicKey>,
	/// The original cause.
	pub error: Error,
}

impl fmt::Display for FundingError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self.peer_id {
			Some(peer_id) => write!(
				f,
				"Funding run failed in state {:?} for channel with {}: {} Rolled back to {:?}.",
				self.failed_in, peer_id, self.error, self.rolled_back_to
			),
			None => write!(
				f,
				"Funding run failed in state {:?}: {} Rolled back to {:?}.",
				self.failed_in, self.error, self.rolled_back_to
			),
		}
	}
}

impl std::error::Error for FundingError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(&self.error)
	}
}

impl From<FundingError> for Error {
	fn from(e: FundingError) -> Self {
		e.error
	}
}
