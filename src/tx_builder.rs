// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Assembly and wire encoding of funding transactions.

use crate::error::Error;
use crate::types::{Recipient, Utxo};

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize, serialize, serialize_hex};
use bitcoin::hex::FromHex;
use bitcoin::transaction::Version;
use bitcoin::{
	Address, Amount, Network, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use std::str::FromStr;

/// Decodes `address`, requiring it to be valid for `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, Error> {
	Address::from_str(address)
		.map_err(|_| Error::InvalidAddress)?
		.require_network(network)
		.map_err(|_| Error::InvalidAddress)
}

/// Builds the unsigned transaction spending `utxos` to `recipients`.
///
/// Inputs follow the order of `utxos` and outputs follow the order of `recipients`, so the
/// position of a recipient is its vout.
pub fn build_unsigned_transaction(
	recipients: &[Recipient], utxos: &[Utxo], network: Network,
) -> Result<Transaction, Error> {
	let input = utxos
		.iter()
		.map(|utxo| TxIn {
			previous_output: utxo.outpoint,
			script_sig: ScriptBuf::new(),
			sequence: Sequence::MAX,
			witness: Witness::new(),
		})
		.collect();

	let output = recipients
		.iter()
		.map(|recipient| {
			let address = parse_address(&recipient.address, network)?;
			Ok(TxOut {
				value: Amount::from_sat(recipient.amount_sats),
				script_pubkey: address.script_pubkey(),
			})
		})
		.collect::<Result<Vec<_>, Error>>()?;

	Ok(Transaction { version: Version::TWO, lock_time: LockTime::ZERO, input, output })
}

/// Encodes `tx` in the standard wire format, witnesses included.
pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
	serialize(tx)
}

/// Decodes a transaction from the standard wire format.
pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction, Error> {
	deserialize(bytes).map_err(|_| Error::InvalidTransaction)
}

/// Hex-encodes `tx` in the standard wire format.
pub fn encode_transaction_hex(tx: &Transaction) -> String {
	serialize_hex(tx)
}

/// Decodes a hex-encoded transaction.
pub fn decode_transaction_hex(tx_hex: &str) -> Result<Transaction, Error> {
	let bytes = Vec::<u8>::from_hex(tx_hex.trim()).map_err(|_| Error::InvalidTransaction)?;
	decode_transaction(&bytes)
}

/// Returns the index of the only output of `tx` locked to `script_pubkey` with a value of
/// exactly `amount_sats`.
///
/// A script found with the wrong amount, a missing script, or several matching outputs are
/// all reported as [`Error::ScriptMismatch`].
pub fn find_funding_output(
	tx: &Transaction, script_pubkey: &Script, amount_sats: u64,
) -> Result<u32, Error> {
	let mut found = None;
	for (vout, output) in tx.output.iter().enumerate() {
		if output.script_pubkey.as_script() != script_pubkey {
			continue;
		}
		if output.value.to_sat() != amount_sats || found.is_some() {
			return Err(Error::ScriptMismatch);
		}
		found = Some(vout as u32);
	}
	found.ok_or(Error::ScriptMismatch)
}
