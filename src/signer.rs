// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Local key derivation and input signing for the internal wallet.

use crate::error::Error;
use crate::logger::{log_error, Logger};

use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, ScriptBuf, Transaction, Witness};

use hkdf::Hkdf;
use sha2::Sha256;

use std::sync::Arc;

const BIP32_SEED_INFO: &[u8] = b"bip32 seed";

/// Derives the BIP32 seed from the peer daemon's 32-byte root secret.
pub(crate) fn derive_bip32_seed(root_secret: &[u8; 32]) -> [u8; 32] {
	let hkdf = Hkdf::<Sha256>::new(Some(&[0u8]), root_secret);
	let mut seed = [0u8; 32];
	hkdf.expand(BIP32_SEED_INFO, &mut seed)
		.expect("32 bytes is a valid HKDF-SHA256 output length");
	seed
}

/// An input to sign, as recorded by the wallet when the spent output was learned about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SigningInput {
	pub(crate) vin: usize,
	pub(crate) key_index: u32,
	pub(crate) prev_script_pubkey: ScriptBuf,
	pub(crate) amount_sats: u64,
}

/// Holds the wallet's base key `m/0/0`. Keys are the non-hardened children of it.
pub(crate) struct KeysManager {
	base_xpriv: Xpriv,
	network: Network,
	secp_ctx: Secp256k1<All>,
	logger: Arc<Logger>,
}

impl KeysManager {
	pub(crate) fn from_root_secret(
		root_secret: &[u8; 32], network: Network, logger: Arc<Logger>,
	) -> Result<Self, Error> {
		let secp_ctx = Secp256k1::new();
		let seed = derive_bip32_seed(root_secret);
		let master = Xpriv::new_master(network, &seed).map_err(|e| {
			log_error!(logger, "Failed to derive master secret: {}", e);
			Error::SigningKeyNotFound
		})?;
		let base_xpriv = master
			.derive_priv(
				&secp_ctx,
				&[ChildNumber::Normal { index: 0 }, ChildNumber::Normal { index: 0 }],
			)
			.map_err(|e| {
				log_error!(logger, "Failed to derive base secret: {}", e);
				Error::SigningKeyNotFound
			})?;
		Ok(Self { base_xpriv, network, secp_ctx, logger })
	}

	fn derive_xpriv(&self, key_index: u32) -> Result<Xpriv, Error> {
		let child = ChildNumber::from_normal_idx(key_index).map_err(|e| {
			log_error!(self.logger, "Invalid key index {}: {}", key_index, e);
			Error::SigningKeyNotFound
		})?;
		self.base_xpriv.derive_priv(&self.secp_ctx, &[child]).map_err(|e| {
			log_error!(self.logger, "Failed to derive key {}: {}", key_index, e);
			Error::SigningKeyNotFound
		})
	}

	pub(crate) fn public_key(&self, key_index: u32) -> Result<CompressedPublicKey, Error> {
		let xpriv = self.derive_xpriv(key_index)?;
		Ok(CompressedPublicKey(xpriv.private_key.public_key(&self.secp_ctx)))
	}

	/// The P2WPKH script of the key at `key_index`.
	pub(crate) fn p2wpkh_script(&self, key_index: u32) -> Result<ScriptBuf, Error> {
		Ok(ScriptBuf::new_p2wpkh(&self.public_key(key_index)?.wpubkey_hash()))
	}

	/// The P2WPKH address of the key at `key_index`.
	pub(crate) fn p2wpkh_address(&self, key_index: u32) -> Result<Address, Error> {
		Ok(Address::p2wpkh(&self.public_key(key_index)?, self.network))
	}

	/// Signs the given inputs of `tx` with SIGHASH_ALL.
	///
	/// Previous outputs may be P2WPKH or P2SH-wrapped P2WPKH. Only witnesses and, for wrapped
	/// inputs, script signatures are touched. Any input whose previous script does not belong
	/// to its recorded key fails the whole call with [`Error::SigningKeyNotFound`].
	pub(crate) fn sign_transaction(
		&self, mut tx: Transaction, inputs: &[SigningInput],
	) -> Result<Transaction, Error> {
		let mut signed = Vec::with_capacity(inputs.len());
		{
			let mut sighash_cache = SighashCache::new(&tx);
			for input in inputs {
				if input.vin >= tx.input.len() {
					log_error!(self.logger, "Input {} is not part of the transaction", input.vin);
					return Err(Error::SigningKeyNotFound);
				}

				let xpriv = self.derive_xpriv(input.key_index)?;
				let public_key = CompressedPublicKey(xpriv.private_key.public_key(&self.secp_ctx));
				let witness_program = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());

				let script_sig = if input.prev_script_pubkey.is_p2sh() {
					let wrapped = ScriptBuf::new_p2sh(&witness_program.script_hash());
					if wrapped != input.prev_script_pubkey {
						log_error!(
							self.logger,
							"Key {} does not control wrapped input {}",
							input.key_index,
							input.vin
						);
						return Err(Error::SigningKeyNotFound);
					}
					let redeem_script = PushBytesBuf::try_from(witness_program.to_bytes())
						.map_err(|_| Error::SigningKeyNotFound)?;
					ScriptBuf::builder().push_slice(redeem_script).into_script()
				} else if input.prev_script_pubkey == witness_program {
					ScriptBuf::new()
				} else {
					log_error!(
						self.logger,
						"Key {} does not control input {}",
						input.key_index,
						input.vin
					);
					return Err(Error::SigningKeyNotFound);
				};

				let sighash = sighash_cache
					.p2wpkh_signature_hash(
						input.vin,
						&witness_program,
						Amount::from_sat(input.amount_sats),
						EcdsaSighashType::All,
					)
					.map_err(|e| {
						log_error!(self.logger, "Failed to compute sighash for {}: {}", input.vin, e);
						Error::SigningKeyNotFound
					})?;
				let msg = Message::from_digest(sighash.to_byte_array());
				let signature = ecdsa::Signature {
					signature: self.secp_ctx.sign_ecdsa(&msg, &xpriv.private_key),
					sighash_type: EcdsaSighashType::All,
				};
				signed.push((input.vin, script_sig, Witness::p2wpkh(&signature, &public_key.0)));
			}
		}

		for (vin, script_sig, witness) in signed {
			tx.input[vin].script_sig = script_sig;
			tx.input[vin].witness = witness;
		}
		Ok(tx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::logger::tests::test_logger;

	use bitcoin::hex::{DisplayHex, FromHex};
	use bitcoin::secp256k1::PublicKey;
	use bitcoin::{OutPoint, Sequence, TxIn, TxOut, Txid};

	fn root_secret() -> [u8; 32] {
		let bytes =
			Vec::<u8>::from_hex("1e14cd384691a92120f6702742ca0e06951aeee57e91b5e137526c0a6c0867f4")
				.unwrap();
		bytes.try_into().unwrap()
	}

	fn keys_manager() -> KeysManager {
		let (logger, _) = test_logger();
		KeysManager::from_root_secret(&root_secret(), Network::Regtest, logger).unwrap()
	}

	fn spending_tx(num_inputs: usize) -> Transaction {
		Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: (0..num_inputs)
				.map(|i| TxIn {
					previous_output: OutPoint {
						txid: Txid::from_byte_array([i as u8 + 1; 32]),
						vout: i as u32,
					},
					script_sig: ScriptBuf::new(),
					sequence: Sequence::MAX,
					witness: Witness::new(),
				})
				.collect(),
			output: vec![TxOut {
				value: Amount::from_sat(90_000),
				script_pubkey: ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::from_byte_array([9; 32])),
			}],
		}
	}

	fn verify_input(tx: &Transaction, input: &SigningInput, witness_program: &ScriptBuf) {
		let secp = Secp256k1::verification_only();
		let witness = &tx.input[input.vin].witness;
		assert_eq!(witness.len(), 2);
		let signature = ecdsa::Signature::from_slice(witness.nth(0).unwrap()).unwrap();
		assert_eq!(signature.sighash_type, EcdsaSighashType::All);
		let public_key = PublicKey::from_slice(witness.nth(1).unwrap()).unwrap();

		let sighash = SighashCache::new(tx)
			.p2wpkh_signature_hash(
				input.vin,
				witness_program,
				Amount::from_sat(input.amount_sats),
				EcdsaSighashType::All,
			)
			.unwrap();
		let msg = Message::from_digest(sighash.to_byte_array());
		secp.verify_ecdsa(&msg, &signature.signature, &public_key).unwrap();
	}

	#[test]
	fn seed_derivation_matches_known_vector() {
		assert_eq!(
			derive_bip32_seed(&root_secret()).as_hex().to_string(),
			"5a9bed3df01abd7aa0f260120530aaf1eea3ac2744648975dc23cfb25a71045d"
		);
	}

	#[test]
	fn derived_keys_are_stable_and_distinct() {
		let keys = keys_manager();
		assert_eq!(keys.p2wpkh_script(3).unwrap(), keys_manager().p2wpkh_script(3).unwrap());
		assert_ne!(keys.p2wpkh_script(3).unwrap(), keys.p2wpkh_script(4).unwrap());
		assert_eq!(keys.p2wpkh_address(3).unwrap().script_pubkey(), keys.p2wpkh_script(3).unwrap());
		assert!(keys.p2wpkh_script(1 << 31).is_err());
	}

	#[test]
	fn signs_native_and_wrapped_inputs() {
		let keys = keys_manager();
		let native = keys.p2wpkh_script(1).unwrap();
		let wrapped = ScriptBuf::new_p2sh(&keys.p2wpkh_script(2).unwrap().script_hash());
		let inputs = vec![
			SigningInput { vin: 0, key_index: 1, prev_script_pubkey: native.clone(), amount_sats: 60_000 },
			SigningInput { vin: 1, key_index: 2, prev_script_pubkey: wrapped, amount_sats: 40_000 },
		];

		let unsigned = spending_tx(2);
		let signed = keys.sign_transaction(unsigned.clone(), &inputs).unwrap();

		// Only witness data and the wrapped script_sig change.
		assert_eq!(signed.compute_ntxid(), unsigned.compute_ntxid());
		assert_eq!(signed.output, unsigned.output);
		for (signed_in, unsigned_in) in signed.input.iter().zip(unsigned.input.iter()) {
			assert_eq!(signed_in.previous_output, unsigned_in.previous_output);
		}
		assert!(signed.input[0].script_sig.is_empty());
		assert_eq!(
			signed.input[1].script_sig.as_bytes()[1..],
			keys.p2wpkh_script(2).unwrap().as_bytes()[..]
		);

		verify_input(&signed, &inputs[0], &native);
		verify_input(&signed, &inputs[1], &keys.p2wpkh_script(2).unwrap());
	}

	#[test]
	fn native_signing_keeps_txid() {
		let keys = keys_manager();
		let inputs = vec![SigningInput {
			vin: 0,
			key_index: 7,
			prev_script_pubkey: keys.p2wpkh_script(7).unwrap(),
			amount_sats: 100_000,
		}];
		let unsigned = spending_tx(1);
		let signed = keys.sign_transaction(unsigned.clone(), &inputs).unwrap();
		assert_eq!(signed.compute_txid(), unsigned.compute_txid());
		assert_ne!(signed.compute_wtxid(), unsigned.compute_wtxid());
	}

	#[test]
	fn foreign_inputs_are_fatal() {
		let keys = keys_manager();
		let inputs = vec![SigningInput {
			vin: 0,
			key_index: 1,
			prev_script_pubkey: keys.p2wpkh_script(5).unwrap(),
			amount_sats: 1_000,
		}];
		assert_eq!(
			keys.sign_transaction(spending_tx(1), &inputs),
			Err(Error::SigningKeyNotFound)
		);

		let out_of_range = vec![SigningInput { vin: 3, ..inputs[0].clone() }];
		assert_eq!(
			keys.sign_transaction(spending_tx(1), &out_of_range),
			Err(Error::SigningKeyNotFound)
		);
	}
}
