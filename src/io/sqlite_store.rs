// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

//! Objects related to [`WalletStore`] live here.

use crate::types::{FundingOutput, RunId};

use bitcoin::{OutPoint, ScriptBuf, Txid};

use rusqlite::{named_params, Connection, OptionalExtension};

use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// The current SQLite `user_version`, which we can use if we'd ever need to do a schema migration.
const SCHEMA_USER_VERSION: u16 = 1;

/// An output paying to one of the internal wallet's keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutput {
	/// The output.
	pub outpoint: OutPoint,
	/// The value of the output.
	pub value_sats: u64,
	/// The locking script of the output.
	pub script_pubkey: ScriptBuf,
	/// The index of the key controlling the output.
	pub key_index: u32,
	/// The height of the block confirming the output's transaction, if any.
	pub confirmation_height: Option<u32>,
}

fn sql_error(context: &str, e: rusqlite::Error) -> io::Error {
	io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, e))
}

/// Keeps the internal wallet's derived addresses, its outputs, the raw transactions it learned
/// about and pending externally-signed funding runs in an [SQLite] database.
///
/// [SQLite]: https://sqlite.org
pub struct WalletStore {
	connection: Arc<Mutex<Connection>>,
}

impl WalletStore {
	/// Opens or creates the database `db_file_name` in `data_dir`.
	pub fn new(data_dir: PathBuf, db_file_name: &str) -> io::Result<Self> {
		fs::create_dir_all(data_dir.clone()).map_err(|e| {
			let msg = format!(
				"Failed to create database destination directory {}: {}",
				data_dir.display(),
				e
			);
			io::Error::new(io::ErrorKind::Other, msg)
		})?;
		let mut db_file_path = data_dir.clone();
		db_file_path.push(db_file_name);

		let connection = Connection::open(db_file_path.clone()).map_err(|e| {
			let msg =
				format!("Failed to open/create database file {}: {}", db_file_path.display(), e);
			io::Error::new(io::ErrorKind::Other, msg)
		})?;

		let version_res: u16 = connection
			.query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))
			.map_err(|e| sql_error("Failed to read PRAGMA user_version", e))?;

		if version_res == 0 {
			// New database, set our SCHEMA_USER_VERSION and continue
			connection
				.pragma(
					Some(rusqlite::DatabaseName::Main),
					"user_version",
					SCHEMA_USER_VERSION,
					|_| Ok(()),
				)
				.map_err(|e| sql_error("Failed to set PRAGMA user_version", e))?;
		} else if version_res > SCHEMA_USER_VERSION {
			let msg = format!(
				"Failed to open database: incompatible schema version {}. Expected: {}",
				version_res, SCHEMA_USER_VERSION
			);
			return Err(io::Error::new(io::ErrorKind::Other, msg));
		}

		connection
			.execute_batch(
				"CREATE TABLE IF NOT EXISTS addresses (
					scriptpubkey BLOB PRIMARY KEY,
					keyindex INTEGER NOT NULL
				);
				CREATE TABLE IF NOT EXISTS outputs (
					prev_out_tx TEXT NOT NULL,
					prev_out_index INTEGER NOT NULL,
					value INTEGER NOT NULL,
					scriptpubkey BLOB NOT NULL,
					keyindex INTEGER NOT NULL,
					confirmation_height INTEGER,
					spend_txid TEXT,
					PRIMARY KEY ( prev_out_tx, prev_out_index )
				);
				CREATE TABLE IF NOT EXISTS transactions (
					txid TEXT PRIMARY KEY,
					raw BLOB NOT NULL
				);
				CREATE TABLE IF NOT EXISTS pending_runs (
					run_id TEXT PRIMARY KEY,
					outputs TEXT NOT NULL,
					created_at INTEGER NOT NULL
				);",
			)
			.map_err(|e| sql_error("Failed to create tables", e))?;

		let connection = Arc::new(Mutex::new(connection));
		Ok(Self { connection })
	}

	fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Connection>> {
		self.connection
			.lock()
			.map_err(|_| io::Error::new(io::ErrorKind::Other, "Database connection lock poisoned"))
	}

	/// The key index following the highest one handed out so far.
	pub fn next_key_index(&self) -> io::Result<u32> {
		let locked_conn = self.lock()?;
		let max: Option<u32> = locked_conn
			.query_row("SELECT MAX(keyindex) FROM addresses", [], |row| row.get(0))
			.map_err(|e| sql_error("Failed to read key index", e))?;
		Ok(max.map_or(0, |max| max + 1))
	}

	/// Records that `script_pubkey` is controlled by the key at `key_index`. A key may control
	/// several scripts.
	pub fn insert_address(&self, key_index: u32, script_pubkey: &ScriptBuf) -> io::Result<()> {
		let locked_conn = self.lock()?;
		locked_conn
			.execute(
				"INSERT INTO addresses (keyindex, scriptpubkey) VALUES (:keyindex, :scriptpubkey);",
				named_params! {
					":keyindex": key_index,
					":scriptpubkey": script_pubkey.as_bytes(),
				},
			)
			.map_err(|e| sql_error("Failed to insert address", e))?;
		Ok(())
	}

	/// Returns the index of the key controlling `script_pubkey`, if it is one of ours.
	pub fn key_index_for_script(&self, script_pubkey: &ScriptBuf) -> io::Result<Option<u32>> {
		let locked_conn = self.lock()?;
		locked_conn
			.query_row(
				"SELECT keyindex FROM addresses WHERE scriptpubkey=:scriptpubkey;",
				named_params! { ":scriptpubkey": script_pubkey.as_bytes() },
				|row| row.get(0),
			)
			.optional()
			.map_err(|e| sql_error("Failed to look up address", e))
	}

	/// Records an output paying to one of our keys. Recording a known output again updates its
	/// confirmation height.
	pub fn insert_output(&self, output: &StoredOutput) -> io::Result<()> {
		let locked_conn = self.lock()?;
		locked_conn
			.execute(
				"INSERT INTO outputs (prev_out_tx, prev_out_index, value, scriptpubkey, keyindex, confirmation_height)
				VALUES (:prev_out_tx, :prev_out_index, :value, :scriptpubkey, :keyindex, :confirmation_height)
				ON CONFLICT(prev_out_tx, prev_out_index) DO UPDATE SET confirmation_height=excluded.confirmation_height;",
				named_params! {
					":prev_out_tx": output.outpoint.txid.to_string(),
					":prev_out_index": output.outpoint.vout,
					":value": output.value_sats as i64,
					":scriptpubkey": output.script_pubkey.as_bytes(),
					":keyindex": output.key_index,
					":confirmation_height": output.confirmation_height,
				},
			)
			.map_err(|e| sql_error("Failed to insert output", e))?;
		Ok(())
	}

	fn output_from_row(row: &rusqlite::Row) -> rusqlite::Result<StoredOutput> {
		let txid: String = row.get(0)?;
		let txid = Txid::from_str(&txid).map_err(|e| {
			rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
		})?;
		let value: i64 = row.get(2)?;
		let script: Vec<u8> = row.get(3)?;
		Ok(StoredOutput {
			outpoint: OutPoint { txid, vout: row.get(1)? },
			value_sats: value as u64,
			script_pubkey: ScriptBuf::from_bytes(script),
			key_index: row.get(4)?,
			confirmation_height: row.get(5)?,
		})
	}

	/// Lists the outputs not yet spent by a transaction we broadcast, smallest first.
	pub fn list_unspent_outputs(&self) -> io::Result<Vec<StoredOutput>> {
		let locked_conn = self.lock()?;
		let mut stmt = locked_conn
			.prepare_cached(
				"SELECT prev_out_tx, prev_out_index, value, scriptpubkey, keyindex, confirmation_height
				FROM outputs WHERE spend_txid IS NULL ORDER BY value;",
			)
			.map_err(|e| sql_error("Failed to prepare statement", e))?;
		let rows = stmt
			.query_map([], Self::output_from_row)
			.map_err(|e| sql_error("Failed to list outputs", e))?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| sql_error("Failed to read output", e))
	}

	/// Returns the output at `outpoint`, spent or not.
	pub fn get_output(&self, outpoint: &OutPoint) -> io::Result<Option<StoredOutput>> {
		let locked_conn = self.lock()?;
		locked_conn
			.query_row(
				"SELECT prev_out_tx, prev_out_index, value, scriptpubkey, keyindex, confirmation_height
				FROM outputs WHERE prev_out_tx=:prev_out_tx AND prev_out_index=:prev_out_index;",
				named_params! {
					":prev_out_tx": outpoint.txid.to_string(),
					":prev_out_index": outpoint.vout,
				},
				Self::output_from_row,
			)
			.optional()
			.map_err(|e| sql_error("Failed to read output", e))
	}

	/// Marks `outpoint` as spent by `spend_txid`.
	pub fn mark_spent(&self, outpoint: &OutPoint, spend_txid: &Txid) -> io::Result<()> {
		let locked_conn = self.lock()?;
		locked_conn
			.execute(
				"UPDATE outputs SET spend_txid=:spend_txid
				WHERE prev_out_tx=:prev_out_tx AND prev_out_index=:prev_out_index;",
				named_params! {
					":spend_txid": spend_txid.to_string(),
					":prev_out_tx": outpoint.txid.to_string(),
					":prev_out_index": outpoint.vout,
				},
			)
			.map_err(|e| sql_error("Failed to mark output spent", e))?;
		Ok(())
	}

	/// Keeps the raw bytes of a transaction relevant to the wallet.
	pub fn insert_transaction(&self, txid: &Txid, raw: &[u8]) -> io::Result<()> {
		let locked_conn = self.lock()?;
		locked_conn
			.execute(
				"INSERT OR REPLACE INTO transactions (txid, raw) VALUES (:txid, :raw);",
				named_params! { ":txid": txid.to_string(), ":raw": raw },
			)
			.map_err(|e| sql_error("Failed to insert transaction", e))?;
		Ok(())
	}

	/// Returns the raw bytes of a previously recorded transaction.
	pub fn get_transaction(&self, txid: &Txid) -> io::Result<Option<Vec<u8>>> {
		let locked_conn = self.lock()?;
		locked_conn
			.query_row(
				"SELECT raw FROM transactions WHERE txid=:txid;",
				named_params! { ":txid": txid.to_string() },
				|row| row.get(0),
			)
			.optional()
			.map_err(|e| sql_error("Failed to read transaction", e))
	}

	/// Persists the funding outputs of a run awaiting an externally-signed transaction.
	pub fn insert_pending_run(&self, run_id: &RunId, outputs: &[FundingOutput]) -> io::Result<()> {
		let outputs = serde_json::to_string(outputs)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		let created_at = chrono::Utc::now().timestamp();
		let locked_conn = self.lock()?;
		locked_conn
			.execute(
				"INSERT INTO pending_runs (run_id, outputs, created_at) VALUES (:run_id, :outputs, :created_at);",
				named_params! {
					":run_id": run_id.to_string(),
					":outputs": outputs,
					":created_at": created_at,
				},
			)
			.map_err(|e| sql_error("Failed to insert pending run", e))?;
		Ok(())
	}

	/// Removes a pending run, returning its funding outputs if it existed.
	pub fn take_pending_run(&self, run_id: &RunId) -> io::Result<Option<Vec<FundingOutput>>> {
		let mut locked_conn = self.lock()?;
		let tx = locked_conn
			.transaction()
			.map_err(|e| sql_error("Failed to start pending run transaction", e))?;
		let outputs: Option<String> = tx
			.query_row(
				"SELECT outputs FROM pending_runs WHERE run_id=:run_id;",
				named_params! { ":run_id": run_id.to_string() },
				|row| row.get(0),
			)
			.optional()
			.map_err(|e| sql_error("Failed to read pending run", e))?;
		tx.execute(
			"DELETE FROM pending_runs WHERE run_id=:run_id;",
			named_params! { ":run_id": run_id.to_string() },
		)
		.map_err(|e| sql_error("Failed to remove pending run", e))?;
		tx.commit().map_err(|e| sql_error("Failed to commit pending run removal", e))?;

		outputs
			.map(|o| serde_json::from_str(&o).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
			.transpose()
	}
}
