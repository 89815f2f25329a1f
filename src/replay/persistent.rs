// Copyright 2025 Chainflip Labs GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! RocksDB persistence for the replay store.
//!
//! Three logical buckets, one column family each:
//! - `events`: fingerprint → serialized [EventRecord]
//! - `hash_index`: fingerprint → source tx hash (operational reverse lookup)
//! - `tx_index`: chain tag + tx hash → list of fingerprints
//!
//! All writes for a single event go through one `WriteBatch`, so the buckets
//! can never disagree. A `metadata` column carries the schema version;
//! opening a database written by a newer schema fails rather than guessing.

use std::{path::Path, sync::Mutex};

use anyhow::{anyhow, bail, Context, Result};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use tracing::info;

use super::{EventRecord, Fingerprint};
use crate::primitives::{ForeignChain, CHAIN_TAG_SIZE};

/// Version of the on-disk layout this build writes. Bump it, and add a
/// migration step, whenever the persistent format changes.
const LATEST_SCHEMA_VERSION: u32 = 1;

/// Metadata key the current schema version lives under.
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Column family names
const EVENTS_COLUMN: &str = "events";
const HASH_INDEX_COLUMN: &str = "hash_index";
const TX_INDEX_COLUMN: &str = "tx_index";
const METADATA_COLUMN: &str = "metadata";

pub struct PersistentReplayDb {
	db: DB,
	/// Serializes the read-modify-write cycle of `put_record_if_absent` and
	/// `delete_older_than` so put-if-absent stays atomic under concurrent
	/// callers.
	write_lock: Mutex<()>,
}

fn tx_index_key(chain: ForeignChain, tx_hash: &str) -> Vec<u8> {
	let mut key = Vec::with_capacity(CHAIN_TAG_SIZE + tx_hash.len());
	key.extend_from_slice(&chain.tag_bytes());
	key.extend_from_slice(tx_hash.as_bytes());
	key
}

impl PersistentReplayDb {
	/// Open a replay database or create one if it doesn't exist. If the
	/// schema version of the existing database is below the latest, it will
	/// attempt to migrate to the latest version.
	pub fn open_and_migrate_to_latest(db_path: &Path) -> Result<Self> {
		Self::open_and_migrate_to_version(db_path, LATEST_SCHEMA_VERSION)
	}

	fn open_and_migrate_to_version(db_path: &Path, target_version: u32) -> Result<Self> {
		let is_new_db = !db_path.exists();

		let cfs = [EVENTS_COLUMN, HASH_INDEX_COLUMN, TX_INDEX_COLUMN, METADATA_COLUMN]
			.into_iter()
			.map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

		let mut create_missing_db_and_cols_opts = Options::default();
		create_missing_db_and_cols_opts.create_missing_column_families(true);
		create_missing_db_and_cols_opts.create_if_missing(true);

		let db = DB::open_cf_descriptors(&create_missing_db_and_cols_opts, db_path, cfs)
			.map_err(anyhow::Error::msg)
			.context(format!("Failed to open database at: {}", db_path.display()))?;

		let store = PersistentReplayDb { db, write_lock: Mutex::new(()) };
		if is_new_db {
			store.write_schema_version(0)?;
		}
		store.migrate_to(target_version).with_context(|| {
			format!(
				"Failed to migrate database at {}. Manual restoration of a backup or purging of the file is required.",
				db_path.display()
			)
		})?;
		Ok(store)
	}

	fn cf(&self, name: &'static str) -> &ColumnFamily {
		self.db
			.cf_handle(name)
			.unwrap_or_else(|| panic!("replay db is missing the `{name}` column family"))
	}

	fn schema_version(&self) -> Result<u32> {
		let raw = self
			.db
			.get_cf(self.cf(METADATA_COLUMN), SCHEMA_VERSION_KEY)?
			.ok_or_else(|| anyhow!("replay db carries no schema version entry"))?;
		let bytes: [u8; 4] =
			raw.as_slice().try_into().context("schema version entry is not 4 bytes")?;
		Ok(u32::from_be_bytes(bytes))
	}

	fn write_schema_version(&self, version: u32) -> Result<()> {
		self.db
			.put_cf(self.cf(METADATA_COLUMN), SCHEMA_VERSION_KEY, version.to_be_bytes())
			.context("Failed to write schema version")
	}

	/// Walks the migration chain up to `target_version`. Forward-only: a
	/// database written by a newer build is refused, not rewritten.
	fn migrate_to(&self, target_version: u32) -> Result<()> {
		let current_version = self.schema_version()?;
		if current_version > target_version {
			bail!(
				"replay db schema {current_version} is newer than this build supports ({target_version}); refusing to open"
			)
		}

		for version in current_version..target_version {
			info!("Replay db migrating from schema {version} to {}", version + 1);
			match version {
				0 => self.backfill_hash_index()?,
				_ => bail!("no migration path from schema {version}"),
			}
		}
		Ok(())
	}

	/// Migration 0→1. Schema 0 predates the `hash_index` bucket; rebuild it
	/// from the primary records, bumping the version in the same batch.
	fn backfill_hash_index(&self) -> Result<()> {
		let mut batch = WriteBatch::default();
		for record in self.iter_records()? {
			batch.put_cf(
				self.cf(HASH_INDEX_COLUMN),
				record.fingerprint.as_bytes(),
				record.tx_hash.as_bytes(),
			);
		}
		batch.put_cf(self.cf(METADATA_COLUMN), SCHEMA_VERSION_KEY, 1u32.to_be_bytes());
		self.db.write(batch).context("hash index backfill failed")
	}

	/// Writes the record to all three buckets atomically, unless the
	/// fingerprint already exists. Returns whether the record was written.
	pub fn put_record_if_absent(&self, record: &EventRecord) -> Result<bool> {
		let _guard = self.write_lock.lock().expect("replay db write lock poisoned");

		let fingerprint_key = record.fingerprint.as_bytes();
		if self.db.get_cf(self.cf(EVENTS_COLUMN), fingerprint_key)?.is_some() {
			return Ok(false)
		}

		let index_key = tx_index_key(record.source_chain, &record.tx_hash);
		let mut tx_fingerprints = self.fingerprints_for_tx_key(&index_key)?;
		tx_fingerprints.push(record.fingerprint);

		let mut batch = WriteBatch::default();
		batch.put_cf(
			self.cf(EVENTS_COLUMN),
			fingerprint_key,
			bincode::serialize(record).expect("Serialization is not expected to fail"),
		);
		batch.put_cf(self.cf(HASH_INDEX_COLUMN), fingerprint_key, record.tx_hash.as_bytes());
		batch.put_cf(
			self.cf(TX_INDEX_COLUMN),
			index_key,
			bincode::serialize(&tx_fingerprints).expect("Serialization is not expected to fail"),
		);
		self.db
			.write(batch)
			.map_err(|e| anyhow!("Failed to write event record to database: {e}"))?;
		Ok(true)
	}

	pub fn get_record(&self, fingerprint: &Fingerprint) -> Result<Option<EventRecord>> {
		self.db
			.get_cf(self.cf(EVENTS_COLUMN), fingerprint.as_bytes())?
			.map(|data| {
				bincode::deserialize(&data).map_err(|e| anyhow!("Deserialization failure: {e}"))
			})
			.transpose()
	}

	/// Fingerprints recorded against a source transaction, answering "did we
	/// process any event from this tx?".
	pub fn fingerprints_for_tx(
		&self,
		chain: ForeignChain,
		tx_hash: &str,
	) -> Result<Vec<Fingerprint>> {
		self.fingerprints_for_tx_key(&tx_index_key(chain, tx_hash))
	}

	fn fingerprints_for_tx_key(&self, index_key: &[u8]) -> Result<Vec<Fingerprint>> {
		self.db
			.get_cf(self.cf(TX_INDEX_COLUMN), index_key)?
			.map(|data| {
				bincode::deserialize(&data).map_err(|e| anyhow!("Deserialization failure: {e}"))
			})
			.transpose()
			.map(Option::unwrap_or_default)
	}

	/// All records with `processed_at` at or after the cutoff. Used to
	/// preload the in-memory cache on startup.
	pub fn records_since(&self, cutoff_millis: i64) -> Result<Vec<EventRecord>> {
		self.iter_records()?
			.into_iter()
			.filter(|record| record.processed_at >= cutoff_millis)
			.map(Ok)
			.collect()
	}

	/// Removes every record older than the cutoff from all three buckets in
	/// one batch. Returns the removed fingerprints so callers can evict them
	/// from caches.
	pub fn delete_older_than(&self, cutoff_millis: i64) -> Result<Vec<Fingerprint>> {
		let _guard = self.write_lock.lock().expect("replay db write lock poisoned");

		let expired: Vec<EventRecord> = self
			.iter_records()?
			.into_iter()
			.filter(|record| record.processed_at < cutoff_millis)
			.collect();
		if expired.is_empty() {
			return Ok(Vec::new())
		}

		// Group removals by index key first: multiple expired events can
		// share one source tx, and its index entry must be rewritten once.
		let mut removals_by_tx: std::collections::HashMap<Vec<u8>, Vec<Fingerprint>> =
			std::collections::HashMap::new();
		for record in &expired {
			removals_by_tx
				.entry(tx_index_key(record.source_chain, &record.tx_hash))
				.or_default()
				.push(record.fingerprint);
		}

		let mut batch = WriteBatch::default();
		for record in &expired {
			batch.delete_cf(self.cf(EVENTS_COLUMN), record.fingerprint.as_bytes());
			batch.delete_cf(self.cf(HASH_INDEX_COLUMN), record.fingerprint.as_bytes());
		}
		for (index_key, removed) in removals_by_tx {
			let remaining: Vec<Fingerprint> = self
				.fingerprints_for_tx_key(&index_key)?
				.into_iter()
				.filter(|fingerprint| !removed.contains(fingerprint))
				.collect();
			if remaining.is_empty() {
				batch.delete_cf(self.cf(TX_INDEX_COLUMN), index_key);
			} else {
				batch.put_cf(
					self.cf(TX_INDEX_COLUMN),
					index_key,
					bincode::serialize(&remaining)
						.expect("Serialization is not expected to fail"),
				);
			}
		}
		self.db.write(batch).map_err(|e| anyhow!("Failed to delete expired records: {e}"))?;

		Ok(expired.into_iter().map(|record| record.fingerprint).collect())
	}

	pub fn total_events(&self) -> Result<u64> {
		let mut count = 0u64;
		for item in self.db.iterator_cf(self.cf(EVENTS_COLUMN), rocksdb::IteratorMode::Start) {
			item.context("events column iteration failed")?;
			count += 1;
		}
		Ok(count)
	}

	pub fn unique_transactions(&self) -> Result<u64> {
		let mut count = 0u64;
		for item in self.db.iterator_cf(self.cf(TX_INDEX_COLUMN), rocksdb::IteratorMode::Start)
		{
			item.context("tx index column iteration failed")?;
			count += 1;
		}
		Ok(count)
	}

	fn iter_records(&self) -> Result<Vec<EventRecord>> {
		self.db
			.iterator_cf(self.cf(EVENTS_COLUMN), rocksdb::IteratorMode::Start)
			.map(|item| {
				let (_key, value) = item.context("events column iteration failed")?;
				bincode::deserialize(&value).map_err(|e| anyhow!("Deserialization failure: {e}"))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{event::EventKind, replay::tests_support::record_with};

	#[test]
	fn new_db_is_created_at_latest_version() {
		let dir = tempfile::tempdir().unwrap();
		let db_path = dir.path().join("replay.db");
		{
			let db = PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
			assert_eq!(db.schema_version().unwrap(), LATEST_SCHEMA_VERSION);
		}
		// Reopen succeeds.
		PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
	}

	#[test]
	fn put_is_atomic_across_buckets_and_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let db = PersistentReplayDb::open_and_migrate_to_latest(&dir.path().join("replay.db"))
			.unwrap();

		let record = record_with("0xaaa", 100, EventKind::Transfer);
		assert!(db.put_record_if_absent(&record).unwrap());
		assert!(!db.put_record_if_absent(&record).unwrap());

		assert_eq!(db.get_record(&record.fingerprint).unwrap().unwrap(), record);
		assert_eq!(
			db.fingerprints_for_tx(record.source_chain, &record.tx_hash).unwrap(),
			vec![record.fingerprint]
		);
		assert_eq!(db.total_events().unwrap(), 1);
		assert_eq!(db.unique_transactions().unwrap(), 1);
	}

	#[test]
	fn two_events_from_one_tx_share_the_index_entry() {
		let dir = tempfile::tempdir().unwrap();
		let db = PersistentReplayDb::open_and_migrate_to_latest(&dir.path().join("replay.db"))
			.unwrap();

		let first = record_with("0xshared", 100, EventKind::Transfer);
		let second = record_with("0xshared", 250, EventKind::Transfer);
		assert!(db.put_record_if_absent(&first).unwrap());
		assert!(db.put_record_if_absent(&second).unwrap());

		let fingerprints = db.fingerprints_for_tx(first.source_chain, "0xshared").unwrap();
		assert_eq!(fingerprints.len(), 2);
		assert_eq!(db.total_events().unwrap(), 2);
		assert_eq!(db.unique_transactions().unwrap(), 1);
	}

	#[test]
	fn records_survive_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let db_path = dir.path().join("replay.db");
		let record = record_with("0xdurable", 5, EventKind::Transfer);
		{
			let db = PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
			assert!(db.put_record_if_absent(&record).unwrap());
		}
		let db = PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
		assert_eq!(db.get_record(&record.fingerprint).unwrap().unwrap(), record);
		assert_eq!(db.total_events().unwrap(), 1);
	}

	#[test]
	fn delete_older_than_cleans_all_buckets() {
		let dir = tempfile::tempdir().unwrap();
		let db = PersistentReplayDb::open_and_migrate_to_latest(&dir.path().join("replay.db"))
			.unwrap();

		let mut old = record_with("0xold", 1, EventKind::Transfer);
		old.processed_at = 1_000;
		let mut fresh = record_with("0xfresh", 2, EventKind::Transfer);
		fresh.processed_at = 5_000;
		db.put_record_if_absent(&old).unwrap();
		db.put_record_if_absent(&fresh).unwrap();

		let removed = db.delete_older_than(2_000).unwrap();
		assert_eq!(removed, vec![old.fingerprint]);

		assert!(db.get_record(&old.fingerprint).unwrap().is_none());
		assert!(db.fingerprints_for_tx(old.source_chain, "0xold").unwrap().is_empty());
		assert!(db.get_record(&fresh.fingerprint).unwrap().is_some());
		assert_eq!(db.total_events().unwrap(), 1);
	}

	#[test]
	fn newer_schema_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let db_path = dir.path().join("replay.db");
		{
			let db = PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
			db.write_schema_version(LATEST_SCHEMA_VERSION + 1).unwrap();
		}
		assert!(PersistentReplayDb::open_and_migrate_to_latest(&db_path).is_err());
	}

	#[test]
	fn migration_backfills_hash_index() {
		let dir = tempfile::tempdir().unwrap();
		let db_path = dir.path().join("replay.db");
		let record = record_with("0xmigrate", 9, EventKind::Transfer);
		{
			// Write a record, then rewind the schema version and drop the
			// hash_index entry to fake a v0 database.
			let db = PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
			db.put_record_if_absent(&record).unwrap();

			db.db
				.delete_cf(db.cf(HASH_INDEX_COLUMN), record.fingerprint.as_bytes())
				.unwrap();
			db.write_schema_version(0).unwrap();
		}

		let db = PersistentReplayDb::open_and_migrate_to_latest(&db_path).unwrap();
		assert_eq!(db.schema_version().unwrap(), LATEST_SCHEMA_VERSION);
		assert_eq!(
			db.db
				.get_cf(db.cf(HASH_INDEX_COLUMN), record.fingerprint.as_bytes())
				.unwrap()
				.unwrap(),
			record.tx_hash.as_bytes()
		);
	}
}
