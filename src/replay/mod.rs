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

//! Replay protection: a content-addressed, persistent set of processed event
//! fingerprints fronted by a bounded in-memory cache.
//!
//! The store is the dedup guarantee of the whole pipeline: `record` is an
//! atomic put-if-absent, durable before the orchestrator advances a transfer
//! past `validated`.

mod fingerprint;
mod persistent;

use std::{collections::HashMap, path::Path, sync::Mutex, time::Duration};

pub use fingerprint::{fingerprint_event, Fingerprint};
use persistent::PersistentReplayDb;

use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
	constants::{REPLAY_CACHE_EVICTION_FRACTION, REPLAY_CACHE_PRELOAD_WINDOW},
	errors::RelayError,
	event::{EventKind, InboundEvent},
	primitives::{AssetAmount, ForeignChain},
};

/// The durable trace of an event that passed dedup. Created once, never
/// mutated, destroyed only by retention cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
	pub fingerprint: Fingerprint,
	pub source_chain: ForeignChain,
	pub tx_hash: String,
	pub from_address: String,
	pub to_address: String,
	pub token_symbol: String,
	pub amount: AssetAmount,
	pub source_timestamp: i64,
	/// Milliseconds since epoch at which dedup admitted the event.
	pub processed_at: i64,
	pub event_kind: EventKind,
}

impl EventRecord {
	fn from_event(event: &InboundEvent, fingerprint: Fingerprint, processed_at: i64) -> Self {
		Self {
			fingerprint,
			source_chain: event.source_chain,
			tx_hash: event.tx_hash.clone(),
			from_address: event.from_address.clone(),
			to_address: event.to_address.clone(),
			token_symbol: event.token_symbol.clone(),
			amount: event.amount,
			source_timestamp: event.source_timestamp,
			processed_at,
			event_kind: event.kind,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
	Recorded,
	AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
	pub total_events: u64,
	pub cache_size: usize,
	pub unique_transactions: u64,
}

struct FingerprintCache {
	capacity: usize,
	records: HashMap<Fingerprint, EventRecord>,
}

impl FingerprintCache {
	fn new(capacity: usize) -> Self {
		Self { capacity, records: HashMap::with_capacity(capacity) }
	}

	fn insert(&mut self, record: EventRecord) {
		if self.records.len() >= self.capacity {
			self.evict_oldest_quarter();
		}
		self.records.insert(record.fingerprint, record);
	}

	/// Drops the oldest 25% of entries by `processed_at`. The dropped
	/// records stay available in the persistent store.
	fn evict_oldest_quarter(&mut self) {
		let to_evict = (self.records.len() / REPLAY_CACHE_EVICTION_FRACTION).max(1);
		let mut by_age: Vec<(i64, Fingerprint)> = self
			.records
			.values()
			.map(|record| (record.processed_at, record.fingerprint))
			.collect();
		by_age.sort_unstable();
		for (_, fingerprint) in by_age.into_iter().take(to_evict) {
			self.records.remove(&fingerprint);
		}
		debug!("Evicted {to_evict} fingerprints from the replay cache");
	}
}

pub struct ReplayStore {
	db: PersistentReplayDb,
	cache: Mutex<FingerprintCache>,
}

impl ReplayStore {
	/// Opens (or creates) the persistent store and preloads the cache with
	/// records from the last 24 hours.
	pub fn open(db_path: &Path, cache_size: usize) -> anyhow::Result<Self> {
		let db = PersistentReplayDb::open_and_migrate_to_latest(db_path)?;

		let mut cache = FingerprintCache::new(cache_size);
		let preload_cutoff =
			Utc::now().timestamp_millis() - REPLAY_CACHE_PRELOAD_WINDOW.as_millis() as i64;
		let mut preloaded = db.records_since(preload_cutoff)?;
		// Oldest first so that, if the window holds more than the cache can,
		// eviction keeps the newest.
		preloaded.sort_unstable_by_key(|record| record.processed_at);
		let preloaded_count = preloaded.len();
		for record in preloaded {
			cache.insert(record);
		}
		if preloaded_count > 0 {
			info!("Preloaded {preloaded_count} recent fingerprints into the replay cache");
		}

		Ok(Self { db, cache: Mutex::new(cache) })
	}

	/// Pure, deterministic content hash of the event. See
	/// [fingerprint_event].
	pub fn fingerprint(&self, event: &InboundEvent) -> Fingerprint {
		fingerprint_event(event)
	}

	/// Checks the cache first, then the persistent store.
	pub fn seen(&self, fingerprint: &Fingerprint) -> Result<Option<EventRecord>, RelayError> {
		if let Some(record) =
			self.cache.lock().expect("replay cache lock poisoned").records.get(fingerprint)
		{
			return Ok(Some(record.clone()))
		}
		self.db
			.get_record(fingerprint)
			.map_err(|e| RelayError::StorePersistence(e.to_string()))
	}

	/// Atomic put-if-absent. On `Recorded` the record is durable; on
	/// `AlreadyPresent` the store is unchanged.
	pub fn record(&self, event: &InboundEvent) -> Result<RecordOutcome, RelayError> {
		let fingerprint = fingerprint_event(event);
		let record = EventRecord::from_event(event, fingerprint, Utc::now().timestamp_millis());

		let written = self
			.db
			.put_record_if_absent(&record)
			.map_err(|e| RelayError::StorePersistence(e.to_string()))?;

		if written {
			self.cache.lock().expect("replay cache lock poisoned").insert(record);
			Ok(RecordOutcome::Recorded)
		} else {
			Ok(RecordOutcome::AlreadyPresent)
		}
	}

	/// The `n` most recently processed records, newest first. Served from
	/// the cache, which holds the preloaded last-24h window plus everything
	/// recorded since (minus any 25%-eviction).
	pub fn recent(&self, n: usize) -> Vec<EventRecord> {
		let cache = self.cache.lock().expect("replay cache lock poisoned");
		cache
			.records
			.values()
			.sorted_by_key(|record| std::cmp::Reverse(record.processed_at))
			.take(n)
			.cloned()
			.collect()
	}

	/// Operational query: fingerprints recorded against one source tx.
	pub fn fingerprints_for_tx(
		&self,
		chain: ForeignChain,
		tx_hash: &str,
	) -> Result<Vec<Fingerprint>, RelayError> {
		self.db
			.fingerprints_for_tx(chain, &tx_hash.to_lowercase())
			.map_err(|e| RelayError::StorePersistence(e.to_string()))
	}

	/// Removes records whose `processed_at` precedes `now - older_than` from
	/// the persistent buckets and the cache. Returns how many were removed.
	pub fn cleanup(&self, older_than: Duration) -> Result<usize, RelayError> {
		let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
		let removed = self
			.db
			.delete_older_than(cutoff)
			.map_err(|e| RelayError::StorePersistence(e.to_string()))?;

		let mut cache = self.cache.lock().expect("replay cache lock poisoned");
		for fingerprint in &removed {
			cache.records.remove(fingerprint);
		}
		if !removed.is_empty() {
			warn!("Replay retention cleanup removed {} records", removed.len());
		}
		Ok(removed.len())
	}

	pub fn stats(&self) -> Result<ReplayStats, RelayError> {
		let cache_size = self.cache.lock().expect("replay cache lock poisoned").records.len();
		Ok(ReplayStats {
			total_events: self
				.db
				.total_events()
				.map_err(|e| RelayError::StorePersistence(e.to_string()))?,
			cache_size,
			unique_transactions: self
				.db
				.unique_transactions()
				.map_err(|e| RelayError::StorePersistence(e.to_string()))?,
		})
	}
}

#[cfg(test)]
pub(crate) mod tests_support {
	use super::*;

	/// Builds a record (with its real fingerprint) for persistence tests.
	pub(crate) fn record_with(tx_hash: &str, amount: AssetAmount, kind: EventKind) -> EventRecord {
		let event = InboundEvent::new(
			ForeignChain::Ethereum,
			tx_hash,
			"0xfrom",
			"bhx1dest",
			"USDC",
			amount,
			1_700_000_000,
			kind,
		);
		EventRecord::from_event(&event, fingerprint_event(&event), Utc::now().timestamp_millis())
	}
}
