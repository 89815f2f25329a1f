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

//! The canonical lifecycle of a bridge transfer.
//!
//! ```text
//! received → validated → deduped → submitted → confirming → completed
//!                                           \→ failed
//!                                            \→ needs_review
//! ```
//!
//! Progression is strictly forward; no state is ever re-entered. Completion
//! is only reachable with a destination tx hash in place — there is no
//! force-complete path, recovery escalates to `needs_review` instead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
	errors::RelayError,
	event::InboundEvent,
	primitives::{AssetAmount, ForeignChain},
	replay::Fingerprint,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
	Received,
	Validated,
	Deduped,
	Submitted,
	Confirming,
	Completed,
	Failed,
	NeedsReview,
}

impl TransferStatus {
	pub const ALL: [TransferStatus; 8] = [
		TransferStatus::Received,
		TransferStatus::Validated,
		TransferStatus::Deduped,
		TransferStatus::Submitted,
		TransferStatus::Confirming,
		TransferStatus::Completed,
		TransferStatus::Failed,
		TransferStatus::NeedsReview,
	];

	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			TransferStatus::Completed | TransferStatus::Failed | TransferStatus::NeedsReview
		)
	}

	/// Legal forward transitions.
	pub fn can_transition_to(&self, next: TransferStatus) -> bool {
		use TransferStatus::*;
		matches!(
			(self, next),
			(Received, Validated) |
				(Validated, Deduped) |
				(Deduped, Submitted) |
				(Deduped, Failed) |
				(Deduped, NeedsReview) |
				(Submitted, Confirming) |
				(Submitted, Failed) |
				(Submitted, NeedsReview) |
				(Confirming, Completed) |
				(Confirming, Failed) |
				(Confirming, NeedsReview)
		)
	}
}

impl std::fmt::Display for TransferStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			TransferStatus::Received => "received",
			TransferStatus::Validated => "validated",
			TransferStatus::Deduped => "deduped",
			TransferStatus::Submitted => "submitted",
			TransferStatus::Confirming => "confirming",
			TransferStatus::Completed => "completed",
			TransferStatus::Failed => "failed",
			TransferStatus::NeedsReview => "needs_review",
		};
		f.write_str(s)
	}
}

/// The bridge-internal record tracking one cross-chain move of value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
	pub id: Uuid,
	pub fingerprint: Fingerprint,
	pub source_chain: ForeignChain,
	pub dest_chain: ForeignChain,
	pub source_address: String,
	pub dest_address: String,
	pub token_symbol: String,
	pub amount: AssetAmount,
	pub status: TransferStatus,
	pub source_tx_hash: String,
	pub dest_tx_hash: Option<String>,
	pub created_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
	/// When the pipeline last did anything with this transfer; the recovery
	/// loop uses it to spot stalled work.
	pub last_attempt_at: DateTime<Utc>,
	pub retry_count: u32,
	pub last_error: Option<String>,
}

impl Transfer {
	pub fn from_event(
		event: &InboundEvent,
		fingerprint: Fingerprint,
		dest_chain: ForeignChain,
		status: TransferStatus,
	) -> Self {
		let now = Utc::now();
		Self {
			id: Uuid::new_v4(),
			fingerprint,
			source_chain: event.source_chain,
			dest_chain,
			source_address: event.from_address.clone(),
			dest_address: event.to_address.clone(),
			token_symbol: event.token_symbol.clone(),
			amount: event.amount,
			status,
			source_tx_hash: event.tx_hash.clone(),
			dest_tx_hash: None,
			created_at: now,
			completed_at: None,
			last_attempt_at: now,
			retry_count: 0,
			last_error: None,
		}
	}
}

/// Shared map of live and historical transfers. Writers hold the lock only
/// for O(1) state transitions; observers get cloned snapshots.
#[derive(Default)]
pub struct TransferStore {
	transfers: std::sync::RwLock<HashMap<Uuid, Transfer>>,
}

impl TransferStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, transfer: Transfer) -> Uuid {
		let id = transfer.id;
		self.write().insert(id, transfer);
		id
	}

	pub fn get(&self, id: &Uuid) -> Option<Transfer> {
		self.read().get(id).cloned()
	}

	/// Advances the state machine, enforcing forward-only progression and
	/// the completion invariant (`completed` requires a destination tx
	/// hash).
	pub fn transition(&self, id: &Uuid, next: TransferStatus) -> Result<(), RelayError> {
		let mut transfers = self.write();
		let transfer = transfers
			.get_mut(id)
			.ok_or_else(|| RelayError::InvariantViolation(format!("unknown transfer {id}")))?;

		if !transfer.status.can_transition_to(next) {
			return Err(RelayError::InvariantViolation(format!(
				"illegal transition {} -> {next} for transfer {id}",
				transfer.status
			)))
		}
		if next == TransferStatus::Completed && transfer.dest_tx_hash.is_none() {
			return Err(RelayError::InvariantViolation(format!(
				"transfer {id} cannot complete without a destination tx hash"
			)))
		}

		transfer.status = next;
		transfer.last_attempt_at = Utc::now();
		if next == TransferStatus::Completed {
			transfer.completed_at = Some(Utc::now());
		}
		Ok(())
	}

	/// Deduped → submitted, recording the destination tx handle.
	pub fn mark_submitted(&self, id: &Uuid, dest_tx_hash: &str) -> Result<(), RelayError> {
		{
			let mut transfers = self.write();
			let transfer = transfers
				.get_mut(id)
				.ok_or_else(|| RelayError::InvariantViolation(format!("unknown transfer {id}")))?;
			transfer.dest_tx_hash = Some(dest_tx_hash.to_string());
		}
		self.transition(id, TransferStatus::Submitted)
	}

	/// Bumps the retry bookkeeping without touching the state machine.
	pub fn record_attempt(&self, id: &Uuid, error: Option<&RelayError>) {
		if let Some(transfer) = self.write().get_mut(id) {
			transfer.last_attempt_at = Utc::now();
			if let Some(error) = error {
				transfer.retry_count += 1;
				transfer.last_error = Some(error.to_string());
			}
		}
	}

	pub fn list(
		&self,
		status: Option<TransferStatus>,
		chain: Option<ForeignChain>,
		limit: usize,
	) -> Vec<Transfer> {
		let transfers = self.read();
		let mut matching: Vec<Transfer> = transfers
			.values()
			.filter(|transfer| status.map_or(true, |status| transfer.status == status))
			.filter(|transfer| {
				chain.map_or(true, |chain| {
					transfer.source_chain == chain || transfer.dest_chain == chain
				})
			})
			.cloned()
			.collect();
		matching.sort_unstable_by_key(|transfer| std::cmp::Reverse(transfer.created_at));
		matching.truncate(limit);
		matching
	}

	pub fn counts_by_status(&self) -> HashMap<TransferStatus, usize> {
		let mut counts = HashMap::new();
		for transfer in self.read().values() {
			*counts.entry(transfer.status).or_insert(0) += 1;
		}
		counts
	}

	/// Non-terminal transfers whose last attempt is older than `stale_after`
	/// — the recovery loop's work list.
	pub fn stalled(&self, stale_after: chrono::Duration) -> Vec<Transfer> {
		let cutoff = Utc::now() - stale_after;
		self.read()
			.values()
			.filter(|transfer| {
				!transfer.status.is_terminal() && transfer.last_attempt_at < cutoff
			})
			.cloned()
			.collect()
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}

	/// Test hook: ages a transfer so the recovery loop sees it as stalled.
	#[cfg(test)]
	pub(crate) fn backdate_last_attempt(&self, id: &Uuid, by: chrono::Duration) {
		if let Some(transfer) = self.write().get_mut(id) {
			transfer.last_attempt_at -= by;
		}
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Transfer>> {
		self.transfers.read().expect("transfer store lock poisoned")
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Transfer>> {
		self.transfers.write().expect("transfer store lock poisoned")
	}
}
