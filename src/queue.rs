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

//! Deferred retries and their graveyard.
//!
//! The retry queue holds work whose inline retries were exhausted; a single
//! consumer redelivers each item once its `next_retry_at` passes, backing off
//! quadratically between attempts. Exhausted items land in the bounded
//! dead-letter queue, which is observable and operator-reinjectable but
//! never reprocessed automatically.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::Mutex,
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::constants::RETRY_QUEUE_MAX_ATTEMPTS;

/// What to re-invoke for a queued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOp {
	/// Submit (or re-submit) the transfer on the destination chain.
	Submit,
	/// Poll the destination for outstanding confirmations.
	Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryItem {
	pub item_id: Uuid,
	pub transfer_id: Uuid,
	pub op: RetryOp,
	pub attempts: u32,
	pub max_attempts: u32,
	pub next_retry_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub last_error: Option<String>,
}

impl RetryItem {
	pub fn new(transfer_id: Uuid, op: RetryOp, last_error: Option<String>) -> Self {
		let now = Utc::now();
		Self {
			item_id: Uuid::new_v4(),
			transfer_id,
			op,
			attempts: 0,
			max_attempts: RETRY_QUEUE_MAX_ATTEMPTS,
			next_retry_at: now,
			created_at: now,
			last_error,
		}
	}

	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = max_attempts;
		self
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
	Queued,
	/// The queue was full; the item went straight to the DLQ.
	OverflowedToDlq,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RescheduleOutcome {
	Requeued,
	/// Attempts exhausted; the item moved to the DLQ.
	Exhausted,
	/// The queue filled up between delivery and reschedule.
	OverflowedToDlq,
}

/// Bounded delay queue ordered by due time. Producers never block: a full
/// queue spills to the DLQ (and the caller counts the spill).
pub struct RetryQueue {
	items: Mutex<BTreeMap<(DateTime<Utc>, Uuid), RetryItem>>,
	capacity: usize,
	notify: Notify,
}

impl RetryQueue {
	pub fn new(capacity: usize) -> Self {
		Self { items: Mutex::new(BTreeMap::new()), capacity, notify: Notify::new() }
	}

	pub fn push(&self, item: RetryItem, dlq: &DeadLetterQueue) -> PushOutcome {
		{
			let mut items = self.lock();
			if items.len() >= self.capacity {
				drop(items);
				warn!(
					"Retry queue full ({}); moving item for transfer {} to the DLQ",
					self.capacity, item.transfer_id
				);
				dlq.push(item);
				return PushOutcome::OverflowedToDlq
			}
			items.insert((item.next_retry_at, item.item_id), item);
		}
		self.notify.notify_one();
		PushOutcome::Queued
	}

	/// Waits for the earliest item to come due and pops it. Returns `None`
	/// on cancellation.
	pub async fn next_due(&self, cancel: &CancellationToken) -> Option<RetryItem> {
		loop {
			let wait = {
				let mut items = self.lock();
				match items.keys().next().copied() {
					None => None,
					Some(key @ (due, _)) => {
						let now = Utc::now();
						if due <= now {
							return items.remove(&key)
						}
						Some((due - now).to_std().unwrap_or(Duration::ZERO))
					},
				}
			};

			tokio::select! {
				_ = cancel.cancelled() => return None,
				_ = self.notify.notified() => {},
				_ = async {
					match wait {
						Some(wait) => tokio::time::sleep(wait).await,
						None => std::future::pending().await,
					}
				} => {},
			}
		}
	}

	/// Called by the consumer after a failed redelivery: bumps the attempt
	/// count and either requeues with quadratic backoff or exhausts to the
	/// DLQ.
	pub fn reschedule(
		&self,
		mut item: RetryItem,
		error: String,
		dlq: &DeadLetterQueue,
	) -> RescheduleOutcome {
		item.attempts += 1;
		item.last_error = Some(error);

		if item.attempts >= item.max_attempts {
			warn!(
				"Retry item for transfer {} exhausted after {} attempts; dead-lettering",
				item.transfer_id, item.attempts
			);
			dlq.push(item);
			return RescheduleOutcome::Exhausted
		}

		item.next_retry_at =
			Utc::now() + chrono::Duration::seconds((item.attempts as i64).pow(2));
		match self.push(item, dlq) {
			PushOutcome::Queued => RescheduleOutcome::Requeued,
			PushOutcome::OverflowedToDlq => RescheduleOutcome::OverflowedToDlq,
		}
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	/// Whether a pending item already covers this transfer. The recovery
	/// loop leaves such transfers to the queue.
	pub fn contains_transfer(&self, transfer_id: &Uuid) -> bool {
		self.lock().values().any(|item| item.transfer_id == *transfer_id)
	}

	/// Empties the queue, returning everything that was pending. Used at
	/// shutdown to journal unfinished work.
	pub fn drain(&self) -> Vec<RetryItem> {
		let mut items = self.lock();
		let drained = std::mem::take(&mut *items);
		drained.into_values().collect()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(DateTime<Utc>, Uuid), RetryItem>> {
		self.items.lock().expect("retry queue lock poisoned")
	}
}

/// Terminal holding area for exhausted items. Bounded; the oldest entry is
/// dropped (and logged) when full.
pub struct DeadLetterQueue {
	items: Mutex<VecDeque<RetryItem>>,
	capacity: usize,
}

impl DeadLetterQueue {
	pub fn new(capacity: usize) -> Self {
		Self { items: Mutex::new(VecDeque::new()), capacity }
	}

	pub fn push(&self, item: RetryItem) {
		let mut items = self.lock();
		if items.len() >= self.capacity {
			if let Some(dropped) = items.pop_front() {
				warn!(
					"DLQ full ({}); dropping oldest item for transfer {}",
					self.capacity, dropped.transfer_id
				);
			}
		}
		items.push_back(item);
	}

	pub fn snapshot(&self) -> Vec<RetryItem> {
		self.lock().iter().cloned().collect()
	}

	/// Removes and returns items for operator re-injection. With no id,
	/// takes everything.
	pub fn take_matching(&self, transfer_id: Option<Uuid>) -> Vec<RetryItem> {
		let mut items = self.lock();
		match transfer_id {
			None => items.drain(..).collect(),
			Some(id) => {
				let (taken, kept): (VecDeque<_>, VecDeque<_>) =
					items.drain(..).partition(|item| item.transfer_id == id);
				*items = kept;
				taken.into_iter().collect()
			},
		}
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RetryItem>> {
		self.items.lock().expect("dead letter queue lock poisoned")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_retry_queue_spills_to_dlq() {
		let queue = RetryQueue::new(2);
		let dlq = DeadLetterQueue::new(10);

		assert_eq!(
			queue.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None), &dlq),
			PushOutcome::Queued
		);
		assert_eq!(
			queue.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None), &dlq),
			PushOutcome::Queued
		);
		assert_eq!(
			queue.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None), &dlq),
			PushOutcome::OverflowedToDlq
		);
		assert_eq!(queue.len(), 2);
		assert_eq!(dlq.len(), 1);
	}

	#[test]
	fn reschedule_applies_quadratic_backoff() {
		let queue = RetryQueue::new(10);
		let dlq = DeadLetterQueue::new(10);
		let item = RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None);

		let before = Utc::now();
		assert_eq!(
			queue.reschedule(item, "boom".to_string(), &dlq),
			RescheduleOutcome::Requeued
		);

		let requeued = queue.drain().pop().unwrap();
		assert_eq!(requeued.attempts, 1);
		assert_eq!(requeued.last_error.as_deref(), Some("boom"));
		// attempts² = 1 second out.
		let delay = requeued.next_retry_at - before;
		assert!(delay >= chrono::Duration::milliseconds(900));
		assert!(delay <= chrono::Duration::seconds(2));
	}

	#[test]
	fn exhaustion_moves_item_to_dlq() {
		let queue = RetryQueue::new(10);
		let dlq = DeadLetterQueue::new(10);
		let mut item = RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None);
		item.attempts = item.max_attempts - 1;
		let transfer_id = item.transfer_id;

		assert_eq!(
			queue.reschedule(item, "final straw".to_string(), &dlq),
			RescheduleOutcome::Exhausted
		);
		assert!(queue.is_empty());

		let dead = dlq.snapshot();
		assert_eq!(dead.len(), 1);
		assert_eq!(dead[0].transfer_id, transfer_id);
		assert_eq!(dead[0].attempts, RETRY_QUEUE_MAX_ATTEMPTS);
	}

	#[tokio::test]
	async fn next_due_waits_for_due_time() {
		let queue = RetryQueue::new(10);
		let dlq = DeadLetterQueue::new(10);
		let cancel = CancellationToken::new();

		let mut item = RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None);
		item.next_retry_at = Utc::now() + chrono::Duration::milliseconds(50);
		let id = item.item_id;
		queue.push(item, &dlq);

		let started = std::time::Instant::now();
		let delivered = queue.next_due(&cancel).await.unwrap();
		assert_eq!(delivered.item_id, id);
		assert!(started.elapsed() >= Duration::from_millis(40));
	}

	#[tokio::test]
	async fn next_due_delivers_in_due_order() {
		let queue = RetryQueue::new(10);
		let dlq = DeadLetterQueue::new(10);
		let cancel = CancellationToken::new();

		let mut late = RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None);
		late.next_retry_at = Utc::now() + chrono::Duration::milliseconds(40);
		let mut early = RetryItem::new(Uuid::new_v4(), RetryOp::Confirm, None);
		early.next_retry_at = Utc::now() + chrono::Duration::milliseconds(10);

		let late_id = late.item_id;
		let early_id = early.item_id;
		queue.push(late, &dlq);
		queue.push(early, &dlq);

		assert_eq!(queue.next_due(&cancel).await.unwrap().item_id, early_id);
		assert_eq!(queue.next_due(&cancel).await.unwrap().item_id, late_id);
	}

	#[tokio::test]
	async fn next_due_returns_none_on_cancellation() {
		let queue = RetryQueue::new(10);
		let cancel = CancellationToken::new();

		let cancel_clone = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			cancel_clone.cancel();
		});

		assert!(queue.next_due(&cancel).await.is_none());
	}

	#[test]
	fn dlq_drops_oldest_when_full() {
		let dlq = DeadLetterQueue::new(2);
		let first = RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None);
		let first_id = first.item_id;
		dlq.push(first);
		dlq.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None));
		dlq.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None));

		let snapshot = dlq.snapshot();
		assert_eq!(snapshot.len(), 2);
		assert!(snapshot.iter().all(|item| item.item_id != first_id));
	}

	#[test]
	fn take_matching_reinjects_selectively() {
		let dlq = DeadLetterQueue::new(10);
		let target = Uuid::new_v4();
		dlq.push(RetryItem::new(target, RetryOp::Submit, None));
		dlq.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None));

		let taken = dlq.take_matching(Some(target));
		assert_eq!(taken.len(), 1);
		assert_eq!(taken[0].transfer_id, target);
		assert_eq!(dlq.len(), 1);

		let rest = dlq.take_matching(None);
		assert_eq!(rest.len(), 1);
		assert!(dlq.is_empty());
	}
}
