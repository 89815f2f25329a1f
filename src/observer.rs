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

//! The read-only face of the pipeline: counters, the bounded error buffer,
//! best-effort push notifications, and the snapshot façade the dashboard and
//! CLI consume. Nothing in here can mutate pipeline state except the two
//! operator actions (`force_recovery`, `cleanup_events`).

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::{
	breaker::{BreakerRegistry, BreakerSnapshot},
	constants::ERROR_BUFFER_SIZE,
	errors::RelayError,
	health::{HealthRegistry, HealthStatus},
	primitives::ForeignChain,
	queue::{DeadLetterQueue, RetryItem, RetryQueue},
	replay::{EventRecord, ReplayStats, ReplayStore},
	transfer::{Transfer, TransferStatus, TransferStore},
};

/// Capacity of the notification fan-out. Old entries are dropped for
/// lagging subscribers; producers never block.
const NOTIFICATION_BUFFER_SIZE: usize = 1024;

/// Monotonic operational counters.
#[derive(Default)]
pub struct StatsCounters {
	pub events_received: AtomicU64,
	pub validation_failures: AtomicU64,
	pub blocked_replays: AtomicU64,
	pub dropped_events: AtomicU64,
	pub transfers_created: AtomicU64,
	pub transfers_completed: AtomicU64,
	pub transfers_failed: AtomicU64,
	pub retries_enqueued: AtomicU64,
	pub dead_lettered: AtomicU64,
	pub worker_restarts: AtomicU64,
}

impl StatsCounters {
	pub fn increment(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn get(counter: &AtomicU64) -> u64 {
		counter.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
	pub kind: &'static str,
	pub component: String,
	pub timestamp: DateTime<Utc>,
	pub message: String,
}

/// Most recent N errors, for the snapshot view.
#[derive(Default)]
pub struct ErrorBuffer {
	entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, component: &str, error: &RelayError) {
		let mut entries = self.entries.lock().expect("error buffer lock poisoned");
		if entries.len() >= ERROR_BUFFER_SIZE {
			entries.pop_front();
		}
		entries.push_back(ErrorEntry {
			kind: error.kind(),
			component: component.to_string(),
			timestamp: Utc::now(),
			message: error.to_string(),
		});
	}

	pub fn snapshot(&self) -> Vec<ErrorEntry> {
		self.entries.lock().expect("error buffer lock poisoned").iter().cloned().collect()
	}
}

/// Real-time push events for dashboard subscribers. Best effort: a slow
/// subscriber is skipped, never blocking the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeNotification {
	EventReceived { chain: ForeignChain, tx_hash: String },
	ReplayBlocked { fingerprint: String },
	TransferStateChanged { id: Uuid, status: TransferStatus },
	TransferCompleted { id: Uuid, dest_tx_hash: String },
	ErrorOccurred { kind: &'static str, component: String, message: String },
	WorkerRestarted { worker: String },
	ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
	pub total_transactions: u64,
	pub pending: u64,
	pub completed: u64,
	pub failed: u64,
	pub needs_review: u64,
	pub per_chain: HashMap<ForeignChain, u64>,
	/// failed / total, 0.0 when nothing has been processed.
	pub error_rate: f64,
	pub avg_processing_time_ms: Option<u64>,
	pub blocked_replays: u64,
	pub validation_failures: u64,
	pub dropped_events: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
	pub retry_queue: usize,
	pub dead_letter_queue: usize,
}

/// Everything an operator sees in one consistent-enough view.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
	pub health: HashMap<String, HealthStatus>,
	pub stats: BridgeStats,
	pub transfers_by_state: HashMap<TransferStatus, usize>,
	pub breakers: HashMap<String, BreakerSnapshot>,
	pub queues: QueueDepths,
	pub recent_events: Vec<EventRecord>,
	pub recent_errors: Vec<ErrorEntry>,
}

/// The stable observability façade. Cheap to clone; every accessor takes
/// read locks or atomic loads only.
#[derive(Clone)]
pub struct BridgeObserver {
	pub(crate) transfers: Arc<TransferStore>,
	pub(crate) replay: Arc<ReplayStore>,
	pub(crate) breakers: Arc<BreakerRegistry>,
	pub(crate) retry_queue: Arc<RetryQueue>,
	pub(crate) dlq: Arc<DeadLetterQueue>,
	pub(crate) health: Arc<HealthRegistry>,
	pub(crate) counters: Arc<StatsCounters>,
	pub(crate) errors: Arc<ErrorBuffer>,
	pub(crate) notifications: broadcast::Sender<BridgeNotification>,
}

impl BridgeObserver {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		transfers: Arc<TransferStore>,
		replay: Arc<ReplayStore>,
		breakers: Arc<BreakerRegistry>,
		retry_queue: Arc<RetryQueue>,
		dlq: Arc<DeadLetterQueue>,
		health: Arc<HealthRegistry>,
		counters: Arc<StatsCounters>,
		errors: Arc<ErrorBuffer>,
	) -> Self {
		let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER_SIZE);
		Self { transfers, replay, breakers, retry_queue, dlq, health, counters, errors, notifications }
	}

	pub(crate) fn notify(&self, notification: BridgeNotification) {
		// Nobody listening is fine.
		let _ = self.notifications.send(notification);
	}

	pub(crate) fn record_error(&self, component: &str, error: &RelayError) {
		self.errors.record(component, error);
		self.notify(BridgeNotification::ErrorOccurred {
			kind: error.kind(),
			component: component.to_string(),
			message: error.to_string(),
		});
	}

	pub fn subscribe_notifications(&self) -> broadcast::Receiver<BridgeNotification> {
		self.notifications.subscribe()
	}

	/// The notification feed as a `Stream`, for push consumers that speak
	/// futures. Lagged entries surface as stream errors and are skipped.
	pub fn notification_stream(
		&self,
	) -> tokio_stream::wrappers::BroadcastStream<BridgeNotification> {
		tokio_stream::wrappers::BroadcastStream::new(self.notifications.subscribe())
	}

	pub fn get_health(&self) -> HashMap<String, HealthStatus> {
		self.health.snapshot()
	}

	pub fn get_stats(&self) -> BridgeStats {
		let counts = self.transfers.counts_by_status();
		let count = |status: TransferStatus| counts.get(&status).copied().unwrap_or(0) as u64;

		let total = self.transfers.len() as u64;
		let completed = count(TransferStatus::Completed);
		let failed = count(TransferStatus::Failed);
		let needs_review = count(TransferStatus::NeedsReview);

		let mut per_chain: HashMap<ForeignChain, u64> = HashMap::new();
		let mut processing_times = Vec::new();
		for transfer in self.transfers.list(None, None, usize::MAX) {
			*per_chain.entry(transfer.source_chain).or_insert(0) += 1;
			if let Some(completed_at) = transfer.completed_at {
				processing_times
					.push((completed_at - transfer.created_at).num_milliseconds().max(0) as u64);
			}
		}

		BridgeStats {
			total_transactions: total,
			pending: total - completed - failed - needs_review,
			completed,
			failed,
			needs_review,
			per_chain,
			error_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
			avg_processing_time_ms: (!processing_times.is_empty())
				.then(|| processing_times.iter().sum::<u64>() / processing_times.len() as u64),
			blocked_replays: StatsCounters::get(&self.counters.blocked_replays),
			validation_failures: StatsCounters::get(&self.counters.validation_failures),
			dropped_events: StatsCounters::get(&self.counters.dropped_events),
		}
	}

	pub fn list_transactions(
		&self,
		status: Option<TransferStatus>,
		chain: Option<ForeignChain>,
		limit: usize,
	) -> Vec<Transfer> {
		self.transfers.list(status, chain, limit)
	}

	pub fn get_transaction(&self, id: &Uuid) -> Option<Transfer> {
		self.transfers.get(id)
	}

	pub fn list_failed_events(&self) -> Vec<RetryItem> {
		self.dlq.snapshot()
	}

	pub fn get_replay_stats(&self) -> Result<ReplayStats, RelayError> {
		self.replay.stats()
	}

	pub fn get_circuit_breakers(&self) -> HashMap<String, BreakerSnapshot> {
		self.breakers.snapshots()
	}

	pub fn recent_events(&self, n: usize) -> Vec<EventRecord> {
		self.replay.recent(n)
	}

	pub fn recent_errors(&self) -> Vec<ErrorEntry> {
		self.errors.snapshot()
	}

	/// Operator action: re-inject dead-lettered items (optionally for one
	/// transfer) into the retry queue with a fresh attempt budget. Returns
	/// how many were re-injected.
	pub fn force_recovery(&self, transfer_id: Option<Uuid>) -> usize {
		let items = self.dlq.take_matching(transfer_id);
		let count = items.len();
		for mut item in items {
			item.attempts = 0;
			item.next_retry_at = Utc::now();
			self.retry_queue.push(item, &self.dlq);
		}
		if count > 0 {
			info!("Operator re-injected {count} dead-lettered items");
		}
		count
	}

	/// Operator action: drop replay records older than the given age.
	pub fn cleanup_events(&self, older_than: Duration) -> Result<usize, RelayError> {
		self.replay.cleanup(older_than)
	}

	pub fn queue_depths(&self) -> QueueDepths {
		QueueDepths { retry_queue: self.retry_queue.len(), dead_letter_queue: self.dlq.len() }
	}

	pub fn snapshot(&self) -> SnapshotView {
		SnapshotView {
			health: self.get_health(),
			stats: self.get_stats(),
			transfers_by_state: self.transfers.counts_by_status(),
			breakers: self.get_circuit_breakers(),
			queues: self.queue_depths(),
			recent_events: self.recent_events(20),
			recent_errors: self.recent_errors(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		breaker::BreakerConfig,
		constants::{DEAD_LETTER_QUEUE_CAPACITY, RETRY_QUEUE_CAPACITY},
		event::{EventKind, InboundEvent},
		queue::RetryOp,
		replay::fingerprint_event,
	};

	fn observer() -> (tempfile::TempDir, BridgeObserver) {
		let dir = tempfile::tempdir().unwrap();
		let observer = BridgeObserver::new(
			Arc::new(TransferStore::new()),
			Arc::new(ReplayStore::open(&dir.path().join("replay.db"), 100).unwrap()),
			Arc::new(BreakerRegistry::new(BreakerConfig::default())),
			Arc::new(RetryQueue::new(RETRY_QUEUE_CAPACITY)),
			Arc::new(DeadLetterQueue::new(DEAD_LETTER_QUEUE_CAPACITY)),
			Arc::new(HealthRegistry::new()),
			Arc::new(StatsCounters::default()),
			Arc::new(ErrorBuffer::new()),
		);
		(dir, observer)
	}

	fn transfer(status: TransferStatus) -> Transfer {
		let event = InboundEvent::new(
			ForeignChain::Ethereum,
			&format!("0x{}", Uuid::new_v4().simple()),
			"0x1",
			"bhx1dest",
			"USDC",
			1_000,
			Utc::now().timestamp(),
			EventKind::Transfer,
		);
		let mut transfer = Transfer::from_event(
			&event,
			fingerprint_event(&event),
			ForeignChain::BlackHole,
			TransferStatus::Deduped,
		);
		if matches!(status, TransferStatus::Completed) {
			transfer.dest_tx_hash = Some("bhx01".to_string());
			transfer.completed_at = Some(Utc::now());
		}
		transfer.status = status;
		transfer
	}

	#[test]
	fn stats_aggregate_by_status_and_chain() {
		let (_dir, observer) = observer();
		observer.transfers.insert(transfer(TransferStatus::Completed));
		observer.transfers.insert(transfer(TransferStatus::Completed));
		observer.transfers.insert(transfer(TransferStatus::Failed));
		observer.transfers.insert(transfer(TransferStatus::Deduped));

		let stats = observer.get_stats();
		assert_eq!(stats.total_transactions, 4);
		assert_eq!(stats.completed, 2);
		assert_eq!(stats.failed, 1);
		assert_eq!(stats.pending, 1);
		assert_eq!(stats.error_rate, 0.25);
		assert_eq!(stats.per_chain.get(&ForeignChain::Ethereum), Some(&4));
		assert!(stats.avg_processing_time_ms.is_some());
	}

	#[test]
	fn error_buffer_is_bounded_and_newest_last() {
		let buffer = ErrorBuffer::new();
		for i in 0..(ERROR_BUFFER_SIZE + 10) {
			buffer.record("test", &RelayError::Transient(format!("error {i}")));
		}
		let snapshot = buffer.snapshot();
		assert_eq!(snapshot.len(), ERROR_BUFFER_SIZE);
		assert!(snapshot.last().unwrap().message.contains(&format!("error {}", ERROR_BUFFER_SIZE + 9)));
	}

	#[test]
	fn force_recovery_reinjects_dlq_items() {
		let (_dir, observer) = observer();
		let target = Uuid::new_v4();
		let mut exhausted = RetryItem::new(target, RetryOp::Submit, Some("gone".to_string()));
		exhausted.attempts = exhausted.max_attempts;
		observer.dlq.push(exhausted);
		observer.dlq.push(RetryItem::new(Uuid::new_v4(), RetryOp::Submit, None));

		assert_eq!(observer.force_recovery(Some(target)), 1);
		assert_eq!(observer.retry_queue.len(), 1);
		assert_eq!(observer.dlq.len(), 1);

		let reinjected = observer.retry_queue.drain().pop().unwrap();
		assert_eq!(reinjected.transfer_id, target);
		assert_eq!(reinjected.attempts, 0);
	}

	#[tokio::test]
	async fn notifications_reach_subscribers_and_never_block() {
		let (_dir, observer) = observer();
		let mut subscriber = observer.subscribe_notifications();

		observer.notify(BridgeNotification::ShuttingDown);
		assert!(matches!(
			subscriber.try_recv().unwrap(),
			BridgeNotification::ShuttingDown
		));

		// With no subscriber at all, notify is a no-op rather than an error.
		drop(subscriber);
		observer.notify(BridgeNotification::ShuttingDown);
	}

	#[test]
	fn snapshot_collects_every_surface() {
		let (_dir, observer) = observer();
		observer.transfers.insert(transfer(TransferStatus::Deduped));
		observer.breakers.get_or_create("adapter-ethereum");
		observer.health.report_state(
			"pipeline",
			crate::health::HealthState::Healthy,
			"",
		);
		observer.errors.record("pipeline", &RelayError::Transient("one".to_string()));

		let snapshot = observer.snapshot();
		assert_eq!(snapshot.stats.total_transactions, 1);
		assert!(snapshot.breakers.contains_key("adapter-ethereum"));
		assert!(snapshot.health.contains_key("pipeline"));
		assert_eq!(snapshot.recent_errors.len(), 1);
		assert_eq!(snapshot.queues.retry_queue, 0);
	}
}
