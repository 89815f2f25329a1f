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

//! The pipeline orchestrator.
//!
//! Owns every shared component (replay store, transfer table, breakers,
//! queues, health) and the fixed set of long-lived workers. Events flow
//! adapter → dispatch worker → validate → dedup → transfer state machine →
//! destination adapter, with the retry executor and queues catching
//! everything that falls off the happy path. A single cancellation token
//! fans out to all workers; `shutdown` drains within its timeout.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
	breaker::{BreakerConfig, BreakerRegistry},
	chains::{source_ref, ChainAdapter, OutboundTransfer, PendingHandle, SubmitMode},
	constants::{
		ADAPTER_CHANNEL_CAPACITY, CONFIRMATION_POLL_INTERVAL, CONFIRMATION_POLL_TIMEOUT,
		DEAD_LETTER_QUEUE_CAPACITY, HEALTH_CHECK_INTERVAL, METRICS_CLEANUP_INTERVAL,
		RECOVERY_LOOP_INTERVAL, RECOVERY_STALE_AFTER, RELAY_BREAKER_NAME, RETRY_QUEUE_CAPACITY,
		SHUTDOWN_TIMEOUT, SUBMIT_TIMEOUT, WORKER_RESTART_COOLDOWN,
	},
	errors::RelayError,
	event::{EventKind, InboundEvent},
	health::{HealthRegistry, HealthState},
	observer::{BridgeNotification, BridgeObserver, ErrorBuffer, SnapshotView, StatsCounters},
	primitives::{AssetAmount, ForeignChain},
	queue::{DeadLetterQueue, RescheduleOutcome, RetryItem, RetryOp, RetryQueue},
	recovery,
	replay::{RecordOutcome, ReplayStore},
	retry::{with_retry, RetryPolicy},
	transfer::{Transfer, TransferStatus, TransferStore},
	utils::make_periodic_tick,
};

/// Everything the orchestrator needs to know that is not an adapter.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
	/// Default destination per source chain for witnessed events.
	pub routes: HashMap<ForeignChain, ForeignChain>,
	pub retry_policy: RetryPolicy,
	pub breaker_config: BreakerConfig,
	/// The critical-path breaker gets its own, more tolerant configuration.
	pub relay_breaker_config: BreakerConfig,
	pub retry_queue_capacity: usize,
	pub retry_queue_max_attempts: u32,
	pub dlq_capacity: usize,
	pub recovery_interval: Duration,
	pub recovery_stale_after: Duration,
	pub health_check_interval: Duration,
	pub cleanup_interval: Duration,
	/// Replay records older than this are dropped by the cleanup worker.
	pub replay_retention: Duration,
	pub shutdown_timeout: Duration,
	pub submit_timeout: Duration,
	pub confirmation_poll_interval: Duration,
	pub confirmation_poll_timeout: Duration,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			routes: HashMap::from_iter([
				(ForeignChain::Ethereum, ForeignChain::BlackHole),
				(ForeignChain::Solana, ForeignChain::BlackHole),
				(ForeignChain::BlackHole, ForeignChain::Ethereum),
			]),
			retry_policy: RetryPolicy::default(),
			breaker_config: BreakerConfig::default(),
			relay_breaker_config: BreakerConfig {
				failure_threshold: crate::constants::RELAY_BREAKER_FAILURE_THRESHOLD,
				open_timeout: crate::constants::RELAY_BREAKER_OPEN_TIMEOUT,
				..BreakerConfig::default()
			},
			retry_queue_capacity: RETRY_QUEUE_CAPACITY,
			retry_queue_max_attempts: crate::constants::RETRY_QUEUE_MAX_ATTEMPTS,
			dlq_capacity: DEAD_LETTER_QUEUE_CAPACITY,
			recovery_interval: RECOVERY_LOOP_INTERVAL,
			recovery_stale_after: RECOVERY_STALE_AFTER,
			health_check_interval: HEALTH_CHECK_INTERVAL,
			cleanup_interval: METRICS_CLEANUP_INTERVAL,
			replay_retention: Duration::from_secs(7 * 24 * 60 * 60),
			shutdown_timeout: SHUTDOWN_TIMEOUT,
			submit_timeout: SUBMIT_TIMEOUT,
			confirmation_poll_interval: CONFIRMATION_POLL_INTERVAL,
			confirmation_poll_timeout: CONFIRMATION_POLL_TIMEOUT,
		}
	}
}

/// Externally initiated transfer (dashboard, CLI). Enters the state machine
/// at `validated` like everything else; no fast path around dedup.
#[derive(Debug, Clone)]
pub struct ManualTransferRequest {
	pub source_chain: ForeignChain,
	pub dest_chain: ForeignChain,
	pub from_address: String,
	pub to_address: String,
	pub token_symbol: String,
	pub amount: AssetAmount,
}

/// Shared pipeline state and the event-handling logic. Workers and the
/// recovery loop all operate through this.
pub(crate) struct BridgeCore {
	pub(crate) config: PipelineConfig,
	pub(crate) adapters: HashMap<ForeignChain, Arc<dyn ChainAdapter>>,
	pub(crate) observer: BridgeObserver,
	/// Re-injection path for events whose replay-store write failed, and for
	/// manual submissions.
	injected_events: mpsc::Sender<InboundEvent>,
	pub(crate) cancel: CancellationToken,
}

pub struct BridgePipeline {
	pub(crate) core: Arc<BridgeCore>,
	workers: tokio::sync::Mutex<JoinSet<()>>,
	injected_receiver: std::sync::Mutex<Option<mpsc::Receiver<InboundEvent>>>,
	started: std::sync::atomic::AtomicBool,
}

impl BridgePipeline {
	pub fn new(
		config: PipelineConfig,
		replay: ReplayStore,
		adapters: Vec<Arc<dyn ChainAdapter>>,
	) -> Self {
		let observer = BridgeObserver::new(
			Arc::new(TransferStore::new()),
			Arc::new(replay),
			Arc::new(
				BreakerRegistry::new(config.breaker_config)
					.with_override(RELAY_BREAKER_NAME, config.relay_breaker_config),
			),
			Arc::new(RetryQueue::new(config.retry_queue_capacity)),
			Arc::new(DeadLetterQueue::new(config.dlq_capacity)),
			Arc::new(HealthRegistry::new()),
			Arc::new(StatsCounters::default()),
			Arc::new(ErrorBuffer::new()),
		);

		let (injected_events, injected_receiver) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);

		let core = Arc::new(BridgeCore {
			config,
			adapters: adapters
				.into_iter()
				.map(|adapter| (adapter.chain(), adapter))
				.collect(),
			observer,
			injected_events,
			cancel: CancellationToken::new(),
		});

		Self {
			core,
			workers: tokio::sync::Mutex::new(JoinSet::new()),
			injected_receiver: std::sync::Mutex::new(Some(injected_receiver)),
			started: std::sync::atomic::AtomicBool::new(false),
		}
	}

	pub fn observer(&self) -> BridgeObserver {
		self.core.observer.clone()
	}

	/// Child token tied to this pipeline's lifecycle, for auxiliary tasks
	/// (e.g. the health endpoint) that should die with it.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.core.cancel.child_token()
	}

	pub fn snapshot(&self) -> SnapshotView {
		self.core.observer.snapshot()
	}

	/// Launches adapter subscriptions and the worker set.
	pub async fn start(&self) -> anyhow::Result<()> {
		if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
			anyhow::bail!("pipeline already started");
		}
		info!("Starting bridge pipeline with {} adapters", self.core.adapters.len());

		let mut workers = self.workers.lock().await;

		// One dispatch worker per adapter subscription.
		for (chain, adapter) in &self.core.adapters {
			let receiver = Arc::new(tokio::sync::Mutex::new(
				adapter.subscribe(self.core.cancel.child_token()).await,
			));
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				format!("dispatch-{chain}"),
				self.core.clone(),
				move || {
					let core = core.clone();
					let receiver = receiver.clone();
					async move {
						loop {
							let event = {
								let mut receiver = receiver.lock().await;
								tokio::select! {
									_ = core.cancel.cancelled() => None,
									event = receiver.recv() => event,
								}
							};
							match event {
								Some(event) => core.handle_event(event).await,
								None => break,
							}
						}
					}
					.boxed()
				},
			);
		}

		// Manual submissions and store-failure re-injections.
		{
			let receiver = Arc::new(tokio::sync::Mutex::new(
				self.injected_receiver
					.lock()
					.expect("injected receiver lock poisoned")
					.take()
					.expect("start is only called once"),
			));
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				"dispatch-injected".to_string(),
				self.core.clone(),
				move || {
					let core = core.clone();
					let receiver = receiver.clone();
					async move {
						loop {
							let event = {
								let mut receiver = receiver.lock().await;
								tokio::select! {
									_ = core.cancel.cancelled() => None,
									event = receiver.recv() => event,
								}
							};
							match event {
								Some(event) => core.handle_event(event).await,
								None => break,
							}
						}
					}
					.boxed()
				},
			);
		}

		// Single retry-queue consumer.
		{
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				"retry-worker".to_string(),
				self.core.clone(),
				move || {
					let core = core.clone();
					async move {
						while let Some(item) =
							core.observer.retry_queue.next_due(&core.cancel).await
						{
							core.process_retry_item(item).await;
						}
					}
					.boxed()
				},
			);
		}

		// Dead-letter observer: logs depth, nothing else.
		{
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				"dead-letter-worker".to_string(),
				self.core.clone(),
				move || {
					let core = core.clone();
					async move {
						let mut tick = make_periodic_tick(Duration::from_secs(60), false);
						loop {
							tokio::select! {
								_ = core.cancel.cancelled() => break,
								_ = tick.tick() => {},
							}
							let depth = core.observer.dlq.len();
							if depth > 0 {
								warn!("Dead-letter queue holds {depth} items awaiting operator action");
							}
						}
					}
					.boxed()
				},
			);
		}

		// Recovery loop.
		{
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				"recovery-worker".to_string(),
				self.core.clone(),
				move || {
					let core = core.clone();
					recovery::recovery_worker(core).boxed()
				},
			);
		}

		// Health checks.
		{
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				"health-worker".to_string(),
				self.core.clone(),
				move || {
					let core = core.clone();
					async move {
						let mut tick =
							make_periodic_tick(core.config.health_check_interval, true);
						loop {
							tokio::select! {
								_ = core.cancel.cancelled() => break,
								_ = tick.tick() => {},
							}
							for adapter in core.adapters.values() {
								core.observer.health.report(adapter.health().await);
							}
							let depths = core.observer.queue_depths();
							core.observer.health.report_state(
								"retry-queue",
								HealthState::Healthy,
								&format!("{} queued, {} dead-lettered", depths.retry_queue, depths.dead_letter_queue),
							);
						}
					}
					.boxed()
				},
			);
		}

		// Retention cleanup.
		{
			let core = self.core.clone();
			spawn_supervised(
				&mut workers,
				"cleanup-worker".to_string(),
				self.core.clone(),
				move || {
					let core = core.clone();
					async move {
						let mut tick = make_periodic_tick(core.config.cleanup_interval, false);
						loop {
							tokio::select! {
								_ = core.cancel.cancelled() => break,
								_ = tick.tick() => {},
							}
							match core.observer.replay.cleanup(core.config.replay_retention) {
								Ok(0) => {},
								Ok(removed) =>
									info!("Retention cleanup removed {removed} replay records"),
								Err(error) =>
									core.observer.record_error("cleanup-worker", &error),
							}
						}
					}
					.boxed()
				},
			);
		}

		self.core
			.observer
			.health
			.report_state("pipeline", HealthState::Healthy, "started");
		Ok(())
	}

	/// Externally initiated transfer. Validated, synthetically
	/// fingerprinted, and pushed through the same dedup and relay path as
	/// witnessed events.
	pub async fn submit_transfer(
		&self,
		request: ManualTransferRequest,
	) -> Result<Uuid, RelayError> {
		let event = InboundEvent::new(
			request.source_chain,
			&format!("manual-{}", Uuid::new_v4().simple()),
			&request.from_address,
			&request.to_address,
			&request.token_symbol,
			request.amount,
			Utc::now().timestamp(),
			EventKind::Manual,
		);
		event.validate()?;

		let fingerprint = self.core.observer.replay.fingerprint(&event);
		match self.core.observer.replay.record(&event)? {
			RecordOutcome::AlreadyPresent => {
				StatsCounters::increment(&self.core.observer.counters.blocked_replays);
				return Err(RelayError::DuplicateEvent(fingerprint.to_string()))
			},
			RecordOutcome::Recorded => {},
		}

		let transfer = Transfer::from_event(
			&event,
			fingerprint,
			request.dest_chain,
			TransferStatus::Deduped,
		);
		let id = self.core.observer.transfers.insert(transfer);
		StatsCounters::increment(&self.core.observer.counters.transfers_created);
		self.core
			.observer
			.notify(BridgeNotification::TransferStateChanged { id, status: TransferStatus::Deduped });

		let core = self.core.clone();
		tokio::spawn(async move { core.relay_transfer(id).await });
		Ok(id)
	}

	/// Cancels every worker, drains the queues to the log, and waits for the
	/// worker set to exit within `timeout`.
	pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
		info!("Bridge pipeline shutting down (budget {}s)", timeout.as_secs());
		self.core.observer.notify(BridgeNotification::ShuttingDown);
		self.core.cancel.cancel();

		let deadline = tokio::time::Instant::now() + timeout;
		let mut workers = self.workers.lock().await;
		let drained = loop {
			match tokio::time::timeout_at(deadline, workers.join_next()).await {
				Ok(Some(_)) => continue,
				Ok(None) => break true,
				Err(_) => break false,
			}
		};
		if !drained {
			workers.abort_all();
		}

		// Journal whatever the queues still hold.
		for item in self.core.observer.retry_queue.drain() {
			warn!(
				"Shutdown drained retry item {} (transfer {}, {:?}, {} attempts, last error: {})",
				item.item_id,
				item.transfer_id,
				item.op,
				item.attempts,
				item.last_error.as_deref().unwrap_or("none"),
			);
		}
		for item in self.core.observer.dlq.snapshot() {
			warn!(
				"Shutdown: dead-lettered item {} (transfer {}) awaits operator review",
				item.item_id, item.transfer_id
			);
		}

		// Resolution markers for in-flight submissions.
		for transfer in self.core.observer.transfers.list(None, None, usize::MAX) {
			if matches!(transfer.status, TransferStatus::Submitted | TransferStatus::Confirming) {
				self.core
					.observer
					.transfers
					.record_attempt(&transfer.id, Some(&RelayError::Cancelled));
				warn!(
					"Shutdown left transfer {} in {}; recovery will resume it on restart",
					transfer.id, transfer.status
				);
			}
		}

		self.core
			.observer
			.health
			.report_state("pipeline", HealthState::Stopped, "shut down");

		anyhow::ensure!(drained, "workers did not exit within the shutdown timeout");
		Ok(())
	}
}

impl BridgeCore {
	/// Stream-event handler: validate, dedup, create the transfer, relay.
	pub(crate) async fn handle_event(&self, event: InboundEvent) {
		StatsCounters::increment(&self.observer.counters.events_received);
		self.observer.notify(BridgeNotification::EventReceived {
			chain: event.source_chain,
			tx_hash: event.tx_hash.clone(),
		});

		if let Err(error) = event.validate() {
			StatsCounters::increment(&self.observer.counters.validation_failures);
			warn!("Discarding invalid event from {}: {error}", event.source_chain);
			self.observer.record_error("event-validation", &error);
			return
		}

		let fingerprint = self.observer.replay.fingerprint(&event);
		match self.observer.replay.seen(&fingerprint) {
			Ok(Some(_)) => {
				StatsCounters::increment(&self.observer.counters.blocked_replays);
				info!(
					"Blocked replay of {} event {} (fingerprint {fingerprint})",
					event.source_chain, event.tx_hash
				);
				self.observer
					.notify(BridgeNotification::ReplayBlocked { fingerprint: fingerprint.to_string() });
				return
			},
			Ok(None) => {},
			Err(error) => {
				self.observer.record_error("replay-store", &error);
				self.reinject(event);
				return
			},
		}

		// Durable put-if-absent, retried against the store's own breaker.
		// Until it succeeds the transfer cannot advance past `validated`.
		let breaker = self.observer.breakers.get_or_create("replay-store");
		let record_outcome = with_retry(
			"replay-store-record",
			&breaker,
			&self.config.retry_policy,
			&self.cancel,
			|| async { self.observer.replay.record(&event) },
		)
		.await;
		match record_outcome {
			Ok(RecordOutcome::Recorded) => {},
			Ok(RecordOutcome::AlreadyPresent) => {
				// Lost a put-if-absent race with a concurrent duplicate.
				StatsCounters::increment(&self.observer.counters.blocked_replays);
				self.observer
					.notify(BridgeNotification::ReplayBlocked { fingerprint: fingerprint.to_string() });
				return
			},
			Err(RelayError::Cancelled) => return,
			Err(error) => {
				self.observer.record_error("replay-store", &error);
				self.reinject(event);
				return
			},
		}

		let Some(dest_chain) = self.config.routes.get(&event.source_chain).copied() else {
			let error = RelayError::Validation(format!(
				"no destination route configured for {}",
				event.source_chain
			));
			StatsCounters::increment(&self.observer.counters.validation_failures);
			self.observer.record_error("routing", &error);
			return
		};

		let transfer =
			Transfer::from_event(&event, fingerprint, dest_chain, TransferStatus::Deduped);
		let id = self.observer.transfers.insert(transfer);
		StatsCounters::increment(&self.observer.counters.transfers_created);
		self.observer
			.notify(BridgeNotification::TransferStateChanged { id, status: TransferStatus::Deduped });

		self.relay_transfer(id).await;
	}

	/// Pushes an event back through the injected-events channel after a
	/// store failure. Dropping it silently is forbidden; overflow is
	/// counted.
	fn reinject(&self, event: InboundEvent) {
		if let Err(error) = self.injected_events.try_send(event) {
			StatsCounters::increment(&self.observer.counters.dropped_events);
			error!("Dropped event after replay-store failure (re-injection channel {error})");
		}
	}

	pub(crate) fn outbound_for(&self, transfer: &Transfer, mode: SubmitMode) -> OutboundTransfer {
		OutboundTransfer {
			idempotency_key: transfer.id,
			dest_chain: transfer.dest_chain,
			to_address: transfer.dest_address.clone(),
			token_symbol: transfer.token_symbol.clone(),
			amount: transfer.amount,
			source_ref: source_ref(transfer.source_chain, &transfer.source_tx_hash),
			mode,
		}
	}

	/// First relay attempt for a freshly deduped transfer: submit with the
	/// inline retry executor, then hand off to confirmation polling.
	pub(crate) async fn relay_transfer(&self, id: Uuid) {
		let Some(transfer) = self.observer.transfers.get(&id) else { return };
		let Some(adapter) = self.adapters.get(&transfer.dest_chain).cloned() else {
			let error = RelayError::Permanent(format!(
				"no adapter configured for destination chain {}",
				transfer.dest_chain
			));
			self.fail_transfer(&id, &error);
			return
		};

		let breaker = self.observer.breakers.get_or_create(RELAY_BREAKER_NAME);
		let outbound = self.outbound_for(&transfer, SubmitMode::Standard);
		let submit_timeout = self.config.submit_timeout;
		let result = with_retry(
			RELAY_BREAKER_NAME,
			&breaker,
			&self.config.retry_policy,
			&self.cancel,
			|| {
				let adapter = adapter.clone();
				let outbound = outbound.clone();
				async move {
					let result = match tokio::time::timeout(
						submit_timeout,
						adapter.submit(&outbound),
					)
					.await
					{
						Ok(result) => result,
						Err(_) => Err(RelayError::Transient(format!(
							"submit timed out after {}s",
							submit_timeout.as_secs()
						))),
					};
					if let Err(error) = &result {
						self.observer.transfers.record_attempt(&id, Some(error));
					}
					result
				}
			},
		)
		.await;

		match result {
			Ok(handle) => self.after_submit(&id, adapter, handle).await,
			Err(RelayError::Cancelled) => {},
			Err(error @ RelayError::Permanent(_)) => self.fail_transfer(&id, &error),
			Err(error) => {
				// Transient beyond inline bounds (or circuit open): defer to
				// the retry queue; the transfer stays at `deduped`.
				self.observer.record_error(RELAY_BREAKER_NAME, &error);
				self.enqueue_retry(id, RetryOp::Submit, &error);
			},
		}
	}

	/// Submitted → confirming, with confirmation polling spawned off the
	/// hot path so a slow destination chain never stalls event dispatch.
	pub(crate) async fn after_submit(
		&self,
		id: &Uuid,
		adapter: Arc<dyn ChainAdapter>,
		handle: PendingHandle,
	) {
		if let Err(error) = self.observer.transfers.mark_submitted(id, &handle.tx_hash) {
			self.observer.record_error("state-machine", &error);
			return
		}
		self.observer.notify(BridgeNotification::TransferStateChanged {
			id: *id,
			status: TransferStatus::Submitted,
		});
		self.observer.transfers.record_attempt(id, None);

		if let Err(error) = self.observer.transfers.transition(id, TransferStatus::Confirming) {
			self.observer.record_error("state-machine", &error);
			return
		}
		self.observer.notify(BridgeNotification::TransferStateChanged {
			id: *id,
			status: TransferStatus::Confirming,
		});

		self.spawn_confirmation_poll(*id, adapter, handle);
	}

	fn spawn_confirmation_poll(
		&self,
		id: Uuid,
		adapter: Arc<dyn ChainAdapter>,
		handle: PendingHandle,
	) {
		let observer = self.observer.clone();
		let cancel = self.cancel.clone();
		let poll_interval = self.config.confirmation_poll_interval;
		let poll_timeout = self.config.confirmation_poll_timeout;
		let max_attempts = self.config.retry_queue_max_attempts;

		tokio::spawn(async move {
			let threshold = adapter.confirmation_threshold();
			let deadline = tokio::time::Instant::now() + poll_timeout;
			let mut tick = make_periodic_tick(poll_interval, true);

			loop {
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = tick.tick() => {},
				}

				match adapter.confirmations(&handle).await {
					Ok(confirmations) if confirmations >= threshold => {
						match observer.transfers.transition(&id, TransferStatus::Completed) {
							Ok(()) => {
								StatsCounters::increment(&observer.counters.transfers_completed);
								info!(
									"Transfer {id} completed with {confirmations} confirmations on {}",
									handle.chain
								);
								observer.notify(BridgeNotification::TransferCompleted {
									id,
									dest_tx_hash: handle.tx_hash.clone(),
								});
							},
							Err(error) => observer.record_error("state-machine", &error),
						}
						return
					},
					Ok(_) => {},
					Err(error @ RelayError::Permanent(_)) => {
						observer.record_error("confirmation-poll", &error);
						if observer.transfers.transition(&id, TransferStatus::Failed).is_ok() {
							StatsCounters::increment(&observer.counters.transfers_failed);
							observer.notify(BridgeNotification::TransferStateChanged {
								id,
								status: TransferStatus::Failed,
							});
						}
						return
					},
					Err(error) => {
						// Transient: keep polling until the deadline.
						warn!("Confirmation poll for transfer {id} failed: {error}");
					},
				}

				if tokio::time::Instant::now() >= deadline {
					let error = RelayError::Transient(format!(
						"confirmations did not reach {threshold} within {}s",
						poll_timeout.as_secs()
					));
					observer.record_error("confirmation-poll", &error);
					observer.transfers.record_attempt(&id, Some(&error));
					let item = RetryItem::new(id, RetryOp::Confirm, Some(error.to_string()))
						.with_max_attempts(max_attempts);
					StatsCounters::increment(&observer.counters.retries_enqueued);
					observer.retry_queue.push(item, &observer.dlq);
					return
				}
			}
		});
	}

	/// One redelivery from the retry queue. A single attempt per delivery:
	/// the queue itself is the outer retry loop.
	pub(crate) async fn process_retry_item(&self, item: RetryItem) {
		let Some(transfer) = self.observer.transfers.get(&item.transfer_id) else {
			warn!("Dropping retry item for unknown transfer {}", item.transfer_id);
			return
		};
		if transfer.status.is_terminal() {
			return
		}

		let result = match item.op {
			RetryOp::Submit => self.attempt_submit_once(&transfer, SubmitMode::Standard).await,
			RetryOp::Confirm => self.attempt_confirm_once(&transfer).await,
		};

		match result {
			Ok(()) => {},
			Err(RelayError::Cancelled) => {
				// Preserve the item so the shutdown drain journals it.
				self.observer.retry_queue.push(item, &self.observer.dlq);
			},
			Err(error @ RelayError::Permanent(_)) => {
				self.fail_transfer(&item.transfer_id, &error);
			},
			Err(error) => {
				self.observer.record_error("retry-worker", &error);
				match self.observer.retry_queue.reschedule(
					item,
					error.to_string(),
					&self.observer.dlq,
				) {
					RescheduleOutcome::Requeued => {},
					RescheduleOutcome::Exhausted | RescheduleOutcome::OverflowedToDlq => {
						StatsCounters::increment(&self.observer.counters.dead_lettered);
						self.escalate_to_review(&transfer.id);
					},
				}
			},
		}
	}

	/// Single submit attempt (breaker-gated, no inline retries). Used by the
	/// retry-queue consumer and the recovery loop.
	pub(crate) async fn attempt_submit_once(
		&self,
		transfer: &Transfer,
		mode: SubmitMode,
	) -> Result<(), RelayError> {
		let adapter = self
			.adapters
			.get(&transfer.dest_chain)
			.cloned()
			.ok_or_else(|| {
				RelayError::Permanent(format!("no adapter for {}", transfer.dest_chain))
			})?;

		let breaker = self.observer.breakers.get_or_create(RELAY_BREAKER_NAME);
		breaker.check()?;

		let outbound = self.outbound_for(transfer, mode);
		let result =
			match tokio::time::timeout(self.config.submit_timeout, adapter.submit(&outbound))
				.await
			{
				Ok(result) => result,
				Err(_) => Err(RelayError::Transient(format!(
					"submit timed out after {}s",
					self.config.submit_timeout.as_secs()
				))),
			};

		match result {
			Ok(handle) => {
				breaker.record_success();
				self.after_submit(&transfer.id, adapter, handle).await;
				Ok(())
			},
			Err(error) => {
				breaker.record_failure();
				self.observer.transfers.record_attempt(&transfer.id, Some(&error));
				Err(error)
			},
		}
	}

	/// Single confirmation check for a transfer already on the destination
	/// chain. Success means the polling task has been (re)spawned.
	pub(crate) async fn attempt_confirm_once(
		&self,
		transfer: &Transfer,
	) -> Result<(), RelayError> {
		let adapter = self
			.adapters
			.get(&transfer.dest_chain)
			.cloned()
			.ok_or_else(|| {
				RelayError::Permanent(format!("no adapter for {}", transfer.dest_chain))
			})?;
		let tx_hash = transfer.dest_tx_hash.clone().ok_or_else(|| {
			RelayError::InvariantViolation(format!(
				"transfer {} is confirming without a dest tx hash",
				transfer.id
			))
		})?;

		let handle = PendingHandle {
			chain: transfer.dest_chain,
			tx_hash,
			accepted_at: transfer.last_attempt_at,
		};
		// Probe once so a dead handle reschedules instead of spawning a
		// poller per redelivery.
		adapter.confirmations(&handle).await?;
		self.spawn_confirmation_poll(transfer.id, adapter, handle);
		Ok(())
	}

	pub(crate) fn fail_transfer(&self, id: &Uuid, error: &RelayError) {
		self.observer.record_error("relay", error);
		self.observer.transfers.record_attempt(id, Some(error));
		match self.observer.transfers.transition(id, TransferStatus::Failed) {
			Ok(()) => {
				StatsCounters::increment(&self.observer.counters.transfers_failed);
				self.observer.notify(BridgeNotification::TransferStateChanged {
					id: *id,
					status: TransferStatus::Failed,
				});
			},
			Err(transition_error) =>
				self.observer.record_error("state-machine", &transition_error),
		}
	}

	/// Terminal mark for transfers that exhausted every automatic path.
	/// Never `failed`, never force-`completed`: an operator decides.
	pub(crate) fn escalate_to_review(&self, id: &Uuid) {
		match self.observer.transfers.transition(id, TransferStatus::NeedsReview) {
			Ok(()) => {
				warn!("Transfer {id} moved to needs_review after exhausting retries");
				self.observer.notify(BridgeNotification::TransferStateChanged {
					id: *id,
					status: TransferStatus::NeedsReview,
				});
			},
			Err(error) => self.observer.record_error("state-machine", &error),
		}
	}

	pub(crate) fn enqueue_retry(&self, id: Uuid, op: RetryOp, error: &RelayError) {
		StatsCounters::increment(&self.observer.counters.retries_enqueued);
		let item = RetryItem::new(id, op, Some(error.to_string()))
			.with_max_attempts(self.config.retry_queue_max_attempts);
		self.observer.retry_queue.push(item, &self.observer.dlq);
	}
}

/// Runs a worker under a supervisor: a panic (invariant violation) is
/// caught, reported on health, and the worker restarts after an escalating
/// cooldown. A clean return or cancellation ends supervision.
fn spawn_supervised<F>(
	workers: &mut JoinSet<()>,
	name: String,
	core: Arc<BridgeCore>,
	mut factory: F,
) where
	F: FnMut() -> futures::future::BoxFuture<'static, ()> + Send + 'static,
{
	workers.spawn(async move {
		let mut restarts: u32 = 0;
		loop {
			let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
			if core.cancel.is_cancelled() {
				core.observer.health.report_state(&name, HealthState::Stopped, "shut down");
				break
			}
			match result {
				Ok(()) => {
					core.observer.health.report_state(&name, HealthState::Stopped, "exited");
					break
				},
				Err(panic) => {
					restarts += 1;
					StatsCounters::increment(&core.observer.counters.worker_restarts);
					let message = panic
						.downcast_ref::<&str>()
						.map(|s| s.to_string())
						.or_else(|| panic.downcast_ref::<String>().cloned())
						.unwrap_or_else(|| "non-string panic payload".to_string());
					let error = RelayError::InvariantViolation(format!(
						"worker {name} panicked: {message}"
					));
					error!("{error}; restart {restarts} after cooldown");
					core.observer.health.report_state(&name, HealthState::Unhealthy, &message);
					core.observer.record_error(&name, &error);
					core.observer
						.notify(BridgeNotification::WorkerRestarted { worker: name.clone() });

					let cooldown = WORKER_RESTART_COOLDOWN
						.saturating_mul(2u32.saturating_pow(restarts.min(6)));
					tokio::select! {
						_ = core.cancel.cancelled() => break,
						_ = tokio::time::sleep(cooldown) => {},
					}
					core.observer.health.report_state(
						&name,
						HealthState::Degraded,
						"restarted after panic",
					);
				},
			}
		}
	});
}
