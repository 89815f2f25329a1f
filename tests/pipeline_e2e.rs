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

//! End-to-end pipeline scenarios driven through the public API, with the
//! native BlackHole ledger standing in for both sides of the bridge.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;

use bridge_engine::{
	breaker::{BreakerConfig, BreakerState, CircuitBreaker},
	chains::{
		blackhole::{BlackHoleAdapter, BlackHoleLedger},
		ChainAdapter,
	},
	errors::RelayError,
	event::{EventKind, InboundEvent},
	pipeline::{BridgePipeline, ManualTransferRequest, PipelineConfig},
	primitives::{parse_amount, ForeignChain},
	replay::ReplayStore,
	retry::{with_retry, RetryPolicy},
	transfer::TransferStatus,
};
use tokio_util::sync::CancellationToken;

const BLOCK_INTERVAL: Duration = Duration::from_millis(10);
const CONFIRMATIONS: u32 = 6;

fn test_config() -> PipelineConfig {
	PipelineConfig {
		// Loop the native ledger back onto itself so one in-process chain
		// exercises the whole path.
		routes: HashMap::from_iter([(ForeignChain::BlackHole, ForeignChain::BlackHole)]),
		retry_policy: RetryPolicy {
			max_retries: 3,
			initial_delay: Duration::from_millis(10),
			multiplier: 2.0,
			max_delay: Duration::from_millis(100),
			max_jitter: Duration::from_millis(1),
		},
		retry_queue_max_attempts: 2,
		recovery_interval: Duration::from_millis(200),
		recovery_stale_after: Duration::from_millis(100),
		health_check_interval: Duration::from_millis(100),
		confirmation_poll_interval: Duration::from_millis(10),
		confirmation_poll_timeout: Duration::from_secs(5),
		submit_timeout: Duration::from_secs(2),
		..PipelineConfig::default()
	}
}

fn bridge_at(
	db_path: &std::path::Path,
) -> (Arc<BlackHoleLedger>, BridgePipeline) {
	let replay = ReplayStore::open(db_path, 1_000).unwrap();
	let ledger = BlackHoleLedger::new(BLOCK_INTERVAL);
	let adapter: Arc<dyn ChainAdapter> =
		Arc::new(BlackHoleAdapter::new(ledger.clone(), CONFIRMATIONS));
	(ledger, BridgePipeline::new(test_config(), replay, vec![adapter]))
}

fn deposit(tx_hash: &str, amount: &str) -> InboundEvent {
	InboundEvent::new(
		ForeignChain::BlackHole,
		tx_hash,
		"bhx1sender",
		"bhx1receiver",
		"USDC",
		parse_amount(amount).unwrap(),
		Utc::now().timestamp(),
		EventKind::Transfer,
	)
}

/// Polls until `check` passes or a generous deadline expires.
async fn wait_until(description: &str, mut check: impl FnMut() -> bool) {
	for _ in 0..500 {
		if check() {
			return
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for: {description}");
}

#[tokio::test]
async fn happy_path_deposit_reaches_completed() {
	let dir = tempfile::tempdir().unwrap();
	let (ledger, pipeline) = bridge_at(&dir.path().join("replay.db"));
	let observer = pipeline.observer();
	pipeline.start().await.unwrap();

	ledger.inject_deposit(deposit("bhx0aaa1", "1.5"));

	wait_until("transfer completes", || observer.get_stats().completed == 1).await;

	let stats = observer.get_stats();
	assert_eq!(stats.total_transactions, 1);
	assert_eq!(stats.blocked_replays, 0);

	let completed = observer.list_transactions(Some(TransferStatus::Completed), None, 10);
	let transfer = &completed[0];
	assert_eq!(transfer.source_chain, ForeignChain::BlackHole);
	assert_eq!(transfer.amount, parse_amount("1.5").unwrap());
	assert!(transfer.dest_tx_hash.is_some());
	assert!(transfer.completed_at.is_some());

	pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn replayed_event_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let (ledger, pipeline) = bridge_at(&dir.path().join("replay.db"));
	let observer = pipeline.observer();
	pipeline.start().await.unwrap();

	let event = deposit("bhx0replay", "2");
	ledger.inject_deposit(event.clone());
	wait_until("first transfer completes", || observer.get_stats().completed == 1).await;

	// Identical re-injection must not produce a second transfer.
	ledger.inject_deposit(event);
	wait_until("replay is blocked", || observer.get_stats().blocked_replays == 1).await;

	let stats = observer.get_stats();
	assert_eq!(stats.total_transactions, 1);
	assert_eq!(observer.get_replay_stats().unwrap().total_events, 1);

	pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn transient_submit_failures_recover_and_complete() {
	let dir = tempfile::tempdir().unwrap();
	let (ledger, pipeline) = bridge_at(&dir.path().join("replay.db"));
	let observer = pipeline.observer();
	pipeline.start().await.unwrap();

	ledger.queue_submit_failures([
		RelayError::Transient("connection reset".to_string()),
		RelayError::Transient("connection reset".to_string()),
	]);
	ledger.inject_deposit(deposit("bhx0flaky", "1"));

	wait_until("transfer completes despite failures", || observer.get_stats().completed == 1)
		.await;

	let completed = observer.list_transactions(Some(TransferStatus::Completed), None, 10);
	assert_eq!(completed[0].retry_count, 2);

	// Two failures are far below the relay breaker threshold.
	let breakers = observer.get_circuit_breakers();
	assert_eq!(breakers["bridge-relay-operation"].state, BreakerState::Closed);

	pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn circuit_opens_fast_fails_then_recovers() {
	// Full breaker lifecycle on the relay-operation contract: threshold 5,
	// short open timeout, three probes to close.
	let breaker = CircuitBreaker::new(
		"bridge-relay-operation",
		BreakerConfig {
			failure_threshold: 5,
			open_timeout: Duration::from_millis(100),
			half_open_successes: 3,
		},
	);
	let policy = RetryPolicy {
		max_retries: 0,
		initial_delay: Duration::from_millis(5),
		multiplier: 2.0,
		max_delay: Duration::from_millis(20),
		max_jitter: Duration::from_millis(1),
	};
	let cancel = CancellationToken::new();

	// Five consecutive transient failures open the breaker.
	for _ in 0..5 {
		let result: Result<(), _> = with_retry("submit", &breaker, &policy, &cancel, || async {
			Err(RelayError::Transient("node down".to_string()))
		})
		.await;
		assert!(matches!(result, Err(RelayError::Transient(_))));
	}
	assert_eq!(breaker.state(), BreakerState::Open);

	// The next call fast-fails without invoking the operation.
	let result: Result<(), _> = with_retry("submit", &breaker, &policy, &cancel, || async {
		panic!("must not run while open")
	})
	.await;
	assert!(matches!(result, Err(RelayError::CircuitOpen(_))));

	// After the open timeout the breaker admits probes; three successes
	// close it.
	tokio::time::sleep(Duration::from_millis(120)).await;
	for _ in 0..3 {
		with_retry("submit", &breaker, &policy, &cancel, || async { Ok(()) })
			.await
			.unwrap();
	}
	assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_need_review() {
	let dir = tempfile::tempdir().unwrap();
	let (ledger, pipeline) = bridge_at(&dir.path().join("replay.db"));
	let observer = pipeline.observer();
	pipeline.start().await.unwrap();

	// Fail every attempt: inline retries, queue redeliveries, recovery.
	ledger.queue_submit_failures(
		std::iter::repeat_with(|| RelayError::Transient("node gone".to_string())).take(64),
	);
	ledger.inject_deposit(deposit("bhx0doomed", "3"));

	wait_until("item dead-letters and transfer needs review", || {
		observer.list_failed_events().len() == 1 &&
			observer.get_stats().needs_review == 1
	})
	.await;

	let needs_review = observer.list_transactions(Some(TransferStatus::NeedsReview), None, 10);
	// No force-complete: nothing was ever accepted downstream.
	assert!(needs_review[0].dest_tx_hash.is_none());

	pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn manual_submission_dedups_and_completes() {
	let dir = tempfile::tempdir().unwrap();
	let (_ledger, pipeline) = bridge_at(&dir.path().join("replay.db"));
	let observer = pipeline.observer();
	pipeline.start().await.unwrap();

	let id = pipeline
		.submit_transfer(ManualTransferRequest {
			source_chain: ForeignChain::BlackHole,
			dest_chain: ForeignChain::BlackHole,
			from_address: "bhx1operator".to_string(),
			to_address: "bhx1receiver".to_string(),
			token_symbol: "USDC".to_string(),
			amount: parse_amount("10").unwrap(),
		})
		.await
		.unwrap();

	wait_until("manual transfer completes", || {
		observer
			.get_transaction(&id)
			.is_some_and(|transfer| transfer.status == TransferStatus::Completed)
	})
	.await;

	pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_within_budget_and_store_reopens_identically() {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("replay.db");
	let (ledger, pipeline) = bridge_at(&db_path);
	let observer = pipeline.observer();
	pipeline.start().await.unwrap();

	for i in 0..50 {
		ledger.inject_deposit(deposit(&format!("bhx0bulk{i:02}"), "1"));
	}
	// Let the pipeline bite into the batch, then pull the plug mid-flight.
	tokio::time::sleep(Duration::from_millis(200)).await;

	let started = std::time::Instant::now();
	pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
	assert!(started.elapsed() < Duration::from_secs(5));

	// Queues were drained to the journal.
	assert_eq!(observer.queue_depths().retry_queue, 0);

	// Anything caught mid-submission carries a resolution marker.
	for transfer in observer.list_transactions(None, None, usize::MAX) {
		if matches!(transfer.status, TransferStatus::Submitted | TransferStatus::Confirming) {
			assert!(transfer.last_error.is_some());
		}
	}

	let recorded_before_close = observer.get_replay_stats().unwrap().total_events;

	// Let detached confirmation tasks observe the cancel, then release every
	// store handle and reopen.
	tokio::time::sleep(Duration::from_millis(300)).await;
	drop(observer);
	drop(pipeline);

	let reopened = ReplayStore::open(&db_path, 1_000).unwrap();
	assert_eq!(reopened.stats().unwrap().total_events, recorded_before_close);
}
