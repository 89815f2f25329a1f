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

//! The recovery loop: periodically resurfaces non-terminal transfers that
//! have gone quiet and walks them through escalating strategies, stopping at
//! the first success.
//!
//! 1. Direct re-submission through the normal path (submits are idempotent,
//!    so a lost-response duplicate is harmless).
//! 2. Simplified re-submission (optional adapter validation skipped), only
//!    when the destination adapter reports itself degraded.
//! 3. Operator-visible terminal mark: the transfer moves to `needs_review`.
//!    There is deliberately no force-complete — a transfer only ever
//!    completes off an observed confirmation threshold.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
	chains::SubmitMode,
	errors::RelayError,
	health::HealthState,
	pipeline::BridgeCore,
	transfer::{Transfer, TransferStatus},
	utils::make_periodic_tick,
};

pub(crate) async fn recovery_worker(core: Arc<BridgeCore>) {
	let mut tick = make_periodic_tick(core.config.recovery_interval, false);
	loop {
		tokio::select! {
			_ = core.cancel.cancelled() => break,
			_ = tick.tick() => {},
		}
		let recovered = run_recovery_cycle(&core).await;
		if recovered > 0 {
			info!("Recovery cycle resolved {recovered} stalled transfers");
		}
	}
	debug!("Recovery worker stopped");
}

/// One pass over the stalled set. Returns how many transfers a strategy
/// succeeded for.
pub(crate) async fn run_recovery_cycle(core: &Arc<BridgeCore>) -> usize {
	let stale_after = chrono::Duration::from_std(core.config.recovery_stale_after)
		.expect("stale-after durations are small");
	let stalled = core.observer.transfers.stalled(stale_after);
	if stalled.is_empty() {
		return 0
	}
	debug!("Recovery loop found {} stalled transfers", stalled.len());

	let mut recovered = 0;
	for transfer in stalled {
		if core.cancel.is_cancelled() {
			break
		}
		// The retry queue owns transfers it has pending items for; recovery
		// only picks up work nothing else is driving.
		if core.observer.retry_queue.contains_transfer(&transfer.id) {
			continue
		}
		if recover_transfer(core, &transfer).await {
			recovered += 1;
		}
	}
	recovered
}

async fn recover_transfer(core: &Arc<BridgeCore>, transfer: &Transfer) -> bool {
	match transfer.status {
		TransferStatus::Deduped => recover_unsubmitted(core, transfer).await,
		TransferStatus::Submitted | TransferStatus::Confirming =>
			recover_submitted(core, transfer).await,
		// Received/Validated never rest in the store, and terminal states
		// are not stalled by definition.
		_ => false,
	}
}

async fn recover_unsubmitted(core: &Arc<BridgeCore>, transfer: &Transfer) -> bool {
	// Strategy 1: straight re-submission.
	let direct = core.attempt_submit_once(transfer, SubmitMode::Standard).await;
	match direct {
		Ok(()) => {
			info!("Recovery re-submitted transfer {}", transfer.id);
			return true
		},
		Err(RelayError::Cancelled) => return false,
		Err(error @ RelayError::Permanent(_)) => {
			core.fail_transfer(&transfer.id, &error);
			return false
		},
		Err(error) => {
			debug!("Recovery direct re-submission of {} failed: {error}", transfer.id);
		},
	}

	// Strategy 2: simplified submission, only for a degraded destination.
	if adapter_is_degraded(core, transfer).await {
		match core.attempt_submit_once(transfer, SubmitMode::Simplified).await {
			Ok(()) => {
				warn!(
					"Recovery re-submitted transfer {} with simplified validation (adapter degraded)",
					transfer.id
				);
				return true
			},
			Err(RelayError::Cancelled) => return false,
			Err(error @ RelayError::Permanent(_)) => {
				core.fail_transfer(&transfer.id, &error);
				return false
			},
			Err(error) => {
				debug!("Recovery simplified re-submission of {} failed: {error}", transfer.id);
			},
		}
	}

	// Strategy 3: after the attempt budget is spent, stop retrying and hand
	// the transfer to an operator.
	escalate_if_exhausted(core, transfer);
	false
}

async fn recover_submitted(core: &Arc<BridgeCore>, transfer: &Transfer) -> bool {
	// A transfer parked in `submitted` missed its confirming transition
	// (e.g. shutdown between the two); move it forward before polling.
	if transfer.status == TransferStatus::Submitted {
		if let Err(error) =
			core.observer.transfers.transition(&transfer.id, TransferStatus::Confirming)
		{
			core.observer.record_error("recovery", &error);
			return false
		}
	}

	match core.attempt_confirm_once(transfer).await {
		Ok(()) => {
			info!("Recovery resumed confirmation polling for transfer {}", transfer.id);
			true
		},
		Err(RelayError::Cancelled) => false,
		Err(error @ RelayError::Permanent(_)) => {
			core.fail_transfer(&transfer.id, &error);
			false
		},
		Err(error) => {
			debug!("Recovery confirmation probe for {} failed: {error}", transfer.id);
			escalate_if_exhausted(core, transfer);
			false
		},
	}
}

async fn adapter_is_degraded(core: &Arc<BridgeCore>, transfer: &Transfer) -> bool {
	match core.adapters.get(&transfer.dest_chain) {
		Some(adapter) => adapter.health().await.state == HealthState::Degraded,
		None => false,
	}
}

fn escalate_if_exhausted(core: &Arc<BridgeCore>, transfer: &Transfer) {
	if transfer.retry_count >= core.config.retry_queue_max_attempts {
		core.escalate_to_review(&transfer.id);
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		chains::{
			blackhole::{BlackHoleAdapter, BlackHoleLedger},
			ChainAdapter,
		},
		constants::RETRY_QUEUE_MAX_ATTEMPTS,
		event::{EventKind, InboundEvent},
		pipeline::{BridgePipeline, PipelineConfig},
		primitives::ForeignChain,
		replay::ReplayStore,
		retry::RetryPolicy,
	};
	use chrono::Utc;

	fn fast_config() -> PipelineConfig {
		PipelineConfig {
			retry_policy: RetryPolicy {
				max_retries: 0,
				initial_delay: Duration::from_millis(5),
				multiplier: 2.0,
				max_delay: Duration::from_millis(20),
				max_jitter: Duration::from_millis(1),
			},
			recovery_stale_after: Duration::from_millis(10),
			confirmation_poll_interval: Duration::from_millis(10),
			confirmation_poll_timeout: Duration::from_secs(5),
			..PipelineConfig::default()
		}
	}

	fn test_pipeline() -> (tempfile::TempDir, Arc<BlackHoleLedger>, BridgePipeline) {
		let dir = tempfile::tempdir().unwrap();
		let replay = ReplayStore::open(&dir.path().join("replay.db"), 1_000).unwrap();
		let ledger = BlackHoleLedger::new(Duration::from_millis(10));
		let adapter: Arc<dyn ChainAdapter> = Arc::new(BlackHoleAdapter::new(ledger.clone(), 6));
		(dir, ledger.clone(), BridgePipeline::new(fast_config(), replay, vec![adapter]))
	}

	async fn stalled_deduped_transfer(
		pipeline: &BridgePipeline,
		ledger: &Arc<BlackHoleLedger>,
	) -> uuid::Uuid {
		// One scripted failure so the initial relay defers to the queue and
		// the transfer rests at `deduped`.
		ledger.queue_submit_failures([RelayError::Transient("down".to_string())]);
		pipeline
			.core
			.handle_event(InboundEvent::new(
				ForeignChain::Ethereum,
				&format!("0x{}", uuid::Uuid::new_v4().simple()),
				"0x1",
				"bhx1dest",
				"USDC",
				1_000,
				Utc::now().timestamp(),
				EventKind::Transfer,
			))
			.await;
		let id = pipeline.core.observer.transfers.list(None, None, 10)[0].id;
		// Simulate a restart that lost the (volatile) retry queue: the
		// transfer is stalled with nothing driving it.
		pipeline.core.observer.retry_queue.drain();
		pipeline
			.core
			.observer
			.transfers
			.backdate_last_attempt(&id, chrono::Duration::seconds(60));
		id
	}

	#[tokio::test]
	async fn direct_resubmission_recovers_a_stalled_transfer() {
		let (_dir, ledger, pipeline) = test_pipeline();
		let id = stalled_deduped_transfer(&pipeline, &ledger).await;

		assert_eq!(run_recovery_cycle(&pipeline.core).await, 1);

		// The poll task completes it shortly after.
		for _ in 0..100 {
			if pipeline.core.observer.transfers.get(&id).unwrap().status ==
				crate::transfer::TransferStatus::Completed
			{
				return
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("recovered transfer never completed");
	}

	#[tokio::test]
	async fn failed_recovery_keeps_the_transfer_for_later_cycles() {
		let (_dir, ledger, pipeline) = test_pipeline();
		let id = stalled_deduped_transfer(&pipeline, &ledger).await;

		// The ledger keeps failing; recovery must not escalate while the
		// attempt budget remains.
		ledger.queue_submit_failures(
			std::iter::repeat_with(|| RelayError::Transient("still down".to_string())).take(4),
		);
		assert_eq!(run_recovery_cycle(&pipeline.core).await, 0);

		let transfer = pipeline.core.observer.transfers.get(&id).unwrap();
		assert_eq!(transfer.status, crate::transfer::TransferStatus::Deduped);
	}

	#[tokio::test]
	async fn exhausted_transfers_escalate_to_needs_review_not_completed() {
		let (_dir, ledger, pipeline) = test_pipeline();
		let id = stalled_deduped_transfer(&pipeline, &ledger).await;

		// Burn the whole attempt budget.
		ledger.queue_submit_failures(
			std::iter::repeat_with(|| RelayError::Transient("gone".to_string()))
				.take((RETRY_QUEUE_MAX_ATTEMPTS + 4) as usize),
		);
		for _ in 0..=RETRY_QUEUE_MAX_ATTEMPTS {
			pipeline
				.core
				.observer
				.transfers
				.backdate_last_attempt(&id, chrono::Duration::seconds(60));
			run_recovery_cycle(&pipeline.core).await;
		}

		let transfer = pipeline.core.observer.transfers.get(&id).unwrap();
		assert_eq!(transfer.status, crate::transfer::TransferStatus::NeedsReview);
		// The completion invariant survived: no destination hash, not
		// completed.
		assert!(transfer.dest_tx_hash.is_none());
	}

	#[tokio::test]
	async fn permanent_error_during_recovery_fails_the_transfer() {
		let (_dir, ledger, pipeline) = test_pipeline();
		let id = stalled_deduped_transfer(&pipeline, &ledger).await;

		ledger.queue_submit_failures([RelayError::Permanent("token delisted".to_string())]);
		run_recovery_cycle(&pipeline.core).await;

		assert_eq!(
			pipeline.core.observer.transfers.get(&id).unwrap().status,
			crate::transfer::TransferStatus::Failed
		);
	}
}
