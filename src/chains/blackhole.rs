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

//! The native BlackHole ledger adapter.
//!
//! BlackHole runs in-process: blocks are a function of elapsed time, deposits
//! are injected by the ledger's transaction processor (out of scope here)
//! through [BlackHoleLedger::inject_deposit], and submissions are final as
//! soon as enough blocks pass. Because everything is deterministic and fast,
//! this adapter doubles as the workhorse of the pipeline test suite, with
//! fault hooks for scripted submit failures.

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChainAdapter, OutboundTransfer, PendingHandle};
use crate::{
	constants::ADAPTER_CHANNEL_CAPACITY,
	errors::RelayError,
	event::InboundEvent,
	health::{HealthState, HealthStatus},
	primitives::ForeignChain,
};

/// Deposit fan-out capacity; slow pipelines drop (and log) rather than block
/// the ledger.
const DEPOSIT_CHANNEL_CAPACITY: usize = 256;

/// The in-process ledger itself: block height, included transactions, and
/// the deposit feed.
pub struct BlackHoleLedger {
	genesis: Instant,
	block_interval: Duration,
	deposits: broadcast::Sender<InboundEvent>,
	/// tx hash → height of the block that included it.
	included: Mutex<HashMap<String, u64>>,
	idempotency: Mutex<HashMap<uuid::Uuid, PendingHandle>>,
	/// Scripted submit failures, consumed one per call. Fault-injection hook
	/// for tests and failure drills.
	submit_faults: Mutex<VecDeque<RelayError>>,
	tx_counter: AtomicU64,
}

impl BlackHoleLedger {
	pub fn new(block_interval: Duration) -> Arc<Self> {
		let (deposits, _) = broadcast::channel(DEPOSIT_CHANNEL_CAPACITY);
		Arc::new(Self {
			genesis: Instant::now(),
			block_interval,
			deposits,
			included: Mutex::new(HashMap::new()),
			idempotency: Mutex::new(HashMap::new()),
			submit_faults: Mutex::new(VecDeque::new()),
			tx_counter: AtomicU64::new(0),
		})
	}

	/// Current block height; blocks are produced by the passage of time.
	pub fn height(&self) -> u64 {
		(self.genesis.elapsed().as_nanos() / self.block_interval.as_nanos().max(1)) as u64
	}

	/// Entry point for the ledger's transaction processor: a deposit
	/// observed on BlackHole that the bridge should relay.
	pub fn inject_deposit(&self, event: InboundEvent) {
		// Nobody subscribed is fine (e.g. bridge not started yet).
		let _ = self.deposits.send(event);
	}

	/// Scripts the next submit calls to fail with the given errors, in
	/// order.
	pub fn queue_submit_failures(&self, errors: impl IntoIterator<Item = RelayError>) {
		self.submit_faults
			.lock()
			.expect("blackhole faults lock poisoned")
			.extend(errors);
	}

	pub fn transaction_count(&self) -> usize {
		self.included.lock().expect("blackhole ledger lock poisoned").len()
	}
}

pub struct BlackHoleAdapter {
	ledger: Arc<BlackHoleLedger>,
	confirmation_threshold: u32,
}

impl BlackHoleAdapter {
	pub fn new(ledger: Arc<BlackHoleLedger>, confirmation_threshold: u32) -> Self {
		Self { ledger, confirmation_threshold }
	}

	pub fn ledger(&self) -> Arc<BlackHoleLedger> {
		self.ledger.clone()
	}
}

#[async_trait]
impl ChainAdapter for BlackHoleAdapter {
	fn chain(&self) -> ForeignChain {
		ForeignChain::BlackHole
	}

	fn confirmation_threshold(&self) -> u32 {
		self.confirmation_threshold
	}

	async fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<InboundEvent> {
		let (event_sender, event_receiver) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);
		let mut deposits = self.ledger.deposits.subscribe();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					deposit = deposits.recv() => match deposit {
						Ok(event) => {
							if event_sender.send(event).await.is_err() {
								break
							}
						},
						Err(broadcast::error::RecvError::Lagged(skipped)) => {
							warn!("BlackHole deposit subscriber lagged; skipped {skipped} deposits");
						},
						Err(broadcast::error::RecvError::Closed) => break,
					},
				}
			}
			debug!("BlackHole subscription closed");
		});

		event_receiver
	}

	async fn submit(&self, outbound: &OutboundTransfer) -> Result<PendingHandle, RelayError> {
		// Idempotency: a repeat of a known key returns the original handle.
		if let Some(existing) = self
			.ledger
			.idempotency
			.lock()
			.expect("blackhole ledger lock poisoned")
			.get(&outbound.idempotency_key)
		{
			return Ok(existing.clone())
		}

		if let Some(fault) = self
			.ledger
			.submit_faults
			.lock()
			.expect("blackhole faults lock poisoned")
			.pop_front()
		{
			return Err(fault)
		}

		let sequence = self.ledger.tx_counter.fetch_add(1, Ordering::Relaxed);
		let tx_hash = format!("bhx{sequence:016x}");
		let inclusion_height = self.ledger.height() + 1;

		let handle = PendingHandle {
			chain: ForeignChain::BlackHole,
			tx_hash: tx_hash.clone(),
			accepted_at: Utc::now(),
		};
		{
			let mut included = self.ledger.included.lock().expect("blackhole ledger lock poisoned");
			included.insert(tx_hash, inclusion_height);
		}
		self.ledger
			.idempotency
			.lock()
			.expect("blackhole ledger lock poisoned")
			.insert(outbound.idempotency_key, handle.clone());

		debug!(
			"BlackHole accepted transfer {} at height {inclusion_height}",
			outbound.idempotency_key
		);
		Ok(handle)
	}

	async fn confirmations(&self, handle: &PendingHandle) -> Result<u32, RelayError> {
		let inclusion_height = self
			.ledger
			.included
			.lock()
			.expect("blackhole ledger lock poisoned")
			.get(&handle.tx_hash)
			.copied()
			.ok_or_else(|| {
				RelayError::Transient(format!("unknown BlackHole tx {}", handle.tx_hash))
			})?;

		let height = self.ledger.height();
		Ok(if height >= inclusion_height {
			(height - inclusion_height) as u32 + 1
		} else {
			0
		})
	}

	async fn health(&self) -> HealthStatus {
		HealthStatus::with_state(
			"adapter-blackhole",
			HealthState::Healthy,
			&format!("height {}", self.ledger.height()),
		)
	}
}
