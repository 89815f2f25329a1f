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

//! Chain adapters: everything chain-specific behind one capability set.
//!
//! An adapter subscribes to its chain's transfer events, submits outbound
//! transfers idempotently, and reports confirmations and health. The
//! pipeline neither knows nor cares which of the three chains is behind the
//! trait object.

pub mod blackhole;
pub mod evm;
pub mod rpc;
pub mod sol;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
	errors::RelayError,
	event::InboundEvent,
	health::HealthStatus,
	primitives::{AssetAmount, ForeignChain},
};

/// How thoroughly the adapter should vet the transfer before broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
	/// Full path, including the adapter's optional validation steps.
	Standard,
	/// Recovery path for degraded adapters: skip optional validation
	/// (preflight simulation, fee estimation), keep the mandatory ones.
	Simplified,
}

/// What the orchestrator hands the destination adapter per submit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTransfer {
	/// Equal to the Transfer id; adapters must dedupe on it.
	pub idempotency_key: Uuid,
	pub dest_chain: ForeignChain,
	pub to_address: String,
	pub token_symbol: String,
	pub amount: AssetAmount,
	/// Source-side provenance, `<chain>:<tx_hash>`.
	pub source_ref: String,
	pub mode: SubmitMode,
}

/// Handle for a transaction the destination chain accepted but has not yet
/// finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHandle {
	pub chain: ForeignChain,
	pub tx_hash: String,
	pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChainAdapter: Send + Sync + 'static {
	fn chain(&self) -> ForeignChain;

	/// Blocks/slots required before a destination transaction counts as
	/// final.
	fn confirmation_threshold(&self) -> u32;

	/// Starts the chain subscription and returns the bounded event channel
	/// feeding the pipeline. The adapter owns the connection: it reconnects
	/// silently with capped exponential backoff and may fall back to
	/// synthetic traffic (marking itself degraded) after repeated failures.
	/// The channel closes when `cancel` fires.
	async fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<InboundEvent>;

	/// Submits the transfer. Must be idempotent with respect to
	/// `outbound.idempotency_key`: a repeat call returns the original
	/// handle and produces no second transaction.
	async fn submit(&self, outbound: &OutboundTransfer) -> Result<PendingHandle, RelayError>;

	/// Monotonically non-decreasing confirmation count for a pending
	/// transaction.
	async fn confirmations(&self, handle: &PendingHandle) -> Result<u32, RelayError>;

	async fn health(&self) -> HealthStatus;
}

/// Source-side provenance string carried to the destination chain.
pub fn source_ref(chain: ForeignChain, tx_hash: &str) -> String {
	format!("{chain}:{tx_hash}")
}

/// Deterministic synthetic event used by adapters in synthetic-traffic
/// fallback mode, tagged so it can never collide with a real tx hash.
pub(crate) fn synthetic_event(chain: ForeignChain, sequence: u64) -> InboundEvent {
	InboundEvent::new(
		chain,
		&format!("synthetic-{chain}-{sequence}"),
		"synthetic-source",
		"synthetic-dest",
		"TEST",
		crate::primitives::parse_amount("0.000000000000000001").expect("static amount parses"),
		Utc::now().timestamp(),
		crate::event::EventKind::Transfer,
	)
}
