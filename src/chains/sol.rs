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

//! Solana-like adapter.
//!
//! The chain exposes plain JSON-RPC 2.0. Deposits are observed by polling
//! `getSignaturesForAddress` on the bridge program and reading the memo
//! payload of each new transaction; submissions go through the node's
//! `bridgeSubmitTransfer` endpoint and are tracked to finality with
//! `getSignatureStatuses`.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
	rpc::call_rpc_raw, synthetic_event, ChainAdapter, OutboundTransfer, PendingHandle, SubmitMode,
};
use crate::{
	constants::{
		ADAPTER_CHANNEL_CAPACITY, ADAPTER_SYNTHETIC_FALLBACK_AFTER,
		RPC_RETRY_CONNECTION_INTERVAL, RPC_RETRY_CONNECTION_MAX_BACKOFF,
	},
	errors::RelayError,
	event::{EventKind, InboundEvent},
	health::{HealthState, HealthStatus},
	primitives::{format_amount, parse_amount, ForeignChain},
	utils::make_periodic_tick,
};

const HEALTH_COMPONENT: &str = "adapter-solana";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
	signature: String,
	#[serde(default)]
	block_time: Option<i64>,
	#[serde(default)]
	err: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
	#[serde(default)]
	confirmations: Option<u64>,
	#[serde(default)]
	confirmation_status: Option<String>,
	#[serde(default)]
	err: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct Response<T> {
	#[allow(dead_code)]
	context: serde_json::Value,
	value: T,
}

/// The bridge memo payload carried by deposit transactions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct MemoDeposit {
	from: String,
	to: String,
	token: String,
	/// Decimal string; parsed at 18 fixed places.
	amount: String,
}

pub struct SolAdapter {
	client: Client,
	endpoint: String,
	bridge_program: String,
	poll_interval: Duration,
	confirmation_threshold: u32,
	idempotency: Mutex<HashMap<uuid::Uuid, PendingHandle>>,
	health: Arc<Mutex<HealthStatus>>,
	synthetic_fallback: bool,
	synthetic_sequence: Arc<AtomicU64>,
}

impl SolAdapter {
	pub fn new(
		endpoint: &str,
		bridge_program: &str,
		poll_interval: Duration,
		confirmation_threshold: u32,
		synthetic_fallback: bool,
	) -> anyhow::Result<Self> {
		// The program address must be a valid 32-byte base58 pubkey.
		let decoded = bs58::decode(bridge_program)
			.into_vec()
			.map_err(|e| anyhow::anyhow!("bridge program is not base58: {e}"))?;
		anyhow::ensure!(
			decoded.len() == 32,
			"bridge program must decode to 32 bytes, got {}",
			decoded.len()
		);

		Ok(Self {
			client: Client::builder().build()?,
			endpoint: endpoint.to_string(),
			bridge_program: bridge_program.to_string(),
			poll_interval,
			confirmation_threshold,
			idempotency: Mutex::new(HashMap::new()),
			health: Arc::new(Mutex::new(HealthStatus::healthy(HEALTH_COMPONENT))),
			synthetic_fallback,
			synthetic_sequence: Arc::new(AtomicU64::new(0)),
		})
	}

	async fn call_rpc(
		&self,
		method: &str,
		params: Option<serde_json::Value>,
	) -> Result<serde_json::Value, RelayError> {
		Ok(call_rpc_raw(&self.client, &self.endpoint, method, params).await?)
	}
}

/// Extracts the bridge deposit from a `getTransaction` (jsonParsed)
/// response: the first memo instruction whose content parses as a
/// [MemoDeposit].
fn parse_deposit_transaction(transaction: &serde_json::Value) -> Option<MemoDeposit> {
	let instructions =
		transaction["transaction"]["message"]["instructions"].as_array()?;
	instructions.iter().find_map(|instruction| {
		if instruction["program"].as_str() != Some("spl-memo") {
			return None
		}
		let memo = instruction["parsed"].as_str()?;
		serde_json::from_str::<MemoDeposit>(memo).ok()
	})
}

#[async_trait]
impl ChainAdapter for SolAdapter {
	fn chain(&self) -> ForeignChain {
		ForeignChain::Solana
	}

	fn confirmation_threshold(&self) -> u32 {
		self.confirmation_threshold
	}

	async fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<InboundEvent> {
		let (event_sender, event_receiver) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);

		let client = self.client.clone();
		let endpoint = self.endpoint.clone();
		let bridge_program = self.bridge_program.clone();
		let poll_interval = self.poll_interval;
		let health = self.health.clone();
		let synthetic_fallback = self.synthetic_fallback;
		let synthetic_sequence = self.synthetic_sequence.clone();

		tokio::spawn(async move {
			let mut poll = make_periodic_tick(poll_interval, true);
			let mut last_signature: Option<String> = None;
			let mut consecutive_failures: u32 = 0;

			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = poll.tick() => {},
				}

				match poll_deposits(
					&client,
					&endpoint,
					&bridge_program,
					last_signature.as_deref(),
				)
				.await
				{
					Ok((deposits, newest_signature)) => {
						consecutive_failures = 0;
						if let Some(newest) = newest_signature {
							last_signature = Some(newest);
						}
						*health.lock().expect("sol health lock poisoned") =
							HealthStatus::healthy(HEALTH_COMPONENT);
						for event in deposits {
							if event_sender.send(event).await.is_err() {
								return
							}
						}
					},
					Err(rpc_error) => {
						consecutive_failures += 1;
						error!(
							"Solana deposit poll failed ({consecutive_failures} in a row): {rpc_error}"
						);
						*health.lock().expect("sol health lock poisoned") =
							HealthStatus::with_state(
								HEALTH_COMPONENT,
								HealthState::Degraded,
								&format!("poll failing: {rpc_error}"),
							);

						if synthetic_fallback &&
							consecutive_failures >= ADAPTER_SYNTHETIC_FALLBACK_AFTER
						{
							let sequence = synthetic_sequence.fetch_add(1, Ordering::Relaxed);
							warn!("Solana emitting synthetic event {sequence} while degraded");
							if event_sender
								.send(synthetic_event(ForeignChain::Solana, sequence))
								.await
								.is_err()
							{
								return
							}
						}

						// Back the poll off while the node is down.
						let backoff = std::cmp::min(
							RPC_RETRY_CONNECTION_MAX_BACKOFF,
							RPC_RETRY_CONNECTION_INTERVAL
								.saturating_mul(2u32.saturating_pow(consecutive_failures.min(8))),
						);
						tokio::select! {
							_ = cancel.cancelled() => break,
							_ = tokio::time::sleep(backoff) => {},
						}
					},
				}
			}
			*health.lock().expect("sol health lock poisoned") =
				HealthStatus::with_state(HEALTH_COMPONENT, HealthState::Stopped, "shut down");
			debug!("Solana subscription closed");
		});

		event_receiver
	}

	async fn submit(&self, outbound: &OutboundTransfer) -> Result<PendingHandle, RelayError> {
		if let Some(existing) = self
			.idempotency
			.lock()
			.expect("sol idempotency lock poisoned")
			.get(&outbound.idempotency_key)
		{
			return Ok(existing.clone())
		}

		let response = self
			.call_rpc(
				"bridgeSubmitTransfer",
				Some(json!([{
					"idempotencyKey": outbound.idempotency_key.to_string(),
					"to": outbound.to_address,
					"token": outbound.token_symbol,
					"amount": format_amount(outbound.amount),
					"sourceRef": outbound.source_ref,
					// The preflight simulation is optional validation; the
					// simplified recovery path skips it.
					"skipPreflight": outbound.mode == SubmitMode::Simplified,
				}])),
			)
			.await?;

		let signature = response
			.as_str()
			.ok_or_else(|| {
				RelayError::Transient(format!(
					"bridgeSubmitTransfer returned a non-string result: {response}"
				))
			})?
			.to_string();

		let handle =
			PendingHandle { chain: ForeignChain::Solana, tx_hash: signature, accepted_at: Utc::now() };
		self.idempotency
			.lock()
			.expect("sol idempotency lock poisoned")
			.insert(outbound.idempotency_key, handle.clone());
		info!("Solana accepted transfer {} as {}", outbound.idempotency_key, handle.tx_hash);
		Ok(handle)
	}

	async fn confirmations(&self, handle: &PendingHandle) -> Result<u32, RelayError> {
		let response = self
			.call_rpc(
				"getSignatureStatuses",
				Some(json!([[handle.tx_hash], {"searchTransactionHistory": true}])),
			)
			.await?;

		let statuses: Response<Vec<Option<SignatureStatus>>> = serde_json::from_value(response)
			.map_err(|e| RelayError::Transient(format!("undecodable signature status: {e}")))?;

		let Some(Some(status)) = statuses.value.into_iter().next() else {
			// Node does not know the signature (yet).
			return Ok(0)
		};
		if status.err.is_some() {
			return Err(RelayError::Permanent(format!(
				"destination transaction {} failed on chain: {:?}",
				handle.tx_hash, status.err
			)))
		}
		Ok(match status.confirmation_status.as_deref() {
			// Finalized transactions stop reporting a confirmation count.
			Some("finalized") => self
				.confirmation_threshold
				.max(status.confirmations.unwrap_or(0).try_into().unwrap_or(u32::MAX)),
			_ => status.confirmations.unwrap_or(0).try_into().unwrap_or(u32::MAX),
		})
	}

	async fn health(&self) -> HealthStatus {
		self.health.lock().expect("sol health lock poisoned").clone()
	}
}

/// One poll cycle: list new signatures for the bridge program (oldest
/// first), fetch each transaction, and decode its memo payload. Returns the
/// decoded deposits and the newest signature seen.
async fn poll_deposits(
	client: &Client,
	endpoint: &str,
	bridge_program: &str,
	until: Option<&str>,
) -> Result<(Vec<InboundEvent>, Option<String>), RelayError> {
	let params = match until {
		Some(until) => json!([bridge_program, {"until": until, "limit": 100}]),
		None => json!([bridge_program, {"limit": 100}]),
	};
	let response = call_rpc_raw(client, endpoint, "getSignaturesForAddress", Some(params)).await?;
	let mut signatures: Vec<SignatureInfo> = serde_json::from_value(response)
		.map_err(|e| RelayError::Transient(format!("undecodable signature list: {e}")))?;

	// Newest first on the wire; process in chain order.
	signatures.reverse();
	let newest_signature = signatures.last().map(|info| info.signature.clone());

	// First poll has no checkpoint: start witnessing from now rather than
	// replaying whatever history the node returns.
	if until.is_none() {
		return Ok((Vec::new(), newest_signature))
	}

	let mut deposits = Vec::new();
	for info in signatures {
		if info.err.is_some() {
			continue
		}

		let transaction = call_rpc_raw(
			client,
			endpoint,
			"getTransaction",
			Some(json!([info.signature, {"encoding": "jsonParsed", "commitment": "finalized"}])),
		)
		.await?;

		let Some(memo) = parse_deposit_transaction(&transaction) else {
			debug!("Transaction {} carries no bridge memo; skipping", info.signature);
			continue
		};
		let Some(amount) = parse_amount(&memo.amount) else {
			warn!(
				"Transaction {} memo has unparseable amount {:?}; skipping",
				info.signature, memo.amount
			);
			continue
		};

		deposits.push(InboundEvent::new(
			ForeignChain::Solana,
			&info.signature,
			&memo.from,
			&memo.to,
			&memo.token,
			amount,
			info.block_time.unwrap_or_else(|| Utc::now().timestamp()),
			EventKind::Transfer,
		));
	}

	Ok((deposits, newest_signature))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_invalid_bridge_program_addresses() {
		assert!(SolAdapter::new("http://localhost:8899", "not base58!", Duration::from_secs(1), 32, false)
			.is_err());
		// Valid 32-byte pubkey.
		assert!(SolAdapter::new(
			"http://localhost:8899",
			"vines1vzrYbzLMRdu58ou5XTby4qAqVRLmqo36NKPTg",
			Duration::from_secs(1),
			32,
			false,
		)
		.is_ok());
	}

	#[test]
	fn parses_the_bridge_memo_out_of_a_transaction() {
		let transaction = json!({
			"transaction": {
				"message": {
					"instructions": [
						{"program": "system", "parsed": {"type": "transfer"}},
						{
							"program": "spl-memo",
							"parsed": "{\"from\":\"so1Sender\",\"to\":\"bhx1dest\",\"token\":\"USDC\",\"amount\":\"1.5\"}"
						}
					]
				}
			}
		});

		let memo = parse_deposit_transaction(&transaction).unwrap();
		assert_eq!(
			memo,
			MemoDeposit {
				from: "so1Sender".to_string(),
				to: "bhx1dest".to_string(),
				token: "USDC".to_string(),
				amount: "1.5".to_string(),
			}
		);
	}

	#[test]
	fn transactions_without_memo_are_skipped() {
		let transaction = json!({
			"transaction": {"message": {"instructions": [{"program": "system", "parsed": {}}]}}
		});
		assert!(parse_deposit_transaction(&transaction).is_none());

		// Memo that is not a bridge payload.
		let transaction = json!({
			"transaction": {"message": {"instructions": [
				{"program": "spl-memo", "parsed": "gm"}
			]}}
		});
		assert!(parse_deposit_transaction(&transaction).is_none());
	}

	#[test]
	fn signature_status_decodes_from_rpc_shape() {
		let value = json!({
			"context": {"slot": 100},
			"value": [{"confirmations": 12, "confirmationStatus": "confirmed", "err": null}]
		});
		let statuses: Response<Vec<Option<SignatureStatus>>> =
			serde_json::from_value(value).unwrap();
		let status = statuses.value[0].clone().unwrap();
		assert_eq!(status.confirmations, Some(12));
		assert_eq!(status.confirmation_status.as_deref(), Some("confirmed"));
		assert!(status.err.is_none());
	}
}
