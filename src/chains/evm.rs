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

//! Ethereum-like adapter.
//!
//! Subscription rides a websocket log subscription on the bridge vault
//! contract (`BridgeDeposit` events); submission goes through a signing
//! client over HTTP. The websocket reconnects on its own with capped
//! exponential backoff, and after enough consecutive failures the adapter
//! can drop into synthetic-traffic mode, reporting itself degraded until the
//! node comes back.

use std::{
	collections::HashMap,
	path::PathBuf,
	str::FromStr,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Instant,
};

use async_trait::async_trait;
use chrono::Utc;
use ethers::{
	abi::{ParamType, Token},
	prelude::*,
	signers::Signer,
	types::transaction::eip2718::TypedTransaction,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{synthetic_event, ChainAdapter, OutboundTransfer, PendingHandle, SubmitMode};
use crate::{
	constants::{
		ADAPTER_CHANNEL_CAPACITY, ADAPTER_SYNTHETIC_FALLBACK_AFTER,
		RPC_RETRY_CONNECTION_INTERVAL, RPC_RETRY_CONNECTION_MAX_BACKOFF,
	},
	errors::RelayError,
	event::{EventKind, InboundEvent},
	health::{HealthState, HealthStatus},
	primitives::ForeignChain,
	utils::read_clean_and_decode_hex_str_file,
};

const DEPOSIT_EVENT_SIGNATURE: &str = "BridgeDeposit(address,string,string,uint256)";
const RELEASE_FUNCTION_SIGNATURE: &str = "releaseTransfer(bytes32,address,string,uint256)";

const HEALTH_COMPONENT: &str = "adapter-ethereum";

/// How long a locally assigned nonce sequence is trusted before the pending
/// transaction count is re-read from the node.
const NONCE_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(90);

/// Locally tracked nonce sequence. Expires on a timer so that an external
/// transaction from the same account (or a dropped reset) cannot leave the
/// adapter assigning stale nonces indefinitely.
struct NonceCache {
	next: U256,
	valid_until: Instant,
}

pub struct EvmAdapter {
	chain_name: &'static str,
	ws_endpoint: String,
	vault_address: H160,
	expected_chain_id: u64,
	provider: Arc<Provider<Http>>,
	signer: SignerMiddleware<Arc<Provider<Http>>, LocalWallet>,
	nonce_cache: Arc<tokio::sync::Mutex<Option<NonceCache>>>,
	idempotency: Mutex<HashMap<uuid::Uuid, PendingHandle>>,
	health: Arc<Mutex<HealthStatus>>,
	confirmation_threshold: u32,
	synthetic_fallback: bool,
	synthetic_sequence: Arc<AtomicU64>,
}

impl EvmAdapter {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		ws_endpoint: &str,
		http_endpoint: &str,
		private_key_file: PathBuf,
		vault_address: H160,
		expected_chain_id: u64,
		confirmation_threshold: u32,
		synthetic_fallback: bool,
	) -> anyhow::Result<Self> {
		let provider = Arc::new(Provider::<Http>::try_from(http_endpoint)?);

		let wallet = read_clean_and_decode_hex_str_file(
			&private_key_file,
			"Ethereum Private Key",
			|key| LocalWallet::from_str(key).map_err(anyhow::Error::new),
		)?;
		let signer =
			SignerMiddleware::new(provider.clone(), wallet.with_chain_id(expected_chain_id));

		Ok(Self {
			chain_name: "Ethereum",
			ws_endpoint: ws_endpoint.to_string(),
			vault_address,
			expected_chain_id,
			provider,
			signer,
			nonce_cache: Arc::new(tokio::sync::Mutex::new(None)),
			idempotency: Mutex::new(HashMap::new()),
			health: Arc::new(Mutex::new(HealthStatus::healthy(HEALTH_COMPONENT))),
			confirmation_threshold,
			synthetic_fallback,
			synthetic_sequence: Arc::new(AtomicU64::new(0)),
		})
	}

	async fn next_nonce(&self) -> Result<U256, RelayError> {
		let mut cache_lock = self.nonce_cache.lock().await;

		if let Some(cache) = cache_lock.as_mut().filter(|cache| Instant::now() < cache.valid_until)
		{
			let nonce = cache.next;
			cache.next += U256::one();
			return Ok(nonce)
		}

		// No usable sequence: seed a fresh one from the node's pending
		// transaction count.
		let pending_count = self
			.signer
			.get_transaction_count(self.signer.address(), Some(BlockNumber::Pending.into()))
			.await
			.map_err(|e| {
				RelayError::Transient(format!("pending transaction count query failed: {e}"))
			})?;
		*cache_lock = Some(NonceCache {
			next: pending_count + U256::one(),
			valid_until: Instant::now() + NONCE_CACHE_TTL,
		});
		Ok(pending_count)
	}

	/// Forget the cached sequence; the next submit re-reads it from the
	/// node.
	async fn invalidate_nonce_cache(&self) {
		*self.nonce_cache.lock().await = None;
	}

	fn release_calldata(outbound: &OutboundTransfer) -> Result<Bytes, RelayError> {
		let to_address = H160::from_str(outbound.to_address.trim_start_matches("0x"))
			.map_err(|_| {
				RelayError::Permanent(format!(
					"`{}` is not a valid Ethereum address",
					outbound.to_address
				))
			})?;

		let selector = &ethers::utils::keccak256(RELEASE_FUNCTION_SIGNATURE.as_bytes())[..4];
		let mut key_bytes32 = [0u8; 32];
		key_bytes32[..16].copy_from_slice(outbound.idempotency_key.as_bytes());
		let args = ethers::abi::encode(&[
			Token::FixedBytes(key_bytes32.to_vec()),
			Token::Address(to_address),
			Token::String(outbound.token_symbol.clone()),
			Token::Uint(U256::from(outbound.amount)),
		]);
		Ok(Bytes::from([selector, args.as_slice()].concat()))
	}
}

/// Permanent errors are those a retry of the identical transaction cannot
/// fix.
fn classify_submit_error(message: String) -> RelayError {
	let lowered = message.to_lowercase();
	if ["insufficient funds", "execution reverted", "invalid transaction", "exceeds allowance"]
		.iter()
		.any(|marker| lowered.contains(marker))
	{
		RelayError::Permanent(message)
	} else {
		RelayError::Transient(message)
	}
}

/// A decoded `BridgeDeposit` vault log.
struct DepositLog {
	tx_hash: String,
	from: String,
	dest_address: String,
	token_symbol: String,
	amount: u128,
}

fn parse_deposit_log(log: &web3::types::Log) -> anyhow::Result<DepositLog> {
	let tx_hash = log
		.transaction_hash
		.ok_or_else(|| anyhow::anyhow!("deposit log has no transaction hash"))?;
	let from = log
		.topics
		.get(1)
		.map(|topic| H160::from_slice(&topic.as_bytes()[12..]))
		.ok_or_else(|| anyhow::anyhow!("deposit log has no sender topic"))?;

	let tokens = ethers::abi::decode(
		&[ParamType::String, ParamType::String, ParamType::Uint(256)],
		&log.data.0,
	)?;
	let (dest_address, token_symbol, amount) = match &tokens[..] {
		[Token::String(dest), Token::String(symbol), Token::Uint(amount)] =>
			(dest.clone(), symbol.clone(), *amount),
		_ => anyhow::bail!("unexpected deposit log shape: {tokens:?}"),
	};
	let amount: u128 =
		amount.try_into().map_err(|_| anyhow::anyhow!("deposit amount exceeds u128"))?;

	Ok(DepositLog {
		tx_hash: format!("{tx_hash:#x}"),
		from: format!("{from:#x}"),
		dest_address,
		token_symbol,
		amount,
	})
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
	fn chain(&self) -> ForeignChain {
		ForeignChain::Ethereum
	}

	fn confirmation_threshold(&self) -> u32 {
		self.confirmation_threshold
	}

	async fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<InboundEvent> {
		let (event_sender, event_receiver) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);

		let ws_endpoint = self.ws_endpoint.clone();
		let vault_address = self.vault_address;
		let expected_chain_id = self.expected_chain_id;
		let chain_name = self.chain_name;
		let provider = self.provider.clone();
		let health = self.health.clone();
		let synthetic_fallback = self.synthetic_fallback;
		let synthetic_sequence = self.synthetic_sequence.clone();

		tokio::spawn(async move {
			let mut consecutive_failures: u32 = 0;
			loop {
				if cancel.is_cancelled() {
					break
				}

				match run_log_subscription(
					&ws_endpoint,
					vault_address,
					expected_chain_id,
					&provider,
					&event_sender,
					&cancel,
					&mut consecutive_failures,
					&health,
				)
				.await
				{
					Ok(()) => break, // cancelled
					Err(error) => {
						consecutive_failures += 1;
						error!(
							"{chain_name} websocket subscription failed ({consecutive_failures} in a row): {error:#}"
						);
						*health.lock().expect("evm health lock poisoned") =
							HealthStatus::with_state(
								HEALTH_COMPONENT,
								HealthState::Degraded,
								&format!("reconnecting: {error}"),
							);
					},
				}

				if synthetic_fallback &&
					consecutive_failures >= ADAPTER_SYNTHETIC_FALLBACK_AFTER
				{
					// Keep the pipeline exercised while the node is gone; one
					// synthetic event per reconnect attempt.
					let sequence = synthetic_sequence.fetch_add(1, Ordering::Relaxed);
					warn!("{chain_name} emitting synthetic event {sequence} while degraded");
					let _ = event_sender
						.send(synthetic_event(ForeignChain::Ethereum, sequence))
						.await;
				}

				let backoff = std::cmp::min(
					RPC_RETRY_CONNECTION_MAX_BACKOFF,
					RPC_RETRY_CONNECTION_INTERVAL
						.saturating_mul(2u32.saturating_pow(consecutive_failures.min(8))),
				);
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(backoff) => {},
				}
			}
			*health.lock().expect("evm health lock poisoned") =
				HealthStatus::with_state(HEALTH_COMPONENT, HealthState::Stopped, "shut down");
		});

		event_receiver
	}

	async fn submit(&self, outbound: &OutboundTransfer) -> Result<PendingHandle, RelayError> {
		if let Some(existing) = self
			.idempotency
			.lock()
			.expect("evm idempotency lock poisoned")
			.get(&outbound.idempotency_key)
		{
			return Ok(existing.clone())
		}

		let mut tx = Eip1559TransactionRequest::new()
			.to(self.vault_address)
			.data(Self::release_calldata(outbound)?);

		// Preflight gas estimation is the optional validation step; the
		// simplified recovery path skips it and lets the node default.
		if outbound.mode == SubmitMode::Standard {
			let gas = self
				.provider
				.estimate_gas(&TypedTransaction::Eip1559(tx.clone()), None)
				.await
				.map_err(|e| classify_submit_error(format!("gas estimation failed: {e}")))?;
			tx = tx.gas(gas);
		}
		tx = tx.nonce(self.next_nonce().await?);

		let pending = match self.signer.send_transaction(tx, None).await {
			Ok(pending) => pending,
			Err(error) => {
				// A rejected send may mean the local sequence ran ahead of
				// (or fell behind) the node; start over from its view.
				warn!("{} send failed; nonce cache invalidated", self.chain_name);
				self.invalidate_nonce_cache().await;
				return Err(classify_submit_error(error.to_string()))
			},
		};

		let handle = PendingHandle {
			chain: ForeignChain::Ethereum,
			tx_hash: format!("{:#x}", pending.tx_hash()),
			accepted_at: Utc::now(),
		};
		self.idempotency
			.lock()
			.expect("evm idempotency lock poisoned")
			.insert(outbound.idempotency_key, handle.clone());
		info!("{} accepted transfer {} as {}", self.chain_name, outbound.idempotency_key, handle.tx_hash);
		Ok(handle)
	}

	async fn confirmations(&self, handle: &PendingHandle) -> Result<u32, RelayError> {
		let tx_hash = H256::from_str(handle.tx_hash.trim_start_matches("0x"))
			.map_err(|_| RelayError::Permanent(format!("malformed tx hash {}", handle.tx_hash)))?;

		let receipt = self
			.provider
			.get_transaction_receipt(tx_hash)
			.await
			.map_err(|e| RelayError::Transient(format!("receipt query failed: {e}")))?;

		let Some(receipt) = receipt else {
			// Not yet mined.
			return Ok(0)
		};
		if receipt.status == Some(0.into()) {
			return Err(RelayError::Permanent(format!(
				"destination transaction {} reverted",
				handle.tx_hash
			)))
		}
		let Some(included_in) = receipt.block_number else { return Ok(0) };

		let latest = self
			.provider
			.get_block_number()
			.await
			.map_err(|e| RelayError::Transient(format!("block number query failed: {e}")))?;

		Ok(latest
			.saturating_sub(included_in)
			.as_u64()
			.saturating_add(1)
			.try_into()
			.unwrap_or(u32::MAX))
	}

	async fn health(&self) -> HealthStatus {
		self.health.lock().expect("evm health lock poisoned").clone()
	}
}

/// One websocket connection lifetime: connect, verify the chain id, stream
/// vault deposit logs into the pipeline. Returns `Ok(())` only on
/// cancellation.
#[allow(clippy::too_many_arguments)]
async fn run_log_subscription(
	ws_endpoint: &str,
	vault_address: H160,
	expected_chain_id: u64,
	provider: &Arc<Provider<Http>>,
	event_sender: &mpsc::Sender<InboundEvent>,
	cancel: &CancellationToken,
	consecutive_failures: &mut u32,
	health: &Arc<Mutex<HealthStatus>>,
) -> anyhow::Result<()> {
	let web3 = web3::Web3::new(web3::transports::WebSocket::new(ws_endpoint).await?);

	let client_chain_id = web3.eth().chain_id().await?;
	if client_chain_id != expected_chain_id.into() {
		anyhow::bail!(
			"Expected chain id {expected_chain_id}, ws client returned {client_chain_id}."
		)
	}

	let deposit_topic = web3::types::H256::from_slice(&ethers::utils::keccak256(
		DEPOSIT_EVENT_SIGNATURE.as_bytes(),
	));
	let filter = web3::types::FilterBuilder::default()
		.address(vec![web3::types::H160::from_slice(vault_address.as_bytes())])
		.topics(Some(vec![deposit_topic]), None, None, None)
		.build();

	let mut log_stream = web3.eth_subscribe().subscribe_logs(filter).await?;
	info!("Subscribed to vault deposits at {vault_address:#x}");
	*consecutive_failures = 0;
	*health.lock().expect("evm health lock poisoned") = HealthStatus::healthy(HEALTH_COMPONENT);

	loop {
		let log = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			log = log_stream.next() => log,
		};
		let log = match log {
			Some(Ok(log)) => log,
			Some(Err(error)) => anyhow::bail!("log stream error: {error}"),
			None => anyhow::bail!("log stream ended"),
		};

		let deposit = match parse_deposit_log(&log) {
			Ok(parsed) => parsed,
			Err(error) => {
				warn!("Discarding undecodable vault deposit log: {error:#}");
				continue
			},
		};

		// Prefer the block timestamp the deposit landed in; fall back to
		// observation time if the block is not fetchable.
		let source_timestamp = match log.block_number {
			Some(block_number) => provider
				.get_block(ethers::types::BlockId::Number(ethers::types::BlockNumber::Number(
					block_number.as_u64().into(),
				)))
				.await
				.ok()
				.flatten()
				.map(|block| block.timestamp.as_u64() as i64)
				.unwrap_or_else(|| Utc::now().timestamp()),
			None => Utc::now().timestamp(),
		};

		let event = InboundEvent::new(
			ForeignChain::Ethereum,
			&deposit.tx_hash,
			&deposit.from,
			&deposit.dest_address,
			&deposit.token_symbol,
			deposit.amount,
			source_timestamp,
			EventKind::Transfer,
		);
		if event_sender.send(event).await.is_err() {
			// Pipeline gone; treat as cancellation.
			return Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::primitives::parse_amount;

	fn outbound(to_address: &str) -> OutboundTransfer {
		OutboundTransfer {
			idempotency_key: uuid::Uuid::new_v4(),
			dest_chain: ForeignChain::Ethereum,
			to_address: to_address.to_string(),
			token_symbol: "USDC".to_string(),
			amount: parse_amount("1.5").unwrap(),
			source_ref: "blackhole:bhx01".to_string(),
			mode: SubmitMode::Standard,
		}
	}

	#[test]
	fn release_calldata_has_selector_and_args() {
		let calldata =
			EvmAdapter::release_calldata(&outbound("0x541f563237A309B3A61E33BDf07a8930Bdba8D99"))
				.unwrap();
		let selector = &ethers::utils::keccak256(RELEASE_FUNCTION_SIGNATURE.as_bytes())[..4];
		assert_eq!(&calldata[..4], selector);
		// 4 ABI words minimum after the selector.
		assert!(calldata.len() >= 4 + 32 * 4);
	}

	#[test]
	fn release_calldata_rejects_bad_addresses() {
		assert!(matches!(
			EvmAdapter::release_calldata(&outbound("not-an-address")),
			Err(RelayError::Permanent(_))
		));
	}

	#[test]
	fn submit_errors_are_classified() {
		assert!(matches!(
			classify_submit_error("insufficient funds for gas * price + value".to_string()),
			RelayError::Permanent(_)
		));
		assert!(matches!(
			classify_submit_error("execution reverted: unsupported token".to_string()),
			RelayError::Permanent(_)
		));
		assert!(matches!(
			classify_submit_error("connection reset by peer".to_string()),
			RelayError::Transient(_)
		));
	}

	#[test]
	fn deposit_logs_round_trip_through_the_abi() {
		let data = ethers::abi::encode(&[
			Token::String("bhx1destination".to_string()),
			Token::String("USDC".to_string()),
			Token::Uint(U256::from(parse_amount("1.5").unwrap())),
		]);
		let mut from_topic = [0u8; 32];
		from_topic[12..].copy_from_slice(&[0x11; 20]);

		let log = web3::types::Log {
			address: web3::types::H160::zero(),
			topics: vec![
				web3::types::H256::from_slice(&ethers::utils::keccak256(
					DEPOSIT_EVENT_SIGNATURE.as_bytes(),
				)),
				web3::types::H256::from_slice(&from_topic),
			],
			data: web3::types::Bytes(data),
			block_hash: None,
			block_number: Some(1.into()),
			transaction_hash: Some(web3::types::H256::from_low_u64_be(0xabc)),
			transaction_index: None,
			log_index: None,
			transaction_log_index: None,
			log_type: None,
			removed: None,
		};

		let deposit = parse_deposit_log(&log).unwrap();
		assert!(deposit.tx_hash.starts_with("0x"));
		assert_eq!(deposit.from, format!("{:#x}", H160::from([0x11; 20])));
		assert_eq!(deposit.dest_address, "bhx1destination");
		assert_eq!(deposit.token_symbol, "USDC");
		assert_eq!(deposit.amount, parse_amount("1.5").unwrap());
	}

	#[test]
	fn undecodable_logs_are_rejected() {
		let log = web3::types::Log {
			address: web3::types::H160::zero(),
			topics: vec![],
			data: web3::types::Bytes(vec![0x01, 0x02]),
			block_hash: None,
			block_number: None,
			transaction_hash: None,
			transaction_index: None,
			log_index: None,
			transaction_log_index: None,
			log_type: None,
			removed: None,
		};
		assert!(parse_deposit_log(&log).is_err());
	}
}
