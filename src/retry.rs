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

//! Bounded retry with exponential backoff and jitter, gated by a circuit
//! breaker and interruptible by the shutdown token.
//!
//! This is the inline recovery layer: a handful of quick re-attempts around
//! one call. Anything that outlives these bounds belongs in the retry queue.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
	breaker::CircuitBreaker,
	constants::{
		RETRY_DEFAULT_INITIAL_DELAY, RETRY_DEFAULT_MAX_DELAY, RETRY_DEFAULT_MAX_JITTER,
		RETRY_DEFAULT_MAX_RETRIES, RETRY_DEFAULT_MULTIPLIER,
	},
	errors::RelayError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
	/// Additional attempts after the first.
	pub max_retries: u32,
	pub initial_delay: Duration,
	pub multiplier: f64,
	pub max_delay: Duration,
	pub max_jitter: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: RETRY_DEFAULT_MAX_RETRIES,
			initial_delay: RETRY_DEFAULT_INITIAL_DELAY,
			multiplier: RETRY_DEFAULT_MULTIPLIER,
			max_delay: RETRY_DEFAULT_MAX_DELAY,
			max_jitter: RETRY_DEFAULT_MAX_JITTER,
		}
	}
}

impl RetryPolicy {
	/// Backoff before retry number `attempt` (1-based), jitter included.
	fn delay_for_attempt(&self, attempt: u32) -> Duration {
		let exponential = self
			.initial_delay
			.mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32))
			.min(self.max_delay);
		let jitter = if self.max_jitter.is_zero() {
			Duration::ZERO
		} else {
			rand::thread_rng().gen_range(Duration::ZERO..self.max_jitter)
		};
		exponential + jitter
	}
}

/// Runs `op` until it succeeds, its error is not retryable, or the policy is
/// exhausted. The breaker is consulted before every attempt and told about
/// every outcome; an open breaker returns `CircuitOpen` without calling `op`.
/// The backoff sleep observes `cancel` and returns `Cancelled` promptly.
pub async fn with_retry<T, F, Fut>(
	op_name: &str,
	breaker: &CircuitBreaker,
	policy: &RetryPolicy,
	cancel: &CancellationToken,
	mut op: F,
) -> Result<T, RelayError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, RelayError>>,
{
	let mut attempt: u32 = 0;
	loop {
		breaker.check()?;
		if cancel.is_cancelled() {
			return Err(RelayError::Cancelled)
		}

		match op().await {
			Ok(value) => {
				breaker.record_success();
				return Ok(value)
			},
			Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
			Err(error) => {
				breaker.record_failure();

				if !error.is_retryable() {
					return Err(error)
				}
				if attempt >= policy.max_retries {
					warn!(
						"Operation {op_name} failed after {} attempts: {error}",
						attempt + 1
					);
					return Err(error)
				}

				attempt += 1;
				let delay = policy.delay_for_attempt(attempt);
				warn!(
					"Operation {op_name} failed on attempt {attempt}: {error}. Retrying in {}ms",
					delay.as_millis()
				);
				tokio::select! {
					_ = cancel.cancelled() => return Err(RelayError::Cancelled),
					_ = tokio::time::sleep(delay) => {},
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	};

	use super::*;
	use crate::breaker::{BreakerConfig, BreakerState};

	fn quick_policy() -> RetryPolicy {
		RetryPolicy {
			max_retries: 3,
			initial_delay: Duration::from_millis(5),
			multiplier: 2.0,
			max_delay: Duration::from_millis(50),
			max_jitter: Duration::from_millis(1),
		}
	}

	fn test_breaker() -> CircuitBreaker {
		CircuitBreaker::new("test-op", BreakerConfig::default())
	}

	#[tokio::test]
	async fn success_on_first_attempt() {
		let breaker = test_breaker();
		let cancel = CancellationToken::new();
		let result: Result<u32, _> =
			with_retry("op", &breaker, &quick_policy(), &cancel, || async { Ok(42) }).await;
		assert_eq!(result.unwrap(), 42);
	}

	#[tokio::test]
	async fn transient_failures_are_retried_until_success() {
		let breaker = test_breaker();
		let cancel = CancellationToken::new();
		let calls = Arc::new(AtomicU32::new(0));

		let result = with_retry("op", &breaker, &quick_policy(), &cancel, || {
			let calls = calls.clone();
			async move {
				if calls.fetch_add(1, Ordering::SeqCst) < 2 {
					Err(RelayError::Transient("flaky".to_string()))
				} else {
					Ok("done")
				}
			}
		})
		.await;

		assert_eq!(result.unwrap(), "done");
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		// Two failures stay well under the default threshold of 5.
		assert_eq!(breaker.state(), BreakerState::Closed);
	}

	#[tokio::test]
	async fn permanent_errors_are_not_retried() {
		let breaker = test_breaker();
		let cancel = CancellationToken::new();
		let calls = Arc::new(AtomicU32::new(0));

		let result: Result<(), _> = with_retry("op", &breaker, &quick_policy(), &cancel, || {
			let calls = calls.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Err(RelayError::Permanent("unsupported token".to_string()))
			}
		})
		.await;

		assert!(matches!(result, Err(RelayError::Permanent(_))));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn exhaustion_returns_the_last_error() {
		let breaker = test_breaker();
		let cancel = CancellationToken::new();
		let calls = Arc::new(AtomicU32::new(0));

		let result: Result<(), _> = with_retry("op", &breaker, &quick_policy(), &cancel, || {
			let calls = calls.clone();
			async move {
				let n = calls.fetch_add(1, Ordering::SeqCst);
				Err(RelayError::Transient(format!("failure {n}")))
			}
		})
		.await;

		// 1 initial + 3 retries.
		assert_eq!(calls.load(Ordering::SeqCst), 4);
		assert_eq!(result, Err(RelayError::Transient("failure 3".to_string())));
	}

	#[tokio::test]
	async fn open_breaker_short_circuits_without_calling_op() {
		let breaker = CircuitBreaker::new(
			"test-op",
			BreakerConfig {
				failure_threshold: 1,
				open_timeout: Duration::from_secs(60),
				half_open_successes: 3,
			},
		);
		breaker.record_failure();
		assert_eq!(breaker.state(), BreakerState::Open);

		let cancel = CancellationToken::new();
		let result: Result<(), _> =
			with_retry("op", &breaker, &quick_policy(), &cancel, || async {
				panic!("op must not run while the breaker is open")
			})
			.await;
		assert!(matches!(result, Err(RelayError::CircuitOpen(_))));
	}

	#[tokio::test]
	async fn cancellation_interrupts_the_backoff_sleep() {
		let breaker = test_breaker();
		let cancel = CancellationToken::new();
		let policy = RetryPolicy {
			initial_delay: Duration::from_secs(60),
			..quick_policy()
		};

		let cancel_clone = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			cancel_clone.cancel();
		});

		let started = std::time::Instant::now();
		let result: Result<(), _> = with_retry("op", &breaker, &policy, &cancel, || async {
			Err(RelayError::Transient("always".to_string()))
		})
		.await;

		assert_eq!(result, Err(RelayError::Cancelled));
		assert!(started.elapsed() < Duration::from_secs(1));
	}
}
