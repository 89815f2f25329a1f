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

//! Named circuit breakers guarding each external dependency.
//!
//! Standard three-state machine: `closed` counts consecutive failures until a
//! threshold opens the circuit; `open` fast-fails every call until the open
//! timeout elapses; the first call after that probes in `half_open`, where
//! three consecutive successes close the circuit and any failure reopens it.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
	constants::{
		BREAKER_DEFAULT_FAILURE_THRESHOLD, BREAKER_DEFAULT_OPEN_TIMEOUT,
		BREAKER_HALF_OPEN_SUCCESSES, RELAY_BREAKER_FAILURE_THRESHOLD, RELAY_BREAKER_NAME,
		RELAY_BREAKER_OPEN_TIMEOUT,
	},
	errors::RelayError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
	pub failure_threshold: u32,
	pub open_timeout: Duration,
	pub half_open_successes: u32,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: BREAKER_DEFAULT_FAILURE_THRESHOLD,
			open_timeout: BREAKER_DEFAULT_OPEN_TIMEOUT,
			half_open_successes: BREAKER_HALF_OPEN_SUCCESSES,
		}
	}
}

/// Read-only view for the snapshot façade.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
	pub name: String,
	pub state: BreakerState,
	pub failure_count: u32,
	pub success_count: u32,
	pub failure_threshold: u32,
	pub open_timeout_secs: u64,
	/// Remaining fast-fail window, if open.
	pub seconds_until_retry: Option<u64>,
}

struct BreakerInner {
	state: BreakerState,
	failure_count: u32,
	success_count: u32,
	last_failure_at: Option<Instant>,
	next_attempt_at: Option<Instant>,
}

pub struct CircuitBreaker {
	name: String,
	config: BreakerConfig,
	inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
	pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
		Self {
			name: name.into(),
			config,
			inner: Mutex::new(BreakerInner {
				state: BreakerState::Closed,
				failure_count: 0,
				success_count: 0,
				last_failure_at: None,
				next_attempt_at: None,
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Gate a call attempt. An open breaker whose timeout has elapsed admits
	/// the call and moves to half-open; otherwise it fast-fails.
	pub fn check(&self) -> Result<(), RelayError> {
		let mut inner = self.lock();
		match inner.state {
			BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
			BreakerState::Open => {
				let next_attempt_at =
					inner.next_attempt_at.expect("open breaker always has next_attempt_at");
				if Instant::now() >= next_attempt_at {
					info!("Circuit breaker `{}` moving to half-open", self.name);
					inner.state = BreakerState::HalfOpen;
					inner.success_count = 0;
					Ok(())
				} else {
					Err(RelayError::CircuitOpen(self.name.clone()))
				}
			},
		}
	}

	pub fn record_success(&self) {
		let mut inner = self.lock();
		match inner.state {
			BreakerState::Closed => {
				inner.failure_count = 0;
			},
			BreakerState::HalfOpen => {
				inner.success_count += 1;
				if inner.success_count >= self.config.half_open_successes {
					info!("Circuit breaker `{}` closed after successful probes", self.name);
					inner.state = BreakerState::Closed;
					inner.failure_count = 0;
					inner.success_count = 0;
					inner.next_attempt_at = None;
				}
			},
			// A success can race the open transition; it carries no signal.
			BreakerState::Open => {},
		}
	}

	pub fn record_failure(&self) {
		let mut inner = self.lock();
		inner.last_failure_at = Some(Instant::now());
		match inner.state {
			BreakerState::Closed => {
				inner.failure_count += 1;
				if inner.failure_count >= self.config.failure_threshold {
					warn!(
						"Circuit breaker `{}` opened after {} consecutive failures",
						self.name, inner.failure_count
					);
					inner.state = BreakerState::Open;
					inner.next_attempt_at = Some(Instant::now() + self.config.open_timeout);
				}
			},
			BreakerState::HalfOpen => {
				warn!("Circuit breaker `{}` reopened by a failed probe", self.name);
				inner.state = BreakerState::Open;
				inner.success_count = 0;
				inner.next_attempt_at = Some(Instant::now() + self.config.open_timeout);
			},
			BreakerState::Open => {},
		}
	}

	pub fn state(&self) -> BreakerState {
		self.lock().state
	}

	pub fn snapshot(&self) -> BreakerSnapshot {
		let inner = self.lock();
		BreakerSnapshot {
			name: self.name.clone(),
			state: inner.state,
			failure_count: inner.failure_count,
			success_count: inner.success_count,
			failure_threshold: self.config.failure_threshold,
			open_timeout_secs: self.config.open_timeout.as_secs(),
			seconds_until_retry: inner
				.next_attempt_at
				.filter(|_| inner.state == BreakerState::Open)
				.map(|at| at.saturating_duration_since(Instant::now()).as_secs()),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
		self.inner.lock().expect("circuit breaker lock poisoned")
	}
}

/// One breaker per named dependency, created on first use.
pub struct BreakerRegistry {
	breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
	overrides: HashMap<String, BreakerConfig>,
	default_config: BreakerConfig,
}

impl BreakerRegistry {
	pub fn new(default_config: BreakerConfig) -> Self {
		// The relay operation is the critical path: its breaker tolerates
		// more failures and re-probes sooner.
		let overrides = HashMap::from_iter([(
			RELAY_BREAKER_NAME.to_string(),
			BreakerConfig {
				failure_threshold: RELAY_BREAKER_FAILURE_THRESHOLD,
				open_timeout: RELAY_BREAKER_OPEN_TIMEOUT,
				..default_config
			},
		)]);
		Self { breakers: Mutex::new(HashMap::new()), overrides, default_config }
	}

	pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
		self.overrides.insert(name.into(), config);
		self
	}

	pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
		let mut breakers = self.breakers.lock().expect("breaker registry lock poisoned");
		breakers
			.entry(name.to_string())
			.or_insert_with(|| {
				let config = self.overrides.get(name).copied().unwrap_or(self.default_config);
				Arc::new(CircuitBreaker::new(name, config))
			})
			.clone()
	}

	pub fn snapshots(&self) -> HashMap<String, BreakerSnapshot> {
		self.breakers
			.lock()
			.expect("breaker registry lock poisoned")
			.iter()
			.map(|(name, breaker)| (name.clone(), breaker.snapshot()))
			.collect()
	}
}

impl Default for BreakerRegistry {
	fn default() -> Self {
		Self::new(BreakerConfig::default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn quick_config() -> BreakerConfig {
		BreakerConfig {
			failure_threshold: 3,
			open_timeout: Duration::from_millis(50),
			half_open_successes: 3,
		}
	}

	#[test]
	fn opens_at_threshold_and_fast_fails() {
		let breaker = CircuitBreaker::new("test", quick_config());
		for _ in 0..2 {
			breaker.record_failure();
			assert_eq!(breaker.state(), BreakerState::Closed);
		}
		breaker.record_failure();
		assert_eq!(breaker.state(), BreakerState::Open);

		assert_eq!(breaker.check(), Err(RelayError::CircuitOpen("test".to_string())));
	}

	#[test]
	fn success_resets_the_closed_failure_count() {
		let breaker = CircuitBreaker::new("test", quick_config());
		breaker.record_failure();
		breaker.record_failure();
		breaker.record_success();
		breaker.record_failure();
		breaker.record_failure();
		assert_eq!(breaker.state(), BreakerState::Closed);
	}

	#[test]
	fn elapsed_open_timeout_admits_a_probe() {
		let breaker = CircuitBreaker::new("test", quick_config());
		for _ in 0..3 {
			breaker.record_failure();
		}
		assert!(breaker.check().is_err());

		std::thread::sleep(Duration::from_millis(60));
		assert_eq!(breaker.check(), Ok(()));
		assert_eq!(breaker.state(), BreakerState::HalfOpen);
	}

	#[test]
	fn three_probe_successes_close_the_breaker() {
		let breaker = CircuitBreaker::new("test", quick_config());
		for _ in 0..3 {
			breaker.record_failure();
		}
		std::thread::sleep(Duration::from_millis(60));
		breaker.check().unwrap();

		breaker.record_success();
		breaker.record_success();
		assert_eq!(breaker.state(), BreakerState::HalfOpen);
		breaker.record_success();
		assert_eq!(breaker.state(), BreakerState::Closed);
	}

	#[test]
	fn probe_failure_reopens() {
		let breaker = CircuitBreaker::new("test", quick_config());
		for _ in 0..3 {
			breaker.record_failure();
		}
		std::thread::sleep(Duration::from_millis(60));
		breaker.check().unwrap();
		breaker.record_success();

		breaker.record_failure();
		assert_eq!(breaker.state(), BreakerState::Open);
		assert!(breaker.check().is_err());
	}

	#[test]
	fn registry_reuses_instances_and_applies_relay_override() {
		let registry = BreakerRegistry::default();
		let a = registry.get_or_create("adapter-ethereum");
		let b = registry.get_or_create("adapter-ethereum");
		assert!(Arc::ptr_eq(&a, &b));

		let relay = registry.get_or_create(RELAY_BREAKER_NAME);
		// The relay breaker tolerates 20 failures before opening.
		for _ in 0..19 {
			relay.record_failure();
		}
		assert_eq!(relay.state(), BreakerState::Closed);
		relay.record_failure();
		assert_eq!(relay.state(), BreakerState::Open);
		assert_eq!(relay.snapshot().open_timeout_secs, 10);
	}
}
