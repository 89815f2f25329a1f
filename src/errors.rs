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

//! Error taxonomy for the relay pipeline.
//!
//! Every failure that crosses a component boundary is classified into one of
//! these variants. The retry executor and the queues branch on the variant,
//! so the classification *is* the retry policy: `Transient` is retryable,
//! `Permanent` and `Validation` are not, `CircuitOpen` is the caller's cue to
//! go through the retry queue instead of hot-looping.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
	/// The event failed integrity validation. Discarded, counted, never
	/// retried.
	#[error("event failed validation: {0}")]
	Validation(String),

	/// The event's fingerprint is already recorded. Suppressed and counted
	/// as a blocked replay.
	#[error("duplicate event: fingerprint {0} already recorded")]
	DuplicateEvent(String),

	/// Network-ish failure from an adapter: timeouts, rate limits, dropped
	/// connections. Eligible for the retry executor and the retry queue.
	#[error("transient adapter error: {0}")]
	Transient(String),

	/// The destination chain rejected the transfer for good: malformed
	/// transaction, insufficient funds, unsupported token. Terminal.
	#[error("permanent adapter error: {0}")]
	Permanent(String),

	/// The named circuit breaker rejected the call without attempting it.
	#[error("circuit breaker `{0}` is open")]
	CircuitOpen(String),

	/// Shutdown is in progress; the operation aborted cleanly.
	#[error("operation cancelled by shutdown")]
	Cancelled,

	/// The replay store could not persist. The pipeline must not advance the
	/// transfer past `deduped` on this error.
	#[error("replay store persistence failure: {0}")]
	StorePersistence(String),

	/// A broken internal invariant. Never swallowed: the affected worker
	/// terminates and is restarted by its supervisor.
	#[error("internal invariant violation: {0}")]
	InvariantViolation(String),
}

impl RelayError {
	/// Errors worth another attempt, either inline (retry executor) or
	/// deferred (retry queue).
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			RelayError::Transient(_) | RelayError::CircuitOpen(_) | RelayError::StorePersistence(_)
		)
	}

	/// Stable tag used in counters, the error buffer and log fields.
	pub fn kind(&self) -> &'static str {
		match self {
			RelayError::Validation(_) => "validation",
			RelayError::DuplicateEvent(_) => "duplicate_event",
			RelayError::Transient(_) => "transient",
			RelayError::Permanent(_) => "permanent",
			RelayError::CircuitOpen(_) => "circuit_open",
			RelayError::Cancelled => "cancelled",
			RelayError::StorePersistence(_) => "store_persistence",
			RelayError::InvariantViolation(_) => "invariant_violation",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retryability_follows_classification() {
		assert!(RelayError::Transient("timeout".to_string()).is_retryable());
		assert!(RelayError::CircuitOpen("relay".to_string()).is_retryable());
		assert!(RelayError::StorePersistence("disk".to_string()).is_retryable());

		assert!(!RelayError::Validation("bad ts".to_string()).is_retryable());
		assert!(!RelayError::Permanent("unsupported token".to_string()).is_retryable());
		assert!(!RelayError::Cancelled.is_retryable());
	}
}
