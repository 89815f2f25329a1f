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

//! The neutral event shape adapters translate chain activity into, plus the
//! single integrity-validation point every event passes through — whether it
//! was witnessed by an adapter or submitted manually.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
	constants::{EVENT_MAX_AGE, EVENT_MAX_FUTURE_SKEW},
	errors::RelayError,
	primitives::{AssetAmount, ForeignChain},
};

/// Separator used when concatenating normalized fields for fingerprinting.
/// Validation rejects any field containing it, so the concatenation is
/// unambiguous.
pub const FIELD_SEPARATOR: char = '\x1f';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	/// Witnessed on a source chain by an adapter subscription.
	Transfer,
	/// Injected by an operator through `submit_transfer`.
	Manual,
}

/// A transfer observed on a source chain, before dedup.
///
/// Ephemeral: once the fingerprint is recorded the durable trace lives in
/// the replay store as an `EventRecord`, and the work item becomes a
/// `Transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
	pub source_chain: ForeignChain,
	/// Chain-opaque transaction reference, normalized to lowercase.
	pub tx_hash: String,
	pub from_address: String,
	pub to_address: String,
	/// Normalized to uppercase.
	pub token_symbol: String,
	pub amount: AssetAmount,
	/// Seconds since epoch, as reported by the source chain.
	pub source_timestamp: i64,
	pub kind: EventKind,
}

impl InboundEvent {
	/// Builds an event with field normalization applied: `tx_hash`
	/// lowercased, `token_symbol` uppercased, all fields trimmed.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		source_chain: ForeignChain,
		tx_hash: &str,
		from_address: &str,
		to_address: &str,
		token_symbol: &str,
		amount: AssetAmount,
		source_timestamp: i64,
		kind: EventKind,
	) -> Self {
		Self {
			source_chain,
			tx_hash: tx_hash.trim().to_lowercase(),
			from_address: from_address.trim().to_string(),
			to_address: to_address.trim().to_string(),
			token_symbol: token_symbol.trim().to_uppercase(),
			amount,
			source_timestamp,
			kind,
		}
	}

	/// Integrity check per the pipeline contract. This is the only
	/// enforcement point for the timestamp skew window; adapters do not get
	/// to opt out.
	pub fn validate(&self) -> Result<(), RelayError> {
		self.validate_at(Utc::now().timestamp())
	}

	pub(crate) fn validate_at(&self, now: i64) -> Result<(), RelayError> {
		if self.tx_hash.is_empty() {
			return Err(RelayError::Validation("empty tx_hash".to_string()))
		}
		if self.from_address.is_empty() || self.to_address.is_empty() {
			return Err(RelayError::Validation(format!(
				"missing address on event from tx {}",
				self.tx_hash
			)))
		}
		if self.token_symbol.is_empty() {
			return Err(RelayError::Validation(format!(
				"missing token symbol on event from tx {}",
				self.tx_hash
			)))
		}

		for field in
			[&self.tx_hash, &self.from_address, &self.to_address, &self.token_symbol]
		{
			if field.contains(FIELD_SEPARATOR) {
				return Err(RelayError::Validation(format!(
					"field contains reserved separator byte: {field:?}"
				)))
			}
		}

		let oldest = now - EVENT_MAX_AGE.as_secs() as i64;
		let newest = now + EVENT_MAX_FUTURE_SKEW.as_secs() as i64;
		if self.source_timestamp < oldest {
			return Err(RelayError::Validation(format!(
				"event timestamp {} is older than the {}h replay window",
				self.source_timestamp,
				EVENT_MAX_AGE.as_secs() / 3600,
			)))
		}
		if self.source_timestamp > newest {
			return Err(RelayError::Validation(format!(
				"event timestamp {} is more than {}min in the future",
				self.source_timestamp,
				EVENT_MAX_FUTURE_SKEW.as_secs() / 60,
			)))
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::primitives::parse_amount;

	fn test_event() -> InboundEvent {
		InboundEvent::new(
			ForeignChain::Ethereum,
			"0xAAA111",
			"0x1",
			"bhx1qxyz",
			"usdc",
			parse_amount("1.5").unwrap(),
			Utc::now().timestamp(),
			EventKind::Transfer,
		)
	}

	#[test]
	fn normalizes_case_on_construction() {
		let event = test_event();
		assert_eq!(event.tx_hash, "0xaaa111");
		assert_eq!(event.token_symbol, "USDC");
	}

	#[test]
	fn accepts_valid_event() {
		assert_eq!(test_event().validate(), Ok(()));
	}

	#[test]
	fn rejects_empty_fields() {
		let mut event = test_event();
		event.tx_hash = String::new();
		assert!(matches!(event.validate(), Err(RelayError::Validation(_))));

		let mut event = test_event();
		event.to_address = String::new();
		assert!(matches!(event.validate(), Err(RelayError::Validation(_))));
	}

	#[test]
	fn rejects_timestamps_outside_skew_window() {
		let now = Utc::now().timestamp();

		let mut event = test_event();
		event.source_timestamp = now - (24 * 3600 + 60);
		assert!(matches!(event.validate(), Err(RelayError::Validation(_))));

		let mut event = test_event();
		event.source_timestamp = now + 6 * 60;
		assert!(matches!(event.validate(), Err(RelayError::Validation(_))));

		// Just inside both edges.
		let mut event = test_event();
		event.source_timestamp = now - (24 * 3600 - 60);
		assert_eq!(event.validate(), Ok(()));
		event.source_timestamp = now + 4 * 60;
		assert_eq!(event.validate(), Ok(()));
	}

	#[test]
	fn rejects_separator_in_fields() {
		let mut event = test_event();
		event.from_address = format!("0x1{FIELD_SEPARATOR}0x2");
		assert!(matches!(event.validate(), Err(RelayError::Validation(_))));
	}
}
