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

//! Deterministic content addressing for inbound events.
//!
//! The fingerprint is the replay-protection primary key: two events hash to
//! the same fingerprint iff they are field-equal after normalization. Fields
//! are joined with the reserved `\x1f` separator (validation guarantees no
//! field contains it) and the amount is rendered at full 18-decimal
//! precision so textually-different spellings of the same value cannot
//! produce distinct hashes.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{
	event::{InboundEvent, FIELD_SEPARATOR},
	primitives::format_amount,
};

/// A 256-bit content hash of a normalized [InboundEvent].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
		Ok(Self(bytes.try_into().map_err(|_| {
			anyhow::anyhow!("fingerprint must be 32 bytes, got {}", bytes.len())
		})?))
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl FromStr for Fingerprint {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::from_bytes(&hex::decode(s)?)
	}
}

impl Serialize for Fingerprint {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Fingerprint {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(de::Error::custom)
	}
}

/// Hashes the seven semantic fields of an event in fixed order. Case in
/// free-form fields is folded so byte-wise case differences cannot defeat
/// dedup.
pub fn fingerprint_event(event: &InboundEvent) -> Fingerprint {
	let mut hasher = Sha256::new();
	let preimage = [
		event.source_chain.as_str().to_string(),
		event.tx_hash.to_lowercase(),
		event.from_address.to_lowercase(),
		event.to_address.to_lowercase(),
		event.token_symbol.to_uppercase(),
		format_amount(event.amount),
		event.source_timestamp.to_string(),
	]
	.join(&FIELD_SEPARATOR.to_string());
	hasher.update(preimage.as_bytes());
	Fingerprint(hasher.finalize().into())
}
