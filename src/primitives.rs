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

//! Chain tags and fixed-point amounts shared across the pipeline.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The chains this bridge knows how to observe and submit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignChain {
	Ethereum,
	Solana,
	BlackHole,
}

/// Byte length of the chain tag used to prefix persistent keys.
pub const CHAIN_TAG_SIZE: usize = 4;

impl ForeignChain {
	pub const ALL: [ForeignChain; 3] =
		[ForeignChain::Ethereum, ForeignChain::Solana, ForeignChain::BlackHole];

	pub fn as_str(&self) -> &'static str {
		match self {
			ForeignChain::Ethereum => "ethereum",
			ForeignChain::Solana => "solana",
			ForeignChain::BlackHole => "blackhole",
		}
	}

	/// Fixed-size tag prefixed onto persistent index keys.
	pub fn tag_bytes(&self) -> [u8; CHAIN_TAG_SIZE] {
		match self {
			ForeignChain::Ethereum => *b"eth_",
			ForeignChain::Solana => *b"sol_",
			ForeignChain::BlackHole => *b"bhx_",
		}
	}

	pub fn from_tag_bytes(tag: &[u8]) -> Option<Self> {
		ForeignChain::ALL.into_iter().find(|chain| chain.tag_bytes() == tag)
	}
}

impl fmt::Display for ForeignChain {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ForeignChain {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"ethereum" | "eth" => Ok(ForeignChain::Ethereum),
			"solana" | "sol" => Ok(ForeignChain::Solana),
			"blackhole" | "bhx" => Ok(ForeignChain::BlackHole),
			other => Err(format!("unknown chain `{other}`")),
		}
	}
}

/// Token amounts in base units at a fixed 18 decimal places.
pub type AssetAmount = u128;

/// Fractional digits carried by every [AssetAmount].
pub const AMOUNT_DECIMALS: u32 = 18;

const AMOUNT_SCALE: u128 = 10u128.pow(AMOUNT_DECIMALS);

/// Parses a decimal string (e.g. `"1.5"`) into base units. Rejects negative
/// values, more than 18 fractional digits, and integer parts that would
/// overflow.
pub fn parse_amount(s: &str) -> Option<AssetAmount> {
	let s = s.trim();
	if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
		return None
	}

	let (int_part, frac_part) = match s.split_once('.') {
		Some((i, f)) => (i, f),
		None => (s, ""),
	};
	if int_part.is_empty() && frac_part.is_empty() {
		return None
	}
	if frac_part.len() > AMOUNT_DECIMALS as usize {
		return None
	}

	let int_units: u128 = if int_part.is_empty() {
		0
	} else {
		int_part.parse::<u128>().ok()?.checked_mul(AMOUNT_SCALE)?
	};

	let frac_units: u128 = if frac_part.is_empty() {
		0
	} else {
		frac_part.parse::<u128>().ok()? *
			10u128.pow(AMOUNT_DECIMALS - frac_part.len() as u32)
	};

	int_units.checked_add(frac_units)
}

/// Renders base units with all 18 fractional places, e.g.
/// `1.500000000000000000`. Always printing the full precision keeps the
/// encoding injective, which the event fingerprint relies on.
pub fn format_amount(amount: AssetAmount) -> String {
	format!("{}.{:018}", amount / AMOUNT_SCALE, amount % AMOUNT_SCALE)
}
