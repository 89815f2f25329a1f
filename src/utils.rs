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

use std::{path::Path, time::Duration};

use anyhow::Context;

/// Creates an interval that ticks every `period` without trying to catch up
/// on missed ticks. If `yield_immediately` is false the first tick completes
/// one `period` from now.
pub fn make_periodic_tick(period: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() +
			if yield_immediately { Duration::ZERO } else { period },
		period,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

/// Reads a hex-encoded secret from a file, tolerating surrounding whitespace
/// and an optional `0x` prefix, and hands the cleaned string to `decode`.
pub fn read_clean_and_decode_hex_str_file<T>(
	file: &Path,
	context: &str,
	decode: impl FnOnce(&str) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
	let contents = std::fs::read_to_string(file)
		.with_context(|| format!("Failed to read {context} file at {}", file.display()))?;
	let cleaned = contents.trim().trim_start_matches("0x");
	decode(cleaned).with_context(|| format!("Failed to decode {context} from {}", file.display()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn periodic_tick_first_tick_timing() {
		let mut immediate = make_periodic_tick(Duration::from_secs(60), true);
		tokio::time::timeout(Duration::from_millis(50), immediate.tick())
			.await
			.expect("immediate tick should resolve right away");

		let mut delayed = make_periodic_tick(Duration::from_secs(60), false);
		tokio::time::timeout(Duration::from_millis(50), delayed.tick())
			.await
			.expect_err("delayed tick should wait a full period");
	}

	#[test]
	fn reads_and_cleans_hex_file() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("key");
		std::fs::write(&file, " 0xdeadbeef\n").unwrap();

		let bytes = read_clean_and_decode_hex_str_file(&file, "test key", |s| {
			hex::decode(s).map_err(anyhow::Error::new)
		})
		.unwrap();
		assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
	}
}
