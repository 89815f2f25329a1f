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

use std::time::Duration;

// ======= Chain adapters =======

/// Duration between reconnect attempts when an adapter's node connection is
/// down (before exponential backoff kicks in).
pub const RPC_RETRY_CONNECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Cap applied to the adapter reconnect backoff.
pub const RPC_RETRY_CONNECTION_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Failed connects before an adapter may fall back to synthetic traffic and
/// report itself degraded.
pub const ADAPTER_SYNTHETIC_FALLBACK_AFTER: u32 = 5;

/// Capacity of the per-adapter event channel into the pipeline.
pub const ADAPTER_CHANNEL_CAPACITY: usize = 100;

/// Per-call budget for a destination submit.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Total budget for polling a submitted transfer to its confirmation
/// threshold.
pub const CONFIRMATION_POLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Interval between confirmation polls.
pub const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ======= Replay protection =======

/// Bound on the in-memory fingerprint cache.
pub const REPLAY_CACHE_SIZE: usize = 10_000;

/// Share of the cache dropped (oldest first by `processed_at`) when full.
pub const REPLAY_CACHE_EVICTION_FRACTION: usize = 4;

/// Window of history preloaded into the cache on startup.
pub const REPLAY_CACHE_PRELOAD_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Events older than now minus this window fail validation.
pub const EVENT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Events further in the future than this skew fail validation.
pub const EVENT_MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);

// ======= Circuit breakers =======

pub const BREAKER_DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
/// Consecutive successes required in half-open before closing.
pub const BREAKER_HALF_OPEN_SUCCESSES: u32 = 3;

/// The relay operation sits on the critical path, so its breaker tolerates
/// more failures and re-probes sooner.
pub const RELAY_BREAKER_NAME: &str = "bridge-relay-operation";
pub const RELAY_BREAKER_FAILURE_THRESHOLD: u32 = 20;
pub const RELAY_BREAKER_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

// ======= Retry executor =======

pub const RETRY_DEFAULT_MAX_RETRIES: u32 = 3;
pub const RETRY_DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const RETRY_DEFAULT_MULTIPLIER: f64 = 2.0;
pub const RETRY_DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const RETRY_DEFAULT_MAX_JITTER: Duration = Duration::from_millis(250);

// ======= Queues =======

pub const RETRY_QUEUE_CAPACITY: usize = 10_000;
pub const RETRY_QUEUE_MAX_ATTEMPTS: u32 = 10;
pub const DEAD_LETTER_QUEUE_CAPACITY: usize = 1_000;

// ======= Workers =======

pub const RECOVERY_LOOP_INTERVAL: Duration = Duration::from_secs(30);
/// A non-terminal transfer untouched for this long is eligible for recovery.
pub const RECOVERY_STALE_AFTER: Duration = Duration::from_secs(10);

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub const METRICS_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default drain budget for `shutdown`.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cooldown base applied by the supervisor before restarting a worker that
/// exited on an invariant violation.
pub const WORKER_RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Most recent errors retained for the snapshot view.
pub const ERROR_BUFFER_SIZE: usize = 100;

// ======= Confirmation thresholds =======

pub const ETHEREUM_CONFIRMATION_THRESHOLD: u32 = 12;
pub const SOLANA_CONFIRMATION_THRESHOLD: u32 = 32;
pub const BLACKHOLE_CONFIRMATION_THRESHOLD: u32 = 6;

// ======= Settings environment variables =======

/// Base path for all files
pub const CONFIG_ROOT: &str = "BRIDGE_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/bridge-engine";
