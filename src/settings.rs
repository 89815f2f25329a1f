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

//! Layered configuration: built-in defaults → optional TOML file →
//! environment variables (`__` separator) → command-line options. Every
//! option the pipeline honours is enumerated here; the CLI deliberately only
//! exposes the endpoint-ish knobs, numbers travel through file or
//! environment.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use clap::Parser;
use config::{Config, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;
use url::Url;

use crate::{
	constants::{self, CONFIG_ROOT, DEFAULT_CONFIG_ROOT},
	pipeline::PipelineConfig,
	retry::RetryPolicy,
};

#[derive(Debug, Clone, Deserialize)]
pub struct EthSettings {
	pub ws_endpoint: String,
	pub http_endpoint: String,
	pub private_key_file: PathBuf,
	/// Bridge vault contract, 0x-prefixed.
	pub vault_address: String,
	pub chain_id: u64,
	pub confirmations: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolSettings {
	pub http_endpoint: String,
	/// Base58 bridge program id.
	pub bridge_program: String,
	pub poll_interval_secs: u64,
	pub confirmations: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlackHoleSettings {
	pub block_interval_ms: u64,
	pub confirmations: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaySettings {
	pub db_file: PathBuf,
	pub cache_size: usize,
	pub retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
	pub max_retries: u32,
	pub initial_delay_ms: u64,
	pub multiplier: f64,
	pub max_delay_secs: u64,
	pub max_jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
	pub failure_threshold: u32,
	pub open_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
	pub retry_capacity: usize,
	pub dlq_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySettings {
	pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
	pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckSettings {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub eth: EthSettings,
	pub sol: SolSettings,
	pub blackhole: BlackHoleSettings,
	pub replay: ReplaySettings,
	pub retry: RetrySettings,
	pub breaker: BreakerSettings,
	pub queues: QueueSettings,
	pub recovery: RecoverySettings,
	pub shutdown: ShutdownSettings,
	pub health_check: Option<HealthCheckSettings>,
	/// Allow adapters to emit synthetic traffic when their node is gone.
	pub synthetic_fallback: bool,
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct CommandLineOptions {
	/// Directory holding `config.toml`; also settable via BRIDGE_CONFIG_ROOT.
	#[clap(long = "config-root", env = CONFIG_ROOT)]
	pub config_root: Option<String>,
	#[clap(long = "eth.ws_endpoint")]
	eth_ws_endpoint: Option<String>,
	#[clap(long = "eth.http_endpoint")]
	eth_http_endpoint: Option<String>,
	#[clap(long = "eth.private_key_file")]
	eth_private_key_file: Option<String>,
	#[clap(long = "eth.vault_address")]
	eth_vault_address: Option<String>,
	#[clap(long = "sol.http_endpoint")]
	sol_http_endpoint: Option<String>,
	#[clap(long = "sol.bridge_program")]
	sol_bridge_program: Option<String>,
	#[clap(long = "replay.db_file")]
	replay_db_file: Option<String>,
	#[clap(long = "health_check.hostname")]
	health_check_hostname: Option<String>,
	#[clap(long = "health_check.port")]
	health_check_port: Option<String>,
}

pub fn insert_command_line_option<V: Clone + Into<Value>>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<V>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "eth.ws_endpoint", &self.eth_ws_endpoint);
		insert_command_line_option(&mut map, "eth.http_endpoint", &self.eth_http_endpoint);
		insert_command_line_option(&mut map, "eth.private_key_file", &self.eth_private_key_file);
		insert_command_line_option(&mut map, "eth.vault_address", &self.eth_vault_address);
		insert_command_line_option(&mut map, "sol.http_endpoint", &self.sol_http_endpoint);
		insert_command_line_option(&mut map, "sol.bridge_program", &self.sol_bridge_program);
		insert_command_line_option(&mut map, "replay.db_file", &self.replay_db_file);
		insert_command_line_option(
			&mut map,
			"health_check.hostname",
			&self.health_check_hostname,
		);
		insert_command_line_option(&mut map, "health_check.port", &self.health_check_port);

		Ok(map)
	}
}

impl Settings {
	pub fn load(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let config_root = opts
			.config_root
			.clone()
			.unwrap_or_else(|| DEFAULT_CONFIG_ROOT.to_string());

		let mut settings: Settings = Self::set_defaults(Config::builder())?
			.add_source(
				File::with_name(&format!("{config_root}/config")).required(false),
			)
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	fn set_defaults(
		builder: config::ConfigBuilder<config::builder::DefaultState>,
	) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		// These defaults are for a localnet setup.
		builder
			.set_default("eth.ws_endpoint", "ws://localhost:8546")?
			.set_default("eth.http_endpoint", "http://localhost:8545")?
			.set_default("eth.private_key_file", "/etc/bridge-engine/eth_key")?
			.set_default("eth.vault_address", "0x0000000000000000000000000000000000000bb7")?
			.set_default("eth.chain_id", 1337u64)?
			.set_default("eth.confirmations", constants::ETHEREUM_CONFIRMATION_THRESHOLD as u64)?
			.set_default("sol.http_endpoint", "http://localhost:8899")?
			.set_default("sol.bridge_program", "vines1vzrYbzLMRdu58ou5XTby4qAqVRLmqo36NKPTg")?
			.set_default("sol.poll_interval_secs", 2u64)?
			.set_default("sol.confirmations", constants::SOLANA_CONFIRMATION_THRESHOLD as u64)?
			.set_default("blackhole.block_interval_ms", 1_000u64)?
			.set_default(
				"blackhole.confirmations",
				constants::BLACKHOLE_CONFIRMATION_THRESHOLD as u64,
			)?
			.set_default("replay.db_file", "/var/lib/bridge-engine/replay.db")?
			.set_default("replay.cache_size", constants::REPLAY_CACHE_SIZE as u64)?
			.set_default("replay.retention_hours", (7 * 24) as u64)?
			.set_default("retry.max_retries", constants::RETRY_DEFAULT_MAX_RETRIES as u64)?
			.set_default(
				"retry.initial_delay_ms",
				constants::RETRY_DEFAULT_INITIAL_DELAY.as_millis() as u64,
			)?
			.set_default("retry.multiplier", constants::RETRY_DEFAULT_MULTIPLIER)?
			.set_default("retry.max_delay_secs", constants::RETRY_DEFAULT_MAX_DELAY.as_secs())?
			.set_default(
				"retry.max_jitter_ms",
				constants::RETRY_DEFAULT_MAX_JITTER.as_millis() as u64,
			)?
			.set_default(
				"breaker.failure_threshold",
				constants::BREAKER_DEFAULT_FAILURE_THRESHOLD as u64,
			)?
			.set_default(
				"breaker.open_timeout_secs",
				constants::BREAKER_DEFAULT_OPEN_TIMEOUT.as_secs(),
			)?
			.set_default("queues.retry_capacity", constants::RETRY_QUEUE_CAPACITY as u64)?
			.set_default("queues.dlq_capacity", constants::DEAD_LETTER_QUEUE_CAPACITY as u64)?
			.set_default(
				"recovery.interval_secs",
				constants::RECOVERY_LOOP_INTERVAL.as_secs(),
			)?
			.set_default("shutdown.timeout_secs", constants::SHUTDOWN_TIMEOUT.as_secs())?
			.set_default("synthetic_fallback", false)
	}

	fn validate(&mut self) -> Result<(), ConfigError> {
		validate_endpoint(&self.eth.ws_endpoint, &["ws", "wss"])?;
		validate_endpoint(&self.eth.http_endpoint, &["http", "https"])?;
		validate_endpoint(&self.sol.http_endpoint, &["http", "https"])?;

		let vault = self.eth.vault_address.trim_start_matches("0x");
		if hex::decode(vault).map(|bytes| bytes.len())
			!= Ok(20)
		{
			return Err(ConfigError::Message(format!(
				"eth.vault_address `{}` is not a 20-byte hex address",
				self.eth.vault_address
			)))
		}
		if self.blackhole.block_interval_ms == 0 {
			return Err(ConfigError::Message(
				"blackhole.block_interval_ms must be non-zero".to_string(),
			))
		}
		Ok(())
	}

	pub fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			max_retries: self.retry.max_retries,
			initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
			multiplier: self.retry.multiplier,
			max_delay: Duration::from_secs(self.retry.max_delay_secs),
			max_jitter: Duration::from_millis(self.retry.max_jitter_ms),
		}
	}

	pub fn pipeline_config(&self) -> PipelineConfig {
		PipelineConfig {
			retry_policy: self.retry_policy(),
			breaker_config: crate::breaker::BreakerConfig {
				failure_threshold: self.breaker.failure_threshold,
				open_timeout: Duration::from_secs(self.breaker.open_timeout_secs),
				..Default::default()
			},
			retry_queue_capacity: self.queues.retry_capacity,
			dlq_capacity: self.queues.dlq_capacity,
			recovery_interval: Duration::from_secs(self.recovery.interval_secs),
			replay_retention: Duration::from_secs(self.replay.retention_hours * 3600),
			shutdown_timeout: Duration::from_secs(self.shutdown.timeout_secs),
			..PipelineConfig::default()
		}
	}
}

fn validate_endpoint(endpoint: &str, allowed_schemes: &[&str]) -> Result<(), ConfigError> {
	let url = Url::parse(endpoint)
		.map_err(|e| ConfigError::Message(format!("invalid endpoint `{endpoint}`: {e}")))?;
	if !allowed_schemes.contains(&url.scheme()) {
		return Err(ConfigError::Message(format!(
			"endpoint `{endpoint}` must use one of the schemes {allowed_schemes:?}"
		)))
	}
	Ok(())
}
