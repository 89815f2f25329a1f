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

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use ethers::types::H160;
use tracing::info;

use bridge_engine::{
	chains::{
		blackhole::{BlackHoleAdapter, BlackHoleLedger},
		evm::EvmAdapter,
		sol::SolAdapter,
		ChainAdapter,
	},
	health::HealthChecker,
	logging,
	pipeline::BridgePipeline,
	replay::ReplayStore,
	settings::{CommandLineOptions, Settings},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let settings = Settings::load(CommandLineOptions::parse())
		.map_err(|error| anyhow::anyhow!("Error reading settings: {error}"))?;

	logging::init_tracing();
	info!("Starting the bridge engine");

	let replay = ReplayStore::open(&settings.replay.db_file, settings.replay.cache_size)
		.context("Failed to open replay store")?;

	let vault_address: H160 = settings
		.eth
		.vault_address
		.trim_start_matches("0x")
		.parse()
		.context("Invalid eth.vault_address")?;

	let ledger = BlackHoleLedger::new(Duration::from_millis(settings.blackhole.block_interval_ms));
	let adapters: Vec<Arc<dyn ChainAdapter>> = vec![
		Arc::new(EvmAdapter::new(
			&settings.eth.ws_endpoint,
			&settings.eth.http_endpoint,
			settings.eth.private_key_file.clone(),
			vault_address,
			settings.eth.chain_id,
			settings.eth.confirmations,
			settings.synthetic_fallback,
		)?),
		Arc::new(SolAdapter::new(
			&settings.sol.http_endpoint,
			&settings.sol.bridge_program,
			Duration::from_secs(settings.sol.poll_interval_secs),
			settings.sol.confirmations,
			settings.synthetic_fallback,
		)?),
		Arc::new(BlackHoleAdapter::new(ledger, settings.blackhole.confirmations)),
	];

	let pipeline = BridgePipeline::new(settings.pipeline_config(), replay, adapters);
	pipeline.start().await?;

	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(&health_check.hostname, health_check.port).await?;
		tokio::spawn(checker.run(pipeline.cancellation_token()));
	}

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
	info!("Shutdown signal received");

	pipeline.shutdown(Duration::from_secs(settings.shutdown.timeout_secs)).await
}
