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

//! Per-component health reporting, plus the minimal HTTP liveness endpoint
//! external services poll. Returns a HTTP 200 response to any request on
//! {hostname}:{port}/health.

use std::{collections::HashMap, sync::Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
	Healthy,
	Degraded,
	Unhealthy,
	Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
	pub component: String,
	pub state: HealthState,
	pub last_check: DateTime<Utc>,
	pub message: Option<String>,
}

impl HealthStatus {
	pub fn healthy(component: impl Into<String>) -> Self {
		Self {
			component: component.into(),
			state: HealthState::Healthy,
			last_check: Utc::now(),
			message: None,
		}
	}

	pub fn with_state(component: impl Into<String>, state: HealthState, message: &str) -> Self {
		Self {
			component: component.into(),
			state,
			last_check: Utc::now(),
			message: (!message.is_empty()).then(|| message.to_string()),
		}
	}
}

/// Shared registry the workers report into and the snapshot façade reads
/// from.
#[derive(Default)]
pub struct HealthRegistry {
	components: Mutex<HashMap<String, HealthStatus>>,
}

impl HealthRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn report(&self, status: HealthStatus) {
		self.lock().insert(status.component.clone(), status);
	}

	pub fn report_state(&self, component: &str, state: HealthState, message: &str) {
		self.report(HealthStatus::with_state(component, state, message));
	}

	pub fn get(&self, component: &str) -> Option<HealthStatus> {
		self.lock().get(component).cloned()
	}

	pub fn snapshot(&self) -> HashMap<String, HealthStatus> {
		self.lock().clone()
	}

	/// Worst state across all components; what the liveness endpoint keys
	/// off.
	pub fn overall(&self) -> HealthState {
		let components = self.lock();
		let mut overall = HealthState::Healthy;
		for status in components.values() {
			overall = match (overall, status.state) {
				(_, HealthState::Unhealthy) | (HealthState::Unhealthy, _) =>
					HealthState::Unhealthy,
				(_, HealthState::Stopped) | (HealthState::Stopped, _) => HealthState::Stopped,
				(_, HealthState::Degraded) | (HealthState::Degraded, _) => HealthState::Degraded,
				_ => HealthState::Healthy,
			};
		}
		overall
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HealthStatus>> {
		self.components.lock().expect("health registry lock poisoned")
	}
}

/// Minimal HTTP liveness endpoint.
pub struct HealthChecker {
	listener: TcpListener,
}

// Split running of the health checker into new and run so the listener is
// known to be active before proceeding in tests.
impl HealthChecker {
	pub async fn new(hostname: &str, port: u16) -> anyhow::Result<Self> {
		let bind_address = format!("{hostname}:{port}");
		info!("Starting health check server on {bind_address}");
		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
		self.listener.local_addr().context("Could not read health listener address")
	}

	pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
		loop {
			let accepted = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				accepted = self.listener.accept() => accepted,
			};
			match accepted {
				Ok((mut stream, _address)) => {
					let mut buffer = [0; 1024];
					stream
						.read(&mut buffer)
						.await
						.context("Couldn't read stream into buffer")?;

					let mut headers = [httparse::EMPTY_HEADER; 16];
					let mut request = httparse::Request::new(&mut headers);
					match request.parse(&buffer) {
						Ok(_) =>
							if request.path == Some("/health") {
								stream
									.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
									.await
									.context("Could not write to health check stream")?;
								stream
									.flush()
									.await
									.context("Could not flush health check TCP stream")?;
							} else {
								warn!("Requested health at invalid path: {:?}", request.path);
								stream
									.write_all(
										b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n",
									)
									.await
									.context("Could not write to health check stream")?;
							},
						Err(error) => {
							warn!("Invalid health check request, could not parse: {error}");
						},
					}
				},
				Err(error) => {
					warn!("Could not open health check TCP stream: {error}");
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn overall_is_the_worst_component_state() {
		let registry = HealthRegistry::new();
		assert_eq!(registry.overall(), HealthState::Healthy);

		registry.report(HealthStatus::healthy("adapter-ethereum"));
		assert_eq!(registry.overall(), HealthState::Healthy);

		registry.report_state("adapter-solana", HealthState::Degraded, "reconnecting");
		assert_eq!(registry.overall(), HealthState::Degraded);

		registry.report_state("retry-worker", HealthState::Unhealthy, "panicked");
		assert_eq!(registry.overall(), HealthState::Unhealthy);

		// Recovery is reflected.
		registry.report(HealthStatus::healthy("retry-worker"));
		assert_eq!(registry.overall(), HealthState::Degraded);
	}

	#[tokio::test]
	async fn health_endpoint_responds_200_on_health_path() {
		let checker = HealthChecker::new("127.0.0.1", 0).await.unwrap();
		let address = checker.local_addr().unwrap();
		let cancel = CancellationToken::new();
		tokio::spawn(checker.run(cancel.clone()));

		let ok = reqwest::get(format!("http://{address}/health")).await.unwrap();
		assert_eq!(ok.status(), reqwest::StatusCode::OK);

		let missing = reqwest::get(format!("http://{address}/other")).await.unwrap();
		assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

		cancel.cancel();
	}
}
