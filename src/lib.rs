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

pub mod breaker;
pub mod chains;
pub mod constants;
pub mod errors;
pub mod event;
pub mod health;
pub mod logging;
pub mod observer;
pub mod pipeline;
pub mod primitives;
pub mod queue;
pub mod recovery;
pub mod replay;
pub mod retry;
pub mod settings;
pub mod transfer;
pub mod utils;
