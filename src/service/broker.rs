// Copyright 2025 jonefeewang@gmail.com
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

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::signal;
use tracing::{error, info};

use super::{AppResult, BrokerConfig};
use crate::store::MessageStore;

/// Owns the message store for the lifetime of the process.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Broker { config }
    }

    /// Runs the broker on `rt` until ctrl-c.
    pub fn start(&self, rt: &Runtime) -> AppResult<()> {
        rt.block_on(self.run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("get shutdown signal"),
                Err(e) => error!("listen for shutdown signal failed: {}", e),
            }
        }))
        .map(|_| ())
    }

    /// Opens and starts the store, then shuts it down once `shutdown_signal`
    /// completes.
    pub async fn run_until<F>(&self, shutdown_signal: F) -> AppResult<Arc<MessageStore>>
    where
        F: Future<Output = ()>,
    {
        info!("broker {} starting", self.config.general.id);
        let store = Arc::new(
            MessageStore::open(self.config.store.clone(), self.config.delay.clone()).await?,
        );
        let report = store.recovery_report();
        info!(
            "store recovered: {:?}, commit log end {}",
            report.state, report.end_offset
        );
        store.start()?;

        shutdown_signal.await;

        store.shutdown().await?;
        info!("broker shutdown complete");
        Ok(store)
    }
}
