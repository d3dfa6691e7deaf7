// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod abi;
pub mod accounts;
pub mod address_journal;
pub mod anchoring;
pub mod bridge_contract;
pub mod bridge_info;
pub mod bridge_manager;
pub mod bridge_pool;
pub mod chain_backend;
pub mod config;
pub mod error;
pub mod journal;
pub mod main_bridge;
pub mod main_bridge_handler;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod recovery;
pub mod revert;
pub mod server;
pub mod sub_bridge;
pub mod sub_bridge_handler;
pub mod transaction;
pub mod types;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod e2e_tests;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // For simplicity we treat every error as transient so we can retry until max_elapsed_time
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
