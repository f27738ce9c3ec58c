//! Configuration related to the agent process.

use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use bon::Builder;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

/// The default master address an agent dials.
pub const DEFAULT_MASTER_ADDRESS: &str = "http://localhost:50051";

/// The default wait between reconnection attempts, in seconds.
pub const DEFAULT_RECONNECT_WAIT_SECS: u64 = 5;

/// The default interval between metrics reports, in seconds.
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 30;

/// A utility function used to set the default agent id via serde.
fn default_id() -> String {
    String::from("agent-1")
}

/// A utility function used to set the default master address via serde.
fn default_master_address() -> Url {
    DEFAULT_MASTER_ADDRESS
        .parse()
        .expect("default master address should parse")
}

/// A utility function used to set the default reconnect wait via serde.
fn default_reconnect_wait_secs() -> u64 {
    DEFAULT_RECONNECT_WAIT_SECS
}

/// A utility function used to set the default metrics interval via serde.
fn default_metrics_interval_secs() -> u64 {
    DEFAULT_METRICS_INTERVAL_SECS
}

/// A configuration object for the agent process.
#[derive(Builder, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
#[builder(builder_type = Builder)]
pub struct Config {
    /// The id the agent registers under.
    #[serde(default = "default_id")]
    #[builder(into, default = default_id())]
    id: String,

    /// The address of the master's gRPC listener.
    #[serde(default = "default_master_address")]
    #[builder(into, default = default_master_address())]
    master_address: Url,

    /// The wait between reconnection attempts, in seconds.
    #[serde(default = "default_reconnect_wait_secs")]
    #[builder(default = DEFAULT_RECONNECT_WAIT_SECS)]
    reconnect_wait_secs: u64,

    /// The interval between metrics reports, in seconds.
    #[serde(default = "default_metrics_interval_secs")]
    #[builder(default = DEFAULT_METRICS_INTERVAL_SECS)]
    metrics_interval_secs: u64,
}

impl Config {
    /// Validates the agent configuration object.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("the agent's `id` must be non-empty");
        }

        match self.master_address.scheme() {
            "http" | "https" => {}
            other => bail!("unsupported master address scheme `{other}`"),
        }

        if self.reconnect_wait_secs == 0 {
            bail!("the agent's `reconnect-wait-secs` must be greater than 0");
        }

        Ok(())
    }

    /// Gets the agent id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the master address.
    pub fn master_address(&self) -> &Url {
        &self.master_address
    }

    /// Gets the wait between reconnection attempts.
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    /// Gets the interval between metrics reports.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}
