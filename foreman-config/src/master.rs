//! Configuration related to the master process.

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use anyhow::bail;
use bon::Builder;
use serde::Deserialize;
use serde::Serialize;

/// The default address the master's gRPC listener binds to.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:50051";

/// The default Kubernetes namespace jobs are created in.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A utility function used to set the default listen address via serde.
fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN.parse().expect("default listen address should parse")
}

/// A utility function used to set the default namespace via serde.
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

/// A configuration object for the master process.
#[derive(Builder, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
#[builder(builder_type = Builder)]
pub struct Config {
    /// The address the gRPC listener binds to.
    #[serde(default = "default_listen")]
    #[builder(default = default_listen())]
    listen: SocketAddr,

    /// The Kubernetes namespace jobs are created in.
    #[serde(default = "default_namespace")]
    #[builder(into, default = default_namespace())]
    namespace: String,

    /// The path of the JSON task file, if file-backed task storage is
    /// desired. When unset, tasks are held in memory only.
    #[serde(default)]
    #[builder(into)]
    data_file: Option<PathBuf>,
}

impl Config {
    /// Validates the master configuration object.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            bail!("the master's `namespace` must be non-empty");
        }

        Ok(())
    }

    /// Gets the listen address.
    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    /// Gets the Kubernetes namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Gets the path of the JSON task file, if one is configured.
    pub fn data_file(&self) -> Option<&Path> {
        self.data_file.as_deref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}
