//! Configuration used within Foreman.
//!
//! A few notes on the structure of this crate.
//!
//! * Configuration objects are typically considered immutable and are only
//!   able to be constructed programmatically through the use of one of the
//!   builders (each configuration object should have an associated builder)
//!   or by deserialization.
//! * A loaded configuration object may not be valid; use the
//!   [`validate()`](Config::validate) method before handing it to a process.

use anyhow::Result;
use bon::Builder;
use figment::Figment;
use figment::providers::Format;
use figment::providers::Toml;
use serde::Deserialize;
use serde::Serialize;

pub mod agent;
pub mod master;

/// The file name (sans the extension) used when looking for configuration
/// files for Foreman.
pub const FILE_NAME: &str = "foreman.toml";

/// The environment variable that enables developer mode.
///
/// When set to `true`, the master seeds developer data at startup.
pub const DEV_MODE_VAR: &str = "DEV_MODE";

/// A global configuration object for Foreman.
///
/// When loading, the default sources that are automatically included are:
///
/// * `<CONFIG DIR>/foreman/foreman.toml`.
/// * `<CWD>/foreman.toml`.
/// * If the environment variable is present, the file pointed to by
///   `FOREMAN_CONFIG`.
#[derive(Builder, Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
#[builder(builder_type = Builder)]
pub struct Config {
    /// Configuration for the master process.
    #[serde(default)]
    #[builder(default)]
    master: master::Config,

    /// Configuration for the agent process.
    #[serde(default)]
    #[builder(default)]
    agent: agent::Config,
}

impl Config {
    /// Validates the configuration object.
    pub fn validate(&self) -> Result<()> {
        self.master.validate()?;
        self.agent.validate()
    }

    /// Gets the master configuration.
    pub fn master(&self) -> &master::Config {
        &self.master
    }

    /// Gets the agent configuration.
    pub fn agent(&self) -> &agent::Config {
        &self.agent
    }

    /// Returns whether developer mode is enabled in the environment.
    pub fn dev_mode() -> bool {
        std::env::var(DEV_MODE_VAR)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Gets a figment with the default sources preloaded.
    pub fn default_sources() -> Figment {
        let mut figment = Figment::new();

        if let Some(config_home) = dirs::config_dir() {
            figment = figment.admerge(Toml::file(config_home.join("foreman").join(FILE_NAME)));
        }

        if let Ok(mut path) = std::env::current_dir() {
            path.push(FILE_NAME);
            figment = figment.admerge(Toml::file(path));
        }

        if let Ok(config_file) = std::env::var("FOREMAN_CONFIG") {
            figment = figment.admerge(Toml::file(config_file));
        }

        figment
    }

    /// Loads a [`Config`] from the default set of sources.
    pub fn load() -> figment::Result<Self> {
        Self::default_sources().extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        config.validate().expect("default config should be valid");

        assert_eq!(config.master().listen().port(), 50051);
        assert_eq!(config.master().namespace(), "default");
        assert_eq!(config.agent().reconnect_wait().as_secs(), 5);
    }

    #[test]
    fn config_loads_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                FILE_NAME,
                r#"
                    [master]
                    listen = "127.0.0.1:6000"
                    namespace = "ci"

                    [agent]
                    id = "builder-7"
                    master-address = "http://master.internal:6000"
                "#,
            )?;

            let config: Config = Figment::new().admerge(Toml::file(FILE_NAME)).extract()?;
            config.validate().expect("config should be valid");

            assert_eq!(config.master().listen().port(), 6000);
            assert_eq!(config.master().namespace(), "ci");
            assert_eq!(config.agent().id(), "builder-7");
            assert_eq!(
                config.agent().master_address().as_str(),
                "http://master.internal:6000/"
            );

            Ok(())
        });
    }
}
