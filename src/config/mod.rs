//! Configuration management for the client and the reference service.
//!
//! Both configuration structures load from layered sources with priority:
//! 1. Default values (hardcoded)
//! 2. Optional TOML file
//! 3. Environment variables (highest priority)
//!
//! Environment variables use the `DCOORD` prefix for the client and `DCOORD_SERVER` for the
//! service, with `__` separating nested keys (`DCOORD_RETRY__MAX_RETRIES=3`). The client
//! endpoint list is comma separated (`DCOORD_ENDPOINTS=10.0.0.1:2181,10.0.0.2:2181`).

mod client;
mod retry;
mod server;
pub use client::*;
pub use retry::*;
pub use server::*;


//---
use config::Config;
use config::Environment;
use config::File;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::ENV_PREFIX;
use crate::Result;

impl ClientConfig {
    /// Load client configuration from defaults, an optional file and `DCOORD_*` variables
    ///
    /// The merged result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config: Self = load_layered(path, ENV_PREFIX, Some("endpoints"))?;
        config.validate()?;
        Ok(config)
    }
}

impl ServerSettings {
    /// Load service settings from defaults, an optional file and `DCOORD_SERVER_*` variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let settings: Self = load_layered(path, &format!("{ENV_PREFIX}_SERVER"), None)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn load_layered<T>(
    path: Option<&str>,
    env_prefix: &str,
    list_key: Option<&str>,
) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    // 1. Defaults
    let mut builder = Config::builder().add_source(Config::try_from(&T::default())?);

    // 2. Config file
    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path).required(true));
    }

    // 3. Environment variables (highest priority)
    let mut env = Environment::with_prefix(env_prefix)
        .prefix_separator("_")
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true);
    if let Some(key) = list_key {
        env = env.list_separator(",").with_list_parse_key(key);
    }
    builder = builder.add_source(env);

    Ok(builder.build()?.try_deserialize()?)
}
