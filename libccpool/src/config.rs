// Copyright 2024 Google LLC
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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

/// Read the config, either from an explicitly given file or from the
/// default location (`~/.config/ccpool/config.toml`). Environment
/// variables override individual settings on top.
#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
        config.source_file = Some(config_path.clone());
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("ccpool");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

/// How much of the cloud cache to use.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CloudMode {
    /// No networking at all.
    Offline,
    /// Race the cloud cache against a local compile.
    #[default]
    Race,
    /// Always wait for the cloud cache before compiling.
    Remote,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The directory holding the local compilation cache and the
    /// daemon's socket. Defaults to ~/.cache/ccpool.
    pub cache_dir: Option<String>,

    /// Host name of the cloud cache server.
    pub cloud_server: Option<String>,

    /// offline disables all networking; race (the default) races the
    /// cloud cache against a local compile.
    pub cloud_mode: Option<CloudMode>,

    /// The user key sent with every request. Without one the client
    /// drops to offline mode.
    pub cloud_key: Option<String>,

    /// Size of the daemon's upstream connection pool.
    pub connections: Option<u32>,

    /// Where downloaded attachments are staged. Defaults to the
    /// system temp directory.
    pub temp_dir: Option<String>,

    /// The file this config was read from, if it was named
    /// explicitly. A launched daemon gets pointed at the same file.
    #[serde(skip)]
    pub source_file: Option<String>,
}

impl Config {
    pub fn cache_dir(&self) -> PathBuf {
        if let Ok(dir) = env::var("CCPOOL_CACHE_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.cache_dir {
            return PathBuf::from(dir);
        }
        match env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".cache").join("ccpool"),
            Err(_) => PathBuf::from(".ccpool"),
        }
    }

    pub fn cloud_server(&self) -> Option<String> {
        env::var("CCPOOL_SERVER").ok().or_else(|| self.cloud_server.clone())
    }

    pub fn cloud_key(&self) -> Option<String> {
        env::var("CCPOOL_KEY").ok().or_else(|| self.cloud_key.clone())
    }

    /// The effective mode: whatever was asked for, degraded to
    /// offline when no server or key is configured.
    pub fn cloud_mode(&self) -> CloudMode {
        let mode = match env::var("CCPOOL_MODE").as_deref() {
            Ok("offline") => CloudMode::Offline,
            Ok("race") => CloudMode::Race,
            Ok("remote") => CloudMode::Remote,
            _ => self.cloud_mode.unwrap_or_default(),
        };
        if mode != CloudMode::Offline
            && (self.cloud_server().is_none() || self.cloud_key().is_none())
        {
            return CloudMode::Offline;
        }
        mode
    }

    pub fn connections(&self) -> u32 {
        if let Ok(count) = env::var("CCPOOL_DAEMON_CONNECTIONS") {
            if let Ok(count) = count.parse::<u32>() {
                if count > 0 {
                    return count;
                }
            }
        }
        match self.connections {
            Some(count) if count > 0 => count,
            _ => consts::DEFAULT_POOL_SIZE,
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => PathBuf::from(dir),
            None => env::temp_dir(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            cache_dir = "/var/cache/ccpool"
            cloud_server = "cache.example.com"
            cloud_mode = "race"
            cloud_key = "sekrit"
            connections = 4
            temp_dir = "/tmp/ccpool"
            "#,
        )
        .expect("config to parse");

        assert_eq!(config.cloud_server.as_deref(), Some("cache.example.com"));
        assert_eq!(config.cloud_mode, Some(CloudMode::Race));
        assert_eq!(config.connections(), 4);
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.connections(), consts::DEFAULT_POOL_SIZE);
        // no key, no server: networking is off
        assert_eq!(config.cloud_mode(), CloudMode::Offline);
    }

    #[test]
    fn missing_key_forces_offline() {
        let config = Config {
            cloud_server: Some(String::from("cache.example.com")),
            cloud_mode: Some(CloudMode::Remote),
            ..Default::default()
        };
        assert_eq!(config.cloud_mode(), CloudMode::Offline);
    }
}
