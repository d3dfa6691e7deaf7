// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Loading and persisting of the service chain bridge's on-disk configuration.

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// On-disk encoding of a config file, picked by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| anyhow!("malformed yaml config {:?}: {}", path, e))?,
            ConfigFormat::Json => serde_json::from_str(&content)
                .map_err(|e| anyhow!("malformed json config {:?}: {}", path, e))?,
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {:?}", path))?;
        Ok(())
    }
}

pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads a JSON array file such as `main-bridges.json`.
/// A missing file is an empty list, a malformed one is an error.
pub fn load_json_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {:?}", path))?;
    if content.trim().is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_str(&content).map_err(|e| anyhow!("malformed list file {:?}: {}", path, e))
}

pub fn save_json_list<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let content = serde_json::to_string_pretty(items)?;
    std::fs::write(path, content).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

pub mod local_ip_utils {
    use std::net::{IpAddr, SocketAddr, TcpListener};

    // Binds port 0 and lets the OS pick a free port.
    pub fn get_available_port(host: &IpAddr) -> std::io::Result<u16> {
        let listener = TcpListener::bind(SocketAddr::new(*host, 0))?;
        Ok(listener.local_addr()?.port())
    }

    pub fn localhost_for_testing() -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))
    }
}
