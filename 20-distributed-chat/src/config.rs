use std::{fs, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::{cli::ServeArgs, store::memory};

/// Browser client shipped with the crate.
const BUNDLED_WEB_ROOT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/public");

/// Settings for one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub web_root: PathBuf,
    pub endpoint: String,
    pub history_size: usize,
    pub store: String,
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            web_root: PathBuf::from(BUNDLED_WEB_ROOT),
            endpoint: "/chat".to_string(),
            history_size: 50,
            store: memory::LOCATOR.to_string(),
            queue_capacity: 64,
        }
    }
}

impl RelayConfig {
    /// Reads the optional config file, then applies command-line overrides.
    pub fn load(args: &ServeArgs) -> Result<Self> {
        let base = match &args.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_json(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };

        let config = base.with_overrides(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn with_overrides(mut self, args: &ServeArgs) -> Self {
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(web_root) = &args.web_root {
            self.web_root = web_root.clone();
        }
        if let Some(endpoint) = &args.endpoint {
            self.endpoint = endpoint.clone();
        }
        if let Some(history_size) = args.history_size {
            self.history_size = history_size;
        }
        if let Some(store) = &args.store {
            self.store = store.clone();
        }
        if let Some(queue_capacity) = args.queue_capacity {
            self.queue_capacity = queue_capacity;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.history_size > 0, "history_size must be at least 1");
        ensure!(self.queue_capacity > 0, "queue_capacity must be at least 1");
        ensure!(
            self.endpoint.starts_with('/'),
            "endpoint must start with '/', got '{}'",
            self.endpoint
        );
        Ok(())
    }
}
