use stratum_core::config::{FanoutConfig, SyncConfig};
use stratum_core::Result;

#[cfg(doc)]
use crate::StratumClient;

/// Configuration for [`StratumClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub(crate) sync: SyncConfig,
    pub(crate) fanout: FanoutConfig,
}

impl ClientConfig {
    /// Create a default client configuration.
    ///
    /// ```
    /// # use stratum::ClientConfig;
    /// ClientConfig::new();
    /// ```
    pub fn new() -> ClientConfig {
        ClientConfig::default()
    }

    /// Read configuration overrides from `STRATUM_*` environment variables.
    pub fn from_env() -> Result<ClientConfig> {
        Ok(ClientConfig {
            sync: SyncConfig::from_env()?,
            fanout: FanoutConfig::from_env()?,
        })
    }

    /// Override the change-log sync configuration.
    pub fn sync_config(mut self, sync: SyncConfig) -> ClientConfig {
        self.sync = sync;
        self
    }

    /// Override the subscriber fan-out configuration.
    pub fn fanout_config(mut self, fanout: FanoutConfig) -> ClientConfig {
        self.fanout = fanout;
        self
    }
}
