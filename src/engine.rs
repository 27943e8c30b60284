//! Top-level engine owning the store, the LLM gateway, and configuration.
//!
//! Everything else borrows from the engine; there are no globals. Tests
//! build their own engine over a temp-dir store and a gateway with
//! injected providers.

use anyhow::Result;

use crate::config::Config;
use crate::llm::Gateway;
use crate::store::Store;

pub struct Engine {
    pub config: Config,
    pub store: Store,
    pub gateway: Gateway,
}

impl Engine {
    /// Open the configured index and resolve providers from the
    /// environment.
    pub async fn open(config: Config) -> Result<Self> {
        let store = Store::open(&config.index_db_path()).await?;
        let gateway = Gateway::new(&config);
        Ok(Self {
            config,
            store,
            gateway,
        })
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
