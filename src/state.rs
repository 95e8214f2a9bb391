use anyhow::Result;
use std::sync::Arc;

use crate::config::AppSettings;
use crate::errors::GatewayError;
use crate::metrics::RequestCounters;
use crate::pool::KeyPool;
use crate::providers::base::{ResolvedFile, StoredFiles};
use crate::providers::ProviderRegistry;
use crate::queue::JobQueue;
use crate::store::Store;
use crate::timeseries::TokenTimeSeries;

/// Everything a process needs to serve requests or work the queue. Built
/// once at startup; the HTTP front-end and the workers construct the same
/// state over the same database file.
pub struct AppState {
    pub settings: Arc<AppSettings>,
    pub store: Arc<Store>,
    pub pool: KeyPool,
    pub registry: ProviderRegistry,
    pub timeseries: TokenTimeSeries,
    pub queue: JobQueue,
    pub counters: Arc<RequestCounters>,
}

impl AppState {
    pub fn init(settings: AppSettings) -> Result<Arc<Self>> {
        let store = Arc::new(Store::open(&settings.database_path)?);
        Self::with_store(settings, store)
    }

    pub fn with_store(settings: AppSettings, store: Arc<Store>) -> Result<Arc<Self>> {
        let settings = Arc::new(settings);
        let counters = Arc::new(RequestCounters::new());
        Ok(Arc::new(Self {
            pool: KeyPool::new(store.clone(), settings.clone(), counters.clone()),
            registry: ProviderRegistry::from_settings(&settings)?,
            timeseries: TokenTimeSeries::new(store.clone()),
            queue: JobQueue::new(store.clone()),
            settings,
            store,
            counters,
        }))
    }

    #[cfg(test)]
    pub fn in_memory(settings: AppSettings) -> Arc<Self> {
        Self::with_store(settings, Arc::new(Store::open_in_memory().unwrap())).unwrap()
    }

    /// Resolve attachment file ids to stored files with their public URLs.
    ///
    /// `strict` makes unknown ids a client error (the sync path rejects
    /// before consuming a key); the worker passes `false` and lets missing
    /// files degrade inside the adapters.
    pub fn resolve_stored_files(
        &self,
        file_ids: &[String],
        strict: bool,
    ) -> Result<Option<StoredFiles>, GatewayError> {
        if file_ids.is_empty() {
            return Ok(None);
        }

        let records = self
            .store
            .get_stored_files(file_ids)
            .map_err(GatewayError::Internal)?;

        let mut resolved = StoredFiles::new();
        for record in records {
            let id = record.id.to_string();
            resolved.insert(
                id.clone(),
                ResolvedFile {
                    public_url: format!("{}/v1/files/{}", self.settings.public_base_url, id),
                    id,
                    filename: record.filename,
                    mime_type: record.mime_type,
                    storage_path: record.storage_path,
                },
            );
        }

        if strict {
            let missing: Vec<&str> = file_ids
                .iter()
                .filter(|id| !resolved.contains_key(*id))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(GatewayError::Client(format!(
                    "Unknown attachment file_id(s): {}",
                    missing.join(", ")
                )));
            }
        }

        Ok(Some(resolved))
    }
}
