use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::iterator::{BackoffRetry, MergeIterator, RetryPolicy};
use crate::model::ChromoLookup;
use crate::query::{open_table, QueryOptions};
use crate::table::{BucketManager, DictionaryTable, TableFilter, TableLocks};

/// Shared state for one user of the engine: the chromosome lookup, the
/// configuration and the retry policy for opening sources.
#[derive(Clone)]
pub struct Session {
    lookup: Arc<ChromoLookup>,
    config: EngineConfig,
    retry: Arc<dyn RetryPolicy>,
}

impl Session {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            lookup: ChromoLookup::shared(),
            config,
            retry: Arc::new(BackoffRetry::default()),
        })
    }

    pub fn with_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<ChromoLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn lookup(&self) -> &Arc<ChromoLookup> {
        &self.lookup
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn retry(&self) -> &dyn RetryPolicy {
        self.retry.as_ref()
    }

    pub fn locks(&self, table_path: impl AsRef<Path>) -> TableLocks {
        TableLocks::new(table_path, self.config.lock.clone())
    }

    pub fn bucket_manager(&self) -> BucketManager {
        BucketManager::new(
            self.config.bucket.clone(),
            self.config.lock.clone(),
            self.lookup.clone(),
        )
    }

    pub fn load_table(&self, path: impl AsRef<Path>) -> Result<DictionaryTable> {
        DictionaryTable::load(path.as_ref())
    }

    pub fn open_table(
        &self,
        table: &DictionaryTable,
        filters: &[TableFilter],
        options: QueryOptions,
    ) -> Result<MergeIterator> {
        open_table(self, table, filters, options)
    }
}
