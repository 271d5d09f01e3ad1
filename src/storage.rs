//! # Storage Management Module
//!
//! ## Purpose
//! Handles persistent storage of councils and their financial figures using an
//! embedded database. This is the source data every counter is computed from.
//!
//! ## Input/Output Specification
//! - **Input**: Council records, financial figures keyed (council, year, field)
//! - **Output**: Figure retrieval, per-council and per-year scans, statistics
//! - **Storage**: Sled embedded database with one tree per record type
//!
//! ## Key Features
//! - One figure record per (council, year, field); superseded in place
//! - Durable writes flushed before invalidation is signalled
//! - Latest-year resolution for "latest" counter scopes
//! - Health checks and storage statistics

use crate::config::StorageConfig;
use crate::errors::{CounterError, Result};
use crate::{Council, FinancialFigure};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tree names inside the shared database
const COUNCILS_TREE: &str = "councils";
const FIGURES_TREE: &str = "financial_figures";
const METADATA_TREE: &str = "metadata";

/// Persistent store for councils and financial figures
pub struct FigureStore {
    config: StorageConfig,
    db: Arc<sled::Db>,
    councils_tree: Arc<sled::Tree>,
    figures_tree: Arc<sled::Tree>,
    metadata_tree: Arc<sled::Tree>,
    stats: Arc<RwLock<StorageStats>>,
}

/// Storage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_councils: usize,
    pub total_figures: usize,
    pub database_size_bytes: u64,
}

impl FigureStore {
    /// Open (or create) the store at the configured path
    pub async fn new(config: StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::open(&config.db_path).map_err(|e| CounterError::DatabaseConnectionFailed {
            db_path: config.db_path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;

        let councils_tree = db.open_tree(COUNCILS_TREE).map_err(|e| {
            CounterError::DatabaseConnectionFailed {
                db_path: config.db_path.to_string_lossy().to_string(),
                reason: format!("Failed to open councils tree: {}", e),
            }
        })?;

        let figures_tree = db.open_tree(FIGURES_TREE).map_err(|e| {
            CounterError::DatabaseConnectionFailed {
                db_path: config.db_path.to_string_lossy().to_string(),
                reason: format!("Failed to open figures tree: {}", e),
            }
        })?;

        let metadata_tree = db.open_tree(METADATA_TREE).map_err(|e| {
            CounterError::DatabaseConnectionFailed {
                db_path: config.db_path.to_string_lossy().to_string(),
                reason: format!("Failed to open metadata tree: {}", e),
            }
        })?;

        let stats = Arc::new(RwLock::new(StorageStats {
            total_councils: 0,
            total_figures: 0,
            database_size_bytes: 0,
        }));

        let store = Self {
            config,
            db: Arc::new(db),
            councils_tree: Arc::new(councils_tree),
            figures_tree: Arc::new(figures_tree),
            metadata_tree: Arc::new(metadata_tree),
            stats,
        };

        store.update_stats().await?;

        tracing::info!(
            "Figure store initialized with {} councils, {} figures",
            store.stats.read().await.total_councils,
            store.stats.read().await.total_figures
        );

        Ok(store)
    }

    /// Shared database handle, used to co-locate the result store
    pub fn database(&self) -> Arc<sled::Db> {
        Arc::clone(&self.db)
    }

    fn figure_key(council: &str, year: i32, field: &str) -> String {
        format!("{}:{}:{}", council, year, field)
    }

    /// Store or replace a council record
    pub async fn store_council(&self, council: &Council) -> Result<()> {
        let value = bincode::serialize(council)?;
        self.councils_tree.insert(council.slug.as_bytes(), value)?;

        tracing::debug!("Stored council: {}", council.slug);
        Ok(())
    }

    /// Retrieve a council by slug
    pub async fn get_council(&self, slug: &str) -> Result<Option<Council>> {
        match self.councils_tree.get(slug.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// List all councils
    pub async fn list_councils(&self) -> Result<Vec<Council>> {
        let mut councils = Vec::new();
        for result in self.councils_tree.iter() {
            let (_, value) = result?;
            councils.push(bincode::deserialize(&value)?);
        }
        Ok(councils)
    }

    /// Store or replace a single financial figure, flushed durably.
    ///
    /// The flush matters: invalidation must only be signalled after the write
    /// can no longer be lost.
    pub async fn store_figure(&self, figure: &FinancialFigure) -> Result<()> {
        let key = Self::figure_key(&figure.council, figure.year, &figure.field);
        let value = bincode::serialize(figure)?;

        self.figures_tree.insert(key.as_bytes(), value)?;
        self.figures_tree.flush_async().await?;

        tracing::debug!(
            "Stored figure {}/{}/{} = {}",
            figure.council,
            figure.year,
            figure.field,
            figure.value
        );
        Ok(())
    }

    /// Batch store figures (bulk import), flushed once at the end
    pub async fn store_figures_batch(&self, figures: &[FinancialFigure]) -> Result<usize> {
        let mut stored_count = 0;

        for figure in figures {
            let key = Self::figure_key(&figure.council, figure.year, &figure.field);
            match bincode::serialize(figure) {
                Ok(value) => {
                    self.figures_tree.insert(key.as_bytes(), value)?;
                    stored_count += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to serialize figure {}: {}", key, e);
                    continue;
                }
            }
        }

        self.figures_tree.flush_async().await?;
        self.update_stats().await?;

        tracing::info!("Batch stored {} figures", stored_count);
        Ok(stored_count)
    }

    /// Retrieve a single figure
    pub async fn get_figure(
        &self,
        council: &str,
        year: i32,
        field: &str,
    ) -> Result<Option<FinancialFigure>> {
        let key = Self::figure_key(council, year, field);
        match self.figures_tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All figures for one council and year
    pub async fn figures_for_council_year(
        &self,
        council: &str,
        year: i32,
    ) -> Result<Vec<FinancialFigure>> {
        let prefix = format!("{}:{}:", council, year);
        let mut figures = Vec::new();

        for result in self.figures_tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result?;
            figures.push(bincode::deserialize(&value)?);
        }

        Ok(figures)
    }

    /// All figures for a given field and year across every council
    pub async fn figures_for_field_year(
        &self,
        field: &str,
        year: i32,
    ) -> Result<Vec<FinancialFigure>> {
        let mut figures = Vec::new();

        for result in self.figures_tree.iter() {
            let (_, value) = result?;
            let figure: FinancialFigure = bincode::deserialize(&value)?;
            if figure.year == year && figure.field == field {
                figures.push(figure);
            }
        }

        Ok(figures)
    }

    /// Most recent year with figures for one council
    pub async fn latest_year_for_council(&self, council: &str) -> Result<Option<i32>> {
        let prefix = format!("{}:", council);
        let mut latest = None;

        for result in self.figures_tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result?;
            let figure: FinancialFigure = bincode::deserialize(&value)?;
            latest = Some(latest.map_or(figure.year, |y: i32| y.max(figure.year)));
        }

        Ok(latest)
    }

    /// Most recent year with figures across all councils
    pub async fn latest_year(&self) -> Result<Option<i32>> {
        let mut latest = None;

        for result in self.figures_tree.iter() {
            let (_, value) = result?;
            let figure: FinancialFigure = bincode::deserialize(&value)?;
            latest = Some(latest.map_or(figure.year, |y: i32| y.max(figure.year)));
        }

        Ok(latest)
    }

    /// Update storage statistics
    async fn update_stats(&self) -> Result<()> {
        let mut stats = self.stats.write().await;

        stats.total_councils = self.councils_tree.len();
        stats.total_figures = self.figures_tree.len();
        stats.database_size_bytes = self.db.size_on_disk()?;

        Ok(())
    }

    /// Get storage statistics
    pub async fn get_stats(&self) -> Result<StorageStats> {
        self.update_stats().await?;
        Ok(self.stats.read().await.clone())
    }

    /// Health check: probe a write, read, and delete.
    ///
    /// The probe lives in its own tree; figure scans running concurrently
    /// must never see a record that does not decode as a figure.
    pub async fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        let test_value = b"ok";

        self.metadata_tree.insert(test_key, test_value).map_err(|e| {
            CounterError::DatabaseConnectionFailed {
                db_path: self.config.db_path.to_string_lossy().to_string(),
                reason: format!("Health check write failed: {}", e),
            }
        })?;

        let result = self.metadata_tree.get(test_key).map_err(|e| {
            CounterError::DatabaseConnectionFailed {
                db_path: self.config.db_path.to_string_lossy().to_string(),
                reason: format!("Health check read failed: {}", e),
            }
        })?;

        if result.is_none() {
            return Err(CounterError::DatabaseConnectionFailed {
                db_path: self.config.db_path.to_string_lossy().to_string(),
                reason: "Health check value not found".to_string(),
            });
        }

        self.metadata_tree.remove(test_key)?;

        Ok(())
    }

    /// Flush all trees; called during graceful shutdown
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
