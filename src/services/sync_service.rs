use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::external::document_store::{DocumentStore, DocumentStoreError, PageBlock, SyncRow};
use crate::external::notion::NotionStore;
use crate::models::{Artifact, ChipProfile, ChipZones};
use crate::services::rate_limiter::RateLimiter;
use crate::services::render_service::{bin_row, CSV_COLUMNS};

pub const TABLE_TITLE: &str = "Chip Zones";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted,
    Updated,
}

/// Upserts one row per symbol and run date into the document database.
///
/// The table id is resolved (or the table created) once per run. Writes for
/// the same symbol are serialized so parallel runs never insert duplicates.
/// With a parent page and an absolute base URL it also keeps one page per
/// symbol and a directory page linking all of them.
pub struct SyncService {
    store: Arc<dyn DocumentStore>,
    database_id: Option<String>,
    parent_page_id: Option<String>,
    public_base_url: Option<String>,
    prune_unlisted: bool,
    symbol_pages: bool,
    directory_page: bool,
    directory_title: String,
    precision: usize,
    table: OnceCell<String>,
    row_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncService {
    pub fn new(store: Arc<dyn DocumentStore>, config: &SyncConfig, precision: usize) -> Self {
        Self {
            store,
            database_id: config.database_id.clone(),
            parent_page_id: config.parent_page_id.clone(),
            public_base_url: config
                .public_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            prune_unlisted: config.prune_unlisted,
            symbol_pages: config.symbol_pages,
            directory_page: config.directory_page,
            directory_title: config.directory_title.clone(),
            precision,
            table: OnceCell::new(),
            row_locks: DashMap::new(),
        }
    }

    /// Notion-backed service, or `None` when sync is off or has no credential.
    pub fn from_config(config: &SyncConfig, precision: usize) -> Result<Option<Self>, DocumentStoreError> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(token) = config.token() else {
            warn!("⚠️ Sync enabled but ${} is not set; skipping document database sync", config.token_env);
            return Ok(None);
        };

        let limiter = Arc::new(RateLimiter::new(3, config.requests_per_minute));
        let store = NotionStore::new(
            &config.api_base,
            token,
            config.timeout_secs,
            config.max_attempts,
            limiter,
        )?;
        Ok(Some(Self::new(Arc::new(store), config, precision)))
    }

    pub fn prune_enabled(&self) -> bool {
        self.prune_unlisted
    }

    /// Parent for symbol and directory pages. Links on a page must be
    /// absolute, so pages are only kept when a public base URL is set.
    fn pages_parent(&self) -> Option<&str> {
        match (&self.parent_page_id, &self.public_base_url) {
            (Some(parent), Some(_)) => Some(parent.as_str()),
            _ => None,
        }
    }

    pub fn directory_enabled(&self) -> bool {
        self.directory_page && self.pages_parent().is_some()
    }

    fn columns() -> Vec<String> {
        CSV_COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    async fn table_id(&self) -> Result<&str, DocumentStoreError> {
        let id = self
            .table
            .get_or_try_init(|| async {
                match (&self.database_id, &self.parent_page_id) {
                    (Some(id), _) => {
                        self.store.ensure_columns(id, &Self::columns()).await?;
                        Ok(id.clone())
                    }
                    (None, Some(parent)) => {
                        let id = self
                            .store
                            .create_table(parent, TABLE_TITLE, &Self::columns())
                            .await?;
                        info!("🗂️ Created document table {} under {}", id, parent);
                        Ok(id)
                    }
                    (None, None) => Err(DocumentStoreError::NoTable),
                }
            })
            .await?;
        Ok(id.as_str())
    }

    /// Public link to a published file, or its path relative to the pages root.
    pub fn public_url(&self, symbol: &str, extension: &str) -> String {
        let relative = format!("{}/{}", symbol, Artifact::latest_name(symbol, extension));
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base, relative),
            None => relative,
        }
    }

    /// Link to a symbol's published directory.
    pub fn public_dir_url(&self, symbol: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}/", base, symbol),
            None => format!("{}/", symbol),
        }
    }

    /// Row for one symbol. Bin columns come from the point-of-control bin.
    pub fn build_row(&self, symbol: &str, date: NaiveDate, profile: &ChipProfile, zones: &ChipZones) -> SyncRow {
        let columns = if profile.is_empty() {
            Vec::new()
        } else {
            let poc = profile.point_of_control().unwrap_or(0);
            CSV_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .zip(bin_row(profile, zones, poc, self.precision))
                .collect()
        };

        SyncRow {
            symbol: symbol.to_string(),
            date,
            chart_url: self.public_url(symbol, "png"),
            csv_url: self.public_url(symbol, "csv"),
            columns,
        }
    }

    pub async fn sync_symbol(
        &self,
        artifact: &Artifact,
        profile: &ChipProfile,
        zones: &ChipZones,
    ) -> Result<SyncOutcome, DocumentStoreError> {
        let table_id = self.table_id().await?;
        let row = self.build_row(&artifact.symbol, artifact.run_date, profile, zones);

        let lock = self
            .row_locks
            .entry(artifact.symbol.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = lock.lock().await;

        let outcome = match self.store.find_row(table_id, &row.symbol, row.date).await? {
            Some(row_id) => {
                self.store.update_row(&row_id, &row).await?;
                SyncOutcome::Updated
            }
            None => {
                self.store.insert_row(table_id, &row).await?;
                SyncOutcome::Inserted
            }
        };

        if self.symbol_pages {
            if let Some(parent) = self.pages_parent() {
                self.refresh_symbol_page(parent, &row).await?;
            }
        }

        info!("🔄 Synced {} ({:?})", row.symbol, outcome);
        Ok(outcome)
    }

    /// The page titled `title` under `parent`, created when missing.
    /// Later duplicates are archived.
    async fn unique_page(&self, parent: &str, title: &str) -> Result<String, DocumentStoreError> {
        let mut pages = self.store.find_pages(parent, title).await?.into_iter();
        let Some(keep) = pages.next() else {
            let id = self.store.create_page(parent, title).await?;
            info!("📄 Created page '{}' under {}", title, parent);
            return Ok(id);
        };

        for duplicate in pages {
            self.store.archive_page(&duplicate).await?;
            warn!("Archived duplicate page '{}' ({})", title, duplicate);
        }
        Ok(keep)
    }

    /// Replace the symbol page's content with the chart and a CSV link.
    async fn refresh_symbol_page(&self, parent: &str, row: &SyncRow) -> Result<(), DocumentStoreError> {
        let page = self.unique_page(parent, &row.symbol).await?;
        self.store.clear_page(&page).await?;
        self.store
            .append_blocks(
                &page,
                &[
                    PageBlock::Image {
                        url: row.chart_url.clone(),
                    },
                    PageBlock::Link {
                        text: format!("📄 {} table (CSV)", row.symbol),
                        url: row.csv_url.clone(),
                    },
                ],
            )
            .await
    }

    /// Rewrite the directory page with one link per listed symbol.
    /// Returns the number of links written.
    pub async fn refresh_directory(&self, listed: &[String]) -> Result<usize, DocumentStoreError> {
        let Some(parent) = self.pages_parent() else {
            return Ok(0);
        };

        let page = self.unique_page(parent, &self.directory_title).await?;
        let removed = self.store.clear_page(&page).await?;
        let links: Vec<PageBlock> = listed
            .iter()
            .map(|symbol| PageBlock::Link {
                text: format!("🔗 {} Chart & Table", symbol),
                url: self.public_dir_url(symbol),
            })
            .collect();
        self.store.append_blocks(&page, &links).await?;

        info!(
            "📘 Directory page refreshed with {} link(s), {} old block(s) removed",
            links.len(),
            removed
        );
        Ok(links.len())
    }

    /// Archive rows whose symbol is no longer configured. Returns how many were archived.
    pub async fn prune_unlisted(&self, listed: &[String]) -> Result<usize, DocumentStoreError> {
        let table_id = self.table_id().await?;
        let listed: HashSet<&str> = listed.iter().map(String::as_str).collect();

        let mut archived = 0;
        for row in self.store.list_rows(table_id).await? {
            if !listed.contains(row.symbol.as_str()) {
                self.store.archive_row(&row.id).await?;
                archived += 1;
            }
        }
        if archived > 0 {
            info!("🧹 Archived {} row(s) for unlisted symbols", archived);
        }
        Ok(archived)
    }
}
