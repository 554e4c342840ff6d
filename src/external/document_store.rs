use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited,

    #[error("api error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no table configured and no parent to create one under")]
    NoTable,
}

impl DocumentStoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            DocumentStoreError::Network(_)
            | DocumentStoreError::Timeout
            | DocumentStoreError::RateLimited => true,
            DocumentStoreError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// One row of the synced table, keyed by `(symbol, date)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub chart_url: String,
    pub csv_url: String,
    /// CSV column name and its value, in CSV column order.
    pub columns: Vec<(String, String)>,
}

/// An existing row as seen when listing a table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub symbol: String,
}

/// Content block appended to a page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageBlock {
    /// Paragraph whose text links to `url`.
    Link { text: String, url: String },
    /// Image served from `url`.
    Image { url: String },
}

/// Table-oriented document database (Notion databases are the one implementation).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a table under `parent_id` and return its id.
    async fn create_table(
        &self,
        parent_id: &str,
        title: &str,
        columns: &[String],
    ) -> Result<String, DocumentStoreError>;

    /// Add any missing text columns to an existing table.
    async fn ensure_columns(&self, table_id: &str, columns: &[String]) -> Result<(), DocumentStoreError>;

    async fn find_row(
        &self,
        table_id: &str,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<String>, DocumentStoreError>;

    async fn insert_row(&self, table_id: &str, row: &SyncRow) -> Result<String, DocumentStoreError>;

    async fn update_row(&self, row_id: &str, row: &SyncRow) -> Result<(), DocumentStoreError>;

    async fn list_rows(&self, table_id: &str) -> Result<Vec<StoredRow>, DocumentStoreError>;

    async fn archive_row(&self, row_id: &str) -> Result<(), DocumentStoreError>;

    /// Ids of the child pages of `parent_id` titled exactly `title`, oldest first.
    async fn find_pages(&self, parent_id: &str, title: &str) -> Result<Vec<String>, DocumentStoreError>;

    async fn create_page(&self, parent_id: &str, title: &str) -> Result<String, DocumentStoreError>;

    async fn archive_page(&self, page_id: &str) -> Result<(), DocumentStoreError>;

    /// Delete every block on a page. Returns how many were deleted.
    async fn clear_page(&self, page_id: &str) -> Result<usize, DocumentStoreError>;

    async fn append_blocks(&self, page_id: &str, blocks: &[PageBlock]) -> Result<(), DocumentStoreError>;
}
