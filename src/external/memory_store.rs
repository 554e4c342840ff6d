//! In-memory `DocumentStore` for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::external::document_store::{DocumentStore, DocumentStoreError, PageBlock, StoredRow, SyncRow};

#[derive(Debug, Clone)]
pub struct MemoryPage {
    pub id: String,
    pub parent: String,
    pub title: String,
    pub archived: bool,
    pub blocks: Vec<PageBlock>,
}

#[derive(Default)]
pub struct MemoryStore {
    pub tables_created: AtomicUsize,
    pub column_checks: AtomicUsize,
    rows: Mutex<Vec<(String, SyncRow, bool)>>,
    pages: Mutex<Vec<MemoryPage>>,
}

impl MemoryStore {
    pub fn live_rows(&self) -> Vec<SyncRow> {
        self.rows
            .lock()
            .iter()
            .filter(|(_, _, archived)| !archived)
            .map(|(_, r, _)| r.clone())
            .collect()
    }

    /// Unarchived pages titled `title`, in creation order.
    pub fn live_pages(&self, title: &str) -> Vec<MemoryPage> {
        self.pages
            .lock()
            .iter()
            .filter(|p| !p.archived && p.title == title)
            .cloned()
            .collect()
    }

    pub fn page(&self, id: &str) -> Option<MemoryPage> {
        self.pages.lock().iter().find(|p| p.id == id).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Seed a page as if an earlier run had left it behind.
    pub fn add_page(&self, parent: &str, title: &str, blocks: Vec<PageBlock>) -> String {
        let mut pages = self.pages.lock();
        let id = format!("page-{}", pages.len());
        pages.push(MemoryPage {
            id: id.clone(),
            parent: parent.to_string(),
            title: title.to_string(),
            archived: false,
            blocks,
        });
        id
    }

    fn with_page<T>(
        &self,
        page_id: &str,
        f: impl FnOnce(&mut MemoryPage) -> T,
    ) -> Result<T, DocumentStoreError> {
        let mut pages = self.pages.lock();
        let page = pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .ok_or_else(|| DocumentStoreError::Api { status: 404, message: page_id.into() })?;
        Ok(f(page))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_table(&self, _parent: &str, _title: &str, _columns: &[String]) -> Result<String, DocumentStoreError> {
        let n = self.tables_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("table-{}", n))
    }

    async fn ensure_columns(&self, _table: &str, _columns: &[String]) -> Result<(), DocumentStoreError> {
        self.column_checks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_row(&self, _table: &str, symbol: &str, date: NaiveDate) -> Result<Option<String>, DocumentStoreError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|(_, r, archived)| !archived && r.symbol == symbol && r.date == date)
            .map(|(id, _, _)| id.clone()))
    }

    async fn insert_row(&self, _table: &str, row: &SyncRow) -> Result<String, DocumentStoreError> {
        // Give a concurrent writer the chance to interleave.
        tokio::task::yield_now().await;
        let mut rows = self.rows.lock();
        let id = format!("row-{}", rows.len());
        rows.push((id.clone(), row.clone(), false));
        Ok(id)
    }

    async fn update_row(&self, row_id: &str, row: &SyncRow) -> Result<(), DocumentStoreError> {
        let mut rows = self.rows.lock();
        let entry = rows
            .iter_mut()
            .find(|(id, _, _)| id == row_id)
            .ok_or_else(|| DocumentStoreError::Api { status: 404, message: row_id.into() })?;
        entry.1 = row.clone();
        Ok(())
    }

    async fn list_rows(&self, _table: &str) -> Result<Vec<StoredRow>, DocumentStoreError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|(_, _, archived)| !archived)
            .map(|(id, r, _)| StoredRow { id: id.clone(), symbol: r.symbol.clone() })
            .collect())
    }

    async fn archive_row(&self, row_id: &str) -> Result<(), DocumentStoreError> {
        if let Some(entry) = self.rows.lock().iter_mut().find(|(id, _, _)| id == row_id) {
            entry.2 = true;
        }
        Ok(())
    }

    async fn find_pages(&self, parent_id: &str, title: &str) -> Result<Vec<String>, DocumentStoreError> {
        Ok(self
            .pages
            .lock()
            .iter()
            .filter(|p| !p.archived && p.parent == parent_id && p.title == title)
            .map(|p| p.id.clone())
            .collect())
    }

    async fn create_page(&self, parent_id: &str, title: &str) -> Result<String, DocumentStoreError> {
        tokio::task::yield_now().await;
        Ok(self.add_page(parent_id, title, Vec::new()))
    }

    async fn archive_page(&self, page_id: &str) -> Result<(), DocumentStoreError> {
        self.with_page(page_id, |p| p.archived = true)
    }

    async fn clear_page(&self, page_id: &str) -> Result<usize, DocumentStoreError> {
        self.with_page(page_id, |p| std::mem::take(&mut p.blocks).len())
    }

    async fn append_blocks(&self, page_id: &str, blocks: &[PageBlock]) -> Result<(), DocumentStoreError> {
        self.with_page(page_id, |p| p.blocks.extend_from_slice(blocks))
    }
}
