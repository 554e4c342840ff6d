use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::external::document_store::{DocumentStore, DocumentStoreError, PageBlock, StoredRow, SyncRow};
use crate::services::rate_limiter::RateLimiter;

const NOTION_VERSION: &str = "2022-06-28";
/// Notion caps page sizes and appended children per request at 100.
const MAX_PAGE_SIZE: usize = 100;

pub const TITLE_COLUMN: &str = "Symbol";
pub const DATE_COLUMN: &str = "Date";
pub const CHART_COLUMN: &str = "Chart";
pub const CSV_COLUMN: &str = "CSV";

/// Notion REST client. Tables are Notion databases, rows are pages.
pub struct NotionStore {
    client: Client,
    api_base: String,
    token: String,
    max_attempts: u32,
    rate_limiter: Arc<RateLimiter>,
}

impl NotionStore {
    pub fn new(
        api_base: &str,
        token: String,
        timeout_secs: u64,
        max_attempts: u32,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, DocumentStoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| DocumentStoreError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            max_attempts: max_attempts.max(1),
            rate_limiter,
        })
    }

    async fn call_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DocumentStoreError> {
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            attempt += 1;
            match self.call(method.clone(), path, body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "Notion {} {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        method, path, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!("Notion {} {} failed after {} attempt(s): {}", method, path, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, DocumentStoreError> {
        let _guard = self.rate_limiter.acquire().await;

        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DocumentStoreError::Timeout
            } else {
                DocumentStoreError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DocumentStoreError::RateLimited);
        }

        if !status.is_success() {
            // Gateways in front of the API may answer with non-JSON bodies.
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            let message = api_message(&payload);
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(DocumentStoreError::Unauthorized(message));
            }
            return Err(DocumentStoreError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| DocumentStoreError::InvalidResponse(e.to_string()))
    }
}

fn api_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

fn id_of(payload: &Value) -> Result<String, DocumentStoreError> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DocumentStoreError::InvalidResponse("missing id".into()))
}

fn text(content: &str) -> Value {
    // Notion caps a single rich text item at 2000 characters.
    let content: String = content.chars().take(2000).collect();
    json!([{ "type": "text", "text": { "content": content } }])
}

fn column_schema(columns: &[String]) -> Map<String, Value> {
    let mut properties = Map::new();
    for column in columns {
        properties.insert(column.clone(), json!({ "rich_text": {} }));
    }
    properties
}

/// Page properties for a synced row.
pub fn row_properties(row: &SyncRow) -> Value {
    let mut properties = Map::new();
    properties.insert(TITLE_COLUMN.into(), json!({ "title": text(&row.symbol) }));
    properties.insert(DATE_COLUMN.into(), json!({ "date": { "start": row.date.to_string() } }));
    properties.insert(CHART_COLUMN.into(), json!({ "url": row.chart_url }));
    properties.insert(CSV_COLUMN.into(), json!({ "url": row.csv_url }));
    for (name, value) in &row.columns {
        properties.insert(name.clone(), json!({ "rich_text": text(value) }));
    }
    Value::Object(properties)
}

fn row_symbol(page: &Value) -> String {
    page.pointer(&format!("/properties/{}/title/0/plain_text", TITLE_COLUMN))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Notion ids are accepted with or without dashes.
fn same_id(a: &str, b: &str) -> bool {
    let plain = |id: &str| id.replace('-', "").to_ascii_lowercase();
    plain(a) == plain(b)
}

fn page_title(page: &Value) -> String {
    page.pointer("/properties/title/title")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("plain_text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// Block JSON for the children endpoint.
pub fn block_json(block: &PageBlock) -> Value {
    match block {
        PageBlock::Link { text: content, url } => json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": {
                "rich_text": [{
                    "type": "text",
                    "text": { "content": content, "link": { "url": url } },
                }]
            },
        }),
        PageBlock::Image { url } => json!({
            "object": "block",
            "type": "image",
            "image": { "type": "external", "external": { "url": url } },
        }),
    }
}

impl NotionStore {
    /// Follow `next_cursor` until the listing is exhausted.
    async fn collect_pages(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Vec<Value>, DocumentStoreError> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = match (&body, &cursor) {
                (Some(body), cursor) => {
                    let mut body = body.clone();
                    body["page_size"] = json!(MAX_PAGE_SIZE);
                    if let Some(c) = cursor {
                        body["start_cursor"] = json!(c);
                    }
                    self.call_with_retry(method.clone(), path, Some(body)).await?
                }
                (None, Some(c)) => {
                    let path = format!("{}?page_size={}&start_cursor={}", path, MAX_PAGE_SIZE, c);
                    self.call_with_retry(method.clone(), &path, None).await?
                }
                (None, None) => {
                    let path = format!("{}?page_size={}", path, MAX_PAGE_SIZE);
                    self.call_with_retry(method.clone(), &path, None).await?
                }
            };

            if let Some(items) = page.get("results").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }

            let has_more = page.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            cursor = page.get("next_cursor").and_then(Value::as_str).map(str::to_string);
            if !has_more || cursor.is_none() {
                return Ok(results);
            }
        }
    }

    async fn archive(&self, page_id: &str) -> Result<(), DocumentStoreError> {
        let body = json!({ "archived": true });
        self.call_with_retry(Method::PATCH, &format!("/pages/{}", page_id), Some(body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DocumentStore for NotionStore {
    async fn create_table(
        &self,
        parent_id: &str,
        title: &str,
        columns: &[String],
    ) -> Result<String, DocumentStoreError> {
        let mut properties = column_schema(columns);
        properties.insert(TITLE_COLUMN.into(), json!({ "title": {} }));
        properties.insert(DATE_COLUMN.into(), json!({ "date": {} }));
        properties.insert(CHART_COLUMN.into(), json!({ "url": {} }));
        properties.insert(CSV_COLUMN.into(), json!({ "url": {} }));

        let body = json!({
            "parent": { "type": "page_id", "page_id": parent_id },
            "title": text(title),
            "properties": properties,
        });
        let created = self.call_with_retry(Method::POST, "/databases", Some(body)).await?;
        id_of(&created)
    }

    async fn ensure_columns(&self, table_id: &str, columns: &[String]) -> Result<(), DocumentStoreError> {
        let body = json!({ "properties": column_schema(columns) });
        self.call_with_retry(Method::PATCH, &format!("/databases/{}", table_id), Some(body))
            .await
            .map(|_| ())
    }

    async fn find_row(
        &self,
        table_id: &str,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<String>, DocumentStoreError> {
        let body = json!({
            "filter": { "and": [
                { "property": TITLE_COLUMN, "title": { "equals": symbol } },
                { "property": DATE_COLUMN, "date": { "equals": date.to_string() } },
            ]},
            "page_size": 1,
        });
        let found = self
            .call_with_retry(Method::POST, &format!("/databases/{}/query", table_id), Some(body))
            .await?;

        match found.pointer("/results/0") {
            Some(page) => id_of(page).map(Some),
            None => Ok(None),
        }
    }

    async fn insert_row(&self, table_id: &str, row: &SyncRow) -> Result<String, DocumentStoreError> {
        let body = json!({
            "parent": { "database_id": table_id },
            "properties": row_properties(row),
        });
        let created = self.call_with_retry(Method::POST, "/pages", Some(body)).await?;
        id_of(&created)
    }

    async fn update_row(&self, row_id: &str, row: &SyncRow) -> Result<(), DocumentStoreError> {
        let body = json!({ "properties": row_properties(row) });
        self.call_with_retry(Method::PATCH, &format!("/pages/{}", row_id), Some(body))
            .await
            .map(|_| ())
    }

    async fn list_rows(&self, table_id: &str) -> Result<Vec<StoredRow>, DocumentStoreError> {
        let results = self
            .collect_pages(Method::POST, &format!("/databases/{}/query", table_id), Some(json!({})))
            .await?;

        results
            .iter()
            .map(|result| -> Result<StoredRow, DocumentStoreError> {
                Ok(StoredRow {
                    id: id_of(result)?,
                    symbol: row_symbol(result),
                })
            })
            .collect()
    }

    async fn archive_row(&self, row_id: &str) -> Result<(), DocumentStoreError> {
        self.archive(row_id).await
    }

    async fn find_pages(&self, parent_id: &str, title: &str) -> Result<Vec<String>, DocumentStoreError> {
        let body = json!({
            "query": title,
            "filter": { "property": "object", "value": "page" },
            "sort": { "direction": "ascending", "timestamp": "last_edited_time" },
        });
        let results = self.collect_pages(Method::POST, "/search", Some(body)).await?;

        let mut matches: Vec<(String, String)> = Vec::new();
        for page in &results {
            let parent = page.pointer("/parent/page_id").and_then(Value::as_str).unwrap_or_default();
            if same_id(parent, parent_id) && page_title(page) == title {
                let created = page
                    .get("created_time")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                matches.push((created, id_of(page)?));
            }
        }
        // RFC 3339 timestamps sort lexically.
        matches.sort();
        Ok(matches.into_iter().map(|(_, id)| id).collect())
    }

    async fn create_page(&self, parent_id: &str, title: &str) -> Result<String, DocumentStoreError> {
        let body = json!({
            "parent": { "type": "page_id", "page_id": parent_id },
            "properties": { "title": { "title": text(title) } },
        });
        let created = self.call_with_retry(Method::POST, "/pages", Some(body)).await?;
        id_of(&created)
    }

    async fn archive_page(&self, page_id: &str) -> Result<(), DocumentStoreError> {
        self.archive(page_id).await
    }

    async fn clear_page(&self, page_id: &str) -> Result<usize, DocumentStoreError> {
        // Collect first; deleting while paging would shift the cursor.
        let children = self
            .collect_pages(Method::GET, &format!("/blocks/{}/children", page_id), None)
            .await?;
        let ids = children.iter().map(id_of).collect::<Result<Vec<_>, _>>()?;

        for id in &ids {
            self.call_with_retry(Method::DELETE, &format!("/blocks/{}", id), None)
                .await?;
        }
        Ok(ids.len())
    }

    async fn append_blocks(&self, page_id: &str, blocks: &[PageBlock]) -> Result<(), DocumentStoreError> {
        for chunk in blocks.chunks(MAX_PAGE_SIZE) {
            let body = json!({ "children": chunk.iter().map(block_json).collect::<Vec<_>>() });
            self.call_with_retry(Method::PATCH, &format!("/blocks/{}/children", page_id), Some(body))
                .await?;
        }
        Ok(())
    }
}
