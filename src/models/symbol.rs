use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::BarInterval;

/// A symbol as it appears in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub code: String,
    pub start: NaiveDate,
}

/// Everything a data source needs to fetch one symbol's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolConfig {
    pub code: String,
    pub start_date: NaiveDate,
    pub interval: BarInterval,
}

impl SymbolConfig {
    pub fn new(code: impl Into<String>, start_date: NaiveDate, interval: BarInterval) -> Self {
        Self {
            code: code.into(),
            start_date,
            interval,
        }
    }
}
