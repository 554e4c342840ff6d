pub mod csv_source;
pub mod document_store;
pub mod market_data;
#[cfg(test)]
pub(crate) mod memory_store;
pub mod notion;
pub mod sina;
