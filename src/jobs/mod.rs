//! Batch jobs.
//!
//! - `chipzones_job` - fetch, analyse, render, publish and sync every configured symbol

pub mod chipzones_job;
