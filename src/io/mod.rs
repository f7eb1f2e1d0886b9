//! CSV export.

pub mod export;
