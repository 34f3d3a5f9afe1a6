//! Utilities module - Text sizing, truncation and keyword extraction helpers

pub mod text_utils;
pub mod keywords;

// Re-export commonly used utilities
pub use text_utils::TextUtils;
pub use keywords::extract_query_keywords;
