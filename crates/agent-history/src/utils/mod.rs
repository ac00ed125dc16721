//! Utilities module - text helpers shared by the stores

pub mod text_utils;

pub use text_utils::TextUtils;
