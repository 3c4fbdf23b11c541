//! reviewbot-analyzer: the HTTP client implementing the C5 Review Agent's
//! `Analyzer` dependency from reviewbot-core.

pub mod client;

pub use client::{AnalyzerClient, AnalyzerClientConfig};
