//! reviewbot-platform: the Azure DevOps REST client implementing the C1
//! Platform Client contract from reviewbot-core.

pub mod client;

pub use client::{AzureDevOpsClient, AzureDevOpsClientConfig};
