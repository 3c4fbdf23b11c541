//! reviewbot-core: domain types, the durable state store, the iteration differ,
//! the comment ledger, the resilience kit, error taxonomy, and configuration
//! loading shared by every other crate in the workspace.

pub mod config;
pub mod database;
pub mod differ;
pub mod error;
pub mod ledger;
pub mod model;
pub mod resilience;
pub mod traits;

pub use database::{ClaimedJob, Database, DatabaseConfig};
pub use error::{Error, ErrorClass, Result};
pub use model::{
    AgentRecord, AgentStateBlob, AgentStatus, Category, ChangeDelta, ErrorRecord, EventKind,
    ExecutionMetrics, FileKind, FileSlice, LineFinding, LineRange, Phase, PrEvent, PrMetadata,
    Repository, Severity, SummaryFinding, Thread, ThreadStatus,
};
pub use resilience::{
    BoundedConcurrency, CancelToken, CircuitBreaker, CircuitBreakerConfig, CircuitBreakers,
    CircuitState, RetryConfig,
};
pub use traits::{AnalysisRequest, AnalysisResult, Analyzer, PlatformClient};
