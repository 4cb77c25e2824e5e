pub mod checker;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod harness;
pub mod report;
pub mod scenario;
pub mod session;
pub mod steps;
pub mod types;

pub use checker::{AllowList, Expectation, InvariantVerdict};
pub use client::{ApiClient, ApiRequest, ClientConfig};
pub use config::HarnessConfig;
pub use credential::Credential;
pub use error::{HarnessError, Result};
pub use harness::{Batch, ConcurrencyHarness, Operation};
pub use report::Report;
pub use scenario::checkpoint::{ExternalSignal, SkipSignal, StdinSignal};
pub use scenario::{Context, Scenario};
pub use session::Session;
pub use types::{ApiResult, Envelope, IdempotencyKey, ResourceHandle};
