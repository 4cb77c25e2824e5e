//! End-to-end scenarios. Each one chains named steps, feeding the handles
//! one step returns into the next, and records verdicts as it goes.

pub mod checkpoint;
mod orders;
mod payments;
mod refund;
mod shipping;

use std::fmt;
use std::str::FromStr;

use tokio::sync::OnceCell;

use crate::client::{ApiClient, ClientConfig};
use crate::config::HarnessConfig;
use crate::credential::Credential;
use crate::error::{HarnessError, Result};
use crate::harness::ConcurrencyHarness;
use crate::report::Report;
use checkpoint::ExternalSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Preview, idempotent and concurrent creates, the mutation race, list totals.
    Orders,
    /// Create/checkout idempotency and repeated payment cancel.
    Payments,
    /// Paid order refund with concurrent admin confirmation.
    Refund,
    /// Shipment label, dispatch, manual-create and webhook duplicates.
    Shipping,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [Self::Orders, Self::Payments, Self::Refund, Self::Shipping];

    pub fn name(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Payments => "payments",
            Self::Refund => "refund",
            Self::Shipping => "shipping",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| HarnessError::Config(format!("unknown scenario: {}", s)))
    }
}

/// Everything a scenario needs: actors, the batch runner, settings and the checkpoint.
///
/// Actors log in on first use, so a scenario that never touches the admin API
/// never needs admin credentials.
pub struct Context {
    pub config: HarnessConfig,
    pub harness: ConcurrencyHarness,
    pub signal: Box<dyn ExternalSignal>,
    user: OnceCell<ApiClient>,
    admin: OnceCell<ApiClient>,
}

impl Context {
    pub fn new(config: HarnessConfig, signal: Box<dyn ExternalSignal>) -> Self {
        let harness = ConcurrencyHarness::new(config.timeout).with_pool_size(config.pool_size);
        Self {
            config,
            harness,
            signal,
            user: OnceCell::new(),
            admin: OnceCell::new(),
        }
    }

    /// Logged-in buyer client.
    pub async fn user(&self) -> Result<&ApiClient> {
        let credential = self.config.require_user()?;
        self.user
            .get_or_try_init(|| self.connect("user", credential))
            .await
    }

    /// Logged-in operator client.
    pub async fn admin(&self) -> Result<&ApiClient> {
        let credential = self.config.require_admin()?;
        self.admin
            .get_or_try_init(|| self.connect("admin", credential))
            .await
    }

    async fn connect(&self, actor: &str, credential: &Credential) -> Result<ApiClient> {
        let client = ApiClient::with_config(ClientConfig {
            base_url: self.config.base_url.clone(),
            timeout: self.config.timeout,
            actor: actor.to_string(),
        })?;
        client.login(credential).await?;
        client.refresh_anti_forgery().await?;
        Ok(client)
    }
}

/// Run one scenario. An error aborts it and is recorded as a failed verdict.
pub async fn run(ctx: &Context, scenario: Scenario, report: &mut Report) {
    tracing::info!(%scenario, "scenario started");
    let before = report.verdicts().len();
    let outcome = match scenario {
        Scenario::Orders => orders::run(ctx, report).await,
        Scenario::Payments => payments::run(ctx, report).await,
        Scenario::Refund => refund::run(ctx, report).await,
        Scenario::Shipping => shipping::run(ctx, report).await,
    };
    match outcome {
        Ok(()) => tracing::info!(
            %scenario,
            checks = report.verdicts().len() - before,
            "scenario finished"
        ),
        Err(err) => report.abort(scenario.name(), &err),
    }
}

/// Run every configured scenario in order.
pub async fn run_all(ctx: &Context) -> Report {
    let mut report = Report::new();
    for scenario in ctx.config.scenarios.clone() {
        run(ctx, scenario, &mut report).await;
    }
    report
}
