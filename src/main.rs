use std::process::ExitCode;

use anyhow::{Context as _, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idemcheck::{Context, ExternalSignal, HarnessConfig, SkipSignal, StdinSignal, scenario};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idemcheck=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HarnessConfig::from_env().context("Failed to read configuration")?;
    tracing::info!(
        base_url = %config.base_url,
        scenarios = ?config.scenarios,
        pool_size = ?config.pool_size,
        "starting verification run"
    );

    let signal: Box<dyn ExternalSignal> = if config.interactive {
        Box::new(StdinSignal)
    } else {
        Box::new(SkipSignal)
    };
    let ctx = Context::new(config, signal);
    let report = scenario::run_all(&ctx).await;

    print!("{}", report.render());
    println!(
        "{}",
        report.to_json().context("Failed to serialize verdicts")?
    );

    Ok(report.exit_code())
}
