//! Identify command - authenticate against a service

use anyhow::{Context, Result};
use url::Url;

use eid_flow::FlowKind;

use crate::config::MergedConfig;
use crate::driver::{run_flow, Script};
use crate::output::OutputContext;

/// Arguments of the identify command
#[derive(Debug, Clone)]
pub struct IdentifyArgs {
    pub url: String,
    pub pin: String,
    pub retry_pins: Vec<String>,
    pub cans: Vec<String>,
}

/// Run an identification against the simulated card
pub async fn identify(
    args: IdentifyArgs,
    config: &MergedConfig,
    ctx: &OutputContext,
) -> Result<()> {
    let tc_token_url =
        Url::parse(&args.url).with_context(|| format!("Invalid tc token URL: {}", args.url))?;
    let card = super::load_card(config.card.as_deref(), |profile| profile)?;

    let script = Script {
        old_secret: args.pin,
        retry_pins: args.retry_pins.into(),
        cans: args.cans.into(),
        ..Script::default()
    };

    let report = run_flow(card, FlowKind::Identify { tc_token_url }, script, config, ctx).await?;
    super::finish(&report, ctx)
}
