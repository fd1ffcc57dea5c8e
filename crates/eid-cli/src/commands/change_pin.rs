//! Change-pin command - replace the transport or personal PIN

use anyhow::Result;

use eid_flow::FlowKind;

use crate::config::MergedConfig;
use crate::driver::{run_flow, Script};
use crate::output::OutputContext;

/// Arguments of the change-pin command
#[derive(Debug, Clone)]
pub struct ChangePinArgs {
    pub old: String,
    pub new: String,
    pub confirm: Option<String>,
    pub retry_pins: Vec<String>,
    pub cans: Vec<String>,
    pub transport_pin: bool,
    pub identification_pending: bool,
}

/// Run a PIN change against the simulated card
pub async fn change_pin(
    args: ChangePinArgs,
    config: &MergedConfig,
    ctx: &OutputContext,
) -> Result<()> {
    // Without a profile file the card is set up to match the PIN kind
    let transport_pin = args.transport_pin.then(|| args.old.clone());
    let card = super::load_card(config.card.as_deref(), |profile| match transport_pin {
        Some(pin) if config.card.is_none() => profile.with_transport_pin(pin),
        _ => profile,
    })?;

    let script = Script {
        identification_pending: args.identification_pending,
        has_transport_pin: args.transport_pin,
        old_secret: args.old,
        retry_pins: args.retry_pins.into(),
        new_pin: Some(args.new.clone()),
        confirmation: args.confirm,
        cans: args.cans.into(),
    };

    let report = run_flow(card.clone(), FlowKind::ChangePin, script, config, ctx).await?;
    if report.is_success() {
        ctx.info(&format!(
            "Card accepts new PIN: {}",
            if card.accepts_pin(&args.new) { "yes" } else { "no" }
        ));
    }
    ctx.info(&format!("PIN retry counter: {}", card.pin_retry_counter()));
    super::finish(&report, ctx)
}
