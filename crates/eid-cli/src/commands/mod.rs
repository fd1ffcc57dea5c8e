//! Command implementations for eid-cli

pub mod change_pin;
pub mod identify;

pub use change_pin::change_pin;
pub use identify::identify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use eid_sim::{CardProfile, SimulatedCard};

use crate::driver::FlowReport;
use crate::output::OutputContext;

/// Simulated card from a profile file, or the default card
fn load_card(
    path: Option<&Path>,
    profile: impl FnOnce(CardProfile) -> CardProfile,
) -> Result<Arc<SimulatedCard>> {
    let base = match path {
        Some(path) => CardProfile::load(path)
            .with_context(|| format!("Failed to load card profile: {}", path.display()))?,
        None => CardProfile::default(),
    };
    Ok(Arc::new(SimulatedCard::new(profile(base))))
}

/// Print the transcript and turn a failed flow into an error
fn finish(report: &FlowReport, ctx: &OutputContext) -> Result<()> {
    ctx.transcript(&report.transcript);
    for request in &report.navigation {
        ctx.info(&format!("Navigation: {:?}", request));
    }

    if report.is_success() {
        ctx.success(&format!("Flow finished: {}", report.outcome));
        Ok(())
    } else {
        ctx.error(&format!("Flow ended in {}", report.outcome));
        anyhow::bail!("Flow did not complete ({})", report.outcome.name())
    }
}
