//! Server-sent event frames, as `siteask serve` would send them

use anyhow::Result;
use siteask_core::{encode_sse, TurnEvent};

pub fn format_event(event: &TurnEvent) -> Result<String> {
    Ok(encode_sse(event)?)
}
