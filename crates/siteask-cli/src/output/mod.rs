//! Output formatters

pub mod json;
pub mod sse;
pub mod terminal;

use crate::app::OutputFormat;
use anyhow::Result;
use siteask_core::{collect_response, TurnEvent};
use std::io::Write;
use termcolor::{ColorChoice, StandardStream};

/// Writes a turn's events to stdout in the chosen format
///
/// Streaming formats print each event as it arrives; JSON waits for the
/// terminal event and prints the aggregated turn.
pub struct EventPrinter {
    format: OutputFormat,
    stdout: StandardStream,
    events: Vec<TurnEvent>,
}

impl EventPrinter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            stdout: StandardStream::stdout(ColorChoice::Auto),
            events: Vec::new(),
        }
    }

    pub fn event(&mut self, event: &TurnEvent) -> Result<()> {
        match self.format {
            OutputFormat::Cli => terminal::write_event(&mut self.stdout, event)?,
            OutputFormat::Sse => {
                self.stdout.write_all(sse::format_event(event)?.as_bytes())?;
                self.stdout.flush()?;
            }
            OutputFormat::Json => self.events.push(event.clone()),
        }
        Ok(())
    }

    pub fn finish(mut self, query_id: &str) -> Result<()> {
        if self.format == OutputFormat::Json {
            let response = collect_response(query_id, &self.events);
            self.stdout
                .write_all(json::format_response(&response).as_bytes())?;
        }
        self.stdout.flush()?;
        Ok(())
    }
}
