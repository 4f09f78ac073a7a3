//! Terminal output formatter

use siteask_core::{EventKind, RankedItem, TurnEvent};
use std::io::{self, Write};
use termcolor::{Color, ColorSpec, WriteColor};

pub fn write_event<W: WriteColor>(out: &mut W, event: &TurnEvent) -> io::Result<()> {
    match &event.kind {
        EventKind::QueryAnalysis {
            decontextualized_query,
            ..
        } => dim(out, &format!("Searching for: {}", decontextualized_query))?,
        EventKind::Remember {
            item_to_remember, ..
        } => dim(out, &format!("Remembering: {}", item_to_remember))?,
        EventKind::AskingSites { message, .. } | EventKind::IntermediateMessage { message } => {
            dim(out, message)?
        }
        EventKind::SiteIsIrrelevantToQuery { message } | EventKind::AskUser { message } => {
            colored(out, Color::Yellow, message)?
        }
        EventKind::ResultBatch { results } => {
            for item in results {
                write_item(out, item)?;
            }
        }
        EventKind::Summary { message } => {
            writeln!(out)?;
            writeln!(out, "{}", message)?;
        }
        EventKind::Nlws { answer, items } => {
            writeln!(out, "{}", answer)?;
            if !items.is_empty() {
                writeln!(out)?;
                writeln!(out, "Sources:")?;
                for item in items {
                    writeln!(out, "  {} <{}>", item.name, item.source_identifier)?;
                }
            }
        }
        EventKind::ItemDetails { item, details } => {
            writeln!(out, "  {}: {}", item.name, details)?;
        }
        EventKind::Cancelled { reason } => {
            colored(out, Color::Red, &format!("Cancelled: {}", reason))?
        }
        EventKind::Complete => {}
    }
    out.flush()
}

fn write_item<W: WriteColor>(out: &mut W, item: &RankedItem) -> io::Result<()> {
    let color = if item.relevance_score >= 70 {
        Color::Green
    } else {
        Color::Yellow
    };
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    write!(out, "{:>3}", item.relevance_score)?;
    out.reset()?;
    writeln!(out, " {} [{}]", item.candidate.name, item.candidate.site)?;
    writeln!(out, "    {}", item.source_identifier())?;
    if !item.rationale.is_empty() {
        writeln!(out, "    {}", item.rationale)?;
    }
    Ok(())
}

fn dim<W: WriteColor>(out: &mut W, text: &str) -> io::Result<()> {
    out.set_color(ColorSpec::new().set_dimmed(true))?;
    write!(out, "{}", text)?;
    out.reset()?;
    writeln!(out)
}

fn colored<W: WriteColor>(out: &mut W, color: Color, text: &str) -> io::Result<()> {
    out.set_color(ColorSpec::new().set_fg(Some(color)))?;
    write!(out, "{}", text)?;
    out.reset()?;
    writeln!(out)
}
