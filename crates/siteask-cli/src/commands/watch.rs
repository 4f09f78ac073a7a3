//! Follow a turn on a running server

use crate::app::{OutputFormat, WatchArgs};
use crate::output::EventPrinter;
use anyhow::Result;
use siteask_core::{HttpTransport, ReconnectPolicy, StreamConsumer};

pub async fn run(args: WatchArgs, format: OutputFormat) -> Result<()> {
    let request = args.turn.to_request()?;
    let mut transport = HttpTransport::new(&args.server)?;
    if let Some(session) = &args.session {
        transport = transport.with_session(session);
    }
    let policy = ReconnectPolicy {
        max_retries: args.max_retries,
        ..ReconnectPolicy::default()
    };
    let consumer = StreamConsumer::new(transport).with_policy(policy);

    let mut printer = EventPrinter::new(format);
    let mut failure = None;
    let state = consumer
        .run(&request, |event| {
            if failure.is_none() {
                failure = printer.event(event).err();
            }
        })
        .await?;
    if let Some(e) = failure {
        return Err(e);
    }
    printer.finish(state.query_id())?;

    tracing::info!(
        "Turn {} finished with {} results",
        state.query_id(),
        state.results().len()
    );
    Ok(())
}
