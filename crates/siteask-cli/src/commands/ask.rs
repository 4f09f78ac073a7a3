//! One turn run in-process

use crate::app::{AskArgs, OutputFormat};
use crate::output::EventPrinter;
use anyhow::Result;
use siteask_core::{CancelToken, Coordinator, EventSink};
use std::sync::Arc;

pub async fn run(args: AskArgs, coordinator: Arc<Coordinator>, format: OutputFormat) -> Result<()> {
    let request = args.turn.to_request()?;
    let query_id = request.query_id.clone();

    let cancel = CancelToken::new();
    let (mut sink, mut rx) = EventSink::channel(query_id.clone(), cancel.clone());
    let turn = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run_turn(request, &mut sink, cancel).await })
    };

    let mut printer = EventPrinter::new(format);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    // Ctrl-C cancels the turn; its cancelled event still gets printed
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => printer.event(&event)?,
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                cancel.cancel();
            }
        }
    }
    printer.finish(&query_id)?;

    let state = turn.await?;
    tracing::info!(
        "Turn {} ended in {:?} after {:?}",
        state.query_id,
        state.phase,
        state.phases
    );
    for metrics in coordinator.inference_metrics() {
        tracing::debug!(
            "{}: {} requests, {} errors, {:.0}% cached, {:.0}ms average",
            metrics.model,
            metrics.total_requests,
            metrics.total_errors,
            metrics.cache_hit_rate,
            metrics.avg_latency_ms
        );
    }
    Ok(())
}
