//! Human-readable state dump, written to the log on `SIGUSR1`.

use std::fmt::Write;
use std::sync::Arc;

use ondemand_scaler_pool::{render_spec, Pool};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::info;

use crate::context::AppContext;

/// Render counters and every pool's nodes and allocations.
#[must_use]
pub fn render(app: &AppContext) -> String {
    let stats = app.stats.snapshot();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "free scaling threads: {}({})",
        stats.free_scaling_threads, stats.scaling_threads
    );
    let _ = writeln!(out, "free gc threads: {}({})", stats.free_gc_threads, stats.gc_threads);
    let _ = writeln!(out, "accepted evals: {}", stats.accepted_evals);
    let _ = writeln!(out, "accepted allocs: {}", stats.accepted_allocs);
    let _ = writeln!(out, "timed out scalings: {}", stats.scaling_timeouts);
    let _ = writeln!(out, "no-suited scaling events: {}", stats.no_suited_events);

    for pool in &app.pools {
        out.push('\n');
        render_pool(&mut out, pool);
    }
    out
}

fn render_pool(out: &mut String, pool: &Pool) {
    let snapshot = pool.snapshot();
    let _ = writeln!(
        out,
        "pool: {} ({}) has {} nodes and {} allocs, {} tentative nodes",
        pool.name(),
        pool.provider_kind(),
        snapshot.nodes.len(),
        snapshot.allocations.len(),
        snapshot.tentative_nodes.len(),
    );

    let spec = pool.spec();
    let declared = render_spec(spec.attributes(), &["provider"]);
    let mut table = Builder::default();
    match snapshot.nodes.first() {
        Some(node) => {
            table.push_record(["Orig".to_string(), format!("OneOfNodes({})", node.id.short())]);
            table.push_record([declared, render_spec(&spec.spec_from_node(node), &[])]);
        }
        None => {
            table.push_record(["Orig".to_string(), "OneOfNodes".to_string()]);
            table.push_record([declared, "N/A".to_string()]);
        }
    }
    let mut table = table.build();
    table.with(Style::sharp());

    out.push_str("  spec:\n");
    for line in table.to_string().lines() {
        let _ = writeln!(out, "    {line}");
    }

    let per_node = pool.allocs_per_node();
    out.push_str("\n  nodes:\n");
    for node in &snapshot.nodes {
        let first_event = node
            .first_event_at()
            .map_or_else(|| "unknown".to_string(), |at| at.to_rfc3339());
        let _ = writeln!(
            out,
            "    {}({}), first event time: {first_event}, allocCount: {}",
            node.id,
            node.status,
            per_node.get(&node.id).copied().unwrap_or_default(),
        );
    }

    out.push_str("\n  allocs:\n");
    for alloc in &snapshot.allocations {
        let _ = writeln!(out, "    {}({})", alloc.id, alloc.client_status.as_str());
    }
}

/// Log [`render`] whenever the process receives `SIGUSR1`, until shutdown.
#[cfg(unix)]
pub async fn dump_on_signal(app: Arc<AppContext>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals = match signal(SignalKind::user_defined1()) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "can't listen for SIGUSR1, state dump disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            () = app.shutdown.cancelled() => break,
            received = signals.recv() => {
                if received.is_none() {
                    break;
                }
                info!(target: "ondemand_scaler::dump", "\n{}", render(&app));
            }
        }
    }
}

/// No dump signal off unix; waits for shutdown.
#[cfg(not(unix))]
pub async fn dump_on_signal(app: Arc<AppContext>) {
    app.shutdown.cancelled().await;
}
