//! Relay hub fan-out benchmark.
//!
//! Subscribes many in-process connections across a set of teams, publishes a
//! burst of deployment events per team and reports delivery latency and
//! evictions.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use stackrelay::config::RelayConfig;
use stackrelay::relay::{DeploymentEvent, RelayHub};

#[derive(Parser, Debug)]
#[command(name = "stackrelay-bench", about = "Relay hub fan-out benchmark")]
struct Args {
    /// Distinct teams receiving events.
    #[arg(long, default_value_t = 50)]
    teams: usize,

    /// Relay connections subscribed to each team.
    #[arg(long, default_value_t = 20)]
    subscribers_per_team: usize,

    /// Events published per team.
    #[arg(long, default_value_t = 100)]
    events: usize,

    /// Per-connection queue depth.
    #[arg(long, default_value_t = 32)]
    buffer: usize,

    /// Yield to the runtime after this many publishes. 0 never yields.
    #[arg(long, default_value_t = 1)]
    yield_every: usize,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    teams: usize,
    connections: usize,
    published: usize,
    delivered: usize,
    evicted: usize,
    publish_secs: f64,
    events_per_sec: f64,
    latency_p50_us: i64,
    latency_p99_us: i64,
    latency_max_us: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let connections = args.teams * args.subscribers_per_team;
    let hub = Arc::new(RelayHub::new(RelayConfig {
        connection_buffer: args.buffer.max(1),
        max_connections: connections.max(1),
        ..RelayConfig::default()
    }));

    let mut receivers = Vec::with_capacity(connections);
    for team in 0..args.teams {
        let team_id = format!("team-{team}");
        for _ in 0..args.subscribers_per_team {
            let mut connection = hub.connect()?;
            connection.subscribe(&team_id)?;
            let expected = args.events;
            receivers.push(tokio::spawn(async move {
                let mut latencies = Vec::with_capacity(expected);
                while latencies.len() < expected {
                    let Some(event) = connection.recv().await else {
                        break;
                    };
                    let elapsed = chrono::Utc::now() - event.timestamp;
                    latencies.push(elapsed.num_microseconds().unwrap_or(i64::MAX));
                }
                latencies
            }));
        }
    }

    let mut delivered = 0usize;
    let mut evicted = 0usize;
    let mut published = 0usize;
    let started = Instant::now();
    for round in 0..args.events {
        for team in 0..args.teams {
            let event = DeploymentEvent::new(
                format!("team-{team}"),
                format!("bench-stack-{team}"),
                "CREATE_IN_PROGRESS",
                format!("round {round}"),
                hub.stamp(),
            );
            let report = hub.publish(event);
            if report.evicted > 0 {
                tracing::warn!(
                    team,
                    round,
                    evicted = report.evicted,
                    "Subscribers fell behind"
                );
            }
            delivered += report.delivered;
            evicted += report.evicted;
            published += 1;
            if args.yield_every > 0 && published % args.yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
    }
    let publish_secs = started.elapsed().as_secs_f64();
    tracing::info!(published, delivered, evicted, publish_secs, "Publish phase done");

    hub.shutdown();
    let mut latencies = Vec::with_capacity(delivered);
    for receiver in futures::future::join_all(receivers).await {
        latencies.extend(receiver?);
    }
    latencies.sort_unstable();

    let report = Report {
        teams: args.teams,
        connections,
        published,
        delivered,
        evicted,
        publish_secs,
        events_per_sec: if publish_secs > 0.0 {
            published as f64 / publish_secs
        } else {
            0.0
        },
        latency_p50_us: percentile(&latencies, 50.0),
        latency_p99_us: percentile(&latencies, 99.0),
        latency_max_us: latencies.last().copied().unwrap_or(0),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("teams            {}", report.teams);
        println!("connections      {}", report.connections);
        println!("published        {}", report.published);
        println!("delivered        {}", report.delivered);
        println!("evicted          {}", report.evicted);
        println!(
            "publish          {:.3}s ({:.0} events/s)",
            report.publish_secs, report.events_per_sec
        );
        println!(
            "latency p50/p99  {}us / {}us (max {}us)",
            report.latency_p50_us, report.latency_p99_us, report.latency_max_us
        );
    }
    Ok(())
}

fn percentile(sorted: &[i64], pct: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
