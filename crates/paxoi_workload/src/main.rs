//! Workload generator for exercising Paxoi over the in-memory transport.
//!
//! This binary spins up an in-process replica cluster, runs one or more
//! CURP clients against it, and reports throughput plus fast/slow path
//! classification. It is the test harness for the protocol core, not a
//! deployment vehicle; transports and process bootstrap live elsewhere.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;

use paxoi_core::curp::Client;
use paxoi_core::paxoi::testing::{InMemoryNetwork, KvStore};
use paxoi_core::paxoi::{ClientId, Command, Config, Replica, ReplicaId};

/// CLI options for one workload run.
#[derive(Parser, Debug, Clone)]
#[command(name = "paxoi-workload")]
struct Args {
    /// Number of replicas.
    #[arg(short = 'n', long, default_value_t = 5)]
    replicas: usize,

    /// Number of concurrent clients (each strictly sequential).
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Total number of requests per client.
    #[arg(short = 'q', long, default_value_t = 1000)]
    reqs: usize,

    /// Percentage of updates (writes).
    #[arg(short = 'w', long, default_value_t = 50)]
    writes: u8,

    /// Percentage of operations targeting the shared conflict key.
    #[arg(short = 'c', long, default_value_t = 0)]
    conflicts: u8,

    /// Payload size for writes, in bytes.
    #[arg(long, default_value_t = 100)]
    psize: usize,

    /// Execute reads at the collocated replica.
    #[arg(short = 'l', long, default_value_t = false)]
    fast_read: bool,

    /// Leader-side speculative execution.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    opt_exec: bool,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Emit the run summary as JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

/// Per-run summary, also serializable for scripted comparisons.
#[derive(serde::Serialize, Debug)]
struct Summary {
    replicas: usize,
    clients: usize,
    total_reqs: usize,
    elapsed_ms: u64,
    reqs_per_sec: f64,
    slow_paths: usize,
    history_total: usize,
    history_slow: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.replicas >= 3, "need at least 3 replicas");
    anyhow::ensure!(args.writes <= 100, "-w is a percentage");
    anyhow::ensure!(args.conflicts <= 100, "-c is a percentage");

    let seed = if args.seed == 0 {
        rand::random()
    } else {
        args.seed
    };
    tracing::info!(?args, seed, "starting workload");

    let net = InMemoryNetwork::new();
    let mut replicas = Vec::with_capacity(args.replicas);
    for id in 0..args.replicas as ReplicaId {
        let mut config = Config::new(id, args.replicas);
        config.opt_exec = args.opt_exec;
        config.fast_read = args.fast_read;
        let store = KvStore::new();
        let replica = Replica::new(config, net.replica_endpoint(id), store)
            .context("replica construction")?;
        net.register_replica(id, replica.inbox());
        replica.start();
        replicas.push(replica);
    }

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for client_num in 0..args.clients {
        let client_id = client_num as ClientId + 1;
        let inbox = net.register_client(client_id);
        let collocated = (client_num % args.replicas) as ReplicaId;
        let mut client = Client::new(
            client_id,
            args.replicas,
            vec![1.0; args.replicas],
            Some(collocated),
            args.fast_read,
            net.client_endpoint(),
            inbox,
        );
        let args = args.clone();
        tasks.spawn(async move {
            let mut rng = SmallRng::seed_from_u64(seed ^ client_id as u64);
            for i in 0..args.reqs {
                let conflict = rng.gen_range(0..100) < args.conflicts;
                let key = if conflict {
                    100
                } else {
                    // Private key range per client, as the comparison
                    // harness does.
                    100 + (client_id as u64 * args.reqs as u64) + i as u64
                };
                let write = rng.gen_range(0..100) < args.writes;
                let command = if write {
                    let mut payload = vec![0u8; args.psize];
                    rng.fill(payload.as_mut_slice());
                    Command::put(key, payload)
                } else {
                    Command::get(key)
                };
                // Recoverable failures back off for a second and re-drive.
                let mut attempts = 0;
                loop {
                    match client.invoke(command.clone()).await {
                        Ok(_) => break,
                        Err(err) if attempts < 3 => {
                            attempts += 1;
                            tracing::warn!(client_id, i, %err, "request failed, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("client {client_id} request {i}"));
                        }
                    }
                }
            }
            Ok::<usize, anyhow::Error>(client.slow_paths())
        });
    }

    let mut slow_paths = 0usize;
    while let Some(res) = tasks.join_next().await {
        slow_paths += res.context("client task")??;
    }
    let elapsed = start.elapsed();

    // Give deliveries a moment to quiesce before sampling history.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (history_total, history_slow) = replicas[0].history_stats();

    let total_reqs = args.clients * args.reqs;
    let summary = Summary {
        replicas: args.replicas,
        clients: args.clients,
        total_reqs,
        elapsed_ms: elapsed.as_millis() as u64,
        reqs_per_sec: total_reqs as f64 / elapsed.as_secs_f64(),
        slow_paths,
        history_total,
        history_slow,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Total number of commands: {}", summary.total_reqs);
        println!("Number of slow paths: {}", summary.slow_paths);
        println!(
            "Elapsed: {:.2}s ({:.0} req/s)",
            elapsed.as_secs_f64(),
            summary.reqs_per_sec
        );
    }
    Ok(())
}
