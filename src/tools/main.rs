// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! shardmesh-admin: thin CLI client over the Manager's admin API. No
//! business logic lives here — every command is a single HTTP call.

use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "shardmesh-admin")]
#[command(about = "shardmesh cluster administration")]
struct Cli {
    #[arg(long, env = "SHARDMESH_MANAGER_URL", default_value = "http://127.0.0.1:8080")]
    manager_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new shard.
    ShardCreate {
        #[arg(long)]
        name: String,
        #[arg(long)]
        primary: String,
        #[arg(long, value_delimiter = ',')]
        replicas: Vec<String>,
        #[arg(long)]
        vnode_count: Option<u32>,
    },
    /// List all shards.
    ShardList,
    /// Show one shard.
    ShardGet { id: String },
    /// Delete a drained shard.
    ShardDelete { id: String },
    /// Manually promote a replica to primary.
    ShardPromote {
        id: String,
        #[arg(long)]
        replica: String,
    },
    /// Split vnodes off a source shard onto a target shard.
    ReshardSplit {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        vnode_delta: u32,
        #[arg(long)]
        table: String,
        #[arg(long)]
        primary_key_column: String,
        #[arg(long)]
        shard_key_column: String,
    },
    /// Merge several source shards into one target shard.
    ReshardMerge {
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
        #[arg(long)]
        target: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        primary_key_column: String,
        #[arg(long)]
        shard_key_column: String,
    },
    /// Show the status of a reshard job.
    ReshardStatus { job_id: String },
    /// Show whether automatic failover is enabled.
    FailoverStatus,
    /// Enable automatic failover.
    FailoverEnable,
    /// Disable automatic failover.
    FailoverDisable,
    /// Show recent failover events.
    FailoverHistory {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.manager_url.trim_end_matches('/').to_string();

    let response = match cli.command {
        Commands::ShardCreate { name, primary, replicas, vnode_count } => {
            client
                .post(format!("{base}/shards"))
                .json(&json!({
                    "name": name,
                    "primary_endpoint": primary,
                    "replicas": replicas,
                    "vnode_count": vnode_count,
                }))
                .send()
                .await?
        }
        Commands::ShardList => client.get(format!("{base}/shards")).send().await?,
        Commands::ShardGet { id } => client.get(format!("{base}/shards/{id}")).send().await?,
        Commands::ShardDelete { id } => client.delete(format!("{base}/shards/{id}")).send().await?,
        Commands::ShardPromote { id, replica } => {
            client
                .post(format!("{base}/shards/{id}/promote"))
                .json(&json!({"replica_endpoint": replica}))
                .send()
                .await?
        }
        Commands::ReshardSplit { source, target, vnode_delta, table, primary_key_column, shard_key_column } => {
            client
                .post(format!("{base}/reshard/split"))
                .json(&json!({
                    "sources": [source],
                    "target": target,
                    "vnode_delta": vnode_delta,
                    "table": table,
                    "primary_key_column": primary_key_column,
                    "shard_key_column": shard_key_column,
                }))
                .send()
                .await?
        }
        Commands::ReshardMerge { sources, target, table, primary_key_column, shard_key_column } => {
            client
                .post(format!("{base}/reshard/merge"))
                .json(&json!({
                    "sources": sources,
                    "target": target,
                    "vnode_delta": 0,
                    "table": table,
                    "primary_key_column": primary_key_column,
                    "shard_key_column": shard_key_column,
                }))
                .send()
                .await?
        }
        Commands::ReshardStatus { job_id } => client.get(format!("{base}/reshard/jobs/{job_id}")).send().await?,
        Commands::FailoverStatus => client.get(format!("{base}/failover/status")).send().await?,
        Commands::FailoverEnable => client.post(format!("{base}/failover/enable")).send().await?,
        Commands::FailoverDisable => client.post(format!("{base}/failover/disable")).send().await?,
        Commands::FailoverHistory { offset, limit } => {
            client
                .get(format!("{base}/failover/history"))
                .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
