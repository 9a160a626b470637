// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use bridge_oracle::config::OracleNodeConfig;
use bridge_oracle::metrics::start_metrics_server;
use bridge_oracle::node::run_oracle_node;
use bridge_oracle::store::PgOracleStore;
use bridge_oracle_config::Config;
use bridge_oracle_pg_db::{Db, DbArgs};
use clap::Parser;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,

    #[clap(long, env = "DATABASE_URL")]
    pub database_url: Url,

    #[clap(flatten)]
    pub db_args: DbArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    bridge_oracle::logging::init()?;

    let config = OracleNodeConfig::load(&args.config_path)?.validate()?;

    let registry = Registry::new();
    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let metrics_handle = start_metrics_server(metrics_address, registry.clone()).await?;
    info!("Metrics server started at port {}", config.metrics_port);

    let db = Db::new(args.database_url, args.db_args).await?;
    db.run_migrations(&bridge_oracle_schema::MIGRATIONS).await?;
    let store = Arc::new(PgOracleStore::new(db, config.lock_ttl));

    let cancel = CancellationToken::new();
    let handles = run_oracle_node(config, store, &registry, cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping runnables");
    cancel.cancel();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Runnable task join error: {}", e);
        }
    }
    metrics_handle.abort();
    Ok(())
}
