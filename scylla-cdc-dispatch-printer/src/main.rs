pub mod printer;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use scylla::client::session_builder::SessionBuilder;
use scylla_cdc_dispatch::dispatcher::CdcDispatcherBuilder;

use crate::printer::PrinterConsumerFactory;

#[derive(Parser)]
struct Args {
    /// Keyspace name
    #[clap(short, long, action = clap::ArgAction::Set)]
    keyspace: String,

    /// Table name
    #[clap(short, long, action = clap::ArgAction::Set)]
    table: String,

    /// Address of a node in the source cluster
    #[clap(short = 'n', long, action = clap::ArgAction::Set)]
    hostname: String,

    /// Window size in seconds
    #[clap(long, default_value_t = 60., action = clap::ArgAction::Set)]
    window_size: f64,

    /// Generation-done poll interval in seconds
    #[clap(long, default_value_t = 10., action = clap::ArgAction::Set)]
    poll_interval: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let session = Arc::new(
        SessionBuilder::new()
            .known_node(args.hostname)
            .build()
            .await?,
    );

    let (mut dispatcher, handle) = CdcDispatcherBuilder::new()
        .session(session)
        .table(&args.keyspace, &args.table)
        .window_size(Duration::from_secs_f64(args.window_size))
        .sleep_before_generation_done(Duration::from_secs_f64(args.poll_interval))
        .consumer_factory(Arc::new(PrinterConsumerFactory))
        .build()
        .await?;

    tokio::signal::ctrl_c().await?;
    dispatcher.stop();
    handle.await
}
