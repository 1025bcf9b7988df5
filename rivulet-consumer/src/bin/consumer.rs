use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::Arc;

use rivulet_consumer::consumer::Consumer;
use rivulet_consumer::reporter::{render, render_progress};
use rivulet_consumer::shard_poller::PollerState;
use rivulet_core::config::RivuletConfig;
use rivulet_core::stream_log::{FileLog, StartPosition, StreamLog};
use rivulet_core::tool::init_log;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream to read.
    #[arg(long)]
    stream: String,

    #[arg(long)]
    log_dir: Option<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    window_secs: Option<u64>,

    /// 0 disables the periodic report.
    #[arg(long)]
    report_interval_secs: Option<u64>,

    /// `earliest` or `latest`.
    #[arg(long)]
    start: Option<StartPosition>,
}

async fn consume(args: Args) -> Result<()> {
    let mut config = RivuletConfig::load(args.config.as_deref())?;

    if let Some(dir) = args.log_dir {
        config.log.dir = dir;
    }
    if let Some(secs) = args.window_secs {
        config.consumer.window_secs = secs;
    }
    if let Some(secs) = args.report_interval_secs {
        config.consumer.report_interval_secs = secs;
    }
    if let Some(start) = args.start {
        config.consumer.start_position = start;
    }
    config.validate()?;

    let log: Arc<dyn StreamLog> = Arc::new(FileLog::new(&config.log.dir)?);

    let consumer = Consumer::new(log, &args.stream, &config.consumer).catch_signals();
    let table = consumer.progress_table();

    let summary = consumer.consume().await?;

    info!("\n{}", render(&summary.snapshot, config.consumer.window_secs));
    info!("partitions:\n{}", render_progress(&table));
    info!(
        "closed: {}, failed: {}, cancelled: {}",
        summary.count(PollerState::Closed),
        summary.count(PollerState::Failed),
        summary.count(PollerState::Cancelled)
    );

    Ok(())
}

fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?
        .block_on(consume(args))?;

    Ok(())
}
