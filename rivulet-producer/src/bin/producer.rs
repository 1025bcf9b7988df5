use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rivulet_core::config::RivuletConfig;
use rivulet_core::error_bail;
use rivulet_core::stream_log::{FileLog, StreamLog};
use rivulet_core::tool::{init_log, wait_for_signal};
use rivulet_producer::producer::{Producer, StreamingMode};
use rivulet_producer::sample::generate_reviews;
use rivulet_producer::source_reader::{ReviewSource, SourceReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream to write to.
    #[arg(long)]
    stream: String,

    /// Newline-delimited JSON files. Read stdin if neither this nor `--sample` is given.
    #[arg(long, num_args = 1..)]
    source: Vec<String>,

    /// Send `n` generated reviews instead of reading a source.
    #[arg(long, conflicts_with = "source")]
    sample: Option<usize>,

    #[arg(long, default_value_t = StreamingMode::Continuous)]
    mode: StreamingMode,

    #[arg(long)]
    max_records: Option<usize>,

    #[arg(long)]
    log_dir: Option<String>,

    /// Partition count when the stream is created.
    #[arg(long)]
    partitions: Option<usize>,

    #[arg(long)]
    config: Option<String>,

    /// Close the stream after delivery, so consumers reach the end of every partition.
    #[arg(long, default_value_t = false)]
    seal: bool,
}

async fn produce(args: Args) -> Result<()> {
    let mut config = RivuletConfig::load(args.config.as_deref())?;

    if let Some(dir) = args.log_dir.clone() {
        config.log.dir = dir;
    }
    if let Some(partitions) = args.partitions {
        config.log.partitions = partitions;
    }
    config.validate()?;

    let log: Arc<dyn StreamLog> = Arc::new(FileLog::new(&config.log.dir)?);

    let description = match log
        .create_or_describe(&args.stream, config.log.partitions)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            error_bail!(
                "create or describe stream failed, stream: {}, error: {}",
                args.stream.clone(),
                e
            );
        }
    };

    info!(
        "stream ready, stream: {}, partitions: {}, log dir: {}",
        description.stream,
        description.partition_count(),
        config.log.dir
    );

    let mut producer = Producer::new(log.clone(), &args.stream, &config.producer, args.mode);

    let stop = producer.stop_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        stop.store(true, Ordering::Relaxed);
    });

    let summary = match args.sample {
        Some(n) => {
            let reviews = generate_reviews(&mut rand::thread_rng(), n);
            let summary = producer.produce(reviews.into_iter()).await?;
            info!("Sent {} test reviews", summary.delivery.delivered);
            summary
        }
        None => {
            let reader = if args.source.is_empty() {
                info!("reading reviews from stdin");
                SourceReader::from_reader(Box::new(std::io::stdin()), config.producer.chunk_size)
            } else {
                info!("reading reviews from {:?}", args.source);
                SourceReader::new(&args.source, config.producer.chunk_size)?
            };

            let mut reviews = ReviewSource::new(reader, args.max_records);
            let summary = producer.produce(reviews.by_ref()).await?;

            if reviews.skipped() > 0 {
                info!("skipped {} invalid lines", reviews.skipped());
            }

            summary
        }
    };

    if summary.failed_batches > 0 {
        error!(
            "{} batches not fully delivered, dropped records: {}",
            summary.failed_batches, summary.delivery.dropped
        );
    }

    if args.seal {
        producer.seal().await?;
    }

    Ok(())
}

fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?
        .block_on(produce(args))?;

    Ok(())
}
