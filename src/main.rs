use car_idx::{Envelope, FsStore, Handler, RetryConfig, S3Config, S3StoreFactory, StoreFactory};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Index the CARs announced by a notification envelope
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Envelope JSON (SNS, SQS or S3 event records); read from stdin if omitted
    #[arg()]
    event: Option<PathBuf>,
    /// Total attempts per CAR
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    /// Pause between attempts, in milliseconds
    #[arg(long, env = "RETRY_DELAY", default_value_t = 100)]
    retry_delay: u64,
    /// Serve buckets from subdirectories of this directory instead of S3
    #[arg(long)]
    local: Option<PathBuf>,
    /// S3 endpoint override
    #[arg(long, env = "S3_ENDPOINT_URL")]
    endpoint_url: Option<String>,
    #[arg(long)]
    force_path_style: bool,
    /// S3 operation timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let retry = RetryConfig::new(args.max_retries, Duration::from_millis(args.retry_delay));
    log::debug!("retry config: {retry:?}");

    let raw = match &args.event {
        Some(path) => tokio::fs::read(path).await?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };
    let envelope = Envelope::from_slice(&raw)?;

    match args.local {
        Some(root) => run(FsStore::new(root), retry, &envelope).await,
        None => {
            let config = S3Config {
                endpoint: args.endpoint_url,
                force_path_style: args.force_path_style,
                timeout_ms: args.timeout_ms,
            };
            run(S3StoreFactory::new(config), retry, &envelope).await
        }
    }
}

async fn run<F: StoreFactory>(factory: F, retry: RetryConfig, envelope: &Envelope) -> Result<()> {
    let handler = Handler::new(factory, retry);
    let indexed = handler.handle(envelope).await?;
    for object in &indexed {
        println!(
            "{}/{}\t{} blocks\t{} bytes",
            object.bucket, object.index_key, object.blocks, object.bytes
        );
    }
    log::info!("bye! indexed {} car(s)", indexed.len());
    Ok(())
}
