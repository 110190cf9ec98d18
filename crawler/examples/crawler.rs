//! Crawl the bitcoin network and report progress once a second.

use bitcoin::Network;
use clap::Parser;
use log::LevelFilter;
use nodescan::{seeds, CrawlerBuilder, Endpoint, JsonFileStore};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Seed endpoint as host:port, repeatable. DNS seeds are used when omitted.
    #[arg(short, long = "seed")]
    seeds: Vec<Endpoint>,

    /// Network to crawl.
    #[arg(short, long, default_value = "bitcoin")]
    network: Network,

    /// Maximum number of concurrent connections.
    #[arg(short, long, default_value = "8")]
    connections: usize,

    /// Custom user agent (optional).
    #[arg(short, long)]
    user_agent: Option<String>,

    /// File good nodes are written to.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Earlier output file whose nodes seed this crawl.
    #[arg(short, long)]
    resume: Option<PathBuf>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    let mut builder =
        CrawlerBuilder::new(args.network).with_connection_limit(args.connections)?;
    if let Some(user_agent) = args.user_agent {
        log::debug!("Using custom user agent: {user_agent}");
        builder = builder.with_user_agent(user_agent)?;
    }
    if let Some(output) = args.output {
        builder = builder.with_output_path(output);
    }
    let crawler = builder.build();

    let mut seed_endpoints = args.seeds;
    if let Some(resume) = args.resume {
        let records = JsonFileStore::load(&resume)?;
        let before = seed_endpoints.len();
        for record in records {
            match record.endpoint.parse::<Endpoint>() {
                Ok(endpoint) => seed_endpoints.push(endpoint),
                Err(e) => log::warn!("Skipping saved node {}: {e}", record.endpoint),
            }
        }
        log::info!(
            "Resuming with {} nodes from {}",
            seed_endpoints.len() - before,
            resume.display()
        );
    }
    if seed_endpoints.is_empty() {
        log::info!("Resolving DNS seeds for {}", args.network);
        seed_endpoints = seeds::resolve(args.network).await;
    }
    if seed_endpoints.is_empty() {
        return Err("no seed endpoints to crawl from".into());
    }

    log::info!(
        "CRAWLING THE {} NETWORK",
        args.network.to_string().to_uppercase()
    );
    let cancel = CancellationToken::new();
    let mut session = crawler.crawl(seed_endpoints, cancel).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
            snapshot = session.next_snapshot() => match snapshot {
                Some(snapshot) => log::info!("{snapshot}"),
                None => break,
            },
        }
    }

    if let Err(e) = session.shutdown(Duration::from_secs(5)).await {
        log::warn!("{e}");
    }
    log::info!("Final: {}", crawler.snapshot().await);

    Ok(())
}
