use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

use netdepot::client::{self, Client};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Multicast group shared by the cluster
    #[clap(short = 'g')]
    group: Ipv4Addr,

    /// UDP command port the servers listen on
    #[clap(short = 'p', value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Directory that receives downloads
    #[clap(short = 'o')]
    out_folder: PathBuf,

    /// Seconds granted to each response window
    #[clap(
        short = 't',
        default_value_t = client::DEFAULT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..=client::MAX_TIMEOUT_SECS)
    )]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), client::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };
    let config = client::Config {
        group: args.group,
        cmd_port: args.port,
        out_folder: args.out_folder,
        timeout: Duration::from_secs(args.timeout),
    };
    Client::new(&config).await?.run().await
}
