use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

use netdepot::server::{self, Server};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Multicast group shared by the cluster
    #[clap(short = 'g')]
    group: Ipv4Addr,

    /// UDP command port
    #[clap(short = 'p', value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Maximum bytes of storage offered
    #[clap(short = 'b', default_value_t = server::DEFAULT_MAX_SPACE)]
    max_space: u64,

    /// Directory backing the repository
    #[clap(short = 'f')]
    folder: PathBuf,

    /// Seconds granted to each handshake step
    #[clap(
        short = 't',
        default_value_t = server::DEFAULT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..=server::MAX_TIMEOUT_SECS)
    )]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), server::Error> {
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
    let config = server::Config {
        group: args.group,
        cmd_port: args.port,
        max_space: args.max_space,
        shared_folder: args.folder,
        timeout: Duration::from_secs(args.timeout),
    };
    Server::new(&config)?.run().await
}
