use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use siplab::config::Config;
use siplab::dhcp::{DhcpServer, DhcpSettings};
use siplab::logging;
use siplab::sip::SipServer;

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::parse());
    if let Err(error) = logging::init(&config) {
        eprintln!("siplab: {}", error);
        std::process::exit(1);
    }
    info!("starting services");
    if let Err(error) = run(config).await {
        error!("fatal: {}", error);
        std::process::exit(1);
    }
    info!("exiting");
}

async fn run(config: Arc<Config>) -> siplab::Result<()> {
    let token = CancellationToken::new();
    let mut workers = Vec::new();

    let sip = SipServer::bind(config.clone()).await?;
    workers.push(("sip", tokio::spawn(sip.run(token.child_token()))));

    if config.dhcp {
        let settings = DhcpSettings::from_config(&config)?;
        let dhcp = DhcpServer::bind(settings).await?;
        workers.push(("dhcp", tokio::spawn(dhcp.run(token.child_token()))));
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    token.cancel();
    for (name, worker) in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => error!("{} worker exited with error: {}", name, error),
            Err(error) => error!("{} worker panicked: {}", name, error),
        }
    }
    Ok(())
}
