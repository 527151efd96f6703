use std::io::Write;

use anyhow::Context;
use fetchpool::{Config, Pool, TcpConnector};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        anyhow::bail!("usage: fetchpool <url>...");
    }

    let cfg = Config::load()?;
    let connector = TcpConnector::new(cfg.pool.connect_timeout());
    let mut pool = Pool::new(cfg.pool, connector);

    let streams: Vec<_> = urls.iter().map(|url| pool.addurl(url, "", false)).collect();

    tokio::select! {
        _ = pool.run_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
    pool.close_all();

    let mut failed = 0;
    let mut out = std::io::stdout().lock();
    for stream in &streams {
        match stream.error() {
            Some(err) => {
                failed += 1;
                tracing::error!(url = stream.url(), code = err.code(), error = %err, "Failed");
            }
            None => {
                tracing::info!(url = stream.url(), status = ?stream.status(), "Retrieved");
                out.write_all(&stream.take_body())
                    .context("writing to stdout")?;
            }
        }
    }
    out.flush().context("writing to stdout")?;

    if failed > 0 {
        anyhow::bail!("{} of {} requests failed", failed, streams.len());
    }
    Ok(())
}
