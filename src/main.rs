use anyhow::Result;
use live_quote_client::{
    ClientConfig, ClientSnapshot, ConnectionState, StreamingQuoteClient, utils,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::init_logging();

    let client = StreamingQuoteClient::new(ClientConfig::from_env()?);
    let config = client.config();
    tracing::info!(
        endpoint = %config.endpoint,
        symbol = %config.symbol,
        max_attempts = config.reconnect.max_attempts,
        "[INIT] live-quote-client starting"
    );

    let (session, mut snapshots) = client.activate_watch()?;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                tracing::info!("[INIT] interrupt received, shutting down");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                log_snapshot(&config.symbol, &snapshot);
                if snapshot.connection_state == ConnectionState::Failed {
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn log_snapshot(symbol: &str, snapshot: &ClientSnapshot) {
    match snapshot.last_observation {
        Some(obs) => tracing::info!(
            symbol,
            price = obs.price(),
            at = %obs.local_display(),
            state = snapshot.connection_state.as_str(),
            status = snapshot.status_label(),
            "[QUOTE] tick"
        ),
        None => tracing::info!(
            symbol,
            state = snapshot.connection_state.as_str(),
            status = snapshot.status_label(),
            "[QUOTE] waiting for first tick"
        ),
    }
}
