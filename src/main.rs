use std::sync::Arc;

use anyhow::Context;
use redis_monitor::config::MonitorConfig;
use redis_monitor::monitor::{ChannelObserver, HubDirectory, TcpMonitorConnector};
use redis_monitor::observability::init_tracing;
use tracing::{info, warn};

const OBSERVER_ID: &str = "stdout";
const OBSERVER_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = MonitorConfig::new(std::env::args()).context("invalid command line")?;

    let connector =
        TcpMonitorConnector::new().with_instance(&config.instance_id, config.connection.clone());
    let directory = HubDirectory::new(Arc::new(connector), config.hub.clone());

    let (observer, mut receiver) = ChannelObserver::new(OBSERVER_ID, OBSERVER_CAPACITY);
    directory.subscribe(&config.instance_id, observer.clone()).await;

    info!(
        instance_id = %config.instance_id,
        address = %config.connection.address(),
        "monitoring"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, unsubscribing");
                directory.unsubscribe(&config.instance_id, OBSERVER_ID).await;
                break;
            }
            batch = receiver.recv() => {
                let Some(batch) = batch else {
                    break;
                };

                for event in &batch {
                    println!("{}", event.to_json().context("failed to encode event")?);
                }

                if batch.iter().any(|event| event.is_error()) {
                    warn!("monitor stream ended");
                    break;
                }
            }
        }
    }

    Ok(())
}
