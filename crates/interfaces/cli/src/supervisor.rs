//! Lifecycle of the watcher and consumer units.
//!
//! The supervisor is the only cancellation authority: on SIGINT/SIGTERM it
//! flips the shared shutdown flag, lets each unit close its own connection,
//! and joins both.

use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

use filebox_channel::{
    MemoryBroker, MqttSettings, MqttSubscriber, Publisher, ReconnectPolicy, Subscriber,
};
use filebox_config::{AppConfig, BrokerConfig, Transport};
use filebox_consumer::{Consumer, run_consumer};
use filebox_store::HashStore;
use filebox_watcher::{Notifier, connect_mqtt_publisher, run_watcher};

#[derive(Debug, Clone, Copy)]
enum Unit {
    Watcher,
    Consumer,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Watcher => "watcher",
            Self::Consumer => "consumer",
        })
    }
}

/// `filebox run`: both units in one process.
pub(crate) async fn run_all(config: AppConfig) -> Result<()> {
    let memory = (config.broker.transport == Transport::Memory).then(MemoryBroker::new);
    let policy = ReconnectPolicy::from_config(&config.reconnect);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut units = JoinSet::new();

    // The consumer connects first so its broker session exists before any
    // event is published.
    spawn_consumer(&mut units, &config, memory.as_ref(), &policy, shutdown_rx.clone()).await?;
    if let Err(err) =
        spawn_watcher(&mut units, &config, memory.as_ref(), &policy, shutdown_rx).await
    {
        let _ = shutdown_tx.send(true);
        while units.join_next().await.is_some() {}
        return Err(err);
    }

    supervise(units, shutdown_tx).await
}

/// `filebox watch`: the watcher alone, publishing to the broker.
pub(crate) async fn run_watch(config: AppConfig) -> Result<()> {
    ensure_shared_broker(&config.broker)?;
    let policy = ReconnectPolicy::from_config(&config.reconnect);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut units = JoinSet::new();
    spawn_watcher(&mut units, &config, None, &policy, shutdown_rx).await?;
    supervise(units, shutdown_tx).await
}

/// `filebox consume`: the consumer alone, reading from the broker.
pub(crate) async fn run_consume(config: AppConfig) -> Result<()> {
    ensure_shared_broker(&config.broker)?;
    let policy = ReconnectPolicy::from_config(&config.reconnect);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut units = JoinSet::new();
    spawn_consumer(&mut units, &config, None, &policy, shutdown_rx).await?;
    supervise(units, shutdown_tx).await
}

fn ensure_shared_broker(broker: &BrokerConfig) -> Result<()> {
    if broker.transport == Transport::Memory {
        bail!("the memory transport only works with both units in one process; use `filebox run`");
    }
    Ok(())
}

async fn spawn_consumer(
    units: &mut JoinSet<(Unit, Result<()>)>,
    config: &AppConfig,
    memory: Option<&MemoryBroker>,
    policy: &ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let store = HashStore::open(&config.store.path)
        .with_context(|| format!("failed to open hash store {}", config.store.path))?;
    info!(path = %store.path().display(), records = store.len(), "hash store ready");
    let mut consumer = Consumer::new(&config.consumer, store);

    let mut subscriber = connect_subscriber(&config.broker, memory).await?;
    println!(
        "[+] Consumer is now listening to queue '{}'...",
        config.broker.queue
    );

    let policy = policy.clone();
    units.spawn(async move {
        let result = run_consumer(subscriber.as_mut(), &mut consumer, &policy, shutdown).await;
        (Unit::Consumer, result)
    });
    Ok(())
}

async fn spawn_watcher(
    units: &mut JoinSet<(Unit, Result<()>)>,
    config: &AppConfig,
    memory: Option<&MemoryBroker>,
    policy: &ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let publisher = connect_publisher(&config.broker, memory).await?;
    let notifier = Notifier::new(publisher, policy.clone())
        .await
        .context("failed to declare the event queue")?;

    let watcher_config = config.watcher.clone();
    units.spawn(async move {
        let result = run_watcher(&watcher_config, notifier, shutdown).await;
        (Unit::Watcher, result)
    });
    Ok(())
}

async fn connect_subscriber(
    broker: &BrokerConfig,
    memory: Option<&MemoryBroker>,
) -> Result<Box<dyn Subscriber>> {
    match (broker.transport, memory) {
        (Transport::Memory, Some(memory)) => {
            let subscriber = memory.subscriber(&broker.queue)?;
            println!("[+] Consumer connected successfully to queue '{}'.", broker.queue);
            Ok(Box::new(subscriber))
        }
        (Transport::Memory, None) => Err(anyhow!("memory transport has no broker in this process")),
        (Transport::Mqtt, _) => {
            let settings = MqttSettings::from_config(broker)?;
            let subscriber = MqttSubscriber::connect(settings)
                .await
                .with_context(|| format!("consumer could not connect to {}", broker.url))?;
            Ok(Box::new(subscriber))
        }
    }
}

async fn connect_publisher(
    broker: &BrokerConfig,
    memory: Option<&MemoryBroker>,
) -> Result<Box<dyn Publisher>> {
    match (broker.transport, memory) {
        (Transport::Memory, Some(memory)) => {
            let publisher = memory.publisher(&broker.queue)?;
            println!("[+] Notifier connected successfully to queue '{}'.", broker.queue);
            Ok(Box::new(publisher))
        }
        (Transport::Memory, None) => Err(anyhow!("memory transport has no broker in this process")),
        (Transport::Mqtt, _) => {
            let settings = MqttSettings::from_config(broker)?;
            let publisher = connect_mqtt_publisher(settings)
                .await
                .with_context(|| format!("notifier could not connect to {}", broker.url))?;
            Ok(Box::new(publisher))
        }
    }
}

/// Wait for a termination signal or for a unit to stop on its own, then shut
/// everything down and join.  The first unit failure is returned.
async fn supervise(
    mut units: JoinSet<(Unit, Result<()>)>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let first = tokio::select! {
        signal = terminate_signal() => {
            signal?;
            println!("[!] Stopping on user request.");
            info!("termination signal received");
            None
        }
        joined = units.join_next() => joined,
    };

    let _ = shutdown_tx.send(true);
    let mut failure = None;
    if let Some(joined) = first {
        settle(joined, &mut failure);
    }
    while let Some(joined) = units.join_next().await {
        settle(joined, &mut failure);
    }

    match failure {
        Some(err) => {
            println!("[!] File Handler stopped running, please see log file for more details.");
            Err(err)
        }
        None => Ok(()),
    }
}

fn settle(joined: Result<(Unit, Result<()>), JoinError>, failure: &mut Option<anyhow::Error>) {
    match joined {
        Ok((unit, Ok(()))) => info!(%unit, "unit stopped"),
        Ok((unit, Err(err))) => {
            let detail = format!("{err:#}");
            error!(%unit, error = %detail, "unit failed");
            failure.get_or_insert(err.context(format!("{unit} failed")));
        }
        Err(err) => {
            error!(%err, "unit panicked");
            failure.get_or_insert(anyhow!(err));
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use filebox_store::Column;

    fn memory_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.broker.transport = Transport::Memory;
        config.watcher.source_dir = dir.join("box").to_string_lossy().into_owned();
        config.store.path = dir.join("consumer.redb").to_string_lossy().into_owned();
        config.consumer.processing_unit_ms = 0;
        config
    }

    #[tokio::test]
    async fn standalone_units_reject_memory_transport() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = memory_config(dir.path());
        assert!(run_watch(config.clone()).await.is_err());
        assert!(run_consume(config).await.is_err());
    }

    #[tokio::test]
    async fn supervised_units_dedup_end_to_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = memory_config(dir.path());
        let source = dir.path().join("box");
        std::fs::create_dir_all(&source).unwrap();

        let memory = MemoryBroker::new();
        let policy = ReconnectPolicy::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut units = JoinSet::new();
        spawn_consumer(&mut units, &config, Some(&memory), &policy, shutdown_rx.clone())
            .await
            .unwrap();
        spawn_watcher(&mut units, &config, Some(&memory), &policy, shutdown_rx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(source.join("a.txt"), b"hello").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(source.join("b.txt"), b"hello").unwrap();

        let renamed = source.join("b.txt_dup_#");
        tokio::time::timeout(Duration::from_secs(10), async {
            while !renamed.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        while let Some(joined) = units.join_next().await {
            let (_, result) = joined.unwrap();
            result.unwrap();
        }

        let store = HashStore::open(&config.store.path).unwrap();
        assert_eq!(store.len(), 1);
        let name = store.select_one(Column::FileName).unwrap();
        assert!(name.ends_with("a.txt"), "{name}");
    }
}
