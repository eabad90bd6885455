use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use filebox_channel::{MqttSettings, drain_dead_letters};
use filebox_config::{AppConfig, Transport};
use filebox_store::{FileRecord, HashStore};

/// How long the dead-letter session stays quiet before draining stops.
const DEAD_LETTER_IDLE: Duration = Duration::from_secs(2);

pub(crate) fn print_records(config: &AppConfig, json: bool) -> Result<()> {
    let store = HashStore::open(&config.store.path)
        .with_context(|| format!("failed to open {} (is a consumer running?)", config.store.path))?;
    let records = store.records();

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    print!("{}", render_records(&records));
    Ok(())
}

fn render_records(records: &[FileRecord]) -> String {
    if records.is_empty() {
        return "no records\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        let name = if record.file_name.is_empty() {
            "<unbound>"
        } else {
            record.file_name.as_str()
        };
        out.push_str(&format!("{}  {}\n", record.file_hash, name));
    }
    out.push_str(&format!("{} record(s)\n", records.len()));
    out
}

pub(crate) async fn print_dead_letters(config: &AppConfig) -> Result<()> {
    let queue = config.consumer.dead_letter_queue.as_str();
    if queue.is_empty() {
        bail!("no dead-letter queue is configured");
    }
    if config.broker.transport == Transport::Memory {
        bail!("the memory transport keeps no dead letters between runs");
    }

    let settings = MqttSettings::from_config(&config.broker)?;
    let bodies = drain_dead_letters(&settings, queue, DEAD_LETTER_IDLE)
        .await
        .with_context(|| format!("unable to read dead letters from {}", config.broker.url))?;
    for body in &bodies {
        println!("{body}");
    }
    println!("{} dead letter(s) from '{queue}'", bodies.len());
    Ok(())
}

pub(crate) async fn print_hash(config: &AppConfig, file: &Path) -> Result<()> {
    let hash = filebox_consumer::hash_file(file, config.consumer.chunk_size)
        .await
        .with_context(|| format!("unable to hash {}", file.display()))?;
    println!("{hash}  {}", file.display());
    Ok(())
}
