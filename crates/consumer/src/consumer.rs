use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use filebox_channel::{Delivery, DeliveryHandler, EventKind, FileEvent};
use filebox_config::{AckPolicy, ConsumerConfig};
use filebox_store::{HashStore, InsertOutcome};

use crate::classify::{AllowList, DEFAULT_PROCESSING_TOKEN, SizeTier, suffix};
use crate::error::ConsumerError;
use crate::hash::hash_file;

/// Terminal state of one processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// First copy of this content; the store now maps its hash to `path`.
    Registered { path: PathBuf, hash: String },
    /// Content already known; the file was renamed with the duplicate suffix.
    Duplicate { renamed: PathBuf, hash: String },
    /// A `deleted` event; `removed` tells whether a record went away.
    Removed { path: PathBuf, removed: bool },
    /// A `moved` or `modified` event, logged only.
    Logged { kind: EventKind, path: PathBuf },
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered { path, .. } => write!(f, "registered {}", path.display()),
            Self::Duplicate { renamed, .. } => write!(f, "duplicate renamed to {}", renamed.display()),
            Self::Removed { path, removed: true } => write!(f, "removed record for {}", path.display()),
            Self::Removed { path, removed: false } => write!(f, "no record for {}", path.display()),
            Self::Logged { kind, path } => write!(f, "logged {kind} {}", path.display()),
        }
    }
}

/// Running totals, reported when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub registered: u64,
    pub duplicates: u64,
    pub removed: u64,
    pub logged: u64,
    pub skipped: u64,
    pub abandoned: u64,
}

impl ConsumerStats {
    fn count(&mut self, outcome: &Result<Resolution, ConsumerError>) {
        self.received += 1;
        match outcome {
            Ok(Resolution::Registered { .. }) => self.registered += 1,
            Ok(Resolution::Duplicate { .. }) => self.duplicates += 1,
            Ok(Resolution::Removed { .. }) => self.removed += 1,
            Ok(Resolution::Logged { .. }) => self.logged += 1,
            Err(err) if err.is_expected() => self.skipped += 1,
            Err(_) => self.abandoned += 1,
        }
    }
}

/// Deduplicating consumer.  Sole writer of its [`HashStore`].
pub struct Consumer {
    store: HashStore,
    allow: AllowList,
    chunk_size: usize,
    duplicate_suffix: String,
    processing_unit: Duration,
    ack_policy: AckPolicy,
    dead_letter_queue: String,
    stats: ConsumerStats,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("store", &self.store)
            .field("ack_policy", &self.ack_policy)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Consumer {
    pub fn new(config: &ConsumerConfig, store: HashStore) -> Self {
        Self {
            store,
            allow: AllowList::new(config.supported_extensions.iter().cloned()),
            chunk_size: config.chunk_size,
            duplicate_suffix: config.duplicate_suffix.clone(),
            processing_unit: config.processing_unit(),
            ack_policy: config.ack_policy,
            dead_letter_queue: config.dead_letter_queue.clone(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn store(&self) -> &HashStore {
        &self.store
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Where abandoned messages go, if anywhere.
    pub fn dead_letter_queue(&self) -> Option<&str> {
        let used = self.ack_policy == AckPolicy::AfterResolve && !self.dead_letter_queue.is_empty();
        used.then_some(self.dead_letter_queue.as_str())
    }

    /// Take one message body from RECEIVED to RESOLVED.
    pub async fn process(&self, body: &str) -> Result<Resolution, ConsumerError> {
        // ── RECEIVED → HASHED ────────────────────────────────────────────
        let event = FileEvent::decode(body)?;
        let path = event.path().to_path_buf();

        let hash = match hash_file(&path, self.chunk_size).await {
            Ok(hash) => {
                info!(path = %path.display(), %hash, "file hashed");
                Some(hash)
            }
            // A deleted or moved-away file is expected to be gone.
            Err(err) if matches!(event.kind, EventKind::Deleted | EventKind::Moved) => {
                debug!(path = %path.display(), %err, "no content to hash");
                None
            }
            Err(source) => return Err(ConsumerError::Unreadable { path, source }),
        };

        // ── HASHED → CLASSIFIED ──────────────────────────────────────────
        if !self.allow.is_supported(&path) {
            return Err(ConsumerError::Unsupported {
                extension: suffix(&path).unwrap_or_default(),
                path,
            });
        }
        debug!(path = %path.display(), "file type is supported");

        // ── CLASSIFIED → RESOLVED ────────────────────────────────────────
        match (event.kind, hash) {
            (EventKind::Created, Some(hash)) => self.on_created(path, hash).await,
            (EventKind::Deleted, hash) => self.on_deleted(path, hash.as_deref()).await,
            (kind, _) => Ok(self.on_logged(kind, path, body)),
        }
    }

    async fn on_created(&self, path: PathBuf, hash: String) -> Result<Resolution, ConsumerError> {
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|source| ConsumerError::Unreadable {
                path: path.clone(),
                source,
            })?
            .len();
        let token = SizeTier::for_size(size).token();
        println!("[+] Received created event, processing time will be {token} seconds.");
        info!(path = %path.display(), size, token, "processing created event");

        let name = path.to_string_lossy().into_owned();
        let resolution = match self.store.insert_if_absent(&hash) {
            InsertOutcome::Inserted => {
                if !self.store.update_file_name(&hash, &name) {
                    return Err(ConsumerError::Store {
                        operation: "update_file_name",
                        hash,
                    });
                }
                Resolution::Registered { path, hash }
            }
            InsertOutcome::AlreadyPresent if self.is_registered_as(&hash, &name) => {
                debug!(path = %path.display(), "file already registered under its own name");
                Resolution::Registered { path, hash }
            }
            InsertOutcome::AlreadyPresent => {
                let renamed = duplicate_path(&path, &self.duplicate_suffix);
                tokio::fs::rename(&path, &renamed)
                    .await
                    .map_err(|source| ConsumerError::Rename {
                        from: path.clone(),
                        to: renamed.clone(),
                        source,
                    })?;
                info!(from = %path.display(), to = %renamed.display(), %hash, "renamed duplicate");
                Resolution::Duplicate { renamed, hash }
            }
            InsertOutcome::Failed => {
                return Err(ConsumerError::Store {
                    operation: "insert_if_absent",
                    hash,
                });
            }
        };

        self.simulate_processing(token).await;
        Ok(resolution)
    }

    async fn on_deleted(
        &self,
        path: PathBuf,
        hash: Option<&str>,
    ) -> Result<Resolution, ConsumerError> {
        let token = match tokio::fs::metadata(&path).await {
            Ok(meta) => Some(SizeTier::for_size(meta.len()).token()),
            Err(err) => {
                warn!(path = %path.display(), %err, "unable to get file size");
                None
            }
        };
        match token {
            Some(token) => {
                println!("[+] Received deleted event, processing time will be {token} seconds.")
            }
            None => println!("[+] Received deleted event, file is already gone."),
        }

        let mut removed = self.store.delete_by_name(&path.to_string_lossy());
        if let Some(hash) = hash {
            removed |= self.store.delete_by_hash(hash);
        }
        info!(path = %path.display(), removed, "processed deleted event");

        if let Some(token) = token {
            self.simulate_processing(token).await;
        }
        Ok(Resolution::Removed { path, removed })
    }

    fn on_logged(&self, kind: EventKind, path: PathBuf, body: &str) -> Resolution {
        println!(
            "[+] Received modified or moved event, processing time will be {DEFAULT_PROCESSING_TOKEN} seconds."
        );
        info!(message = %body, "received");
        Resolution::Logged { kind, path }
    }

    fn is_registered_as(&self, hash: &str, name: &str) -> bool {
        self.store
            .find_by_hash(hash)
            .is_some_and(|record| record.file_name == name)
    }

    async fn simulate_processing(&self, token: u64) {
        if self.processing_unit.is_zero() {
            return;
        }
        let factor = u32::try_from(token).unwrap_or(u32::MAX);
        tokio::time::sleep(self.processing_unit.saturating_mul(factor)).await;
    }
}

/// `path` with `suffix` appended to its final component.
pub fn duplicate_path(path: &Path, suffix: &str) -> PathBuf {
    let mut renamed = path.as_os_str().to_os_string();
    renamed.push(suffix);
    PathBuf::from(renamed)
}

#[async_trait]
impl DeliveryHandler for Consumer {
    async fn on_delivery(&mut self, mut delivery: Delivery) {
        let body = delivery.text().into_owned();

        if self.ack_policy == AckPolicy::OnReceive {
            if let Err(err) = delivery.ack().await {
                warn!(tag = delivery.tag(), %err, "failed to acknowledge message");
            }
        }

        let outcome = self.process(&body).await;
        self.stats.count(&outcome);

        match &outcome {
            Ok(resolution) => info!(message = %body, outcome = %resolution, "message resolved"),
            Err(err) if err.is_expected() => {
                info!(message = %body, reason = %err, "message skipped")
            }
            Err(err) => {
                error!(message = %body, stage = %err.stage(), %err, "message abandoned")
            }
        }

        if self.ack_policy != AckPolicy::AfterResolve {
            return;
        }
        let dead_letter = match &outcome {
            Err(err) if !err.is_expected() => self.dead_letter_queue(),
            _ => None,
        };
        let result = match dead_letter {
            Some(queue) => delivery.dead_letter(queue).await,
            None => delivery.ack().await,
        };
        if let Err(err) = result {
            warn!(tag = delivery.tag(), %err, "failed to settle message, it may be redelivered");
        }
    }
}
