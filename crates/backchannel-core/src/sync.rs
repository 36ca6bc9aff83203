//! Incremental feed synchronization
//!
//! The platform only offers "fetch the newest N records" with no cursor or
//! since-parameter. [`SyncEngine`] turns that into a live new-record feed
//! with a linear, self-terminating probe: grow the requested window one
//! record at a time until the oldest record in the window is already known
//! (or the start of history is reached), then emit the newer remainder.
//! Cost is proportional to the number of genuinely new records per tick,
//! not to total channel history.
//!
//! Records from all monitored mirrors are pooled per tick. The engine does
//! NOT sort the pool; consumers sort by timestamp before order-sensitive
//! processing (see [`crate::transport::sort_by_timestamp`]).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::ChannelResult;
use crate::transport::{MirrorId, Record, Transport};

/// Grow-only set of record ids already delivered to the consumer.
///
/// This is the "already seen" boundary for the probe. It grows
/// monotonically and never shrinks; membership is O(1).
#[derive(Debug, Default)]
pub struct MessageLog {
    ids: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record id has already been delivered.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Mark a batch of records as delivered.
    pub fn record(&mut self, records: &[Record]) {
        for record in records {
            self.ids.insert(record.id.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Consumer of pooled record batches.
///
/// Returning `true` from `on_batch` halts the polling loop; the halting
/// batch is not recorded to the log.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn on_batch(&self, records: Vec<Record>) -> bool;
}

/// Live feed over one or more redundant mirror channels.
pub struct SyncEngine<T> {
    transport: Arc<T>,
    mirrors: Vec<MirrorId>,
    config: SyncConfig,
    cancel: CancellationToken,
    log: MessageLog,
}

impl<T: Transport> SyncEngine<T> {
    /// Create an engine with an empty delivery log.
    ///
    /// The cancellation token is passed in explicitly; cancelling it stops
    /// the loop cooperatively, observed once per tick. A caller relying on
    /// immediate termination must tolerate up to one in-flight poll cycle.
    pub fn new(
        transport: Arc<T>,
        mirrors: Vec<MirrorId>,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            mirrors,
            config,
            cancel,
            log: MessageLog::new(),
        }
    }

    /// Fetch the full visible history of every monitored mirror, seed the
    /// delivery log with it, and return the records.
    ///
    /// Run once before the live loop: without the seed, the entire channel
    /// backlog would be re-delivered as "new" on startup. The returned
    /// records let the caller render the backlog first if it wants to.
    pub async fn read_history(&mut self) -> ChannelResult<Vec<Record>> {
        let mut history = Vec::new();

        for mirror in &self.mirrors {
            let batch = self
                .transport
                .fetch(mirror, self.config.fetch_limit)
                .await?;
            history.extend(batch);
            tokio::time::sleep(self.config.fetch_delay).await;
        }

        self.log.record(&history);
        debug!(records = history.len(), "Seeded message log from history");
        Ok(history)
    }

    /// Probe every mirror once and pool the not-yet-delivered records.
    ///
    /// Per mirror: request `n + 1` newest records, starting at `n = 0`.
    /// If fewer than requested come back, history is exhausted and the whole
    /// batch is new. Otherwise inspect the oldest record of the batch: if it
    /// is already in the log, the newer `n` records are new and the probe
    /// stops; if not, grow the window and refetch.
    ///
    /// Does not update the delivery log; callers record the batch after the
    /// sink has accepted it.
    pub async fn poll_once(&self) -> ChannelResult<Vec<Record>> {
        let mut pooled = Vec::new();

        for mirror in &self.mirrors {
            let mut probe = 0usize;

            loop {
                let batch = self.transport.fetch(mirror, probe + 1).await?;

                if batch.len() <= probe {
                    // Start of history reached: everything returned is new
                    pooled.extend(batch);
                    break;
                }

                if self.log.contains(&batch[probe].id) {
                    // Oldest record already delivered; the newer ones are new
                    pooled.extend(batch.into_iter().take(probe));
                    break;
                }

                probe += 1;
                tokio::time::sleep(self.config.fetch_delay).await;
            }
        }

        Ok(pooled)
    }

    /// Run the live poll loop until cancelled or the sink halts it.
    ///
    /// Transport failures during a tick are logged and the loop carries on;
    /// the feed is noisy by construction and a failed poll is not fatal.
    pub async fn run(&mut self, sink: &dyn RecordSink) -> ChannelResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Sync loop cancelled");
                return Ok(());
            }

            match self.poll_once().await {
                Ok(batch) => {
                    if !batch.is_empty() {
                        debug!(records = batch.len(), "Dispatching new records");
                        if sink.on_batch(batch.clone()).await {
                            debug!("Sink requested halt");
                            return Ok(());
                        }
                        self.log.record(&batch);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Poll tick failed; retrying next tick");
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Records delivered so far.
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Mark records as delivered without dispatching them.
    pub fn record_delivered(&mut self, records: &[Record]) {
        self.log.record(records);
    }
}
