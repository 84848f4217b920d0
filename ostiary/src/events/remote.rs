//! Forwarding of security events to a remote collector

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{SecurityEvent, SecurityEventSink};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for a [`RemoteSink`]
#[derive(Clone, Debug)]
pub struct RemoteSinkConfig {
    endpoint: reqwest::Url,
    batch_size: usize,
    queue_capacity: usize,
    flush_interval: Duration,
}

impl RemoteSinkConfig {
    /// Constructs a configuration posting batches to `endpoint`
    ///
    /// Uses batches of up to 50 events, a queue of 1000 events, and flushes
    /// partial batches every 2 seconds.
    pub fn new(endpoint: reqwest::Url) -> Self {
        Self {
            endpoint,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    /// Sets the maximum number of events per request
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets how many events may wait for delivery before new ones are dropped
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    /// Sets how often a partial batch is flushed
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [SecurityEvent],
}

/// A sink that ships events to a remote collector in the background
///
/// Logging only enqueues. When the queue is full the event is dropped, so
/// a slow or unreachable collector never stalls the session controller.
#[derive(Clone, Debug)]
pub struct RemoteSink {
    sender: mpsc::Sender<SecurityEvent>,
}

impl RemoteSink {
    /// Spawns the delivery task onto the current Tokio runtime
    pub fn spawn(client: reqwest::Client, config: RemoteSinkConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        tokio::spawn(deliver_forever(client, config, receiver));
        Self { sender }
    }
}

impl SecurityEventSink for RemoteSink {
    fn log(&self, event: SecurityEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    event_type = event.kind().as_str(),
                    "remote security event queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("remote security event delivery has stopped");
            }
        }
    }
}

async fn deliver_forever(
    client: reqwest::Client,
    config: RemoteSinkConfig,
    mut receiver: mpsc::Receiver<SecurityEvent>,
) {
    let mut batch = Vec::with_capacity(config.batch_size);
    let mut flush = tokio::time::interval(config.flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= config.batch_size {
                        send_batch(&client, &config.endpoint, &mut batch).await;
                    }
                }
                None => {
                    send_batch(&client, &config.endpoint, &mut batch).await;
                    tracing::debug!("all remote sink handles dropped, halting delivery");
                    return;
                }
            },
            _ = flush.tick() => {
                send_batch(&client, &config.endpoint, &mut batch).await;
            }
        }
    }
}

async fn send_batch(client: &reqwest::Client, endpoint: &reqwest::Url, batch: &mut Vec<SecurityEvent>) {
    if batch.is_empty() {
        return;
    }

    let result = client
        .post(endpoint.clone())
        .json(&EventBatch {
            events: batch.as_slice(),
        })
        .send()
        .await
        .and_then(|resp| resp.error_for_status());

    match result {
        Ok(_) => tracing::trace!(count = batch.len(), "delivered security events"),
        Err(error) => tracing::warn!(
            error = (&error as &dyn std::error::Error),
            count = batch.len(),
            "unable to deliver security events, dropping batch"
        ),
    }

    batch.clear();
}
