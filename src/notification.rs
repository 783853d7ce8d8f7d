//! Bounded notification exchanges
//!
//! Both exchanges subscribe, issue one triggering write, poll a one-slot
//! buffer once per tick and unsubscribe on every exit path. A single-shot
//! exchange returns the first payload; a stream hands every payload to a
//! classifier until it reports `Finished`, `AbortError`, or time runs out.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::error::CrownstoneError;

/// Verdict of a classifier on one stream payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Continue,
    Finished,
    AbortError,
}

/// Decides how a notification stream proceeds.
///
/// The engine never re-issues work: if more payloads are needed after a
/// `Continue`, the classifier triggers them itself, e.g. by writing the
/// next chunk over `connection`.
#[async_trait]
pub trait NotificationClassifier: Send {
    async fn classify(
        &mut self,
        payload: &[u8],
        connection: &ConnectionManager,
    ) -> Result<ProcessType, CrownstoneError>;
}

/// The write that starts an exchange.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    /// Encrypt the write and decrypt the notifications it triggers.
    pub encrypted: bool,
}

type Slot = Arc<Mutex<Option<Vec<u8>>>>;

fn take(slot: &Slot) -> Option<Vec<u8>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Number of ticks after which `timeout` has elapsed.
fn tick_bound(timeout: Duration, tick: Duration) -> u128 {
    timeout.as_nanos().div_ceil(tick.as_nanos().max(1))
}

pub struct NotificationStreamEngine {
    connection: Arc<ConnectionManager>,
    tick: Duration,
    single_shot_max_ticks: u32,
}

impl NotificationStreamEngine {
    pub fn new(connection: Arc<ConnectionManager>, config: &EngineConfig) -> Self {
        Self {
            connection,
            tick: config.notification_tick,
            single_shot_max_ticks: config.single_shot_max_ticks,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Write `command` and return the first notification on `characteristic`.
    pub async fn single_shot(
        &self,
        characteristic: Uuid,
        command: WriteCommand,
    ) -> Result<Vec<u8>, CrownstoneError> {
        let slot = self.subscribe(characteristic).await?;
        let result = self.poll_single_shot(&slot, &command).await;
        self.release(characteristic).await;
        result
    }

    /// Write `command` and feed every notification on `characteristic` to
    /// `classifier` until it finishes or `timeout` worth of ticks elapse.
    pub async fn stream<C>(
        &self,
        characteristic: Uuid,
        command: WriteCommand,
        classifier: &mut C,
        timeout: Duration,
    ) -> Result<(), CrownstoneError>
    where
        C: NotificationClassifier + ?Sized,
    {
        let slot = self.subscribe(characteristic).await?;
        let result = self.poll_stream(&slot, &command, classifier, timeout).await;
        self.release(characteristic).await;
        result
    }

    async fn poll_single_shot(
        &self,
        slot: &Slot,
        command: &WriteCommand,
    ) -> Result<Vec<u8>, CrownstoneError> {
        self.write(command).await?;
        for _ in 0..self.single_shot_max_ticks {
            tokio::time::sleep(self.tick).await;
            if let Some(raw) = take(slot) {
                return self.connection.decode(&raw, command.encrypted);
            }
        }
        Err(CrownstoneError::NoNotificationData)
    }

    async fn poll_stream<C>(
        &self,
        slot: &Slot,
        command: &WriteCommand,
        classifier: &mut C,
        timeout: Duration,
    ) -> Result<(), CrownstoneError>
    where
        C: NotificationClassifier + ?Sized,
    {
        let bound = tick_bound(timeout, self.tick);
        self.write(command).await?;

        let mut elapsed: u128 = 0;
        while elapsed < bound {
            tokio::time::sleep(self.tick).await;
            elapsed += 1;

            // Taking the payload empties the slot, so anything the
            // classifier triggers lands in a fresh buffer.
            let Some(raw) = take(slot) else {
                continue;
            };
            let payload = self.connection.decode(&raw, command.encrypted)?;
            match classifier.classify(&payload, &self.connection).await? {
                ProcessType::Continue => {}
                ProcessType::Finished => return Ok(()),
                ProcessType::AbortError => {
                    return Err(CrownstoneError::StreamAborted { payload });
                }
            }
        }
        Err(CrownstoneError::StreamTimeout(timeout))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<Slot, CrownstoneError> {
        let slot: Slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        self.connection
            .subscribe_notifications(
                characteristic,
                Arc::new(move |value: &[u8]| {
                    *sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.to_vec());
                }),
            )
            .await?;
        Ok(slot)
    }

    async fn write(&self, command: &WriteCommand) -> Result<(), CrownstoneError> {
        self.connection
            .write(
                command.service,
                command.characteristic,
                &command.payload,
                command.encrypted,
            )
            .await
    }

    async fn release(&self, characteristic: Uuid) {
        if let Err(e) = self.connection.unsubscribe_notifications(characteristic).await {
            log::warn!("Failed to unsubscribe from {}: {}", characteristic, e);
        }
    }
}
