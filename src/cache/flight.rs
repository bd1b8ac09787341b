//! In-flight generations shared between concurrent requests for the same key.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{keys::CacheKey, payload::CachedPayload};
use crate::{
    domain::progress::ProgressEvent,
    source::{Fingerprint, SourceError},
};

pub(crate) const PROGRESS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Source(Arc<SourceError>),
    #[error("layer generation failed: {0}")]
    Internal(String),
}

impl From<SourceError> for GenerationError {
    fn from(err: SourceError) -> Self {
        Self::Source(Arc::new(err))
    }
}

/// Where the payload handed to a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    MemoryHit,
    DiskHit,
    Miss,
    /// Joined a generation started by another request.
    Joined,
}

impl CacheStatus {
    /// Value of the `X-Cache` response header.
    pub fn header_value(self) -> &'static str {
        match self {
            Self::MemoryHit => "HIT",
            Self::DiskHit => "FILE-HIT",
            Self::Miss => "MISS",
            Self::Joined => "SHARED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Disk,
    Generated,
}

pub(crate) type FlightResult = Result<(Arc<CachedPayload>, Origin), GenerationError>;
pub(crate) type SharedFlight = Shared<BoxFuture<'static, FlightResult>>;

#[derive(Clone)]
pub(crate) struct Flight {
    pub(crate) id: u64,
    /// Source fingerprint the generation was started for.
    pub(crate) fingerprint: Fingerprint,
    pub(crate) result: SharedFlight,
    pub(crate) progress: broadcast::Sender<ProgressEvent>,
}

pub(crate) type FlightMap = Arc<DashMap<CacheKey, Flight>>;

/// Removes the flight entry when the generation task ends, panics included.
pub(crate) struct FlightGuard {
    pub(crate) key: CacheKey,
    pub(crate) id: u64,
    pub(crate) flights: FlightMap,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flights
            .remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

/// Handle generators use to report progress; sending never blocks or fails.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<broadcast::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub(crate) fn new(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}

/// Progress events of one flight as seen by one request.
#[derive(Debug)]
pub struct ProgressStream {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Next event; lagged events are skipped, `None` once the flight is over.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// A request attached to a running generation.
pub struct Pending {
    result: SharedFlight,
    progress: ProgressStream,
    leader: bool,
}

impl Pending {
    pub(crate) fn joined(flight: &Flight) -> Self {
        Self {
            result: flight.result.clone(),
            progress: ProgressStream {
                rx: flight.progress.subscribe(),
            },
            leader: false,
        }
    }

    /// The starting request, subscribed before the generation could emit anything.
    pub(crate) fn leader(result: SharedFlight, rx: broadcast::Receiver<ProgressEvent>) -> Self {
        Self {
            result,
            progress: ProgressStream { rx },
            leader: true,
        }
    }

    /// Whether this request started the generation.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub async fn wait(self) -> Result<(Arc<CachedPayload>, CacheStatus), GenerationError> {
        let leader = self.leader;
        let (payload, origin) = self.result.await?;
        Ok((payload, status_for(leader, origin)))
    }

    /// Separate the result from the progress events so both can be polled.
    pub fn into_parts(
        self,
    ) -> (
        BoxFuture<'static, Result<(Arc<CachedPayload>, CacheStatus), GenerationError>>,
        ProgressStream,
    ) {
        let leader = self.leader;
        let result = self.result;
        let future = Box::pin(async move {
            let (payload, origin) = result.await?;
            Ok((payload, status_for(leader, origin)))
        });
        (future, self.progress)
    }
}

fn status_for(leader: bool, origin: Origin) -> CacheStatus {
    match (leader, origin) {
        (false, _) => CacheStatus::Joined,
        (true, Origin::Disk) => CacheStatus::DiskHit,
        (true, Origin::Generated) => CacheStatus::Miss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{layer::LayerId, progress::ProgressPhase};

    #[test]
    fn header_values() {
        assert_eq!(CacheStatus::MemoryHit.header_value(), "HIT");
        assert_eq!(CacheStatus::DiskHit.header_value(), "FILE-HIT");
        assert_eq!(CacheStatus::Miss.header_value(), "MISS");
        assert_eq!(CacheStatus::Joined.header_value(), "SHARED");
    }

    #[test]
    fn joiners_are_reported_as_shared() {
        assert_eq!(status_for(false, Origin::Generated), CacheStatus::Joined);
        assert_eq!(status_for(true, Origin::Disk), CacheStatus::DiskHit);
        assert_eq!(status_for(true, Origin::Generated), CacheStatus::Miss);
    }

    #[tokio::test]
    async fn progress_stream_ends_when_senders_drop() {
        let (tx, rx) = broadcast::channel(PROGRESS_CAPACITY);
        let mut stream = ProgressStream { rx };
        let sink = ProgressSink::new(tx);
        sink.emit(ProgressEvent::phase(LayerId(1), ProgressPhase::Done, 1, Some(1)));
        drop(sink);

        let event = stream.next().await.unwrap();
        assert_eq!(event.phase, ProgressPhase::Done);
        assert!(stream.next().await.is_none());

        ProgressSink::disabled().emit(event);
    }
}
