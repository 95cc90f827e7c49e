//! Concurrent per-track loading.
//!
//! A load is split in two so that the session stays usable while bytes are
//! fetched and decoded: [`LoadCoordinator::begin`] bumps the generation and
//! hands out a [`PendingLoad`], which owns everything it needs and can be
//! awaited anywhere. Each track's result is posted back as soon as it settles,
//! tagged with the generation it belongs to; results from a superseded
//! generation are dropped when the session drains them.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use rehearse_decode::{decode_bytes, extension_hint};
use rehearse_transport::{AudioArc, Track, TrackId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TrackLoadError;

/// Where track bytes come from. Implemented by the host.
pub trait Persistence {
    /// Primary tier: the bytes behind a track's source reference, or `None`
    /// when the reference is stale, expired or unknown.
    fn resolve(&self, reference: &str) -> impl Future<Output = Option<Vec<u8>>>;

    /// Secondary tier: bytes cached under the track's id.
    fn get_bytes(&self, id: TrackId) -> impl Future<Output = Option<Vec<u8>>>;
}

/// Host-populated in-memory byte store.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    sources: HashMap<String, Vec<u8>>,
    cache: HashMap<TrackId, Vec<u8>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, reference: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.sources.insert(reference.into(), bytes);
        self
    }

    pub fn with_cached(mut self, id: TrackId, bytes: Vec<u8>) -> Self {
        self.cache.insert(id, bytes);
        self
    }
}

impl Persistence for MemoryPersistence {
    async fn resolve(&self, reference: &str) -> Option<Vec<u8>> {
        self.sources.get(reference).cloned()
    }

    async fn get_bytes(&self, id: TrackId) -> Option<Vec<u8>> {
        self.cache.get(&id).cloned()
    }
}

/// Reads sources from disk. A reference is tried as a path first, then
/// relative to `sample_root`. The cache tier reads `<cache_dir>/<track id>`.
#[derive(Debug, Clone, Default)]
pub struct FsPersistence {
    sample_root: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

impl FsPersistence {
    pub fn new(sample_root: Option<PathBuf>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            sample_root,
            cache_dir,
        }
    }

    fn candidates(&self, reference: &str) -> Vec<PathBuf> {
        let path = Path::new(reference);
        let mut candidates = vec![path.to_path_buf()];
        if let Some(root) = &self.sample_root {
            if path.is_relative() {
                candidates.push(root.join(path));
            }
        }
        candidates
    }
}

impl Persistence for FsPersistence {
    async fn resolve(&self, reference: &str) -> Option<Vec<u8>> {
        for candidate in self.candidates(reference) {
            if let Ok(bytes) = tokio::fs::read(&candidate).await {
                return Some(bytes);
            }
        }
        None
    }

    async fn get_bytes(&self, id: TrackId) -> Option<Vec<u8>> {
        let dir = self.cache_dir.as_ref()?;
        tokio::fs::read(dir.join(id.to_string())).await.ok()
    }
}

/// Outcome of one load, in track order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionLoadReport {
    pub generation: u64,
    pub loaded_ids: Vec<TrackId>,
    pub failed_ids: Vec<TrackId>,
    /// Failure reasons, parallel to `failed_ids`.
    pub errors: Vec<String>,
}

impl SessionLoadReport {
    pub fn loaded_count(&self) -> usize {
        self.loaded_ids.len()
    }

    pub fn error_for(&self, id: TrackId) -> Option<&str> {
        let idx = self.failed_ids.iter().position(|f| *f == id)?;
        self.errors.get(idx).map(String::as_str)
    }
}

pub(crate) enum LoadEvent {
    Track {
        generation: u64,
        slot: usize,
        result: Result<AudioArc, TrackLoadError>,
    },
    Settled {
        generation: u64,
        report: SessionLoadReport,
    },
    /// The load was dropped before every track settled.
    Abandoned { generation: u64 },
}

impl LoadEvent {
    fn generation(&self) -> u64 {
        match self {
            LoadEvent::Track { generation, .. }
            | LoadEvent::Settled { generation, .. }
            | LoadEvent::Abandoned { generation } => *generation,
        }
    }
}

pub struct LoadCoordinator<P> {
    persistence: Arc<P>,
    target_sample_rate: u32,
    generation: u64,
    events_tx: mpsc::UnboundedSender<LoadEvent>,
    events_rx: mpsc::UnboundedReceiver<LoadEvent>,
}

impl<P: Persistence> LoadCoordinator<P> {
    pub fn new(persistence: Arc<P>, target_sample_rate: u32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            persistence,
            target_sample_rate,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new generation. Anything still in flight for older
    /// generations will be discarded on arrival.
    pub fn begin(&mut self, tracks: &[Track]) -> PendingLoad<P> {
        self.generation += 1;
        debug!(generation = self.generation, tracks = tracks.len(), "load started");

        PendingLoad {
            persistence: Arc::clone(&self.persistence),
            generation: self.generation,
            tracks: tracks.to_vec(),
            target_sample_rate: self.target_sample_rate,
            events: self.events_tx.clone(),
            settled: false,
        }
    }

    /// Next result belonging to the current generation.
    pub(crate) fn next_event(&mut self) -> Option<LoadEvent> {
        loop {
            let event = self.events_rx.try_recv().ok()?;
            if event.generation() == self.generation {
                return Some(event);
            }
            debug!(
                stale = event.generation(),
                current = self.generation,
                "dropping result from superseded load"
            );
        }
    }
}

/// An in-flight load. Drive it with [`PendingLoad::run`].
///
/// Dropping it, or the future returned by `run`, before it resolves tells
/// the session the load is over; tracks that already arrived stay loaded.
pub struct PendingLoad<P> {
    persistence: Arc<P>,
    generation: u64,
    tracks: Vec<Track>,
    target_sample_rate: u32,
    events: mpsc::UnboundedSender<LoadEvent>,
    settled: bool,
}

impl<P: Persistence> PendingLoad<P> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fetch and decode every track concurrently. Resolves once every
    /// attempt has settled; individual failures only exclude their track.
    pub async fn run(mut self) -> SessionLoadReport {
        let attempts = self.tracks.iter().enumerate().map(|(slot, track)| {
            let persistence = self.persistence.as_ref();
            let events = &self.events;
            let generation = self.generation;
            let target_sample_rate = self.target_sample_rate;
            async move {
                let result = load_track(persistence, track, target_sample_rate).await;
                let summary = match &result {
                    Ok(audio) => {
                        debug!(track = %track.id, ?audio, "track decoded");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(track = %track.id, name = %track.name, "track failed to load: {e}");
                        Err(e.to_string())
                    }
                };
                // the session may be gone; the report still goes to the caller
                let _ = events.send(LoadEvent::Track {
                    generation,
                    slot,
                    result,
                });
                (track.id, summary)
            }
        });

        let mut report = SessionLoadReport {
            generation: self.generation,
            ..Default::default()
        };
        for (id, summary) in join_all(attempts).await {
            match summary {
                Ok(()) => report.loaded_ids.push(id),
                Err(reason) => {
                    report.failed_ids.push(id);
                    report.errors.push(reason);
                }
            }
        }

        info!(
            generation = self.generation,
            loaded = report.loaded_ids.len(),
            failed = report.failed_ids.len(),
            "load settled"
        );
        let _ = self.events.send(LoadEvent::Settled {
            generation: self.generation,
            report: report.clone(),
        });
        self.settled = true;
        report
    }
}

impl<P> Drop for PendingLoad<P> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(generation = self.generation, "load dropped before settling");
        let _ = self.events.send(LoadEvent::Abandoned {
            generation: self.generation,
        });
    }
}

async fn fetch_bytes<P: Persistence>(persistence: &P, track: &Track) -> Option<Vec<u8>> {
    if let Some(bytes) = persistence.resolve(&track.source).await {
        if !bytes.is_empty() {
            return Some(bytes);
        }
    }
    debug!(track = %track.id, source = %track.source, "source unavailable, trying byte cache");
    persistence
        .get_bytes(track.id)
        .await
        .filter(|bytes| !bytes.is_empty())
}

async fn load_track<P: Persistence>(
    persistence: &P,
    track: &Track,
    target_sample_rate: u32,
) -> Result<AudioArc, TrackLoadError> {
    let bytes = fetch_bytes(persistence, track)
        .await
        .ok_or_else(|| TrackLoadError::Missing {
            id: track.id,
            source_ref: track.source.clone(),
        })?;

    let audio = decode_bytes(bytes, extension_hint(&track.source)).map_err(|source| {
        TrackLoadError::Decode {
            id: track.id,
            source,
        }
    })?;

    audio
        .resample(target_sample_rate)
        .map_err(|source| TrackLoadError::Resample {
            id: track.id,
            source,
        })
}
