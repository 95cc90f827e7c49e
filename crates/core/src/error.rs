use rehearse_transport::TrackId;

/// Errors surfaced by [`Session`](crate::Session) operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The mixing graph or output device could not be created. Fatal.
    #[error("audio engine unavailable: {0}")]
    Initialization(#[source] anyhow::Error),

    #[error("no track with id {0} in this session")]
    UnknownTrack(TrackId),

    #[error("session has been disposed")]
    Disposed,

    /// The mixer has not drained enough commands to take this one. Nothing
    /// was changed; retry after the next audio block.
    #[error("mixer command queue full")]
    QueueFull,
}

/// Why one track was left out of a session. Never fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum TrackLoadError {
    #[error("no bytes for track {id}: source '{source_ref}' unavailable and nothing cached")]
    Missing { id: TrackId, source_ref: String },

    #[error("failed to decode track {id}: {source}")]
    Decode {
        id: TrackId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to resample track {id}: {source}")]
    Resample {
        id: TrackId,
        #[source]
        source: anyhow::Error,
    },
}

impl TrackLoadError {
    pub fn track_id(&self) -> TrackId {
        match self {
            TrackLoadError::Missing { id, .. }
            | TrackLoadError::Decode { id, .. }
            | TrackLoadError::Resample { id, .. } => *id,
        }
    }
}

/// A voice could not be handed to the mixer. The track stays silent, the
/// other tracks are unaffected.
#[derive(Debug, thiserror::Error)]
#[error("failed to start voice for track {id}: {source}")]
pub struct PlaybackStartError {
    pub id: TrackId,
    #[source]
    pub source: anyhow::Error,
}
