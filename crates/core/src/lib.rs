pub mod config;
pub mod error;
pub mod loader;
pub mod meter;
pub mod session;
pub mod solo;
pub mod transport;
pub mod voice;

#[cfg(test)]
mod test_support;

pub use config::SessionConfig;
pub use error::{PlaybackStartError, SessionError, TrackLoadError};
pub use loader::{
    FsPersistence, LoadCoordinator, MemoryPersistence, PendingLoad, Persistence, SessionLoadReport,
};
pub use meter::{LevelMeter, display_level};
pub use session::{Session, SessionState};
pub use solo::gate_gains;
pub use transport::{PlayOutcome, PlaybackState, TransportClock, TransportState, VoiceDeck};
pub use voice::TrackVoice;

pub use rehearse_engine::{EngineConfig, Mixer};
pub use rehearse_transport::{AudioArc, BALANCE_MAX, Clock, Track, TrackId, VOLUME_MAX};
