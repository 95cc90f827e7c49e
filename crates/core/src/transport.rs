//! Play/pause/stop/seek, measured against a shared [`Clock`].
//!
//! The transport never reads position back from the audio side. While
//! playing, position is `now - reference_time`; otherwise it is the stored
//! `paused_offset`. Starting and stopping voices goes through a
//! [`VoiceDeck`], which the session implements over the mixer.

use rehearse_transport::Clock;
use tracing::{debug, info, warn};

/// What the transport drives.
pub trait VoiceDeck {
    type Error;

    fn loaded_count(&self) -> usize;

    /// Start every loaded track so that `offset` seconds into it sounds at
    /// clock time `at`. Returns how many voices started.
    fn start_all(&mut self, offset: f64, at: f64) -> usize;

    /// Silence every voice. On error nothing was stopped and the transport
    /// keeps its state.
    fn stop_all(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportState {
    /// Clock time at which track time 0 sounded. Only set while playing.
    pub reference_time: Option<f64>,
    pub paused_offset: f64,
    pub is_playing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started { voices: usize },
    AlreadyPlaying,
    /// No track has a decoded buffer; the transport did not move.
    NothingLoaded,
    /// The load did not settle in time and nothing had loaded by then.
    LoadTimeout,
}

impl PlayOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, PlayOutcome::Started { .. } | PlayOutcome::AlreadyPlaying)
    }
}

pub struct TransportClock<C> {
    clock: C,
    state: TransportState,
    playback: PlaybackState,
}

impl<C: Clock> TransportClock<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            state: TransportState::default(),
            playback: PlaybackState::Stopped,
        }
    }

    pub fn play(&mut self, deck: &mut impl VoiceDeck) -> PlayOutcome {
        if self.playback.is_playing() {
            debug!("play ignored, already playing");
            return PlayOutcome::AlreadyPlaying;
        }
        if deck.loaded_count() == 0 {
            warn!("play requested with no loaded tracks");
            return PlayOutcome::NothingLoaded;
        }

        let now = self.clock.now();
        let offset = self.state.paused_offset;
        self.state.reference_time = Some(now - offset);
        self.state.is_playing = true;
        self.playback = PlaybackState::Playing;

        let voices = deck.start_all(offset, now);
        info!(offset, voices, "playing");
        PlayOutcome::Started { voices }
    }

    pub fn pause<D: VoiceDeck>(&mut self, deck: &mut D) -> Result<(), D::Error> {
        if !self.playback.is_playing() {
            return Ok(());
        }

        let offset = self.current_time();
        deck.stop_all()?;
        self.state.paused_offset = offset;
        self.state.reference_time = None;
        self.state.is_playing = false;
        self.playback = PlaybackState::Paused;
        debug!(offset, "paused");
        Ok(())
    }

    pub fn stop<D: VoiceDeck>(&mut self, deck: &mut D) -> Result<(), D::Error> {
        deck.stop_all()?;
        self.state = TransportState::default();
        self.playback = PlaybackState::Stopped;
        Ok(())
    }

    /// Jump to `time` seconds. Playing resumes from there; paused and stopped
    /// stay where they are, at the new position.
    pub fn seek<D: VoiceDeck>(&mut self, time: f64, deck: &mut D) -> Result<(), D::Error> {
        let target = if time.is_finite() { time.max(0.0) } else { 0.0 };
        let previous = self.playback;

        self.stop(deck)?;
        self.state.paused_offset = target;
        match previous {
            PlaybackState::Playing => {
                self.play(deck);
            }
            PlaybackState::Paused => self.playback = PlaybackState::Paused,
            PlaybackState::Stopped => {}
        }
        debug!(target, "seek");
        Ok(())
    }

    pub fn current_time(&self) -> f64 {
        self.position_at(self.clock.now())
    }

    /// Transport position at clock time `now`.
    pub fn position_at(&self, now: f64) -> f64 {
        match self.state.reference_time {
            Some(reference) if self.state.is_playing => (now - reference).max(0.0),
            _ => self.state.paused_offset,
        }
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
