use std::collections::HashMap;
use std::sync::Arc;

use rehearse_engine::{
    Command, DeviceClock, EngineHandle, Mixer, Status, StripMonitor, StripSettings,
};
use rehearse_transport::{AudioArc, Track, TrackId, VOLUME_MAX};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{PlaybackStartError, SessionError};
use crate::loader::{LoadCoordinator, LoadEvent, PendingLoad, Persistence, SessionLoadReport};
use crate::meter::LevelMeter;
use crate::solo::gate_gains;
use crate::transport::{PlayOutcome, PlaybackState, TransportClock, VoiceDeck};
use crate::voice::TrackVoice;

/// Command slots kept free so a stop always reaches the mixer.
const CONTROL_RESERVE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Ready,
    Playing,
    Paused,
}

/// One loaded multi-track recording and the engine playing it.
///
/// Everything here runs on the caller's thread. The host is expected to call
/// [`Session::poll`] (or any of the level accessors) once per UI tick so
/// loaded tracks, ended voices and meter samples are picked up.
pub struct Session<P> {
    engine: Option<EngineHandle>,
    loader: LoadCoordinator<P>,
    transport: TransportClock<DeviceClock>,
    tracks: Vec<Track>,
    /// Parallel to `tracks`; `None` until the track's buffer arrives.
    voices: Vec<Option<TrackVoice>>,
    monitors: Vec<Arc<StripMonitor>>,
    meter: LevelMeter,
    master_volume: f32,
    next_voice_id: u64,
    loading: bool,
    last_report: Option<SessionLoadReport>,
    config: SessionConfig,
}

impl<P: Persistence> Session<P> {
    /// Open the default output device.
    pub fn new(persistence: P, config: SessionConfig) -> Result<Self, SessionError> {
        let engine = rehearse_engine::start(&config.engine_config())
            .map_err(SessionError::Initialization)?;
        Ok(Self::with_engine(engine, persistence, config))
    }

    /// A session without an output device; the caller renders through the
    /// returned mixer.
    pub fn offline(persistence: P, config: SessionConfig) -> (Self, Mixer) {
        let (engine, mixer) =
            rehearse_engine::offline(&config.engine_config(), config.offline_sample_rate);
        (Self::with_engine(engine, persistence, config), mixer)
    }

    pub fn with_engine(mut engine: EngineHandle, persistence: P, config: SessionConfig) -> Self {
        let mut meter = LevelMeter::new(config.meter_window, config.meter_scale);
        if let Some(tap) = engine.take_master_tap() {
            meter.attach_master(tap);
        }

        Self {
            loader: LoadCoordinator::new(Arc::new(persistence), engine.sample_rate()),
            transport: TransportClock::new(engine.clock()),
            engine: Some(engine),
            tracks: Vec::new(),
            voices: Vec::new(),
            monitors: Vec::new(),
            meter,
            master_volume: VOLUME_MAX,
            next_voice_id: 0,
            loading: false,
            last_report: None,
            config,
        }
    }

    /// Replace the session's tracks and start loading them.
    ///
    /// Playback stops, fresh mixer strips are installed and the returned
    /// load must be driven to completion by the caller. Results arrive
    /// through [`Session::poll`].
    pub fn begin_load(&mut self, tracks: Vec<Track>) -> Result<PendingLoad<P>, SessionError> {
        let (transport, mut deck) = self.transport_and_deck()?;
        transport.stop(&mut deck)?;

        self.tracks = tracks
            .into_iter()
            .map(|t| {
                let (volume, balance) = (t.volume, t.balance);
                t.with_volume(volume).with_balance(balance)
            })
            .collect();
        self.voices = self.tracks.iter().map(|_| None).collect();
        self.install_strips();
        self.loading = true;
        self.last_report = None;

        info!(tracks = self.tracks.len(), "loading session");
        Ok(self.loader.begin(&self.tracks))
    }

    /// Load `tracks`, resolving once every track has loaded or failed.
    pub async fn load_session(
        &mut self,
        tracks: Vec<Track>,
    ) -> Result<SessionLoadReport, SessionError> {
        let pending = self.begin_load(tracks)?;
        let report = pending.run().await;
        self.poll();
        Ok(report)
    }

    /// Pick up loaded tracks and mixer status, reclaim released buffers and
    /// refresh the meters.
    pub fn poll(&mut self) {
        while let Some(event) = self.loader.next_event() {
            match event {
                LoadEvent::Track {
                    generation,
                    slot,
                    result,
                } => match result {
                    Ok(audio) => self.accept_track(slot, generation, audio),
                    Err(e) => debug!(track = %e.track_id(), "track left out of session"),
                },
                LoadEvent::Settled { report, .. } => {
                    self.loading = false;
                    self.last_report = Some(report);
                }
                LoadEvent::Abandoned { generation } => {
                    self.loading = false;
                    let report = self.abandoned_report(generation);
                    warn!(
                        loaded = report.loaded_count(),
                        missing = report.failed_ids.len(),
                        "load dropped before it settled"
                    );
                    self.last_report = Some(report);
                }
            }
        }

        if let Some(engine) = self.engine.as_mut() {
            while let Some(status) = engine.pop_status() {
                match status {
                    Status::VoiceEnded { slot, id } => {
                        if let Some(Some(voice)) = self.voices.get_mut(slot) {
                            voice.voice_ended(id);
                        }
                    }
                }
            }
            engine.collect();
        }

        self.meter.sample();
    }

    /// Start playback, waiting a bounded time for an in-flight load first.
    ///
    /// If the wait runs out the transport starts with whatever has loaded,
    /// or stays stopped when nothing has.
    pub async fn play(&mut self) -> Result<PlayOutcome, SessionError> {
        if self.engine.is_none() {
            return Err(SessionError::Disposed);
        }
        self.poll();

        let mut timed_out = false;
        if self.loading && !self.transport.is_playing() {
            let timeout = self.config.load_timeout();
            let deadline = Instant::now() + timeout;
            while self.loading {
                if Instant::now() >= deadline {
                    timed_out = true;
                    warn!(
                        loaded = self.loaded_track_count(),
                        "load not settled after {timeout:?}, playing what is ready"
                    );
                    break;
                }
                sleep(self.config.load_poll_interval()).await;
                self.poll();
            }
        }

        Ok(match self.try_play()? {
            PlayOutcome::NothingLoaded if timed_out => {
                warn!("no track loaded in time, staying stopped");
                PlayOutcome::LoadTimeout
            }
            outcome => outcome,
        })
    }

    /// Start playback with whatever is loaded right now.
    pub fn try_play(&mut self) -> Result<PlayOutcome, SessionError> {
        self.poll();
        let (transport, mut deck) = self.transport_and_deck()?;
        Ok(transport.play(&mut deck))
    }

    fn accept_track(&mut self, slot: usize, generation: u64, audio: AudioArc) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(track) = self.tracks.get(slot) else {
            return;
        };
        let mut voice = TrackVoice::new(track.id, engine.share(audio), generation);

        if self.transport.is_playing() {
            // join the running mix at the same anchor the others follow
            let clock = engine.clock();
            let at = clock.frames();
            let offset = self
                .transport
                .position_at(at as f64 / clock.sample_rate() as f64);
            let next_id = &mut self.next_voice_id;
            if let Err(e) = start_voice(engine, slot, &mut voice, offset, at, next_id) {
                warn!("{e}");
            }
        }

        debug!(track = %track.id, slot, duration = voice.duration(), "track ready");
        if let Some(entry) = self.voices.get_mut(slot) {
            *entry = Some(voice);
        }
    }

    /// What an abandoned load got done: tracks with a buffer count as
    /// loaded, the rest as failed.
    fn abandoned_report(&self, generation: u64) -> SessionLoadReport {
        let mut report = SessionLoadReport {
            generation,
            ..Default::default()
        };
        for (track, voice) in self.tracks.iter().zip(&self.voices) {
            if voice.is_some() {
                report.loaded_ids.push(track.id);
            } else {
                report.failed_ids.push(track.id);
                report.errors.push("load abandoned before it settled".to_string());
            }
        }
        report
    }

    fn install_strips(&mut self) {
        let settings: Vec<StripSettings> = self
            .tracks
            .iter()
            .zip(gate_gains(&self.tracks))
            .map(|(track, gate)| StripSettings {
                volume: track.volume_gain(),
                pan: track.pan(),
                gate,
            })
            .collect();

        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        match engine.install(&settings) {
            Ok(taps) => {
                let (levels, monitors): (Vec<_>, Vec<_>) =
                    taps.into_iter().map(|tap| (tap.level, tap.monitor)).unzip();
                self.meter.replace_tracks(levels);
                self.monitors = monitors;
            }
            Err(e) => {
                error!("failed to install mixer strips: {e}");
                self.meter.replace_tracks(Vec::new());
                self.monitors.clear();
            }
        }
    }
}

impl<P> Session<P> {
    /// Fails with [`SessionError::QueueFull`] when the stop could not be
    /// queued; the transport then keeps playing.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        let (transport, mut deck) = self.transport_and_deck()?;
        transport.pause(&mut deck)
    }

    pub fn stop(&mut self) -> Result<(), SessionError> {
        let (transport, mut deck) = self.transport_and_deck()?;
        transport.stop(&mut deck)
    }

    pub fn seek(&mut self, time: f64) -> Result<(), SessionError> {
        let (transport, mut deck) = self.transport_and_deck()?;
        transport.seek(time, &mut deck)
    }

    /// Set a track's volume, 0..=100.
    pub fn set_track_volume(&mut self, id: TrackId, volume: f32) -> Result<(), SessionError> {
        let slot = self.slot_of(id)?;
        self.ensure_room(1)?;
        let track = &mut self.tracks[slot];
        track.set_volume(volume);
        let gain = track.volume_gain();
        self.send(Command::SetVolume { slot, gain })
    }

    /// Set a track's balance, -50..=50.
    pub fn set_track_balance(&mut self, id: TrackId, balance: f32) -> Result<(), SessionError> {
        let slot = self.slot_of(id)?;
        self.ensure_room(1)?;
        let track = &mut self.tracks[slot];
        track.set_balance(balance);
        let pan = track.pan();
        self.send(Command::SetPan { slot, pan })
    }

    /// Flip a track's mute flag, returning the new value.
    pub fn toggle_mute(&mut self, id: TrackId) -> Result<bool, SessionError> {
        let slot = self.slot_of(id)?;
        self.ensure_room(self.tracks.len())?;
        let track = &mut self.tracks[slot];
        track.muted = !track.muted;
        let muted = track.muted;
        debug!(track = %id, muted, "mute toggled");
        self.apply_gates()?;
        Ok(muted)
    }

    /// Flip a track's solo flag, returning the new value.
    pub fn toggle_solo(&mut self, id: TrackId) -> Result<bool, SessionError> {
        let slot = self.slot_of(id)?;
        self.ensure_room(self.tracks.len())?;
        let track = &mut self.tracks[slot];
        track.soloed = !track.soloed;
        let soloed = track.soloed;
        debug!(track = %id, soloed, "solo toggled");
        self.apply_gates()?;
        Ok(soloed)
    }

    /// Set the master volume, 0..=100.
    pub fn set_master_volume(&mut self, volume: f32) -> Result<(), SessionError> {
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, VOLUME_MAX)
        };
        self.ensure_room(1)?;
        self.master_volume = volume;
        self.send(Command::SetMasterVolume(volume / VOLUME_MAX))
    }

    pub fn current_time(&self) -> f64 {
        self.transport.current_time()
    }

    /// Display level (0..=100) per track. Tracks without a decoded buffer
    /// read 0.
    pub fn audio_levels(&mut self) -> HashMap<TrackId, f32> {
        self.meter.sample();
        self.tracks
            .iter()
            .enumerate()
            .map(|(slot, track)| {
                let level = match self.voices.get(slot) {
                    Some(Some(_)) => self.meter.track_level(slot),
                    _ => 0.0,
                };
                (track.id, level)
            })
            .collect()
    }

    /// Left and right master display levels.
    pub fn master_stereo_levels(&mut self) -> (f32, f32) {
        self.meter.sample();
        self.meter.master_stereo_levels()
    }

    pub fn master_level(&mut self) -> f32 {
        self.meter.sample();
        self.meter.master_level()
    }

    pub fn loaded_track_count(&self) -> usize {
        self.voices.iter().flatten().count()
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    pub fn state(&self) -> SessionState {
        match self.transport.playback_state() {
            PlaybackState::Playing => SessionState::Playing,
            PlaybackState::Paused => SessionState::Paused,
            PlaybackState::Stopped if self.loading => SessionState::Loading,
            PlaybackState::Stopped => SessionState::Ready,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn last_report(&self) -> Option<&SessionLoadReport> {
        self.last_report.as_ref()
    }

    /// The gain a track currently contributes to the bus, volume times gate,
    /// as last rendered by the mixer.
    pub fn track_gain(&self, id: TrackId) -> Option<f32> {
        let slot = self.slot_of(id).ok()?;
        self.monitors.get(slot).map(|m| m.effective_gain())
    }

    /// Length of the longest loaded track, in seconds.
    pub fn duration(&self) -> f64 {
        self.voices
            .iter()
            .flatten()
            .map(TrackVoice::duration)
            .fold(0.0, f64::max)
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_none()
    }

    /// Stop playback and release the engine. Safe to call more than once.
    pub fn dispose(&mut self) {
        let Ok((transport, mut deck)) = self.transport_and_deck() else {
            return;
        };
        if let Err(e) = transport.stop(&mut deck) {
            debug!("stop not queued before dispose: {e}");
        }

        self.voices.clear();
        self.monitors.clear();
        self.meter.replace_tracks(Vec::new());
        self.loading = false;
        self.engine = None;
        info!("session disposed");
    }

    fn slot_of(&self, id: TrackId) -> Result<usize, SessionError> {
        self.tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or(SessionError::UnknownTrack(id))
    }

    /// Parameter changes must leave [`CONTROL_RESERVE`] slots free.
    fn ensure_room(&self, commands: usize) -> Result<(), SessionError> {
        let engine = self.engine.as_ref().ok_or(SessionError::Disposed)?;
        if engine.command_slots() < commands + CONTROL_RESERVE {
            warn!(needed = commands, free = engine.command_slots(), "mixer busy, change refused");
            return Err(SessionError::QueueFull);
        }
        Ok(())
    }

    fn send(&mut self, command: Command) -> Result<(), SessionError> {
        let engine = self.engine.as_mut().ok_or(SessionError::Disposed)?;
        engine.send(command).map_err(|e| {
            warn!("mixer command dropped: {e}");
            SessionError::QueueFull
        })
    }

    fn apply_gates(&mut self) -> Result<(), SessionError> {
        for (slot, gain) in gate_gains(&self.tracks).into_iter().enumerate() {
            self.send(Command::SetGate { slot, gain })?;
        }
        Ok(())
    }

    fn transport_and_deck(
        &mut self,
    ) -> Result<(&mut TransportClock<DeviceClock>, Deck<'_>), SessionError> {
        let engine = self.engine.as_mut().ok_or(SessionError::Disposed)?;
        let deck = Deck {
            engine,
            voices: &mut self.voices,
            next_voice_id: &mut self.next_voice_id,
        };
        Ok((&mut self.transport, deck))
    }
}

impl<P> Drop for Session<P> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The session's voices as seen by the transport.
struct Deck<'a> {
    engine: &'a mut EngineHandle,
    voices: &'a mut [Option<TrackVoice>],
    next_voice_id: &'a mut u64,
}

impl VoiceDeck for Deck<'_> {
    type Error = SessionError;

    fn loaded_count(&self) -> usize {
        self.voices.iter().flatten().count()
    }

    fn start_all(&mut self, offset: f64, at: f64) -> usize {
        let at = self.engine.clock().seconds_to_frames(at);
        let mut started = 0;
        for (slot, voice) in self.voices.iter_mut().enumerate() {
            let Some(voice) = voice else {
                continue;
            };
            match start_voice(self.engine, slot, voice, offset, at, self.next_voice_id) {
                Ok(()) => started += 1,
                Err(e) => warn!("{e}"),
            }
        }
        started
    }

    fn stop_all(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.engine.send(Command::StopAll) {
            error!("failed to stop voices: {e}");
            return Err(SessionError::QueueFull);
        }
        for voice in self.voices.iter_mut().flatten() {
            voice.stop();
        }
        Ok(())
    }
}

fn start_voice(
    engine: &mut EngineHandle,
    slot: usize,
    voice: &mut TrackVoice,
    offset: f64,
    at: u64,
    next_voice_id: &mut u64,
) -> Result<(), PlaybackStartError> {
    if engine.command_slots() <= CONTROL_RESERVE {
        return Err(PlaybackStartError {
            id: voice.track_id(),
            source: anyhow::anyhow!("mixer command queue full"),
        });
    }
    let id = *next_voice_id;
    *next_voice_id += 1;

    let handle = voice.start(id, offset, at);
    engine
        .send(Command::Start { slot, voice: handle })
        .map_err(|source| {
            voice.stop();
            PlaybackStartError {
                id: voice.track_id(),
                source,
            }
        })
}
