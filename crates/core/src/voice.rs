use basedrop::Shared;
use rehearse_engine::Voice;
use rehearse_transport::{AudioArc, TrackId};

/// A track's decoded buffer plus its playback handle.
///
/// The buffer outlives any number of voices; each call to [`TrackVoice::start`]
/// mints a fresh one-shot [`Voice`] and forgets the previous one, so at most
/// one handle per track is live at a time.
pub struct TrackVoice {
    id: TrackId,
    buffer: Shared<AudioArc>,
    generation: u64,
    live: Option<u64>,
}

impl TrackVoice {
    pub fn new(id: TrackId, buffer: Shared<AudioArc>, generation: u64) -> Self {
        Self {
            id,
            buffer,
            generation,
            live: None,
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.id
    }

    /// The load generation this buffer was decoded for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn duration(&self) -> f64 {
        self.buffer.duration_secs()
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn live_voice(&self) -> Option<u64> {
        self.live
    }

    /// New voice `voice_id` that plays from `offset` seconds into the buffer,
    /// sounding at hardware frame `at`.
    pub fn start(&mut self, voice_id: u64, offset: f64, at: u64) -> Voice {
        let sample_rate = self.buffer.sample_rate() as f64;
        let offset = if offset.is_finite() { offset.max(0.0) } else { 0.0 };
        let offset_frames = (offset * sample_rate).round() as u64;

        self.live = Some(voice_id);
        Voice::new(voice_id, self.buffer.clone(), offset_frames, at)
    }

    pub fn stop(&mut self) -> Option<u64> {
        self.live.take()
    }

    /// The mixer dropped voice `voice_id` at the end of the buffer.
    pub fn voice_ended(&mut self, voice_id: u64) {
        if self.live == Some(voice_id) {
            self.live = None;
        }
    }
}

impl std::fmt::Debug for TrackVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackVoice")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Collector;

    fn voice(collector: &Collector) -> TrackVoice {
        let audio = AudioArc::new(vec![0.0; 48000 * 2], 48000, 2);
        TrackVoice::new(TrackId(1), Shared::new(&collector.handle(), audio), 3)
    }

    #[test]
    fn test_start_replaces_live_handle() {
        let collector = Collector::new();
        let mut track = voice(&collector);
        assert!(!track.is_live());

        let first = track.start(10, 0.0, 0);
        let second = track.start(11, 0.5, 4800);
        assert_eq!(first.id(), 10);
        assert_eq!(second.start_at(), 4800);
        assert_eq!(track.live_voice(), Some(11));

        // the discarded voice ending must not clear the new one
        track.voice_ended(10);
        assert_eq!(track.live_voice(), Some(11));
        track.voice_ended(11);
        assert!(!track.is_live());
    }

    #[test]
    fn test_stop_and_duration() {
        let collector = Collector::new();
        let mut track = voice(&collector);
        track.start(1, f64::NAN, 0);
        assert_eq!(track.stop(), Some(1));
        assert_eq!(track.stop(), None);
        assert!((track.duration() - 1.0).abs() < 1e-9);
        assert_eq!(track.generation(), 3);
    }
}
