use basedrop::Shared;
use rehearse_transport::AudioArc;

use crate::pan::Frame;

/// A one-shot playback of one track's buffer.
///
/// Voices are not resumable: pausing or seeking discards the voice and the
/// transport creates a fresh one. A voice is anchored to the hardware clock,
/// buffer frame `offset` sounds at hardware frame `start_at`, so voices
/// created with the same anchor stay sample-aligned no matter which audio
/// block first sees them.
pub struct Voice {
    id: u64,
    buffer: Shared<AudioArc>,
    offset: u64,
    start_at: u64,
}

impl Voice {
    pub fn new(id: u64, buffer: Shared<AudioArc>, offset: u64, start_at: u64) -> Self {
        Self {
            id,
            buffer,
            offset,
            start_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_at(&self) -> u64 {
        self.start_at
    }

    /// Source frame for hardware frame `now`. Silence before the anchor,
    /// `None` once the buffer is exhausted.
    #[inline]
    pub fn frame_at(&self, now: u64) -> Option<Frame> {
        if now < self.start_at {
            return Some(Frame::SILENCE);
        }
        let position = usize::try_from(self.offset + (now - self.start_at)).ok()?;
        let buffer: &AudioArc = &self.buffer;
        if buffer.channels() == 1 {
            buffer.samples().get(position).map(|x| Frame::Mono(*x))
        } else {
            buffer
                .stereo_frame(position)
                .map(|(l, r)| Frame::Stereo(l, r))
        }
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("start_at", &self.start_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Collector;

    #[test]
    fn test_voice_reads_from_anchor() {
        let collector = Collector::new();
        let audio = AudioArc::new(vec![0.0, 0.1, 0.2, 0.3, 0.4], 48000, 1);
        let voice = Voice::new(7, Shared::new(&collector.handle(), audio), 2, 100);

        assert_eq!(voice.frame_at(99), Some(Frame::SILENCE));
        assert_eq!(voice.frame_at(100), Some(Frame::Mono(0.2)));
        assert_eq!(voice.frame_at(102), Some(Frame::Mono(0.4)));
        assert_eq!(voice.frame_at(103), None);
    }

    #[test]
    fn test_stereo_voice() {
        let collector = Collector::new();
        let audio = AudioArc::new(vec![0.1, -0.1, 0.2, -0.2], 48000, 2);
        let voice = Voice::new(1, Shared::new(&collector.handle(), audio), 0, 0);

        assert_eq!(voice.frame_at(1), Some(Frame::Stereo(0.2, -0.2)));
        assert_eq!(voice.frame_at(2), None);
    }

    #[test]
    fn test_offset_past_end_is_finished() {
        let collector = Collector::new();
        let audio = AudioArc::new(vec![0.5; 10], 48000, 1);
        let voice = Voice::new(1, Shared::new(&collector.handle(), audio), 50, 0);
        assert_eq!(voice.frame_at(0), None);
    }
}
