use std::fmt;
use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Track volume range exposed to the UI, 100 = unity gain.
pub const VOLUME_MAX: f32 = 100.0;

/// Track balance range exposed to the UI is `-BALANCE_MAX..=BALANCE_MAX`.
pub const BALANCE_MAX: f32 = 50.0;

/// Shared, immutable audio sample data.
///
/// `AudioArc` stores interleaved samples in an `Arc<[f32]>`, so cloning only
/// bumps a reference count. The realtime side holds clones of a track's
/// decoded buffer while the control side keeps the original.
///
/// ```
/// use rehearse_transport::AudioArc;
///
/// let audio = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// let audio2 = audio.clone();
/// assert_eq!(audio.frames(), 2);
/// assert_eq!(audio2.frames(), 2);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    /// Interleaved samples, e.g. [L, R, L, R, ...] for stereo.
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioArc {
    /// Create a new `AudioArc` from owned interleaved samples.
    ///
    /// # Panics
    ///
    /// Panics if `channels` is 0 or if `samples.len()` is not divisible by `channels`.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        assert!(channels > 0, "channels must be greater than 0");
        assert_eq!(
            samples.len() % channels as usize,
            0,
            "samples.len() must be divisible by channels"
        );
        Self {
            samples: Arc::from(samples),
            sample_rate,
            channels,
        }
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Read one frame as a stereo pair. Mono sources are duplicated, extra
    /// channels beyond the first two are ignored.
    ///
    /// Returns `None` past the end of the buffer.
    #[inline]
    pub fn stereo_frame(&self, frame: usize) -> Option<(f32, f32)> {
        let channels = self.channels as usize;
        let idx = frame.checked_mul(channels)?;
        if idx + channels > self.samples.len() {
            return None;
        }
        let left = self.samples[idx];
        let right = if channels > 1 {
            self.samples[idx + 1]
        } else {
            left
        };
        Some((left, right))
    }

    /// Resample this audio to a target sample rate.
    ///
    /// If the audio is already at the target rate this is a cheap clone.
    pub fn resample(&self, target_sample_rate: u32) -> anyhow::Result<Self> {
        if self.sample_rate == target_sample_rate {
            return Ok(self.clone());
        }

        resample_audio_arc(self, target_sample_rate)
    }
}

impl fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioArc")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One part of a multi-track recording, as the UI describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    /// Primary byte-source reference, resolved lazily by the persistence layer.
    pub source: String,
    /// 0..=100
    pub volume: f32,
    /// -50..=+50
    pub balance: f32,
    pub muted: bool,
    pub soloed: bool,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            source: source.into(),
            volume: VOLUME_MAX,
            balance: 0.0,
            muted: false,
            soloed: false,
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.set_volume(volume);
        self
    }

    pub fn with_balance(mut self, balance: f32) -> Self {
        self.set_balance(balance);
        self
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, VOLUME_MAX)
        };
    }

    pub fn set_balance(&mut self, balance: f32) {
        self.balance = if balance.is_nan() {
            0.0
        } else {
            balance.clamp(-BALANCE_MAX, BALANCE_MAX)
        };
    }

    /// Linear gain for the volume stage.
    pub fn volume_gain(&self) -> f32 {
        self.volume / VOLUME_MAX
    }

    /// Balance mapped onto the engine's normalized pan range [-1, +1].
    pub fn pan(&self) -> f32 {
        self.balance / BALANCE_MAX
    }
}

/// Time source the transport measures against, in seconds.
///
/// Must be monotonic non-decreasing.
pub trait Clock {
    fn now(&self) -> f64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> f64 {
        (**self).now()
    }
}

/// Resample an `AudioArc` to a target sample rate with sinc interpolation.
pub fn resample_audio_arc(audio: &AudioArc, target_sample_rate: u32) -> anyhow::Result<AudioArc> {
    if audio.sample_rate == target_sample_rate {
        return Ok(audio.clone());
    }
    if audio.is_empty() {
        return Ok(AudioArc::new(Vec::new(), target_sample_rate, audio.channels));
    }

    let channels = audio.channels as usize;
    let input_frames = audio.frames();

    let resample_ratio = target_sample_rate as f64 / audio.sample_rate as f64;
    let output_frames = (input_frames as f64 * resample_ratio).ceil() as usize;

    // rubato wants one Vec per channel
    let mut input_channels = vec![Vec::with_capacity(input_frames); channels];
    for frame in audio.samples().chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            input_channels[ch].push(*sample);
        }
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(resample_ratio, 2.0, params, input_frames, channels)?;

    let output_channels = resampler.process(&input_channels, None)?;

    let mut output_samples = Vec::with_capacity(output_frames * channels);
    for frame_idx in 0..output_channels[0].len() {
        for channel in &output_channels {
            output_samples.push(channel[frame_idx]);
        }
    }

    Ok(AudioArc::new(
        output_samples,
        target_sample_rate,
        audio.channels,
    ))
}

#[cfg(test)]
mod audio_arc_tests {
    use super::*;

    fn sine(sample_rate: u32, frames: usize, channels: u16) -> AudioArc {
        let samples = (0..frames)
            .flat_map(|i| {
                let t = i as f32 / sample_rate as f32;
                let x = (2.0 * std::f32::consts::PI * 440.0 * t).sin();
                std::iter::repeat_n(x, channels as usize)
            })
            .collect();
        AudioArc::new(samples, sample_rate, channels)
    }

    #[test]
    fn test_stereo_frame_mono_is_duplicated() {
        let audio = AudioArc::new(vec![0.25, -0.5], 48000, 1);
        assert_eq!(audio.stereo_frame(0), Some((0.25, 0.25)));
        assert_eq!(audio.stereo_frame(1), Some((-0.5, -0.5)));
        assert_eq!(audio.stereo_frame(2), None);
    }

    #[test]
    fn test_stereo_frame_ignores_extra_channels() {
        // 4 channels, 2 frames
        let audio = AudioArc::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8], 48000, 4);
        assert_eq!(audio.stereo_frame(1), Some((0.5, 0.6)));
        assert_eq!(audio.stereo_frame(usize::MAX), None);
    }

    #[test]
    fn test_resample_to_device_rate_keeps_duration() {
        let audio = sine(44100, 4410, 2);
        let resampled = audio.resample(48000).unwrap();

        assert_eq!(resampled.sample_rate(), 48000);
        assert_eq!(resampled.channels(), 2);
        let drift = (resampled.duration_secs() - audio.duration_secs()).abs();
        assert!(drift < 0.003, "duration drifted by {drift}s");
    }

    #[test]
    fn test_resample_empty_audio() {
        let audio = AudioArc::new(Vec::new(), 44100, 2);
        let resampled = audio.resample(48000).unwrap();
        assert!(resampled.is_empty());
        assert_eq!(resampled.sample_rate(), 48000);
    }
}

#[cfg(test)]
mod track_tests {
    use super::*;

    #[test]
    fn test_track_defaults() {
        let track = Track::new(TrackId(1), "Bass", "bass.wav");
        assert_eq!(track.volume, 100.0);
        assert_eq!(track.balance, 0.0);
        assert!(!track.muted);
        assert!(!track.soloed);
        assert_eq!(track.volume_gain(), 1.0);
        assert_eq!(track.pan(), 0.0);
    }

    #[test]
    fn test_track_values_are_clamped() {
        let mut track = Track::new(TrackId(1), "Keys", "keys.wav");
        track.set_volume(140.0);
        track.set_balance(-80.0);
        assert_eq!(track.volume, 100.0);
        assert_eq!(track.balance, -50.0);
        assert_eq!(track.pan(), -1.0);

        track.set_volume(f32::NAN);
        assert_eq!(track.volume, 0.0);
    }

    #[test]
    fn test_balance_maps_to_normalized_pan() {
        let track = Track::new(TrackId(2), "Vox", "vox.wav")
            .with_balance(25.0)
            .with_volume(50.0);
        assert!((track.pan() - 0.5).abs() < f32::EPSILON);
        assert!((track.volume_gain() - 0.5).abs() < f32::EPSILON);
    }
}
