//! The realtime mix bus.
//!
//! Each track gets a [`Strip`]: volume stage, pan stage, metering tap,
//! solo/mute gate, in that order. Strips are summed into the master volume
//! stage, which feeds the master tap and the output device.
//!
//! The `Mixer` lives on the audio thread. It is only reached through
//! [`Command`]s popped at the start of every block, and it only talks back
//! through [`Status`] messages, the metering taps and the strip monitors.
//! Nothing in `process()` allocates or frees: strip sets and buffers arrive
//! wrapped in basedrop `Owned`/`Shared` and are reclaimed by the collector on
//! the control thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::Owned;
use cpal::{FromSample, SizedSample};
use portable_atomic::AtomicF32;

use crate::pan::{self, Frame};
use crate::smooth::SmoothedParam;
use crate::voice::Voice;

pub enum Command {
    /// Replace the whole strip set (new session).
    Install(Owned<Vec<Strip>>),
    /// Start a voice on a strip, discarding whatever voice it had.
    Start { slot: usize, voice: Voice },
    Stop { slot: usize },
    StopAll,
    SetVolume { slot: usize, gain: f32 },
    SetPan { slot: usize, pan: f32 },
    SetGate { slot: usize, gain: f32 },
    SetMasterVolume(f32),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Install(strips) => write!(f, "Install({} strips)", strips.len()),
            Command::Start { slot, voice } => f
                .debug_struct("Start")
                .field("slot", slot)
                .field("voice", &voice.id())
                .finish(),
            Command::Stop { slot } => f.debug_struct("Stop").field("slot", slot).finish(),
            Command::StopAll => write!(f, "StopAll"),
            Command::SetVolume { slot, gain } => f
                .debug_struct("SetVolume")
                .field("slot", slot)
                .field("gain", gain)
                .finish(),
            Command::SetPan { slot, pan } => f
                .debug_struct("SetPan")
                .field("slot", slot)
                .field("pan", pan)
                .finish(),
            Command::SetGate { slot, gain } => f
                .debug_struct("SetGate")
                .field("slot", slot)
                .field("gain", gain)
                .finish(),
            Command::SetMasterVolume(gain) => write!(f, "SetMasterVolume({gain})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A voice ran past the end of its buffer and was dropped.
    VoiceEnded { slot: usize, id: u64 },
}

/// Initial parameter values for a strip, in engine units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StripSettings {
    /// Linear gain, 1.0 = unity.
    pub volume: f32,
    /// -1.0 (left) ..= 1.0 (right)
    pub pan: f32,
    /// Solo/mute gate, 0.0 or 1.0.
    pub gate: f32,
}

impl Default for StripSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.0,
            gate: 1.0,
        }
    }
}

/// Smoothed parameter values as last rendered, readable from any thread.
#[derive(Debug)]
pub struct StripMonitor {
    volume: AtomicF32,
    pan: AtomicF32,
    gate: AtomicF32,
}

impl StripMonitor {
    fn new(settings: StripSettings) -> Self {
        Self {
            volume: AtomicF32::new(settings.volume),
            pan: AtomicF32::new(settings.pan),
            gate: AtomicF32::new(settings.gate),
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn pan(&self) -> f32 {
        self.pan.load(Ordering::Relaxed)
    }

    pub fn gate(&self) -> f32 {
        self.gate.load(Ordering::Relaxed)
    }

    /// What the strip contributes to the bus: volume times gate.
    pub fn effective_gain(&self) -> f32 {
        self.volume() * self.gate()
    }
}

pub struct Strip {
    volume: SmoothedParam,
    pan: SmoothedParam,
    gate: SmoothedParam,
    voice: Option<Voice>,
    tap: rtrb::Producer<f32>,
    monitor: Arc<StripMonitor>,
}

/// Control-side end of a strip: its metering tap and parameter monitor.
pub struct StripTap {
    /// Mono post-pan, pre-gate samples.
    pub level: rtrb::Consumer<f32>,
    pub monitor: Arc<StripMonitor>,
}

pub(crate) fn strip(
    settings: StripSettings,
    sample_rate: u32,
    tap_capacity: usize,
) -> (Strip, StripTap) {
    let (tap_tx, tap_rx) = rtrb::RingBuffer::<f32>::new(tap_capacity);
    let monitor = Arc::new(StripMonitor::new(settings));

    let strip = Strip {
        volume: SmoothedParam::new(sample_rate, settings.volume),
        pan: SmoothedParam::new(sample_rate, settings.pan),
        gate: SmoothedParam::new(sample_rate, settings.gate),
        voice: None,
        tap: tap_tx,
        monitor: Arc::clone(&monitor),
    };

    (strip, StripTap { level: tap_rx, monitor })
}

impl Strip {
    /// Render one frame at hardware frame `now`. Returns the gated stereo
    /// output and the id of the voice if it just ran out.
    #[inline]
    fn render(&mut self, now: u64) -> ((f32, f32), Option<u64>) {
        let mut ended = None;
        let source = match self.voice.as_ref().map(|voice| voice.frame_at(now)) {
            Some(Some(frame)) => frame,
            Some(None) => {
                ended = self.voice.take().map(|voice| voice.id());
                Frame::SILENCE
            }
            None => Frame::SILENCE,
        };

        let volume = self.volume.next_value();
        let pan = self.pan.next_value();
        let gate = self.gate.next_value();

        let (left, right) = pan::apply(source.scale(volume), pan);
        // tap sits before the gate; a full ring just drops samples
        let _ = self.tap.push((left + right) * 0.5);

        ((left * gate, right * gate), ended)
    }

    fn publish(&self) {
        self.monitor
            .volume
            .store(self.volume.current(), Ordering::Relaxed);
        self.monitor.pan.store(self.pan.current(), Ordering::Relaxed);
        self.monitor.gate.store(self.gate.current(), Ordering::Relaxed);
    }
}

pub struct Mixer {
    commands: rtrb::Consumer<Command>,
    status: rtrb::Producer<Status>,
    strips: Option<Owned<Vec<Strip>>>,
    master: SmoothedParam,
    master_gain: Arc<AtomicF32>,
    /// Interleaved L/R post-master samples.
    master_tap: rtrb::Producer<f32>,
    /// Frames rendered so far, shared with the control side as its clock.
    frames: Arc<AtomicU64>,
    now: u64,
    ramp_time: f32,
}

impl Mixer {
    pub(crate) fn new(
        commands: rtrb::Consumer<Command>,
        status: rtrb::Producer<Status>,
        master_tap: rtrb::Producer<f32>,
        master_gain: Arc<AtomicF32>,
        frames: Arc<AtomicU64>,
        sample_rate: u32,
        ramp_time: f32,
    ) -> Self {
        Self {
            commands,
            status,
            strips: None,
            master: SmoothedParam::new(sample_rate, master_gain.load(Ordering::Relaxed)),
            master_gain,
            master_tap,
            frames,
            now: 0,
            ramp_time,
        }
    }

    /// Hardware frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.now
    }

    /// Fill one interleaved output block with `channels` channels per frame.
    pub fn process<T>(&mut self, data: &mut [T], channels: usize)
    where
        T: SizedSample + FromSample<f32>,
    {
        self.apply_commands();

        let channels = channels.max(1);
        for frame in data.chunks_mut(channels) {
            let (left, right) = self.next_frame();

            if frame.len() == 1 {
                frame[0] = T::from_sample((left + right) * 0.5);
            } else {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let value = match ch {
                        0 => left,
                        1 => right,
                        _ => 0.0,
                    };
                    *sample = T::from_sample(value);
                }
            }
        }

        if let Some(strips) = self.strips.as_ref() {
            for strip in strips.iter() {
                strip.publish();
            }
        }
        self.master_gain
            .store(self.master.current(), Ordering::Relaxed);
        self.frames.store(self.now, Ordering::Release);
    }

    fn apply_commands(&mut self) {
        let ramp_time = self.ramp_time;
        while let Ok(cmd) = self.commands.pop() {
            match cmd {
                Command::Install(strips) => self.strips = Some(strips),
                Command::Start { slot, voice } => {
                    if let Some(strip) = self.strip_mut(slot) {
                        strip.voice = Some(voice);
                    }
                }
                Command::Stop { slot } => {
                    if let Some(strip) = self.strip_mut(slot) {
                        strip.voice = None;
                    }
                }
                Command::StopAll => {
                    if let Some(strips) = self.strips.as_mut() {
                        for strip in strips.iter_mut() {
                            strip.voice = None;
                        }
                    }
                }
                Command::SetVolume { slot, gain } => {
                    if let Some(strip) = self.strip_mut(slot) {
                        strip.volume.ramp_to(gain, ramp_time);
                    }
                }
                Command::SetPan { slot, pan } => {
                    if let Some(strip) = self.strip_mut(slot) {
                        strip.pan.ramp_to(pan.clamp(-1.0, 1.0), ramp_time);
                    }
                }
                Command::SetGate { slot, gain } => {
                    if let Some(strip) = self.strip_mut(slot) {
                        strip.gate.ramp_to(gain, ramp_time);
                    }
                }
                Command::SetMasterVolume(gain) => self.master.ramp_to(gain, ramp_time),
            }
        }
    }

    fn strip_mut(&mut self, slot: usize) -> Option<&mut Strip> {
        self.strips.as_mut()?.get_mut(slot)
    }

    #[inline]
    fn next_frame(&mut self) -> (f32, f32) {
        let now = self.now;
        let mut bus = (0.0f32, 0.0f32);

        if let Some(strips) = self.strips.as_mut() {
            for (slot, strip) in strips.iter_mut().enumerate() {
                let ((left, right), ended) = strip.render(now);
                bus.0 += left;
                bus.1 += right;
                if let Some(id) = ended {
                    let _ = self.status.push(Status::VoiceEnded { slot, id });
                }
            }
        }

        let master = self.master.next_value();
        let (left, right) = (bus.0 * master, bus.1 * master);
        let _ = self.master_tap.push(left);
        let _ = self.master_tap.push(right);

        self.now += 1;
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, EngineHandle, offline};
    use rehearse_transport::AudioArc;

    const SR: u32 = 48000;

    fn engine() -> (EngineHandle, Mixer) {
        offline(&EngineConfig::default(), SR)
    }

    fn render(mixer: &mut Mixer, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames * 2];
        mixer.process(&mut out, 2);
        out
    }

    fn constant(value: f32, frames: usize) -> AudioArc {
        AudioArc::new(vec![value; frames * 2], SR, 2)
    }

    #[test]
    fn test_silent_without_strips() {
        let (_handle, mut mixer) = engine();
        let out = render(&mut mixer, 256);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(mixer.frames(), 256);
    }

    #[test]
    fn test_voice_is_mixed_and_tapped() {
        let (mut handle, mut mixer) = engine();
        let mut taps = handle.install(&[StripSettings::default()]).unwrap();
        let buffer = handle.share(constant(0.5, 1000));
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(1, buffer, 0, 0) })
            .unwrap();

        let out = render(&mut mixer, 64);
        assert!((out[0] - 0.5).abs() < 1e-5);
        assert!((out[1] - 0.5).abs() < 1e-5);

        let tapped: Vec<f32> = std::iter::from_fn(|| taps[0].level.pop().ok()).collect();
        assert_eq!(tapped.len(), 64);
        assert!((tapped[10] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_tap_is_before_gate() {
        let (mut handle, mut mixer) = engine();
        let settings = StripSettings {
            gate: 0.0,
            ..Default::default()
        };
        let mut taps = handle.install(&[settings]).unwrap();
        let buffer = handle.share(constant(0.5, 1000));
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(1, buffer, 0, 0) })
            .unwrap();

        let out = render(&mut mixer, 64);
        assert!(out.iter().all(|s| *s == 0.0));

        let tapped = taps[0].level.pop().unwrap();
        assert!((tapped - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_voices_with_same_anchor_are_aligned() {
        let (mut handle, mut mixer) = engine();
        let mut taps = handle
            .install(&[StripSettings::default(), StripSettings::default()])
            .unwrap();
        let ramp: Vec<f32> = (0..2000).flat_map(|i| [i as f32, i as f32]).collect();
        let a = handle.share(AudioArc::new(ramp.clone(), SR, 2));
        let b = handle.share(AudioArc::new(ramp, SR, 2));

        // anchor at frame 0, but the second voice only arrives one block later
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(1, a, 0, 0) })
            .unwrap();
        render(&mut mixer, 128);
        handle
            .send(Command::Start { slot: 1, voice: Voice::new(1, b, 0, 0) })
            .unwrap();
        render(&mut mixer, 128);

        let a_samples: Vec<f32> = std::iter::from_fn(|| taps[0].level.pop().ok()).collect();
        let b_samples: Vec<f32> = std::iter::from_fn(|| taps[1].level.pop().ok()).collect();
        assert!((a_samples[200] - 200.0).abs() < 1e-3);
        assert!((b_samples[200] - 200.0).abs() < 1e-3);
        assert!((a_samples[255] - b_samples[255]).abs() < 1e-3);
    }

    #[test]
    fn test_voice_end_is_reported() {
        let (mut handle, mut mixer) = engine();
        handle.install(&[StripSettings::default()]).unwrap();
        let buffer = handle.share(constant(0.1, 10));
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(42, buffer, 0, 0) })
            .unwrap();

        render(&mut mixer, 64);
        assert_eq!(
            handle.pop_status(),
            Some(Status::VoiceEnded { slot: 0, id: 42 })
        );
        assert_eq!(handle.pop_status(), None);
    }

    #[test]
    fn test_gate_ramps_instead_of_jumping() {
        let (mut handle, mut mixer) = engine();
        let taps = handle.install(&[StripSettings::default()]).unwrap();
        handle.send(Command::SetGate { slot: 0, gain: 0.0 }).unwrap();

        render(&mut mixer, 16);
        let gate = taps[0].monitor.gate();
        assert!(gate > 0.9 && gate < 1.0, "gate jumped to {gate}");

        render(&mut mixer, 4800);
        assert_eq!(taps[0].monitor.gate(), 0.0);
        assert_eq!(taps[0].monitor.effective_gain(), 0.0);
    }

    #[test]
    fn test_master_volume() {
        let (mut handle, mut mixer) = engine();
        handle.install(&[StripSettings::default()]).unwrap();
        let buffer = handle.share(constant(0.5, 20000));
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(1, buffer, 0, 0) })
            .unwrap();
        handle.send(Command::SetMasterVolume(0.5)).unwrap();

        let out = render(&mut mixer, 9600);
        let last = out[out.len() - 2];
        assert!((last - 0.25).abs() < 1e-3, "got {last}");
        assert!((handle.master_gain() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_stop_all_silences() {
        let (mut handle, mut mixer) = engine();
        handle.install(&[StripSettings::default()]).unwrap();
        let buffer = handle.share(constant(0.5, 20000));
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(1, buffer, 0, 0) })
            .unwrap();
        render(&mut mixer, 32);
        handle.send(Command::StopAll).unwrap();

        let out = render(&mut mixer, 32);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_out_of_range_slot_is_ignored() {
        let (mut handle, mut mixer) = engine();
        handle.install(&[StripSettings::default()]).unwrap();
        let buffer = handle.share(constant(0.5, 100));
        handle
            .send(Command::Start { slot: 5, voice: Voice::new(1, buffer, 0, 0) })
            .unwrap();
        handle.send(Command::SetVolume { slot: 9, gain: 0.0 }).unwrap();

        let out = render(&mut mixer, 32);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_mono_output_device() {
        let (mut handle, mut mixer) = engine();
        handle
            .install(&[StripSettings {
                pan: -1.0,
                ..Default::default()
            }])
            .unwrap();
        let buffer = handle.share(constant(0.5, 100));
        handle
            .send(Command::Start { slot: 0, voice: Voice::new(1, buffer, 0, 0) })
            .unwrap();

        let mut out = vec![0.0f32; 8];
        mixer.process(&mut out, 1);
        // hard left stereo: L = 1.0, R = 0.0, folded to mono
        assert!((out[0] - 0.5).abs() < 1e-5);
    }
}
