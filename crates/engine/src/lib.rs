mod mixer;
pub mod pan;
mod smooth;
mod voice;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::{Collector, Handle, Owned, Shared};
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use portable_atomic::AtomicF32;
use rehearse_transport::{AudioArc, Clock};
use tracing::{error, info};

pub use mixer::{Command, Mixer, Status, StripMonitor, StripSettings, StripTap};
pub use smooth::SmoothedParam;
pub use voice::Voice;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time constant for parameter ramps, in seconds.
    pub ramp_time: f32,
    pub command_capacity: usize,
    pub status_capacity: usize,
    /// Samples buffered per metering tap between two meter reads.
    pub tap_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ramp_time: 0.010,
            command_capacity: 256,
            status_capacity: 64,
            tap_capacity: 16384,
        }
    }
}

/// The shared hardware clock: frames rendered by the mixer.
#[derive(Debug, Clone)]
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl DeviceClock {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }
}

impl Clock for DeviceClock {
    fn now(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Control-side handle to a running mixer.
///
/// Dropping the handle closes the output stream.
pub struct EngineHandle {
    stream: Option<cpal::Stream>,
    commands: rtrb::Producer<Command>,
    status: rtrb::Consumer<Status>,
    master_tap: Option<rtrb::Consumer<f32>>,
    master_gain: Arc<AtomicF32>,
    clock: DeviceClock,
    tap_capacity: usize,
    collector: Collector,
    handle: Handle,
}

impl EngineHandle {
    /// Queue a command for the next audio block.
    pub fn send(&mut self, command: Command) -> anyhow::Result<()> {
        self.commands
            .push(command)
            .map_err(|e| anyhow::anyhow!("engine command queue full: {e:?}"))
    }

    /// Free slots left in the command queue.
    pub fn command_slots(&self) -> usize {
        self.commands.slots()
    }

    /// Replace the mixer's strips, one per track, returning the control-side
    /// end of each strip in the same order.
    pub fn install(&mut self, settings: &[StripSettings]) -> anyhow::Result<Vec<StripTap>> {
        let sample_rate = self.clock.sample_rate();
        let (strips, taps): (Vec<_>, Vec<_>) = settings
            .iter()
            .map(|s| mixer::strip(*s, sample_rate, self.tap_capacity))
            .unzip();

        self.send(Command::Install(Owned::new(&self.handle, strips)))?;
        Ok(taps)
    }

    /// Wrap a decoded buffer so the audio thread can hold it without ever
    /// freeing it.
    pub fn share(&self, audio: AudioArc) -> Shared<AudioArc> {
        Shared::new(&self.handle, audio)
    }

    pub fn pop_status(&mut self) -> Option<Status> {
        self.status.pop().ok()
    }

    /// The interleaved L/R master tap. Can be taken once.
    pub fn take_master_tap(&mut self) -> Option<rtrb::Consumer<f32>> {
        self.master_tap.take()
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain.load(Ordering::Relaxed)
    }

    pub fn clock(&self) -> DeviceClock {
        self.clock.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate
    }

    pub fn has_device(&self) -> bool {
        self.stream.is_some()
    }

    /// Reclaim buffers and strips the audio thread let go of.
    pub fn collect(&mut self) {
        self.collector.collect();
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // the mixer inside the stream goes first, then whatever it held is reclaimed
        if self.stream.take().is_some() {
            info!("audio output closed");
        }
        self.collector.collect();
    }
}

fn channel(config: &EngineConfig, sample_rate: u32) -> (EngineHandle, Mixer) {
    let collector = Collector::new();
    let handle = collector.handle();

    let (command_tx, command_rx) = rtrb::RingBuffer::<Command>::new(config.command_capacity);
    let (status_tx, status_rx) = rtrb::RingBuffer::<Status>::new(config.status_capacity);
    // stereo, so twice the per-track capacity
    let (master_tx, master_rx) = rtrb::RingBuffer::<f32>::new(config.tap_capacity * 2);

    let frames = Arc::new(AtomicU64::new(0));
    let master_gain = Arc::new(AtomicF32::new(1.0));

    let mixer = Mixer::new(
        command_rx,
        status_tx,
        master_tx,
        Arc::clone(&master_gain),
        Arc::clone(&frames),
        sample_rate,
        config.ramp_time,
    );

    let handle = EngineHandle {
        stream: None,
        commands: command_tx,
        status: status_rx,
        master_tap: Some(master_rx),
        master_gain,
        clock: DeviceClock {
            frames,
            sample_rate,
        },
        tap_capacity: config.tap_capacity,
        collector,
        handle,
    };

    (handle, mixer)
}

/// An engine with no device attached. The caller drives the returned
/// `Mixer` with `process()`, which also advances the clock.
pub fn offline(config: &EngineConfig, sample_rate: u32) -> (EngineHandle, Mixer) {
    channel(config, sample_rate)
}

/// Open the default output device and start rendering.
pub fn start(config: &EngineConfig) -> anyhow::Result<EngineHandle> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device found"))?;

    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();

    let (mut handle, mixer) = channel(config, stream_config.sample_rate.0);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, mixer)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, mixer)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, mixer)?,
        sample_format => anyhow::bail!("unsupported sample format '{sample_format}'"),
    };

    stream.play()?;
    info!(
        sample_rate = stream_config.sample_rate.0,
        channels = stream_config.channels,
        "audio output started"
    );

    handle.stream = Some(stream);
    Ok(handle)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let output_channels = config.channels as usize;

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mixer.process(data, output_channels);
        },
        |err| error!("stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_follows_rendered_frames() {
        let (handle, mut mixer) = offline(&EngineConfig::default(), 48000);
        let clock = handle.clock();
        assert_eq!(clock.now(), 0.0);

        let mut out = vec![0.0f32; 4800 * 2];
        mixer.process(&mut out, 2);
        assert_eq!(clock.frames(), 4800);
        assert!((clock.now() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_seconds_to_frames() {
        let (handle, _mixer) = offline(&EngineConfig::default(), 44100);
        let clock = handle.clock();
        assert_eq!(clock.seconds_to_frames(1.0), 44100);
        assert_eq!(clock.seconds_to_frames(-3.0), 0);
    }

    #[test]
    fn test_command_queue_full() {
        let config = EngineConfig {
            command_capacity: 2,
            ..Default::default()
        };
        let (mut handle, _mixer) = offline(&config, 48000);
        handle.send(Command::StopAll).unwrap();
        handle.send(Command::StopAll).unwrap();
        assert!(handle.send(Command::StopAll).is_err());
        assert_eq!(handle.command_slots(), 0);
    }

    #[test]
    fn test_master_tap_taken_once() {
        let (mut handle, _mixer) = offline(&EngineConfig::default(), 48000);
        assert!(handle.take_master_tap().is_some());
        assert!(handle.take_master_tap().is_none());
        assert!(!handle.has_device());
    }
}
