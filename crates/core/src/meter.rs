//! UI-rate level metering.
//!
//! The mixer pushes every tapped sample into a ring; the meter drains the
//! rings whenever it is sampled and keeps the most recent `window` samples of
//! each. Levels are the RMS of that window, scaled for display.

use tracing::debug;

/// Display level for an RMS value: `rms * scale`, clamped to 0..=100.
pub fn display_level(rms: f32, scale: f32) -> f32 {
    (rms * scale).clamp(0.0, 100.0)
}

struct Window {
    samples: Vec<f32>,
    pos: usize,
}

impl Window {
    fn new(len: usize) -> Self {
        Self {
            samples: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    fn push(&mut self, sample: f32) {
        self.samples[self.pos] = sample;
        self.pos = (self.pos + 1) % self.samples.len();
    }

    fn rms(&self) -> f32 {
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }
}

struct TrackTap {
    tap: rtrb::Consumer<f32>,
    window: Window,
}

struct MasterTap {
    tap: rtrb::Consumer<f32>,
    left: Window,
    right: Window,
}

/// RMS meters over the mixer's taps.
///
/// A tap ring that fills between two reads rejects the newest samples, so
/// the first read after a long gap reflects audio from before the gap.
/// Keep `tap_capacity` well above one UI tick's worth of frames.
pub struct LevelMeter {
    window: usize,
    scale: f32,
    tracks: Vec<TrackTap>,
    master: Option<MasterTap>,
}

impl LevelMeter {
    pub fn new(window: usize, scale: f32) -> Self {
        Self {
            window,
            scale,
            tracks: Vec::new(),
            master: None,
        }
    }

    /// Meter an interleaved L/R tap as the master.
    pub fn attach_master(&mut self, tap: rtrb::Consumer<f32>) {
        self.master = Some(MasterTap {
            tap,
            left: Window::new(self.window),
            right: Window::new(self.window),
        });
    }

    /// Swap in the taps of a new strip set, one per track slot.
    pub fn replace_tracks(&mut self, taps: Vec<rtrb::Consumer<f32>>) {
        debug!(tracks = taps.len(), "meter taps replaced");
        self.tracks = taps
            .into_iter()
            .map(|tap| TrackTap {
                tap,
                window: Window::new(self.window),
            })
            .collect();
    }

    /// Drain everything the mixer has written since the last call.
    pub fn sample(&mut self) {
        for track in &mut self.tracks {
            while let Ok(sample) = track.tap.pop() {
                track.window.push(sample);
            }
        }

        if let Some(master) = self.master.as_mut() {
            // pairs only; a trailing left sample waits for its right
            while master.tap.slots() >= 2 {
                let (Ok(left), Ok(right)) = (master.tap.pop(), master.tap.pop()) else {
                    break;
                };
                master.left.push(left);
                master.right.push(right);
            }
        }
    }

    pub fn track_level(&self, slot: usize) -> f32 {
        self.tracks
            .get(slot)
            .map_or(0.0, |t| display_level(t.window.rms(), self.scale))
    }

    pub fn track_levels(&self) -> Vec<f32> {
        (0..self.tracks.len()).map(|slot| self.track_level(slot)).collect()
    }

    /// Left and right master levels.
    pub fn master_stereo_levels(&self) -> (f32, f32) {
        self.master.as_ref().map_or((0.0, 0.0), |m| {
            (
                display_level(m.left.rms(), self.scale),
                display_level(m.right.rms(), self.scale),
            )
        })
    }

    /// Master level over both channels.
    pub fn master_level(&self) -> f32 {
        self.master.as_ref().map_or(0.0, |m| {
            let power = (m.left.rms().powi(2) + m.right.rms().powi(2)) * 0.5;
            display_level(power.sqrt(), self.scale)
        })
    }
}
