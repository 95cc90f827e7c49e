//! Click-free parameter automation.
//!
//! Every gain-like parameter in the signal chain (track volume, pan, solo/mute
//! gate, master volume) is a [`SmoothedParam`]. Changes are requested with
//! [`SmoothedParam::ramp_to`] and approach the target exponentially, one step
//! per sample:
//!
//! `current += coeff * (target - current)` with `coeff = 1 - exp(-1 / (tau * sample_rate))`

/// Once this close to the target the ramp snaps and stops.
const SNAP_THRESHOLD: f32 = 1e-4;

#[derive(Debug, Clone)]
pub struct SmoothedParam {
    current: f32,
    target: f32,
    coeff: f32,
    sample_rate: f32,
    smoothing: bool,
}

impl SmoothedParam {
    pub fn new(sample_rate: u32, value: f32) -> Self {
        Self {
            current: value,
            target: value,
            coeff: 1.0,
            sample_rate: sample_rate.max(1) as f32,
            smoothing: false,
        }
    }

    /// Start moving towards `target` with time constant `duration` seconds.
    /// A non-positive duration jumps immediately.
    pub fn ramp_to(&mut self, target: f32, duration: f32) {
        if !target.is_finite() {
            return;
        }
        if duration <= 0.0 || !duration.is_finite() {
            self.set_immediate(target);
            return;
        }
        self.target = target;
        self.coeff = 1.0 - (-1.0 / (duration * self.sample_rate)).exp();
        self.smoothing = (self.current - target).abs() > SNAP_THRESHOLD;
        if !self.smoothing {
            self.current = target;
        }
    }

    pub fn set_immediate(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.smoothing = false;
    }

    /// Advance one sample and return the value to apply to it.
    #[inline]
    pub fn next_value(&mut self) -> f32 {
        if self.smoothing {
            self.current += self.coeff * (self.target - self.current);
            if (self.current - self.target).abs() < SNAP_THRESHOLD {
                self.current = self.target;
                self.smoothing = false;
            }
        }
        self.current
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    #[inline]
    pub fn is_smoothing(&self) -> bool {
        self.smoothing
    }
}
