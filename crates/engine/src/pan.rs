//! Stereo pan law.
//!
//! Mono sources use constant-power panning (0.707 per side at center).
//! Stereo sources pass through untouched at center; moving the balance off
//! center attenuates the far side and folds it into the near one.

use std::f32::consts::FRAC_PI_2;

/// One source frame entering the pan stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Mono(f32),
    Stereo(f32, f32),
}

impl Frame {
    pub const SILENCE: Frame = Frame::Stereo(0.0, 0.0);

    pub fn scale(self, gain: f32) -> Frame {
        match self {
            Frame::Mono(x) => Frame::Mono(x * gain),
            Frame::Stereo(l, r) => Frame::Stereo(l * gain, r * gain),
        }
    }
}

/// Apply `pan` in [-1, +1] to `frame`, returning the (left, right) pair.
#[inline]
pub fn apply(frame: Frame, pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    match frame {
        Frame::Mono(x) => {
            let angle = (pan + 1.0) * 0.5 * FRAC_PI_2;
            (x * angle.cos(), x * angle.sin())
        }
        Frame::Stereo(l, r) => {
            if pan <= 0.0 {
                let angle = (pan + 1.0) * FRAC_PI_2;
                (l + r * angle.cos(), r * angle.sin())
            } else {
                let angle = pan * FRAC_PI_2;
                (l * angle.cos(), r + l * angle.sin())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_mono_center_is_constant_power() {
        let (l, r) = apply(Frame::Mono(1.0), 0.0);
        assert!(close(l, std::f32::consts::FRAC_1_SQRT_2));
        assert!(close(r, std::f32::consts::FRAC_1_SQRT_2));
        assert!(close(l * l + r * r, 1.0));
    }

    #[test]
    fn test_mono_hard_left_and_right() {
        let (l, r) = apply(Frame::Mono(1.0), -1.0);
        assert!(close(l, 1.0) && close(r, 0.0));

        let (l, r) = apply(Frame::Mono(1.0), 1.0);
        assert!(close(l, 0.0) && close(r, 1.0));
    }

    #[test]
    fn test_stereo_center_passes_through() {
        let (l, r) = apply(Frame::Stereo(0.3, -0.6), 0.0);
        assert!(close(l, 0.3));
        assert!(close(r, -0.6));
    }

    #[test]
    fn test_stereo_hard_left_folds_right_in() {
        let (l, r) = apply(Frame::Stereo(0.25, 0.5), -1.0);
        assert!(close(l, 0.75));
        assert!(close(r, 0.0));
    }

    #[test]
    fn test_stereo_hard_right_folds_left_in() {
        let (l, r) = apply(Frame::Stereo(0.25, 0.5), 1.0);
        assert!(close(l, 0.0));
        assert!(close(r, 0.75));
    }

    #[test]
    fn test_pan_is_clamped() {
        assert_eq!(apply(Frame::Mono(1.0), 5.0), apply(Frame::Mono(1.0), 1.0));
    }

    #[test]
    fn test_scale() {
        assert_eq!(Frame::Stereo(0.5, 1.0).scale(0.5), Frame::Stereo(0.25, 0.5));
        assert_eq!(Frame::Mono(0.8).scale(0.0), Frame::Mono(0.0));
    }
}
