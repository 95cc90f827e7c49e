use std::io::Cursor;

/// A 32-bit float WAV file holding a 220 Hz sine of the given amplitude.
pub(crate) fn wav_bytes(sample_rate: u32, channels: u16, frames: usize, amplitude: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * amplitude;
            for _ in 0..channels {
                writer.write_sample(sample).expect("write sample");
            }
        }
        writer.finalize().expect("finalize");
    }
    cursor.into_inner()
}
