use std::io::Cursor;
use std::path::Path;

use rehearse_transport::AudioArc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Extension of a byte-source reference, used as a format hint.
/// Query strings and fragments (`take.mp3?v=2`) are ignored.
pub fn extension_hint(reference: &str) -> Option<&str> {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
}

/// Decode an in-memory encoded stream into interleaved f32 samples.
///
/// The byte content is opaque; the container is probed, `hint` only speeds
/// that up.
pub fn decode_bytes(bytes: Vec<u8>, hint: Option<&str>) -> anyhow::Result<AudioArc> {
    if bytes.is_empty() {
        anyhow::bail!("empty byte stream");
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut probe_hint = Hint::new();
    if let Some(ext) = hint {
        probe_hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &probe_hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default track"))?;

    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track.codec_params.channels.map(|c| c.count());
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        channels.get_or_insert(spec.channels.count());
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    let channels = u16::try_from(channels.unwrap_or(2))?;
    if samples.is_empty() || channels == 0 {
        anyhow::bail!("stream contained no audio");
    }

    Ok(AudioArc::new(samples, sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16-bit PCM WAV holding a sawtooth that steps by 100 per frame.
    fn pcm16_wav(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
            for i in 0..frames {
                let sample = (i % 256) as i16 * 100;
                for _ in 0..channels {
                    writer.write_sample(sample).expect("write sample");
                }
            }
            writer.finalize().expect("finalize");
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav_bytes() {
        let bytes = pcm16_wav(48000, 2, 4800);
        let audio = decode_bytes(bytes, Some("wav")).expect("decode");

        assert_eq!(audio.sample_rate(), 48000);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 4800);
        // integer PCM comes out normalized
        let (left, right) = audio.stereo_frame(3).unwrap();
        assert!((left - 300.0 / 32768.0).abs() < 1e-6);
        assert_eq!(left, right);
    }

    #[test]
    fn test_decode_without_hint() {
        let bytes = pcm16_wav(44100, 1, 441);
        let audio = decode_bytes(bytes, None).expect("decode");

        assert_eq!(audio.sample_rate(), 44100);
        assert_eq!(audio.channels(), 1);
        assert_eq!(audio.frames(), 441);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let garbage: Vec<u8> = (0..2048u32).map(|i| (i * 31 % 251) as u8).collect();
        assert!(decode_bytes(garbage, Some("wav")).is_err());
    }

    #[test]
    fn test_decode_empty_fails() {
        assert!(decode_bytes(Vec::new(), None).is_err());
    }

    #[test]
    fn test_extension_hint() {
        assert_eq!(extension_hint("stems/bass.wav"), Some("wav"));
        assert_eq!(extension_hint("https://cdn/x/take.mp3?v=2"), Some("mp3"));
        assert_eq!(extension_hint("blob:abc-123"), None);
        assert_eq!(extension_hint("noext"), None);
    }
}
