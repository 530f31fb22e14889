mod cache;
mod fetch;
mod objects;
mod store;

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use vox_transport::AudioArc;

pub use cache::{BufferCaches, BufferEntry, BufferKind, ByteCache, DecodedBufferCache};
pub use fetch::{BoxFuture, ByteFetcher, FetchError, SourceFetcher};
pub use objects::{ObjectEntry, ObjectUrls};
pub use store::{BufferError, BufferStore, LoadRequest};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported or corrupt audio: {0}")]
    Format(#[from] SymphoniaError),

    #[error("no decodable audio track")]
    NoTrack,

    #[error("sample rate conversion failed: {0}")]
    Resample(String),

    #[error("decode task was interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode an encoded audio file held in memory into interleaved f32 samples.
///
/// `extension` is only a probing hint; the container is detected from its
/// contents.
pub fn decode_bytes(bytes: Arc<[u8]>, extension: Option<&str>) -> Result<AudioArc, DecodeError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format.default_track().ok_or(DecodeError::NoTrack)?;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0) as u16;
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
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // a damaged frame is skipped, not fatal
            Err(SymphoniaError::DecodeError(msg)) => {
                log::debug!("skipping undecodable packet: {msg}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count() as u16;
        }

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if channels == 0 {
        return Err(DecodeError::NoTrack);
    }

    Ok(AudioArc::new(samples, sample_rate, channels))
}

/// Decode a file from disk.
pub fn decode_file(path: &Path) -> Result<AudioArc, DecodeError> {
    let bytes: Arc<[u8]> = std::fs::read(path)?.into();
    let extension = path.extension().and_then(|e| e.to_str());
    decode_bytes(bytes, extension)
}

/// 16-bit PCM WAV bytes for test fixtures.
#[cfg(test)]
pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Arc<[u8]> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for &sample in samples {
            writer
                .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .expect("write sample");
        }
        writer.finalize().expect("finalize");
    }
    cursor.into_inner().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wav_bytes() {
        let samples: Vec<f32> = (0..2000).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let bytes = wav_bytes(&samples, 22050, 2);

        let audio = decode_bytes(bytes, Some("wav")).expect("decode");
        assert_eq!(audio.sample_rate(), 22050);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 1000);
        assert!((audio.samples()[0] - 0.5).abs() < 0.001);
        assert!((audio.samples()[1] + 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_without_hint_probes_contents() {
        let bytes = wav_bytes(&[0.0; 441], 44100, 1);
        let audio = decode_bytes(bytes, None).expect("decode");
        assert_eq!(audio.frames(), 441);
    }

    #[test]
    fn test_garbage_is_a_format_error() {
        let bytes: Arc<[u8]> = vec![0x13u8; 512].into();
        let err = decode_bytes(bytes, None).unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
    }

    #[test]
    fn test_decode_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("take.wav");
        std::fs::write(&path, wav_bytes(&[0.25; 100], 48000, 1)).expect("write");

        let audio = decode_file(&path).expect("decode");
        assert_eq!(audio.sample_rate(), 48000);
        assert_eq!(audio.frames(), 100);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = decode_file(Path::new("/definitely/not/here.wav")).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }
}
