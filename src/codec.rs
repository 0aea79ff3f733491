//! Audio payload sniffing and WAV → MP3 transcoding.
//!
//! The engine hands back raw WAV; the cache persists MP3. Sniffing looks
//! only at leading bytes so it works on cache payloads and engine output
//! alike, regardless of file extension.

use std::io::Cursor;

use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, MonoPcm, Quality};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioKind {
    Wav,
    Mp3,
    Unknown,
}

/// Identify a payload by its leading bytes: RIFF/WAVE, or an MP3 frame
/// sync (0xFF with the top three bits of the second byte set).
pub fn sniff(bytes: &[u8]) -> AudioKind {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        AudioKind::Wav
    } else if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0 {
        AudioKind::Mp3
    } else {
        AudioKind::Unknown
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("wav parse failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported wav layout: {0}")]
    UnsupportedLayout(String),
    #[error("mp3 encoder: {0}")]
    Encoder(String),
}

/// Transcode a WAV payload to MP3 at 128 kbps, keeping the source sample
/// rate. Mono and interleaved stereo 16-bit PCM (and 32-bit float) are
/// supported; anything else is reported as an unsupported layout so the
/// caller can fall back to storing the WAV bytes.
pub fn wav_to_mp3(wav: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))?;
    let spec = reader.spec();

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            reader.samples::<i16>().collect::<Result<_, _>>()?
        }
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
            .collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(CodecError::UnsupportedLayout(format!(
                "{:?} {} bit",
                format, bits
            )))
        }
    };

    let mut builder =
        Builder::new().ok_or_else(|| CodecError::Encoder("LAME initialization failed".into()))?;
    builder
        .set_num_channels(spec.channels as u8)
        .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?;
    builder
        .set_sample_rate(spec.sample_rate)
        .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?;
    builder
        .set_brate(Bitrate::Kbps128)
        .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?;
    builder
        .set_quality(Quality::Best)
        .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?;
    let mut encoder = builder
        .build()
        .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?;

    let mut out = Vec::new();
    out.reserve(mp3lame_encoder::max_required_buffer_size(samples.len()));

    let encoded = match spec.channels {
        1 => encoder
            .encode(MonoPcm(&samples), out.spare_capacity_mut())
            .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?,
        2 => encoder
            .encode(InterleavedPcm(&samples), out.spare_capacity_mut())
            .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?,
        n => return Err(CodecError::UnsupportedLayout(format!("{} channels", n))),
    };
    // SAFETY: encode() reports how many bytes of the spare capacity it
    // initialized; len grows by exactly that amount.
    unsafe {
        out.set_len(out.len() + encoded);
    }

    let flushed = encoder
        .flush::<FlushNoGap>(out.spare_capacity_mut())
        .map_err(|e| CodecError::Encoder(format!("{:?}", e)))?;
    // SAFETY: same contract as encode() above.
    unsafe {
        out.set_len(out.len() + flushed);
    }

    Ok(out)
}
