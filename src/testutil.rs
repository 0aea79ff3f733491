//! Shared helpers for the crate's test modules.

use std::io::Cursor;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Generate a valid 24 kHz mono 16-bit WAV: a quiet 440 Hz tone of the
/// given duration.
pub fn make_wav_bytes(duration_ms: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let total = 24_000u32 * duration_ms / 1000;
        for n in 0..total {
            let t = n as f32 / 24_000.0;
            let sample = (t * 440.0 * std::f32::consts::TAU).sin();
            writer.write_sample((sample * 8000.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// The parameter document `/audio_query` hands back before the client
/// edits the scale fields.
pub fn audio_query_body() -> serde_json::Value {
    json!({
        "accentPhrases": [],
        "speedScale": 1.0,
        "pitchScale": 0.0,
        "volumeScale": 1.0,
        "prePhonemeLength": 0.1,
        "postPhonemeLength": 0.1,
        "outputSamplingRate": 24_000,
        "outputStereo": false,
        "kana": ""
    })
}

/// Mount the full engine surface on a mock server: `/version`,
/// `/initialize_speaker`, `/audio_query`, and `/synthesis` returning a
/// short valid WAV.
pub async fn mount_engine(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("\"0.14.0\""))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/initialize_speaker"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/audio_query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(audio_query_body()))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesis"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/wav")
                .set_body_bytes(make_wav_bytes(40)),
        )
        .mount(server)
        .await;
}
