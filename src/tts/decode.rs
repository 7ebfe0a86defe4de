//! Decoding synthesized audio into mono f32 samples.

use crate::audio::pcm;
use crate::audio::playback::DecodedAudio;
use crate::config::AudioFormat;
use crate::error::{Result, VoiceError, VoiceErrorCode};

/// Sample rate of the raw PCM output format.
const PCM_24000_RATE: u32 = 24_000;

fn decode_error(detail: impl std::fmt::Display) -> VoiceError {
    VoiceError::with_message(VoiceErrorCode::SynthesisFailed, format!("audio decode error: {detail}"))
}

/// Decode a complete synthesis payload.
///
/// # Errors
///
/// Returns `synthesis-failed` if the payload cannot be decoded.
pub fn decode(bytes: &[u8], format: AudioFormat) -> Result<DecodedAudio> {
    match format {
        AudioFormat::Pcm24000 => Ok(DecodedAudio {
            samples: pcm::pcm16_to_float(&pcm::le_bytes_to_pcm16(bytes)),
            sample_rate: PCM_24000_RATE,
        }),
        AudioFormat::Mp3_44100_128 => decode_compressed(bytes.to_vec(), "mp3"),
    }
}

fn decode_compressed(bytes: Vec<u8>, extension: &str) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(Box::new(std::io::Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(extension);

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| decode_error(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| decode_error("no default audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut sample_rate = codec_params.sample_rate;
    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| decode_error(format!("failed to create decoder: {e}")))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(decode_error(e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(decode_error(e)),
        };

        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;

        let needed = (frames as usize).saturating_mul(channels);
        match sample_buf.as_mut() {
            Some(b) if b.capacity() >= needed => b.clear(),
            _ => sample_buf = Some(SampleBuffer::<f32>::new(frames, spec)),
        }

        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);
        out.extend(pcm::to_mono(buf.samples(), channels as u16));
    }

    let sample_rate = sample_rate.ok_or_else(|| decode_error("unknown sample rate"))?;
    if out.is_empty() {
        return Err(decode_error("no audio frames decoded"));
    }
    Ok(DecodedAudio {
        samples: out,
        sample_rate,
    })
}
