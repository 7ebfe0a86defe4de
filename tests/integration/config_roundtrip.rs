//! Configuration persistence through TOML files.

use voxline::VoiceConfig;
use voxline::config::{AudioFormat, TtsModel};

#[test]
fn save_and_reload_preserves_settings() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("nested").join("config.toml");

    let mut config = VoiceConfig::new("voice-xyz");
    config.language_code = "en".into();
    config.tts_model = TtsModel::MultilingualV2;
    config.audio_format = AudioFormat::Pcm24000;
    config.silence_threshold_secs = 0.8;
    config.enable_barge_in = false;
    config.audio.input_device = Some("USB Mic".into());
    config.texts.listening = "Listening…".into();
    config.save_to_file(&path).expect("save config");

    let loaded = VoiceConfig::from_file(&path).expect("load config");
    assert_eq!(loaded.voice_id, "voice-xyz");
    assert_eq!(loaded.language_code, "en");
    assert_eq!(loaded.tts_model, TtsModel::MultilingualV2);
    assert_eq!(loaded.audio_format, AudioFormat::Pcm24000);
    assert!((loaded.silence_threshold_secs - 0.8).abs() < f32::EPSILON);
    assert!(!loaded.enable_barge_in);
    assert_eq!(loaded.audio.input_device.as_deref(), Some("USB Mic"));
    assert_eq!(loaded.texts.listening, "Listening…");
    assert!(loaded.token_provider.is_none());
    assert!(loaded.validate().is_ok());
}

#[test]
fn partial_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "voice_id = \"v1\"\n\n[connection]\nmax_reconnect_attempts = 2\n").expect("write");

    let loaded = VoiceConfig::from_file(&path).expect("load config");
    assert_eq!(loaded.voice_id, "v1");
    assert_eq!(loaded.connection.max_reconnect_attempts, 2);
    assert_eq!(loaded.connection.connect_timeout_ms, 10_000);
    assert_eq!(loaded.sample_rate, 16_000);
}

#[test]
fn unknown_model_id_is_rejected_on_load() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "voice_id = \"v1\"\ntts_model = \"eleven_turbo_v9\"\n").expect("write");
    assert!(VoiceConfig::from_file(&path).is_err());
}
