//! Voice-note handling: MIME support table, media download and transcription.

use async_trait::async_trait;
use bytes::Bytes;
use pz_channels::{MediaId, MediaSource};
use std::sync::Arc;
use std::time::Duration;

/// Largest audio payload forwarded to speech-to-text.
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

const AUDIO_EXTENSIONS: &[(&str, &str)] = &[
    ("audio/ogg", "ogg"),
    ("audio/opus", "ogg"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/m4a", "m4a"),
    ("audio/x-m4a", "m4a"),
    ("audio/aac", "m4a"),
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/wave", "wav"),
    ("audio/webm", "webm"),
    ("audio/amr", "amr"),
];

fn base_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

pub fn audio_extension(mime: &str) -> Option<&'static str> {
    let base = base_mime(mime);
    AUDIO_EXTENSIONS
        .iter()
        .find(|(m, _)| *m == base)
        .map(|(_, ext)| *ext)
}

/// `audio/ogg; codecs=opus` counts as `audio/ogg`.
pub fn is_audio_supported(mime: &str) -> bool {
    audio_extension(mime).is_some()
}

pub fn file_extension_for(mime: &str) -> &'static str {
    audio_extension(mime).unwrap_or("ogg")
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: Bytes, file_name: &str, mime_type: &str)
    -> anyhow::Result<String>;
}

#[async_trait]
impl SpeechToText for pz_llm::TranscriptionClient {
    async fn transcribe(
        &self,
        audio: Bytes,
        file_name: &str,
        mime_type: &str,
    ) -> anyhow::Result<String> {
        Ok(pz_llm::TranscriptionClient::transcribe(self, audio, file_name, mime_type).await?)
    }
}

/// Downloads voice notes and turns them into text. Every failure is `None`.
pub struct Transcriber {
    media: Arc<dyn MediaSource>,
    stt: Option<Arc<dyn SpeechToText>>,
    timeout: Duration,
    max_bytes: usize,
}

impl Transcriber {
    pub fn new(
        media: Arc<dyn MediaSource>,
        stt: Option<Arc<dyn SpeechToText>>,
        timeout: Duration,
    ) -> Self {
        Self {
            media,
            stt,
            timeout,
            max_bytes: MAX_AUDIO_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn enabled(&self) -> bool {
        self.stt.is_some()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(bytes = audio.len(), mime = %mime_type))]
    pub async fn transcribe(&self, audio: Bytes, mime_type: &str) -> Option<String> {
        if audio.is_empty() {
            tracing::warn!("empty audio buffer");
            return None;
        }
        if audio.len() > self.max_bytes {
            tracing::warn!(limit = self.max_bytes, "audio exceeds size limit");
            return None;
        }
        let Some(stt) = self.stt.as_ref() else {
            tracing::warn!("speech-to-text is not configured");
            return None;
        };

        let file_name = format!("audio.{}", file_extension_for(mime_type));
        let mime = base_mime(mime_type);
        match tokio::time::timeout(self.timeout, stt.transcribe(audio, &file_name, &mime)).await {
            Ok(Ok(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    tracing::warn!("blank transcript");
                    None
                } else {
                    Some(text.to_string())
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "transcription failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "transcription timed out");
                None
            }
        }
    }

    pub async fn fetch_and_transcribe(&self, media_id: &MediaId, mime_type: &str) -> Option<String> {
        let audio = self.media.fetch_media(media_id).await?;
        self.transcribe(audio, mime_type).await
    }
}
