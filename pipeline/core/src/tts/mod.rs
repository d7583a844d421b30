//! Text-to-speech sub-pipeline
//!
//! Only the chunked-audio contract of the speech backend matters here: a
//! [`SpeechSynthesizer`] turns a batch of sentences into zero or more audio
//! byte chunks.

mod publisher;
mod sentence;

use async_trait::async_trait;

use crate::error::SynthesisError;

pub use publisher::{TtsConfig, TtsPublisher};
pub use sentence::SentenceBuffer;

/// Speech backend
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`, returning audio chunks in playback order
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, SynthesisError>;
}

/// Whether more audio follows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioStatus {
    /// More audio may follow
    Pending,
    /// Last chunk; carries no audio
    Finish,
}

/// Audio produced by the TTS publisher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioChunk {
    /// Raw audio bytes
    pub audio: Vec<u8>,
    /// Chunk status
    pub status: AudioStatus,
}

impl AudioChunk {
    /// A chunk of audio
    #[must_use]
    pub fn pending(audio: Vec<u8>) -> Self {
        Self {
            audio,
            status: AudioStatus::Pending,
        }
    }

    /// The end marker
    #[must_use]
    pub fn finish() -> Self {
        Self {
            audio: Vec::new(),
            status: AudioStatus::Finish,
        }
    }
}
