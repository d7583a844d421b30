//! TTS Publisher
//!
//! Nested producer/consumer that turns streamed answer text into audio.
//!
//! ```text
//! TaskPipeline ──publish(text)──▶ buffer task ──batches──▶ synthesis task ──AudioChunk──▶ TaskPipeline
//!                (unbounded)        SentenceBuffer  (bounded)   SpeechSynthesizer  (bounded)
//! ```
//!
//! The synthesis task runs batches one at a time so audio stays in text
//! order. A failed synthesis is logged and skipped; audio never fails the
//! primary stream. `publish(None)` flushes the buffer and ends the audio
//! with a single [`AudioStatus::Finish`] chunk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::sentence::SentenceBuffer;
use super::{AudioChunk, SpeechSynthesizer};
use crate::entities::TaskId;
use crate::queue::{QueueEvent, QueueMessage};

const BATCH_CHANNEL_SIZE: usize = 8;

/// TTS tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtsConfig {
    /// Release buffered text at this many characters
    pub max_buffer_chars: usize,
    /// Wait this long for trailing audio after the primary stream ends
    pub drain_timeout: Duration,
    /// Capacity of the audio channel
    pub audio_channel_capacity: usize,
    /// Largest number of sentences per synthesis call
    pub max_sentence_batch: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            max_buffer_chars: 300,
            drain_timeout: Duration::from_secs(30),
            audio_channel_capacity: 64,
            max_sentence_batch: 7,
        }
    }
}

impl TtsConfig {
    /// Short drain timeout for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            drain_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

enum Batch {
    Text(String),
    End,
}

/// Handle to a running TTS chain for one task
pub struct TtsPublisher {
    task_id: TaskId,
    input_tx: Option<mpsc::UnboundedSender<Option<QueueMessage>>>,
    audio_rx: mpsc::Receiver<AudioChunk>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for TtsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsPublisher")
            .field("task_id", &self.task_id)
            .field("accepting", &self.input_tx.is_some())
            .finish_non_exhaustive()
    }
}

impl TtsPublisher {
    /// Start the buffering and synthesis tasks
    #[must_use]
    pub fn spawn(
        task_id: TaskId,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voice: Option<String>,
        config: &TtsConfig,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_SIZE);
        let (audio_tx, audio_rx) = mpsc::channel(config.audio_channel_capacity.max(1));

        let buffer = SentenceBuffer::new(config.max_sentence_batch, config.max_buffer_chars);
        let buffering = tokio::spawn(run_buffer(task_id.clone(), buffer, input_rx, batch_tx));
        let synthesis = tokio::spawn(run_synthesis(
            task_id.clone(),
            synthesizer,
            voice,
            batch_rx,
            audio_tx,
        ));

        tracing::debug!(task_id = %task_id, "TTS publisher started");
        Self {
            task_id,
            input_tx: Some(input_tx),
            audio_rx,
            tasks: vec![buffering, synthesis],
        }
    }

    /// Mirror a queue message; `None` marks the end of the text
    pub fn publish(&mut self, message: Option<QueueMessage>) {
        let end = message.is_none();
        if let Some(tx) = &self.input_tx {
            if tx.send(message).is_err() {
                tracing::debug!(task_id = %self.task_id, "TTS buffer task already finished");
            }
        }
        if end {
            self.input_tx = None;
        }
    }

    /// Next ready chunk without waiting
    pub fn try_next_audio(&mut self) -> Option<AudioChunk> {
        self.audio_rx.try_recv().ok()
    }

    /// Next chunk, waiting no later than `deadline`
    ///
    /// Returns `None` when the deadline passes or the chain has shut down.
    pub async fn next_audio_until(&mut self, deadline: Instant) -> Option<AudioChunk> {
        match tokio::time::timeout_at(deadline, self.audio_rx.recv()).await {
            Ok(chunk) => chunk,
            Err(_elapsed) => {
                tracing::warn!(task_id = %self.task_id, "Timed out waiting for trailing audio");
                None
            }
        }
    }
}

impl Drop for TtsPublisher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_buffer(
    task_id: TaskId,
    mut buffer: SentenceBuffer,
    mut input_rx: mpsc::UnboundedReceiver<Option<QueueMessage>>,
    batch_tx: mpsc::Sender<Batch>,
) {
    while let Some(message) = input_rx.recv().await {
        let Some(message) = message else {
            if let Some(rest) = buffer.flush() {
                if batch_tx.send(Batch::Text(rest)).await.is_err() {
                    return;
                }
            }
            // Receiver gone means the chain is shutting down; nothing left to end.
            let _ = batch_tx.send(Batch::End).await;
            return;
        };

        let QueueEvent::TextChunk { text, .. } = &message.event else {
            continue;
        };

        if let Some(batch) = buffer.push(text) {
            if batch_tx.send(Batch::Text(batch)).await.is_err() {
                return;
            }
        }
    }

    tracing::debug!(task_id = %task_id, "TTS input closed without end marker");
}

async fn run_synthesis(
    task_id: TaskId,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice: Option<String>,
    mut batch_rx: mpsc::Receiver<Batch>,
    audio_tx: mpsc::Sender<AudioChunk>,
) {
    while let Some(batch) = batch_rx.recv().await {
        let text = match batch {
            Batch::Text(text) => text,
            Batch::End => {
                // The pipeline may already have stopped listening.
                let _ = audio_tx.send(AudioChunk::finish()).await;
                return;
            }
        };

        match synthesizer.synthesize(&text, voice.as_deref()).await {
            Ok(chunks) => {
                for audio in chunks {
                    if audio_tx.send(AudioChunk::pending(audio)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    error = %e,
                    chars = text.chars().count(),
                    "Speech synthesis failed, skipping batch"
                );
            }
        }
    }
}
