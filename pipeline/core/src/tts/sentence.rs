//! Sentence batching for speech synthesis
//!
//! Text is released in whole sentences. The first release waits for two
//! complete sentences, the next for three, growing by one up to the batch
//! cap, so early audio starts quickly and later calls amortize better.
//! A buffer that reaches `max_chars` without enough sentences is released
//! as-is.

const SENTENCE_DELIMITERS: [char; 7] = ['.', '!', '?', '。', '！', '？', '\n'];
const INITIAL_BATCH: usize = 2;

/// Accumulates streamed text into synthesis batches
#[derive(Debug)]
pub struct SentenceBuffer {
    pending: String,
    batch_target: usize,
    max_batch: usize,
    max_chars: usize,
}

impl SentenceBuffer {
    /// Create a buffer releasing at most `max_batch` sentences at a time
    #[must_use]
    pub fn new(max_batch: usize, max_chars: usize) -> Self {
        let max_batch = max_batch.max(1);
        Self {
            pending: String::new(),
            batch_target: INITIAL_BATCH.min(max_batch),
            max_batch,
            max_chars: max_chars.max(1),
        }
    }

    /// Append text; returns a batch when one is ready
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);

        let mut complete = 0;
        let mut split_at = None;
        for (index, ch) in self.pending.char_indices() {
            if SENTENCE_DELIMITERS.contains(&ch) {
                complete += 1;
                split_at = Some(index + ch.len_utf8());
            }
        }

        if complete >= self.batch_target {
            let end = split_at?;
            let rest = self.pending.split_off(end);
            let batch = std::mem::replace(&mut self.pending, rest);
            self.batch_target = (self.batch_target + 1).min(self.max_batch);
            return non_empty(batch);
        }

        if self.pending.chars().count() >= self.max_chars {
            return non_empty(std::mem::take(&mut self.pending));
        }

        None
    }

    /// Release whatever is left
    pub fn flush(&mut self) -> Option<String> {
        non_empty(std::mem::take(&mut self.pending))
    }

    /// Sentences required for the next batch
    #[must_use]
    pub fn batch_target(&self) -> usize {
        self.batch_target
    }
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
