//! Token streaming
//!
//! [`TextStreamer`] turns a growing token sequence into printable text
//! chunks without splitting words or multi-byte characters. [`TextStream`] is
//! the consumer end: a blocking iterator over the chunks produced by the
//! generation thread, with an async adapter for tokio callers.

use crate::tokenizer::TextTokenizer;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use lmshim_common::{LmShimError, Result};
use lmshim_proto::FinishReason;
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

/// How often the async forwarder checks whether its consumer went away
const ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Incremental detokenizer
///
/// Text is released up to the last space, so words are never split. A
/// newline flushes everything and restarts the token cache; a trailing CJK
/// character is released immediately. Text ending in an incomplete UTF-8
/// sequence is held back until the next token completes it. Special tokens
/// such as `<s>` and `</s>` are never part of the output.
pub struct TextStreamer<'a, T: ?Sized> {
    tokenizer: &'a T,
    tokens: Vec<u32>,
    printed_len: usize,
}

impl<'a, T: TextTokenizer + ?Sized> TextStreamer<'a, T> {
    pub fn new(tokenizer: &'a T) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            printed_len: 0,
        }
    }

    /// Add tokens and return any text that became printable
    pub fn put(&mut self, tokens: &[u32]) -> Result<Option<String>> {
        self.tokens.extend_from_slice(tokens);
        let text = self.tokenizer.decode(&self.tokens, true)?;

        let chunk = if text.ends_with('\n') {
            let chunk = self.unprinted(&text, text.len());
            self.tokens.clear();
            self.printed_len = 0;
            chunk
        } else if text.ends_with(char::REPLACEMENT_CHARACTER) {
            None
        } else if text.chars().next_back().is_some_and(is_cjk) {
            let chunk = self.unprinted(&text, text.len());
            self.printed_len = text.len();
            chunk
        } else {
            let end = text
                .rfind(' ')
                .map_or(self.printed_len, |idx| idx + 1)
                .max(self.printed_len);
            let chunk = self.unprinted(&text, end);
            self.printed_len = end;
            chunk
        };

        Ok(chunk)
    }

    /// Flush whatever is left at the end of generation
    pub fn finish(&mut self) -> Result<Option<String>> {
        if self.tokens.is_empty() {
            return Ok(None);
        }

        let text = self.tokenizer.decode(&self.tokens, true)?;
        let chunk = self.unprinted(&text, text.len());
        self.tokens.clear();
        self.printed_len = 0;
        Ok(chunk)
    }

    fn unprinted(&self, text: &str, end: usize) -> Option<String> {
        text.get(self.printed_len..end)
            .filter(|chunk| !chunk.is_empty())
            .map(str::to_string)
    }
}

/// CJK unified ideograph blocks
fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F
    )
}

/// Summary of a finished streamed generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub request_id: Uuid,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub finish_reason: FinishReason,
    pub elapsed: Duration,
}

/// Set by the consumer side when it stops listening
///
/// The producer checks it after every token, so generation stops even when
/// no text chunk is ready to be sent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum Polled {
    Item(Result<String>),
    Pending,
    Done,
}

/// Blocking, single-pass stream of generated text chunks
///
/// Chunks are decoded with special tokens skipped, so `<s>`, `</s>` and
/// padding never appear in the text. Iteration ends when the generation
/// thread finishes; the thread is joined at that point and its error, if
/// any, is yielded as the last item. Dropping the stream early stops
/// generation at the next token.
pub struct TextStream {
    receiver: Option<Receiver<String>>,
    handle: Option<JoinHandle<Result<GenerationReport>>>,
    cancel: CancelFlag,
    report: Option<GenerationReport>,
}

impl TextStream {
    pub(crate) fn new(
        receiver: Receiver<String>,
        handle: JoinHandle<Result<GenerationReport>>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            receiver: Some(receiver),
            handle: Some(handle),
            cancel,
            report: None,
        }
    }

    /// Generation summary, available once the stream is exhausted
    pub fn report(&self) -> Option<&GenerationReport> {
        self.report.as_ref()
    }

    /// Consume the stream from async code
    ///
    /// Must be called inside a tokio runtime. Chunks are forwarded from a
    /// blocking task through a channel holding at most `buffer` items.
    /// Dropping the returned stream cancels generation.
    pub fn into_async(mut self, buffer: usize) -> ReceiverStream<Result<String>> {
        let (tx, rx) = tokio::sync::mpsc::channel(buffer.max(1));

        tokio::task::spawn_blocking(move || {
            while !tx.is_closed() {
                match self.poll_next(ASYNC_POLL_INTERVAL) {
                    Polled::Item(item) => {
                        if tx.blocking_send(item).is_err() {
                            break;
                        }
                    }
                    Polled::Pending => {}
                    Polled::Done => break,
                }
            }
        });

        ReceiverStream::new(rx)
    }

    fn poll_next(&mut self, timeout: Duration) -> Polled {
        if let Some(receiver) = &self.receiver {
            match receiver.recv_timeout(timeout) {
                Ok(chunk) => return Polled::Item(Ok(chunk)),
                Err(RecvTimeoutError::Timeout) => return Polled::Pending,
                Err(RecvTimeoutError::Disconnected) => self.receiver = None,
            }
        }

        match self.finish() {
            Some(item) => Polled::Item(item),
            None => Polled::Done,
        }
    }

    /// Join the producer and turn its outcome into the final item
    fn finish(&mut self) -> Option<Result<String>> {
        match self.join()? {
            Ok(report) => {
                self.report = Some(report);
                None
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn join(&mut self) -> Option<Result<GenerationReport>> {
        let handle = self.handle.take()?;
        Some(
            handle
                .join()
                .unwrap_or_else(|_| Err(LmShimError::internal("generation thread panicked"))),
        )
    }
}

impl Iterator for TextStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(receiver) = &self.receiver {
            if let Ok(chunk) = receiver.recv() {
                return Some(Ok(chunk));
            }
            self.receiver = None;
        }

        self.finish()
    }
}

impl FusedIterator for TextStream {}

impl Drop for TextStream {
    fn drop(&mut self) {
        // Signal and disconnect first so the producer notices and stops
        self.cancel.cancel();
        self.receiver.take();
        if let Some(Err(e)) = self.join() {
            warn!("Abandoned stream finished with error: {}", e);
        }
    }
}
