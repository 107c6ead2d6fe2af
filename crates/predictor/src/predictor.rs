//! Predictor facade
//!
//! Ties preprocessing, prompt formatting, generation and decoding together.
//! The model sits behind a mutex so generations run one at a time; the
//! tokenizer is shared with streaming producer threads.

use crate::generate_args::{preprocess, PreparedRequest};
use crate::generation::{check_prompt_fits, generate, GenerationOutput};
use crate::hub::ModelFiles;
use crate::model::{LanguageModel, LlamaModel};
use crate::prompt::format_prompt;
use crate::streamer::{CancelFlag, GenerationReport, TextStream, TextStreamer};
use crate::tokenizer::{HfTokenizer, SpecialTokens, TextTokenizer};
use crossbeam::channel::Sender;
use lmshim_common::config::GenerationDefaults;
use lmshim_common::{LatencyTimer, LmShimError, PredictorConfig, Result, METRICS};
use lmshim_proto::{CompletionResponse, PredictRequest};
use parking_lot::{Mutex, MutexGuard};
use prometheus::IntGauge;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span};

const GENERATE_THREAD_NAME: &str = "lmshim-generate";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of [`Predictor::predict`]
pub enum Prediction {
    Complete(CompletionResponse),
    Stream(TextStream),
}

/// Chat completion predictor
pub struct Predictor<M = LlamaModel, T = HfTokenizer> {
    model: Arc<Mutex<M>>,
    tokenizer: Arc<T>,
    special_tokens: SpecialTokens,
    defaults: GenerationDefaults,
    context_length: usize,
    stream_buffer: usize,
    lock_timeout: Duration,
}

impl Predictor {
    /// Resolve model files, then load the tokenizer and weights
    pub fn load(config: &PredictorConfig) -> Result<Self> {
        let start = Instant::now();
        let files = ModelFiles::resolve(&config.model)?;

        let tokenizer = HfTokenizer::from_file(&files.tokenizer)?;
        let special_tokens = SpecialTokens::from_files(
            &tokenizer,
            files.tokenizer_config.as_deref(),
            &files.config,
        )?;
        info!(
            "Tokenizer ready: {} tokens, special tokens {:?}",
            tokenizer.vocab_size(),
            special_tokens
        );

        let model = LlamaModel::load(&files, &config.runtime)?;
        info!("Predictor ready in {:.2?}", start.elapsed());

        Ok(Self::from_parts(
            model,
            tokenizer,
            special_tokens,
            config.generation.clone(),
        )
        .with_stream_buffer(config.runtime.stream_buffer)
        .with_lock_timeout(Duration::from_secs(config.runtime.lock_timeout_secs)))
    }
}

impl<M, T> Predictor<M, T>
where
    M: LanguageModel + 'static,
    T: TextTokenizer + 'static,
{
    pub fn from_parts(
        model: M,
        tokenizer: T,
        special_tokens: SpecialTokens,
        defaults: GenerationDefaults,
    ) -> Self {
        let context_length = model.context_length();

        Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
            special_tokens,
            defaults,
            context_length,
            stream_buffer: 64,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set how many text chunks a stream buffers ahead of its consumer
    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }

    /// Set how long a request waits for a running generation to finish
    ///
    /// A stream holds the model until it is read to the end or dropped, so a
    /// caller that keeps an unread stream and starts another request gets a
    /// busy error instead of blocking forever.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }

    /// Merge a request with the configured defaults
    pub fn preprocess(&self, request: PredictRequest) -> Result<PreparedRequest> {
        preprocess(request, &self.defaults, &self.special_tokens).map_err(|e| {
            record_failure(&e);
            e
        })
    }

    /// Run a prepared request, streaming or not as it asks
    pub fn predict(&self, prepared: PreparedRequest) -> Result<Prediction> {
        if prepared.stream {
            self.stream(prepared).map(Prediction::Stream)
        } else {
            self.complete(prepared).map(Prediction::Complete)
        }
    }

    /// Generate the whole completion before returning
    pub fn complete(&self, prepared: PreparedRequest) -> Result<CompletionResponse> {
        let span = info_span!("complete", request_id = %prepared.request_id);
        let _entered = span.enter();

        METRICS.inference.requests_total.inc();
        let _active = GaugeGuard::new(&METRICS.inference.active_requests);
        let start = Instant::now();

        let result = METRICS
            .inference
            .request_duration
            .time(|| self.run_complete(&prepared));
        match &result {
            Ok(response) => {
                METRICS.inference.requests_success.inc();
                info!(
                    "Completed in {:.2?}: {} prompt + {} new tokens, {:?}",
                    start.elapsed(),
                    response.prompt_tokens,
                    response.completion_tokens,
                    response.finish_reason
                );
            }
            Err(e) => {
                record_failure(e);
                error!("Completion failed: {}", e);
            }
        }

        result
    }

    fn run_complete(&self, prepared: &PreparedRequest) -> Result<CompletionResponse> {
        let prompt_ids = self.encode_prompt(prepared)?;

        let output = {
            let mut model = lock_model(&self.model, self.lock_timeout)?;
            generate(&mut *model, &prompt_ids, &prepared.generate_args, |_| true)?
        };
        record_generation(&output);

        let output_ids = if prepared.echo_prompt {
            &output.tokens[..]
        } else {
            output.generated()
        };
        let output_ids = strip_trailing_pad(output_ids, prepared.generate_args.pad_token_id);
        if output_ids.is_empty() {
            return Err(LmShimError::EmptyOutput);
        }

        let text = self.tokenizer.decode(output_ids, true)?;

        Ok(CompletionResponse {
            text,
            prompt_tokens: output.prompt_len,
            completion_tokens: output.generated().len(),
            finish_reason: output.finish_reason,
        })
    }

    /// Start generating on a background thread and return the text stream
    ///
    /// Prompt errors are returned here; errors during generation arrive as
    /// the last item of the stream.
    pub fn stream(&self, prepared: PreparedRequest) -> Result<TextStream> {
        METRICS.inference.requests_total.inc();

        let prompt_ids = match self.encode_prompt(&prepared) {
            Ok(ids) => ids,
            Err(e) => {
                record_failure(&e);
                return Err(e);
            }
        };

        let (tx, rx) = crossbeam::channel::bounded(self.stream_buffer);
        let cancel = CancelFlag::default();
        let producer_cancel = cancel.clone();
        let lock_timeout = self.lock_timeout;
        let model = Arc::clone(&self.model);
        let tokenizer = Arc::clone(&self.tokenizer);
        let span = info_span!("stream", request_id = %prepared.request_id);

        let handle = std::thread::Builder::new()
            .name(GENERATE_THREAD_NAME.to_string())
            .spawn(move || {
                let _entered = span.enter();
                let _active = GaugeGuard::new(&METRICS.inference.active_streams);

                let sink = ChunkSink::new(&tx, &producer_cancel);
                let result = run_stream(
                    &model,
                    lock_timeout,
                    tokenizer.as_ref(),
                    &prepared,
                    &prompt_ids,
                    sink,
                );
                match &result {
                    Ok(report) => {
                        METRICS.inference.requests_success.inc();
                        METRICS
                            .inference
                            .request_duration
                            .observe(report.elapsed.as_secs_f64());
                        info!(
                            "Stream finished in {:.2?}: {} prompt + {} new tokens, {:?}",
                            report.elapsed,
                            report.prompt_tokens,
                            report.completion_tokens,
                            report.finish_reason
                        );
                    }
                    Err(e) => {
                        record_failure(e);
                        error!("Stream failed: {}", e);
                    }
                }
                result
            })?;

        Ok(TextStream::new(rx, handle, cancel))
    }

    fn encode_prompt(&self, prepared: &PreparedRequest) -> Result<Vec<u32>> {
        let prompt = format_prompt(&prepared.messages);
        let prompt_ids = self.tokenizer.encode(&prompt)?;
        check_prompt_fits(prompt_ids.len(), self.context_length)?;

        debug!("Prompt is {} tokens", prompt_ids.len());
        METRICS.inference.prompt_tokens.observe(prompt_ids.len() as f64);
        Ok(prompt_ids)
    }
}

/// Producer side of a stream
fn run_stream<M, T>(
    model: &Mutex<M>,
    lock_timeout: Duration,
    tokenizer: &T,
    prepared: &PreparedRequest,
    prompt_ids: &[u32],
    mut sink: ChunkSink<'_>,
) -> Result<GenerationReport>
where
    M: LanguageModel,
    T: TextTokenizer + ?Sized,
{
    let start = Instant::now();
    let mut streamer = TextStreamer::new(tokenizer);

    if prepared.echo_prompt {
        sink.send(streamer.put(prompt_ids)?);
    }

    let mut failure = None;
    let output = {
        let mut model = lock_model(model, lock_timeout)?;
        generate(&mut *model, prompt_ids, &prepared.generate_args, |token| {
            match streamer.put(&[token]) {
                Ok(chunk) => sink.send(chunk),
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?
    };
    if let Some(e) = failure {
        return Err(e);
    }

    sink.send(streamer.finish()?);
    record_generation(&output);

    Ok(GenerationReport {
        request_id: prepared.request_id,
        prompt_tokens: output.prompt_len,
        completion_tokens: output.generated().len(),
        finish_reason: output.finish_reason,
        elapsed: start.elapsed(),
    })
}

fn lock_model<M>(model: &Mutex<M>, timeout: Duration) -> Result<MutexGuard<'_, M>> {
    model.try_lock_for(timeout).ok_or_else(|| {
        LmShimError::busy(format!(
            "model still generating after {:.1?}; an unread stream keeps it locked until dropped",
            timeout
        ))
    })
}

/// Sending half of a stream that remembers when the consumer went away
struct ChunkSink<'a> {
    tx: &'a Sender<String>,
    cancel: &'a CancelFlag,
    connected: bool,
}

impl<'a> ChunkSink<'a> {
    fn new(tx: &'a Sender<String>, cancel: &'a CancelFlag) -> Self {
        Self {
            tx,
            cancel,
            connected: true,
        }
    }

    /// Returns whether anyone is still listening
    ///
    /// Called on every token, with or without a chunk to send.
    fn send(&mut self, chunk: Option<String>) -> bool {
        if self.connected && self.cancel.is_cancelled() {
            debug!("Stream dropped by its consumer, stopping generation");
            self.connected = false;
        }
        if let Some(chunk) = chunk {
            if self.connected && self.tx.send(chunk).is_err() {
                debug!("Stream consumer disconnected, stopping generation");
                self.connected = false;
            }
        }
        self.connected
    }
}

/// Keeps a gauge incremented for its lifetime
struct GaugeGuard(IntGauge);

impl GaugeGuard {
    fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

fn strip_trailing_pad(tokens: &[u32], pad_token_id: Option<u32>) -> &[u32] {
    let Some(pad) = pad_token_id else {
        return tokens;
    };
    let end = tokens
        .iter()
        .rposition(|&token| token != pad)
        .map_or(0, |idx| idx + 1);
    &tokens[..end]
}

fn record_generation(output: &GenerationOutput) {
    METRICS
        .inference
        .tokens_generated_total
        .inc_by(output.generated().len() as u64);
    METRICS
        .inference
        .tokens_per_second
        .observe(output.tokens_per_second());
}

fn record_failure(err: &LmShimError) {
    METRICS
        .inference
        .requests_failed
        .with_label_values(&[err.kind()])
        .inc();
}
