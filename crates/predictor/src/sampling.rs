//! Next-token selection
//!
//! Logits go through the repetition penalty, then n-gram banning, then
//! temperature/top-k/top-p sampling (or argmax for greedy decoding).

use crate::generate_args::GenerateArgs;
use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use lmshim_common::Result;
use tracing::{trace, warn};

/// Map generation arguments onto a sampling strategy
pub fn sampling_for(args: &GenerateArgs) -> Sampling {
    if !args.do_sample {
        return Sampling::ArgMax;
    }

    let temperature = f64::from(args.temperature);
    let top_p = f64::from(args.top_p);
    let use_top_k = args.top_k > 0;
    let use_top_p = top_p < 1.0;

    match (use_top_k, use_top_p) {
        (true, true) => Sampling::TopKThenTopP {
            k: args.top_k,
            p: top_p,
            temperature,
        },
        (true, false) => Sampling::TopK {
            k: args.top_k,
            temperature,
        },
        (false, true) => Sampling::TopP {
            p: top_p,
            temperature,
        },
        (false, false) => Sampling::All { temperature },
    }
}

/// Tokens that would complete an n-gram already present in `tokens`
///
/// Returns a sorted, deduplicated list. Empty when `ngram_size` is 0 or the
/// sequence is too short to repeat anything.
pub fn banned_ngram_tokens(tokens: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || tokens.len() + 1 < ngram_size {
        return Vec::new();
    }

    let prefix = &tokens[tokens.len() + 1 - ngram_size..];
    let mut banned: Vec<u32> = tokens
        .windows(ngram_size)
        .filter(|window| &window[..ngram_size - 1] == prefix)
        .map(|window| window[ngram_size - 1])
        .collect();

    banned.sort_unstable();
    banned.dedup();
    banned
}

/// Stateful logits-to-token pipeline for one generation
pub struct LogitsPipeline {
    processor: LogitsProcessor,
    repetition_penalty: f32,
    no_repeat_ngram_size: usize,
}

impl LogitsPipeline {
    /// Build the pipeline for a request, seeding the sampler
    pub fn new(args: &GenerateArgs) -> Self {
        let seed = args.seed.unwrap_or_else(rand::random);

        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling_for(args)),
            repetition_penalty: args.repetition_penalty,
            no_repeat_ngram_size: args.no_repeat_ngram_size,
        }
    }

    /// Choose the next token given last-position logits and the sequence so far
    pub fn next_token(&mut self, logits: &Tensor, tokens: &[u32]) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;

        let logits = if self.repetition_penalty == 1.0 {
            logits
        } else {
            apply_repeat_penalty(&logits, self.repetition_penalty, tokens)?
        };

        let logits = self.ban_repeated_ngrams(logits, tokens)?;
        Ok(self.processor.sample(&logits)?)
    }

    fn ban_repeated_ngrams(&self, logits: Tensor, tokens: &[u32]) -> Result<Tensor> {
        let banned = banned_ngram_tokens(tokens, self.no_repeat_ngram_size);
        if banned.is_empty() {
            return Ok(logits);
        }

        let device = logits.device().clone();
        let mut values = logits.to_vec1::<f32>()?;

        let remaining = values
            .iter()
            .enumerate()
            .filter(|(idx, v)| v.is_finite() && banned.binary_search(&(*idx as u32)).is_err())
            .count();
        if remaining == 0 {
            warn!("Every candidate repeats an n-gram, skipping the ban for this step");
            return Ok(logits);
        }

        for &token in &banned {
            if let Some(value) = values.get_mut(token as usize) {
                *value = f32::NEG_INFINITY;
            }
        }

        trace!("Banned {} token(s) to avoid repeated n-grams", banned.len());

        let len = values.len();
        Ok(Tensor::from_vec(values, len, &device)?)
    }
}
