//! Autoregressive generation loop

use crate::generate_args::GenerateArgs;
use crate::model::LanguageModel;
use crate::sampling::LogitsPipeline;
use lmshim_common::{LmShimError, Result};
use lmshim_proto::FinishReason;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Prompt followed by generated tokens
    pub tokens: Vec<u32>,

    pub prompt_len: usize,

    pub finish_reason: FinishReason,

    pub elapsed: Duration,
}

impl GenerationOutput {
    /// Tokens produced after the prompt
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.generated().len() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Reject prompts that leave no room for a single new token
pub fn check_prompt_fits(prompt_len: usize, context_length: usize) -> Result<()> {
    if prompt_len == 0 {
        return Err(LmShimError::invalid_input("prompt encodes to zero tokens"));
    }
    if prompt_len >= context_length {
        return Err(LmShimError::invalid_input(format!(
            "prompt is {} tokens but the model context is {}",
            prompt_len, context_length
        )));
    }
    Ok(())
}

/// Generate a continuation of `prompt`
///
/// `on_token` sees every new token, end-of-sequence included, and returns
/// `false` to stop early.
pub fn generate<M, F>(
    model: &mut M,
    prompt: &[u32],
    args: &GenerateArgs,
    mut on_token: F,
) -> Result<GenerationOutput>
where
    M: LanguageModel + ?Sized,
    F: FnMut(u32) -> bool,
{
    let context_length = model.context_length();
    check_prompt_fits(prompt.len(), context_length)?;

    let budget = args.max_new_tokens.min(context_length - prompt.len());
    if budget < args.max_new_tokens {
        warn!(
            "Clamping max_new_tokens from {} to {} to fit the context window",
            args.max_new_tokens, budget
        );
    }

    debug!(
        "Generating up to {} tokens after a {}-token prompt",
        budget,
        prompt.len()
    );

    let start = Instant::now();
    model.reset(args.use_cache)?;
    let mut pipeline = LogitsPipeline::new(args);
    let mut tokens = Vec::with_capacity(prompt.len() + budget);
    tokens.extend_from_slice(prompt);
    let mut finish_reason = FinishReason::Length;

    for step in 0..budget {
        let logits = if args.use_cache && step > 0 {
            let pos = tokens.len() - 1;
            model.forward(&tokens[pos..], pos)?
        } else {
            model.forward(&tokens, 0)?
        };

        let next_token = pipeline.next_token(&logits, &tokens)?;
        tokens.push(next_token);

        let keep_going = on_token(next_token);
        if args.eos_token_ids.contains(&next_token) {
            finish_reason = FinishReason::Stop;
            break;
        }
        if !keep_going {
            finish_reason = FinishReason::Cancelled;
            break;
        }
    }

    let output = GenerationOutput {
        tokens,
        prompt_len: prompt.len(),
        finish_reason,
        elapsed: start.elapsed(),
    };

    debug!(
        "Generated {} tokens in {:.2?} ({:.1} tok/s), finish reason {:?}",
        output.generated().len(),
        output.elapsed,
        output.tokens_per_second(),
        output.finish_reason
    );

    Ok(output)
}
