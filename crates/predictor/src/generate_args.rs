//! Request preprocessing
//!
//! Merges the caller's generation parameters over the configured defaults
//! and produces a [`PreparedRequest`] ready for the predictor.

use crate::tokenizer::SpecialTokens;
use lmshim_common::config::GenerationDefaults;
use lmshim_common::{LmShimError, Result};
use lmshim_proto::{ChatMessage, PredictRequest};
use uuid::Uuid;

/// Fully resolved generation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateArgs {
    /// Upper bound on generated tokens
    pub max_new_tokens: usize,

    /// Softmax temperature (sampling only)
    pub temperature: f32,

    /// Nucleus mass to keep; 1.0 disables the filter
    pub top_p: f32,

    /// Candidates to keep; 0 disables the filter
    pub top_k: usize,

    /// Penalty on tokens already in the sequence; 1.0 disables it
    pub repetition_penalty: f32,

    /// Forbid repeating n-grams of this size; 0 disables it
    pub no_repeat_ngram_size: usize,

    /// Sample instead of taking the argmax
    pub do_sample: bool,

    /// Reuse attention keys/values between steps
    pub use_cache: bool,

    /// Sampling seed, random when unset
    pub seed: Option<u64>,

    /// Any of these ends the sequence
    pub eos_token_ids: Vec<u32>,

    /// Padding token, stripped from the tail of decoded output
    pub pad_token_id: Option<u32>,
}

impl GenerateArgs {
    /// Merge request overrides over defaults
    pub fn merge(
        request: &PredictRequest,
        defaults: &GenerationDefaults,
        special_tokens: &SpecialTokens,
    ) -> Result<Self> {
        let args = Self {
            // Zero is treated like an absent value
            max_new_tokens: request
                .max_tokens
                .filter(|&n| n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.max_new_tokens),
            temperature: request.temperature.unwrap_or(defaults.temperature),
            top_p: request.top_p.unwrap_or(defaults.top_p),
            top_k: request.top_k.unwrap_or(defaults.top_k),
            repetition_penalty: request
                .repetition_penalty
                .unwrap_or(defaults.repetition_penalty),
            no_repeat_ngram_size: request
                .no_repeat_ngram_size
                .unwrap_or(defaults.no_repeat_ngram_size),
            do_sample: request.do_sample.unwrap_or(defaults.do_sample),
            use_cache: defaults.use_cache,
            seed: request.seed,
            eos_token_ids: special_tokens.eos.clone(),
            pad_token_id: special_tokens.pad,
        };

        args.validate()?;
        Ok(args)
    }

    /// Reject parameter combinations the sampler cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.do_sample && !(self.temperature > 0.0) {
            return Err(LmShimError::invalid_input(format!(
                "temperature must be strictly positive when sampling, got {}",
                self.temperature
            )));
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(LmShimError::invalid_input(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }

        if !(self.repetition_penalty > 0.0) {
            return Err(LmShimError::invalid_input(format!(
                "repetition_penalty must be strictly positive, got {}",
                self.repetition_penalty
            )));
        }

        Ok(())
    }
}

/// A request after preprocessing
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// Correlates log lines for this request
    pub request_id: Uuid,

    pub messages: Vec<ChatMessage>,

    pub stream: bool,

    /// Prompt text is part of the output
    pub echo_prompt: bool,

    pub generate_args: GenerateArgs,
}

/// Resolve a raw request into a prepared one
pub fn preprocess(
    request: PredictRequest,
    defaults: &GenerationDefaults,
    special_tokens: &SpecialTokens,
) -> Result<PreparedRequest> {
    let generate_args = GenerateArgs::merge(&request, defaults, special_tokens)?;

    Ok(PreparedRequest {
        request_id: Uuid::new_v4(),
        stream: request.stream.unwrap_or(defaults.stream),
        echo_prompt: defaults.echo_prompt,
        messages: request.messages,
        generate_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn special_tokens() -> SpecialTokens {
        SpecialTokens {
            bos: Some(1),
            eos: vec![2],
            pad: Some(0),
        }
    }

    fn request() -> PredictRequest {
        PredictRequest {
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let prepared =
            preprocess(request(), &GenerationDefaults::default(), &special_tokens()).unwrap();
        let args = &prepared.generate_args;

        assert!(!prepared.stream);
        assert!(prepared.echo_prompt);
        assert_eq!(args.max_new_tokens, 256);
        assert_eq!(args.temperature, 0.7);
        assert_eq!(args.top_p, 0.8);
        assert_eq!(args.top_k, 40);
        assert_eq!(args.repetition_penalty, 1.3);
        assert_eq!(args.no_repeat_ngram_size, 5);
        assert!(args.do_sample);
        assert!(args.use_cache);
        assert_eq!(args.seed, None);
        assert_eq!(args.eos_token_ids, vec![2]);
        assert_eq!(args.pad_token_id, Some(0));
    }

    #[test]
    fn test_overrides_applied() {
        let request = PredictRequest {
            stream: Some(true),
            max_tokens: Some(12),
            temperature: Some(1.1),
            top_p: Some(0.5),
            top_k: Some(0),
            repetition_penalty: Some(1.0),
            no_repeat_ngram_size: Some(3),
            do_sample: Some(false),
            seed: Some(7),
            ..request()
        };

        let prepared =
            preprocess(request, &GenerationDefaults::default(), &special_tokens()).unwrap();
        let args = &prepared.generate_args;

        assert!(prepared.stream);
        assert_eq!(args.max_new_tokens, 12);
        assert_eq!(args.temperature, 1.1);
        assert_eq!(args.top_p, 0.5);
        assert_eq!(args.top_k, 0);
        assert_eq!(args.repetition_penalty, 1.0);
        assert_eq!(args.no_repeat_ngram_size, 3);
        assert!(!args.do_sample);
        assert_eq!(args.seed, Some(7));
    }

    #[test]
    fn test_zero_max_tokens_uses_default() {
        let request = PredictRequest {
            max_tokens: Some(0),
            ..request()
        };

        let args =
            GenerateArgs::merge(&request, &GenerationDefaults::default(), &special_tokens())
                .unwrap();
        assert_eq!(args.max_new_tokens, 256);
    }

    #[test]
    fn test_configured_defaults_win_over_builtin() {
        let defaults = GenerationDefaults {
            max_new_tokens: 64,
            stream: true,
            ..GenerationDefaults::default()
        };

        let prepared = preprocess(request(), &defaults, &special_tokens()).unwrap();
        assert!(prepared.stream);
        assert_eq!(prepared.generate_args.max_new_tokens, 64);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let defaults = GenerationDefaults::default();

        let zero_temperature = PredictRequest {
            temperature: Some(0.0),
            ..request()
        };
        let err = preprocess(zero_temperature, &defaults, &special_tokens()).unwrap_err();
        assert!(err.is_client_error());

        let bad_top_p = PredictRequest {
            top_p: Some(0.0),
            ..request()
        };
        assert!(preprocess(bad_top_p, &defaults, &special_tokens()).is_err());

        let bad_penalty = PredictRequest {
            repetition_penalty: Some(-1.0),
            ..request()
        };
        assert!(preprocess(bad_penalty, &defaults, &special_tokens()).is_err());
    }

    #[test]
    fn test_greedy_ignores_temperature() {
        let greedy = PredictRequest {
            temperature: Some(0.0),
            do_sample: Some(false),
            ..request()
        };

        assert!(preprocess(greedy, &GenerationDefaults::default(), &special_tokens()).is_ok());
    }
}
