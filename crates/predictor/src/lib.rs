//! lmshim predictor
//!
//! Chat completion over a causal language model loaded with candle. A
//! request is merged with the configured generation defaults, rendered into
//! a `USER:`/`ASSISTANT:` prompt and either completed in one call or streamed
//! chunk by chunk from a background generation thread.

pub mod device;
pub mod generate_args;
pub mod generation;
pub mod hub;
pub mod model;
pub mod predictor;
pub mod prompt;
pub mod sampling;
pub mod streamer;
pub mod tokenizer;

#[cfg(test)]
mod testing;

pub use generate_args::{preprocess, GenerateArgs, PreparedRequest};
pub use generation::{generate, GenerationOutput};
pub use hub::ModelFiles;
pub use model::{LanguageModel, LlamaModel};
pub use predictor::{Prediction, Predictor};
pub use prompt::format_prompt;
pub use streamer::{GenerationReport, TextStream, TextStreamer};
pub use tokenizer::{HfTokenizer, SpecialTokens, TextTokenizer};
