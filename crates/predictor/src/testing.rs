//! In-memory model and tokenizer for tests

use crate::generate_args::GenerateArgs;
use crate::model::LanguageModel;
use crate::tokenizer::{SpecialTokens, TextTokenizer};
use candle_core::{Device, Tensor};
use lmshim_common::{LmShimError, Result};

pub const UNK: u32 = 0;
pub const BOS: u32 = 1;
pub const EOS: u32 = 2;
pub const PAD: u32 = 3;

/// Byte pieces that only decode to "é" together
pub const PARTIAL_E_HEAD: u32 = 18;
pub const PARTIAL_E_TAIL: u32 = 19;

const SPECIAL: [&str; 4] = ["<unk>", "<s>", "</s>", "<pad>"];

/// Vocabulary pieces after the special tokens, as raw bytes
fn pieces() -> Vec<Vec<u8>> {
    let mut pieces: Vec<Vec<u8>> = [
        "USER:", "ASSISTANT:", " ", "\n", "Hello", " world", "!", " how", " are", " you", "?",
        "Hi", "你好", " there",
    ]
    .iter()
    .map(|piece| piece.as_bytes().to_vec())
    .collect();

    // Two halves of "é"
    pieces.push(vec![0xC3]);
    pieces.push(vec![0xA9]);
    pieces
}

/// Greedy longest-match tokenizer over a tiny fixed vocabulary
///
/// Ids 0-3 are `<unk>`, `<s>`, `</s>`, `<pad>`. Encoding prepends `<s>`.
pub struct ScriptedTokenizer {
    vocab: Vec<Vec<u8>>,
}

impl ScriptedTokenizer {
    pub fn new() -> Self {
        let mut vocab: Vec<Vec<u8>> = SPECIAL.iter().map(|s| s.as_bytes().to_vec()).collect();
        vocab.extend(pieces());
        Self { vocab }
    }

    /// Id of a text piece
    pub fn id(&self, piece: &str) -> u32 {
        self.token_id(piece)
            .unwrap_or_else(|| panic!("{:?} is not in the scripted vocabulary", piece))
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: Some(BOS),
            eos: vec![EOS],
            pad: Some(PAD),
        }
    }
}

impl TextTokenizer for ScriptedTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let bytes = text.as_bytes();
        let mut ids = vec![BOS];
        let mut pos = 0;

        while pos < bytes.len() {
            let best = self
                .vocab
                .iter()
                .enumerate()
                .skip(SPECIAL.len())
                .filter(|(_, piece)| bytes[pos..].starts_with(piece))
                .max_by_key(|(_, piece)| piece.len());

            match best {
                Some((id, piece)) => {
                    ids.push(id as u32);
                    pos += piece.len();
                }
                None => {
                    ids.push(UNK);
                    let width = if text.is_char_boundary(pos) {
                        text[pos..].chars().next().map_or(1, char::len_utf8)
                    } else {
                        1
                    };
                    pos += width;
                }
            }
        }

        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            if skip_special_tokens && (id as usize) < SPECIAL.len() {
                continue;
            }
            let piece = self
                .vocab
                .get(id as usize)
                .ok_or_else(|| LmShimError::tokenizer(format!("unknown token id {}", id)))?;
            bytes.extend_from_slice(piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.vocab
            .iter()
            .position(|piece| piece.as_slice() == token.as_bytes())
            .map(|id| id as u32)
    }
}

/// Model that deterministically favours a scripted token sequence
///
/// Step `n` after a reset puts all the mass on `script[n]`, then on EOS once
/// the script runs out.
pub struct ScriptedModel {
    script: Vec<u32>,
    step: usize,
    vocab_size: usize,
    context_length: usize,
    fail_at: Option<usize>,
    device: Device,

    /// `(input tokens, index_pos)` of every forward call
    pub calls: Vec<(Vec<u32>, usize)>,

    /// `use_cache` flag of every reset
    pub resets: Vec<bool>,
}

impl ScriptedModel {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            step: 0,
            vocab_size: 32,
            context_length: 4096,
            fail_at: None,
            device: Device::Cpu,
            calls: Vec::new(),
            resets: Vec::new(),
        }
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    /// Fail the forward call with this step index
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }
}

impl LanguageModel for ScriptedModel {
    fn reset(&mut self, use_cache: bool) -> Result<()> {
        self.step = 0;
        self.resets.push(use_cache);
        Ok(())
    }

    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Tensor> {
        if self.fail_at == Some(self.step) {
            return Err(candle_core::Error::Msg("scripted failure".to_string()).into());
        }

        self.calls.push((tokens.to_vec(), index_pos));
        let target = self.script.get(self.step).copied().unwrap_or(EOS);
        self.step += 1;

        let mut logits = vec![0.0f32; self.vocab_size];
        logits[target as usize] = 10.0;
        Ok(Tensor::from_vec(logits, self.vocab_size, &self.device)?)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }
}

/// Deterministic arguments: argmax, no penalties
pub fn greedy_args() -> GenerateArgs {
    GenerateArgs {
        max_new_tokens: 16,
        temperature: 0.7,
        top_p: 0.8,
        top_k: 40,
        repetition_penalty: 1.0,
        no_repeat_ngram_size: 0,
        do_sample: false,
        use_cache: true,
        seed: Some(0),
        eos_token_ids: vec![EOS],
        pad_token_id: Some(PAD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_tokenizer_roundtrip() {
        let tokenizer = ScriptedTokenizer::new();
        let ids = tokenizer.encode("USER: Hello world!\nASSISTANT:").unwrap();

        assert_eq!(ids[0], BOS);
        assert_eq!(
            tokenizer.decode(&ids, true).unwrap(),
            "USER: Hello world!\nASSISTANT:"
        );
        assert_eq!(
            tokenizer.decode(&ids, false).unwrap(),
            "<s>USER: Hello world!\nASSISTANT:"
        );
    }

    #[test]
    fn test_scripted_tokenizer_partial_utf8() {
        let tokenizer = ScriptedTokenizer::new();
        let ids = [PARTIAL_E_HEAD, PARTIAL_E_TAIL];
        assert_eq!(tokenizer.decode(&ids[..1], true).unwrap(), "\u{FFFD}");
        assert_eq!(tokenizer.decode(&ids, true).unwrap(), "é");
    }
}
