//! Tokenizer wrapper and special-token resolution

use lmshim_common::{LmShimError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

/// Text <-> token id conversion used by the predictor
pub trait TextTokenizer: Send + Sync {
    /// Encode text, adding the model's special tokens (e.g. BOS)
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back to text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Look up the id of a single token
    fn token_id(&self, token: &str) -> Option<u32>;
}

/// Hugging Face `tokenizer.json` tokenizer
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            LmShimError::tokenizer(format!("Failed to load {}: {}", path.display(), e))
        })?;

        debug!(
            "Tokenizer loaded from {}: {} tokens",
            path.display(),
            inner.get_vocab_size(true)
        );

        Ok(Self { inner })
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| LmShimError::tokenizer(format!("Failed to encode prompt: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| LmShimError::tokenizer(format!("Failed to decode tokens: {}", e)))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

/// Special token ids used during generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,

    /// End-of-sequence ids; empty means generation only stops on length
    pub eos: Vec<u32>,

    pub pad: Option<u32>,
}

/// Token entry in `tokenizer_config.json`: a bare string or an added-token object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenEntry {
    Text(String),
    Object { content: String },
}

impl TokenEntry {
    fn content(&self) -> &str {
        match self {
            TokenEntry::Text(text) => text,
            TokenEntry::Object { content } => content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    bos_token: Option<TokenEntry>,
    #[serde(default)]
    eos_token: Option<TokenEntry>,
    #[serde(default)]
    pad_token: Option<TokenEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    fn into_vec(self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![id],
            TokenIds::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModelConfigTokens {
    #[serde(default)]
    bos_token_id: Option<u32>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pad_token_id: Option<u32>,
}

impl SpecialTokens {
    /// Resolve special tokens from the model's config files
    pub fn from_files<T: TextTokenizer>(
        tokenizer: &T,
        tokenizer_config: Option<&Path>,
        model_config: &Path,
    ) -> Result<Self> {
        let tokenizer_config = tokenizer_config
            .map(std::fs::read_to_string)
            .transpose()?;
        let model_config = std::fs::read_to_string(model_config)?;

        Self::from_json(tokenizer, tokenizer_config.as_deref(), &model_config)
    }

    /// Resolve special tokens from JSON contents
    ///
    /// Token strings in `tokenizer_config.json` win; ids from `config.json`
    /// fill whatever is still missing.
    pub fn from_json<T: TextTokenizer>(
        tokenizer: &T,
        tokenizer_config: Option<&str>,
        model_config: &str,
    ) -> Result<Self> {
        let tokenizer_config: TokenizerConfigFile = match tokenizer_config {
            Some(json) => serde_json::from_str(json)?,
            None => TokenizerConfigFile::default(),
        };
        let model_config: ModelConfigTokens = serde_json::from_str(model_config)?;

        let lookup = |entry: &Option<TokenEntry>| -> Option<u32> {
            let entry = entry.as_ref()?;
            let id = tokenizer.token_id(entry.content());
            if id.is_none() {
                warn!("Special token {:?} is not in the vocabulary", entry.content());
            }
            id
        };

        let eos = match lookup(&tokenizer_config.eos_token) {
            Some(id) => vec![id],
            None => model_config
                .eos_token_id
                .map(TokenIds::into_vec)
                .unwrap_or_default(),
        };

        if eos.is_empty() {
            warn!("No end-of-sequence token found; generation stops on length only");
        }

        let tokens = SpecialTokens {
            bos: lookup(&tokenizer_config.bos_token).or(model_config.bos_token_id),
            eos,
            pad: lookup(&tokenizer_config.pad_token).or(model_config.pad_token_id),
        };

        debug!("Resolved special tokens: {:?}", tokens);
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTokenizer;

    const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "hello": 1, "world": 2}, "unk_token": "<unk>"}
}"#;

    #[test]
    fn test_hf_tokenizer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, TOKENIZER_JSON).unwrap();

        let tokenizer = HfTokenizer::from_file(&path).unwrap();
        assert_eq!(tokenizer.vocab_size(), 3);
        assert_eq!(tokenizer.encode("hello world").unwrap(), vec![1, 2]);
        assert_eq!(tokenizer.token_id("world"), Some(2));
        assert_eq!(tokenizer.decode(&[0, 1], true).unwrap(), "hello");
    }

    #[test]
    fn test_hf_tokenizer_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HfTokenizer::from_file(dir.path().join("absent.json")).err().unwrap();
        assert_eq!(err.kind(), "tokenizer");
    }

    #[test]
    fn test_special_tokens_from_tokenizer_config() {
        let tokenizer = ScriptedTokenizer::new();
        let tokenizer_config = r#"{
            "bos_token": "<s>",
            "eos_token": {"content": "</s>", "lstrip": false},
            "pad_token": null
        }"#;

        let tokens =
            SpecialTokens::from_json(&tokenizer, Some(tokenizer_config), r#"{"pad_token_id": 0}"#)
                .unwrap();

        assert_eq!(tokens.bos, tokenizer.token_id("<s>"));
        assert_eq!(tokens.eos, vec![tokenizer.token_id("</s>").unwrap()]);
        assert_eq!(tokens.pad, Some(0));
    }

    #[test]
    fn test_special_tokens_fall_back_to_model_config() {
        let tokenizer = ScriptedTokenizer::new();
        let model_config = r#"{"bos_token_id": 1, "eos_token_id": [2, 7], "hidden_size": 16}"#;

        let tokens = SpecialTokens::from_json(&tokenizer, None, model_config).unwrap();

        assert_eq!(tokens.bos, Some(1));
        assert_eq!(tokens.eos, vec![2, 7]);
        assert_eq!(tokens.pad, None);
    }

    #[test]
    fn test_special_tokens_unknown_string_falls_back() {
        let tokenizer = ScriptedTokenizer::new();
        let tokens = SpecialTokens::from_json(
            &tokenizer,
            Some(r#"{"eos_token": "<|not-here|>"}"#),
            r#"{"eos_token_id": 2}"#,
        )
        .unwrap();

        assert_eq!(tokens.eos, vec![2]);
    }

    #[test]
    fn test_special_tokens_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"eos_token_id": 2}"#).unwrap();

        let tokens =
            SpecialTokens::from_files(&ScriptedTokenizer::new(), None, &config_path).unwrap();
        assert_eq!(tokens.eos, vec![2]);
    }
}
