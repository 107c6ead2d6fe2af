//! Causal language model loading
//!
//! The generation loop talks to the model through [`LanguageModel`]. The
//! production implementation is a Llama-architecture model from
//! `candle-transformers`, with weights memory-mapped from safetensors.

use crate::device::{select_device, select_dtype};
use crate::hub::ModelFiles;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};
use lmshim_common::config::RuntimeConfig;
use lmshim_common::{LmShimError, Result};
use std::time::Instant;
use tracing::{debug, info};

/// A causal LM that produces next-token logits
pub trait LanguageModel: Send {
    /// Drop all attention state before a new sequence
    fn reset(&mut self, use_cache: bool) -> Result<()>;

    /// Run `tokens` starting at position `index_pos`
    ///
    /// Returns the logits for the last position as a 1-D f32 tensor.
    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Tensor>;

    /// Maximum sequence length the model supports
    fn context_length(&self) -> usize;
}

/// Llama-architecture model
pub struct LlamaModel {
    model: Llama,
    config: Config,
    cache: Cache,
    /// Empty cache with the RoPE tables, cloned on every reset
    pristine: Cache,
    device: Device,
}

impl LlamaModel {
    /// Load weights and architecture config
    pub fn load(files: &ModelFiles, runtime: &RuntimeConfig) -> Result<Self> {
        let start = Instant::now();
        let device = select_device(runtime)?;
        let dtype = select_dtype(runtime.dtype, &device);

        let llama_config: LlamaConfig =
            serde_json::from_str(&std::fs::read_to_string(&files.config)?)?;
        let config = llama_config.into_config(runtime.use_flash_attn);

        debug!(
            "Model config: {} layers, hidden {}, context {}",
            config.num_hidden_layers, config.hidden_size, config.max_position_embeddings
        );

        // The safetensors files must not change while they are mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Self::build(vb, config, dtype, device)?;

        info!(
            "Model loaded in {:.2?}: {} weight file(s), {:?}",
            start.elapsed(),
            files.weights.len(),
            dtype
        );
        Ok(model)
    }

    fn build(vb: VarBuilder, config: Config, dtype: DType, device: Device) -> Result<Self> {
        let model = Llama::load(vb, &config)
            .map_err(|e| LmShimError::model(format!("Failed to build model: {}", e)))?;
        let pristine = Cache::new(true, dtype, &config, &device)?;

        Ok(Self {
            model,
            config,
            cache: pristine.clone(),
            pristine,
            device,
        })
    }
}

/// Empty cache sharing the precomputed RoPE tables of `pristine`
fn fresh_cache(pristine: &Cache, use_cache: bool) -> Cache {
    let mut cache = pristine.clone();
    cache.use_kv_cache = use_cache;
    cache
}

impl LanguageModel for LlamaModel {
    fn reset(&mut self, use_cache: bool) -> Result<()> {
        self.cache = fresh_cache(&self.pristine, use_cache);
        Ok(())
    }

    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, index_pos, &mut self.cache)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
    }

    fn context_length(&self) -> usize {
        self.config.max_position_embeddings
    }
}
