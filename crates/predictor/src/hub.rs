//! Model file resolution
//!
//! Locates the config, tokenizer and safetensors weights of a model either
//! in a local directory or through the Hugging Face hub cache. Sharded
//! checkpoints are discovered through `model.safetensors.index.json`.

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::api::RepoInfo;
use hf_hub::{Repo, RepoType};
use lmshim_common::config::ModelConfig;
use lmshim_common::{LmShimError, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Paths to everything needed to load a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,

    /// Safetensors shards in load order
    pub weights: Vec<PathBuf>,
}

/// Shard index of a split checkpoint
#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

impl WeightsIndex {
    /// Unique shard file names, sorted
    fn shard_files(&self) -> Vec<String> {
        self.weight_map
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

enum FileSource {
    Dir(PathBuf),
    Hub {
        repo: Box<ApiRepo>,
        /// Every file name at the requested revision
        listing: BTreeSet<String>,
    },
}

impl FileSource {
    fn get(&self, name: &str) -> Result<PathBuf> {
        match self {
            FileSource::Dir(dir) => {
                let path = dir.join(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LmShimError::model(format!("Missing model file {}", path.display())))
                }
            }
            FileSource::Hub { repo, .. } => repo
                .get(name)
                .map_err(|e| LmShimError::hub(format!("Failed to fetch {}: {}", name, e))),
        }
    }

    /// `None` only when the file does not exist; failures to read or fetch
    /// a file that does exist are errors
    fn get_optional(&self, name: &str) -> Result<Option<PathBuf>> {
        let present = match self {
            FileSource::Dir(dir) => dir.join(name).exists(),
            FileSource::Hub { listing, .. } => listing.contains(name),
        };

        if !present {
            debug!("Optional file {} not present", name);
            return Ok(None);
        }
        self.get(name).map(Some)
    }
}

/// File names listed in a repo's metadata
fn listed_files(info: &RepoInfo) -> BTreeSet<String> {
    info.siblings
        .iter()
        .map(|sibling| sibling.rfilename.clone())
        .collect()
}

impl ModelFiles {
    /// Resolve model files from the configured source
    pub fn resolve(config: &ModelConfig) -> Result<Self> {
        let source = match &config.local_dir {
            Some(dir) => {
                info!("Loading model files from {}", dir.display());
                FileSource::Dir(dir.clone())
            }
            None => {
                info!(
                    "Resolving model {} at revision {} from the hub",
                    config.model_id, config.revision
                );

                let mut builder = ApiBuilder::new().with_token(config.hf_token.clone());
                if let Some(cache_dir) = &config.cache_dir {
                    builder = builder.with_cache_dir(cache_dir.clone());
                }
                let api = builder
                    .build()
                    .map_err(|e| LmShimError::hub(format!("Failed to create hub client: {}", e)))?;

                let repo = api.repo(Repo::with_revision(
                    config.model_id.clone(),
                    RepoType::Model,
                    config.revision.clone(),
                ));
                let info = repo.info().map_err(|e| {
                    LmShimError::hub(format!("Failed to list {}: {}", config.model_id, e))
                })?;
                debug!(
                    "Repo {} at {} lists {} file(s)",
                    config.model_id,
                    info.sha,
                    info.siblings.len()
                );

                FileSource::Hub {
                    repo: Box::new(repo),
                    listing: listed_files(&info),
                }
            }
        };

        Self::from_source(&source)
    }

    /// Resolve model files from a local directory
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_source(&FileSource::Dir(dir.as_ref().to_path_buf()))
    }

    fn from_source(source: &FileSource) -> Result<Self> {
        let config = source.get(CONFIG_FILE)?;
        let tokenizer = source.get(TOKENIZER_FILE)?;
        let tokenizer_config = source.get_optional(TOKENIZER_CONFIG_FILE)?;

        let weights = match source.get_optional(WEIGHTS_INDEX_FILE)? {
            Some(index_path) => {
                let index: WeightsIndex =
                    serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
                let shards = index.shard_files();
                if shards.is_empty() {
                    return Err(LmShimError::model(format!(
                        "{} lists no weight files",
                        index_path.display()
                    )));
                }

                shards
                    .iter()
                    .map(|name| source.get(name))
                    .collect::<Result<Vec<_>>>()?
            }
            None => vec![source.get(WEIGHTS_FILE)?],
        };

        info!("Resolved {} weight file(s)", weights.len());

        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_single_file_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), WEIGHTS_FILE, "");

        let files = ModelFiles::from_dir(dir.path()).unwrap();

        assert_eq!(files.config, dir.path().join(CONFIG_FILE));
        assert_eq!(files.tokenizer_config, None);
        assert_eq!(files.weights, vec![dir.path().join(WEIGHTS_FILE)]);
    }

    #[test]
    fn test_sharded_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), TOKENIZER_CONFIG_FILE, "{}");
        touch(
            dir.path(),
            WEIGHTS_INDEX_FILE,
            r#"{
                "metadata": {"total_size": 10},
                "weight_map": {
                    "lm_head.weight": "model-00002-of-00002.safetensors",
                    "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                    "model.norm.weight": "model-00002-of-00002.safetensors"
                }
            }"#,
        );
        touch(dir.path(), "model-00001-of-00002.safetensors", "");
        touch(dir.path(), "model-00002-of-00002.safetensors", "");

        let files = ModelFiles::from_dir(dir.path()).unwrap();

        assert_eq!(
            files.tokenizer_config,
            Some(dir.path().join(TOKENIZER_CONFIG_FILE))
        );
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(
            dir.path(),
            WEIGHTS_INDEX_FILE,
            r#"{"weight_map": {"a": "model-00001-of-00001.safetensors"}}"#,
        );

        let err = ModelFiles::from_dir(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "model");
    }

    #[test]
    fn test_unreadable_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), WEIGHTS_FILE, "");
        std::fs::create_dir(dir.path().join(WEIGHTS_INDEX_FILE)).unwrap();

        // Falling back to model.safetensors would load a partial checkpoint
        let err = ModelFiles::from_dir(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "model");
    }

    #[test]
    fn test_unreadable_tokenizer_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), WEIGHTS_FILE, "");
        std::fs::create_dir(dir.path().join(TOKENIZER_CONFIG_FILE)).unwrap();

        assert!(ModelFiles::from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_listed_files() {
        let info: RepoInfo = serde_json::from_str(
            r#"{
                "sha": "0123abcd",
                "siblings": [
                    {"rfilename": "config.json"},
                    {"rfilename": "model-00001-of-00002.safetensors"},
                    {"rfilename": "model.safetensors.index.json"}
                ]
            }"#,
        )
        .unwrap();

        let listing = listed_files(&info);
        assert_eq!(listing.len(), 3);
        assert!(listing.contains(WEIGHTS_INDEX_FILE));
        assert!(!listing.contains(TOKENIZER_CONFIG_FILE));
    }

    #[test]
    fn test_missing_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), WEIGHTS_FILE, "");

        assert!(ModelFiles::from_dir(dir.path()).is_err());
    }
}
