use crate::error::Result;
use std::path::Path;

pub mod checkpoint;
pub mod config;
pub mod flatten;
pub mod safetensors;
pub mod tensor;
pub mod writer;

pub use checkpoint::{parse_name_list, read_name_list, Checkpoint, CheckpointLoader, NamedTensor};
pub use config::{ConfigPacker, EmbeddingPolicy, ModelConfig, HEADER_LEN};
pub use flatten::{ParameterFlattener, ParameterList, TensorRole};
pub use safetensors::{SafeTensors, ORDER_METADATA_KEY};
pub use tensor::Tensor;
pub use writer::{convert_precision, ensemble, read_model, write_model, ModelSummary, StorageFormat};

/// Converts one checkpoint into a model file.
#[derive(Debug)]
pub struct Converter {
    checkpoint: Checkpoint,
    format: StorageFormat,
}

impl Converter {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            format: StorageFormat::default(),
        }
    }

    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(weights: P, args: Q) -> Result<Self> {
        Ok(Self::new(Checkpoint::load(weights, args)?))
    }

    pub fn with_format(mut self, format: StorageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn checkpoint_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    pub fn config(&self) -> &ModelConfig {
        &self.checkpoint.config
    }

    pub fn convert_to_file<P: AsRef<Path>>(&self, output_path: P) -> Result<ModelSummary> {
        let params = ParameterFlattener::new(&self.checkpoint).flatten()?;
        tracing::info!(
            "flattened {} checkpoint tensors into {} parameters ({} values)",
            self.checkpoint.tensor_count(),
            params.len(),
            params.iter().map(|p| p.element_count()).sum::<usize>()
        );
        write_model(output_path, &self.checkpoint.config, &params, self.format)
    }
}
