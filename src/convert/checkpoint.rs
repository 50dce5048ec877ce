use super::config::ModelConfig;
use super::flatten::{DECODER_EMBEDDING, ENCODER_EMBEDDING};
use super::safetensors::{SafeTensors, ORDER_METADATA_KEY};
use super::tensor::Tensor;
use crate::error::{ConvertError, Result};
use crate::fs::AtomicFile;
use crate::tokens::SpecialTokens;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Tensor,
}

/// Named tensors in checkpoint order plus the model hyper-parameters.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub tensors: Vec<NamedTensor>,
    pub config: ModelConfig,
}

impl Checkpoint {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            tensors: Vec::new(),
            config,
        }
    }

    /// Loads weights and args with the parameter order recorded in the weights file.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(weights: P, args: Q) -> Result<Self> {
        CheckpointLoader::new().load(weights, args)
    }

    /// Inserts a tensor, replacing any tensor with the same name in place.
    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        match self.tensors.iter_mut().find(|t| t.name == name) {
            Some(existing) => existing.tensor = tensor,
            None => self.tensors.push(NamedTensor {
                name: name.to_string(),
                tensor,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Fills vocabulary sizes left at zero from the embedding row counts.
    pub fn resolve_vocab_sizes(&mut self) {
        for named in &self.tensors {
            let rows = named.tensor.leading_dim() as i32;
            if named.name.contains(ENCODER_EMBEDDING) && self.config.src_vocab_size == 0 {
                self.config.src_vocab_size = rows;
            } else if named.name.contains(DECODER_EMBEDDING) && self.config.tgt_vocab_size == 0 {
                self.config.tgt_vocab_size = rows;
            }
        }

        if self.config.tgt_vocab_size == 0 && self.config.embeddings.shares_all_embeddings() {
            self.config.tgt_vocab_size = self.config.src_vocab_size;
        }
    }

    /// Writes one `name<TAB>shape` line per tensor.
    pub fn write_name_list<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = AtomicFile::create(path)?;
        for named in &self.tensors {
            writeln!(out, "{}\t{:?}", named.name, named.tensor.shape)?;
        }
        out.commit()
    }
}

/// Reads a checkpoint from a safetensors weights file and a JSON args file.
///
/// The positional model layout follows the state-dict order, which safetensors does not
/// preserve in its data layout. The order comes from a name list when one is given and
/// from the weights file's `parameter_order` metadata otherwise.
#[derive(Debug, Clone, Default)]
pub struct CheckpointLoader {
    order: Option<PathBuf>,
    default_specials: SpecialTokens,
}

impl CheckpointLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the parameter order from a name list (see [`Checkpoint::write_name_list`]).
    pub fn with_order<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.order = Some(path.as_ref().to_path_buf());
        self
    }

    /// Reserved ids used when the args file does not record its own.
    pub fn with_default_specials(mut self, specials: SpecialTokens) -> Self {
        self.default_specials = specials;
        self
    }

    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(&self, weights: P, args: Q) -> Result<Checkpoint> {
        let config = ModelConfig::from_args_json(&fs::read_to_string(&args)?, self.default_specials)?;
        let st = SafeTensors::load(&weights)?;

        let order = match &self.order {
            Some(path) => read_name_list(path)?,
            None => st.metadata_order()?.ok_or_else(|| {
                ConvertError::InvalidFormat(format!(
                    "{} records no {} metadata; supply the parameter order as a name list",
                    weights.as_ref().display(),
                    ORDER_METADATA_KEY
                ))
            })?,
        };
        check_order(&order, &st)?;

        let mut checkpoint = Checkpoint::new(config);
        for name in &order {
            let tensor = st.tensor(name)?;
            checkpoint.insert(name, tensor);
        }

        tracing::info!(
            "loaded {} tensors from {}",
            checkpoint.tensors.len(),
            weights.as_ref().display()
        );

        checkpoint.resolve_vocab_sizes();
        Ok(checkpoint)
    }
}

/// The order must name every stored tensor exactly once.
fn check_order(order: &[String], st: &SafeTensors) -> Result<()> {
    let mut seen = HashSet::with_capacity(order.len());
    for name in order {
        if !st.contains(name) {
            return Err(ConvertError::MissingTensor(name.clone()));
        }
        if !seen.insert(name.as_str()) {
            return Err(ConvertError::InvalidFormat(format!("{} is listed twice in the parameter order", name)));
        }
    }
    if seen.len() != st.tensor_count() {
        return Err(ConvertError::InvalidFormat(format!(
            "parameter order lists {} of {} tensors",
            seen.len(),
            st.tensor_count()
        )));
    }
    Ok(())
}

/// Reads the first tab-separated field of every non-empty line.
pub fn parse_name_list<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(name) = line.split('\t').next().map(str::trim).filter(|n| !n.is_empty()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

pub fn read_name_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    parse_name_list(BufReader::new(File::open(path)?))
}
