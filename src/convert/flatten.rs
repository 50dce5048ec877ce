//! Maps a name-keyed checkpoint onto the positional parameter list the engine reads.

use super::checkpoint::{Checkpoint, NamedTensor};
use super::config::EmbeddingPolicy;
use super::tensor::Tensor;
use crate::error::{ConvertError, Result};
use std::borrow::Cow;

pub const ENCODER_EMBEDDING: &str = "encoder.embed_tokens.weight";
pub const DECODER_EMBEDDING: &str = "decoder.embed_tokens.weight";
pub const OUTPUT_PROJECTION: &str = "decoder.embed_out";

/// Positional parameter list. Unchanged tensors borrow from the checkpoint.
pub type ParameterList<'a> = Vec<Cow<'a, Tensor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    /// Single-element version scalars; dropped.
    Metadata,
    NormWeight,
    FusedQkv,
    HistoryWeight,
    Weight,
    Bias,
    EncoderEmbedding,
    DecoderEmbedding,
    OutputProjection,
}

impl TensorRole {
    pub fn classify(name: &str, tensor: &Tensor) -> Self {
        if name.contains(ENCODER_EMBEDDING) {
            Self::EncoderEmbedding
        } else if name.contains(DECODER_EMBEDDING) {
            Self::DecoderEmbedding
        } else if name.contains(OUTPUT_PROJECTION) {
            Self::OutputProjection
        } else if tensor.element_count() == 1 {
            Self::Metadata
        } else if name.contains("weight") {
            if name.contains("in_proj") {
                Self::FusedQkv
            } else if name.contains("norm") {
                Self::NormWeight
            } else if name.contains("history") {
                Self::HistoryWeight
            } else {
                Self::Weight
            }
        } else {
            Self::Bias
        }
    }
}

fn transposed(name: &str, tensor: &Tensor) -> Result<Tensor> {
    tensor.transpose().ok_or_else(|| ConvertError::InvalidTensor {
        name: name.to_string(),
        reason: format!("cannot transpose a tensor of shape {:?}", tensor.shape),
    })
}

/// Splits a fused query/key/value projection into transposed q, k and v.
fn split_qkv(name: &str, tensor: &Tensor) -> Result<[Tensor; 3]> {
    let rows = tensor.leading_dim();
    if tensor.rank() == 0 || rows % 3 != 0 {
        return Err(ConvertError::InvalidTensor {
            name: name.to_string(),
            reason: format!("leading dimension {} is not divisible by 3", rows),
        });
    }

    let dim = rows / 3;
    Ok([
        transposed(name, &tensor.slice_rows(0, dim))?,
        transposed(name, &tensor.slice_rows(dim, dim * 2))?,
        transposed(name, &tensor.slice_rows(dim * 2, rows))?,
    ])
}

/// Row `i` of a history matrix keeps its first `i + 1` columns.
fn expand_history(name: &str, tensor: &Tensor) -> Result<Vec<Tensor>> {
    let (rows, cols) = match tensor.shape.as_slice() {
        [rows, cols] if rows <= cols => (*rows, *cols),
        _ => {
            return Err(ConvertError::InvalidTensor {
                name: name.to_string(),
                reason: format!("expected a matrix with rows <= cols, got shape {:?}", tensor.shape),
            })
        }
    };

    (0..rows)
        .map(|i| {
            let start = i * cols;
            let row = Tensor::new(vec![1, i + 1], tensor.data[start..start + i + 1].to_vec())?;
            transposed(name, &row)
        })
        .collect()
}

/// Produces the canonical parameter list for `checkpoint`.
pub struct ParameterFlattener<'a> {
    checkpoint: &'a Checkpoint,
}

impl<'a> ParameterFlattener<'a> {
    pub fn new(checkpoint: &'a Checkpoint) -> Self {
        Self { checkpoint }
    }

    pub fn flatten(&self) -> Result<ParameterList<'a>> {
        let tensors: &'a [NamedTensor] = &self.checkpoint.tensors;
        let classified: Vec<(TensorRole, &'a NamedTensor)> = tensors
            .iter()
            .map(|t| (TensorRole::classify(&t.name, &t.tensor), t))
            .collect();

        let mut params: ParameterList<'a> = Vec::with_capacity(classified.len() + 2);
        let mut encoder_emb = None;
        let mut decoder_emb = None;
        let mut output_proj = None;

        for &(role, named) in &classified {
            let tensor = &named.tensor;
            match role {
                TensorRole::Metadata => {
                    tracing::debug!("dropping metadata scalar {}", named.name);
                }
                TensorRole::NormWeight | TensorRole::Bias => params.push(Cow::Borrowed(tensor)),
                TensorRole::Weight => params.push(Cow::Owned(transposed(&named.name, tensor)?)),
                TensorRole::FusedQkv => {
                    params.extend(split_qkv(&named.name, tensor)?.into_iter().map(Cow::Owned));
                }
                TensorRole::HistoryWeight => {
                    params.extend(expand_history(&named.name, tensor)?.into_iter().map(Cow::Owned));
                }
                TensorRole::EncoderEmbedding => encoder_emb = Some(tensor),
                TensorRole::DecoderEmbedding => decoder_emb = Some(tensor),
                TensorRole::OutputProjection => output_proj = Some(tensor),
            }
        }

        let embeddings = self.checkpoint.config.embeddings;

        let encoder_emb = encoder_emb.ok_or_else(|| ConvertError::MissingTensor(ENCODER_EMBEDDING.to_string()))?;
        params.push(Cow::Borrowed(encoder_emb));

        if embeddings.stores_decoder_embedding() {
            let decoder_emb = decoder_emb.ok_or_else(|| ConvertError::MissingTensor(DECODER_EMBEDDING.to_string()))?;
            params.push(Cow::Borrowed(decoder_emb));
        } else {
            tracing::info!("sharing all embeddings");
        }

        if embeddings.stores_output_projection() {
            let output_proj = output_proj.ok_or_else(|| ConvertError::MissingTensor(OUTPUT_PROJECTION.to_string()))?;
            params.push(Cow::Borrowed(output_proj));
        } else if embeddings == EmbeddingPolicy::SharedWithDecoderOutput {
            tracing::info!("sharing decoder input and output embeddings");
        }

        Ok(params)
    }
}
