use super::tensor::Tensor;
use crate::error::{ConvertError, Result};
use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// `__metadata__` key holding the state-dict order as a JSON list of tensor names.
pub const ORDER_METADATA_KEY: &str = "parameter_order";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [usize; 2],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Header {
    #[serde(flatten)]
    pub tensors: HashMap<String, TensorInfo>,
    #[serde(rename = "__metadata__")]
    pub metadata: Option<HashMap<String, String>>,
}

/// A memory-mapped safetensors file.
pub struct SafeTensors {
    pub header: Header,
    data_offset: usize,
    mmap: Mmap,
}

impl SafeTensors {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: the mapping is read-only and lives no longer than `Self`.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < 8 {
            return Err(ConvertError::InvalidFormat("safetensors file shorter than its header length".to_string()));
        }
        let header_len = LittleEndian::read_u64(&mmap[..8]);
        if header_len > MAX_HEADER_LEN || 8 + header_len as usize > mmap.len() {
            return Err(ConvertError::InvalidFormat(format!("safetensors header too large: {} bytes", header_len)));
        }

        let header: Header = serde_json::from_slice(&mmap[8..8 + header_len as usize])?;
        let data_offset = 8 + header_len as usize;

        Ok(Self {
            header,
            data_offset,
            mmap,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.header.tensors.contains_key(name)
    }

    /// Parameter order recorded under [`ORDER_METADATA_KEY`], if the exporter stored one.
    ///
    /// Data offsets follow dtype and name, not the state-dict order.
    pub fn metadata_order(&self) -> Result<Option<Vec<String>>> {
        let recorded = self
            .header
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get(ORDER_METADATA_KEY));
        match recorded {
            Some(list) => Ok(Some(serde_json::from_str(list).map_err(|e| {
                ConvertError::InvalidFormat(format!("{} metadata is not a JSON list of names: {}", ORDER_METADATA_KEY, e))
            })?)),
            None => Ok(None),
        }
    }

    pub fn tensor_count(&self) -> usize {
        self.header.tensors.len()
    }

    /// Reads a tensor and widens it to f32.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let info = self
            .header
            .tensors
            .get(name)
            .ok_or_else(|| ConvertError::MissingTensor(name.to_string()))?;

        let start = self.data_offset + info.data_offsets[0];
        let end = self.data_offset + info.data_offsets[1];
        if start > end || end > self.mmap.len() {
            return Err(ConvertError::InvalidFormat(format!("tensor {} lies outside the file", name)));
        }
        let bytes = &self.mmap[start..end];

        let data: Vec<f32> = match info.dtype.as_str() {
            "F32" => {
                let mut values = vec![0.0f32; bytes.len() / 4];
                LittleEndian::read_f32_into(&bytes[..values.len() * 4], &mut values);
                values
            }
            "F16" => bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(LittleEndian::read_u16(c)).to_f32())
                .collect(),
            "BF16" => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(LittleEndian::read_u16(c)).to_f32())
                .collect(),
            other => {
                return Err(ConvertError::InvalidTensor {
                    name: name.to_string(),
                    reason: format!("unsupported dtype {}", other),
                })
            }
        };

        Tensor::new(info.shape.clone(), data)
    }
}
