//! Model file output: single conversion, precision conversion and ensemble averaging.
//!
//! A model file is the packed config header followed by every parameter value in
//! parameter-list order, all in one storage format and native byte order.

use super::config::{ConfigPacker, ModelConfig, HEADER_LEN};
use super::tensor::Tensor;
use crate::error::{ConvertError, Result};
use crate::fs::AtomicFile;
use byteorder::{ByteOrder, NativeEndian};
use half::f16;
use std::borrow::Cow;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Values processed per chunk when streaming existing model files.
pub const CHUNK_VALUES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageFormat {
    #[default]
    Fp32,
    Fp16,
}

impl StorageFormat {
    pub fn width(&self) -> usize {
        match self {
            StorageFormat::Fp32 => 4,
            StorageFormat::Fp16 => 2,
        }
    }

    pub fn encode(&self, values: &[f32], out: &mut Vec<u8>) {
        match self {
            StorageFormat::Fp32 => out.extend_from_slice(bytemuck::cast_slice(values)),
            StorageFormat::Fp16 => {
                let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                out.extend_from_slice(bytemuck::cast_slice(&halves));
            }
        }
    }

    /// `bytes.len()` must be a multiple of [`StorageFormat::width`].
    pub fn decode(&self, bytes: &[u8], out: &mut Vec<f32>) {
        let count = bytes.len() / self.width();
        match self {
            StorageFormat::Fp32 => {
                let start = out.len();
                out.resize(start + count, 0.0);
                NativeEndian::read_f32_into(&bytes[..count * 4], &mut out[start..]);
            }
            StorageFormat::Fp16 => {
                let mut bits = vec![0u16; count];
                NativeEndian::read_u16_into(&bytes[..count * 2], &mut bits);
                out.extend(bits.into_iter().map(|b| f16::from_bits(b).to_f32()));
            }
        }
    }
}

impl FromStr for StorageFormat {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(StorageFormat::Fp32),
            "fp16" | "f16" | "float16" => Ok(StorageFormat::Fp16),
            _ => Err(ConvertError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageFormat::Fp32 => write!(f, "fp32"),
            StorageFormat::Fp16 => write!(f, "fp16"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSummary {
    pub tensors: usize,
    pub values: u64,
    pub bytes: u64,
}

/// Writes the header for `config` followed by `params`.
pub fn write_model<P: AsRef<Path>>(
    path: P,
    config: &ModelConfig,
    params: &[Cow<'_, Tensor>],
    format: StorageFormat,
) -> Result<ModelSummary> {
    let mut out = AtomicFile::create(&path)?;
    let header = ConfigPacker::pack(config);
    out.write_all(&header)?;

    let mut values = 0u64;
    let mut buf = Vec::new();
    for tensor in params {
        buf.clear();
        format.encode(&tensor.data, &mut buf);
        out.write_all(&buf)?;
        values += tensor.data.len() as u64;
    }
    out.commit()?;

    let summary = ModelSummary {
        tensors: params.len(),
        values,
        bytes: (header.len() as u64) + values * format.width() as u64,
    };
    tracing::info!(
        "wrote {} tensors ({} values, {}) to {}",
        summary.tensors,
        summary.values,
        format,
        path.as_ref().display()
    );
    Ok(summary)
}

/// Number of values stored after the header of an existing model file.
fn model_layout(path: &Path, format: StorageFormat) -> Result<u64> {
    let len = fs::metadata(path)?.len();
    if len < HEADER_LEN as u64 {
        return Err(ConvertError::InvalidFormat(format!(
            "{} is shorter than the {}-byte model header",
            path.display(),
            HEADER_LEN
        )));
    }

    let stream = len - HEADER_LEN as u64;
    if stream % format.width() as u64 != 0 {
        return Err(ConvertError::InvalidFormat(format!(
            "{}: {} parameter bytes is not a whole number of {} values",
            path.display(),
            stream,
            format
        )));
    }
    Ok(stream / format.width() as u64)
}

/// Reads the next `count` values of `format` from `reader` into `out`.
fn read_values<R: Read>(
    reader: &mut R,
    format: StorageFormat,
    count: usize,
    bytes: &mut Vec<u8>,
    out: &mut Vec<f32>,
) -> Result<()> {
    bytes.resize(count * format.width(), 0);
    reader.read_exact(bytes)?;
    out.clear();
    format.decode(bytes, out);
    Ok(())
}

/// Rewrites a model file's parameters from one storage format to another.
/// The header is copied byte for byte.
pub fn convert_precision<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    from: StorageFormat,
    to: StorageFormat,
) -> Result<u64> {
    let input = input.as_ref();
    let total = model_layout(input, from)?;

    let mut reader = BufReader::new(File::open(input)?);
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let mut out = AtomicFile::create(&output)?;
    out.write_all(&header)?;

    let mut remaining = total;
    let mut bytes = Vec::new();
    let mut values = Vec::with_capacity(CHUNK_VALUES);
    let mut encoded = Vec::new();
    while remaining > 0 {
        let count = remaining.min(CHUNK_VALUES as u64) as usize;
        read_values(&mut reader, from, count, &mut bytes, &mut values)?;
        encoded.clear();
        to.encode(&values, &mut encoded);
        out.write_all(&encoded)?;
        remaining -= count as u64;
    }
    out.commit()?;

    tracing::info!("converted {} parameters from {} to {}", total, from, to);
    Ok(total)
}

/// Averages the parameters of several model files elementwise.
///
/// The header is taken from the first input. All inputs must hold the same number
/// of values.
pub fn ensemble<P: AsRef<Path>, Q: AsRef<Path>>(inputs: &[P], output: Q, format: StorageFormat) -> Result<u64> {
    let first = inputs
        .first()
        .ok_or_else(|| ConvertError::InvalidConfig("ensemble needs at least one model".to_string()))?;

    let mut counts = Vec::with_capacity(inputs.len());
    for input in inputs {
        let count = model_layout(input.as_ref(), format)?;
        tracing::info!("found {} parameters in {}", count, input.as_ref().display());
        counts.push(count);
    }
    let total = counts[0];
    if let Some((i, count)) = counts.iter().enumerate().find(|(_, c)| **c != total) {
        return Err(ConvertError::ShapeMismatch(format!(
            "{} holds {} values but {} holds {}",
            inputs[i].as_ref().display(),
            count,
            first.as_ref().display(),
            total
        )));
    }

    let mut readers = Vec::with_capacity(inputs.len());
    let mut header = [0u8; HEADER_LEN];
    for (i, input) in inputs.iter().enumerate() {
        let mut reader = BufReader::new(File::open(input.as_ref())?);
        let mut this_header = [0u8; HEADER_LEN];
        reader.read_exact(&mut this_header)?;
        if i == 0 {
            header = this_header;
        } else if this_header != header {
            tracing::warn!("header of {} differs from the first model; using the first", input.as_ref().display());
        }
        readers.push(reader);
    }

    let mut out = AtomicFile::create(&output)?;
    out.write_all(&header)?;

    let n = inputs.len() as f64;
    let mut remaining = total;
    let mut bytes = Vec::new();
    let mut values = Vec::with_capacity(CHUNK_VALUES);
    let mut sums = vec![0.0f64; CHUNK_VALUES];
    let mut means = Vec::with_capacity(CHUNK_VALUES);
    let mut encoded = Vec::new();
    while remaining > 0 {
        let count = remaining.min(CHUNK_VALUES as u64) as usize;
        sums[..count].fill(0.0);
        for reader in readers.iter_mut() {
            read_values(reader, format, count, &mut bytes, &mut values)?;
            for (sum, &v) in sums.iter_mut().zip(&values) {
                *sum += v as f64;
            }
        }

        means.clear();
        means.extend(sums[..count].iter().map(|&s| (s / n) as f32));
        encoded.clear();
        format.encode(&means, &mut encoded);
        out.write_all(&encoded)?;
        remaining -= count as u64;
    }
    out.commit()?;

    tracing::info!("averaged {} models ({} parameters each)", inputs.len(), total);
    Ok(total)
}

/// Reads a model file back into its config and flat value stream.
pub fn read_model<P: AsRef<Path>>(path: P, format: StorageFormat) -> Result<(ModelConfig, Vec<f32>)> {
    let path = path.as_ref();
    let total = model_layout(path, format)? as usize;
    let bytes = fs::read(path)?;
    let config = ConfigPacker::unpack(&bytes[..HEADER_LEN])?;
    let mut values = Vec::with_capacity(total);
    format.decode(&bytes[HEADER_LEN..], &mut values);
    Ok((config, values))
}
