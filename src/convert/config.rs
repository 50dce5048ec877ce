//! Model hyper-parameters and the fixed-layout header that precedes every model file.
//!
//! The header is a boolean block followed by an integer block. Field order and field
//! counts are shared with the engine that reads the file, so new fields can only be
//! appended together with a matching engine change.

use crate::error::{ConvertError, Result};
use crate::tokens::SpecialTokens;
use byteorder::{ByteOrder, NativeEndian};
use serde::{Deserialize, Serialize};

pub const BOOL_FIELDS: usize = 8;
pub const INT_FIELDS: usize = 15;
pub const HEADER_LEN: usize = BOOL_FIELDS + INT_FIELDS * 4;

/// Which embedding matrices are stored separately in the model file.
///
/// Sharing all embeddings implies the decoder output projection is shared too, so the
/// combination "share all, but keep a separate output projection" has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingPolicy {
    /// Encoder embedding, decoder embedding and output projection are all stored.
    #[default]
    Separate,
    /// Decoder embedding and output projection reuse the encoder embedding.
    SharedWithEncoder,
    /// The output projection reuses the decoder embedding.
    SharedWithDecoderOutput,
}

impl EmbeddingPolicy {
    pub fn from_flags(share_all_embeddings: bool, share_decoder_input_output: bool) -> Result<Self> {
        match (share_all_embeddings, share_decoder_input_output) {
            (false, false) => Ok(Self::Separate),
            (false, true) => Ok(Self::SharedWithDecoderOutput),
            (true, true) => Ok(Self::SharedWithEncoder),
            (true, false) => Err(ConvertError::InvalidConfig(
                "share_all_embeddings requires share_decoder_input_output_embed".to_string(),
            )),
        }
    }

    pub fn shares_all_embeddings(&self) -> bool {
        matches!(self, Self::SharedWithEncoder)
    }

    pub fn shares_decoder_output(&self) -> bool {
        matches!(self, Self::SharedWithEncoder | Self::SharedWithDecoderOutput)
    }

    pub fn stores_decoder_embedding(&self) -> bool {
        !self.shares_all_embeddings()
    }

    pub fn stores_output_projection(&self) -> bool {
        !self.shares_decoder_output()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ModelArgs")]
pub struct ModelConfig {
    pub encoder_layers: i32,
    pub decoder_layers: i32,
    pub embed_dim: i32,
    pub hidden_dim: i32,
    pub ffn_dim: i32,
    pub attention_heads: i32,
    pub max_relative_length: i32,
    pub max_source_len: i32,
    pub max_target_len: i32,
    pub src_vocab_size: i32,
    pub tgt_vocab_size: i32,
    pub encoder_final_norm: bool,
    pub decoder_final_norm: bool,
    pub encoder_history: bool,
    pub decoder_history: bool,
    pub encoder_pre_norm: bool,
    pub decoder_pre_norm: bool,
    pub embeddings: EmbeddingPolicy,
    pub specials: SpecialTokens,
}

impl ModelConfig {
    /// Boolean header block, in wire order.
    pub fn bool_fields(&self) -> [bool; BOOL_FIELDS] {
        [
            self.encoder_final_norm,
            self.decoder_final_norm,
            self.embeddings.shares_all_embeddings(),
            self.embeddings.shares_decoder_output(),
            self.encoder_history,
            self.decoder_history,
            self.encoder_pre_norm,
            self.decoder_pre_norm,
        ]
    }

    /// Integer header block, in wire order.
    pub fn int_fields(&self) -> [i32; INT_FIELDS] {
        [
            self.encoder_layers,
            self.decoder_layers,
            self.embed_dim,
            self.hidden_dim,
            self.ffn_dim,
            self.attention_heads,
            self.max_relative_length,
            self.max_source_len,
            self.max_target_len,
            self.src_vocab_size,
            self.tgt_vocab_size,
            self.specials.pad,
            self.specials.sos,
            self.specials.eos,
            self.specials.unk,
        ]
    }

    pub fn from_fields(bools: [bool; BOOL_FIELDS], ints: [i32; INT_FIELDS]) -> Result<Self> {
        Ok(Self {
            encoder_final_norm: bools[0],
            decoder_final_norm: bools[1],
            embeddings: EmbeddingPolicy::from_flags(bools[2], bools[3])?,
            encoder_history: bools[4],
            decoder_history: bools[5],
            encoder_pre_norm: bools[6],
            decoder_pre_norm: bools[7],
            encoder_layers: ints[0],
            decoder_layers: ints[1],
            embed_dim: ints[2],
            hidden_dim: ints[3],
            ffn_dim: ints[4],
            attention_heads: ints[5],
            max_relative_length: ints[6],
            max_source_len: ints[7],
            max_target_len: ints[8],
            src_vocab_size: ints[9],
            tgt_vocab_size: ints[10],
            specials: SpecialTokens::new(ints[11], ints[12], ints[13], ints[14]),
        })
    }

    pub fn with_specials(mut self, specials: SpecialTokens) -> Self {
        self.specials = specials;
        self
    }

    /// Parses training args. Reserved ids come from the args when they record them and
    /// from `default_specials` otherwise.
    pub fn from_args_json(json: &str, default_specials: SpecialTokens) -> Result<Self> {
        let args: ModelArgs = serde_json::from_str(json)?;
        let specials = args.specials.unwrap_or(default_specials);
        Ok(Self::try_from(args)?.with_specials(specials))
    }
}

fn default_max_positions() -> i32 {
    1024
}

/// Training arguments as stored alongside a checkpoint. Field names follow the
/// training framework; the short names are accepted as well.
#[derive(Debug, Clone, Deserialize)]
struct ModelArgs {
    encoder_layers: i32,
    decoder_layers: i32,
    #[serde(alias = "encoder_embed_dim")]
    embed_dim: i32,
    #[serde(default, alias = "decoder_input_dim")]
    hidden_dim: Option<i32>,
    #[serde(alias = "encoder_ffn_embed_dim")]
    ffn_dim: i32,
    #[serde(alias = "encoder_attention_heads")]
    attention_heads: i32,
    #[serde(default)]
    max_relative_length: i32,
    #[serde(default = "default_max_positions", alias = "max_source_positions")]
    max_source_len: i32,
    #[serde(default = "default_max_positions", alias = "max_target_positions")]
    max_target_len: i32,
    #[serde(default)]
    src_vocab_size: i32,
    #[serde(default)]
    tgt_vocab_size: i32,
    #[serde(default)]
    share_all_embeddings: bool,
    #[serde(default)]
    share_decoder_input_output_embed: bool,
    #[serde(default, alias = "encoder_normalize_before")]
    encoder_pre_norm: bool,
    #[serde(default, alias = "decoder_normalize_before")]
    decoder_pre_norm: bool,
    #[serde(default)]
    encoder_final_norm: Option<bool>,
    #[serde(default)]
    decoder_final_norm: Option<bool>,
    #[serde(default)]
    encoder_history: Option<bool>,
    #[serde(default)]
    decoder_history: Option<bool>,
    #[serde(default)]
    encoder_history_type: Option<String>,
    #[serde(default)]
    decoder_history_type: Option<String>,
    #[serde(default)]
    specials: Option<SpecialTokens>,
}

fn history_enabled(flag: Option<bool>, kind: Option<&str>) -> bool {
    flag.unwrap_or_else(|| kind.is_some_and(|k| !k.is_empty() && k != "none"))
}

impl TryFrom<ModelArgs> for ModelConfig {
    type Error = ConvertError;

    fn try_from(args: ModelArgs) -> Result<Self> {
        let mut share_io = args.share_decoder_input_output_embed;
        if args.share_all_embeddings && !share_io {
            tracing::warn!("share_all_embeddings implies shared decoder input/output embeddings");
            share_io = true;
        }

        Ok(Self {
            encoder_layers: args.encoder_layers,
            decoder_layers: args.decoder_layers,
            embed_dim: args.embed_dim,
            hidden_dim: args.hidden_dim.unwrap_or(args.embed_dim),
            ffn_dim: args.ffn_dim,
            attention_heads: args.attention_heads,
            max_relative_length: args.max_relative_length,
            max_source_len: args.max_source_len,
            max_target_len: args.max_target_len,
            src_vocab_size: args.src_vocab_size,
            tgt_vocab_size: args.tgt_vocab_size,
            encoder_final_norm: args.encoder_final_norm.unwrap_or(args.encoder_pre_norm),
            decoder_final_norm: args.decoder_final_norm.unwrap_or(args.decoder_pre_norm),
            encoder_history: history_enabled(args.encoder_history, args.encoder_history_type.as_deref()),
            decoder_history: history_enabled(args.decoder_history, args.decoder_history_type.as_deref()),
            encoder_pre_norm: args.encoder_pre_norm,
            decoder_pre_norm: args.decoder_pre_norm,
            embeddings: EmbeddingPolicy::from_flags(args.share_all_embeddings, share_io)?,
            specials: args.specials.unwrap_or_default(),
        })
    }
}

/// Packs a [`ModelConfig`] into the model file header and back.
pub struct ConfigPacker;

impl ConfigPacker {
    pub fn pack(config: &ModelConfig) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_LEN];
        for (byte, flag) in header.iter_mut().zip(config.bool_fields()) {
            *byte = u8::from(flag);
        }
        NativeEndian::write_i32_into(&config.int_fields(), &mut header[BOOL_FIELDS..]);
        header
    }

    pub fn unpack(header: &[u8]) -> Result<ModelConfig> {
        if header.len() < HEADER_LEN {
            return Err(ConvertError::InvalidConfig(format!(
                "header needs {} bytes, got {}",
                HEADER_LEN,
                header.len()
            )));
        }

        let mut bools = [false; BOOL_FIELDS];
        for (flag, byte) in bools.iter_mut().zip(&header[..BOOL_FIELDS]) {
            *flag = *byte != 0;
        }

        let mut ints = [0i32; INT_FIELDS];
        NativeEndian::read_i32_into(&header[BOOL_FIELDS..HEADER_LEN], &mut ints);

        ModelConfig::from_fields(bools, ints)
    }
}
