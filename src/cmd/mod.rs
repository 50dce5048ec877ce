use crate::envconfig::EnvConfig;
use crate::format::{human_bytes, human_number, percent};
use crate::progress::Progress;
use anyhow::{bail, Context, Result};
use nmt_convert::convert::HEADER_LEN;
use nmt_convert::{
    convert_precision, ensemble, read_word_list, CheckpointLoader, ConfigPacker, Converter, CorpusBinarizer,
    CorpusLayout, SpecialTokens, StorageFormat, VocabAssigner, VocabMapping, VocabPadding,
};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Reserved ids given on the command line. Unset ids fall back field by field.
#[derive(Debug, Default, Clone, Copy, clap::Args)]
pub struct SpecialArgs {
    #[arg(long)]
    pub pad_id: Option<i32>,
    #[arg(long)]
    pub sos_id: Option<i32>,
    #[arg(long)]
    pub eos_id: Option<i32>,
    #[arg(long)]
    pub unk_id: Option<i32>,
}

impl SpecialArgs {
    fn resolve(&self, fallback: SpecialTokens) -> SpecialTokens {
        SpecialTokens::new(
            self.pad_id.unwrap_or(fallback.pad),
            self.sos_id.unwrap_or(fallback.sos),
            self.eos_id.unwrap_or(fallback.eos),
            self.unk_id.unwrap_or(fallback.unk),
        )
    }
}

fn storage_format(arg: Option<StorageFormat>, env: &EnvConfig) -> StorageFormat {
    arg.unwrap_or(env.storage_format)
}

pub struct ModelArgs<'a> {
    pub weights: &'a Path,
    pub args: &'a Path,
    pub output: &'a Path,
    pub format: Option<StorageFormat>,
    pub order: Option<&'a Path>,
    pub names: Option<&'a Path>,
    pub specials: SpecialArgs,
}

pub fn model(opts: ModelArgs<'_>, env: &EnvConfig, progress: &mut Progress) -> Result<()> {
    progress.spinner(&format!("loading {}", opts.weights.display()));
    let mut loader = CheckpointLoader::new().with_default_specials(env.specials);
    if let Some(order) = opts.order {
        loader = loader.with_order(order);
    }
    let mut checkpoint = loader
        .load(opts.weights, opts.args)
        .with_context(|| format!("failed to load checkpoint {}", opts.weights.display()))?;
    // flags override the args file, which overrides the environment
    checkpoint.config.specials = opts.specials.resolve(checkpoint.config.specials);
    let converter = Converter::new(checkpoint).with_format(storage_format(opts.format, env));

    if let Some(names) = opts.names {
        converter
            .checkpoint()
            .write_name_list(names)
            .with_context(|| format!("failed to write {}", names.display()))?;
    }

    progress.spinner(&format!("writing {}", opts.output.display()));
    let summary = converter
        .convert_to_file(opts.output)
        .with_context(|| format!("failed to convert into {}", opts.output.display()))?;
    progress.stop_and_clear();

    println!(
        "{}: {} parameters, {} values, {}",
        opts.output.display(),
        summary.tensors,
        human_number(summary.values),
        human_bytes(summary.bytes)
    );
    Ok(())
}

pub fn format(input: &Path, output: &Path, from: StorageFormat, to: StorageFormat, progress: &mut Progress) -> Result<()> {
    progress.spinner(&format!("converting {} from {} to {}", input.display(), from, to));
    let values = convert_precision(input, output, from, to)
        .with_context(|| format!("failed to convert {}", input.display()))?;
    progress.stop_and_clear();

    println!("{}: {} values as {}", output.display(), human_number(values), to);
    Ok(())
}

pub fn ensemble_models(
    inputs: &[PathBuf],
    output: &Path,
    format: Option<StorageFormat>,
    env: &EnvConfig,
    progress: &mut Progress,
) -> Result<()> {
    let format = storage_format(format, env);
    progress.spinner(&format!("averaging {} models", inputs.len()));
    let values = ensemble(inputs, output, format).context("ensemble failed")?;
    progress.stop_and_clear();

    println!(
        "{}: mean of {} models, {} values each",
        output.display(),
        inputs.len(),
        human_number(values)
    );
    Ok(())
}

pub fn vocab(
    input: &Path,
    output: &Path,
    round_up: bool,
    specials: SpecialArgs,
    env: &EnvConfig,
) -> Result<()> {
    let words = read_word_list(input).with_context(|| format!("failed to read {}", input.display()))?;
    let padding = if round_up {
        VocabPadding::RoundUp
    } else {
        VocabPadding::AlwaysAddBlock
    };
    let mapping = VocabAssigner::new(specials.resolve(env.specials))
        .with_padding(padding)
        .assign(words)?;
    mapping
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "{}: {} words, ids from {}, size {}",
        output.display(),
        mapping.len(),
        mapping.start_id,
        mapping.vocab_size
    );
    Ok(())
}

pub struct CorpusArgs<'a> {
    pub src_vocab: &'a Path,
    pub tgt_vocab: &'a Path,
    pub src: &'a Path,
    pub tgt: &'a Path,
    pub output: &'a Path,
    pub max_src_len: Option<usize>,
    pub max_tgt_len: Option<usize>,
    pub layout: CorpusLayout,
    pub specials: SpecialArgs,
}

pub fn corpus(opts: CorpusArgs<'_>, env: &EnvConfig, progress: &mut Progress) -> Result<()> {
    let src_vocab =
        VocabMapping::load(opts.src_vocab).with_context(|| format!("failed to load {}", opts.src_vocab.display()))?;
    let tgt_vocab =
        VocabMapping::load(opts.tgt_vocab).with_context(|| format!("failed to load {}", opts.tgt_vocab.display()))?;

    let binarizer = CorpusBinarizer::new(&src_vocab, &tgt_vocab, opts.specials.resolve(env.specials)).with_max_lengths(
        opts.max_src_len.unwrap_or(env.max_sent_len),
        opts.max_tgt_len.unwrap_or(env.max_sent_len),
    )?;

    progress.spinner(&format!("binarizing {}", opts.src.display()));
    let stats = binarizer
        .binarize_files(opts.src, opts.tgt, opts.output, opts.layout)
        .with_context(|| format!("failed to binarize into {}", opts.output.display()))?;
    progress.stop_and_clear();

    println!(
        "{}: {} pairs, source {} tokens ({} unknown), target {} tokens ({} unknown), {} truncated",
        opts.output.display(),
        stats.sentences,
        stats.source.tokens,
        percent(stats.source.unknown_rate()),
        stats.target.tokens,
        percent(stats.target.unknown_rate()),
        stats.truncated()
    );
    Ok(())
}

pub fn inspect(path: &Path, format: Option<StorageFormat>, env: &EnvConfig) -> Result<()> {
    let len = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if len < HEADER_LEN as u64 {
        bail!("{} is too short to hold a model header ({} bytes)", path.display(), len);
    }

    let mut header = [0u8; HEADER_LEN];
    File::open(path)?.read_exact(&mut header)?;
    let config = ConfigPacker::unpack(&header).with_context(|| format!("bad header in {}", path.display()))?;

    let format = storage_format(format, env);
    let stream = len - HEADER_LEN as u64;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!(
        "{}: {} of parameters, {} values as {}{}",
        path.display(),
        human_bytes(stream),
        human_number(stream / format.width() as u64),
        format,
        if stream % format.width() as u64 != 0 {
            " (trailing bytes)"
        } else {
            ""
        }
    );
    Ok(())
}
