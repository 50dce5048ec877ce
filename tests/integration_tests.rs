use nmt_convert::convert::{HEADER_LEN, ORDER_METADATA_KEY};
use nmt_convert::{
    convert_precision, ensemble, read_corpus_file, read_model, read_word_list, write_model, CheckpointLoader,
    ConvertError, Converter, CorpusBinarizer, CorpusLayout, EmbeddingPolicy, ModelConfig, SpecialTokens,
    StorageFormat, Tensor, VocabAssigner, VocabMapping,
};
use std::borrow::Cow;
use std::fs;
use std::path::PathBuf;

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("nmt-convert-it-{}-{}", std::process::id(), name));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn config_json(extra: &str) -> String {
    format!(
        r#"{{"encoder_layers": 1, "decoder_layers": 1, "encoder_embed_dim": 3,
            "encoder_ffn_embed_dim": 2, "encoder_attention_heads": 1{}}}"#,
        extra
    )
}

fn config() -> ModelConfig {
    serde_json::from_str(&config_json(r#", "src_vocab_size": 8, "tgt_vocab_size": 8"#)).unwrap()
}

fn seq(start: usize, shape: Vec<usize>) -> Tensor {
    let count: usize = shape.iter().product();
    Tensor::new(shape, (start..start + count).map(|v| v as f32).collect()).unwrap()
}

/// Writes an F32 safetensors file laid out the way serializers lay it out: data sorted
/// by tensor name. `tensors` is the state-dict order, recorded as metadata when
/// `record_order` is set.
fn write_safetensors(path: &PathBuf, tensors: &[(&str, Tensor)], record_order: bool) {
    let mut sorted: Vec<&(&str, Tensor)> = tensors.iter().collect();
    sorted.sort_by_key(|(name, _)| *name);

    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, tensor) in sorted {
        let start = data.len();
        for v in &tensor.data {
            data.extend_from_slice(&v.to_le_bytes());
        }
        header.insert(
            name.to_string(),
            serde_json::json!({"dtype": "F32", "shape": tensor.shape, "data_offsets": [start, data.len()]}),
        );
    }
    if record_order {
        let order: Vec<&str> = tensors.iter().map(|(name, _)| *name).collect();
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            ORDER_METADATA_KEY.to_string(),
            serde_json::Value::String(serde_json::to_string(&order).unwrap()),
        );
        header.insert("__metadata__".to_string(), serde_json::Value::Object(metadata));
    }
    let header = serde_json::to_vec(&header).unwrap();

    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&data);
    fs::write(path, bytes).unwrap();
}

fn write_values(path: &PathBuf, values: Vec<f32>, format: StorageFormat) {
    let tensor = Tensor::new(vec![values.len()], values).unwrap();
    write_model(path, &config(), &[Cow::Owned(tensor)], format).unwrap();
}

#[test]
fn test_checkpoint_to_model() {
    let dir = test_dir("model");
    let weights = dir.join("model.safetensors");
    let args = dir.join("args.json");
    let output = dir.join("model.bin");

    // state-dict order differs from name order
    write_safetensors(
        &weights,
        &[
            ("version", seq(0, vec![1])),
            ("encoder.layers.0.fc1.weight", seq(0, vec![2, 3])),
            ("encoder.layers.0.fc1.bias", seq(100, vec![2])),
            ("encoder.embed_tokens.weight", seq(200, vec![8, 3])),
            ("decoder.embed_tokens.weight", seq(300, vec![8, 3])),
            ("decoder.embed_out", seq(400, vec![8, 3])),
        ],
        true,
    );
    fs::write(&args, config_json(r#", "share_decoder_input_output_embed": true"#)).unwrap();

    let converter = Converter::load(&weights, &args).unwrap();
    assert_eq!(converter.checkpoint().tensor_count(), 6);
    let summary = converter.convert_to_file(&output).unwrap();
    assert_eq!(summary.tensors, 4);
    assert_eq!(summary.values, 6 + 2 + 24 + 24);
    assert_eq!(fs::metadata(&output).unwrap().len(), (HEADER_LEN + 56 * 4) as u64);

    let (config, values) = read_model(&output, StorageFormat::Fp32).unwrap();
    assert_eq!(config.embeddings, EmbeddingPolicy::SharedWithDecoderOutput);
    assert_eq!(config.src_vocab_size, 8);
    assert_eq!(config.tgt_vocab_size, 8);
    assert_eq!(config.specials, SpecialTokens::default());

    assert_eq!(&values[..6], &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    assert_eq!(&values[6..8], &[100.0, 101.0]);
    assert_eq!(values[8], 200.0);
    assert_eq!(values[32], 300.0);
    assert_eq!(*values.last().unwrap(), 323.0);

    let names = dir.join("model.name.txt");
    converter.checkpoint().write_name_list(&names).unwrap();
    let listed = fs::read_to_string(&names).unwrap();
    assert_eq!(listed.lines().nth(1), Some("encoder.layers.0.fc1.weight\t[2, 3]"));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_missing_output_projection_writes_nothing() {
    let dir = test_dir("missing");
    let weights = dir.join("model.safetensors");
    let args = dir.join("args.json");
    let output = dir.join("model.bin");

    write_safetensors(
        &weights,
        &[
            ("encoder.embed_tokens.weight", seq(0, vec![8, 3])),
            ("decoder.embed_tokens.weight", seq(0, vec![8, 3])),
        ],
        true,
    );
    fs::write(&args, config_json("")).unwrap();

    let err = Converter::load(&weights, &args).unwrap().convert_to_file(&output).unwrap_err();
    assert!(matches!(err, ConvertError::MissingTensor(_)));
    assert!(!output.exists());

    fs::remove_dir_all(&dir).unwrap();
}

/// Eleven layers sort as 0, 1, 10, 2, ... by name; the model must keep layer order.
fn layered_checkpoint() -> Vec<(String, Tensor)> {
    let mut tensors: Vec<(String, Tensor)> = (0..11)
        .map(|i| {
            let bias = Tensor::new(vec![2], vec![i as f32; 2]).unwrap();
            (format!("encoder.layers.{}.fc1.bias", i), bias)
        })
        .collect();
    tensors.push(("encoder.embed_tokens.weight".to_string(), Tensor::new(vec![8, 1], vec![99.0; 8]).unwrap()));
    tensors
}

fn expected_layered_values() -> Vec<f32> {
    let mut values: Vec<f32> = (0..11).flat_map(|i| [i as f32; 2]).collect();
    values.extend([99.0; 8]);
    values
}

#[test]
fn test_recorded_order_beats_storage_order() {
    let dir = test_dir("layers");
    let weights = dir.join("model.safetensors");
    let args = dir.join("args.json");
    let output = dir.join("model.bin");

    let tensors = layered_checkpoint();
    let named: Vec<(&str, Tensor)> = tensors.iter().map(|(n, t)| (n.as_str(), t.clone())).collect();
    write_safetensors(&weights, &named, true);
    fs::write(
        &args,
        r#"{"encoder_layers": 11, "decoder_layers": 1, "embed_dim": 1, "ffn_dim": 2,
            "attention_heads": 1, "share_all_embeddings": true}"#,
    )
    .unwrap();

    Converter::load(&weights, &args).unwrap().convert_to_file(&output).unwrap();
    let (_, values) = read_model(&output, StorageFormat::Fp32).unwrap();
    assert_eq!(values, expected_layered_values());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_order_from_name_list() {
    let dir = test_dir("name-list");
    let weights = dir.join("model.safetensors");
    let args = dir.join("args.json");
    let names = dir.join("model.name.txt");
    let output = dir.join("model.bin");

    let tensors = layered_checkpoint();
    let named: Vec<(&str, Tensor)> = tensors.iter().map(|(n, t)| (n.as_str(), t.clone())).collect();
    write_safetensors(&weights, &named, false);
    fs::write(
        &args,
        r#"{"encoder_layers": 11, "decoder_layers": 1, "embed_dim": 1, "ffn_dim": 2,
            "attention_heads": 1, "share_all_embeddings": true}"#,
    )
    .unwrap();

    // no recorded order and no name list: refuse to guess
    let err = Converter::load(&weights, &args).unwrap_err();
    assert!(matches!(err, ConvertError::InvalidFormat(_)), "{:?}", err);

    let listing: String = tensors
        .iter()
        .map(|(name, t)| format!("{}\t{:?}\n", name, t.shape))
        .collect();
    fs::write(&names, listing).unwrap();

    let checkpoint = CheckpointLoader::new().with_order(&names).load(&weights, &args).unwrap();
    Converter::new(checkpoint).convert_to_file(&output).unwrap();
    let (_, values) = read_model(&output, StorageFormat::Fp32).unwrap();
    assert_eq!(values, expected_layered_values());

    // an order that leaves a tensor out is rejected
    fs::write(&names, "encoder.embed_tokens.weight\n").unwrap();
    let err = CheckpointLoader::new().with_order(&names).load(&weights, &args).unwrap_err();
    assert!(matches!(err, ConvertError::InvalidFormat(_)), "{:?}", err);

    fs::write(&names, "encoder.layers.11.fc1.bias\n").unwrap();
    let err = CheckpointLoader::new().with_order(&names).load(&weights, &args).unwrap_err();
    assert!(matches!(err, ConvertError::MissingTensor(_)), "{:?}", err);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_args_specials_survive_loading() {
    let dir = test_dir("specials");
    let weights = dir.join("model.safetensors");
    let args = dir.join("args.json");
    let output = dir.join("model.bin");

    write_safetensors(&weights, &[("encoder.embed_tokens.weight", seq(0, vec![8, 1]))], true);
    let env_defaults = SpecialTokens::new(1, 2, 2, 3);

    fs::write(
        &args,
        r#"{"encoder_layers": 1, "decoder_layers": 1, "embed_dim": 1, "ffn_dim": 2,
            "attention_heads": 1, "share_all_embeddings": true,
            "specials": {"pad": 0, "sos": 1, "eos": 2, "unk": 3}}"#,
    )
    .unwrap();
    let checkpoint = CheckpointLoader::new()
        .with_default_specials(env_defaults)
        .load(&weights, &args)
        .unwrap();
    Converter::new(checkpoint).convert_to_file(&output).unwrap();
    let (config, _) = read_model(&output, StorageFormat::Fp32).unwrap();
    assert_eq!(config.specials, SpecialTokens::new(0, 1, 2, 3));

    fs::write(
        &args,
        r#"{"encoder_layers": 1, "decoder_layers": 1, "embed_dim": 1, "ffn_dim": 2,
            "attention_heads": 1, "share_all_embeddings": true}"#,
    )
    .unwrap();
    let checkpoint = CheckpointLoader::new()
        .with_default_specials(SpecialTokens::new(0, 5, 6, 7))
        .load(&weights, &args)
        .unwrap();
    assert_eq!(checkpoint.config.specials, SpecialTokens::new(0, 5, 6, 7));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_precision_round_trip() {
    let dir = test_dir("precision");
    let fp32 = dir.join("model.fp32");
    let fp16 = dir.join("model.fp16");
    let back = dir.join("model.back");

    let values = vec![0.5, -1.25, 3.0e-3, 1000.0, 1.0 / 3.0];
    write_values(&fp32, values.clone(), StorageFormat::Fp32);

    assert_eq!(convert_precision(&fp32, &fp16, StorageFormat::Fp32, StorageFormat::Fp16).unwrap(), 5);
    assert_eq!(fs::metadata(&fp16).unwrap().len(), (HEADER_LEN + 5 * 2) as u64);
    convert_precision(&fp16, &back, StorageFormat::Fp16, StorageFormat::Fp32).unwrap();

    let original = fs::read(&fp32).unwrap();
    let restored = fs::read(&back).unwrap();
    assert_eq!(&original[..HEADER_LEN], &restored[..HEADER_LEN]);

    let (_, narrowed) = read_model(&back, StorageFormat::Fp32).unwrap();
    for (v, w) in values.iter().zip(&narrowed) {
        assert!((v - w).abs() <= v.abs() * 1e-3, "{} vs {}", v, w);
    }
    assert_eq!(narrowed[0], 0.5);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_ensemble_mean() {
    let dir = test_dir("ensemble");
    let a = dir.join("a.bin");
    let b = dir.join("b.bin");
    let out = dir.join("mean.bin");

    write_values(&a, vec![1.0, 2.0, 3.0], StorageFormat::Fp32);
    write_values(&b, vec![3.0, 2.0, -3.0], StorageFormat::Fp32);

    assert_eq!(ensemble(&[&a, &b], &out, StorageFormat::Fp32).unwrap(), 3);
    let (_, values) = read_model(&out, StorageFormat::Fp32).unwrap();
    assert_eq!(values, vec![2.0, 2.0, 0.0]);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_ensemble_of_one_is_identity() {
    let dir = test_dir("single");
    let a = dir.join("a.bin");
    let out = dir.join("out.bin");

    write_values(&a, vec![0.1, -7.5, 1.0e-7, 42.0], StorageFormat::Fp16);
    ensemble(&[&a], &out, StorageFormat::Fp16).unwrap();
    assert_eq!(fs::read(&a).unwrap(), fs::read(&out).unwrap());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_ensemble_shape_mismatch() {
    let dir = test_dir("mismatch");
    let a = dir.join("a.bin");
    let b = dir.join("b.bin");
    let out = dir.join("out.bin");

    write_values(&a, vec![1.0, 2.0, 3.0], StorageFormat::Fp32);
    write_values(&b, vec![1.0, 2.0], StorageFormat::Fp32);

    let err = ensemble(&[&a, &b], &out, StorageFormat::Fp32).unwrap_err();
    assert!(matches!(err, ConvertError::ShapeMismatch(_)));
    assert!(!out.exists());

    let empty: [&PathBuf; 0] = [];
    assert!(ensemble(&empty, &out, StorageFormat::Fp32).is_err());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_vocab_and_corpus_files() {
    let dir = test_dir("corpus");
    let src_words = dir.join("src.words");
    let tgt_words = dir.join("tgt.words");
    let src_vocab = dir.join("src.vocab");
    let tgt_vocab = dir.join("tgt.vocab");
    let src_text = dir.join("train.src");
    let tgt_text = dir.join("train.tgt");
    let output = dir.join("train.bin");

    fs::write(&src_words, "a 10\nb 9\nc 8\n").unwrap();
    fs::write(&tgt_words, "x\ny\n").unwrap();
    fs::write(&src_text, "a b c\nc zz\n").unwrap();
    fs::write(&tgt_text, "x y\ny\n").unwrap();

    let specials = SpecialTokens::default();
    let assigner = VocabAssigner::new(specials);
    assigner.assign(read_word_list(&src_words).unwrap()).unwrap().save(&src_vocab).unwrap();
    assigner.assign(read_word_list(&tgt_words).unwrap()).unwrap().save(&tgt_vocab).unwrap();
    assert_eq!(fs::read_to_string(&tgt_vocab).unwrap(), "8 4\nx 4\ny 5\n");

    let src = VocabMapping::load(&src_vocab).unwrap();
    let tgt = VocabMapping::load(&tgt_vocab).unwrap();
    let stats = CorpusBinarizer::new(&src, &tgt, specials)
        .binarize_files(&src_text, &tgt_text, &output, CorpusLayout::Compact)
        .unwrap();
    assert_eq!(stats.sentences, 2);
    assert_eq!(stats.source.unknown, 1);

    let bytes = fs::read(&output).unwrap();
    assert_eq!(&bytes[8..16], &2u64.to_ne_bytes());

    let corpus = read_corpus_file(&output, CorpusLayout::Compact).unwrap();
    assert_eq!(corpus.src_vocab_size, 8);
    assert_eq!(corpus.records[0].src_ids, vec![4, 5, 6, 2]);
    assert_eq!(corpus.records[0].tgt_ids, vec![2, 4, 5]);
    assert_eq!(corpus.records[1].src_ids, vec![6, 3, 2]);
    assert_eq!(corpus.records[1].tgt_ids, vec![2, 5]);

    fs::remove_dir_all(&dir).unwrap();
}
