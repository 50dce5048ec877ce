pub mod convert;
pub mod corpus;
pub mod error;
pub mod fs;
pub mod tokens;
pub mod vocab;

pub use convert::{
    convert_precision, ensemble, read_model, write_model, Checkpoint, CheckpointLoader, ConfigPacker, Converter,
    EmbeddingPolicy, ModelConfig, ModelSummary, NamedTensor, ParameterFlattener, StorageFormat, Tensor,
};
pub use corpus::{read_corpus, read_corpus_file, write_corpus, CorpusBinarizer, CorpusLayout, CorpusStats, ParallelRecord};
pub use error::{ConvertError, Result};
pub use tokens::SpecialTokens;
pub use vocab::{read_word_list, VocabAssigner, VocabMapping, VocabPadding};
