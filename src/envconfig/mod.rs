use nmt_convert::corpus::MAX_SENT_LEN;
use nmt_convert::{SpecialTokens, StorageFormat};
use std::env;
use std::str::FromStr;

/// Defaults taken from the environment. Command-line flags override every field.
pub struct EnvConfig {
    pub specials: SpecialTokens,
    pub max_sent_len: usize,
    pub storage_format: StorageFormat,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let defaults = SpecialTokens::default();
        Self {
            specials: SpecialTokens::new(
                var_or("NMT_PAD_ID", defaults.pad),
                var_or("NMT_SOS_ID", defaults.sos),
                var_or("NMT_EOS_ID", defaults.eos),
                var_or("NMT_UNK_ID", defaults.unk),
            ),
            max_sent_len: var_or("NMT_MAX_SENT_LEN", MAX_SENT_LEN),
            storage_format: var_or("NMT_STORAGE_FORMAT", StorageFormat::default()),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("ignoring unparsable {}={}", key, value);
                default
            }
        },
        Err(_) => default,
    }
}
