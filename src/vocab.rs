//! Vocabulary id assignment and the vocabulary text format.
//!
//! The text format is a header line `"<vocab_size> <start_id>"` followed by one
//! `"<word> <id>"` line per word.

use crate::error::{ConvertError, Result};
use crate::fs::AtomicFile;
use crate::tokens::SpecialTokens;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Embedding rows are allocated in blocks of this many ids.
pub const VOCAB_ALIGNMENT: i32 = 8;

/// How the raw vocabulary size is rounded to [`VOCAB_ALIGNMENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VocabPadding {
    /// Always adds `8 - raw % 8`, so an aligned size still gains a full block.
    /// Matches vocabulary files produced by the existing training pipeline.
    #[default]
    AlwaysAddBlock,
    /// Rounds up to the next multiple of 8; aligned sizes are kept.
    RoundUp,
}

impl VocabPadding {
    pub fn pad(&self, raw: i32) -> Option<i32> {
        let rem = raw.rem_euclid(VOCAB_ALIGNMENT);
        match self {
            VocabPadding::AlwaysAddBlock => raw.checked_add(VOCAB_ALIGNMENT - rem),
            VocabPadding::RoundUp if rem == 0 => Some(raw),
            VocabPadding::RoundUp => raw.checked_add(VOCAB_ALIGNMENT - rem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabMapping {
    pub vocab_size: i32,
    pub start_id: i32,
    entries: Vec<(String, i32)>,
    ids: HashMap<String, i32>,
}

impl VocabMapping {
    fn from_entries(vocab_size: i32, start_id: i32, entries: Vec<(String, i32)>) -> Self {
        let mut ids = HashMap::with_capacity(entries.len());
        // a repeated word resolves to its last id
        for (word, id) in &entries {
            ids.insert(word.clone(), *id);
        }
        Self {
            vocab_size,
            start_id,
            entries,
            ids,
        }
    }

    pub fn get(&self, word: &str) -> Option<i32> {
        self.ids.get(word).copied()
    }

    /// Entries in file order.
    pub fn entries(&self) -> &[(String, i32)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write_to<W: Write>(&self, mut out: W) -> Result<()> {
        writeln!(out, "{} {}", self.vocab_size, self.start_id)?;
        for (word, id) in &self.entries {
            writeln!(out, "{} {}", word, id)?;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = AtomicFile::create(&path)?;
        self.write_to(&mut out)?;
        out.commit()
    }

    pub fn read_from<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => return Err(ConvertError::InvalidVocabSize("empty vocabulary file".to_string())),
        };

        let mut fields = header.split_whitespace();
        let size_field = fields
            .next()
            .ok_or_else(|| ConvertError::InvalidVocabSize("missing size on the first line".to_string()))?;
        let vocab_size: i32 = size_field
            .parse()
            .map_err(|_| ConvertError::InvalidVocabSize(format!("'{}' is not a number", size_field)))?;
        if vocab_size <= 0 {
            return Err(ConvertError::InvalidVocabSize(vocab_size.to_string()));
        }
        let declared_start = match fields.next() {
            Some(field) => Some(
                field
                    .parse::<i32>()
                    .map_err(|_| ConvertError::InvalidFormat(format!("start id '{}' is not a number", field)))?,
            ),
            None => None,
        };

        let mut entries = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (word, id) = match (fields.next(), fields.next()) {
                (None, _) => continue,
                (Some(word), Some(id)) => (word, id),
                (Some(_), None) => {
                    return Err(ConvertError::InvalidFormat(format!("vocabulary line {} has no id", lineno + 2)))
                }
            };
            let id: i32 = id
                .parse()
                .map_err(|_| ConvertError::InvalidFormat(format!("vocabulary line {}: bad id '{}'", lineno + 2, id)))?;
            entries.push((word.to_string(), id));
        }

        let start_id = declared_start
            .or_else(|| entries.iter().map(|(_, id)| *id).min())
            .unwrap_or(vocab_size);

        Ok(Self::from_entries(vocab_size, start_id, entries))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mapping = Self::read_from(BufReader::new(File::open(&path)?))?;
        tracing::info!("{}: {} types", path.as_ref().display(), mapping.vocab_size);
        Ok(mapping)
    }
}

/// Assigns contiguous ids to words after the reserved range.
#[derive(Debug, Clone, Copy, Default)]
pub struct VocabAssigner {
    specials: SpecialTokens,
    padding: VocabPadding,
}

impl VocabAssigner {
    pub fn new(specials: SpecialTokens) -> Self {
        Self {
            specials,
            padding: VocabPadding::default(),
        }
    }

    pub fn with_padding(mut self, padding: VocabPadding) -> Self {
        self.padding = padding;
        self
    }

    pub fn assign<I, S>(&self, words: I) -> Result<VocabMapping>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let start_id = self.specials.start_id();
        let entries: Vec<(String, i32)> = words
            .into_iter()
            .zip(start_id..)
            .map(|(word, id)| (word.into(), id))
            .collect();

        let raw_size = i32::try_from(entries.len())
            .ok()
            .and_then(|n| n.checked_add(start_id))
            .ok_or_else(|| ConvertError::InvalidVocabSize(format!("{} words overflow the id space", entries.len())))?;
        let vocab_size = self
            .padding
            .pad(raw_size)
            .filter(|size| *size > 0)
            .ok_or_else(|| ConvertError::InvalidVocabSize(format!("computed size from raw size {}", raw_size)))?;

        tracing::debug!(
            "assigned {} words starting at {}, size {} padded to {}",
            entries.len(),
            start_id,
            raw_size,
            vocab_size
        );
        Ok(VocabMapping::from_entries(vocab_size, start_id, entries))
    }
}

/// Reads the first whitespace-separated field of every non-empty line.
pub fn parse_word_list<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut words = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        match line.split_whitespace().next() {
            Some(word) => words.push(word.to_string()),
            None => tracing::warn!("skipping empty line {} in word list", lineno + 1),
        }
    }
    Ok(words)
}

pub fn read_word_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    parse_word_list(BufReader::new(File::open(path)?))
}
