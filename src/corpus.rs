//! Binarization of line-aligned parallel corpora.
//!
//! Every sentence pair is framed as `src_len, tgt_len, src ids, tgt ids` (all `i32`,
//! native byte order) after a layout-specific file header, see [`CorpusLayout`].

use crate::error::{ConvertError, Result};
use crate::fs::AtomicFile;
use crate::tokens::SpecialTokens;
use crate::vocab::VocabMapping;
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Default cap on tokens per sentence, end marker included.
pub const MAX_SENT_LEN: usize = 1024;

/// File header variants. The caller always names the layout explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorpusLayout {
    /// `i32 src_vocab, i32 tgt_vocab, u64 pairs`. Read by the training loader.
    #[default]
    Compact,
    /// `i32 src_vocab, i32 tgt_vocab, i32 pad, i32 sos, i32 eos, i32 unk, i32 pairs`.
    WithSpecials,
}

impl CorpusLayout {
    fn write_header<W: Write>(
        &self,
        out: &mut W,
        src_vocab_size: i32,
        tgt_vocab_size: i32,
        specials: &SpecialTokens,
        pairs: u64,
    ) -> Result<()> {
        out.write_i32::<NativeEndian>(src_vocab_size)?;
        out.write_i32::<NativeEndian>(tgt_vocab_size)?;
        match self {
            CorpusLayout::Compact => out.write_u64::<NativeEndian>(pairs)?,
            CorpusLayout::WithSpecials => {
                for id in specials.as_array() {
                    out.write_i32::<NativeEndian>(id)?;
                }
                let pairs = i32::try_from(pairs)
                    .map_err(|_| ConvertError::InvalidConfig(format!("{} pairs overflow a 4-byte count", pairs)))?;
                out.write_i32::<NativeEndian>(pairs)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelRecord {
    pub src_ids: Vec<i32>,
    pub tgt_ids: Vec<i32>,
}

impl ParallelRecord {
    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_i32::<NativeEndian>(self.src_ids.len() as i32)?;
        out.write_i32::<NativeEndian>(self.tgt_ids.len() as i32)?;
        for &id in self.src_ids.iter().chain(&self.tgt_ids) {
            out.write_i32::<NativeEndian>(id)?;
        }
        Ok(())
    }
}

/// Per-side counters. `tokens` excludes the start/end marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideStats {
    pub tokens: u64,
    pub unknown: u64,
    pub truncated: u64,
}

impl SideStats {
    pub fn unknown_rate(&self) -> f64 {
        if self.tokens == 0 {
            0.0
        } else {
            self.unknown as f64 / self.tokens as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusStats {
    pub sentences: u64,
    pub source: SideStats,
    pub target: SideStats,
}

impl CorpusStats {
    pub fn truncated(&self) -> u64 {
        self.source.truncated + self.target.truncated
    }
}

pub struct CorpusBinarizer<'a> {
    src_vocab: &'a VocabMapping,
    tgt_vocab: &'a VocabMapping,
    specials: SpecialTokens,
    max_src: usize,
    max_tgt: usize,
}

impl<'a> CorpusBinarizer<'a> {
    pub fn new(src_vocab: &'a VocabMapping, tgt_vocab: &'a VocabMapping, specials: SpecialTokens) -> Self {
        Self {
            src_vocab,
            tgt_vocab,
            specials,
            max_src: MAX_SENT_LEN,
            max_tgt: MAX_SENT_LEN,
        }
    }

    pub fn with_max_lengths(mut self, max_src: usize, max_tgt: usize) -> Result<Self> {
        if max_src == 0 || max_tgt == 0 {
            return Err(ConvertError::InvalidConfig(format!(
                "maximum sentence lengths must be positive, got {} and {}",
                max_src, max_tgt
            )));
        }
        self.max_src = max_src;
        self.max_tgt = max_tgt;
        Ok(self)
    }

    fn lookup(vocab: &VocabMapping, line: &str, max: usize, unk: i32, stats: &mut SideStats) -> Vec<i32> {
        let mut words: Vec<&str> = line.split_whitespace().collect();
        if words.len() >= max {
            words.truncate(max - 1);
            stats.truncated += 1;
        }

        let mut ids = Vec::with_capacity(words.len() + 1);
        for word in words {
            match vocab.get(word) {
                Some(id) => ids.push(id),
                None => {
                    stats.unknown += 1;
                    ids.push(unk);
                }
            }
        }
        stats.tokens += ids.len() as u64;
        ids
    }

    /// Tokenizes one sentence pair and frames it with end/start markers.
    pub fn encode_pair(&self, src_line: &str, tgt_line: &str, stats: &mut CorpusStats) -> ParallelRecord {
        let unk = self.specials.unk;

        let mut src_ids = Self::lookup(self.src_vocab, src_line, self.max_src, unk, &mut stats.source);
        src_ids.push(self.specials.eos);

        let words = Self::lookup(self.tgt_vocab, tgt_line, self.max_tgt, unk, &mut stats.target);
        let mut tgt_ids = Vec::with_capacity(words.len() + 1);
        tgt_ids.push(self.specials.sos);
        tgt_ids.extend(words);

        stats.sentences += 1;
        ParallelRecord { src_ids, tgt_ids }
    }

    /// Visits every pair in order. A missing target line counts as empty.
    fn for_each_pair<S, T, F>(&self, src: S, tgt: T, mut visit: F) -> Result<CorpusStats>
    where
        S: BufRead,
        T: BufRead,
        F: FnMut(ParallelRecord) -> Result<()>,
    {
        let mut stats = CorpusStats::default();
        let mut tgt_lines = tgt.lines();
        let mut missing = 0u64;

        for src_line in src.lines() {
            let src_line = src_line?;
            let tgt_line = match tgt_lines.next() {
                Some(line) => line?,
                None => {
                    missing += 1;
                    String::new()
                }
            };
            visit(self.encode_pair(&src_line, &tgt_line, &mut stats))?;
        }

        if missing > 0 {
            tracing::warn!("target corpus is {} lines shorter than the source", missing);
        }
        if tgt_lines.next().is_some() {
            tracing::warn!("ignoring extra target lines after sentence {}", stats.sentences);
        }
        Ok(stats)
    }

    pub fn binarize<S: BufRead, T: BufRead>(&self, src: S, tgt: T) -> Result<(Vec<ParallelRecord>, CorpusStats)> {
        let mut records = Vec::new();
        let stats = self.for_each_pair(src, tgt, |record| {
            records.push(record);
            Ok(())
        })?;
        Ok((records, stats))
    }

    /// Streams a binarized corpus into `out`, patching the pair count afterwards.
    pub fn write_to<S, T, W>(&self, src: S, tgt: T, out: &mut W, layout: CorpusLayout) -> Result<CorpusStats>
    where
        S: BufRead,
        T: BufRead,
        W: Write + Seek,
    {
        let start = out.stream_position()?;
        self.write_header(out, layout, 0)?;

        let stats = self.for_each_pair(src, tgt, |record| record.write_to(out))?;

        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(start))?;
        self.write_header(out, layout, stats.sentences)?;
        out.seek(SeekFrom::Start(end))?;
        Ok(stats)
    }

    fn write_header<W: Write>(&self, out: &mut W, layout: CorpusLayout, pairs: u64) -> Result<()> {
        layout.write_header(
            out,
            self.src_vocab.vocab_size,
            self.tgt_vocab.vocab_size,
            &self.specials,
            pairs,
        )
    }

    pub fn binarize_files<P, Q, O>(&self, src: P, tgt: Q, output: O, layout: CorpusLayout) -> Result<CorpusStats>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        O: AsRef<Path>,
    {
        let src_reader = BufReader::new(File::open(&src)?);
        let tgt_reader = BufReader::new(File::open(&tgt)?);

        let mut out = AtomicFile::create(&output)?;
        let stats = self.write_to(src_reader, tgt_reader, &mut out, layout)?;
        out.commit()?;

        tracing::info!(
            "{}: {} sents, {} tokens, {:.2} replaced by <UNK>",
            src.as_ref().display(),
            stats.sentences,
            stats.source.tokens,
            stats.source.unknown_rate()
        );
        tracing::info!(
            "{}: {} sents, {} tokens, {:.2} replaced by <UNK>",
            tgt.as_ref().display(),
            stats.sentences,
            stats.target.tokens,
            stats.target.unknown_rate()
        );
        if stats.truncated() > 0 {
            tracing::info!("truncated {} over-length sentences", stats.truncated());
        }
        Ok(stats)
    }
}

/// Writes already-encoded records.
pub fn write_corpus<W: Write>(
    out: &mut W,
    records: &[ParallelRecord],
    src_vocab_size: i32,
    tgt_vocab_size: i32,
    specials: &SpecialTokens,
    layout: CorpusLayout,
) -> Result<()> {
    layout.write_header(out, src_vocab_size, tgt_vocab_size, specials, records.len() as u64)?;
    for record in records {
        record.write_to(out)?;
    }
    Ok(())
}

/// A binarized corpus read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    pub src_vocab_size: i32,
    pub tgt_vocab_size: i32,
    pub specials: Option<SpecialTokens>,
    pub records: Vec<ParallelRecord>,
}

fn read_ids<R: Read>(reader: &mut R, len: i32) -> Result<Vec<i32>> {
    let len = usize::try_from(len).map_err(|_| ConvertError::InvalidFormat(format!("negative sentence length {}", len)))?;
    let mut ids = vec![0i32; len];
    reader.read_i32_into::<NativeEndian>(&mut ids)?;
    Ok(ids)
}

pub fn read_corpus<R: Read>(mut reader: R, layout: CorpusLayout) -> Result<Corpus> {
    let src_vocab_size = reader.read_i32::<NativeEndian>()?;
    let tgt_vocab_size = reader.read_i32::<NativeEndian>()?;
    let (specials, pairs) = match layout {
        CorpusLayout::Compact => (None, reader.read_u64::<NativeEndian>()?),
        CorpusLayout::WithSpecials => {
            let mut ids = [0i32; 4];
            reader.read_i32_into::<NativeEndian>(&mut ids)?;
            let pairs = reader.read_i32::<NativeEndian>()?;
            let pairs = u64::try_from(pairs)
                .map_err(|_| ConvertError::InvalidFormat(format!("negative pair count {}", pairs)))?;
            (Some(SpecialTokens::new(ids[0], ids[1], ids[2], ids[3])), pairs)
        }
    };

    let mut records = Vec::new();
    for _ in 0..pairs {
        let src_len = reader.read_i32::<NativeEndian>()?;
        let tgt_len = reader.read_i32::<NativeEndian>()?;
        let src_ids = read_ids(&mut reader, src_len)?;
        let tgt_ids = read_ids(&mut reader, tgt_len)?;
        records.push(ParallelRecord { src_ids, tgt_ids });
    }

    Ok(Corpus {
        src_vocab_size,
        tgt_vocab_size,
        specials,
        records,
    })
}

pub fn read_corpus_file<P: AsRef<Path>>(path: P, layout: CorpusLayout) -> Result<Corpus> {
    read_corpus(BufReader::new(File::open(path)?), layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::VocabAssigner;
    use std::io::Cursor;

    const EOS: i32 = 2;
    const SOS: i32 = 2;
    const UNK: i32 = 3;

    fn vocabs() -> (VocabMapping, VocabMapping) {
        let assigner = VocabAssigner::default();
        (
            assigner.assign(vec!["a", "b", "c"]).unwrap(),
            assigner.assign(vec!["x", "y"]).unwrap(),
        )
    }

    #[test]
    fn test_single_sentence_scenario() {
        let (src, tgt) = vocabs();
        let binarizer = CorpusBinarizer::new(&src, &tgt, SpecialTokens::default())
            .with_max_lengths(10, 10)
            .unwrap();
        let (records, stats) = binarizer.binarize(Cursor::new("a b c\n"), Cursor::new("x y\n")).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].src_ids, vec![4, 5, 6, EOS]);
        assert_eq!(records[0].tgt_ids, vec![SOS, 4, 5]);
        assert_eq!(stats.sentences, 1);
        assert_eq!(stats.source.tokens, 3);
        assert_eq!(stats.target.tokens, 2);
        assert_eq!(stats.truncated(), 0);
    }

    #[test]
    fn test_truncation_keeps_prefix() {
        let (src, tgt) = vocabs();
        let binarizer = CorpusBinarizer::new(&src, &tgt, SpecialTokens::default())
            .with_max_lengths(3, 3)
            .unwrap();
        let (records, stats) = binarizer
            .binarize(Cursor::new("a b c\na b\n"), Cursor::new("x y x\nx\n"))
            .unwrap();

        // at the limit: max - 1 tokens plus the marker
        assert_eq!(records[0].src_ids, vec![4, 5, EOS]);
        assert_eq!(records[0].tgt_ids, vec![SOS, 4, 5]);
        // below the limit: untouched
        assert_eq!(records[1].src_ids, vec![4, 5, EOS]);
        assert_eq!(records[1].tgt_ids, vec![SOS, 4]);
        assert_eq!(stats.source.truncated, 1);
        assert_eq!(stats.target.truncated, 1);
    }

    #[test]
    fn test_unknown_words() {
        let (src, tgt) = vocabs();
        let binarizer = CorpusBinarizer::new(&src, &tgt, SpecialTokens::default());
        let (records, stats) = binarizer.binarize(Cursor::new("a zzz\n"), Cursor::new("q r s x\n")).unwrap();

        assert_eq!(records[0].src_ids, vec![4, UNK, EOS]);
        assert_eq!(records[0].tgt_ids, vec![SOS, UNK, UNK, UNK, 4]);
        assert!((stats.source.unknown_rate() - 0.5).abs() < 1e-12);
        assert!((stats.target.unknown_rate() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_missing_target_lines_are_empty() {
        let (src, tgt) = vocabs();
        let binarizer = CorpusBinarizer::new(&src, &tgt, SpecialTokens::default());
        let (records, _) = binarizer.binarize(Cursor::new("a\nb\n"), Cursor::new("x\n")).unwrap();
        assert_eq!(records[1].tgt_ids, vec![SOS]);
    }

    #[test]
    fn test_rejects_zero_max_length() {
        let (src, tgt) = vocabs();
        assert!(CorpusBinarizer::new(&src, &tgt, SpecialTokens::default())
            .with_max_lengths(0, 10)
            .is_err());
    }

    #[test]
    fn test_compact_layout_bytes() {
        let (src, tgt) = vocabs();
        let binarizer = CorpusBinarizer::new(&src, &tgt, SpecialTokens::default());
        let mut out = Cursor::new(Vec::new());
        binarizer
            .write_to(Cursor::new("a b\n"), Cursor::new("y\n"), &mut out, CorpusLayout::Compact)
            .unwrap();

        let bytes = out.into_inner();
        let mut expected = Vec::new();
        expected.extend_from_slice(&8i32.to_ne_bytes());
        expected.extend_from_slice(&8i32.to_ne_bytes());
        expected.extend_from_slice(&1u64.to_ne_bytes());
        for v in [3i32, 2, 4, 5, EOS, SOS, 5] {
            expected.extend_from_slice(&v.to_ne_bytes());
        }
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_streamed_output_reads_back() {
        let (src, tgt) = vocabs();
        let binarizer = CorpusBinarizer::new(&src, &tgt, SpecialTokens::default());
        let src_text = "a b c\nc\n\n";
        let tgt_text = "x y\ny y\nx\n";

        for layout in [CorpusLayout::Compact, CorpusLayout::WithSpecials] {
            let mut out = Cursor::new(Vec::new());
            let stats = binarizer
                .write_to(Cursor::new(src_text), Cursor::new(tgt_text), &mut out, layout)
                .unwrap();
            assert_eq!(stats.sentences, 3);

            let (records, _) = binarizer.binarize(Cursor::new(src_text), Cursor::new(tgt_text)).unwrap();
            let corpus = read_corpus(Cursor::new(out.into_inner()), layout).unwrap();
            assert_eq!(corpus.records, records);
            assert_eq!(corpus.src_vocab_size, src.vocab_size);
            assert_eq!(
                corpus.specials,
                (layout == CorpusLayout::WithSpecials).then(SpecialTokens::default)
            );
        }
    }

    #[test]
    fn test_write_corpus_matches_streaming() {
        let (src, tgt) = vocabs();
        let specials = SpecialTokens::default();
        let binarizer = CorpusBinarizer::new(&src, &tgt, specials);
        let (records, _) = binarizer.binarize(Cursor::new("a\nb c\n"), Cursor::new("x\ny\n")).unwrap();

        let mut batch = Vec::new();
        write_corpus(&mut batch, &records, src.vocab_size, tgt.vocab_size, &specials, CorpusLayout::Compact).unwrap();

        let mut streamed = Cursor::new(Vec::new());
        binarizer
            .write_to(Cursor::new("a\nb c\n"), Cursor::new("x\ny\n"), &mut streamed, CorpusLayout::Compact)
            .unwrap();
        assert_eq!(batch, streamed.into_inner());
    }
}
