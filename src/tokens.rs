use serde::{Deserialize, Serialize};

/// Reserved token ids shared by vocabularies, corpora and model headers.
///
/// `sos` and `eos` may hold the same id; the engine treats them interchangeably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad: i32,
    pub sos: i32,
    pub eos: i32,
    pub unk: i32,
}

impl SpecialTokens {
    pub fn new(pad: i32, sos: i32, eos: i32, unk: i32) -> Self {
        Self { pad, sos, eos, unk }
    }

    /// First id available to ordinary words.
    pub fn start_id(&self) -> i32 {
        self.pad.max(self.sos).max(self.eos).max(self.unk) + 1
    }

    pub fn is_reserved(&self, id: i32) -> bool {
        id < self.start_id()
    }

    /// Ids in header order: pad, sos, eos, unk.
    pub fn as_array(&self) -> [i32; 4] {
        [self.pad, self.sos, self.eos, self.unk]
    }
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad: 1,
            sos: 2,
            eos: 2,
            unk: 3,
        }
    }
}
