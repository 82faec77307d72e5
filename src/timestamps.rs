//! Word-level timestamps from predicted durations.
//!
//! Durations are per token including the two boundary tokens. Positions are
//! counted in half-frames so the duration of a whitespace token can be split
//! between the words on either side of it. Two cursors are tracked: `left`
//! is where the previous word ended (and the next one starts), `right` is
//! `left` plus the trailing half of the whitespace.

use serde::Serialize;

/// Frames removed from the leading boundary token before the first word.
pub const BOUNDARY_FRAME_OFFSET: u32 = 3;

/// One word of the phonemized input, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordSpan {
    pub text: String,
    /// Phoneme tokens of this word; `None` for words that produced no
    /// phonemes (e.g. punctuation dropped by the phonemizer).
    pub phonemes: Option<usize>,
    /// Whether a whitespace token follows the word.
    pub whitespace: bool,
}

impl WordSpan {
    pub fn new(text: impl Into<String>, phonemes: Option<usize>, whitespace: bool) -> Self {
        Self {
            text: text.into(),
            phonemes,
            whitespace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordTimestamp {
    /// Index into the input word list.
    pub word: usize,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Assign start/end times (seconds) to words.
///
/// `half_frames_per_second` is `2 * sample_rate / samples_per_frame`
/// (80 for 24 kHz output at 600 samples per frame). Words past the end of
/// the duration vector are left out. Fewer than three durations (no room for
/// a word between the boundary tokens) yields no timestamps.
pub fn word_timestamps(words: &[WordSpan], durations: &[u32], half_frames_per_second: f64) -> Vec<WordTimestamp> {
    let n = durations.len();
    if words.is_empty() || n < 3 || half_frames_per_second <= 0.0 {
        return Vec::new();
    }
    let dur = |i: usize| durations[i] as f64;

    let mut right = 2.0 * durations[0].saturating_sub(BOUNDARY_FRAME_OFFSET) as f64;
    let mut left = right;
    let mut i = 1;
    let mut stamps = Vec::with_capacity(words.len());

    for (index, word) in words.iter().enumerate() {
        if i >= n - 1 {
            break;
        }
        let Some(count) = word.phonemes else {
            if word.whitespace {
                i += 1;
                left = right + dur(i);
                right = left + dur(i);
                i += 1;
            }
            continue;
        };

        let j = i + count;
        if j >= n {
            break;
        }
        let start = left / half_frames_per_second;
        let token_half_frames: f64 = 2.0 * (i..j).map(dur).sum::<f64>();
        let space = if word.whitespace { dur(j) } else { 0.0 };
        left = right + token_half_frames + space;
        stamps.push(WordTimestamp {
            word: index,
            text: word.text.clone(),
            start,
            end: left / half_frames_per_second,
        });
        right = left + space;
        i = j + usize::from(word.whitespace);
    }

    stamps
}
