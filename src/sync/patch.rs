//! Patch construction, serialization and fuzzy application.
//!
//! A [`Patch`] is an ordered list of [`Hunk`]s. Each hunk carries its diff
//! operations plus a few characters of surrounding context, and the offsets
//! at which it was computed. When the text a patch is applied to has drifted
//! since the patch was made, each hunk is relocated with a bounded search
//! around its expected offset before being applied.
//!
//! Application is all-or-nothing: if any hunk cannot be placed, the whole
//! patch is rejected and the caller keeps its original text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use super::diff::{self, Diff, Operation};

/// Errors produced while parsing or applying patches
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("Malformed patch: {0}")]
    Malformed(String),

    #[error("Hunk {index} could not be matched against the current text")]
    HunkRejected { index: usize },
}

pub type PatchResult<T> = Result<T, PatchError>;

/// Tuning knobs for diffing and fuzzy matching
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Upper bound on time spent diffing (None = unbounded)
    pub diff_timeout: Option<Duration>,
    /// Characters of context kept around each hunk
    pub patch_margin: usize,
    /// Longest pattern searched for as a whole; longer hunks are located by head and tail
    pub max_pattern_len: usize,
    /// Highest tolerated error ratio for an approximate match (0.0 = exact only)
    pub match_threshold: f32,
    /// How far from the expected offset a hunk may be found, in characters
    pub match_distance: usize,
    /// Highest tolerated divergence between a hunk and the text it lands on
    pub delete_threshold: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            diff_timeout: Some(Duration::from_secs(1)),
            patch_margin: 4,
            max_pattern_len: 64,
            match_threshold: 0.5,
            match_distance: 1000,
            delete_threshold: 0.5,
        }
    }
}

impl CodecConfig {
    pub fn with_match_threshold(mut self, threshold: f32) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn with_match_distance(mut self, distance: usize) -> Self {
        self.match_distance = distance;
        self
    }

    pub fn with_diff_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.diff_timeout = timeout;
        self
    }
}

/// One contiguous region of change, with context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub diffs: Vec<Diff>,
    /// Offset of the hunk in the text it was computed from
    pub source_offset: usize,
    /// Offset of the hunk once all preceding hunks are applied
    pub target_offset: usize,
    pub source_len: usize,
    pub target_len: usize,
}

impl Hunk {
    /// Text this hunk expects to find (context and deletions)
    pub fn source_text(&self) -> String {
        diff::source_text(&self.diffs)
    }

    /// Text this hunk leaves behind (context and insertions)
    pub fn target_text(&self) -> String {
        diff::target_text(&self.diffs)
    }

    fn push_equal_back(&mut self, text: &[char]) {
        match self.diffs.last_mut() {
            Some(last) if last.op == Operation::Equal => last.text.extend(text.iter()),
            _ => self.diffs.push(Diff::from_chars(Operation::Equal, text)),
        }
    }
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "@@ -{} +{} @@",
            format_coords(self.source_offset, self.source_len),
            format_coords(self.target_offset, self.target_len)
        )?;
        for diff in &self.diffs {
            let sign = match diff.op {
                Operation::Equal => ' ',
                Operation::Insert => '+',
                Operation::Delete => '-',
            };
            writeln!(f, "{}{}", sign, escape(&diff.text))?;
        }
        Ok(())
    }
}

/// An ordered list of hunks transforming one text version into another
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    hunks: Vec<Hunk>,
}

impl Patch {
    pub fn new(hunks: Vec<Hunk>) -> Self {
        Self { hunks }
    }

    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hunks.len()
    }

    /// Serialize to the textual patch format
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Parse the textual patch format
    pub fn from_text(text: &str) -> PatchResult<Self> {
        let mut hunks = Vec::new();
        let mut lines = text.split('\n').peekable();

        while let Some(line) = lines.next() {
            if line.is_empty() {
                continue;
            }
            let mut hunk = parse_header(line)?;

            while let Some(body) = lines.next_if(|l| !l.starts_with('@')) {
                let mut chars = body.chars();
                let op = match chars.next() {
                    None => continue,
                    Some(' ') => Operation::Equal,
                    Some('+') => Operation::Insert,
                    Some('-') => Operation::Delete,
                    Some(other) => {
                        return Err(PatchError::Malformed(format!(
                            "unexpected line prefix {:?}",
                            other
                        )))
                    }
                };
                hunk.diffs.push(Diff::new(op, unescape(chars.as_str())?));
            }

            let source_len = hunk
                .diffs
                .iter()
                .filter(|d| d.op != Operation::Insert)
                .map(Diff::char_len)
                .sum::<usize>();
            let target_len = hunk
                .diffs
                .iter()
                .filter(|d| d.op != Operation::Delete)
                .map(Diff::char_len)
                .sum::<usize>();
            if source_len != hunk.source_len || target_len != hunk.target_len {
                return Err(PatchError::Malformed(format!(
                    "hunk body does not match header: {}",
                    line
                )));
            }

            hunks.push(hunk);
        }

        Ok(Self { hunks })
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hunk in &self.hunks {
            write!(f, "{}", hunk)?;
        }
        Ok(())
    }
}

fn format_coords(offset: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", offset),
        1 => format!("{}", offset + 1),
        _ => format!("{},{}", offset + 1, len),
    }
}

fn parse_header(line: &str) -> PatchResult<Hunk> {
    let malformed = || PatchError::Malformed(format!("invalid hunk header: {}", line));

    let coords = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.strip_suffix(" @@"))
        .ok_or_else(malformed)?;
    let (source, target) = coords.split_once(" +").ok_or_else(malformed)?;
    let (source_offset, source_len) = parse_coords(source).ok_or_else(malformed)?;
    let (target_offset, target_len) = parse_coords(target).ok_or_else(malformed)?;

    Ok(Hunk {
        diffs: Vec::new(),
        source_offset,
        target_offset,
        source_len,
        target_len,
    })
}

fn parse_coords(coords: &str) -> Option<(usize, usize)> {
    match coords.split_once(',') {
        Some((start, len)) => {
            let start: usize = start.parse().ok()?;
            let len: usize = len.parse().ok()?;
            if len == 0 {
                Some((start, 0))
            } else {
                Some((start.checked_sub(1)?, len))
            }
        }
        None => {
            let start: usize = coords.parse().ok()?;
            Some((start.checked_sub(1)?, 1))
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> PatchResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.to_ascii_uppercase().as_str() {
            "25" => out.push('%'),
            "0A" => out.push('\n'),
            "0D" => out.push('\r'),
            _ => {
                return Err(PatchError::Malformed(format!(
                    "invalid escape sequence %{}",
                    code
                )))
            }
        }
    }
    Ok(out)
}

/// Diff, patch and fuzzy-apply engine
#[derive(Debug, Clone, Default)]
pub struct PatchCodec {
    config: CodecConfig,
}

impl PatchCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.diff_timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Compute the edit script between two texts
    pub fn diff(&self, old: &str, new: &str) -> Vec<Diff> {
        diff::diff_main(old, new, self.deadline())
    }

    /// Compute a patch turning `old` into `new`
    pub fn patch_between(&self, old: &str, new: &str) -> Patch {
        let diffs = self.diff(old, new);
        self.make_patch(old, &diffs)
    }

    /// Group an edit script computed against `old` into hunks with context
    pub fn make_patch(&self, old: &str, diffs: &[Diff]) -> Patch {
        let margin = self.config.patch_margin;
        let mut hunks = Vec::new();
        let mut hunk = Hunk::default();
        let mut count_source = 0;
        let mut count_target = 0;
        // Text as it looks before / after the current hunk
        let mut prepatch: Vec<char> = old.chars().collect();
        let mut postpatch = prepatch.clone();

        for (i, diff) in diffs.iter().enumerate() {
            let chars: Vec<char> = diff.text.chars().collect();
            let len = chars.len();

            if hunk.diffs.is_empty() && diff.op != Operation::Equal {
                hunk.source_offset = count_source;
                hunk.target_offset = count_target;
            }

            match diff.op {
                Operation::Insert => {
                    hunk.diffs.push(diff.clone());
                    hunk.target_len += len;
                    postpatch.splice(count_target..count_target, chars);
                }
                Operation::Delete => {
                    hunk.source_len += len;
                    hunk.diffs.push(diff.clone());
                    postpatch.drain(count_target..count_target + len);
                }
                Operation::Equal => {
                    if len <= 2 * margin && !hunk.diffs.is_empty() && i + 1 != diffs.len() {
                        // Small equality inside a hunk
                        hunk.diffs.push(diff.clone());
                        hunk.source_len += len;
                        hunk.target_len += len;
                    } else if len >= 2 * margin && !hunk.diffs.is_empty() {
                        // Large equality closes the hunk
                        self.add_context(&mut hunk, &prepatch);
                        hunks.push(std::mem::take(&mut hunk));
                        prepatch = postpatch.clone();
                        count_source = count_target;
                    }
                }
            }

            if diff.op != Operation::Insert {
                count_source += len;
            }
            if diff.op != Operation::Delete {
                count_target += len;
            }
        }

        if !hunk.diffs.is_empty() {
            self.add_context(&mut hunk, &prepatch);
            hunks.push(hunk);
        }

        Patch { hunks }
    }

    /// Surround a hunk with enough context to make it unique in `text`.
    fn add_context(&self, hunk: &mut Hunk, text: &[char]) {
        if text.is_empty() {
            return;
        }
        let margin = self.config.patch_margin;
        let pattern_cap = self.config.max_pattern_len.saturating_sub(2 * margin);
        let start = hunk.target_offset.min(text.len());
        let end = (start + hunk.source_len).min(text.len());

        let mut padding = 0;
        loop {
            let lo = start.saturating_sub(padding);
            let hi = (end + padding).min(text.len());
            let pattern = &text[lo..hi];
            let unique = diff::find(text, pattern, 0) == diff::rfind(text, pattern);
            if unique || pattern.len() >= pattern_cap || (lo == 0 && hi == text.len()) {
                break;
            }
            padding += margin;
        }
        padding += margin;

        let prefix = &text[start.saturating_sub(padding)..start];
        let suffix = &text[end..(end + padding).min(text.len())];

        if !prefix.is_empty() {
            hunk.diffs
                .insert(0, Diff::from_chars(Operation::Equal, prefix));
        }
        if !suffix.is_empty() {
            hunk.push_equal_back(suffix);
        }

        hunk.source_offset -= prefix.len();
        hunk.target_offset -= prefix.len();
        hunk.source_len += prefix.len() + suffix.len();
        hunk.target_len += prefix.len() + suffix.len();
    }

    /// Apply a patch to `base`.
    ///
    /// Returns the patched text, or the index of the first hunk that could
    /// not be placed. On error nothing of the patch has been applied.
    pub fn apply(&self, patch: &Patch, base: &str) -> PatchResult<String> {
        if patch.is_empty() {
            return Ok(base.to_string());
        }

        let max_pattern = self.config.max_pattern_len.max(1);
        let mut text: Vec<char> = base.chars().collect();
        let mut drift: isize = 0;

        for (index, hunk) in patch.hunks.iter().enumerate() {
            let rejected = PatchError::HunkRejected { index };
            // Offsets come from the wire; anything out of range cannot be placed
            let offset = isize::try_from(hunk.target_offset).map_err(|_| rejected.clone())?;
            let expected = offset
                .checked_add(drift)
                .ok_or_else(|| rejected.clone())?
                .max(0) as usize;
            let source: Vec<char> = hunk.source_text().chars().collect();
            let target: Vec<char> = hunk.target_text().chars().collect();

            let (start, end) = if source.len() > max_pattern {
                // Locate head and tail separately
                let head = self
                    .locate(&text, &source[..max_pattern], expected)
                    .ok_or_else(|| rejected.clone())?;
                let tail_expected = expected + source.len() - max_pattern;
                let tail = self
                    .locate(&text, &source[source.len() - max_pattern..], tail_expected)
                    .ok_or_else(|| rejected.clone())?;
                if head >= tail {
                    return Err(rejected);
                }
                (head, (tail + max_pattern).min(text.len()))
            } else {
                let start = self
                    .locate(&text, &source, expected)
                    .ok_or_else(|| rejected.clone())?;
                (start, (start + source.len()).min(text.len()))
            };

            drift = start as isize - offset;
            let found = &text[start..end];

            if found == source.as_slice() {
                text.splice(start..end, target);
                continue;
            }

            // The text moved underneath the hunk; map its edits through an alignment
            let alignment = diff::diff_chars(&source, found, self.deadline());
            if !source.is_empty()
                && diff::levenshtein(&alignment) as f32 / source.len() as f32
                    > self.config.delete_threshold
            {
                return Err(rejected);
            }

            let replacement = remap_hunk(&hunk.diffs, &alignment, found);
            text.splice(start..end, replacement);
        }

        Ok(text.into_iter().collect())
    }

    /// Find the best place for `pattern` in `text` near `expected`.
    fn locate(&self, text: &[char], pattern: &[char], expected: usize) -> Option<usize> {
        let expected = expected.min(text.len());
        if pattern.is_empty() {
            return Some(expected);
        }

        if text.get(expected..expected + pattern.len()) == Some(pattern) {
            return Some(expected);
        }

        let distance = self.config.match_distance;
        let lo = expected.saturating_sub(distance);
        if text.len() >= pattern.len() {
            let hi = (expected + distance).min(text.len() - pattern.len());
            let nearest = (lo..=hi)
                .filter(|&pos| &text[pos..pos + pattern.len()] == pattern)
                .min_by_key(|pos| pos.abs_diff(expected));
            if nearest.is_some() {
                return nearest;
            }
        }

        if self.config.match_threshold <= 0.0 {
            return None;
        }
        self.approximate_match(text, pattern, expected)
    }

    /// Approximate substring search bounded to the match window.
    ///
    /// Runs an edit-distance alignment where the match may start anywhere in
    /// the window, and scores each candidate by error ratio plus distance
    /// from the expected offset.
    fn approximate_match(&self, text: &[char], pattern: &[char], expected: usize) -> Option<usize> {
        let m = pattern.len();
        let distance = self.config.match_distance.max(1);
        let max_errors = (self.config.match_threshold * m as f32) as usize;
        let lo = expected.saturating_sub(distance);
        let hi = (expected + m + distance).min(text.len());

        // column[i] = edit distance of pattern[..i] against text ending at the current char
        let mut column: Vec<usize> = (0..=m).collect();
        let mut best: Option<(f32, usize)> = None;

        for (j, &tc) in text.iter().enumerate().take(hi).skip(lo) {
            let mut diagonal = column[0];
            column[0] = 0;
            for i in 1..=m {
                let above = column[i];
                let cost = usize::from(pattern[i - 1] != tc);
                let value = (diagonal + cost).min(above + 1).min(column[i - 1] + 1);
                diagonal = above;
                column[i] = value;
            }

            let errors = column[m];
            if errors <= max_errors {
                let start = (j + 1).saturating_sub(m);
                let score =
                    errors as f32 / m as f32 + start.abs_diff(expected) as f32 / distance as f32;
                if best.map_or(true, |(best_score, _)| score < best_score) {
                    best = Some((score, start));
                }
            }
        }

        best.map(|(_, start)| start)
    }
}

/// Replay a hunk's edits onto `found`, the text actually located for it.
///
/// `alignment` diffs the hunk's expected text against `found`; equal spans
/// keep the characters really present, deletions drop them and insertions
/// are spliced in at the mapped offset.
fn remap_hunk(hunk_diffs: &[Diff], alignment: &[Diff], found: &[char]) -> Vec<char> {
    let mut out = Vec::with_capacity(found.len());
    let mut source_pos = 0;
    let mut found_pos = 0;

    for diff in hunk_diffs {
        match diff.op {
            Operation::Equal => {
                source_pos += diff.char_len();
                let next = diff::x_index(alignment, source_pos).clamp(found_pos, found.len());
                out.extend_from_slice(&found[found_pos..next]);
                found_pos = next;
            }
            Operation::Delete => {
                source_pos += diff.char_len();
                found_pos = diff::x_index(alignment, source_pos).clamp(found_pos, found.len());
            }
            Operation::Insert => out.extend(diff.text.chars()),
        }
    }

    out.extend_from_slice(&found[found_pos..]);
    out
}
