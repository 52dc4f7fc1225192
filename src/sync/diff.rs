//! Character-level text diffing.
//!
//! Implements Myers' O(ND) difference algorithm using the linear-space
//! "middle snake" bisection, preceded by common prefix/suffix trimming and a
//! handful of cheap shortcuts. The output is passed through a merge pass so
//! that equal inputs always produce the same canonical edit script.
//!
//! All offsets and lengths are counted in `char`s, never bytes, so multi-byte
//! text diffs and patches cleanly.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Kind of a single diff operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Text present in both versions
    Equal,
    /// Text only present in the new version
    Insert,
    /// Text only present in the old version
    Delete,
}

/// A single diff operation with the span of text it covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub op: Operation,
    pub text: String,
}

impl Diff {
    pub fn new(op: Operation, text: impl Into<String>) -> Self {
        Self {
            op,
            text: text.into(),
        }
    }

    pub fn equal(text: impl Into<String>) -> Self {
        Self::new(Operation::Equal, text)
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::new(Operation::Insert, text)
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::new(Operation::Delete, text)
    }

    pub(crate) fn from_chars(op: Operation, chars: &[char]) -> Self {
        Self {
            op,
            text: chars.iter().collect(),
        }
    }

    /// Length of the covered text in characters
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Compute the diff between two strings.
///
/// When `deadline` passes, the region still being bisected degrades to a
/// plain delete+insert pair. The result is then not minimal but still
/// transforms `old` into `new`.
pub fn diff_main(old: &str, new: &str, deadline: Option<Instant>) -> Vec<Diff> {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();
    diff_chars(&old, &new, deadline)
}

/// Same as [`diff_main`] for text that is already split into characters.
pub(crate) fn diff_chars(old: &[char], new: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    cleanup_merge(diff_raw(old, new, deadline))
}

fn diff_raw(old: &[char], new: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    if old == new {
        return if old.is_empty() {
            Vec::new()
        } else {
            vec![Diff::from_chars(Operation::Equal, old)]
        };
    }

    let prefix = common_prefix(old, new);
    let (old_rest, new_rest) = (&old[prefix..], &new[prefix..]);
    let suffix = common_suffix(old_rest, new_rest);
    let old_mid = &old_rest[..old_rest.len() - suffix];
    let new_mid = &new_rest[..new_rest.len() - suffix];

    let mut diffs = Vec::new();
    if prefix > 0 {
        diffs.push(Diff::from_chars(Operation::Equal, &old[..prefix]));
    }
    diffs.extend(compute(old_mid, new_mid, deadline));
    if suffix > 0 {
        diffs.push(Diff::from_chars(
            Operation::Equal,
            &old_rest[old_rest.len() - suffix..],
        ));
    }
    diffs
}

/// Diff two texts that share no common prefix or suffix.
fn compute(old: &[char], new: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    if old.is_empty() {
        return vec![Diff::from_chars(Operation::Insert, new)];
    }
    if new.is_empty() {
        return vec![Diff::from_chars(Operation::Delete, old)];
    }

    let old_is_longer = old.len() > new.len();
    let (long, short) = if old_is_longer { (old, new) } else { (new, old) };

    // Shorter text inside the longer one
    if let Some(at) = find(long, short, 0) {
        let op = if old_is_longer {
            Operation::Delete
        } else {
            Operation::Insert
        };
        return vec![
            Diff::from_chars(op, &long[..at]),
            Diff::from_chars(Operation::Equal, short),
            Diff::from_chars(op, &long[at + short.len()..]),
        ];
    }

    if short.len() == 1 {
        return vec![
            Diff::from_chars(Operation::Delete, old),
            Diff::from_chars(Operation::Insert, new),
        ];
    }

    bisect(old, new, deadline)
}

/// Find the middle snake of the edit graph and recurse on both halves.
fn bisect(old: &[char], new: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    let old_len = old.len() as isize;
    let new_len = new.len() as isize;
    let max_d = (old_len + new_len + 1) / 2;
    let v_offset = max_d;
    let v_length = 2 * max_d;
    let mut v1 = vec![-1isize; v_length as usize];
    let mut v2 = vec![-1isize; v_length as usize];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;

    let delta = old_len - new_len;
    // With an odd delta the forward path detects the overlap, otherwise the reverse one
    let front = delta % 2 != 0;

    let (mut k1_start, mut k1_end, mut k2_start, mut k2_end) = (0isize, 0isize, 0isize, 0isize);

    for d in 0..max_d {
        if deadline.is_some_and(|limit| Instant::now() > limit) {
            break;
        }

        let mut k1 = -d + k1_start;
        while k1 <= d - k1_end {
            let k1_offset = (v_offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_offset - 1] < v1[k1_offset + 1]) {
                v1[k1_offset + 1]
            } else {
                v1[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < old_len && y1 < new_len && old[x1 as usize] == new[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_offset] = x1;

            if x1 > old_len {
                k1_end += 2;
            } else if y1 > new_len {
                k1_start += 2;
            } else if front {
                let k2_offset = v_offset + delta - k1;
                if k2_offset >= 0 && k2_offset < v_length && v2[k2_offset as usize] != -1 {
                    let x2 = old_len - v2[k2_offset as usize];
                    if x1 >= x2 {
                        return bisect_split(old, new, x1 as usize, y1 as usize, deadline);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2_start;
        while k2 <= d - k2_end {
            let k2_offset = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < old_len
                && y2 < new_len
                && old[(old_len - x2 - 1) as usize] == new[(new_len - y2 - 1) as usize]
            {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;

            if x2 > old_len {
                k2_end += 2;
            } else if y2 > new_len {
                k2_start += 2;
            } else if !front {
                let k1_offset = v_offset + delta - k2;
                if k1_offset >= 0 && k1_offset < v_length && v1[k1_offset as usize] != -1 {
                    let x1 = v1[k1_offset as usize];
                    let y1 = v_offset + x1 - k1_offset;
                    if x1 >= old_len - x2 {
                        return bisect_split(old, new, x1 as usize, y1 as usize, deadline);
                    }
                }
            }
            k2 += 2;
        }
    }

    // Out of time, or no commonality at all
    vec![
        Diff::from_chars(Operation::Delete, old),
        Diff::from_chars(Operation::Insert, new),
    ]
}

fn bisect_split(
    old: &[char],
    new: &[char],
    x: usize,
    y: usize,
    deadline: Option<Instant>,
) -> Vec<Diff> {
    let mut diffs = diff_raw(&old[..x], &new[..y], deadline);
    diffs.extend(diff_raw(&old[x..], &new[y..], deadline));
    diffs
}

/// Normalize an edit script.
///
/// Adjacent operations of the same kind are merged, deletions are ordered
/// before insertions between two equalities, and text shared by the head or
/// tail of a delete/insert pair is moved into the neighbouring equalities.
/// Empty operations are dropped.
pub fn cleanup_merge(diffs: Vec<Diff>) -> Vec<Diff> {
    let mut merged: Vec<Diff> = Vec::with_capacity(diffs.len());
    let mut deleted: Vec<char> = Vec::new();
    let mut inserted: Vec<char> = Vec::new();

    for diff in diffs {
        match diff.op {
            Operation::Delete => deleted.extend(diff.text.chars()),
            Operation::Insert => inserted.extend(diff.text.chars()),
            Operation::Equal => {
                let mut equal: Vec<char> = diff.text.chars().collect();
                flush_edits(&mut merged, &mut deleted, &mut inserted, &mut equal);
                push_equal(&mut merged, &equal);
            }
        }
    }

    let mut tail = Vec::new();
    flush_edits(&mut merged, &mut deleted, &mut inserted, &mut tail);
    push_equal(&mut merged, &tail);
    merged
}

fn flush_edits(
    merged: &mut Vec<Diff>,
    deleted: &mut Vec<char>,
    inserted: &mut Vec<char>,
    next_equal: &mut Vec<char>,
) {
    if !deleted.is_empty() && !inserted.is_empty() {
        let prefix = common_prefix(deleted, inserted);
        if prefix > 0 {
            let shared: Vec<char> = deleted.drain(..prefix).collect();
            inserted.drain(..prefix);
            push_equal(merged, &shared);
        }

        let suffix = common_suffix(deleted, inserted);
        if suffix > 0 {
            let mut shared = deleted.split_off(deleted.len() - suffix);
            inserted.truncate(inserted.len() - suffix);
            shared.append(next_equal);
            *next_equal = shared;
        }
    }

    if !deleted.is_empty() {
        merged.push(Diff::from_chars(Operation::Delete, deleted));
        deleted.clear();
    }
    if !inserted.is_empty() {
        merged.push(Diff::from_chars(Operation::Insert, inserted));
        inserted.clear();
    }
}

fn push_equal(merged: &mut Vec<Diff>, text: &[char]) {
    if text.is_empty() {
        return;
    }
    match merged.last_mut() {
        Some(last) if last.op == Operation::Equal => last.text.extend(text.iter()),
        _ => merged.push(Diff::from_chars(Operation::Equal, text)),
    }
}

/// Reconstruct the old text (equalities and deletions)
pub fn source_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Insert)
        .map(|d| d.text.as_str())
        .collect()
}

/// Reconstruct the new text (equalities and insertions)
pub fn target_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Delete)
        .map(|d| d.text.as_str())
        .collect()
}

/// Levenshtein distance implied by an edit script, in characters.
pub fn levenshtein(diffs: &[Diff]) -> usize {
    let mut distance = 0;
    let mut inserted = 0;
    let mut deleted = 0;
    for diff in diffs {
        match diff.op {
            Operation::Insert => inserted += diff.char_len(),
            Operation::Delete => deleted += diff.char_len(),
            Operation::Equal => {
                distance += inserted.max(deleted);
                inserted = 0;
                deleted = 0;
            }
        }
    }
    distance + inserted.max(deleted)
}

/// Translate a character offset in the old text into the new text.
///
/// Offsets that fall inside a deletion map to the start of that deletion.
pub fn x_index(diffs: &[Diff], loc: usize) -> usize {
    let mut chars_old = 0;
    let mut chars_new = 0;
    let mut last_old = 0;
    let mut last_new = 0;

    for diff in diffs {
        let len = diff.char_len();
        if diff.op != Operation::Insert {
            chars_old += len;
        }
        if diff.op != Operation::Delete {
            chars_new += len;
        }
        if chars_old > loc {
            if diff.op == Operation::Delete {
                return last_new;
            }
            break;
        }
        last_old = chars_old;
        last_new = chars_new;
    }

    last_new + (loc - last_old)
}

pub(crate) fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub(crate) fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// First occurrence of `needle` in `haystack` at or after `from`.
pub(crate) fn find(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(from);
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| at + from)
}

/// Last occurrence of `needle` in `haystack`.
pub(crate) fn rfind(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_common_prefix_suffix() {
        assert_eq!(common_prefix(&chars("abc"), &chars("xyz")), 0);
        assert_eq!(common_prefix(&chars("1234abc"), &chars("1234xyz")), 4);
        assert_eq!(common_suffix(&chars("abc1234"), &chars("xyz1234")), 4);
        assert_eq!(common_suffix(&chars("1234"), &chars("xyz1234")), 4);
    }

    #[test]
    fn test_identical_and_empty() {
        assert!(diff_main("", "", None).is_empty());
        assert_eq!(diff_main("abc", "abc", None), vec![Diff::equal("abc")]);
        assert_eq!(diff_main("", "abc", None), vec![Diff::insert("abc")]);
        assert_eq!(diff_main("abc", "", None), vec![Diff::delete("abc")]);
    }

    #[test]
    fn test_simple_insert_and_delete() {
        assert_eq!(
            diff_main("abc", "abxc", None),
            vec![Diff::equal("ab"), Diff::insert("x"), Diff::equal("c")]
        );
        assert_eq!(
            diff_main("abxc", "abc", None),
            vec![Diff::equal("ab"), Diff::delete("x"), Diff::equal("c")]
        );
    }

    #[test]
    fn test_single_substitution() {
        assert_eq!(
            diff_main("The cat", "The hat", None),
            vec![
                Diff::equal("The "),
                Diff::delete("c"),
                Diff::insert("h"),
                Diff::equal("at"),
            ]
        );
    }

    #[test]
    fn test_containment() {
        assert_eq!(
            diff_main("xabcx", "abc", None),
            vec![Diff::delete("x"), Diff::equal("abc"), Diff::delete("x")]
        );
    }

    #[test]
    fn test_reconstructs_both_sides() {
        let cases = [
            ("Hello\nWorld\n!!!", "Howdy\nWorld\n!!!"),
            ("kitten sitting on the mat", "sitting kitten on a hat"),
            ("Apples are a fruit.", "Bananas are also fruit."),
            ("a", "b"),
            ("", "fresh"),
        ];
        for (old, new) in cases {
            let diffs = diff_main(old, new, None);
            assert_eq!(source_text(&diffs), old);
            assert_eq!(target_text(&diffs), new);
        }
    }

    #[test]
    fn test_multibyte_offsets() {
        let diffs = diff_main("héllo wörld", "héllo brave wörld", None);
        assert_eq!(
            diffs,
            vec![
                Diff::equal("héllo "),
                Diff::insert("brave "),
                Diff::equal("wörld"),
            ]
        );
        assert_eq!(x_index(&diffs, 5), 5);
        assert_eq!(x_index(&diffs, 6), 12);
        assert_eq!(x_index(&diffs, 7), 13);
    }

    #[test]
    fn test_deterministic() {
        let a = diff_main("the quick brown fox", "a quick red fox jumps", None);
        let b = diff_main("the quick brown fox", "a quick red fox jumps", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cleanup_merge() {
        let merged = cleanup_merge(vec![
            Diff::equal("a"),
            Diff::insert("b"),
            Diff::delete("c"),
            Diff::insert("d"),
            Diff::equal(""),
            Diff::equal("e"),
        ]);
        assert_eq!(
            merged,
            vec![
                Diff::equal("a"),
                Diff::delete("c"),
                Diff::insert("bd"),
                Diff::equal("e"),
            ]
        );

        // Shared head and tail move into the equalities
        let merged = cleanup_merge(vec![
            Diff::equal("x"),
            Diff::delete("abc"),
            Diff::insert("abzc"),
            Diff::equal("y"),
        ]);
        assert_eq!(
            merged,
            vec![Diff::equal("xab"), Diff::insert("z"), Diff::equal("cy")]
        );
    }

    #[test]
    fn test_levenshtein() {
        let diffs = vec![Diff::delete("abc"), Diff::insert("1234"), Diff::equal("xyz")];
        assert_eq!(levenshtein(&diffs), 4);
        let diffs = vec![Diff::equal("xyz"), Diff::delete("abc"), Diff::insert("1234")];
        assert_eq!(levenshtein(&diffs), 4);
        let diffs = vec![Diff::delete("abc"), Diff::equal("xyz"), Diff::insert("1234")];
        assert_eq!(levenshtein(&diffs), 7);
    }

    #[test]
    fn test_x_index() {
        let diffs = vec![Diff::delete("a"), Diff::insert("1234"), Diff::equal("xyz")];
        assert_eq!(x_index(&diffs, 2), 5);
        let diffs = vec![Diff::equal("a"), Diff::delete("1234"), Diff::equal("xyz")];
        assert_eq!(x_index(&diffs, 3), 1);
    }

    #[test]
    fn test_expired_deadline_still_correct() {
        let old = "The quick brown fox jumps over the lazy dog".repeat(20);
        let new = "A slow green turtle crawls under the busy cat".repeat(20);
        let expired = Instant::now() - Duration::from_secs(1);
        let diffs = diff_main(&old, &new, Some(expired));
        assert_eq!(source_text(&diffs), old);
        assert_eq!(target_text(&diffs), new);
    }

    #[test]
    fn test_find_and_rfind() {
        let hay = chars("abcabc");
        assert_eq!(find(&hay, &chars("bc"), 0), Some(1));
        assert_eq!(find(&hay, &chars("bc"), 2), Some(4));
        assert_eq!(rfind(&hay, &chars("bc")), Some(4));
        assert_eq!(find(&hay, &chars("zz"), 0), None);
        assert_eq!(rfind(&hay, &[]), Some(6));
    }
}
