//! Debian-style package version parsing and ordering.
//!
//! A version string has the shape `[epoch:]upstream[-release]`. The epoch is
//! a leading run of digits immediately followed by `:` (absent means `0`).
//! The release is the longest trailing run over `[A-Za-z0-9+.~]` preceded by
//! a `-` (absent means the empty string). Ordering compares epochs
//! numerically, then the upstream component, then the release component.
//!
//! Components are compared by splitting into alternating non-digit / digit
//! runs. Digit runs compare as integers (so `1.9 < 1.10`); non-digit runs
//! compare character by character under a modified lexicographic order where
//! `~` sorts before everything including the end of the string, the end of
//! the string sorts before letters, and letters sort before all other
//! printable characters (so `1.0~beta1 < 1.0`).

use std::cmp::Ordering;
use std::fmt;

/// A parsed `[epoch:]upstream[-release]` version with total ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    epoch: u64,
    upstream: String,
    release: String,
}

impl Version {
    /// Parse a version string.
    ///
    /// Parsing never fails: a string with no epoch marker gets epoch `0`,
    /// and a string with no `-`-preceded trailing run gets an empty release.
    pub fn parse(s: &str) -> Self {
        let (epoch, rest) = split_epoch(s);
        let (upstream, release) = split_release(rest);

        Self {
            epoch,
            upstream: upstream.to_string(),
            release: release.to_string(),
        }
    }

    /// The numeric epoch (0 when absent).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The upstream component.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// The release component (empty when absent).
    pub fn release(&self) -> &str {
        &self.release
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.upstream)?;
        if !self.release.is_empty() {
            write!(f, "-{}", self.release)?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_component(&self.upstream, &other.upstream))
            .then_with(|| compare_component(&self.release, &other.release))
    }
}

/// Compare two raw version strings without keeping the parses around.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// Split off the epoch: a leading run of ASCII digits immediately followed
/// by `:`. Anything else leaves the whole input as the remainder.
fn split_epoch(s: &str) -> (u64, &str) {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();

    if digits > 0 && s.as_bytes().get(digits) == Some(&b':') {
        // A run of ASCII digits always parses; saturate on absurd epochs.
        let epoch = s[..digits].parse().unwrap_or(u64::MAX);
        (epoch, &s[digits + 1..])
    } else {
        (0, s)
    }
}

/// Split off the release: the longest trailing run over `[A-Za-z0-9+.~]`
/// that is preceded by a `-`.
fn split_release(s: &str) -> (&str, &str) {
    let is_release_char =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~');

    let tail = s
        .chars()
        .rev()
        .take_while(|c| is_release_char(*c))
        .count();

    let cut = s.len() - tail;
    if tail > 0 && s[..cut].ends_with('-') {
        (&s[..cut - 1], &s[cut..])
    } else {
        (s, "")
    }
}

/// Compare one version component (upstream or release) by alternating
/// non-digit / digit runs.
fn compare_component(a: &str, b: &str) -> Ordering {
    let mut a_rest = a;
    let mut b_rest = b;

    loop {
        let (a_str, a_tail) = take_non_digits(a_rest);
        let (b_str, b_tail) = take_non_digits(b_rest);

        match compare_non_digit_run(a_str, b_str) {
            Ordering::Equal => {}
            other => return other,
        }

        let (a_num, a_tail) = take_number(a_tail);
        let (b_num, b_tail) = take_number(b_tail);

        match a_num.cmp(&b_num) {
            Ordering::Equal => {}
            other => return other,
        }

        if a_tail.is_empty() && b_tail.is_empty() {
            return Ordering::Equal;
        }

        a_rest = a_tail;
        b_rest = b_tail;
    }
}

fn take_non_digits(s: &str) -> (&str, &str) {
    let end = s.bytes().take_while(|b| !b.is_ascii_digit()).count();
    s.split_at(end)
}

/// Take the leading digit run as a number; an empty run counts as zero.
fn take_number(s: &str) -> (u64, &str) {
    let end = s.bytes().take_while(u8::is_ascii_digit).count();
    let value = if end == 0 {
        0
    } else {
        s[..end].parse().unwrap_or(u64::MAX)
    };
    (value, &s[end..])
}

/// Compare non-digit runs character by character with the modified order:
/// `~` sorts first, then the end of the run, then letters, then everything
/// else (by code point within each class).
fn compare_non_digit_run(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars();
    let mut b_chars = b.chars();

    loop {
        match (a_chars.next(), b_chars.next()) {
            (None, None) => return Ordering::Equal,
            (ac, bc) => match compare_char(ac, bc) {
                Ordering::Equal => {}
                other => return other,
            },
        }
    }
}

fn compare_char(a: Option<char>, b: Option<char>) -> Ordering {
    fn rank(c: Option<char>) -> u8 {
        match c {
            Some('~') => 0,
            None => 1,
            Some(c) if c.is_ascii_alphabetic() => 2,
            Some(_) => 3,
        }
    }

    rank(a).cmp(&rank(b)).then_with(|| a.cmp(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s)
    }

    #[test]
    fn parse_components() {
        let full = v("2:1.4.1-3ubuntu1");
        assert_eq!(full.epoch(), 2);
        assert_eq!(full.upstream(), "1.4.1");
        assert_eq!(full.release(), "3ubuntu1");

        let plain = v("1.0.0");
        assert_eq!(plain.epoch(), 0);
        assert_eq!(plain.upstream(), "1.0.0");
        assert_eq!(plain.release(), "");
    }

    #[test]
    fn epoch_requires_leading_digits() {
        // A colon with no digit run in front is part of the upstream.
        assert_eq!(v("a:1.0").epoch(), 0);
        assert_eq!(v("a:1.0").upstream(), "a:1.0");
    }

    #[test]
    fn release_requires_hyphen() {
        // The trailing run must be introduced by a hyphen.
        assert_eq!(v("1.2.3").release(), "");
        assert_eq!(v("1.2-3").release(), "3");
        // The run stops at the last hyphen, which stays in the upstream.
        assert_eq!(v("1.0-rc1-2").upstream(), "1.0-rc1");
        assert_eq!(v("1.0-rc1-2").release(), "2");
    }

    #[test]
    fn numeric_runs_compare_as_integers() {
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.01", "1.1"), Ordering::Equal);
    }

    #[test]
    fn epoch_dominates() {
        assert_eq!(compare_versions("1:0.1", "9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0:2.0", "2.0"), Ordering::Equal);
    }

    #[test]
    fn tilde_sorts_before_everything() {
        assert_eq!(compare_versions("1.0~beta1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0~beta1~svn1245", "1.0~beta1"), Ordering::Less);
        assert_eq!(compare_versions("1.0~~", "1.0~"), Ordering::Less);
    }

    #[test]
    fn letters_sort_before_other_printables() {
        // "1.0a" vs "1.0+": 'a' ranks below '+'.
        assert_eq!(compare_versions("1.0a", "1.0+"), Ordering::Less);
        // End of string sorts before letters: "1.0" < "1.0a".
        assert_eq!(compare_versions("1.0", "1.0a"), Ordering::Less);
    }

    #[test]
    fn release_breaks_ties() {
        assert_eq!(compare_versions("3.0", "3.0-2"), Ordering::Less);
        assert_eq!(compare_versions("3.0-1", "3.0-2"), Ordering::Less);
    }

    #[test]
    fn ascending_sort_with_tildes() {
        let mut versions = vec!["3.0~beta1", "3.0", "3.0~rc1", "3.0-2"];
        versions.sort_by(|a, b| compare_versions(a, b));
        assert_eq!(versions, vec!["3.0~beta1", "3.0~rc1", "3.0", "3.0-2"]);
    }

    #[test]
    fn display_round_trips() {
        for s in ["1.0.0", "2:1.4.1-3ubuntu1", "3.0~rc1", "1.2-3"] {
            assert_eq!(v(s).to_string(), s);
        }
    }
}
