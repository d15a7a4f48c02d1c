//! Detection of obfuscated (random) filenames
//!
//! Posters often replace real names with random strings. The decoder only
//! takes the first-16k MD5 of files whose subject name looks random; par2
//! packs later map that hash back to the real name.

use std::path::Path;

/// Alphanumeric characters needed before the character mix is judged
const MIN_MIX_LENGTH: usize = 24;

/// Share of upper and lower case letters in a random mix
const LETTER_SHARE: std::ops::RangeInclusive<f32> = 0.31..=0.38;

/// Share of digits in a random mix
const DIGIT_SHARE: std::ops::RangeInclusive<f32> = 0.28..=0.38;

/// Hex-only stems up to this length may be a CRC tag or a short hash
const MAX_PLAIN_HEX: usize = 16;

/// Vowel-free stems up to this length may be an abbreviation
const MAX_PLAIN_CONSONANTS: usize = 8;

/// Whether `filename` looks random rather than descriptive
///
/// Only the stem is judged. A stem is random when it is a UUID, a long hex
/// string, a long run without vowels, or a long even mix of upper case,
/// lower case and digits.
///
/// ```
/// use usenet_engine::deobfuscation::is_obfuscated;
///
/// assert!(is_obfuscated("550e8400-e29b-41d4-a716-446655440000.mkv"));
/// assert!(is_obfuscated("a3f8b2c9d1e5f7a4b6c8d0e2f4a6b8c0"));
/// assert!(!is_obfuscated("Show.Name.S01E01.720p.WEB.mkv"));
/// ```
#[must_use]
pub fn is_obfuscated(filename: &str) -> bool {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    if stem.is_empty() {
        return false;
    }

    is_uuid(stem)
        || (stem.len() > MAX_PLAIN_HEX && stem.chars().all(|c| c.is_ascii_hexdigit()))
        || (stem.len() > MAX_PLAIN_CONSONANTS && !stem.chars().any(is_vowel))
        || is_even_mix(stem)
}

fn is_vowel(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u')
}

/// `8-4-4-4-12` hex groups, or 32 hex digits without dashes
fn is_uuid(stem: &str) -> bool {
    let groups: Vec<&str> = stem.split('-').collect();
    let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
    let shaped = lengths == [8, 4, 4, 4, 12] || lengths == [32];
    shaped && groups.iter().all(|g| g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Upper case, lower case and digits in near-equal shares
///
/// Structured names like `EpisodeS01E01720pWEBDL` lean heavily on one class
/// and stay out.
fn is_even_mix(stem: &str) -> bool {
    let (mut upper, mut lower, mut digit) = (0usize, 0usize, 0usize);
    for c in stem.chars() {
        if c.is_ascii_uppercase() {
            upper += 1;
        } else if c.is_ascii_lowercase() {
            lower += 1;
        } else if c.is_ascii_digit() {
            digit += 1;
        }
    }
    let total = upper + lower + digit;
    if total < MIN_MIX_LENGTH || upper == 0 || lower == 0 || digit == 0 {
        return false;
    }
    let share = |n: usize| n as f32 / total as f32;
    LETTER_SHARE.contains(&share(upper))
        && LETTER_SHARE.contains(&share(lower))
        && DIGIT_SHARE.contains(&share(digit))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_with_and_without_dashes() {
        assert!(is_uuid("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_uuid("550E8400E29B41D4A716446655440000"));
        assert!(!is_uuid("550e8400-e29b-41d4-a716"));
        assert!(!is_uuid("not-a-uuid-at-all"));
    }

    #[test]
    fn even_mix_needs_length_and_balance() {
        assert!(is_even_mix("aB3cD5eF7gH9iJ1kL2mN4oP6"));
        assert!(!is_even_mix("aB3cD5eF7gH9iJ1kL2mN4o"), "too short to judge");
        assert!(!is_even_mix("EpisodeS01E01720pWEBDLx264Group"));
    }

    #[test]
    fn random_stems_are_obfuscated() {
        assert!(is_obfuscated("550e8400e29b41d4a716446655440000.avi"));
        assert!(is_obfuscated("deadbeef1234567890abcdef.mkv"));
        assert!(is_obfuscated("xkcdmnbvcxz.rar"));
        assert!(is_obfuscated("Xk4mP9wRt2Yz8QvN3Lb6Hj5Mk7Np1.mkv"));
    }

    #[test]
    fn descriptive_names_are_not() {
        assert!(!is_obfuscated("Movie.Name.2024.1080p.BluRay.x264.mkv"));
        assert!(!is_obfuscated("Movie[1a2b3c4d].mkv"), "short CRC tag");
        assert!(!is_obfuscated("show.part01.rar"));
        assert!(!is_obfuscated("mkv.rar"), "short consonant runs are fine");
        assert!(!is_obfuscated(""));
    }
}
