use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Letters kept in addition to `a`-`z`.
///
/// None of these has a canonical decomposition, so stripping combining
/// marks cannot fold them into ASCII and they would otherwise be lost.
const EXTRA_LETTERS: &[char] = &['ı', 'ə', 'ß', 'æ', 'ø', 'œ'];

fn is_alphabet(ch: char) -> bool {
    ch.is_ascii_lowercase() || EXTRA_LETTERS.contains(&ch)
}

/// Canonicalize text for comparison.
///
/// Lowercases, decomposes (NFD) and drops combining marks, maps every
/// character outside the alphabet to whitespace, collapses whitespace runs
/// and trims. Total and idempotent.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut gap = false;

    for ch in text.to_lowercase().nfd() {
        if is_combining_mark(ch) {
            continue;
        }

        if is_alphabet(ch) {
            if gap && !out.is_empty() {
                out.push(' ');
            }
            gap = false;
            out.push(ch);
        } else {
            gap = true;
        }
    }

    out
}
