//! Bounded-text helpers.
//!
//! Every string that crosses the wire or lands in flash is held in a
//! fixed-capacity `heapless::String`.  Overlong input is cut at the last
//! UTF-8 character boundary that fits, never mid-character.

/// Copy `s` into a `heapless::String<N>`, dropping whatever does not fit.
pub fn truncate<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    // Cannot fail: the slice is at most N bytes.
    let _ = out.push_str(&s[..floor_char_boundary(s, N)]);
    out
}

/// Largest index `<= max` that lies on a char boundary of `s`.
pub fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Returns `true` if every byte of `s` is in the printable ASCII range
/// `0x20..=0x7E` (space through tilde, inclusive).
///
pub fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// Can `s` sit between the double quotes of an AT command argument?
/// Printable ASCII only, and no `"` (the modem has no escape for it).
pub fn is_at_quotable(s: &str) -> bool {
    is_printable_ascii(s) && !s.contains('"')
}
