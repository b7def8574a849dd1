//! Variable-length integer and string encodings used by the data section.

/// Append `value` as ULEB128.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Append `value` as SLEB128.
pub fn write_sleb128(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a ULEB128 value, returning it with the number of bytes consumed.
pub fn read_uleb128(bytes: &[u8]) -> (u32, usize) {
    let mut value = 0u32;
    let mut consumed = 0;
    loop {
        let byte = bytes[consumed];
        value |= u32::from(byte & 0x7f) << (7 * consumed);
        consumed += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }
    (value, consumed)
}

/// Encode `s` as modified UTF-8: NUL becomes the two-byte form `C0 80` and
/// supplementary code points are written as CESU-8 surrogate pairs, so the
/// encoded data never contains a zero byte.
pub fn mutf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let cp = c as u32;
        match cp {
            0 => out.extend_from_slice(&[0xc0, 0x80]),
            1..=0x7f => out.push(cp as u8),
            0x80..=0x7ff => {
                out.push(0xc0 | (cp >> 6) as u8);
                out.push(0x80 | (cp & 0x3f) as u8);
            }
            0x800..=0xffff => push_three_byte(&mut out, cp),
            _ => {
                let v = cp - 0x10000;
                push_three_byte(&mut out, 0xd800 + (v >> 10));
                push_three_byte(&mut out, 0xdc00 + (v & 0x3ff));
            }
        }
    }
    out
}

fn push_three_byte(out: &mut Vec<u8>, cp: u32) {
    out.push(0xe0 | (cp >> 12) as u8);
    out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
    out.push(0x80 | (cp & 0x3f) as u8);
}

/// Number of UTF-16 code units in `s`, the length prefix string data carries.
pub fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

/// String collation mandated for the string section: UTF-16 code unit order.
pub fn cmp_utf16(a: &str, b: &str) -> std::cmp::Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

/// Compare two string sequences element-wise under UTF-16 collation, shorter
/// prefix first.
pub fn cmp_utf16_seq(a: &[String], b: &[String]) -> std::cmp::Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| cmp_utf16(x, y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        write_uleb128(&mut out, value);
        out
    }

    fn sleb(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_sleb128(&mut out, value);
        out
    }

    #[test]
    fn test_uleb128() {
        assert_eq!(uleb(0), [0x00]);
        assert_eq!(uleb(1), [0x01]);
        assert_eq!(uleb(127), [0x7f]);
        assert_eq!(uleb(128), [0x80, 0x01]);
        assert_eq!(uleb(16384), [0x80, 0x80, 0x01]);
        assert_eq!(uleb(u32::MAX), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn test_uleb128_round_trip() {
        for value in [0, 1, 127, 128, 300, 0xffff, u32::MAX] {
            let encoded = uleb(value);
            let (decoded, consumed) = read_uleb128(&encoded);
            assert_eq!(decoded, value);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_sleb128() {
        assert_eq!(sleb(0), [0x00]);
        assert_eq!(sleb(1), [0x01]);
        assert_eq!(sleb(-1), [0x7f]);
        assert_eq!(sleb(63), [0x3f]);
        assert_eq!(sleb(64), [0xc0, 0x00]);
        assert_eq!(sleb(-64), [0x40]);
        assert_eq!(sleb(-65), [0xbf, 0x7f]);
    }

    #[test]
    fn test_mutf8_ascii_passthrough() {
        assert_eq!(mutf8("Hello"), b"Hello");
    }

    #[test]
    fn test_mutf8_embedded_nul() {
        assert_eq!(mutf8("a\0b"), [b'a', 0xc0, 0x80, b'b']);
        assert!(!mutf8("\0\0").contains(&0));
    }

    #[test]
    fn test_mutf8_supplementary_as_surrogate_pair() {
        // U+10400 -> surrogates D801 DC00, each encoded as three bytes.
        let encoded = mutf8("\u{10400}");
        assert_eq!(encoded, [0xed, 0xa0, 0x81, 0xed, 0xb0, 0x80]);
        assert_eq!(utf16_len("\u{10400}"), 2);
    }

    #[test]
    fn test_cmp_utf16_orders_supplementary_before_upper_bmp() {
        use std::cmp::Ordering;
        // U+10400 leads with surrogate unit D801, below U+FFFD, so it sorts
        // first in code unit order even though code point order disagrees.
        assert_eq!(cmp_utf16("\u{10400}", "\u{fffd}"), Ordering::Less);
        assert_eq!(cmp_utf16("a", "ab"), Ordering::Less);
        assert_eq!(cmp_utf16("b", "a"), Ordering::Greater);
    }
}
