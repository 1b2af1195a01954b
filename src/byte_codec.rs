//! Reversible byte ⟷ symbol mapping
//!
//! Byte-level BPE works on strings, but raw bytes include whitespace and
//! control characters that would be awkward inside vocabulary keys and merge
//! rules. GPT-2 therefore maps every byte to a visible Unicode character:
//!
//! - printable ASCII (`!`..=`~`) and the two printable Latin-1 ranges
//!   (`¡`..=`¬`, `®`..=`ÿ`) map to themselves
//! - the remaining 68 byte values (space, control characters, ...) map to
//!   fresh code points starting at U+0100, in ascending byte order
//!
//! So a space (0x20) becomes `Ġ` and a newline (0x0A) becomes `Ċ`, which is
//! why GPT-2 vocabulary files are full of those two characters.
//!
//! The table is built once per process and never changes.

use std::collections::HashMap;
use std::sync::LazyLock;

static CODEC: LazyLock<ByteCodec> = LazyLock::new(ByteCodec::build);

/// Shared process-wide codec
pub fn byte_codec() -> &'static ByteCodec {
    &CODEC
}

/// Bijection between the 256 byte values and 256 visible symbols
pub struct ByteCodec {
    to_symbol: [char; 256],
    to_byte: HashMap<char, u8>,
}

impl ByteCodec {
    fn build() -> Self {
        let mut bytes: Vec<u8> = (b'!'..=b'~')
            .chain(0xA1..=0xAC)
            .chain(0xAE..=0xFF)
            .collect();
        let mut code_points: Vec<u32> = bytes.iter().map(|&b| u32::from(b)).collect();

        let mut next = 0u32;
        for byte in 0..=255u8 {
            if !bytes.contains(&byte) {
                bytes.push(byte);
                code_points.push(256 + next);
                next += 1;
            }
        }

        let mut to_symbol = ['\0'; 256];
        let mut to_byte = HashMap::with_capacity(256);
        for (byte, code_point) in bytes.into_iter().zip(code_points) {
            // Every code point here is below 0x0200, far from the surrogate range
            let symbol =
                char::from_u32(code_point).expect("code point below 0x200 is a valid char");
            to_symbol[byte as usize] = symbol;
            let previous = to_byte.insert(symbol, byte);
            assert!(previous.is_none(), "symbol {symbol:?} assigned twice");
        }

        Self { to_symbol, to_byte }
    }

    /// Symbol standing for `byte`
    #[inline]
    pub fn encode_byte(&self, byte: u8) -> char {
        self.to_symbol[byte as usize]
    }

    /// Byte a symbol stands for, or `None` for characters outside the alphabet
    #[inline]
    pub fn decode_symbol(&self, symbol: char) -> Option<u8> {
        self.to_byte.get(&symbol).copied()
    }

    /// Map every byte to its symbol and collect into a string
    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.encode_byte(b)).collect()
    }

    /// Map a symbol string back to bytes, appending to `out`
    ///
    /// Returns the first character that is not part of the alphabet, if any;
    /// bytes decoded before it are kept.
    pub fn decode_into(&self, symbols: &str, out: &mut Vec<u8>) -> Result<(), char> {
        for symbol in symbols.chars() {
            out.push(self.decode_symbol(symbol).ok_or(symbol)?);
        }
        Ok(())
    }

    /// True when every character of `symbols` belongs to the alphabet
    pub fn is_symbol_string(&self, symbols: &str) -> bool {
        symbols.chars().all(|c| self.to_byte.contains_key(&c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bijective_over_all_bytes() {
        let codec = byte_codec();
        for byte in 0..=255u8 {
            assert_eq!(codec.decode_symbol(codec.encode_byte(byte)), Some(byte));
        }
        assert_eq!(codec.to_byte.len(), 256);
    }

    #[test]
    fn test_printable_bytes_map_to_themselves() {
        let codec = byte_codec();
        assert_eq!(codec.encode_byte(b'A'), 'A');
        assert_eq!(codec.encode_byte(b'~'), '~');
        assert_eq!(codec.encode_byte(0xE9), 'é');
    }

    #[test]
    fn test_remapped_bytes() {
        let codec = byte_codec();
        // 0x00 is the first byte outside the printable ranges
        assert_eq!(codec.encode_byte(0x00), '\u{100}');
        assert_eq!(codec.encode_byte(b' '), 'Ġ');
        assert_eq!(codec.encode_byte(b'\n'), 'Ċ');
        // 0xAD (soft hyphen) is the last one
        assert_eq!(codec.encode_byte(0xAD), '\u{143}');
    }

    #[test]
    fn test_encode_and_decode_strings() {
        let codec = byte_codec();
        let symbols = codec.encode_bytes(" hi\n".as_bytes());
        assert_eq!(symbols, "ĠhiĊ");

        let mut bytes = Vec::new();
        codec.decode_into(&symbols, &mut bytes).unwrap();
        assert_eq!(bytes, b" hi\n");
    }

    #[test]
    fn test_decode_rejects_foreign_symbol() {
        let codec = byte_codec();
        let mut bytes = Vec::new();
        assert_eq!(codec.decode_into("a b", &mut bytes), Err(' '));
        assert_eq!(bytes, b"a");
        assert!(!codec.is_symbol_string("a b"));
        assert!(codec.is_symbol_string("aĠb"));
    }
}
