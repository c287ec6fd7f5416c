//! Character encodings accepted for text payloads.
//!
//! Names resolve the way a serial printer host expects: the Unicode forms,
//! strict 7-bit ASCII and true ISO-8859-1 are handled here, and every other
//! label (GBK, GB2312, Big5, Shift_JIS, EUC-KR, windows-125x, ...) goes through
//! the WHATWG label table of `encoding_rs`. Only an unknown name is an error;
//! characters the target cannot represent are written as `?`.

use crate::domain::error::{CbtError, CbtResult};
use encoding_rs::{EncoderResult, Encoding};

const REPLACEMENT: u8 = b'?';

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Charset {
    Utf8,
    UsAscii,
    Latin1,
    /// Big-endian with a leading byte order mark
    Utf16,
    Utf16Be,
    Utf16Le,
    /// Any other encoder known to `encoding_rs`
    Legacy(&'static Encoding),
}

impl Charset {
    /// Resolve an encoding name.
    ///
    /// The built-in forms ignore case, `-` and `_`; anything else must be a
    /// label `encoding_rs` recognises.
    pub fn for_name(name: &str) -> CbtResult<Self> {
        let key: String = name
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        let builtin = match key.as_str() {
            "utf8" | "unicode11utf8" => Some(Self::Utf8),
            "usascii" | "ascii" | "iso646us" | "us" => Some(Self::UsAscii),
            "iso88591" | "latin1" | "l1" | "iso8859" | "cp819" => Some(Self::Latin1),
            "utf16" | "unicode" => Some(Self::Utf16),
            "utf16be" | "unicodebigunmarked" => Some(Self::Utf16Be),
            "utf16le" | "unicodelittleunmarked" => Some(Self::Utf16Le),
            _ => None,
        };
        if let Some(charset) = builtin {
            return Ok(charset);
        }

        match Encoding::for_label(name.trim().as_bytes()) {
            // The replacement encoding and the UTF-16 decoders have no encoder
            Some(encoding) if encoding.output_encoding() == encoding => {
                Ok(Self::Legacy(encoding))
            }
            _ => Err(CbtError::encoding(name, "unsupported character encoding")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::UsAscii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
            Self::Utf16 => "UTF-16",
            Self::Utf16Be => "UTF-16BE",
            Self::Utf16Le => "UTF-16LE",
            Self::Legacy(encoding) => encoding.name(),
        }
    }

    /// Encode `text`. Unrepresentable characters become `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::UsAscii => encode_single_byte(text, 0x7F),
            Self::Latin1 => encode_single_byte(text, 0xFF),
            Self::Utf16 => {
                let mut out = Vec::with_capacity(2 + text.len() * 2);
                out.extend_from_slice(&[0xFE, 0xFF]);
                out.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
                out
            }
            Self::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Self::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Self::Legacy(encoding) => encode_legacy(encoding, text),
        }
    }
}

fn encode_single_byte(text: &str, max: u32) -> Vec<u8> {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if code <= max {
                code as u8
            } else {
                REPLACEMENT
            }
        })
        .collect()
}

fn encode_legacy(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    let mut encoder = encoding.new_encoder();
    let mut out = Vec::with_capacity(
        encoder
            .max_buffer_length_from_utf8_without_replacement(text.len())
            .unwrap_or(text.len() * 4),
    );

    let mut rest = text;
    loop {
        let (result, read) =
            encoder.encode_from_utf8_to_vec_without_replacement(rest, &mut out, true);
        rest = &rest[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::Unmappable(_) => out.push(REPLACEMENT),
            EncoderResult::OutputFull => out.reserve(rest.len() * 4 + 16),
        }
    }
    out
}

/// Resolve `charset_name` and encode `text` in one step.
pub fn encode(text: &str, charset_name: &str) -> CbtResult<Vec<u8>> {
    Ok(Charset::for_name(charset_name)?.encode(text))
}
