// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! 8.3 short names: 11 bytes on disk, 8 for the base and 3 for the
//! extension, both space-padded and conventionally upper-case. Lookups go
//! through the lossy conversion so padding and case differences never
//! matter; only creation validates.

use pika_err::{Error, Result};

/// Lossy conversion for comparisons: upper-cases, splits at the last dot,
/// truncates the base to 8 and the extension to 3 bytes.
pub fn short_name(name: &str) -> [u8; 11] {
    let (base, extension) = match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };

    let mut short = [b' '; 11];
    for (slot, byte) in short[..8].iter_mut().zip(base.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }
    for (slot, byte) in short[8..].iter_mut().zip(extension.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }
    short
}

/// Checked conversion for entries being created or renamed.
pub fn encode_short_name(name: &str) -> Result<[u8; 11]> {
    let (base, extension) = match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || extension.len() > 3 {
        return Err(Error::InvalidArgument);
    }
    for byte in base.bytes().chain(extension.bytes()) {
        if !byte.is_ascii() || byte.is_ascii_control() || byte == b'/' || byte == b'\\' || byte == b'.' {
            return Err(Error::InvalidArgument);
        }
    }
    Ok(short_name(name))
}

/// Rejoins the trimmed base and extension with a dot; the dot is omitted
/// when the extension field is all padding.
pub fn decode_short_name(short: &[u8; 11]) -> String {
    let base = trim_padding(&short[..8]);
    let extension = trim_padding(&short[8..]);

    let mut name = String::with_capacity(base.len() + 1 + extension.len());
    name.extend(base.iter().map(|&byte| byte as char));
    if !extension.is_empty() {
        name.push('.');
        name.extend(extension.iter().map(|&byte| byte as char));
    }
    name
}

/// Whether a raw on-disk name denotes `name`, insensitively to case and
/// padding.
pub fn matches(short: &[u8; 11], name: &str) -> bool {
    short.eq_ignore_ascii_case(&short_name(name))
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let mut end = field.len();
    while end > 0 && field[end - 1] == b' ' {
        end -= 1;
    }
    &field[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_pads_and_upper_cases() {
        assert_eq!(&short_name("hello.txt"), b"HELLO   TXT");
        assert_eq!(&short_name("A"), b"A          ");
        assert_eq!(&short_name("NOEXT."), b"NOEXT      ");
    }

    #[test]
    fn short_name_truncates() {
        assert_eq!(&short_name("REALLYLONGNAME.JSON"), b"REALLYLOJSO");
    }

    #[test]
    fn decode_round_trips() {
        assert_eq!(decode_short_name(b"HELLO   TXT"), "HELLO.TXT");
        assert_eq!(decode_short_name(b"DIR        "), "DIR");
    }

    #[test]
    fn matches_is_padding_and_case_insensitive() {
        assert!(matches(b"HELLO   TXT", "hello.txt"));
        assert!(matches(b"HELLO   TXT", "HELLO.TXT"));
        assert!(!matches(b"HELLO   TXT", "HELLO.TX"));
    }

    #[test]
    fn encode_validates() {
        assert!(encode_short_name("HELLO.TXT").is_ok());
        assert!(encode_short_name("").is_err());
        assert!(encode_short_name("TOOLONGNAME.TXT").is_err());
        assert!(encode_short_name("A.LONG").is_err());
        assert!(encode_short_name("A.B.C").is_err());
        assert!(encode_short_name("BAD/NAME").is_err());
    }

    #[test]
    fn encoded_equals_lossy_for_valid_names() {
        assert_eq!(encode_short_name("readme.md").unwrap(), short_name("readme.md"));
    }
}
