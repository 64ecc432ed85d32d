// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of the IPv4 options block used by IGMP transmissions.
//!
//! Only the options IGMP needs are represented: the single-byte NOP and
//! end-of-options-list options, and Router Alert ([RFC 2113]), which
//! membership reports must carry per RFC 2236 section 2.
//!
//! [RFC 2113]: https://datatracker.ietf.org/doc/html/rfc2113

use crate::error::ParseError;

const OPTION_KIND_LIST_END: u8 = 0;
const OPTION_KIND_NOP: u8 = 1;
const OPTION_KIND_ROUTER_ALERT: u8 = 0x94;

// Kind, length, and the two-byte zero value ("routers shall examine this
// packet").
const ROUTER_ALERT_BYTES: [u8; 4] = [OPTION_KIND_ROUTER_ALERT, 0x04, 0x00, 0x00];

/// An IPv4 option that may accompany an IGMP transmission.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ipv4Option {
    /// A single-byte no-operation, used for alignment.
    Nop,
    /// Terminates the options list. Its zero encoding doubles as the
    /// padding byte.
    ListEnd,
    /// Router Alert: routers examine the packet even though it is not
    /// addressed to them.
    RouterAlert,
}

impl Ipv4Option {
    fn encoded_len(&self) -> usize {
        match self {
            Ipv4Option::Nop | Ipv4Option::ListEnd => 1,
            Ipv4Option::RouterAlert => ROUTER_ALERT_BYTES.len(),
        }
    }
}

/// A serializer for a block of IPv4 options.
///
/// Options are serialized in input order, then the block is padded with
/// zero bytes to a 4-byte boundary as the IPv4 header length field requires.
pub struct Ipv4OptionsSerializer<'a> {
    options: &'a [Ipv4Option],
}

impl<'a> Ipv4OptionsSerializer<'a> {
    /// Creates a serializer over `options`.
    pub fn new(options: &'a [Ipv4Option]) -> Ipv4OptionsSerializer<'a> {
        Ipv4OptionsSerializer { options }
    }

    /// The length of the serialized block, including padding.
    pub fn serialized_len(&self) -> usize {
        let len: usize = self.options.iter().map(Ipv4Option::encoded_len).sum();
        (len + 3) & !3
    }

    /// Writes the block into the beginning of `buffer`, returning the
    /// number of bytes written, which always equals
    /// [`Ipv4OptionsSerializer::serialized_len`].
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is shorter than the serialized length.
    pub fn serialize(&self, buffer: &mut [u8]) -> usize {
        let len = self.serialized_len();
        let block = &mut buffer[..len];
        let mut offset = 0;
        for option in self.options {
            match option {
                Ipv4Option::Nop => {
                    block[offset] = OPTION_KIND_NOP;
                    offset += 1;
                }
                Ipv4Option::ListEnd => {
                    block[offset] = OPTION_KIND_LIST_END;
                    offset += 1;
                }
                Ipv4Option::RouterAlert => {
                    block[offset..offset + ROUTER_ALERT_BYTES.len()]
                        .copy_from_slice(&ROUTER_ALERT_BYTES);
                    offset += ROUTER_ALERT_BYTES.len();
                }
            }
        }
        for byte in &mut block[offset..] {
            *byte = 0;
        }
        len
    }
}

/// Parses a serialized options block, recovering the options in order.
///
/// Parsing stops at the first end-of-options-list byte, so the terminator
/// and any padding after it are not reported.
pub fn parse_options(mut bytes: &[u8]) -> Result<Vec<Ipv4Option>, ParseError> {
    let mut options = Vec::new();
    while let Some((&kind, rest)) = bytes.split_first() {
        match kind {
            OPTION_KIND_LIST_END => break,
            OPTION_KIND_NOP => {
                options.push(Ipv4Option::Nop);
                bytes = rest;
            }
            OPTION_KIND_ROUTER_ALERT => {
                if rest.len() < 3 || rest[..3] != ROUTER_ALERT_BYTES[1..] {
                    return Err(ParseError::Format);
                }
                options.push(Ipv4Option::RouterAlert);
                bytes = &rest[3..];
            }
            _ => return Err(ParseError::NotSupported),
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;

    #[test_case(&[Ipv4Option::Nop], &[1, 0, 0, 0]; "nop")]
    #[test_case(&[Ipv4Option::ListEnd], &[0, 0, 0, 0]; "list end")]
    #[test_case(&[Ipv4Option::RouterAlert], &[148, 4, 0, 0]; "router alert")]
    #[test_case(
        &[Ipv4Option::Nop, Ipv4Option::RouterAlert],
        &[1, 148, 4, 0, 0, 0, 0, 0];
        "nop and router alert"
    )]
    fn serialize_expected_bytes(options: &[Ipv4Option], expected: &[u8]) {
        let serializer = Ipv4OptionsSerializer::new(options);
        let len = serializer.serialized_len();
        assert_eq!(len, expected.len());
        assert_eq!(len % 4, 0);

        // Fill the buffer with full bytes to check that padding is written.
        let mut buffer = vec![0xFF; len];
        assert_eq!(serializer.serialize(&mut buffer), len);
        assert_eq!(buffer, expected);
    }

    #[test_case(&[]; "empty")]
    #[test_case(&[Ipv4Option::Nop]; "nop")]
    #[test_case(&[Ipv4Option::RouterAlert]; "router alert")]
    #[test_case(&[Ipv4Option::Nop, Ipv4Option::RouterAlert, Ipv4Option::Nop]; "mixed")]
    fn serialize_parse_round_trip(options: &[Ipv4Option]) {
        let serializer = Ipv4OptionsSerializer::new(options);
        let mut buffer = vec![0xFF; serializer.serialized_len()];
        let len = serializer.serialize(&mut buffer);
        assert_eq!(len, buffer.len());
        assert_eq!(parse_options(&buffer).unwrap(), options);
    }

    #[test]
    fn parse_stops_at_list_end() {
        assert_eq!(
            parse_options(&[1, 0, 1, 1]).unwrap(),
            [Ipv4Option::Nop],
        );
    }

    #[test]
    fn parse_rejects_truncated_router_alert() {
        assert_matches!(parse_options(&[148, 4, 0]), Err(ParseError::Format));
        assert_matches!(parse_options(&[148, 2, 0, 0]), Err(ParseError::Format));
    }

    #[test]
    fn parse_rejects_unknown_option() {
        assert_matches!(parse_options(&[7, 0, 0, 0]), Err(ParseError::NotSupported));
    }
}
