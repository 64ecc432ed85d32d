// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing and serialization of IGMP messages.
//!
//! The message format is shared by [RFC 1112] and [RFC 2236]: a fixed eight
//! bytes holding a type, a max response time (meaningful only in queries,
//! in units of a tenth of a second), a checksum, and a group address.
//!
//! [RFC 1112]: https://datatracker.ietf.org/doc/html/rfc1112
//! [RFC 2236]: https://datatracker.ietf.org/doc/html/rfc2236

use core::time::Duration;

use byteorder::{ByteOrder, NetworkEndian};
use net_types::ip::Ipv4Addr;
use zerocopy::{AsBytes, ByteSlice, FromBytes, LayoutVerified, Unaligned};

use crate::error::ParseError;
use crate::wire::util::{checksum, Checksum};

/// The length of an IGMP message in bytes.
pub const MESSAGE_LEN: usize = 8;

/// The IPv4 protocol number carrying IGMP.
pub const IPV4_PROTO_IGMP: u8 = 2;

/// The TTL of all IGMP packets (RFC 2236 section 2).
pub const IGMP_TTL: u8 = 1;

/// An IGMP message type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IgmpMessageType {
    /// Sent by multicast routers to query group membership.
    MembershipQuery = 0x11,
    /// A version 1 membership report (RFC 1112).
    V1MembershipReport = 0x12,
    /// A version 2 membership report (RFC 2236).
    V2MembershipReport = 0x16,
    /// A leave group message (RFC 2236).
    LeaveGroup = 0x17,
}

impl IgmpMessageType {
    /// Returns the message type with the given wire value, if recognized.
    pub fn from_raw(raw: u8) -> Option<IgmpMessageType> {
        match raw {
            0x11 => Some(IgmpMessageType::MembershipQuery),
            0x12 => Some(IgmpMessageType::V1MembershipReport),
            0x16 => Some(IgmpMessageType::V2MembershipReport),
            0x17 => Some(IgmpMessageType::LeaveGroup),
            _ => None,
        }
    }
}

// Fields are u8 or [u8; N] so the struct is unaligned and endianness is
// handled explicitly through NetworkEndian.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct Header {
    msg_type: u8,
    max_resp_code: u8,
    checksum: [u8; 2],
    group_addr: [u8; 4],
}

/// An IGMP message.
///
/// An `IgmpPacket` shares its underlying memory with the byte slice it was
/// parsed from; no copying or extra allocation is necessary.
pub struct IgmpPacket<B> {
    header: LayoutVerified<B, Header>,
}

impl<B: ByteSlice> IgmpPacket<B> {
    /// Parses an IGMP message.
    ///
    /// Fails with [`ParseError::Format`] if fewer than [`MESSAGE_LEN`] bytes
    /// are provided. Bytes past the fixed message are ignored. The checksum
    /// is not validated here; use [`IgmpPacket::verify_checksum`].
    pub fn parse(bytes: B) -> Result<IgmpPacket<B>, ParseError> {
        let (header, _) = LayoutVerified::<B, Header>::new_unaligned_from_prefix(bytes)
            .ok_or(ParseError::Format)?;
        Ok(IgmpPacket { header })
    }

    /// Checks the message's checksum field against its contents.
    ///
    /// The checksum covers the whole message, so summing a message whose
    /// checksum field holds the stored complement yields zero.
    pub fn verify_checksum(&self) -> bool {
        checksum(self.header.bytes()) == 0
    }

    /// The message type, or the raw wire value if it is not recognized.
    pub fn msg_type(&self) -> Result<IgmpMessageType, u8> {
        IgmpMessageType::from_raw(self.header.msg_type).ok_or(self.header.msg_type)
    }

    /// The max response time carried in the message.
    ///
    /// Only meaningful in membership queries. The wire encoding is in units
    /// of a tenth of a second.
    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.header.max_resp_code) * 100)
    }

    /// The group address carried in the message.
    pub fn group_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.header.group_addr)
    }
}

/// A builder of IGMP messages.
pub struct IgmpPacketBuilder {
    msg_type: IgmpMessageType,
    max_resp_code: u8,
    group_addr: Ipv4Addr,
}

impl IgmpPacketBuilder {
    /// Creates a builder for a message with a zero max response time, which
    /// covers everything a host transmits.
    pub fn new(msg_type: IgmpMessageType, group_addr: Ipv4Addr) -> IgmpPacketBuilder {
        IgmpPacketBuilder::new_with_max_resp_code(msg_type, 0, group_addr)
    }

    /// Creates a builder carrying a max response time, in units of a tenth
    /// of a second.
    pub fn new_with_max_resp_code(
        msg_type: IgmpMessageType,
        max_resp_code: u8,
        group_addr: Ipv4Addr,
    ) -> IgmpPacketBuilder {
        IgmpPacketBuilder { msg_type, max_resp_code, group_addr }
    }

    /// Serializes the message into the first [`MESSAGE_LEN`] bytes of
    /// `buffer`, computing the checksum over the final bytes.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is shorter than [`MESSAGE_LEN`].
    pub fn serialize(&self, buffer: &mut [u8]) {
        // The zeroed constructor scrubs whatever the buffer held before.
        let (mut header, _) =
            LayoutVerified::<_, Header>::new_unaligned_from_prefix_zeroed(buffer)
                .expect("too few bytes for IGMP message");
        header.msg_type = self.msg_type as u8;
        header.max_resp_code = self.max_resp_code;
        header.group_addr = self.group_addr.ipv4_bytes();
        let mut c = Checksum::new();
        c.add_bytes(header.bytes());
        NetworkEndian::write_u16(&mut header.checksum, c.sum());
    }
}
