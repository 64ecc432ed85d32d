// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utilities shared by the wire formats in this crate.

use byteorder::{BigEndian, ByteOrder};

/// The ones-complement checksum used by IPv4 and IGMP.
///
/// This checksum operates by computing the 1s complement of the 1s
/// complement sum of successive 16-bit words of the input.
pub struct Checksum(u32);

impl Checksum {
    /// Initializes a new checksum.
    pub fn new() -> Self {
        Checksum(0)
    }

    /// Adds bytes to the checksum.
    ///
    /// If `bytes` does not contain an even number of bytes, a single zero
    /// byte will be added to the end before updating the checksum.
    pub fn add_bytes(&mut self, mut bytes: &[u8]) {
        while bytes.len() > 1 {
            self.0 += u32::from(BigEndian::read_u16(bytes));
            bytes = &bytes[2..];
        }
        if bytes.len() == 1 {
            self.0 += u32::from(BigEndian::read_u16(&[bytes[0], 0]));
        }
    }

    /// Computes the checksum of all data added so far.
    ///
    /// `sum` does not reset the checksum; more bytes may be added afterwards
    /// and they will be folded in as expected.
    pub fn sum(&self) -> u16 {
        let mut sum = self.0;
        while (sum >> 16) != 0 {
            sum = (sum >> 16) + (sum & 0xFFFF);
        }
        !sum as u16
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Checksum::new()
    }
}

/// Checksums `bytes` in one shot.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(bytes);
    c.sum()
}
