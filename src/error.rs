// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error types shared across the crate.

use thiserror::Error;

/// Error type for packet parsing.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    /// The packet is not formatted properly, e.g. too few bytes.
    #[error("packet is not formatted properly")]
    Format,
    /// The packet uses a construct this implementation does not support.
    #[error("operation is not supported")]
    NotSupported,
}
