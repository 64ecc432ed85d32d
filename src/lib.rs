// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side multicast group membership signaling for a userspace IP stack.
//!
//! This crate implements the host portion of IGMPv2 ([RFC 2236]), including
//! backwards compatibility with IGMPv1 routers, on top of a generic
//! multicast membership engine that is shared with the protocol's IPv6
//! counterpart, MLD. The crate is sans-io: timers, randomness, statistics,
//! and frame transmission are provided by the embedding stack through the
//! execution-context traits in [`context`].
//!
//! [RFC 2236]: https://datatracker.ietf.org/doc/html/rfc2236

pub mod context;
mod data_structures;
pub mod error;
pub mod ip;
pub mod wire;

pub use crate::context::{
    CounterContext, FrameContext, Instant, InstantContext, RngContext, StateContext, TimerContext,
    TimerHandler,
};
