// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution contexts.
//!
//! This module defines "context" traits through which the protocol code in
//! this crate reaches the resources of its embedding stack: a monotonic
//! clock, a timer scheduler, a random number generator, statistics counters,
//! per-device state storage, and a transmit path. Protocol logic is written
//! against these traits, which keeps it free of locking and I/O; the
//! embedding stack serializes calls into the crate (typically with a
//! per-interface lock) and dispatches fired timers back in through
//! [`TimerHandler`]. Tests use the dummy implementations in [`testutil`] to
//! drive the protocol deterministically.

use core::fmt::Debug;
use core::time::Duration;

use rand::{CryptoRng, RngCore};
use thiserror::Error;

/// A type representing an instant in time.
pub trait Instant: Sized + Ord + Copy + Clone + Debug + Send + Sync {
    /// Returns the amount of time elapsed from another instant to this one.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is later than `self`.
    fn duration_since(&self, earlier: Self) -> Duration;

    /// Returns `Some(t)` where `t` is the time `self + duration` if it can
    /// be represented as an instant, or `None` otherwise.
    fn checked_add(&self, duration: Duration) -> Option<Self>;

    /// Returns `Some(t)` where `t` is the time `self - duration` if it can
    /// be represented as an instant, or `None` otherwise.
    fn checked_sub(&self, duration: Duration) -> Option<Self>;
}

/// A context that provides access to a monotonic clock.
pub trait InstantContext {
    /// The type of an instant in time.
    type Instant: Instant;

    /// Returns the current instant.
    fn now(&self) -> Self::Instant;
}

/// A context that provides a random number generator.
pub trait RngContext {
    /// The random number generator provided by this context.
    type Rng: RngCore + CryptoRng;

    /// Gets the random number generator.
    fn rng(&self) -> &Self::Rng;

    /// Gets the random number generator mutably.
    fn rng_mut(&mut self) -> &mut Self::Rng;
}

/// A context that supports scheduling timers, identified by values of type
/// `Id`.
pub trait TimerContext<Id>: InstantContext {
    /// Schedules a timer to fire at `time`.
    ///
    /// If a timer with the same ID was previously scheduled and has not yet
    /// fired, it is unscheduled and its firing time is returned.
    fn schedule_timer_instant(&mut self, time: Self::Instant, id: Id) -> Option<Self::Instant>;

    /// Like [`TimerContext::schedule_timer_instant`], but schedules relative
    /// to the current time.
    ///
    /// # Panics
    ///
    /// Panics if the computed deadline is not representable as an instant.
    fn schedule_timer(&mut self, duration: Duration, id: Id) -> Option<Self::Instant> {
        let time = self.now().checked_add(duration).expect("timer deadline overflowed");
        self.schedule_timer_instant(time, id)
    }

    /// Cancels the timer with the given ID.
    ///
    /// Returns the instant the timer was scheduled to fire at, if it was
    /// scheduled. Cancelling an unscheduled or already-fired timer is a
    /// no-op.
    fn cancel_timer(&mut self, id: Id) -> Option<Self::Instant>;

    /// Cancels all timers whose IDs satisfy `f`.
    fn cancel_timers_with<F: FnMut(&Id) -> bool>(&mut self, f: F);

    /// Returns the instant the timer with the given ID will fire at, if it
    /// is scheduled.
    fn scheduled_instant(&self, id: Id) -> Option<Self::Instant>;
}

/// A handler for timer firing events.
///
/// The embedding stack dispatches a fired timer by calling
/// [`TimerHandler::handle_timer`] while holding whatever serialization it
/// applies to the rest of this crate's operations.
pub trait TimerHandler<C, Id> {
    /// Handles the timer with ID `id` firing.
    fn handle_timer(&mut self, ctx: &mut C, id: Id);
}

/// A context for counting events for debugging and statistics purposes.
pub trait CounterContext {
    /// Increments the counter with the given key.
    fn increment_counter(&mut self, key: &'static str);
}

/// An error encountered while sending a frame.
///
/// Transmit failures are reported by the device layer; this crate does not
/// retry, as protocol-level retransmission covers transient loss.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to send frame")]
pub struct SendFrameError;

/// A context that supports sending frames described by metadata of type
/// `Meta`.
pub trait FrameContext<C, Meta> {
    /// Sends `body` as a frame described by `meta`.
    ///
    /// `body` is the payload only; the implementation is responsible for any
    /// encapsulating headers that `meta` calls for. Ownership of the bytes
    /// is not retained after the call returns.
    fn send_frame(&mut self, ctx: &mut C, meta: Meta, body: &[u8]) -> Result<(), SendFrameError>;
}

/// A context that provides access to state of type `State`, keyed by
/// identifiers of type `Id`.
pub trait StateContext<C, State, Id = ()> {
    /// Gets the state at `id` immutably.
    fn get_state_with(&self, id: Id) -> &State;

    /// Gets the state at `id` mutably.
    fn get_state_mut_with(&mut self, id: Id) -> &mut State;
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;

    use core::fmt::{self, Debug, Formatter};
    use core::hash::Hash;
    use core::marker::PhantomData;

    use rand::SeedableRng as _;
    use rand_xorshift::XorShiftRng;

    use super::*;

    /// A dummy [`Instant`] backed by an offset from an arbitrary epoch.
    #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
    pub(crate) struct DummyInstant {
        offset: Duration,
    }

    impl From<Duration> for DummyInstant {
        fn from(offset: Duration) -> DummyInstant {
            DummyInstant { offset }
        }
    }

    impl Instant for DummyInstant {
        fn duration_since(&self, earlier: DummyInstant) -> Duration {
            self.offset.checked_sub(earlier.offset).unwrap()
        }

        fn checked_add(&self, duration: Duration) -> Option<DummyInstant> {
            self.offset.checked_add(duration).map(|offset| DummyInstant { offset })
        }

        fn checked_sub(&self, duration: Duration) -> Option<DummyInstant> {
            self.offset.checked_sub(duration).map(|offset| DummyInstant { offset })
        }
    }

    impl Debug for DummyInstant {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.offset)
        }
    }

    /// A fake RNG with deterministic output.
    ///
    /// `FakeCryptoRng` claims to be cryptographically secure so that it can
    /// stand in for the stack-wide RNG in tests, but its output is entirely
    /// determined by its seed.
    pub(crate) struct FakeCryptoRng<R = XorShiftRng>(R);

    impl FakeCryptoRng<XorShiftRng> {
        /// Creates a new RNG from `seed`.
        pub(crate) fn new_xorshift(seed: u128) -> FakeCryptoRng<XorShiftRng> {
            FakeCryptoRng(XorShiftRng::from_seed(seed.to_ne_bytes()))
        }
    }

    impl<R: RngCore> RngCore for FakeCryptoRng<R> {
        fn next_u32(&mut self) -> u32 {
            self.0.next_u32()
        }

        fn next_u64(&mut self) -> u64 {
            self.0.next_u64()
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.0.fill_bytes(dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.0.try_fill_bytes(dest)
        }
    }

    impl<R: RngCore> CryptoRng for FakeCryptoRng<R> {}

    /// A dummy timer scheduler tracking pending timers and the current time.
    pub(crate) struct DummyTimerCtx<Id> {
        timers: Vec<(DummyInstant, Id)>,
        now: DummyInstant,
    }

    impl<Id> Default for DummyTimerCtx<Id> {
        fn default() -> DummyTimerCtx<Id> {
            DummyTimerCtx { timers: Vec::new(), now: DummyInstant::default() }
        }
    }

    impl<Id: Clone + Eq + Debug + Hash> DummyTimerCtx<Id> {
        fn schedule(&mut self, time: DummyInstant, id: Id) -> Option<DummyInstant> {
            let prev = self.cancel(&id);
            self.timers.push((time, id));
            prev
        }

        fn cancel(&mut self, id: &Id) -> Option<DummyInstant> {
            self.timers
                .iter()
                .position(|(_, other)| other == id)
                .map(|idx| self.timers.remove(idx).0)
        }

        fn scheduled(&self, id: &Id) -> Option<DummyInstant> {
            self.timers.iter().find_map(|(time, other)| (other == id).then(|| *time))
        }

        /// Asserts that the set of installed timers is exactly `timers`.
        #[track_caller]
        pub(crate) fn assert_timers_installed<I: IntoIterator<Item = (Id, DummyInstant)>>(
            &self,
            timers: I,
        ) {
            let expected: HashMap<_, _> = timers.into_iter().collect();
            let actual: HashMap<_, _> =
                self.timers.iter().map(|(time, id)| (id.clone(), *time)).collect();
            assert_eq!(actual, expected);
        }

        /// Asserts that no timers are installed.
        #[track_caller]
        pub(crate) fn assert_no_timers_installed(&self) {
            self.assert_timers_installed([])
        }
    }

    /// The non-synchronized part of a dummy context: clock, timers, RNG, and
    /// counters.
    pub(crate) struct DummyNonSyncCtx<TimerId> {
        timers: DummyTimerCtx<TimerId>,
        rng: FakeCryptoRng<XorShiftRng>,
        counters: HashMap<&'static str, usize>,
    }

    impl<TimerId> Default for DummyNonSyncCtx<TimerId> {
        fn default() -> DummyNonSyncCtx<TimerId> {
            DummyNonSyncCtx {
                timers: DummyTimerCtx::default(),
                rng: FakeCryptoRng::new_xorshift(0),
                counters: HashMap::new(),
            }
        }
    }

    impl<TimerId> DummyNonSyncCtx<TimerId> {
        /// Gets the timer scheduler, e.g. to assert on installed timers.
        pub(crate) fn timer_ctx(&self) -> &DummyTimerCtx<TimerId> {
            &self.timers
        }

        /// Returns the current value of the counter with the given key.
        pub(crate) fn counter_val(&self, key: &str) -> usize {
            self.counters.get(key).copied().unwrap_or(0)
        }
    }

    impl<TimerId: Clone + Eq + Debug + Hash> DummyNonSyncCtx<TimerId> {
        /// Fires the next scheduled timer by advancing the clock to its
        /// deadline and invoking `f` with its ID.
        ///
        /// Returns the ID of the fired timer, or `None` if no timers are
        /// scheduled. The timer is unscheduled before `f` runs, so `f` may
        /// reschedule it.
        pub(crate) fn trigger_next_timer<SC, F: FnOnce(&mut SC, &mut Self, TimerId)>(
            &mut self,
            sync_ctx: &mut SC,
            f: F,
        ) -> Option<TimerId> {
            let idx = self
                .timers
                .timers
                .iter()
                .enumerate()
                .min_by_key(|(_, (time, _))| *time)
                .map(|(idx, _)| idx)?;
            let (time, id) = self.timers.timers.remove(idx);
            self.timers.now = time;
            f(sync_ctx, self, id.clone());
            Some(id)
        }
    }

    impl<TimerId> InstantContext for DummyNonSyncCtx<TimerId> {
        type Instant = DummyInstant;

        fn now(&self) -> DummyInstant {
            self.timers.now
        }
    }

    impl<TimerId: Clone + Eq + Debug + Hash> TimerContext<TimerId> for DummyNonSyncCtx<TimerId> {
        fn schedule_timer_instant(
            &mut self,
            time: DummyInstant,
            id: TimerId,
        ) -> Option<DummyInstant> {
            self.timers.schedule(time, id)
        }

        fn cancel_timer(&mut self, id: TimerId) -> Option<DummyInstant> {
            self.timers.cancel(&id)
        }

        fn cancel_timers_with<F: FnMut(&TimerId) -> bool>(&mut self, mut f: F) {
            self.timers.timers.retain(|(_, id)| !f(id));
        }

        fn scheduled_instant(&self, id: TimerId) -> Option<DummyInstant> {
            self.timers.scheduled(&id)
        }
    }

    impl<TimerId> RngContext for DummyNonSyncCtx<TimerId> {
        type Rng = FakeCryptoRng<XorShiftRng>;

        fn rng(&self) -> &FakeCryptoRng<XorShiftRng> {
            &self.rng
        }

        fn rng_mut(&mut self) -> &mut FakeCryptoRng<XorShiftRng> {
            &mut self.rng
        }
    }

    impl<TimerId> CounterContext for DummyNonSyncCtx<TimerId> {
        fn increment_counter(&mut self, key: &'static str) {
            *self.counters.entry(key).or_insert(0) += 1;
        }
    }

    /// The synchronized part of a dummy context: protocol state and a record
    /// of sent frames.
    pub(crate) struct DummySyncCtx<S, Meta, DeviceId> {
        state: S,
        frames: Vec<(Meta, Vec<u8>)>,
        error_sends: bool,
        _marker: PhantomData<DeviceId>,
    }

    impl<S: Default, Meta, DeviceId> Default for DummySyncCtx<S, Meta, DeviceId> {
        fn default() -> DummySyncCtx<S, Meta, DeviceId> {
            DummySyncCtx::with_state(S::default())
        }
    }

    impl<S, Meta, DeviceId> DummySyncCtx<S, Meta, DeviceId> {
        /// Creates a new `DummySyncCtx` holding `state`.
        pub(crate) fn with_state(state: S) -> DummySyncCtx<S, Meta, DeviceId> {
            DummySyncCtx { state, frames: Vec::new(), error_sends: false, _marker: PhantomData }
        }

        /// Gets the state immutably.
        pub(crate) fn get_ref(&self) -> &S {
            &self.state
        }

        /// Gets the state mutably.
        pub(crate) fn get_mut(&mut self) -> &mut S {
            &mut self.state
        }

        /// Gets the frames sent so far.
        pub(crate) fn frames(&self) -> &[(Meta, Vec<u8>)] {
            &self.frames
        }

        /// Takes the frames sent so far, clearing the record.
        pub(crate) fn take_frames(&mut self) -> Vec<(Meta, Vec<u8>)> {
            core::mem::take(&mut self.frames)
        }

        /// When set, [`FrameContext::send_frame`] fails instead of recording
        /// the frame.
        pub(crate) fn set_error_sends(&mut self, error_sends: bool) {
            self.error_sends = error_sends;
        }
    }

    impl<C, S, Meta, DeviceId> FrameContext<C, Meta> for DummySyncCtx<S, Meta, DeviceId> {
        fn send_frame(
            &mut self,
            _ctx: &mut C,
            meta: Meta,
            body: &[u8],
        ) -> Result<(), SendFrameError> {
            if self.error_sends {
                return Err(SendFrameError);
            }
            self.frames.push((meta, body.to_vec()));
            Ok(())
        }
    }

    /// A dummy context holding the synchronized and non-synchronized parts
    /// together.
    pub(crate) struct DummyCtx<SC, TimerId> {
        pub(crate) sync_ctx: SC,
        pub(crate) non_sync_ctx: DummyNonSyncCtx<TimerId>,
    }

    impl<SC, TimerId> DummyCtx<SC, TimerId> {
        /// Creates a `DummyCtx` around `sync_ctx` and a default
        /// non-synchronized context.
        pub(crate) fn with_sync_ctx(sync_ctx: SC) -> DummyCtx<SC, TimerId> {
            DummyCtx { sync_ctx, non_sync_ctx: DummyNonSyncCtx::default() }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn timer_ctx_schedule_replaces() {
            let mut ctx = DummyNonSyncCtx::<usize>::default();
            assert_eq!(ctx.schedule_timer(Duration::from_secs(2), 0), None);
            assert_eq!(
                ctx.schedule_timer(Duration::from_secs(5), 0),
                Some(DummyInstant::from(Duration::from_secs(2)))
            );
            ctx.timer_ctx()
                .assert_timers_installed([(0, DummyInstant::from(Duration::from_secs(5)))]);
        }

        #[test]
        fn timer_ctx_triggers_in_deadline_order() {
            let mut ctx = DummyNonSyncCtx::<usize>::default();
            let _: Option<DummyInstant> = ctx.schedule_timer(Duration::from_secs(3), 1);
            let _: Option<DummyInstant> = ctx.schedule_timer(Duration::from_secs(1), 2);

            let mut fired = Vec::new();
            while let Some(id) =
                ctx.trigger_next_timer(&mut (), |_: &mut (), _, id| fired.push(id))
            {
                let _: usize = id;
            }
            assert_eq!(fired, [2, 1]);
            assert_eq!(ctx.now(), DummyInstant::from(Duration::from_secs(3)));
            ctx.timer_ctx().assert_no_timers_installed();
        }

        #[test]
        fn timer_ctx_cancel_is_idempotent() {
            let mut ctx = DummyNonSyncCtx::<usize>::default();
            let _: Option<DummyInstant> = ctx.schedule_timer(Duration::from_secs(1), 7);
            assert_eq!(ctx.cancel_timer(7), Some(DummyInstant::from(Duration::from_secs(1))));
            assert_eq!(ctx.cancel_timer(7), None);
        }
    }
}
