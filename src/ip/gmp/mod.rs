// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Group Management Protocols (GMPs).
//!
//! This module implements the host side of multicast group membership
//! signaling: a per-interface, per-group state machine which announces
//! local memberships to on-link routers, answers router queries with
//! randomly delayed reports, suppresses reports other members beat us to,
//! and notifies routers when the last local member leaves.
//!
//! The state machine here is protocol-agnostic and generic over the IP
//! address type: IGMP (in [`igmp`]) drives it for IPv4 and the MLD analogue
//! can drive it for IPv6. The protocol-specific pieces - how messages are
//! transmitted and which groups are announced at all - are supplied through
//! [`GmpContext`].
//!
//! Every group a device has joined is in one of three states. A group no
//! local socket is reporting membership for (or whose membership is never
//! announced) is a `NonMember`. Joining a group sends an unsolicited report
//! and schedules a randomly delayed repeat of it, making the group a
//! `DelayingMember`; when the delay elapses or another host's report is
//! heard the group becomes an `IdleMember` until the next query arrives.

use core::time::Duration;

use net_types::ip::IpAddress;
use net_types::{MulticastAddr, SpecifiedAddress as _, Witness as _};
use rand::Rng;

use crate::context::{Instant, InstantContext, RngContext, TimerContext};
use crate::data_structures::ref_counted_hash_map::{InsertResult, RefCountedHashMap, RemoveResult};
use crate::ip::IpDeviceIdContext;

pub mod igmp;

/// The set of multicast groups joined on a device.
///
/// Each group carries a local join count (a group is joined while the count
/// is nonzero) and the per-group protocol state.
pub struct MulticastGroupSet<A: IpAddress, T> {
    inner: RefCountedHashMap<MulticastAddr<A>, T>,
}

impl<A: IpAddress, T> Default for MulticastGroupSet<A, T> {
    fn default() -> MulticastGroupSet<A, T> {
        MulticastGroupSet { inner: RefCountedHashMap::default() }
    }
}

impl<A: IpAddress, T> MulticastGroupSet<A, T> {
    /// Returns `true` if the group is joined locally.
    pub fn contains(&self, group: &MulticastAddr<A>) -> bool {
        self.inner.contains_key(group)
    }

    fn join_group_with<O, F: FnOnce() -> (T, O)>(
        &mut self,
        group: MulticastAddr<A>,
        f: F,
    ) -> InsertResult<O> {
        self.inner.insert_with(group, f)
    }

    fn leave_group(&mut self, group: MulticastAddr<A>) -> RemoveResult<T> {
        self.inner.remove(group)
    }

    fn get_mut(&mut self, group: &MulticastAddr<A>) -> Option<&mut T> {
        self.inner.get_mut(group)
    }

    fn iter<'a>(&'a self) -> impl 'a + Iterator<Item = (&'a MulticastAddr<A>, &'a T)> {
        self.inner.iter()
    }

    fn iter_mut<'a>(&'a mut self) -> impl 'a + Iterator<Item = (&'a MulticastAddr<A>, &'a mut T)> {
        self.inner.iter_mut()
    }
}

// Invariants:
// - A group is in a non-`NonMember` state only while a protocol is
//   announcing its membership.
// - A delayed report timer is scheduled for a group iff the group is in
//   `Delaying`.
enum MemberState {
    NonMember,
    Delaying { last_reporter: bool },
    Idle { last_reporter: bool },
}

/// The state kept by a GMP for a single multicast group on a single device.
pub struct GmpGroupState {
    inner: MemberState,
}

impl GmpGroupState {
    fn new_non_member() -> GmpGroupState {
        GmpGroupState { inner: MemberState::NonMember }
    }
}

/// The result of joining a multicast group.
#[cfg_attr(test, derive(Debug, Eq, PartialEq))]
pub enum GroupJoinResult {
    /// The group was newly joined.
    Joined,
    /// The group was already joined; its join count was incremented.
    AlreadyMember,
}

/// The result of leaving a multicast group.
#[cfg_attr(test, derive(Debug, Eq, PartialEq))]
pub enum GroupLeaveResult {
    /// The last local join was released and the group was left.
    Left,
    /// Local joins remain, so the group is still a member.
    StillMember,
    /// The group was not joined to begin with.
    NotMember,
}

/// A timer ID for a GMP to send a delayed report for a group.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct GmpDelayedReportTimerId<A: IpAddress, DeviceId> {
    pub(crate) device: DeviceId,
    pub(crate) group_addr: MulticastAddr<A>,
}

/// The execution context for a group management protocol.
///
/// The implementing protocol supplies the transmit capability and the
/// policy knobs; clock, timers, and randomness come from the
/// non-synchronized context `C`.
pub trait GmpContext<A: IpAddress, C>: IpDeviceIdContext
where
    C: RngContext + TimerContext<Self::TimerId>,
{
    /// The protocol's timer ID type, which the engine's delayed-report
    /// timers convert into.
    type TimerId: Clone + From<GmpDelayedReportTimerId<A, Self::DeviceId>>;

    /// Gets the group membership state for `device`.
    fn get_gmp_state_with(&self, device: Self::DeviceId) -> &MulticastGroupSet<A, GmpGroupState>;

    /// Gets the group membership state for `device`, mutably.
    fn get_gmp_state_mut_with(
        &mut self,
        device: Self::DeviceId,
    ) -> &mut MulticastGroupSet<A, GmpGroupState>;

    /// Is the protocol disabled on `device`?
    ///
    /// While disabled, joins are still recorded but nothing is transmitted
    /// and no timers are scheduled.
    fn gmp_disabled(&self, device: Self::DeviceId) -> bool;

    /// Must membership in `group_addr` be announced to routers?
    ///
    /// Membership in the all-nodes group is tracked but never announced
    /// (every host is a member by definition).
    fn should_perform_gmp(&self, group_addr: MulticastAddr<A>) -> bool;

    /// The upper bound on the random delay before an unsolicited report's
    /// repeat transmission.
    fn max_unsolicited_report_delay(&self, device: Self::DeviceId) -> Duration;

    /// Sends a membership report for `group_addr` on `device`.
    fn send_report(&mut self, ctx: &mut C, device: Self::DeviceId, group_addr: MulticastAddr<A>);

    /// Sends a leave message for `group_addr` on `device`.
    fn send_leave(&mut self, ctx: &mut C, device: Self::DeviceId, group_addr: MulticastAddr<A>);
}

/// An implementation of a group management protocol's group bookkeeping.
///
/// `GmpHandler<A, C>` is implemented for any type which implements
/// [`GmpContext<A, C>`].
pub trait GmpHandler<A: IpAddress, C>: IpDeviceIdContext {
    /// Joins `group_addr` on `device`.
    ///
    /// Only the first of a series of nested joins sends an unsolicited
    /// report; later joins merely increment the group's join count.
    fn gmp_join_group(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: MulticastAddr<A>,
    ) -> GroupJoinResult;

    /// Leaves `group_addr` on `device`.
    ///
    /// Only the release of the last outstanding join transmits a leave
    /// message, and only if this host sent the most recent report for the
    /// group.
    fn gmp_leave_group(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: MulticastAddr<A>,
    ) -> GroupLeaveResult;

    /// Handles a membership query for `group_addr` with the given maximum
    /// response time.
    ///
    /// An unspecified `group_addr` is a general query and applies to every
    /// joined group.
    fn gmp_handle_query(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: A,
        max_response_time: Duration,
    );

    /// Handles a membership report for `group_addr` observed from another
    /// host on the link.
    fn gmp_handle_report(&mut self, ctx: &mut C, device: Self::DeviceId, group_addr: MulticastAddr<A>);

    /// Starts announcing membership in every joined group that is not
    /// currently announced, as when the interface becomes enabled.
    fn gmp_initialize_groups(&mut self, ctx: &mut C, device: Self::DeviceId);

    /// Stops announcing membership in every group without releasing local
    /// joins, as when the interface is being disabled.
    ///
    /// Groups this host reported last for are left with a leave message.
    fn gmp_make_all_non_member(&mut self, ctx: &mut C, device: Self::DeviceId);
}

impl<A, C, SC> GmpHandler<A, C> for SC
where
    A: IpAddress,
    C: RngContext + TimerContext<SC::TimerId>,
    SC: GmpContext<A, C>,
{
    fn gmp_join_group(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: MulticastAddr<A>,
    ) -> GroupJoinResult {
        let perform = !self.gmp_disabled(device) && self.should_perform_gmp(group_addr);
        match self
            .get_gmp_state_mut_with(device)
            .join_group_with(group_addr, || (GmpGroupState::new_non_member(), ()))
        {
            InsertResult::Inserted(()) => {
                if perform {
                    init_member(self, ctx, device, group_addr);
                }
                GroupJoinResult::Joined
            }
            InsertResult::AlreadyPresent => GroupJoinResult::AlreadyMember,
        }
    }

    fn gmp_leave_group(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: MulticastAddr<A>,
    ) -> GroupLeaveResult {
        match self.get_gmp_state_mut_with(device).leave_group(group_addr) {
            RemoveResult::Removed(state) => {
                let last_reporter = match state.inner {
                    MemberState::NonMember => false,
                    MemberState::Delaying { last_reporter } => {
                        let _: Option<C::Instant> = ctx
                            .cancel_timer(GmpDelayedReportTimerId { device, group_addr }.into());
                        last_reporter
                    }
                    MemberState::Idle { last_reporter } => last_reporter,
                };
                if last_reporter {
                    self.send_leave(ctx, device, group_addr);
                }
                GroupLeaveResult::Left
            }
            RemoveResult::StillPresent => GroupLeaveResult::StillMember,
            RemoveResult::NotPresent => GroupLeaveResult::NotMember,
        }
    }

    fn gmp_handle_query(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: A,
        max_response_time: Duration,
    ) {
        let mut respond = |ctx: &mut C, group_addr: MulticastAddr<A>, state: &mut GmpGroupState| {
            match &mut state.inner {
                MemberState::NonMember => {}
                MemberState::Delaying { .. } => {
                    let timer_id: SC::TimerId =
                        GmpDelayedReportTimerId { device, group_addr }.into();
                    let delay = random_report_timeout(ctx.rng_mut(), max_response_time);
                    match ctx.scheduled_instant(timer_id.clone()) {
                        // Keep the pending report if it is already due
                        // sooner than the query demands.
                        Some(scheduled) if scheduled.duration_since(ctx.now()) <= delay => {}
                        _ => {
                            let _: Option<C::Instant> = ctx.schedule_timer(delay, timer_id);
                        }
                    }
                }
                MemberState::Idle { last_reporter } => {
                    let last_reporter = *last_reporter;
                    state.inner = MemberState::Delaying { last_reporter };
                    let delay = random_report_timeout(ctx.rng_mut(), max_response_time);
                    let _: Option<C::Instant> = ctx
                        .schedule_timer(delay, GmpDelayedReportTimerId { device, group_addr }.into());
                }
            }
        };

        if !group_addr.is_specified() {
            for (group_addr, state) in self.get_gmp_state_mut_with(device).iter_mut() {
                respond(ctx, *group_addr, state);
            }
        } else if let Some(group_addr) = MulticastAddr::new(group_addr) {
            if let Some(state) = self.get_gmp_state_mut_with(device).get_mut(&group_addr) {
                respond(ctx, group_addr, state);
            }
        }
    }

    fn gmp_handle_report(
        &mut self,
        ctx: &mut C,
        device: Self::DeviceId,
        group_addr: MulticastAddr<A>,
    ) {
        if let Some(state) = self.get_gmp_state_mut_with(device).get_mut(&group_addr) {
            if let MemberState::Delaying { .. } = state.inner {
                // Another member reported for the group; ours is no longer
                // needed.
                state.inner = MemberState::Idle { last_reporter: false };
                let _: Option<C::Instant> =
                    ctx.cancel_timer(GmpDelayedReportTimerId { device, group_addr }.into());
            }
        }
    }

    fn gmp_initialize_groups(&mut self, ctx: &mut C, device: Self::DeviceId) {
        if self.gmp_disabled(device) {
            return;
        }
        let groups = self
            .get_gmp_state_with(device)
            .iter()
            .filter_map(|(group_addr, state)| {
                matches!(state.inner, MemberState::NonMember).then(|| *group_addr)
            })
            .collect::<Vec<_>>();
        for group_addr in groups {
            if self.should_perform_gmp(group_addr) {
                init_member(self, ctx, device, group_addr);
            }
        }
    }

    fn gmp_make_all_non_member(&mut self, ctx: &mut C, device: Self::DeviceId) {
        let mut leave_groups = Vec::new();
        for (group_addr, state) in self.get_gmp_state_mut_with(device).iter_mut() {
            let last_reporter = match state.inner {
                MemberState::NonMember => continue,
                MemberState::Delaying { last_reporter } => {
                    let _: Option<C::Instant> = ctx.cancel_timer(
                        GmpDelayedReportTimerId { device, group_addr: *group_addr }.into(),
                    );
                    last_reporter
                }
                MemberState::Idle { last_reporter } => last_reporter,
            };
            state.inner = MemberState::NonMember;
            if last_reporter {
                leave_groups.push(*group_addr);
            }
        }
        for group_addr in leave_groups {
            self.send_leave(ctx, device, group_addr);
        }
    }
}

/// Performs the actions of becoming a reporting member: an unsolicited
/// report followed by a randomly delayed repeat transmission.
fn init_member<A, C, SC>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    group_addr: MulticastAddr<A>,
) where
    A: IpAddress,
    C: RngContext + TimerContext<SC::TimerId>,
    SC: GmpContext<A, C>,
{
    if let Some(state) = sync_ctx.get_gmp_state_mut_with(device).get_mut(&group_addr) {
        state.inner = MemberState::Delaying { last_reporter: true };
    }
    let max_delay = sync_ctx.max_unsolicited_report_delay(device);
    let delay = random_report_timeout(ctx.rng_mut(), max_delay);
    let _: Option<C::Instant> =
        ctx.schedule_timer(delay, GmpDelayedReportTimerId { device, group_addr }.into());
    sync_ctx.send_report(ctx, device, group_addr);
}

/// Handles a delayed report timer firing: the pending report is transmitted
/// and the group settles into the idle state.
pub fn handle_delayed_report_timer<A, C, SC>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    GmpDelayedReportTimerId { device, group_addr }: GmpDelayedReportTimerId<A, SC::DeviceId>,
) where
    A: IpAddress,
    C: RngContext + TimerContext<SC::TimerId>,
    SC: GmpContext<A, C>,
{
    let send = match sync_ctx.get_gmp_state_mut_with(device).get_mut(&group_addr) {
        Some(state) => match state.inner {
            MemberState::Delaying { .. } => {
                state.inner = MemberState::Idle { last_reporter: true };
                true
            }
            MemberState::NonMember | MemberState::Idle { .. } => false,
        },
        None => false,
    };
    if send {
        sync_ctx.send_report(ctx, device, group_addr);
    }
}

/// Computes a uniformly random delay in `[0, max_resp_time]`, in whole
/// milliseconds.
pub(crate) fn random_report_timeout<R: Rng>(rng: &mut R, max_resp_time: Duration) -> Duration {
    Duration::from_millis(rng.gen_range(0..=max_resp_time.as_millis() as u64))
}
