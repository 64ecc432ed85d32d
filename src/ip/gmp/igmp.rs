// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Internet Group Management Protocol (IGMP).
//!
//! The host side of IGMPv2 as defined by [RFC 2236], including backwards
//! compatibility with IGMPv1 routers: while a query with a zero max
//! response time has been heard recently, reports are sent in the version 1
//! format and leave messages are suppressed.
//!
//! The group state machine itself lives in the parent module; this module
//! binds it to IPv4 by building and parsing IGMP messages, dispatching
//! received packets, and maintaining the IGMPv1-router-present flag and its
//! timeout.
//!
//! [RFC 2236]: https://datatracker.ietf.org/doc/html/rfc2236

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use log::debug;
use net_types::ip::{Ipv4, Ipv4Addr};
use net_types::{MulticastAddr, Witness as _};
use thiserror::Error;
use zerocopy::ByteSlice;

use crate::context::{
    CounterContext, FrameContext, RngContext, SendFrameError, StateContext, TimerContext,
    TimerHandler,
};
use crate::ip::gmp::{
    self, GmpContext, GmpDelayedReportTimerId, GmpGroupState, GmpHandler as _, GroupJoinResult,
    GroupLeaveResult, MulticastGroupSet,
};
use crate::ip::IpDeviceIdContext;
use crate::wire::igmp::{IgmpMessageType, IgmpPacket, IgmpPacketBuilder, MESSAGE_LEN};

/// The maximum delay between the transmission of an unsolicited membership
/// report and its repeat transmission (RFC 2236 section 8.10).
pub const IGMP_MAX_UNSOLICITED_REPORT_DELAY: Duration = Duration::from_secs(10);

/// How long an IGMPv1 router is considered present after the last version 1
/// query was heard (RFC 2236 section 8.11).
const IGMP_V1_ROUTER_PRESENT_TIMEOUT: Duration = Duration::from_secs(400);

/// The effective max response time of an IGMPv1 query, whose wire field
/// carries zero (RFC 2236 section 4).
const IGMP_V1_MAX_RESP_TIME: Duration = Duration::from_secs(10);

/// The destination of leave group messages (RFC 2236 section 6).
// 224.0.2.0 is inside the multicast subnet.
const IGMP_ALL_ROUTERS_GROUP: MulticastAddr<Ipv4Addr> =
    unsafe { MulticastAddr::new_unchecked(Ipv4Addr::new([224, 0, 2, 0])) };

/// Configuration for IGMP on an interface.
#[derive(Clone)]
pub struct IgmpConfiguration {
    /// Whether IGMP is performed on the interface.
    ///
    /// When enabled, membership reports and leave messages are transmitted
    /// for joined groups and incoming IGMP packets are acted upon. Joins
    /// are tracked either way.
    ///
    /// Default: `false`.
    pub enabled: bool,
}

impl Default for IgmpConfiguration {
    fn default() -> IgmpConfiguration {
        IgmpConfiguration { enabled: false }
    }
}

/// The per-interface state for IGMP.
pub struct IgmpInterfaceState {
    config: IgmpConfiguration,
    // Read through a shared reference on the transmit hot path; written
    // only under the interface serialization, together with (re)scheduling
    // the timer that clears it.
    v1_router_present: AtomicBool,
    groups: MulticastGroupSet<Ipv4Addr, GmpGroupState>,
}

impl IgmpInterfaceState {
    /// Creates state for an interface with the given configuration.
    pub fn with_config(config: IgmpConfiguration) -> IgmpInterfaceState {
        IgmpInterfaceState {
            config,
            v1_router_present: AtomicBool::new(false),
            groups: MulticastGroupSet::default(),
        }
    }

    /// Is IGMP enabled on the interface?
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Has an IGMPv1 router been heard on the link recently?
    pub fn v1_router_present(&self) -> bool {
        self.v1_router_present.load(Ordering::Acquire)
    }

    /// Returns whether `group_addr` is joined locally on the interface.
    pub fn is_in_group(&self, group_addr: MulticastAddr<Ipv4Addr>) -> bool {
        self.groups.contains(&group_addr)
    }

    fn set_v1_router_present(&self, present: bool) {
        self.v1_router_present.store(present, Ordering::Release);
    }
}

impl Default for IgmpInterfaceState {
    fn default() -> IgmpInterfaceState {
        IgmpInterfaceState::with_config(IgmpConfiguration::default())
    }
}

/// A timer ID for IGMP.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum IgmpTimerId<DeviceId> {
    /// A delayed membership report is due for a group.
    ReportDelay(GmpDelayedReportTimerId<Ipv4Addr, DeviceId>),
    /// Clears the IGMPv1-router-present flag when it fires.
    V1RouterPresent {
        /// The device whose flag to clear.
        device: DeviceId,
    },
}

impl<DeviceId> From<GmpDelayedReportTimerId<Ipv4Addr, DeviceId>> for IgmpTimerId<DeviceId> {
    fn from(id: GmpDelayedReportTimerId<Ipv4Addr, DeviceId>) -> IgmpTimerId<DeviceId> {
        IgmpTimerId::ReportDelay(id)
    }
}

/// Errors surfaced by IGMP operations.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum IgmpError {
    /// The group is not joined on the interface.
    #[error("{addr} is not a member on the interface")]
    NotAMember {
        /// The group that was not a member.
        addr: Ipv4Addr,
    },
    /// The message could not be transmitted.
    #[error("failed to send IGMP message")]
    SendFailure,
}

/// Metadata for an outgoing IGMP frame.
///
/// The 8-byte IGMP message body is handed to [`FrameContext::send_frame`]
/// together with this metadata. The IPv4 layer must encapsulate the body
/// with protocol number [`crate::wire::igmp::IPV4_PROTO_IGMP`], a TTL of
/// [`crate::wire::igmp::IGMP_TTL`], the Router Alert option (RFC 2236
/// section 2; serialized by [`crate::wire::ipv4`]), and destination
/// `dst_ip`; the link layer sends to the Ethernet address the destination
/// maps onto (01:00:5E followed by the low 23 bits of `dst_ip`).
// TODO: select a configured address of the interface as the source address
// instead of the unspecified address, as RFC 2236 requires.
#[cfg_attr(test, derive(Debug, Eq, PartialEq))]
pub struct IgmpPacketMetadata<DeviceId> {
    /// The device the frame is sent on.
    pub device: DeviceId,
    /// The destination address of the frame.
    pub dst_ip: MulticastAddr<Ipv4Addr>,
}

impl<DeviceId> IgmpPacketMetadata<DeviceId> {
    fn new(device: DeviceId, dst_ip: MulticastAddr<Ipv4Addr>) -> IgmpPacketMetadata<DeviceId> {
        IgmpPacketMetadata { device, dst_ip }
    }
}

/// The non-synchronized execution context for IGMP.
pub trait IgmpNonSyncContext<DeviceId>:
    RngContext + TimerContext<IgmpTimerId<DeviceId>> + CounterContext
{
}
impl<DeviceId, C: RngContext + TimerContext<IgmpTimerId<DeviceId>> + CounterContext>
    IgmpNonSyncContext<DeviceId> for C
{
}

/// The execution context for IGMP.
pub trait IgmpContext<C: IgmpNonSyncContext<Self::DeviceId>>:
    IpDeviceIdContext
    + StateContext<C, IgmpInterfaceState, <Self as IpDeviceIdContext>::DeviceId>
    + FrameContext<C, IgmpPacketMetadata<<Self as IpDeviceIdContext>::DeviceId>>
{
}
impl<
        C: IgmpNonSyncContext<SC::DeviceId>,
        SC: IpDeviceIdContext
            + StateContext<C, IgmpInterfaceState, <SC as IpDeviceIdContext>::DeviceId>
            + FrameContext<C, IgmpPacketMetadata<<SC as IpDeviceIdContext>::DeviceId>>,
    > IgmpContext<C> for SC
{
}

impl<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>> GmpContext<Ipv4Addr, C> for SC {
    type TimerId = IgmpTimerId<SC::DeviceId>;

    fn get_gmp_state_with(
        &self,
        device: SC::DeviceId,
    ) -> &MulticastGroupSet<Ipv4Addr, GmpGroupState> {
        &self.get_state_with(device).groups
    }

    fn get_gmp_state_mut_with(
        &mut self,
        device: SC::DeviceId,
    ) -> &mut MulticastGroupSet<Ipv4Addr, GmpGroupState> {
        &mut self.get_state_mut_with(device).groups
    }

    fn gmp_disabled(&self, device: SC::DeviceId) -> bool {
        !self.get_state_with(device).enabled()
    }

    fn should_perform_gmp(&self, group_addr: MulticastAddr<Ipv4Addr>) -> bool {
        group_addr != Ipv4::ALL_SYSTEMS_MULTICAST_ADDRESS
    }

    fn max_unsolicited_report_delay(&self, _device: SC::DeviceId) -> Duration {
        IGMP_MAX_UNSOLICITED_REPORT_DELAY
    }

    fn send_report(
        &mut self,
        ctx: &mut C,
        device: SC::DeviceId,
        group_addr: MulticastAddr<Ipv4Addr>,
    ) {
        // An IGMPv1 router will not pay attention to version 2 reports
        // (RFC 2236 section 4).
        let msg_type = if self.get_state_with(device).v1_router_present() {
            IgmpMessageType::V1MembershipReport
        } else {
            IgmpMessageType::V2MembershipReport
        };
        if let Err(err) = send_igmp_message(self, ctx, device, group_addr, group_addr, msg_type) {
            debug!("failed to send IGMP membership report for {}: {}", group_addr, err);
        }
    }

    fn send_leave(
        &mut self,
        ctx: &mut C,
        device: SC::DeviceId,
        group_addr: MulticastAddr<Ipv4Addr>,
    ) {
        // RFC 2236 section 6: "If the interface state says the Querier is
        // running IGMPv1, this action SHOULD be skipped."
        if self.get_state_with(device).v1_router_present() {
            return;
        }
        if let Err(err) = send_igmp_message(
            self,
            ctx,
            device,
            IGMP_ALL_ROUTERS_GROUP,
            group_addr,
            IgmpMessageType::LeaveGroup,
        ) {
            debug!("failed to send IGMP leave group for {}: {}", group_addr, err);
        }
    }
}

fn send_igmp_message<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    dst_ip: MulticastAddr<Ipv4Addr>,
    group_addr: MulticastAddr<Ipv4Addr>,
    msg_type: IgmpMessageType,
) -> Result<(), IgmpError> {
    let mut body = [0u8; MESSAGE_LEN];
    IgmpPacketBuilder::new(msg_type, group_addr.get()).serialize(&mut body[..]);
    match sync_ctx.send_frame(ctx, IgmpPacketMetadata::new(device, dst_ip), &body[..]) {
        Ok(()) => {
            ctx.increment_counter(match msg_type {
                IgmpMessageType::V1MembershipReport => "igmp::tx_v1_membership_report",
                IgmpMessageType::V2MembershipReport => "igmp::tx_v2_membership_report",
                IgmpMessageType::LeaveGroup => "igmp::tx_leave_group",
                IgmpMessageType::MembershipQuery => {
                    unreachable!("hosts do not transmit membership queries")
                }
            });
            Ok(())
        }
        Err(SendFrameError) => {
            ctx.increment_counter("igmp::tx_dropped");
            Err(IgmpError::SendFailure)
        }
    }
}

impl<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>
    TimerHandler<C, IgmpTimerId<SC::DeviceId>> for SC
{
    fn handle_timer(&mut self, ctx: &mut C, id: IgmpTimerId<SC::DeviceId>) {
        match id {
            IgmpTimerId::ReportDelay(id) => gmp::handle_delayed_report_timer(self, ctx, id),
            IgmpTimerId::V1RouterPresent { device } => {
                self.get_state_with(device).set_v1_router_present(false);
            }
        }
    }
}

/// Receives an IGMP packet addressed to `device`.
///
/// `buffer` holds the IPv4 payload. Malformed and unrecognized packets are
/// silently dropped apart from statistics counters, as RFC 2236 section 2.1
/// directs.
pub fn receive_igmp_packet<
    B: ByteSlice,
    C: IgmpNonSyncContext<SC::DeviceId>,
    SC: IgmpContext<C>,
>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    buffer: B,
) {
    let packet = match IgmpPacket::parse(buffer) {
        Ok(packet) => packet,
        Err(err) => {
            ctx.increment_counter("igmp::rx_invalid");
            debug!("dropping malformed IGMP packet: {}", err);
            return;
        }
    };
    if !packet.verify_checksum() {
        ctx.increment_counter("igmp::rx_checksum_error");
        debug!("dropping IGMP packet with invalid checksum");
        return;
    }
    match packet.msg_type() {
        Ok(IgmpMessageType::MembershipQuery) => {
            ctx.increment_counter("igmp::rx_membership_query");
            handle_membership_query(
                sync_ctx,
                ctx,
                device,
                packet.group_addr(),
                packet.max_response_time(),
            );
        }
        Ok(IgmpMessageType::V1MembershipReport) => {
            ctx.increment_counter("igmp::rx_v1_membership_report");
            handle_membership_report(sync_ctx, ctx, device, packet.group_addr());
        }
        Ok(IgmpMessageType::V2MembershipReport) => {
            ctx.increment_counter("igmp::rx_v2_membership_report");
            handle_membership_report(sync_ctx, ctx, device, packet.group_addr());
        }
        Ok(IgmpMessageType::LeaveGroup) => {
            // Hosts do not process leave messages (RFC 2236 section 6).
            ctx.increment_counter("igmp::rx_leave_group");
        }
        Err(msg_type) => {
            // RFC 2236 section 2.1: "Unrecognized message types should be
            // silently ignored."
            ctx.increment_counter("igmp::rx_unrecognized");
            debug!("ignoring IGMP message with unrecognized type {:#x}", msg_type);
        }
    }
}

fn handle_membership_query<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    group_addr: Ipv4Addr,
    mut max_response_time: Duration,
) {
    // A zero max response time identifies an IGMPv1 router (RFC 2236
    // section 4): note its presence and interpret the field as the IGMPv1
    // value of 10 seconds.
    if max_response_time == Duration::ZERO && sync_ctx.get_state_with(device).enabled() {
        let _: Option<C::Instant> = ctx
            .schedule_timer(IGMP_V1_ROUTER_PRESENT_TIMEOUT, IgmpTimerId::V1RouterPresent { device });
        sync_ctx.get_state_with(device).set_v1_router_present(true);
        max_response_time = IGMP_V1_MAX_RESP_TIME;
    }
    sync_ctx.gmp_handle_query(ctx, device, group_addr, max_response_time);
}

fn handle_membership_report<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    group_addr: Ipv4Addr,
) {
    if let Some(group_addr) = MulticastAddr::new(group_addr) {
        sync_ctx.gmp_handle_report(ctx, device, group_addr);
    }
}

/// Joins `group_addr` on `device`.
///
/// The first local join of a group transmits an unsolicited membership
/// report and schedules its delayed repeat; nested joins only increment the
/// group's join count. While the interface is disabled the join is recorded
/// but nothing is transmitted.
pub fn join_group<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    group_addr: MulticastAddr<Ipv4Addr>,
) -> GroupJoinResult {
    sync_ctx.gmp_join_group(ctx, device, group_addr)
}

/// Leaves `group_addr` on `device`.
///
/// The release of the last outstanding join transmits a leave message if
/// this host sent the most recent report for the group (and no IGMPv1
/// router is present). Fails with [`IgmpError::NotAMember`] if the group is
/// not joined.
pub fn leave_group<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
    group_addr: MulticastAddr<Ipv4Addr>,
) -> Result<(), IgmpError> {
    match sync_ctx.gmp_leave_group(ctx, device, group_addr) {
        GroupLeaveResult::Left | GroupLeaveResult::StillMember => Ok(()),
        GroupLeaveResult::NotMember => Err(IgmpError::NotAMember { addr: group_addr.get() }),
    }
}

/// Starts announcing membership in every joined group on `device`, as when
/// the interface becomes enabled.
pub fn initialize_groups<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
) {
    sync_ctx.gmp_initialize_groups(ctx, device)
}

/// Stops announcing membership in every group on `device` without releasing
/// local joins, as when the interface is being disabled.
pub fn soft_leave_all<C: IgmpNonSyncContext<SC::DeviceId>, SC: IgmpContext<C>>(
    sync_ctx: &mut SC,
    ctx: &mut C,
    device: SC::DeviceId,
) {
    sync_ctx.gmp_make_all_non_member(ctx, device)
}

/// Cancels all of `device`'s IGMP timers.
///
/// Called when the interface is torn down; every group must have been moved
/// out of the member states first, e.g. via [`soft_leave_all`].
pub fn deinitialize<DeviceId: PartialEq, C: IgmpNonSyncContext<DeviceId>>(
    ctx: &mut C,
    device: DeviceId,
) {
    ctx.cancel_timers_with(|id| match id {
        IgmpTimerId::ReportDelay(GmpDelayedReportTimerId { device: d, group_addr: _ }) => {
            *d == device
        }
        IgmpTimerId::V1RouterPresent { device: d } => *d == device,
    });
}
