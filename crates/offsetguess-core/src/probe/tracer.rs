use tracing::trace;

use crate::guess::{GuessPhase, GuessWhat, TracerStatus};
use crate::map::GuessMap;
use crate::memory::ReadMemory;
use crate::memory::layout::{family, rtt, sizes, skb};

use super::{Attempt, ProbeOutcome, TaskContext, at, read_port, read_u32};

/// Probe `subject` for the field targeted by the tracer record.
///
/// `subject` is the base address of the structure matching the target field
/// (`struct sock`, `struct socket`, a flow descriptor or a `struct sk_buff`);
/// the hook gates make sure only matching subjects get here.
pub fn guess_tracer_offsets<R: ReadMemory + ?Sized>(
    map: &mut GuessMap<TracerStatus>,
    task: &TaskContext,
    subject: u64,
    reader: &R,
) -> ProbeOutcome {
    let Some(status) = map.lookup() else {
        return ProbeOutcome::Inapplicable;
    };
    if status.header.state != GuessPhase::Checking {
        return ProbeOutcome::Inapplicable;
    }

    // Only the calibration thread may drive the experiment; every other
    // process on the host hits the same hooks.
    if !status.header.proc.comm_equals(&task.comm) {
        return ProbeOutcome::WrongCaller;
    }

    let Some(what) = status.header.what() else {
        return ProbeOutcome::NotForUs;
    };

    let mut new_status = status;
    new_status.header.state = GuessPhase::Checked;
    new_status.header.err = false;
    new_status.header.proc = task.comm;

    let old = &status.offsets;
    let offsets = &mut new_status.offsets;
    let values = &mut new_status.values;
    let mut attempt = Attempt::new(reader);

    match what {
        GuessWhat::SAddr => {
            if let Some(value) = read_u32(&mut attempt, subject, &mut offsets.saddr, sizes::SADDR) {
                values.saddr = value;
            }
        }
        GuessWhat::DAddr => {
            if let Some(value) = read_u32(&mut attempt, subject, &mut offsets.daddr, sizes::DADDR) {
                values.daddr = value;
            }
        }
        GuessWhat::Family => {
            if let Some(offset) = attempt.align(subject, &mut offsets.family, sizes::FAMILY) {
                if let Some(value) = attempt.u16(at(subject, offset)) {
                    values.family = value;
                }
            }
        }
        GuessWhat::SPort => {
            let offset = &mut offsets.sport;
            if let Some(value) = read_port(&mut attempt, subject, offset, sizes::SPORT) {
                values.sport = value;
            }
        }
        GuessWhat::DPort => {
            let offset = &mut offsets.dport;
            if let Some(value) = read_port(&mut attempt, subject, offset, sizes::DPORT) {
                values.dport = value;
            }
        }
        GuessWhat::SAddrFl4 => {
            let offset = &mut offsets.saddr_fl4;
            if let Some(value) = read_u32(&mut attempt, subject, offset, sizes::SADDR_FL4) {
                values.saddr_fl4 = value;
            }
        }
        GuessWhat::DAddrFl4 => {
            let offset = &mut offsets.daddr_fl4;
            if let Some(value) = read_u32(&mut attempt, subject, offset, sizes::DADDR_FL4) {
                values.daddr_fl4 = value;
            }
        }
        GuessWhat::SPortFl4 => {
            let offset = &mut offsets.sport_fl4;
            if let Some(value) = read_port(&mut attempt, subject, offset, sizes::SPORT_FL4) {
                values.sport_fl4 = value;
            }
        }
        GuessWhat::DPortFl4 => {
            let offset = &mut offsets.dport_fl4;
            if let Some(value) = read_port(&mut attempt, subject, offset, sizes::DPORT_FL4) {
                values.dport_fl4 = value;
            }
        }
        GuessWhat::SAddrFl6 => {
            if let Some(offset) = attempt.align(subject, &mut offsets.saddr_fl6, sizes::SADDR_FL6) {
                if let Some(value) = attempt.ipv6(at(subject, offset)) {
                    values.saddr_fl6 = value;
                }
            }
        }
        GuessWhat::DAddrFl6 => {
            if let Some(offset) = attempt.align(subject, &mut offsets.daddr_fl6, sizes::DADDR_FL6) {
                if let Some(value) = attempt.ipv6(at(subject, offset)) {
                    values.daddr_fl6 = value;
                }
            }
        }
        GuessWhat::SPortFl6 => {
            let offset = &mut offsets.sport_fl6;
            if let Some(value) = read_port(&mut attempt, subject, offset, sizes::SPORT_FL6) {
                values.sport_fl6 = value;
            }
        }
        GuessWhat::DPortFl6 => {
            let offset = &mut offsets.dport_fl6;
            if let Some(value) = read_port(&mut attempt, subject, offset, sizes::DPORT_FL6) {
                values.dport_fl6 = value;
            }
        }
        GuessWhat::NetNs => {
            // A null or unreadable skc_net means this is not the namespace
            // pointer; the driver moves on to the next netns offset.
            let net = attempt
                .align(subject, &mut offsets.netns, sizes::NETNS)
                .and_then(|offset| attempt.non_null_ptr(at(subject, offset)));
            if let Some(net) = net {
                if let Some(offset) = attempt.align(net, &mut offsets.ino, sizes::NETNS_INO) {
                    if let Some(ino) = attempt.u32(at(net, offset)) {
                        values.netns = ino;
                    }
                }
            }
        }
        GuessWhat::Rtt => {
            if let Some(offset) = attempt.align(subject, &mut offsets.rtt, sizes::RTT) {
                if let Some(srtt) = attempt.u32(at(subject, offset)) {
                    values.rtt = srtt >> rtt::SRTT_SHIFT;
                }
            }
            // srtt_us and mdev_us are always adjacent
            if let Some(mut candidate) = attempt.advance(offsets.rtt, rtt::VAR_DISTANCE) {
                if let Some(offset) = attempt.align(subject, &mut candidate, sizes::RTT_VAR) {
                    offsets.rtt_var = offset;
                    if let Some(mdev) = attempt.u32(at(subject, offset)) {
                        values.rtt_var = mdev >> rtt::MDEV_SHIFT;
                    }
                }
            }
        }
        GuessWhat::DAddrIpv6 => {
            // The live connection may be IPv4; reading its address would
            // produce a false positive.
            let sock_family = attempt.u16(at(subject, old.family));
            if sock_family != Some(family::AF_INET6) {
                trace!(
                    "skipping {} probe: family {:?} at offset {}",
                    what, sock_family, old.family
                );
                return ProbeOutcome::Skipped;
            }
            let offset = &mut offsets.daddr_ipv6;
            if let Some(offset) = attempt.align(subject, offset, sizes::DADDR_IPV6) {
                if let Some(value) = attempt.ipv6(at(subject, offset)) {
                    values.daddr_ipv6 = value;
                }
            }
        }
        GuessWhat::SocketSk => {
            // subject is a struct socket; the field under test points to
            // the struct sock whose port offsets are already known
            let sk = attempt
                .align(subject, &mut offsets.socket_sk, sizes::SOCKET_SK)
                .and_then(|offset| attempt.non_null_ptr(at(subject, offset)));
            if let Some(sk) = sk {
                if let Some(sport) = attempt.port(at(sk, old.sport)) {
                    values.sport_via_sk = sport;
                }
                if let Some(dport) = attempt.port(at(sk, old.dport)) {
                    values.dport_via_sk = dport;
                }
            }
        }
        GuessWhat::SkBuffSock => {
            let sk = attempt
                .align(subject, &mut offsets.sk_buff_sock, sizes::SK_BUFF_SOCK)
                .and_then(|offset| attempt.non_null_ptr(at(subject, offset)));
            if let Some(sk) = sk {
                if let Some(sport) = attempt.port(at(sk, old.sport)) {
                    values.sport_via_sk_via_sk_buff = sport;
                }
                if let Some(dport) = attempt.port(at(sk, old.dport)) {
                    values.dport_via_sk_via_sk_buff = dport;
                }
            }
        }
        GuessWhat::SkBuffTransportHeader => {
            let offset = attempt.align(
                subject,
                &mut offsets.sk_buff_transport_header,
                sizes::SK_BUFF_TRANSPORT_HEADER,
            );
            if let Some(offset) = offset {
                if let Some(transport) = attempt.u16(at(subject, offset)) {
                    values.transport_header = transport;
                }
                if let Some(network) = attempt.advance(offset, skb::HEADER_WIDTH) {
                    if let Some(value) = attempt.u16(at(subject, network)) {
                        values.network_header = value;
                    }
                    if let Some(mac) = attempt.advance(network, skb::HEADER_WIDTH) {
                        if let Some(value) = attempt.u16(at(subject, mac)) {
                            values.mac_header = value;
                        }
                    }
                }
            }
        }
        GuessWhat::SkBuffHead => {
            let head = attempt
                .align(subject, &mut offsets.sk_buff_head, sizes::SK_BUFF_HEAD)
                .and_then(|offset| attempt.non_null_ptr(at(subject, offset)));
            if let Some(head) = head {
                // UDP and TCP both start with source then destination port
                let transport = at(head, u64::from(status.values.transport_header));
                if let Some(sport) = attempt.port(transport) {
                    values.sport_via_sk_buff = sport;
                }
                if let Some(dport) = attempt.port(at(transport, skb::HEADER_WIDTH)) {
                    values.dport_via_sk_buff = dport;
                }
            }
        }
        GuessWhat::CtTupleOrigin
        | GuessWhat::CtTupleReply
        | GuessWhat::CtStatus
        | GuessWhat::CtNet => {
            return ProbeOutcome::NotForUs;
        }
    }

    new_status.header.err = attempt.fault;
    map.update(new_status);

    ProbeOutcome::Published {
        fault: attempt.fault,
    }
}
