use crate::guess::{ConntrackStatus, GuessPhase, GuessWhat};
use crate::map::GuessMap;
use crate::memory::ReadMemory;
use crate::memory::layout::sizes;

use super::{Attempt, ProbeOutcome, TaskContext, at, read_u32};

/// Probe a `struct nf_conn` at `ct` for the field targeted by the
/// conntrack record.
///
/// The namespace inode offset is not searched here: it is carried over from
/// the socket calibration and only read through the discovered pointer.
pub fn guess_conntrack_offsets<R: ReadMemory + ?Sized>(
    map: &mut GuessMap<ConntrackStatus>,
    task: &TaskContext,
    ct: u64,
    reader: &R,
) -> ProbeOutcome {
    let Some(status) = map.lookup() else {
        return ProbeOutcome::Inapplicable;
    };
    if status.header.state != GuessPhase::Checking {
        return ProbeOutcome::Inapplicable;
    }
    if !status.header.proc.comm_equals(&task.comm) {
        return ProbeOutcome::WrongCaller;
    }
    let Some(what) = status.header.what().filter(|w| w.is_conntrack_field()) else {
        return ProbeOutcome::NotForUs;
    };

    let mut new_status = status;
    new_status.header.state = GuessPhase::Checked;
    new_status.header.err = false;
    new_status.header.proc = task.comm;

    let ino_offset = status.offsets.ino;
    let offsets = &mut new_status.offsets;
    let values = &mut new_status.values;
    let mut attempt = Attempt::new(reader);

    match what {
        GuessWhat::CtTupleOrigin => {
            let offset = &mut offsets.origin;
            if let Some(saddr) = read_u32(&mut attempt, ct, offset, sizes::CT_TUPLE_ORIGIN) {
                values.saddr = saddr;
            }
        }
        GuessWhat::CtTupleReply => {
            let offset = &mut offsets.reply;
            if let Some(daddr) = read_u32(&mut attempt, ct, offset, sizes::CT_TUPLE_REPLY) {
                values.daddr = daddr;
            }
        }
        GuessWhat::CtStatus => {
            if let Some(value) = read_u32(&mut attempt, ct, &mut offsets.status, sizes::CT_STATUS) {
                values.status = value;
            }
        }
        GuessWhat::CtNet => {
            let net = attempt
                .align(ct, &mut offsets.netns, sizes::CT_NET)
                .and_then(|offset| attempt.non_null_ptr(at(ct, offset)));
            if let Some(net) = net {
                if let Some(ino) = attempt.u32(at(net, ino_offset)) {
                    values.netns = ino;
                }
            }
        }
        _ => return ProbeOutcome::NotForUs,
    }

    new_status.header.err = attempt.fault;
    map.update(new_status);

    ProbeOutcome::Published {
        fault: attempt.fault,
    }
}
