//! Shared guess records exchanged between the probes and the driver
//!
//! Each record is the single entry of a one-slot map. The driver writes the
//! request half (`state`, `what`, the candidate offsets and the calibration
//! thread name); the probe answers by replacing the whole record with a
//! snapshot carrying the discovered values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::guess::{GuessPhase, GuessWhat, ProcessName};

/// Request/response header common to every guess record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuessHeader {
    pub state: GuessPhase,
    /// Raw `GuessWhat` discriminant; an unknown value is representable
    pub what: u32,
    /// Name of the calibration thread
    pub proc: ProcessName,
    /// Set when a read hit an invalid address during the last attempt
    pub err: bool,
}

impl GuessHeader {
    pub fn what(&self) -> Option<GuessWhat> {
        GuessWhat::from_u32(self.what)
    }

    /// Target a field and hand the record back to the probes
    pub fn arm(&mut self, what: GuessWhat) {
        self.what = what.as_u32();
        self.state = GuessPhase::Checking;
    }
}

/// Candidate offsets inside the connection structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TracerOffsets {
    pub saddr: u64,
    pub daddr: u64,
    pub sport: u64,
    pub dport: u64,
    pub netns: u64,
    pub ino: u64,
    pub family: u64,
    pub rtt: u64,
    pub rtt_var: u64,
    pub daddr_ipv6: u64,
    pub saddr_fl4: u64,
    pub daddr_fl4: u64,
    pub sport_fl4: u64,
    pub dport_fl4: u64,
    pub saddr_fl6: u64,
    pub daddr_fl6: u64,
    pub sport_fl6: u64,
    pub dport_fl6: u64,
    pub socket_sk: u64,
    pub sk_buff_sock: u64,
    pub sk_buff_transport_header: u64,
    pub sk_buff_head: u64,
}

/// Values read at the candidate offsets.
///
/// Addresses are kept in their in-memory (network order) representation;
/// ports are converted to host order; rtt values are unscaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TracerValues {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub family: u16,
    pub rtt: u32,
    pub rtt_var: u32,
    pub daddr_ipv6: [u32; 4],
    pub saddr_fl4: u32,
    pub daddr_fl4: u32,
    pub sport_fl4: u16,
    pub dport_fl4: u16,
    pub saddr_fl6: [u32; 4],
    pub daddr_fl6: [u32; 4],
    pub sport_fl6: u16,
    pub dport_fl6: u16,
    pub sport_via_sk: u16,
    pub dport_via_sk: u16,
    pub sport_via_sk_via_sk_buff: u16,
    pub dport_via_sk_via_sk_buff: u16,
    pub transport_header: u16,
    pub network_header: u16,
    pub mac_header: u16,
    pub sport_via_sk_buff: u16,
    pub dport_via_sk_buff: u16,
}

/// Guess record for the socket, flow and sk_buff structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TracerStatus {
    pub header: GuessHeader,
    pub offsets: TracerOffsets,
    pub values: TracerValues,
    /// Whether the TCP_INFO getsockopt path has fired at all
    pub tcp_info_kprobe_status: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConntrackOffsets {
    pub origin: u64,
    pub reply: u64,
    pub status: u64,
    pub netns: u64,
    pub ino: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConntrackValues {
    pub saddr: u32,
    pub daddr: u32,
    pub status: u32,
    pub netns: u32,
}

/// Guess record for `struct nf_conn`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConntrackStatus {
    pub header: GuessHeader,
    pub offsets: ConntrackOffsets,
    pub values: ConntrackValues,
}

/// Common view over both guess records, used by the driver
pub trait GuessRecord: Copy + Default + fmt::Debug {
    type Values: Copy + Default + PartialEq + fmt::Debug;
    type Offsets: Copy + Default + fmt::Debug;

    fn header(&self) -> &GuessHeader;
    fn header_mut(&mut self) -> &mut GuessHeader;
    fn values(&self) -> &Self::Values;
    fn offsets(&self) -> &Self::Offsets;
    fn offsets_mut(&mut self) -> &mut Self::Offsets;
}

impl GuessRecord for TracerStatus {
    type Values = TracerValues;
    type Offsets = TracerOffsets;

    fn header(&self) -> &GuessHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut GuessHeader {
        &mut self.header
    }

    fn values(&self) -> &TracerValues {
        &self.values
    }

    fn offsets(&self) -> &TracerOffsets {
        &self.offsets
    }

    fn offsets_mut(&mut self) -> &mut TracerOffsets {
        &mut self.offsets
    }
}

impl GuessRecord for ConntrackStatus {
    type Values = ConntrackValues;
    type Offsets = ConntrackOffsets;

    fn header(&self) -> &GuessHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut GuessHeader {
        &mut self.header
    }

    fn values(&self) -> &ConntrackValues {
        &self.values
    }

    fn offsets(&self) -> &ConntrackOffsets {
        &self.offsets
    }

    fn offsets_mut(&mut self) -> &mut ConntrackOffsets {
        &mut self.offsets
    }
}
