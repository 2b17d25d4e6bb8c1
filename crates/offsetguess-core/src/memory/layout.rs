//! Kernel layout constants used during offset guessing
//!
//! This module centralizes the fixed sizes and protocol constants the probes
//! rely on. Constants are organized by structure type.

/// Field widths, also used as the alignment stride of each candidate offset
pub mod sizes {
    pub const SADDR: u64 = 4;
    pub const DADDR: u64 = 4;
    pub const FAMILY: u64 = 2;
    pub const SPORT: u64 = 2;
    pub const DPORT: u64 = 2;
    /// `possible_net_t` is a single pointer
    pub const NETNS: u64 = 8;
    pub const NETNS_INO: u64 = 4;
    pub const RTT: u64 = 4;
    pub const RTT_VAR: u64 = 4;
    /// IPv6 addresses are aligned as an array of u32 words
    pub const DADDR_IPV6: u64 = 4;
    pub const IPV6_ADDR: usize = 16;

    pub const SADDR_FL4: u64 = 4;
    pub const DADDR_FL4: u64 = 4;
    pub const SPORT_FL4: u64 = 2;
    pub const DPORT_FL4: u64 = 2;
    pub const SADDR_FL6: u64 = 4;
    pub const DADDR_FL6: u64 = 4;
    pub const SPORT_FL6: u64 = 2;
    pub const DPORT_FL6: u64 = 2;

    pub const SOCKET_SK: u64 = 8;
    pub const SK_BUFF_SOCK: u64 = 8;
    pub const SK_BUFF_TRANSPORT_HEADER: u64 = 2;
    pub const SK_BUFF_HEAD: u64 = 8;

    pub const CT_TUPLE_ORIGIN: u64 = 4;
    pub const CT_TUPLE_REPLY: u64 = 4;
    pub const CT_STATUS: u64 = 4;
    pub const CT_NET: u64 = 8;

    /// Width of a kernel pointer
    pub const POINTER: usize = 8;
}

/// Address family values as stored in `skc_family`
pub mod family {
    pub const AF_INET: u16 = 2;
    pub const AF_INET6: u16 = 10;
}

/// `getsockopt` arguments that identify a TCP_INFO request
pub mod sockopt {
    pub const SOL_TCP: i32 = 6;
    pub const TCP_INFO: i32 = 11;
}

/// Round trip time fields of `struct tcp_sock`
pub mod rtt {
    /// `mdev_us` always follows `srtt_us`
    pub const VAR_DISTANCE: u64 = 4;
    /// `srtt_us` is stored left-shifted by 3
    pub const SRTT_SHIFT: u32 = 3;
    /// `mdev_us` is stored left-shifted by 2
    pub const MDEV_SHIFT: u32 = 2;
}

/// Header bookkeeping of `struct sk_buff`
pub mod skb {
    /// transport_header, network_header and mac_header are consecutive u16s
    pub const HEADER_WIDTH: u64 = 2;
    /// Ethernet header length between mac and network headers
    pub const MAC_TO_NETWORK: u16 = 14;
    /// IPv4 header length (no options) between network and transport headers
    pub const NETWORK_TO_TRANSPORT: u16 = 20;
}

/// Connection tracking constants
pub mod conntrack {
    /// sizeof(struct nf_conntrack_tuple)
    pub const TUPLE_SIZE: u64 = 40;
    /// IPS_CONFIRMED | IPS_SRC_NAT_DONE | IPS_DST_NAT_DONE
    pub const EXPECTED_STATUS: u32 = 0x188;
}

/// Task constants
pub mod task {
    /// Length of `task_struct->comm`
    pub const COMM_LEN: usize = 16;
}

/// Bounds on the work done per probe invocation
pub mod limits {
    /// Upper bound on memory reads in a single probe attempt
    pub const MAX_READS_PER_ATTEMPT: usize = 3;
    /// Capacity of the connect entry/return stash
    pub const CONNECT_STASH_CAPACITY: usize = 1024;
}
