use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

use crate::memory::layout::sizes;

/// Kernel structure a probe subject points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SubjectKind {
    #[strum(serialize = "struct sock")]
    Sock,
    #[strum(serialize = "struct socket")]
    Socket,
    #[strum(serialize = "struct flowi4")]
    FlowI4,
    #[strum(serialize = "struct flowi6")]
    FlowI6,
    #[strum(serialize = "struct sk_buff")]
    SkBuff,
    #[strum(serialize = "struct nf_conn")]
    NfConn,
}

/// The field currently being calibrated
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    FromRepr,
    IntoStaticStr,
    Display,
    EnumIter,
)]
#[repr(u32)]
pub enum GuessWhat {
    #[strum(serialize = "source address")]
    SAddr = 0,
    #[strum(serialize = "destination address")]
    DAddr = 1,
    #[strum(serialize = "family")]
    Family = 2,
    #[strum(serialize = "source port")]
    SPort = 3,
    #[strum(serialize = "destination port")]
    DPort = 4,
    #[strum(serialize = "network namespace")]
    NetNs = 5,
    #[strum(serialize = "round trip time")]
    Rtt = 6,
    #[strum(serialize = "destination address IPv6")]
    DAddrIpv6 = 7,

    // struct flowi4
    #[strum(serialize = "source address flowi4")]
    SAddrFl4 = 8,
    #[strum(serialize = "destination address flowi4")]
    DAddrFl4 = 9,
    #[strum(serialize = "source port flowi4")]
    SPortFl4 = 10,
    #[strum(serialize = "destination port flowi4")]
    DPortFl4 = 11,

    // struct flowi6
    #[strum(serialize = "source address flowi6")]
    SAddrFl6 = 12,
    #[strum(serialize = "destination address flowi6")]
    DAddrFl6 = 13,
    #[strum(serialize = "source port flowi6")]
    SPortFl6 = 14,
    #[strum(serialize = "destination port flowi6")]
    DPortFl6 = 15,

    #[strum(serialize = "sk field on struct socket")]
    SocketSk = 16,
    #[strum(serialize = "sk field on struct sk_buff")]
    SkBuffSock = 17,
    #[strum(serialize = "transport header field on struct sk_buff")]
    SkBuffTransportHeader = 18,
    #[strum(serialize = "head field on struct sk_buff")]
    SkBuffHead = 19,

    #[strum(serialize = "conntrack origin tuple")]
    CtTupleOrigin = 20,
    #[strum(serialize = "conntrack reply tuple")]
    CtTupleReply = 21,
    #[strum(serialize = "conntrack status")]
    CtStatus = 22,
    #[strum(serialize = "conntrack network namespace")]
    CtNet = 23,
}

impl GuessWhat {
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::from_repr(value)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Alignment stride used when advancing the candidate offset
    pub fn alignment(self) -> u64 {
        match self {
            Self::SAddr => sizes::SADDR,
            Self::DAddr => sizes::DADDR,
            Self::Family => sizes::FAMILY,
            Self::SPort => sizes::SPORT,
            Self::DPort => sizes::DPORT,
            Self::NetNs => sizes::NETNS,
            Self::Rtt => sizes::RTT,
            Self::DAddrIpv6 => sizes::DADDR_IPV6,
            Self::SAddrFl4 => sizes::SADDR_FL4,
            Self::DAddrFl4 => sizes::DADDR_FL4,
            Self::SPortFl4 => sizes::SPORT_FL4,
            Self::DPortFl4 => sizes::DPORT_FL4,
            Self::SAddrFl6 => sizes::SADDR_FL6,
            Self::DAddrFl6 => sizes::DADDR_FL6,
            Self::SPortFl6 => sizes::SPORT_FL6,
            Self::DPortFl6 => sizes::DPORT_FL6,
            Self::SocketSk => sizes::SOCKET_SK,
            Self::SkBuffSock => sizes::SK_BUFF_SOCK,
            Self::SkBuffTransportHeader => sizes::SK_BUFF_TRANSPORT_HEADER,
            Self::SkBuffHead => sizes::SK_BUFF_HEAD,
            Self::CtTupleOrigin => sizes::CT_TUPLE_ORIGIN,
            Self::CtTupleReply => sizes::CT_TUPLE_REPLY,
            Self::CtStatus => sizes::CT_STATUS,
            Self::CtNet => sizes::CT_NET,
        }
    }

    /// Structure the probe subject must point to for this field
    pub fn subject(self) -> SubjectKind {
        match self {
            Self::SAddr
            | Self::DAddr
            | Self::Family
            | Self::SPort
            | Self::DPort
            | Self::NetNs
            | Self::Rtt
            | Self::DAddrIpv6 => SubjectKind::Sock,
            Self::SAddrFl4 | Self::DAddrFl4 | Self::SPortFl4 | Self::DPortFl4 => {
                SubjectKind::FlowI4
            }
            Self::SAddrFl6 | Self::DAddrFl6 | Self::SPortFl6 | Self::DPortFl6 => {
                SubjectKind::FlowI6
            }
            Self::SocketSk => SubjectKind::Socket,
            Self::SkBuffSock | Self::SkBuffTransportHeader | Self::SkBuffHead => {
                SubjectKind::SkBuff
            }
            Self::CtTupleOrigin | Self::CtTupleReply | Self::CtStatus | Self::CtNet => {
                SubjectKind::NfConn
            }
        }
    }

    /// The three fields calibrated from the packet transmission event
    pub fn is_sk_buff_field(self) -> bool {
        matches!(
            self,
            Self::SkBuffSock | Self::SkBuffTransportHeader | Self::SkBuffHead
        )
    }

    pub fn is_conntrack_field(self) -> bool {
        matches!(
            self,
            Self::CtTupleOrigin | Self::CtTupleReply | Self::CtStatus | Self::CtNet
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_repr_roundtrip() {
        for what in GuessWhat::iter() {
            assert_eq!(GuessWhat::from_u32(what.as_u32()), Some(what));
        }
        assert_eq!(GuessWhat::from_u32(24), None);
    }

    #[test]
    fn test_alignment_is_power_of_two() {
        for what in GuessWhat::iter() {
            assert!(what.alignment().is_power_of_two(), "{what}");
        }
    }

    #[test]
    fn test_field_groups_are_disjoint() {
        for what in GuessWhat::iter() {
            assert!(!(what.is_sk_buff_field() && what.is_conntrack_field()));
            assert_eq!(what.is_sk_buff_field(), what.subject() == SubjectKind::SkBuff);
            assert_eq!(what.is_conntrack_field(), what.subject() == SubjectKind::NfConn);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(GuessWhat::SocketSk.to_string(), "sk field on struct socket");
        assert_eq!(SubjectKind::FlowI6.to_string(), "struct flowi6");
    }
}
