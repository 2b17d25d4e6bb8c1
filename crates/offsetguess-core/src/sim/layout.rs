use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::guess::GuessWhat;
use crate::memory::layout::skb::{MAC_TO_NETWORK, NETWORK_TO_TRANSPORT};
use crate::memory::layout::sizes;

/// Largest object the simulated host will map
pub const MAX_OBJECT_SIZE: u64 = 0x8000;

/// `struct tcp_sock`, flattened down to the fields the probes touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SockLayout {
    pub size: u64,
    /// skc_daddr
    pub daddr: u64,
    /// skc_rcv_saddr
    pub saddr: u64,
    /// skc_dport, network byte order
    pub dport: u64,
    /// skc_num, the local port in host byte order
    pub num: u64,
    /// skc_family
    pub family: u64,
    /// skc_net
    pub net: u64,
    /// skc_v6_daddr
    pub daddr_ipv6: u64,
    /// inet_sport
    pub sport: u64,
    /// srtt_us; mdev_us follows it
    pub srtt: u64,
}

impl Default for SockLayout {
    fn default() -> Self {
        Self {
            size: 0x900,
            daddr: 0,
            saddr: 4,
            dport: 12,
            num: 14,
            family: 16,
            net: 48,
            daddr_ipv6: 56,
            sport: 782,
            srtt: 1616,
        }
    }
}

/// `struct net`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetLayout {
    pub size: u64,
    /// ns.inum
    pub ino: u64,
}

impl Default for NetLayout {
    fn default() -> Self {
        Self {
            size: 0x200,
            ino: 136,
        }
    }
}

/// `struct socket`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketLayout {
    pub size: u64,
    pub sk: u64,
}

impl Default for SocketLayout {
    fn default() -> Self {
        Self { size: 0x80, sk: 24 }
    }
}

/// `struct flowi4` or `struct flowi6`.
///
/// The two flow structures have different defaults, so a partial section
/// is completed from the matching one by [`KernelLayout`]'s deserializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowLayout {
    pub size: u64,
    pub saddr: u64,
    pub daddr: u64,
    pub sport: u64,
    pub dport: u64,
}

impl FlowLayout {
    fn ipv4() -> Self {
        Self {
            size: 0x40,
            saddr: 40,
            daddr: 44,
            dport: 48,
            sport: 50,
        }
    }

    fn ipv6() -> Self {
        Self {
            size: 0x60,
            daddr: 40,
            saddr: 56,
            dport: 76,
            sport: 78,
        }
    }
}

/// A flow section as written in a layout file; missing fields keep the
/// defaults of the flow it describes
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FlowSection {
    size: Option<u64>,
    saddr: Option<u64>,
    daddr: Option<u64>,
    sport: Option<u64>,
    dport: Option<u64>,
}

impl FlowSection {
    fn complete(self, defaults: FlowLayout) -> FlowLayout {
        FlowLayout {
            size: self.size.unwrap_or(defaults.size),
            saddr: self.saddr.unwrap_or(defaults.saddr),
            daddr: self.daddr.unwrap_or(defaults.daddr),
            sport: self.sport.unwrap_or(defaults.sport),
            dport: self.dport.unwrap_or(defaults.dport),
        }
    }
}

fn deserialize_flowi4<'de, D>(deserializer: D) -> std::result::Result<FlowLayout, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(FlowSection::deserialize(deserializer)?.complete(FlowLayout::ipv4()))
}

fn deserialize_flowi6<'de, D>(deserializer: D) -> std::result::Result<FlowLayout, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(FlowSection::deserialize(deserializer)?.complete(FlowLayout::ipv6()))
}

/// `struct sk_buff` and the headers stored in its linear buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkBuffLayout {
    pub size: u64,
    pub sk: u64,
    /// transport_header; network_header and mac_header follow it
    pub transport_header: u64,
    pub head: u64,
    /// Size of the buffer `head` points to
    pub head_size: u64,
    /// Header positions relative to `head`
    pub mac_header: u16,
    pub network_header: u16,
    pub transport_header_value: u16,
}

impl Default for SkBuffLayout {
    fn default() -> Self {
        Self {
            size: 0xe8,
            sk: 24,
            transport_header: 0xb4,
            head: 0xc0,
            head_size: 0x200,
            mac_header: 50,
            network_header: 64,
            transport_header_value: 84,
        }
    }
}

/// `struct nf_conn`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfConnLayout {
    pub size: u64,
    /// Source address of the original direction tuple
    pub origin: u64,
    /// Source address of the reply direction tuple
    pub reply: u64,
    pub status: u64,
    /// ct_net
    pub net: u64,
}

impl Default for NfConnLayout {
    fn default() -> Self {
        Self {
            size: 0x100,
            origin: 32,
            reply: 88,
            status: 128,
            net: 136,
        }
    }
}

/// True offsets of every structure the probes calibrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelLayout {
    pub sock: SockLayout,
    pub net: NetLayout,
    pub socket: SocketLayout,
    #[serde(deserialize_with = "deserialize_flowi4")]
    pub flowi4: FlowLayout,
    #[serde(deserialize_with = "deserialize_flowi6")]
    pub flowi6: FlowLayout,
    pub sk_buff: SkBuffLayout,
    pub nf_conn: NfConnLayout,
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self {
            sock: SockLayout::default(),
            net: NetLayout::default(),
            socket: SocketLayout::default(),
            flowi4: FlowLayout::ipv4(),
            flowi6: FlowLayout::ipv6(),
            sk_buff: SkBuffLayout::default(),
            nf_conn: NfConnLayout::default(),
        }
    }
}

impl KernelLayout {
    /// Load a layout from a JSON file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let layout: Self = serde_json::from_str(&content)?;
        layout.validate()?;
        debug!("Loaded kernel layout from {}", path.as_ref().display());
        Ok(layout)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that every field fits its object at its natural alignment
    pub fn validate(&self) -> Result<()> {
        let sock = &self.sock;
        let objects = [
            ("sock", sock.size),
            ("net", self.net.size),
            ("socket", self.socket.size),
            ("flowi4", self.flowi4.size),
            ("flowi6", self.flowi6.size),
            ("sk_buff", self.sk_buff.size),
            ("sk_buff head", self.sk_buff.head_size),
            ("nf_conn", self.nf_conn.size),
        ];
        for (name, size) in objects {
            if size == 0 || size > MAX_OBJECT_SIZE {
                return Err(Error::InvalidConfig(format!(
                    "{} size {:#x} must be between 1 and {:#x}",
                    name, size, MAX_OBJECT_SIZE
                )));
            }
        }

        let ipv6 = sizes::IPV6_ADDR as u64;
        let pointer = sizes::POINTER as u64;
        let fields = [
            ("sock.daddr", sock.daddr, 4, sizes::DADDR, sock.size),
            ("sock.saddr", sock.saddr, 4, sizes::SADDR, sock.size),
            ("sock.dport", sock.dport, 2, sizes::DPORT, sock.size),
            ("sock.num", sock.num, 2, 2, sock.size),
            ("sock.family", sock.family, 2, sizes::FAMILY, sock.size),
            ("sock.net", sock.net, pointer, sizes::NETNS, sock.size),
            ("sock.daddr_ipv6", sock.daddr_ipv6, ipv6, sizes::DADDR_IPV6, sock.size),
            ("sock.sport", sock.sport, 2, sizes::SPORT, sock.size),
            ("sock.srtt", sock.srtt, 8, sizes::RTT, sock.size),
            ("net.ino", self.net.ino, 4, sizes::NETNS_INO, self.net.size),
            ("socket.sk", self.socket.sk, pointer, sizes::SOCKET_SK, self.socket.size),
            ("flowi4.saddr", self.flowi4.saddr, 4, sizes::SADDR_FL4, self.flowi4.size),
            ("flowi4.daddr", self.flowi4.daddr, 4, sizes::DADDR_FL4, self.flowi4.size),
            ("flowi4.sport", self.flowi4.sport, 2, sizes::SPORT_FL4, self.flowi4.size),
            ("flowi4.dport", self.flowi4.dport, 2, sizes::DPORT_FL4, self.flowi4.size),
            ("flowi6.saddr", self.flowi6.saddr, ipv6, sizes::SADDR_FL6, self.flowi6.size),
            ("flowi6.daddr", self.flowi6.daddr, ipv6, sizes::DADDR_FL6, self.flowi6.size),
            ("flowi6.sport", self.flowi6.sport, 2, sizes::SPORT_FL6, self.flowi6.size),
            ("flowi6.dport", self.flowi6.dport, 2, sizes::DPORT_FL6, self.flowi6.size),
            ("sk_buff.sk", self.sk_buff.sk, pointer, sizes::SK_BUFF_SOCK, self.sk_buff.size),
            (
                "sk_buff.transport_header",
                self.sk_buff.transport_header,
                6,
                sizes::SK_BUFF_TRANSPORT_HEADER,
                self.sk_buff.size,
            ),
            ("sk_buff.head", self.sk_buff.head, pointer, sizes::SK_BUFF_HEAD, self.sk_buff.size),
            ("nf_conn.origin", self.nf_conn.origin, 4, sizes::CT_TUPLE_ORIGIN, self.nf_conn.size),
            ("nf_conn.reply", self.nf_conn.reply, 4, sizes::CT_TUPLE_REPLY, self.nf_conn.size),
            ("nf_conn.status", self.nf_conn.status, 4, sizes::CT_STATUS, self.nf_conn.size),
            ("nf_conn.net", self.nf_conn.net, pointer, sizes::CT_NET, self.nf_conn.size),
        ];
        for (name, offset, width, align, size) in fields {
            if offset % align != 0 {
                return Err(Error::InvalidConfig(format!(
                    "{} at {} is not aligned to {}",
                    name, offset, align
                )));
            }
            if offset.checked_add(width).is_none_or(|end| end > size) {
                return Err(Error::InvalidConfig(format!(
                    "{} at {} does not fit in {} bytes",
                    name, offset, size
                )));
            }
        }

        let skb = &self.sk_buff;
        if skb.network_header.wrapping_sub(skb.mac_header) != MAC_TO_NETWORK
            || skb.transport_header_value.wrapping_sub(skb.network_header) != NETWORK_TO_TRANSPORT
        {
            return Err(Error::InvalidConfig(format!(
                "sk_buff headers must be {} then {} bytes apart",
                MAC_TO_NETWORK, NETWORK_TO_TRANSPORT
            )));
        }
        // TCP ports of the packet
        if u64::from(skb.transport_header_value) + 4 > skb.head_size {
            return Err(Error::InvalidConfig(
                "transport header lies outside the sk_buff head".to_string(),
            ));
        }
        Ok(())
    }

    /// True offset of the field calibrated by `what`
    pub fn offset_of(&self, what: GuessWhat) -> u64 {
        match what {
            GuessWhat::SAddr => self.sock.saddr,
            GuessWhat::DAddr => self.sock.daddr,
            GuessWhat::Family => self.sock.family,
            GuessWhat::SPort => self.sock.sport,
            GuessWhat::DPort => self.sock.dport,
            GuessWhat::NetNs => self.sock.net,
            GuessWhat::Rtt => self.sock.srtt,
            GuessWhat::DAddrIpv6 => self.sock.daddr_ipv6,
            GuessWhat::SAddrFl4 => self.flowi4.saddr,
            GuessWhat::DAddrFl4 => self.flowi4.daddr,
            GuessWhat::SPortFl4 => self.flowi4.sport,
            GuessWhat::DPortFl4 => self.flowi4.dport,
            GuessWhat::SAddrFl6 => self.flowi6.saddr,
            GuessWhat::DAddrFl6 => self.flowi6.daddr,
            GuessWhat::SPortFl6 => self.flowi6.sport,
            GuessWhat::DPortFl6 => self.flowi6.dport,
            GuessWhat::SocketSk => self.socket.sk,
            GuessWhat::SkBuffSock => self.sk_buff.sk,
            GuessWhat::SkBuffTransportHeader => self.sk_buff.transport_header,
            GuessWhat::SkBuffHead => self.sk_buff.head,
            GuessWhat::CtTupleOrigin => self.nf_conn.origin,
            GuessWhat::CtTupleReply => self.nf_conn.reply,
            GuessWhat::CtStatus => self.nf_conn.status,
            GuessWhat::CtNet => self.nf_conn.net,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_layout_is_valid() {
        KernelLayout::default().validate().unwrap();
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let layout: KernelLayout = serde_json::from_str(r#"{"net": {"ino": 200}}"#).unwrap();
        assert_eq!(layout.net.ino, 200);
        assert_eq!(layout.net.size, NetLayout::default().size);
        assert_eq!(layout.flowi6, FlowLayout::ipv6());
        assert_eq!(layout.flowi4, FlowLayout::ipv4());
    }

    #[test]
    fn test_partial_flow_sections_keep_their_own_defaults() {
        let json = r#"{"flowi4": {"sport": 52}, "flowi6": {"size": 128}}"#;
        let layout: KernelLayout = serde_json::from_str(json).unwrap();
        assert_eq!(
            layout.flowi4,
            FlowLayout {
                sport: 52,
                ..FlowLayout::ipv4()
            }
        );
        assert_eq!(
            layout.flowi6,
            FlowLayout {
                size: 128,
                ..FlowLayout::ipv6()
            }
        );
        layout.validate().unwrap();

        let empty: KernelLayout = serde_json::from_str(r#"{"flowi6": {}}"#).unwrap();
        assert_eq!(empty.flowi6, FlowLayout::ipv6());
    }

    #[test]
    fn test_unknown_flow_field_is_rejected() {
        assert!(serde_json::from_str::<KernelLayout>(r#"{"flowi4": {"sprot": 52}}"#).is_err());
    }

    #[test]
    fn test_load_from_path() {
        let mut layout = KernelLayout::default();
        layout.sock.sport = 900;
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", layout.to_json().unwrap()).unwrap();

        assert_eq!(KernelLayout::load_from_path(file.path()).unwrap(), layout);
    }

    #[test]
    fn test_misaligned_field_is_rejected() {
        let mut layout = KernelLayout::default();
        layout.sock.net = 50;
        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("sock.net"));
    }

    #[test]
    fn test_field_past_object_end_is_rejected() {
        let mut layout = KernelLayout::default();
        layout.nf_conn.net = layout.nf_conn.size;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_offset_near_u64_max_is_rejected() {
        let layout: KernelLayout =
            serde_json::from_str(r#"{"nf_conn": {"net": 18446744073709551608}}"#).unwrap();
        assert!(matches!(layout.validate(), Err(Error::InvalidConfig(_))));

        let mut layout = KernelLayout::default();
        layout.flowi6.sport = u64::MAX - 1;
        let err = layout.validate().unwrap_err();
        assert!(err.to_string().contains("flowi6.sport"));
    }

    #[test]
    fn test_header_distances_are_checked() {
        let mut layout = KernelLayout::default();
        layout.sk_buff.network_header += 2;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_oversized_object_is_rejected() {
        let mut layout = KernelLayout::default();
        layout.sock.size = MAX_OBJECT_SIZE + 1;
        assert!(matches!(layout.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_offset_of() {
        let layout = KernelLayout::default();
        assert_eq!(layout.offset_of(GuessWhat::SPort), 782);
        assert_eq!(layout.offset_of(GuessWhat::SAddrFl6), 56);
        assert_eq!(layout.offset_of(GuessWhat::CtNet), 136);
    }
}
