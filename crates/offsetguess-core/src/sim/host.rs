use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::{debug, trace};

use crate::driver::EventGenerator;
use crate::error::{Error, Result};
use crate::guess::{
    ConntrackStatus, ConntrackValues, GuessWhat, SubjectKind, TracerStatus, TracerValues,
};
use crate::hooks::{HookEvent, OffsetGuessProgram};
use crate::memory::layout::conntrack::EXPECTED_STATUS;
use crate::memory::layout::family::{AF_INET, AF_INET6};
use crate::memory::layout::rtt::{MDEV_SHIFT, SRTT_SHIFT, VAR_DISTANCE};
use crate::memory::layout::sockopt::{SOL_TCP, TCP_INFO};
use crate::memory::{MemoryImage, MemoryImageBuilder};
use crate::probe::{ProbeOutcome, TaskContext};

use super::layout::{FlowLayout, KernelLayout, SockLayout};

/// Slot of the first object, in the direct map
const OBJECT_BASE: u64 = 0xffff_8880_0410_0000;
const OBJECT_STRIDE: u64 = 0x1_0000;
/// Objects start one cache line into their slot
const OBJECT_SLACK: u64 = 0x40;
/// Reads below this address always fault
const LOW_PAGE: u64 = 0x1000;

/// A getsockopt the tcp_info hook ignores
const TCP_NODELAY: i32 = 1;

const CALIBRATION_PID_TGID: u64 = (4242 << 32) | 4243;
const NOISE_PID_TGID: u64 = (1717 << 32) | 1717;
const NOISE_COMM: &str = "curl";

const NETNS_INO: u32 = 4_026_531_992;
const RTT_US: u32 = 1500;
const RTT_VAR_US: u32 = 750;

/// Endpoints of a simulated IPv4 connection
#[derive(Debug, Clone, Copy)]
struct Connection {
    saddr: Ipv4Addr,
    daddr: Ipv4Addr,
    sport: u16,
    dport: u16,
}

const TCP: Connection = Connection {
    saddr: Ipv4Addr::new(127, 0, 0, 1),
    daddr: Ipv4Addr::new(127, 0, 0, 2),
    sport: 40172,
    dport: 8080,
};

const UDP: Connection = Connection {
    saddr: Ipv4Addr::new(127, 0, 0, 1),
    daddr: Ipv4Addr::new(127, 0, 0, 3),
    sport: 51000,
    dport: 9090,
};

/// Connection owned by the foreign thread
const NOISE: Connection = Connection {
    saddr: Ipv4Addr::new(10, 0, 0, 5),
    daddr: Ipv4Addr::new(10, 0, 0, 6),
    sport: 5555,
    dport: 6666,
};

const TCP6_DADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x10);
const UDP6_SADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
const UDP6_DADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
const UDP6_SPORT: u16 = 52000;
const UDP6_DPORT: u16 = 9091;

fn ipv4_word(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

fn ipv6_words(addr: Ipv6Addr) -> [u32; 4] {
    let octets = addr.octets();
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(octets.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Addresses of the simulated kernel objects
#[derive(Debug, Clone, Copy)]
struct Objects {
    sock: u64,
    sock6: u64,
    noise_sock: u64,
    net: u64,
    socket: u64,
    flowi4: u64,
    flowi6: u64,
    sk_buff: u64,
    head: u64,
    nf_conn: u64,
}

impl Objects {
    fn place() -> Self {
        let slot = |index: u64| OBJECT_BASE + index * OBJECT_STRIDE + OBJECT_SLACK;
        Self {
            sock: slot(0),
            sock6: slot(1),
            noise_sock: slot(2),
            net: slot(3),
            socket: slot(4),
            flowi4: slot(5),
            flowi6: slot(6),
            sk_buff: slot(7),
            head: slot(8),
            nf_conn: slot(9),
        }
    }
}

fn sock(
    builder: MemoryImageBuilder,
    layout: &SockLayout,
    base: u64,
    family: u16,
    conn: &Connection,
    net: u64,
) -> MemoryImageBuilder {
    builder
        .region(base, layout.size as usize)
        .bytes(base + layout.daddr, &conn.daddr.octets())
        .bytes(base + layout.saddr, &conn.saddr.octets())
        .u16_be(base + layout.dport, conn.dport)
        .u16(base + layout.num, conn.sport)
        .u16(base + layout.family, family)
        .u64(base + layout.net, net)
        .u16_be(base + layout.sport, conn.sport)
        .u32(base + layout.srtt, RTT_US << SRTT_SHIFT)
        .u32(base + layout.srtt + VAR_DISTANCE, RTT_VAR_US << MDEV_SHIFT)
}

fn flow(
    builder: MemoryImageBuilder,
    layout: &FlowLayout,
    base: u64,
    saddr: &[u8],
    daddr: &[u8],
    sport: u16,
    dport: u16,
) -> MemoryImageBuilder {
    builder
        .region(base, layout.size as usize)
        // flowic_oif and flowic_proto
        .u32(base, 1)
        .bytes(base + 14, &[17])
        .bytes(base + layout.saddr, saddr)
        .bytes(base + layout.daddr, daddr)
        .u16_be(base + layout.sport, sport)
        .u16_be(base + layout.dport, dport)
}

fn build_image(layout: &KernelLayout, at: &Objects) -> Result<MemoryImage> {
    let mut builder = MemoryImage::builder().fault(0..LOW_PAGE);

    builder = sock(builder, &layout.sock, at.sock, AF_INET, &TCP, at.net);
    let unspecified = Connection {
        saddr: Ipv4Addr::UNSPECIFIED,
        daddr: Ipv4Addr::UNSPECIFIED,
        ..TCP
    };
    // skc_v6_daddr stays empty until the connect hook runs
    builder = sock(builder, &layout.sock, at.sock6, AF_INET6, &unspecified, at.net);
    builder = sock(builder, &layout.sock, at.noise_sock, AF_INET, &NOISE, at.net);

    builder = builder
        .region(at.net, layout.net.size as usize)
        .u32(at.net, 2)
        .u32(at.net + layout.net.ino, NETNS_INO);

    builder = builder
        .region(at.socket, layout.socket.size as usize)
        // state and type
        .u32(at.socket, 1)
        .u16(at.socket + 4, 1)
        .u64(at.socket + layout.socket.sk, at.sock);

    builder = flow(
        builder,
        &layout.flowi4,
        at.flowi4,
        &UDP.saddr.octets(),
        &UDP.daddr.octets(),
        UDP.sport,
        UDP.dport,
    );
    builder = flow(
        builder,
        &layout.flowi6,
        at.flowi6,
        &UDP6_SADDR.octets(),
        &UDP6_DADDR.octets(),
        UDP6_SPORT,
        UDP6_DPORT,
    );

    let skb = &layout.sk_buff;
    let transport = at.head + u64::from(skb.transport_header_value);
    builder = builder
        .region(at.sk_buff, skb.size as usize)
        // tstamp and len
        .u64(at.sk_buff + 16, 0x1234_5678)
        .u32(at.sk_buff + 0x70, 74)
        .u64(at.sk_buff + skb.sk, at.sock)
        .u16(at.sk_buff + skb.transport_header, skb.transport_header_value)
        .u16(at.sk_buff + skb.transport_header + 2, skb.network_header)
        .u16(at.sk_buff + skb.transport_header + 4, skb.mac_header)
        .u64(at.sk_buff + skb.head, at.head)
        .region(at.head, skb.head_size as usize)
        .bytes(at.head + u64::from(skb.network_header), &[0x45, 0])
        .u16_be(transport, TCP.sport)
        .u16_be(transport + 2, TCP.dport);

    let ct = &layout.nf_conn;
    builder = builder
        .region(at.nf_conn, ct.size as usize)
        // ct_general.use and timeout
        .u32(at.nf_conn, 1)
        .u32(at.nf_conn + 8, 30_000)
        .bytes(at.nf_conn + ct.origin, &UDP.saddr.octets())
        .bytes(at.nf_conn + ct.reply, &UDP.daddr.octets())
        .u32(at.nf_conn + ct.status, EXPECTED_STATUS)
        .u64(at.nf_conn + ct.net, at.net);

    builder.build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caller {
    Calibration,
    Noise,
}

/// A host whose kernel memory follows a [`KernelLayout`].
///
/// Generates the same activity the calibration would trigger on a live
/// system: TCP_INFO requests, UDP sends, packet transmission, IPv6 connects
/// and conntrack insertions, interleaved with events from a foreign thread
/// that the probes must ignore.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    layout: KernelLayout,
    image: MemoryImage,
    objects: Objects,
    task: TaskContext,
    noise: TaskContext,
    events: u64,
    published: u64,
}

impl SimulatedHost {
    pub fn new(layout: KernelLayout, process_name: &str) -> Result<Self> {
        layout.validate()?;
        let objects = Objects::place();
        let image = build_image(&layout, &objects)?;
        debug!("Simulated kernel objects at {:#x?}", objects);

        Ok(Self {
            layout,
            image,
            objects,
            task: TaskContext::new(process_name, CALIBRATION_PID_TGID),
            noise: TaskContext::new(NOISE_COMM, NOISE_PID_TGID),
            events: 0,
            published: 0,
        })
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    /// The calibration thread
    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    /// Events delivered to the program so far
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Events that made a probe publish a snapshot
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Namespace inode number every simulated object lives in
    pub fn netns_ino(&self) -> u32 {
        NETNS_INO
    }

    fn fire(
        &mut self,
        program: &mut OffsetGuessProgram,
        caller: Caller,
        event: HookEvent,
    ) -> ProbeOutcome {
        let task = match caller {
            Caller::Calibration => self.task,
            Caller::Noise => self.noise,
        };
        let outcome = program.handle(&self.image, &task, event);
        self.events += 1;
        if outcome.is_published() {
            self.published += 1;
        }
        trace!("{:?} {:?} -> {:?}", caller, event, outcome);
        outcome
    }

    fn tcp_info(&mut self, program: &mut OffsetGuessProgram, caller: Caller, sock: u64) {
        let event = HookEvent::TcpGetsockopt {
            sock,
            level: SOL_TCP,
            optname: TCP_INFO,
        };
        self.fire(program, caller, event);
    }

    /// Connect an IPv6 socket; the kernel fills in the destination while
    /// the call is in flight
    fn connect_ipv6(&mut self, program: &mut OffsetGuessProgram) -> Result<()> {
        let Objects {
            sock,
            sock6,
            noise_sock,
            ..
        } = self.objects;
        let daddr = sock6 + self.layout.sock.daddr_ipv6;

        // The IPv4 connection stays active and must be skipped
        self.tcp_info(program, Caller::Calibration, sock);

        self.image.write_bytes(daddr, &Ipv6Addr::UNSPECIFIED.octets())?;
        self.fire(program, Caller::Noise, HookEvent::TcpV6Connect { sock: noise_sock });
        self.fire(program, Caller::Calibration, HookEvent::TcpV6Connect { sock: sock6 });
        self.image.write_bytes(daddr, &TCP6_DADDR.octets())?;
        self.fire(program, Caller::Noise, HookEvent::TcpV6ConnectReturn);
        self.fire(program, Caller::Calibration, HookEvent::TcpV6ConnectReturn);
        Ok(())
    }
}

impl EventGenerator<TracerStatus> for SimulatedHost {
    fn expected(&mut self) -> Result<TracerValues> {
        let skb = &self.layout.sk_buff;
        Ok(TracerValues {
            saddr: ipv4_word(TCP.saddr),
            daddr: ipv4_word(TCP.daddr),
            sport: TCP.sport,
            dport: TCP.dport,
            netns: NETNS_INO,
            family: AF_INET,
            rtt: RTT_US,
            rtt_var: RTT_VAR_US,
            daddr_ipv6: ipv6_words(TCP6_DADDR),
            saddr_fl4: ipv4_word(UDP.saddr),
            daddr_fl4: ipv4_word(UDP.daddr),
            sport_fl4: UDP.sport,
            dport_fl4: UDP.dport,
            saddr_fl6: ipv6_words(UDP6_SADDR),
            daddr_fl6: ipv6_words(UDP6_DADDR),
            sport_fl6: UDP6_SPORT,
            dport_fl6: UDP6_DPORT,
            sport_via_sk: TCP.sport,
            dport_via_sk: TCP.dport,
            sport_via_sk_via_sk_buff: TCP.sport,
            dport_via_sk_via_sk_buff: TCP.dport,
            transport_header: skb.transport_header_value,
            network_header: skb.network_header,
            mac_header: skb.mac_header,
            sport_via_sk_buff: TCP.sport,
            dport_via_sk_buff: TCP.dport,
        })
    }

    fn generate(
        &mut self,
        what: GuessWhat,
        program: &mut OffsetGuessProgram,
        _expected: &mut TracerValues,
    ) -> Result<()> {
        let objects = self.objects;
        match what.subject() {
            SubjectKind::Sock if what == GuessWhat::DAddrIpv6 => self.connect_ipv6(program)?,
            SubjectKind::Sock => {
                self.tcp_info(program, Caller::Noise, objects.noise_sock);
                let nodelay = HookEvent::TcpGetsockopt {
                    sock: objects.sock,
                    level: SOL_TCP,
                    optname: TCP_NODELAY,
                };
                self.fire(program, Caller::Calibration, nodelay);
                self.tcp_info(program, Caller::Calibration, objects.sock);
            }
            SubjectKind::FlowI4 => {
                let event = HookEvent::IpMakeSkb { flow: objects.flowi4 };
                self.fire(program, Caller::Noise, event);
                self.fire(program, Caller::Calibration, event);
            }
            SubjectKind::FlowI6 => {
                // Only the variant matching the kernel is attached
                for event in [
                    HookEvent::Ip6MakeSkb { flow: objects.flowi6 },
                    HookEvent::Ip6MakeSkbPre470 { flow: objects.flowi6 },
                ] {
                    self.fire(program, Caller::Noise, event);
                    self.fire(program, Caller::Calibration, event);
                }
            }
            SubjectKind::Socket => {
                let event = HookEvent::SockCommonGetsockopt {
                    socket: objects.socket,
                };
                self.fire(program, Caller::Noise, event);
                self.fire(program, Caller::Calibration, event);
            }
            SubjectKind::SkBuff => {
                let event = HookEvent::NetDevQueue {
                    skb: objects.sk_buff,
                };
                self.fire(program, Caller::Noise, event);
                self.fire(program, Caller::Calibration, event);
            }
            SubjectKind::NfConn => {
                return Err(Error::EventGeneration {
                    what,
                    message: "not a socket field".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl EventGenerator<ConntrackStatus> for SimulatedHost {
    fn expected(&mut self) -> Result<ConntrackValues> {
        Ok(ConntrackValues {
            saddr: ipv4_word(UDP.saddr),
            daddr: ipv4_word(UDP.daddr),
            status: EXPECTED_STATUS,
            netns: NETNS_INO,
        })
    }

    fn generate(
        &mut self,
        what: GuessWhat,
        program: &mut OffsetGuessProgram,
        _expected: &mut ConntrackValues,
    ) -> Result<()> {
        if !what.is_conntrack_field() {
            return Err(Error::EventGeneration {
                what,
                message: "not a conntrack field".to_string(),
            });
        }
        let event = HookEvent::NfConntrackHashInsert {
            ct: self.objects.nf_conn,
        };
        self.fire(program, Caller::Noise, event);
        self.fire(program, Caller::Calibration, event);
        Ok(())
    }
}
