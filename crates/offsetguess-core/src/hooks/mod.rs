//! Hook dispatch
//!
//! Each kernel attachment point is modelled as a [`HookEvent`] variant. The
//! program owns the shared records and the connect stash, decides whether an
//! event is relevant to the field currently being calibrated, and forwards
//! the event's subject to the matching probe.

mod selection;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};
use tracing::trace;

use crate::guess::{ConntrackStatus, GuessWhat, SubjectKind, TracerStatus};
use crate::map::{ConnectStash, GuessMap};
use crate::memory::ReadMemory;
use crate::memory::layout::sockopt::{SOL_TCP, TCP_INFO};
use crate::probe::{ProbeOutcome, TaskContext, guess_conntrack_offsets, guess_tracer_offsets};

pub use selection::{conntrack_hooks, enabled_hooks};

/// Kernel attachment points, named by their section symbol
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    IntoStaticStr,
    EnumIter,
)]
pub enum HookPoint {
    #[strum(serialize = "kprobe/ip_make_skb")]
    IpMakeSkb,
    #[strum(serialize = "kprobe/ip6_make_skb")]
    Ip6MakeSkb,
    /// Same symbol with the pre-4.7 argument layout
    #[strum(serialize = "kprobe/ip6_make_skb/pre_4_7_0")]
    Ip6MakeSkbPre470,
    #[strum(serialize = "kprobe/tcp_getsockopt")]
    TcpGetsockopt,
    #[strum(serialize = "kprobe/sock_common_getsockopt")]
    SockCommonGetsockopt,
    #[strum(serialize = "kprobe/tcp_v6_connect")]
    TcpV6Connect,
    #[strum(serialize = "kretprobe/tcp_v6_connect")]
    TcpV6ConnectReturn,
    #[strum(serialize = "tracepoint/net/net_dev_queue")]
    NetDevQueue,
    #[strum(serialize = "kprobe/__nf_conntrack_hash_insert")]
    NfConntrackHashInsert,
}

/// A kernel event carrying the pointers its hook would receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    IpMakeSkb { flow: u64 },
    Ip6MakeSkb { flow: u64 },
    Ip6MakeSkbPre470 { flow: u64 },
    TcpGetsockopt { sock: u64, level: i32, optname: i32 },
    SockCommonGetsockopt { socket: u64 },
    TcpV6Connect { sock: u64 },
    TcpV6ConnectReturn,
    NetDevQueue { skb: u64 },
    NfConntrackHashInsert { ct: u64 },
}

impl HookEvent {
    pub fn hook_point(&self) -> HookPoint {
        match self {
            Self::IpMakeSkb { .. } => HookPoint::IpMakeSkb,
            Self::Ip6MakeSkb { .. } => HookPoint::Ip6MakeSkb,
            Self::Ip6MakeSkbPre470 { .. } => HookPoint::Ip6MakeSkbPre470,
            Self::TcpGetsockopt { .. } => HookPoint::TcpGetsockopt,
            Self::SockCommonGetsockopt { .. } => HookPoint::SockCommonGetsockopt,
            Self::TcpV6Connect { .. } => HookPoint::TcpV6Connect,
            Self::TcpV6ConnectReturn => HookPoint::TcpV6ConnectReturn,
            Self::NetDevQueue { .. } => HookPoint::NetDevQueue,
            Self::NfConntrackHashInsert { .. } => HookPoint::NfConntrackHashInsert,
        }
    }
}

/// Subject handed to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subject {
    kind: SubjectKind,
    address: u64,
}

/// The offset guessing program: shared records plus the attached hooks
#[derive(Debug, Clone, Default)]
pub struct OffsetGuessProgram {
    pub tracer_status: GuessMap<TracerStatus>,
    pub conntrack_status: GuessMap<ConntrackStatus>,
    pub connectsock_ipv6: ConnectStash,
    enabled: BTreeSet<HookPoint>,
}

impl OffsetGuessProgram {
    pub fn new(enabled: BTreeSet<HookPoint>) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_attached(&self, hook: HookPoint) -> bool {
        self.enabled.contains(&hook)
    }

    pub fn attached(&self) -> impl Iterator<Item = HookPoint> + '_ {
        self.enabled.iter().copied()
    }

    /// Attach additional hooks
    pub fn attach<I: IntoIterator<Item = HookPoint>>(&mut self, hooks: I) {
        self.enabled.extend(hooks);
    }

    /// Run the handler of `event` as if its hook fired in `task`
    pub fn handle<R: ReadMemory + ?Sized>(
        &mut self,
        reader: &R,
        task: &TaskContext,
        event: HookEvent,
    ) -> ProbeOutcome {
        let hook = event.hook_point();
        if !self.is_attached(hook) {
            return ProbeOutcome::Gated;
        }

        let subject = match self.route(task, event) {
            Ok(subject) => subject,
            Err(outcome) => {
                trace!("{} gated: {:?}", hook, outcome);
                return outcome;
            }
        };

        let outcome = match subject.kind {
            SubjectKind::NfConn => {
                guess_conntrack_offsets(&mut self.conntrack_status, task, subject.address, reader)
            }
            _ => guess_tracer_offsets(&mut self.tracer_status, task, subject.address, reader),
        };
        trace!(
            "{} probed {} at {:#x}: {:?}",
            hook, subject.kind, subject.address, outcome
        );
        outcome
    }

    /// Apply the gate of each hook and pick the probe subject
    fn route(&mut self, task: &TaskContext, event: HookEvent) -> Result<Subject, ProbeOutcome> {
        match event {
            HookEvent::IpMakeSkb { flow } => {
                self.tracer_target(|what| !what.is_some_and(GuessWhat::is_sk_buff_field))?;
                Ok(Subject {
                    kind: SubjectKind::FlowI4,
                    address: flow,
                })
            }
            HookEvent::Ip6MakeSkb { flow } | HookEvent::Ip6MakeSkbPre470 { flow } => {
                self.tracer_target(|what| !what.is_some_and(GuessWhat::is_sk_buff_field))?;
                Ok(Subject {
                    kind: SubjectKind::FlowI6,
                    address: flow,
                })
            }
            HookEvent::TcpGetsockopt {
                sock,
                level,
                optname,
            } => {
                if level != SOL_TCP || optname != TCP_INFO {
                    return Err(ProbeOutcome::Gated);
                }
                self.tracer_target(|what| {
                    !what.is_some_and(|w| w == GuessWhat::SocketSk || w.is_sk_buff_field())
                })?;
                // Liveness flag, set even when the probe rejects the caller
                if let Some(status) = self.tracer_status.lookup_mut() {
                    status.tcp_info_kprobe_status = true;
                }
                Ok(Subject {
                    kind: SubjectKind::Sock,
                    address: sock,
                })
            }
            HookEvent::SockCommonGetsockopt { socket } => {
                self.tracer_target(|what| what == Some(GuessWhat::SocketSk))?;
                Ok(Subject {
                    kind: SubjectKind::Socket,
                    address: socket,
                })
            }
            HookEvent::TcpV6Connect { sock } => {
                self.connectsock_ipv6.insert(task.pid_tgid, sock);
                Err(ProbeOutcome::Gated)
            }
            HookEvent::TcpV6ConnectReturn => {
                // missed entry
                let sock = self
                    .connectsock_ipv6
                    .take(task.pid_tgid)
                    .ok_or(ProbeOutcome::Gated)?;
                self.tracer_target(|what| !what.is_some_and(GuessWhat::is_sk_buff_field))?;
                Ok(Subject {
                    kind: SubjectKind::Sock,
                    address: sock,
                })
            }
            HookEvent::NetDevQueue { skb } => {
                self.tracer_target(|what| what.is_some_and(GuessWhat::is_sk_buff_field))?;
                Ok(Subject {
                    kind: SubjectKind::SkBuff,
                    address: skb,
                })
            }
            HookEvent::NfConntrackHashInsert { ct } => {
                let status = self.conntrack_status.lookup().ok_or(ProbeOutcome::Inapplicable)?;
                if !status.header.what().is_some_and(GuessWhat::is_conntrack_field) {
                    return Err(ProbeOutcome::Gated);
                }
                Ok(Subject {
                    kind: SubjectKind::NfConn,
                    address: ct,
                })
            }
        }
    }

    /// Check the tracer record exists and its target passes `accept`
    fn tracer_target(
        &self,
        accept: impl FnOnce(Option<GuessWhat>) -> bool,
    ) -> Result<(), ProbeOutcome> {
        let status = self.tracer_status.lookup().ok_or(ProbeOutcome::Inapplicable)?;
        if accept(status.header.what()) {
            Ok(())
        } else {
            Err(ProbeOutcome::Gated)
        }
    }
}
