use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::config::{GuessConfig, KernelVersion};
use crate::error::Result;
use crate::guess::{GuessPhase, GuessWhat, ProcessName, TracerOffsets, TracerStatus, TracerValues};
use crate::hooks::{HookPoint, OffsetGuessProgram, enabled_hooks};
use crate::memory::layout::skb::{MAC_TO_NETWORK, NETWORK_TO_TRANSPORT};

use super::{ConstantEditor, EventGenerator, GuessField, GuessFields, calibrate};

/// `inet_sport` and the rtt fields sit much further into `struct tcp_sock`
const THRESHOLD_INET_SOCK: u64 = 2000;

const KERNEL_4_7: KernelVersion = KernelVersion::new(4, 7, 0);

fn field(
    what: GuessWhat,
    offset: fn(&TracerOffsets) -> u64,
    offset_mut: fn(&mut TracerOffsets) -> &mut u64,
    equal: fn(&TracerValues, &TracerValues) -> bool,
) -> GuessField<TracerStatus> {
    GuessField::new(what, offset, offset_mut, equal)
}

/// Build the ordered list of socket fields to guess for `config`
fn tracer_fields(config: &GuessConfig, hooks: &BTreeSet<HookPoint>) -> GuessFields<TracerStatus> {
    let mut fields = vec![
        field(GuessWhat::SAddr, |o| o.saddr, |o| &mut o.saddr, |v, e| v.saddr == e.saddr),
        field(GuessWhat::DAddr, |o| o.daddr, |o| &mut o.daddr, |v, e| v.daddr == e.daddr),
        field(GuessWhat::DPort, |o| o.dport, |o| &mut o.dport, |v, e| v.dport == e.dport),
        // skc_family follows skc_dport
        field(GuessWhat::Family, |o| o.family, |o| &mut o.family, |v, e| v.family == e.family)
            .start_from(|o| o.dport),
        // inet_sport lives in struct inet_sock, past the common part
        field(GuessWhat::SPort, |o| o.sport, |o| &mut o.sport, |v, e| v.sport == e.sport)
            .start_from(|o| o.family)
            .threshold(THRESHOLD_INET_SOCK),
        field(
            GuessWhat::SAddrFl4,
            |o| o.saddr_fl4,
            |o| &mut o.saddr_fl4,
            |v, e| v.saddr_fl4 == e.saddr_fl4,
        )
        .optional(4),
        field(
            GuessWhat::DAddrFl4,
            |o| o.daddr_fl4,
            |o| &mut o.daddr_fl4,
            |v, e| v.daddr_fl4 == e.daddr_fl4,
        )
        .optional(3),
        field(
            GuessWhat::SPortFl4,
            |o| o.sport_fl4,
            |o| &mut o.sport_fl4,
            |v, e| v.sport_fl4 == e.sport_fl4,
        )
        .optional(2),
        field(
            GuessWhat::DPortFl4,
            |o| o.dport_fl4,
            |o| &mut o.dport_fl4,
            |v, e| v.dport_fl4 == e.dport_fl4,
        )
        .optional(1),
    ];

    let make_skb_v6 =
        hooks.contains(&HookPoint::Ip6MakeSkb) || hooks.contains(&HookPoint::Ip6MakeSkbPre470);
    if config.collect_udpv6 && make_skb_v6 {
        fields.extend([
            field(
                GuessWhat::SAddrFl6,
                |o| o.saddr_fl6,
                |o| &mut o.saddr_fl6,
                |v, e| v.saddr_fl6 == e.saddr_fl6,
            )
            .optional(4),
            field(
                GuessWhat::DAddrFl6,
                |o| o.daddr_fl6,
                |o| &mut o.daddr_fl6,
                |v, e| v.daddr_fl6 == e.daddr_fl6,
            )
            .optional(3),
            field(
                GuessWhat::SPortFl6,
                |o| o.sport_fl6,
                |o| &mut o.sport_fl6,
                |v, e| v.sport_fl6 == e.sport_fl6,
            )
            .optional(2),
            field(
                GuessWhat::DPortFl6,
                |o| o.dport_fl6,
                |o| &mut o.dport_fl6,
                |v, e| v.dport_fl6 == e.dport_fl6,
            )
            .optional(1),
        ]);
    } else if config.collect_udpv6 {
        debug!("ip6_make_skb is not attached, skipping struct flowi6");
    }

    fields.extend([
        field(GuessWhat::NetNs, |o| o.netns, |o| &mut o.netns, |v, e| v.netns == e.netns)
            .increment_with(|field, offsets, errored| {
                // Walk the inode offset first; move to the next namespace
                // pointer candidate when the pointer is bad or ino runs out
                offsets.ino = offsets.ino.saturating_add(1);
                if errored || offsets.ino >= field.threshold_or_default() {
                    offsets.ino = 0;
                    offsets.netns = offsets.netns.saturating_add(1);
                }
            }),
        field(GuessWhat::Rtt, |o| o.rtt, |o| &mut o.rtt, |v, e| {
            v.rtt == e.rtt && v.rtt_var == e.rtt_var
        })
        .threshold(THRESHOLD_INET_SOCK),
        field(GuessWhat::SocketSk, |o| o.socket_sk, |o| &mut o.socket_sk, |v, e| {
            v.sport_via_sk == e.sport_via_sk && v.dport_via_sk == e.dport_via_sk
        }),
    ]);

    // net_dev_queue is only available from 4.7
    if config.kernel_version >= KERNEL_4_7 {
        fields.extend([
            field(
                GuessWhat::SkBuffSock,
                |o| o.sk_buff_sock,
                |o| &mut o.sk_buff_sock,
                |v, e| {
                    v.sport_via_sk_via_sk_buff == e.sport_via_sk_via_sk_buff
                        && v.dport_via_sk_via_sk_buff == e.dport_via_sk_via_sk_buff
                },
            ),
            field(
                GuessWhat::SkBuffTransportHeader,
                |o| o.sk_buff_transport_header,
                |o| &mut o.sk_buff_transport_header,
                |v, _| {
                    v.network_header.wrapping_sub(v.mac_header) == MAC_TO_NETWORK
                        && v.transport_header.wrapping_sub(v.network_header) == NETWORK_TO_TRANSPORT
                },
            ),
            field(
                GuessWhat::SkBuffHead,
                |o| o.sk_buff_head,
                |o| &mut o.sk_buff_head,
                |v, e| {
                    v.sport_via_sk_buff == e.sport_via_sk_buff
                        && v.dport_via_sk_buff == e.dport_via_sk_buff
                },
            ),
        ]);
    }

    if config.collects_ipv6() {
        fields.push(field(
            GuessWhat::DAddrIpv6,
            |o| o.daddr_ipv6,
            |o| &mut o.daddr_ipv6,
            |v, e| v.daddr_ipv6 == e.daddr_ipv6,
        ));
    }

    GuessFields::new(fields)
}

/// Calibrates the socket, flow and sk_buff offsets
#[derive(Debug)]
pub struct TracerGuesser {
    config: GuessConfig,
    hooks: BTreeSet<HookPoint>,
    fields: GuessFields<TracerStatus>,
    status: TracerStatus,
    iterations: u64,
}

impl TracerGuesser {
    pub fn new(config: GuessConfig) -> Self {
        let hooks = enabled_hooks(&config);
        let fields = tracer_fields(&config, &hooks);
        Self {
            config,
            hooks,
            fields,
            status: TracerStatus::default(),
            iterations: 0,
        }
    }

    /// Hooks this calibration needs attached
    pub fn hooks(&self) -> &BTreeSet<HookPoint> {
        &self.hooks
    }

    pub fn fields(&self) -> &GuessFields<TracerStatus> {
        &self.fields
    }

    pub fn status(&self) -> &TracerStatus {
        &self.status
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Run the calibration and return the discovered constants.
    ///
    /// If the program's record is already `Ready` its offsets are reused.
    pub fn guess<G>(
        &mut self,
        program: &mut OffsetGuessProgram,
        generator: &mut G,
    ) -> Result<Vec<ConstantEditor>>
    where
        G: EventGenerator<TracerStatus> + ?Sized,
    {
        let ready = program
            .tracer_status
            .lookup()
            .filter(|s| s.header.state == GuessPhase::Ready);
        if let Some(status) = ready {
            self.status = status;
            return Ok(self.constant_editors());
        }

        program.attach(self.hooks.iter().copied());
        self.fields.fixup(self.config.offset_guess_threshold)?;

        self.status = TracerStatus::default();
        self.status.header.proc = ProcessName::new(&self.config.process_name);

        debug!(
            "Guessing {} socket fields with default threshold of {}",
            self.fields.len(),
            self.config.offset_guess_threshold
        );
        self.iterations = calibrate(
            program,
            |p| &mut p.tracer_status,
            &mut self.status,
            &mut self.fields,
            generator,
            self.config.max_retries,
        )?;
        info!("Socket offsets guessed in {} iterations", self.iterations);

        Ok(self.constant_editors())
    }

    fn constant_editors(&self) -> Vec<ConstantEditor> {
        let finished = |group: [GuessWhat; 4]| group.iter().all(|&w| self.fields.is_finished(w));
        let fl4_offsets = finished([
            GuessWhat::SAddrFl4,
            GuessWhat::DAddrFl4,
            GuessWhat::SPortFl4,
            GuessWhat::DPortFl4,
        ]);
        let fl6_offsets = finished([
            GuessWhat::SAddrFl6,
            GuessWhat::DAddrFl6,
            GuessWhat::SPortFl6,
            GuessWhat::DPortFl6,
        ]);

        let o = &self.status.offsets;
        vec![
            ConstantEditor::new("offset_saddr", o.saddr),
            ConstantEditor::new("offset_daddr", o.daddr),
            ConstantEditor::new("offset_sport", o.sport),
            ConstantEditor::new("offset_dport", o.dport),
            ConstantEditor::new("offset_netns", o.netns),
            ConstantEditor::new("offset_ino", o.ino),
            ConstantEditor::new("offset_family", o.family),
            ConstantEditor::new("offset_rtt", o.rtt),
            ConstantEditor::new("offset_rtt_var", o.rtt_var),
            ConstantEditor::new("offset_daddr_ipv6", o.daddr_ipv6),
            ConstantEditor::new("offset_saddr_fl4", o.saddr_fl4),
            ConstantEditor::new("offset_daddr_fl4", o.daddr_fl4),
            ConstantEditor::new("offset_sport_fl4", o.sport_fl4),
            ConstantEditor::new("offset_dport_fl4", o.dport_fl4),
            ConstantEditor::flag("fl4_offsets", fl4_offsets),
            ConstantEditor::new("offset_saddr_fl6", o.saddr_fl6),
            ConstantEditor::new("offset_daddr_fl6", o.daddr_fl6),
            ConstantEditor::new("offset_sport_fl6", o.sport_fl6),
            ConstantEditor::new("offset_dport_fl6", o.dport_fl6),
            ConstantEditor::flag("fl6_offsets", fl6_offsets),
            ConstantEditor::new("offset_socket_sk", o.socket_sk),
            ConstantEditor::new("offset_sk_buff_sock", o.sk_buff_sock),
            ConstantEditor::new("offset_sk_buff_transport_header", o.sk_buff_transport_header),
            ConstantEditor::new("offset_sk_buff_head", o.sk_buff_head),
            ConstantEditor::flag("tcpv6_enabled", self.config.collect_tcpv6),
            ConstantEditor::flag("udpv6_enabled", self.config.collect_udpv6),
        ]
    }
}
