use std::collections::BTreeSet;

use tracing::debug;

use crate::config::{GuessConfig, KernelVersion};

use super::HookPoint;

/// First release with the `net_dev_queue` tracepoint and the current
/// `ip6_make_skb` argument layout
const KERNEL_4_7: KernelVersion = KernelVersion::new(4, 7, 0);
/// From this release `ip6_make_skb` no longer carries the flow descriptor
/// the probes expect
const KERNEL_5_18: KernelVersion = KernelVersion::new(5, 18, 0);

/// Hooks attached while calibrating the socket structures
pub fn enabled_hooks(config: &GuessConfig) -> BTreeSet<HookPoint> {
    let kernel = config.kernel_version;
    let mut hooks = BTreeSet::from([
        HookPoint::TcpGetsockopt,
        HookPoint::SockCommonGetsockopt,
        HookPoint::IpMakeSkb,
    ]);

    if kernel >= KERNEL_4_7 {
        hooks.insert(HookPoint::NetDevQueue);
    }

    if config.collects_ipv6() {
        hooks.insert(HookPoint::TcpV6Connect);
        hooks.insert(HookPoint::TcpV6ConnectReturn);
    }

    if config.collect_udpv6 && kernel < KERNEL_5_18 {
        if kernel < KERNEL_4_7 {
            hooks.insert(HookPoint::Ip6MakeSkbPre470);
        } else {
            hooks.insert(HookPoint::Ip6MakeSkb);
        }
    }

    debug!("Enabled {} hooks for kernel {}", hooks.len(), kernel);
    hooks
}

/// Hooks attached while calibrating `struct nf_conn`
pub fn conntrack_hooks() -> BTreeSet<HookPoint> {
    BTreeSet::from([HookPoint::NfConntrackHashInsert])
}
