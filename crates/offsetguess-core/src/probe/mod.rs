//! Offset guessing probes
//!
//! A probe runs inside a hook: it checks that the shared record is armed and
//! that the event comes from the calibration thread, advances the candidate
//! offset to the next aligned address, reads the field from the subject
//! structure and publishes a `Checked` snapshot for the driver.

mod conntrack;
mod tracer;

use tracing::trace;

use crate::guess::{ProcessName, next_aligned_offset};
use crate::memory::ReadMemory;
use crate::memory::layout::limits::MAX_READS_PER_ATTEMPT;

pub use conntrack::guess_conntrack_offsets;
pub use tracer::guess_tracer_offsets;

/// Identity of the task that triggered a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub comm: ProcessName,
    pub pid_tgid: u64,
}

impl TaskContext {
    pub fn new(comm: &str, pid_tgid: u64) -> Self {
        Self {
            comm: ProcessName::new(comm),
            pid_tgid,
        }
    }
}

/// Result of feeding one event to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The hook gate rejected the event before reaching the probe
    Gated,
    /// No record, or the record is not `Checking`
    Inapplicable,
    /// The event did not come from the calibration thread
    WrongCaller,
    /// The targeted field is not handled by this probe
    NotForUs,
    /// The subject failed a precondition; nothing was published
    Skipped,
    /// A `Checked` snapshot was published
    Published { fault: bool },
}

impl ProbeOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

/// Reads performed during one probe attempt.
///
/// Every failed read marks the attempt as faulted and yields `None`, leaving
/// the destination value untouched.
struct Attempt<'a, R: ?Sized> {
    reader: &'a R,
    reads: usize,
    fault: bool,
}

impl<'a, R: ReadMemory + ?Sized> Attempt<'a, R> {
    fn new(reader: &'a R) -> Self {
        Self {
            reader,
            reads: 0,
            fault: false,
        }
    }

    fn read<T>(
        &mut self,
        address: u64,
        read: impl FnOnce(&R, u64) -> crate::Result<T>,
    ) -> Option<T> {
        self.reads += 1;
        debug_assert!(self.reads <= MAX_READS_PER_ATTEMPT);
        match read(self.reader, address) {
            Ok(value) => Some(value),
            Err(e) => {
                trace!("probe read fault: {}", e);
                self.fault = true;
                None
            }
        }
    }

    /// Move `offset` to the next aligned candidate in place.
    ///
    /// A candidate that cannot be aligned without leaving the `u64` range is
    /// a fault and leaves `offset` untouched.
    fn align(&mut self, base: u64, offset: &mut u64, size: u64) -> Option<u64> {
        match next_aligned_offset(base, *offset, size) {
            Some(aligned) => {
                *offset = aligned;
                Some(aligned)
            }
            None => {
                trace!("offset {} cannot be aligned to {}", offset, size);
                self.fault = true;
                None
            }
        }
    }

    /// `offset + delta`, faulting on overflow
    fn advance(&mut self, offset: u64, delta: u64) -> Option<u64> {
        let next = offset.checked_add(delta);
        if next.is_none() {
            trace!("offset {} + {} overflows", offset, delta);
            self.fault = true;
        }
        next
    }

    fn u16(&mut self, address: u64) -> Option<u16> {
        self.read(address, |r, a| r.read_u16(a))
    }

    fn port(&mut self, address: u64) -> Option<u16> {
        self.read(address, |r, a| r.read_u16_be(a))
    }

    fn u32(&mut self, address: u64) -> Option<u32> {
        self.read(address, |r, a| r.read_u32(a))
    }

    fn ipv6(&mut self, address: u64) -> Option<[u32; 4]> {
        self.read(address, |r, a| {
            let bytes: [u8; 16] = r.read_array(a)?;
            let mut words = [0u32; 4];
            for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            Ok(words)
        })
    }

    /// Read a pointer; a null pointer counts as a fault
    fn non_null_ptr(&mut self, address: u64) -> Option<u64> {
        match self.read(address, |r, a| r.read_ptr(a)) {
            Some(0) => {
                self.fault = true;
                None
            }
            ptr => ptr,
        }
    }
}

fn at(base: u64, offset: u64) -> u64 {
    base.wrapping_add(offset)
}

/// Align the candidate in `offset` and read a network order port there
fn read_port<R: ReadMemory + ?Sized>(
    attempt: &mut Attempt<'_, R>,
    subject: u64,
    offset: &mut u64,
    stride: u64,
) -> Option<u16> {
    let offset = attempt.align(subject, offset, stride)?;
    attempt.port(at(subject, offset))
}

/// Align the candidate in `offset` and read a raw u32 there
fn read_u32<R: ReadMemory + ?Sized>(
    attempt: &mut Attempt<'_, R>,
    subject: u64,
    offset: &mut u64,
    stride: u64,
) -> Option<u32> {
    let offset = attempt.align(subject, offset, stride)?;
    attempt.u32(at(subject, offset))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{GuessField, GuessFields, iterate};
    use crate::error::Error;
    use crate::guess::{GuessHeader, GuessWhat, TracerStatus, TracerValues};
    use crate::map::GuessMap;
    use crate::memory::MemoryImage;

    /// A struct with an 8-byte aligned port at offset 40, driven through the
    /// driver's offset + 1 retry protocol.
    #[test]
    fn test_port_scenario_converges_on_8_byte_stride() {
        let base = 0x7000u64;
        let image = MemoryImage::builder()
            .region(base, 64)
            .u16_be(base, 0x0102)
            .u16_be(base + 16, 0x1f91)
            .u16_be(base + 40, 0x1f90)
            .build()
            .unwrap();

        let mut candidate = 0;
        let mut tried = Vec::new();
        loop {
            let mut attempt = Attempt::new(&image);
            let mut offset = candidate;
            let port = read_port(&mut attempt, base, &mut offset, 8);
            tried.push(offset);
            assert!(!attempt.fault);
            if port == Some(8080) {
                break;
            }
            candidate = offset + 1;
        }

        assert_eq!(tried, vec![0, 8, 16, 24, 32, 40]);
    }

    // Odd base: every 2-byte aligned candidate is an odd offset
    const SUBJECT: u64 = 0x7001;

    fn dport_fields(threshold: u64) -> GuessFields<TracerStatus> {
        let dport = GuessField::<TracerStatus>::new(
            GuessWhat::DPort,
            |o| o.dport,
            |o| &mut o.dport,
            |v, e| v.dport == e.dport,
        )
        .threshold(threshold);
        let sport = GuessField::<TracerStatus>::new(
            GuessWhat::SPort,
            |o| o.sport,
            |o| &mut o.sport,
            |v, e| v.sport == e.sport,
        );
        let mut fields = GuessFields::new(vec![dport, sport]);
        fields.fixup(400).unwrap();
        fields
    }

    /// Alternate the field engine and the driver step until DPort is left
    fn calibrate_dport(threshold: u64) -> (crate::Result<()>, Vec<u64>, TracerStatus) {
        let image = MemoryImage::builder()
            .region(SUBJECT, 64)
            .u16_be(SUBJECT + 1, 0x0102)
            .u16_be(SUBJECT + 17, 0x1f91)
            .u16_be(SUBJECT + 41, 0x1f90)
            .build()
            .unwrap();
        let task = TaskContext::new("offsetguess", 1);
        let expected = TracerValues {
            dport: 8080,
            ..Default::default()
        };

        let mut fields = dport_fields(threshold);
        let mut record = TracerStatus {
            header: GuessHeader {
                proc: ProcessName::new("offsetguess"),
                ..Default::default()
            },
            ..Default::default()
        };
        fields.start(&mut record);
        let mut map = GuessMap::with_value(record);

        let mut tried = Vec::new();
        loop {
            let outcome = guess_tracer_offsets(&mut map, &task, SUBJECT, &image);
            assert_eq!(outcome, ProbeOutcome::Published { fault: false });
            let mut record = map.lookup().unwrap();
            tried.push(record.offsets.dport);
            let result = iterate(&mut record, &mut fields, &expected, &mut 10);
            map.update(record);
            if result.is_err() || record.header.what() != Some(GuessWhat::DPort) {
                return (result, tried, record);
            }
        }
    }

    #[test]
    fn test_port_scenario_through_engine_and_driver() {
        let (result, tried, record) = calibrate_dport(400);
        result.unwrap();

        let expected: Vec<u64> = (1..=41).step_by(2).collect();
        assert_eq!(tried, expected);
        assert_eq!(record.offsets.dport, 41);
        assert_eq!(record.values.dport, 8080);
        assert_eq!(record.header.what(), Some(GuessWhat::SPort));
        assert_eq!(record.header.state, crate::guess::GuessPhase::Checking);
    }

    #[test]
    fn test_port_scenario_stops_at_threshold() {
        let (result, tried, _) = calibrate_dport(40);
        assert!(matches!(
            result,
            Err(Error::ThresholdExceeded {
                what: GuessWhat::DPort,
                offset: 40,
                threshold: 40
            })
        ));
        assert_eq!(tried.last(), Some(&39));
        assert_eq!(tried.len(), 20);
    }

    #[test]
    fn test_null_pointer_counts_as_fault() {
        let image = MemoryImage::builder().region(0x100, 16).build().unwrap();
        let mut attempt = Attempt::new(&image);
        assert_eq!(attempt.non_null_ptr(0x100), None);
        assert!(attempt.fault);
    }

    #[test]
    fn test_unalignable_candidate_faults_without_reading() {
        let image = MemoryImage::builder().region(0x1000, 16).build().unwrap();
        let mut attempt = Attempt::new(&image);
        let mut offset = u64::MAX - 1;
        assert_eq!(read_u32(&mut attempt, 0x1000, &mut offset, 4), None);
        assert!(attempt.fault);
        assert_eq!(attempt.reads, 0);
        assert_eq!(offset, u64::MAX - 1);

        let mut attempt = Attempt::new(&image);
        assert_eq!(attempt.advance(u64::MAX - 2, 4), None);
        assert!(attempt.fault);
    }

    #[test]
    fn test_ipv6_words_keep_memory_order() {
        let bytes = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let image = MemoryImage::builder()
            .region(0x100, 16)
            .bytes(0x100, &bytes)
            .build()
            .unwrap();
        let mut attempt = Attempt::new(&image);
        let words = attempt.ipv6(0x100).unwrap();
        assert_eq!(words[0].to_ne_bytes(), [0x20, 0x01, 0x0d, 0xb8]);
        assert_eq!(words[3].to_ne_bytes(), [0, 0, 0, 1]);
    }
}
