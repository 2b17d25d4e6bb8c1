//! Field bookkeeping and the advance-or-retry step of the driver

use std::fmt;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::guess::{GuessPhase, GuessRecord, GuessWhat, SubjectKind};

type OffsetGet<S> = fn(&<S as GuessRecord>::Offsets) -> u64;
type OffsetSet<S> = fn(&mut <S as GuessRecord>::Offsets) -> &mut u64;
type ValuesEqual<S> = fn(&<S as GuessRecord>::Values, &<S as GuessRecord>::Values) -> bool;
type Increment<S> = fn(&GuessField<S>, &mut <S as GuessRecord>::Offsets, bool);

/// One calibrated field and how the driver searches for it
pub struct GuessField<S: GuessRecord> {
    pub what: GuessWhat,
    pub subject: SubjectKind,
    pub optional: bool,
    /// Exclusive upper bound on the offset; `None` until fixed up
    pub threshold: Option<u64>,
    pub finished: bool,
    offset: OffsetGet<S>,
    offset_mut: OffsetSet<S>,
    start_offset: Option<OffsetGet<S>>,
    equal: ValuesEqual<S>,
    increment: Option<Increment<S>>,
    skip_on_overflow: usize,
}

impl<S: GuessRecord> GuessField<S> {
    pub fn new(
        what: GuessWhat,
        offset: OffsetGet<S>,
        offset_mut: OffsetSet<S>,
        equal: ValuesEqual<S>,
    ) -> Self {
        Self {
            what,
            subject: what.subject(),
            optional: false,
            threshold: None,
            finished: false,
            offset,
            offset_mut,
            start_offset: None,
            equal,
            increment: None,
            skip_on_overflow: 1,
        }
    }

    /// Allow the search to give up, skipping `skip` fields (this one included)
    pub fn optional(mut self, skip: usize) -> Self {
        self.optional = true;
        self.skip_on_overflow = skip.max(1);
        self
    }

    pub fn threshold(mut self, threshold: u64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Start the search at an offset found by an earlier field
    pub fn start_from(mut self, start: OffsetGet<S>) -> Self {
        self.start_offset = Some(start);
        self
    }

    pub fn increment_with(mut self, increment: Increment<S>) -> Self {
        self.increment = Some(increment);
        self
    }

    pub fn offset(&self, offsets: &S::Offsets) -> u64 {
        (self.offset)(offsets)
    }

    pub fn threshold_or_default(&self) -> u64 {
        self.threshold.unwrap_or(u64::MAX)
    }

    fn matches(&self, actual: &S::Values, expected: &S::Values) -> bool {
        (self.equal)(actual, expected)
    }

    fn increment(&self, offsets: &mut S::Offsets, errored: bool) {
        match self.increment {
            Some(increment) => increment(self, offsets, errored),
            None => {
                let offset = (self.offset_mut)(offsets);
                *offset = offset.saturating_add(1);
            }
        }
    }

    fn seed(&self, offsets: &mut S::Offsets) {
        if let Some(start) = self.start_offset {
            let offset = start(offsets);
            *(self.offset_mut)(offsets) = offset;
        }
    }
}

impl<S: GuessRecord> fmt::Debug for GuessField<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuessField")
            .field("what", &self.what)
            .field("subject", &self.subject)
            .field("optional", &self.optional)
            .field("threshold", &self.threshold)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Ordered list of fields; guessed front to back
#[derive(Debug)]
pub struct GuessFields<S: GuessRecord> {
    fields: Vec<GuessField<S>>,
}

impl<S: GuessRecord> GuessFields<S> {
    pub fn new(fields: Vec<GuessField<S>>) -> Self {
        Self { fields }
    }

    /// Give every field without its own threshold the configured one
    pub fn fixup(&mut self, threshold: u64) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::InvalidConfig("no fields to guess".to_string()));
        }
        for field in &mut self.fields {
            if field.threshold.is_none() {
                field.threshold = Some(threshold);
            }
        }
        Ok(())
    }

    pub fn first(&self) -> Option<&GuessField<S>> {
        self.fields.first()
    }

    pub fn get(&self, what: GuessWhat) -> Option<&GuessField<S>> {
        self.fields.iter().find(|f| f.what == what)
    }

    pub fn is_finished(&self, what: GuessWhat) -> bool {
        self.get(what).is_some_and(|f| f.finished)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuessField<S>> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Arm `record` for the first field
    pub fn start(&self, record: &mut S) {
        self.advance_to(record, 0);
    }

    fn position(&self, what: GuessWhat) -> Option<usize> {
        self.fields.iter().position(|f| f.what == what)
    }

    /// Arm the record for the field at `index`, or mark it ready past the end
    fn advance_to(&self, record: &mut S, index: usize) {
        match self.fields.get(index) {
            Some(next) => {
                next.seed(record.offsets_mut());
                record.header_mut().arm(next.what);
            }
            None => {
                record.header_mut().state = GuessPhase::Ready;
            }
        }
    }
}

/// Check the probe's answer and prepare the next request.
///
/// `record` is the snapshot read back from the map; on return it holds what
/// must be written back. `retries` counts down the arms that the hooks never
/// answered.
pub fn iterate<S: GuessRecord>(
    record: &mut S,
    fields: &mut GuessFields<S>,
    expected: &S::Values,
    retries: &mut u32,
) -> Result<()> {
    let header = *record.header();
    let what = header
        .what()
        .ok_or_else(|| Error::InvalidOffset(format!("unknown guess target {}", header.what)))?;

    if header.state != GuessPhase::Checked {
        if *retries == 0 {
            return Err(Error::RetriesExhausted(what));
        }
        *retries -= 1;
        trace!("{} not checked yet ({}), {} retries left", what, header.state, retries);
        return Ok(());
    }

    let index = fields
        .position(what)
        .ok_or_else(|| Error::InvalidOffset(format!("{} is not being guessed", what)))?;

    let field = &fields.fields[index];
    if !header.err && field.matches(record.values(), expected) {
        debug!(
            "Guessed {} with offset of {} bytes",
            what,
            field.offset(record.offsets())
        );
        fields.fields[index].finished = true;
        fields.advance_to(record, index + 1);
        return Ok(());
    }

    field.increment(record.offsets_mut(), header.err);
    let offset = field.offset(record.offsets());
    let threshold = field.threshold_or_default();
    if offset >= threshold {
        if field.optional {
            debug!(
                "Giving up on optional {} at offset {}, skipping {} field(s)",
                what, offset, field.skip_on_overflow
            );
            let skip = field.skip_on_overflow;
            fields.advance_to(record, index + skip);
            return Ok(());
        }
        return Err(Error::ThresholdExceeded {
            what,
            offset,
            threshold,
        });
    }

    record.header_mut().arm(what);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guess::{ConntrackOffsets, ConntrackStatus, ConntrackValues};

    fn origin() -> GuessField<ConntrackStatus> {
        GuessField::<ConntrackStatus>::new(
            GuessWhat::CtTupleOrigin,
            |o| o.origin,
            |o| &mut o.origin,
            |v, e| v.saddr == e.saddr,
        )
    }

    fn reply() -> GuessField<ConntrackStatus> {
        GuessField::<ConntrackStatus>::new(
            GuessWhat::CtTupleReply,
            |o| o.reply,
            |o| &mut o.reply,
            |v, e| v.daddr == e.daddr,
        )
        .start_from(|o| o.origin)
    }

    fn status() -> GuessField<ConntrackStatus> {
        GuessField::<ConntrackStatus>::new(
            GuessWhat::CtStatus,
            |o| o.status,
            |o| &mut o.status,
            |v, e| v.status == e.status,
        )
    }

    fn checked(
        what: GuessWhat,
        offsets: ConntrackOffsets,
        values: ConntrackValues,
    ) -> ConntrackStatus {
        let mut record = ConntrackStatus {
            offsets,
            values,
            ..Default::default()
        };
        record.header.arm(what);
        record.header.state = GuessPhase::Checked;
        record
    }

    fn expected() -> ConntrackValues {
        ConntrackValues {
            saddr: 1,
            daddr: 2,
            status: 0x188,
            netns: 0,
        }
    }

    #[test]
    fn test_fixup_fills_missing_thresholds() {
        let mut fields = GuessFields::new(vec![origin().threshold(10), reply()]);
        fields.fixup(400).unwrap();
        let thresholds: Vec<_> = fields.iter().map(|f| f.threshold).collect();
        assert_eq!(thresholds, vec![Some(10), Some(400)]);

        assert!(GuessFields::<ConntrackStatus>::new(vec![]).fixup(400).is_err());
    }

    #[test]
    fn test_unanswered_arm_consumes_retry() {
        let mut fields = GuessFields::new(vec![origin()]);
        fields.fixup(400).unwrap();
        let mut record = ConntrackStatus::default();
        record.header.arm(GuessWhat::CtTupleOrigin);

        let mut retries = 2;
        iterate(&mut record, &mut fields, &expected(), &mut retries).unwrap();
        iterate(&mut record, &mut fields, &expected(), &mut retries).unwrap();
        assert_eq!(retries, 0);
        assert_eq!(record.header.state, GuessPhase::Checking);

        let err = iterate(&mut record, &mut fields, &expected(), &mut retries).unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted(GuessWhat::CtTupleOrigin)));
    }

    #[test]
    fn test_match_advances_and_seeds_start_offset() {
        let mut fields = GuessFields::new(vec![origin(), reply()]);
        fields.fixup(400).unwrap();
        let offsets = ConntrackOffsets {
            origin: 16,
            ..Default::default()
        };
        let mut record = checked(GuessWhat::CtTupleOrigin, offsets, expected());

        iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap();
        assert!(fields.is_finished(GuessWhat::CtTupleOrigin));
        assert_eq!(record.header.what(), Some(GuessWhat::CtTupleReply));
        assert_eq!(record.header.state, GuessPhase::Checking);
        assert_eq!(record.offsets.reply, 16);
    }

    #[test]
    fn test_last_match_sets_ready() {
        let mut fields = GuessFields::new(vec![status()]);
        fields.fixup(400).unwrap();
        let mut record = checked(GuessWhat::CtStatus, Default::default(), expected());
        iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap();
        assert_eq!(record.header.state, GuessPhase::Ready);
    }

    #[test]
    fn test_mismatch_increments_and_rearms() {
        let mut fields = GuessFields::new(vec![status()]);
        fields.fixup(400).unwrap();
        let offsets = ConntrackOffsets {
            status: 8,
            ..Default::default()
        };
        let mut record = checked(GuessWhat::CtStatus, offsets, ConntrackValues::default());
        iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap();
        assert_eq!(record.offsets.status, 9);
        assert_eq!(record.header.state, GuessPhase::Checking);
        assert!(!fields.is_finished(GuessWhat::CtStatus));
    }

    #[test]
    fn test_error_is_never_a_match() {
        let mut fields = GuessFields::new(vec![status()]);
        fields.fixup(400).unwrap();
        let mut record = checked(GuessWhat::CtStatus, Default::default(), expected());
        record.header.err = true;
        iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap();
        assert_eq!(record.offsets.status, 1);
        assert_eq!(record.header.state, GuessPhase::Checking);
    }

    #[test]
    fn test_required_field_overflow() {
        let mut fields = GuessFields::new(vec![status().threshold(8)]);
        fields.fixup(400).unwrap();
        let offsets = ConntrackOffsets {
            status: 7,
            ..Default::default()
        };
        let mut record = checked(GuessWhat::CtStatus, offsets, ConntrackValues::default());
        let err = iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap_err();
        assert!(matches!(
            err,
            Error::ThresholdExceeded {
                what: GuessWhat::CtStatus,
                offset: 8,
                threshold: 8
            }
        ));
    }

    #[test]
    fn test_increment_at_top_of_range_saturates() {
        let mut fields = GuessFields::new(vec![status()]);
        fields.fixup(400).unwrap();
        let offsets = ConntrackOffsets {
            status: u64::MAX,
            ..Default::default()
        };
        let mut record = checked(GuessWhat::CtStatus, offsets, ConntrackValues::default());
        record.header.err = true;
        let err = iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap_err();
        assert!(matches!(err, Error::ThresholdExceeded { offset: u64::MAX, .. }));
    }

    #[test]
    fn test_optional_field_overflow_skips_group() {
        let mut fields =
            GuessFields::new(vec![origin().optional(2).threshold(4), reply(), status()]);
        fields.fixup(400).unwrap();
        let offsets = ConntrackOffsets {
            origin: 3,
            ..Default::default()
        };
        let mut record = checked(GuessWhat::CtTupleOrigin, offsets, ConntrackValues::default());
        iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap();
        assert_eq!(record.header.what(), Some(GuessWhat::CtStatus));
        assert_eq!(record.header.state, GuessPhase::Checking);
        assert!(!fields.is_finished(GuessWhat::CtTupleOrigin));
        assert!(!fields.is_finished(GuessWhat::CtTupleReply));
    }

    #[test]
    fn test_custom_increment() {
        let field = status().increment_with(|_, offsets, errored| {
            offsets.status += if errored { 4 } else { 2 };
        });
        let mut fields = GuessFields::new(vec![field]);
        fields.fixup(400).unwrap();
        let mut record =
            checked(GuessWhat::CtStatus, Default::default(), ConntrackValues::default());
        record.header.err = true;
        iterate(&mut record, &mut fields, &expected(), &mut 100).unwrap();
        assert_eq!(record.offsets.status, 4);
    }

    #[test]
    fn test_unregistered_target_is_error() {
        let mut fields = GuessFields::new(vec![status()]);
        fields.fixup(400).unwrap();
        let mut record = checked(GuessWhat::CtNet, Default::default(), expected());
        assert!(iterate(&mut record, &mut fields, &expected(), &mut 100).is_err());
    }
}
