use tracing::{debug, info};

use crate::config::GuessConfig;
use crate::error::{Error, Result};
use crate::guess::{
    ConntrackOffsets, ConntrackStatus, ConntrackValues, GuessPhase, GuessWhat, ProcessName,
};
use crate::hooks::{OffsetGuessProgram, conntrack_hooks};

use super::{ConstantEditor, EventGenerator, GuessField, GuessFields, calibrate, find_constant};

fn field(
    what: GuessWhat,
    offset: fn(&ConntrackOffsets) -> u64,
    offset_mut: fn(&mut ConntrackOffsets) -> &mut u64,
    equal: fn(&ConntrackValues, &ConntrackValues) -> bool,
) -> GuessField<ConntrackStatus> {
    GuessField::new(what, offset, offset_mut, equal)
}

fn conntrack_fields() -> GuessFields<ConntrackStatus> {
    GuessFields::new(vec![
        field(GuessWhat::CtTupleOrigin, |o| o.origin, |o| &mut o.origin, |v, e| {
            v.saddr == e.saddr
        }),
        // the reply tuple follows the origin tuple
        field(GuessWhat::CtTupleReply, |o| o.reply, |o| &mut o.reply, |v, e| {
            v.daddr == e.daddr
        })
        .start_from(|o| o.origin),
        field(GuessWhat::CtStatus, |o| o.status, |o| &mut o.status, |v, e| {
            v.status == e.status
        }),
        field(GuessWhat::CtNet, |o| o.netns, |o| &mut o.netns, |v, e| v.netns == e.netns)
            .start_from(|o| o.status),
    ])
}

/// Calibrates `struct nf_conn`.
///
/// Depends on the socket calibration for the namespace inode offset.
#[derive(Debug)]
pub struct ConntrackGuesser {
    config: GuessConfig,
    fields: GuessFields<ConntrackStatus>,
    status: ConntrackStatus,
    ino: u64,
    tcpv6_enabled: u64,
    udpv6_enabled: u64,
    iterations: u64,
}

impl ConntrackGuesser {
    /// Create a guesser from the constants produced by the socket calibration
    pub fn new(config: GuessConfig, tracer_constants: &[ConstantEditor]) -> Result<Self> {
        let ino = find_constant(tracer_constants, "offset_ino").unwrap_or(0);
        if ino == 0 {
            return Err(Error::MissingPrerequisite("ino offset is 0".to_string()));
        }

        Ok(Self {
            config,
            fields: conntrack_fields(),
            status: ConntrackStatus::default(),
            ino,
            tcpv6_enabled: find_constant(tracer_constants, "tcpv6_enabled").unwrap_or(0),
            udpv6_enabled: find_constant(tracer_constants, "udpv6_enabled").unwrap_or(0),
            iterations: 0,
        })
    }

    pub fn fields(&self) -> &GuessFields<ConntrackStatus> {
        &self.fields
    }

    pub fn status(&self) -> &ConntrackStatus {
        &self.status
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn guess<G>(
        &mut self,
        program: &mut OffsetGuessProgram,
        generator: &mut G,
    ) -> Result<Vec<ConstantEditor>>
    where
        G: EventGenerator<ConntrackStatus> + ?Sized,
    {
        let ready = program
            .conntrack_status
            .lookup()
            .filter(|s| s.header.state == GuessPhase::Ready);
        if let Some(status) = ready {
            self.status = status;
            return Ok(self.constant_editors());
        }

        program.attach(conntrack_hooks());
        self.fields.fixup(self.config.offset_guess_threshold)?;

        self.status = ConntrackStatus::default();
        self.status.header.proc = ProcessName::new(&self.config.process_name);
        self.status.offsets.ino = self.ino;

        debug!(
            "Checking for conntrack offsets with threshold of {}",
            self.config.offset_guess_threshold
        );
        self.iterations = calibrate(
            program,
            |p| &mut p.conntrack_status,
            &mut self.status,
            &mut self.fields,
            generator,
            self.config.max_retries,
        )?;
        info!("Conntrack offsets guessed in {} iterations", self.iterations);

        Ok(self.constant_editors())
    }

    fn constant_editors(&self) -> Vec<ConstantEditor> {
        let o = &self.status.offsets;
        vec![
            ConstantEditor::new("offset_ct_origin", o.origin),
            ConstantEditor::new("offset_ct_reply", o.reply),
            ConstantEditor::new("offset_ct_status", o.status),
            ConstantEditor::new("offset_ct_netns", o.netns),
            ConstantEditor::new("offset_ct_ino", o.ino),
            ConstantEditor::new("tcpv6_enabled", self.tcpv6_enabled),
            ConstantEditor::new("udpv6_enabled", self.udpv6_enabled),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_ino_offset() {
        let err = ConntrackGuesser::new(GuessConfig::default(), &[]).unwrap_err();
        assert!(matches!(err, Error::MissingPrerequisite(_)));

        let constants = [ConstantEditor::new("offset_ino", 0)];
        assert!(ConntrackGuesser::new(GuessConfig::default(), &constants).is_err());
    }

    #[test]
    fn test_field_order() {
        let whats: Vec<_> = conntrack_fields().iter().map(|f| f.what).collect();
        assert_eq!(
            whats,
            vec![
                GuessWhat::CtTupleOrigin,
                GuessWhat::CtTupleReply,
                GuessWhat::CtStatus,
                GuessWhat::CtNet,
            ]
        );
    }

    /// Generator whose activity never reaches a hook
    struct Silent;

    impl EventGenerator<ConntrackStatus> for Silent {
        fn expected(&mut self) -> Result<ConntrackValues> {
            Ok(ConntrackValues::default())
        }

        fn generate(
            &mut self,
            _: GuessWhat,
            _: &mut OffsetGuessProgram,
            _: &mut ConntrackValues,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_silent_hooks_exhaust_retries() {
        let config = GuessConfig::builder().max_retries(3).build().unwrap();
        let constants = [ConstantEditor::new("offset_ino", 0x78)];
        let mut guesser = ConntrackGuesser::new(config, &constants).unwrap();
        let mut program = OffsetGuessProgram::default();

        let err = guesser.guess(&mut program, &mut Silent).unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted(GuessWhat::CtTupleOrigin)));
        assert!(program.is_attached(crate::hooks::HookPoint::NfConntrackHashInsert));
        assert_eq!(program.conntrack_status.lookup().unwrap().offsets.ino, 0x78);
    }
}
