//! Userland calibration driver
//!
//! The driver arms a record for one field, asks an [`EventGenerator`] to
//! produce the kernel activity that fires the hooks, reads the probe's answer
//! back and either advances to the next field or retries at the next offset.
//! The outcome is a list of [`ConstantEditor`]s, the form the data collection
//! probes are patched with.

mod conntrack;
mod field;
mod tracer;

use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, trace, warn};

use crate::config::GuessConfig;
use crate::error::{Error, Result};
use crate::guess::{GuessPhase, GuessRecord, GuessWhat};
use crate::hooks::OffsetGuessProgram;
use crate::map::GuessMap;

pub use conntrack::ConntrackGuesser;
pub use field::{GuessField, GuessFields, iterate};
pub use tracer::TracerGuesser;

/// Produces the kernel activity needed to calibrate a field
pub trait EventGenerator<S: GuessRecord> {
    /// Values the probes should observe once the offset is right
    fn expected(&mut self) -> Result<S::Values>;

    /// Trigger the hooks relevant to `what`, refreshing `expected` when the
    /// activity changes it
    fn generate(
        &mut self,
        what: GuessWhat,
        program: &mut OffsetGuessProgram,
        expected: &mut S::Values,
    ) -> Result<()>;
}

/// A named constant patched into the data collection probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConstantEditor {
    pub name: &'static str,
    pub value: u64,
}

impl ConstantEditor {
    pub fn new(name: &'static str, value: u64) -> Self {
        Self { name, value }
    }

    pub fn flag(name: &'static str, enabled: bool) -> Self {
        Self::new(name, u64::from(enabled))
    }
}

/// Look up a constant by name
pub fn find_constant(editors: &[ConstantEditor], name: &str) -> Option<u64> {
    editors.iter().find(|c| c.name == name).map(|c| c.value)
}

/// Drive one record until every field is settled.
///
/// `map` selects the record inside the program. Returns the number of
/// generate/iterate rounds.
fn calibrate<S, G>(
    program: &mut OffsetGuessProgram,
    map: fn(&mut OffsetGuessProgram) -> &mut GuessMap<S>,
    record: &mut S,
    fields: &mut GuessFields<S>,
    generator: &mut G,
    max_retries: u32,
) -> Result<u64>
where
    S: GuessRecord,
    G: EventGenerator<S> + ?Sized,
{
    fields.start(record);
    map(program).update(*record);

    let mut expected = generator.expected()?;
    trace!("Expected values: {:?}", expected);

    let mut retries = max_retries;
    let mut iterations = 0;
    while record.header().state != GuessPhase::Ready {
        let header = record.header();
        let what = header
            .what()
            .ok_or_else(|| Error::InvalidOffset(format!("unknown guess target {}", header.what)))?;
        generator.generate(what, program, &mut expected)?;

        *record = map(program)
            .lookup()
            .ok_or_else(|| Error::MissingPrerequisite("guess record was removed".to_string()))?;
        iterate(record, fields, &expected, &mut retries)?;
        map(program).update(*record);
        iterations += 1;
    }
    Ok(iterations)
}

/// Run a whole calibration, retrying it from scratch on failure
pub fn run_offset_guessing<T, F>(config: &GuessConfig, mut run: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let start = Instant::now();
    let attempts = config.run_attempts.max(1);
    let mut attempt = 1;
    loop {
        match run(attempt) {
            Ok(result) => {
                info!("Offset guessing complete (took {:?})", start.elapsed());
                return Ok(result);
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "Offset guessing failed: {}. Retrying in {}ms (attempt {}/{})",
                    e, config.retry_delay_ms, attempt, attempts
                );
                thread::sleep(config.retry_delay());
                attempt += 1;
            }
            Err(e) => {
                warn!("Offset guessing failed after {} attempts: {}", attempts, e);
                return Err(e);
            }
        }
    }
}
