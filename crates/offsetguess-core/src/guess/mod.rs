mod align;
mod comm;
mod phase;
mod status;
mod what;

pub use align::next_aligned_offset;
pub use comm::ProcessName;
pub use phase::GuessPhase;
pub use status::{
    ConntrackOffsets, ConntrackStatus, ConntrackValues, GuessHeader, GuessRecord, TracerOffsets,
    TracerStatus, TracerValues,
};
pub use what::{GuessWhat, SubjectKind};
