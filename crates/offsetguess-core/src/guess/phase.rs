use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr, IntoStaticStr};

/// State machine of a guess record.
///
/// The driver arms a record with `Checking`; the probe answers with `Checked`.
/// `Ready` marks a record whose every field has been found.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    FromRepr,
    IntoStaticStr,
    Display,
)]
#[repr(u32)]
pub enum GuessPhase {
    #[default]
    #[strum(serialize = "uninitialized")]
    Uninitialized = 0,
    #[strum(serialize = "checking")]
    Checking = 1,
    #[strum(serialize = "checked")]
    Checked = 2,
    #[strum(serialize = "ready")]
    Ready = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_inert() {
        assert_eq!(GuessPhase::default(), GuessPhase::Uninitialized);
    }

    #[test]
    fn test_display() {
        assert_eq!(GuessPhase::Checking.to_string(), "checking");
        assert_eq!(GuessPhase::from_repr(2), Some(GuessPhase::Checked));
        assert_eq!(GuessPhase::from_repr(9), None);
    }
}
