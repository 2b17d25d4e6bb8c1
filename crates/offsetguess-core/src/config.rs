//! Calibration configuration
//!
//! ## Example
//!
//! ```ignore
//! use offsetguess_core::config::{GuessConfig, KernelVersion};
//!
//! let config = GuessConfig::builder()
//!     .offset_guess_threshold(800)
//!     .kernel_version(KernelVersion::new(5, 4, 0))
//!     .collect_udpv6(false)
//!     .build()?;
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::layout::task::COMM_LEN;

/// Default upper bound on any candidate offset
pub const DEFAULT_OFFSET_GUESS_THRESHOLD: u64 = 400;
/// Largest threshold a configuration may request
pub const MAX_OFFSET_GUESS_THRESHOLD: u64 = 3000;
/// Default number of unanswered arms tolerated per run
pub const DEFAULT_MAX_RETRIES: u32 = 100;
/// Default name of the calibration thread
pub const DEFAULT_PROCESS_NAME: &str = "offsetguess";

/// Kernel release as `major.minor.patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for KernelVersion {
    fn default() -> Self {
        Self::new(5, 15, 0)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KernelVersion {
    type Err = Error;

    /// Parse a release string such as `5.15.0-91-generic`; a missing patch
    /// level reads as 0 and any suffix after the numeric part is ignored.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid kernel version '{}'", s));

        let mut parts = s.trim().splitn(3, '.');
        let mut component = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(part) => {
                    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                    digits.parse().map_err(|_| invalid())
                }
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };

        let major = component(true)?;
        let minor = component(true)?;
        let patch = component(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for KernelVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KernelVersion> for String {
    fn from(version: KernelVersion) -> Self {
        version.to_string()
    }
}

/// Settings for one calibration run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuessConfig {
    /// Offsets at or beyond this value abort the search for a field
    pub offset_guess_threshold: u64,
    /// Unanswered arms tolerated before giving up
    pub max_retries: u32,
    pub collect_tcpv6: bool,
    pub collect_udpv6: bool,
    pub kernel_version: KernelVersion,
    /// Name the calibration thread runs under
    pub process_name: String,
    /// Whole-run attempts
    pub run_attempts: u32,
    /// Delay between whole-run attempts, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for GuessConfig {
    fn default() -> Self {
        Self {
            offset_guess_threshold: DEFAULT_OFFSET_GUESS_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            collect_tcpv6: true,
            collect_udpv6: true,
            kernel_version: KernelVersion::default(),
            process_name: DEFAULT_PROCESS_NAME.to_string(),
            run_attempts: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl GuessConfig {
    /// Create a new configuration builder
    pub fn builder() -> GuessConfigBuilder {
        GuessConfigBuilder::default()
    }

    /// Load and validate a configuration from a JSON file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: GuessConfig = serde_json::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset_guess_threshold == 0 {
            return Err(Error::InvalidConfig(
                "offset_guess_threshold must be positive".to_string(),
            ));
        }
        if self.offset_guess_threshold > MAX_OFFSET_GUESS_THRESHOLD {
            return Err(Error::InvalidConfig(format!(
                "offset_guess_threshold {} exceeds maximum of {}",
                self.offset_guess_threshold, MAX_OFFSET_GUESS_THRESHOLD
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries must be positive".to_string()));
        }
        if self.run_attempts == 0 {
            return Err(Error::InvalidConfig("run_attempts must be positive".to_string()));
        }
        // The kernel keeps COMM_LEN - 1 bytes plus the terminating NUL
        if self.process_name.is_empty() || self.process_name.len() >= COMM_LEN {
            return Err(Error::InvalidConfig(format!(
                "process_name '{}' must be 1 to {} bytes",
                self.process_name,
                COMM_LEN - 1
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether IPv6 connections are calibrated at all
    pub fn collects_ipv6(&self) -> bool {
        self.collect_tcpv6 || self.collect_udpv6
    }
}

/// Builder for GuessConfig
#[derive(Debug, Clone, Default)]
pub struct GuessConfigBuilder {
    offset_guess_threshold: Option<u64>,
    max_retries: Option<u32>,
    collect_tcpv6: Option<bool>,
    collect_udpv6: Option<bool>,
    kernel_version: Option<KernelVersion>,
    process_name: Option<String>,
    run_attempts: Option<u32>,
    retry_delay: Option<Duration>,
}

impl GuessConfigBuilder {
    pub fn offset_guess_threshold(mut self, threshold: u64) -> Self {
        self.offset_guess_threshold = Some(threshold);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn collect_tcpv6(mut self, enabled: bool) -> Self {
        self.collect_tcpv6 = Some(enabled);
        self
    }

    pub fn collect_udpv6(mut self, enabled: bool) -> Self {
        self.collect_udpv6 = Some(enabled);
        self
    }

    pub fn kernel_version(mut self, version: KernelVersion) -> Self {
        self.kernel_version = Some(version);
        self
    }

    pub fn process_name<S: Into<String>>(mut self, name: S) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn run_attempts(mut self, attempts: u32) -> Self {
        self.run_attempts = Some(attempts);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<GuessConfig> {
        let default = GuessConfig::default();
        let config = GuessConfig {
            offset_guess_threshold: self
                .offset_guess_threshold
                .unwrap_or(default.offset_guess_threshold),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            collect_tcpv6: self.collect_tcpv6.unwrap_or(default.collect_tcpv6),
            collect_udpv6: self.collect_udpv6.unwrap_or(default.collect_udpv6),
            kernel_version: self.kernel_version.unwrap_or(default.kernel_version),
            process_name: self.process_name.unwrap_or(default.process_name),
            run_attempts: self.run_attempts.unwrap_or(default.run_attempts),
            retry_delay_ms: self
                .retry_delay
                .map(|d| d.as_millis() as u64)
                .unwrap_or(default.retry_delay_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = GuessConfig::builder().build().unwrap();
        assert_eq!(config.offset_guess_threshold, 400);
        assert_eq!(config.max_retries, 100);
        assert_eq!(config.run_attempts, 5);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert!(config.collects_ipv6());
    }

    #[test]
    fn test_threshold_ceiling() {
        assert!(GuessConfig::builder().offset_guess_threshold(3000).build().is_ok());
        let err = GuessConfig::builder()
            .offset_guess_threshold(3001)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(GuessConfig::builder().offset_guess_threshold(0).build().is_err());
    }

    #[test]
    fn test_process_name_must_fit_comm() {
        assert!(GuessConfig::builder().process_name("a".repeat(15)).build().is_ok());
        assert!(GuessConfig::builder().process_name("a".repeat(16)).build().is_err());
        assert!(GuessConfig::builder().process_name("").build().is_err());
    }

    #[test]
    fn test_kernel_version_parse() {
        assert_eq!(
            "5.15.0-91-generic".parse::<KernelVersion>().unwrap(),
            KernelVersion::new(5, 15, 0)
        );
        assert_eq!("4.7".parse::<KernelVersion>().unwrap(), KernelVersion::new(4, 7, 0));
        assert_eq!(
            "6.1.55+".parse::<KernelVersion>().unwrap(),
            KernelVersion::new(6, 1, 55)
        );
        assert!("5".parse::<KernelVersion>().is_err());
        assert!("linux".parse::<KernelVersion>().is_err());
    }

    #[test]
    fn test_kernel_version_ordering() {
        assert!(KernelVersion::new(4, 6, 9) < KernelVersion::new(4, 7, 0));
        assert!(KernelVersion::new(5, 18, 0) > KernelVersion::new(5, 4, 200));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        let json = r#"{
            "offset_guess_threshold": 1200,
            "kernel_version": "4.4.0",
            "collect_udpv6": false
        }"#;
        write!(file, "{}", json).unwrap();

        let config = GuessConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.offset_guess_threshold, 1200);
        assert_eq!(config.kernel_version, KernelVersion::new(4, 4, 0));
        assert!(!config.collect_udpv6);
        assert!(config.collect_tcpv6);
        assert_eq!(config.process_name, DEFAULT_PROCESS_NAME);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"offset_guess_threshold": 5000}}"#).unwrap();
        assert!(matches!(
            GuessConfig::load_from_path(file.path()),
            Err(Error::InvalidConfig(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"kernel_version": "x.y"}}"#).unwrap();
        assert!(matches!(
            GuessConfig::load_from_path(file.path()),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = GuessConfig::load_from_path("/nonexistent/offsetguess.json").unwrap_err();
        assert!(err.is_not_found());
    }
}
