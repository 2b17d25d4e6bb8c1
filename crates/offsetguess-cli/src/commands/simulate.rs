//! Simulate command implementation.
//!
//! Runs the socket and conntrack calibrations against a simulated kernel and
//! compares every discovered offset with the layout the kernel was built from.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use offsetguess_core::{
    ConntrackGuesser, ConstantEditor, GuessConfig, KernelLayout, KernelVersion,
    OffsetGuessProgram, SimulatedHost, TracerGuesser, run_offset_guessing,
};
use serde::Serialize;
use tracing::info;

/// Options of the simulate command
#[derive(Debug, Default)]
pub struct SimulateOptions {
    pub layout: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub threshold: Option<u64>,
    pub kernel: Option<KernelVersion>,
    pub no_ipv6: bool,
    pub json: bool,
}

/// One discovered offset next to its true value
#[derive(Debug, Serialize)]
struct FieldReport {
    field: String,
    offset: u64,
    expected: u64,
}

impl FieldReport {
    fn new(field: impl ToString, offset: u64, expected: u64) -> Self {
        Self {
            field: field.to_string(),
            offset,
            expected,
        }
    }

    fn matches(&self) -> bool {
        self.offset == self.expected
    }
}

#[derive(Debug, Serialize)]
struct Report {
    kernel: KernelVersion,
    attempt: u32,
    tracer_iterations: u64,
    conntrack_iterations: u64,
    events: u64,
    published: u64,
    fields: Vec<FieldReport>,
    constants: Vec<ConstantEditor>,
}

impl Report {
    fn mismatches(&self) -> impl Iterator<Item = &FieldReport> {
        self.fields.iter().filter(|f| !f.matches())
    }
}

/// Merge the configuration file with command line overrides
fn build_config(options: &SimulateOptions) -> Result<GuessConfig> {
    let mut config = match &options.config {
        Some(path) => GuessConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => GuessConfig::default(),
    };
    if let Some(threshold) = options.threshold {
        config.offset_guess_threshold = threshold;
    }
    if let Some(kernel) = options.kernel {
        config.kernel_version = kernel;
    }
    if options.no_ipv6 {
        config.collect_tcpv6 = false;
        config.collect_udpv6 = false;
    }
    config.validate()?;
    Ok(config)
}

fn load_layout(options: &SimulateOptions) -> Result<KernelLayout> {
    match &options.layout {
        Some(path) => KernelLayout::load_from_path(path)
            .with_context(|| format!("Failed to load layout from {:?}", path)),
        None => Ok(KernelLayout::default()),
    }
}

/// One full calibration on a fresh host
fn calibrate(
    config: &GuessConfig,
    layout: &KernelLayout,
    attempt: u32,
) -> offsetguess_core::Result<Report> {
    let mut host = SimulatedHost::new(*layout, &config.process_name)?;
    let mut program = OffsetGuessProgram::default();

    let mut tracer = TracerGuesser::new(config.clone());
    let mut constants = tracer.guess(&mut program, &mut host)?;
    let mut conntrack = ConntrackGuesser::new(config.clone(), &constants)?;
    let ct_constants = conntrack.guess(&mut program, &mut host)?;

    let offsets = tracer.status().offsets;
    let mut fields: Vec<FieldReport> = tracer
        .fields()
        .iter()
        .filter(|f| f.finished)
        .map(|f| FieldReport::new(f.what, f.offset(&offsets), layout.offset_of(f.what)))
        .collect();
    fields.push(FieldReport::new("netns inode", offsets.ino, layout.net.ino));

    let ct_offsets = conntrack.status().offsets;
    fields.extend(conntrack.fields().iter().map(|f| {
        FieldReport::new(f.what, f.offset(&ct_offsets), layout.offset_of(f.what))
    }));

    for editor in ct_constants {
        if !constants.iter().any(|c| c.name == editor.name) {
            constants.push(editor);
        }
    }

    Ok(Report {
        kernel: config.kernel_version,
        attempt,
        tracer_iterations: tracer.iterations(),
        conntrack_iterations: conntrack.iterations(),
        events: host.events(),
        published: host.published(),
        fields,
        constants,
    })
}

fn print_report(report: &Report) {
    println!("Kernel {} (attempt {})", report.kernel, report.attempt);
    println!();
    println!("{:<32} {:>8} {:>8}", "FIELD", "OFFSET", "EXPECTED");
    for field in &report.fields {
        let mark = if field.matches() { "" } else { "  MISMATCH" };
        println!(
            "{:<32} {:>8} {:>8}{}",
            field.field, field.offset, field.expected, mark
        );
    }
    println!();
    println!(
        "{} socket and {} conntrack iterations, {} events ({} answered)",
        report.tracer_iterations, report.conntrack_iterations, report.events, report.published
    );
    println!();
    for constant in &report.constants {
        println!("{} = {}", constant.name, constant.value);
    }
}

/// Run the simulate command
pub fn run(options: &SimulateOptions) -> Result<()> {
    let config = build_config(options)?;
    let layout = load_layout(options)?;
    info!(
        "Simulating kernel {} with threshold {}",
        config.kernel_version, config.offset_guess_threshold
    );

    let report = run_offset_guessing(&config, |attempt| calibrate(&config, &layout, attempt))?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let mismatches: Vec<_> = report.mismatches().map(|f| f.field.as_str()).collect();
    if !mismatches.is_empty() {
        bail!("Guessed offsets differ from the layout: {}", mismatches.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"offset_guess_threshold": 800, "max_retries": 7}}"#).unwrap();

        let options = SimulateOptions {
            config: Some(file.path().to_path_buf()),
            kernel: Some(KernelVersion::new(4, 14, 0)),
            no_ipv6: true,
            ..Default::default()
        };
        let config = build_config(&options).unwrap();
        assert_eq!(config.offset_guess_threshold, 800);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.kernel_version, KernelVersion::new(4, 14, 0));
        assert!(!config.collects_ipv6());
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let options = SimulateOptions {
            threshold: Some(0),
            ..Default::default()
        };
        assert!(build_config(&options).is_err());
    }

    #[test]
    fn test_calibration_matches_default_layout() {
        let config = GuessConfig::default();
        let report = calibrate(&config, &KernelLayout::default(), 1).unwrap();
        assert_eq!(report.mismatches().count(), 0);
        assert!(report.fields.iter().any(|f| f.field == "netns inode"));
        assert_eq!(
            report.constants.iter().filter(|c| c.name == "tcpv6_enabled").count(),
            1
        );
        assert!(report.constants.iter().any(|c| c.name == "offset_ct_status"));
    }

    #[test]
    fn test_run_with_layout_file() {
        let mut layout = KernelLayout::default();
        layout.sock.sport = 1000;
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", layout.to_json().unwrap()).unwrap();

        let options = SimulateOptions {
            layout: Some(file.path().to_path_buf()),
            json: true,
            ..Default::default()
        };
        run(&options).unwrap();
    }

    #[test]
    fn test_missing_layout_file() {
        let options = SimulateOptions {
            layout: Some(PathBuf::from("/nonexistent/layout.json")),
            ..Default::default()
        };
        assert!(run(&options).is_err());
    }
}
