//! Align command implementation.

use anyhow::{Context, Result, bail};
use offsetguess_core::next_aligned_offset;

/// Parse an address given in hex, with or without a 0x prefix
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
        .map_err(|e| anyhow::anyhow!("Invalid hex address '{}': {}", s, e))
}

/// Print the candidate the probes would test for `offset` on an object at `base`
pub fn run(base: &str, offset: u64, size: u64) -> Result<()> {
    if !matches!(size, 1 | 2 | 4 | 8) {
        bail!("Field size must be 1, 2, 4 or 8, got {}", size);
    }
    let base = parse_hex_address(base)?;
    let aligned = next_aligned_offset(base, offset, size).with_context(|| {
        format!("No {}-byte aligned offset at or above {} fits in 64 bits", size, offset)
    })?;

    println!("Base:    0x{:X}", base);
    println!("Offset:  {} -> {}", offset, aligned);
    println!("Address: 0x{:X}", base.wrapping_add(aligned));

    Ok(())
}
