//! Layout command implementation.

use anyhow::Result;
use offsetguess_core::KernelLayout;

/// Print the built-in simulated kernel layout, a starting point for
/// `simulate --layout`
pub fn run() -> Result<()> {
    println!("{}", KernelLayout::default().to_json()?);
    Ok(())
}
