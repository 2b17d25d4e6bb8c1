//! Simulated kernel
//!
//! A [`SimulatedHost`] lays the structures the probes calibrate out in a
//! [`MemoryImage`](crate::memory::MemoryImage) according to a
//! [`KernelLayout`], and plays the kernel activity a calibration triggers.
//! Both calibrations can run end to end against it and be checked against
//! the layout's true offsets.

mod host;
mod layout;

pub use host::SimulatedHost;
pub use layout::{
    FlowLayout, KernelLayout, MAX_OBJECT_SIZE, NetLayout, NfConnLayout, SkBuffLayout,
    SocketLayout, SockLayout,
};
