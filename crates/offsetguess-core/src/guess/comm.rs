use std::fmt;

use crate::memory::layout::task::COMM_LEN;

/// Fixed-size task name, as found in `task_struct->comm`
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessName([u8; COMM_LEN]);

impl ProcessName {
    /// Create from a string, truncating to `COMM_LEN` bytes
    pub fn new(name: &str) -> Self {
        let mut comm = [0u8; COMM_LEN];
        let len = name.len().min(COMM_LEN);
        comm[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(comm)
    }

    pub fn from_bytes(bytes: [u8; COMM_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COMM_LEN] {
        &self.0
    }

    /// Compare two names with NUL-terminated string semantics.
    ///
    /// Bytes after the first NUL shared by both buffers are ignored.
    pub fn comm_equals(&self, other: &ProcessName) -> bool {
        for i in 0..COMM_LEN {
            if self.0[i] != other.0[i] {
                return false;
            }
            if self.0[i] == 0 {
                break;
            }
        }
        true
    }

    pub fn to_string_lossy(&self) -> String {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        String::from_utf8_lossy(&self.0[..len]).into_owned()
    }
}

impl fmt::Debug for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessName({:?})", self.to_string_lossy())
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}
