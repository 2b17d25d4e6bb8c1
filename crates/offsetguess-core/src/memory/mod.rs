mod image;
pub mod layout;
mod reader;

pub use image::{MemoryImage, MemoryImageBuilder};
pub use reader::ReadMemory;
