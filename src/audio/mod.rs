pub mod wav;

pub use wav::{sanitize, WavError, WavInfo};
