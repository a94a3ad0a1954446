mod capture;

pub use capture::{CaptureRecord, NewCapture};
