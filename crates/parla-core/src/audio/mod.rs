pub mod capture;
pub mod segmenter;
pub mod wav;

pub use capture::{AudioCapture, CaptureStream};
pub use segmenter::{AudioSegment, Segmenter, SegmenterConfig};
pub use wav::encode_wav;
