pub mod segmenter;
pub mod wav;

pub use segmenter::{CompletedSegment, SegmentWriter};
pub use wav::{concatenate_wavs, validate_wav, WavInfo};
