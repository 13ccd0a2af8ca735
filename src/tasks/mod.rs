pub mod artifacts;
pub mod loss;
pub mod train;

pub use artifacts::{parse_resume_tag, RunLayout};
pub use loss::{DecoderTerms, LossContext};
pub use train::{Networks, StepReport, Trainer};
