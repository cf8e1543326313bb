//! Long-form text generation: a tournament of drafts, synthesis of the
//! winner with the best of the rest, and bounded quality loops.

pub mod batch;
pub mod chapters;
pub mod checkpoint;
pub mod compliance;
pub mod config;
pub mod continuity;
pub mod correction;
pub mod errors;
pub mod generator;
pub mod judge;
pub mod jury;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod prompts;
pub mod retake;
pub mod synthesis;
pub mod tournament;
pub mod util;

pub use errors::PipelineError;
pub use pipeline::{Pipeline, PipelineContext, PipelineOutcome, build_pipeline};
