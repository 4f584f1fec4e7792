//! Training: filelist data pipeline and the adversarial trainer

pub mod data;
mod trainer;

pub use data::{collate, parse_filelist, Batch, FileEntry, FilelistDataset, Sample};
pub use trainer::{EpochSummary, GanTrainer, StepReport, TrainerState};
