pub mod dataset;
pub mod trainer;

pub use dataset::{inspect_dataset, DatasetSummary};
pub use trainer::{run_training, TrainArgs};
