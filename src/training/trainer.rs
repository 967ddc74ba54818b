use clap::Args;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info};

use super::dataset::inspect_dataset;
use crate::error::DatasetError;

/// Options forwarded to the external `yolo classify train` CLI.
#[derive(Debug, Clone, Args)]
pub struct TrainArgs {
    /// Dataset root containing `train/` and `val/` class folders
    pub dataset: PathBuf,

    #[arg(long, default_value = "yolov8n-cls.pt")]
    pub model: String,

    #[arg(long, default_value_t = 50)]
    pub epochs: u32,

    #[arg(long, default_value_t = 224)]
    pub imgsz: u32,

    #[arg(long, default_value_t = 16)]
    pub batch: u32,

    #[arg(long, default_value_t = 10)]
    pub patience: u32,

    #[arg(long, default_value = "solar_panel_defect")]
    pub name: String,

    /// GPU index, or `cpu`
    #[arg(long, default_value = "0")]
    pub device: String,

    #[arg(long, default_value = "yolo")]
    pub yolo_bin: String,

    /// Print the command instead of running it
    #[arg(long)]
    pub dry_run: bool,
}

impl TrainArgs {
    pub fn command_args(&self) -> Vec<String> {
        vec![
            "classify".to_string(),
            "train".to_string(),
            format!("data={}", self.dataset.display()),
            format!("model={}", self.model),
            format!("epochs={}", self.epochs),
            format!("imgsz={}", self.imgsz),
            format!("batch={}", self.batch),
            format!("name={}", self.name),
            format!("patience={}", self.patience),
            format!("device={}", self.device),
        ]
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.yolo_bin.clone())
            .chain(self.command_args())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Where the trainer writes its best checkpoint.
    pub fn best_weights_path(&self) -> PathBuf {
        PathBuf::from("runs/classify")
            .join(&self.name)
            .join("weights/best.pt")
    }
}

/// Validates the dataset, then runs the external trainer to completion.
pub async fn run_training(args: &TrainArgs) -> Result<(), DatasetError> {
    let summary = inspect_dataset(&args.dataset)?;
    info!(
        "Dataset {} has {} images across {} splits",
        summary.root.display(),
        summary.total_images(),
        summary.splits.len()
    );

    if args.dry_run {
        println!("{}", args.command_line());
        return Ok(());
    }

    info!("Starting training: {}", args.command_line());
    let status = Command::new(&args.yolo_bin)
        .args(args.command_args())
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| {
            DatasetError::TrainingFailed(format!("could not start {}: {}", args.yolo_bin, e))
        })?;

    if !status.success() {
        error!("Training exited with {}", status);
        return Err(DatasetError::TrainingFailed(format!(
            "{} exited with {}",
            args.yolo_bin, status
        )));
    }

    info!(
        "Training completed, best weights at {}",
        args.best_weights_path().display()
    );
    Ok(())
}
