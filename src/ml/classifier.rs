use image::imageops::FilterType;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{Device, ModelsConfig};
use crate::error::{ArtifactError, GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefectLabel {
    #[serde(rename = "Bird-drop")]
    BirdDrop,
    #[serde(rename = "Clean")]
    Clean,
    #[serde(rename = "Dusty")]
    Dusty,
    #[serde(rename = "Electrical-damage")]
    ElectricalDamage,
    #[serde(rename = "Physical-Damage")]
    PhysicalDamage,
    #[serde(rename = "Snow-Covered")]
    SnowCovered,
}

impl DefectLabel {
    /// Output order of the classifier head.
    pub const ALL: [DefectLabel; 6] = [
        DefectLabel::BirdDrop,
        DefectLabel::Clean,
        DefectLabel::Dusty,
        DefectLabel::ElectricalDamage,
        DefectLabel::PhysicalDamage,
        DefectLabel::SnowCovered,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DefectLabel::BirdDrop => "Bird-drop",
            DefectLabel::Clean => "Clean",
            DefectLabel::Dusty => "Dusty",
            DefectLabel::ElectricalDamage => "Electrical-damage",
            DefectLabel::PhysicalDamage => "Physical-Damage",
            DefectLabel::SnowCovered => "Snow-Covered",
        }
    }

    pub fn is_defective(&self) -> bool {
        !matches!(self, DefectLabel::Clean)
    }
}

impl fmt::Display for DefectLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub is_defective: bool,
    pub defect_type: DefectLabel,
    pub confidence: f32,
}

impl Classification {
    pub fn from_logits(logits: &[f32]) -> GatewayResult<Self> {
        if logits.len() != DefectLabel::ALL.len() {
            return Err(GatewayError::InferenceFailure(format!(
                "classifier produced {} scores, expected {}",
                logits.len(),
                DefectLabel::ALL.len()
            )));
        }

        if logits.iter().any(|x| !x.is_finite()) {
            return Err(GatewayError::InferenceFailure(
                "classifier produced non-finite scores".into(),
            ));
        }

        let probs = softmax(logits);
        let (index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let label = DefectLabel::from_index(index).ok_or_else(|| {
            GatewayError::InferenceFailure(format!("no label for class index {}", index))
        })?;

        Ok(Self {
            is_defective: label.is_defective(),
            defect_type: label,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

/// Numerically stable normalized exponential.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// How raw pixels are turned into the network's input tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    pub input_size: u32,
    #[serde(default)]
    pub mean: Option<[f32; 3]>,
    #[serde(default)]
    pub std: Option<[f32; 3]>,
}

/// Largest accepted square input side.
pub const MAX_INPUT_SIZE: u32 = 4096;

impl Preprocessing {
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.input_size == 0 || self.input_size > MAX_INPUT_SIZE {
            return Err(ArtifactError::Invalid(format!(
                "input_size must be between 1 and {}, got {}",
                MAX_INPUT_SIZE, self.input_size
            )));
        }
        match (self.mean, self.std) {
            (None, None) => Ok(()),
            (Some(mean), Some(std)) => {
                if mean.iter().chain(&std).any(|v| !v.is_finite()) {
                    return Err(ArtifactError::Invalid("mean and std must be finite".into()));
                }
                if std.iter().any(|s| *s == 0.0) {
                    return Err(ArtifactError::Invalid("std must be non-zero".into()));
                }
                Ok(())
            }
            _ => Err(ArtifactError::Invalid(
                "mean and std must be given together".into(),
            )),
        }
    }

    /// Decodes `bytes` into a `[3, size, size]` CHW tensor, flattened.
    pub fn apply(&self, bytes: &[u8]) -> GatewayResult<Vec<f32>> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| GatewayError::InvalidInput(format!("could not decode image: {}", e)))?;

        let size = self.input_size;
        let rgb = decoded.to_rgb8();
        let resized = image::imageops::resize(&rgb, size, size, FilterType::Triangle);

        let side = size as usize;
        let plane = side * side;
        let mut tensor = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = y as usize * side + x as usize;
            for c in 0..3 {
                let mut value = pixel[c] as f32 / 255.0;
                if let (Some(mean), Some(std)) = (self.mean, self.std) {
                    value = (value - mean[c]) / std[c];
                }
                tensor[c * plane + offset] = value;
            }
        }

        Ok(tensor)
    }
}

/// A loaded classifier artifact. Inference only; implementations never
/// mutate their weights.
pub trait ImageClassifier: Send + Sync {
    fn preprocessing(&self) -> &Preprocessing;

    fn logits(&self, input: &[f32]) -> GatewayResult<Vec<f32>>;

    fn classify(&self, bytes: &[u8]) -> GatewayResult<Classification> {
        let input = self.preprocessing().apply(bytes)?;
        let logits = self.logits(&input)?;
        debug!("Classifier logits: {:?}", logits);
        Classification::from_logits(&logits)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearHeadFile {
    #[serde(flatten)]
    preprocessing: Preprocessing,
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

/// Softmax-regression head over the flattened input tensor.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    preprocessing: Preprocessing,
    weights: DMatrix<f32>,
    bias: DVector<f32>,
}

impl LinearClassifier {
    pub fn new(
        preprocessing: Preprocessing,
        weights: Vec<Vec<f32>>,
        bias: Vec<f32>,
    ) -> Result<Self, ArtifactError> {
        preprocessing.validate()?;
        let classes = DefectLabel::ALL.len();
        let features = 3 * (preprocessing.input_size as usize).pow(2);

        if weights.len() != classes || bias.len() != classes {
            return Err(ArtifactError::Invalid(format!(
                "expected {} weight rows and biases, got {} and {}",
                classes,
                weights.len(),
                bias.len()
            )));
        }
        if let Some(row) = weights.iter().position(|r| r.len() != features) {
            return Err(ArtifactError::Invalid(format!(
                "weight row {} has {} entries, expected {}",
                row,
                weights[row].len(),
                features
            )));
        }
        let flat: Vec<f32> = weights.into_iter().flatten().collect();
        Ok(Self {
            preprocessing,
            weights: DMatrix::from_row_slice(classes, features, &flat),
            bias: DVector::from_vec(bias),
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ArtifactError> {
        let content = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: LinearHeadFile =
            serde_json::from_str(&content).map_err(|e| ArtifactError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        Self::new(file.preprocessing, file.weights, file.bias)
    }
}

impl ImageClassifier for LinearClassifier {
    fn preprocessing(&self) -> &Preprocessing {
        &self.preprocessing
    }

    fn logits(&self, input: &[f32]) -> GatewayResult<Vec<f32>> {
        if input.len() != self.weights.ncols() {
            return Err(GatewayError::InferenceFailure(format!(
                "input has {} features, model expects {}",
                input.len(),
                self.weights.ncols()
            )));
        }
        let x = DVector::from_column_slice(input);
        let scores = &self.weights * x + &self.bias;
        Ok(scores.iter().copied().collect())
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::*;
    use tract_onnx::prelude::*;

    pub struct OnnxClassifier {
        preprocessing: Preprocessing,
        plan: TypedRunnableModel<TypedModel>,
    }

    impl OnnxClassifier {
        pub fn load_from_file(path: &Path, preprocessing: Preprocessing) -> Result<Self, ArtifactError> {
            let size = preprocessing.input_size as usize;
            let invalid = |e: TractError| ArtifactError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            };

            let plan = tract_onnx::onnx()
                .model_for_path(path)
                .map_err(invalid)?
                .with_input_fact(0, f32::fact([1, 3, size, size]).into())
                .map_err(invalid)?
                .into_optimized()
                .map_err(invalid)?
                .into_runnable()
                .map_err(invalid)?;

            Ok(Self { preprocessing, plan })
        }
    }

    impl ImageClassifier for OnnxClassifier {
        fn preprocessing(&self) -> &Preprocessing {
            &self.preprocessing
        }

        fn logits(&self, input: &[f32]) -> GatewayResult<Vec<f32>> {
            let size = self.preprocessing.input_size as usize;
            let failed = |e: TractError| GatewayError::InferenceFailure(e.to_string());

            let tensor: Tensor =
                tract_ndarray::Array4::from_shape_vec((1, 3, size, size), input.to_vec())
                    .map_err(|e| GatewayError::InferenceFailure(e.to_string()))?
                    .into();
            let outputs = self.plan.run(tvec!(tensor.into())).map_err(failed)?;
            let first = outputs
                .first()
                .ok_or_else(|| GatewayError::InferenceFailure("model produced no outputs".into()))?;
            let view = first.to_array_view::<f32>().map_err(failed)?;
            Ok(view.iter().copied().collect())
        }
    }
}

/// ONNX exports carry no preprocessing, so it comes from config.
#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
fn preprocessing_from_config(config: &ModelsConfig) -> Result<Preprocessing, ArtifactError> {
    let preprocessing = Preprocessing {
        input_size: config.classifier_input_size,
        mean: config.classifier_mean,
        std: config.classifier_std,
    };
    preprocessing.validate()?;
    Ok(preprocessing)
}

/// Picks a backend from the artifact's file extension.
pub fn load_classifier(config: &ModelsConfig) -> Result<Box<dyn ImageClassifier>, ArtifactError> {
    let path = Path::new(&config.classifier_path);
    info!("Loading classifier from {}", path.display());

    if config.device == Device::Gpu {
        warn!("GPU execution is not available, classifier runs on CPU");
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Box::new(LinearClassifier::load_from_file(path)?)),
        #[cfg(feature = "onnx")]
        Some("onnx") => {
            let preprocessing = preprocessing_from_config(config)?;
            Ok(Box::new(onnx::OnnxClassifier::load_from_file(path, preprocessing)?))
        }
        #[cfg(not(feature = "onnx"))]
        Some("onnx") => Err(ArtifactError::Unsupported(
            "ONNX classifiers require the `onnx` feature".into(),
        )),
        other => Err(ArtifactError::Unsupported(format!(
            "unknown classifier format {:?}",
            other.unwrap_or("")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(image: DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    /// Clean scores the summed brightness, every other class a constant.
    fn brightness_head(size: u32) -> LinearClassifier {
        let features = 3 * (size * size) as usize;
        let weights = DefectLabel::ALL
            .iter()
            .map(|label| {
                let w = if *label == DefectLabel::Clean { 1.0 } else { 0.0 };
                vec![w; features]
            })
            .collect();
        let threshold = features as f32 / 2.0;
        let bias = DefectLabel::ALL
            .iter()
            .map(|label| if *label == DefectLabel::Clean { -threshold } else { 0.0 })
            .collect();
        LinearClassifier::new(
            Preprocessing { input_size: size, mean: None, std: None },
            weights,
            bias,
        )
        .unwrap()
    }

    #[test]
    fn labels_round_trip_through_indices() {
        for (i, label) in DefectLabel::ALL.iter().enumerate() {
            assert_eq!(DefectLabel::from_index(i), Some(*label));
        }
        assert_eq!(DefectLabel::from_index(6), None);
        assert_eq!(
            serde_json::to_value(DefectLabel::ElectricalDamage).unwrap(),
            "Electrical-damage"
        );
        assert_eq!(DefectLabel::PhysicalDamage.to_string(), "Physical-Damage");
    }

    #[test]
    fn only_clean_is_not_defective() {
        for label in DefectLabel::ALL {
            assert_eq!(label.is_defective(), label != DefectLabel::Clean);
        }
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(&[1000.0, 1001.0, -5.0, 0.0, 3.0, 2.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn from_logits_picks_argmax() {
        let result = Classification::from_logits(&[0.1, 0.2, 3.0, 0.0, -1.0, 0.5]).unwrap();
        assert_eq!(result.defect_type, DefectLabel::Dusty);
        assert!(result.is_defective);
        assert!(result.confidence > 0.5 && result.confidence <= 1.0);
    }

    #[test]
    fn from_logits_rejects_wrong_arity() {
        assert!(matches!(
            Classification::from_logits(&[1.0, 2.0]),
            Err(GatewayError::InferenceFailure(_))
        ));
    }

    #[test]
    fn grayscale_input_becomes_three_channels() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 6, Luma([255])));
        let prep = Preprocessing { input_size: 4, mean: None, std: None };
        let tensor = prep.apply(&png(gray)).unwrap();
        assert_eq!(tensor.len(), 3 * 4 * 4);
        assert!(tensor.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn tensor_is_channel_major() {
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])));
        let prep = Preprocessing { input_size: 2, mean: None, std: None };
        let tensor = prep.apply(&png(red)).unwrap();
        assert_eq!(&tensor[0..4], &[1.0; 4]);
        assert_eq!(&tensor[4..12], &[0.0; 8]);
    }

    #[test]
    fn normalization_applies_mean_and_std() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([255, 255, 255])));
        let prep = Preprocessing {
            input_size: 1,
            mean: Some([0.5, 0.5, 0.5]),
            std: Some([0.25, 0.25, 0.25]),
        };
        let tensor = prep.apply(&png(white)).unwrap();
        assert!(tensor.iter().all(|v| (v - 2.0).abs() < 1e-5));
    }

    #[test]
    fn undecodable_bytes_are_invalid_input() {
        let prep = Preprocessing { input_size: 4, mean: None, std: None };
        assert!(matches!(
            prep.apply(b"definitely not an image"),
            Err(GatewayError::InvalidInput(_))
        ));
    }

    #[test]
    fn linear_head_separates_bright_and_dark_panels() {
        let head = brightness_head(4);

        let bright = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([240, 240, 240])));
        let result = head.classify(&png(bright)).unwrap();
        assert_eq!(result.defect_type, DefectLabel::Clean);
        assert!(!result.is_defective);

        let dark = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([10, 10, 10])));
        let result = head.classify(&png(dark)).unwrap();
        assert!(result.is_defective);
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn linear_head_rejects_misshapen_weights() {
        let err = LinearClassifier::new(
            Preprocessing { input_size: 2, mean: None, std: None },
            vec![vec![0.0; 12]; 5],
            vec![0.0; 6],
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::Invalid(_)));

        let err = LinearClassifier::new(
            Preprocessing { input_size: 2, mean: None, std: None },
            vec![vec![0.0; 11]; 6],
            vec![0.0; 6],
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::Invalid(_)));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let config = ModelsConfig {
            classifier_path: "weights/solar_panel_classifier.pth".into(),
            ..ModelsConfig::default()
        };
        assert!(matches!(
            load_classifier(&config),
            Err(ArtifactError::Unsupported(_))
        ));
    }

    #[test]
    fn normalization_needs_both_mean_and_std() {
        let err = LinearClassifier::new(
            Preprocessing { input_size: 2, mean: Some([0.5; 3]), std: None },
            vec![vec![0.0; 12]; 6],
            vec![0.0; 6],
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::Invalid(_)));

        let config = ModelsConfig {
            classifier_std: Some([0.2; 3]),
            ..ModelsConfig::default()
        };
        assert!(matches!(
            preprocessing_from_config(&config),
            Err(ArtifactError::Invalid(_))
        ));

        let zero_std = Preprocessing { input_size: 2, mean: Some([0.5; 3]), std: Some([0.0; 3]) };
        assert!(zero_std.validate().is_err());
    }

    #[test]
    fn input_size_is_bounded() {
        for size in [0, MAX_INPUT_SIZE + 1, 70_000] {
            let config = ModelsConfig {
                classifier_input_size: size,
                ..ModelsConfig::default()
            };
            assert!(matches!(
                preprocessing_from_config(&config),
                Err(ArtifactError::Invalid(_))
            ));
        }

        let config = ModelsConfig {
            classifier_mean: Some([0.485, 0.456, 0.406]),
            classifier_std: Some([0.229, 0.224, 0.225]),
            ..ModelsConfig::default()
        };
        let prep = preprocessing_from_config(&config).unwrap();
        assert_eq!(prep.input_size, 128);
    }

    #[cfg(feature = "onnx")]
    #[test]
    fn onnx_head_matches_linear_fixture() {
        let config = ModelsConfig {
            classifier_path: concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/classifier.onnx")
                .into(),
            classifier_input_size: 2,
            ..ModelsConfig::default()
        };
        let onnx = load_classifier(&config).unwrap();
        assert_eq!(onnx.preprocessing().input_size, 2);

        let bright = png(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([235, 235, 240]))));
        let result = onnx.classify(&bright).unwrap();
        assert_eq!(result.defect_type, DefectLabel::Clean);
        assert!(!result.is_defective);

        let dark = png(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([12, 12, 17]))));
        let result = onnx.classify(&dark).unwrap();
        assert!(result.is_defective);
        assert!((0.0..=1.0).contains(&result.confidence));

        let logits = onnx.logits(&[1.0; 12]).unwrap();
        assert_eq!(logits.len(), 6);
        assert!((logits[1] - 6.0).abs() < 1e-5);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn onnx_needs_the_feature() {
        let config = ModelsConfig {
            classifier_path: "models/classifier.onnx".into(),
            ..ModelsConfig::default()
        };
        assert!(matches!(
            load_classifier(&config),
            Err(ArtifactError::Unsupported(_))
        ));
    }
}
