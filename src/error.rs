//! Error types for the flux pipeline.
//!
//! Every failure aborts the whole generation call; there are no retries and
//! no partial results. The codes below classify why a call was aborted.

use std::fmt;

/// Error codes identifying the class of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Pipeline or request configuration is invalid.
    /// Trigger: zero steps, tile stride larger than tile size, bad strength.
    InvalidConfig,

    /// The request references inputs that cannot be combined.
    /// Trigger: entity inpainting without an input image, prompt/mask count mismatch.
    InvalidRequest,

    /// The scheduler was queried before `set_timesteps`.
    ScheduleNotSet,

    /// A region or entity mask does not match the target image.
    /// Trigger: mask aspect ratio differs from the requested width/height.
    MaskMismatch,

    /// A control residual stack does not match the backbone's block count.
    ControlStackMismatch,

    /// A model role required by the request is not present in the registry.
    MissingModel,

    /// A collaborator model failed during evaluation.
    /// Trigger: out of accelerator memory, numerical failure.
    InferenceFailed,

    /// Two tensors that must agree in shape do not.
    ShapeMismatch,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ScheduleNotSet => "SCHEDULE_NOT_SET",
            ErrorCode::MaskMismatch => "MASK_MISMATCH",
            ErrorCode::ControlStackMismatch => "CONTROL_STACK_MISMATCH",
            ErrorCode::MissingModel => "MISSING_MODEL",
            ErrorCode::InferenceFailed => "INFERENCE_FAILED",
            ErrorCode::ShapeMismatch => "SHAPE_MISMATCH",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "Pipeline configuration is invalid",
            ErrorCode::InvalidRequest => "Generation request is inconsistent",
            ErrorCode::ScheduleNotSet => "Scheduler used before a schedule was computed",
            ErrorCode::MaskMismatch => "Mask does not match the target image",
            ErrorCode::ControlStackMismatch => {
                "Control residual stack does not match backbone blocks"
            }
            ErrorCode::MissingModel => "Required model is not loaded",
            ErrorCode::InferenceFailed => "Model evaluation failed",
            ErrorCode::ShapeMismatch => "Tensor shapes do not agree",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => {
                "Use at least one inference step, a denoising strength in (0, 1], \
                 and a tile stride no larger than the tile size"
            }
            ErrorCode::InvalidRequest => {
                "Supply one mask per prompt and an input image when entity inpainting is enabled"
            }
            ErrorCode::ScheduleNotSet => "Call set_timesteps before stepping or adding noise",
            ErrorCode::MaskMismatch => {
                "Resize masks to the requested width and height before submitting them"
            }
            ErrorCode::ControlStackMismatch => {
                "Use a control model built for the loaded backbone's block layout"
            }
            ErrorCode::MissingModel => {
                "Register the model for this role before building the pipeline"
            }
            ErrorCode::InferenceFailed => {
                "Reduce the output resolution or enable tiled evaluation, then retry"
            }
            ErrorCode::ShapeMismatch => {
                "Check that all inputs were produced for the same resolution"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for pipeline operations.
#[derive(Debug)]
pub struct PipelineError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipelineError {
    /// Creates a new PipelineError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new PipelineError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an INVALID_CONFIG error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, reason)
    }

    /// Creates an INVALID_REQUEST error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, reason)
    }

    /// Creates a SCHEDULE_NOT_SET error.
    pub fn schedule_not_set() -> Self {
        Self::new(
            ErrorCode::ScheduleNotSet,
            "Scheduler has no timesteps; call set_timesteps first",
        )
    }

    /// Creates a MASK_MISMATCH error.
    pub fn mask_mismatch(mask: (usize, usize), target: (usize, usize)) -> Self {
        Self::new(
            ErrorCode::MaskMismatch,
            format!(
                "Mask of {}x{} does not match target {}x{} (height x width)",
                mask.0, mask.1, target.0, target.1
            ),
        )
    }

    /// Creates a CONTROL_STACK_MISMATCH error.
    pub fn control_stack_mismatch(kind: &str, got: usize, expected: usize) -> Self {
        Self::new(
            ErrorCode::ControlStackMismatch,
            format!(
                "{} residual stack has {} entries but the backbone has {} blocks",
                kind, got, expected
            ),
        )
    }

    /// Creates a MISSING_MODEL error.
    pub fn missing_model(role: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::MissingModel,
            format!("No model registered for role: {}", role),
        )
    }

    /// Creates an INFERENCE_FAILED error.
    pub fn inference_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InferenceFailed,
            format!("Inference failed: {}", reason.into()),
        )
    }

    /// Creates a SHAPE_MISMATCH error.
    pub fn shape_mismatch(what: &str, got: &[usize], expected: &[usize]) -> Self {
        Self::new(
            ErrorCode::ShapeMismatch,
            format!("{}: got shape {:?}, expected {:?}", what, got, expected),
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}. Recovery: {}",
            self.code,
            self.message,
            self.code.recovery_hint()
        )
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::with_source(ErrorCode::ShapeMismatch, "Tensor reshape failed", err)
    }
}

/// Result type alias using PipelineError.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_as_str() {
        assert_eq!(ErrorCode::InvalidConfig.as_str(), "INVALID_CONFIG");
        assert_eq!(ErrorCode::ScheduleNotSet.as_str(), "SCHEDULE_NOT_SET");
        assert_eq!(ErrorCode::MaskMismatch.as_str(), "MASK_MISMATCH");
        assert_eq!(ErrorCode::ControlStackMismatch.as_str(), "CONTROL_STACK_MISMATCH");
        assert_eq!(ErrorCode::MissingModel.as_str(), "MISSING_MODEL");
    }

    #[test]
    fn recovery_hints_not_empty() {
        for code in [
            ErrorCode::InvalidConfig,
            ErrorCode::InvalidRequest,
            ErrorCode::ScheduleNotSet,
            ErrorCode::MaskMismatch,
            ErrorCode::ControlStackMismatch,
            ErrorCode::MissingModel,
            ErrorCode::InferenceFailed,
            ErrorCode::ShapeMismatch,
        ] {
            assert!(!code.recovery_hint().is_empty());
            assert!(!code.description().is_empty());
        }
    }

    #[test]
    fn pipeline_error_display() {
        let err = PipelineError::control_stack_mismatch("joint", 3, 19);
        let text = err.to_string();
        assert!(text.contains("CONTROL_STACK_MISMATCH"));
        assert!(text.contains("19"));
        assert!(text.contains("Recovery:"));
    }

    #[test]
    fn shape_error_converts() {
        let err: PipelineError = ndarray::Array2::<f32>::from_shape_vec((2, 2), vec![0.0; 3])
            .unwrap_err()
            .into();
        assert_eq!(err.code, ErrorCode::ShapeMismatch);
        assert!(std::error::Error::source(&err).is_some());
    }
}
