pub mod command;
pub mod session;

pub mod errors {
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum EngineError {
        #[error("annotation index {index} out of range (active count {count})")]
        AnnotationOutOfRange { index: usize, count: usize },
        #[error("coordinate index {index} out of range for annotation {annotation} (count {count})")]
        CoordinateOutOfRange {
            annotation: usize,
            index: usize,
            count: usize,
        },
        #[error("group {0} is not an active group")]
        GroupNotFound(usize),
        #[error("group named {0:?} not found")]
        GroupNameNotFound(String),
        #[error("feature index {0} out of range")]
        FeatureOutOfRange(usize),
        #[error("feature {feature} is restricted to another group than annotation {annotation}")]
        FeatureNotApplicable { feature: usize, annotation: usize },
        #[error("no annotation is currently being created")]
        NotCreating,
        #[error("no coordinate is selected")]
        NoSelectedCoordinate,
        #[error("splitting annotations is disabled")]
        SplitDisabled,
    }
}
