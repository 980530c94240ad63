use thiserror::Error;

/// Stable classification of [`LoweringError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownOperator,
    MissingAttribute,
    AttributeType,
    InvalidAttribute,
    UnsupportedLayout,
    UnsupportedGrouping,
    MissingInput,
    NonConstantDim,
    MissingSchedule,
    InvalidTarget,
    Primitive,
}

/// Lowering failure surfaced to the graph compiler.
///
/// Every variant names the operator being lowered so the compiler can report which node failed.
/// None of these are transient: lowering the same node again fails the same way.
#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("unknown operator `{name}`")]
    UnknownOperator { name: String },

    #[error("{op}: required attribute `{attribute}` is missing")]
    MissingAttribute { op: String, attribute: String },

    #[error("{op}: attribute `{attribute}` = {value} cannot be read as {expected}")]
    AttributeType {
        op: String,
        attribute: String,
        expected: &'static str,
        value: String,
    },

    #[error("{op}: invalid value {value} for attribute `{attribute}`: {reason}")]
    InvalidAttribute {
        op: String,
        attribute: String,
        value: String,
        reason: String,
    },

    #[error("{op}: unsupported layout {layout:?}")]
    UnsupportedLayout { op: String, layout: String },

    #[error(
        "{op}: unsupported groups={groups} (channels={}, input channels={})",
        display_channels(.channels),
        display_channels(.in_channels)
    )]
    UnsupportedGrouping {
        op: String,
        groups: i64,
        channels: Option<i64>,
        in_channels: Option<usize>,
    },

    #[error("{op}: missing input #{index}")]
    MissingInput { op: String, index: usize },

    #[error("{op}: dimension {axis} of the data input is not a constant")]
    NonConstantDim { op: String, axis: usize },

    #[error("{op}: no schedule registered")]
    MissingSchedule { op: String },

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("{op}: tensor expression primitive failed")]
    Primitive {
        op: String,
        #[source]
        source: anyhow::Error,
    },
}

impl LoweringError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoweringError::UnknownOperator { .. } => ErrorKind::UnknownOperator,
            LoweringError::MissingAttribute { .. } => ErrorKind::MissingAttribute,
            LoweringError::AttributeType { .. } => ErrorKind::AttributeType,
            LoweringError::InvalidAttribute { .. } => ErrorKind::InvalidAttribute,
            LoweringError::UnsupportedLayout { .. } => ErrorKind::UnsupportedLayout,
            LoweringError::UnsupportedGrouping { .. } => ErrorKind::UnsupportedGrouping,
            LoweringError::MissingInput { .. } => ErrorKind::MissingInput,
            LoweringError::NonConstantDim { .. } => ErrorKind::NonConstantDim,
            LoweringError::MissingSchedule { .. } => ErrorKind::MissingSchedule,
            LoweringError::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            LoweringError::Primitive { .. } => ErrorKind::Primitive,
        }
    }

    pub fn unknown_operator(name: impl Into<String>) -> Self {
        LoweringError::UnknownOperator { name: name.into() }
    }

    pub fn invalid_attribute(
        op: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LoweringError::InvalidAttribute {
            op: op.into(),
            attribute: attribute.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_layout(op: impl Into<String>, layout: impl Into<String>) -> Self {
        LoweringError::UnsupportedLayout {
            op: op.into(),
            layout: layout.into(),
        }
    }

    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        LoweringError::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn primitive(op: impl Into<String>, source: anyhow::Error) -> Self {
        LoweringError::Primitive {
            op: op.into(),
            source,
        }
    }
}

fn display_channels<T: ToString>(count: &Option<T>) -> String {
    match count {
        Some(count) => count.to_string(),
        None => "unknown".to_string(),
    }
}

/// Convenience alias for results returned by lowering routines.
pub type LoweringResult<T> = Result<T, LoweringError>;

/// Attaches the operator name to failures coming back from external libraries.
pub(crate) trait PrimitiveResultExt<T> {
    fn for_op(self, op: &str) -> LoweringResult<T>;
}

impl<T> PrimitiveResultExt<T> for anyhow::Result<T> {
    fn for_op(self, op: &str) -> LoweringResult<T> {
        self.map_err(|err| LoweringError::primitive(op, err))
    }
}
