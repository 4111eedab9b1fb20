use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// Construction-time failures (shape, type and axis errors) are reported by
/// the expression-building call that caused them. Graph state errors are
/// fatal to the current episode only; call `Graph::reset` and rebuild.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Two shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible (axis {axis} from the right: {ld} vs {rd})")]
    BroadcastIncompatible {
        lhs: Shape,
        rhs: Shape,
        axis: usize,
        ld: usize,
        rd: usize,
    },

    /// Operation requires a specific rank (or a minimum rank).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// A user-supplied shape with a zero extent.
    #[error("invalid shape {shape}: every extent must be at least 1")]
    InvalidShape { shape: Shape },

    /// Matrix product with incompatible inner dimensions.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Narrow/slice/index out of bounds.
    #[error("slice out of bounds: axis {axis}, start {start}, len {len}, extent {extent}")]
    SliceOutOfBounds {
        axis: usize,
        start: usize,
        len: usize,
        extent: usize,
    },

    /// Buffer or data length does not match the element count of a shape.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// DType mismatch where an exact type is required.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Two element types have no common promotion.
    #[error("incompatible element types {lhs} and {rhs} in {op}")]
    IncompatibleTypes {
        lhs: DType,
        rhs: DType,
        op: &'static str,
    },

    /// Axis index outside of `[-rank, rank)`.
    #[error("axis {axis} out of range for tensor with {rank} dimensions")]
    AxisOutOfRange { axis: isize, rank: usize },

    /// Axis list is not a permutation of `0..rank`.
    #[error("invalid permutation {perm:?} for tensor with {rank} dimensions")]
    InvalidPermutation { perm: Vec<isize>, rank: usize },

    /// Graph used in the wrong order (e.g. backward before forward).
    #[error("graph state: {0}")]
    GraphState(String),

    /// An Expr built by a different graph.
    #[error("expression belongs to graph {expr_graph}, not graph {graph}")]
    ForeignExpr { expr_graph: u64, graph: u64 },

    /// An Expr from an episode that has since been reset.
    #[error("expression from episode {expr_episode} used in episode {episode}")]
    ExpiredExpr { expr_episode: u64, episode: u64 },

    /// Operator variant declared but intentionally not implemented.
    #[error("unsupported operation {op}: {reason}")]
    Unsupported { op: &'static str, reason: String },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Shape,
    Type,
    Axis,
    GraphState,
    Unsupported,
    Other,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a graph state error.
    pub fn graph_state(s: impl Into<String>) -> Self {
        Error::GraphState(s.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    /// Which family of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ShapeMismatch { .. }
            | Error::BroadcastIncompatible { .. }
            | Error::RankMismatch { .. }
            | Error::InvalidShape { .. }
            | Error::MatmulShapeMismatch { .. }
            | Error::ReshapeElementMismatch { .. }
            | Error::SliceOutOfBounds { .. }
            | Error::ElementCountMismatch { .. } => ErrorKind::Shape,
            Error::DTypeMismatch { .. } | Error::IncompatibleTypes { .. } => ErrorKind::Type,
            Error::AxisOutOfRange { .. } | Error::InvalidPermutation { .. } => ErrorKind::Axis,
            Error::GraphState(_) | Error::ForeignExpr { .. } | Error::ExpiredExpr { .. } => {
                ErrorKind::GraphState
            }
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::Msg(_) => ErrorKind::Other,
        }
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
