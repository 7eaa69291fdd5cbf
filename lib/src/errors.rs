use std::fmt;

/// Errors raised while assembling, serializing, or replaying bytecode
///
/// None of these are recoverable for the parse that raised them: the builder is left in an
/// unspecified state and should be dropped.
#[derive(Debug)]
pub enum Error {
    /// The `begin`/`end`/`emit` protocol was violated (unmatched `end`, a branch to a label that
    /// is not in scope, a local used after its block ended, ...)
    ///
    /// `operation_stack` is a rendering of the operations that were open when the violation was
    /// detected, innermost last.
    IllegalState {
        message: String,
        operation_stack: String,
    },

    /// An argument has the wrong shape (wrong count, wrong kind, a node passed as a constant)
    IllegalArgument(String),

    /// The program is too large for the fixed-width encodings of the bytecode format
    Encoding(EncodingOverflow),

    IoError(std::io::Error),

    /// The interpreter model is inconsistent (duplicate names, malformed rewrite rules, ...)
    InvalidModel(String),
}

/// Which fixed-width field overflowed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncodingOverflow {
    /// Operand stack is deeper than `i16::MAX`
    StackHeight(i64),

    /// More than `i16::MAX` local variables (or frame slots)
    Locals(usize),

    /// Bytecode index no longer fits in an `i32`
    Bytecode(usize),

    /// A 2-byte immediate was handed a value outside of the `i16` range
    ShortImmediate(i32),

    /// Constant pool has more than `i32::MAX` entries
    ConstantPool(usize),

    /// Too many nodes, profiles, handlers, or labels
    Counter(&'static str, u64),
}

impl Error {
    /// Internal inconsistency, reported the same way as protocol violations
    pub(crate) fn internal(message: impl Into<String>) -> Error {
        Error::IllegalState {
            message: message.into(),
            operation_stack: String::from("<unavailable>"),
        }
    }

    /// Wrap an unexpected shape in a serialized stream
    pub(crate) fn malformed(message: impl Into<String>) -> Error {
        Error::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.into(),
        ))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IllegalState {
                message,
                operation_stack,
            } => write!(f, "{} (operation stack: {})", message, operation_stack),
            Error::IllegalArgument(message) => write!(f, "illegal argument: {}", message),
            Error::Encoding(overflow) => write!(f, "encoding overflow: {}", overflow),
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidModel(message) => write!(f, "invalid model: {}", message),
        }
    }
}

impl fmt::Display for EncodingOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingOverflow::StackHeight(height) => {
                write!(f, "stack height {} exceeds {}", height, i16::MAX)
            }
            EncodingOverflow::Locals(count) => {
                write!(f, "{} locals exceed the maximum of {}", count, i16::MAX)
            }
            EncodingOverflow::Bytecode(bci) => {
                write!(f, "bytecode index {} exceeds {}", bci, i32::MAX)
            }
            EncodingOverflow::ShortImmediate(value) => {
                write!(f, "immediate {} does not fit in a short", value)
            }
            EncodingOverflow::ConstantPool(size) => {
                write!(f, "constant pool size {} exceeds {}", size, i32::MAX)
            }
            EncodingOverflow::Counter(what, count) => {
                write!(f, "too many {} ({})", what, count)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
