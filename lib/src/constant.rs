use std::fmt;

/// Identifies a finished root
///
/// The builder hands out roots in context `0`. Roots recorded by a serializer carry the nesting
/// depth of the stream they were ended in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootId {
    pub context: u16,
    pub index: u32,
}

/// Value stored in the constant pool
///
/// Floating point values are stored as their bit pattern so that constants can be hashed and
/// interned.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    Boolean(bool),
    Integer(i64),
    Float(u64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Constant>),

    /// Another root of the same parse (eg. a nested function)
    Root(RootId),

    /// Reference to an executable node, which is never a valid constant operand
    Node(String),
}

impl Constant {
    pub fn float(value: f64) -> Constant {
        Constant::Float(value.to_bits())
    }

    pub fn string(value: impl Into<String>) -> Constant {
        Constant::String(value.into())
    }

    /// Check this constant can be interned (nodes other than roots are rejected)
    pub(crate) fn validate(&self) -> Result<(), crate::Error> {
        match self {
            Constant::Node(name) => Err(crate::Error::IllegalArgument(format!(
                "nodes cannot be used as constants (got {}), only roots can",
                name
            ))),
            Constant::Array(elements) => elements.iter().try_for_each(Constant::validate),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Boolean(value) => write!(f, "{}", value),
            Constant::Integer(value) => write!(f, "{}", value),
            Constant::Float(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            Constant::String(value) => write!(f, "{:?}", value),
            Constant::Bytes(bytes) => write!(f, "bytes[{}]", bytes.len()),
            Constant::Array(elements) => {
                write!(f, "[")?;
                for (index, element) in elements.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            Constant::Root(root) => write!(f, "root({}.{})", root.context, root.index),
            Constant::Node(name) => write!(f, "node({})", name),
        }
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Constant {
        Constant::Boolean(value)
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Constant {
        Constant::Integer(value)
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Constant {
        Constant::String(value.to_owned())
    }
}

impl From<RootId> for Constant {
    fn from(value: RootId) -> Constant {
        Constant::Root(value)
    }
}
