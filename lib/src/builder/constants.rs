use crate::errors::EncodingOverflow;
use crate::{Constant, Error};
use std::collections::HashMap;

/// Constant pool builder
///
/// The pool is append only and interns constants: adding a constant equal to one already in the
/// pool returns the existing index. Once a root is finished, the pool is consumed into a plain
/// vector.
#[derive(Default)]
pub(crate) struct ConstantPool {
    constants: Vec<Constant>,
    indices: HashMap<Constant, i32>,
}

impl ConstantPool {
    pub fn clear(&mut self) {
        self.constants.clear();
        self.indices.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Get or insert a constant, provided there is space for it
    pub fn add(&mut self, constant: Constant) -> Result<i32, Error> {
        if let Some(index) = self.indices.get(&constant) {
            return Ok(*index);
        }

        let offset = self.constants.len();
        if offset >= i32::MAX as usize {
            return Err(Error::Encoding(EncodingOverflow::ConstantPool(offset)));
        }
        let index = offset as i32;
        self.constants.push(constant.clone());
        self.indices.insert(constant, index);
        Ok(index)
    }

    /// Add an optional constant (`-1` stands for "none")
    pub fn add_optional(&mut self, constant: Option<Constant>) -> Result<i32, Error> {
        match constant {
            Some(constant) => self.add(constant),
            None => Ok(-1),
        }
    }

    pub fn to_vec(&self) -> Vec<Constant> {
        self.constants.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interns_equal_constants() {
        let mut pool = ConstantPool::default();
        assert_eq!(pool.add(Constant::Integer(42)).unwrap(), 0);
        assert_eq!(pool.add(Constant::string("x")).unwrap(), 1);
        assert_eq!(pool.add(Constant::Integer(42)).unwrap(), 0);
        assert_eq!(pool.add(Constant::float(1.5)).unwrap(), 2);
        assert_eq!(pool.add(Constant::float(1.5)).unwrap(), 2);
        assert_eq!(pool.add_optional(None).unwrap(), -1);
        assert_eq!(pool.len(), 3);
    }
}
