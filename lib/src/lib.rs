//! Structured bytecode assembler
//!
//! A language front-end describes its operations once in a [`Model`] and then drives an
//! [`OperationBuilder`] with nested `begin`/`end` calls while walking its syntax tree. The
//! [`Builder`] lowers those calls straight to compact bytecode plus the side tables an
//! interpreter needs (exception handlers, source positions, locals, continuations). The same
//! calls can instead be recorded with a [`serialize::Serializer`] and replayed later.
//!
//! ```
//! use bcasm::{Builder, BuilderConfig, Constant, ModelBuilder, OperationBuilder, StatePool};
//!
//! # fn main() -> Result<(), bcasm::Error> {
//! let model = ModelBuilder::new("Tiny").build()?;
//! let mut pool = StatePool::default();
//! let mut builder = Builder::new(&model, BuilderConfig::minimal(), &mut pool);
//! builder.begin_root()?;
//! builder.begin_return()?;
//! builder.emit_load_constant(Constant::Integer(42))?;
//! builder.end_return()?;
//! builder.end_root()?;
//! let nodes = builder.finish()?;
//! assert_eq!(nodes.roots[0].constants, vec![Constant::Integer(42)]);
//! # Ok(())
//! # }
//! ```

mod config;
mod constant;
mod errors;

pub mod builder;
pub mod model;
pub mod program;
pub mod sample;
pub mod serialize;

pub use builder::{
    finally_generator, Argument, Builder, BytecodeLabel, BytecodeLocal, FinallyGenerator,
    OperationBuilder, StatePool,
};
pub use config::BuilderConfig;
pub use constant::{Constant, RootId};
pub use errors::{EncodingOverflow, Error};
pub use model::{Features, Model, ModelBuilder, TagMask};
pub use program::{BytecodeNodes, BytecodeProgram};
