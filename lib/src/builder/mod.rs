//! Assembling bytecode from structured operations
//!
//! A parser drives an [`OperationBuilder`] with nested `begin`/`end` calls (and `emit` for leaf
//! operations). The [`Builder`] lowers those calls to bytecode as they arrive: it keeps a stack of
//! open operations, tracks the operand stack height and reachability, patches forward branches
//! once their targets are known, and fills the side tables (exception handlers, source
//! positions, locals) along the way.
//!
//! ### Reachability
//!
//! Code following a `Branch` or `Return` is dead until the next emitted label or the next point
//! where an enclosing operation merges control flow back in (eg. the `else` arm of an
//! `IfThenElse`). Dead instructions are not written, but their stack effect is still tracked and
//! constants they mention are still interned, so that the constant pool layout does not depend
//! on which code happens to be dead.
//!
//! ### Finally handlers
//!
//! `TryFinally` and `TryCatchOtherwise` take a [`FinallyGenerator`] instead of a child for their
//! handler. The generator is called once for every copy of the handler the builder needs: once on
//! the normal exit path, once on the exceptional path, and once for every early exit (`Branch`
//! or `Return`) out of the protected body. Generators must issue the same calls every time.

mod bytecode_buffer;
mod constants;
mod exits;
mod handler_table;
mod label;
mod locals;
mod locals_table;
mod operation_stack;
mod operations;
mod rewriter;
mod source_table;
mod state;

pub use handler_table::{HandlerKind, HANDLER_ENTRY_LENGTH};
pub use label::BytecodeLabel;
pub use locals_table::{LOCAL_ENTRY_LENGTH, SCOPED_LOCAL_ENTRY_LENGTH};
pub use source_table::SOURCE_ENTRY_LENGTH;
pub use state::StatePool;

pub(crate) use bytecode_buffer::read_immediates;

use crate::model::{ArgumentKind, Model, OperationId, OperationKind, Phase, TagMask};
use crate::program::{BytecodeNodes, BytecodeProgram};
use crate::{BuilderConfig, Constant, Error, RootId};
use state::BuilderState;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Closure re-issuing the builder calls of a finally handler
pub type FinallyGenerator = Rc<dyn Fn(&mut dyn OperationBuilder) -> Result<(), Error>>;

/// Wrap a closure into a [`FinallyGenerator`]
pub fn finally_generator<F>(generator: F) -> FinallyGenerator
where
    F: Fn(&mut dyn OperationBuilder) -> Result<(), Error> + 'static,
{
    Rc::new(generator)
}

/// Handle to a local variable
///
/// Handles are only valid in the root that created them (or through materialized accesses from
/// nested roots) and, with block scoping, only while the declaring block is open.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BytecodeLocal {
    /// Root index, or the context id for handles of a serializer
    pub(crate) root: u32,
    pub(crate) local_index: u16,
    pub(crate) frame_index: u16,
    pub(crate) scope: Option<LocalScope>,
}

/// Declaring scope of a block scoped local
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct LocalScope {
    pub sp: usize,
    pub sequence_number: u32,
}

impl BytecodeLocal {
    /// Index of the local among all locals of its root
    pub fn local_index(&self) -> u16 {
        self.local_index
    }

    /// Slot of the local in the frame
    pub fn frame_index(&self) -> u16 {
        self.frame_index
    }
}

/// Argument of a `begin`, `end`, or `emit` call
#[derive(Clone)]
pub enum Argument {
    Local(BytecodeLocal),
    LocalArray(Vec<BytecodeLocal>),
    Label(BytecodeLabel),
    Tags(TagMask),
    Short(i16),
    Integer(i32),
    Constant(Constant),
    FinallyGenerator(FinallyGenerator),
}

impl Argument {
    pub fn kind(&self) -> ArgumentKind {
        match self {
            Argument::Local(_) => ArgumentKind::Local,
            Argument::LocalArray(_) => ArgumentKind::LocalArray,
            Argument::Label(_) => ArgumentKind::Label,
            Argument::Tags(_) => ArgumentKind::Tags,
            Argument::Short(_) => ArgumentKind::Short,
            Argument::Integer(_) => ArgumentKind::Integer,
            Argument::Constant(_) => ArgumentKind::Constant,
            Argument::FinallyGenerator(_) => ArgumentKind::FinallyGenerator,
        }
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Local(local) => write!(f, "Local({:?})", local),
            Argument::LocalArray(locals) => write!(f, "LocalArray({:?})", locals),
            Argument::Label(label) => write!(f, "Label({:?})", label),
            Argument::Tags(tags) => write!(f, "Tags({:#b})", tags.0),
            Argument::Short(value) => write!(f, "Short({})", value),
            Argument::Integer(value) => write!(f, "Integer({})", value),
            Argument::Constant(constant) => write!(f, "Constant({})", constant),
            Argument::FinallyGenerator(_) => write!(f, "FinallyGenerator(..)"),
        }
    }
}

/// Calls a parser issues to build bytecode
///
/// Implemented by the [`Builder`] (which assembles bytecode), by the
/// [`crate::serialize::Serializer`] (which records the calls), and by anything else that wants
/// to observe a parse. The provided methods are thin wrappers around `begin`/`end`/`emit`.
pub trait OperationBuilder {
    fn model(&self) -> &Model;

    /// Declare a local in the current scope, with optional name and info constants
    fn create_local(
        &mut self,
        name: Option<Constant>,
        info: Option<Constant>,
    ) -> Result<BytecodeLocal, Error>;

    /// Declare a label in the current `Block` or `Root`
    fn create_label(&mut self) -> Result<BytecodeLabel, Error>;

    fn begin(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error>;

    fn end(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error>;

    fn emit(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error>;

    /// End the innermost root
    fn end_root(&mut self) -> Result<RootId, Error>;

    /// Look up a (custom) operation by name
    fn operation_id(&self, name: &str) -> Result<OperationId, Error> {
        self.model()
            .operation_id(name)
            .ok_or_else(|| Error::IllegalArgument(format!("unknown operation {}", name)))
    }

    fn begin_root(&mut self) -> Result<(), Error> {
        self.begin(OperationId::ROOT, vec![])
    }

    fn begin_block(&mut self) -> Result<(), Error> {
        self.begin(OperationId::BLOCK, vec![])
    }

    fn end_block(&mut self) -> Result<(), Error> {
        self.end(OperationId::BLOCK, vec![])
    }

    fn begin_if_then(&mut self) -> Result<(), Error> {
        self.begin(OperationId::IF_THEN, vec![])
    }

    fn end_if_then(&mut self) -> Result<(), Error> {
        self.end(OperationId::IF_THEN, vec![])
    }

    fn begin_if_then_else(&mut self) -> Result<(), Error> {
        self.begin(OperationId::IF_THEN_ELSE, vec![])
    }

    fn end_if_then_else(&mut self) -> Result<(), Error> {
        self.end(OperationId::IF_THEN_ELSE, vec![])
    }

    fn begin_conditional(&mut self) -> Result<(), Error> {
        self.begin(OperationId::CONDITIONAL, vec![])
    }

    fn end_conditional(&mut self) -> Result<(), Error> {
        self.end(OperationId::CONDITIONAL, vec![])
    }

    fn begin_while(&mut self) -> Result<(), Error> {
        self.begin(OperationId::WHILE, vec![])
    }

    fn end_while(&mut self) -> Result<(), Error> {
        self.end(OperationId::WHILE, vec![])
    }

    fn begin_try_catch(&mut self) -> Result<(), Error> {
        self.begin(OperationId::TRY_CATCH, vec![])
    }

    fn end_try_catch(&mut self) -> Result<(), Error> {
        self.end(OperationId::TRY_CATCH, vec![])
    }

    fn begin_try_finally(&mut self, generator: FinallyGenerator) -> Result<(), Error> {
        self.begin(
            OperationId::TRY_FINALLY,
            vec![Argument::FinallyGenerator(generator)],
        )
    }

    fn end_try_finally(&mut self) -> Result<(), Error> {
        self.end(OperationId::TRY_FINALLY, vec![])
    }

    fn begin_try_catch_otherwise(&mut self, generator: FinallyGenerator) -> Result<(), Error> {
        self.begin(
            OperationId::TRY_CATCH_OTHERWISE,
            vec![Argument::FinallyGenerator(generator)],
        )
    }

    fn end_try_catch_otherwise(&mut self) -> Result<(), Error> {
        self.end(OperationId::TRY_CATCH_OTHERWISE, vec![])
    }

    fn emit_label(&mut self, label: BytecodeLabel) -> Result<(), Error> {
        self.emit(OperationId::LABEL, vec![Argument::Label(label)])
    }

    fn emit_branch(&mut self, label: BytecodeLabel) -> Result<(), Error> {
        self.emit(OperationId::BRANCH, vec![Argument::Label(label)])
    }

    fn emit_load_constant(&mut self, constant: Constant) -> Result<(), Error> {
        self.emit(OperationId::LOAD_CONSTANT, vec![Argument::Constant(constant)])
    }

    fn emit_load_null(&mut self) -> Result<(), Error> {
        self.emit(OperationId::LOAD_NULL, vec![])
    }

    fn emit_load_argument(&mut self, index: i16) -> Result<(), Error> {
        self.emit(OperationId::LOAD_ARGUMENT, vec![Argument::Short(index)])
    }

    fn emit_load_exception(&mut self) -> Result<(), Error> {
        self.emit(OperationId::LOAD_EXCEPTION, vec![])
    }

    fn emit_load_local(&mut self, local: BytecodeLocal) -> Result<(), Error> {
        self.emit(OperationId::LOAD_LOCAL, vec![Argument::Local(local)])
    }

    fn begin_load_local_materialized(&mut self, local: BytecodeLocal) -> Result<(), Error> {
        self.begin(
            OperationId::LOAD_LOCAL_MATERIALIZED,
            vec![Argument::Local(local)],
        )
    }

    fn end_load_local_materialized(&mut self) -> Result<(), Error> {
        self.end(OperationId::LOAD_LOCAL_MATERIALIZED, vec![])
    }

    fn begin_store_local(&mut self, local: BytecodeLocal) -> Result<(), Error> {
        self.begin(OperationId::STORE_LOCAL, vec![Argument::Local(local)])
    }

    fn end_store_local(&mut self) -> Result<(), Error> {
        self.end(OperationId::STORE_LOCAL, vec![])
    }

    fn begin_store_local_materialized(&mut self, local: BytecodeLocal) -> Result<(), Error> {
        self.begin(
            OperationId::STORE_LOCAL_MATERIALIZED,
            vec![Argument::Local(local)],
        )
    }

    fn end_store_local_materialized(&mut self) -> Result<(), Error> {
        self.end(OperationId::STORE_LOCAL_MATERIALIZED, vec![])
    }

    fn emit_clear_local(&mut self, local: BytecodeLocal) -> Result<(), Error> {
        self.emit(OperationId::CLEAR_LOCAL, vec![Argument::Local(local)])
    }

    fn begin_return(&mut self) -> Result<(), Error> {
        self.begin(OperationId::RETURN, vec![])
    }

    fn end_return(&mut self) -> Result<(), Error> {
        self.end(OperationId::RETURN, vec![])
    }

    fn begin_source(&mut self, source: Constant) -> Result<(), Error> {
        self.begin(OperationId::SOURCE, vec![Argument::Constant(source)])
    }

    fn end_source(&mut self) -> Result<(), Error> {
        self.end(OperationId::SOURCE, vec![])
    }

    /// Source section at `start` of `length` characters (`-1, -1` when unavailable)
    fn begin_source_section(&mut self, start: i32, length: i32) -> Result<(), Error> {
        self.begin(
            OperationId::SOURCE_SECTION,
            vec![Argument::Integer(start), Argument::Integer(length)],
        )
    }

    fn end_source_section(&mut self) -> Result<(), Error> {
        self.end(OperationId::SOURCE_SECTION, vec![])
    }

    /// Source section whose length is only known once it ends
    fn begin_source_section_prefix(&mut self, start: i32) -> Result<(), Error> {
        self.begin(
            OperationId::SOURCE_SECTION_PREFIX,
            vec![Argument::Integer(start)],
        )
    }

    fn end_source_section_prefix(&mut self, length: i32) -> Result<(), Error> {
        self.end(
            OperationId::SOURCE_SECTION_PREFIX,
            vec![Argument::Integer(length)],
        )
    }

    fn begin_tag(&mut self, tags: TagMask) -> Result<(), Error> {
        self.begin(OperationId::TAG, vec![Argument::Tags(tags)])
    }

    fn end_tag(&mut self, tags: TagMask) -> Result<(), Error> {
        self.end(OperationId::TAG, vec![Argument::Tags(tags)])
    }

    fn begin_custom(&mut self, name: &str, arguments: Vec<Argument>) -> Result<(), Error> {
        let op = self.operation_id(name)?;
        self.begin(op, arguments)
    }

    fn end_custom(&mut self, name: &str, arguments: Vec<Argument>) -> Result<(), Error> {
        let op = self.operation_id(name)?;
        self.end(op, arguments)
    }

    fn emit_custom(&mut self, name: &str, arguments: Vec<Argument>) -> Result<(), Error> {
        let op = self.operation_id(name)?;
        self.emit(op, arguments)
    }
}

/// Assembles bytecode for every root of one parse
///
/// ```ignore
/// let mut pool = StatePool::default();
/// let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
/// builder.begin_root()?;
/// builder.emit_load_argument(0)?;
/// builder.end_root()?;
/// let nodes = builder.finish()?;
/// ```
pub struct Builder<'a> {
    model: &'a Model,
    config: BuilderConfig,
    pool: &'a mut StatePool,

    /// One state per open root, innermost last
    states: Vec<BuilderState>,

    /// Finished roots, indexed by the order in which they were begun
    roots: Vec<Option<BytecodeProgram>>,

    sources: Vec<Constant>,
    source_indices: HashMap<Constant, u32>,
    next_sequence_number: u32,
}

impl<'a> Builder<'a> {
    pub fn new(model: &'a Model, config: BuilderConfig, pool: &'a mut StatePool) -> Builder<'a> {
        Builder {
            model,
            config,
            pool,
            states: vec![],
            roots: vec![],
            sources: vec![],
            source_indices: HashMap::new(),
            next_sequence_number: 0,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Number of roots begun so far
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Collect the finished roots
    ///
    /// Fails if a root is still open: the parse forgot to end some operations.
    pub fn finish(mut self) -> Result<BytecodeNodes, Error> {
        if let Some(state) = self.states.last() {
            let error = state.fail(
                self.model,
                "Unexpected parser end - there are still operations on the stack. Did you forget to end them?",
            );
            for state in self.states.drain(..) {
                self.pool.release(state);
            }
            return Err(error);
        }

        let roots = self
            .roots
            .drain(..)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::internal("a root was begun but never finished"))?;
        Ok(BytecodeNodes {
            roots,
            sources: std::mem::take(&mut self.sources),
        })
    }

    pub(crate) fn state(&self) -> Result<&BuilderState, Error> {
        self.states.last().ok_or_else(no_root)
    }

    pub(crate) fn state_mut(&mut self) -> Result<&mut BuilderState, Error> {
        self.states.last_mut().ok_or_else(no_root)
    }

    fn next_sequence_number(&mut self) -> u32 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        sequence_number
    }

    /// Whether source sections are recorded
    pub(crate) fn collects_source_info(&self) -> bool {
        self.config.source_info
            && self
                .model
                .features()
                .contains(crate::model::Features::SOURCE_INFO)
    }

    pub(crate) fn block_scoping(&self) -> bool {
        self.model
            .features()
            .contains(crate::model::Features::BLOCK_SCOPING)
    }
}

fn no_root() -> Error {
    Error::IllegalState {
        message: String::from("Operations must be inside a root; call begin_root first"),
        operation_stack: String::from("<empty>"),
    }
}

impl OperationBuilder for Builder<'_> {
    fn model(&self) -> &Model {
        self.model
    }

    fn create_local(
        &mut self,
        name: Option<Constant>,
        info: Option<Constant>,
    ) -> Result<BytecodeLocal, Error> {
        self.create_local_in_scope(name, info)
    }

    fn create_label(&mut self) -> Result<BytecodeLabel, Error> {
        self.create_label_in_block()
    }

    fn begin(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        let model = self.model;
        let info = model
            .operation(op)
            .ok_or_else(|| Error::IllegalArgument(format!("unknown operation {:?}", op)))?;
        info.check_arguments(Phase::Begin, &arguments)?;
        log::trace!("begin {}", info.name);

        match info.kind {
            OperationKind::Root => self.begin_root_operation(),
            OperationKind::FinallyHandler => Err(Error::IllegalArgument(String::from(
                "FinallyHandler is emitted by the builder and cannot be begun directly",
            ))),
            kind => {
                self.before_child()?;
                self.begin_operation(op, kind, info.custom_index, arguments)
            }
        }
    }

    fn end(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        let model = self.model;
        let info = model
            .operation(op)
            .ok_or_else(|| Error::IllegalArgument(format!("unknown operation {:?}", op)))?;
        info.check_arguments(Phase::End, &arguments)?;
        log::trace!("end {}", info.name);

        match info.kind {
            OperationKind::Root => self.end_root().map(|_| ()),
            _ => self.end_operation(op, info.kind, arguments),
        }
    }

    fn emit(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        let model = self.model;
        let info = model
            .operation(op)
            .ok_or_else(|| Error::IllegalArgument(format!("unknown operation {:?}", op)))?;
        info.check_arguments(Phase::Emit, &arguments)?;
        log::trace!("emit {}", info.name);

        self.before_child()?;
        self.emit_operation(info.kind, info.custom_index, arguments)
    }

    fn end_root(&mut self) -> Result<RootId, Error> {
        self.end_root_operation()
    }
}
