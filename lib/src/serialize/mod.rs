//! Recording builder calls into a byte stream and replaying them
//!
//! A [`Serializer`] stands in for the [`crate::Builder`] during a parse and writes every call it
//! receives to a stream. [`deserialize`] reads the stream back and issues the same calls, in the
//! same order, to any [`OperationBuilder`], so building from a replayed stream gives exactly the
//! bytecode of building directly.
//!
//! ### Format
//!
//! A stream is a sequence of records, each starting with a big-endian `i16` code:
//!
//!   - `(operation id << 1) | end` for `begin`/`emit` (end bit clear) and `end` (end bit set)
//!     calls, followed by the arguments of the call
//!   - [`CODE_CREATE_LABEL`] and [`CODE_CREATE_LOCAL`] (followed by `i32` pool indices of the
//!     name and info) for handle creation
//!   - [`CODE_CREATE_OBJECT`] (`i32` pool index, then the constant) and [`CODE_CREATE_NULL`]
//!     (`i32` pool index) for constant pool definitions
//!   - [`CODE_END`] after the last record
//!
//! Locals and labels are written as `(context depth: i16, index: i16)`, constants as `i32` pool
//! indices, and tags as an `i32` mask. A finally generator is recorded by calling it once and is
//! written in place as [`CODE_CREATE_FINALLY_GENERATOR`] followed by the `u32` length of the
//! nested stream, which ends with [`CODE_END_FINALLY_GENERATOR`]. Each nested stream opens a new
//! context one level deeper than its parent: handles it creates are only visible inside it.
//! Ending a root appends `(context depth: i32, root index: i32)`.
//!
//! The constant pool is shared by all contexts. Definitions are always written at the top level,
//! in front of the record whose arguments first mention the constant.

mod binary_format;

pub use binary_format::{Deserialize, Serialize};

use crate::builder::{
    finally_generator, Argument, BytecodeLabel, BytecodeLocal, FinallyGenerator, OperationBuilder,
};
use crate::errors::EncodingOverflow;
use crate::model::{ArgumentKind, Model, OperationId, OperationKind, Phase, TagMask};
use crate::{Constant, Error, RootId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

pub const CODE_CREATE_LABEL: i16 = -2;
pub const CODE_CREATE_LOCAL: i16 = -3;
pub const CODE_CREATE_OBJECT: i16 = -4;
pub const CODE_CREATE_NULL: i16 = -5;
pub const CODE_CREATE_FINALLY_GENERATOR: i16 = -6;
pub const CODE_END_FINALLY_GENERATOR: i16 = -7;
pub const CODE_END: i16 = -8;

/// Record the calls of `parse` into `writer`
///
/// Returns the writer once the end marker has been written.
pub fn serialize<W, F>(model: &Model, writer: W, parse: F) -> Result<W, Error>
where
    W: Write,
    F: FnOnce(&mut dyn OperationBuilder) -> Result<(), Error>,
{
    let mut serializer = Serializer::new(model, writer);
    parse(&mut serializer)?;
    serializer.finish()
}

/// [`OperationBuilder`] writing the calls it receives to a stream
///
/// Handles handed out by a serializer record the id of the context they were created in (in the
/// field a builder uses for the root). A handle is usable only while that context is open, and is
/// written as the `(depth, index)` pair of that context.
pub struct Serializer<'a, W: Write> {
    model: &'a Model,
    writer: W,

    /// Handle counters of the open contexts, innermost last
    contexts: Vec<ContextCounters>,
    next_context: u32,

    /// Streams of the finally generators being recorded, innermost last
    generators: Vec<Vec<u8>>,

    /// Constant definitions waiting for the next top level record
    pending: Vec<u8>,
    objects: HashMap<Constant, i32>,
    null_index: Option<i32>,
}

#[derive(Default)]
struct ContextCounters {
    id: u32,
    labels: u16,
    locals: u16,
    roots: u32,
}

impl<'a, W: Write> Serializer<'a, W> {
    pub fn new(model: &'a Model, writer: W) -> Serializer<'a, W> {
        Serializer {
            model,
            writer,
            contexts: vec![ContextCounters::default()],
            next_context: 1,
            generators: vec![],
            pending: vec![],
            objects: HashMap::new(),
            null_index: None,
        }
    }

    /// Write the end marker and hand back the writer
    pub fn finish(mut self) -> Result<W, Error> {
        if !self.generators.is_empty() {
            return Err(Error::internal("serializer finished inside a finally generator"));
        }
        let mut record = vec![];
        CODE_END.serialize(&mut record)?;
        self.write_record(&record)?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn depth(&self) -> u16 {
        self.contexts.len().saturating_sub(1) as u16
    }

    fn counters(&mut self) -> Result<&mut ContextCounters, Error> {
        self.contexts
            .last_mut()
            .ok_or_else(|| Error::internal("serializer has no open context"))
    }

    /// Append a record to the current stream
    ///
    /// At the top level, pending constant definitions go out first.
    fn write_record(&mut self, record: &[u8]) -> Result<(), Error> {
        match self.generators.last_mut() {
            Some(stream) => stream.extend_from_slice(record),
            None => {
                self.writer.write_all(&self.pending)?;
                self.pending.clear();
                self.writer.write_all(record)?;
            }
        }
        Ok(())
    }

    /// Pool index of a constant (`None` being the null object), defining it on first use
    fn object_index(&mut self, constant: Option<&Constant>) -> Result<i32, Error> {
        let existing = match constant {
            Some(constant) => {
                constant.validate()?;
                self.objects.get(constant).copied()
            }
            None => self.null_index,
        };
        if let Some(index) = existing {
            return Ok(index);
        }

        let count = self.objects.len() + self.null_index.map_or(0, |_| 1);
        let index = i32::try_from(count)
            .map_err(|_| Error::Encoding(EncodingOverflow::ConstantPool(count)))?;
        match constant {
            Some(constant) => {
                CODE_CREATE_OBJECT.serialize(&mut self.pending)?;
                index.serialize(&mut self.pending)?;
                constant.serialize(&mut self.pending)?;
                self.objects.insert(constant.clone(), index);
            }
            None => {
                CODE_CREATE_NULL.serialize(&mut self.pending)?;
                index.serialize(&mut self.pending)?;
                self.null_index = Some(index);
            }
        }
        Ok(index)
    }

    /// Depth of the context a handle was created in, which must still be open
    fn handle_depth(&self, context: u32) -> Result<i16, Error> {
        match self.contexts.iter().position(|counters| counters.id == context) {
            Some(depth) => Ok(depth as i16),
            None => Err(Error::IllegalArgument(String::from(
                "handle was not created by this serializer, or its context has ended",
            ))),
        }
    }

    fn encode_local(&self, out: &mut Vec<u8>, local: &BytecodeLocal) -> Result<(), Error> {
        self.handle_depth(local.root)?.serialize(out)?;
        (local.local_index as i16).serialize(out)?;
        Ok(())
    }

    fn encode_arguments(&mut self, arguments: Vec<Argument>) -> Result<Vec<u8>, Error> {
        let mut out = vec![];
        for argument in arguments {
            match argument {
                Argument::Local(local) => self.encode_local(&mut out, &local)?,
                Argument::LocalArray(locals) => {
                    let count = i16::try_from(locals.len())
                        .map_err(|_| Error::Encoding(EncodingOverflow::Locals(locals.len())))?;
                    count.serialize(&mut out)?;
                    for local in &locals {
                        self.encode_local(&mut out, local)?;
                    }
                }
                Argument::Label(label) => {
                    self.handle_depth(label.root)?.serialize(&mut out)?;
                    (label.index as i16).serialize(&mut out)?;
                }
                Argument::Tags(tags) => (tags.0 as i32).serialize(&mut out)?,
                Argument::Short(value) => value.serialize(&mut out)?,
                Argument::Integer(value) => value.serialize(&mut out)?,
                Argument::Constant(constant) => {
                    self.object_index(Some(&constant))?.serialize(&mut out)?
                }
                Argument::FinallyGenerator(generator) => {
                    let stream = self.record_generator(&generator)?;
                    CODE_CREATE_FINALLY_GENERATOR.serialize(&mut out)?;
                    stream.serialize(&mut out)?;
                }
            }
        }
        Ok(out)
    }

    /// Run a finally generator once against a fresh nested context, capturing its stream
    fn record_generator(&mut self, generator: &FinallyGenerator) -> Result<Vec<u8>, Error> {
        let id = self.next_context;
        self.next_context += 1;
        self.contexts.push(ContextCounters {
            id,
            ..ContextCounters::default()
        });
        self.generators.push(vec![]);
        let result = {
            let builder: &mut dyn OperationBuilder = self;
            generator(builder)
        };
        self.contexts.pop();
        let mut stream = self.generators.pop().unwrap_or_default();
        result?;
        CODE_END_FINALLY_GENERATOR.serialize(&mut stream)?;
        Ok(stream)
    }

    fn record(&mut self, op: OperationId, phase: Phase, arguments: Vec<Argument>) -> Result<(), Error> {
        let model = self.model;
        let info = model
            .operation(op)
            .ok_or_else(|| Error::IllegalArgument(format!("unknown operation {:?}", op)))?;
        info.check_arguments(phase, &arguments)?;
        log::trace!("serialize {:?} {}", phase, info.name);

        let code = i16::try_from(((op.0 as u32) << 1) | (phase == Phase::End) as u32)
            .map_err(|_| Error::IllegalArgument(format!("operation id {} too large", op.0)))?;
        let mut record = vec![];
        code.serialize(&mut record)?;
        record.extend(self.encode_arguments(arguments)?);
        self.write_record(&record)
    }
}

impl<W: Write> OperationBuilder for Serializer<'_, W> {
    fn model(&self) -> &Model {
        self.model
    }

    fn create_local(
        &mut self,
        name: Option<Constant>,
        info: Option<Constant>,
    ) -> Result<BytecodeLocal, Error> {
        let name = self.object_index(name.as_ref())?;
        let info = self.object_index(info.as_ref())?;
        let counters = self.counters()?;
        let root = counters.id;
        let index = counters.locals;
        if index >= i16::MAX as u16 {
            return Err(Error::Encoding(EncodingOverflow::Locals(index as usize)));
        }
        counters.locals += 1;

        let mut record = vec![];
        CODE_CREATE_LOCAL.serialize(&mut record)?;
        name.serialize(&mut record)?;
        info.serialize(&mut record)?;
        self.write_record(&record)?;
        Ok(BytecodeLocal {
            root,
            local_index: index,
            frame_index: index,
            scope: None,
        })
    }

    fn create_label(&mut self) -> Result<BytecodeLabel, Error> {
        let counters = self.counters()?;
        let root = counters.id;
        let index = counters.labels;
        if index >= i16::MAX as u16 {
            return Err(Error::Encoding(EncodingOverflow::Counter(
                "labels",
                index as u64,
            )));
        }
        counters.labels += 1;

        let mut record = vec![];
        CODE_CREATE_LABEL.serialize(&mut record)?;
        self.write_record(&record)?;
        Ok(BytecodeLabel {
            root,
            index: index as u32,
        })
    }

    fn begin(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        self.record(op, Phase::Begin, arguments)
    }

    fn end(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        if op == OperationId::ROOT {
            if let Some(info) = self.model.operation(op) {
                info.check_arguments(Phase::End, &arguments)?;
            }
            return self.end_root().map(|_| ());
        }
        self.record(op, Phase::End, arguments)
    }

    fn emit(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        self.record(op, Phase::Emit, arguments)
    }

    fn end_root(&mut self) -> Result<RootId, Error> {
        let depth = self.depth();
        let counters = self.counters()?;
        let index = counters.roots;
        counters.roots += 1;

        let mut record = vec![];
        (((OperationId::ROOT.0 << 1) | 1) as i16).serialize(&mut record)?;
        (depth as i32).serialize(&mut record)?;
        (index as i32).serialize(&mut record)?;
        self.write_record(&record)?;
        Ok(RootId {
            context: depth,
            index,
        })
    }
}

/// Constant pool of a stream being replayed, `None` entries being the null object
type Objects = Rc<RefCell<HashMap<i32, Option<Constant>>>>;

/// Handles created while replaying one (nested) stream
struct Context {
    depth: u16,
    parent: Option<Rc<Context>>,
    locals: RefCell<Vec<BytecodeLocal>>,
    labels: RefCell<Vec<BytecodeLabel>>,
    roots: RefCell<Vec<RootId>>,
}

impl Context {
    fn new(parent: Option<Rc<Context>>) -> Context {
        Context {
            depth: parent.as_ref().map_or(0, |parent| parent.depth + 1),
            parent,
            locals: RefCell::new(vec![]),
            labels: RefCell::new(vec![]),
            roots: RefCell::new(vec![]),
        }
    }

    /// This context or the enclosing one at `depth`
    fn at_depth(&self, depth: i32) -> Result<&Context, Error> {
        let mut context = self;
        while context.depth as i32 != depth {
            match &context.parent {
                Some(parent) if context.depth as i32 > depth => context = &**parent,
                _ => return Err(Error::malformed(format!("no context at depth {}", depth))),
            }
        }
        Ok(context)
    }

    fn local(&self, depth: i16, index: i16) -> Result<BytecodeLocal, Error> {
        let context = self.at_depth(depth as i32)?;
        let locals = context.locals.borrow();
        usize::try_from(index)
            .ok()
            .and_then(|index| locals.get(index).copied())
            .ok_or_else(|| Error::malformed(format!("undefined local {}.{}", depth, index)))
    }

    fn label(&self, depth: i16, index: i16) -> Result<BytecodeLabel, Error> {
        let context = self.at_depth(depth as i32)?;
        let labels = context.labels.borrow();
        usize::try_from(index)
            .ok()
            .and_then(|index| labels.get(index).copied())
            .ok_or_else(|| Error::malformed(format!("undefined label {}.{}", depth, index)))
    }

    /// Map roots mentioned in a constant to the roots the replay produced
    fn resolve(&self, constant: Constant) -> Result<Constant, Error> {
        match constant {
            Constant::Root(id) => {
                let context = self.at_depth(id.context as i32)?;
                let roots = context.roots.borrow();
                roots
                    .get(id.index as usize)
                    .map(|root| Constant::Root(*root))
                    .ok_or_else(|| {
                        Error::malformed(format!("undefined root {}.{}", id.context, id.index))
                    })
            }
            Constant::Array(elements) => elements
                .into_iter()
                .map(|element| self.resolve(element))
                .collect::<Result<Vec<_>, _>>()
                .map(Constant::Array),
            constant => Ok(constant),
        }
    }
}

/// Replay a serialized stream into `builder`
pub fn deserialize(stream: &[u8], builder: &mut dyn OperationBuilder) -> Result<(), Error> {
    let objects: Objects = Rc::new(RefCell::new(HashMap::new()));
    let context = Rc::new(Context::new(None));
    let mut reader = stream;
    replay(&mut reader, &context, &objects, builder, CODE_END)?;
    if !reader.is_empty() {
        return Err(Error::malformed(format!(
            "{} trailing bytes after the end of the stream",
            reader.len()
        )));
    }
    Ok(())
}

/// Replay records until `terminator`
fn replay(
    reader: &mut &[u8],
    context: &Rc<Context>,
    objects: &Objects,
    builder: &mut dyn OperationBuilder,
    terminator: i16,
) -> Result<(), Error> {
    loop {
        match i16::deserialize(reader)? {
            CODE_CREATE_LABEL => {
                let label = builder.create_label()?;
                context.labels.borrow_mut().push(label);
            }
            CODE_CREATE_LOCAL => {
                let name = read_object(reader, context, objects)?;
                let info = read_object(reader, context, objects)?;
                let local = builder.create_local(name, info)?;
                context.locals.borrow_mut().push(local);
            }
            CODE_CREATE_OBJECT => {
                let index = i32::deserialize(reader)?;
                let constant = Constant::deserialize(reader)?;
                objects.borrow_mut().insert(index, Some(constant));
            }
            CODE_CREATE_NULL => {
                let index = i32::deserialize(reader)?;
                objects.borrow_mut().insert(index, None);
            }
            code if code == terminator => return Ok(()),
            code if code >= 0 => replay_operation(code, reader, context, objects, builder)?,
            code => {
                return Err(Error::malformed(format!(
                    "unexpected code {} at depth {}",
                    code, context.depth
                )))
            }
        }
    }
}

fn replay_operation(
    code: i16,
    reader: &mut &[u8],
    context: &Rc<Context>,
    objects: &Objects,
    builder: &mut dyn OperationBuilder,
) -> Result<(), Error> {
    let op = OperationId((code >> 1) as u16);
    let end = code & 1 == 1;
    let (kind, is_leaf, expected) = {
        let info = builder
            .model()
            .operation(op)
            .ok_or_else(|| Error::malformed(format!("unknown operation id {}", op.0)))?;
        let expected = match end {
            true => info.end_arguments.clone(),
            false => info.begin_arguments.clone(),
        };
        (info.kind, info.is_leaf, expected)
    };

    let mut arguments = Vec::with_capacity(expected.len());
    for argument in expected {
        arguments.push(read_argument(argument, reader, context, objects)?);
    }

    match (kind, end) {
        (OperationKind::Root, true) => {
            let depth = i32::deserialize(reader)?;
            let index = i32::deserialize(reader)?;
            if depth != context.depth as i32 || index as usize != context.roots.borrow().len() {
                return Err(Error::malformed(format!(
                    "root {}.{} ended out of order",
                    depth, index
                )));
            }
            let root = builder.end_root()?;
            context.roots.borrow_mut().push(root);
            Ok(())
        }
        (_, true) => builder.end(op, arguments),
        (_, false) if is_leaf => builder.emit(op, arguments),
        (_, false) => builder.begin(op, arguments),
    }
}

fn read_object(
    reader: &mut &[u8],
    context: &Context,
    objects: &Objects,
) -> Result<Option<Constant>, Error> {
    let index = i32::deserialize(reader)?;
    let object = objects
        .borrow()
        .get(&index)
        .cloned()
        .ok_or_else(|| Error::malformed(format!("object {} used before it was created", index)))?;
    object.map(|constant| context.resolve(constant)).transpose()
}

fn read_argument(
    kind: ArgumentKind,
    reader: &mut &[u8],
    context: &Rc<Context>,
    objects: &Objects,
) -> Result<Argument, Error> {
    let argument = match kind {
        ArgumentKind::Local => {
            let depth = i16::deserialize(reader)?;
            Argument::Local(context.local(depth, i16::deserialize(reader)?)?)
        }
        ArgumentKind::LocalArray => {
            let count = i16::deserialize(reader)?;
            let mut locals = vec![];
            for _ in 0..count {
                let depth = i16::deserialize(reader)?;
                locals.push(context.local(depth, i16::deserialize(reader)?)?);
            }
            Argument::LocalArray(locals)
        }
        ArgumentKind::Label => {
            let depth = i16::deserialize(reader)?;
            Argument::Label(context.label(depth, i16::deserialize(reader)?)?)
        }
        ArgumentKind::Tags => Argument::Tags(TagMask(i32::deserialize(reader)? as u32)),
        ArgumentKind::Short => Argument::Short(i16::deserialize(reader)?),
        ArgumentKind::Integer => Argument::Integer(i32::deserialize(reader)?),
        ArgumentKind::Constant => match read_object(reader, context, objects)? {
            Some(constant) => Argument::Constant(constant),
            None => return Err(Error::malformed("null passed as a constant argument")),
        },
        ArgumentKind::FinallyGenerator => {
            let code = i16::deserialize(reader)?;
            if code != CODE_CREATE_FINALLY_GENERATOR {
                return Err(Error::malformed(format!(
                    "expected a finally generator, got code {}",
                    code
                )));
            }
            let stream = Vec::<u8>::deserialize(reader)?;
            Argument::FinallyGenerator(replaying_generator(stream, context.clone(), objects.clone()))
        }
    };
    Ok(argument)
}

/// Generator replaying a nested stream, in a fresh context for every call
fn replaying_generator(stream: Vec<u8>, parent: Rc<Context>, objects: Objects) -> FinallyGenerator {
    finally_generator(move |builder| {
        let context = Rc::new(Context::new(Some(parent.clone())));
        let mut reader = stream.as_slice();
        replay(&mut reader, &context, &objects, builder, CODE_END_FINALLY_GENERATOR)?;
        match reader.is_empty() {
            true => Ok(()),
            false => Err(Error::malformed("trailing bytes after a finally generator")),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::{Builder, StatePool};
    use crate::model::ModelBuilder;
    use crate::BuilderConfig;
    use std::cell::Cell;

    fn return_one(builder: &mut dyn OperationBuilder) -> Result<(), Error> {
        builder.begin_root()?;
        builder.emit_load_constant(Constant::Integer(1))?;
        builder.end_root()?;
        Ok(())
    }

    #[test]
    fn stream_layout() {
        let model = ModelBuilder::new("Test").build().unwrap();
        let stream = serialize(&model, vec![], return_one).unwrap();

        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            0x00, 0x00,                                     // begin Root
            0xff, 0xfc, 0, 0, 0, 0,                         // object #0 =
            1, 0, 0, 0, 0, 0, 0, 0, 1,                      //   1
            0x00, 0x18, 0, 0, 0, 0,                         // emit LoadConstant #0
            0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0,             // end Root 0.0
            0xff, 0xf8,                                     // end
        ];
        assert_eq!(stream, expected);
    }

    #[test]
    fn replay_matches_direct_build() {
        let model = ModelBuilder::new("Test").build().unwrap();
        let stream = serialize(&model, vec![], return_one).unwrap();

        let mut pool = StatePool::default();
        let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
        return_one(&mut builder).unwrap();
        let direct = builder.finish().unwrap();

        let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
        deserialize(&stream, &mut builder).unwrap();
        assert_eq!(builder.finish().unwrap(), direct);
    }

    #[test]
    fn malformed_streams_are_rejected() {
        let model = ModelBuilder::new("Test").build().unwrap();
        let mut pool = StatePool::default();

        let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
        match deserialize(&[0x00], &mut builder) {
            Err(Error::IoError(err)) => assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected an I/O error, got {:?}", other.map(|_| ())),
        }

        let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
        match deserialize(&[0xff, 0xf9], &mut builder) {
            Err(Error::IoError(err)) => assert_eq!(err.kind(), std::io::ErrorKind::InvalidData),
            other => panic!("expected malformed data, got {:?}", other.map(|_| ())),
        }

        // Constant #3 was never defined
        let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
        let stream = [0x00, 0x00, 0x00, 0x18, 0, 0, 0, 3];
        assert!(matches!(
            deserialize(&stream, &mut builder),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn handles_of_ended_contexts_are_rejected() {
        let model = ModelBuilder::new("Test").build().unwrap();
        let mut serializer = Serializer::new(&model, vec![]);
        serializer.begin_root().unwrap();
        let leaked = BytecodeLabel { root: 1, index: 0 };
        assert!(matches!(
            serializer.emit_branch(leaked),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn handles_do_not_carry_over_to_sibling_generators() {
        let model = ModelBuilder::new("Test").build().unwrap();
        let leaked = Rc::new(Cell::new(None));
        let create = {
            let leaked = leaked.clone();
            finally_generator(move |builder| {
                leaked.set(Some(builder.create_label()?));
                Ok(())
            })
        };
        let branch = {
            let leaked = leaked.clone();
            finally_generator(move |builder| match leaked.get() {
                Some(label) => builder.emit_branch(label),
                None => Ok(()),
            })
        };

        let mut serializer = Serializer::new(&model, vec![]);
        serializer.begin_root().unwrap();
        serializer.begin_try_finally(create).unwrap();
        serializer.emit_load_null().unwrap();
        serializer.end_try_finally().unwrap();
        assert!(leaked.get().is_some());

        // Same depth as the first generator, but a different context
        assert!(matches!(
            serializer.begin_try_finally(branch),
            Err(Error::IllegalArgument(_))
        ));
    }
}
