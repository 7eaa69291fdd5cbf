#![allow(dead_code)]

use bcasm::model::{InstructionId, Model, OperationId};
use bcasm::*;

/// Forwards every call to an inner builder, keeping a log of the calls
pub struct Recorder<B: OperationBuilder> {
    pub inner: B,
    pub calls: Vec<String>,
}

impl<B: OperationBuilder> Recorder<B> {
    pub fn new(inner: B) -> Recorder<B> {
        Recorder {
            inner,
            calls: vec![],
        }
    }

    fn record(&mut self, phase: &str, op: OperationId, arguments: &[Argument]) {
        let name = self
            .inner
            .model()
            .operation(op)
            .map_or_else(|| format!("{:?}", op), |info| info.name.clone());
        self.calls.push(format!("{} {} {:?}", phase, name, arguments));
    }
}

impl<B: OperationBuilder> OperationBuilder for Recorder<B> {
    fn model(&self) -> &Model {
        self.inner.model()
    }

    fn create_local(
        &mut self,
        name: Option<Constant>,
        info: Option<Constant>,
    ) -> Result<BytecodeLocal, Error> {
        let local = self.inner.create_local(name.clone(), info.clone())?;
        self.calls
            .push(format!("local {:?} {:?} -> {:?}", name, info, local));
        Ok(local)
    }

    fn create_label(&mut self) -> Result<BytecodeLabel, Error> {
        let label = self.inner.create_label()?;
        self.calls.push(format!("label -> {:?}", label));
        Ok(label)
    }

    fn begin(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        self.record("begin", op, &arguments);
        self.inner.begin(op, arguments)
    }

    fn end(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        self.record("end", op, &arguments);
        self.inner.end(op, arguments)
    }

    fn emit(&mut self, op: OperationId, arguments: Vec<Argument>) -> Result<(), Error> {
        self.record("emit", op, &arguments);
        self.inner.emit(op, arguments)
    }

    fn end_root(&mut self) -> Result<RootId, Error> {
        let root = self.inner.end_root()?;
        self.calls.push(format!("end Root -> {:?}", root));
        Ok(root)
    }
}

/// Instructions of a root as `(name, immediates)`
pub fn listing(model: &Model, program: &BytecodeProgram) -> Vec<(String, Vec<i32>)> {
    program
        .instructions(model)
        .unwrap()
        .into_iter()
        .map(|instruction| {
            let name = model.instruction(instruction.id).unwrap().name.clone();
            (name, instruction.immediates)
        })
        .collect()
}

/// Expected listing entry
pub fn op(name: &str, immediates: &[i32]) -> (String, Vec<i32>) {
    (name.to_owned(), immediates.to_vec())
}

/// Bci of every instruction with the given name
pub fn bcis_of(model: &Model, program: &BytecodeProgram, name: &str) -> Vec<usize> {
    let id: InstructionId = model.instruction_id(name).unwrap();
    program
        .instructions(model)
        .unwrap()
        .into_iter()
        .filter(|instruction| instruction.id == id)
        .map(|instruction| instruction.bci)
        .collect()
}

/// Build a single parse with a fresh pool
pub fn build<F>(model: &Model, config: BuilderConfig, parse: F) -> Result<BytecodeNodes, Error>
where
    F: FnOnce(&mut dyn OperationBuilder) -> Result<(), Error>,
{
    let mut pool = StatePool::default();
    let mut builder = Builder::new(model, config, &mut pool);
    parse(&mut builder)?;
    builder.finish()
}
