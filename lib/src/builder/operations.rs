use super::handler_table::{HandlerKind, HandlerTarget};
use super::operation_stack::{
    ConditionalData, CustomData, FinallyHandlerData, OperationData, OperationStackEntry, RootData,
    ScopeData, ShortCircuitData, SourceSectionData, TagData, TryData, WhileData,
};
use super::source_table::SourceSpan;
use super::state::{BuilderState, Emitted};
use super::{Argument, Builder, OperationBuilder};
use crate::errors::EncodingOverflow;
use crate::model::{CustomKind, InstructionId, OperandKind, OperationId, OperationKind, TagMask};
use crate::program::BytecodeProgram;
use crate::{Constant, Error, RootId};

/// Number of variadic operands collected by one `load.variadic`
const VARIADIC_GROUP: u32 = 8;

/// Get the data of the operation at `$sp`, bailing out if it has an unexpected kind
macro_rules! data_mut {
    ($state:expr, $sp:expr, $variant:ident) => {
        match $state.operations.get_mut($sp).map(|entry| &mut entry.data) {
            Some(OperationData::$variant(data)) => data,
            _ => {
                return Err(Error::internal(concat!(
                    "expected ",
                    stringify!($variant),
                    " data on the operation stack"
                )))
            }
        }
    };
}

pub(super) use data_mut;

/// Most children an operation with fixed arity accepts
fn child_limit(kind: OperationKind) -> Option<u32> {
    match kind {
        OperationKind::IfThen | OperationKind::While => Some(2),
        OperationKind::IfThenElse | OperationKind::Conditional => Some(3),
        OperationKind::TryCatch | OperationKind::TryCatchOtherwise => Some(2),
        OperationKind::TryFinally => Some(1),
        OperationKind::LoadLocalMaterialized
        | OperationKind::StoreLocal
        | OperationKind::Return
        | OperationKind::Tag => Some(1),
        OperationKind::StoreLocalMaterialized => Some(2),
        _ => None,
    }
}

fn top_sp(state: &BuilderState) -> Result<usize, Error> {
    state
        .operations
        .len()
        .checked_sub(1)
        .ok_or_else(|| Error::internal("operation stack underflow"))
}

impl<'a> Builder<'a> {
    /// State error against the innermost root
    pub(super) fn fail(&self, message: impl Into<String>) -> Error {
        match self.states.last() {
            Some(state) => state.fail(self.model, message),
            None => super::no_root(),
        }
    }

    pub(super) fn operation_name(&self, op: OperationId) -> &'a str {
        self.model
            .operation(op)
            .map(|info| info.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub(super) fn push_operation(
        &mut self,
        op: OperationId,
        kind: OperationKind,
        data: OperationData,
    ) -> Result<usize, Error> {
        let sequence_number = self.next_sequence_number();
        let state = self.state_mut()?;
        Ok(state.operations.push(OperationStackEntry {
            op,
            kind,
            sequence_number,
            child_count: 0,
            produced_value: false,
            data,
        }))
    }

    fn pop_operation(&mut self) -> Result<OperationStackEntry, Error> {
        self.state_mut()?
            .operations
            .pop()
            .ok_or_else(|| Error::internal("operation stack underflow"))
    }

    /// Check that `op` is the innermost open operation
    fn check_top(&self, op: OperationId) -> Result<&OperationStackEntry, Error> {
        let state = self.state()?;
        match state.operations.top() {
            Some(top) if top.op == op => Ok(top),
            Some(top) => Err(self.fail(format!(
                "Unexpected end of {}: the innermost open operation is {}",
                self.operation_name(op),
                self.operation_name(top.op)
            ))),
            None => Err(self.fail(format!(
                "Unexpected end of {}: no operation is open",
                self.operation_name(op)
            ))),
        }
    }

    /// Check that the innermost operation got exactly the children it needs
    fn check_child_count(&self, op: OperationId, expected: u32) -> Result<(), Error> {
        let actual = self.check_top(op)?.child_count;
        if actual != expected {
            return Err(self.fail(format!(
                "Operation {} expected exactly {} child(ren), but {} provided. This is probably a bug in the parser.",
                self.operation_name(op),
                expected,
                actual
            )));
        }
        Ok(())
    }

    pub(super) fn emit_instruction(
        &mut self,
        id: InstructionId,
        immediates: &[i32],
    ) -> Result<Option<Emitted>, Error> {
        let model = self.model;
        self.state_mut()?.emit_instruction(model, id, immediates)
    }

    fn emit_forward_branch(
        &mut self,
        id: InstructionId,
        immediates: &[i32],
    ) -> Result<Option<usize>, Error> {
        let model = self.model;
        self.state_mut()?.emit_forward_branch(model, id, immediates)
    }

    fn require_value(&self, produced: bool, child: u32) -> Result<(), Error> {
        if produced {
            return Ok(());
        }
        let name = match self.state()?.operations.top() {
            Some(top) => self.operation_name(top.op),
            None => "<none>",
        };
        Err(self.fail(format!(
            "Operation {} expected a value-producing child at position {}, but a void one was provided.",
            name, child
        )))
    }

    /// Called before every child (begun or emitted) of the innermost operation
    pub(super) fn before_child(&mut self) -> Result<(), Error> {
        let model = self.model;
        let state = self.state_mut()?;
        state.update_reachable();

        let (op, kind, child, produced, custom) = match state.operations.top() {
            Some(top) => (
                top.op,
                top.kind,
                top.child_count,
                top.produced_value,
                match &top.data {
                    OperationData::Custom(data) => Some(data.index),
                    OperationData::ShortCircuit(data) => Some(data.index),
                    _ => None,
                },
            ),
            None => return Err(Error::internal("child without a parent operation")),
        };

        if let Some(limit) = child_limit(kind) {
            if child >= limit {
                return Err(self.fail(format!(
                    "Operation {} expected at most {} child(ren), but more were provided",
                    self.operation_name(op),
                    limit
                )));
            }
        }

        match kind {
            OperationKind::Root
            | OperationKind::Block
            | OperationKind::Source
            | OperationKind::SourceSection
            | OperationKind::SourceSectionPrefix => {
                if child > 0 && produced {
                    self.emit_instruction(InstructionId::POP, &[])?;
                }
            }
            OperationKind::Custom
            | OperationKind::CustomYield
            | OperationKind::CustomInstrumentation => {
                let index = custom.ok_or_else(|| Error::internal("custom operation without data"))?;
                if model.custom(index).declaration.operand_at(child as usize).is_none() {
                    return Err(self.fail(format!(
                        "Operation {} expected at most {} child(ren), but more were provided",
                        self.operation_name(op),
                        child
                    )));
                }
            }
            OperationKind::CustomShortCircuit => {
                if child > 0 {
                    let index =
                        custom.ok_or_else(|| Error::internal("short circuit without data"))?;
                    self.emit_short_circuit_test(index)?;
                }
            }
            _ => (),
        }
        Ok(())
    }

    /// Called after every child of the innermost operation, with whether it left a value
    pub(super) fn after_child(&mut self, produced: bool) -> Result<(), Error> {
        let (kind, child) = match self.state()?.operations.top() {
            Some(top) => (top.kind, top.child_count),
            None => return Err(Error::internal("child without a parent operation")),
        };

        match kind {
            OperationKind::FinallyHandler => {
                if produced {
                    self.emit_instruction(InstructionId::POP, &[])?;
                }
            }
            OperationKind::IfThen | OperationKind::IfThenElse | OperationKind::Conditional => {
                self.after_conditional_child(kind, child, produced)?
            }
            OperationKind::While => self.after_while_child(child, produced)?,
            OperationKind::TryCatch
            | OperationKind::TryFinally
            | OperationKind::TryCatchOtherwise => self.after_try_child(kind, child, produced)?,
            OperationKind::LoadLocalMaterialized
            | OperationKind::StoreLocal
            | OperationKind::StoreLocalMaterialized
            | OperationKind::Return
            | OperationKind::CustomShortCircuit => self.require_value(produced, child)?,
            OperationKind::Custom
            | OperationKind::CustomYield
            | OperationKind::CustomInstrumentation => self.after_custom_child(child, produced)?,
            _ => (),
        }

        if let Some(top) = self.state_mut()?.operations.top_mut() {
            top.child_count += 1;
            top.produced_value = produced;
        }
        Ok(())
    }

    fn after_conditional_child(
        &mut self,
        kind: OperationKind,
        child: u32,
        produced: bool,
    ) -> Result<(), Error> {
        let model = self.model;
        match child {
            0 => {
                self.require_value(produced, child)?;
                let state = self.state_mut()?;
                let profile = state.allocate_branch_profile()?;
                let site =
                    state.emit_forward_branch(model, InstructionId::BRANCH_FALSE, &[-1, profile])?;
                let reachable = state.reachable;
                let sp = top_sp(state)?;
                let data = data_mut!(state, sp, Conditional);
                data.false_branch = site;
                data.this_reachable = reachable;
                data.then_reachable = reachable;
                data.else_reachable = reachable;
            }
            1 => {
                if kind == OperationKind::Conditional {
                    self.require_value(produced, child)?;
                } else if produced {
                    self.emit_instruction(InstructionId::POP, &[])?;
                }
                if kind != OperationKind::IfThen {
                    let state = self.state_mut()?;
                    let then_reachable = state.reachable;
                    let end_branch = state.emit_forward_branch(model, InstructionId::BRANCH, &[-1])?;
                    if kind == OperationKind::Conditional {
                        // Only one of the two arms leaves its value
                        state.update_stack_height(-1)?;
                    }
                    let sp = top_sp(state)?;
                    let data = data_mut!(state, sp, Conditional);
                    data.then_reachable = then_reachable;
                    data.end_branch = end_branch;
                    let false_branch = data.false_branch.take();
                    state.patch_branch(false_branch);
                }
            }
            _ => {
                if kind == OperationKind::Conditional {
                    self.require_value(produced, child)?;
                } else if produced {
                    self.emit_instruction(InstructionId::POP, &[])?;
                }
            }
        }
        Ok(())
    }

    fn after_while_child(&mut self, child: u32, produced: bool) -> Result<(), Error> {
        let model = self.model;
        if child == 0 {
            self.require_value(produced, child)?;
            let state = self.state_mut()?;
            let profile = state.allocate_branch_profile()?;
            let site =
                state.emit_forward_branch(model, InstructionId::BRANCH_FALSE, &[-1, profile])?;
            let reachable = state.reachable;
            let sp = top_sp(state)?;
            let data = data_mut!(state, sp, While);
            data.end_branch = site;
            data.while_reachable = reachable;
            data.body_reachable = reachable;
        } else {
            if produced {
                self.emit_instruction(InstructionId::POP, &[])?;
            }
            let state = self.state_mut()?;
            let sp = top_sp(state)?;
            let start = data_mut!(state, sp, While).start_bci;
            state.emit_instruction(model, InstructionId::BRANCH_BACKWARD, &[start as i32])?;
        }
        Ok(())
    }

    fn after_try_child(&mut self, kind: OperationKind, child: u32, produced: bool) -> Result<(), Error> {
        let model = self.model;
        if produced {
            self.emit_instruction(InstructionId::POP, &[])?;
        }
        if child > 0 {
            // The exception
            self.emit_instruction(InstructionId::POP, &[])?;
            return Ok(());
        }

        let state = self.state_mut()?;
        let sp = top_sp(state)?;
        let end = state.leader_bci();
        let (handler_id, stack_height, try_start) = {
            let data = data_mut!(state, sp, Try);
            (data.handler_id, data.stack_height, data.try_start_bci)
        };
        state.handlers.add(
            try_start,
            end,
            HandlerKind::Custom,
            HandlerTarget::Pending(handler_id),
            stack_height,
        );

        if kind == OperationKind::TryFinally {
            let reachable = state.reachable;
            data_mut!(state, sp, Try).try_reachable = reachable;
            return Ok(());
        }

        if kind == OperationKind::TryCatchOtherwise && state.reachable {
            self.emit_finally_handler(sp)?;
        }
        let state = self.state_mut()?;
        let try_reachable = state.reachable;
        let end_branch = state.emit_forward_branch(model, InstructionId::BRANCH, &[-1])?;
        let handler_bci = state.leader_bci();
        state.handlers.resolve(handler_id, handler_bci);
        state.current_stack_height = stack_height;
        state.update_stack_height(1)?;
        let data = data_mut!(state, sp, Try);
        data.try_reachable = try_reachable;
        data.end_branch = end_branch;
        Ok(())
    }

    fn after_custom_child(&mut self, child: u32, produced: bool) -> Result<(), Error> {
        let model = self.model;
        let state = self.state_mut()?;
        let sp = top_sp(state)?;
        let index = data_mut!(state, sp, Custom).index;
        let declaration = &model.custom(index).declaration;

        match declaration.operand_at(child as usize) {
            Some(OperandKind::Value) => self.require_value(produced, child)?,
            Some(OperandKind::VoidAllowed) => {
                if !produced {
                    self.emit_instruction(InstructionId::LOAD_NULL, &[])?;
                }
            }
            None => return Err(Error::internal("custom operand out of range")),
        }

        if declaration.variadic && child as usize + 1 >= declaration.operands.len() {
            let state = self.state_mut()?;
            let data = data_mut!(state, sp, Custom);
            data.variadic_count += 1;
            if data.variadic_count % VARIADIC_GROUP == 0 {
                data.variadic_groups += 1;
                state.emit_instruction(
                    model,
                    InstructionId::LOAD_VARIADIC,
                    &[VARIADIC_GROUP as i32],
                )?;
            }
        }
        Ok(())
    }

    /// Emit the test between two children of a short circuit operation
    fn emit_short_circuit_test(&mut self, index: usize) -> Result<(), Error> {
        let model = self.model;
        let info = model.short_circuit(index);
        let state = self.state_mut()?;
        if let Some(converter) = info.converter {
            if !info.declaration.returns_converted {
                state.emit_instruction(model, InstructionId::DUP, &[])?;
            }
            let node = state.allocate_node()?;
            state.emit_instruction(model, converter, &[node])?;
        }
        let profile = state.allocate_branch_profile()?;
        let site = state.emit_forward_branch(model, info.instruction, &[-1, profile])?;
        if let Some(site) = site {
            let sp = top_sp(state)?;
            data_mut!(state, sp, ShortCircuit).branch_sites.push(site);
        }
        Ok(())
    }

    pub(super) fn begin_root_operation(&mut self) -> Result<(), Error> {
        let root_index = u32::try_from(self.roots.len()).map_err(|_| {
            Error::Encoding(EncodingOverflow::Counter("roots", self.roots.len() as u64))
        })?;
        let rewriting = self.model.rewrite_dfa().is_some();
        let state = self.pool.acquire(root_index, rewriting);
        self.roots.push(None);
        self.states.push(state);
        self.push_operation(
            OperationId::ROOT,
            OperationKind::Root,
            OperationData::Root(RootData {
                scope: ScopeData {
                    frame_offset: 0,
                    num_locals: 0,
                    locals: vec![],
                    valid: true,
                    stack_height: 0,
                },
                reachable: true,
            }),
        )?;
        Ok(())
    }

    pub(super) fn end_root_operation(&mut self) -> Result<RootId, Error> {
        let produced = self.check_top(OperationId::ROOT)?.produced_value;
        if !produced {
            self.emit_instruction(InstructionId::LOAD_NULL, &[])?;
        }
        self.emit_instruction(InstructionId::RETURN, &[])?;

        let dangling = self
            .state()?
            .labels
            .iter()
            .any(|label| label.bci.is_none() && !label.unresolved.is_empty());
        if dangling {
            return Err(self.fail("A branch targets a label that was never emitted"));
        }

        let block_scoping = self.block_scoping();
        let state = self.state_mut()?;
        let end = state.bytecode.bci();
        if let Some(scope) = state.operations.top_mut().and_then(|top| top.scope_mut()) {
            for index in scope.locals.drain(..) {
                state.locals.close(index, end);
            }
            scope.valid = false;
        }
        state.operations.pop();

        let state = self
            .states
            .pop()
            .ok_or_else(|| Error::internal("root ended without a state"))?;
        let root = RootId {
            context: 0,
            index: state.root_index,
        };
        let program = finish_program(&state, root, block_scoping);
        self.pool.release(state);
        let program = program?;
        log::debug!(
            "Finished root {} ({} bytes of bytecode, {} constants, max stack height {})",
            root.index,
            program.bytecode.len(),
            program.constants.len(),
            program.max_stack_height
        );
        self.roots[root.index as usize] = Some(program);
        Ok(root)
    }

    /// `begin` for every operation but `Root`
    pub(super) fn begin_operation(
        &mut self,
        op: OperationId,
        kind: OperationKind,
        custom_index: Option<usize>,
        arguments: Vec<Argument>,
    ) -> Result<(), Error> {
        let model = self.model;
        let data = match kind {
            OperationKind::Block => {
                let state = self.state()?;
                let frame_offset = state
                    .operations
                    .walk()
                    .find_map(|sp| state.operations.get(sp).and_then(|entry| entry.scope()))
                    .map_or(0, |scope| scope.frame_offset + scope.num_locals);
                OperationData::Block(ScopeData {
                    frame_offset,
                    num_locals: 0,
                    locals: vec![],
                    valid: true,
                    stack_height: state.current_stack_height,
                })
            }
            OperationKind::IfThen | OperationKind::IfThenElse | OperationKind::Conditional => {
                let reachable = self.state()?.reachable;
                OperationData::Conditional(ConditionalData {
                    this_reachable: reachable,
                    then_reachable: reachable,
                    else_reachable: reachable,
                    false_branch: None,
                    end_branch: None,
                })
            }
            OperationKind::While => {
                let state = self.state_mut()?;
                OperationData::While(WhileData {
                    start_bci: state.leader_bci(),
                    while_reachable: state.reachable,
                    body_reachable: state.reachable,
                    end_branch: None,
                })
            }
            OperationKind::TryCatch
            | OperationKind::TryFinally
            | OperationKind::TryCatchOtherwise => {
                let generator = match arguments.into_iter().next() {
                    Some(Argument::FinallyGenerator(generator)) => Some(generator),
                    _ => None,
                };
                let state = self.state_mut()?;
                let handler_id = state.allocate_handler_id();
                OperationData::Try(TryData {
                    handler_id,
                    stack_height: state.current_stack_height,
                    try_start_bci: state.leader_bci(),
                    operation_reachable: state.reachable,
                    try_reachable: state.reachable,
                    catch_reachable: state.reachable,
                    end_branch: None,
                    generator,
                })
            }
            OperationKind::LoadLocalMaterialized | OperationKind::StoreLocalMaterialized => {
                let local = expect_local(&arguments)?;
                self.validate_materialized_local(&local)?;
                OperationData::LocalAccess(local)
            }
            OperationKind::StoreLocal => {
                let local = expect_local(&arguments)?;
                self.validate_local(&local)?;
                OperationData::LocalAccess(local)
            }
            OperationKind::Return => OperationData::Return,
            OperationKind::Source => {
                let source = match arguments.into_iter().next() {
                    Some(Argument::Constant(source)) => source,
                    _ => return Err(Error::internal("Source without a source constant")),
                };
                source.validate()?;
                OperationData::Source(self.intern_source(source)?)
            }
            OperationKind::SourceSection | OperationKind::SourceSectionPrefix => {
                OperationData::SourceSection(self.begin_source_section_data(kind, &arguments)?)
            }
            OperationKind::Tag => OperationData::Tag(self.begin_tag_data(&arguments)?),
            OperationKind::Custom
            | OperationKind::CustomYield
            | OperationKind::CustomInstrumentation => {
                let index = custom_index.ok_or_else(|| Error::internal("custom operation without index"))?;
                OperationData::Custom(CustomData {
                    index,
                    begin_arguments: arguments,
                    variadic_count: 0,
                    variadic_groups: 0,
                    enabled: self.custom_enabled(index),
                })
            }
            OperationKind::CustomShortCircuit => {
                let index =
                    custom_index.ok_or_else(|| Error::internal("short circuit without index"))?;
                OperationData::ShortCircuit(ShortCircuitData {
                    index,
                    branch_sites: vec![],
                })
            }
            _ => {
                return Err(Error::internal(format!(
                    "{} cannot be begun",
                    model.operation(op).map_or("<unknown>", |info| info.name.as_str())
                )))
            }
        };
        self.push_operation(op, kind, data)?;
        Ok(())
    }

    /// `end` for every operation but `Root`
    pub(super) fn end_operation(
        &mut self,
        op: OperationId,
        kind: OperationKind,
        arguments: Vec<Argument>,
    ) -> Result<(), Error> {
        let model = self.model;
        let produced = match kind {
            OperationKind::Block
            | OperationKind::Source
            | OperationKind::SourceSection
            | OperationKind::SourceSectionPrefix => {
                let produced = self.check_top(op)?.produced_value;
                match kind {
                    OperationKind::Block => self.close_block_scope()?,
                    OperationKind::Source => (),
                    _ => self.end_source_section(kind, &arguments)?,
                }
                self.pop_operation()?;
                produced
            }
            OperationKind::IfThen => {
                self.check_child_count(op, 2)?;
                let state = self.state_mut()?;
                let sp = top_sp(state)?;
                let data = data_mut!(state, sp, Conditional);
                let false_branch = data.false_branch.take();
                let this_reachable = data.this_reachable;
                state.patch_branch(false_branch);
                self.pop_operation()?;
                self.state_mut()?.mark_reachable(this_reachable);
                false
            }
            OperationKind::IfThenElse | OperationKind::Conditional => {
                self.check_child_count(op, 3)?;
                let state = self.state_mut()?;
                let sp = top_sp(state)?;
                let data = data_mut!(state, sp, Conditional);
                let end_branch = data.end_branch.take();
                let reachable = data.then_reachable || state.reachable;
                state.patch_branch(end_branch);
                self.pop_operation()?;
                self.state_mut()?.mark_reachable(reachable);
                kind == OperationKind::Conditional
            }
            OperationKind::While => {
                self.check_child_count(op, 2)?;
                let state = self.state_mut()?;
                let sp = top_sp(state)?;
                let data = data_mut!(state, sp, While);
                let end_branch = data.end_branch.take();
                let reachable = data.while_reachable;
                state.patch_branch(end_branch);
                self.pop_operation()?;
                self.state_mut()?.mark_reachable(reachable);
                false
            }
            OperationKind::TryCatch | OperationKind::TryCatchOtherwise => {
                self.check_child_count(op, 2)?;
                let state = self.state_mut()?;
                let sp = top_sp(state)?;
                let data = data_mut!(state, sp, Try);
                let end_branch = data.end_branch.take();
                let reachable = data.try_reachable || state.reachable;
                state.patch_branch(end_branch);
                self.pop_operation()?;
                self.state_mut()?.mark_reachable(reachable);
                false
            }
            OperationKind::TryFinally => {
                self.check_child_count(op, 1)?;
                self.end_try_finally()?;
                false
            }
            OperationKind::LoadLocalMaterialized
            | OperationKind::StoreLocal
            | OperationKind::StoreLocalMaterialized => {
                let expected = if kind == OperationKind::StoreLocalMaterialized { 2 } else { 1 };
                self.check_child_count(op, expected)?;
                let local = match self.pop_operation()?.data {
                    OperationData::LocalAccess(local) => local,
                    _ => return Err(Error::internal("local access without a local")),
                };
                let frame = local.frame_index as i32;
                let index = local.local_index as i32;
                match kind {
                    OperationKind::StoreLocal => {
                        self.emit_instruction(InstructionId::STORE_LOCAL, &[frame, index])?;
                        false
                    }
                    OperationKind::LoadLocalMaterialized => {
                        self.emit_instruction(
                            InstructionId::LOAD_LOCAL_MAT,
                            &[frame, local.root as i32, index],
                        )?;
                        true
                    }
                    _ => {
                        self.emit_instruction(
                            InstructionId::STORE_LOCAL_MAT,
                            &[frame, local.root as i32, index],
                        )?;
                        false
                    }
                }
            }
            OperationKind::Return => {
                self.check_child_count(op, 1)?;
                self.emit_return()?;
                self.pop_operation()?;
                false
            }
            OperationKind::Tag => {
                self.check_child_count(op, 1)?;
                self.end_tag(&arguments)?
            }
            OperationKind::Custom
            | OperationKind::CustomYield
            | OperationKind::CustomInstrumentation => {
                self.check_top(op)?;
                let entry = self.pop_operation()?;
                let data = match entry.data {
                    OperationData::Custom(data) => data,
                    _ => return Err(Error::internal("custom operation without data")),
                };
                let declaration = &model.custom(data.index).declaration;
                let fixed = declaration.operands.len() - declaration.variadic as usize;
                let count = entry.child_count as usize;
                if (declaration.variadic && count < fixed)
                    || (!declaration.variadic && count != fixed)
                {
                    return Err(self.fail(format!(
                        "Operation {} expected {}{} child(ren), but {} provided. This is probably a bug in the parser.",
                        declaration.name,
                        if declaration.variadic { "at least " } else { "exactly " },
                        fixed,
                        count
                    )));
                }
                self.finish_custom(data, &arguments)?
            }
            OperationKind::CustomShortCircuit => {
                if self.check_top(op)?.child_count == 0 {
                    return Err(self.fail(format!(
                        "Operation {} expected at least 1 child, but none were provided",
                        self.operation_name(op)
                    )));
                }
                let data = match self.pop_operation()?.data {
                    OperationData::ShortCircuit(data) => data,
                    _ => return Err(Error::internal("short circuit without data")),
                };
                let info = model.short_circuit(data.index);
                let state = self.state_mut()?;
                if let (Some(converter), true) = (info.converter, info.declaration.returns_converted) {
                    let node = state.allocate_node()?;
                    state.emit_instruction(model, converter, &[node])?;
                }
                for site in data.branch_sites {
                    state.patch_branch(Some(site));
                }
                true
            }
            _ => {
                return Err(Error::internal(format!(
                    "{} cannot be ended",
                    self.operation_name(op)
                )))
            }
        };
        self.after_child(produced)
    }

    /// `emit` for leaf operations
    pub(super) fn emit_operation(
        &mut self,
        kind: OperationKind,
        custom_index: Option<usize>,
        arguments: Vec<Argument>,
    ) -> Result<(), Error> {
        if matches!(
            kind,
            OperationKind::Custom | OperationKind::CustomYield | OperationKind::CustomInstrumentation
        ) {
            let index = custom_index.ok_or_else(|| Error::internal("custom operation without index"))?;
            let data = CustomData {
                index,
                begin_arguments: arguments,
                variadic_count: 0,
                variadic_groups: 0,
                enabled: self.custom_enabled(index),
            };
            let produced = self.finish_custom(data, &[])?;
            return self.after_child(produced);
        }

        let produced = match (kind, arguments.first()) {
            (OperationKind::Label, Some(Argument::Label(label))) => {
                self.emit_label_operation(*label)?;
                false
            }
            (OperationKind::Branch, Some(Argument::Label(label))) => {
                self.emit_branch_operation(*label)?;
                false
            }
            (OperationKind::LoadConstant, Some(Argument::Constant(constant))) => {
                constant.validate()?;
                let index = self.state_mut()?.constants.add(constant.clone())?;
                self.emit_instruction(InstructionId::LOAD_CONSTANT, &[index])?;
                true
            }
            (OperationKind::LoadNull, None) => {
                self.emit_instruction(InstructionId::LOAD_NULL, &[])?;
                true
            }
            (OperationKind::LoadArgument, Some(Argument::Short(index))) => {
                if *index < 0 {
                    return Err(Error::IllegalArgument(format!(
                        "argument index {} is negative",
                        index
                    )));
                }
                self.emit_instruction(InstructionId::LOAD_ARGUMENT, &[*index as i32])?;
                true
            }
            (OperationKind::LoadException, None) => {
                let slot = self.exception_slot()?;
                self.emit_instruction(InstructionId::LOAD_EXCEPTION, &[slot])?;
                true
            }
            (OperationKind::LoadLocal, Some(Argument::Local(local))) => {
                self.validate_local(local)?;
                self.emit_instruction(
                    InstructionId::LOAD_LOCAL,
                    &[local.frame_index as i32, local.local_index as i32],
                )?;
                true
            }
            (OperationKind::ClearLocal, Some(Argument::Local(local))) => {
                self.validate_local(local)?;
                self.emit_instruction(InstructionId::CLEAR_LOCAL, &[local.frame_index as i32])?;
                false
            }
            (kind, _) => {
                return Err(Error::internal(format!(
                    "{} cannot be emitted with these arguments",
                    kind.name()
                )))
            }
        };
        self.after_child(produced)
    }

    /// Whether a custom operation is emitted at all (only instrumentations can be disabled)
    fn custom_enabled(&self, index: usize) -> bool {
        match self.model.custom(index).instrumentation_index {
            Some(bit) => self.config.instrumentations & (1 << bit) != 0,
            None => true,
        }
    }

    /// Emit a custom instruction once its operands are on the stack
    ///
    /// Returns whether the operation produced a value.
    fn finish_custom(&mut self, mut data: CustomData, end_arguments: &[Argument]) -> Result<bool, Error> {
        let model = self.model;
        let custom = model.custom(data.index);
        let declaration = &custom.declaration;
        if !data.enabled {
            // Disabled instrumentations pass their operand through untouched
            return Ok(declaration.returns_value && !declaration.operands.is_empty());
        }

        if declaration.variadic {
            let remainder = data.variadic_count - data.variadic_groups * VARIADIC_GROUP;
            if remainder > 0 || data.variadic_groups == 0 {
                self.emit_instruction(InstructionId::LOAD_VARIADIC, &[remainder as i32])?;
                data.variadic_groups += 1;
            }
            if data.variadic_groups > 1 {
                self.emit_instruction(
                    InstructionId::MERGE_VARIADIC,
                    &[data.variadic_groups as i32],
                )?;
            }
        }

        let mut immediates = vec![];
        for argument in data.begin_arguments.iter().chain(end_arguments) {
            self.encode_constant_argument(argument, &mut immediates)?;
        }
        let state = self.state_mut()?;
        immediates.push(state.allocate_node()?);

        if declaration.kind == CustomKind::Yield {
            let continuation = if state.reachable {
                let index = state.num_continuations;
                state.num_continuations += 1;
                index as i32
            } else {
                -1
            };
            immediates.push(continuation);
            if let Some(emitted) = state.emit_instruction(model, custom.instruction, &immediates)? {
                let stack_pointer = state.current_stack_height;
                state
                    .continuations
                    .extend_from_slice(&[continuation, emitted.bci as i32, stack_pointer]);
                // Execution resumes right after the yield
                state.leader_bci();
            }
        } else {
            state.emit_instruction(model, custom.instruction, &immediates)?;
        }
        Ok(declaration.returns_value)
    }

    /// Append the immediates a constant operand of a custom operation is encoded as
    fn encode_constant_argument(&mut self, argument: &Argument, immediates: &mut Vec<i32>) -> Result<(), Error> {
        match argument {
            Argument::Local(local) => {
                self.validate_local(local)?;
                immediates.push(local.frame_index as i32);
                immediates.push(local.local_index as i32);
            }
            Argument::LocalArray(locals) => {
                let mut frames = Vec::with_capacity(locals.len());
                for local in locals {
                    self.validate_local(local)?;
                    frames.push(Constant::Integer(local.frame_index as i64));
                }
                let index = self.state_mut()?.constants.add(Constant::Array(frames))?;
                immediates.push(index);
            }
            Argument::Constant(constant) => {
                constant.validate()?;
                let index = self.state_mut()?.constants.add(constant.clone())?;
                immediates.push(index);
            }
            Argument::Short(value) => immediates.push(*value as i32),
            Argument::Integer(value) => immediates.push(*value),
            Argument::Label(_) | Argument::Tags(_) | Argument::FinallyGenerator(_) => {
                return Err(Error::IllegalArgument(format!(
                    "{:?} cannot be encoded into a custom instruction",
                    argument.kind()
                )))
            }
        }
        Ok(())
    }

    fn close_block_scope(&mut self) -> Result<(), Error> {
        let state = self.state_mut()?;
        let has_locals = state
            .operations
            .top()
            .and_then(|top| top.scope())
            .map_or(false, |scope| !scope.locals.is_empty());
        let end = if has_locals {
            state.leader_bci()
        } else {
            state.bytecode.bci()
        };
        if let Some(scope) = state.operations.top_mut().and_then(|top| top.scope_mut()) {
            for index in scope.locals.drain(..) {
                state.locals.close(index, end);
            }
            scope.valid = false;
        }
        Ok(())
    }

    fn intern_source(&mut self, source: Constant) -> Result<u32, Error> {
        if let Some(index) = self.source_indices.get(&source) {
            return Ok(*index);
        }
        let index = u32::try_from(self.sources.len()).map_err(|_| {
            Error::Encoding(EncodingOverflow::Counter("sources", self.sources.len() as u64))
        })?;
        self.sources.push(source.clone());
        self.source_indices.insert(source, index);
        Ok(index)
    }

    /// Index of the innermost `Source`, looking through enclosing roots too
    fn enclosing_source(&self) -> Option<u32> {
        self.states.iter().rev().find_map(|state| {
            state
                .operations
                .walk()
                .find_map(|sp| match state.operations.get(sp).map(|entry| &entry.data) {
                    Some(OperationData::Source(index)) => Some(*index),
                    _ => None,
                })
        })
    }

    fn begin_source_section_data(
        &mut self,
        kind: OperationKind,
        arguments: &[Argument],
    ) -> Result<SourceSectionData, Error> {
        let source_index = match self.enclosing_source() {
            Some(index) => index,
            None => {
                return Err(self.fail(
                    "No enclosing Source operation found - each SourceSection must be enclosed in a Source operation.",
                ))
            }
        };

        let span = match (kind, arguments) {
            (OperationKind::SourceSection, [Argument::Integer(-1), Argument::Integer(-1)]) => {
                SourceSpan::UNAVAILABLE
            }
            (
                OperationKind::SourceSection,
                [Argument::Integer(start), Argument::Integer(length)],
            ) if *start >= 0 && *length >= 0 => SourceSpan::Known {
                start: *start,
                length: *length,
            },
            (OperationKind::SourceSectionPrefix, [Argument::Integer(start)]) if *start >= -1 => {
                SourceSpan::Pending { start: *start }
            }
            _ => {
                return Err(Error::IllegalArgument(format!(
                    "invalid source section {:?}",
                    arguments
                )))
            }
        };

        Ok(SourceSectionData {
            source_index,
            start_bci: self.state()?.bytecode.bci(),
            span,
            pending: vec![],
        })
    }

    fn end_source_section(&mut self, kind: OperationKind, arguments: &[Argument]) -> Result<(), Error> {
        let length = match (kind, arguments) {
            (OperationKind::SourceSectionPrefix, [Argument::Integer(length)]) => Some(*length),
            _ => None,
        };
        if !self.collects_source_info() {
            return Ok(());
        }

        let state = self.state_mut()?;
        let sp = top_sp(state)?;
        let end = state.leader_bci();
        let data = data_mut!(state, sp, SourceSection);
        if let Some(index) = state
            .source_info
            .add(data.start_bci, end, data.source_index, data.span)
        {
            if matches!(data.span, SourceSpan::Pending { .. }) {
                data.pending.push(index);
            }
        }
        if let (Some(length), SourceSpan::Pending { start }) = (length, data.span) {
            if (start == -1) != (length == -1) || length < -1 {
                return Err(Error::IllegalArgument(format!(
                    "invalid source section length {} for start {}",
                    length, start
                )));
            }
            state.source_info.patch_length(&data.pending, length);
        }
        Ok(())
    }

    fn begin_tag_data(&mut self, arguments: &[Argument]) -> Result<TagData, Error> {
        let tags = match arguments {
            [Argument::Tags(tags)] => *tags,
            _ => return Err(Error::internal("Tag without tags")),
        };
        let known = self.model.all_tags();
        if tags.is_empty() || tags.0 & !known.0 != 0 {
            return Err(Error::IllegalArgument(format!(
                "invalid tags {:#b}: tags must be a non-empty subset of the declared tags",
                tags.0
            )));
        }

        let instrumented = tags.intersects(self.config.instrumented_tags);
        let model = self.model;
        let state = self.state_mut()?;
        let stack_height = state.current_stack_height;
        let (node, handler_start) = if instrumented {
            let node = state.allocate_tag_node()?;
            state.emit_instruction(model, InstructionId::TAG_ENTER, &[node])?;
            (node, state.leader_bci())
        } else {
            (-1, state.bytecode.bci())
        };
        Ok(TagData {
            node,
            tags,
            instrumented,
            handler_start,
            stack_height,
        })
    }

    /// Returns whether the tagged child produced a value
    fn end_tag(&mut self, arguments: &[Argument]) -> Result<bool, Error> {
        let model = self.model;
        let end_tags = match arguments {
            [Argument::Tags(tags)] => *tags,
            _ => TagMask::NONE,
        };
        let state = self.state_mut()?;
        let sp = top_sp(state)?;
        let produced = state
            .operations
            .top()
            .map_or(false, |top| top.produced_value);
        let data = data_mut!(state, sp, Tag);
        if data.tags != end_tags {
            let message = format!(
                "The tags provided to end_tag ({:#b}) do not match the tags provided to the corresponding begin_tag ({:#b})",
                end_tags.0, data.tags.0
            );
            return Err(self.fail(message));
        }

        if data.instrumented {
            let (node, start, stack_height) = (data.node, data.handler_start, data.stack_height);
            let end = state.leader_bci();
            state.handlers.add(
                start,
                end,
                HandlerKind::TagExceptional,
                HandlerTarget::Resolved(node),
                stack_height,
            );
            let leave = if produced {
                InstructionId::TAG_LEAVE
            } else {
                InstructionId::TAG_LEAVE_VOID
            };
            state.emit_instruction(model, leave, &[node])?;
        }
        self.pop_operation()?;
        Ok(produced)
    }

    /// Stack slot of the exception of the innermost enclosing catch
    fn exception_slot(&self) -> Result<i32, Error> {
        let state = self.state()?;
        for sp in state.operations.walk() {
            let entry = match state.operations.get(sp) {
                Some(entry) => entry,
                None => break,
            };
            match (&entry.data, entry.kind) {
                (
                    OperationData::Try(data),
                    OperationKind::TryCatch | OperationKind::TryCatchOtherwise,
                ) if entry.child_count == 1 => return Ok(data.stack_height),
                (OperationData::Root(_), _) => break,
                _ => (),
            }
        }
        Err(self.fail(
            "LoadException can only be used in the catch operation of a TryCatch/TryCatchOtherwise operation in the current root.",
        ))
    }

    fn end_try_finally(&mut self) -> Result<(), Error> {
        let model = self.model;
        let state = self.state_mut()?;
        let sp = top_sp(state)?;
        let (handler_id, stack_height, try_reachable, operation_reachable) = {
            let data = data_mut!(state, sp, Try);
            (
                data.handler_id,
                data.stack_height,
                data.try_reachable,
                data.operation_reachable,
            )
        };

        // Normal completion runs the handler inline and jumps past the exceptional copy
        state.mark_reachable(try_reachable);
        let mut end_branch = None;
        if try_reachable {
            self.emit_finally_handler(sp)?;
            end_branch = self.emit_forward_branch(InstructionId::BRANCH, &[-1])?;
        }
        let state = self.state_mut()?;
        let normal_reachable = state.reachable;

        // Exceptional completion runs the handler and rethrows
        let handler_bci = state.leader_bci();
        state.handlers.resolve(handler_id, handler_bci);
        state.current_stack_height = stack_height;
        state.update_stack_height(1)?;
        state.mark_reachable(operation_reachable);
        self.emit_finally_handler(sp)?;
        let state = self.state_mut()?;
        state.emit_instruction(model, InstructionId::THROW, &[])?;

        state.patch_branch(end_branch);
        state.operations.pop();
        state.mark_reachable(normal_reachable);
        Ok(())
    }

    /// Emit one copy of the finally handler of the try operation at `finally_sp`
    pub(super) fn emit_finally_handler(&mut self, finally_sp: usize) -> Result<(), Error> {
        let state = self.state()?;
        let generator = match state.operations.get(finally_sp).map(|entry| &entry.data) {
            Some(OperationData::Try(data)) => data.generator.clone(),
            _ => None,
        }
        .ok_or_else(|| Error::internal("finally handler without a generator"))?;
        let reachable = state.reachable;

        let handler_sp = self.push_operation(
            OperationId::FINALLY_HANDLER,
            OperationKind::FinallyHandler,
            OperationData::FinallyHandler(FinallyHandlerData {
                finally_operation_sp: finally_sp,
                reachable,
            }),
        )?;
        {
            let builder: &mut dyn OperationBuilder = self;
            generator(builder)?;
        }

        if self.state()?.operations.len() != handler_sp + 1 {
            return Err(self.fail(
                "A finally handler must end every operation it begins",
            ));
        }
        let state = self.state_mut()?;
        state.operations.pop();
        let reachable = state.reachable;
        state.mark_reachable(reachable);
        Ok(())
    }
}

fn expect_local(arguments: &[Argument]) -> Result<super::BytecodeLocal, Error> {
    match arguments.first() {
        Some(Argument::Local(local)) => Ok(*local),
        _ => Err(Error::internal("local operation without a local")),
    }
}

/// Freeze the tables of a finished root
fn finish_program(
    state: &BuilderState,
    root: RootId,
    block_scoping: bool,
) -> Result<BytecodeProgram, Error> {
    let end = state.bytecode.bci();
    Ok(BytecodeProgram {
        root,
        bytecode: state.bytecode.to_vec(),
        constants: state.constants.to_vec(),
        handlers: state.handlers.to_flat()?,
        source_info: state.source_info.to_flat(),
        locals: state.locals.to_flat(block_scoping, end),
        continuations: state.continuations.clone(),
        max_stack_height: state.max_stack_height as u16,
        max_locals: state.max_locals as u16,
        num_locals: state.num_locals as u16,
        num_nodes: state.num_nodes,
        num_branch_profiles: state.num_branch_profiles,
        num_tag_nodes: state.num_tag_nodes,
        block_scoping,
    })
}
