use super::handler_table::{HandlerKind, HandlerTarget};
use super::label::LabelData;
use super::operation_stack::OperationData;
use super::operations::data_mut;
use super::source_table::SourceSpan;
use super::{Builder, BytecodeLabel};
use crate::model::{InstructionId, OperationKind};
use crate::Error;

/// How control leaves the operations between the exit and its target
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum ExitKind {
    Branch,
    Return,
}

impl Builder<'_> {
    pub(super) fn create_label_in_block(&mut self) -> Result<BytecodeLabel, Error> {
        let declaring = {
            let state = self.state()?;
            state.operations.top().and_then(|top| match top.kind {
                OperationKind::Block | OperationKind::Root => top
                    .scope()
                    .map(|scope| (top.sequence_number, scope.stack_height)),
                _ => None,
            })
        };
        let (sequence_number, stack_height) = match declaring {
            Some(declaring) => declaring,
            None => {
                return Err(self.fail(
                    "Labels must be created inside either Block or Root operations.",
                ))
            }
        };

        let state = self.state_mut()?;
        let index = state.labels.len() as u32;
        state
            .labels
            .push(LabelData::new(sequence_number, stack_height));
        Ok(BytecodeLabel {
            root: state.root_index,
            index,
        })
    }

    pub(super) fn emit_label_operation(&mut self, label: BytecodeLabel) -> Result<(), Error> {
        let problem = {
            let state = self.state()?;
            let declaring = state.operations.top().map(|top| top.sequence_number);
            match state.labels.get(label.index as usize) {
                _ if label.root != state.root_index => {
                    Some("BytecodeLabel must be emitted in the root it was created in.")
                }
                None => Some("BytecodeLabel was not created by this builder."),
                Some(data) if data.bci.is_some() => {
                    Some("BytecodeLabel already emitted. Each label must be emitted exactly once.")
                }
                Some(data) if declaring != Some(data.declaring_sequence) => {
                    Some("BytecodeLabel must be emitted inside the same operation it was created in.")
                }
                Some(data) if data.stack_height != state.current_stack_height => Some(
                    "BytecodeLabel emitted at a different stack height than the operation it was created in.",
                ),
                Some(_) => None,
            }
        };
        if let Some(problem) = problem {
            return Err(self.fail(problem));
        }

        let state = self.state_mut()?;
        let bci = state.leader_bci();
        state.labels[label.index as usize].resolve(bci, &mut state.bytecode);
        state.mark_reachable(true);
        Ok(())
    }

    pub(super) fn emit_branch_operation(&mut self, label: BytecodeLabel) -> Result<(), Error> {
        let model = self.model;
        let target = {
            let state = self.state()?;
            match state.labels.get(label.index as usize) {
                Some(_) if label.root != state.root_index => Err(
                    "Branch must be targeting a label that is declared in an enclosing operation of the current root.",
                ),
                None => Err("BytecodeLabel was not created by this builder."),
                Some(data) if data.bci.is_some() => Err(
                    "Backward branches are unsupported. Use a While operation to model backward control flow.",
                ),
                Some(data) => state
                    .operations
                    .walk()
                    .find(|sp| {
                        state
                            .operations
                            .get(*sp)
                            .map_or(false, |entry| entry.sequence_number == data.declaring_sequence)
                    })
                    .map(|sp| (sp, data.stack_height))
                    .ok_or(
                        "Branch must be targeting a label that is declared in an enclosing operation of the current root. Jumps into other operations are not permitted.",
                    ),
            }
        };
        let (target_sp, target_height) = match target {
            Ok(target) => target,
            Err(problem) => return Err(self.fail(problem)),
        };

        let needs_rewind = if self.state()?.reachable {
            self.before_early_exit(target_sp, ExitKind::Branch)?
        } else {
            false
        };

        let state = self.state_mut()?;
        let stack_height = state.current_stack_height;
        while state.current_stack_height > target_height {
            state.emit_instruction(model, InstructionId::POP, &[])?;
        }
        if let Some(site) = state.emit_forward_branch(model, InstructionId::BRANCH, &[-1])? {
            state.labels[label.index as usize].unresolved.push(site);
        }
        state.mark_reachable(false);

        // Dead code after the branch still sits on the operands of the enclosing operations
        state.current_stack_height = stack_height;

        if needs_rewind {
            self.after_early_exit(target_sp, ExitKind::Branch)?;
        }
        Ok(())
    }

    /// Return the value on top of the stack from the root
    pub(super) fn emit_return(&mut self) -> Result<(), Error> {
        let needs_rewind = if self.state()?.reachable {
            self.before_early_exit(0, ExitKind::Return)?
        } else {
            false
        };
        let model = self.model;
        let state = self.state_mut()?;
        state.emit_instruction(model, InstructionId::RETURN, &[])?;
        state.mark_reachable(false);
        if needs_rewind {
            self.after_early_exit(0, ExitKind::Return)?;
        }
        Ok(())
    }

    /// Stack indices of the operations an exit to `target_sp` leaves, innermost first
    fn exited_operations(&self, target_sp: usize) -> Result<Vec<usize>, Error> {
        Ok(self
            .state()?
            .operations
            .walk()
            .take_while(|sp| *sp > target_sp)
            .collect())
    }

    /// Close everything an early exit leaves before the exit instruction is emitted
    ///
    /// Instrumented tags are left, protected ranges of try operations are cut short (running
    /// finally handlers inline), source sections are flushed, and block scoped locals of exited
    /// blocks are cleared when branching. Returns whether anything was cut short and so needs
    /// to be reopened after the exit.
    fn before_early_exit(&mut self, target_sp: usize, exit: ExitKind) -> Result<bool, Error> {
        let model = self.model;
        let collect_sources = self.collects_source_info();
        let block_scoping = self.block_scoping();
        let mut needs_rewind = false;

        for sp in self.exited_operations(target_sp)? {
            let state = self.state_mut()?;
            let (kind, child_count) = match state.operations.get(sp) {
                Some(entry) => (entry.kind, entry.child_count),
                None => continue,
            };

            match kind {
                OperationKind::Tag => {
                    let (node, start, stack_height) = match data_mut!(state, sp, Tag) {
                        data if data.instrumented => {
                            (data.node, data.handler_start, data.stack_height)
                        }
                        _ => continue,
                    };
                    let end = state.leader_bci();
                    state.handlers.add(
                        start,
                        end,
                        HandlerKind::TagExceptional,
                        HandlerTarget::Resolved(node),
                        stack_height,
                    );
                    state.emit_instruction(model, InstructionId::TAG_LEAVE_VOID, &[node])?;
                    needs_rewind = true;
                }
                OperationKind::TryCatch
                | OperationKind::TryFinally
                | OperationKind::TryCatchOtherwise
                    if child_count == 0 =>
                {
                    let (handler_id, start, stack_height) = {
                        let data = data_mut!(state, sp, Try);
                        (data.handler_id, data.try_start_bci, data.stack_height)
                    };
                    let end = state.leader_bci();
                    state.handlers.add(
                        start,
                        end,
                        HandlerKind::Custom,
                        HandlerTarget::Pending(handler_id),
                        stack_height,
                    );
                    if kind != OperationKind::TryCatch {
                        self.emit_finally_handler(sp)?;
                    }
                    needs_rewind = true;
                }
                OperationKind::SourceSection | OperationKind::SourceSectionPrefix
                    if collect_sources =>
                {
                    let end = state.leader_bci();
                    let data = data_mut!(state, sp, SourceSection);
                    if let Some(index) =
                        state
                            .source_info
                            .add(data.start_bci, end, data.source_index, data.span)
                    {
                        if matches!(data.span, SourceSpan::Pending { .. }) {
                            data.pending.push(index);
                        }
                    }
                    needs_rewind = true;
                }
                OperationKind::Block if exit == ExitKind::Branch && block_scoping => {
                    let locals = match state.operations.get(sp).and_then(|entry| entry.scope()) {
                        Some(scope) if !scope.locals.is_empty() => scope.locals.clone(),
                        _ => continue,
                    };
                    let end = state.leader_bci();
                    for index in &locals {
                        state.locals.close(*index, end);
                    }
                    for index in &locals {
                        let frame = state.locals.get(*index).frame_index;
                        state.emit_instruction(model, InstructionId::CLEAR_LOCAL, &[frame as i32])?;
                    }
                    needs_rewind = true;
                }
                _ => (),
            }
        }
        Ok(needs_rewind)
    }

    /// Reopen what [`Builder::before_early_exit`] cut short, starting at the current position
    fn after_early_exit(&mut self, target_sp: usize, exit: ExitKind) -> Result<(), Error> {
        let block_scoping = self.block_scoping();
        let exited = self.exited_operations(target_sp)?;
        let state = self.state_mut()?;
        let bci = state.leader_bci();

        for sp in exited {
            let entry = match state.operations.get_mut(sp) {
                Some(entry) => entry,
                None => continue,
            };
            let child_count = entry.child_count;
            match &mut entry.data {
                OperationData::Tag(data) if data.instrumented => data.handler_start = bci,
                OperationData::Try(data) if child_count == 0 => data.try_start_bci = bci,
                OperationData::SourceSection(data) => data.start_bci = bci,
                OperationData::Block(scope) if exit == ExitKind::Branch && block_scoping => {
                    for index in scope.locals.iter_mut() {
                        *index = state.locals.reopen(*index, bci);
                    }
                }
                _ => (),
            }
        }
        Ok(())
    }
}
