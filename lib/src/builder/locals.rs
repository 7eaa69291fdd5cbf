use super::state::BuilderState;
use super::{Builder, BytecodeLocal, LocalScope};
use crate::errors::EncodingOverflow;
use crate::{Constant, Error};

impl Builder<'_> {
    /// Declare a local in the innermost scope
    ///
    /// With block scoping the local gets the next free frame slot of its scope (nested blocks
    /// continue after the slots of their parents) and a live range starting here. Without it,
    /// frame slots and local indices coincide.
    pub(super) fn create_local_in_scope(
        &mut self,
        name: Option<Constant>,
        info: Option<Constant>,
    ) -> Result<BytecodeLocal, Error> {
        for constant in name.iter().chain(info.iter()) {
            constant.validate()?;
        }
        let block_scoping = self.block_scoping();

        let scope_sp = {
            let state = self.state()?;
            state.operations.walk().find(|sp| {
                state
                    .operations
                    .get(*sp)
                    .map_or(false, |entry| entry.scope().is_some())
            })
        };
        let scope_sp = match scope_sp {
            Some(sp) => sp,
            None => return Err(self.fail("Locals must be created inside a Block or Root operation")),
        };

        let state = self.state_mut()?;
        let local_index = u16::try_from(state.num_locals)
            .ok()
            .filter(|index| *index < i16::MAX as u16)
            .ok_or(Error::Encoding(EncodingOverflow::Locals(
                state.num_locals as usize,
            )))?;
        let name = state.constants.add_optional(name)?;
        let info = state.constants.add_optional(info)?;
        state.num_locals += 1;
        let root = state.root_index;

        if !block_scoping {
            state.locals.open(0, local_index, local_index, name, info);
            state.max_locals = state.num_locals;
            return Ok(BytecodeLocal {
                root,
                local_index,
                frame_index: local_index,
                scope: None,
            });
        }

        let start = state.bytecode.bci();
        let entry = state
            .operations
            .get_mut(scope_sp)
            .ok_or_else(|| Error::internal("scope vanished from the operation stack"))?;
        let sequence_number = entry.sequence_number;
        let scope = entry
            .scope_mut()
            .ok_or_else(|| Error::internal("scope operation without a scope"))?;
        let frame_index = scope.frame_offset + scope.num_locals;
        if frame_index >= i16::MAX as u16 {
            return Err(Error::Encoding(EncodingOverflow::Locals(frame_index as usize)));
        }
        scope.num_locals += 1;
        let table_index = state
            .locals
            .open(start, local_index, frame_index, name, info);
        scope.locals.push(table_index);
        state.max_locals = state.max_locals.max(frame_index as u32 + 1);

        Ok(BytecodeLocal {
            root,
            local_index,
            frame_index,
            scope: Some(LocalScope {
                sp: scope_sp,
                sequence_number,
            }),
        })
    }

    /// Check a local accessed directly from the current root
    pub(super) fn validate_local(&self, local: &BytecodeLocal) -> Result<(), Error> {
        let state = self.state()?;
        if local.root != state.root_index {
            return Err(self.fail(
                "Local variable belongs to a different root; use the materialized local operations to access locals of enclosing roots",
            ));
        }
        self.check_scope(state, local)
    }

    /// Check a local accessed through a materialized frame, which may belong to any open root
    pub(super) fn validate_materialized_local(&self, local: &BytecodeLocal) -> Result<(), Error> {
        match self
            .states
            .iter()
            .rev()
            .find(|state| state.root_index == local.root)
        {
            Some(state) => self.check_scope(state, local),
            None => Err(self.fail(
                "Materialized local belongs to a root that is not being built anymore",
            )),
        }
    }

    fn check_scope(&self, state: &BuilderState, local: &BytecodeLocal) -> Result<(), Error> {
        let scope = match local.scope {
            Some(scope) => scope,
            None => return Ok(()),
        };
        let live = state.operations.get(scope.sp).map_or(false, |entry| {
            entry.sequence_number == scope.sequence_number
                && entry.scope().map_or(false, |scope| scope.valid)
        });
        if live {
            Ok(())
        } else {
            Err(self.fail(
                "Local variable used outside of its declaring Block; its scope has already ended",
            ))
        }
    }
}
