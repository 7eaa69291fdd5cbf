use super::bytecode_buffer::BytecodeBuffer;
use super::constants::ConstantPool;
use super::handler_table::HandlerTable;
use super::label::LabelData;
use super::locals_table::LocalsTable;
use super::operation_stack::OperationStack;
use super::source_table::SourceTable;
use crate::errors::EncodingOverflow;
use crate::model::{InstructionId, Model, RewriteDfa};
use crate::Error;
use std::panic::{self, AssertUnwindSafe};

/// Position of the rewriter in the emitted instruction stream
pub(crate) struct RewriteCursor {
    /// DFA state after the last emitted instruction
    pub state: u32,

    /// Nothing before this bci will ever be rewritten
    pub leader_bci: usize,

    /// Nesting of rewrites triggered while emitting a replacement
    pub depth: u32,
}

/// Where an instruction ended up
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Emitted {
    pub bci: usize,

    /// Offset of the branch target immediate, if the instruction has one
    pub branch_site: Option<usize>,
}

/// Everything needed to assemble one root
///
/// Nested roots each get their own state. States are reset and pooled (see [`StatePool`])
/// rather than dropped, so that the buffers can be reused by the next root.
#[derive(Default)]
pub(crate) struct BuilderState {
    pub root_index: u32,
    pub operations: OperationStack,
    pub bytecode: BytecodeBuffer,
    pub current_stack_height: i32,
    pub max_stack_height: i32,
    pub reachable: bool,
    pub constants: ConstantPool,
    pub handlers: HandlerTable,
    pub source_info: SourceTable,
    pub locals: LocalsTable,
    pub continuations: Vec<i32>,
    pub labels: Vec<LabelData>,
    pub num_locals: u32,
    pub max_locals: u32,
    pub num_nodes: u32,
    pub num_branch_profiles: u32,
    pub num_tag_nodes: u32,
    pub num_handlers: u32,
    pub num_continuations: u32,
    pub rewrite: Option<RewriteCursor>,
}

impl BuilderState {
    /// Forget everything about the last root, keeping allocations
    pub fn reset(&mut self) {
        self.root_index = 0;
        self.operations.clear();
        self.bytecode.clear();
        self.current_stack_height = 0;
        self.max_stack_height = 0;
        self.reachable = true;
        self.constants.clear();
        self.handlers.clear();
        self.source_info.clear();
        self.locals.clear();
        self.continuations.clear();
        self.labels.clear();
        self.num_locals = 0;
        self.max_locals = 0;
        self.num_nodes = 0;
        self.num_branch_profiles = 0;
        self.num_tag_nodes = 0;
        self.num_handlers = 0;
        self.num_continuations = 0;
        self.rewrite = None;
    }

    /// State error carrying a dump of the operation stack
    ///
    /// Rendering the dump must never mask the original error, so a panic while rendering is
    /// replaced by a placeholder.
    pub fn fail(&self, model: &Model, message: impl Into<String>) -> Error {
        let operation_stack = panic::catch_unwind(AssertUnwindSafe(|| self.operations.render(model)))
            .unwrap_or_else(|_| String::from("<operation stack unavailable>"));
        Error::IllegalState {
            message: message.into(),
            operation_stack,
        }
    }

    pub fn update_stack_height(&mut self, delta: i32) -> Result<(), Error> {
        self.current_stack_height += delta;
        if self.current_stack_height < 0 {
            return Err(Error::internal("stack height went negative"));
        }
        if self.current_stack_height > self.max_stack_height {
            self.max_stack_height = self.current_stack_height;
            if self.max_stack_height > i16::MAX as i32 {
                return Err(Error::Encoding(EncodingOverflow::StackHeight(
                    self.max_stack_height as i64,
                )));
            }
        }
        Ok(())
    }

    /// Emit an instruction (or only account for its stack effect when unreachable)
    ///
    /// Returns `None` if nothing was emitted. When a rewrite rule fires, the result describes
    /// where the replacement ended up.
    pub fn emit_instruction(
        &mut self,
        model: &Model,
        id: InstructionId,
        immediates: &[i32],
    ) -> Result<Option<Emitted>, Error> {
        let info = model.info(id);
        self.update_stack_height(info.stack_effect_of(immediates))?;
        if !self.reachable {
            return Ok(None);
        }

        let bci = self.bytecode.write_instruction(info, immediates)?;
        let emitted = Emitted {
            bci,
            branch_site: info
                .branch_target_index()
                .map(|index| bci + info.immediate_offset(index)),
        };

        match self.step_rewriter(model, id)? {
            Some(rewritten) => Ok(Some(rewritten)),
            None => Ok(Some(emitted)),
        }
    }

    /// Current bci, as a position that is referred to from elsewhere
    ///
    /// Instructions before this position are never rewritten.
    pub fn leader_bci(&mut self) -> usize {
        let bci = self.bytecode.bci();
        if let Some(cursor) = self.rewrite.as_mut() {
            cursor.state = RewriteDfa::START;
            cursor.leader_bci = bci;
        }
        bci
    }

    /// Node slot for a custom instruction (`-1` when the instruction won't be emitted)
    pub fn allocate_node(&mut self) -> Result<i32, Error> {
        if !self.reachable {
            return Ok(-1);
        }
        let node = self.num_nodes;
        self.num_nodes += 1;
        to_i32("nodes", node)
    }

    /// Profile slot for a conditional branch (`-1` when the branch won't be emitted)
    pub fn allocate_branch_profile(&mut self) -> Result<i32, Error> {
        if !self.reachable {
            return Ok(-1);
        }
        let profile = self.num_branch_profiles;
        self.num_branch_profiles += 1;
        to_i32("branch profiles", profile)
    }

    /// Tag nodes are allocated whether or not code is reachable
    pub fn allocate_tag_node(&mut self) -> Result<i32, Error> {
        let node = self.num_tag_nodes;
        self.num_tag_nodes += 1;
        to_i32("tag nodes", node)
    }

    pub fn allocate_handler_id(&mut self) -> u32 {
        let id = self.num_handlers;
        self.num_handlers += 1;
        id
    }

    /// Record reachability in the innermost reachability bearing operation
    pub fn mark_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        if let Some(sp) = self.operations.reachability_bearer() {
            if let Some(slot) = self
                .operations
                .get_mut(sp)
                .and_then(|entry| entry.reachability_slot())
            {
                *slot = reachable;
            }
        }
        debug_assert!(self
            .stored_reachability()
            .map_or(true, |stored| stored == self.reachable));
    }

    /// Restore reachability from the innermost reachability bearing operation
    pub fn update_reachable(&mut self) {
        if let Some(reachable) = self.stored_reachability() {
            self.reachable = reachable;
        }
    }

    fn stored_reachability(&mut self) -> Option<bool> {
        let sp = self.operations.reachability_bearer()?;
        self.operations
            .get_mut(sp)
            .and_then(|entry| entry.reachability_slot())
            .map(|slot| *slot)
    }

    /// Emit a branch-carrying instruction whose target is patched later
    ///
    /// Returns the offset of the target field, if the instruction was emitted.
    pub fn emit_forward_branch(
        &mut self,
        model: &Model,
        id: InstructionId,
        immediates: &[i32],
    ) -> Result<Option<usize>, Error> {
        Ok(self
            .emit_instruction(model, id, immediates)?
            .and_then(|emitted| emitted.branch_site))
    }

    /// Point a forward branch at the current position
    pub fn patch_branch(&mut self, site: Option<usize>) {
        if let Some(site) = site {
            let target = self.leader_bci();
            self.bytecode.patch_int(site, target as i32);
        }
    }
}

fn to_i32(what: &'static str, count: u32) -> Result<i32, Error> {
    i32::try_from(count).map_err(|_| Error::Encoding(EncodingOverflow::Counter(what, count as u64)))
}

/// Caller-owned pool of builder states
///
/// Assembling a root needs a handful of growable buffers. Pooling the states lets repeated parses
/// (and nested roots) reuse those buffers instead of reallocating them. At most `capacity` idle
/// states are kept; anything beyond that is dropped on release.
pub struct StatePool {
    free: Vec<BuilderState>,
    capacity: usize,
}

impl StatePool {
    pub const DEFAULT_CAPACITY: usize = 4;

    pub fn new(capacity: usize) -> StatePool {
        StatePool {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle states ready for reuse
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Take a clean state, reusing an idle one if possible
    pub(crate) fn acquire(&mut self, root_index: u32, rewriting: bool) -> BuilderState {
        let mut state = match self.free.pop() {
            Some(state) => {
                log::debug!("Reusing pooled builder state ({} idle left)", self.free.len());
                state
            }
            None => {
                let mut state = BuilderState::default();
                state.reset();
                state
            }
        };
        state.root_index = root_index;
        if rewriting {
            state.rewrite = Some(RewriteCursor {
                state: RewriteDfa::START,
                leader_bci: 0,
                depth: 0,
            });
        }
        state
    }

    /// Return a state to the pool
    pub(crate) fn release(&mut self, mut state: BuilderState) {
        if self.free.len() < self.capacity {
            state.reset();
            self.free.push(state);
        }
    }
}

impl Default for StatePool {
    fn default() -> StatePool {
        StatePool::new(StatePool::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_reuses_released_states() {
        let mut pool = StatePool::new(1);
        let mut state = pool.acquire(0, false);
        state.num_nodes = 12;
        state.reachable = false;
        pool.release(state);
        assert_eq!(pool.idle(), 1);

        let state = pool.acquire(3, true);
        assert_eq!(pool.idle(), 0);
        assert_eq!(state.root_index, 3);
        assert_eq!(state.num_nodes, 0);
        assert!(state.reachable);
        assert!(state.rewrite.is_some());
    }

    #[test]
    fn pool_drops_states_beyond_capacity() {
        let mut pool = StatePool::new(1);
        let first = pool.acquire(0, false);
        let second = pool.acquire(1, false);
        pool.release(first);
        pool.release(second);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn unreachable_allocations() {
        let mut state = StatePool::default().acquire(0, false);
        assert_eq!(state.allocate_node().unwrap(), 0);
        state.reachable = false;
        assert_eq!(state.allocate_node().unwrap(), -1);
        assert_eq!(state.allocate_branch_profile().unwrap(), -1);
        assert_eq!(state.allocate_tag_node().unwrap(), 0);
        assert_eq!(state.num_nodes, 1);
    }
}
