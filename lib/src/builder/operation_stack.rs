use super::source_table::SourceSpan;
use super::{Argument, BytecodeLocal, FinallyGenerator};
use crate::model::{Model, OperationId, OperationKind, TagMask};

/// Locals declared directly in a `Block` or `Root`
pub(crate) struct ScopeData {
    /// First frame slot available to this scope
    pub frame_offset: u16,

    /// Locals declared so far
    pub num_locals: u16,

    /// Locals table entries of the locals declared so far (while their ranges are open)
    pub locals: Vec<usize>,

    /// Cleared when the scope ends, invalidating handles to its locals
    pub valid: bool,

    /// Stack height seen by the children of the scope
    pub stack_height: i32,
}

pub(crate) struct RootData {
    pub scope: ScopeData,
    pub reachable: bool,
}

/// `IfThen`, `IfThenElse`, and `Conditional`
pub(crate) struct ConditionalData {
    pub this_reachable: bool,
    pub then_reachable: bool,
    pub else_reachable: bool,
    pub false_branch: Option<usize>,
    pub end_branch: Option<usize>,
}

pub(crate) struct WhileData {
    pub start_bci: usize,
    pub while_reachable: bool,
    pub body_reachable: bool,
    pub end_branch: Option<usize>,
}

/// `TryCatch`, `TryFinally`, and `TryCatchOtherwise`
pub(crate) struct TryData {
    pub handler_id: u32,

    /// Stack height at the start of the operation; the exception lives in this slot
    pub stack_height: i32,
    pub try_start_bci: usize,
    pub operation_reachable: bool,
    pub try_reachable: bool,
    pub catch_reachable: bool,
    pub end_branch: Option<usize>,
    pub generator: Option<FinallyGenerator>,
}

pub(crate) struct FinallyHandlerData {
    /// Stack index of the operation whose handler is being emitted
    pub finally_operation_sp: usize,
    pub reachable: bool,
}

pub(crate) struct SourceSectionData {
    pub source_index: u32,
    pub start_bci: usize,
    pub span: SourceSpan,

    /// Source table entries still waiting for their length
    pub pending: Vec<usize>,
}

pub(crate) struct TagData {
    pub node: i32,
    pub tags: TagMask,
    pub instrumented: bool,
    pub handler_start: usize,
    pub stack_height: i32,
}

pub(crate) struct CustomData {
    pub index: usize,
    pub begin_arguments: Vec<Argument>,
    pub variadic_count: u32,
    pub variadic_groups: u32,

    /// Disabled instrumentations emit nothing
    pub enabled: bool,
}

pub(crate) struct ShortCircuitData {
    pub index: usize,
    pub branch_sites: Vec<usize>,
}

/// Fields specific to the kind of an open operation
pub(crate) enum OperationData {
    Root(RootData),
    Block(ScopeData),
    Conditional(ConditionalData),
    While(WhileData),
    Try(TryData),
    FinallyHandler(FinallyHandlerData),
    LocalAccess(BytecodeLocal),
    Return,
    Source(u32),
    SourceSection(SourceSectionData),
    Tag(TagData),
    Custom(CustomData),
    ShortCircuit(ShortCircuitData),
}

/// One begun but not yet ended operation
pub(crate) struct OperationStackEntry {
    pub op: OperationId,
    pub kind: OperationKind,
    pub sequence_number: u32,
    pub child_count: u32,

    /// Whether the most recent child left a value on the stack
    pub produced_value: bool,
    pub data: OperationData,
}

impl OperationStackEntry {
    pub fn scope(&self) -> Option<&ScopeData> {
        match &self.data {
            OperationData::Root(root) => Some(&root.scope),
            OperationData::Block(scope) => Some(scope),
            _ => None,
        }
    }

    pub fn scope_mut(&mut self) -> Option<&mut ScopeData> {
        match &mut self.data {
            OperationData::Root(root) => Some(&mut root.scope),
            OperationData::Block(scope) => Some(scope),
            _ => None,
        }
    }

    /// Reachability slot for the current child of a reachability bearing operation
    pub fn reachability_slot(&mut self) -> Option<&mut bool> {
        let child = self.child_count;
        match &mut self.data {
            OperationData::Root(root) => Some(&mut root.reachable),
            OperationData::Conditional(data) => Some(match child {
                0 => &mut data.this_reachable,
                1 => &mut data.then_reachable,
                _ => &mut data.else_reachable,
            }),
            OperationData::While(data) => Some(match child {
                0 => &mut data.while_reachable,
                _ => &mut data.body_reachable,
            }),
            OperationData::Try(data) => Some(match child {
                0 => &mut data.try_reachable,
                _ => &mut data.catch_reachable,
            }),
            OperationData::FinallyHandler(data) => Some(&mut data.reachable),
            _ => None,
        }
    }
}

/// Stack of open operations, stored as a slab indexed by stack pointer
///
/// Entries are only referred to by index (stack pointer) and sequence number, so growing the slab
/// never invalidates anything held elsewhere.
#[derive(Default)]
pub(crate) struct OperationStack {
    entries: Vec<OperationStackEntry>,
}

impl OperationStack {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, entry: OperationStackEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn pop(&mut self) -> Option<OperationStackEntry> {
        self.entries.pop()
    }

    pub fn get(&self, sp: usize) -> Option<&OperationStackEntry> {
        self.entries.get(sp)
    }

    pub fn get_mut(&mut self, sp: usize) -> Option<&mut OperationStackEntry> {
        self.entries.get_mut(sp)
    }

    pub fn top(&self) -> Option<&OperationStackEntry> {
        self.entries.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut OperationStackEntry> {
        self.entries.last_mut()
    }

    /// Stack indices from the top down, jumping from a `FinallyHandler` straight to the operation
    /// below the one whose handler it is
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: self,
            next: self.entries.len(),
        }
    }

    /// Index of the innermost reachability bearing operation
    pub fn reachability_bearer(&self) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|entry| entry.kind.bears_reachability())
    }

    /// Render the stack, innermost last, for error messages
    pub fn render(&self, model: &Model) -> String {
        let names: Vec<String> = self
            .entries
            .iter()
            .map(|entry| {
                let name = model
                    .operation(entry.op)
                    .map(|info| info.name.as_str())
                    .unwrap_or_else(|| entry.kind.name());
                format!("{}[{}]", name, entry.child_count)
            })
            .collect();
        if names.is_empty() {
            String::from("<empty>")
        } else {
            names.join(" > ")
        }
    }
}

/// See [`OperationStack::walk`]
pub(crate) struct Walk<'a> {
    stack: &'a OperationStack,
    next: usize,
}

impl Iterator for Walk<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == 0 {
            return None;
        }
        let sp = self.next - 1;
        self.next = match &self.stack.entries[sp].data {
            OperationData::FinallyHandler(data) => data.finally_operation_sp,
            _ => sp,
        };
        Some(sp)
    }
}
