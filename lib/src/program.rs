//! Output of the builder

use crate::builder::{
    read_immediates, HandlerKind, HANDLER_ENTRY_LENGTH, LOCAL_ENTRY_LENGTH,
    SCOPED_LOCAL_ENTRY_LENGTH, SOURCE_ENTRY_LENGTH,
};
use crate::model::{Instruction, InstructionId, Model, OPCODE_WIDTH};
use crate::{Constant, Error, RootId};
use byteorder::{BigEndian, ByteOrder};
use std::fmt::Write;

/// Bytecode and side tables of one finished root
///
/// The tables are kept in their flattened form (fixed number of ints per entry) since that is
/// what an interpreter consumes. The `*_entries` methods decode them for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytecodeProgram {
    pub root: RootId,

    /// Big-endian instruction stream
    pub bytecode: Vec<u8>,
    pub constants: Vec<Constant>,

    /// [`HANDLER_ENTRY_LENGTH`] ints per entry: `start, end, kind, handler, stack height`
    pub handlers: Vec<i32>,

    /// [`SOURCE_ENTRY_LENGTH`] ints per entry: `start, end, source, start, length`
    pub source_info: Vec<i32>,

    /// With block scoping, [`SCOPED_LOCAL_ENTRY_LENGTH`] ints per entry:
    /// `start, end, local index, frame index, name, info`. Otherwise [`LOCAL_ENTRY_LENGTH`] ints
    /// per local: `name, info`.
    pub locals: Vec<i32>,

    /// Three ints per yield: `continuation index, bci, stack height`
    pub continuations: Vec<i32>,

    pub max_stack_height: u16,

    /// Number of frame slots needed for locals
    pub max_locals: u16,
    pub num_locals: u16,
    pub num_nodes: u32,
    pub num_branch_profiles: u32,
    pub num_tag_nodes: u32,
    pub block_scoping: bool,
}

/// Decoded exception handler entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandlerInfo {
    pub start_bci: i32,
    pub end_bci: i32,
    pub kind: HandlerKind,

    /// Handler bci, or the tag node for [`HandlerKind::TagExceptional`]
    pub handler: i32,
    pub stack_height: i32,
}

/// Decoded source info entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub start_bci: i32,
    pub end_bci: i32,
    pub source: i32,

    /// `-1` when unavailable
    pub start: i32,
    pub length: i32,
}

/// Decoded locals table entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocalInfo {
    /// Live range (the whole root without block scoping)
    pub start_bci: i32,
    pub end_bci: i32,
    pub local_index: i32,
    pub frame_index: i32,

    /// Constant pool indices, `-1` if absent
    pub name: i32,
    pub info: i32,
}

impl BytecodeProgram {
    pub fn handler_entries(&self) -> Vec<HandlerInfo> {
        self.handlers
            .chunks_exact(HANDLER_ENTRY_LENGTH)
            .filter_map(|entry| {
                Some(HandlerInfo {
                    start_bci: entry[0],
                    end_bci: entry[1],
                    kind: HandlerKind::from_i32(entry[2])?,
                    handler: entry[3],
                    stack_height: entry[4],
                })
            })
            .collect()
    }

    pub fn source_entries(&self) -> Vec<SourceInfo> {
        self.source_info
            .chunks_exact(SOURCE_ENTRY_LENGTH)
            .map(|entry| SourceInfo {
                start_bci: entry[0],
                end_bci: entry[1],
                source: entry[2],
                start: entry[3],
                length: entry[4],
            })
            .collect()
    }

    pub fn local_entries(&self) -> Vec<LocalInfo> {
        if self.block_scoping {
            self.locals
                .chunks_exact(SCOPED_LOCAL_ENTRY_LENGTH)
                .map(|entry| LocalInfo {
                    start_bci: entry[0],
                    end_bci: entry[1],
                    local_index: entry[2],
                    frame_index: entry[3],
                    name: entry[4],
                    info: entry[5],
                })
                .collect()
        } else {
            let end = self.bytecode.len() as i32;
            self.locals
                .chunks_exact(LOCAL_ENTRY_LENGTH)
                .enumerate()
                .map(|(index, entry)| LocalInfo {
                    start_bci: 0,
                    end_bci: end,
                    local_index: index as i32,
                    frame_index: index as i32,
                    name: entry[0],
                    info: entry[1],
                })
                .collect()
        }
    }

    /// Continuation entries as `(index, bci, stack height)`
    pub fn continuation_entries(&self) -> Vec<(i32, i32, i32)> {
        self.continuations
            .chunks_exact(3)
            .map(|entry| (entry[0], entry[1], entry[2]))
            .collect()
    }

    /// Decode the instruction stream
    pub fn instructions(&self, model: &Model) -> Result<Vec<Instruction>, Error> {
        let mut instructions = vec![];
        let mut bci = 0;
        while bci < self.bytecode.len() {
            if bci + OPCODE_WIDTH > self.bytecode.len() {
                return Err(Error::IllegalArgument(format!(
                    "truncated opcode at bci {}",
                    bci
                )));
            }
            let id = InstructionId(BigEndian::read_u16(&self.bytecode[bci..]));
            let info = model.instruction(id).ok_or_else(|| {
                Error::IllegalArgument(format!("unknown opcode {} at bci {}", id.0, bci))
            })?;
            if bci + info.length() > self.bytecode.len() {
                return Err(Error::IllegalArgument(format!(
                    "truncated {} at bci {}",
                    info.name, bci
                )));
            }
            instructions.push(Instruction {
                bci,
                id,
                immediates: read_immediates(&self.bytecode, bci, info),
            });
            bci += info.length();
        }
        Ok(instructions)
    }

    /// Human readable listing of the bytecode and its tables
    pub fn disassemble(&self, model: &Model) -> Result<String, Error> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "root {}.{}: {} bytes, max stack {}, {} locals in {} slots, {} nodes, {} profiles, {} tag nodes",
            self.root.context,
            self.root.index,
            self.bytecode.len(),
            self.max_stack_height,
            self.num_locals,
            self.max_locals,
            self.num_nodes,
            self.num_branch_profiles,
            self.num_tag_nodes,
        );
        for instruction in self.instructions(model)? {
            if let Some(info) = model.instruction(instruction.id) {
                let _ = writeln!(out, "  {}", instruction.display(info));
            }
        }

        if !self.constants.is_empty() {
            let _ = writeln!(out, "constants:");
            for (index, constant) in self.constants.iter().enumerate() {
                let _ = writeln!(out, "  #{} = {}", index, constant);
            }
        }
        let handlers = self.handler_entries();
        if !handlers.is_empty() {
            let _ = writeln!(out, "handlers:");
            for entry in handlers {
                let _ = writeln!(
                    out,
                    "  [{:04}, {:04}) {:?} -> {} sp={}",
                    entry.start_bci, entry.end_bci, entry.kind, entry.handler, entry.stack_height
                );
            }
        }
        let sources = self.source_entries();
        if !sources.is_empty() {
            let _ = writeln!(out, "source info:");
            for entry in sources {
                let _ = writeln!(
                    out,
                    "  [{:04}, {:04}) source {} @ {}+{}",
                    entry.start_bci, entry.end_bci, entry.source, entry.start, entry.length
                );
            }
        }
        let locals = self.local_entries();
        if !locals.is_empty() {
            let _ = writeln!(out, "locals:");
            for entry in locals {
                let name = usize::try_from(entry.name)
                    .ok()
                    .and_then(|index| self.constants.get(index))
                    .map_or_else(|| String::from("_"), |name| name.to_string());
                let _ = writeln!(
                    out,
                    "  [{:04}, {:04}) {} local={} frame={}",
                    entry.start_bci, entry.end_bci, name, entry.local_index, entry.frame_index
                );
            }
        }
        let continuations = self.continuation_entries();
        if !continuations.is_empty() {
            let _ = writeln!(out, "continuations:");
            for (index, bci, stack_height) in continuations {
                let _ = writeln!(out, "  #{} at {:04} sp={}", index, bci, stack_height);
            }
        }
        Ok(out)
    }
}

/// Every root produced by one parse
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytecodeNodes {
    /// Roots in the order they were begun
    pub roots: Vec<BytecodeProgram>,

    /// Source constants referred to by index from the source info tables
    pub sources: Vec<Constant>,
}

impl BytecodeNodes {
    pub fn root(&self, id: RootId) -> Option<&BytecodeProgram> {
        self.roots.get(id.index as usize)
    }

    pub fn disassemble(&self, model: &Model) -> Result<String, Error> {
        let mut out = String::new();
        for root in &self.roots {
            out.push_str(&root.disassemble(model)?);
            out.push('\n');
        }
        Ok(out)
    }
}
