use crate::errors::EncodingOverflow;
use crate::model::{InstructionId, InstructionInfo, OPCODE_WIDTH};
use crate::Error;
use byteorder::{BigEndian, ByteOrder};

/// Growable bytecode buffer
///
/// The backing storage only grows (by doubling) while the logical end `bci` can move backwards
/// when the rewriter replaces instructions. All multi-byte fields are big-endian.
#[derive(Default)]
pub(crate) struct BytecodeBuffer {
    bytes: Vec<u8>,
    bci: usize,
}

impl BytecodeBuffer {
    const INITIAL_CAPACITY: usize = 16;

    pub fn bci(&self) -> usize {
        self.bci
    }

    /// Move the logical end (only backwards, when rewriting)
    pub fn set_bci(&mut self, bci: usize) {
        debug_assert!(bci <= self.bci);
        self.bci = bci;
    }

    pub fn clear(&mut self) {
        self.bci = 0;
    }

    /// Make sure there is room for `n` bytes in total
    pub fn ensure_capacity(&mut self, n: usize) {
        if self.bytes.len() >= n {
            return;
        }
        let mut capacity = self.bytes.len().max(Self::INITIAL_CAPACITY);
        while capacity < n {
            capacity *= 2;
        }
        self.bytes.resize(capacity, 0);
    }

    /// Append an instruction, returning the bci it was written at
    pub fn write_instruction(
        &mut self,
        info: &InstructionInfo,
        immediates: &[i32],
    ) -> Result<usize, Error> {
        debug_assert_eq!(info.immediates.len(), immediates.len());
        let bci = self.bci;
        let end = bci + info.length();
        if end > i32::MAX as usize {
            return Err(Error::Encoding(EncodingOverflow::Bytecode(end)));
        }
        self.ensure_capacity(end);

        BigEndian::write_u16(&mut self.bytes[bci..bci + OPCODE_WIDTH], info.id.0);
        let mut offset = bci + OPCODE_WIDTH;
        for (kind, value) in info.immediates.iter().zip(immediates) {
            match kind.width() {
                2 => {
                    let short = i16::try_from(*value)
                        .map_err(|_| Error::Encoding(EncodingOverflow::ShortImmediate(*value)))?;
                    BigEndian::write_i16(&mut self.bytes[offset..offset + 2], short);
                }
                _ => BigEndian::write_i32(&mut self.bytes[offset..offset + 4], *value),
            }
            offset += kind.width();
        }
        self.bci = end;
        Ok(bci)
    }

    pub fn patch_int(&mut self, at: usize, value: i32) {
        debug_assert!(at + 4 <= self.bci);
        BigEndian::write_i32(&mut self.bytes[at..at + 4], value);
    }

    pub fn read_opcode(&self, at: usize) -> InstructionId {
        InstructionId(BigEndian::read_u16(&self.bytes[at..at + OPCODE_WIDTH]))
    }

    /// Read back the immediates of the instruction at `bci`
    pub fn read_immediates(&self, bci: usize, info: &InstructionInfo) -> Vec<i32> {
        read_immediates(&self.bytes[..self.bci], bci, info)
    }

    /// Instructions between two bcis, as `(bci, opcode)` pairs
    pub fn scan(
        &self,
        from: usize,
        to: usize,
        length_of: impl Fn(InstructionId) -> usize,
    ) -> Vec<(usize, InstructionId)> {
        let mut instructions = vec![];
        let mut bci = from;
        while bci < to {
            let opcode = self.read_opcode(bci);
            instructions.push((bci, opcode));
            bci += length_of(opcode);
        }
        instructions
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes[..self.bci].to_vec()
    }
}

/// Decode the immediates of the instruction at `bci`
pub(crate) fn read_immediates(bytes: &[u8], bci: usize, info: &InstructionInfo) -> Vec<i32> {
    let mut offset = bci + OPCODE_WIDTH;
    info.immediates
        .iter()
        .map(|kind| {
            let value = match kind.width() {
                2 => BigEndian::read_i16(&bytes[offset..offset + 2]) as i32,
                _ => BigEndian::read_i32(&bytes[offset..offset + 4]),
            };
            offset += kind.width();
            value
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{ImmediateKind, StackEffect};

    fn info(id: u16, immediates: Vec<ImmediateKind>) -> InstructionInfo {
        InstructionInfo::new(InstructionId(id), "test", immediates, StackEffect::Fixed(0))
    }

    #[test]
    fn grows_by_doubling() {
        let mut buffer = BytecodeBuffer::default();
        buffer.ensure_capacity(1);
        assert_eq!(buffer.bytes.len(), 16);
        buffer.ensure_capacity(33);
        assert_eq!(buffer.bytes.len(), 64);
        buffer.ensure_capacity(10);
        assert_eq!(buffer.bytes.len(), 64);
    }

    #[test]
    fn writes_big_endian_and_patches() {
        let mut buffer = BytecodeBuffer::default();
        let branch = info(3, vec![ImmediateKind::BranchTarget, ImmediateKind::FrameIndex]);
        assert_eq!(buffer.write_instruction(&branch, &[-1, 7]).unwrap(), 0);
        assert_eq!(buffer.to_vec(), vec![0, 3, 0xff, 0xff, 0xff, 0xff, 0, 7]);

        buffer.patch_int(2, 0x0102_0304);
        assert_eq!(buffer.read_immediates(0, &branch), vec![0x0102_0304, 7]);
    }

    #[test]
    fn short_immediates_overflow() {
        let mut buffer = BytecodeBuffer::default();
        let store = info(6, vec![ImmediateKind::FrameIndex]);
        assert!(matches!(
            buffer.write_instruction(&store, &[40_000]),
            Err(Error::Encoding(EncodingOverflow::ShortImmediate(40_000)))
        ));
    }

    #[test]
    fn scan_walks_instruction_lengths() {
        let mut buffer = BytecodeBuffer::default();
        let pop = info(0, vec![]);
        let constant = info(11, vec![ImmediateKind::Constant]);
        buffer.write_instruction(&pop, &[]).unwrap();
        buffer.write_instruction(&constant, &[5]).unwrap();
        buffer.write_instruction(&pop, &[]).unwrap();
        let lengths = |id: InstructionId| if id.0 == 0 { 2 } else { 6 };
        assert_eq!(
            buffer.scan(0, buffer.bci(), lengths),
            vec![
                (0, InstructionId(0)),
                (2, InstructionId(11)),
                (8, InstructionId(0))
            ]
        );
    }
}
