//! Disassembly helpers
//!
//! Thin layer over iced-x86 exposing just the control-flow facts the walker
//! needs.

use ghost_cov_common::Error;
use iced_x86::{
    Decoder, DecoderError, DecoderOptions, FlowControl, Formatter, Instruction, NasmFormatter,
    OpKind,
};

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Control-flow class of a decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    ConditionalBranch,
    UnconditionalBranch,
    Call,
    Other,
}

#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub address: u64,
    pub length: usize,
    pub kind: InstructionKind,
    /// Immediate near target of a branch or call
    pub target_address: Option<u64>,
    instruction: Instruction,
}

impl DecodedInstruction {
    fn from_iced(instruction: Instruction) -> Self {
        let kind = match instruction.flow_control() {
            FlowControl::ConditionalBranch => InstructionKind::ConditionalBranch,
            FlowControl::UnconditionalBranch => InstructionKind::UnconditionalBranch,
            FlowControl::Call => InstructionKind::Call,
            _ => InstructionKind::Other,
        };
        let target_address = match instruction.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(instruction.near_branch_target())
            }
            _ => None,
        };

        Self {
            address: instruction.ip(),
            length: instruction.len(),
            kind,
            target_address,
            instruction,
        }
    }

    /// Address of the instruction that follows in memory
    pub fn next_address(&self) -> u64 {
        self.instruction.next_ip()
    }

    /// NASM syntax, for logs
    pub fn text(&self) -> String {
        let mut output = String::new();
        let mut formatter = NasmFormatter::new();
        formatter.format(&self.instruction, &mut output);
        output
    }
}

/// Instructions decoded from the start of a function body
#[derive(Debug, Default)]
pub struct DecodedRun {
    pub instructions: Vec<DecodedInstruction>,
    /// Set when an undecodable byte sequence ended the run early
    pub error: Option<Error>,
}

/// Decode `data` as a straight run of instructions starting at `ip`
///
/// Stops cleanly when the bytes run out, including in the middle of an
/// instruction. An undecodable byte sequence also stops the run; the
/// instructions before it are kept.
pub fn decode_run(data: &[u8], ip: u64, bitness: u32) -> DecodedRun {
    let mut decoder = Decoder::with_ip(bitness, data, ip, DecoderOptions::NONE);
    let mut run = DecodedRun::default();
    let mut instruction = Instruction::default();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            if decoder.last_error() != DecoderError::NoMoreBytes {
                run.error = Some(Error::Disassembly {
                    address: instruction.ip(),
                    message: format!("{:?}", decoder.last_error()),
                });
            }
            break;
        }
        run.instructions.push(DecodedInstruction::from_iced(instruction));
    }

    run
}

/// Decode the single instruction at the start of `data`
pub fn decode_one(data: &[u8], ip: u64, bitness: u32) -> Option<DecodedInstruction> {
    let mut decoder = Decoder::with_ip(bitness, data, ip, DecoderOptions::NONE);
    let instruction = decoder.decode();
    (!instruction.is_invalid()).then(|| DecodedInstruction::from_iced(instruction))
}

/// Target of a `jmp rel` thunk such as an incremental-linking table entry
pub fn jump_thunk_target(data: &[u8], ip: u64, bitness: u32) -> Option<u64> {
    let instruction = decode_one(data, ip, bitness)?;
    match instruction.kind {
        InstructionKind::UnconditionalBranch => instruction.target_address,
        _ => None,
    }
}
