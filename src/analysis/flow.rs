//! Flow-instruction classification and branch target resolution.

use iced_x86::Mnemonic;

use crate::analysis::jump_table;
use crate::config::AnalysisConfig;
use crate::core::address::Address;
use crate::core::basic_block::BlockTermination;
use crate::core::instruction::{Instruction, OperandKind, OperandResolution};
use crate::core::xref::XRefType;
use crate::image::Image;

/// Cross-reference type produced by a flow instruction, if it is one.
pub fn classify(instruction: &Instruction) -> Option<XRefType> {
    use Mnemonic::*;
    match instruction.mnemonic {
        Jo | Jno | Jb | Jae | Je | Jne | Jbe | Ja | Js | Jns | Jp | Jnp | Jl | Jge | Jle | Jg
        | Jcxz | Loop | Loope | Loopne => Some(XRefType::ConditionalJump),
        Jmp if instruction.far => Some(XRefType::FarJump),
        Jmp => Some(XRefType::NearJump),
        Call if instruction.far => Some(XRefType::FarCall),
        Call => Some(XRefType::NearCall),
        _ => None,
    }
}

/// Termination for instructions that end a run on their own.
pub fn terminator(instruction: &Instruction, config: &AnalysisConfig) -> Option<BlockTermination> {
    match instruction.mnemonic {
        Mnemonic::Ret | Mnemonic::Retf => Some(BlockTermination::Return),
        Mnemonic::Iret if config.iret_terminates => Some(BlockTermination::Return),
        Mnemonic::Hlt => Some(BlockTermination::Halt),
        _ => None,
    }
}

/// Where a flow instruction goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTarget {
    Resolved(Address),
    /// Jump through a table whose first slot is at `slot`
    Indexed { slot: Address },
    /// Relative target outside the 16-bit offset range
    Wrapped,
    /// Not statically known
    Dynamic,
}

/// Resolve the target of a flow instruction decoded at `source`.
///
/// Operand tags from fixup alignment take precedence over the raw encoding.
pub fn resolve_target(
    image: &dyn Image,
    instruction: &Instruction,
    source: Address,
    config: &AnalysisConfig,
) -> FlowTarget {
    if let Some(operand) = instruction.branch_operand() {
        return match (operand.resolution, operand.kind) {
            (OperandResolution::Symbolic(target), _) => image
                .resolve(&target)
                .map_or(FlowTarget::Dynamic, FlowTarget::Resolved),
            (OperandResolution::Concrete(target), _) => FlowTarget::Resolved(target),
            (_, OperandKind::NearBranch { displacement }) => {
                let delta = i32::from(instruction.length) + i32::from(displacement);
                source
                    .checked_add(delta)
                    .map_or(FlowTarget::Wrapped, FlowTarget::Resolved)
            }
            (_, OperandKind::FarBranch { selector, offset }) => {
                FlowTarget::Resolved(Address::new(selector, offset))
            }
            _ => FlowTarget::Dynamic,
        };
    }
    if config.resolve_jump_tables && jump_table::is_table_jump(instruction) {
        if let Some(slot) = jump_table::first_slot(image, instruction, source) {
            return FlowTarget::Indexed { slot };
        }
    }
    FlowTarget::Dynamic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::{Referent, SymbolicTarget};
    use crate::core::segment::Segment;
    use crate::disasm::iced::IcedDecoder;
    use crate::disasm::Decoder;
    use crate::image::LibraryImage;

    fn decode(bytes: &[u8], ip: u16) -> Instruction {
        IcedDecoder::new().decode(bytes, ip).unwrap()
    }

    fn library() -> LibraryImage {
        let mut lib = LibraryImage::new();
        let m = lib.add_module("m");
        lib.add_segment(m, Segment::new("_TEXT", vec![0x90; 0x40]))
            .unwrap();
        lib
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&decode(&[0x74, 0x02], 0)), Some(XRefType::ConditionalJump));
        assert_eq!(classify(&decode(&[0xE3, 0x02], 0)), Some(XRefType::ConditionalJump));
        assert_eq!(classify(&decode(&[0xE2, 0xFE], 0)), Some(XRefType::ConditionalJump));
        assert_eq!(classify(&decode(&[0xEB, 0x00], 0)), Some(XRefType::NearJump));
        assert_eq!(
            classify(&decode(&[0xEA, 0, 0, 0, 0], 0)),
            Some(XRefType::FarJump)
        );
        assert_eq!(classify(&decode(&[0xE8, 0, 0], 0)), Some(XRefType::NearCall));
        assert_eq!(classify(&decode(&[0xFF, 0x1F], 0)), Some(XRefType::FarCall));
        assert_eq!(classify(&decode(&[0xC3], 0)), None);
        assert_eq!(classify(&decode(&[0x90], 0)), None);
    }

    #[test]
    fn test_terminators() {
        let config = AnalysisConfig::default();
        assert_eq!(terminator(&decode(&[0xC3], 0), &config), Some(BlockTermination::Return));
        assert_eq!(terminator(&decode(&[0xCB], 0), &config), Some(BlockTermination::Return));
        assert_eq!(terminator(&decode(&[0xCF], 0), &config), Some(BlockTermination::Return));
        assert_eq!(terminator(&decode(&[0xF4], 0), &config), Some(BlockTermination::Halt));
        let config = AnalysisConfig {
            iret_terminates: false,
            ..AnalysisConfig::default()
        };
        assert_eq!(terminator(&decode(&[0xCF], 0), &config), None);
    }

    #[test]
    fn test_resolve_relative_and_wrap() {
        let lib = library();
        let config = AnalysisConfig::default();
        let jmp = decode(&[0xEB, 0x04], 0x10);
        assert_eq!(
            resolve_target(&lib, &jmp, Address::new(0, 0x10), &config),
            FlowTarget::Resolved(Address::new(0, 0x16))
        );
        let back = decode(&[0xEB, 0xF0], 0x02);
        assert_eq!(
            resolve_target(&lib, &back, Address::new(0, 0x02), &config),
            FlowTarget::Wrapped
        );
    }

    #[test]
    fn test_resolve_symbolic_and_dynamic() {
        let lib = library();
        let config = AnalysisConfig::default();
        let mut call = decode(&[0xE8, 0x00, 0x00], 0);
        call.operands[0].resolution =
            OperandResolution::Symbolic(SymbolicTarget::new(Referent::Segment(0), 0x20));
        assert_eq!(
            resolve_target(&lib, &call, Address::new(0, 0), &config),
            FlowTarget::Resolved(Address::new(0, 0x20))
        );
        call.operands[0].resolution =
            OperandResolution::Symbolic(SymbolicTarget::new(Referent::External(4), 0));
        assert_eq!(
            resolve_target(&lib, &call, Address::new(0, 0), &config),
            FlowTarget::Dynamic
        );
        // call ax
        let indirect = decode(&[0xFF, 0xD0], 0);
        assert_eq!(
            resolve_target(&lib, &indirect, Address::new(0, 0), &config),
            FlowTarget::Dynamic
        );
    }

    #[test]
    fn test_resolve_jump_table() {
        let lib = library();
        let jmp = decode(&[0x2E, 0xFF, 0xA7, 0x20, 0x00], 0);
        let config = AnalysisConfig::default();
        assert_eq!(
            resolve_target(&lib, &jmp, Address::new(0, 0), &config),
            FlowTarget::Indexed {
                slot: Address::new(0, 0x20)
            }
        );
        let config = AnalysisConfig {
            resolve_jump_tables: false,
            ..AnalysisConfig::default()
        };
        assert_eq!(
            resolve_target(&lib, &jmp, Address::new(0, 0), &config),
            FlowTarget::Dynamic
        );
    }
}
