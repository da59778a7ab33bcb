//! Control-flow graph construction: a linear scan collecting jump
//! targets ("leaders") and edges, then resolving blocks between
//! consecutive leaders. Grounded directly on
//! `original_source/src/cfg.cpp`'s `MethodCFG::build`: the same two
//! passes (collect leaders/edges while scanning bytecode linearly,
//! then binary-search each edge's endpoints against the sorted
//! leader list to assign block indices) in the same order, handing
//! the result to `jit::lower` as the unit of IR lowering instead of
//! an LLVM `BasicBlock`.

use cs_parser::ByteReader;

use crate::error::{Result, VmError};
use crate::interpreter::opcodes::*;

#[derive(Debug, Clone, Default)]
pub struct MethodBlock {
    pub index: u32,
    pub start_pc: u32,
    /// Exclusive: `[start_pc, end_pc)`.
    pub end_pc: u32,
    /// True when this block falls through into the next one without
    /// an explicit jump at its end — the scan only sees *targets*,
    /// so a block that never jumps needs a synthesized fallthrough
    /// edge to its successor (`original_source/src/cfg.cpp`'s
    /// `autoJmp` flag).
    pub auto_fallthrough: bool,
    pub successors: Vec<u32>,
    pub predecessors: Vec<u32>,
}

pub struct MethodCfg {
    pub blocks: Vec<MethodBlock>,
}

impl MethodCfg {
    pub fn build(code: &[u8]) -> Result<Self> {
        let mut leaders = Vec::new();
        let mut edges: Vec<(u32, u32)> = Vec::new();
        // Positions immediately after a `return`-family/`athrow`
        // instruction: a block ending exactly here has no real
        // fallthrough successor, unlike a block that simply runs out
        // of explicit jumps because nothing ever branched past it.
        let mut terminal_ends: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let mut reader = ByteReader::new(code);

        let add_label = |leaders: &mut Vec<u32>, edges: &mut Vec<(u32, u32)>, pc: u32, offset: i32| {
            let jump_to = (pc as i64 + offset as i64) as u32;
            leaders.push(jump_to);
            edges.push((pc, jump_to));
        };
        let add_fallthrough_label =
            |leaders: &mut Vec<u32>, edges: &mut Vec<(u32, u32)>, pc: u32, next_pc: u32| {
                leaders.push(next_pc);
                edges.push((pc, next_pc));
            };

        while !reader.eof() {
            let pc = reader.position() as u32;
            let opcode = reader.u1()?;
            match opcode {
                IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE | IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT
                | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE | IF_ACMPEQ | IF_ACMPNE | IFNULL | IFNONNULL => {
                    let offset = reader.i2()? as i32;
                    add_label(&mut leaders, &mut edges, pc, offset);
                    add_fallthrough_label(&mut leaders, &mut edges, pc, reader.position() as u32);
                }
                GOTO => {
                    let offset = reader.i2()? as i32;
                    add_label(&mut leaders, &mut edges, pc, offset);
                }
                GOTO_W => {
                    let offset = reader.i4()?;
                    add_label(&mut leaders, &mut edges, pc, offset);
                }
                JSR => {
                    let offset = reader.i2()? as i32;
                    add_label(&mut leaders, &mut edges, pc, offset);
                    add_fallthrough_label(&mut leaders, &mut edges, pc, reader.position() as u32);
                }
                JSR_W => {
                    let offset = reader.i4()?;
                    add_label(&mut leaders, &mut edges, pc, offset);
                    add_fallthrough_label(&mut leaders, &mut edges, pc, reader.position() as u32);
                }
                TABLESWITCH => {
                    reader.align_from(0);
                    let default_offset = reader.i4()?;
                    add_label(&mut leaders, &mut edges, pc, default_offset);
                    let low = reader.i4()?;
                    let high = reader.i4()?;
                    if high < low {
                        return Err(VmError::fatal("tableswitch high < low"));
                    }
                    for _ in 0..=(high - low) {
                        let offset = reader.i4()?;
                        add_label(&mut leaders, &mut edges, pc, offset);
                    }
                    add_fallthrough_label(&mut leaders, &mut edges, pc, reader.position() as u32);
                }
                LOOKUPSWITCH => {
                    reader.align_from(0);
                    let default_offset = reader.i4()?;
                    add_label(&mut leaders, &mut edges, pc, default_offset);
                    let npairs = reader.i4()?;
                    for _ in 0..npairs {
                        let _key = reader.i4()?;
                        let offset = reader.i4()?;
                        add_label(&mut leaders, &mut edges, pc, offset);
                    }
                    add_fallthrough_label(&mut leaders, &mut edges, pc, reader.position() as u32);
                }
                BIPUSH | LDC | ILOAD | LLOAD | FLOAD | DLOAD | ALOAD | ISTORE | LSTORE | FSTORE
                | DSTORE | ASTORE | NEWARRAY | RET => {
                    reader.skip(1);
                }
                SIPUSH | LDC_W | LDC2_W | IINC | GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD
                | INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST
                | INSTANCEOF => {
                    reader.skip(2);
                }
                MULTIANEWARRAY => {
                    reader.skip(3);
                }
                INVOKEINTERFACE | INVOKEDYNAMIC => {
                    reader.skip(4);
                }
                WIDE => {
                    let widened = reader.u1()?;
                    if widened == IINC {
                        reader.skip(4);
                    } else {
                        reader.skip(2);
                    }
                }
                IRETURN | LRETURN | FRETURN | DRETURN | ARETURN | RETURN | ATHROW => {
                    terminal_ends.insert(reader.position() as u32);
                }
                _ => {}
            }
        }

        leaders.sort_unstable();
        leaders.dedup();
        edges.sort_unstable();
        edges.dedup();

        let code_len = code.len() as u32;
        let mut blocks = Vec::new();
        let mut last_start = 0u32;
        for &leader_pc in &leaders {
            if leader_pc > last_start {
                blocks.push(MethodBlock {
                    index: blocks.len() as u32,
                    start_pc: last_start,
                    end_pc: leader_pc,
                    ..Default::default()
                });
                last_start = leader_pc;
            }
        }
        if last_start < code_len || blocks.is_empty() {
            blocks.push(MethodBlock {
                index: blocks.len() as u32,
                start_pc: last_start,
                end_pc: code_len,
                ..Default::default()
            });
        }

        let block_index_for = |pc: u32, blocks: &[MethodBlock]| -> u32 {
            blocks
                .iter()
                .position(|b| pc >= b.start_pc && pc < b.end_pc)
                .unwrap_or(blocks.len() - 1) as u32
        };

        for (from_pc, jump_to) in &edges {
            let from_index = block_index_for(*from_pc, &blocks);
            let to_index = block_index_for(*jump_to, &blocks);
            if !blocks[from_index as usize].successors.contains(&to_index) {
                blocks[from_index as usize].successors.push(to_index);
            }
            if !blocks[to_index as usize].predecessors.contains(&from_index) {
                blocks[to_index as usize].predecessors.push(from_index);
            }
        }

        let block_count = blocks.len();
        for i in 0..block_count.saturating_sub(1) {
            if blocks[i].successors.is_empty() && !terminal_ends.contains(&blocks[i].end_pc) {
                let next = i as u32 + 1;
                blocks[i].auto_fallthrough = true;
                blocks[i].successors.push(next);
                blocks[next as usize].predecessors.push(i as u32);
            }
        }

        Ok(MethodCfg { blocks })
    }

    pub fn block_containing(&self, pc: u32) -> Option<&MethodBlock> {
        self.blocks.iter().find(|b| pc >= b.start_pc && pc < b.end_pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_code_is_one_block() {
        let code = [ICONST_0, ICONST_1, IADD, IRETURN];
        let cfg = MethodCfg::build(&code).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
    }

    #[test]
    fn a_self_looping_goto_creates_a_single_block_with_a_loop_edge() {
        // pc0: goto +0 (an infinite loop jumping back to itself)
        let mut code = vec![GOTO];
        code.extend(0i16.to_be_bytes());
        let cfg = MethodCfg::build(&code).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.blocks[0].successors.contains(&0));
    }

    #[test]
    fn a_forward_conditional_branch_creates_two_successor_edges() {
        // pc0: ifeq +4 ; pc3: iconst_0 ; pc4 (target): ireturn
        let mut code = vec![IFEQ];
        code.extend(4i16.to_be_bytes());
        code.push(ICONST_0);
        code.push(IRETURN);
        let cfg = MethodCfg::build(&code).unwrap();
        assert!(cfg.blocks.len() >= 2);
        let entry = cfg.block_containing(0).unwrap();
        assert_eq!(entry.successors.len(), 2);
    }

    #[test]
    fn a_block_ending_in_return_gets_no_synthetic_fallthrough() {
        // pc0: ifeq +4 (a leader splits the method into two blocks) ;
        // pc3: ireturn (this block's real end has no successor) ;
        // pc4 (target): ireturn
        let mut code = vec![IFEQ];
        code.extend(4i16.to_be_bytes());
        code.push(IRETURN);
        code.push(IRETURN);
        let cfg = MethodCfg::build(&code).unwrap();
        let dead_end = cfg.block_containing(3).unwrap();
        assert_eq!(dead_end.successors.len(), 0);
        assert!(!dead_end.auto_fallthrough);
    }
}
