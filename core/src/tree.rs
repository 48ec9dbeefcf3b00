//! Ahead-of-time instruction catalog for a whole module.
//!
//! Starting from the module's entry function, every statically nested
//! function is decoded once and stored under a slash-joined path such as
//! `<module>/outer/inner`. A reverse index maps each function's [`CodeId`]
//! back to its path so the tick hook can name the code it is running.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bytecode::opcode::{self, Group};
use crate::bytecode::{CodeId, Instruction, RawCode, decode_at, line_table};
use crate::qstr::UNKNOWN_QSTR;

pub const PATH_SEPARATOR: char = '/';

/// Path → decoded instruction stream of the function at that path.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct CodeTree {
    nodes: BTreeMap<Arc<str>, Vec<Instruction>>,
}

impl CodeTree {
    #[inline]
    pub fn get(&self, path: &str) -> Option<&[Instruction]> {
        self.nodes.get(path).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Arc<str>> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &[Instruction])> {
        self.nodes.iter().map(|(path, instrs)| (path, instrs.as_slice()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    fn insert(&mut self, path: Arc<str>, instrs: Vec<Instruction>) {
        self.nodes.insert(path, instrs);
    }
}

/// [`CodeId`] → path in the [`CodeTree`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ReverseIndex {
    paths: FxHashMap<CodeId, Arc<str>>,
}

impl ReverseIndex {
    #[inline]
    pub fn get(&self, id: CodeId) -> Option<&Arc<str>> {
        self.paths.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CodeId, &Arc<str>)> {
        self.paths.iter().map(|(id, path)| (*id, path))
    }
}

/// Decode `entry` and everything nested in it.
///
/// The root path is the entry's block name. Every make-function instruction
/// adds one child entry under its parent's path; siblings sharing a block name
/// get `#2`, `#3`, ... appended in source order. Code nested under several
/// parents appears under each of them and is decoded once. The reverse index
/// keeps the first path that reaches a function. A function that contains
/// itself through its own nesting is not expanded again.
pub fn build_tree(entry: &Arc<RawCode>) -> (CodeTree, ReverseIndex) {
    let mut tree = CodeTree::default();
    let mut index = ReverseIndex::default();
    let mut decoded: FxHashMap<CodeId, (Vec<Instruction>, Vec<Arc<RawCode>>)> = FxHashMap::default();

    let root = block_name(entry);
    let mut work: Vec<(Arc<RawCode>, Arc<str>, Vec<CodeId>)> = vec![(entry.clone(), root, Vec::new())];

    while let Some((code, path, mut ancestors)) = work.pop() {
        let (instrs, children) = decoded
            .entry(code.id())
            .or_insert_with(|| decode_function(&code))
            .clone();
        ancestors.push(code.id());

        let mut scheduled = Vec::with_capacity(children.len());
        let mut names: FxHashMap<Arc<str>, usize> = FxHashMap::default();
        for child in children {
            if ancestors.contains(&child.id()) {
                warn!(target: "bctrace::tree", parent = %path, code = %child.id(), "tree.cycle");
                continue;
            }
            let name = block_name(&child);
            let seen = names.entry(name.clone()).or_insert(0);
            *seen += 1;
            let child_path = if *seen == 1 {
                format!("{path}{PATH_SEPARATOR}{name}")
            } else {
                warn!(
                    target: "bctrace::tree",
                    parent = %path,
                    name = %name,
                    occurrence = *seen,
                    "tree.sibling_name_collision"
                );
                format!("{path}{PATH_SEPARATOR}{name}#{seen}")
            };
            scheduled.push((child, Arc::<str>::from(child_path), ancestors.clone()));
        }
        // Reversed so the first child in source order is popped first.
        work.extend(scheduled.into_iter().rev());

        index.paths.entry(code.id()).or_insert_with(|| path.clone());
        tree.insert(path, instrs);
    }

    debug!(
        target: "bctrace::tree",
        root = %block_name(entry),
        functions = tree.len(),
        decoded = decoded.len(),
        instructions = tree.instruction_count(),
        "tree.built"
    );
    (tree, index)
}

fn block_name(code: &RawCode) -> Arc<str> {
    code.block_name().unwrap_or_else(|| Arc::from(UNKNOWN_QSTR))
}

/// Decode one function's full instruction stream and collect the nested
/// code its make-function instructions refer to, in order of appearance.
pub fn decode_function(code: &RawCode) -> (Vec<Instruction>, Vec<Arc<RawCode>>) {
    let mut instrs = Vec::new();
    let mut children = Vec::new();

    let Some(prelude) = code.prelude() else {
        warn!(target: "bctrace::tree", code = %code.id(), "tree.truncated_prelude");
        return (instrs, children);
    };
    let buf = code.bytecode();
    let table = prelude.line_table(buf);

    let mut pos = prelude.bytecode;
    while pos < buf.len() {
        let offset = prelude.offset_of(pos);
        let Some((op, next)) = decode_at(code, pos) else {
            warn!(
                target: "bctrace::tree",
                code = %code.id(),
                offset,
                byte = buf[pos],
                "tree.unknown_opcode"
            );
            break;
        };
        if opcode::group(op.opcode) == Group::MakeFunction
            && let Some(child) = op.arg.and_then(|idx| code.const_code(idx as usize))
        {
            children.push(child.clone());
        }
        let line = line_table::line_for_offset(table, offset);
        instrs.push(Instruction::new(op, offset, line, &buf[pos..next]));
        pos = next;
    }
    (instrs, children)
}
