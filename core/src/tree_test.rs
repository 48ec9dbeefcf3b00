use std::sync::Arc;

use crate::bytecode::{ModuleBuilder, RawCode, opcode};
use crate::config::BytecodeFormat;
use crate::tree::*;

fn builder() -> ModuleBuilder {
    ModuleBuilder::new("prog.py", BytecodeFormat::default()).unwrap()
}

fn leaf(mb: &ModuleBuilder, name: &str) -> Arc<RawCode> {
    let mut f = mb.function(name).unwrap();
    f.op(opcode::LOAD_CONST_NONE).return_value();
    f.finish()
}

/// `def outer(): def inner(): pass`
fn nested(mb: &ModuleBuilder) -> (Arc<RawCode>, Arc<RawCode>, Arc<RawCode>) {
    let inner = leaf(mb, "inner");
    let outer = {
        let mut f = mb.function("outer").unwrap();
        f.line(2).make_function(inner.clone(), false).store_fast(0);
        f.op(opcode::LOAD_CONST_NONE).return_value();
        f.finish()
    };
    let module = {
        let mut f = mb.module_function().unwrap();
        f.make_function(outer.clone(), false);
        f.op_qstr(opcode::STORE_NAME, "outer").unwrap();
        f.line(4).op(opcode::LOAD_CONST_NONE).return_value();
        f.finish()
    };
    (module, outer, inner)
}

#[test]
fn single_function_scenario() {
    let mut f = builder().module_function().unwrap();
    f.small_int(5).return_value();
    let module = f.finish();

    let (tree, index) = build_tree(&module);
    let instrs = tree.get("<module>").expect("root node");
    assert_eq!(instrs.len(), 2);
    assert_eq!((instrs[0].offset, instrs[0].name, instrs[0].arg), (0, "LOAD_CONST_SMALL_INT", Some(5)));
    assert_eq!((instrs[1].offset, instrs[1].name, instrs[1].arg), (1, "RETURN_VALUE", None));
    assert_eq!(index.get(module.id()).map(|p| &**p), Some("<module>"));
    assert_eq!(tree.len(), 1);
}

#[test]
fn nested_paths_and_reverse_index() {
    let mb = builder();
    let (module, outer, inner) = nested(&mb);
    let (tree, index) = build_tree(&module);

    let paths: Vec<&str> = tree.paths().map(|p| &**p).collect();
    assert_eq!(paths, vec!["<module>", "<module>/outer", "<module>/outer/inner"]);
    assert_eq!(index.len(), 3);
    assert_eq!(index.get(module.id()).map(|p| &**p), Some("<module>"));
    assert_eq!(index.get(outer.id()).map(|p| &**p), Some("<module>/outer"));
    assert_eq!(index.get(inner.id()).map(|p| &**p), Some("<module>/outer/inner"));
    for (_, path) in index.iter() {
        assert!(tree.get(path).is_some());
    }
}

#[test]
fn decoding_consumes_the_whole_function() {
    let mb = builder();
    let (module, outer, inner) = nested(&mb);
    let (tree, _) = build_tree(&module);

    for (code, path) in [(&module, "<module>"), (&outer, "<module>/outer"), (&inner, "<module>/outer/inner")] {
        let instrs = tree.get(path).unwrap();
        let start = code.prelude().unwrap().bytecode;
        let spanned: usize = instrs.iter().map(|i| i.raw.len()).sum();
        assert_eq!(start + spanned, code.bytecode().len(), "{path}");
        let last = instrs.last().unwrap();
        assert_eq!(last.offset + last.raw.len(), code.bytecode().len() - start);
    }
}

#[test]
fn lines_follow_the_table() {
    let mb = builder();
    let (module, _, _) = nested(&mb);
    let (tree, _) = build_tree(&module);

    let lines: Vec<u32> = tree.get("<module>").unwrap().iter().map(|i| i.line).collect();
    assert_eq!(lines, vec![1, 1, 4, 4]);
    let outer: Vec<u32> = tree.get("<module>/outer").unwrap().iter().map(|i| i.line).collect();
    assert_eq!(outer, vec![2, 2, 2, 2]);
}

#[test]
fn make_function_resolves_child_id() {
    let mb = builder();
    let (module, outer, _) = nested(&mb);
    let (tree, _) = build_tree(&module);
    let first = &tree.get("<module>").unwrap()[0];
    assert_eq!(first.name, "MAKE_FUNCTION");
    assert_eq!(first.argval, Some(crate::obj::Obj::Code(outer.id())));
}

#[test]
fn same_named_siblings_get_suffixes_in_source_order() {
    let mb = builder();
    let first = leaf(&mb, "<listcomp>");
    let other = leaf(&mb, "helper");
    let second = leaf(&mb, "<listcomp>");
    let mut f = mb.module_function().unwrap();
    f.make_function(first.clone(), false)
        .make_closure(other.clone(), 0, false)
        .make_function(second.clone(), true)
        .return_value();
    let module = f.finish();

    let (tree, index) = build_tree(&module);
    assert_eq!(tree.len(), 4);
    assert_eq!(index.get(first.id()).map(|p| &**p), Some("<module>/<listcomp>"));
    assert_eq!(index.get(second.id()).map(|p| &**p), Some("<module>/<listcomp>#2"));
    assert_eq!(index.get(other.id()).map(|p| &**p), Some("<module>/helper"));
}

#[test]
fn shared_code_appears_under_every_parent() {
    let mb = builder();
    let shared = leaf(&mb, "shared");
    let a = {
        let mut f = mb.function("a").unwrap();
        f.make_function(shared.clone(), false).return_value();
        f.finish()
    };
    let b = {
        let mut f = mb.function("b").unwrap();
        f.make_function(shared.clone(), false).return_value();
        f.finish()
    };
    let mut f = mb.module_function().unwrap();
    f.make_function(a, false).make_function(b, false).return_value();
    let module = f.finish();

    let (tree, index) = build_tree(&module);
    let paths: Vec<&str> = tree.paths().map(|p| &**p).collect();
    assert_eq!(
        paths,
        vec!["<module>", "<module>/a", "<module>/a/shared", "<module>/b", "<module>/b/shared"]
    );
    assert_eq!(tree.get("<module>/b/shared"), tree.get("<module>/a/shared"));
    assert_eq!(index.len(), 4);
    assert_eq!(index.get(shared.id()).map(|p| &**p), Some("<module>/a/shared"));
}

#[test]
fn repeated_make_function_in_one_parent_gets_its_own_entry() {
    let mb = builder();
    let shared = leaf(&mb, "shared");
    let mut f = mb.module_function().unwrap();
    f.make_function(shared.clone(), false).make_function(shared.clone(), false).return_value();
    let module = f.finish();

    let (tree, index) = build_tree(&module);
    assert!(tree.get("<module>/shared").is_some());
    assert!(tree.get("<module>/shared#2").is_some());
    assert_eq!(index.get(shared.id()).map(|p| &**p), Some("<module>/shared"));
}

#[test]
fn unknown_opcode_stops_the_scan() {
    let mut f = builder().module_function().unwrap();
    f.small_int(1).raw(&[0x00]).return_value();
    let module = f.finish();
    let (tree, _) = build_tree(&module);
    let instrs = tree.get("<module>").unwrap();
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].name, "LOAD_CONST_SMALL_INT");
}

#[test]
fn serializes_as_path_map() {
    let mut f = builder().module_function().unwrap();
    f.small_int(5).return_value();
    let module = f.finish();
    let (tree, _) = build_tree(&module);

    let json = serde_json::to_value(&tree).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "<module>": [
                [0, 1, "LOAD_CONST_SMALL_INT", 5, null, null, [0x85]],
                [1, 1, "RETURN_VALUE", null, null, null, [0x5b]],
            ]
        })
    );
}
