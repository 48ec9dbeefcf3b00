//! BCTM module container.
//!
//! Stores a compiled module (its qstr pool and every function reachable from
//! the entry point) so it can be inspected offline. Layout:
//!
//! ```text
//! "BCTM" u16 version u16 reserved u32 format-flags
//! section* := tag[4] u32 len payload
//! ```
//!
//! `QSTR` and `CODE` are required, `META` (JSON) is optional and unknown
//! sections are skipped. Functions in `CODE` are ordered children first so a
//! nested-code constant always refers to an earlier index; the entry
//! function is the last one.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytecode::{CodeId, ConstEntry, RawCode};
use crate::config::BytecodeFormat;
use crate::obj::Obj;
use crate::qstr::QstrPool;

const MAGIC: [u8; 4] = *b"BCTM";
pub const CURRENT_VERSION: u16 = 1;

const CONST_QSTR: u8 = 0;
const CONST_OBJ: u8 = 1;
const CONST_CODE: u8 = 2;

/// Deepest tuple nesting accepted in an object constant.
const MAX_CONST_DEPTH: usize = 64;

/// Optional description of where the module came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleMeta {
    /// Module name the code should be registered under.
    pub name: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ModuleMeta {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.source.is_none() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BytecodeModule {
    pub version: u16,
    pub format: BytecodeFormat,
    pub qstrs: Arc<QstrPool>,
    pub entry: Arc<RawCode>,
    pub meta: Option<ModuleMeta>,
}

impl BytecodeModule {
    pub fn new(entry: Arc<RawCode>) -> Self {
        Self {
            version: CURRENT_VERSION,
            format: entry.format(),
            qstrs: entry.qstrs().clone(),
            entry,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: ModuleMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

pub fn encode_module(module: &BytecodeModule) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    write_u16(&mut out, module.version);
    write_u16(&mut out, 0); // reserved
    write_u32(&mut out, module.format.bits());

    let names = module.qstrs.names();
    let mut qstr_payload = Vec::new();
    write_u32(&mut qstr_payload, names.len() as u32);
    for name in &names {
        write_string(&mut qstr_payload, name);
    }
    write_section(&mut out, *b"QSTR", &qstr_payload);

    let functions = children_first(&module.entry);
    let mut index: FxHashMap<CodeId, u32> = FxHashMap::default();
    let mut code_payload = Vec::new();
    write_u32(&mut code_payload, functions.len() as u32);
    for code in &functions {
        ensure!(
            Arc::ptr_eq(code.qstrs(), &module.qstrs),
            "function {} does not share the module's qstr pool",
            code.id()
        );
        ensure!(
            code.format() == module.format,
            "function {} was encoded with a different bytecode format",
            code.id()
        );
        encode_function(&mut code_payload, code, &index)?;
        index.insert(code.id(), index.len() as u32);
    }
    write_section(&mut out, *b"CODE", &code_payload);

    if let Some(meta) = module.meta.as_ref().filter(|m| !m.is_empty()) {
        let meta_payload = serde_json::to_vec(meta)?;
        write_section(&mut out, *b"META", &meta_payload);
    }

    debug!(
        target: "bctrace::container",
        functions = functions.len(),
        qstrs = names.len(),
        bytes = out.len(),
        "container.encoded"
    );
    Ok(out)
}

pub fn decode_module(bytes: &[u8]) -> Result<BytecodeModule> {
    ensure!(bytes.len() >= 12, "module too small");
    ensure!(bytes[..4] == MAGIC, "invalid BCTM magic");

    let mut cursor = 4;
    let version = read_u16(bytes, &mut cursor)?;
    let _reserved = read_u16(bytes, &mut cursor)?;
    let format = BytecodeFormat::from_bits(read_u32(bytes, &mut cursor)?);

    ensure!(
        version <= CURRENT_VERSION,
        "unsupported BCTM version {} (reader supports <= {})",
        version,
        CURRENT_VERSION
    );

    let mut qstrs: Option<Arc<QstrPool>> = None;
    let mut code_payload: Option<&[u8]> = None;
    let mut meta: Option<ModuleMeta> = None;

    while cursor < bytes.len() {
        let tag = read_tag(bytes, &mut cursor)?;
        let len = read_u32(bytes, &mut cursor)? as usize;
        ensure!(cursor + len <= bytes.len(), "section overruns payload");
        let payload = &bytes[cursor..cursor + len];
        cursor += len;

        match &tag {
            b"QSTR" => {
                ensure!(qstrs.is_none(), "duplicate QSTR section");
                qstrs = Some(Arc::new(decode_qstrs(payload)?));
            }
            b"CODE" => {
                ensure!(code_payload.is_none(), "duplicate CODE section");
                code_payload = Some(payload);
            }
            b"META" => {
                ensure!(meta.is_none(), "duplicate META section");
                meta = Some(serde_json::from_slice(payload).context("invalid META section")?);
            }
            _ => {}
        }
    }

    let qstrs = qstrs.ok_or_else(|| anyhow!("missing QSTR section"))?;
    let code_payload = code_payload.ok_or_else(|| anyhow!("missing CODE section"))?;
    let entry = decode_functions(code_payload, &qstrs, format)?;

    debug!(
        target: "bctrace::container",
        version,
        qstrs = qstrs.len(),
        "container.decoded"
    );
    Ok(BytecodeModule {
        version,
        format,
        qstrs,
        entry,
        meta,
    })
}

/// Every function reachable from `entry`, each once, children before parents.
fn children_first(entry: &Arc<RawCode>) -> Vec<Arc<RawCode>> {
    let mut order = Vec::new();
    let mut placed: FxHashSet<CodeId> = FxHashSet::default();
    let mut stack: Vec<(Arc<RawCode>, bool)> = vec![(entry.clone(), false)];
    while let Some((code, expanded)) = stack.pop() {
        if placed.contains(&code.id()) {
            continue;
        }
        if expanded {
            placed.insert(code.id());
            order.push(code);
            continue;
        }
        let children: Vec<_> = code.children().cloned().collect();
        stack.push((code, true));
        for child in children.into_iter().rev() {
            if !placed.contains(&child.id()) {
                stack.push((child, false));
            }
        }
    }
    order
}

fn decode_qstrs(payload: &[u8]) -> Result<QstrPool> {
    let mut cursor = 0;
    let count = read_u32(payload, &mut cursor)? as usize;
    let pool = QstrPool::new();
    for idx in 0..count {
        let name = read_string(payload, &mut cursor)?;
        let id = pool.intern(&name)?;
        ensure!(id as usize == idx, "duplicate qstr {:?}", name);
    }
    ensure!(cursor == payload.len(), "extra data at end of QSTR section");
    Ok(pool)
}

fn encode_function(out: &mut Vec<u8>, code: &RawCode, index: &FxHashMap<CodeId, u32>) -> Result<()> {
    let buf = code.bytecode();
    write_u32(out, buf.len() as u32);
    out.extend_from_slice(buf);

    write_u32(out, code.consts().len() as u32);
    for entry in code.consts() {
        match entry {
            ConstEntry::Qstr(q) => {
                write_u8(out, CONST_QSTR);
                write_u16(out, *q);
            }
            ConstEntry::Obj(obj) => {
                write_u8(out, CONST_OBJ);
                encode_obj(out, obj, 0)?;
            }
            ConstEntry::Code(child) => {
                let idx = index
                    .get(&child.id())
                    .with_context(|| format!("nested code {} not encoded before its parent", child.id()))?;
                write_u8(out, CONST_CODE);
                write_u32(out, *idx);
            }
        }
    }
    Ok(())
}

fn decode_functions(payload: &[u8], qstrs: &Arc<QstrPool>, format: BytecodeFormat) -> Result<Arc<RawCode>> {
    let mut cursor = 0;
    let count = read_u32(payload, &mut cursor)? as usize;
    let mut functions: Vec<Arc<RawCode>> = Vec::with_capacity(count.min(1024));

    for fidx in 0..count {
        let len = read_u32(payload, &mut cursor)? as usize;
        ensure!(cursor + len <= payload.len(), "function {} overruns CODE section", fidx);
        let bytecode = payload[cursor..cursor + len].to_vec();
        cursor += len;

        let n_consts = read_u32(payload, &mut cursor)? as usize;
        let mut consts = Vec::with_capacity(n_consts.min(1024));
        for _ in 0..n_consts {
            let entry = match read_u8(payload, &mut cursor)? {
                CONST_QSTR => ConstEntry::Qstr(read_u16(payload, &mut cursor)?),
                CONST_OBJ => ConstEntry::Obj(decode_obj(payload, &mut cursor, 0)?),
                CONST_CODE => {
                    let idx = read_u32(payload, &mut cursor)? as usize;
                    ensure!(
                        idx < functions.len(),
                        "function {} refers to code {} which is not defined before it",
                        fidx,
                        idx
                    );
                    ConstEntry::Code(functions[idx].clone())
                }
                other => bail!("unknown constant tag {}", other),
            };
            consts.push(entry);
        }
        functions.push(Arc::new(RawCode::new(bytecode, consts, qstrs.clone(), format)));
    }

    ensure!(cursor == payload.len(), "extra data at end of CODE section");
    functions.pop().ok_or_else(|| anyhow!("CODE section holds no functions"))
}

fn encode_obj(out: &mut Vec<u8>, obj: &Obj, depth: usize) -> Result<()> {
    ensure!(depth < MAX_CONST_DEPTH, "constant nesting too deep");
    match obj {
        Obj::None => write_u8(out, 0),
        Obj::Bool(b) => {
            write_u8(out, 1);
            write_u8(out, u8::from(*b));
        }
        Obj::Int(i) => {
            write_u8(out, 2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Obj::Float(f) => {
            write_u8(out, 3);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Obj::Str(s) => {
            write_u8(out, 4);
            write_string(out, s);
        }
        Obj::Bytes(b) => {
            write_u8(out, 5);
            write_u32(out, b.len() as u32);
            out.extend_from_slice(b);
        }
        Obj::Tuple(items) => {
            write_u8(out, 6);
            ensure!(items.len() <= u32::MAX as usize, "tuple too large");
            write_u32(out, items.len() as u32);
            for item in items.iter() {
                encode_obj(out, item, depth + 1)?;
            }
        }
        Obj::Code(_) | Obj::Exception(_) => {
            bail!("cannot encode constant {} into BCTM", obj);
        }
    }
    Ok(())
}

fn decode_obj(bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Obj> {
    ensure!(depth < MAX_CONST_DEPTH, "constant nesting too deep");
    let tag = read_u8(bytes, cursor)?;
    Ok(match tag {
        0 => Obj::None,
        1 => Obj::Bool(read_u8(bytes, cursor)? != 0),
        2 => Obj::Int(i64::from_le_bytes(read_array(bytes, cursor)?)),
        3 => Obj::Float(f64::from_bits(u64::from_le_bytes(read_array(bytes, cursor)?))),
        4 => Obj::str(read_string(bytes, cursor)?),
        5 => {
            let len = read_u32(bytes, cursor)? as usize;
            ensure!(*cursor + len <= bytes.len(), "unexpected end of input while reading bytes");
            let data: Arc<[u8]> = Arc::from(&bytes[*cursor..*cursor + len]);
            *cursor += len;
            Obj::Bytes(data)
        }
        6 => {
            let len = read_u32(bytes, cursor)? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(decode_obj(bytes, cursor, depth + 1)?);
            }
            Obj::tuple(items)
        }
        other => bail!("unknown value tag {}", other),
    })
}

fn write_section(out: &mut Vec<u8>, tag: [u8; 4], payload: &[u8]) {
    out.extend_from_slice(&tag);
    write_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

fn read_array<const N: usize>(bytes: &[u8], cursor: &mut usize) -> Result<[u8; N]> {
    if *cursor + N > bytes.len() {
        bail!("unexpected end of input while reading {} bytes", N);
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[*cursor..*cursor + N]);
    *cursor += N;
    Ok(buf)
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    Ok(read_array::<1>(bytes, cursor)?[0])
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(bytes, cursor)?))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(bytes, cursor)?))
}

fn read_string(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u32(bytes, cursor)? as usize;
    if *cursor + len > bytes.len() {
        bail!("unexpected end of input while reading string");
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    String::from_utf8(slice.to_vec()).context("invalid UTF-8 in string")
}

fn read_tag(bytes: &[u8], cursor: &mut usize) -> Result<[u8; 4]> {
    read_array(bytes, cursor).context("reading section tag")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ModuleBuilder, opcode};
    use crate::tree::build_tree;

    fn nested(format: BytecodeFormat) -> Arc<RawCode> {
        let mb = ModuleBuilder::new("pkg/mod.py", format).unwrap();
        let inner = {
            let mut f = mb.function("inner").unwrap();
            f.pos_arg("x").unwrap();
            f.load_fast(0).return_value();
            f.finish()
        };
        let outer = {
            let mut f = mb.function("outer").unwrap();
            f.cell(0).unwrap();
            f.make_closure(inner, 1, false).return_value();
            f.finish()
        };
        let mut f = mb.module_function().unwrap();
        f.make_function(outer, false);
        f.op_qstr(opcode::STORE_NAME, "outer").unwrap();
        f.line(3)
            .load_const_obj(Obj::tuple([Obj::Float(2.5), Obj::str("s"), Obj::Bytes(Arc::from(&b"\x00\xff"[..]))]))
            .return_value();
        f.finish()
    }

    fn shape(entry: &Arc<RawCode>) -> Vec<(String, Vec<(usize, u32, &'static str, Option<i64>, Box<[u8]>)>)> {
        let (tree, _) = build_tree(entry);
        tree.iter()
            .map(|(path, instrs)| {
                let rows = instrs
                    .iter()
                    .map(|i| (i.offset, i.line, i.name, i.arg, i.raw.clone()))
                    .collect();
                (path.to_string(), rows)
            })
            .collect()
    }

    #[test]
    fn round_trip_preserves_tree() {
        let entry = nested(BytecodeFormat::default());
        let module = BytecodeModule::new(entry.clone());
        let bytes = encode_module(&module).expect("encode");
        let decoded = decode_module(&bytes).expect("decode");

        assert_eq!(decoded.version, CURRENT_VERSION);
        assert_eq!(decoded.format, BytecodeFormat::default());
        assert_eq!(decoded.qstrs.names(), module.qstrs.names());
        assert_ne!(decoded.entry.id(), entry.id());
        assert_eq!(shape(&decoded.entry), shape(&entry));
        assert_eq!(decoded.entry.consts().len(), entry.consts().len());
        match &decoded.entry.consts()[1] {
            ConstEntry::Obj(obj) => assert_eq!(obj.to_string(), "(2.5, 's', b'\\x00\\xff')"),
            other => panic!("unexpected constant {other:?}"),
        }
    }

    #[test]
    fn format_travels_in_header() {
        let format = BytecodeFormat {
            persistent_code: false,
            map_lookup_cache: true,
        };
        let entry = nested(format);
        let bytes = encode_module(&BytecodeModule::new(entry.clone())).unwrap();
        let decoded = decode_module(&bytes).unwrap();
        assert_eq!(decoded.format, format);
        assert_eq!(decoded.entry.format(), format);
        assert_eq!(shape(&decoded.entry), shape(&entry));
    }

    #[test]
    fn meta_round_trip() {
        let meta = ModuleMeta {
            name: Some("__main__".to_string()),
            source: Some("pkg/mod.py".to_string()),
            tags: BTreeMap::from([("compiler".to_string(), "test".to_string())]),
        };
        let module = BytecodeModule::new(nested(BytecodeFormat::default())).with_meta(meta.clone());
        let decoded = decode_module(&encode_module(&module).unwrap()).unwrap();
        assert_eq!(decoded.meta, Some(meta));

        let bare = BytecodeModule::new(nested(BytecodeFormat::default())).with_meta(ModuleMeta::default());
        let decoded = decode_module(&encode_module(&bare).unwrap()).unwrap();
        assert_eq!(decoded.meta, None);
    }

    #[test]
    fn shared_code_is_stored_once() {
        let mb = ModuleBuilder::new("m.py", BytecodeFormat::default()).unwrap();
        let shared = mb.function("shared").unwrap().finish();
        let mut f = mb.module_function().unwrap();
        f.make_function(shared.clone(), false).make_function(shared, false);
        let entry = f.finish();

        let order = children_first(&entry);
        assert_eq!(order.len(), 2);
        assert_eq!(order[1].id(), entry.id());

        let decoded = decode_module(&encode_module(&BytecodeModule::new(entry)).unwrap()).unwrap();
        let children: Vec<_> = decoded.entry.children().collect();
        assert_eq!(children.len(), 2);
        assert!(Arc::ptr_eq(children[0], children[1]));
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(decode_module(b"BCTM").is_err());
        let err = decode_module(b"LKRB\x01\x00\x00\x00\x00\x00\x00\x00").unwrap_err();
        assert!(err.to_string().contains("magic"));

        let mut bytes = encode_module(&BytecodeModule::new(nested(BytecodeFormat::default()))).unwrap();
        bytes[4..6].copy_from_slice(&(CURRENT_VERSION + 1).to_le_bytes());
        let err = decode_module(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported BCTM version"));
    }

    #[test]
    fn rejects_truncated_and_missing_sections() {
        let bytes = encode_module(&BytecodeModule::new(nested(BytecodeFormat::default()))).unwrap();
        assert!(decode_module(&bytes[..bytes.len() - 1]).is_err());

        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC);
        write_u16(&mut header, CURRENT_VERSION);
        write_u16(&mut header, 0);
        write_u32(&mut header, 0);
        let err = decode_module(&header).unwrap_err();
        assert!(err.to_string().contains("missing QSTR"));

        let mut qstr_only = header.clone();
        let mut names = Vec::new();
        write_u32(&mut names, 0);
        write_section(&mut qstr_only, *b"QSTR", &names);
        let err = decode_module(&qstr_only).unwrap_err();
        assert!(err.to_string().contains("missing CODE"));

        let mut twice = qstr_only.clone();
        write_section(&mut twice, *b"QSTR", &names);
        assert!(decode_module(&twice).unwrap_err().to_string().contains("duplicate QSTR"));
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let mut bytes = encode_module(&BytecodeModule::new(nested(BytecodeFormat::default()))).unwrap();
        write_section(&mut bytes, *b"XTRA", b"whatever");
        assert!(decode_module(&bytes).is_ok());
    }

    #[test]
    fn forward_code_reference_is_rejected() {
        let mut payload = Vec::new();
        write_u32(&mut payload, 1);
        write_u32(&mut payload, 0);
        write_u32(&mut payload, 1);
        write_u8(&mut payload, CONST_CODE);
        write_u32(&mut payload, 0);
        let pool = Arc::new(QstrPool::new());
        let err = decode_functions(&payload, &pool, BytecodeFormat::default()).unwrap_err();
        assert!(err.to_string().contains("not defined before it"));
    }

    #[test]
    fn code_handles_cannot_be_constants() {
        let mb = ModuleBuilder::new("m.py", BytecodeFormat::default()).unwrap();
        let mut f = mb.module_function().unwrap();
        f.load_const_obj(Obj::Code(CodeId::next()));
        let err = encode_module(&BytecodeModule::new(f.finish())).unwrap_err();
        assert!(err.to_string().contains("cannot encode constant"));
    }

    #[test]
    fn foreign_pool_is_rejected() {
        let other = ModuleBuilder::new("other.py", BytecodeFormat::default()).unwrap();
        let child = other.function("child").unwrap().finish();
        let mb = ModuleBuilder::new("m.py", BytecodeFormat::default()).unwrap();
        let mut f = mb.module_function().unwrap();
        f.make_function(child, false);
        let err = encode_module(&BytecodeModule::new(f.finish())).unwrap_err();
        assert!(err.to_string().contains("qstr pool"));
    }

    fn nested_tuple(levels: usize) -> Obj {
        (0..levels).fold(Obj::Int(7), |inner, _| Obj::tuple([inner]))
    }

    #[test]
    fn deeply_nested_constant_is_an_error() {
        let mut payload = Vec::with_capacity(2_000_000 * 5 + 1);
        for _ in 0..2_000_000 {
            payload.push(6);
            payload.extend_from_slice(&1u32.to_le_bytes());
        }
        payload.push(0);
        let err = decode_obj(&payload, &mut 0, 0).unwrap_err();
        assert!(err.to_string().contains("constant nesting too deep"));
    }

    #[test]
    fn constant_nesting_limit() {
        let ok = nested_tuple(MAX_CONST_DEPTH - 1);
        let mut bytes = Vec::new();
        encode_obj(&mut bytes, &ok, 0).unwrap();
        assert_eq!(decode_obj(&bytes, &mut 0, 0).unwrap(), ok);

        let err = encode_obj(&mut Vec::new(), &nested_tuple(MAX_CONST_DEPTH), 0).unwrap_err();
        assert!(err.to_string().contains("constant nesting too deep"));
    }
}
