use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use bctrace_core::{
    bytecode::{RawCode, line_table},
    config::BytecodeFormat,
    container::{BytecodeModule, ModuleMeta, decode_module, encode_module},
    demo,
    render::render_bytecode,
    tree::build_tree,
};


static LOG_INIT: Once = Once::new();
const DEFAULT_LOG_FILTER: &str = "bctrace=info,bctrace_cli=info";
const TICK_TARGET: &str = "bctrace::tick";

#[derive(Debug, Parser)]
#[command(
    name = "bctrace",
    author,
    version,
    about = "Inspect compiled bytecode module containers",
    long_about = None
)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the instruction tree of a module container.
    Dump {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
        /// Emit JSON records `[offset, line, name, arg, argval, cache, raw]`
        #[arg(long)]
        json: bool,
        /// Only print the function at this tree path (e.g. `<module>/f`)
        #[arg(long, value_name = "PATH")]
        path: Option<String>,
    },
    /// Print every function's prelude and line table.
    Inspect {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
    },
    /// Write the bundled sample program as a module container.
    Demo {
        #[arg(value_name = "OUT", value_parser = parse_sanitized_path)]
        out: PathBuf,
        #[command(flatten)]
        format: FormatArgs,
    },
}

#[derive(Debug, Default, Args)]
struct FormatArgs {
    /// TOML file with a `[format]` table
    #[arg(long, value_name = "FILE", value_parser = parse_sanitized_path)]
    config: Option<PathBuf>,
    /// Override `persistent_code` from the config
    #[arg(long, value_name = "BOOL")]
    persistent_code: Option<bool>,
    /// Override `map_lookup_cache` from the config
    #[arg(long, value_name = "BOOL")]
    map_lookup_cache: Option<bool>,
}

impl FormatArgs {
    fn resolve(&self) -> anyhow::Result<BytecodeFormat> {
        let mut format = match &self.config {
            Some(path) => BytecodeFormat::load_toml(path)?,
            None => BytecodeFormat::default(),
        };
        if let Some(on) = self.persistent_code {
            format.persistent_code = on;
        }
        if let Some(on) = self.map_lookup_cache {
            format.map_lookup_cache = on;
        }
        Ok(format)
    }
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);
    if p.components().any(|comp| matches!(comp, Component::ParentDir)) {
        anyhow::bail!("Parent directory components ('..') are not allowed in file paths.");
    }
    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

/// Filter for a `BCTRACE_LOG` value, or `None` when logging stays off.
///
/// `1`/`on` uses `RUST_LOG` or the default, a bare level applies to every
/// `bctrace::*` target, `ticks` adds per-instruction tick events, anything
/// else is taken as an `EnvFilter` expression.
fn log_filter_for(raw: &str, rust_log: Option<String>) -> Option<String> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "" | "0" | "false" | "off" => None,
        "1" | "true" | "on" => Some(rust_log.unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())),
        "error" | "warn" | "info" | "debug" | "trace" => Some(format!("bctrace={value},bctrace_cli={value}")),
        "ticks" => Some(format!("{DEFAULT_LOG_FILTER},{TICK_TARGET}=trace")),
        _ => Some(raw.trim().to_string()),
    }
}

fn maybe_init_logging() {
    let Ok(raw) = std::env::var("BCTRACE_LOG") else {
        return;
    };
    let Some(expr) = log_filter_for(&raw, std::env::var("RUST_LOG").ok()) else {
        return;
    };

    LOG_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter = EnvFilter::try_new(&expr).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let _ = fmt().with_writer(std::io::stderr).with_env_filter(filter).try_init();
    });
}

fn read_module(path: &Path) -> anyhow::Result<BytecodeModule> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read file '{}'", path.display()))?;
    decode_module(&bytes).with_context(|| format!("'{}' is not a valid module container", path.display()))
}

fn dump(path: &Path, json: bool, only: Option<&str>, out: &mut impl Write) -> anyhow::Result<()> {
    let module = read_module(path)?;
    let (tree, _) = build_tree(&module.entry);

    if let Some(p) = only {
        let instrs = tree.get(p).with_context(|| format!("no function at path '{}'", p))?;
        if json {
            serde_json::to_writer_pretty(&mut *out, instrs)?;
            writeln!(out)?;
        } else {
            write!(out, "{}", render_bytecode(p, instrs))?;
        }
        return Ok(());
    }

    if json {
        serde_json::to_writer_pretty(&mut *out, &tree)?;
        writeln!(out)?;
        return Ok(());
    }

    if let Some(meta) = &module.meta {
        writeln!(
            out,
            "# module {} from {}",
            meta.name.as_deref().unwrap_or("?"),
            meta.source.as_deref().unwrap_or("?")
        )?;
    }
    for (p, instrs) in tree.iter() {
        write!(out, "{}", render_bytecode(p, instrs))?;
    }
    Ok(())
}

/// Every function reachable from the entry, keyed by tree path.
fn functions_by_path(entry: &Arc<RawCode>) -> BTreeMap<Arc<str>, Arc<RawCode>> {
    let (_, index) = build_tree(entry);
    let mut out = BTreeMap::new();
    let mut stack = vec![entry.clone()];
    while let Some(code) = stack.pop() {
        if let Some(path) = index.get(code.id())
            && !out.contains_key(path)
        {
            out.insert(path.clone(), code.clone());
            stack.extend(code.children().cloned());
        }
    }
    out
}

fn inspect(path: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    let module = read_module(path)?;
    writeln!(
        out,
        "format: persistent_code={} map_lookup_cache={}",
        module.format.persistent_code, module.format.map_lookup_cache
    )?;

    for (p, code) in functions_by_path(&module.entry) {
        writeln!(out, "{}", p)?;
        let buf = code.bytecode();
        let Some(prelude) = code.prelude() else {
            writeln!(out, "  <truncated prelude>")?;
            continue;
        };
        let qstrs = code.qstrs();
        writeln!(
            out,
            "  n_state={} n_exc_stack={} scope_flags={:#04x}",
            prelude.n_state, prelude.n_exc_stack, prelude.scope_flags
        )?;
        writeln!(
            out,
            "  args: pos={} kwonly={} defaults={}",
            prelude.n_pos_args, prelude.n_kwonly_args, prelude.n_def_pos_args
        )?;
        writeln!(
            out,
            "  block_name={} source_file={}",
            qstrs.resolve(prelude.block_name),
            qstrs.resolve(prelude.source_file)
        )?;
        writeln!(out, "  cells={:?}", prelude.cell_locals(buf))?;
        writeln!(
            out,
            "  code_info={:#06x} size={} bytecode={:#06x} len={}",
            prelude.code_info,
            prelude.code_info_size,
            prelude.bytecode,
            buf.len().saturating_sub(prelude.bytecode)
        )?;

        let (mut offset, mut line) = (0usize, line_table::FIRST_LINE as usize);
        writeln!(out, "  lines: {:#06x} => {}", offset, line)?;
        for entry in line_table::entries(prelude.line_table(buf)) {
            offset += entry.byte_delta;
            line += entry.line_delta;
            writeln!(out, "  lines: {:#06x} => {}", offset, line)?;
        }
    }
    Ok(())
}

fn write_demo(out_path: &Path, format: BytecodeFormat) -> anyhow::Result<usize> {
    let entry = demo::demo_module(format)?;
    let meta = ModuleMeta {
        name: Some("__main__".to_string()),
        source: Some(demo::DEMO_FILE.to_string()),
        tags: BTreeMap::new(),
    };
    let bytes = encode_module(&BytecodeModule::new(entry).with_meta(meta))?;
    std::fs::write(out_path, &bytes).with_context(|| format!("Failed to write '{}'", out_path.display()))?;
    info!(target: "bctrace::cli", path = %out_path.display(), bytes = bytes.len(), "demo.written");
    Ok(bytes.len())
}

fn main() -> anyhow::Result<()> {
    maybe_init_logging();

    let CliArgs { command } = CliArgs::parse();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match command {
        Commands::Dump { file, json, path } => dump(&file, json, path.as_deref(), &mut out)?,
        Commands::Inspect { file } => inspect(&file, &mut out)?,
        Commands::Demo { out: out_path, format } => {
            let format = format.resolve()?;
            let len = write_demo(&out_path, format)?;
            writeln!(out, "Wrote {} ({} bytes)", out_path.display(), len)?;
        }
    }
    Ok(())
}
