//! Target module model and its text serializer.
//!
//! Functions, globals, the indirect-call table and the constant data pool
//! live here. The backend fills the module in; `to_wat` renders the final
//! text form.

use indexmap::IndexMap;
use std::fmt::Write as _;

use super::inst::{Callee, Imm, Inst, RuntimeFn, StackType};

/// Index into the module's flat function space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Signature used by `call_indirect` dispatch and by imports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncSig {
    pub params: Vec<StackType>,
    pub results: Vec<StackType>,
}

#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    /// Import module name, when the function body lives elsewhere.
    pub import_from: Option<String>,
    pub params: Vec<StackType>,
    pub results: Vec<StackType>,
    pub locals: Vec<StackType>,
    pub body: Vec<Inst>,
    /// Export name, when the function is part of the module's surface.
    pub export_as: Option<String>,
}

impl Func {
    fn placeholder(name: String) -> Func {
        Func {
            name,
            import_from: None,
            params: Vec::new(),
            results: Vec::new(),
            locals: Vec::new(),
            body: Vec::new(),
            export_as: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: StackType,
    pub mutable: bool,
    pub init: Imm,
}

/// A target module under construction.
#[derive(Debug, Default)]
pub struct Module {
    funcs: Vec<Func>,
    globals: Vec<Global>,
    func_table: Vec<FuncId>,
    sigs: IndexMap<FuncSig, ()>,
    data: Vec<u8>,
    strings: IndexMap<String, u32>,
    binaries: IndexMap<Vec<u8>, u32>,
    reserved: u32,
}

impl Module {
    pub fn new() -> Module {
        let mut m = Module::default();
        // Keep offset zero unused so that a zero address can act as null.
        m.data.resize(8, 0);
        m
    }

    /// Reserves a function slot. The body is filled in later via
    /// [`Module::set_func`], so functions may call each other regardless of
    /// declaration order.
    pub fn declare_func(&mut self, name: String) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(Func::placeholder(name));
        id
    }

    pub fn set_func(&mut self, id: FuncId, f: Func) {
        self.funcs[id.index()] = f;
    }

    pub fn func_name(&self, id: FuncId) -> &str {
        &self.funcs[id.index()].name
    }

    pub fn func(&self, id: FuncId) -> &Func {
        &self.funcs[id.index()]
    }

    pub fn add_import(&mut self, from: &str, name: String, sig: FuncSig) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(Func {
            name,
            import_from: Some(from.to_string()),
            params: sig.params,
            results: sig.results,
            locals: Vec::new(),
            body: Vec::new(),
            export_as: None,
        });
        id
    }

    pub fn add_global(&mut self, name: String, ty: StackType, mutable: bool, init: Imm) -> u32 {
        self.globals.push(Global {
            name,
            ty,
            mutable,
            init,
        });
        (self.globals.len() - 1) as u32
    }

    /// Patches a global's initializer. The heap-base global can only be
    /// computed once the data segment is complete.
    pub fn set_global_init(&mut self, index: u32, init: Imm) {
        self.globals[index as usize].init = init;
    }

    /// Appends a function to the indirect-call table and returns its slot.
    pub fn add_func_to_table(&mut self, f: FuncId) -> u32 {
        self.func_table.push(f);
        (self.func_table.len() - 1) as u32
    }

    pub fn table_len(&self) -> u32 {
        self.func_table.len() as u32
    }

    /// Interns a signature for `call_indirect` and returns its type index.
    pub fn add_sig(&mut self, sig: FuncSig) -> u32 {
        let (idx, _) = self.sigs.insert_full(sig, ());
        idx as u32
    }

    /// Interns a string into the constant pool. The record is a 4-byte
    /// little-endian length followed by the UTF-8 bytes. Identical strings
    /// share one record.
    pub fn add_string(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.strings.get(s) {
            return off;
        }
        self.align_data(4);
        let off = self.data.len() as u32;
        self.data
            .extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.data.extend_from_slice(s.as_bytes());
        self.strings.insert(s.to_string(), off);
        off
    }

    /// Interns a pre-encoded binary blob, deduplicated by content.
    pub fn add_binary(&mut self, bytes: &[u8]) -> u32 {
        if let Some(&off) = self.binaries.get(bytes) {
            return off;
        }
        self.align_data(8);
        let off = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        self.binaries.insert(bytes.to_vec(), off);
        off
    }

    /// Reserves a zero-initialized region in linear memory for a mutable
    /// global that does not fit a scalar global slot.
    pub fn add_zeroed(&mut self, size: u32, align: u32) -> u32 {
        self.align_data(align.max(1));
        let off = self.data.len() as u32;
        self.data.resize(self.data.len() + size as usize, 0);
        off
    }

    /// Size of the constant data segment, rounded up to 8 bytes. Everything
    /// above this address belongs to the stack and heap at run time.
    pub fn text_size(&self) -> u32 {
        (self.data.len() as u32 + 7) & !7
    }

    /// Memory to set aside above the data segment for the run-time stack
    /// and heap. Affects the initial page count only.
    pub fn reserve_memory(&mut self, bytes: u32) {
        self.reserved = bytes;
    }

    fn align_data(&mut self, align: u32) {
        let len = (self.data.len() as u32 + align - 1) & !(align - 1);
        self.data.resize(len as usize, 0);
    }

    fn runtime_sig(f: RuntimeFn) -> FuncSig {
        use StackType::I32;
        let (params, results): (&[StackType], &[StackType]) = match f {
            // Every runtime entry point takes the shadow stack pointer as
            // its last argument.
            RuntimeFn::Copy => (&[I32, I32, I32, I32], &[]),
            RuntimeFn::MemZero => (&[I32, I32, I32], &[]),
            RuntimeFn::Alloc => (&[I32, I32, I32, I32], &[I32]),
            RuntimeFn::InitializeMemory => (&[I32], &[I32]),
            RuntimeFn::StartHostCoroutine => (&[I32], &[I32]),
            RuntimeFn::FinishHostCoroutine => (&[I32], &[]),
            RuntimeFn::CreateCoroutine => (&[I32], &[I32]),
            RuntimeFn::ScheduleCoroutine => (&[I32, I32], &[]),
            RuntimeFn::CurrentCoroutine => (&[I32], &[I32]),
            RuntimeFn::CreateMap => (&[I32], &[I32]),
            RuntimeFn::SetMap => (&[I32, I32, I32], &[I32]),
            RuntimeFn::LookupMap => (&[I32, I32, I32], &[I32]),
            RuntimeFn::RemoveMapKey => (&[I32, I32, I32], &[I32]),
            RuntimeFn::HashString => (&[I32, I32], &[StackType::I64]),
            RuntimeFn::SetNumericMap => (&[I32, StackType::I64, I32], &[I32]),
            RuntimeFn::LookupNumericMap => (&[I32, StackType::I64, I32], &[I32]),
            RuntimeFn::RemoveNumericMapKey => (&[I32, StackType::I64, I32], &[I32]),
            RuntimeFn::DecodeUtf8 => (&[I32, I32, I32, I32], &[I32]),
        };
        FuncSig {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    /// Runtime functions referenced anywhere in the module, in first-use
    /// order. These become imports from the runtime.
    fn used_runtime_fns(&self) -> IndexMap<RuntimeFn, ()> {
        let mut used = IndexMap::new();
        for f in &self.funcs {
            for inst in &f.body {
                if let Inst::Call(Callee::Runtime(r)) = inst {
                    used.entry(*r).or_insert(());
                }
            }
        }
        used
    }

    /// Renders the whole module as text.
    pub fn to_wat(&self) -> String {
        let mut out = String::new();
        out.push_str("(module\n");

        for (r, _) in self.used_runtime_fns() {
            let sig = Module::runtime_sig(r);
            let mut line = format!("  (import \"runtime\" \"{}\" (func {}", &r.name()[1..], r.name());
            for p in &sig.params {
                let _ = write!(line, " (param {})", p);
            }
            for res in &sig.results {
                let _ = write!(line, " (result {})", res);
            }
            line.push_str("))\n");
            out.push_str(&line);
        }
        for f in &self.funcs {
            if let Some(from) = &f.import_from {
                let mut line = format!("  (import \"{}\" \"{}\" (func ${}", from, f.name, f.name);
                for p in &f.params {
                    let _ = write!(line, " (param {})", p);
                }
                for r in &f.results {
                    let _ = write!(line, " (result {})", r);
                }
                line.push_str("))\n");
                out.push_str(&line);
            }
        }

        let pages = (self.text_size() + self.reserved).div_ceil(65536).max(1);
        let _ = writeln!(out, "  (memory (export \"memory\") {})", pages);

        for (i, sig) in self.sigs.keys().enumerate() {
            let mut line = format!("  (type $t{} (func", i);
            for p in &sig.params {
                let _ = write!(line, " (param {})", p);
            }
            for r in &sig.results {
                let _ = write!(line, " (result {})", r);
            }
            line.push_str("))\n");
            out.push_str(&line);
        }

        for g in &self.globals {
            if g.mutable {
                let _ = writeln!(
                    out,
                    "  (global ${} (mut {}) ({}.const {}))",
                    g.name, g.ty, g.ty, g.init
                );
            } else {
                let _ = writeln!(
                    out,
                    "  (global ${} {} ({}.const {}))",
                    g.name, g.ty, g.ty, g.init
                );
            }
        }

        if !self.func_table.is_empty() {
            let _ = writeln!(out, "  (table {} anyfunc)", self.func_table.len());
            let mut line = "  (elem (i32.const 0)".to_string();
            for f in &self.func_table {
                let _ = write!(line, " ${}", self.funcs[f.index()].name);
            }
            line.push_str(")\n");
            out.push_str(&line);
        }

        for f in &self.funcs {
            if f.import_from.is_some() {
                continue;
            }
            self.render_func(f, &mut out);
        }

        if self.data.len() > 8 {
            let mut line = "  (data (i32.const 0) \"".to_string();
            for &b in &self.data {
                match b {
                    b'"' => line.push_str("\\\""),
                    b'\\' => line.push_str("\\\\"),
                    0x20..=0x7e => line.push(b as char),
                    _ => {
                        let _ = write!(line, "\\{:02x}", b);
                    }
                }
            }
            line.push_str("\")\n");
            out.push_str(&line);
        }

        out.push_str(")\n");
        out
    }

    fn render_func(&self, f: &Func, out: &mut String) {
        let mut head = format!("  (func ${}", f.name);
        if let Some(export) = &f.export_as {
            let _ = write!(head, " (export \"{}\")", export);
        }
        for p in &f.params {
            let _ = write!(head, " (param {})", p);
        }
        for r in &f.results {
            let _ = write!(head, " (result {})", r);
        }
        out.push_str(&head);
        out.push('\n');
        for l in &f.locals {
            let _ = writeln!(out, "    (local {})", l);
        }
        let mut depth: usize = 2;
        for inst in &f.body {
            if matches!(inst, Inst::End) {
                depth = depth.saturating_sub(1);
            }
            let indent = if matches!(inst, Inst::Else) {
                depth - 1
            } else {
                depth
            };
            for _ in 0..indent {
                out.push_str("  ");
            }
            self.render_inst(inst, out);
            out.push('\n');
            if matches!(inst, Inst::Block | Inst::Loop | Inst::If) {
                depth += 1;
            }
        }
        out.push_str("  )\n");
    }

    fn render_inst(&self, inst: &Inst, out: &mut String) {
        match inst {
            Inst::Const(ty, imm) => {
                let _ = write!(out, "{}.const {}", ty, imm);
            }
            Inst::GetLocal(i) => {
                let _ = write!(out, "get_local {}", i);
            }
            Inst::SetLocal(i) => {
                let _ = write!(out, "set_local {}", i);
            }
            Inst::TeeLocal(i) => {
                let _ = write!(out, "tee_local {}", i);
            }
            Inst::GetGlobal(i) => {
                let _ = write!(out, "get_global ${}", self.globals[*i as usize].name);
            }
            Inst::SetGlobal(i) => {
                let _ = write!(out, "set_global ${}", self.globals[*i as usize].name);
            }
            Inst::Load { ty, width, offset } => {
                let _ = write!(out, "{}.load", ty);
                if let Some(w) = width {
                    out.push_str(w.suffix());
                }
                if *offset != 0 {
                    let _ = write!(out, " offset={}", offset);
                }
            }
            Inst::Store { ty, width, offset } => {
                let _ = write!(out, "{}.store", ty);
                if let Some(w) = width {
                    out.push_str(w.suffix());
                }
                if *offset != 0 {
                    let _ = write!(out, " offset={}", offset);
                }
            }
            Inst::Binary(ty, op) => {
                let _ = write!(out, "{}.{}", ty, op.mnemonic());
            }
            Inst::Unary(ty, op) => {
                let _ = write!(out, "{}.{}", ty, op.mnemonic());
            }
            Inst::Block => out.push_str("block"),
            Inst::Loop => out.push_str("loop"),
            Inst::If => out.push_str("if"),
            Inst::Else => out.push_str("else"),
            Inst::End => out.push_str("end"),
            Inst::Br(n) => {
                let _ = write!(out, "br {}", n);
            }
            Inst::BrIf(n) => {
                let _ = write!(out, "br_if {}", n);
            }
            Inst::BrTable(targets) => {
                out.push_str("br_table");
                for t in targets {
                    let _ = write!(out, " {}", t);
                }
            }
            Inst::Call(Callee::Index(i)) => {
                let _ = write!(out, "call ${}", self.funcs[*i as usize].name);
            }
            Inst::Call(Callee::Runtime(r)) => {
                let _ = write!(out, "call {}", r.name());
            }
            Inst::CallIndirect(ty) => {
                let _ = write!(out, "call_indirect (type $t{})", ty);
            }
            Inst::Return => out.push_str("return"),
            Inst::Drop => out.push_str("drop"),
            Inst::Unreachable => out.push_str("unreachable"),
            Inst::Wrap => out.push_str("i32.wrap/i64"),
            Inst::Extend { signed } => {
                out.push_str(if *signed {
                    "i64.extend_s/i32"
                } else {
                    "i64.extend_u/i32"
                });
            }
            Inst::Promote => out.push_str("f64.promote/f32"),
            Inst::Demote => out.push_str("f32.demote/f64"),
            Inst::Trunc { to, from, signed } => {
                let _ = write!(
                    out,
                    "{}.trunc_{}/{}",
                    to,
                    if *signed { "s" } else { "u" },
                    from
                );
            }
            Inst::Convert { to, from, signed } => {
                let _ = write!(
                    out,
                    "{}.convert_{}/{}",
                    to,
                    if *signed { "s" } else { "u" },
                    from
                );
            }
            Inst::CurrentMemory => out.push_str("current_memory"),
            Inst::GrowMemory => out.push_str("grow_memory"),
            Inst::Comment(text) => {
                let _ = write!(out, ";; {}", text);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/t_module.rs"]
mod t_module;
