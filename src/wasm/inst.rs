//! Target instruction set.
//!
//! A flat, closed instruction enum for the structured wasm32-style target,
//! plus the scalar stack types and the operator mnemonic tables shared with
//! the IR.

use std::fmt;

/// A type that can live on the target's value stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackType {
    I32,
    I64,
    F32,
    F64,
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackType::I32 => "i32",
            StackType::I64 => "i64",
            StackType::F32 => "f32",
            StackType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// Width suffix for narrow loads. Sub-word loads pick sign or zero extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadWidth {
    W8S,
    W8U,
    W16S,
    W16U,
    W32S,
    W32U,
}

impl LoadWidth {
    pub fn suffix(self) -> &'static str {
        match self {
            LoadWidth::W8S => "8_s",
            LoadWidth::W8U => "8_u",
            LoadWidth::W16S => "16_s",
            LoadWidth::W16U => "16_u",
            LoadWidth::W32S => "32_s",
            LoadWidth::W32U => "32_u",
        }
    }
}

/// Width suffix for narrow stores. Stores truncate, so no signedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWidth {
    W8,
    W16,
    W32,
}

impl StoreWidth {
    pub fn suffix(self) -> &'static str {
        match self {
            StoreWidth::W8 => "8",
            StoreWidth::W16 => "16",
            StoreWidth::W32 => "32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    Eq,
    Ne,
    LtS,
    LtU,
    LeS,
    LeU,
    GtS,
    GtU,
    GeS,
    GeU,
    Lt,
    Le,
    Gt,
    Ge,
    Min,
    Max,
    Copysign,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::DivS => "div_s",
            BinOp::DivU => "div_u",
            BinOp::RemS => "rem_s",
            BinOp::RemU => "rem_u",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::ShrS => "shr_s",
            BinOp::ShrU => "shr_u",
            BinOp::Rotl => "rotl",
            BinOp::Rotr => "rotr",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::LtS => "lt_s",
            BinOp::LtU => "lt_u",
            BinOp::LeS => "le_s",
            BinOp::LeU => "le_u",
            BinOp::GtS => "gt_s",
            BinOp::GtU => "gt_u",
            BinOp::GeS => "ge_s",
            BinOp::GeU => "ge_u",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Copysign => "copysign",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Eqz,
    Clz,
    Ctz,
    Popcnt,
    Neg,
    Abs,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
}

impl UnOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            UnOp::Eqz => "eqz",
            UnOp::Clz => "clz",
            UnOp::Ctz => "ctz",
            UnOp::Popcnt => "popcnt",
            UnOp::Neg => "neg",
            UnOp::Abs => "abs",
            UnOp::Ceil => "ceil",
            UnOp::Floor => "floor",
            UnOp::Trunc => "trunc",
            UnOp::Nearest => "nearest",
            UnOp::Sqrt => "sqrt",
        }
    }
}

/// Runtime support functions linked into every module. The backend calls
/// them by name; the runtime provides the implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    Copy,
    MemZero,
    Alloc,
    InitializeMemory,
    StartHostCoroutine,
    FinishHostCoroutine,
    CreateCoroutine,
    ScheduleCoroutine,
    CurrentCoroutine,
    CreateMap,
    SetMap,
    LookupMap,
    RemoveMapKey,
    HashString,
    SetNumericMap,
    LookupNumericMap,
    RemoveNumericMapKey,
    DecodeUtf8,
}

impl RuntimeFn {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeFn::Copy => "$copy",
            RuntimeFn::MemZero => "$memZero",
            RuntimeFn::Alloc => "$alloc",
            RuntimeFn::InitializeMemory => "$initializeMemory",
            RuntimeFn::StartHostCoroutine => "$startHostCoroutine",
            RuntimeFn::FinishHostCoroutine => "$finishHostCoroutine",
            RuntimeFn::CreateCoroutine => "$createCoroutine",
            RuntimeFn::ScheduleCoroutine => "$scheduleCoroutine",
            RuntimeFn::CurrentCoroutine => "$currentCoroutine",
            RuntimeFn::CreateMap => "$createMap",
            RuntimeFn::SetMap => "$setMap",
            RuntimeFn::LookupMap => "$lookupMap",
            RuntimeFn::RemoveMapKey => "$removeMapKey",
            RuntimeFn::HashString => "$hashString",
            RuntimeFn::SetNumericMap => "$setNumericMap",
            RuntimeFn::LookupNumericMap => "$lookupNumericMap",
            RuntimeFn::RemoveNumericMapKey => "$removeNumericMapKey",
            RuntimeFn::DecodeUtf8 => "$decodeUtf8",
        }
    }
}

/// A call target: a function in the module's index space or a runtime
/// support function referenced by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Index(u32),
    Runtime(RuntimeFn),
}

/// Immediate payload of a `const` instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imm {
    Int(i64),
    Float(f64),
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::Int(v) => write!(f, "{}", v),
            Imm::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One target instruction. Structured constructs are bracketed by
/// `Block`/`Loop`/`If` ... `End`, exactly as they serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Const(StackType, Imm),
    GetLocal(u32),
    SetLocal(u32),
    TeeLocal(u32),
    GetGlobal(u32),
    SetGlobal(u32),
    Load {
        ty: StackType,
        width: Option<LoadWidth>,
        offset: u32,
    },
    Store {
        ty: StackType,
        width: Option<StoreWidth>,
        offset: u32,
    },
    Binary(StackType, BinOp),
    Unary(StackType, UnOp),
    Block,
    Loop,
    If,
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable(Vec<u32>),
    Call(Callee),
    CallIndirect(u32),
    Return,
    Drop,
    Unreachable,
    Wrap,
    Extend {
        signed: bool,
    },
    Promote,
    Demote,
    Trunc {
        to: StackType,
        from: StackType,
        signed: bool,
    },
    Convert {
        to: StackType,
        from: StackType,
        signed: bool,
    },
    CurrentMemory,
    GrowMemory,
    Comment(String),
}

impl Inst {
    pub fn i32_const(v: i64) -> Inst {
        Inst::Const(StackType::I32, Imm::Int(v))
    }
}
