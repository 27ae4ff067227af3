//! Types carried by IR values.
//!
//! Scalars map one-to-one onto the target's stack types, with explicit
//! widths and signedness. Aggregates are laid out by the [`TypeTable`] with
//! natural alignment. Pointers are 4 bytes on this target.

use crate::wasm::StackType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    F32,
    F64,
    /// A linear-memory address.
    Addr,
    /// A typed pointer. Same representation as `Addr`, but the storage
    /// allocator treats pointer-typed variables as collector-visible.
    Ptr,
}

impl ScalarType {
    pub fn size(self) -> u32 {
        match self {
            ScalarType::U8 | ScalarType::S8 => 1,
            ScalarType::U16 | ScalarType::S16 => 2,
            ScalarType::U32
            | ScalarType::S32
            | ScalarType::F32
            | ScalarType::Addr
            | ScalarType::Ptr => 4,
            ScalarType::U64 | ScalarType::S64 | ScalarType::F64 => 8,
        }
    }

    pub fn align(self) -> u32 {
        self.size()
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarType::S8 | ScalarType::S16 | ScalarType::S32 | ScalarType::S64
        )
    }

    /// The stack type a value of this scalar type occupies once loaded.
    pub fn stack_type(self) -> StackType {
        match self {
            ScalarType::U8
            | ScalarType::S8
            | ScalarType::U16
            | ScalarType::S16
            | ScalarType::U32
            | ScalarType::S32
            | ScalarType::Addr
            | ScalarType::Ptr => StackType::I32,
            ScalarType::U64 | ScalarType::S64 => StackType::I64,
            ScalarType::F32 => StackType::F32,
            ScalarType::F64 => StackType::F64,
        }
    }
}

/// Index into the [`TypeTable`]'s struct arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the [`TypeTable`]'s function-type arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncTypeId(pub u32);

impl FuncTypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The type of an IR value: a scalar, or an aggregate kept in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    Scalar(ScalarType),
    Struct(TypeId),
}

impl ValType {
    pub fn as_scalar(self) -> Option<ScalarType> {
        match self {
            ValType::Scalar(s) => Some(s),
            ValType::Struct(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: ValType,
    /// Repeat count. A count above one models an inline array.
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: Option<String>,
    pub fields: Vec<Field>,
    offsets: Vec<u32>,
    size: u32,
    align: u32,
    finalized: bool,
}

/// Calling convention of a function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// Regular managed function: takes the stack pointer as a trailing
    /// parameter.
    Fyr,
    /// Coroutine-capable function: lowered to a resumable state machine.
    FyrCoroutine,
    /// Host function imported as-is; no stack pointer is passed.
    Native,
}

#[derive(Debug, Clone)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
    pub conv: CallConv,
}

impl FuncType {
    pub fn is_async(&self) -> bool {
        self.conv == CallConv::FyrCoroutine
    }
}

/// Intrinsics addressed by tag rather than by function index. Float
/// intrinsics lower to single instructions; the rest route to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysCall {
    Heap,
    CurrentMemory,
    GrowMemory,
    PageSize,
    DefaultStackSize,
    StackPointer,
    CreateMap,
    SetMap,
    LookupMap,
    RemoveMapKey,
    HashString,
    SetNumericMap,
    LookupNumericMap,
    RemoveNumericMapKey,
    DecodeUtf8,
    ContinueCoroutine,
    Coroutine,
    ScheduleCoroutine,
    Abs32,
    Abs64,
    Sqrt32,
    Sqrt64,
    Trunc32,
    Trunc64,
    Nearest32,
    Nearest64,
    Floor32,
    Floor64,
    Ceil32,
    Ceil64,
    Min32,
    Min64,
    Max32,
    Max64,
    Copysign32,
    Copysign64,
}

pub fn align_to(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Arena of struct layouts and function types, shared by the whole program.
#[derive(Debug, Default)]
pub struct TypeTable {
    structs: Vec<StructDef>,
    funcs: Vec<FuncType>,
}

impl TypeTable {
    pub fn new() -> TypeTable {
        TypeTable::default()
    }

    pub fn add_struct(&mut self, name: Option<String>) -> TypeId {
        self.structs.push(StructDef {
            name,
            fields: Vec::new(),
            offsets: Vec::new(),
            size: 0,
            align: 1,
            finalized: false,
        });
        TypeId(self.structs.len() as u32 - 1)
    }

    pub fn add_field(&mut self, id: TypeId, name: &str, ty: ValType, count: u32) -> usize {
        let def = &mut self.structs[id.index()];
        debug_assert!(!def.finalized);
        def.fields.push(Field {
            name: name.to_string(),
            ty,
            count,
        });
        def.fields.len() - 1
    }

    /// Computes field offsets with natural alignment. Nested struct fields
    /// are finalized first.
    pub fn finalize_struct(&mut self, id: TypeId) {
        if self.structs[id.index()].finalized {
            return;
        }
        let fields = self.structs[id.index()].fields.clone();
        for f in &fields {
            if let ValType::Struct(inner) = f.ty {
                self.finalize_struct(inner);
            }
        }
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        let mut align = 1u32;
        for f in &fields {
            let fa = self.align_of(f.ty);
            align = align.max(fa);
            offset = align_to(offset, fa);
            offsets.push(offset);
            offset += self.size_of(f.ty) * f.count;
        }
        let def = &mut self.structs[id.index()];
        def.offsets = offsets;
        def.size = align_to(offset, align);
        def.align = align;
        def.finalized = true;
    }

    pub fn size_of(&self, ty: ValType) -> u32 {
        match ty {
            ValType::Scalar(s) => s.size(),
            ValType::Struct(id) => {
                let def = &self.structs[id.index()];
                debug_assert!(def.finalized, "struct layout queried before finalize");
                def.size
            }
        }
    }

    pub fn align_of(&self, ty: ValType) -> u32 {
        match ty {
            ValType::Scalar(s) => s.align(),
            ValType::Struct(id) => {
                let def = &self.structs[id.index()];
                debug_assert!(def.finalized, "struct layout queried before finalize");
                def.align
            }
        }
    }

    pub fn struct_def(&self, id: TypeId) -> &StructDef {
        &self.structs[id.index()]
    }

    pub fn field_offset(&self, id: TypeId, field: usize) -> u32 {
        self.structs[id.index()].offsets[field]
    }

    pub fn add_func(&mut self, ft: FuncType) -> FuncTypeId {
        self.funcs.push(ft);
        FuncTypeId(self.funcs.len() as u32 - 1)
    }

    pub fn func(&self, id: FuncTypeId) -> &FuncType {
        &self.funcs[id.index()]
    }

    /// Whether a value of this type holds a pointer the collector must be
    /// able to find.
    pub fn contains_ptr(&self, ty: ValType) -> bool {
        match ty {
            ValType::Scalar(s) => s == ScalarType::Ptr,
            ValType::Struct(id) => self.structs[id.index()]
                .fields
                .iter()
                .any(|f| self.contains_ptr(f.ty)),
        }
    }
}
