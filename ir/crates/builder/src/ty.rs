use std::{
    fmt::{
        Display,
        Formatter,
    },
    ops::Index,
};

use crate::FxIndexSet;

/// Interned handle to a [`TypeData`].
///
/// Two handles are equal iff the types they stand for are structurally equal,
/// as long as both were interned by the same [`Types`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Type(u32);

impl Type {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TypeData {
    Void,
    /// Integer of `bits` width, `1..=64`. `i1` doubles as the boolean type.
    Int {
        bits: u32,
    },
    Ptr(Type),
    Struct(Vec<Type>),
    Function {
        params: Vec<Type>,
        ret: Type,
    },
}

/// Structural type interner, owned by a [`Module`][`crate::Module`].
#[derive(Debug, Clone, Default)]
pub struct Types {
    interned: FxIndexSet<TypeData>,
}

impl Types {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// If `data` is an integer type whose width is outside `1..=64`.
    pub fn intern(&mut self, data: TypeData) -> Type {
        if let TypeData::Int { bits } = data {
            assert!(
                (1..=64).contains(&bits),
                "integer width must be in 1..=64, got {bits}"
            );
        }
        let (index, _) = self.interned.insert_full(data);
        Type(index as u32)
    }

    /// Returns the handle of `data` if it has been interned before.
    pub fn lookup(&self, data: &TypeData) -> Option<Type> {
        self.interned
            .get_index_of(data)
            .map(|index| Type(index as u32))
    }

    pub fn get(&self, ty: Type) -> Option<&TypeData> {
        self.interned.get_index(ty.index())
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    pub fn void(&mut self) -> Type {
        self.intern(TypeData::Void)
    }

    pub fn int(&mut self, bits: u32) -> Type {
        self.intern(TypeData::Int { bits })
    }

    pub fn bool(&mut self) -> Type {
        self.int(1)
    }

    pub fn i8(&mut self) -> Type {
        self.int(8)
    }

    pub fn i16(&mut self) -> Type {
        self.int(16)
    }

    pub fn i32(&mut self) -> Type {
        self.int(32)
    }

    pub fn i64(&mut self) -> Type {
        self.int(64)
    }

    pub fn ptr(&mut self, pointee: Type) -> Type {
        self.intern(TypeData::Ptr(pointee))
    }

    pub fn structure(&mut self, fields: Vec<Type>) -> Type {
        self.intern(TypeData::Struct(fields))
    }

    pub fn function(&mut self, params: Vec<Type>, ret: Type) -> Type {
        self.intern(TypeData::Function { params, ret })
    }

    pub fn int_bits(&self, ty: Type) -> Option<u32> {
        match self.get(ty)? {
            TypeData::Int { bits } => Some(*bits),
            _ => None,
        }
    }

    pub fn is_int(&self, ty: Type) -> bool {
        self.int_bits(ty).is_some()
    }

    pub fn is_bool(&self, ty: Type) -> bool {
        self.int_bits(ty) == Some(1)
    }

    pub fn is_void(&self, ty: Type) -> bool {
        matches!(self.get(ty), Some(TypeData::Void))
    }

    pub fn pointee(&self, ty: Type) -> Option<Type> {
        match self.get(ty)? {
            TypeData::Ptr(pointee) => Some(*pointee),
            _ => None,
        }
    }

    pub fn is_ptr(&self, ty: Type) -> bool {
        self.pointee(ty).is_some()
    }

    pub fn struct_fields(&self, ty: Type) -> Option<&[Type]> {
        match self.get(ty)? {
            TypeData::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn signature(&self, ty: Type) -> Option<(&[Type], Type)> {
        match self.get(ty)? {
            TypeData::Function { params, ret } => Some((params, *ret)),
            _ => None,
        }
    }

    /// Whether values of `ty` occupy memory, i.e. can be loaded, stored and allocated.
    pub fn is_sized(&self, ty: Type) -> bool {
        match self.get(ty) {
            Some(TypeData::Int { .. } | TypeData::Ptr(_)) => true,
            Some(TypeData::Struct(fields)) => fields.iter().all(|field| self.is_sized(*field)),
            Some(TypeData::Void | TypeData::Function { .. }) | None => false,
        }
    }

    /// Size in bytes, including the padding needed to place values of `ty` back to back.
    pub fn size_of(&self, ty: Type) -> u64 {
        match self.get(ty) {
            Some(TypeData::Int { bits }) => int_bytes(*bits),
            Some(TypeData::Ptr(_)) => 8,
            Some(TypeData::Struct(fields)) => {
                let mut offset = 0;
                for field in fields {
                    offset = align_to(offset, self.align_of(*field)) + self.size_of(*field);
                }
                align_to(offset, self.align_of(ty))
            }
            Some(TypeData::Void | TypeData::Function { .. }) | None => 0,
        }
    }

    pub fn align_of(&self, ty: Type) -> u64 {
        match self.get(ty) {
            Some(TypeData::Int { bits }) => int_bytes(*bits),
            Some(TypeData::Ptr(_)) => 8,
            Some(TypeData::Struct(fields)) => fields
                .iter()
                .map(|field| self.align_of(*field))
                .max()
                .unwrap_or(1),
            Some(TypeData::Void | TypeData::Function { .. }) | None => 1,
        }
    }

    /// Byte offset of field `index` inside the struct `ty`.
    pub fn field_offset(&self, ty: Type, index: usize) -> Option<u64> {
        let fields = self.struct_fields(ty)?;
        if index >= fields.len() {
            return None;
        }
        let mut offset = 0;
        for field in &fields[..index] {
            offset = align_to(offset, self.align_of(*field)) + self.size_of(*field);
        }
        Some(align_to(offset, self.align_of(fields[index])))
    }

    pub fn display(&self, ty: Type) -> TypeDisplay<'_> {
        TypeDisplay { types: self, ty }
    }
}

impl Index<Type> for Types {
    type Output = TypeData;

    fn index(&self, ty: Type) -> &Self::Output {
        &self.interned[ty.index()]
    }
}

const fn int_bytes(bits: u32) -> u64 {
    ((bits as u64 + 7) / 8).next_power_of_two()
}

const fn align_to(offset: u64, align: u64) -> u64 {
    (offset + align - 1) / align * align
}

pub struct TypeDisplay<'types> {
    types: &'types Types,
    ty: Type,
}

impl Display for TypeDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let Some(data) = self.types.get(self.ty) else {
            return write!(f, "<unknown type>");
        };
        match data {
            TypeData::Void => write!(f, "void"),
            TypeData::Int { bits: 1 } => write!(f, "bool"),
            TypeData::Int { bits } => write!(f, "i{bits}"),
            TypeData::Ptr(_) => write!(f, "ptr"),
            TypeData::Struct(fields) => {
                write!(f, "{{ ")?;
                for (index, field) in fields.iter().enumerate() {
                    write!(f, "{}", self.types.display(*field))?;
                    if index < fields.len() - 1 {
                        write!(f, ", ")?;
                    }
                }
                write!(f, " }}")
            }
            TypeData::Function { params, ret } => {
                write!(f, "fun {} (", self.types.display(*ret))?;
                for (index, param) in params.iter().enumerate() {
                    write!(f, "{}", self.types.display(*param))?;
                    if index < params.len() - 1 {
                        write!(f, ", ")?;
                    }
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_intern_structurally_equal_types_once() {
        let mut types = Types::new();
        let a = types.i32();
        let b = types.int(32);
        assert_eq!(a, b);
        let ptr_a = types.ptr(a);
        let ptr_b = types.ptr(b);
        assert_eq!(ptr_a, ptr_b);
        assert_ne!(types.i64(), a);
        assert_eq!(types.len(), 3);
    }

    #[test]
    fn should_lookup_without_interning() {
        let mut types = Types::new();
        assert_eq!(types.lookup(&TypeData::Int { bits: 8 }), None);
        let i8 = types.i8();
        assert_eq!(types.lookup(&TypeData::Int { bits: 8 }), Some(i8));
    }

    #[test]
    fn should_compute_c_like_struct_layout() {
        let mut types = Types::new();
        let i8 = types.i8();
        let i32 = types.i32();
        let i64 = types.i64();
        let st = types.structure(vec![i8, i32, i8, i64]);
        assert_eq!(types.field_offset(st, 0), Some(0));
        assert_eq!(types.field_offset(st, 1), Some(4));
        assert_eq!(types.field_offset(st, 2), Some(8));
        assert_eq!(types.field_offset(st, 3), Some(16));
        assert_eq!(types.field_offset(st, 4), None);
        assert_eq!(types.size_of(st), 24);
        assert_eq!(types.align_of(st), 8);
    }

    #[test]
    fn should_round_odd_integer_widths_up() {
        let mut types = Types::new();
        let bool = types.bool();
        let i24 = types.int(24);
        assert_eq!(types.size_of(bool), 1);
        assert_eq!(types.size_of(i24), 4);
    }

    #[test]
    fn should_display_types() {
        let mut types = Types::new();
        let i32 = types.i32();
        let bool = types.bool();
        let ptr = types.ptr(i32);
        let st = types.structure(vec![i32, ptr]);
        let fun = types.function(vec![i32, bool], i32);
        assert_eq!(types.display(st).to_string(), "{ i32, ptr }");
        assert_eq!(types.display(fun).to_string(), "fun i32 (i32, bool)");
    }

    #[test]
    #[should_panic]
    fn should_reject_zero_width_integers() {
        Types::new().int(0);
    }
}
