//! Value types and the per-module structural interner.
//!
//! Types are interned: two structurally equal types share one `Type` id, so
//! type equality is id equality. The four ground types get fixed ids and are
//! usable without consulting the store; pointer and array types are created
//! through [`TypeStore::ptr_to`] and [`TypeStore::array_of`].

use crate::fx::FxHashMap;
use crate::ir::Type;
use core::fmt;
use sysyc_entity::PrimaryMap;

/// The boolean result of comparisons.
pub const I1: Type = Type::from_u32(0);
/// 32-bit signed integer.
pub const I32: Type = Type::from_u32(1);
/// 32-bit IEEE float.
pub const F32: Type = Type::from_u32(2);
/// The absent value, only valid as a return type.
pub const VOID: Type = Type::from_u32(3);

/// Structure of a type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeData {
    /// Boolean.
    I1,
    /// 32-bit signed integer.
    I32,
    /// 32-bit IEEE float.
    F32,
    /// No value.
    Void,
    /// Pointer to the contained type.
    Ptr(Type),
    /// Row-major array: element type and length.
    Array(Type, u32),
}

/// The structural type interner, owned by the [`crate::ir::Module`].
#[derive(Clone)]
pub struct TypeStore {
    data: PrimaryMap<Type, TypeData>,
    interned: FxHashMap<TypeData, Type>,
}

impl TypeStore {
    /// Create a store with the ground types pre-interned at their fixed ids.
    pub fn new() -> Self {
        let mut store = Self {
            data: PrimaryMap::new(),
            interned: FxHashMap::default(),
        };
        for ground in [TypeData::I1, TypeData::I32, TypeData::F32, TypeData::Void] {
            let ty = store.data.push(ground);
            store.interned.insert(ground, ty);
        }
        debug_assert_eq!(store.data[I32], TypeData::I32);
        store
    }

    fn intern(&mut self, data: TypeData) -> Type {
        if let Some(&ty) = self.interned.get(&data) {
            return ty;
        }
        let ty = self.data.push(data);
        self.interned.insert(data, ty);
        ty
    }

    /// Get the pointer-to-`ty` type.
    pub fn ptr_to(&mut self, ty: Type) -> Type {
        self.intern(TypeData::Ptr(ty))
    }

    /// Get the `[len x elem]` array type.
    pub fn array_of(&mut self, elem: Type, len: u32) -> Type {
        self.intern(TypeData::Array(elem, len))
    }

    /// Structure of `ty`.
    pub fn data(&self, ty: Type) -> TypeData {
        self.data[ty]
    }

    /// Is `ty` a pointer?
    pub fn is_ptr(&self, ty: Type) -> bool {
        matches!(self.data[ty], TypeData::Ptr(_))
    }

    /// Is `ty` an array?
    pub fn is_array(&self, ty: Type) -> bool {
        matches!(self.data[ty], TypeData::Array(..))
    }

    /// Is `ty` one of the scalar value types (i1, i32, f32)?
    pub fn is_scalar(&self, ty: Type) -> bool {
        matches!(self.data[ty], TypeData::I1 | TypeData::I32 | TypeData::F32)
    }

    /// The pointed-to type of a pointer. Panics on non-pointers.
    pub fn pointee(&self, ty: Type) -> Type {
        match self.data[ty] {
            TypeData::Ptr(t) => t,
            other => panic!("pointee of non-pointer type {other:?}"),
        }
    }

    /// The element type of an array. Panics on non-arrays.
    pub fn elem(&self, ty: Type) -> Type {
        match self.data[ty] {
            TypeData::Array(t, _) => t,
            other => panic!("elem of non-array type {other:?}"),
        }
    }

    /// Number of bytes occupied by a value of `ty`. Arrays are flattened
    /// row-major; `i1` is stored in a full word.
    pub fn size_of(&self, ty: Type) -> u32 {
        match self.data[ty] {
            TypeData::I1 | TypeData::I32 | TypeData::F32 => 4,
            TypeData::Void => 0,
            TypeData::Ptr(_) => 8,
            TypeData::Array(elem, len) => self.size_of(elem) * len,
        }
    }

    /// Render `ty` for IR dumps.
    pub fn display(&self, ty: Type) -> String {
        match self.data[ty] {
            TypeData::I1 => "i1".to_string(),
            TypeData::I32 => "i32".to_string(),
            TypeData::F32 => "f32".to_string(),
            TypeData::Void => "void".to_string(),
            TypeData::Ptr(t) => format!("*{}", self.display(t)),
            TypeData::Array(t, n) => format!("[{} x {}]", n, self.display(t)),
        }
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TypeStore({} types)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_types() {
        let store = TypeStore::new();
        assert!(store.is_scalar(I32));
        assert!(store.is_scalar(F32));
        assert!(!store.is_scalar(VOID));
        assert_eq!(store.size_of(I32), 4);
        assert_eq!(store.size_of(VOID), 0);
    }

    #[test]
    fn interning_shares_identity() {
        let mut store = TypeStore::new();
        let p1 = store.ptr_to(I32);
        let p2 = store.ptr_to(I32);
        assert_eq!(p1, p2);
        let a1 = store.array_of(I32, 4);
        let a2 = store.array_of(I32, 4);
        assert_eq!(a1, a2);
        assert_ne!(a1, store.array_of(I32, 5));
        assert_eq!(store.size_of(a1), 16);
        let pa = store.ptr_to(a1);
        assert_eq!(store.size_of(pa), 8);
        assert_eq!(store.pointee(pa), a1);
        assert_eq!(store.elem(a1), I32);
    }

    #[test]
    fn display() {
        let mut store = TypeStore::new();
        let a = store.array_of(F32, 3);
        let p = store.ptr_to(a);
        assert_eq!(store.display(p), "*[3 x f32]");
    }
}
