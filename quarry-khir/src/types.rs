//! Hash-consed type descriptors with SysV x86-64 layout.
//!
//! Types are created monotonically while a program is being built and
//! interned: structurally equal unnamed types share a handle, named structs
//! and opaque types are interned by name. Struct layouts (size, alignment,
//! field offsets) are computed once at creation and must agree with the
//! pointer arithmetic the backends emit.

use hashbrown::HashMap;

use crate::error::KhirError;

/// A type handle: a small index into the type manager's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) u16);

impl TypeId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

/// Size and alignment of a type, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
}

/// Structure of one entry in the type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F64,
    Pointer {
        elem: TypeId,
    },
    Array {
        elem: TypeId,
        len: u32,
    },
    Struct {
        fields: Vec<TypeId>,
        offsets: Vec<u64>,
        layout: Layout,
        name: Option<String>,
    },
    Function {
        result: TypeId,
        args: Vec<TypeId>,
    },
    Opaque {
        name: String,
    },
}

/// Structural interning key for unnamed composite types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeKey {
    Pointer(TypeId),
    Array(TypeId, u32),
    Struct(Vec<TypeId>),
    Function(TypeId, Vec<TypeId>),
}

/// The type table.
///
/// Handles `0..=6` are reserved, in order, for `void`, `i1`, `i8`, `i16`,
/// `i32`, `i64` and `f64`; handle `7` is `i8*`. Backends may rely on this
/// numbering when walking the table in insertion order.
#[derive(Debug)]
pub struct TypeManager {
    kinds: Vec<TypeKind>,
    interned: HashMap<TypeKey, TypeId>,
    struct_names: HashMap<String, TypeId>,
    opaque_names: HashMap<String, TypeId>,
}

const VOID: TypeId = TypeId(0);
const I1: TypeId = TypeId(1);
const I8: TypeId = TypeId(2);
const I16: TypeId = TypeId(3);
const I32: TypeId = TypeId(4);
const I64: TypeId = TypeId(5);
const F64: TypeId = TypeId(6);
const I8_PTR: TypeId = TypeId(7);

impl Default for TypeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeManager {
    pub fn new() -> Self {
        let mut manager = Self {
            kinds: vec![
                TypeKind::Void,
                TypeKind::I1,
                TypeKind::I8,
                TypeKind::I16,
                TypeKind::I32,
                TypeKind::I64,
                TypeKind::F64,
                TypeKind::Pointer { elem: I8 },
            ],
            interned: HashMap::new(),
            struct_names: HashMap::new(),
            opaque_names: HashMap::new(),
        };
        manager.interned.insert(TypeKey::Pointer(I8), I8_PTR);
        manager
    }

    pub fn void_type(&self) -> TypeId {
        VOID
    }

    pub fn i1_type(&self) -> TypeId {
        I1
    }

    pub fn i8_type(&self) -> TypeId {
        I8
    }

    pub fn i16_type(&self) -> TypeId {
        I16
    }

    pub fn i32_type(&self) -> TypeId {
        I32
    }

    pub fn i64_type(&self) -> TypeId {
        I64
    }

    pub fn f64_type(&self) -> TypeId {
        F64
    }

    pub fn i8_ptr_type(&self) -> TypeId {
        I8_PTR
    }

    fn add(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId(u16::try_from(self.kinds.len()).expect("type table overflow"));
        self.kinds.push(kind);
        id
    }

    /// Pointer to `elem`; interned.
    pub fn pointer_type(&mut self, elem: TypeId) -> TypeId {
        let key = TypeKey::Pointer(elem);
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = self.add(TypeKind::Pointer { elem });
        self.interned.insert(key, id);
        id
    }

    /// Array of `len` elements of `elem`; interned.
    pub fn array_type(&mut self, elem: TypeId, len: u32) -> TypeId {
        let key = TypeKey::Array(elem, len);
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = self.add(TypeKind::Array { elem, len });
        self.interned.insert(key, id);
        id
    }

    /// Anonymous struct; interned by element handles.
    pub fn struct_type(&mut self, fields: &[TypeId]) -> Result<TypeId, KhirError> {
        let key = TypeKey::Struct(fields.to_vec());
        if let Some(&id) = self.interned.get(&key) {
            return Ok(id);
        }
        let (offsets, layout) = self.struct_layout(fields)?;
        let id = self.add(TypeKind::Struct {
            fields: fields.to_vec(),
            offsets,
            layout,
            name: None,
        });
        self.interned.insert(key, id);
        Ok(id)
    }

    /// Struct bound to a name. A second declaration of the same name fails.
    ///
    /// Fields can only refer to already-minted handles, so struct cycles
    /// are unconstructible; forward references go through [`Self::opaque_type`].
    pub fn named_struct_type(
        &mut self,
        fields: &[TypeId],
        name: &str,
    ) -> Result<TypeId, KhirError> {
        if self.struct_names.contains_key(name) {
            return Err(KhirError::DuplicateName(name.to_owned()));
        }
        let (offsets, layout) = self.struct_layout(fields)?;
        let id = self.add(TypeKind::Struct {
            fields: fields.to_vec(),
            offsets,
            layout,
            name: Some(name.to_owned()),
        });
        self.struct_names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// An incomplete aggregate known only by name (runtime-owned types).
    pub fn opaque_type(&mut self, name: &str) -> Result<TypeId, KhirError> {
        if self.opaque_names.contains_key(name) {
            return Err(KhirError::DuplicateName(name.to_owned()));
        }
        let id = self.add(TypeKind::Opaque { name: name.to_owned() });
        self.opaque_names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Function type; interned.
    pub fn function_type(&mut self, result: TypeId, args: &[TypeId]) -> TypeId {
        let key = TypeKey::Function(result, args.to_vec());
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = self.add(TypeKind::Function { result, args: args.to_vec() });
        self.interned.insert(key, id);
        id
    }

    pub fn get_struct_type(&self, name: &str) -> Result<TypeId, KhirError> {
        self.struct_names
            .get(name)
            .copied()
            .ok_or_else(|| KhirError::UnknownName(name.to_owned()))
    }

    pub fn get_opaque_type(&self, name: &str) -> Result<TypeId, KhirError> {
        self.opaque_names
            .get(name)
            .copied()
            .ok_or_else(|| KhirError::UnknownName(name.to_owned()))
    }

    pub fn kind(&self, t: TypeId) -> &TypeKind {
        &self.kinds[t.idx()]
    }

    /// Number of entries; handles are `0..len`.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// The already-interned pointer type to `elem`, if one was created.
    pub fn existing_pointer_type(&self, elem: TypeId) -> Option<TypeId> {
        self.interned.get(&TypeKey::Pointer(elem)).copied()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeKind)> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, k)| (TypeId(i as u16), k))
    }

    pub fn is_void(&self, t: TypeId) -> bool {
        t == VOID
    }

    pub fn is_i1(&self, t: TypeId) -> bool {
        t == I1
    }

    pub fn is_f64(&self, t: TypeId) -> bool {
        t == F64
    }

    pub fn is_ptr(&self, t: TypeId) -> bool {
        matches!(self.kind(t), TypeKind::Pointer { .. })
    }

    /// Pointee of a pointer type.
    pub fn pointer_elem(&self, t: TypeId) -> Result<TypeId, KhirError> {
        match self.kind(t) {
            TypeKind::Pointer { elem } => Ok(*elem),
            _ => Err(KhirError::InvalidIndex(t)),
        }
    }

    /// Result type of a function type.
    pub fn function_result(&self, t: TypeId) -> Result<TypeId, KhirError> {
        match self.kind(t) {
            TypeKind::Function { result, .. } => Ok(*result),
            _ => Err(KhirError::InvalidIndex(t)),
        }
    }

    /// Argument types of a function type.
    pub fn function_args(&self, t: TypeId) -> Result<&[TypeId], KhirError> {
        match self.kind(t) {
            TypeKind::Function { args, .. } => Ok(args),
            _ => Err(KhirError::InvalidIndex(t)),
        }
    }

    /// Size and alignment per the SysV x86-64 data layout.
    pub fn layout(&self, t: TypeId) -> Result<Layout, KhirError> {
        match self.kind(t) {
            TypeKind::Void => Ok(Layout { size: 0, align: 1 }),
            TypeKind::I1 | TypeKind::I8 => Ok(Layout { size: 1, align: 1 }),
            TypeKind::I16 => Ok(Layout { size: 2, align: 2 }),
            TypeKind::I32 => Ok(Layout { size: 4, align: 4 }),
            TypeKind::I64 | TypeKind::F64 => Ok(Layout { size: 8, align: 8 }),
            TypeKind::Pointer { .. } => Ok(Layout { size: 8, align: 8 }),
            TypeKind::Array { elem, len } => {
                let elem_layout = self.layout(*elem)?;
                Ok(Layout {
                    size: elem_layout.size * *len as u64,
                    align: elem_layout.align,
                })
            }
            TypeKind::Struct { layout, .. } => Ok(*layout),
            TypeKind::Function { .. } | TypeKind::Opaque { .. } => {
                Err(KhirError::Unsized(t))
            }
        }
    }

    /// Shorthand for `layout(t)?.size`.
    pub fn size_of(&self, t: TypeId) -> Result<u64, KhirError> {
        Ok(self.layout(t)?.size)
    }

    /// Absolute byte offsets of a struct's fields.
    pub fn field_offsets(&self, t: TypeId) -> Result<&[u64], KhirError> {
        match self.kind(t) {
            TypeKind::Struct { offsets, .. } => Ok(offsets),
            _ => Err(KhirError::InvalidIndex(t)),
        }
    }

    /// Total byte offset of a GEP-style index path starting at a pointer to
    /// `t`, plus the pointer type of the element reached.
    ///
    /// With `dynamic` set the first index is not scaled by `size_of(t)`;
    /// the caller adds the scaled leading term itself.
    pub fn pointer_offset(
        &mut self,
        t: TypeId,
        idx: &[i32],
        dynamic: bool,
    ) -> Result<(i64, TypeId), KhirError> {
        let mut offset: i64;
        let start;
        if dynamic {
            offset = 0;
            start = 0;
        } else {
            offset = idx[0] as i64 * self.size_of(t)? as i64;
            start = 1;
        }

        let mut current = t;
        for &i in &idx[start..] {
            match self.kind(current).clone() {
                TypeKind::Pointer { elem } | TypeKind::Array { elem, .. } => {
                    offset += i as i64 * self.size_of(elem)? as i64;
                    current = elem;
                }
                TypeKind::Struct { fields, offsets, .. } => {
                    let field = usize::try_from(i)
                        .ok()
                        .filter(|&f| f < fields.len())
                        .ok_or(KhirError::InvalidIndex(current))?;
                    offset += offsets[field] as i64;
                    current = fields[field];
                }
                _ => return Err(KhirError::InvalidIndex(current)),
            }
        }

        Ok((offset, self.pointer_type(current)))
    }

    fn struct_layout(&self, fields: &[TypeId]) -> Result<(Vec<u64>, Layout), KhirError> {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0u64;
        let mut align = 1u64;
        for &field in fields {
            let l = self.layout(field)?;
            if l.size == 0 {
                return Err(KhirError::Unsized(field));
            }
            offset = round_up(offset, l.align);
            offsets.push(offset);
            offset += l.size;
            align = align.max(l.align);
        }
        Ok((offsets, Layout { size: round_up(offset, align), align }))
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_handles_are_reserved() {
        let m = TypeManager::new();
        assert_eq!(m.void_type(), TypeId(0));
        assert_eq!(m.i1_type(), TypeId(1));
        assert_eq!(m.i8_type(), TypeId(2));
        assert_eq!(m.i16_type(), TypeId(3));
        assert_eq!(m.i32_type(), TypeId(4));
        assert_eq!(m.i64_type(), TypeId(5));
        assert_eq!(m.f64_type(), TypeId(6));
        assert_eq!(m.i8_ptr_type(), TypeId(7));
    }

    #[test]
    fn pointer_to_i8_reuses_the_reserved_handle() {
        let mut m = TypeManager::new();
        let i8t = m.i8_type();
        assert_eq!(m.pointer_type(i8t), m.i8_ptr_type());
    }

    #[test]
    fn structural_interning_is_idempotent() {
        let mut m = TypeManager::new();
        let (i16t, i64t) = (m.i16_type(), m.i64_type());
        let a = m.struct_type(&[i16t, i64t]).unwrap();
        let b = m.struct_type(&[i16t, i64t]).unwrap();
        assert_eq!(a, b);

        let p1 = m.pointer_type(a);
        let p2 = m.pointer_type(b);
        assert_eq!(p1, p2);

        let f1 = m.function_type(i64t, &[p1]);
        let f2 = m.function_type(i64t, &[p2]);
        assert_eq!(f1, f2);

        let arr1 = m.array_type(i64t, 4);
        let arr2 = m.array_type(i64t, 4);
        let arr3 = m.array_type(i64t, 5);
        assert_eq!(arr1, arr2);
        assert_ne!(arr1, arr3);
    }

    #[test]
    fn named_structs_intern_by_name() {
        let mut m = TypeManager::new();
        let i32t = m.i32_type();
        m.named_struct_type(&[i32t], "row").unwrap();
        assert_eq!(
            m.named_struct_type(&[i32t], "row"),
            Err(KhirError::DuplicateName("row".into()))
        );
        let got = m.get_struct_type("row").unwrap();
        assert_eq!(m.field_offsets(got).unwrap(), &[0]);
        assert_eq!(
            m.get_struct_type("absent"),
            Err(KhirError::UnknownName("absent".into()))
        );
    }

    #[test]
    fn opaque_types_have_no_layout() {
        let mut m = TypeManager::new();
        let t = m.opaque_type("hash_table").unwrap();
        assert_eq!(m.opaque_type("hash_table"), Err(KhirError::DuplicateName("hash_table".into())));
        assert_eq!(m.layout(t), Err(KhirError::Unsized(t)));
        // but pointers to it are first-class
        let p = m.pointer_type(t);
        assert_eq!(m.layout(p).unwrap(), Layout { size: 8, align: 8 });
    }

    #[test]
    fn sysv_struct_layout() {
        let mut m = TypeManager::new();
        let (i8t, i16t, i64t) = (m.i8_type(), m.i16_type(), m.i64_type());
        let s = m.struct_type(&[i8t, i16t, i64t]).unwrap();
        assert_eq!(m.field_offsets(s).unwrap(), &[0, 2, 8]);
        assert_eq!(m.layout(s).unwrap(), Layout { size: 16, align: 8 });
    }

    #[test]
    fn field_offsets_are_monotone_and_size_covers_last_field() {
        let mut m = TypeManager::new();
        let (i1t, i32t, i8t, f64t) = (m.i1_type(), m.i32_type(), m.i8_type(), m.f64_type());
        let s = m.struct_type(&[i1t, i32t, i8t, f64t]).unwrap();
        let offsets = m.field_offsets(s).unwrap().to_vec();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        let last = *offsets.last().unwrap();
        assert!(m.layout(s).unwrap().size >= last + m.size_of(f64t).unwrap());
    }

    #[test]
    fn pointer_offset_walks_structs_and_arrays() {
        let mut m = TypeManager::new();
        let (i8t, i16t, i64t) = (m.i8_type(), m.i16_type(), m.i64_type());
        let s = m.struct_type(&[i8t, i16t, i64t]).unwrap();

        let (offset, ptr) = m.pointer_offset(s, &[0, 2], false).unwrap();
        assert_eq!(offset, 8);
        assert_eq!(m.pointer_elem(ptr).unwrap(), i64t);

        // leading index scales by the whole struct
        let (offset, _) = m.pointer_offset(s, &[3, 0], false).unwrap();
        assert_eq!(offset, 3 * 16);

        // dynamic skips the leading multiplier
        let (offset, _) = m.pointer_offset(s, &[7, 1], true).unwrap();
        assert_eq!(offset, 2);

        let arr = m.array_type(i64t, 10);
        let (offset, ptr) = m.pointer_offset(arr, &[0, 4], false).unwrap();
        assert_eq!(offset, 32);
        assert_eq!(m.pointer_elem(ptr).unwrap(), i64t);
    }
}
