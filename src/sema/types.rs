//! Type system for Blend65
//!
//! Types are interned in a session-owned [`TypeTable`]; compatibility
//! queries are cached by id pair. The table is created once per
//! compilation session and never shared between sessions.

use crate::parser::ast::CoercionKind;
use std::collections::HashMap;
use std::fmt;

/// Interned type id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Closed set of type shapes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// 8-bit unsigned integer
    Byte,
    /// 16-bit unsigned integer
    Word,
    /// Boolean, stored as one byte (0/1)
    Boolean,
    /// No value
    Void,
    /// Compile-time string literal
    String,
    /// Pointer to a value of the given type
    Pointer(TypeId),
    /// Fixed-size array; `len` of `None` means not yet inferred
    Array {
        /// Element type
        elem: TypeId,
        /// Element count, when known
        len: Option<u32>,
    },
    /// Function signature (used for callbacks)
    Function {
        /// Parameter types
        params: Vec<TypeId>,
        /// Return type
        ret: TypeId,
    },
    /// Placeholder used for error recovery; compatible with everything
    Unknown,
}

/// Full description of an interned type
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Shape of the type
    pub kind: TypeKind,
    /// Printable name
    pub name: String,
    /// Size in bytes (0 when unknown or void)
    pub size: u32,
    /// Signedness; Blend65 integers are unsigned throughout
    pub signed: bool,
    /// Whether values of this type can be assigned to
    pub assignable: bool,
}

/// Session-owned type interner with a pairwise compatibility cache
pub struct TypeTable {
    infos: Vec<TypeInfo>,
    interned: HashMap<TypeKind, TypeId>,
    compat_cache: HashMap<(TypeId, TypeId), bool>,

    /// Pre-interned `byte`
    pub byte_id: TypeId,
    /// Pre-interned `word`
    pub word_id: TypeId,
    /// Pre-interned `boolean`
    pub bool_id: TypeId,
    /// Pre-interned `void`
    pub void_id: TypeId,
    /// Pre-interned `string`
    pub string_id: TypeId,
    /// Pre-interned `unknown`
    pub unknown_id: TypeId,
}

impl TypeTable {
    /// Creates a table with the primitive types interned
    pub fn new() -> Self {
        let mut table = TypeTable {
            infos: Vec::new(),
            interned: HashMap::new(),
            compat_cache: HashMap::new(),
            byte_id: TypeId(0),
            word_id: TypeId(0),
            bool_id: TypeId(0),
            void_id: TypeId(0),
            string_id: TypeId(0),
            unknown_id: TypeId(0),
        };
        table.byte_id = table.intern(TypeKind::Byte);
        table.word_id = table.intern(TypeKind::Word);
        table.bool_id = table.intern(TypeKind::Boolean);
        table.void_id = table.intern(TypeKind::Void);
        table.string_id = table.intern(TypeKind::String);
        table.unknown_id = table.intern(TypeKind::Unknown);
        table
    }

    /// Interns a type kind, returning the canonical id
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = TypeId(self.infos.len() as u32);
        let info = self.describe(&kind);
        self.infos.push(info);
        self.interned.insert(kind, id);
        id
    }

    fn describe(&self, kind: &TypeKind) -> TypeInfo {
        let (name, size, assignable) = match kind {
            TypeKind::Byte => ("byte".to_string(), 1, true),
            TypeKind::Word => ("word".to_string(), 2, true),
            TypeKind::Boolean => ("boolean".to_string(), 1, true),
            TypeKind::Void => ("void".to_string(), 0, false),
            TypeKind::String => ("string".to_string(), 0, false),
            TypeKind::Pointer(inner) => {
                (format!("*{}", self.name_of(*inner)), 2, true)
            }
            TypeKind::Array { elem, len } => {
                let elem_info = self.info(*elem);
                let name = match len {
                    Some(n) => format!("{}[{}]", elem_info.name, n),
                    None => format!("{}[]", elem_info.name),
                };
                let size = len.map(|n| n * elem_info.size).unwrap_or(0);
                (name, size, true)
            }
            TypeKind::Function { params, ret } => {
                let params: Vec<String> =
                    params.iter().map(|p| self.name_of(*p)).collect();
                let name = format!(
                    "callback({}): {}",
                    params.join(", "),
                    self.name_of(*ret)
                );
                // A callback value is a code address
                (name, 2, true)
            }
            TypeKind::Unknown => ("<unknown>".to_string(), 0, true),
        };
        TypeInfo {
            kind: kind.clone(),
            name,
            size,
            signed: false,
            assignable,
        }
    }

    /// Type description by id
    pub fn info(&self, id: TypeId) -> &TypeInfo {
        &self.infos[id.0 as usize]
    }

    /// Printable name by id
    pub fn name_of(&self, id: TypeId) -> String {
        self.infos
            .get(id.0 as usize)
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "<invalid>".to_string())
    }

    /// Byte size by id
    pub fn size_of(&self, id: TypeId) -> u32 {
        self.info(id).size
    }

    /// Interns `*T`
    pub fn pointer_to(&mut self, inner: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer(inner))
    }

    /// Interns `T[len]`
    pub fn array_of(&mut self, elem: TypeId, len: Option<u32>) -> TypeId {
        self.intern(TypeKind::Array { elem, len })
    }

    /// Interns a function signature
    pub fn function_of(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        self.intern(TypeKind::Function { params, ret })
    }

    /// True for byte/word/boolean (types valid in arithmetic after coercion)
    pub fn is_numeric(&self, id: TypeId) -> bool {
        matches!(
            self.info(id).kind,
            TypeKind::Byte | TypeKind::Word | TypeKind::Boolean | TypeKind::Pointer(_)
        )
    }

    /// True when values of `src` may be assigned where `dst` is expected,
    /// either directly or via an implicit conversion
    pub fn assignable(&mut self, dst: TypeId, src: TypeId) -> bool {
        if let Some(&cached) = self.compat_cache.get(&(dst, src)) {
            return cached;
        }
        let result = self.compute_assignable(dst, src);
        self.compat_cache.insert((dst, src), result);
        result
    }

    fn compute_assignable(&self, dst: TypeId, src: TypeId) -> bool {
        if dst == src {
            return true;
        }
        let d = &self.info(dst).kind;
        let s = &self.info(src).kind;
        match (d, s) {
            // Error recovery: unknown is compatible with everything
            (TypeKind::Unknown, _) | (_, TypeKind::Unknown) => true,

            // Implicit widening
            (TypeKind::Word, TypeKind::Byte) => true,
            // Boolean <-> byte, both directions
            (TypeKind::Byte, TypeKind::Boolean) | (TypeKind::Boolean, TypeKind::Byte) => true,
            // Boolean widens through byte
            (TypeKind::Word, TypeKind::Boolean) => true,
            // Addresses are words
            (TypeKind::Word, TypeKind::Pointer(_)) | (TypeKind::Pointer(_), TypeKind::Word) => {
                true
            }

            // Structural array equality; an unsized side matches any length
            (
                TypeKind::Array { elem: de, len: dl },
                TypeKind::Array { elem: se, len: sl },
            ) => de == se && (dl.is_none() || sl.is_none() || dl == sl),

            // Structural function equality
            (
                TypeKind::Function {
                    params: dp,
                    ret: dr,
                },
                TypeKind::Function {
                    params: sp,
                    ret: sr,
                },
            ) => dp == sp && dr == sr,

            _ => false,
        }
    }

    /// The implicit conversion needed to use `src` where `dst` is expected,
    /// or `None` when the types already agree (or cannot agree)
    pub fn coercion_for(&self, dst: TypeId, src: TypeId) -> Option<CoercionKind> {
        if dst == src {
            return None;
        }
        let d = &self.info(dst).kind;
        let s = &self.info(src).kind;
        match (d, s) {
            (TypeKind::Word, TypeKind::Byte) => Some(CoercionKind::ZeroExtend),
            (TypeKind::Word, TypeKind::Boolean) => Some(CoercionKind::ZeroExtend),
            (TypeKind::Byte, TypeKind::Word) => Some(CoercionKind::Truncate),
            (TypeKind::Byte, TypeKind::Boolean) => Some(CoercionKind::BoolToByte),
            (TypeKind::Boolean, TypeKind::Byte) => Some(CoercionKind::ByteToBool),
            _ => None,
        }
    }

    /// Result type of a binary arithmetic/bitwise operation over the
    /// operand types: byte stays byte, any word operand widens the result
    pub fn arithmetic_result(&self, lhs: TypeId, rhs: TypeId) -> TypeId {
        let l = &self.info(lhs).kind;
        let r = &self.info(rhs).kind;
        if matches!(l, TypeKind::Unknown) || matches!(r, TypeKind::Unknown) {
            return self.unknown_id;
        }
        let is_word =
            |k: &TypeKind| matches!(k, TypeKind::Word | TypeKind::Pointer(_));
        if is_word(l) || is_word(r) {
            self.word_id
        } else {
            self.byte_id
        }
    }

    /// Larger of two numeric types (word dominates byte)
    pub fn wider_of(&self, a: TypeId, b: TypeId) -> TypeId {
        self.arithmetic_result(a, b)
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeTable")
            .field("types", &self.infos.len())
            .field("cached_pairs", &self.compat_cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_canonical() {
        let mut t = TypeTable::new();
        let a = t.array_of(t.byte_id, Some(3));
        let b = t.array_of(t.byte_id, Some(3));
        assert_eq!(a, b);
        let c = t.array_of(t.byte_id, Some(4));
        assert_ne!(a, c);
    }

    #[test]
    fn test_sizes() {
        let mut t = TypeTable::new();
        assert_eq!(t.size_of(t.byte_id), 1);
        assert_eq!(t.size_of(t.word_id), 2);
        assert_eq!(t.size_of(t.bool_id), 1);
        let arr = t.array_of(t.word_id, Some(5));
        assert_eq!(t.size_of(arr), 10);
        let ptr = t.pointer_to(t.byte_id);
        assert_eq!(t.size_of(ptr), 2);
    }

    #[test]
    fn test_widening_rules() {
        let mut t = TypeTable::new();
        let (byte, word, boolean) = (t.byte_id, t.word_id, t.bool_id);
        assert!(t.assignable(word, byte));
        assert!(!t.assignable(byte, word));
        assert!(t.assignable(byte, boolean));
        assert!(t.assignable(boolean, byte));
        assert!(t.assignable(word, boolean));
    }

    #[test]
    fn test_compat_cache() {
        let mut t = TypeTable::new();
        let (byte, word) = (t.byte_id, t.word_id);
        assert!(t.assignable(word, byte));
        assert!(t.assignable(word, byte)); // cached path
        assert_eq!(t.compat_cache.len(), 1);
    }

    #[test]
    fn test_coercions() {
        let t = TypeTable::new();
        assert_eq!(
            t.coercion_for(t.word_id, t.byte_id),
            Some(CoercionKind::ZeroExtend)
        );
        assert_eq!(
            t.coercion_for(t.byte_id, t.word_id),
            Some(CoercionKind::Truncate)
        );
        assert_eq!(
            t.coercion_for(t.byte_id, t.bool_id),
            Some(CoercionKind::BoolToByte)
        );
        assert_eq!(t.coercion_for(t.byte_id, t.byte_id), None);
    }

    #[test]
    fn test_arithmetic_result() {
        let t = TypeTable::new();
        assert_eq!(t.arithmetic_result(t.byte_id, t.byte_id), t.byte_id);
        assert_eq!(t.arithmetic_result(t.byte_id, t.word_id), t.word_id);
        assert_eq!(t.arithmetic_result(t.word_id, t.word_id), t.word_id);
    }

    #[test]
    fn test_array_structural_equality() {
        let mut t = TypeTable::new();
        let sized = t.array_of(t.byte_id, Some(3));
        let unsized_arr = t.array_of(t.byte_id, None);
        assert!(t.assignable(unsized_arr, sized));
        assert!(t.assignable(sized, unsized_arr));
        let other = t.array_of(t.word_id, Some(3));
        assert!(!t.assignable(sized, other));
    }

    #[test]
    fn test_function_names() {
        let mut t = TypeTable::new();
        let f = t.function_of(vec![t.byte_id, t.word_id], t.void_id);
        assert_eq!(t.name_of(f), "callback(byte, word): void");
    }
}
