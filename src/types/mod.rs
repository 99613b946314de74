use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::types::members::{FieldStorage, Member};

pub mod members;

bitflags! {
    /// Declaration modifiers shared by types and members. Parsed from the
    /// one-letter flag runs in assembly metadata; absence of any visibility
    /// flag means `PRIVATE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers: u16 {
        const PUBLIC = 1 << 0;
        const PRIVATE = 1 << 1;
        const STATIC = 1 << 2;
        const SEALED = 1 << 3;
        const ABSTRACT = 1 << 4;
        const INTERNAL = 1 << 5;
        const PROTECTED = 1 << 6;
        const PARTIAL = 1 << 7;
        const READONLY = 1 << 8;
    }
}

bitflags! {
    /// Query filter for member lookups. `PUBLIC` matches only members with
    /// the `PUBLIC` modifier; everything else (private, internal, protected)
    /// is matched by `NON_PUBLIC`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindingFlags: u8 {
        const INSTANCE = 1 << 0;
        const STATIC = 1 << 1;
        const PUBLIC = 1 << 2;
        const NON_PUBLIC = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Struct,
    ReadonlyStruct,
    Array,
}

type MemberTable = HashMap<String, Vec<&'static Member>>;

/// A managed type: the unit of identity for everything the runtime resolves.
///
/// Types are created once, during assembly read, and live for the rest of the
/// process; all references to them are `'static`. The two member tables are
/// populated later, during phase-2 load, which is why they sit behind locks
/// while everything else is immutable.
pub struct Type {
    pub kind: TypeKind,
    /// Name of the owning assembly (back-reference, non-owning).
    pub assembly: String,
    /// Global lookup key, brackets retained: `[Namespace]Name`.
    pub qualified_name: String,
    pub modifiers: Modifiers,
    /// Instance size in bytes, including the leading type-identity word.
    pub size: usize,
    /// Element type for `TypeKind::Array`; `None` for everything else.
    pub element: Option<TypeHandle>,
    statics: RwLock<MemberTable>,
    instance: RwLock<MemberTable>,
}

impl Type {
    pub fn new(
        kind: TypeKind,
        assembly: impl Into<String>,
        qualified_name: impl Into<String>,
        modifiers: Modifiers,
        size: usize,
    ) -> Self {
        Self {
            kind,
            assembly: assembly.into(),
            qualified_name: qualified_name.into(),
            modifiers,
            size,
            element: None,
            statics: RwLock::new(HashMap::new()),
            instance: RwLock::new(HashMap::new()),
        }
    }

    /// An array type over `element`. Arrays describe reference slots, so
    /// their instance size is one machine word.
    pub fn new_array(assembly: impl Into<String>, element: TypeHandle) -> Self {
        let mut ty = Type::new(
            TypeKind::Array,
            assembly,
            format!("{}[]", element.qualified_name),
            Modifiers::PUBLIC | Modifiers::SEALED,
            std::mem::size_of::<usize>(),
        );
        ty.element = Some(element);
        ty
    }

    /// Consumes the type into a process-lifetime handle.
    pub fn leak(self) -> TypeHandle {
        TypeHandle(Box::leak(Box::new(self)))
    }

    /// Overloads registered under `name` in the static table, in insertion
    /// order. Empty if the name is unknown.
    pub fn statics_of(&self, name: &str) -> Vec<&'static Member> {
        self.statics.read().get(name).cloned().unwrap_or_default()
    }

    pub fn instance_of(&self, name: &str) -> Vec<&'static Member> {
        self.instance.read().get(name).cloned().unwrap_or_default()
    }

    /// Every static member, flattened. Order is stable within a name but
    /// unspecified across names.
    pub fn static_members(&self) -> Vec<&'static Member> {
        self.statics.read().values().flatten().copied().collect()
    }

    pub fn instance_members(&self) -> Vec<&'static Member> {
        self.instance.read().values().flatten().copied().collect()
    }

    /// Instance fields in declaration tables; the set the collector traverses.
    pub fn instance_field_offsets(&self) -> Vec<usize> {
        self.instance
            .read()
            .values()
            .flatten()
            .filter_map(|m| match m.field_parts() {
                Some((_, FieldStorage::Instance { offset })) => Some(*offset),
                _ => None,
            })
            .collect()
    }

    /// Human-readable name: dotted namespace, `Elem[]` for arrays.
    pub fn display_name(&self) -> String {
        if let Some(element) = self.element {
            return format!("{}[]", element.display_name());
        }
        match (
            self.qualified_name.strip_prefix('['),
            self.qualified_name.find(']'),
        ) {
            (Some(_), Some(close)) => {
                let ns = &self.qualified_name[1..close];
                let name = &self.qualified_name[close + 1..];
                if ns.is_empty() {
                    name.to_string()
                } else {
                    format!("{ns}.{name}")
                }
            }
            _ => self.qualified_name.clone(),
        }
    }

    fn add_member(table: &RwLock<MemberTable>, member: &'static Member) {
        table
            .write()
            .entry(member.name.clone())
            .or_default()
            .push(member);
    }
}

impl Debug for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.kind, self.qualified_name)
    }
}

/// Process-lifetime reference to a [`Type`] with pointer identity: two
/// handles are equal iff they refer to the same registered type. Signature
/// equality for overload resolution is element-wise handle equality.
#[derive(Clone, Copy)]
pub struct TypeHandle(pub &'static Type);

impl TypeHandle {
    pub fn as_raw(self) -> *const Type {
        self.0 as *const _
    }

    /// Appends `member` to the static overload table, wiring up the parent
    /// back-reference. No uniqueness check; later resolution imposes whatever
    /// disambiguation it needs.
    pub fn attach_static(self, member: Member) -> &'static Member {
        let member: &'static Member = Box::leak(Box::new(member));
        member.set_parent(self);
        Type::add_member(&self.0.statics, member);
        member
    }

    pub fn attach_instance(self, member: Member) -> &'static Member {
        let member: &'static Member = Box::leak(Box::new(member));
        member.set_parent(self);
        Type::add_member(&self.0.instance, member);
        member
    }
}

impl Deref for TypeHandle {
    type Target = Type;
    fn deref(&self) -> &'static Self::Target {
        self.0
    }
}

impl Debug for TypeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name)
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self.0, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> TypeHandle {
        Type::new(TypeKind::Class, "test.dll", name, Modifiers::PUBLIC, 16).leak()
    }

    #[test]
    fn handle_identity_is_pointer_identity() {
        let a = class("[Ns]Same");
        let b = class("[Ns]Same");
        assert_eq!(a, a);
        assert_ne!(a, b, "equal names must not alias distinct registrations");
    }

    #[test]
    fn display_name_strips_brackets() {
        assert_eq!(class("[System]String").display_name(), "System.String");
        assert_eq!(class("[]Bare").display_name(), "Bare");

        let arr = Type::new_array("test.dll", class("[System]String")).leak();
        assert_eq!(arr.display_name(), "System.String[]");
        assert_eq!(arr.qualified_name, "[System]String[]");
        assert_eq!(arr.size, std::mem::size_of::<usize>());
    }

    #[test]
    fn overloads_keep_insertion_order() {
        let ty = class("[Ns]Overloaded");
        let other = class("[Ns]Arg");
        let first = ty.attach_static(Member::method(
            "M",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![other],
            0x1000,
        ));
        let second = ty.attach_static(Member::method(
            "M",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![other, other],
            0x2000,
        ));
        let overloads = ty.statics_of("M");
        assert!(std::ptr::eq(overloads[0], first));
        assert!(std::ptr::eq(overloads[1], second));
        assert_eq!(first.parent(), Some(ty));
    }
}
