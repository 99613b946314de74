use std::fmt::{Debug, Formatter};
use std::sync::OnceLock;

use crate::types::{Modifiers, TypeHandle};

/// Reserved member names used by constructors and destructors in the static
/// member table.
pub const CTOR_NAME: &str = ".ctor";
pub const DTOR_NAME: &str = ".dtor";

/// Backing storage of a field value.
///
/// Instance fields live at a fixed byte offset inside each object; static
/// fields are a single compiler-emitted slot at an absolute address. Both
/// hold one machine word (an object reference or a word-extended scalar).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStorage {
    Instance { offset: usize },
    Static { slot: usize },
}

impl FieldStorage {
    /// Reads the field's current word. `obj` is ignored for static fields.
    ///
    /// # Safety
    /// For instance storage, `obj` must be a live managed object of the
    /// field's declaring type. For static storage, the slot address must
    /// still be mapped (it points into the owning module's data segment).
    pub unsafe fn load_word(&self, obj: usize) -> usize {
        match self {
            FieldStorage::Instance { offset } => ((obj + offset) as *const usize).read(),
            FieldStorage::Static { slot } => (*slot as *const usize).read(),
        }
    }
}

/// Kind-specific member data. A closed set: code never downcasts, it matches.
pub enum MemberKind {
    Method {
        /// Argument types in order, with the return type appended last.
        signature: Vec<TypeHandle>,
        addr: usize,
    },
    Constructor {
        /// Argument types only; constructors return the object they built.
        signature: Vec<TypeHandle>,
        addr: usize,
    },
    Destructor {
        addr: usize,
    },
    Field {
        value_type: TypeHandle,
        storage: FieldStorage,
    },
    Property {
        value_type: TypeHandle,
        getter: Option<usize>,
        setter: Option<usize>,
    },
}

pub struct Member {
    pub name: String,
    pub modifiers: Modifiers,
    pub kind: MemberKind,
    parent: OnceLock<TypeHandle>,
}

impl Member {
    fn new(name: impl Into<String>, modifiers: Modifiers, kind: MemberKind) -> Self {
        Self {
            name: name.into(),
            modifiers,
            kind,
            parent: OnceLock::new(),
        }
    }

    pub fn method(
        name: impl Into<String>,
        modifiers: Modifiers,
        signature: Vec<TypeHandle>,
        addr: usize,
    ) -> Self {
        Self::new(name, modifiers, MemberKind::Method { signature, addr })
    }

    pub fn ctor(modifiers: Modifiers, signature: Vec<TypeHandle>, addr: usize) -> Self {
        Self::new(
            CTOR_NAME,
            modifiers | Modifiers::STATIC,
            MemberKind::Constructor { signature, addr },
        )
    }

    pub fn dtor(modifiers: Modifiers, addr: usize) -> Self {
        Self::new(
            DTOR_NAME,
            modifiers | Modifiers::STATIC,
            MemberKind::Destructor { addr },
        )
    }

    pub fn field(
        name: impl Into<String>,
        modifiers: Modifiers,
        value_type: TypeHandle,
        storage: FieldStorage,
    ) -> Self {
        Self::new(
            name,
            modifiers,
            MemberKind::Field {
                value_type,
                storage,
            },
        )
    }

    pub fn property(
        name: impl Into<String>,
        modifiers: Modifiers,
        value_type: TypeHandle,
        getter: Option<usize>,
        setter: Option<usize>,
    ) -> Self {
        Self::new(
            name,
            modifiers,
            MemberKind::Property {
                value_type,
                getter,
                setter,
            },
        )
    }

    /// The declaring type. Set when the member is attached; `None` only for
    /// a member that was constructed but never attached.
    pub fn parent(&self) -> Option<TypeHandle> {
        self.parent.get().copied()
    }

    pub(crate) fn set_parent(&self, parent: TypeHandle) {
        // Re-attaching is a builder misuse; the first parent wins.
        let _ = self.parent.set(parent);
    }

    pub fn is_public(&self) -> bool {
        self.modifiers.contains(Modifiers::PUBLIC)
    }

    pub fn is_field(&self) -> bool {
        matches!(self.kind, MemberKind::Field { .. })
    }

    pub fn is_property(&self) -> bool {
        matches!(self.kind, MemberKind::Property { .. })
    }

    /// Signature and code address, for methods only.
    pub fn method_parts(&self) -> Option<(&[TypeHandle], usize)> {
        match &self.kind {
            MemberKind::Method { signature, addr } => Some((signature, *addr)),
            _ => None,
        }
    }

    pub fn ctor_parts(&self) -> Option<(&[TypeHandle], usize)> {
        match &self.kind {
            MemberKind::Constructor { signature, addr } => Some((signature, *addr)),
            _ => None,
        }
    }

    pub fn dtor_addr(&self) -> Option<usize> {
        match &self.kind {
            MemberKind::Destructor { addr } => Some(*addr),
            _ => None,
        }
    }

    pub fn field_parts(&self) -> Option<(TypeHandle, &FieldStorage)> {
        match &self.kind {
            MemberKind::Field {
                value_type,
                storage,
            } => Some((*value_type, storage)),
            _ => None,
        }
    }

    /// The bound code address, if this member kind carries one.
    pub fn code_addr(&self) -> Option<usize> {
        match &self.kind {
            MemberKind::Method { addr, .. }
            | MemberKind::Constructor { addr, .. }
            | MemberKind::Destructor { addr } => Some(*addr),
            _ => None,
        }
    }

    /// `Parent.Member`, with the parent in display form.
    pub fn full_name(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}.{}", parent.display_name(), self.name),
            None => self.name.clone(),
        }
    }
}

impl Debug for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.modifiers.contains(Modifiers::STATIC) {
            write!(f, "static ")?;
        }
        let render_sig = |f: &mut Formatter<'_>, sig: &[TypeHandle]| {
            let names: Vec<_> = sig.iter().map(|t| t.display_name()).collect();
            write!(f, "({})", names.join(", "))
        };
        match &self.kind {
            MemberKind::Method { signature, .. } => {
                let (args, ret) = signature.split_at(signature.len().saturating_sub(1));
                if let Some(ret) = ret.first() {
                    write!(f, "{} ", ret.display_name())?;
                }
                write!(f, "{}", self.full_name())?;
                render_sig(f, args)
            }
            MemberKind::Constructor { signature, .. } => {
                write!(f, "{}", self.full_name())?;
                render_sig(f, signature)
            }
            MemberKind::Destructor { .. } => write!(f, "{}()", self.full_name()),
            MemberKind::Field { value_type, .. } | MemberKind::Property { value_type, .. } => {
                write!(f, "{} {}", value_type.display_name(), self.full_name())
            }
        }
    }
}
