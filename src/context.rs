//! The runtime context: assembly registries, the resolver, and GC root
//! bookkeeping.
//!
//! One [`RuntimeContext`] owns everything. Assemblies move through two
//! registries: `read` (phase-1: headers parsed, types registered by name)
//! and `loaded` (phase-2: members bound, init hook run). Both preserve
//! registration order, and every name scan walks that order, so resolution
//! is deterministic for a fixed registration sequence.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::assembly::{Assembly, LocalsTable};
use crate::error::ResolutionError;
use crate::heap::Heap;
use crate::types::members::{Member, CTOR_NAME, DTOR_NAME};
use crate::types::{BindingFlags, Type, TypeHandle};

/// Synthetic assembly that owns every array type the runtime synthesizes.
pub const ARRAY_ASSEMBLY: &str = "ULR.<ArrayTypes>";

/// A conservatively scanned word range on some thread's stack. Any word in
/// `[base, top)` that matches a live allocation address is treated as a root.
#[derive(Clone, Copy, Debug)]
pub struct StackRange {
    pub base: usize,
    pub top: usize,
}

impl StackRange {
    /// Word values inside the range. The scan starts at the first aligned
    /// word and only reads words that fit entirely before `top`.
    fn words(&self) -> impl Iterator<Item = usize> {
        let (low, high) = if self.base <= self.top {
            (self.base, self.top)
        } else {
            (self.top, self.base)
        };
        let word = std::mem::size_of::<usize>();
        let start = low.next_multiple_of(word);
        let end = high.saturating_sub(word - 1);
        (start..end)
            .step_by(word)
            .map(|addr| unsafe { (addr as *const usize).read() })
    }
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, &'static Assembly>,
    order: Vec<&'static Assembly>,
}

impl Registry {
    /// First registration of a name wins; a repeat is ignored with a warning.
    fn insert(&mut self, assembly: &'static Assembly) -> &'static Assembly {
        if let Some(existing) = self.by_name.get(&assembly.name) {
            tracing::warn!(assembly = %assembly.name, "assembly already registered; keeping the first");
            return existing;
        }
        self.by_name.insert(assembly.name.clone(), assembly);
        self.order.push(assembly);
        assembly
    }

    fn get(&self, name: &str) -> Option<&'static Assembly> {
        self.by_name.get(name).copied()
    }
}

pub struct RuntimeContext {
    read: RwLock<Registry>,
    loaded: RwLock<Registry>,
    /// Serializes phase-2 loads. Reentrant so an init hook that triggers a
    /// lazy load of another assembly does not deadlock.
    pub(crate) load_lock: ReentrantMutex<()>,
    pub(crate) heap: Heap,
    stack_roots: Mutex<HashMap<ThreadId, StackRange>>,
    array_assembly: &'static Assembly,
}

impl RuntimeContext {
    pub fn new() -> Self {
        let array_assembly: &'static Assembly = Box::leak(Box::new(Assembly::in_memory(
            ARRAY_ASSEMBLY,
            "",
            &[],
            LocalsTable::empty(),
        )));
        let mut read = Registry::default();
        let mut loaded = Registry::default();
        // Array types never need a phase-2 load, so the container starts in
        // both registries.
        read.insert(array_assembly);
        loaded.insert(array_assembly);
        Self {
            read: RwLock::new(read),
            loaded: RwLock::new(loaded),
            load_lock: ReentrantMutex::new(()),
            heap: Heap::new(),
            stack_roots: Mutex::new(HashMap::new()),
            array_assembly,
        }
    }

    // ---- registries -------------------------------------------------------

    pub(crate) fn register_read(&self, assembly: Assembly) -> &'static Assembly {
        let assembly: &'static Assembly = Box::leak(Box::new(assembly));
        self.read.write().insert(assembly)
    }

    pub fn get_read(&self, name: &str) -> Option<&'static Assembly> {
        self.read.read().get(name)
    }

    pub(crate) fn register_loaded(&self, assembly: &'static Assembly) {
        self.loaded.write().insert(assembly);
    }

    pub fn get_loaded(&self, name: &str) -> Option<&'static Assembly> {
        self.loaded.read().get(name)
    }

    pub fn loaded_in_order(&self) -> Vec<&'static Assembly> {
        self.loaded.read().order.clone()
    }

    /// Names of assemblies that were read but not yet loaded, in read order.
    fn pending_loads(&self) -> Vec<String> {
        let loaded = self.loaded.read();
        self.read
            .read()
            .order
            .iter()
            .filter(|a| loaded.get(&a.name).is_none())
            .map(|a| a.name.clone())
            .collect()
    }

    // ---- type resolution --------------------------------------------------

    /// Resolves a qualified type name against every loaded assembly, lazily
    /// loading read-but-unloaded assemblies until the name is found. Names
    /// ending in `[]` synthesize an array type over the (resolved) element.
    pub fn get_type(&self, qualified_name: &str) -> Result<TypeHandle, ResolutionError> {
        for assembly in self.loaded_in_order() {
            if let Some(ty) = assembly.get_type(qualified_name) {
                return Ok(ty);
            }
        }
        for name in self.pending_loads() {
            match crate::loader::load_assembly(self, &name) {
                Ok(assembly) => {
                    if let Some(ty) = assembly.get_type(qualified_name) {
                        return Ok(ty);
                    }
                }
                Err(error) => {
                    tracing::warn!(assembly = %name, %error, "lazy load failed during type resolution");
                }
            }
        }
        if let Some(element_name) = qualified_name.strip_suffix("[]") {
            let element = self.get_type(element_name)?;
            return Ok(self.get_or_make_array(element));
        }
        Err(ResolutionError::TypeNotFound(qualified_name.to_string()))
    }

    /// Resolution restricted to one loaded assembly. Fails if the assembly
    /// is not loaded or does not define the type; there is no global
    /// fallback.
    pub fn get_type_in(
        &self,
        qualified_name: &str,
        assembly: &str,
    ) -> Result<TypeHandle, ResolutionError> {
        self.get_loaded(assembly)
            .and_then(|a| a.get_type(qualified_name))
            .ok_or_else(|| ResolutionError::TypeNotFound(qualified_name.to_string()))
    }

    /// Resolution against the read registry only. The loader uses this for
    /// signature types so binding one assembly's members never recursively
    /// loads another.
    pub(crate) fn resolve_read_type(
        &self,
        qualified_name: &str,
    ) -> Result<TypeHandle, ResolutionError> {
        {
            let read = self.read.read();
            for assembly in &read.order {
                if let Some(ty) = assembly.get_type(qualified_name) {
                    return Ok(ty);
                }
            }
        }
        if let Some(element_name) = qualified_name.strip_suffix("[]") {
            let element = self.resolve_read_type(element_name)?;
            return Ok(self.get_or_make_array(element));
        }
        Err(ResolutionError::TypeNotFound(qualified_name.to_string()))
    }

    /// The array type over `element`, synthesizing and registering it on
    /// first request. Repeated requests return the identical handle.
    pub fn get_or_make_array(&self, element: TypeHandle) -> TypeHandle {
        let name = format!("{}[]", element.qualified_name);
        self.array_assembly
            .get_or_insert_type(&name, || Type::new_array(ARRAY_ASSEMBLY, element).leak())
    }

    // ---- member resolution ------------------------------------------------

    /// Constructor with exactly `signature` as its argument types.
    pub fn get_ctor(
        &self,
        ty: TypeHandle,
        signature: &[TypeHandle],
    ) -> Result<&'static Member, ResolutionError> {
        ty.statics_of(CTOR_NAME)
            .into_iter()
            .find(|m| matches!(m.ctor_parts(), Some((sig, _)) if sig == signature))
            .ok_or_else(|| ResolutionError::ConstructorNotFound(ty.display_name()))
    }

    /// The type's destructor. At most one is meaningful; the first
    /// registration wins.
    pub fn get_dtor(&self, ty: TypeHandle) -> Result<&'static Member, ResolutionError> {
        ty.statics_of(DTOR_NAME)
            .into_iter()
            .find(|m| m.dtor_addr().is_some())
            .ok_or_else(|| ResolutionError::DestructorNotFound(ty.display_name()))
    }

    /// Method lookup by name and full signature (argument types with the
    /// return type appended last, matching metadata order). Instance tables
    /// are scanned before static ones when both are requested.
    pub fn get_method(
        &self,
        ty: TypeHandle,
        name: &str,
        signature: &[TypeHandle],
        flags: BindingFlags,
    ) -> Result<&'static Member, ResolutionError> {
        let matches_sig = |m: &&'static Member| {
            matches!(m.method_parts(), Some((sig, _)) if sig == signature) && visible(m, flags)
        };
        if flags.contains(BindingFlags::INSTANCE) {
            if let Some(m) = ty.instance_of(name).into_iter().find(matches_sig) {
                return Ok(m);
            }
        }
        if flags.contains(BindingFlags::STATIC) {
            if let Some(m) = ty.statics_of(name).into_iter().find(matches_sig) {
                return Ok(m);
            }
        }
        Err(ResolutionError::MethodNotFound {
            type_name: ty.display_name(),
            member: name.to_string(),
        })
    }

    pub fn get_field(
        &self,
        ty: TypeHandle,
        name: &str,
        flags: BindingFlags,
    ) -> Result<&'static Member, ResolutionError> {
        self.find_data_member(ty, name, flags, Member::is_field)
            .ok_or_else(|| ResolutionError::FieldNotFound {
                type_name: ty.display_name(),
                member: name.to_string(),
            })
    }

    pub fn get_property(
        &self,
        ty: TypeHandle,
        name: &str,
        flags: BindingFlags,
    ) -> Result<&'static Member, ResolutionError> {
        self.find_data_member(ty, name, flags, Member::is_property)
            .ok_or_else(|| ResolutionError::PropertyNotFound {
                type_name: ty.display_name(),
                member: name.to_string(),
            })
    }

    fn find_data_member(
        &self,
        ty: TypeHandle,
        name: &str,
        flags: BindingFlags,
        wanted: impl Fn(&Member) -> bool,
    ) -> Option<&'static Member> {
        let accept = |m: &&'static Member| wanted(m) && visible(m, flags);
        if flags.contains(BindingFlags::INSTANCE) {
            if let Some(m) = ty.instance_of(name).into_iter().find(accept) {
                return Some(m);
            }
        }
        if flags.contains(BindingFlags::STATIC) {
            if let Some(m) = ty.statics_of(name).into_iter().find(accept) {
                return Some(m);
            }
        }
        None
    }

    /// Unfiltered union of the static and instance overload sets registered
    /// under `name`, statics first. Enumeration and diagnostics only.
    pub fn get_member(&self, ty: TypeHandle, name: &str) -> Vec<&'static Member> {
        let mut out = ty.statics_of(name);
        out.extend(ty.instance_of(name));
        out
    }

    // ---- reverse lookups --------------------------------------------------

    /// The loaded assembly whose address table contains `addr`. Scans in
    /// load order, so shared thunk addresses resolve to the first loader.
    pub fn resolve_address_to_assembly(&self, addr: usize) -> Option<&'static Assembly> {
        self.loaded_in_order()
            .into_iter()
            .find(|a| a.addresses.contains(&addr) || a.entry_point() == Some(addr))
    }

    /// The bound member whose code address is `addr`, if any.
    pub fn resolve_address_to_member(&self, addr: usize) -> Option<&'static Member> {
        for assembly in self.loaded_in_order() {
            for ty in assembly.types_in_order() {
                let found = ty
                    .static_members()
                    .into_iter()
                    .chain(ty.instance_members())
                    .find(|m| m.code_addr() == Some(addr));
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    // ---- GC roots ---------------------------------------------------------

    /// Registers a conservatively scanned stack range for the calling
    /// thread, replacing any previous registration.
    pub fn register_stack_roots(&self, range: StackRange) {
        self.stack_roots
            .lock()
            .insert(thread::current().id(), range);
    }

    pub fn unregister_stack_roots(&self) {
        self.stack_roots.lock().remove(&thread::current().id());
    }

    /// Reads every word out of every registered stack range. The collector
    /// filters the result against its allocation table.
    pub(crate) fn stack_root_words(&self) -> Vec<usize> {
        self.stack_roots
            .lock()
            .values()
            .flat_map(StackRange::words)
            .collect()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

fn visible(member: &Member, flags: BindingFlags) -> bool {
    if member.is_public() {
        flags.contains(BindingFlags::PUBLIC)
    } else {
        flags.contains(BindingFlags::NON_PUBLIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Modifiers, TypeKind};

    fn ctx_with_type(name: &str) -> (RuntimeContext, TypeHandle) {
        let ctx = RuntimeContext::new();
        let ty = Type::new(TypeKind::Class, "test.dll", name, Modifiers::PUBLIC, 16).leak();
        let assembly = ctx.register_read(Assembly::in_memory(
            "test.dll",
            "",
            &[],
            LocalsTable::empty(),
        ));
        assembly.register_type(ty);
        ctx.register_loaded(assembly);
        (ctx, ty)
    }

    #[test]
    fn unknown_type_is_an_error() {
        let ctx = RuntimeContext::new();
        assert!(matches!(
            ctx.get_type("[Nowhere]Missing"),
            Err(ResolutionError::TypeNotFound(_))
        ));
    }

    #[test]
    fn array_types_are_synthesized_once() {
        let (ctx, ty) = ctx_with_type("[N]Elem");
        let a = ctx.get_type("[N]Elem[]").unwrap();
        let b = ctx.get_type("[N]Elem[]").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.kind, TypeKind::Array);
        assert_eq!(a.element, Some(ty));
        assert_eq!(a.assembly, ARRAY_ASSEMBLY);

        let nested = ctx.get_type("[N]Elem[][]").unwrap();
        assert_eq!(nested.element, Some(a));
    }

    #[test]
    fn visibility_filter_distinguishes_public_from_the_rest() {
        let (ctx, ty) = ctx_with_type("[N]Host");
        let ret = ctx.get_type("[N]Host").unwrap();
        ty.attach_static(Member::method(
            "Open",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![ret],
            0x10,
        ));
        ty.attach_static(Member::method(
            "Hidden",
            Modifiers::INTERNAL | Modifiers::STATIC,
            vec![ret],
            0x20,
        ));

        let public = BindingFlags::STATIC | BindingFlags::PUBLIC;
        let non_public = BindingFlags::STATIC | BindingFlags::NON_PUBLIC;
        assert!(ctx.get_method(ty, "Open", &[ret], public).is_ok());
        assert!(ctx.get_method(ty, "Open", &[ret], non_public).is_err());
        assert!(ctx.get_method(ty, "Hidden", &[ret], non_public).is_ok());
        assert!(matches!(
            ctx.get_method(ty, "Hidden", &[ret], public),
            Err(ResolutionError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn overloads_resolve_by_exact_signature() {
        let (ctx, ty) = ctx_with_type("[N]Over");
        let ret = ty;
        ty.attach_static(Member::method(
            "M",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![ret],
            0x10,
        ));
        ty.attach_static(Member::method(
            "M",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![ret, ret],
            0x20,
        ));
        let flags = BindingFlags::STATIC | BindingFlags::PUBLIC;
        let unary = ctx.get_method(ty, "M", &[ret], flags).unwrap();
        let binary = ctx.get_method(ty, "M", &[ret, ret], flags).unwrap();
        assert_eq!(unary.method_parts().unwrap().1, 0x10);
        assert_eq!(binary.method_parts().unwrap().1, 0x20);
        assert!(ctx.get_method(ty, "M", &[ret, ret, ret], flags).is_err());
    }

    #[test]
    fn ctor_overloads_select_by_exact_signature() {
        let (ctx, ty) = ctx_with_type("[N]Built");
        ty.attach_static(Member::ctor(Modifiers::PUBLIC, vec![], 0x1));
        ty.attach_static(Member::ctor(Modifiers::PUBLIC, vec![ty], 0x2));
        assert_eq!(ctx.get_ctor(ty, &[]).unwrap().ctor_parts().unwrap().1, 0x1);
        assert_eq!(ctx.get_ctor(ty, &[ty]).unwrap().ctor_parts().unwrap().1, 0x2);
        assert!(matches!(
            ctx.get_ctor(ty, &[ty, ty]),
            Err(ResolutionError::ConstructorNotFound(_))
        ));
    }

    #[test]
    fn missing_dtor_is_distinguishable() {
        let (ctx, ty) = ctx_with_type("[N]NoDtor");
        assert!(matches!(
            ctx.get_dtor(ty),
            Err(ResolutionError::DestructorNotFound(_))
        ));
        ty.attach_static(Member::dtor(Modifiers::PUBLIC, 0x30));
        assert_eq!(ctx.get_dtor(ty).unwrap().dtor_addr(), Some(0x30));
    }
}
