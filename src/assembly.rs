//! Loaded assemblies and the native module export contract.
//!
//! A compiled managed module is a plain dynamic library that exports:
//!
//! * `ulrmeta` — the NUL-terminated metadata blob (see [`crate::metadata`])
//! * `ulraddr` — the member address table, one word per non-field member,
//!   in metadata order
//! * `ulrlocals` / `ulrlocalslen` — the module's GC local root slots
//!   (optional; absent means the module declares no locals)
//! * `ulrlocalsmapping` — compiler bookkeeping for the locals table
//!   (optional, opaque to the runtime)
//! * `InitAssembly` — one-shot initialization hook, invoked at the end of
//!   phase-2 load
//!
//! An [`Assembly`] keeps its [`Library`] open for the life of the process,
//! so every address read out of the exports stays mapped. Assemblies are
//! registered as `&'static` references and never dropped.

use std::ffi::{c_void, CStr};
use std::sync::atomic::AtomicUsize;
use std::sync::OnceLock;

use dashmap::DashMap;
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

use crate::error::LoadError;
use crate::metadata::count_code_members;
use crate::types::TypeHandle;

/// Name of the module initialization hook.
pub const INIT_SYMBOL: &str = "InitAssembly";

/// GC local root slots exported by a module. Each slot holds either null or
/// the address of a live managed object; generated code updates the slots as
/// locals go in and out of scope, and the collector reads them as roots.
pub struct LocalsTable {
    slots: &'static [AtomicUsize],
    /// Address of the compiler's locals mapping export, if present.
    pub mapping_addr: usize,
}

impl LocalsTable {
    pub fn empty() -> Self {
        Self {
            slots: &[],
            mapping_addr: 0,
        }
    }

    /// Wraps externally owned slot memory. The slots must stay mapped for
    /// the life of the process; callers hand in module exports or leaked
    /// allocations.
    pub fn new(slots: &'static [AtomicUsize], mapping_addr: usize) -> Self {
        Self { slots, mapping_addr }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &'static [AtomicUsize] {
        self.slots
    }
}

#[derive(Default)]
struct TypeTable {
    by_name: HashMap<String, TypeHandle>,
    order: Vec<TypeHandle>,
}

/// One read (and possibly loaded) assembly.
///
/// The type table is populated during phase-1 read; member tables inside the
/// types during phase-2 load. `entry` is set if the metadata declares an
/// `.entr` member.
pub struct Assembly {
    pub name: String,
    pub meta: &'static str,
    /// `ulraddr` contents: code addresses of non-field members, positional.
    pub addresses: &'static [usize],
    pub locals: LocalsTable,
    entry: OnceLock<usize>,
    types: RwLock<TypeTable>,
    symbols: DashMap<String, usize>,
    /// Keeps the module mapped. `None` for synthetic assemblies.
    library: Option<Library>,
}

fn export(library: &Library, name: &str) -> Result<usize, LoadError> {
    let symbol: Symbol<*mut c_void> = unsafe { library.get(name.as_bytes()) }
        .map_err(|_| LoadError::MissingExport(name.to_string()))?;
    unsafe { symbol.try_as_raw_ptr() }
        .map(|ptr| ptr as usize)
        .ok_or_else(|| LoadError::MissingExport(name.to_string()))
}

impl Assembly {
    /// Opens a module and reads its export contract. Runs the library's own
    /// load-time initializers, so the path must name a trusted managed
    /// module.
    pub fn from_library(path: &Path) -> Result<Self, LoadError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let library = unsafe { Library::new(path)? };

        let meta_addr = export(&library, "ulrmeta")?;
        let meta = unsafe { CStr::from_ptr(meta_addr as *const _) }
            .to_str()
            .map_err(|_| LoadError::MetadataEncoding)?;
        // meta borrows the library's data segment; the library field below
        // keeps that mapping alive as long as the assembly exists, and
        // assemblies are never dropped once registered.
        let meta: &'static str = unsafe { std::mem::transmute::<&str, &'static str>(meta) };

        let addr_table = export(&library, "ulraddr")?;
        let count = count_code_members(meta)?;
        let addresses: &'static [usize] =
            unsafe { std::slice::from_raw_parts(addr_table as *const usize, count) };

        let locals = match (export(&library, "ulrlocals"), export(&library, "ulrlocalslen")) {
            (Ok(slots_addr), Ok(len_addr)) => {
                let len = unsafe { (len_addr as *const usize).read() };
                let slots = unsafe {
                    std::slice::from_raw_parts(slots_addr as *const AtomicUsize, len)
                };
                let mapping_addr = export(&library, "ulrlocalsmapping").unwrap_or(0);
                LocalsTable::new(slots, mapping_addr)
            }
            _ => LocalsTable::empty(),
        };

        Ok(Self {
            name,
            meta,
            addresses,
            locals,
            entry: OnceLock::new(),
            types: RwLock::new(TypeTable::default()),
            symbols: DashMap::new(),
            library: Some(library),
        })
    }

    /// A synthetic assembly with no backing module. Used for runtime-owned
    /// type containers and for in-process test modules.
    pub fn in_memory(
        name: impl Into<String>,
        meta: &'static str,
        addresses: &'static [usize],
        locals: LocalsTable,
    ) -> Self {
        Self {
            name: name.into(),
            meta,
            addresses,
            locals,
            entry: OnceLock::new(),
            types: RwLock::new(TypeTable::default()),
            symbols: DashMap::new(),
            library: None,
        }
    }

    pub(crate) fn set_entry(&self, addr: usize) {
        // A second .entr in one assembly keeps the first.
        if self.entry.set(addr).is_err() {
            tracing::warn!(assembly = %self.name, "multiple entry points declared; keeping the first");
        }
    }

    pub fn entry_point(&self) -> Option<usize> {
        self.entry.get().copied()
    }

    /// Registers a type under its qualified name. A duplicate name within
    /// one assembly replaces the earlier registration in place.
    pub fn register_type(&self, ty: TypeHandle) {
        let mut table = self.types.write();
        if let Some(old) = table.by_name.insert(ty.qualified_name.clone(), ty) {
            tracing::warn!(
                assembly = %self.name,
                type_name = %ty.qualified_name,
                "duplicate type declaration replaces the earlier one"
            );
            if let Some(slot) = table.order.iter().position(|t| *t == old) {
                table.order[slot] = ty;
                return;
            }
        }
        table.order.push(ty);
    }

    pub fn get_type(&self, qualified_name: &str) -> Option<TypeHandle> {
        self.types.read().by_name.get(qualified_name).copied()
    }

    /// Looks up `qualified_name`, creating and registering it with `make` on
    /// a miss. Atomic under the table's write lock so concurrent callers
    /// observe one registration.
    pub fn get_or_insert_type(
        &self,
        qualified_name: &str,
        make: impl FnOnce() -> TypeHandle,
    ) -> TypeHandle {
        if let Some(existing) = self.get_type(qualified_name) {
            return existing;
        }
        let mut table = self.types.write();
        if let Some(existing) = table.by_name.get(qualified_name) {
            return *existing;
        }
        let ty = make();
        table.by_name.insert(ty.qualified_name.clone(), ty);
        table.order.push(ty);
        ty
    }

    /// Types in declaration order.
    pub fn types_in_order(&self) -> Vec<TypeHandle> {
        self.types.read().order.clone()
    }

    /// Resolves an arbitrary export of the backing module, memoizing the
    /// result. Returns `None` for synthetic assemblies and missing symbols.
    pub fn locate_symbol(&self, name: &str) -> Option<usize> {
        if let Some(cached) = self.symbols.get(name) {
            return Some(*cached);
        }
        let library = self.library.as_ref()?;
        let addr = export(library, name).ok()?;
        self.symbols.insert(name.to_string(), addr);
        Some(addr)
    }

    /// The initialization hook's address, for modules that export one.
    pub fn init_hook(&self) -> Option<usize> {
        match self.library {
            Some(_) => self.locate_symbol(INIT_SYMBOL),
            None => None,
        }
    }
}

impl std::fmt::Debug for Assembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembly")
            .field("name", &self.name)
            .field("types", &self.types.read().order.len())
            .field("addresses", &self.addresses.len())
            .field("locals", &self.locals.len())
            .finish()
    }
}
