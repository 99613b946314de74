//! Two-phase assembly loading.
//!
//! Phase 1 (*read*) opens the module, parses every type header out of its
//! metadata, and registers empty types by qualified name. Phase 2 (*load*)
//! re-walks the metadata, resolves member signatures against everything
//! read so far, binds each non-field member to its positional slot in the
//! module's address table, and finally runs the module's init hook.
//!
//! The split exists because signatures reference types across assemblies:
//! reading everything first means load order never matters for resolution.
//! Loads are serialized on the context's reentrant lock, and an assembly is
//! registered as loaded *before* its init hook runs, so a hook that
//! re-enters the loader (directly or through lazy type resolution) sees the
//! cached registration instead of recursing.

use std::ffi::c_void;
use std::path::Path;

use libffi::middle::{Arg, Cif, CodePtr, Type as FfiType};

use crate::assembly::Assembly;
use crate::context::RuntimeContext;
use crate::error::{LoadError, MetadataError, ResolutionError};
use crate::metadata::{MetaReader, RawMember};
use crate::types::members::Member;
use crate::types::{Modifiers, Type, TypeHandle};

/// Phase 1: opens the module at `path` and registers its type headers.
/// Idempotent; re-reading a path returns the existing registration.
pub fn read_assembly(
    ctx: &RuntimeContext,
    path: &Path,
) -> Result<&'static Assembly, LoadError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    if let Some(existing) = ctx.get_read(&name) {
        return Ok(existing);
    }
    tracing::debug!(assembly = %name, "reading assembly headers");
    let assembly = Assembly::from_library(path)?;
    register_headers(ctx, assembly)
}

/// Phase 1 for a synthetic assembly (no backing module).
pub fn read_in_memory(
    ctx: &RuntimeContext,
    assembly: Assembly,
) -> Result<&'static Assembly, LoadError> {
    if let Some(existing) = ctx.get_read(&assembly.name) {
        return Ok(existing);
    }
    register_headers(ctx, assembly)
}

fn register_headers(
    ctx: &RuntimeContext,
    assembly: Assembly,
) -> Result<&'static Assembly, LoadError> {
    let mut reader = MetaReader::new(assembly.meta);
    while !reader.at_end() {
        let header = reader.read_type_header()?;
        reader.skip_members()?;
        let ty = Type::new(
            header.kind,
            assembly.name.clone(),
            header.qualified_name,
            header.modifiers,
            header.size,
        )
        .leak();
        assembly.register_type(ty);
    }
    Ok(ctx.register_read(assembly))
}

/// Phase 2: binds members and runs the init hook. Idempotent; loading an
/// already-loaded assembly returns the cached registration.
pub fn load_assembly(
    ctx: &RuntimeContext,
    name: &str,
) -> Result<&'static Assembly, LoadError> {
    let _guard = ctx.load_lock.lock();
    if let Some(loaded) = ctx.get_loaded(name) {
        return Ok(loaded);
    }
    let assembly = ctx
        .get_read(name)
        .ok_or_else(|| LoadError::AssemblyNotRead(name.to_string()))?;
    tracing::debug!(assembly = %name, "loading assembly members");
    bind_members(ctx, assembly)?;
    ctx.register_loaded(assembly);
    if let Some(init) = assembly.init_hook() {
        tracing::debug!(assembly = %name, addr = init, "running init hook");
        unsafe { call_init(init, ctx) };
    }
    Ok(assembly)
}

/// Read-then-load convenience for host startup.
pub fn ensure_loaded(
    ctx: &RuntimeContext,
    path: &Path,
) -> Result<&'static Assembly, LoadError> {
    let assembly = read_assembly(ctx, path)?;
    load_assembly(ctx, &assembly.name)
}

fn bind_members(ctx: &RuntimeContext, assembly: &'static Assembly) -> Result<(), LoadError> {
    let mut reader = MetaReader::new(assembly.meta);
    // One address-table slot per non-field member, in metadata order, shared
    // across all type lines of the module.
    let mut next_addr = 0usize;
    while !reader.at_end() {
        let header = reader.read_type_header()?;
        let ty = assembly
            .get_type(&header.qualified_name)
            .ok_or_else(|| ResolutionError::TypeNotFound(header.qualified_name.clone()))?;
        while let Some(raw) = reader.next_member()? {
            let addr = *assembly
                .addresses
                .get(next_addr)
                .ok_or(MetadataError::AddressTableExhausted { index: next_addr })?;
            next_addr += 1;
            bind_one(ctx, assembly, ty, raw, addr)?;
        }
    }
    Ok(())
}

fn bind_one(
    ctx: &RuntimeContext,
    assembly: &Assembly,
    ty: TypeHandle,
    raw: RawMember,
    addr: usize,
) -> Result<(), LoadError> {
    match raw {
        RawMember::Constructor { modifiers, args } => {
            let signature = resolve_signature(ctx, &args, None)?;
            ty.attach_static(Member::ctor(modifiers, signature, addr));
        }
        RawMember::EntryPoint {
            modifiers,
            return_type,
            name,
            args,
        } => {
            let signature = resolve_signature(ctx, &args, Some(&return_type))?;
            ty.attach_static(Member::method(name, modifiers, signature, addr));
            assembly.set_entry(addr);
        }
        RawMember::Method {
            modifiers,
            return_type,
            name,
            args,
        } => {
            let signature = resolve_signature(ctx, &args, Some(&return_type))?;
            let member = Member::method(name, modifiers, signature, addr);
            if modifiers.contains(Modifiers::STATIC) {
                ty.attach_static(member);
            } else {
                ty.attach_instance(member);
            }
        }
    }
    Ok(())
}

fn resolve_signature(
    ctx: &RuntimeContext,
    args: &[String],
    return_type: Option<&str>,
) -> Result<Vec<TypeHandle>, LoadError> {
    let mut signature = Vec::with_capacity(args.len() + usize::from(return_type.is_some()));
    for arg in args {
        signature.push(ctx.resolve_read_type(arg)?);
    }
    if let Some(ret) = return_type {
        signature.push(ctx.resolve_read_type(ret)?);
    }
    Ok(signature)
}

/// # Safety
/// `addr` must be the address of an `extern "C" fn(*const c_void)`.
unsafe fn call_init(addr: usize, ctx: &RuntimeContext) {
    let cif = Cif::new(vec![FfiType::pointer()], FfiType::void());
    let ctx_ptr = ctx as *const RuntimeContext as *const c_void;
    cif.call::<()>(CodePtr::from_ptr(addr as *const c_void), &[Arg::new(&ctx_ptr)]);
}
