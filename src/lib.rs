//! Host runtime for separately compiled managed native modules.
//!
//! A managed module is a dynamic library carrying a textual metadata blob
//! and a table of member code addresses (see [`assembly`] for the export
//! contract). The runtime parses the metadata into a type/member graph,
//! answers reflection queries over it, and owns a garbage-collected heap
//! the hosted code allocates from.

use std::ffi::{c_char, c_void};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub mod assembly;
pub mod context;
pub mod error;
pub mod heap;
pub mod loader;
pub mod metadata;
pub mod object;
pub mod types;

use crate::context::{RuntimeContext, StackRange};
use crate::error::{LoadError, RuntimeError};
use crate::types::Type;

/// Standard-library bridge that builds a managed string from a byte slice.
pub const MAKE_STRING_SYMBOL: &str = "special_string_MAKE_FROM_LITERAL";
/// Standard-library bridge that builds a managed array from a raw buffer.
pub const MAKE_ARRAY_SYMBOL: &str = "special_array_from_ptr";

type MakeString = extern "C" fn(*const c_char, i32) -> *mut c_void;
type MakeArray = extern "C" fn(*const *mut c_void, i32, *const Type) -> *mut c_void;
type EntryPoint = extern "C" fn(*mut c_void) -> i32;

#[derive(Parser, Debug)]
#[command(name = "ulrhost", version, about = "Host runtime for managed native modules")]
pub struct Args {
    /// Program module whose entry point is run
    pub assembly: PathBuf,

    /// Standard library module loaded before the program
    #[arg(long, default_value = "ULR.NativeLib.dll")]
    pub stdlib: PathBuf,

    /// Arguments forwarded to the managed entry point
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

/// Installs the global tracing subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Loads the standard library and the program assembly, bridges the host
/// argv into a managed `String[]`, and runs the program's entry point.
pub fn run(args: Args) -> Result<i32, RuntimeError> {
    let ctx: &'static RuntimeContext = Box::leak(Box::new(RuntimeContext::new()));

    let stdlib = loader::ensure_loaded(ctx, &args.stdlib)?;
    let program = loader::ensure_loaded(ctx, &args.assembly)?;

    let entry_addr = program
        .entry_point()
        .ok_or_else(|| LoadError::NoEntryPoint(program.name.clone()))?;

    let make_string_addr = stdlib
        .locate_symbol(MAKE_STRING_SYMBOL)
        .ok_or_else(|| LoadError::MissingExport(MAKE_STRING_SYMBOL.to_string()))?;
    let make_array_addr = stdlib
        .locate_symbol(MAKE_ARRAY_SYMBOL)
        .ok_or_else(|| LoadError::MissingExport(MAKE_ARRAY_SYMBOL.to_string()))?;
    let make_string: MakeString = unsafe { std::mem::transmute(make_string_addr) };
    let make_array: MakeArray = unsafe { std::mem::transmute(make_array_addr) };

    let string_array = ctx.get_type("[System]String[]")?;

    // The bridge calls allocate managed objects before any managed local
    // slot references them, so the buffer that holds their addresses is
    // registered as a conservative root range first. The buffer is sized up
    // front; it never reallocates while registered.
    let mut pinned: Vec<*mut c_void> = vec![std::ptr::null_mut(); args.args.len() + 1];
    let base = pinned.as_ptr() as usize;
    ctx.register_stack_roots(StackRange {
        base,
        top: base + pinned.len() * std::mem::size_of::<usize>(),
    });

    for (slot, arg) in pinned.iter_mut().zip(&args.args) {
        *slot = make_string(arg.as_ptr() as *const c_char, arg.len() as i32);
    }
    let argv_obj = make_array(pinned.as_ptr(), args.args.len() as i32, string_array.as_raw());
    pinned[args.args.len()] = argv_obj;

    let entry: EntryPoint = unsafe { std::mem::transmute(entry_addr) };
    tracing::info!(assembly = %program.name, args = args.args.len(), "invoking entry point");
    let code = entry(argv_obj);

    ctx.unregister_stack_roots();
    drop(pinned);
    tracing::debug!(
        code,
        live_objects = ctx.live_objects(),
        allocated = ctx.allocated_bytes(),
        "entry point returned"
    );
    Ok(code)
}
