//! The managed heap and its tracing collector.
//!
//! Objects are raw blocks from the global allocator, tracked in an
//! allocation table (address to size). Collection is stop-the-world within
//! the heap lock: gather roots, mark with an explicit worklist, then sweep
//! every unmarked object by running its destructor and freeing the block.
//!
//! Roots come from three places: non-null module local slots, static field
//! slots, and words conservatively read out of registered stack ranges.
//! Every candidate word is filtered through the allocation table, so a
//! stale or arbitrary word can never mark a non-object.
//!
//! Destructors run inside the collection's exclusion domain: a destructor
//! that calls back into the allocator deadlocks. The module contract
//! requires destructors to release foreign resources only.
//!
//! Allocation triggers a collection only past both gates: the heap must
//! exceed [`GC_TRIGGER_SIZE`] and must have grown by at least
//! [`GC_MIN_GROWTH`] since the last sweep's reachable baseline. Small hot
//! loops below the threshold never pay for a trace.

use std::alloc::{self, Layout};
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::Ordering;

use libffi::middle::{Arg, Cif, CodePtr, Type as FfiType};
use parking_lot::Mutex;

use crate::context::RuntimeContext;
use crate::error::HeapError;
use crate::object::{ObjectPtr, HEADER_SIZE};
use crate::types::members::{FieldStorage, Member};
use crate::types::TypeHandle;

const MB: usize = 1024 * 1024;

/// Heap size past which allocations consider collecting.
pub const GC_TRIGGER_SIZE: usize = 64 * MB;

/// Minimum growth over the last reachable baseline before a collection
/// actually runs.
pub const GC_MIN_GROWTH: usize = 10 * MB;

/// Outcome of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcResult {
    pub bytes_collected: usize,
    pub objects_collected: usize,
}

pub(crate) struct Heap {
    state: Mutex<HeapState>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                objects: HashMap::new(),
                allocated: 0,
                prev_reachable: 0,
                last_result: GcResult::default(),
            }),
        }
    }
}

struct HeapState {
    /// Allocation table: block address to block size. Membership here is
    /// the definition of "managed object".
    objects: HashMap<usize, usize>,
    allocated: usize,
    /// Live bytes after the last sweep; the growth baseline.
    prev_reachable: usize,
    last_result: GcResult,
}

fn layout_for(size: usize) -> Result<Layout, HeapError> {
    Layout::from_size_align(size.max(1), std::mem::align_of::<usize>())
        .map_err(|_| HeapError::AllocationTooLarge(size))
}

impl HeapState {
    fn allocate(&mut self, size: usize, zeroed: bool) -> Result<ObjectPtr, HeapError> {
        let layout = layout_for(size)?;
        let ptr = unsafe {
            if zeroed {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        self.objects.insert(ptr as usize, size);
        self.allocated += size;
        Ok(ObjectPtr::new(ptr as usize))
    }

    fn should_collect(&self, incoming: usize) -> bool {
        let projected = self.allocated + incoming;
        projected > GC_TRIGGER_SIZE
            && projected.saturating_sub(self.prev_reachable) > GC_MIN_GROWTH
    }
}

impl RuntimeContext {
    /// Allocates a managed block, collecting first if the heap has crossed
    /// both trigger gates. The caller stamps the type header.
    pub fn allocate_object(&self, size: usize) -> Result<ObjectPtr, HeapError> {
        self.allocate_inner(size, false, true)
    }

    /// Zero-initialized variant of [`allocate_object`](Self::allocate_object).
    pub fn allocate_zeroed(&self, size: usize) -> Result<ObjectPtr, HeapError> {
        self.allocate_inner(size, true, true)
    }

    /// Allocates without ever triggering a collection. For callers holding
    /// object addresses the collector cannot yet see.
    pub fn allocate_object_nogc(&self, size: usize) -> Result<ObjectPtr, HeapError> {
        self.allocate_inner(size, false, false)
    }

    pub fn allocate_zeroed_nogc(&self, size: usize) -> Result<ObjectPtr, HeapError> {
        self.allocate_inner(size, true, false)
    }

    fn allocate_inner(&self, size: usize, zeroed: bool, gc: bool) -> Result<ObjectPtr, HeapError> {
        let mut state = self.heap.state.lock();
        if gc && state.should_collect(size) {
            self.collect_locked(&mut state)?;
        }
        state.allocate(size, zeroed)
    }

    /// Forces a full collection and reports what it freed.
    pub fn collect(&self) -> Result<GcResult, HeapError> {
        let mut state = self.heap.state.lock();
        self.collect_locked(&mut state)
    }

    /// Result of the most recent collection.
    pub fn last_gc(&self) -> GcResult {
        self.heap.state.lock().last_result
    }

    pub fn allocated_bytes(&self) -> usize {
        self.heap.state.lock().allocated
    }

    pub fn live_objects(&self) -> usize {
        self.heap.state.lock().objects.len()
    }

    fn collect_locked(&self, state: &mut HeapState) -> Result<GcResult, HeapError> {
        let mut marked: HashSet<usize> = HashSet::new();
        let mut worklist: Vec<usize> = Vec::new();
        for root in self.gather_roots(state) {
            if marked.insert(root) {
                worklist.push(root);
            }
        }
        while let Some(addr) = worklist.pop() {
            let ty = unsafe { ObjectPtr::new(addr).type_of() };
            for offset in ty.instance_field_offsets() {
                let word = unsafe { ((addr + offset) as *const usize).read() };
                if state.objects.contains_key(&word) && marked.insert(word) {
                    worklist.push(word);
                }
            }
        }

        // Plan the whole sweep before running any destructor, so a missing
        // destructor aborts with the heap untouched.
        let mut doomed: Vec<(usize, usize, usize)> = Vec::new();
        for (&addr, &size) in &state.objects {
            if marked.contains(&addr) {
                continue;
            }
            let ty = unsafe { ObjectPtr::new(addr).type_of() };
            let dtor = self
                .get_dtor(ty)
                .map_err(|_| HeapError::MissingDestructor(ty.display_name()))?;
            if let Some(dtor_addr) = dtor.dtor_addr() {
                doomed.push((addr, size, dtor_addr));
            }
        }

        let mut result = GcResult::default();
        for (addr, size, dtor_addr) in doomed {
            unsafe {
                invoke_dtor(dtor_addr, addr);
                alloc::dealloc(addr as *mut u8, layout_for(size)?);
            }
            state.objects.remove(&addr);
            result.bytes_collected += size;
            result.objects_collected += 1;
        }

        state.allocated -= result.bytes_collected;
        state.prev_reachable = state.allocated;
        state.last_result = result;
        tracing::debug!(
            bytes = result.bytes_collected,
            objects = result.objects_collected,
            live = state.allocated,
            "collection complete"
        );
        Ok(result)
    }

    /// Root set: non-null local slots, static field words, and registered
    /// stack range words, each filtered through the allocation table.
    fn gather_roots(&self, state: &HeapState) -> Vec<usize> {
        let mut roots = Vec::new();
        for assembly in self.loaded_in_order() {
            for slot in assembly.locals.slots() {
                let value = slot.load(Ordering::Relaxed);
                if value != 0 && state.objects.contains_key(&value) {
                    roots.push(value);
                }
            }
            for ty in assembly.types_in_order() {
                for member in ty.static_members() {
                    if let Some((_, storage @ FieldStorage::Static { .. })) = member.field_parts()
                    {
                        let value = unsafe { storage.load_word(0) };
                        if state.objects.contains_key(&value) {
                            roots.push(value);
                        }
                    }
                }
            }
        }
        for word in self.stack_root_words() {
            if state.objects.contains_key(&word) {
                roots.push(word);
            }
        }
        roots
    }

    /// Allocates an instance of `ty`, stamps its header, and runs `ctor`
    /// over it with `args` as word-size values. `ctor` must actually be a
    /// constructor; nothing is allocated otherwise.
    pub fn construct_object(
        &self,
        ty: TypeHandle,
        ctor: &Member,
        args: &[usize],
    ) -> Result<ObjectPtr, HeapError> {
        let (_, addr) = ctor
            .ctor_parts()
            .ok_or_else(|| HeapError::NotAConstructor(ctor.full_name()))?;
        let obj = self.allocate_zeroed(ty.size)?;
        unsafe {
            obj.write_type(ty);
            invoke_ctor(addr, obj.addr(), args);
        }
        Ok(obj)
    }

    /// Boxes a scalar: a header plus an unaligned copy of `value`.
    pub fn box_value<T: Copy>(&self, ty: TypeHandle, value: T) -> Result<ObjectPtr, HeapError> {
        let obj = self.allocate_object(HEADER_SIZE + std::mem::size_of::<T>())?;
        unsafe {
            obj.write_type(ty);
            (obj.payload() as *mut T).write_unaligned(value);
        }
        Ok(obj)
    }
}

/// # Safety
/// `addr` must be the address of an `extern "C" fn(*mut c_void)` destructor
/// and `obj` a live managed object of its declaring type.
unsafe fn invoke_dtor(addr: usize, obj: usize) {
    let cif = Cif::new(vec![FfiType::pointer()], FfiType::void());
    let obj_ptr = obj as *const c_void;
    cif.call::<()>(CodePtr::from_ptr(addr as *const c_void), &[Arg::new(&obj_ptr)]);
}

/// # Safety
/// `addr` must be a constructor taking the object pointer followed by
/// `args.len()` word-size arguments.
unsafe fn invoke_ctor(addr: usize, obj: usize, args: &[usize]) {
    let mut types = vec![FfiType::pointer()];
    types.extend(args.iter().map(|_| FfiType::usize()));
    let cif = Cif::new(types, FfiType::void());
    let obj_ptr = obj as *const c_void;
    let mut ffi_args = vec![Arg::new(&obj_ptr)];
    ffi_args.extend(args.iter().map(Arg::new));
    cif.call::<()>(CodePtr::from_ptr(addr as *const c_void), &ffi_args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Modifiers, Type, TypeKind};

    #[test]
    fn trigger_needs_both_gates() {
        let mut state = HeapState {
            objects: HashMap::new(),
            allocated: 0,
            prev_reachable: 0,
            last_result: GcResult::default(),
        };
        assert!(!state.should_collect(1024), "small heaps never collect");

        state.allocated = GC_TRIGGER_SIZE;
        assert!(state.should_collect(1024), "past the threshold with zero baseline");

        // recently swept: reachable baseline close to the current size
        state.prev_reachable = state.allocated;
        assert!(!state.should_collect(1024), "insufficient growth since last sweep");
        assert!(state.should_collect(GC_MIN_GROWTH + 1));
    }

    #[test]
    fn nogc_allocations_never_collect() {
        let ctx = RuntimeContext::new();
        // past both gates and completely unrooted, yet untouched
        ctx.allocate_object_nogc(GC_TRIGGER_SIZE + MB).unwrap();
        ctx.allocate_zeroed_nogc(64).unwrap();
        assert_eq!(ctx.live_objects(), 2);
        assert_eq!(ctx.last_gc(), GcResult::default());
    }

    #[test]
    fn box_and_unbox_round_trip() {
        let ctx = RuntimeContext::new();
        let ty = Type::new(TypeKind::Struct, "test.dll", "[S]Int64", Modifiers::PUBLIC, 16).leak();
        let obj = ctx.box_value(ty, 0x1122_3344_5566_7788u64).unwrap();
        unsafe {
            assert_eq!(obj.type_of(), ty);
            assert_eq!(obj.unbox::<u64>(), 0x1122_3344_5566_7788);
        }
    }

    #[test]
    fn unreachable_object_without_dtor_aborts_the_sweep() {
        let ctx = RuntimeContext::new();
        let ty = Type::new(TypeKind::Class, "test.dll", "[S]Plain", Modifiers::PUBLIC, 16).leak();
        let obj = ctx.allocate_zeroed(ty.size).unwrap();
        unsafe { obj.write_type(ty) };
        assert!(matches!(
            ctx.collect(),
            Err(HeapError::MissingDestructor(name)) if name == "S.Plain"
        ));
        // nothing was freed
        assert_eq!(ctx.live_objects(), 1);
        assert_eq!(ctx.allocated_bytes(), 16);
    }

    extern "C" fn noop_dtor(_obj: *mut c_void) {}

    extern "C" fn pair_ctor(obj: *mut c_void, first: usize, second: usize) {
        unsafe {
            let words = obj as *mut usize;
            words.add(1).write(first);
            words.add(2).write(second);
        }
    }

    #[test]
    fn construct_rejects_non_constructor_members() {
        use std::sync::atomic::AtomicUsize;
        static CALLED: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn not_a_ctor(_obj: *mut c_void) {
            CALLED.fetch_add(1, Ordering::SeqCst);
        }

        let ctx = RuntimeContext::new();
        let ty = Type::new(TypeKind::Class, "test.dll", "[S]Strict", Modifiers::PUBLIC, 16).leak();
        let method = crate::types::members::Member::method(
            "Get",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![ty],
            not_a_ctor as usize,
        );
        assert!(matches!(
            ctx.construct_object(ty, &method, &[]),
            Err(HeapError::NotAConstructor(_))
        ));
        assert_eq!(CALLED.load(Ordering::SeqCst), 0, "the member must never run");
        assert_eq!(ctx.live_objects(), 0, "nothing may leak from the rejected call");
    }

    #[test]
    fn construct_runs_the_bound_constructor() {
        let ctx = RuntimeContext::new();
        let ty = Type::new(TypeKind::Class, "test.dll", "[S]Pair", Modifiers::PUBLIC, 24).leak();
        let ctor = crate::types::members::Member::ctor(
            Modifiers::PUBLIC,
            vec![ty, ty],
            pair_ctor as usize,
        );
        let obj = ctx.construct_object(ty, &ctor, &[7, 9]).unwrap();
        unsafe {
            assert_eq!(obj.type_of(), ty);
            let words = obj.addr() as *const usize;
            assert_eq!(words.add(1).read(), 7);
            assert_eq!(words.add(2).read(), 9);
        }
    }

    #[test]
    fn sweep_frees_unrooted_objects_and_resets_the_baseline() {
        let ctx = RuntimeContext::new();
        let ty = Type::new(TypeKind::Class, "test.dll", "[S]Temp", Modifiers::PUBLIC, 24).leak();
        ty.attach_static(crate::types::members::Member::dtor(
            Modifiers::PUBLIC,
            noop_dtor as usize,
        ));
        for _ in 0..3 {
            let obj = ctx.allocate_zeroed(ty.size).unwrap();
            unsafe { obj.write_type(ty) };
        }
        assert_eq!(ctx.allocated_bytes(), 72);

        let result = ctx.collect().unwrap();
        assert_eq!(result.objects_collected, 3);
        assert_eq!(result.bytes_collected, 72);
        assert_eq!(ctx.allocated_bytes(), 0);
        assert_eq!(ctx.live_objects(), 0);
        assert_eq!(ctx.last_gc(), result);
    }
}
