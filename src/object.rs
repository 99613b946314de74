//! The managed-object header.
//!
//! Every heap block the runtime hands out starts with one machine word: a
//! pointer to the object's [`Type`]. That word is the only runtime type
//! identification mechanism, and generated code must never overwrite it. All
//! reads and writes of the header go through [`ObjectPtr`] so the invariant
//! stays auditable in one place.

use crate::types::{Type, TypeHandle};

/// Size of the leading type-identity word.
pub const HEADER_SIZE: usize = std::mem::size_of::<*const Type>();

/// Address of a managed heap block. Plain data; carries no lifetime or
/// ownership, the allocation table in the heap is the source of truth.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectPtr(usize);

impl ObjectPtr {
    pub const NULL: ObjectPtr = ObjectPtr(0);

    pub fn new(addr: usize) -> Self {
        ObjectPtr(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Stamps the type-identity word. Done once, immediately after
    /// allocation, before any code sees the object.
    ///
    /// # Safety
    /// `self` must point to a live allocation of at least [`HEADER_SIZE`]
    /// bytes.
    pub unsafe fn write_type(self, ty: TypeHandle) {
        (self.0 as *mut *const Type).write(ty.as_raw());
    }

    /// Reads the type-identity word back.
    ///
    /// # Safety
    /// `self` must point to a live managed object whose header was written
    /// by [`write_type`](Self::write_type).
    pub unsafe fn type_of(self) -> TypeHandle {
        TypeHandle(&*(self.0 as *const *const Type).read())
    }

    /// First byte past the header; where a boxed value's payload lives.
    pub fn payload(self) -> *mut u8 {
        (self.0 + HEADER_SIZE) as *mut u8
    }

    /// Extracts a boxed value written by the allocator's boxing entry point.
    ///
    /// # Safety
    /// The object must have been produced by boxing a value of type `T`.
    pub unsafe fn unbox<T: Copy>(self) -> T {
        (self.payload() as *const T).read_unaligned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Modifiers, Type, TypeKind};

    #[test]
    fn header_round_trips_type_identity() {
        let ty = Type::new(TypeKind::Class, "test.dll", "[T]Header", Modifiers::PUBLIC, 16).leak();
        let mut block = [0u8; 16];
        let obj = ObjectPtr::new(block.as_mut_ptr() as usize);
        unsafe {
            obj.write_type(ty);
            assert_eq!(obj.type_of(), ty);
        }
    }
}
