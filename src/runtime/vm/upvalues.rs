use crate::runtime::{
    gc::GcHandle,
    object::{HeapObject, Upvalue},
};

use super::VM;

impl VM {
    /// Returns the open upvalue for a stack slot, creating one if the slot
    /// has not been captured yet.
    ///
    /// The open list is ordered ascending by slot. Captures target slots
    /// near the top of the stack, so the scan starts at the deep end and
    /// stops at the first upvalue shallower than the slot, which is also
    /// the insertion point.
    pub(super) fn capture_upvalue(&mut self, slot: usize) -> GcHandle {
        let mut insert_at = self.open_upvalues.len();
        while insert_at > 0 {
            let handle = self.open_upvalues[insert_at - 1];
            let open_slot = self.open_slot(handle);
            if open_slot == slot {
                return handle;
            }
            if open_slot < slot {
                break;
            }
            insert_at -= 1;
        }

        let handle = self.make(HeapObject::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Closes every open upvalue whose slot is at or above `threshold`:
    /// the slot's current value moves into the upvalue's owned cell and the
    /// upvalue leaves the open list. A prefix walk from the deepest entry.
    pub(super) fn close_upvalues_upto(&mut self, threshold: usize) {
        while let Some(&handle) = self.open_upvalues.last() {
            let slot = self.open_slot(handle);
            if slot < threshold {
                break;
            }
            self.open_upvalues.pop();
            let value = self.stack[slot];
            *self.heap.upvalue_mut(handle) = Upvalue::Closed(value);
        }
    }

    fn open_slot(&self, handle: GcHandle) -> usize {
        match self.heap.upvalue(handle) {
            Upvalue::Open(slot) => *slot,
            Upvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
        }
    }
}
