use crate::runtime::{
    frame::Frame,
    gc::GcHandle,
    object::{CodeBlock, Closure, HeapObject, Upvalue},
    table::Table,
    value::Value,
};

/// First collection fires once a megabyte has been allocated.
const INITIAL_GC_LIMIT: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

#[derive(Debug)]
struct HeapEntry {
    object: HeapObject,
    marked: bool,
    /// Shallow size recorded at allocation and released at sweep, so the
    /// byte budget stays balanced even if the object grows afterwards.
    size: usize,
}

/// Stop-the-world mark-and-sweep heap.
///
/// Objects live in a slot arena; the arena itself is the all-objects list
/// (every object occupies exactly one slot), and freed slots are recycled
/// through a free list. Collection is driven by allocation volume: the VM
/// checks [`Heap::should_collect`] before each allocation and hands over
/// its root set to [`Heap::collect`].
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gc_enabled: bool,
    /// Objects protected across multi-step constructions; see
    /// [`Heap::protect`].
    extra_roots: Vec<GcHandle>,
    total_collections: usize,
    total_allocations: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_LIMIT,
            gc_enabled: true,
            extra_roots: Vec::new(),
            total_collections: 0,
            total_allocations: 0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.gc_enabled = enabled;
    }

    /// Lowers (or raises) the byte threshold for the next collection.
    pub fn set_next_gc(&mut self, threshold: usize) {
        self.next_gc = threshold;
    }

    /// Returns `true` when GC is enabled and the allocation budget is spent.
    pub fn should_collect(&self) -> bool {
        self.gc_enabled && self.bytes_allocated >= self.next_gc
    }

    /// Allocates a heap object and returns a stable handle to it.
    ///
    /// The caller is responsible for rooting the object before the next
    /// allocation; collection itself never runs inside `alloc`.
    pub fn alloc(&mut self, object: HeapObject) -> GcHandle {
        let size = object.shallow_size();
        self.bytes_allocated += size;
        self.total_allocations += 1;

        let entry = HeapEntry {
            object,
            marked: false,
            size,
        };
        if let Some(index) = self.free_list.pop() {
            self.entries[index as usize] = Some(entry);
            GcHandle(index)
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Some(entry));
            GcHandle(index)
        }
    }

    /// Immutable access to a live object. Panics on a stale handle, which
    /// can only mean a rooting bug.
    pub fn get(&self, handle: GcHandle) -> &HeapObject {
        &self.entries[handle.index() as usize]
            .as_ref()
            .expect("Heap::get: free or invalid handle")
            .object
    }

    pub fn get_mut(&mut self, handle: GcHandle) -> &mut HeapObject {
        &mut self.entries[handle.index() as usize]
            .as_mut()
            .expect("Heap::get_mut: free or invalid handle")
            .object
    }

    pub fn str_contents(&self, handle: GcHandle) -> &str {
        match self.get(handle) {
            HeapObject::Str(s) => &s.chars,
            other => panic!("expected string object, found {}", other.kind_name()),
        }
    }

    pub fn code_block(&self, handle: GcHandle) -> &CodeBlock {
        match self.get(handle) {
            HeapObject::CodeBlock(cb) => cb,
            other => panic!("expected codeblock object, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, handle: GcHandle) -> &Closure {
        match self.get(handle) {
            HeapObject::Closure(c) => c,
            other => panic!("expected closure object, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, handle: GcHandle) -> &mut Closure {
        match self.get_mut(handle) {
            HeapObject::Closure(c) => c,
            other => panic!("expected closure object, found {}", other.kind_name()),
        }
    }

    pub fn table(&self, handle: GcHandle) -> &Table {
        match self.get(handle) {
            HeapObject::Table(t) => t,
            other => panic!("expected table object, found {}", other.kind_name()),
        }
    }

    pub fn table_mut(&mut self, handle: GcHandle) -> &mut Table {
        match self.get_mut(handle) {
            HeapObject::Table(t) => t,
            other => panic!("expected table object, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, handle: GcHandle) -> &Upvalue {
        match self.get(handle) {
            HeapObject::Upvalue(uv) => uv,
            other => panic!("expected upvalue object, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, handle: GcHandle) -> &mut Upvalue {
        match self.get_mut(handle) {
            HeapObject::Upvalue(uv) => uv,
            other => panic!("expected upvalue object, found {}", other.kind_name()),
        }
    }

    /// Runtime type label of a value, for diagnostics.
    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Num(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Nil => "nil",
            Value::Undefined => "undefined",
            Value::Object(handle) => self.get(handle).kind_name(),
        }
    }

    /// Display form used by `print`, the trace, and the CLI.
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Num(n) => format!("{}", n),
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Object(handle) => match self.get(handle) {
                HeapObject::Str(s) => s.chars.to_string(),
                HeapObject::CodeBlock(cb) => {
                    format!("<codeblock {}>", self.str_contents(cb.name))
                }
                HeapObject::Closure(c) => {
                    let cb = self.code_block(c.code_block);
                    format!("<fn {}>", self.str_contents(cb.name))
                }
                HeapObject::NativeClosure(nc) => {
                    format!("<native fn {}>", self.str_contents(nc.name))
                }
                HeapObject::Upvalue(_) => "<upvalue>".to_string(),
                HeapObject::Table(_) => "<table>".to_string(),
            },
        }
    }

    /// Hash of a value for table storage.
    ///
    /// Numbers hash their IEEE bits (zero-normalised so `0.0` and `-0.0`
    /// collide like they compare), booleans use two fixed constants, and
    /// objects use the string's precomputed content hash or a mix of the
    /// handle index. `Nil`/`Undefined` never reach a table as keys.
    pub fn value_hash(&self, value: Value) -> u64 {
        match value {
            Value::Num(n) => {
                let bits = if n == 0.0 { 0 } else { n.to_bits() };
                mix64(bits)
            }
            Value::Bool(true) => 3,
            Value::Bool(false) => 5,
            Value::Nil | Value::Undefined => 0,
            Value::Object(handle) => match self.get(handle) {
                HeapObject::Str(s) => s.hash,
                _ => mix64(handle.index() as u64),
            },
        }
    }

    /// Protects an object from the collector until [`Heap::unprotect`].
    ///
    /// Required around any multi-step construction holding a handle that is
    /// not yet reachable from a root while further allocation can happen.
    pub fn protect(&mut self, handle: GcHandle) {
        self.extra_roots.push(handle);
    }

    /// Removes one protection of `handle` (protections nest).
    pub fn unprotect(&mut self, handle: GcHandle) {
        if let Some(pos) = self.extra_roots.iter().rposition(|&h| h == handle) {
            self.extra_roots.remove(pos);
        }
    }

    /// Runs a full stop-the-world mark-and-sweep cycle over the given roots:
    /// the live stack window, the closures of all active frames, the open
    /// upvalue list, the globals table, the string intern pool, the last
    /// script result (still readable by the embedder), and the extra-roots
    /// set.
    #[allow(clippy::too_many_arguments)]
    pub fn collect(
        &mut self,
        stack: &[Value],
        frames: &[Frame],
        open_upvalues: &[GcHandle],
        globals: &Table,
        interned: &Table,
        return_value: &Value,
    ) {
        let mut gray: Vec<GcHandle> = Vec::with_capacity(64);

        for &value in stack {
            mark_value(&mut gray, value);
        }
        mark_value(&mut gray, *return_value);
        for frame in frames {
            gray.push(frame.closure);
        }
        gray.extend_from_slice(open_upvalues);
        for (key, value) in globals.iter() {
            mark_value(&mut gray, key);
            mark_value(&mut gray, value);
        }
        for (key, value) in interned.iter() {
            mark_value(&mut gray, key);
            mark_value(&mut gray, value);
        }
        gray.extend_from_slice(&self.extra_roots);

        while let Some(handle) = gray.pop() {
            self.mark_object(handle, &mut gray);
        }

        self.sweep();
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(INITIAL_GC_LIMIT);
        self.total_collections += 1;
    }

    /// Marks one object and enqueues its outgoing references. Handles in
    /// `gray` may repeat; the mark bit makes revisits cheap no-ops.
    fn mark_object(&mut self, handle: GcHandle, gray: &mut Vec<GcHandle>) {
        let entry = match self.entries.get_mut(handle.index() as usize) {
            Some(Some(entry)) => entry,
            _ => return,
        };
        if entry.marked {
            return;
        }
        entry.marked = true;

        match &entry.object {
            HeapObject::Str(_) => {}
            HeapObject::CodeBlock(cb) => {
                gray.push(cb.name);
                for &constant in &cb.block.constants {
                    mark_value(gray, constant);
                }
            }
            HeapObject::Closure(c) => {
                gray.push(c.code_block);
                for upval in c.upvals.iter().flatten() {
                    gray.push(*upval);
                }
            }
            HeapObject::NativeClosure(nc) => gray.push(nc.name),
            // An open upvalue's slot is inside the live stack window, which
            // is marked as a root; only the closed cell carries a reference
            // of its own.
            HeapObject::Upvalue(Upvalue::Open(_)) => {}
            HeapObject::Upvalue(Upvalue::Closed(value)) => mark_value(gray, *value),
            HeapObject::Table(t) => {
                for (key, value) in t.iter() {
                    mark_value(gray, key);
                    mark_value(gray, value);
                }
            }
        }
    }

    fn sweep(&mut self) {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(entry) => {
                    self.bytes_allocated -= entry.size;
                    *slot = None;
                    self.free_list.push(index as u32);
                }
                None => {}
            }
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn total_collections(&self) -> usize {
        self.total_collections
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }
}

fn mark_value(gray: &mut Vec<GcHandle>, value: Value) {
    if let Value::Object(handle) = value {
        gray.push(handle);
    }
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}
