//! Heap object model.
//!
//! A reference C-style interpreter typically hangs heap objects off a
//! common struct header, threaded through one intrusive singly-linked
//! "all objects" list so sweep can walk the live heap without a separate
//! table. A raw intrusive list of that kind needs unsafe, aliased
//! pointers into objects the GC is concurrently relocating nothing it
//! "frees" — workable in C, fragile in Rust. Instead `Heap` uses a tagged
//! sum (`Obj`) whose variants carry their fields directly, stored in an
//! arena: a `Vec<Slot>` indexed by [`ObjRef`]. Freeing an object clears
//! its slot and pushes the index onto a free list instead of unlinking a
//! raw pointer; sweeping walks slot indices instead of following `next`.
//!
//! This keeps `ObjRef` equality (reference identity) exactly as cheap as
//! pointer identity, keeps every heap access behind a bounds-checked
//! `Vec` index, and needs zero `unsafe`.

use std::fmt;

/// A handle to a heap-allocated object. `Copy`, and equal iff they name the
/// same arena slot — i.e. reference identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// `Function { name, arity, chunk, upvalue_descriptors[] }`.
#[derive(Debug, Clone)]
pub struct ObjFunction {
    /// `None` for the top-level script and for anonymous `fun` expressions.
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub chunk: crate::chunk::Chunk,
    pub upvalues: Vec<UpvalueDesc>,
}

/// One entry of `Function.upvalue_descriptors[i]`: how the VM materializes
/// upvalue `i` of a closure over this function when `OP_PUSH_CLOSURE` runs.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueDesc {
    pub source_index: u8,
    pub is_local_in_parent: bool,
}

/// `Closure { function, upvalues[] }`.
#[derive(Debug, Clone)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// `Upvalue { loc, closed, next_open }`.
///
/// The intrusive "open upvalues, sorted by descending stack address" list
/// is owned by the VM (`crate::heap::Heap` only stores the object); see
/// `ember_vm::vm::Vm::open_upvalues`. Rather than a raw pointer into the
/// value stack, `loc` is a stack slot index — safe, and the index stays
/// valid because the value stack has fixed capacity and is never resized.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    Open(usize),
    Closed(crate::value::Value),
}

#[derive(Debug, Clone)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
}

/// `String { len, hash, bytes[] }`, immutable, interned.
#[derive(Debug, Clone)]
pub struct ObjString {
    pub hash: u32,
    pub chars: Box<str>,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// FNV-1a, matching the hash used by `crate::table::Table` probing.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// The tagged sum of heap object kinds. What a C-style header would carry
/// (a type tag) is just this enum's discriminant plus the mark bit carried
/// alongside it in [`Slot`] — there is nothing to downcast.
#[derive(Debug, Clone)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
        }
    }

    /// Rough accounting weight for the VM's allocation-triggered collection
    /// threshold; exactness doesn't matter, only that growth moves it.
    pub fn approx_size(&self) -> usize {
        match self {
            Obj::String(s) => std::mem::size_of::<ObjString>() + s.len(),
            Obj::Function(f) => {
                std::mem::size_of::<ObjFunction>() + f.chunk.approx_size()
                    + f.upvalues.len() * std::mem::size_of::<UpvalueDesc>()
            }
            Obj::Closure(c) => {
                std::mem::size_of::<ObjClosure>() + c.upvalues.len() * std::mem::size_of::<ObjRef>()
            }
            Obj::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
        }
    }
}

struct Slot {
    obj: Option<Obj>,
    marked: bool,
}

/// The object arena. Doubles as the "all objects" root sweep walks, and as
/// the allocator `alloc_bytes`/`alloc_threshold` accounting rides on (see
/// `ember_vm::gc`).
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
    objects_live: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            objects_live: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn objects_live(&self) -> usize {
        self.objects_live
    }

    /// Allocate `obj`, returning a handle to it. Updates the running
    /// byte count on every call — the caller (the VM's GC-triggering
    /// allocator, `ember_vm::gc`) is expected to check the collection
    /// threshold *before* calling this, so an object under construction
    /// is never swept mid-build.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.approx_size();
        self.objects_live += 1;
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Slot {
                obj: Some(obj),
                marked: false,
            };
            ObjRef(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                obj: Some(obj),
                marked: false,
            });
            ObjRef(idx)
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.index()]
            .obj
            .as_ref()
            .expect("dangling ObjRef: object was swept while still reachable")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.index()]
            .obj
            .as_mut()
            .expect("dangling ObjRef: object was swept while still reachable")
    }

    pub fn as_string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            other => panic!("ObjRef did not name a string, found {}", other.kind_name()),
        }
    }

    pub fn as_function(&self, r: ObjRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            other => panic!("ObjRef did not name a function, found {}", other.kind_name()),
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> &ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            other => panic!("ObjRef did not name a closure, found {}", other.kind_name()),
        }
    }

    pub fn as_upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            other => panic!("ObjRef did not name an upvalue, found {}", other.kind_name()),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            other => panic!("ObjRef did not name an upvalue, found {}", other.kind_name()),
        }
    }

    // --- GC support (driven by `ember_vm::gc`) ---------------------------

    pub fn clear_marks(&mut self) {
        for slot in &mut self.slots {
            slot.marked = false;
        }
    }

    pub fn mark(&mut self, r: ObjRef) -> bool {
        let slot = &mut self.slots[r.index()];
        let already = slot.marked;
        slot.marked = true;
        !already
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index()].marked
    }

    /// Children of `r` that marking must recurse into: strings have none;
    /// a function's are its name and chunk constants; a closure's are its
    /// function and captured upvalues; an upvalue's is its `closed` value
    /// only while closed (an open upvalue's referent is already covered by
    /// the stack scan).
    pub fn children(&self, r: ObjRef) -> Vec<ObjRef> {
        match self.get(r) {
            Obj::String(_) => Vec::new(),
            Obj::Function(f) => {
                let mut out: Vec<ObjRef> = f.name.into_iter().collect();
                out.extend(f.chunk.constants.iter().filter_map(|v| v.as_obj()));
                out
            }
            Obj::Closure(c) => {
                let mut out = vec![c.function];
                out.extend(c.upvalues.iter().copied());
                out
            }
            Obj::Upvalue(u) => match u.location {
                UpvalueLocation::Closed(v) => v.as_obj().into_iter().collect(),
                UpvalueLocation::Open(_) => Vec::new(),
            },
        }
    }

    /// Render `v` per the printing rules in `spec.md` §6: numbers
    /// integer-valued print without a decimal point, `nil`/`true`/`false`
    /// literally, `Char` as its raw byte, `String` as raw bytes, functions as
    /// `<fn NAME>` / `<anonymous fn>`, closures through their inner
    /// function's printing, builtins as `<builtin fn>`.
    pub fn display_value(&self, v: crate::value::Value) -> String {
        self.render_value(v, false)
    }

    /// As [`Heap::display_value`], but `Char`/`String` are quoted
    /// (`'x'`/`"..."`) the way a disassembler or REPL echo would want.
    pub fn debug_value(&self, v: crate::value::Value) -> String {
        self.render_value(v, true)
    }

    fn render_value(&self, v: crate::value::Value, debug: bool) -> String {
        use crate::value::Value;
        match v {
            Value::Char(b) => {
                if debug {
                    format!("'{}'", b as char)
                } else {
                    (b as char).to_string()
                }
            }
            Value::Obj(r) => match self.get(r) {
                Obj::String(s) => {
                    if debug {
                        format!("\"{}\"", s.as_str())
                    } else {
                        s.as_str().to_string()
                    }
                }
                Obj::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", self.as_string(n).as_str()),
                    None => "<anonymous fn>".to_string(),
                },
                Obj::Closure(c) => self.render_value(crate::value::Value::Obj(c.function), debug),
                Obj::Upvalue(_) => "<upvalue>".to_string(),
            },
            other => format!("{other}"),
        }
    }

    /// Free every unmarked slot, returning how many objects were collected.
    /// `on_free` lets callers (the intern table) react to a string's death.
    pub fn sweep(&mut self, mut on_free: impl FnMut(ObjRef, &Obj)) -> usize {
        let mut collected = 0;
        for idx in 0..self.slots.len() {
            if self.slots[idx].marked {
                continue;
            }
            if let Some(obj) = self.slots[idx].obj.take() {
                on_free(ObjRef(idx as u32), &obj);
                self.bytes_allocated -= obj.approx_size();
                self.objects_live -= 1;
                self.free_list.push(idx as u32);
                collected += 1;
            }
        }
        collected
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn alloc_returns_distinct_refs() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::String(ObjString {
            hash: hash_bytes(b"a"),
            chars: "a".into(),
        }));
        let b = heap.alloc(Obj::String(ObjString {
            hash: hash_bytes(b"b"),
            chars: "b".into(),
        }));
        assert_ne!(a, b);
        assert_eq!(heap.as_string(a).as_str(), "a");
        assert_eq!(heap.as_string(b).as_str(), "b");
    }

    #[test]
    fn sweep_frees_unmarked_and_reuses_slot() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::String(ObjString {
            hash: 0,
            chars: "a".into(),
        }));
        heap.clear_marks();
        // nothing marked -> everything is swept
        let freed = heap.sweep(|_, _| {});
        assert_eq!(freed, 1);
        assert_eq!(heap.objects_live(), 0);

        let b = heap.alloc(Obj::String(ObjString {
            hash: 0,
            chars: "b".into(),
        }));
        // slot reused
        assert_eq!(a, b);
        assert_eq!(heap.as_string(b).as_str(), "b");
    }

    #[test]
    fn marked_objects_survive_sweep() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::String(ObjString {
            hash: 0,
            chars: "keep".into(),
        }));
        heap.clear_marks();
        heap.mark(a);
        let freed = heap.sweep(|_, _| {});
        assert_eq!(freed, 0);
        assert_eq!(heap.as_string(a).as_str(), "keep");
    }

    #[test]
    fn function_children_include_name_and_constants() {
        let mut heap = Heap::new();
        let name = heap.alloc(Obj::String(ObjString {
            hash: 0,
            chars: "f".into(),
        }));
        let konst = heap.alloc(Obj::String(ObjString {
            hash: 0,
            chars: "k".into(),
        }));
        let mut chunk = Chunk::new();
        chunk.add_constant(crate::value::Value::Obj(konst));
        let f = heap.alloc(Obj::Function(ObjFunction {
            name: Some(name),
            arity: 0,
            chunk,
            upvalues: Vec::new(),
        }));
        let mut children = heap.children(f);
        children.sort_by_key(|r| format!("{r:?}"));
        assert!(children.contains(&name));
        assert!(children.contains(&konst));
    }
}
