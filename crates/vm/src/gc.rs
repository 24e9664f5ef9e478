//! Mark-sweep collection, triggered by `Vm`'s allocation wrappers whenever
//! `Heap::bytes_allocated` crosses `gc_threshold` (doubled after every
//! collection, matching the reference interpreter's growth policy).
//!
//! Roots are: every stack slot in use, every active call frame's function
//! and closure, every global (key and value), and every still-open
//! upvalue. Unlike a C VM that caches `sp`/`ip` in registers and must
//! flush them to the frame before a collection can see accurate roots,
//! this VM keeps them directly in `Vec<Value>`/`CallFrame` fields, so
//! there is nothing to flush — the roots below are already authoritative.

use crate::vm::Vm;
use ember_core::{Obj, ObjRef};

impl Vm {
    pub(crate) fn collect(&mut self) {
        let before = self.heap.bytes_allocated();
        tracing::debug!(bytes = before, threshold = self.gc_threshold, "gc: starting collection");

        self.heap.clear_marks();
        let mut gray: Vec<ObjRef> = Vec::new();

        for v in &self.stack {
            if let Some(r) = v.as_obj() {
                if self.heap.mark(r) {
                    gray.push(r);
                }
            }
        }
        for frame in &self.frames {
            if self.heap.mark(frame.function) {
                gray.push(frame.function);
            }
            if let Some(c) = frame.closure {
                if self.heap.mark(c) {
                    gray.push(c);
                }
            }
        }
        for (key, value) in self.globals.iter() {
            if self.heap.mark(key) {
                gray.push(key);
            }
            if let Some(r) = value.as_obj() {
                if self.heap.mark(r) {
                    gray.push(r);
                }
            }
        }
        for &up in &self.open_upvalues {
            if self.heap.mark(up) {
                gray.push(up);
            }
        }

        while let Some(r) = gray.pop() {
            for child in self.heap.children(r) {
                if self.heap.mark(child) {
                    gray.push(child);
                }
            }
        }

        let interner = &mut self.interner;
        let collected = self.heap.sweep(|r, obj| {
            if matches!(obj, Obj::String(_)) {
                interner.delete_by_ref(r);
            }
        });

        let after = self.heap.bytes_allocated();
        self.gc_threshold = (self.gc_threshold * 2).max(after * 2).max(1024);
        tracing::debug!(collected, bytes_before = before, bytes_after = after, next_threshold = self.gc_threshold, "gc: collection complete");
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::Vm;

    #[test]
    fn collection_frees_unreachable_garbage_and_keeps_reachable_globals() {
        let mut vm = Vm::new();
        vm.interpret("var kept = \"keep-me\";").unwrap();
        for i in 0..50 {
            vm.interpret(&format!("\"garbage-{i}\" + \"-tail\";")).unwrap();
        }
        let before = vm.heap.objects_live();
        vm.collect();
        let after = vm.heap.objects_live();
        assert!(after < before, "collection should reclaim unreachable garbage");

        let kept_ref = ember_core::intern(&mut vm.heap, &mut vm.interner, "kept");
        let v = vm.globals.get(&vm.heap, kept_ref).expect("kept survives collection");
        assert_eq!(vm.heap.display_value(v), "keep-me");
    }
}
