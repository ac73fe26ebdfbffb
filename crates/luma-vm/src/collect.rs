//! Stop-the-world mark and sweep over the object arenas.

use crate::error::LuaError;
use crate::heap::{GcHeap, TValueExt};
use crate::vm::Vm;
use luma_core::gc::{GcIdx, UpVal, UpValLocation};
use luma_core::value::TValue;
use log::debug;

/// Gray set of a collection in progress.
#[derive(Default)]
struct Marker {
    values: Vec<TValue>,
    upvals: Vec<GcIdx<UpVal>>,
}

impl Marker {
    /// Mark `v`; newly marked objects are queued for traversal.
    fn mark(&mut self, gc: &mut GcHeap, v: TValue) {
        let newly = if let Some(t) = v.as_table_idx() {
            gc.tables.mark(t)
        } else if let Some(c) = v.as_closure_idx() {
            gc.closures.mark(c)
        } else if let Some(n) = v.as_native_idx() {
            gc.natives.mark(n)
        } else if let Some(u) = v.as_userdata_idx() {
            gc.userdata.mark(u)
        } else if let Some(th) = v.as_thread_idx() {
            gc.threads.mark(th)
        } else {
            false
        };
        if newly {
            self.values.push(v);
        }
    }

    fn mark_upval(&mut self, gc: &mut GcHeap, uv: GcIdx<UpVal>) {
        if gc.upvals.mark(uv) {
            self.upvals.push(uv);
        }
    }

    /// Traverse queued objects until nothing new is reachable.
    fn propagate(&mut self, gc: &mut GcHeap) {
        let mut refs = Vec::new();
        let mut upvals = Vec::new();
        loop {
            if let Some(uv) = self.upvals.pop() {
                let r = match gc.upval(uv).location {
                    UpValLocation::Closed(v) => v,
                    UpValLocation::Open { thread, .. } => TValue::from_thread(GcIdx::new(thread)),
                };
                self.mark(gc, r);
                continue;
            }
            let Some(v) = self.values.pop() else {
                break;
            };
            children(gc, v, &mut refs, &mut upvals);
            for r in refs.drain(..) {
                self.mark(gc, r);
            }
            for uv in upvals.drain(..) {
                self.mark_upval(gc, uv);
            }
        }
    }
}

/// References held by one object.
fn children(gc: &GcHeap, v: TValue, refs: &mut Vec<TValue>, upvals: &mut Vec<GcIdx<UpVal>>) {
    if let Some(t) = v.as_table_idx() {
        let table = gc.table(t);
        refs.extend(table.metatable.map(TValue::from_table));
        refs.extend_from_slice(table.array_values());
        for (k, val) in table.hash_entries() {
            refs.push(k.to_value());
            refs.push(*val);
        }
    } else if let Some(c) = v.as_closure_idx() {
        let cl = gc.closure(c);
        upvals.extend_from_slice(&cl.upvalues);
        refs.push(TValue::from_table(cl.env));
    } else if let Some(n) = v.as_native_idx() {
        let nf = gc.native(n);
        refs.extend_from_slice(&nf.upvalues);
        refs.push(TValue::from_table(nf.env));
    } else if let Some(u) = v.as_userdata_idx() {
        if let Some(ud) = gc.userdata.get(u) {
            refs.extend(ud.metatable.map(TValue::from_table));
            refs.extend(ud.env.map(TValue::from_table));
        }
    } else if let Some(th) = v.as_thread_idx() {
        let thread = gc.thread(th);
        // Suspended Lua frames may hold live registers above the saved top.
        let limit = thread
            .call_stack
            .iter()
            .map(|ci| ci.top)
            .fold(thread.stack_top, usize::max)
            .min(thread.stack.len());
        refs.extend_from_slice(&thread.stack[..limit]);
        upvals.extend(thread.open_upvals.iter().map(|&(_, uv)| uv));
    }
}

impl Vm {
    /// Keep `v` alive across collections until `unpin`.
    pub fn pin(&mut self, v: TValue) {
        self.pinned.push(v);
    }

    /// Drop one pin of `v`. Returns false if it was not pinned.
    pub fn unpin(&mut self, v: TValue) -> bool {
        match self.pinned.iter().position(|p| p.raw_equal(&v)) {
            Some(i) => {
                self.pinned.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Ask for a collection once the outermost call returns.
    pub fn request_collection(&mut self) {
        self.gc_requested = true;
    }

    /// Live objects across all arenas (strings excluded).
    pub fn live_objects(&self) -> usize {
        self.gc.live_objects()
    }

    /// Free every object unreachable from the roots. Returns how many were
    /// freed. Only allowed from the host with no call in progress.
    pub fn collect_garbage(&mut self) -> Result<usize, LuaError> {
        if !self.call_stack.is_empty() || self.current_thread != self.main_thread {
            return Err(LuaError::Runtime(
                "cannot collect garbage while a call is in progress".into(),
            ));
        }
        let before = self.gc.live_objects();
        let mut marker = Marker::default();
        let gc = &mut self.gc;

        marker.mark(gc, TValue::from_table(self.globals));
        marker.mark(gc, TValue::from_table(self.registry));
        marker.mark(gc, TValue::from_thread(self.main_thread));
        let type_mts = gc.type_metatables;
        for mt in type_mts.into_iter().flatten() {
            marker.mark(gc, TValue::from_table(mt));
        }
        for &v in &self.stack[..self.stack_top] {
            marker.mark(gc, v);
        }
        for &(_, uv) in &self.open_upvals {
            marker.mark_upval(gc, uv);
        }
        for &v in &self.pinned {
            marker.mark(gc, v);
        }
        marker.propagate(gc);

        let freed = gc.tables.sweep()
            + gc.closures.sweep()
            + gc.natives.sweep()
            + gc.upvals.sweep()
            + gc.userdata.sweep()
            + gc.threads.sweep();
        debug!(
            "collected {freed} of {before} objects, {} live",
            self.gc.live_objects()
        );
        Ok(freed)
    }
}
