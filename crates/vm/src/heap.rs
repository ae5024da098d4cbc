//! The object arena and generational mark-and-sweep collector.
//!
//! Objects live in arena slots addressed by [`ObjRef`]; swept slots are
//! threaded onto an intrusive free list and reused. Collection is
//! stop-the-world (callers hold the GVL): a minor cycle traces only the
//! nursery plus the remembered set, a major cycle traces everything.
//! An object's generation advances by one per survived minor cycle;
//! crossing [`OLD_MIN`] it leaves the nursery.
//!
//! Old-to-young edges are tracked in a remembered set fed from two
//! places: the write barrier (`obj_write`) when an old parent stores a
//! young child, and promotion itself, since an object may carry young
//! children with it when it ages out of the nursery. Major cycles prune
//! the set back to old objects that still hold young children.

use crate::object::{
    hash_bytes, HeapObj, InstanceCore, InternalData, ObjBody, ObjFlags, ObjHeader, ObjKind,
    ObjRef, StringObj, UpvalueState, OLD_MAX, OLD_MIN,
};
use crate::value::Value;
use hashbrown::HashSet;

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// Collector counters surfaced through `GC.stats`.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub minor_cycles: u64,
    pub major_cycles: u64,
    pub objects_freed: u64,
    pub finalizers_scheduled: u64,
}

/// What a collection cycle produced: objects whose finalizers must run
/// before their memory is reclaimed on a later cycle.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub freed: usize,
    /// `(object, finalizer callable)` pairs to run with the GVL held.
    pub finalizable: Vec<(ObjRef, ObjRef)>,
}

/// The object arena plus collector state.
pub struct Heap {
    slots: Vec<HeapObj>,
    free_head: Option<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    pub gc_enabled: bool,
    next_object_id: u64,
    remembered: HashSet<ObjRef>,
    pub stats: GcStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
            gc_enabled: true,
            next_object_id: 1,
            remembered: HashSet::new(),
            stats: GcStats::default(),
        }
    }

    // ---- allocation ----

    /// Allocates a new object slot. Does not trigger collection; the VM
    /// wrapper decides when to collect before calling this.
    pub fn alloc(&mut self, kind: ObjKind, body: ObjBody, flags: ObjFlags) -> ObjRef {
        let id = self.next_object_id;
        self.next_object_id += 1;
        let mut header = ObjHeader::new(kind, id);
        header.flags = flags;

        let size = body_size(&body);
        self.bytes_allocated += size;

        let r = match self.free_head {
            Some(index) => {
                let next = match self.slots[index as usize].body {
                    ObjBody::Free { next_free } => next_free,
                    _ => unreachable!("free list points at a live slot"),
                };
                self.free_head = next;
                self.slots[index as usize] = HeapObj { header, body };
                ObjRef::from_raw(index)
            }
            None => {
                self.slots.push(HeapObj { header, body });
                ObjRef::from_raw((self.slots.len() - 1) as u32)
            }
        };
        r
    }

    /// Allocates a class-less string. The VM attaches core classes
    /// after bootstrap; tests use this directly.
    pub fn alloc_plain_string(&mut self, bytes: Vec<u8>) -> ObjRef {
        self.alloc(
            ObjKind::String,
            ObjBody::String(StringObj::new(InstanceCore::default(), bytes)),
            ObjFlags::INSTANCE_LIKE,
        )
    }

    /// True when allocated bytes have crossed the scaled threshold.
    pub fn wants_gc(&self) -> bool {
        self.gc_enabled && self.bytes_allocated > self.next_gc
    }

    /// Live object count (all generations).
    pub fn live_objects(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.body, ObjBody::Free { .. }))
            .count()
    }

    /// Live objects of one kind; GC diagnostics and tests.
    pub fn live_of_kind(&self, kind: ObjKind) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.body, ObjBody::Free { .. }) && s.header.kind == kind)
            .count()
    }

    /// Byte footprint of live objects, computed on demand.
    pub fn live_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.body, ObjBody::Free { .. }))
            .map(|s| body_size(&s.body))
            .sum()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // ---- access ----

    pub fn get(&self, r: ObjRef) -> &HeapObj {
        &self.slots[r.index()]
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObj {
        &mut self.slots[r.index()]
    }

    pub fn kind(&self, r: ObjRef) -> ObjKind {
        self.get(r).header.kind
    }

    pub fn is_kind(&self, v: &Value, kind: ObjKind) -> bool {
        matches!(v, Value::Obj(r) if self.kind(*r) == kind)
    }

    pub fn header(&self, r: ObjRef) -> &ObjHeader {
        &self.get(r).header
    }

    pub fn header_mut(&mut self, r: ObjRef) -> &mut ObjHeader {
        &mut self.get_mut(r).header
    }

    pub fn set_flag(&mut self, r: ObjRef, flag: ObjFlags) {
        self.header_mut(r).flags |= flag;
    }

    pub fn unset_flag(&mut self, r: ObjRef, flag: ObjFlags) {
        self.header_mut(r).flags &= !flag;
    }

    pub fn has_flag(&self, r: ObjRef, flag: ObjFlags) -> bool {
        self.header(r).flags.contains(flag)
    }

    // Typed accessors. Kind mismatches are internal invariant
    // violations; guest-facing type checks happen before these.

    pub fn string(&self, r: ObjRef) -> &StringObj {
        match &self.get(r).body {
            ObjBody::String(s) => s,
            other => panic!("expected String at {r:?}, found {other:?}"),
        }
    }

    pub fn string_mut(&mut self, r: ObjRef) -> &mut StringObj {
        match &mut self.get_mut(r).body {
            ObjBody::String(s) => s,
            _ => panic!("expected String at {r:?}"),
        }
    }

    pub fn array(&self, r: ObjRef) -> &crate::object::ArrayObj {
        match &self.get(r).body {
            ObjBody::Array(a) => a,
            _ => panic!("expected Array at {r:?}"),
        }
    }

    pub fn array_mut(&mut self, r: ObjRef) -> &mut crate::object::ArrayObj {
        match &mut self.get_mut(r).body {
            ObjBody::Array(a) => a,
            _ => panic!("expected Array at {r:?}"),
        }
    }

    pub fn map(&self, r: ObjRef) -> &crate::object::MapObj {
        match &self.get(r).body {
            ObjBody::Map(m) => m,
            _ => panic!("expected Map at {r:?}"),
        }
    }

    pub fn map_mut(&mut self, r: ObjRef) -> &mut crate::object::MapObj {
        match &mut self.get_mut(r).body {
            ObjBody::Map(m) => m,
            _ => panic!("expected Map at {r:?}"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::InstanceObj {
        match &self.get(r).body {
            ObjBody::Instance(i) => i,
            _ => panic!("expected Instance at {r:?}"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut crate::object::InstanceObj {
        match &mut self.get_mut(r).body {
            ObjBody::Instance(i) => i,
            _ => panic!("expected Instance at {r:?}"),
        }
    }

    /// Class body accessor; valid for Class and Module objects.
    pub fn class(&self, r: ObjRef) -> &crate::object::ClassObj {
        match &self.get(r).body {
            ObjBody::Class(c) => c,
            _ => panic!("expected Class/Module at {r:?}"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut crate::object::ClassObj {
        match &mut self.get_mut(r).body {
            ObjBody::Class(c) => c,
            _ => panic!("expected Class/Module at {r:?}"),
        }
    }

    pub fn iclass(&self, r: ObjRef) -> &crate::object::IClassObj {
        match &self.get(r).body {
            ObjBody::IClass(i) => i,
            _ => panic!("expected IClass at {r:?}"),
        }
    }

    pub fn iclass_mut(&mut self, r: ObjRef) -> &mut crate::object::IClassObj {
        match &mut self.get_mut(r).body {
            ObjBody::IClass(i) => i,
            _ => panic!("expected IClass at {r:?}"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::FunctionObj {
        match &self.get(r).body {
            ObjBody::Function(f) => f,
            _ => panic!("expected Function at {r:?}"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut crate::object::FunctionObj {
        match &mut self.get_mut(r).body {
            ObjBody::Function(f) => f,
            _ => panic!("expected Function at {r:?}"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::ClosureObj {
        match &self.get(r).body {
            ObjBody::Closure(c) => c,
            _ => panic!("expected Closure at {r:?}"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::ClosureObj {
        match &mut self.get_mut(r).body {
            ObjBody::Closure(c) => c,
            _ => panic!("expected Closure at {r:?}"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::UpvalueObj {
        match &self.get(r).body {
            ObjBody::Upvalue(u) => u,
            _ => panic!("expected Upvalue at {r:?}"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::UpvalueObj {
        match &mut self.get_mut(r).body {
            ObjBody::Upvalue(u) => u,
            _ => panic!("expected Upvalue at {r:?}"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &crate::object::BoundMethodObj {
        match &self.get(r).body {
            ObjBody::BoundMethod(b) => b,
            _ => panic!("expected BoundMethod at {r:?}"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &crate::object::NativeObj {
        match &self.get(r).body {
            ObjBody::Native(n) => n,
            _ => panic!("expected Native at {r:?}"),
        }
    }

    pub fn internal(&self, r: ObjRef) -> &crate::object::InternalObj {
        match &self.get(r).body {
            ObjBody::Internal(i) => i,
            _ => panic!("expected Internal at {r:?}"),
        }
    }

    pub fn internal_mut(&mut self, r: ObjRef) -> &mut crate::object::InternalObj {
        match &mut self.get_mut(r).body {
            ObjBody::Internal(i) => i,
            _ => panic!("expected Internal at {r:?}"),
        }
    }

    pub fn scope(&self, r: ObjRef) -> &crate::object::ScopeObj {
        match &self.get(r).body {
            ObjBody::Scope(s) => s,
            _ => panic!("expected Scope at {r:?}"),
        }
    }

    /// The instance-like head of an object, if it has one.
    pub fn instance_core(&self, r: ObjRef) -> Option<&InstanceCore> {
        match &self.get(r).body {
            ObjBody::String(s) => Some(&s.core),
            ObjBody::Array(a) => Some(&a.core),
            ObjBody::Map(m) => Some(&m.core),
            ObjBody::Instance(i) => Some(&i.core),
            ObjBody::Class(c) => Some(&c.core),
            _ => None,
        }
    }

    pub fn instance_core_mut(&mut self, r: ObjRef) -> Option<&mut InstanceCore> {
        match &mut self.get_mut(r).body {
            ObjBody::String(s) => Some(&mut s.core),
            ObjBody::Array(a) => Some(&mut a.core),
            ObjBody::Map(m) => Some(&mut m.core),
            ObjBody::Instance(i) => Some(&mut i.core),
            ObjBody::Class(c) => Some(&mut c.core),
            _ => None,
        }
    }

    // ---- value semantics ----

    /// Content hash of a value; string hashes are content hashes, other
    /// objects hash by identity.
    pub fn value_hash(&self, v: &Value) -> u64 {
        match v {
            Value::Nil => 0x1,
            Value::Bool(false) => 0x2,
            Value::Bool(true) => 0x3,
            Value::Undef => 0x5,
            Value::Number(n) => hash_bytes(&n.to_bits().to_le_bytes()),
            Value::Obj(r) => {
                if self.kind(*r) == ObjKind::String {
                    self.string(*r).hash_ref()
                } else {
                    hash_bytes(&self.get(*r).header.id.to_le_bytes())
                }
            }
        }
    }

    /// Structural equality: scalars by value, strings by content,
    /// other objects by identity. `opEquals` delegation happens at the
    /// opcode layer, not here.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => {
                if ra == rb {
                    return true;
                }
                if self.kind(*ra) == ObjKind::String && self.kind(*rb) == ObjKind::String {
                    let sa = self.string(*ra);
                    let sb = self.string(*rb);
                    if let (Some(ha), Some(hb)) = (sa.hash, sb.hash) {
                        if ha != hb {
                            return false;
                        }
                    }
                    return sa.bytes == sb.bytes;
                }
                false
            }
            _ => a.same(b),
        }
    }

    // ---- write barrier ----

    /// Generational write barrier. Call after storing `child` into
    /// `parent`. Old parents holding young children join the remembered
    /// set so minor cycles trace through them.
    pub fn obj_write(&mut self, parent: ObjRef, child: Value) {
        let Value::Obj(child) = child else { return };
        let parent_gen = self.header(parent).gen;
        if parent_gen >= OLD_MIN && self.header(child).gen < OLD_MIN {
            self.remembered.insert(parent);
        }
    }

    /// Pins an object in the old generation immediately. Interned
    /// strings, chunk constants, and singleton classes live here so
    /// they never ping-pong through the nursery.
    pub fn promote_now(&mut self, r: ObjRef) {
        self.header_mut(r).gen = OLD_MIN;
        self.remembered.insert(r);
    }

    // ---- collection ----

    /// Runs one stop-the-world collection. `roots` must enumerate every
    /// externally reachable object; the caller (the VM) owns root
    /// discovery. Returns the finalizable set; the caller runs those
    /// finalizers with the GVL held.
    pub fn collect(&mut self, roots: &[ObjRef], major: bool) -> SweepOutcome {
        log::debug!(
            "gc: {} cycle, {} roots, {} bytes allocated",
            if major { "major" } else { "minor" },
            roots.len(),
            self.bytes_allocated
        );

        // Mark.
        let mut gray: Vec<ObjRef> = Vec::with_capacity(roots.len());
        for &r in roots {
            self.mark_object(r, &mut gray);
        }
        if !major {
            let remembered: Vec<ObjRef> = self.remembered.iter().copied().collect();
            for r in remembered {
                self.mark_object(r, &mut gray);
            }
        }
        let mut children = Vec::new();
        while let Some(r) = gray.pop() {
            children.clear();
            self.trace_children(r, &mut children);
            for &child in &children {
                // Minor cycles stop at the old generation: old objects
                // survive unmarked, and their young children are covered
                // by the remembered set.
                if !major && self.header(child).gen >= OLD_MIN {
                    continue;
                }
                self.mark_object(child, &mut gray);
            }
        }

        // Sweep.
        let mut outcome = SweepOutcome::default();
        for index in 0..self.slots.len() {
            let r = ObjRef::from_raw(index as u32);
            if matches!(self.slots[index].body, ObjBody::Free { .. }) {
                continue;
            }
            let header = &self.slots[index].header;
            let dark = header.is_dark();
            let old = header.gen >= OLD_MIN;
            let hidden = header.flags.contains(ObjFlags::NO_GC);

            if dark || hidden || (!major && old) {
                // Survivor: clear the mark and age nursery objects.
                let header = &mut self.slots[index].header;
                header.flags &= !ObjFlags::DARK;
                if !major && dark && header.gen < OLD_MIN {
                    header.gen += 1;
                    if header.gen >= OLD_MIN {
                        // Promotion may carry young children along.
                        self.remembered.insert(r);
                    }
                }
                if major && header.gen < OLD_MAX && dark {
                    // Major cycles age everything one step.
                    header.gen += 1;
                }
                continue;
            }

            // Unreachable. Schedule the finalizer once, free next cycle.
            if header.flags.contains(ObjFlags::HAS_FINALIZER) {
                if let Some(finalizer) = self.instance_core(r).and_then(|c| c.finalizer) {
                    self.slots[index].header.flags &= !ObjFlags::HAS_FINALIZER;
                    self.stats.finalizers_scheduled += 1;
                    outcome.finalizable.push((r, finalizer));
                    continue;
                }
            }

            self.free_slot(index);
            outcome.freed += 1;
        }

        if major {
            self.prune_remembered();
            self.stats.major_cycles += 1;
        } else {
            let mut remembered = std::mem::take(&mut self.remembered);
            remembered.retain(|r| !matches!(self.slots[r.index()].body, ObjBody::Free { .. }));
            self.remembered = remembered;
            self.stats.minor_cycles += 1;
        }
        self.stats.objects_freed += outcome.freed as u64;

        // Resync byte accounting and rescale the trigger.
        self.bytes_allocated = self.live_bytes();
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_FIRST_THRESHOLD);

        log::debug!(
            "gc: freed {} objects, {} finalizable, {} bytes live",
            outcome.freed,
            outcome.finalizable.len(),
            self.bytes_allocated
        );
        outcome
    }

    fn mark_object(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        if matches!(self.slots[r.index()].body, ObjBody::Free { .. }) {
            return;
        }
        let header = &mut self.slots[r.index()].header;
        if header.is_dark() {
            return;
        }
        header.flags |= ObjFlags::DARK;
        gray.push(r);
    }

    fn free_slot(&mut self, index: usize) {
        let body = std::mem::replace(
            &mut self.slots[index].body,
            ObjBody::Free {
                next_free: self.free_head,
            },
        );
        drop(body);
        self.free_head = Some(index as u32);
    }

    /// Drops remembered-set entries whose children are all old now.
    fn prune_remembered(&mut self) {
        let mut children = Vec::new();
        let entries: Vec<ObjRef> = self.remembered.iter().copied().collect();
        self.remembered.clear();
        for r in entries {
            if matches!(self.slots[r.index()].body, ObjBody::Free { .. }) {
                continue;
            }
            children.clear();
            self.trace_children(r, &mut children);
            if children.iter().any(|c| self.header(*c).gen < OLD_MIN) {
                self.remembered.insert(r);
            }
        }
    }

    /// Pushes every object directly referenced by `r`.
    pub fn trace_children(&self, r: ObjRef, out: &mut Vec<ObjRef>) {
        fn push_value(out: &mut Vec<ObjRef>, v: &Value) {
            if let Value::Obj(r) = v {
                out.push(*r);
            }
        }
        fn push_core(out: &mut Vec<ObjRef>, core: &InstanceCore) {
            out.extend(core.klass);
            out.extend(core.singleton);
            out.extend(core.finalizer);
            for (k, v) in core.fields.iter() {
                out.push(*k);
                push_value(out, v);
            }
        }

        match &self.get(r).body {
            ObjBody::String(s) => push_core(out, &s.core),
            ObjBody::Array(a) => {
                push_core(out, &a.core);
                for v in a.values() {
                    push_value(out, v);
                }
            }
            ObjBody::Map(m) => {
                push_core(out, &m.core);
                for (k, v) in m.table.iter() {
                    push_value(out, &k);
                    push_value(out, &v);
                }
            }
            ObjBody::Instance(i) => {
                push_core(out, &i.core);
                out.extend(i.internal);
            }
            ObjBody::Class(c) => {
                push_core(out, &c.core);
                let info = &c.info;
                out.extend(info.name);
                out.extend(info.under);
                out.extend(info.superclass);
                out.extend(info.singleton_of);
                out.extend(info.included.iter().copied());
                for table in [&info.methods, &info.getters, &info.setters, &info.constants] {
                    for (k, v) in table.iter() {
                        out.push(*k);
                        push_value(out, v);
                    }
                }
            }
            ObjBody::IClass(i) => {
                out.push(i.klass);
                out.push(i.module);
                out.extend(i.superclass);
            }
            ObjBody::Function(f) => {
                out.extend(f.name);
                out.extend(f.klass);
                out.extend(f.kwarg_names.iter().copied());
                for c in &f.chunk.constants {
                    push_value(out, c);
                }
                for row in &f.chunk.catch_tables {
                    if let crate::chunk::CatchKind::Class { name, resolved } = &row.kind {
                        out.push(*name);
                        out.extend(*resolved);
                    }
                    if let Some(thrown) = &row.thrown {
                        push_value(out, thrown);
                    }
                }
            }
            ObjBody::Closure(c) => {
                out.push(c.function);
                out.extend(c.upvalues.iter().copied());
            }
            ObjBody::Upvalue(u) => {
                if let UpvalueState::Closed(v) = &u.state {
                    push_value(out, v);
                }
            }
            ObjBody::BoundMethod(b) => {
                push_value(out, &b.receiver);
                out.push(b.callable);
            }
            ObjBody::Native(n) => {
                out.push(n.name);
                out.extend(n.klass);
            }
            ObjBody::Internal(i) => match &i.data {
                InternalData::CallInfo(ci) => {
                    out.extend(ci.name);
                    out.extend(ci.kwarg_names.iter().copied());
                    out.extend(ci.block_function);
                }
                InternalData::Iterator(it) => push_value(out, &it.target),
                InternalData::Block { callable } => out.push(*callable),
                InternalData::Mutex(_) => {}
                InternalData::Thread(_) => {}
                InternalData::Regex { source } => out.push(*source),
            },
            ObjBody::Scope(s) => {
                out.push(s.function);
                for v in &s.locals {
                    push_value(out, v);
                }
            }
            ObjBody::Free { .. } => {}
        }
    }
}

/// Approximate byte footprint of an object body.
fn body_size(body: &ObjBody) -> usize {
    let base = std::mem::size_of::<HeapObj>();
    base + match body {
        ObjBody::String(s) => s.bytes.capacity(),
        ObjBody::Array(a) => a.byte_size(),
        ObjBody::Map(m) => m.table.byte_size(),
        ObjBody::Instance(i) => i.core.fields.capacity() * 24,
        ObjBody::Class(c) => {
            let info = &c.info;
            (info.methods.capacity()
                + info.getters.capacity()
                + info.setters.capacity()
                + info.constants.capacity())
                * 24
        }
        ObjBody::Function(f) => f.chunk.code.capacity() + f.chunk.constants.capacity() * 16,
        ObjBody::Closure(c) => c.upvalues.capacity() * 4,
        ObjBody::Scope(s) => s.locals.capacity() * std::mem::size_of::<Value>(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ArrayObj;

    fn alloc_array(heap: &mut Heap, values: Vec<Value>) -> ObjRef {
        heap.alloc(
            ObjKind::Array,
            ObjBody::Array(ArrayObj::new(InstanceCore::default(), values)),
            ObjFlags::INSTANCE_LIKE,
        )
    }

    #[test]
    fn test_reachable_objects_survive() {
        let mut heap = Heap::new();
        let inner = heap.alloc_plain_string(b"kept".to_vec());
        let root = alloc_array(&mut heap, vec![Value::Obj(inner)]);
        let garbage = heap.alloc_plain_string(b"dropped".to_vec());

        let outcome = heap.collect(&[root], true);
        assert_eq!(outcome.freed, 1);
        assert_eq!(heap.string(inner).bytes, b"kept");
        assert!(matches!(
            heap.get(garbage).body,
            ObjBody::Free { .. }
        ));
    }

    #[test]
    fn test_slot_reuse_through_free_list() {
        let mut heap = Heap::new();
        let dead = heap.alloc_plain_string(b"x".to_vec());
        heap.collect(&[], true);
        let reused = heap.alloc_plain_string(b"y".to_vec());
        assert_eq!(dead.index(), reused.index());
        // Object ids stay distinct across reuse.
        assert_ne!(heap.header(reused).id, 0);
    }

    #[test]
    fn test_minor_collection_skips_old_objects() {
        let mut heap = Heap::new();
        let old = heap.alloc_plain_string(b"tenured".to_vec());
        heap.promote_now(old);

        // Unreachable but old: a minor cycle must not free it.
        let outcome = heap.collect(&[], false);
        assert_eq!(outcome.freed, 0);
        assert_eq!(heap.string(old).bytes, b"tenured");

        // A major cycle does.
        let outcome = heap.collect(&[], true);
        assert_eq!(outcome.freed, 1);
    }

    #[test]
    fn test_promotion_after_surviving_minor_cycles() {
        let mut heap = Heap::new();
        let r = heap.alloc_plain_string(b"ager".to_vec());
        assert_eq!(heap.header(r).gen, 0);
        for expected in 1..=OLD_MIN {
            heap.collect(&[r], false);
            assert_eq!(heap.header(r).gen, expected);
        }
        assert!(heap.header(r).is_old());
    }

    #[test]
    fn test_write_barrier_keeps_young_child_of_old_parent() {
        let mut heap = Heap::new();
        let parent = alloc_array(&mut heap, Vec::new());
        heap.promote_now(parent);

        let child = heap.alloc_plain_string(b"young".to_vec());
        heap.array_mut(parent).push(Value::Obj(child));
        heap.obj_write(parent, Value::Obj(child));

        // Minor cycle with no roots at all: parent survives because it
        // is old, child survives because the remembered set reaches it.
        let outcome = heap.collect(&[], false);
        assert_eq!(outcome.freed, 0);
        assert_eq!(heap.string(child).bytes, b"young");
    }

    #[test]
    fn test_no_gc_objects_are_never_collected() {
        let mut heap = Heap::new();
        let pinned = heap.alloc(
            ObjKind::String,
            ObjBody::String(StringObj::new(InstanceCore::default(), b"pin".to_vec())),
            ObjFlags::NO_GC,
        );
        heap.collect(&[], true);
        assert_eq!(heap.string(pinned).bytes, b"pin");
    }

    #[test]
    fn test_values_equal_and_hash() {
        let mut heap = Heap::new();
        let a = heap.alloc_plain_string(b"twin".to_vec());
        let b = heap.alloc_plain_string(b"twin".to_vec());
        let c = heap.alloc_plain_string(b"other".to_vec());

        assert!(heap.values_equal(&Value::Obj(a), &Value::Obj(b)));
        assert!(!heap.values_equal(&Value::Obj(a), &Value::Obj(c)));
        assert_eq!(
            heap.value_hash(&Value::Obj(a)),
            heap.value_hash(&Value::Obj(b))
        );
        assert!(heap.values_equal(&Value::Number(2.0), &Value::Number(2.0)));
        assert!(!heap.values_equal(&Value::Undef, &Value::Undef));
    }
}
