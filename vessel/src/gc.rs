//! Host-side cycle collector.
//!
//! Objects of GC types are handed to the collector when created; it keeps one
//! reference to each. `collect` frees what only the collector still holds,
//! then looks for cycles by trial deletion: references found through
//! `enum_references` between tracked objects are subtracted from each count,
//! anything left with an external reference is live, and so is everything
//! reachable from it. The rest is garbage, unless it was touched while the
//! collector looked (which clears the GC flag).
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ObjectRef;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// objects freed by this collection
    pub destroyed: usize,
    /// objects found in garbage cycles
    pub detected: usize,
}

#[derive(Default)]
pub struct GarbageCollector {
    objects: Mutex<Vec<ObjectRef>>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, object: ObjectRef) {
        self.objects.lock().push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breaks every tracked object's references and lets go of them, for
    /// engine teardown.
    pub fn release_all(&self) -> usize {
        let objects = std::mem::take(&mut *self.objects.lock());
        for object in &objects {
            object.get().release_all_references();
        }
        objects.len()
    }

    pub fn collect(&self) -> GcStats {
        let mut objects = std::mem::take(&mut *self.objects.lock());
        let mut stats = GcStats {
            destroyed: sweep(&mut objects),
            ..GcStats::default()
        };

        for object in &objects {
            object.header().set_gc_flag();
        }

        let index: HashMap<usize, usize, ahash::RandomState> = objects
            .iter()
            .enumerate()
            .map(|(i, o)| (o.addr(), i))
            .collect();

        let mut internal = vec![0u32; objects.len()];
        for object in &objects {
            object.get().enum_references(&mut |target| {
                if let Some(&i) = index.get(&target.addr()) {
                    internal[i] += 1;
                }
            });
        }

        let mut live = vec![false; objects.len()];
        let mut pending: Vec<usize> = (0..objects.len())
            .filter(|&i| objects[i].ref_count().saturating_sub(1) > internal[i])
            .collect();
        for &i in &pending {
            live[i] = true;
        }
        while let Some(i) = pending.pop() {
            objects[i].get().enum_references(&mut |target| {
                if let Some(&j) = index.get(&target.addr()) {
                    if !live[j] {
                        live[j] = true;
                        pending.push(j);
                    }
                }
            });
        }

        // decide before releasing, releasing touches the other members
        let garbage: Vec<usize> = (0..objects.len())
            .filter(|&i| !live[i] && objects[i].header().gc_flag())
            .collect();
        for &i in &garbage {
            objects[i].get().release_all_references();
        }
        stats.detected = garbage.len();
        stats.destroyed += sweep(&mut objects);

        if stats.destroyed > 0 || stats.detected > 0 {
            log::debug!(
                "gc: destroyed {} objects, {} in cycles, {} still tracked",
                stats.destroyed,
                stats.detected,
                objects.len()
            );
        }
        self.objects.lock().append(&mut objects);
        stats
    }
}

/// Drops every object only the collector references, until nothing more
/// goes away.
fn sweep(objects: &mut Vec<ObjectRef>) -> usize {
    let mut destroyed = 0;
    loop {
        let before = objects.len();
        objects.retain(|o| o.ref_count() > 1);
        let freed = before - objects.len();
        if freed == 0 {
            return destroyed;
        }
        destroyed += freed;
    }
}
