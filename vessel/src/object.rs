//! ObjectRef: owning, intrusively ref-counted reference to a VM object
//!
//! ObjectPtr: non-owning address of a VM object, only dereferenced while
//! something else keeps the target alive
//!
//! Handle<T>: same as ObjectRef but typed, derefs to T
use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering, fence},
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::TypeInfo;

/// Shared "target is dead" signal. Lives independently of the target so
/// every weak reference to one object observes the same liveness.
#[derive(Debug, Default)]
pub struct WeakRefFlag {
    dead: AtomicBool,
    lock: Mutex<()>,
}

impl WeakRefFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Caller must hold the flag's lock.
    fn mark_dead(&self, _guard: &MutexGuard<'_, ()>) {
        self.dead.store(true, Ordering::Release);
    }
}

/// Bookkeeping every VM object embeds.
#[derive(Debug)]
pub struct ObjectHeader {
    ref_count: AtomicU32,
    gc_flag: AtomicBool,
    weak_flag: OnceLock<Arc<WeakRefFlag>>,
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectHeader {
    pub fn new() -> Self {
        Self {
            ref_count: AtomicU32::new(1),
            gc_flag: AtomicBool::new(false),
            weak_flag: OnceLock::new(),
        }
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn gc_flag(&self) -> bool {
        self.gc_flag.load(Ordering::Acquire)
    }

    /// Marks the object as assumed garbage. Any add-ref or release before
    /// the collector looks again cancels the mark.
    #[inline]
    pub fn set_gc_flag(&self) {
        self.gc_flag.store(true, Ordering::Release);
    }

    #[inline]
    fn add_ref(&self) {
        self.gc_flag.store(false, Ordering::Relaxed);
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the count reached zero.
    #[inline]
    fn release(&self) -> bool {
        self.gc_flag.store(false, Ordering::Relaxed);
        match self.weak_flag.get() {
            Some(flag) => {
                let guard = flag.lock();
                let last = self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1;
                if last {
                    flag.mark_dead(&guard);
                }
                last
            }
            None => {
                if self.ref_count.fetch_sub(1, Ordering::Release) == 1 {
                    fence(Ordering::Acquire);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// The weak-reference flag, associated with the object on first use.
    pub fn weakref_flag(&self) -> Arc<WeakRefFlag> {
        self.weak_flag.get_or_init(|| Arc::new(WeakRefFlag::new())).clone()
    }

    pub fn existing_weakref_flag(&self) -> Option<&Arc<WeakRefFlag>> {
        self.weak_flag.get()
    }
}

/// A VM object the core can hold, trace and release.
pub trait ScriptObject: Any + Send + Sync {
    fn header(&self) -> &ObjectHeader;

    fn type_info(&self) -> &Arc<TypeInfo>;

    /// Reports every object this one owns to the collector.
    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        let _ = visitor;
    }

    /// Drops every owned reference so the collector can break a cycle.
    fn release_all_references(&self) {}
}

/// Non-owning object address.
#[derive(Copy, Clone)]
pub struct ObjectPtr(NonNull<dyn ScriptObject>);

// SAFETY: the pointee is Send + Sync, the pointer itself is only an address
unsafe impl Send for ObjectPtr {}
// SAFETY: see above
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as *const u8 as usize
    }

    /// # Safety
    ///
    /// The target must be alive for the duration of the borrow.
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> &'a dyn ScriptObject {
        // SAFETY: guaranteed by caller
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for ObjectPtr {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ObjectPtr {}

impl fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPtr({:#x})", self.addr())
    }
}

/// Owning reference: clone adds a reference, drop releases one and destroys
/// the object at zero.
pub struct ObjectRef(NonNull<dyn ScriptObject>);

// SAFETY: ScriptObject requires Send + Sync and the count is atomic
unsafe impl Send for ObjectRef {}
// SAFETY: see above
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    pub fn new<T: ScriptObject>(object: T) -> Self {
        let boxed: Box<dyn ScriptObject> = Box::new(object);
        // SAFETY: Box::into_raw never returns null
        Self(unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) })
    }

    /// Adds a reference to an object that is known to be alive.
    ///
    /// # Safety
    ///
    /// `ptr` must come from an `ObjectRef` allocation whose count is
    /// currently nonzero and cannot reach zero concurrently.
    pub unsafe fn from_ptr(ptr: ObjectPtr) -> Self {
        // SAFETY: guaranteed by caller
        unsafe { ptr.0.as_ref() }.header().add_ref();
        Self(ptr.0)
    }

    /// Adds a reference to `object`, which must live in an `ObjectRef`
    /// allocation.
    ///
    /// # Safety
    ///
    /// `object` must have been created through [`ObjectRef::new`].
    pub(crate) unsafe fn retain(object: &dyn ScriptObject) -> Self {
        object.header().add_ref();
        Self(NonNull::from(object))
    }

    #[inline]
    pub fn get(&self) -> &dyn ScriptObject {
        // SAFETY: we hold a reference, the object is alive
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        self.get().header()
    }

    #[inline]
    pub fn type_info(&self) -> &Arc<TypeInfo> {
        self.get().type_info()
    }

    #[inline]
    pub fn as_ptr(&self) -> ObjectPtr {
        ObjectPtr(self.0)
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.as_ptr().addr()
    }

    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.addr() == b.addr()
    }

    pub fn ref_count(&self) -> u32 {
        self.header().ref_count()
    }

    pub fn is<T: ScriptObject>(&self) -> bool {
        self.get().type_id() == std::any::TypeId::of::<T>()
    }

    pub fn downcast_ref<T: ScriptObject>(&self) -> Option<&T> {
        if self.is::<T>() {
            // SAFETY: concrete type checked above
            Some(unsafe { self.0.cast::<T>().as_ref() })
        } else {
            None
        }
    }

    pub fn typed<T: ScriptObject>(self) -> Option<Handle<T>> {
        Handle::from_object(self)
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.header().add_ref();
        Self(self.0)
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        if self.header().release() {
            // SAFETY: last reference, allocated by ObjectRef::new
            drop(unsafe { Box::from_raw(self.0.as_ptr()) });
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("type", &self.type_info().name)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Typed owning reference to a VM object.
pub struct Handle<T: ScriptObject> {
    object: ObjectRef,
    _marker: PhantomData<T>,
}

impl<T: ScriptObject> Handle<T> {
    pub fn new(value: T) -> Self {
        Self {
            object: ObjectRef::new(value),
            _marker: PhantomData,
        }
    }

    pub fn from_object(object: ObjectRef) -> Option<Self> {
        object.is::<T>().then_some(Self {
            object,
            _marker: PhantomData,
        })
    }

    /// Adds a reference to `value`.
    ///
    /// # Safety
    ///
    /// `value` must have been created through [`Handle::new`] or
    /// [`ObjectRef::new`].
    pub(crate) unsafe fn retain(value: &T) -> Self {
        Self {
            // SAFETY: guaranteed by caller
            object: unsafe { ObjectRef::retain(value) },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    #[inline]
    pub fn into_object(self) -> ObjectRef {
        self.object
    }
}

impl<T: ScriptObject> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ScriptObject> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY: the concrete type was checked on construction
        unsafe { self.object.0.cast::<T>().as_ref() }
    }
}

impl<T: ScriptObject> From<Handle<T>> for ObjectRef {
    fn from(value: Handle<T>) -> Self {
        value.into_object()
    }
}

impl<T: ScriptObject + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&**self).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{TypeDesc, TypeFlags, TypeId, TypeQuery, TypeRegistry};
    use std::sync::atomic::AtomicUsize;

    /// Plain ref-counted object that counts its destructions.
    pub(crate) struct Counted {
        header: ObjectHeader,
        info: Arc<TypeInfo>,
        drops: Arc<AtomicUsize>,
    }

    impl Counted {
        pub(crate) fn create(
            info: &Arc<TypeInfo>,
            drops: &Arc<AtomicUsize>,
        ) -> ObjectRef {
            ObjectRef::new(Self {
                header: ObjectHeader::new(),
                info: info.clone(),
                drops: drops.clone(),
            })
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ScriptObject for Counted {
        fn header(&self) -> &ObjectHeader {
            &self.header
        }
        fn type_info(&self) -> &Arc<TypeInfo> {
            &self.info
        }
    }

    pub(crate) fn counted_type() -> Arc<TypeInfo> {
        let registry = TypeRegistry::new();
        let info = registry
            .register(TypeDesc::new("counted", 0, TypeFlags::REF))
            .unwrap();
        assert!(registry.type_info(info.id).is_some());
        info
    }

    #[test]
    fn last_release_destroys() {
        let info = counted_type();
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Counted::create(&info, &drops);
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(b.ref_count(), 1);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn touching_clears_the_gc_flag() {
        let info = counted_type();
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Counted::create(&info, &drops);
        a.header().set_gc_flag();
        assert!(a.header().gc_flag());
        let b = a.clone();
        assert!(!a.header().gc_flag());

        a.header().set_gc_flag();
        drop(b);
        assert!(!a.header().gc_flag());
    }

    #[test]
    fn weak_flag_is_set_on_destruction() {
        let info = counted_type();
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Counted::create(&info, &drops);
        let flag = a.header().weakref_flag();
        assert!(Arc::ptr_eq(&flag, &a.header().weakref_flag()));
        assert!(!flag.is_dead());
        drop(a);
        assert!(flag.is_dead());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn downcasting_checks_the_concrete_type() {
        let info = counted_type();
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Counted::create(&info, &drops);
        assert!(a.is::<Counted>());
        assert!(a.downcast_ref::<Counted>().is_some());
        let typed = a.clone().typed::<Counted>().unwrap();
        assert!(ObjectRef::ptr_eq(typed.object(), &a));
        assert_eq!(a.type_info().id.raw() & TypeId::APP_OBJECT, TypeId::APP_OBJECT);
    }
}
