//! Untyped handles: [`ScriptHandle`] owns its target, [`ScriptWeakRef`]
//! observes it through the target's weak-reference flag.
use std::{fmt, mem, sync::Arc};

use parking_lot::Mutex;

use crate::{
    Behaviors, Engine, Handle, ObjectHeader, ObjectPtr, ObjectRef, Payload, Result, RuntimeError,
    ScriptMethod, ScriptObject, TypeDesc, TypeFlags, TypeId, TypeInfo, TypeQuery, WeakEngine,
    WeakRefFlag, context,
};

#[derive(Default)]
struct RefTarget {
    object: Option<ObjectRef>,
    type_id: TypeId,
}

/// Owning handle to an object of any type, along with the type it was
/// declared as.
pub struct ScriptHandle {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    target: Mutex<RefTarget>,
}

impl ScriptHandle {
    pub fn new(engine: &Engine) -> Handle<Self> {
        let handle = Handle::new(Self {
            header: ObjectHeader::new(),
            info: engine.builtins().handle.clone(),
            target: Mutex::new(RefTarget::default()),
        });
        engine.notify_gc(handle.object());
        handle
    }

    pub fn with_target(engine: &Engine, object: Option<ObjectRef>, type_id: TypeId) -> Handle<Self> {
        let handle = Self::new(engine);
        handle.set(object, type_id);
        handle
    }

    /// Releases the old target and adopts `object`.
    pub fn set(&self, object: Option<ObjectRef>, type_id: TypeId) {
        let old = mem::replace(
            &mut *self.target.lock(),
            RefTarget {
                object,
                type_id: type_id.base(),
            },
        );
        drop(old);
    }

    /// Points at whatever `value` refers to. A `ref` passed by value hands
    /// over its own target instead of being wrapped.
    pub fn assign(&self, value: &Payload, type_id: TypeId) -> Result<()> {
        let Payload::Object(object) = value else {
            return Err(context::raise(RuntimeError::IncompatibleType {
                expected: "object handle".into(),
                found: format!("{type_id:?}"),
            }));
        };
        if let Some(other) = object.as_ref().and_then(|o| o.downcast_ref::<ScriptHandle>()) {
            if !std::ptr::eq(self, other) {
                let (object, type_id) = other.get_with_type();
                self.set(object, type_id);
            }
            return Ok(());
        }
        self.set(object.clone(), type_id);
        Ok(())
    }

    pub fn assign_from(&self, other: &ScriptHandle) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (object, type_id) = other.get_with_type();
        self.set(object, type_id);
    }

    pub fn get(&self) -> Option<ObjectRef> {
        self.target.lock().object.clone()
    }

    fn get_with_type(&self) -> (Option<ObjectRef>, TypeId) {
        let target = self.target.lock();
        (target.object.clone(), target.type_id)
    }

    /// The declared type of the target.
    pub fn type_id(&self) -> TypeId {
        self.target.lock().type_id
    }

    /// The runtime type of the target.
    pub fn type_info(&self) -> Option<Arc<TypeInfo>> {
        self.target
            .lock()
            .object
            .as_ref()
            .map(|o| o.type_info().clone())
    }

    pub fn is_null(&self) -> bool {
        self.target.lock().object.is_none()
    }

    /// Same target and same declared type.
    pub fn equals(&self, other: &ScriptHandle) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let (object, type_id) = other.get_with_type();
        self.equals_target(object.as_ref(), type_id)
    }

    pub fn equals_target(&self, object: Option<&ObjectRef>, type_id: TypeId) -> bool {
        let target = self.target.lock();
        let same = match (&target.object, object) {
            (Some(a), Some(b)) => ObjectRef::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same && (target.object.is_none() || target.type_id == type_id.base())
    }

    /// The target, if it is an object of `type_id` or was declared as one.
    pub fn cast(&self, type_id: TypeId) -> Option<ObjectRef> {
        let target = self.target.lock();
        let object = target.object.as_ref()?;
        let wanted = type_id.base();
        (target.type_id == wanted || object.type_info().id == wanted).then(|| object.clone())
    }

    pub(crate) fn type_desc(engine: &WeakEngine, id: TypeId) -> TypeDesc {
        let factory_engine = engine.clone();
        let copy_engine = engine.clone();
        let behaviors = Behaviors {
            factory: Some(Arc::new(move |_: &Arc<TypeInfo>| {
                let engine = factory_engine.upgrade()?;
                Some(ScriptHandle::new(&engine).into_object())
            })),
            copy: Some(Arc::new(move |object: &ObjectRef| {
                let engine = copy_engine.upgrade()?;
                let source = object.downcast_ref::<ScriptHandle>()?;
                let copy = ScriptHandle::new(&engine);
                copy.assign_from(source);
                Some(copy.into_object())
            })),
            weakref_flag: false,
        };
        let equals = ScriptMethod::new("opEquals", vec![id], TypeId::BOOL, |this, args| {
            let lhs = this.downcast_ref::<ScriptHandle>();
            let rhs = args
                .first()
                .and_then(Payload::as_object)
                .and_then(|o| o.downcast_ref::<ScriptHandle>());
            let equal = match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => lhs.equals(rhs),
                _ => false,
            };
            Ok(Payload::primitive(equal))
        });
        TypeDesc::new(
            "ref",
            mem::size_of::<RefTarget>(),
            TypeFlags::VALUE | TypeFlags::GC,
        )
        .with_behaviors(behaviors)
        .with_method(equals)
    }
}

impl ScriptObject for ScriptHandle {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        if let Some(object) = &self.target.lock().object {
            visitor(object);
        }
    }

    fn release_all_references(&self) {
        let released = self.target.lock().object.take();
        drop(released);
    }
}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target.lock();
        f.debug_struct("ScriptHandle")
            .field("target", &target.object)
            .field("type_id", &target.type_id)
            .finish()
    }
}

struct WeakTarget {
    ptr: ObjectPtr,
    flag: Arc<WeakRefFlag>,
}

/// Non-owning handle to an object of the instance's sub type.
pub struct ScriptWeakRef {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    target: Mutex<Option<WeakTarget>>,
}

impl ScriptWeakRef {
    /// An empty `weakref<T>` for the instance `info`.
    pub fn new(info: &Arc<TypeInfo>) -> Result<Handle<Self>> {
        if !info.is_instance_of("weakref") {
            return Err(context::raise(RuntimeError::InvalidTemplate(info.name.clone())));
        }
        Ok(Handle::new(Self {
            header: ObjectHeader::new(),
            info: info.clone(),
            target: Mutex::new(None),
        }))
    }

    pub fn with_target(info: &Arc<TypeInfo>, object: Option<&ObjectRef>) -> Result<Handle<Self>> {
        let weak = Self::new(info)?;
        weak.set(object)?;
        Ok(weak)
    }

    /// Instances need a GC reference type that hands out weak-reference
    /// flags; anything else is rejected when the type is bound.
    pub fn template_callback(engine: &Engine, sub_type: TypeId) -> Result<()> {
        let Some(info) = engine.type_info(sub_type) else {
            return Err(RuntimeError::InvalidTemplate(format!(
                "weakref of unknown type {sub_type:?}"
            )));
        };
        if !info.is_ref() || !info.is_gc() || !info.behaviors.weakref_flag {
            return Err(RuntimeError::InvalidTemplate(format!(
                "weakref<{}>: type has no weak reference support",
                info.name
            )));
        }
        Ok(())
    }

    pub(crate) fn type_desc(name: String) -> TypeDesc {
        let behaviors = Behaviors {
            factory: Some(Arc::new(|info: &Arc<TypeInfo>| {
                ScriptWeakRef::new(info).ok().map(Handle::into_object)
            })),
            copy: Some(Arc::new(|object: &ObjectRef| {
                let source = object.downcast_ref::<ScriptWeakRef>()?;
                let copy = ScriptWeakRef::new(&source.info).ok()?;
                copy.assign_from_weak(source);
                Some(copy.into_object())
            })),
            weakref_flag: false,
        };
        TypeDesc::new(&name, mem::size_of::<usize>() * 2, TypeFlags::VALUE)
            .with_behaviors(behaviors)
    }

    #[inline]
    pub fn sub_type(&self) -> TypeId {
        self.info.sub_type().unwrap_or_default()
    }

    /// Starts observing `object`, or nothing.
    pub fn set(&self, object: Option<&ObjectRef>) -> Result<()> {
        let next = match object {
            Some(object) => {
                if object.type_info().id != self.sub_type().base() {
                    return Err(context::raise(RuntimeError::IncompatibleType {
                        expected: self.info.name.clone(),
                        found: object.type_info().name.clone(),
                    }));
                }
                Some(WeakTarget {
                    ptr: object.as_ptr(),
                    flag: object.header().weakref_flag(),
                })
            }
            None => None,
        };
        *self.target.lock() = next;
        Ok(())
    }

    pub fn assign_from_weak(&self, other: &ScriptWeakRef) {
        if std::ptr::eq(self, other) {
            return;
        }
        let copy = other.target.lock().as_ref().map(|t| WeakTarget {
            ptr: t.ptr,
            flag: t.flag.clone(),
        });
        *self.target.lock() = copy;
    }

    /// A new reference to the target, unless it has died. Checking the flag
    /// and adding the reference happen under the flag's lock, which the
    /// target's final release takes as well.
    pub fn get(&self) -> Option<ObjectRef> {
        let target = self.target.lock();
        let target = target.as_ref()?;
        let _guard = target.flag.lock();
        if target.flag.is_dead() {
            return None;
        }
        // SAFETY: not dead under the flag lock, so the count is nonzero and
        // the final release cannot run until the guard drops
        Some(unsafe { ObjectRef::from_ptr(target.ptr) })
    }

    pub fn is_alive(&self) -> bool {
        self.target
            .lock()
            .as_ref()
            .is_some_and(|t| !t.flag.is_dead())
    }

    /// Both observe the same object, or both observe nothing.
    pub fn equals(&self, other: &ScriptWeakRef) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let other = other.target.lock().as_ref().map(|t| t.ptr);
        self.target.lock().as_ref().map(|t| t.ptr) == other
    }

    pub fn equals_target(&self, object: Option<&ObjectRef>) -> bool {
        let ptr = object.map(ObjectRef::as_ptr);
        self.target.lock().as_ref().map(|t| t.ptr) == ptr
    }
}

impl ScriptObject for ScriptWeakRef {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }
}

impl fmt::Debug for ScriptWeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target.lock();
        f.debug_struct("ScriptWeakRef")
            .field("type", &self.info.name)
            .field("target", &target.as_ref().map(|t| t.ptr))
            .field("alive", &target.as_ref().is_some_and(|t| !t.flag.is_dead()))
            .finish()
    }
}
