use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    Behaviors, Engine, Handle, ObjectHeader, ObjectRef, Payload, Primitive, Result,
    ScriptObject, Storable, TypeDesc, TypeFlags, TypeId, TypeInfo, WeakEngine, context,
};

/// Boxes one value of any type.
pub struct ScriptAny {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    value: Mutex<Storable>,
}

impl ScriptAny {
    fn create(engine: &Engine, value: Storable) -> Handle<Self> {
        let any = Handle::new(Self {
            header: ObjectHeader::new(),
            info: engine.builtins().any.clone(),
            value: Mutex::new(value),
        });
        engine.notify_gc(any.object());
        any
    }

    pub fn new(engine: &Engine) -> Handle<Self> {
        Self::create(engine, Storable::new())
    }

    pub fn with_value(engine: &Engine, value: &Payload, type_id: TypeId) -> Result<Handle<Self>> {
        let mut storable = Storable::new();
        storable.store(value, type_id).map_err(context::raise)?;
        Ok(Self::create(engine, storable))
    }

    pub fn with_primitive<T: Primitive>(engine: &Engine, value: T) -> Handle<Self> {
        Self::create(engine, Storable::from_primitive(value))
    }

    /// Replaces the content: handles are shared, value objects copied and
    /// scalars stored at their exact width. The box is unchanged when the
    /// copy fails.
    pub fn store(&self, value: &Payload, type_id: TypeId) -> Result<()> {
        let mut fresh = Storable::new();
        fresh.store(value, type_id).map_err(context::raise)?;
        let old = std::mem::replace(&mut *self.value.lock(), fresh);
        // the previous payload is released outside the lock
        drop(old);
        Ok(())
    }

    pub fn store_primitive<T: Primitive>(&self, value: T) {
        let old = std::mem::replace(&mut *self.value.lock(), Storable::from_primitive(value));
        drop(old);
    }

    /// Copies the content out if `type_id` is compatible with what is
    /// stored. `out` is left alone otherwise.
    pub fn retrieve(&self, out: &mut Payload, type_id: TypeId) -> bool {
        self.value.lock().retrieve(out, type_id)
    }

    pub fn retrieve_primitive<T: Primitive>(&self) -> Option<T> {
        let mut out = Payload::default();
        self.retrieve(&mut out, T::TYPE_ID)
            .then(|| out.as_primitive())
            .flatten()
    }

    /// Numeric content as a 64-bit integer, converting from floats.
    pub fn retrieve_i64(&self) -> Option<i64> {
        let value = self.value.lock();
        if !value.type_id().is_primitive() || value.type_id() == TypeId::BOOL {
            return None;
        }
        value.get_primitive()
    }

    /// Numeric content as a double, converting from integers.
    pub fn retrieve_f64(&self) -> Option<f64> {
        let value = self.value.lock();
        if !value.type_id().is_primitive() || value.type_id() == TypeId::BOOL {
            return None;
        }
        value.get_primitive()
    }

    pub fn type_id(&self) -> TypeId {
        self.value.lock().type_id()
    }

    pub fn is_empty(&self) -> bool {
        self.value.lock().is_void()
    }

    /// Copies `other`'s content into this box.
    pub fn assign(&self, other: &ScriptAny) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let copy = other.value.lock().try_clone().map_err(context::raise)?;
        let old = std::mem::replace(&mut *self.value.lock(), copy);
        drop(old);
        Ok(())
    }

    pub(crate) fn type_desc(engine: &WeakEngine, _id: TypeId) -> TypeDesc {
        let factory_engine = engine.clone();
        let copy_engine = engine.clone();
        let behaviors = Behaviors {
            factory: Some(Arc::new(move |_: &Arc<TypeInfo>| {
                let engine = factory_engine.upgrade()?;
                Some(ScriptAny::new(&engine).into_object())
            })),
            copy: Some(Arc::new(move |object: &ObjectRef| {
                let engine = copy_engine.upgrade()?;
                let source = object.downcast_ref::<ScriptAny>()?;
                let copy = ScriptAny::new(&engine);
                copy.assign(source).ok()?;
                Some(copy.into_object())
            })),
            weakref_flag: false,
        };
        TypeDesc::new("any", 0, TypeFlags::REF | TypeFlags::GC).with_behaviors(behaviors)
    }
}

impl ScriptObject for ScriptAny {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        self.value.lock().enum_references(visitor);
    }

    fn release_all_references(&self) {
        let owned = self.value.lock().take_object();
        drop(owned);
    }
}

impl fmt::Debug for ScriptAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptAny")
            .field("value", &*self.value.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineCreateInfo, ScriptString};

    fn engine() -> Engine {
        Engine::new(EngineCreateInfo {
            scheduler_workers: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn primitives_round_trip_at_their_width() {
        let engine = engine();
        let any = ScriptAny::with_primitive(&engine, 7i32);
        assert_eq!(any.type_id(), TypeId::INT32);
        assert_eq!(any.retrieve_primitive::<i32>(), Some(7));
        assert_eq!(any.retrieve_primitive::<u32>(), Some(7));
        // no truncation across widths
        assert_eq!(any.retrieve_primitive::<i64>(), None);
        assert_eq!(any.retrieve_primitive::<i16>(), None);
        assert_eq!(any.retrieve_i64(), Some(7));
        assert_eq!(any.retrieve_f64(), Some(7.0));
    }

    #[test]
    fn void_means_empty() {
        let engine = engine();
        let any = ScriptAny::new(&engine);
        assert!(any.is_empty());
        any.store_primitive(1.25f64);
        assert!(!any.is_empty());
        any.store(&Payload::default(), TypeId::VOID).unwrap();
        assert!(any.is_empty());
        assert_eq!(any.retrieve_f64(), None);
    }

    #[test]
    fn value_objects_are_copied_in_and_out() {
        let engine = engine();
        let text = engine.new_string("payload");
        let any = ScriptAny::new(&engine);
        any.store(&Payload::object(text.clone()), engine.string_type_id())
            .unwrap();
        assert_eq!(text.ref_count(), 1);

        let mut out = Payload::null();
        assert!(any.retrieve(&mut out, engine.string_type_id()));
        let copy = out.as_object().unwrap();
        assert!(!ObjectRef::ptr_eq(copy, &text));
        assert_eq!(ScriptString::text_of(&out), Some("payload"));

        let mut number = Payload::primitive(3i32);
        assert!(!any.retrieve(&mut number, TypeId::INT32));
        assert_eq!(number.as_primitive::<i32>(), Some(3));
    }

    #[test]
    fn handles_are_shared_and_released_on_overwrite() {
        let engine = engine();
        let inner = ScriptAny::with_primitive(&engine, 1u8);
        let handle_type = engine.builtins().any.id.to_handle();
        let outer = ScriptAny::new(&engine);
        outer
            .store(&Payload::object(inner.object().clone()), handle_type)
            .unwrap();
        // ours, the collector's and the box's
        assert_eq!(inner.object().ref_count(), 3);

        let mut out = Payload::null();
        assert!(outer.retrieve(&mut out, handle_type));
        assert!(ObjectRef::ptr_eq(out.as_object().unwrap(), inner.object()));
        drop(out);

        outer.store_primitive(0i32);
        assert_eq!(inner.object().ref_count(), 2);
    }

    #[test]
    fn failed_copies_leave_the_box_unchanged() {
        let engine = engine();
        let info = engine
            .register_type(TypeDesc::new("opaque", 8, TypeFlags::VALUE))
            .unwrap();
        let any = ScriptAny::with_primitive(&engine, 5i32);
        let object = crate::object::tests::Counted::create(
            &info,
            &Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        );
        let err = any.store(&Payload::object(object), info.id).unwrap_err();
        assert!(matches!(err, crate::RuntimeError::CopyFailed(_)));
        assert_eq!(any.retrieve_primitive::<i32>(), Some(5));
    }

    #[test]
    fn self_cycles_are_collected() {
        let engine = engine();
        let any = ScriptAny::new(&engine);
        let handle_type = engine.builtins().any.id.to_handle();
        any.store(&Payload::object(any.object().clone()), handle_type)
            .unwrap();
        drop(any);
        let stats = engine.collect_garbage();
        assert_eq!(stats.detected, 1);
        assert_eq!(stats.destroyed, 1);
        assert!(engine.gc().is_empty());
    }
}
