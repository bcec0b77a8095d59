//! Single-assignment futures.
//!
//! A [`Promise`] starts pending and is fulfilled by the first successful
//! `store`. Continuations never run inside `store`: the completion callback
//! and the resumption of a context suspended in `yield_if` are handed to the
//! engine's scheduler.
use std::{fmt, mem, sync::Arc};

use parking_lot::Mutex;

use crate::{
    Context, ContextState, Engine, Handle, MessageSeverity, ObjectHeader, ObjectRef, Payload,
    Primitive, Result, RuntimeError, ScriptFunction, ScriptObject, Storable, TypeDesc, TypeFlags,
    TypeId, TypeInfo, WeakEngine, context,
};

#[derive(Default)]
struct PromiseState {
    // None while pending
    value: Option<Storable>,
    callback: Option<ScriptFunction>,
    awaited: bool,
    // keeps the promise alive while someone depends on its completion
    self_ref: Option<ObjectRef>,
}

pub struct Promise {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    engine: WeakEngine,
    context: Option<Arc<Context>>,
    value_type: TypeId,
    state: Mutex<PromiseState>,
}

impl Promise {
    /// A pending `future<value_type>` owned by `context`, or by the calling
    /// context when `None`.
    pub fn new(
        engine: &Engine,
        context: Option<Arc<Context>>,
        value_type: TypeId,
    ) -> Result<Handle<Self>> {
        let info = engine.future_type(value_type).map_err(context::raise)?;
        let promise = Handle::new(Self {
            header: ObjectHeader::new(),
            info,
            engine: engine.downgrade(),
            context: context.or_else(Context::current),
            value_type,
            state: Mutex::new(PromiseState::default()),
        });
        engine.notify_gc(promise.object());
        Ok(promise)
    }

    /// A `future<void>`, fulfilled without a value.
    pub fn new_void(engine: &Engine, context: Option<Arc<Context>>) -> Result<Handle<Self>> {
        Self::new(engine, context, TypeId::VOID)
    }

    pub(crate) fn type_desc(name: String) -> TypeDesc {
        TypeDesc::new(&name, 0, TypeFlags::REF | TypeFlags::GC)
    }

    #[inline]
    pub fn value_type(&self) -> TypeId {
        self.value_type
    }

    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }

    fn retained(&self) -> ObjectRef {
        // SAFETY: promises are only ever created inside an ObjectRef
        unsafe { ObjectRef::retain(self) }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Fulfils the promise. Only the first store succeeds; later ones raise
    /// on the calling context.
    pub fn store(&self, value: &Payload, type_id: TypeId) -> Result<()> {
        if self.is_fulfilled() {
            return Err(context::raise(RuntimeError::AlreadyFulfilled));
        }
        if type_id.base() != self.value_type.base() {
            return Err(context::raise(RuntimeError::IncompatibleType {
                expected: self.info.name.clone(),
                found: format!("{type_id:?}"),
            }));
        }
        let mut boxed = Storable::new();
        boxed.store(value, type_id).map_err(context::raise)?;

        let mut state = self.state.lock();
        if state.value.is_some() {
            drop(state);
            return Err(context::raise(RuntimeError::AlreadyFulfilled));
        }
        state.value = Some(boxed);
        let callback = state.callback.take();
        let awaited = mem::take(&mut state.awaited);
        let self_ref = state.self_ref.take();
        drop(state);
        log::debug!("{} fulfilled", self.info.name);

        if awaited {
            self.resume_owner();
        }
        if let Some(callback) = callback {
            self.dispatch_callback(callback);
        }
        drop(self_ref);
        Ok(())
    }

    pub fn store_primitive<T: Primitive>(&self, value: T) -> Result<()> {
        self.store(&Payload::primitive(value), T::TYPE_ID)
    }

    /// Fulfils a `future<void>`.
    pub fn complete(&self) -> Result<()> {
        self.store(&Payload::default(), TypeId::VOID)
    }

    fn resume_owner(&self) {
        let Some(context) = self.context.clone() else {
            return;
        };
        context.take_user_data(Context::AWAITING_PROMISE);
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let keep = self.retained();
        engine.scheduler().schedule(move || {
            // waits for the suspending run to return if it has not yet
            let state = context.execute();
            log::debug!("context {} resumed by promise, now {state:?}", context.id());
            drop(keep);
        });
    }

    fn dispatch_callback(&self, callback: ScriptFunction) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let weak = engine.downgrade();
        let me = self.retained();
        engine.scheduler().schedule(move || {
            let Some(engine) = weak.upgrade() else {
                return;
            };
            let Some(context) = engine.request_context() else {
                engine.write_message(
                    "promise",
                    MessageSeverity::Error,
                    &format!("no context for {}", callback.name()),
                );
                return;
            };
            context.prepare(callback.clone());
            let mut arg = Storable::new();
            let handle_type = me.type_info().id.to_handle();
            if arg.store(&Payload::object(me), handle_type).is_ok() {
                context.set_arg(0, arg);
            }
            if context.execute() == ContextState::Exception {
                let text = context
                    .exception()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                engine.write_message("promise", MessageSeverity::Error, &text);
            }
            engine.return_context(context);
        });
    }

    /// Copies the value out when fulfilled with a compatible type.
    pub fn retrieve(&self, out: &mut Payload, type_id: TypeId) -> bool {
        self.state
            .lock()
            .value
            .as_ref()
            .is_some_and(|value| value.retrieve(out, type_id))
    }

    pub fn retrieve_primitive<T: Primitive>(&self) -> Option<T> {
        let mut out = Payload::default();
        self.retrieve(&mut out, T::TYPE_ID)
            .then(|| out.as_primitive())
            .flatten()
    }

    /// The stored payload itself, `None` while pending.
    pub fn value(&self) -> Option<Payload> {
        self.state.lock().value.as_ref().map(|v| v.payload().clone())
    }

    /// Suspends the owning context until the promise is fulfilled, if it is
    /// still pending and the caller runs on that context. Returns the
    /// promise either way.
    pub fn yield_if(&self) -> Handle<Self> {
        // SAFETY: promises are only ever created inside a Handle
        let me = unsafe { Handle::retain(self) };
        let owner = self.context.as_ref().filter(|owner| {
            Context::current().is_some_and(|current| Arc::ptr_eq(&current, *owner))
        });
        let Some(context) = owner else {
            log::debug!("{} not awaited from its owning context", self.info.name);
            return me;
        };
        let mut state = self.state.lock();
        if state.value.is_none() {
            state.awaited = true;
            state.self_ref.get_or_insert_with(|| me.object().clone());
            context.set_user_data(Context::AWAITING_PROMISE, Arc::new(me.object().addr()));
            context.suspend();
        }
        drop(state);
        me
    }

    /// Registers the completion callback, replacing any earlier one. It is
    /// called with the promise as its only argument. On an already
    /// fulfilled promise it is scheduled right away.
    pub fn when(&self, callback: ScriptFunction) {
        let mut state = self.state.lock();
        if state.value.is_some() {
            drop(state);
            self.dispatch_callback(callback);
            return;
        }
        let old = state.callback.replace(callback);
        if state.self_ref.is_none() {
            state.self_ref = Some(self.retained());
        }
        drop(state);
        drop(old);
    }
}

impl ScriptObject for Promise {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        if let Some(value) = &self.state.lock().value {
            value.enum_references(visitor);
        }
    }

    fn release_all_references(&self) {
        let mut state = self.state.lock();
        let owned = state.value.as_mut().and_then(Storable::take_object);
        let callback = state.callback.take();
        drop(state);
        drop((owned, callback));
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("type", &self.info.name)
            .field("fulfilled", &self.is_fulfilled())
            .finish_non_exhaustive()
    }
}
