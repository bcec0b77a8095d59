//! Execution contexts.
//!
//! A [`Context`] is one logical thread of script execution. Script functions
//! are modelled as restartable native closures: when a context suspends, the
//! closure returns, and resuming calls it again. Whatever progress it needs
//! to pick up from lives in its own captured state or in context user data.
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{ObjectRef, Payload, Primitive, RuntimeError, ScriptException, Storable, TypeId};

pub type FunctionBody =
    dyn Fn(&Arc<Context>) -> std::result::Result<(), ScriptException> + Send + Sync;

/// A callable the VM can run on a context.
#[derive(Clone)]
pub struct ScriptFunction {
    name: Arc<str>,
    body: Arc<FunctionBody>,
}

impl ScriptFunction {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&Arc<Context>) -> std::result::Result<(), ScriptException> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            body: Arc::new(body),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn call(&self, context: &Arc<Context>) -> std::result::Result<(), ScriptException> {
        (self.body)(context)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptFunction({})", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Prepared,
    Active,
    Suspended,
    Finished,
    Aborted,
    Exception,
}

#[derive(Default)]
struct ContextInner {
    function: Option<ScriptFunction>,
    args: Vec<Storable>,
    return_value: Storable,
    exception: Option<ScriptException>,
}

pub type UserData = Arc<dyn Any + Send + Sync>;

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<Context>>> = const { RefCell::new(Vec::new()) };
}

struct ActiveGuard;

impl ActiveGuard {
    fn push(context: &Arc<Context>) -> Self {
        ACTIVE.with(|active| active.borrow_mut().push(context.clone()));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.borrow_mut().pop());
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Context {
    id: u64,
    state: Mutex<ContextState>,
    inner: Mutex<ContextInner>,
    // held for the whole of an execution, a context never runs twice at once
    running: Mutex<()>,
    suspend_requested: AtomicBool,
    abort_requested: AtomicBool,
    user_data: Mutex<HashMap<u32, UserData, ahash::RandomState>>,
}

impl Context {
    /// Address of the promise the context is suspended on.
    pub const AWAITING_PROMISE: u32 = 0x7072_6f6d;
    /// The worker thread driving this context.
    pub const WORKER_THREAD: u32 = 0x7468_7264;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ContextState::Uninitialized),
            inner: Mutex::new(ContextInner::default()),
            running: Mutex::new(()),
            suspend_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            user_data: Mutex::new(HashMap::default()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    /// The innermost context executing on the calling native thread.
    pub fn current() -> Option<Arc<Context>> {
        ACTIVE.with(|active| active.borrow().last().cloned())
    }

    pub fn prepare(&self, function: ScriptFunction) {
        let mut inner = self.inner.lock();
        *inner = ContextInner {
            function: Some(function),
            ..ContextInner::default()
        };
        self.suspend_requested.store(false, Ordering::Relaxed);
        self.abort_requested.store(false, Ordering::Relaxed);
        *self.state.lock() = ContextState::Prepared;
    }

    /// Drops the prepared function, arguments and results.
    pub fn unprepare(&self) {
        let old = std::mem::take(&mut *self.inner.lock());
        self.user_data.lock().clear();
        *self.state.lock() = ContextState::Uninitialized;
        drop(old);
    }

    pub fn function(&self) -> Option<ScriptFunction> {
        self.inner.lock().function.clone()
    }

    pub fn set_arg(&self, index: usize, value: Storable) {
        let mut inner = self.inner.lock();
        if inner.args.len() <= index {
            inner.args.resize_with(index + 1, Storable::new);
        }
        inner.args[index] = value;
    }

    /// Type and payload of an argument, handles shared with the slot.
    pub fn arg(&self, index: usize) -> Option<(TypeId, Payload)> {
        let inner = self.inner.lock();
        let arg = inner.args.get(index)?;
        Some((arg.type_id(), arg.payload().clone()))
    }

    pub fn arg_object(&self, index: usize) -> Option<ObjectRef> {
        self.arg(index)?.1.into_object()
    }

    pub fn arg_primitive<T: Primitive>(&self, index: usize) -> Option<T> {
        self.inner.lock().args.get(index)?.get_primitive()
    }

    pub(crate) fn enum_arg_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        for arg in &self.inner.lock().args {
            arg.enum_references(visitor);
        }
    }

    pub(crate) fn clear_args(&self) {
        let old = std::mem::take(&mut self.inner.lock().args);
        drop(old);
    }

    pub fn set_return(&self, value: Storable) {
        self.inner.lock().return_value = value;
    }

    pub fn take_return(&self) -> Storable {
        std::mem::take(&mut self.inner.lock().return_value)
    }

    pub fn return_primitive<T: Primitive>(&self) -> Option<T> {
        self.inner.lock().return_value.get_primitive()
    }

    /// Runs (or resumes) the prepared function until it returns.
    pub fn execute(self: &Arc<Self>) -> ContextState {
        let _running = self.running.lock();
        {
            let mut state = self.state.lock();
            match *state {
                ContextState::Prepared | ContextState::Suspended => {
                    *state = ContextState::Active;
                }
                other => return other,
            }
        }
        let Some(function) = self.function() else {
            *self.state.lock() = ContextState::Uninitialized;
            return ContextState::Uninitialized;
        };

        let result = {
            let _active = ActiveGuard::push(self);
            function.call(self)
        };

        let mut inner = self.inner.lock();
        let state = if self.abort_requested.swap(false, Ordering::AcqRel) {
            ContextState::Aborted
        } else if let Err(exception) = result {
            inner.exception = Some(exception);
            ContextState::Exception
        } else if inner.exception.is_some() {
            ContextState::Exception
        } else if self.suspend_requested.swap(false, Ordering::AcqRel) {
            ContextState::Suspended
        } else {
            ContextState::Finished
        };
        drop(inner);
        *self.state.lock() = state;
        state
    }

    /// Calls `function` on this context from inside a running function, as a
    /// comparison callback does. Arguments and the return slot of the outer
    /// call are restored afterwards, as is an exception already pending on
    /// the context unless the call raises its own.
    pub fn call(
        self: &Arc<Self>,
        function: &ScriptFunction,
        args: Vec<Storable>,
    ) -> std::result::Result<Storable, ScriptException> {
        let (saved_args, pending) = {
            let mut inner = self.inner.lock();
            (
                std::mem::replace(&mut inner.args, args),
                inner.exception.take(),
            )
        };
        let saved_return = self.take_return();

        let result = {
            let _active = ActiveGuard::push(self);
            function.call(self)
        };

        let mut inner = self.inner.lock();
        inner.args = saved_args;
        let returned = std::mem::replace(&mut inner.return_value, saved_return);
        // only an exception raised by this call fails it
        let raised = inner.exception.clone();
        if raised.is_none() {
            inner.exception = pending;
        }
        match (result, raised) {
            (Err(exception), _) | (Ok(()), Some(exception)) => Err(exception),
            (Ok(()), None) => Ok(returned),
        }
    }

    /// Asks the running function to stop at its next safe point; it is
    /// resumed by executing the context again.
    pub fn suspend(&self) {
        self.suspend_requested.store(true, Ordering::Release);
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub fn raise(&self, type_name: &str, message: &str) {
        self.raise_exception(ScriptException::new(type_name, message));
    }

    pub fn raise_exception(&self, exception: ScriptException) {
        log::debug!("context {} raised {}", self.id, exception);
        self.inner.lock().exception = Some(exception);
    }

    pub fn exception(&self) -> Option<ScriptException> {
        self.inner.lock().exception.clone()
    }

    pub fn clear_exception(&self) -> Option<ScriptException> {
        self.inner.lock().exception.take()
    }

    pub fn set_user_data(&self, slot: u32, data: UserData) -> Option<UserData> {
        self.user_data.lock().insert(slot, data)
    }

    pub fn user_data<T: Any + Send + Sync>(&self, slot: u32) -> Option<Arc<T>> {
        self.user_data.lock().get(&slot)?.clone().downcast().ok()
    }

    pub fn take_user_data(&self, slot: u32) -> Option<UserData> {
        self.user_data.lock().remove(&slot)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Raises `err` on the calling context, if there is one, and hands it back.
pub(crate) fn raise(err: RuntimeError) -> RuntimeError {
    if let Some(context) = Context::current() {
        context.raise_exception(ScriptException::from(err.clone()));
    }
    err
}
