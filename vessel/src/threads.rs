//! Script worker threads.
//!
//! A [`ScriptThread`] runs one script function on its own native thread and
//! exchanges boxed values with its owner over two [`Pipe`]s. Which pipe a
//! call uses depends only on whether the caller is the worker itself.
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt, io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    Context, ContextState, Engine, Handle, MessageSeverity, ObjectHeader, ObjectRef, Payload,
    Primitive, Result, RuntimeError, ScriptException, ScriptFunction, ScriptObject, Storable,
    TypeDesc, TypeFlags, TypeId, TypeInfo, WeakEngine, context,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    Running,
    Suspended,
    Finished,
    Excepted,
    Aborted,
}

impl ThreadState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            ThreadState::Finished | ThreadState::Excepted | ThreadState::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResult {
    NotJoinable,
    TimedOut,
    Finished,
}

/// FIFO of boxed values with a condition variable for waiting poppers.
#[derive(Default)]
pub struct Pipe {
    queue: Mutex<VecDeque<Storable>>,
    available: Condvar,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: Storable) {
        self.queue.lock().push_back(value);
        self.available.notify_one();
    }

    /// Moves the front value into `out` if it is retrievable as `type_id`.
    /// A zero timeout only looks. A value of another type stays queued.
    pub fn pop(&self, out: &mut Payload, type_id: TypeId, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            if timeout.is_zero() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut queue, deadline).timed_out()
                        && queue.is_empty()
                    {
                        return false;
                    }
                }
                None => self.available.wait(&mut queue),
            }
        }
        let Some(front) = queue.front() else {
            return false;
        };
        if !front.retrieve(out, type_id) {
            return false;
        }
        let popped = queue.pop_front();
        drop(queue);
        drop(popped);
        true
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        let drained = std::mem::take(&mut *self.queue.lock());
        drop(drained);
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        for value in self.queue.lock().iter() {
            value.enum_references(visitor);
        }
    }
}

/// An OS thread whose completion can be waited for with a timeout.
pub struct NativeThread {
    handle: Mutex<Option<JoinHandle<()>>>,
    done: (Mutex<bool>, Condvar),
}

impl NativeThread {
    pub fn spawn<F>(name: String, f: F) -> io::Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        let native = Arc::new(Self {
            handle: Mutex::new(None),
            done: (Mutex::new(false), Condvar::new()),
        });
        let signal = Arc::clone(&native);
        let handle = thread::Builder::new().name(name).spawn(move || {
            f();
            let (ref mx, ref cv) = signal.done;
            *mx.lock() = true;
            cv.notify_all();
        })?;
        *native.handle.lock() = Some(handle);
        Ok(native)
    }

    pub fn is_finished(&self) -> bool {
        *self.done.0.lock()
    }

    pub fn join_timeout(&self, dur: Duration) -> bool {
        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        if *done {
            return true;
        }
        let deadline = Instant::now().checked_add(dur);
        while !*done {
            match deadline {
                Some(deadline) => {
                    if cv.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                None => cv.wait(&mut done),
            }
        }
        true
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Handle<ScriptThread>>> = const { RefCell::new(None) };
}

/// Values the worker pushes and its owner pops.
const FROM_WORKER: usize = 0;
/// Values the owner pushes and the worker pops.
const FROM_OWNER: usize = 1;

struct ThreadInner {
    state: ThreadState,
    context: Option<Arc<Context>>,
    native: Option<Arc<NativeThread>>,
    last_exception: Option<ScriptException>,
}

pub struct ScriptThread {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    engine: WeakEngine,
    function: ScriptFunction,
    pipes: [Pipe; 2],
    inner: Mutex<ThreadInner>,
}

impl ScriptThread {
    pub fn new(engine: &Engine, function: ScriptFunction) -> Handle<Self> {
        let thread = Handle::new(Self {
            header: ObjectHeader::new(),
            info: engine.builtins().thread.clone(),
            engine: engine.downgrade(),
            function,
            pipes: [Pipe::new(), Pipe::new()],
            inner: Mutex::new(ThreadInner {
                state: ThreadState::Idle,
                context: None,
                native: None,
                last_exception: None,
            }),
        });
        engine.notify_gc(thread.object());
        thread
    }

    pub(crate) fn type_desc(_id: TypeId) -> TypeDesc {
        TypeDesc::new("thread", 0, TypeFlags::REF | TypeFlags::GC)
    }

    /// The worker running on the calling native thread.
    pub fn current() -> Option<Handle<ScriptThread>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    fn is_own_thread(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|t| std::ptr::eq(&**t, self))
        })
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    pub fn last_exception(&self) -> Option<ScriptException> {
        self.inner.lock().last_exception.clone()
    }

    /// Runs the function on a new native thread, with the worker as its
    /// first argument.
    pub fn start(&self) -> Result<()> {
        let engine = self.engine.get().map_err(context::raise)?;
        let mut inner = self.inner.lock();
        if inner.native.is_some() || matches!(inner.state, ThreadState::Running | ThreadState::Suspended)
        {
            drop(inner);
            return Err(context::raise(RuntimeError::AlreadyRunning));
        }
        let Some(context) = engine.request_context() else {
            drop(inner);
            engine.write_message(
                "thread",
                MessageSeverity::Error,
                &format!("no context available to start {}", self.function.name()),
            );
            return Err(context::raise(RuntimeError::NoContext));
        };
        context.prepare(self.function.clone());
        let mut this = Storable::new();
        // SAFETY: threads are only ever created inside a Handle
        let me = unsafe { Handle::retain(self) };
        if this.store(&Payload::object(me.object().clone()), self.info.id.to_handle()).is_ok() {
            context.set_arg(0, this);
        }
        context.set_user_data(Context::WORKER_THREAD, Arc::new(me.object().addr()));
        inner.context = Some(context.clone());
        inner.last_exception = None;
        inner.state = ThreadState::Running;

        match self.spawn_native(me, context.clone()) {
            Ok(native) => {
                inner.native = Some(native);
                log::debug!("thread {} started", self.function.name());
                Ok(())
            }
            Err(err) => {
                inner.context = None;
                inner.state = ThreadState::Idle;
                drop(inner);
                engine.return_context(context);
                engine.write_message(
                    "thread",
                    MessageSeverity::Error,
                    &format!("failed to spawn {}: {err}", self.function.name()),
                );
                Err(context::raise(RuntimeError::NoContext))
            }
        }
    }

    fn spawn_native(&self, me: Handle<Self>, context: Arc<Context>) -> io::Result<Arc<NativeThread>> {
        let name = format!("script-{}", self.function.name());
        NativeThread::spawn(name, move || {
            CURRENT.with(|current| *current.borrow_mut() = Some(me.clone()));
            let state = context.execute();
            me.finish_run(&context, state);
            let bound = CURRENT.with(|current| current.borrow_mut().take());
            drop(bound);
        })
    }

    fn finish_run(&self, context: &Arc<Context>, state: ContextState) {
        let next = match state {
            ContextState::Suspended => ThreadState::Suspended,
            ContextState::Exception => ThreadState::Excepted,
            ContextState::Aborted => ThreadState::Aborted,
            _ => ThreadState::Finished,
        };
        if next.is_terminal() {
            // the worker no longer needs itself as an argument
            context.set_arg(0, Storable::new());
        }
        let mut inner = self.inner.lock();
        if next == ThreadState::Excepted {
            inner.last_exception = context.exception();
        }
        inner.state = next;
        log::debug!("thread {} is {next:?}", self.function.name());
    }

    /// Asks the running function to stop at its next safe point.
    pub fn suspend(&self) {
        let inner = self.inner.lock();
        if inner.state == ThreadState::Running {
            if let Some(context) = &inner.context {
                context.suspend();
            }
        }
    }

    /// Continues a suspended run on a fresh native thread.
    pub fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ThreadState::Suspended {
            drop(inner);
            return Err(context::raise(RuntimeError::NotSuspended));
        }
        let Some(context) = inner.context.clone() else {
            drop(inner);
            return Err(context::raise(RuntimeError::NoContext));
        };
        if let Some(previous) = inner.native.take() {
            previous.join();
        }
        inner.state = ThreadState::Running;
        // SAFETY: threads are only ever created inside a Handle
        let me = unsafe { Handle::retain(self) };
        match self.spawn_native(me, context) {
            Ok(native) => {
                inner.native = Some(native);
                Ok(())
            }
            Err(err) => {
                inner.state = ThreadState::Suspended;
                drop(inner);
                log::error!("failed to resume {}: {err}", self.function.name());
                Err(context::raise(RuntimeError::NoContext))
            }
        }
    }

    /// Waits for the run to end, for at most `timeout` if given. A run that
    /// ended with an exception re-raises it on the calling context. Joining
    /// releases the context, after which the worker can be started again.
    pub fn join(&self, timeout: Option<Duration>) -> JoinResult {
        if self.is_own_thread() {
            context::raise(RuntimeError::SelfJoin);
            return JoinResult::NotJoinable;
        }
        let Some(native) = self.inner.lock().native.clone() else {
            return JoinResult::NotJoinable;
        };
        let done = match timeout {
            Some(timeout) => native.join_timeout(timeout),
            None => native.join_timeout(Duration::MAX),
        };
        if !done {
            return JoinResult::TimedOut;
        }
        native.join();

        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            // suspended, resume before joining
            return JoinResult::NotJoinable;
        }
        inner.native = None;
        inner.state = ThreadState::Idle;
        let context = inner.context.take();
        let exception = inner.last_exception.clone();
        drop(inner);

        if let (Some(context), Some(engine)) = (context, self.engine.upgrade()) {
            engine.return_context(context);
        }
        log::debug!("thread {} joined", self.function.name());
        if let Some(exception) = exception {
            if let Some(caller) = Context::current() {
                caller.raise_exception(exception);
            }
        }
        JoinResult::Finished
    }

    fn push_pipe(&self) -> &Pipe {
        if self.is_own_thread() {
            &self.pipes[FROM_WORKER]
        } else {
            &self.pipes[FROM_OWNER]
        }
    }

    fn pop_pipe(&self) -> &Pipe {
        if self.is_own_thread() {
            &self.pipes[FROM_OWNER]
        } else {
            &self.pipes[FROM_WORKER]
        }
    }

    /// Boxes `value` and sends it to the other side.
    pub fn push(&self, value: &Payload, type_id: TypeId) -> Result<()> {
        let mut boxed = Storable::new();
        boxed.store(value, type_id).map_err(context::raise)?;
        self.push_pipe().push(boxed);
        Ok(())
    }

    pub fn push_primitive<T: Primitive>(&self, value: T) {
        self.push_pipe().push(Storable::from_primitive(value));
    }

    /// Takes the next value from the other side, waiting up to `timeout`.
    pub fn pop_timeout(&self, out: &mut Payload, type_id: TypeId, timeout: Duration) -> bool {
        self.pop_pipe().pop(out, type_id, timeout)
    }

    pub fn try_pop(&self, out: &mut Payload, type_id: TypeId) -> bool {
        self.pop_timeout(out, type_id, Duration::ZERO)
    }

    /// Waits for the next value in poll-interval steps. Gives up once the
    /// other side can no longer send: the worker when its run is aborted,
    /// the owner when the worker is not running.
    pub fn pop(&self, out: &mut Payload, type_id: TypeId) -> bool {
        let interval = self
            .engine
            .upgrade()
            .map_or(Duration::from_millis(100), |e| e.settings().pipe_poll_interval);
        let own = self.is_own_thread();
        loop {
            if self.pop_timeout(out, type_id, interval) {
                return true;
            }
            let gone = if own {
                Context::current().is_none_or(|c| c.state() == ContextState::Aborted)
            } else {
                !matches!(self.state(), ThreadState::Running | ThreadState::Suspended)
            };
            if gone {
                return self.try_pop(out, type_id);
            }
        }
    }

    pub fn pop_primitive<T: Primitive>(&self, timeout: Duration) -> Option<T> {
        let mut out = Payload::default();
        self.pop_timeout(&mut out, T::TYPE_ID, timeout)
            .then(|| out.as_primitive())
            .flatten()
    }
}

impl ScriptObject for ScriptThread {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        for pipe in &self.pipes {
            pipe.enum_references(visitor);
        }
        // a suspended run still holds the worker as its argument
        let context = self.inner.lock().context.clone();
        if let Some(context) = context {
            context.enum_arg_references(visitor);
        }
    }

    fn release_all_references(&self) {
        for pipe in &self.pipes {
            pipe.clear();
        }
        let context = self.inner.lock().context.clone();
        if let Some(context) = context {
            context.clear_args();
        }
    }
}

impl Drop for ScriptThread {
    fn drop(&mut self) {
        let context = self.inner.get_mut().context.take();
        if let (Some(context), Some(engine)) = (context, self.engine.upgrade()) {
            engine.return_context(context);
        }
    }
}

impl fmt::Debug for ScriptThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptThread")
            .field("function", &self.function.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
