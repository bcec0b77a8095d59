use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    Context, DictionaryValue, GarbageCollector, GcStats, ObjectRef, Promise, Result,
    RuntimeError, Scheduler, ScriptAny, ScriptArray, ScriptDictionary, ScriptHandle,
    ScriptString, ScriptThread, ScriptWeakRef, StringPool, TypeDesc, TypeFlags, TypeId,
    TypeInfo, TypeQuery, TypeRegistry,
};

/// Process-wide lock for the rare populate paths of global caches.
static EXCLUSIVE: Mutex<()> = Mutex::new(());

pub fn acquire_exclusive_lock() -> MutexGuard<'static, ()> {
    EXCLUSIVE.lock()
}

const MAX_MESSAGES: usize = 64;

#[derive(Debug, Default, Clone)]
pub struct EngineCreateInfo {
    pub scheduler_workers: Option<usize>,
    /// upper bound for an array's buffer, in bytes
    pub max_array_size: Option<usize>,
    /// how often an untimed pipe pop checks for cancellation
    pub pipe_poll_interval: Option<Duration>,
    /// contexts that may be handed out at once
    pub context_pool_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub scheduler_workers: usize,
    pub max_array_size: usize,
    pub pipe_poll_interval: Duration,
    pub context_pool_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scheduler_workers: 2,
            max_array_size: (1 << 31) - 1,
            pipe_poll_interval: Duration::from_millis(100),
            context_pool_size: 8,
        }
    }
}

impl EngineSettings {
    fn from_info(info: &EngineCreateInfo) -> Self {
        let mut settings = Self::default();
        info.scheduler_workers
            .inspect(|&val| settings.scheduler_workers = val);
        info.max_array_size.inspect(|&val| settings.max_array_size = val);
        info.pipe_poll_interval
            .inspect(|&val| settings.pipe_poll_interval = val);
        info.context_pool_size
            .inspect(|&val| settings.context_pool_size = val);
        settings
    }

    fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.max_array_size == 0 {
            return Err("max_array_size must be > 0");
        }
        if self.pipe_poll_interval.is_zero() {
            return Err("pipe_poll_interval must be > 0");
        }
        if self.context_pool_size == 0 {
            return Err("context_pool_size must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Error,
    Warning,
    Information,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMessage {
    pub section: String,
    pub severity: MessageSeverity,
    pub text: String,
}

/// The types every engine registers up front.
#[derive(Debug)]
pub struct BuiltinTypes {
    pub string: Arc<TypeInfo>,
    pub any: Arc<TypeInfo>,
    pub dictionary: Arc<TypeInfo>,
    pub dictionary_value: Arc<TypeInfo>,
    pub handle: Arc<TypeInfo>,
    pub thread: Arc<TypeInfo>,
}

#[derive(Default)]
struct ContextPool {
    idle: Vec<Arc<Context>>,
    in_use: usize,
}

pub struct EngineShared {
    settings: EngineSettings,
    registry: TypeRegistry,
    strings: Arc<StringPool>,
    scheduler: Scheduler,
    gc: GarbageCollector,
    contexts: Mutex<ContextPool>,
    messages: Mutex<VecDeque<EngineMessage>>,
    builtins: BuiltinTypes,
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        let released = self.gc.release_all();
        log::debug!("engine dropped, released {released} tracked objects");
    }
}

/// Cheap handle to the host runtime the containers call back into.
#[derive(Clone)]
pub struct Engine(Arc<EngineShared>);

/// Non-owning engine handle kept by objects, so that objects tracked by the
/// collector do not keep their engine alive.
#[derive(Clone)]
pub struct WeakEngine(Weak<EngineShared>);

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(Engine)
    }

    pub(crate) fn get(&self) -> Result<Engine> {
        self.upgrade().ok_or(RuntimeError::NoContext)
    }
}

impl fmt::Debug for WeakEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakEngine")
    }
}

impl Engine {
    pub fn new(info: EngineCreateInfo) -> Result<Self> {
        let settings = EngineSettings::from_info(&info);
        settings.validate().map_err(RuntimeError::InvalidSettings)?;
        log::debug!("creating engine with {settings:?}");

        let shared = Arc::new_cyclic(|weak: &Weak<EngineShared>| {
            let engine = WeakEngine(weak.clone());
            let registry = TypeRegistry::new();
            let builtins = register_builtins(&registry, &engine);
            EngineShared {
                scheduler: Scheduler::new(settings.scheduler_workers),
                registry,
                strings: Arc::new(StringPool::new()),
                gc: GarbageCollector::new(),
                contexts: Mutex::new(ContextPool::default()),
                messages: Mutex::new(VecDeque::new()),
                builtins,
                settings,
            }
        });
        Ok(Self(shared))
    }

    #[inline]
    pub fn settings(&self) -> &EngineSettings {
        &self.0.settings
    }

    #[inline]
    pub fn registry(&self) -> &TypeRegistry {
        &self.0.registry
    }

    #[inline]
    pub fn strings(&self) -> &StringPool {
        &self.0.strings
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    #[inline]
    pub fn gc(&self) -> &GarbageCollector {
        &self.0.gc
    }

    #[inline]
    pub fn builtins(&self) -> &BuiltinTypes {
        &self.0.builtins
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn acquire_exclusive_lock(&self) -> MutexGuard<'static, ()> {
        acquire_exclusive_lock()
    }

    pub fn register_type(&self, desc: TypeDesc) -> Result<Arc<TypeInfo>> {
        self.0.registry.register(desc)
    }

    pub fn register_enum(&self, name: &str) -> Result<TypeId> {
        self.0.registry.register_enum(name)
    }

    /// `array<sub>`, registered on first use.
    pub fn array_type(&self, sub_type: TypeId) -> Result<Arc<TypeInfo>> {
        ScriptArray::template_callback(self, sub_type)?;
        let gc = sub_type.is_object();
        let engine = self.downgrade();
        self.0.registry.template_instance("array", sub_type, |name, id| {
            ScriptArray::type_desc(&engine, name, id, gc)
        })
    }

    /// `weakref<sub>`; the target type must hand out weak-reference flags.
    pub fn weakref_type(&self, sub_type: TypeId) -> Result<Arc<TypeInfo>> {
        ScriptWeakRef::template_callback(self, sub_type)?;
        self.0
            .registry
            .template_instance("weakref", sub_type, |name, _| ScriptWeakRef::type_desc(name))
    }

    /// `future<sub>`, with `future<void>` for promises without a value.
    pub fn future_type(&self, sub_type: TypeId) -> Result<Arc<TypeInfo>> {
        self.0
            .registry
            .template_instance("future", sub_type, |name, _| Promise::type_desc(name))
    }

    #[inline]
    pub fn string_type_id(&self) -> TypeId {
        self.0.builtins.string.id
    }

    pub fn new_string(&self, value: &str) -> ObjectRef {
        ScriptString::create(&self.0.builtins.string, Arc::from(value))
    }

    /// A string object sharing its text with the constant pool.
    pub fn string_constant(&self, value: &str) -> ObjectRef {
        ScriptString::create_interned(&self.0.builtins.string, &self.0.strings, value)
    }

    /// Default-constructs an object of a registered type.
    pub fn create_object(&self, type_id: TypeId) -> Option<ObjectRef> {
        let info = self.type_info(type_id)?;
        let factory = info.behaviors.factory.clone()?;
        factory(&info)
    }

    /// Hands an object of a GC type to the collector.
    pub fn notify_gc(&self, object: &ObjectRef) {
        if object.type_info().is_gc() {
            self.0.gc.notify(object.clone());
        }
    }

    pub fn collect_garbage(&self) -> GcStats {
        self.0.gc.collect()
    }

    /// Takes a context from the pool, or creates one while fewer than
    /// `context_pool_size` are in use.
    pub fn request_context(&self) -> Option<Arc<Context>> {
        let mut pool = self.0.contexts.lock();
        if pool.in_use >= self.0.settings.context_pool_size {
            return None;
        }
        pool.in_use += 1;
        Some(pool.idle.pop().unwrap_or_else(Context::new))
    }

    pub fn return_context(&self, context: Arc<Context>) {
        context.unprepare();
        let mut pool = self.0.contexts.lock();
        pool.in_use = pool.in_use.saturating_sub(1);
        pool.idle.push(context);
    }

    pub fn contexts_in_use(&self) -> usize {
        self.0.contexts.lock().in_use
    }

    /// The embedding layer's message channel.
    pub fn write_message(&self, section: &str, severity: MessageSeverity, text: &str) {
        match severity {
            MessageSeverity::Error => log::error!("{section}: {text}"),
            MessageSeverity::Warning => log::warn!("{section}: {text}"),
            MessageSeverity::Information => log::info!("{section}: {text}"),
        }
        let mut messages = self.0.messages.lock();
        if messages.len() == MAX_MESSAGES {
            messages.pop_front();
        }
        messages.push_back(EngineMessage {
            section: section.to_owned(),
            severity,
            text: text.to_owned(),
        });
    }

    pub fn messages(&self) -> Vec<EngineMessage> {
        self.0.messages.lock().iter().cloned().collect()
    }

    /// Stops the scheduler and breaks every tracked object's references.
    pub fn shutdown(&self) {
        self.0.scheduler.shutdown();
        let released = self.0.gc.release_all();
        log::info!("engine shut down, released {released} tracked objects");
    }
}

impl TypeQuery for Engine {
    fn type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.0.registry.type_info(id)
    }

    fn type_info_by_name(&self, name: &str) -> Option<Arc<TypeInfo>> {
        self.0.registry.type_info_by_name(name)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("types", &self.0.registry.len())
            .field("tracked", &self.0.gc.len())
            .finish_non_exhaustive()
    }
}

fn register_builtins(registry: &TypeRegistry, engine: &WeakEngine) -> BuiltinTypes {
    let string = registry.register_builtin(TypeFlags::VALUE, ScriptString::type_desc);
    let any = registry.register_builtin(TypeFlags::REF | TypeFlags::GC, |id| {
        ScriptAny::type_desc(engine, id)
    });
    let dictionary = registry.register_builtin(TypeFlags::REF | TypeFlags::GC, |id| {
        ScriptDictionary::type_desc(engine, id)
    });
    let dictionary_value = registry.register_builtin(TypeFlags::VALUE | TypeFlags::GC, |id| {
        DictionaryValue::type_desc(engine, id)
    });
    let handle = registry.register_builtin(TypeFlags::VALUE | TypeFlags::GC, |id| {
        ScriptHandle::type_desc(engine, id)
    });
    let thread = registry.register_builtin(TypeFlags::REF | TypeFlags::GC, |id| {
        ScriptThread::type_desc(id)
    });
    BuiltinTypes {
        string,
        any,
        dictionary,
        dictionary_value,
        handle,
        thread,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_info_overrides_defaults() {
        let engine = Engine::new(EngineCreateInfo {
            scheduler_workers: Some(0),
            context_pool_size: Some(3),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(engine.settings().scheduler_workers, 0);
        assert_eq!(engine.settings().context_pool_size, 3);
        assert_eq!(engine.settings().max_array_size, (1 << 31) - 1);
        assert_eq!(engine.scheduler().worker_count(), 0);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let err = Engine::new(EngineCreateInfo {
            context_pool_size: Some(0),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidSettings(_)));
    }

    #[test]
    fn builtin_types_are_registered() {
        let engine = Engine::new(EngineCreateInfo::default()).unwrap();
        assert_eq!(engine.type_name(engine.string_type_id()), "string");
        let dictionary = engine.type_info_by_name("dictionary").unwrap();
        assert!(dictionary.is_gc());
        assert!(engine.builtins().handle.is_value());
        assert_eq!(
            engine.type_name(engine.builtins().any.id.to_handle()),
            "any@"
        );
    }

    #[test]
    fn template_instances_are_named_after_their_sub_type() {
        let engine = Engine::new(EngineCreateInfo::default()).unwrap();
        let ints = engine.array_type(TypeId::INT32).unwrap();
        assert_eq!(ints.name, "array<int>");
        assert!(!ints.is_gc());
        let strings = engine.array_type(engine.string_type_id()).unwrap();
        assert_eq!(strings.name, "array<string>");
        assert!(strings.is_gc());
        let nested = engine.array_type(ints.id.to_handle()).unwrap();
        assert_eq!(nested.name, "array<array<int>@>");
        assert_eq!(engine.future_type(TypeId::VOID).unwrap().name, "future<void>");
    }

    #[test]
    fn context_pool_is_bounded() {
        let engine = Engine::new(EngineCreateInfo {
            scheduler_workers: Some(0),
            context_pool_size: Some(2),
            ..Default::default()
        })
        .unwrap();
        let a = engine.request_context().unwrap();
        let b = engine.request_context().unwrap();
        assert!(engine.request_context().is_none());
        let id = a.id();
        engine.return_context(a);
        let c = engine.request_context().unwrap();
        assert_eq!(c.id(), id);
        engine.return_context(b);
        engine.return_context(c);
        assert_eq!(engine.contexts_in_use(), 0);
    }

    #[test]
    fn messages_are_kept_and_bounded() {
        let engine = Engine::new(EngineCreateInfo::default()).unwrap();
        for i in 0..(MAX_MESSAGES + 5) {
            engine.write_message("test", MessageSeverity::Information, &i.to_string());
        }
        let messages = engine.messages();
        assert_eq!(messages.len(), MAX_MESSAGES);
        assert_eq!(messages[0].text, "5");
    }

    #[test]
    fn string_constants_share_pool_storage() {
        let engine = Engine::new(EngineCreateInfo::default()).unwrap();
        let a = engine.string_constant("hi");
        let b = engine.string_constant("hi");
        let a = a.downcast_ref::<ScriptString>().unwrap();
        let b = b.downcast_ref::<ScriptString>().unwrap();
        assert!(Arc::ptr_eq(a.shared(), b.shared()));
        assert_eq!(engine.strings().ref_count("hi"), 2);
    }

    #[test]
    fn dropped_string_constants_leave_the_pool() {
        let engine = Engine::new(EngineCreateInfo::default()).unwrap();
        let first = engine.string_constant("hello");
        let second = engine.string_constant("hello");
        drop(first);
        assert_eq!(engine.strings().ref_count("hello"), 1);
        drop(second);
        assert_eq!(engine.strings().ref_count("hello"), 0);
        assert_eq!(engine.strings().len(), 0);
    }
}
