//! Runtime type descriptions.
//!
//! Every value the core stores travels with a [`TypeId`]. Primitive ids are
//! fixed; registered types get a sequence number combined with kind bits:
//!
//! [0..<26 sequence]
//! [26 app object] [27 script object] [28 template]
//! [29 handle to const] [30 handle]
//!
//! A [`TypeInfo`] carries the per-type operations (factory, copy, methods) so
//! the containers never need static knowledge of what they hold.
use std::{
    any::Any,
    collections::HashMap,
    fmt, mem,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicI32, Ordering},
    },
};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::{ObjectRef, Payload, Result, RuntimeError, ScriptException};

#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(i32);

impl TypeId {
    pub const VOID: Self = Self(0);
    pub const BOOL: Self = Self(1);
    pub const INT8: Self = Self(2);
    pub const INT16: Self = Self(3);
    pub const INT32: Self = Self(4);
    pub const INT64: Self = Self(5);
    pub const UINT8: Self = Self(6);
    pub const UINT16: Self = Self(7);
    pub const UINT32: Self = Self(8);
    pub const UINT64: Self = Self(9);
    pub const FLOAT: Self = Self(10);
    pub const DOUBLE: Self = Self(11);

    pub const SEQUENCE_MASK: i32 = 0x03FF_FFFF;
    pub const APP_OBJECT: i32 = 0x0400_0000;
    pub const SCRIPT_OBJECT: i32 = 0x0800_0000;
    pub const TEMPLATE: i32 = 0x1000_0000;
    pub const OBJECT_MASK: i32 = 0x1C00_0000;
    pub const HANDLE_TO_CONST: i32 = 0x2000_0000;
    pub const HANDLE: i32 = 0x4000_0000;

    pub const FIRST_USER_SEQUENCE: i32 = 12;

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn sequence(self) -> i32 {
        self.0 & Self::SEQUENCE_MASK
    }

    #[inline]
    pub const fn is_void(self) -> bool {
        self.0 == 0
    }

    /// bool, the sized integers, float and double
    #[inline]
    pub const fn is_primitive(self) -> bool {
        self.0 >= Self::BOOL.0 && self.0 <= Self::DOUBLE.0
    }

    #[inline]
    pub const fn is_enum(self) -> bool {
        let kind = Self::OBJECT_MASK | Self::HANDLE | Self::HANDLE_TO_CONST;
        self.0 & kind == 0 && self.0 > Self::DOUBLE.0
    }

    /// Values stored as raw bits: primitives and enums.
    #[inline]
    pub const fn is_scalar(self) -> bool {
        self.is_primitive() || self.is_enum()
    }

    #[inline]
    pub const fn is_object(self) -> bool {
        self.0 & Self::OBJECT_MASK != 0
    }

    #[inline]
    pub const fn is_handle(self) -> bool {
        self.0 & Self::HANDLE != 0
    }

    /// The id with handle bits stripped.
    #[inline]
    pub const fn base(self) -> Self {
        Self(self.0 & !(Self::HANDLE | Self::HANDLE_TO_CONST))
    }

    #[inline]
    pub const fn to_handle(self) -> Self {
        Self(self.0 | Self::HANDLE)
    }

    pub fn is_integer(self) -> bool {
        (Self::INT8.0..=Self::UINT64.0).contains(&self.0) || self.is_enum()
    }

    pub fn is_signed(self) -> bool {
        (Self::INT8.0..=Self::INT64.0).contains(&self.0) || self.is_enum()
    }

    pub fn is_float(self) -> bool {
        self == Self::FLOAT || self == Self::DOUBLE
    }

    /// Width in bytes of a scalar type, `None` for objects and handles.
    pub fn scalar_size(self) -> Option<usize> {
        let size = match self {
            Self::VOID => 0,
            Self::BOOL | Self::INT8 | Self::UINT8 => 1,
            Self::INT16 | Self::UINT16 => 2,
            Self::INT32 | Self::UINT32 | Self::FLOAT => 4,
            Self::INT64 | Self::UINT64 | Self::DOUBLE => 8,
            id if id.is_enum() => 4,
            _ => return None,
        };
        Some(size)
    }

    pub fn primitive_name(self) -> Option<&'static str> {
        let name = match self {
            Self::VOID => "void",
            Self::BOOL => "bool",
            Self::INT8 => "int8",
            Self::INT16 => "int16",
            Self::INT32 => "int",
            Self::INT64 => "int64",
            Self::UINT8 => "uint8",
            Self::UINT16 => "uint16",
            Self::UINT32 => "uint",
            Self::UINT64 => "uint64",
            Self::FLOAT => "float",
            Self::DOUBLE => "double",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primitive_name() {
            Some(name) => write!(f, "TypeId({name})"),
            None => write!(f, "TypeId({:#x})", self.0),
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const REF = 1 << 0;
        const VALUE = 1 << 1;
        const GC = 1 << 2;
        const POD = 1 << 3;
        const NOCOUNT = 1 << 4;
        const ENUM = 1 << 5;
        const TEMPLATE = 1 << 6;
        const SCRIPT_OBJECT = 1 << 7;
    }
}

pub type FactoryFn = Arc<dyn Fn(&Arc<TypeInfo>) -> Option<ObjectRef> + Send + Sync>;
pub type CopyFn = Arc<dyn Fn(&ObjectRef) -> Option<ObjectRef> + Send + Sync>;
pub type MethodFn = Arc<
    dyn Fn(&ObjectRef, &[Payload]) -> std::result::Result<Payload, ScriptException>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct Behaviors {
    /// default construction
    pub factory: Option<FactoryFn>,
    /// copy construction, `None` from the callable means the copy failed
    pub copy: Option<CopyFn>,
    /// instances hand out a weak-reference flag
    pub weakref_flag: bool,
}

#[derive(Clone)]
pub struct ScriptMethod {
    pub name: String,
    pub params: Vec<TypeId>,
    pub return_type: TypeId,
    pub is_const: bool,
    pub func: MethodFn,
}

impl ScriptMethod {
    pub fn new<F>(
        name: &str,
        params: Vec<TypeId>,
        return_type: TypeId,
        func: F,
    ) -> Self
    where
        F: Fn(&ObjectRef, &[Payload]) -> std::result::Result<Payload, ScriptException>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_owned(),
            params,
            return_type,
            is_const: true,
            func: Arc::new(func),
        }
    }

    #[inline]
    pub fn call(
        &self,
        this: &ObjectRef,
        args: &[Payload],
    ) -> std::result::Result<Payload, ScriptException> {
        (self.func)(this, args)
    }
}

impl fmt::Debug for ScriptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptMethod")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInstance {
    pub template: String,
    pub sub_type: TypeId,
}

/// Everything needed to register a type.
#[derive(Clone)]
pub struct TypeDesc {
    pub name: String,
    pub size: usize,
    pub flags: TypeFlags,
    pub template: Option<TemplateInstance>,
    pub behaviors: Behaviors,
    pub methods: Vec<ScriptMethod>,
}

impl TypeDesc {
    pub fn new(name: &str, size: usize, flags: TypeFlags) -> Self {
        Self {
            name: name.to_owned(),
            size,
            flags,
            template: None,
            behaviors: Behaviors::default(),
            methods: Vec::new(),
        }
    }

    pub fn with_behaviors(mut self, behaviors: Behaviors) -> Self {
        self.behaviors = behaviors;
        self
    }

    pub fn with_method(mut self, method: ScriptMethod) -> Self {
        self.methods.push(method);
        self
    }
}

pub struct TypeInfo {
    pub name: String,
    pub id: TypeId,
    pub size: usize,
    pub flags: TypeFlags,
    pub template: Option<TemplateInstance>,
    pub behaviors: Behaviors,
    pub methods: Vec<ScriptMethod>,
    user_data: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl TypeInfo {
    fn from_desc(desc: TypeDesc, id: TypeId) -> Self {
        Self {
            name: desc.name,
            id,
            size: desc.size,
            flags: desc.flags,
            template: desc.template,
            behaviors: desc.behaviors,
            methods: desc.methods,
            user_data: OnceLock::new(),
        }
    }

    #[inline]
    pub fn is_value(&self) -> bool {
        self.flags.contains(TypeFlags::VALUE)
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        self.flags.contains(TypeFlags::REF)
    }

    #[inline]
    pub fn is_gc(&self) -> bool {
        self.flags.contains(TypeFlags::GC)
    }

    pub fn sub_type(&self) -> Option<TypeId> {
        self.template.as_ref().map(|t| t.sub_type)
    }

    pub fn is_instance_of(&self, template: &str) -> bool {
        self.template.as_ref().is_some_and(|t| t.template == template)
    }

    pub fn methods_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a ScriptMethod> + 'a {
        self.methods.iter().filter(move |m| m.name == name)
    }

    /// Lock-free read of the per-type cache slot.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data.get()?.clone().downcast::<T>().ok()
    }

    /// Populates the cache slot once. Callers serialize population through
    /// the engine's exclusive lock.
    pub fn user_data_or_init<T: Any + Send + Sync>(
        &self,
        init: impl FnOnce() -> T,
    ) -> Option<Arc<T>> {
        self.user_data
            .get_or_init(|| Arc::new(init()))
            .clone()
            .downcast::<T>()
            .ok()
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// What the core asks of the host about types.
pub trait TypeQuery: Send + Sync {
    fn type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>>;

    fn type_info_by_name(&self, name: &str) -> Option<Arc<TypeInfo>>;

    fn size_of(&self, id: TypeId) -> usize {
        if id.is_handle() {
            return mem::size_of::<usize>();
        }
        if let Some(size) = id.scalar_size() {
            return size;
        }
        self.type_info(id).map_or(0, |info| info.size)
    }

    fn flags_of(&self, id: TypeId) -> TypeFlags {
        if id.is_enum() {
            return TypeFlags::ENUM | TypeFlags::VALUE | TypeFlags::POD;
        }
        if id.is_primitive() {
            return TypeFlags::VALUE | TypeFlags::POD;
        }
        self.type_info(id.base())
            .map_or(TypeFlags::empty(), |info| info.flags)
    }

    fn type_name(&self, id: TypeId) -> String {
        if let Some(name) = id.primitive_name() {
            return name.to_owned();
        }
        let base = self
            .type_info(id.base())
            .map_or_else(|| format!("{:#x}", id.base().raw()), |i| i.name.clone());
        if id.is_handle() { format!("{base}@") } else { base }
    }
}

#[derive(Default)]
struct RegistryImpl {
    by_id: HashMap<TypeId, Arc<TypeInfo>, ahash::RandomState>,
    by_name: HashMap<String, TypeId, ahash::RandomState>,
}

/// The type table the embedding layer registers into.
pub struct TypeRegistry {
    inner: RwLock<RegistryImpl>,
    next_sequence: AtomicI32,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryImpl::default()),
            next_sequence: AtomicI32::new(TypeId::FIRST_USER_SEQUENCE),
        }
    }

    fn next_id(&self, flags: TypeFlags, template: bool) -> TypeId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed)
            & TypeId::SEQUENCE_MASK;
        let kind = if flags.contains(TypeFlags::ENUM) {
            0
        } else if flags.contains(TypeFlags::SCRIPT_OBJECT) {
            TypeId::SCRIPT_OBJECT
        } else if template {
            TypeId::TEMPLATE
        } else {
            TypeId::APP_OBJECT
        };
        TypeId::from_raw(sequence | kind)
    }

    pub fn register(&self, desc: TypeDesc) -> Result<Arc<TypeInfo>> {
        let flags = desc.flags;
        self.register_with(flags, |_| desc)
    }

    /// Registers the description `make` builds once the new id is known, for
    /// types whose methods take their own type as a parameter.
    pub fn register_with(
        &self,
        flags: TypeFlags,
        make: impl FnOnce(TypeId) -> TypeDesc,
    ) -> Result<Arc<TypeInfo>> {
        let mut inner = self.inner.write();
        let id = self.next_id(flags, flags.contains(TypeFlags::TEMPLATE));
        let desc = make(id);
        if inner.by_name.contains_key(&desc.name) {
            return Err(RuntimeError::DuplicateType(desc.name));
        }
        let info = Arc::new(TypeInfo::from_desc(desc, id));
        inner.by_name.insert(info.name.clone(), id);
        inner.by_id.insert(id, info.clone());
        log::debug!("registered type {} as {:?}", info.name, id);
        Ok(info)
    }

    /// Registers one of the engine's own types into a fresh registry, where
    /// names cannot clash.
    pub(crate) fn register_builtin(
        &self,
        flags: TypeFlags,
        make: impl FnOnce(TypeId) -> TypeDesc,
    ) -> Arc<TypeInfo> {
        let mut inner = self.inner.write();
        let id = self.next_id(flags, false);
        let info = Arc::new(TypeInfo::from_desc(make(id), id));
        inner.by_name.insert(info.name.clone(), id);
        inner.by_id.insert(id, info.clone());
        info
    }

    pub fn register_enum(&self, name: &str) -> Result<TypeId> {
        let desc = TypeDesc::new(
            name,
            4,
            TypeFlags::ENUM | TypeFlags::VALUE | TypeFlags::POD,
        );
        Ok(self.register(desc)?.id)
    }

    /// Returns the existing `template<sub>` instance or registers the one
    /// `make` describes.
    pub fn template_instance(
        &self,
        template: &str,
        sub_type: TypeId,
        make: impl FnOnce(String, TypeId) -> TypeDesc,
    ) -> Result<Arc<TypeInfo>> {
        let name = format!("{template}<{}>", self.type_name(sub_type));
        if let Some(existing) = self.type_info_by_name(&name) {
            return Ok(existing);
        }
        let registered = self.register_with(TypeFlags::TEMPLATE, |id| {
            let mut desc = make(name, id);
            desc.flags |= TypeFlags::TEMPLATE;
            desc.template = Some(TemplateInstance {
                template: template.to_owned(),
                sub_type,
            });
            desc
        });
        match registered {
            // lost a registration race, the winner is just as good
            Err(RuntimeError::DuplicateType(name)) => self
                .type_info_by_name(&name)
                .ok_or(RuntimeError::DuplicateType(name)),
            other => other,
        }
    }

    /// Removes a type. Caches hanging off its `TypeInfo` go with the last
    /// reference to it.
    pub fn unload(&self, id: TypeId) -> bool {
        let mut inner = self.inner.write();
        let Some(info) = inner.by_id.remove(&id.base()) else {
            return false;
        };
        inner.by_name.remove(&info.name);
        log::debug!("unloaded type {}", info.name);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TypeQuery for TypeRegistry {
    fn type_info(&self, id: TypeId) -> Option<Arc<TypeInfo>> {
        self.inner.read().by_id.get(&id.base()).cloned()
    }

    fn type_info_by_name(&self, name: &str) -> Option<Arc<TypeInfo>> {
        let inner = self.inner.read();
        let id = inner.by_name.get(name)?;
        inner.by_id.get(id).cloned()
    }
}
