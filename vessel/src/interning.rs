use std::{
    cmp::Ordering as CmpOrdering,
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{
    Behaviors, ObjectHeader, ObjectRef, Payload, ScriptException, ScriptMethod, ScriptObject,
    TypeDesc, TypeFlags, TypeId, TypeInfo, engine,
};

struct InternedEntry {
    value: Arc<str>,
    refs: AtomicUsize,
}

/// Reference-counted string constants, so the VM can hand out stable
/// pointers for literal strings.
pub struct StringPool(RwLock<HashMap<Box<str>, InternedEntry, ahash::RandomState>>);

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        Self(RwLock::new(HashMap::default()))
    }

    /// Returns the shared storage for `value`, adding a reference.
    pub fn get_string_constant(&self, value: &str) -> Arc<str> {
        if let Some(entry) = self.0.read().get(value) {
            entry.refs.fetch_add(1, Ordering::Relaxed);
            return entry.value.clone();
        }

        let _exclusive = engine::acquire_exclusive_lock();
        let mut table = self.0.write();
        let entry = table.entry(value.into()).or_insert_with(|| InternedEntry {
            value: Arc::from(value),
            refs: AtomicUsize::new(0),
        });
        entry.refs.fetch_add(1, Ordering::Relaxed);
        entry.value.clone()
    }

    /// Drops one reference. Returns false for strings the pool never handed
    /// out; the entry goes away with its last reference.
    pub fn release_string_constant(&self, value: &Arc<str>) -> bool {
        let reached_zero = {
            let table = self.0.read();
            let Some(entry) = table.get(&**value) else {
                return false;
            };
            if !Arc::ptr_eq(&entry.value, value) {
                return false;
            }
            entry.refs.fetch_sub(1, Ordering::AcqRel) == 1
        };
        if reached_zero {
            let mut table = self.0.write();
            // someone may have taken it again in between
            if table
                .get(&**value)
                .is_some_and(|e| e.refs.load(Ordering::Acquire) == 0)
            {
                table.remove(&**value);
            }
        }
        true
    }

    #[inline]
    pub fn raw_string_data<'a>(&self, value: &'a Arc<str>) -> &'a [u8] {
        value.as_bytes()
    }

    pub fn ref_count(&self, value: &str) -> usize {
        self.0
            .read()
            .get(value)
            .map_or(0, |e| e.refs.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The script `string` value type.
pub struct ScriptString {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    value: Arc<str>,
    // set when `value` holds a reference taken from this pool
    pool: Option<Weak<StringPool>>,
}

impl ScriptString {
    pub fn create(info: &Arc<TypeInfo>, value: Arc<str>) -> ObjectRef {
        ObjectRef::new(Self {
            header: ObjectHeader::new(),
            info: info.clone(),
            value,
            pool: None,
        })
    }

    /// A string holding one reference on `value` in `pool`, given back when
    /// the string is destroyed.
    pub fn create_interned(
        info: &Arc<TypeInfo>,
        pool: &Arc<StringPool>,
        value: &str,
    ) -> ObjectRef {
        ObjectRef::new(Self {
            header: ObjectHeader::new(),
            info: info.clone(),
            value: pool.get_string_constant(value),
            pool: Some(Arc::downgrade(pool)),
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn shared(&self) -> &Arc<str> {
        &self.value
    }

    /// Reads the text out of a string payload.
    pub fn text_of(payload: &Payload) -> Option<&str> {
        payload
            .as_object()?
            .downcast_ref::<ScriptString>()
            .map(|s| s.as_str())
    }

    pub(crate) fn type_desc(id: TypeId) -> TypeDesc {
        let behaviors = Behaviors {
            factory: Some(Arc::new(|info: &Arc<TypeInfo>| {
                Some(Self::create(info, Arc::from("")))
            })),
            copy: Some(Arc::new(|object: &ObjectRef| {
                let this = object.downcast_ref::<ScriptString>()?;
                Some(Self::create(&this.info, this.value.clone()))
            })),
            weakref_flag: false,
        };
        let mut desc =
            TypeDesc::new("string", std::mem::size_of::<Arc<str>>(), TypeFlags::VALUE)
                .with_behaviors(behaviors);
        desc.methods = Self::methods(id);
        desc
    }

    fn methods(id: TypeId) -> Vec<ScriptMethod> {
        let compare = |this: &ObjectRef, args: &[Payload]| -> Result<CmpOrdering, ScriptException> {
            let lhs = this
                .downcast_ref::<ScriptString>()
                .map(|s| s.as_str())
                .unwrap_or_default();
            let rhs = args
                .first()
                .and_then(ScriptString::text_of)
                .ok_or_else(|| ScriptException::new("type", "expected a string argument"))?;
            Ok(lhs.cmp(rhs))
        };
        vec![
            ScriptMethod::new("opCmp", vec![id], TypeId::INT32, move |this, args| {
                let ordering = compare(this, args)? as i32;
                Ok(Payload::primitive(ordering))
            }),
            ScriptMethod::new("opEquals", vec![id], TypeId::BOOL, move |this, args| {
                Ok(Payload::primitive(compare(this, args)?.is_eq()))
            }),
        ]
    }
}

impl ScriptObject for ScriptString {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }
}

impl Drop for ScriptString {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
            pool.release_string_constant(&self.value);
        }
    }
}

impl fmt::Debug for ScriptString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.value)
    }
}
