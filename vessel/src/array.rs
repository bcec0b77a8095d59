//! Growable homogeneous arrays of any element type.
//!
//! Scalars live packed in a byte buffer at their declared width, objects and
//! handles as owned references. Every structural change goes through
//! [`ScriptArray::resize_at`], which grows to exactly the requested length.
use std::{
    cmp::Ordering as CmpOrdering,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    Behaviors, Context, Engine, Handle, InitListReader, ObjectHeader, ObjectRef, Payload,
    Primitive, Result, RuntimeError, ScriptException, ScriptFunction, ScriptMethod,
    ScriptObject, Storable, TypeDesc, TypeFlags, TypeId, TypeInfo, TypeQuery, WeakEngine,
    context,
    value::{copy_in, scalar_as_f64, scalar_as_i64},
};

enum ArrayBuffer {
    Scalars { bytes: Vec<u8>, size: usize },
    Objects(Vec<Option<ObjectRef>>),
}

impl ArrayBuffer {
    fn len(&self) -> usize {
        match self {
            ArrayBuffer::Scalars { bytes, size } => bytes.len() / size,
            ArrayBuffer::Objects(objects) => objects.len(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            ArrayBuffer::Scalars { bytes, size } => bytes.capacity() / size,
            ArrayBuffer::Objects(objects) => objects.capacity(),
        }
    }

    fn read(&self, index: usize) -> Payload {
        match self {
            ArrayBuffer::Scalars { bytes, size } => {
                let mut raw = [0u8; 8];
                raw[..*size].copy_from_slice(&bytes[index * size..(index + 1) * size]);
                Payload::Scalar(u64::from_le_bytes(raw))
            }
            ArrayBuffer::Objects(objects) => Payload::Object(objects[index].clone()),
        }
    }

    /// Stores an element that went through `copy_in`. Returns the replaced
    /// reference, for release outside the lock.
    fn write(&mut self, index: usize, element: Payload) -> Option<ObjectRef> {
        match (self, element) {
            (ArrayBuffer::Scalars { bytes, size }, Payload::Scalar(bits)) => {
                bytes[index * *size..(index + 1) * *size]
                    .copy_from_slice(&bits.to_le_bytes()[..*size]);
                None
            }
            (ArrayBuffer::Objects(objects), Payload::Object(object)) => {
                mem::replace(&mut objects[index], object)
            }
            // copy_in already matched the payload to the element kind
            _ => None,
        }
    }

    fn snapshot(&self, start: usize, end: usize) -> Elements {
        match self {
            ArrayBuffer::Scalars { .. } => {
                Elements::Scalars((start..end).map(|i| self.scalar(i)).collect())
            }
            ArrayBuffer::Objects(objects) => Elements::Objects(objects[start..end].to_vec()),
        }
    }

    fn scalar(&self, index: usize) -> u64 {
        match self.read(index) {
            Payload::Scalar(bits) => bits,
            Payload::Object(_) => 0,
        }
    }
}

/// Detached copy of a range of elements, so that comparison callbacks run
/// without the array locked.
enum Elements {
    Scalars(Vec<u64>),
    Objects(Vec<Option<ObjectRef>>),
}

impl Elements {
    fn len(&self) -> usize {
        match self {
            Elements::Scalars(bits) => bits.len(),
            Elements::Objects(objects) => objects.len(),
        }
    }

    fn payload(&self, index: usize) -> Payload {
        match self {
            Elements::Scalars(bits) => Payload::Scalar(bits[index]),
            Elements::Objects(objects) => Payload::Object(objects[index].clone()),
        }
    }
}

/// How a comparison method resolved for an element type.
#[derive(Clone)]
enum MethodLookup {
    Found(ScriptMethod),
    Missing,
    Ambiguous,
}

impl MethodLookup {
    fn resolve(info: &TypeInfo, name: &str, returns: TypeId) -> Self {
        let mut candidates = info.methods_named(name).filter(|m| {
            m.return_type == returns
                && m.is_const
                && m.params.len() == 1
                && m.params[0].base() == info.id
        });
        match (candidates.next(), candidates.next()) {
            (None, _) => MethodLookup::Missing,
            (Some(method), None) => MethodLookup::Found(method.clone()),
            (Some(_), Some(_)) => MethodLookup::Ambiguous,
        }
    }
}

/// Per array type; lives in the array type's user data and goes away with it.
struct CompareCache {
    cmp: MethodLookup,
    eq: MethodLookup,
}

pub struct ScriptArray {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    engine: WeakEngine,
    sub_type: TypeId,
    sub_info: Option<Arc<TypeInfo>>,
    element_size: usize,
    max_len: usize,
    buffer: Mutex<ArrayBuffer>,
    // bumped under the buffer lock by every change to the elements
    modifications: AtomicU64,
}

fn fail<T>(err: RuntimeError) -> Result<T> {
    Err(context::raise(err))
}

fn less_than(ordering: CmpOrdering, ascending: bool) -> bool {
    if ascending {
        ordering == CmpOrdering::Less
    } else {
        ordering == CmpOrdering::Greater
    }
}

fn scalar_cmp(a: u64, b: u64, type_id: TypeId) -> CmpOrdering {
    if type_id.is_float() {
        scalar_as_f64(a, type_id)
            .partial_cmp(&scalar_as_f64(b, type_id))
            .unwrap_or(CmpOrdering::Equal)
    } else if type_id == TypeId::UINT64 {
        a.cmp(&b)
    } else {
        scalar_as_i64(a, type_id).cmp(&scalar_as_i64(b, type_id))
    }
}

fn scalar_eq(a: u64, b: u64, type_id: TypeId) -> bool {
    if type_id.is_float() {
        scalar_as_f64(a, type_id) == scalar_as_f64(b, type_id)
    } else {
        scalar_cmp(a, b, type_id) == CmpOrdering::Equal
    }
}

fn insertion_sort<T>(
    items: &mut [T],
    mut less: impl FnMut(&T, &T) -> Result<bool>,
) -> Result<()> {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && less(&items[j], &items[j - 1])? {
            items.swap(j, j - 1);
            j -= 1;
        }
    }
    Ok(())
}

impl ScriptArray {
    /// An empty array of the `array<T>` instance `info`.
    pub fn new(engine: &Engine, info: &Arc<TypeInfo>) -> Result<Handle<Self>> {
        let Some(sub_type) = info.sub_type().filter(|_| info.is_instance_of("array")) else {
            return fail(RuntimeError::InvalidTemplate(info.name.clone()));
        };
        let sub_info = if sub_type.is_object() {
            engine.type_info(sub_type)
        } else {
            None
        };
        let element_size = sub_type
            .scalar_size()
            .unwrap_or(mem::size_of::<usize>())
            .max(1);
        let buffer = if sub_type.is_object() {
            ArrayBuffer::Objects(Vec::new())
        } else {
            ArrayBuffer::Scalars {
                bytes: Vec::new(),
                size: element_size,
            }
        };
        let array = Handle::new(Self {
            header: ObjectHeader::new(),
            info: info.clone(),
            engine: engine.downgrade(),
            sub_type,
            sub_info,
            element_size,
            max_len: engine.settings().max_array_size / element_size,
            buffer: Mutex::new(buffer),
            modifications: AtomicU64::new(0),
        });
        engine.notify_gc(array.object());
        Ok(array)
    }

    /// An empty `array<sub_type>`.
    pub fn of(engine: &Engine, sub_type: TypeId) -> Result<Handle<Self>> {
        let info = engine.array_type(sub_type).map_err(context::raise)?;
        Self::new(engine, &info)
    }

    /// `len` default-constructed elements.
    pub fn with_len(engine: &Engine, info: &Arc<TypeInfo>, len: usize) -> Result<Handle<Self>> {
        let array = Self::new(engine, info)?;
        array.resize(len)?;
        Ok(array)
    }

    /// `len` copies of `value`.
    pub fn with_value(
        engine: &Engine,
        info: &Arc<TypeInfo>,
        len: usize,
        value: &Payload,
    ) -> Result<Handle<Self>> {
        let array = Self::new(engine, info)?;
        array.reserve(len)?;
        for _ in 0..len {
            array.insert_last(value)?;
        }
        Ok(array)
    }

    /// Reads `u32 count` followed by the elements. Nested arrays are nested
    /// lists, objects and handles are object-table indices.
    pub fn from_init_list(
        engine: &Engine,
        info: &Arc<TypeInfo>,
        reader: &mut InitListReader<'_>,
    ) -> Result<Handle<Self>> {
        let array = Self::new(engine, info)?;
        let count = reader.read_u32().map_err(context::raise)? as usize;
        if count > array.max_len {
            return fail(RuntimeError::TooLargeArraySize { requested: count });
        }
        array.reserve(count)?;
        let nested = array
            .sub_info
            .clone()
            .filter(|sub| sub.is_instance_of("array"));
        for _ in 0..count {
            let element = if let Some(sub) = &nested {
                Payload::object(Self::from_init_list(engine, sub, reader)?.into_object())
            } else if array.sub_type.is_object() {
                Payload::Object(reader.read_object().map_err(context::raise)?)
            } else {
                Payload::Scalar(reader.read_scalar(array.sub_type).map_err(context::raise)?)
            };
            array.insert_last(&element)?;
        }
        Ok(array)
    }

    /// Rejects element types arrays cannot hold: void, unknown types and
    /// value types that cannot be default-constructed or copied.
    pub fn template_callback(engine: &Engine, sub_type: TypeId) -> Result<()> {
        if sub_type.is_void() {
            return Err(RuntimeError::InvalidTemplate("array<void>".into()));
        }
        if sub_type.is_scalar() {
            return Ok(());
        }
        let Some(info) = engine.type_info(sub_type) else {
            return Err(RuntimeError::InvalidTemplate(format!(
                "array of unknown type {sub_type:?}"
            )));
        };
        if sub_type.is_handle() {
            return Ok(());
        }
        if info.behaviors.copy.is_none() {
            return Err(RuntimeError::InvalidTemplate(format!(
                "array<{}>: type cannot be copied",
                info.name
            )));
        }
        if info.behaviors.factory.is_none() {
            return Err(RuntimeError::InvalidTemplate(format!(
                "array<{}>: type has no default constructor",
                info.name
            )));
        }
        Ok(())
    }

    pub(crate) fn type_desc(engine: &WeakEngine, name: String, id: TypeId, gc: bool) -> TypeDesc {
        let factory_engine = engine.clone();
        let copy_engine = engine.clone();
        let behaviors = Behaviors {
            factory: Some(Arc::new(move |info: &Arc<TypeInfo>| {
                let engine = factory_engine.upgrade()?;
                ScriptArray::new(&engine, info).ok().map(Handle::into_object)
            })),
            copy: Some(Arc::new(move |object: &ObjectRef| {
                let engine = copy_engine.upgrade()?;
                let source = object.downcast_ref::<ScriptArray>()?;
                let copy = ScriptArray::new(&engine, &source.info).ok()?;
                copy.assign(source).ok()?;
                Some(copy.into_object())
            })),
            weakref_flag: false,
        };
        let flags = if gc {
            TypeFlags::REF | TypeFlags::GC
        } else {
            TypeFlags::REF
        };
        let equals = ScriptMethod::new("opEquals", vec![id], TypeId::BOOL, |this, args| {
            let lhs = this.downcast_ref::<ScriptArray>();
            let rhs = args
                .first()
                .and_then(Payload::as_object)
                .and_then(|o| o.downcast_ref::<ScriptArray>());
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => lhs
                    .equals(rhs)
                    .map(Payload::primitive)
                    .map_err(ScriptException::from),
                _ => Ok(Payload::primitive(false)),
            }
        });
        TypeDesc::new(&name, 0, flags)
            .with_behaviors(behaviors)
            .with_method(equals)
    }

    #[inline]
    pub fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    #[inline]
    pub fn sub_type(&self) -> TypeId {
        self.sub_type
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the buffer for a change to its elements.
    fn modify(&self) -> MutexGuard<'_, ArrayBuffer> {
        let buffer = self.buffer.lock();
        self.modifications.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity()
    }

    fn fresh_elements(&self, count: usize) -> Result<Vec<Option<ObjectRef>>> {
        if !self.sub_type.is_object() {
            return Ok(Vec::new());
        }
        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(count)
            .map_err(|_| RuntimeError::OutOfMemory)?;
        if self.sub_type.is_handle() {
            fresh.resize_with(count, || None);
            return Ok(fresh);
        }
        let Some(info) = &self.sub_info else {
            return Err(RuntimeError::InvalidTemplate(self.info.name.clone()));
        };
        let factory = info
            .behaviors
            .factory
            .clone()
            .ok_or_else(|| RuntimeError::CopyFailed(info.name.clone()))?;
        for _ in 0..count {
            let object = factory(info).ok_or_else(|| RuntimeError::CopyFailed(info.name.clone()))?;
            fresh.push(Some(object));
        }
        Ok(fresh)
    }

    /// Grows (`delta > 0`) or shrinks the buffer at `at`. Growth targets
    /// exactly the new length. New object slots take `fresh`, which must
    /// hold `delta` elements for object arrays. Removed references are
    /// returned so they can be released after unlocking.
    fn resize_at(
        &self,
        buffer: &mut ArrayBuffer,
        delta: isize,
        at: usize,
        fresh: Vec<Option<ObjectRef>>,
    ) -> Result<Vec<Option<ObjectRef>>> {
        let len = buffer.len();
        debug_assert!(at <= len);
        if delta < 0 {
            let count = delta.unsigned_abs().min(len - at);
            return Ok(match buffer {
                ArrayBuffer::Scalars { bytes, size } => {
                    bytes.drain(at * *size..(at + count) * *size);
                    Vec::new()
                }
                ArrayBuffer::Objects(objects) => objects.drain(at..at + count).collect(),
            });
        }
        let count = delta as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let new_len = len.saturating_add(count);
        if new_len > self.max_len {
            return Err(RuntimeError::TooLargeArraySize { requested: new_len });
        }
        match buffer {
            ArrayBuffer::Scalars { bytes, size } => {
                let added = count * *size;
                bytes
                    .try_reserve_exact(added)
                    .map_err(|_| RuntimeError::OutOfMemory)?;
                let offset = at * *size;
                bytes.splice(offset..offset, std::iter::repeat_n(0u8, added));
            }
            ArrayBuffer::Objects(objects) => {
                debug_assert_eq!(fresh.len(), count);
                objects
                    .try_reserve_exact(count)
                    .map_err(|_| RuntimeError::OutOfMemory)?;
                objects.splice(at..at, fresh);
            }
        }
        Ok(Vec::new())
    }

    pub fn at(&self, index: usize) -> Result<Payload> {
        let buffer = self.buffer.lock();
        let len = buffer.len();
        if index >= len {
            drop(buffer);
            return fail(RuntimeError::IndexOutOfBounds { index, len });
        }
        Ok(buffer.read(index))
    }

    pub fn at_primitive<T: Primitive>(&self, index: usize) -> Result<T> {
        self.check_primitive::<T>()?;
        let payload = self.at(index)?;
        Ok(payload.as_primitive().unwrap_or_else(|| T::from_bits(0)))
    }

    fn check_primitive<T: Primitive>(&self) -> Result<()> {
        if self.sub_type.is_scalar() && T::TYPE_ID.scalar_size() == self.sub_type.scalar_size() {
            return Ok(());
        }
        fail(RuntimeError::IncompatibleType {
            expected: format!("{:?}", self.sub_type),
            found: format!("{:?}", T::TYPE_ID),
        })
    }

    /// Every element, for scalar arrays of `T`'s width.
    pub fn primitives<T: Primitive>(&self) -> Result<Vec<T>> {
        self.check_primitive::<T>()?;
        let buffer = self.buffer.lock();
        Ok((0..buffer.len()).map(|i| T::from_bits(buffer.scalar(i))).collect())
    }

    /// Overwrites one element with a copy of `value`.
    pub fn set_value(&self, index: usize, value: &Payload) -> Result<()> {
        let element = copy_in(value, self.sub_type).map_err(context::raise)?;
        let mut buffer = self.modify();
        let len = buffer.len();
        if index >= len {
            drop(buffer);
            return fail(RuntimeError::IndexOutOfBounds { index, len });
        }
        let replaced = buffer.write(index, element);
        drop(buffer);
        drop(replaced);
        Ok(())
    }

    pub fn resize(&self, len: usize) -> Result<()> {
        if len > self.max_len {
            return fail(RuntimeError::TooLargeArraySize { requested: len });
        }
        loop {
            let current = self.len();
            // constructed unlocked, factories may run arbitrary code
            let fresh = if len > current {
                self.fresh_elements(len - current).map_err(context::raise)?
            } else {
                Vec::new()
            };
            let mut buffer = self.modify();
            if buffer.len() != current {
                continue;
            }
            let removed = if len >= current {
                self.resize_at(&mut buffer, (len - current) as isize, current, fresh)
            } else {
                self.resize_at(&mut buffer, -((current - len) as isize), len, Vec::new())
            };
            drop(buffer);
            return removed.map(drop).map_err(context::raise);
        }
    }

    /// Makes room for `len` elements without changing the length.
    pub fn reserve(&self, len: usize) -> Result<()> {
        if len > self.max_len {
            return fail(RuntimeError::TooLargeArraySize { requested: len });
        }
        let mut buffer = self.buffer.lock();
        let additional = len.saturating_sub(buffer.len());
        let reserved = match &mut *buffer {
            ArrayBuffer::Scalars { bytes, size } => bytes.try_reserve_exact(additional * *size),
            ArrayBuffer::Objects(objects) => objects.try_reserve_exact(additional),
        };
        drop(buffer);
        reserved.map_err(|_| context::raise(RuntimeError::OutOfMemory))
    }

    pub fn insert_at(&self, index: usize, value: &Payload) -> Result<()> {
        let element = copy_in(value, self.sub_type).map_err(context::raise)?;
        let fresh = match &element {
            Payload::Object(object) => vec![object.clone()],
            Payload::Scalar(_) => Vec::new(),
        };
        let mut buffer = self.modify();
        let len = buffer.len();
        if index > len {
            drop(buffer);
            return fail(RuntimeError::IndexOutOfBounds { index, len });
        }
        if let Err(err) = self.resize_at(&mut buffer, 1, index, fresh) {
            drop(buffer);
            return fail(err);
        }
        if let Payload::Scalar(_) = element {
            buffer.write(index, element);
        }
        Ok(())
    }

    pub fn insert_last(&self, value: &Payload) -> Result<()> {
        let element = copy_in(value, self.sub_type).map_err(context::raise)?;
        let fresh = match &element {
            Payload::Object(object) => vec![object.clone()],
            Payload::Scalar(_) => Vec::new(),
        };
        let mut buffer = self.modify();
        let index = buffer.len();
        if let Err(err) = self.resize_at(&mut buffer, 1, index, fresh) {
            drop(buffer);
            return fail(err);
        }
        if let Payload::Scalar(_) = element {
            buffer.write(index, element);
        }
        Ok(())
    }

    pub fn insert_last_primitive<T: Primitive>(&self, value: T) -> Result<()> {
        self.check_primitive::<T>()?;
        self.insert_last(&Payload::primitive(value))
    }

    pub fn remove_at(&self, index: usize) -> Result<()> {
        let mut buffer = self.modify();
        let len = buffer.len();
        if index >= len {
            drop(buffer);
            return fail(RuntimeError::IndexOutOfBounds { index, len });
        }
        let removed = self.resize_at(&mut buffer, -1, index, Vec::new());
        drop(buffer);
        removed.map(drop).map_err(context::raise)
    }

    pub fn remove_last(&self) -> Result<()> {
        let len = self.len();
        if len == 0 {
            return fail(RuntimeError::IndexOutOfBounds { index: 0, len });
        }
        self.remove_at(len - 1)
    }

    /// Removes up to `count` elements from `start`; the count is clamped to
    /// the end of the array.
    pub fn remove_range(&self, start: usize, count: usize) -> Result<()> {
        let mut buffer = self.modify();
        let len = buffer.len();
        if start > len {
            drop(buffer);
            return fail(RuntimeError::IndexOutOfBounds { index: start, len });
        }
        let count = count.min(len - start);
        let removed = self.resize_at(&mut buffer, -(count as isize), start, Vec::new());
        drop(buffer);
        removed.map(drop).map_err(context::raise)
    }

    /// Inserts copies of all of `other`'s elements at `index`.
    pub fn insert_array_at(&self, index: usize, other: &ScriptArray) -> Result<()> {
        if self.info.id != other.info.id {
            return fail(RuntimeError::MismatchedArrayTypes {
                expected: self.info.name.clone(),
                found: other.info.name.clone(),
            });
        }
        // other may be self, take a snapshot before locking for the insert
        let source = {
            let buffer = other.buffer.lock();
            buffer.snapshot(0, buffer.len())
        };
        let count = source.len();
        let mut copies = Vec::new();
        copies
            .try_reserve_exact(count)
            .map_err(|_| context::raise(RuntimeError::OutOfMemory))?;
        for i in 0..count {
            copies.push(copy_in(&source.payload(i), self.sub_type).map_err(context::raise)?);
        }
        let fresh: Vec<Option<ObjectRef>> = if self.sub_type.is_object() {
            copies.iter().map(|p| p.as_object().cloned()).collect()
        } else {
            Vec::new()
        };

        let mut buffer = self.modify();
        let len = buffer.len();
        if index > len {
            drop(buffer);
            return fail(RuntimeError::IndexOutOfBounds { index, len });
        }
        if let Err(err) = self.resize_at(&mut buffer, count as isize, index, fresh) {
            drop(buffer);
            return fail(err);
        }
        if !self.sub_type.is_object() {
            for (offset, element) in copies.into_iter().enumerate() {
                buffer.write(index + offset, element);
            }
        }
        Ok(())
    }

    /// Replaces the content with copies of `other`'s elements.
    pub fn assign(&self, other: &ScriptArray) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        if self.info.id != other.info.id {
            return fail(RuntimeError::MismatchedArrayTypes {
                expected: self.info.name.clone(),
                found: other.info.name.clone(),
            });
        }
        let len = self.len();
        self.remove_range(0, len)?;
        self.insert_array_at(0, other)
    }

    pub fn reverse(&self) {
        let mut buffer = self.modify();
        match &mut *buffer {
            ArrayBuffer::Scalars { bytes, size } => {
                let size = *size;
                let len = bytes.len() / size;
                for i in 0..len / 2 {
                    let j = len - 1 - i;
                    for k in 0..size {
                        bytes.swap(i * size + k, j * size + k);
                    }
                }
            }
            ArrayBuffer::Objects(objects) => objects.reverse(),
        }
    }

    fn compare_cache(&self) -> Result<Arc<CompareCache>> {
        let Some(sub) = &self.sub_info else {
            return Err(RuntimeError::NoComparison(self.info.name.clone()));
        };
        if let Some(cache) = self.info.user_data::<CompareCache>() {
            return Ok(cache);
        }
        let _exclusive = crate::engine::acquire_exclusive_lock();
        self.info
            .user_data_or_init(|| CompareCache {
                cmp: MethodLookup::resolve(sub, "opCmp", TypeId::INT32),
                eq: MethodLookup::resolve(sub, "opEquals", TypeId::BOOL),
            })
            .ok_or_else(|| RuntimeError::NoComparison(self.info.name.clone()))
    }

    fn sub_type_name(&self) -> String {
        self.sub_info
            .as_ref()
            .map_or_else(|| format!("{:?}", self.sub_type), |i| i.name.clone())
    }

    fn call_method(method: &ScriptMethod, this: &ObjectRef, other: &ObjectRef) -> Result<Payload> {
        method
            .call(this, &[Payload::object(other.clone())])
            .map_err(RuntimeError::from)
    }

    fn compare_objects(
        &self,
        cache: &CompareCache,
        a: &Option<ObjectRef>,
        b: &Option<ObjectRef>,
    ) -> Result<CmpOrdering> {
        let (a, b) = match (a, b) {
            (None, None) => return Ok(CmpOrdering::Equal),
            (None, Some(_)) => return Ok(CmpOrdering::Less),
            (Some(_), None) => return Ok(CmpOrdering::Greater),
            (Some(a), Some(b)) => (a, b),
        };
        match &cache.cmp {
            MethodLookup::Found(method) => {
                let result = Self::call_method(method, a, b)?;
                let value = result.as_primitive::<i32>().unwrap_or_default();
                Ok(value.cmp(&0))
            }
            MethodLookup::Ambiguous => Err(RuntimeError::AmbiguousMethod {
                type_name: self.sub_type_name(),
                method: "opCmp".into(),
            }),
            MethodLookup::Missing => Err(RuntimeError::NoComparison(self.sub_type_name())),
        }
    }

    fn equal_objects(
        &self,
        cache: &CompareCache,
        a: &Option<ObjectRef>,
        b: &Option<ObjectRef>,
    ) -> Result<bool> {
        let (a, b) = match (a, b) {
            (None, None) => return Ok(true),
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(false),
        };
        match (&cache.eq, &cache.cmp) {
            (MethodLookup::Found(method), _) => {
                Ok(Self::call_method(method, a, b)?.as_primitive::<bool>().unwrap_or(false))
            }
            (MethodLookup::Ambiguous, _) => Err(RuntimeError::AmbiguousMethod {
                type_name: self.sub_type_name(),
                method: "opEquals".into(),
            }),
            (MethodLookup::Missing, MethodLookup::Found(_)) => {
                Ok(self.compare_objects(cache, &Some(a.clone()), &Some(b.clone()))?
                    == CmpOrdering::Equal)
            }
            (MethodLookup::Missing, MethodLookup::Ambiguous) => {
                Err(RuntimeError::AmbiguousMethod {
                    type_name: self.sub_type_name(),
                    method: "opCmp".into(),
                })
            }
            // handles without comparison methods compare by identity
            (MethodLookup::Missing, MethodLookup::Missing) if self.sub_type.is_handle() => {
                Ok(ObjectRef::ptr_eq(a, b))
            }
            (MethodLookup::Missing, MethodLookup::Missing) => {
                Err(RuntimeError::NoComparison(self.sub_type_name()))
            }
        }
    }

    fn element_equals(&self, cache: Option<&CompareCache>, a: &Payload, b: &Payload) -> Result<bool> {
        match (a, b, cache) {
            (Payload::Scalar(a), Payload::Scalar(b), _) => Ok(scalar_eq(*a, *b, self.sub_type)),
            (Payload::Object(a), Payload::Object(b), Some(cache)) => self.equal_objects(cache, a, b),
            _ => Ok(false),
        }
    }

    fn cache_for_objects(&self) -> Result<Option<Arc<CompareCache>>> {
        if self.sub_type.is_object() {
            self.compare_cache().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Index of the first element equal to `value`, or -1.
    pub fn find(&self, value: &Payload) -> Result<i64> {
        self.find_from(0, value)
    }

    pub fn find_from(&self, start: usize, value: &Payload) -> Result<i64> {
        let cache = self.cache_for_objects().map_err(context::raise)?;
        let elements = {
            let buffer = self.buffer.lock();
            let len = buffer.len();
            buffer.snapshot(start.min(len), len)
        };
        for i in 0..elements.len() {
            let equal = self
                .element_equals(cache.as_deref(), &elements.payload(i), value)
                .map_err(context::raise)?;
            if equal {
                return Ok((start + i) as i64);
            }
        }
        Ok(-1)
    }

    /// Index of the element that is the very object `value` references (or
    /// has identical bits, for scalars), or -1.
    pub fn find_by_ref(&self, value: &Payload) -> i64 {
        self.find_by_ref_from(0, value)
    }

    pub fn find_by_ref_from(&self, start: usize, value: &Payload) -> i64 {
        let buffer = self.buffer.lock();
        let found = match (&*buffer, value) {
            (ArrayBuffer::Objects(objects), Payload::Object(target)) => objects
                .iter()
                .enumerate()
                .skip(start)
                .position(|(_, element)| match (element, target) {
                    (Some(element), Some(target)) => ObjectRef::ptr_eq(element, target),
                    (None, None) => true,
                    _ => false,
                }),
            (ArrayBuffer::Scalars { .. }, Payload::Scalar(bits)) => (start..buffer.len())
                .position(|i| buffer.scalar(i) == *bits),
            _ => None,
        };
        found.map_or(-1, |offset| (start + offset) as i64)
    }

    pub fn sort_asc(&self) -> Result<()> {
        self.sort_range(true, 0, usize::MAX)
    }

    pub fn sort_desc(&self) -> Result<()> {
        self.sort_range(false, 0, usize::MAX)
    }

    pub fn sort_range_asc(&self, start: usize, count: usize) -> Result<()> {
        self.sort_range(true, start, count)
    }

    pub fn sort_range_desc(&self, start: usize, count: usize) -> Result<()> {
        self.sort_range(false, start, count)
    }

    /// Takes `[start, start + count)` out, sorts it, and writes it back.
    /// A change to the array while the comparisons ran fails the sort with
    /// `ModifiedWhileSorting`. On failure the array is left as it is.
    fn sort_with(
        &self,
        start: usize,
        count: usize,
        mut less: impl FnMut(&Payload, &Payload) -> Result<bool>,
    ) -> Result<()> {
        let (mut elements, version, end) = {
            let buffer = self.buffer.lock();
            let len = buffer.len();
            if count < 2 || len < 2 {
                return Ok(());
            }
            if start >= len {
                drop(buffer);
                return fail(RuntimeError::IndexOutOfBounds { index: start, len });
            }
            let end = start.saturating_add(count).min(len);
            let version = self.modifications.load(Ordering::Relaxed);
            (buffer.snapshot(start, end), version, end)
        };

        let sorted = match &mut elements {
            Elements::Scalars(bits) => insertion_sort(bits, |a, b| {
                less(&Payload::Scalar(*a), &Payload::Scalar(*b))
            }),
            Elements::Objects(objects) => insertion_sort(objects, |a, b| {
                less(&Payload::Object(a.clone()), &Payload::Object(b.clone()))
            }),
        };
        sorted.map_err(context::raise)?;

        let mut buffer = self.buffer.lock();
        if self.modifications.load(Ordering::Relaxed) != version {
            drop(buffer);
            log::debug!("{} changed while sorting", self.info.name);
            return fail(RuntimeError::ModifiedWhileSorting);
        }
        self.modifications.fetch_add(1, Ordering::Relaxed);
        let mut replaced = Vec::new();
        for (offset, index) in (start..end).enumerate() {
            replaced.push(buffer.write(index, elements.payload(offset)));
        }
        drop(buffer);
        drop(replaced);
        Ok(())
    }

    fn sort_range(&self, ascending: bool, start: usize, count: usize) -> Result<()> {
        let cache = self.cache_for_objects().map_err(context::raise)?;
        let sub_type = self.sub_type;
        self.sort_with(start, count, |a, b| {
            let ordering = match (a, b, cache.as_deref()) {
                (Payload::Scalar(a), Payload::Scalar(b), _) => scalar_cmp(*a, *b, sub_type),
                (Payload::Object(a), Payload::Object(b), Some(cache)) => {
                    self.compare_objects(cache, a, b)?
                }
                _ => CmpOrdering::Equal,
            };
            Ok(less_than(ordering, ascending))
        })
    }

    /// Sorts with a script "less than" callback, called with two elements
    /// and returning bool. The callback runs on the calling context, or on a
    /// pooled one when there is none.
    pub fn sort_by(&self, less: &ScriptFunction, start: usize, count: usize) -> Result<()> {
        let (context, pooled) = match Context::current() {
            Some(context) => (context, None),
            None => {
                let engine = self.engine.get().map_err(context::raise)?;
                let context = engine
                    .request_context()
                    .ok_or_else(|| context::raise(RuntimeError::NoContext))?;
                (context.clone(), Some((engine, context)))
            }
        };
        // objects are passed by reference, scalars by value
        let arg_type = if self.sub_type.is_object() {
            self.sub_type.to_handle()
        } else {
            self.sub_type
        };
        let result = self.sort_with(start, count, |a, b| {
            let mut args = vec![Storable::new(), Storable::new()];
            args[0].store(a, arg_type)?;
            args[1].store(b, arg_type)?;
            let returned = context.call(less, args)?;
            Ok(returned.get_primitive::<bool>().unwrap_or(false))
        });
        if let Some((engine, context)) = pooled {
            engine.return_context(context);
        }
        result
    }

    /// Element-wise equality through the element type's comparison methods.
    pub fn equals(&self, other: &ScriptArray) -> Result<bool> {
        if std::ptr::eq(self, other) {
            return Ok(true);
        }
        if self.info.id != other.info.id {
            return Ok(false);
        }
        let cache = self.cache_for_objects().map_err(context::raise)?;
        let lhs = {
            let buffer = self.buffer.lock();
            buffer.snapshot(0, buffer.len())
        };
        let rhs = {
            let buffer = other.buffer.lock();
            buffer.snapshot(0, buffer.len())
        };
        if lhs.len() != rhs.len() {
            return Ok(false);
        }
        for i in 0..lhs.len() {
            let equal = self
                .element_equals(cache.as_deref(), &lhs.payload(i), &rhs.payload(i))
                .map_err(context::raise)?;
            if !equal {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl ScriptObject for ScriptArray {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        if let ArrayBuffer::Objects(objects) = &*self.buffer.lock() {
            objects.iter().flatten().for_each(|o| visitor(o));
        }
    }

    fn release_all_references(&self) {
        let mut buffer = self.modify();
        let ArrayBuffer::Objects(objects) = &mut *buffer else {
            return;
        };
        if self.sub_type.is_handle() {
            let released: Vec<_> = objects.iter_mut().map(Option::take).collect();
            drop(buffer);
            drop(released);
        } else {
            let values: Vec<_> = objects.iter().flatten().cloned().collect();
            drop(buffer);
            for value in values {
                value.get().release_all_references();
            }
        }
    }
}

impl fmt::Debug for ScriptArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptArray")
            .field("type", &self.info.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineCreateInfo, InitList, ScriptString, object::tests::Counted};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> Engine {
        Engine::new(EngineCreateInfo {
            scheduler_workers: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    fn ints(engine: &Engine, values: &[i32]) -> Handle<ScriptArray> {
        let array = ScriptArray::of(engine, TypeId::INT32).unwrap();
        for &v in values {
            array.insert_last_primitive(v).unwrap();
        }
        array
    }

    fn strings(engine: &Engine, values: &[&str]) -> Handle<ScriptArray> {
        let array = ScriptArray::of(engine, engine.string_type_id()).unwrap();
        for v in values {
            array.insert_last(&Payload::object(engine.new_string(v))).unwrap();
        }
        array
    }

    fn texts(array: &ScriptArray) -> Vec<String> {
        (0..array.len())
            .map(|i| {
                let element = array.at(i).unwrap();
                ScriptString::text_of(&element).unwrap().to_owned()
            })
            .collect()
    }

    #[test]
    fn growth_is_exact() {
        let engine = engine();
        let array = ints(&engine, &[1, 2, 3]);
        assert_eq!(array.len(), 3);
        assert_eq!(array.capacity(), 3);
        array.insert_at(1, &Payload::primitive(9i32)).unwrap();
        assert_eq!(array.capacity(), 4);
        assert_eq!(array.primitives::<i32>().unwrap(), [1, 9, 2, 3]);
    }

    #[test]
    fn out_of_bounds_leaves_the_array_alone() {
        let engine = engine();
        let array = ints(&engine, &[1, 2]);
        let err = array.at(2).unwrap_err();
        assert_eq!(err, RuntimeError::IndexOutOfBounds { index: 2, len: 2 });
        assert!(array.insert_at(3, &Payload::primitive(0i32)).is_err());
        assert!(array.remove_at(5).is_err());
        assert!(array.set_value(2, &Payload::primitive(0i32)).is_err());
        assert_eq!(array.primitives::<i32>().unwrap(), [1, 2]);

        let empty = ints(&engine, &[]);
        assert!(empty.remove_last().is_err());
    }

    #[test]
    fn errors_are_raised_on_the_calling_context() {
        let engine = engine();
        let array = ints(&engine, &[]);
        let context = Context::new();
        context.prepare(ScriptFunction::new("index", move |_| {
            let _ = array.at(0);
            Ok(())
        }));
        assert_eq!(context.execute(), crate::ContextState::Exception);
        let exception = context.exception().unwrap();
        assert_eq!(exception.type_name, "bounds");
    }

    #[test]
    fn resize_remove_and_reserve() {
        let engine = engine();
        let array = ints(&engine, &[5, 6, 7, 8, 9]);
        array.remove_range(1, 2).unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [5, 8, 9]);
        array.remove_range(2, 100).unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [5, 8]);
        array.resize(4).unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [5, 8, 0, 0]);
        array.resize(1).unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [5]);
        array.reserve(10).unwrap();
        assert!(array.capacity() >= 10);
        assert_eq!(array.len(), 1);
        array.remove_last().unwrap();
        assert!(array.is_empty());
    }

    #[test]
    fn max_size_is_enforced() {
        let engine = Engine::new(EngineCreateInfo {
            scheduler_workers: Some(0),
            max_array_size: Some(16),
            ..Default::default()
        })
        .unwrap();
        let array = ScriptArray::of(&engine, TypeId::INT32).unwrap();
        array.resize(4).unwrap();
        let err = array.insert_last_primitive(1i32).unwrap_err();
        assert_eq!(err, RuntimeError::TooLargeArraySize { requested: 5 });
        assert_eq!(array.len(), 4);
        assert!(array.reserve(5).is_err());
    }

    #[test]
    fn value_elements_are_constructed_and_copied() {
        let engine = engine();
        let info = engine.array_type(engine.string_type_id()).unwrap();
        let array = ScriptArray::with_len(&engine, &info, 2).unwrap();
        assert_eq!(texts(&array), ["", ""]);

        let text = engine.new_string("x");
        array.set_value(1, &Payload::object(text.clone())).unwrap();
        assert_eq!(text.ref_count(), 1);
        assert_eq!(texts(&array), ["", "x"]);
    }

    #[test]
    fn scalar_sorting_and_reverse() {
        let engine = engine();
        let array = ints(&engine, &[5, -3, 9, 0]);
        array.sort_asc().unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [-3, 0, 5, 9]);
        array.sort_desc().unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [9, 5, 0, -3]);
        array.reverse();
        assert_eq!(array.primitives::<i32>().unwrap(), [-3, 0, 5, 9]);

        let partial = ints(&engine, &[4, 3, 2, 1]);
        partial.sort_range_asc(1, 2).unwrap();
        assert_eq!(partial.primitives::<i32>().unwrap(), [4, 2, 3, 1]);
        partial.sort_range_desc(0, 10).unwrap();
        assert_eq!(partial.primitives::<i32>().unwrap(), [4, 3, 2, 1]);
    }

    #[test]
    fn unsigned_and_float_elements_compare_by_value() {
        let engine = engine();
        let unsigned = ScriptArray::of(&engine, TypeId::UINT64).unwrap();
        for v in [u64::MAX, 1, 0] {
            unsigned.insert_last_primitive(v).unwrap();
        }
        unsigned.sort_asc().unwrap();
        assert_eq!(unsigned.primitives::<u64>().unwrap(), [0, 1, u64::MAX]);

        let floats = ScriptArray::of(&engine, TypeId::FLOAT).unwrap();
        for v in [2.5f32, -1.0, 0.0] {
            floats.insert_last_primitive(v).unwrap();
        }
        floats.sort_asc().unwrap();
        assert_eq!(floats.primitives::<f32>().unwrap(), [-1.0, 0.0, 2.5]);
        assert_eq!(floats.find(&Payload::primitive(-0.0f32)).unwrap(), 1);
    }

    #[test]
    fn object_sorting_uses_op_cmp() {
        let engine = engine();
        let array = strings(&engine, &["pear", "apple", "fig"]);
        array.sort_asc().unwrap();
        assert_eq!(texts(&array), ["apple", "fig", "pear"]);
        assert_eq!(array.find(&Payload::object(engine.new_string("fig"))).unwrap(), 1);
        assert_eq!(array.find_from(2, &Payload::object(engine.new_string("fig"))).unwrap(), -1);
    }

    #[test]
    fn missing_comparison_is_reported() {
        let engine = engine();
        let info = engine
            .register_type(TypeDesc::new("plain", 0, TypeFlags::REF))
            .unwrap();
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Counted::create(&info, &drops);
        let b = Counted::create(&info, &drops);
        let array = ScriptArray::of(&engine, info.id.to_handle()).unwrap();
        array.insert_last(&Payload::object(a)).unwrap();
        array.insert_last(&Payload::object(b.clone())).unwrap();
        let err = array.sort_asc().unwrap_err();
        assert_eq!(err, RuntimeError::NoComparison("plain".into()));
        // handles fall back to identity for equality
        assert_eq!(array.find(&Payload::object(b)).unwrap(), 1);
        assert_eq!(array.find(&Payload::null()).unwrap(), -1);
        drop(array);
        engine.collect_garbage();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ambiguous_comparison_is_reported() {
        let engine = engine();
        let compare = |_: &ObjectRef, _: &[Payload]| Ok(Payload::primitive(0i32));
        let info = engine
            .registry()
            .register_with(TypeFlags::REF, |id| {
                TypeDesc::new("twice", 0, TypeFlags::REF)
                    .with_method(ScriptMethod::new("opCmp", vec![id], TypeId::INT32, compare))
                    .with_method(ScriptMethod::new(
                        "opCmp",
                        vec![id.to_handle()],
                        TypeId::INT32,
                        compare,
                    ))
            })
            .unwrap();
        let array = ScriptArray::of(&engine, info.id.to_handle()).unwrap();
        // fewer than two elements never compare
        assert!(array.sort_asc().is_ok());
        let drops = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counted = Counted::create(&info, &drops);
            array.insert_last(&Payload::object(counted)).unwrap();
        }
        let err = array.sort_asc().unwrap_err();
        assert!(matches!(err, RuntimeError::AmbiguousMethod { .. }));
    }

    #[test]
    fn find_by_ref_matches_identity() {
        let engine = engine();
        let handle_type = engine.builtins().any.id.to_handle();
        let array = ScriptArray::of(&engine, handle_type).unwrap();
        let a = crate::ScriptAny::new(&engine).into_object();
        let b = crate::ScriptAny::new(&engine).into_object();
        array.insert_last(&Payload::object(a.clone())).unwrap();
        array.insert_last(&Payload::object(b.clone())).unwrap();
        assert_eq!(array.find_by_ref(&Payload::object(b.clone())), 1);
        assert_eq!(array.find_by_ref_from(1, &Payload::object(a)), -1);
    }

    #[test]
    fn insert_array_checks_element_types() {
        let engine = engine();
        let a = ints(&engine, &[1, 4]);
        let b = ints(&engine, &[2, 3]);
        a.insert_array_at(1, &b).unwrap();
        assert_eq!(a.primitives::<i32>().unwrap(), [1, 2, 3, 4]);
        a.insert_array_at(4, &a).unwrap();
        assert_eq!(a.len(), 8);

        let other = ScriptArray::of(&engine, TypeId::INT64).unwrap();
        let err = a.insert_array_at(0, &other).unwrap_err();
        assert!(matches!(err, RuntimeError::MismatchedArrayTypes { .. }));
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn equality_recurses_into_nested_arrays() {
        let engine = engine();
        let inner = engine.array_type(TypeId::INT32).unwrap();
        let outer_type = engine.array_type(inner.id.to_handle()).unwrap();
        let make = || {
            let outer = ScriptArray::new(&engine, &outer_type).unwrap();
            for values in [[1, 2], [3, 4]] {
                let row = ints(&engine, &values);
                outer.insert_last(&Payload::object(row.into_object())).unwrap();
            }
            outer
        };
        let a = make();
        let b = make();
        assert!(a.equals(&b).unwrap());
        b.at(1)
            .unwrap()
            .as_object()
            .and_then(|o| o.downcast_ref::<ScriptArray>())
            .unwrap()
            .set_value(0, &Payload::primitive(0i32))
            .unwrap();
        assert!(!a.equals(&b).unwrap());
    }

    #[test]
    fn init_lists_build_nested_arrays() {
        let engine = engine();
        let inner = engine.array_type(TypeId::INT16).unwrap();
        let outer_type = engine.array_type(inner.id.to_handle()).unwrap();
        let mut list = InitList::new();
        list.push_u32(2);
        list.push_u32(2).push_primitive(1i16).push_primitive(2i16);
        list.push_u32(1).push_primitive(3i16);

        let outer = ScriptArray::from_init_list(&engine, &outer_type, &mut list.reader()).unwrap();
        assert_eq!(outer.len(), 2);
        let rows: Vec<Vec<i16>> = (0..2)
            .map(|i| {
                let row = outer.at(i).unwrap();
                let row = row.as_object().unwrap().downcast_ref::<ScriptArray>().unwrap();
                row.primitives::<i16>().unwrap()
            })
            .collect();
        assert_eq!(rows, [vec![1, 2], vec![3]]);
    }

    #[test]
    fn template_callback_rejects_uncopyable_values() {
        let engine = engine();
        let info = engine
            .register_type(TypeDesc::new("locked", 4, TypeFlags::VALUE))
            .unwrap();
        assert!(matches!(
            engine.array_type(info.id),
            Err(RuntimeError::InvalidTemplate(_))
        ));
        assert!(engine.array_type(info.id.to_handle()).is_ok());
        assert!(engine.array_type(TypeId::VOID).is_err());
    }

    #[test]
    fn predicate_sort_runs_script_callbacks() {
        let engine = engine();
        let array = ints(&engine, &[3, 1, 2]);
        let greater = ScriptFunction::new("greater", |ctx| {
            let a = ctx.arg_primitive::<i32>(0).unwrap_or_default();
            let b = ctx.arg_primitive::<i32>(1).unwrap_or_default();
            ctx.set_return(Storable::from_primitive(a > b));
            Ok(())
        });
        array.sort_by(&greater, 0, usize::MAX).unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [3, 2, 1]);
        assert_eq!(engine.contexts_in_use(), 0);
    }

    #[test]
    fn failing_predicates_leave_the_order() {
        let engine = engine();
        let array = ints(&engine, &[3, 1, 2]);
        let broken = ScriptFunction::new("broken", |_| Err(ScriptException::new("user", "nope")));
        assert!(array.sort_by(&broken, 0, usize::MAX).is_err());
        assert_eq!(array.primitives::<i32>().unwrap(), [3, 1, 2]);
    }

    fn meddling_less(array: &Handle<ScriptArray>, meddle: fn(&ScriptArray)) -> ScriptFunction {
        let target = array.clone();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        ScriptFunction::new("meddling", move |ctx| {
            if !done.swap(true, Ordering::SeqCst) {
                meddle(&target);
            }
            let a = ctx.arg_primitive::<i32>(0).unwrap_or_default();
            let b = ctx.arg_primitive::<i32>(1).unwrap_or_default();
            ctx.set_return(Storable::from_primitive(a < b));
            Ok(())
        })
    }

    #[test]
    fn growing_the_array_during_a_sort_fails_it() {
        let engine = engine();
        let array = ints(&engine, &[3, 1, 2]);
        let less = meddling_less(&array, |a| a.insert_last_primitive(0i32).unwrap());
        assert_eq!(
            array.sort_by(&less, 0, usize::MAX),
            Err(RuntimeError::ModifiedWhileSorting)
        );
        assert_eq!(array.primitives::<i32>().unwrap(), [3, 1, 2, 0]);
    }

    #[test]
    fn same_length_writes_during_a_sort_are_kept() {
        let engine = engine();
        let array = ints(&engine, &[3, 1, 2]);
        let less = meddling_less(&array, |a| a.set_value(0, &Payload::primitive(7i32)).unwrap());
        let err = array.sort_by(&less, 0, usize::MAX).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Bounds);
        assert_eq!(array.primitives::<i32>().unwrap(), [7, 1, 2]);

        // an untouched array sorts normally afterwards
        array.sort_asc().unwrap();
        assert_eq!(array.primitives::<i32>().unwrap(), [1, 2, 7]);
    }
}
