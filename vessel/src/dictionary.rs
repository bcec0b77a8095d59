use std::{collections::HashMap, fmt, mem, sync::Arc};

use parking_lot::Mutex;

use crate::{
    Behaviors, Engine, Handle, InitListReader, ObjectHeader, ObjectRef, Payload, Primitive,
    Result, ScriptArray, ScriptObject, Storable, TypeDesc, TypeFlags, TypeId, TypeInfo,
    WeakEngine, context,
};

type Entries = HashMap<String, Storable, ahash::RandomState>;

/// String-keyed map of boxed values. Numbers are stored widened to int64 or
/// double and converted on the way out.
pub struct ScriptDictionary {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    engine: WeakEngine,
    entries: Mutex<Entries>,
}

impl ScriptDictionary {
    pub fn new(engine: &Engine) -> Handle<Self> {
        let dictionary = Handle::new(Self {
            header: ObjectHeader::new(),
            info: engine.builtins().dictionary.clone(),
            engine: engine.downgrade(),
            entries: Mutex::new(HashMap::default()),
        });
        engine.notify_gc(dictionary.object());
        dictionary
    }

    /// Reads `u32 count`, then per entry a length-prefixed key, an `i32`
    /// type id and the value: scalars at their width, objects and handles as
    /// object-table indices.
    pub fn from_init_list(engine: &Engine, reader: &mut InitListReader<'_>) -> Result<Handle<Self>> {
        let dictionary = Self::new(engine);
        let count = reader.read_u32().map_err(context::raise)?;
        for _ in 0..count {
            let key = reader.read_str().map_err(context::raise)?;
            let type_id = TypeId::from_raw(reader.read_i32().map_err(context::raise)?);
            let value = if type_id.is_void() {
                Payload::default()
            } else if type_id.is_scalar() {
                Payload::Scalar(reader.read_scalar(type_id).map_err(context::raise)?)
            } else {
                Payload::Object(reader.read_object().map_err(context::raise)?)
            };
            dictionary.set(key, &value, type_id)?;
        }
        Ok(dictionary)
    }

    /// Inserts or overwrites `key`. On failure the previous entry is kept.
    pub fn set(&self, key: &str, value: &Payload, type_id: TypeId) -> Result<()> {
        let mut entry = Storable::new();
        entry.set(value, type_id).map_err(context::raise)?;
        let old = self.entries.lock().insert(key.to_owned(), entry);
        drop(old);
        Ok(())
    }

    pub fn set_primitive<T: Primitive>(&self, key: &str, value: T) {
        let mut entry = Storable::new();
        entry.set_primitive(value);
        let old = self.entries.lock().insert(key.to_owned(), entry);
        drop(old);
    }

    /// Converting read of `key`, see [`Storable::get`].
    pub fn get(&self, key: &str, out: &mut Payload, type_id: TypeId) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.get(out, type_id))
    }

    pub fn get_primitive<T: Primitive>(&self, key: &str) -> Option<T> {
        self.entries.lock().get(key)?.get_primitive()
    }

    /// The type an entry was stored as, after widening.
    pub fn type_id_of(&self, key: &str) -> Option<TypeId> {
        self.entries.lock().get(key).map(Storable::type_id)
    }

    /// The entry as a standalone `dictionaryValue`.
    pub fn value(&self, key: &str) -> Result<Option<Handle<DictionaryValue>>> {
        let copy = match self.entries.lock().get(key) {
            Some(entry) => entry.try_clone().map_err(context::raise)?,
            None => return Ok(None),
        };
        let engine = self.engine.get().map_err(context::raise)?;
        Ok(Some(DictionaryValue::create(&engine, copy)))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Releases the entry's payload, then forgets the key.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.lock().remove(key);
        removed.is_some()
    }

    pub fn delete_all(&self) {
        let entries = mem::take(&mut *self.entries.lock());
        drop(entries);
    }

    /// Positional access, walking the table from the start.
    pub fn get_index(&self, ordinal: usize) -> Option<(String, Payload, TypeId)> {
        let entries = self.entries.lock();
        let (key, entry) = entries.iter().nth(ordinal)?;
        Some((key.clone(), entry.payload().clone(), entry.type_id()))
    }

    /// Snapshot of every key as an `array<string>`.
    pub fn keys(&self) -> Result<Handle<ScriptArray>> {
        let engine = self.engine.get().map_err(context::raise)?;
        let keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        let array = ScriptArray::of(&engine, engine.string_type_id())?;
        array.reserve(keys.len())?;
        for key in keys {
            array.insert_last(&Payload::object(engine.new_string(&key)))?;
        }
        Ok(array)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the content with copies of `other`'s entries.
    pub fn assign(&self, other: &ScriptDictionary) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let mut copy = Entries::default();
        for (key, entry) in other.entries.lock().iter() {
            copy.insert(key.clone(), entry.try_clone().map_err(context::raise)?);
        }
        let old = mem::replace(&mut *self.entries.lock(), copy);
        drop(old);
        Ok(())
    }

    pub(crate) fn type_desc(engine: &WeakEngine, _id: TypeId) -> TypeDesc {
        let factory_engine = engine.clone();
        let copy_engine = engine.clone();
        let behaviors = Behaviors {
            factory: Some(Arc::new(move |_: &Arc<TypeInfo>| {
                let engine = factory_engine.upgrade()?;
                Some(ScriptDictionary::new(&engine).into_object())
            })),
            copy: Some(Arc::new(move |object: &ObjectRef| {
                let engine = copy_engine.upgrade()?;
                let source = object.downcast_ref::<ScriptDictionary>()?;
                let copy = ScriptDictionary::new(&engine);
                copy.assign(source).ok()?;
                Some(copy.into_object())
            })),
            weakref_flag: false,
        };
        TypeDesc::new("dictionary", 0, TypeFlags::REF | TypeFlags::GC).with_behaviors(behaviors)
    }
}

impl ScriptObject for ScriptDictionary {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    fn enum_references(&self, visitor: &mut dyn FnMut(&ObjectRef)) {
        for entry in self.entries.lock().values() {
            entry.enum_references(visitor);
        }
    }

    fn release_all_references(&self) {
        self.delete_all();
    }
}

impl fmt::Debug for ScriptDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.lock().iter()).finish()
    }
}

/// A single dictionary entry handed to scripts by value.
pub struct DictionaryValue {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    value: Mutex<Storable>,
}

impl DictionaryValue {
    fn create(engine: &Engine, value: Storable) -> Handle<Self> {
        let entry = Handle::new(Self {
            header: ObjectHeader::new(),
            info: engine.builtins().dictionary_value.clone(),
            value: Mutex::new(value),
        });
        engine.notify_gc(entry.object());
        entry
    }

    pub fn new(engine: &Engine) -> Handle<Self> {
        Self::create(engine, Storable::new())
    }

    pub fn set(&self, value: &Payload, type_id: TypeId) -> Result<()> {
        let mut fresh = Storable::new();
        fresh.set(value, type_id).map_err(context::raise)?;
        let old = mem::replace(&mut *self.value.lock(), fresh);
        drop(old);
        Ok(())
    }

    pub fn set_primitive<T: Primitive>(&self, value: T) {
        let mut fresh = Storable::new();
        fresh.set_primitive(value);
        let old = mem::replace(&mut *self.value.lock(), fresh);
        drop(old);
    }

    pub fn get(&self, out: &mut Payload, type_id: TypeId) -> bool {
        self.value.lock().get(out, type_id)
    }

    pub fn get_primitive<T: Primitive>(&self) -> Option<T> {
        self.value.lock().get_primitive()
    }

    pub fn type_id(&self) -> TypeId {
        self.value.lock().type_id()
    }

    pub fn is_empty(&self) -> bool {
        self.value.lock().is_void()
    }

    pub fn assign(&self, other: &DictionaryValue) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let copy = other.value.lock().try_clone().map_err(context::raise)?;
        let old = mem::replace(&mut *self.value.lock(), copy);
        drop(old);
        Ok(())
    }

    /// Stores this entry under `key` in `dictionary`.
    pub fn insert_into(&self, dictionary: &ScriptDictionary, key: &str) -> Result<()> {
        let copy = self.value.lock().try_clone().map_err(context::raise)?;
        let old = dictionary.entries.lock().insert(key.to_owned(), copy);
        drop(old);
        Ok(())
    }

    pub(crate) fn type_desc(engine: &WeakEngine, _id: TypeId) -> TypeDesc {
        let factory_engine = engine.clone();
        let copy_engine = engine.clone();
        let behaviors = Behaviors {
            factory: Some(Arc::new(move |_: &Arc<TypeInfo>| {
                let engine = factory_engine.upgrade()?;
                Some(DictionaryValue::new(&engine).into_object())
            })),
            copy: Some(Arc::new(move |object: &ObjectRef| {
                let engine = copy_engine.upgrade()?;
                let source = object.downcast_ref::<DictionaryValue>()?;
                let copy = DictionaryValue::new(&engine);
                copy.assign(source).ok()?;
                Some(copy.into_object())
            })),
            weakref_flag: false,
        };
        TypeDesc::new(
            "dictionaryValue",
            mem::size_of::<Storable>(),
            TypeFlags::VALUE | TypeFlags::GC,
        )
        .with_behaviors(behaviors)
    }
}

impl ScriptObject for DictionaryValue {
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

impl fmt::Debug for DictionaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DictionaryValue")
            .field(&*self.value.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineCreateInfo, InitList, ScriptAny, ScriptString, TypeQuery};

    fn engine() -> Engine {
        Engine::new(EngineCreateInfo {
            scheduler_workers: Some(0),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn numbers_are_widened_and_converted() {
        let engine = engine();
        let dict = ScriptDictionary::new(&engine);
        dict.set_primitive("small", 7u8);
        dict.set_primitive("ratio", 0.5f32);
        assert_eq!(dict.type_id_of("small"), Some(TypeId::INT64));
        assert_eq!(dict.type_id_of("ratio"), Some(TypeId::DOUBLE));

        assert_eq!(dict.get_primitive::<i32>("small"), Some(7));
        assert_eq!(dict.get_primitive::<f64>("small"), Some(7.0));
        assert_eq!(dict.get_primitive::<bool>("small"), Some(true));
        assert_eq!(dict.get_primitive::<i64>("ratio"), Some(0));
        assert_eq!(dict.get_primitive::<f32>("ratio"), Some(0.5));
        assert_eq!(dict.get_primitive::<i32>("missing"), None);
    }

    #[test]
    fn strings_do_not_read_as_numbers() {
        let engine = engine();
        let dict = ScriptDictionary::new(&engine);
        let text = engine.new_string("hello");
        dict.set("greeting", &Payload::object(text), engine.string_type_id())
            .unwrap();

        let mut number = Payload::primitive(99i32);
        assert!(!dict.get("greeting", &mut number, TypeId::INT32));
        // numeric targets are zero-filled
        assert_eq!(number.as_primitive::<i32>(), Some(0));

        let mut out = Payload::null();
        assert!(dict.get("greeting", &mut out, engine.string_type_id()));
        assert_eq!(ScriptString::text_of(&out), Some("hello"));
    }

    #[test]
    fn delete_releases_the_payload() {
        let engine = engine();
        let dict = ScriptDictionary::new(&engine);
        let boxed = ScriptAny::new(&engine);
        let handle_type = engine.builtins().any.id.to_handle();
        dict.set("box", &Payload::object(boxed.object().clone()), handle_type)
            .unwrap();
        assert_eq!(boxed.object().ref_count(), 3);
        assert!(dict.exists("box"));
        assert!(dict.delete("box"));
        assert!(!dict.exists("box"));
        assert_eq!(boxed.object().ref_count(), 2);
        assert!(!dict.delete("box"));
    }

    #[test]
    fn keys_and_positional_access() {
        let engine = engine();
        let dict = ScriptDictionary::new(&engine);
        dict.set_primitive("a", 1i32);
        dict.set_primitive("b", 2i32);
        dict.set_primitive("c", 3i32);

        let keys = dict.keys().unwrap();
        assert_eq!(keys.type_info().name, "array<string>");
        keys.sort_asc().unwrap();
        let names: Vec<String> = (0..keys.len())
            .map(|i| ScriptString::text_of(&keys.at(i).unwrap()).unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);

        let mut seen: Vec<(String, i64)> = (0..dict.len())
            .map(|i| {
                let (key, payload, type_id) = dict.get_index(i).unwrap();
                assert_eq!(type_id, TypeId::INT64);
                (key, payload.as_primitive::<i64>().unwrap())
            })
            .collect();
        seen.sort();
        assert_eq!(seen, [("a".into(), 1), ("b".into(), 2), ("c".into(), 3)]);
        assert!(dict.get_index(3).is_none());

        dict.delete_all();
        assert!(dict.is_empty());
    }

    #[test]
    fn init_lists_widen_like_set() {
        let engine = engine();
        let color = engine.register_enum("color").unwrap();
        let text = engine.new_string("v");
        let mut list = InitList::new();
        list.push_u32(3);
        list.push_str("n")
            .push_i32(TypeId::INT16.raw())
            .push_primitive(-4i16);
        list.push_str("c").push_i32(color.raw()).push_primitive(2i32);
        list.push_str("s")
            .push_i32(engine.string_type_id().raw())
            .push_object(Some(text));

        let dict = ScriptDictionary::from_init_list(&engine, &mut list.reader()).unwrap();
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.type_id_of("n"), Some(TypeId::INT64));
        assert_eq!(dict.get_primitive::<i64>("n"), Some(-4));
        assert_eq!(dict.get_primitive::<i32>("c"), Some(2));
        assert_eq!(engine.type_name(dict.type_id_of("s").unwrap()), "string");
    }

    #[test]
    fn truncated_init_lists_fail() {
        let engine = engine();
        let mut list = InitList::new();
        list.push_u32(2).push_str("only").push_i32(TypeId::INT32.raw());
        assert!(ScriptDictionary::from_init_list(&engine, &mut list.reader()).is_err());
    }

    #[test]
    fn values_round_trip_through_entries() {
        let engine = engine();
        let dict = ScriptDictionary::new(&engine);
        dict.set_primitive("x", 3.5f64);
        let value = dict.value("x").unwrap().unwrap();
        assert_eq!(value.get_primitive::<f64>(), Some(3.5));
        assert_eq!(value.get_primitive::<i32>(), Some(3));
        value.set_primitive(true);
        value.insert_into(&dict, "flag").unwrap();
        assert_eq!(dict.get_primitive::<bool>("flag"), Some(true));
        assert!(dict.value("missing").unwrap().is_none());
    }

    #[test]
    fn assign_copies_entries() {
        let engine = engine();
        let a = ScriptDictionary::new(&engine);
        let b = ScriptDictionary::new(&engine);
        a.set_primitive("k", 1i32);
        b.set_primitive("other", 2i32);
        b.assign(&a).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.get_primitive::<i32>("k"), Some(1));
        a.set_primitive("k", 5i32);
        assert_eq!(b.get_primitive::<i32>("k"), Some(1));
    }

    #[test]
    fn cycles_through_entries_are_collected() {
        let engine = engine();
        let a = ScriptDictionary::new(&engine);
        let b = ScriptDictionary::new(&engine);
        let handle_type = engine.builtins().dictionary.id.to_handle();
        a.set("next", &Payload::object(b.object().clone()), handle_type)
            .unwrap();
        b.set("next", &Payload::object(a.object().clone()), handle_type)
            .unwrap();
        drop((a, b));
        let stats = engine.collect_garbage();
        assert_eq!(stats.detected, 2);
        assert!(engine.gc().is_empty());
    }
}
