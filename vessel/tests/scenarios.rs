use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use vessel::{
    Behaviors, Context, ContextState, Engine, EngineCreateInfo, ErrorCategory, JoinResult,
    ObjectHeader, ObjectRef, Payload, Promise, RuntimeError, ScriptArray, ScriptDictionary,
    ScriptException, ScriptFunction, ScriptObject, ScriptString, ScriptThread, ScriptWeakRef,
    TypeDesc, TypeFlags, TypeId, TypeInfo,
};

fn engine() -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(EngineCreateInfo {
        scheduler_workers: Some(1),
        pipe_poll_interval: Some(Duration::from_millis(10)),
        ..Default::default()
    })
    .unwrap()
}

struct Node {
    header: ObjectHeader,
    info: Arc<TypeInfo>,
    drops: Arc<AtomicUsize>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptObject for Node {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn type_info(&self) -> &Arc<TypeInfo> {
        &self.info
    }
}

#[test]
fn sorting_an_int_array() {
    let engine = engine();
    let array = ScriptArray::of(&engine, TypeId::INT32).unwrap();
    for value in [5, 3, 9] {
        array.insert_last_primitive(value).unwrap();
    }
    array.sort_asc().unwrap();
    assert_eq!(array.primitives::<i32>().unwrap(), [3, 5, 9]);
}

#[test]
fn deleting_from_a_dictionary() {
    let engine = engine();
    let dict = ScriptDictionary::new(&engine);
    dict.set_primitive("a", 1i64);
    dict.set_primitive("b", 2i64);
    assert!(dict.delete("a"));
    assert!(!dict.exists("a"));

    let keys = dict.keys().unwrap();
    assert_eq!(keys.len(), 1);
    let first = keys.at(0).unwrap();
    assert_eq!(ScriptString::text_of(&first), Some("b"));
}

#[test]
fn promises_keep_their_first_value() {
    let engine = engine();
    let owner = Context::new();
    let promise = Promise::new(&engine, Some(owner.clone()), TypeId::INT32).unwrap();

    let second = Arc::new(parking_lot::Mutex::new(None));
    {
        let promise = promise.clone();
        let second = second.clone();
        owner.prepare(ScriptFunction::new("store-twice", move |_| {
            promise
                .store_primitive(42i32)
                .map_err(ScriptException::from)?;
            *second.lock() = Some(promise.store_primitive(7i32));
            Ok(())
        }));
    }
    assert_eq!(owner.execute(), ContextState::Exception);
    let err = second.lock().take().unwrap().unwrap_err();
    assert_eq!(err, RuntimeError::AlreadyFulfilled);
    assert_eq!(err.category(), ErrorCategory::Protocol);
    assert_eq!(promise.retrieve_primitive::<i32>(), Some(42));
}

#[test]
fn worker_pipes_deliver_and_time_out() {
    let engine = engine();
    let producer = ScriptThread::new(
        &engine,
        ScriptFunction::new("answer", |_| {
            let me = ScriptThread::current()
                .ok_or_else(|| ScriptException::new("thread", "not on a worker"))?;
            me.push_primitive(6i32 * 7);
            Ok(())
        }),
    );
    producer.start().unwrap();
    assert_eq!(
        producer.pop_primitive::<i32>(Duration::from_millis(1000)),
        Some(42)
    );
    assert_eq!(producer.join(Some(Duration::from_secs(5))), JoinResult::Finished);

    let silent = ScriptThread::new(
        &engine,
        ScriptFunction::new("silent", |_| {
            let me = ScriptThread::current()
                .ok_or_else(|| ScriptException::new("thread", "not on a worker"))?;
            me.pop_primitive::<bool>(Duration::from_secs(5));
            Ok(())
        }),
    );
    silent.start().unwrap();
    assert_eq!(silent.pop_primitive::<i32>(Duration::from_millis(100)), None);
    silent.push_primitive(true);
    assert_eq!(silent.join(Some(Duration::from_secs(5))), JoinResult::Finished);
}

#[test]
fn weak_refs_outlive_their_targets() {
    let engine = engine();
    let node = engine
        .register_type(
            TypeDesc::new("node", 0, TypeFlags::REF | TypeFlags::GC).with_behaviors(Behaviors {
                weakref_flag: true,
                ..Behaviors::default()
            }),
        )
        .unwrap();
    let drops = Arc::new(AtomicUsize::new(0));
    let target = ObjectRef::new(Node {
        header: ObjectHeader::new(),
        info: node.clone(),
        drops: drops.clone(),
    });

    let info = engine.weakref_type(node.id).unwrap();
    let weak = ScriptWeakRef::with_target(&info, Some(&target)).unwrap();
    assert!(weak.get().is_some());
    drop(target);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(weak.get().is_none());
}

#[test]
fn unjoined_worker_exceptions_are_dropped() {
    let engine = engine();
    let failing = ScriptThread::new(
        &engine,
        ScriptFunction::new("fail", |_| Err(ScriptException::new("worker", "lost"))),
    );
    failing.start().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    // the finished native thread lets go of the worker, leaving this handle
    // and the collector
    while failing.object().ref_count() > 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!failing.is_running());
    assert!(failing.last_exception().is_some());
    // releasing the worker without a join surfaces nothing
    drop(failing);
    engine.collect_garbage();
    assert_eq!(engine.contexts_in_use(), 0);
}

#[test]
fn promise_handles_survive_in_arrays() {
    let engine = engine();
    let promise = Promise::new(&engine, None, TypeId::INT64).unwrap();
    let future_type = engine.future_type(TypeId::INT64).unwrap();
    let array = ScriptArray::of(&engine, future_type.id.to_handle()).unwrap();
    array
        .insert_last(&Payload::object(promise.object().clone()))
        .unwrap();
    promise.store_primitive(5i64).unwrap();

    let element = array.at(0).unwrap();
    let stored = element.as_object().unwrap().downcast_ref::<Promise>().unwrap();
    assert_eq!(stored.retrieve_primitive::<i64>(), Some(5));
}
