//! Run with:
//!   cargo bench --bench array_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use vessel::{Engine, EngineCreateInfo, Payload, ScriptArray, ScriptFunction, TypeId};

fn create_engine() -> Engine {
    Engine::new(EngineCreateInfo {
        scheduler_workers: Some(0),
        ..Default::default()
    })
    .expect("engine")
}

/// Pseudo-random but fixed input so runs are comparable.
fn shuffled(len: usize) -> Vec<i32> {
    let mut state = 0x2545_f491_u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as i32
        })
        .collect()
}

fn bench_insert_last(c: &mut Criterion) {
    let engine = create_engine();

    c.bench_function("insert_last_1000", |b| {
        b.iter(|| {
            let array = ScriptArray::of(&engine, TypeId::INT32).expect("array");
            for i in 0..1000 {
                array.insert_last_primitive(black_box(i)).expect("insert");
            }
            array
        });
    });
}

fn bench_insert_front(c: &mut Criterion) {
    let engine = create_engine();

    c.bench_function("insert_at_0_1000", |b| {
        b.iter(|| {
            let array = ScriptArray::of(&engine, TypeId::INT32).expect("array");
            for i in 0..1000 {
                array
                    .insert_at(0, &Payload::primitive(black_box(i)))
                    .expect("insert");
            }
            array
        });
    });
}

fn bench_sort(c: &mut Criterion) {
    let engine = create_engine();
    let input = shuffled(512);

    c.bench_function("sort_asc_512", |b| {
        b.iter(|| {
            let array = ScriptArray::of(&engine, TypeId::INT32).expect("array");
            for &value in &input {
                array.insert_last_primitive(value).expect("insert");
            }
            array.sort_asc().expect("sort");
            array
        });
    });

    let less = ScriptFunction::new("less", |ctx| {
        let a = ctx.arg_primitive::<i32>(0).unwrap_or_default();
        let b = ctx.arg_primitive::<i32>(1).unwrap_or_default();
        ctx.set_return(vessel::Storable::from_primitive(a < b));
        Ok(())
    });
    c.bench_function("sort_by_predicate_512", |b| {
        b.iter(|| {
            let array = ScriptArray::of(&engine, TypeId::INT32).expect("array");
            for &value in &input {
                array.insert_last_primitive(value).expect("insert");
            }
            array.sort_by(&less, 0, input.len()).expect("sort");
            array
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_insert_last, bench_insert_front, bench_sort
}

criterion_main!(benches);
