use clap::Parser as ClapParser;
use std::{
    process,
    time::{Duration, Instant},
};

use vessel::{
    Engine, EngineCreateInfo, JoinResult, Promise, ScriptArray, ScriptDictionary,
    ScriptException, ScriptFunction, ScriptThread, TypeId,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scheduler worker threads
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Values sent through the worker pipeline
    #[arg(long, default_value_t = 16)]
    items: u32,

    /// How long to wait on the worker and the promise
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[arg(short, long, help = "Log at debug level")]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Err(err) = run(&cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> vessel::Result<()> {
    let engine = Engine::new(EngineCreateInfo {
        scheduler_workers: Some(cli.workers),
        ..Default::default()
    })?;
    let timeout = Duration::from_millis(cli.timeout_ms);

    // a worker squares everything it is sent
    let worker = ScriptThread::new(
        &engine,
        ScriptFunction::new("square", |_| {
            let me = ScriptThread::current()
                .ok_or_else(|| ScriptException::new("thread", "not on a worker"))?;
            while let Some(value) = me.pop_primitive::<i64>(Duration::from_millis(200)) {
                me.push_primitive(value * value);
            }
            Ok(())
        }),
    );
    worker.start()?;
    for value in (1..=i64::from(cli.items)).rev() {
        worker.push_primitive(value);
    }

    let squares = ScriptArray::of(&engine, TypeId::INT64)?;
    for _ in 0..cli.items {
        match worker.pop_primitive::<i64>(timeout) {
            Some(square) => squares.insert_last_primitive(square)?,
            None => break,
        }
    }
    if worker.join(Some(timeout)) != JoinResult::Finished {
        log::warn!("worker did not finish within {timeout:?}");
    }
    squares.sort_asc()?;
    println!("squares: {:?}", squares.primitives::<i64>()?);

    // the scheduler fulfils a promise with the sum
    let promise = Promise::new(&engine, None, TypeId::INT64)?;
    let total: i64 = squares.primitives::<i64>()?.iter().sum();
    {
        let promise = promise.clone();
        engine.scheduler().schedule(move || {
            if let Err(err) = promise.store_primitive(total) {
                log::error!("could not fulfil promise: {err}");
            }
        });
    }
    let stats = ScriptDictionary::new(&engine);
    let deadline = Instant::now() + timeout;
    while !promise.is_fulfilled() && Instant::now() < deadline {
        engine.scheduler().run_until_idle(Duration::from_millis(5));
    }
    if let Some(sum) = promise.retrieve_primitive::<i64>() {
        stats.set_primitive("sum", sum);
    }
    stats.set_primitive("count", squares.len() as i64);
    for key in ["count", "sum"] {
        match stats.get_primitive::<i64>(key) {
            Some(value) => println!("{key}: {value}"),
            None => println!("{key}: <missing>"),
        }
    }

    let collected = engine.collect_garbage();
    log::info!("{collected:?}");
    engine.shutdown();
    Ok(())
}
