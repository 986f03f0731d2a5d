//! taskcore - CLI

use std::alloc::Layout;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::{self, Sender};
use rayon::prelude::*;
use taskcore::runtime::task::FragmentLayout;
use taskcore::runtime::{
    AsyncContext, ContextRef, ExecutorRef, JobFlags, JobPriority, TaskBuilder, TaskRef,
    WorkerPool,
};
use taskcore::util::config::{save_config, RuntimeConfig};
use taskcore::util::logger::{self, LogLevel};
use taskcore::{NAME, VERSION};

/// Inspect and exercise the task runtime core
#[derive(Parser, Debug)]
#[command(name = "taskcore")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the fragment layout of a task
    Layout {
        /// Task is a child of another task
        #[arg(long)]
        child: bool,

        /// Task belongs to a task group
        #[arg(long)]
        group: bool,

        /// Task is a future
        #[arg(long)]
        future: bool,

        /// Size of the result type in bytes
        #[arg(long, default_value_t = 8)]
        size: usize,

        /// Alignment of the result type in bytes
        #[arg(long, default_value_t = 8)]
        align: usize,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Wake many waiters from one future on a worker pool
    Stress {
        /// Number of waiting tasks
        #[arg(short, long, default_value_t = 1000)]
        waiters: usize,

        /// Worker threads (defaults to the configured count)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print the effective runtime configuration
    Config {
        /// Also write it to this file
        #[arg(long, value_name = "FILE")]
        write: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = RuntimeConfig::from_env().context("Failed to load runtime config")?;
    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.log.level.parse().unwrap_or(LogLevel::Info)
    };
    logger::init_with_level(level);

    match args.command {
        Commands::Layout {
            child,
            group,
            future,
            size,
            align,
            json,
        } => print_layout(child, group, future, size, align, json)?,
        Commands::Stress { waiters, workers } => {
            let mut scheduler = config.scheduler.clone();
            if let Some(workers) = workers {
                scheduler.workers = workers;
            }
            let pool = WorkerPool::new(scheduler);
            stress(&pool, waiters)?;
            println!(
                "steal success rate: {:.2}",
                pool.stats().steal_success_rate()
            );
        }
        Commands::Config { write } => {
            print!("{}", config.to_ron_string()?);
            if let Some(path) = write {
                save_config(&path, &config)
                    .with_context(|| format!("Failed to write config: {}", path.display()))?;
            }
        }
    }

    Ok(())
}

fn print_layout(
    child: bool,
    group: bool,
    future: bool,
    size: usize,
    align: usize,
    json: bool,
) -> Result<()> {
    let result = Layout::from_size_align(size, align).context("Invalid result layout")?;
    let flags = JobFlags::task(JobPriority::Default)
        .with_child_task(child)
        .with_group_child_task(group)
        .with_future(future);
    let layout = FragmentLayout::compute(flags, result)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&layout)?);
        return Ok(());
    }

    let show = |offset: Option<usize>| offset.map_or("-".to_string(), |o| o.to_string());
    println!("flags:          {:?}", flags);
    println!("child:          {}", show(layout.child_offset()));
    println!("group child:    {}", show(layout.group_child_offset()));
    println!("future:         {}", show(layout.future_offset()));
    println!("result storage: {}", show(layout.storage_offset()));
    println!("size:           {}", layout.size());
    println!("align:          {}", layout.align());
    Ok(())
}

struct Waiter {
    future: TaskRef,
    done: Sender<u64>,
}

/// The waiter's frame and a copy of its wait state.
fn waiter_state(context: Option<ContextRef>) -> (ContextRef, TaskRef, Sender<u64>) {
    let Some(context) = context else {
        panic!("waiter resumed without a frame");
    };
    // Safety: the initial frame is live until the waiter completes.
    let state = unsafe { context.as_future_closure() }
        .and_then(|frame| frame.closure_context().downcast_ref::<Waiter>())
        .map(|state| (state.future.clone(), state.done.clone()));
    match state {
        Some((future, done)) => (context, future, done),
        None => panic!("waiter frame holds no wait state"),
    }
}

fn waiter_entry(
    task: TaskRef,
    executor: ExecutorRef,
    context: Option<ContextRef>,
) {
    let (context, future, _) = waiter_state(context);
    task.await_future(&future, waiter_resumed, Some(context), executor);
}

fn waiter_resumed(
    task: TaskRef,
    executor: ExecutorRef,
    context: Option<ContextRef>,
) {
    let (context, future, done) = waiter_state(context);
    let value = match future.future_outcome::<u64>() {
        Some(Ok(value)) => *value,
        _ => 0,
    };
    let _ = done.send(value);
    if let Some(frame) = unsafe { context.as_future() } {
        frame.return_value(());
    }
    unsafe { AsyncContext::resume_parent_of(context, task, executor) };
}

fn stress(
    pool: &WorkerPool,
    waiters: usize,
) -> Result<()> {
    let executor = pool.executor_ref();
    let future = TaskBuilder::new()
        .priority(JobPriority::UserInitiated)
        .spawn_closure(|_| Ok(42u64))?;
    let (done, wakeups) = channel::unbounded();

    let start = Instant::now();
    let spawned = (0..waiters)
        .into_par_iter()
        .map(|_| {
            let state: Arc<dyn Any + Send + Sync> = Arc::new(Waiter {
                future: future.clone(),
                done: done.clone(),
            });
            TaskBuilder::new().spawn_future_with_context::<()>(waiter_entry, state)
        })
        .collect::<Result<Vec<_>, _>>()?;
    for waiter in spawned {
        executor.enqueue(waiter.into_job());
    }
    executor.enqueue(future.clone().into_job());

    let mut woken = 0;
    while woken < waiters {
        match wakeups.recv_timeout(Duration::from_secs(10)) {
            Ok(42) => woken += 1,
            Ok(other) => bail!("waiter observed unexpected result {}", other),
            Err(_) => bail!("only {} of {} waiters woke up", woken, waiters),
        }
    }

    println!(
        "{} waiters woken in {:?} on {} workers",
        woken,
        start.elapsed(),
        pool.num_workers()
    );
    Ok(())
}
