use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, gettid, ForkResult};
use peekaboo::cli::{Cli, Command, SynthArgs};
use peekaboo::context::ProcessContext;
use peekaboo::reader::{TraceReader, TraceSummary};
use peekaboo::synthetic::{SyntheticHost, SyntheticProgram};
use peekaboo::tracer::ThreadTracer;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for `--debug` or `RUST_LOG`
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn current_tid() -> u32 {
    gettid().as_raw() as u32
}

fn start_tracer(ctx: &Arc<ProcessContext>, args: &SynthArgs) -> Result<ThreadTracer<SyntheticHost>> {
    let host = SyntheticHost::native(&args.name);
    ThreadTracer::start(ctx.clone(), current_tid(), host).context("Failed to open trace session")
}

/// Trace one thread through the whole synthetic stream
fn record_thread(ctx: &Arc<ProcessContext>, args: &SynthArgs) -> Result<u64> {
    let mut tracer = start_tracer(ctx, args)?;
    SyntheticProgram::new(args.mem_ops).drive(&mut tracer, 0..args.count)?;
    Ok(tracer.finish()?)
}

/// Trace up to `at`, fork, and let both processes finish the stream
fn record_with_fork(ctx: &Arc<ProcessContext>, args: &SynthArgs, at: u64) -> Result<()> {
    let at = at.min(args.count);
    let mut tracer = start_tracer(ctx, args)?;
    let mut program = SyntheticProgram::new(args.mem_ops);
    program.drive(&mut tracer, 0..at)?;

    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Child => {
            tracer.on_fork_child(current_tid())?;
            program.drive(&mut tracer, at..args.count)?;
            let child_ctx = tracer.context().clone();
            tracer.finish()?;
            child_ctx.finish();
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            program.drive(&mut tracer, at..args.count)?;
            tracer.finish()?;
            match waitpid(child, None).context("Failed to wait for child")? {
                WaitStatus::Exited(_, 0) => Ok(()),
                status => anyhow::bail!("Traced child ended with {:?}", status),
            }
        }
    }
}

/// Trace up to `after`, then deliver a fatal signal to the tracer
fn record_with_crash(ctx: &Arc<ProcessContext>, args: &SynthArgs, after: u64) -> Result<()> {
    let mut tracer = start_tracer(ctx, args)?;
    SyntheticProgram::new(args.mem_ops).drive(&mut tracer, 0..after.min(args.count))?;
    tracer.on_signal(Signal::SIGSEGV);
    if let Some(outcome) = tracer.signal_guard().last_outcome() {
        eprintln!("Emergency flush: {}", outcome);
    }
    println!("Trace written to {}", ctx.trace_root().display());
    std::process::exit(128 + Signal::SIGSEGV as i32);
}

fn run_synth(args: &SynthArgs) -> Result<()> {
    if args.threads == 0 {
        anyhow::bail!("--threads must be at least 1");
    }
    if args.threads > 1 && (args.fork_at.is_some() || args.crash_after.is_some()) {
        anyhow::bail!("--fork-at and --crash-after require a single thread");
    }

    let config = args.trace_config()?;
    let host = SyntheticHost::native(&args.name);
    let ctx = ProcessContext::initialize(config, &host).context("Failed to start tracing")?;

    if let Some(at) = args.fork_at {
        record_with_fork(&ctx, args, at)?;
    } else if let Some(after) = args.crash_after {
        record_with_crash(&ctx, args, after)?;
    } else if args.threads == 1 {
        record_thread(&ctx, args)?;
    } else {
        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..args.threads)
                .map(|_| scope.spawn(|| record_thread(&ctx, args)))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .map_err(|_| anyhow::anyhow!("Traced thread panicked"))?
                })
                .collect::<Result<Vec<u64>>>()
        })?;
    }

    let total = ctx.finish();
    println!("Trace written to {}", ctx.trace_root().display());
    println!("Total instructions: {}", total);
    Ok(())
}

fn print_summary(summary: &TraceSummary) {
    println!("Trace root: {}", summary.root.display());
    println!(
        "Process tree: {}",
        summary
            .process_tree
            .iter()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Byte map entries: {}", summary.byte_map_entries);
    for process in &summary.processes {
        println!("Process {}", process.pid);
        for thread in &process.threads {
            println!(
                "  thread {:<8} {:<8} v{}  {:>10} instructions  {:>10} memory refs  {} B/regs",
                thread.tid,
                thread.arch.to_string(),
                thread.version,
                thread.instructions,
                thread.memory_details,
                thread.register_record_size
            );
        }
    }
    println!("Total instructions: {}", summary.total_instructions());
}

fn print_byte_map(reader: &TraceReader) -> Result<()> {
    println!("Raw-byte map:");
    for entry in reader.byte_map().context("Failed to read byte map")? {
        println!("  {:#018x}  {:>2}  {}", entry.pc, entry.size, hex::encode(entry.bytes()));
    }
    Ok(())
}

fn run_inspect(root: &Path, json: bool, byte_map: bool) -> Result<()> {
    let reader = TraceReader::open(root)?;
    let summary = reader.summary().context("Failed to read trace")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    print_summary(&summary);
    if byte_map {
        print_byte_map(&reader)?;
    }
    Ok(())
}

fn run_verify(root: &Path) -> Result<()> {
    let reader = TraceReader::open(root)?;
    let violations = reader.verify().context("Failed to read trace")?;
    if violations.is_empty() {
        println!("OK: {} is a consistent trace", root.display());
        return Ok(());
    }
    for violation in &violations {
        println!("{}", violation);
    }
    eprintln!("{} violation(s) found", violations.len());
    std::process::exit(1);
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    match &args.command {
        Command::Synth(synth) => run_synth(synth),
        Command::Inspect {
            root,
            json,
            byte_map,
        } => run_inspect(root, *json, *byte_map),
        Command::Verify { root } => run_verify(root),
    }
}
