use std::process;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use chantier::policy::{Count, FailurePolicy, NoLimit, Percentage, WithinInterval};
use chantier::{CHANTIER_VERSION, PoolConfig, PoolError, ProcessPool, ProcessTask};

#[derive(Debug, Default)]
struct Args {
    jobs: Option<usize>,
    kill_after: Option<Duration>,
    max_failures: Option<u64>,
    max_failure_percent: Option<f64>,
    window: Option<Duration>,
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();

    let args = match parse_args(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("chantier {CHANTIER_VERSION}");
            return;
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: chantier [options] < commands.txt");
    eprintln!();
    eprintln!("Runs each line of stdin as a `sh -c` command, a bounded number at a time.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -j, --jobs <n>                 Concurrent processes [default: number of CPUs]");
    eprintln!("  --kill-after <secs>            Terminate commands running longer than this");
    eprintln!("  --max-failures <n>             Stop after this many failed commands");
    eprintln!("  --max-failure-percent <pct>    Stop once this share of commands has failed");
    eprintln!("  --window <secs>                Only count failures within a sliding window");
    eprintln!("  -V, --version                  Print version");
    eprintln!("  -h, --help                     Print this help");
}

/// `Ok(None)` means `--version` was requested.
fn parse_args(argv: &[String]) -> Result<Option<Args>, String> {
    let mut args = Args::default();

    let mut i = 1; // skip argv[0]
    while i < argv.len() {
        let flag = argv[i].as_str();
        let mut value = || {
            i += 1;
            argv.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "-j" | "--jobs" => {
                let jobs = value()?;
                args.jobs = Some(
                    jobs.parse()
                        .map_err(|_| format!("invalid job count '{jobs}'"))?,
                );
            }
            "--kill-after" => args.kill_after = Some(parse_seconds(flag, &value()?)?),
            "--max-failures" => {
                let max = value()?;
                args.max_failures = Some(
                    max.parse()
                        .map_err(|_| format!("invalid failure count '{max}'"))?,
                );
            }
            "--max-failure-percent" => {
                let pct = value()?;
                let pct: f64 = pct
                    .parse()
                    .map_err(|_| format!("invalid percentage '{pct}'"))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentage must be between 0 and 100, got {pct}"));
                }
                args.max_failure_percent = Some(pct);
            }
            "--window" => args.window = Some(parse_seconds(flag, &value()?)?),
            "-V" | "--version" => return Ok(None),
            "-h" | "--help" => return Err(String::new()),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if args.max_failures.is_some() && args.max_failure_percent.is_some() {
        return Err("--max-failures and --max-failure-percent are mutually exclusive".to_string());
    }
    if args.window.is_some() && args.max_failures.is_none() && args.max_failure_percent.is_none() {
        return Err("--window needs --max-failures or --max-failure-percent".to_string());
    }

    Ok(Some(args))
}

fn parse_seconds(flag: &str, raw: &str) -> Result<Duration, String> {
    raw.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| format!("{flag}: invalid duration '{raw}'"))
}

fn build_policy(args: &Args) -> Box<dyn FailurePolicy> {
    let policy: Box<dyn FailurePolicy> = match (args.max_failures, args.max_failure_percent) {
        (Some(max), _) => Box::new(Count::new(max)),
        (None, Some(pct)) => Box::new(Percentage::new(pct)),
        (None, None) => Box::new(NoLimit),
    };
    match args.window {
        Some(window) => Box::new(WithinInterval::new(policy, window)),
        None => policy,
    }
}

/// Returns `Ok(false)` if the failure limit stopped the run.
async fn run(args: Args) -> anyhow::Result<bool> {
    let jobs = args.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let mut config = PoolConfig::new(jobs).with_policy(build_policy(&args));
    if let Some(kill_after) = args.kill_after {
        config = config.with_kill_after(kill_after);
    }
    let pool = ProcessPool::processes(config)?;

    tracing::info!(jobs, "Reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut completed = true;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = line.trim();
        if command.is_empty() || command.starts_with('#') {
            continue;
        }
        match pool.submit(ProcessTask::shell(command)).await {
            Ok(handle) => tracing::debug!(pid = handle.pid(), %command, "Submitted"),
            Err(e @ PoolError::CircuitOpen { .. }) => {
                tracing::error!(error = %e, "Stopping");
                completed = false;
                break;
            }
            Err(e) => tracing::error!(error = %e, %command, "Failed to start command"),
        }
    }

    pool.block_until_complete().await;

    let status = pool.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(completed && !status.limit_reached)
}

/// Initialize tracing with CHANTIER_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CHANTIER_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("chantier={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
