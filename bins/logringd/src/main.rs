use anyhow::Context;
use logring_config::{LogringConfig, OutputFormat};
use logring_core::{Level, PrintkRingbuffer};
use logring_drain::{Drain, Format};
use logring_emit::{Emitter, LogLevel};
use std::io::{self, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "logring.toml";

fn load_config() -> anyhow::Result<LogringConfig> {
    match std::env::args().nth(1) {
        Some(path) => LogringConfig::load(path.clone())
            .with_context(|| format!("loading config from {path}")),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            LogringConfig::load(DEFAULT_CONFIG_PATH).context("loading default config")
        }
        None => Ok(LogringConfig::default()),
    }
}

/// Logs `messages` lines, every eighth one split into a continuation pair.
fn run_writer(rb: &PrintkRingbuffer, writer: usize, messages: u64) -> u64 {
    let emitter = Emitter::new(rb);
    let mut failed = 0;
    for i in 0..messages {
        let result = if i % 8 == 0 {
            emitter
                .log(LogLevel::Level(Level::Notice), &format!("writer {writer}: probing {i}"))
                .and_then(|_| emitter.log(LogLevel::Cont, " ... ok\n"))
        } else {
            emitter.log(
                LogLevel::Level(Level::Info),
                &format!("writer {writer}: message {i}\n"),
            )
        };
        if result.is_err() {
            failed += 1;
        }
    }
    failed
}

fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let ring_config = config.ring_config()?;
    let rb = PrintkRingbuffer::new(ring_config).context("creating ring buffer")?;
    info!(
        descs = rb.desc_count(),
        text_bytes = rb.text_size(),
        writers = config.writers,
        messages_per_writer = config.messages_per_writer,
        "logringd starting"
    );

    let format = match config.output {
        OutputFormat::Text => Format::Text,
        OutputFormat::Json => Format::Json,
    };
    let running = AtomicUsize::new(config.writers);
    let start = Instant::now();

    let (emit_failures, drained, dropped) = thread::scope(|s| -> anyhow::Result<_> {
        let writers: Vec<_> = (0..config.writers)
            .map(|w| {
                let (rb, running) = (&rb, &running);
                let messages = config.messages_per_writer;
                s.spawn(move || {
                    let failed = run_writer(rb, w, messages);
                    running.fetch_sub(1, Ordering::Release);
                    failed
                })
            })
            .collect();

        let drain = s.spawn(|| -> io::Result<(u64, u64)> {
            let mut drain = Drain::new(&rb, BufWriter::new(io::stdout().lock()), format);
            let mut total = 0u64;
            loop {
                let done = running.load(Ordering::Acquire) == 0;
                let n = drain.poll()?;
                total += n as u64;
                if done && n == 0 {
                    return Ok((total, drain.dropped()));
                }
                if n == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });

        let mut emit_failures = 0;
        for handle in writers {
            emit_failures += handle
                .join()
                .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;
        }
        let (drained, dropped) = drain
            .join()
            .map_err(|_| anyhow::anyhow!("drain thread panicked"))?
            .context("writing drained records")?;
        Ok((emit_failures, drained, dropped))
    })?;

    if emit_failures > 0 {
        warn!(emit_failures, "some messages could not be stored");
    }
    info!(
        elapsed = ?start.elapsed(),
        next_seq = rb.next_seq(),
        drained,
        dropped,
        reserve_failures = rb.fail_count(),
        "logringd finished"
    );
    Ok(())
}
