//! Worker-side half of the pool protocol.
//!
//! A worker binary reads one JSON item per line from stdin and answers each
//! with exactly one JSON line on stdout:
//!
//! ```no_run
//! fn main() -> anyhow::Result<()> {
//!     tpub_pool::worker::serve(|name: String| Ok(format!("built {name}")))
//! }
//! ```
//!
//! Anything else the worker wants to say belongs on stderr.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::MEMORY_ENV;

/// Memory ceiling the coordinator assigned to this process, if any.
pub fn memory_ceiling_mb() -> Option<u64> {
    std::env::var(MEMORY_ENV).ok()?.trim().parse().ok()
}

/// Serve items from stdin until EOF.
pub fn serve<I, O, F>(handler: F) -> Result<()>
where
    I: DeserializeOwned,
    O: Serialize,
    F: FnMut(I) -> Result<O>,
{
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_io(stdin.lock(), stdout.lock(), handler)
}

/// [`serve`] over arbitrary streams. Output is flushed after every item.
pub fn serve_io<R, W, I, O, F>(reader: R, mut writer: W, mut handler: F) -> Result<()>
where
    R: BufRead,
    W: Write,
    I: DeserializeOwned,
    O: Serialize,
    F: FnMut(I) -> Result<O>,
{
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read item from coordinator")?;
        if line.trim().is_empty() {
            continue;
        }
        let item: I = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse item {}: {line}", index + 1))?;
        let output = handler(item)?;

        let json = serde_json::to_string(&output).context("failed to serialize output")?;
        writeln!(writer, "{json}").context("failed to write output")?;
        writer.flush().context("failed to flush output")?;
    }
    Ok(())
}
