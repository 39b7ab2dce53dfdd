//! Log output for the replication loop.
//!
//! Call sites use `tracing` macros; this module wires them to the log file
//! named in the configuration. The writer is swappable so the driver can
//! rotate to a numbered file at batch boundaries without re-initializing
//! the subscriber.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::errors::RelayError;

struct RotateState {
    path: PathBuf,
    file: File,
    index: u32,
}

/// A `MakeWriter` whose backing file can be swapped mid-run.
#[derive(Clone)]
pub struct RotatingWriter {
    state: Arc<Mutex<RotateState>>,
}

impl RotatingWriter {
    pub fn open(path: PathBuf) -> Result<RotatingWriter, RelayError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(RotatingWriter {
            state: Arc::new(Mutex::new(RotateState {
                path,
                file,
                index: 0,
            })),
        })
    }

    /// Roll to the next numbered log file (`<logfile>.1`, `.2`, ...).
    pub fn rotate(&self) -> Result<u32, RelayError> {
        let mut state = self.state.lock().expect("log writer lock poisoned");
        state.index += 1;
        let mut rolled = state.path.clone().into_os_string();
        rolled.push(format!(".{}", state.index));
        state.file = OpenOptions::new().create(true).append(true).open(rolled)?;
        Ok(state.index)
    }
}

pub struct RotatingHandle {
    state: Arc<Mutex<RotateState>>,
}

impl Write for RotatingHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().expect("log writer lock poisoned");
        state.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().expect("log writer lock poisoned");
        state.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingHandle {
            state: self.state.clone(),
        }
    }
}

/// Install the global subscriber. Returns the rotation handle when a log
/// file is configured; with no file, output goes to stderr.
///
/// Repeated initialization (tests share a process) is not an error.
pub fn init(logfile: Option<PathBuf>) -> Result<Option<RotatingWriter>, RelayError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match logfile {
        Some(path) => {
            let writer = RotatingWriter::open(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer.clone())
                .try_init();
            Ok(Some(writer))
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
            Ok(None)
        }
    }
}
