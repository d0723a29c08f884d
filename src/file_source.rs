/*! Read the trace stream from a file.

Mostly used with captures and in tests. By default the file is tailed:
at end of file the driver waits briefly and reads again, picking up
whatever a writer appends. With `terminate` it stops at the first end of
file instead.
*/
use std::fs::File;
use std::io::Read;
use std::time::Duration;

use log::debug;

use crate::source::{ByteSource, EofAction, SourceRead};
use crate::{Error, Result};

/// Wait between polls when tailing.
const TAIL_POLL: Duration = Duration::from_millis(100);

/// File ingest driver.
pub struct FileSource {
    path: String,
    terminate: bool,
    f: Option<File>,
}

impl FileSource {
    /// Create a driver for `path`. Nothing is opened yet.
    #[must_use]
    pub fn new(path: &str, terminate: bool) -> Self {
        Self {
            path: path.to_string(),
            terminate,
            f: None,
        }
    }
}

impl ByteSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&mut self) -> Result<()> {
        debug!("Opening source {}", self.path);
        self.f = Some(File::open(&self.path).map_err(|err| Error::FileOpen {
            path: self.path.clone(),
            err,
        })?);
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<SourceRead> {
        let Some(f) = self.f.as_mut() else {
            return Err(Error::Setup("file source not open".into()));
        };
        match f.read(buf)? {
            0 => Ok(SourceRead::Eof),
            n => Ok(SourceRead::Data(n)),
        }
    }

    fn close(&mut self) {
        self.f = None;
    }

    fn on_eof(&self) -> EofAction {
        if self.terminate {
            EofAction::Stop
        } else {
            EofAction::Retry(TAIL_POLL)
        }
    }

    fn fatal_open(&self) -> bool {
        true
    }
}
