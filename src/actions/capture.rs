use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
enum Sink {
    Collect(Vec<u8>),
    Discard,
}

/// Output buffer shared between a pipe reader task and the caller.
///
/// Writes are always accepted. After [`Capture::stop_collecting`] they are dropped,
/// so a late writer never blocks or races with the final read.
#[derive(Debug, Clone)]
pub struct Capture {
    sink: Arc<Mutex<Sink>>,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Collect(Vec::new()))),
        }
    }
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, bytes: &[u8]) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Sink::Collect(buf) = &mut *sink {
            buf.extend_from_slice(bytes);
        }
    }

    /// Snapshot of what has been collected so far.
    pub fn contents(&self) -> String {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &*sink {
            Sink::Collect(buf) => String::from_utf8_lossy(buf).into_owned(),
            Sink::Discard => String::new(),
        }
    }

    /// Switches to discarding and returns everything collected.
    pub fn stop_collecting(&self) -> String {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *sink, Sink::Discard) {
            Sink::Collect(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Sink::Discard => String::new(),
        }
    }
}
