//! Progress reporting for long erase/program/read operations.
//!
//! The library emits coarse events through a caller-supplied handler; the CLI
//! turns them into a terminal bar. One event per sector or burst, so the
//! handler is never in a hot loop.

/// Events emitted while a flash or SRAM operation runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A new operation began; `total` is its size in bytes.
    Started {
        /// Operation label, e.g. `"Erasing"` or `"Writing"`.
        operation: &'static str,
        /// Total bytes the operation covers.
        total: usize,
    },
    /// The operation advanced to `position` bytes.
    Progressed {
        /// Bytes completed so far.
        position: usize,
    },
    /// The operation finished successfully.
    Finished,
    /// The operation failed; a final event before the error propagates.
    Failed,
}

/// A handler for [`ProgressEvent`]s.
///
/// ```
/// use fpga_loader::progress::Progress;
///
/// let progress = Progress::new(|event| println!("{event:?}"));
/// ```
pub struct Progress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl Progress {
    /// Creates a progress sink calling `handler` on every event.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// A sink that swallows all events.
    pub fn silent() -> Self {
        Self::new(|_| ())
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    pub(crate) fn started(&self, operation: &'static str, total: usize) {
        self.emit(ProgressEvent::Started { operation, total });
    }

    pub(crate) fn progressed(&self, position: usize) {
        self.emit(ProgressEvent::Progressed { position });
    }

    pub(crate) fn finished(&self) {
        self.emit(ProgressEvent::Finished);
    }

    pub(crate) fn failed(&self) {
        self.emit(ProgressEvent::Failed);
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::silent()
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress").finish_non_exhaustive()
    }
}
