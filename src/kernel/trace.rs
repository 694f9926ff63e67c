//! Structured scheduler tracing.
//!
//! When [`TracingConfig`](crate::kernel::TracingConfig) enables it, the
//! kernel records each scheduling decision as a [`SchedulerEvent`]. Events go
//! either to an append-mode file as newline-delimited JSON (one object per
//! line) or to a bounded in-memory buffer that tests and tools can drain.
//!
//! ```text
//! {"context":"boot","type":"switch","from":null,"to":1,"ticks":0}
//! {"context":"boot","type":"wakeup","thread":2,"reason":"Timeout"}
//! ```

use std::{
    collections::VecDeque,
    fmt::Write as FmtWrite,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use crate::{
    hw::VAddr,
    kernel::{
        config::TracingConfig,
        process::ProcessId,
        sync::WaitObjectId,
        thread::{Priority, ProcessorId, ThreadId, WakeupReason},
    },
};

/// A scheduling decision recorded by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A thread was created and queued.
    ThreadCreated {
        /// New thread.
        thread: ThreadId,
        /// Owner process.
        process: ProcessId,
        /// Initial priority.
        priority: Priority,
        /// Requested processor.
        processor_id: ProcessorId,
        /// Entry point.
        entry_point: VAddr,
        /// TLS entry address.
        tls_address: VAddr,
    },

    /// The CPU switched threads. `None` on either side means idle.
    ContextSwitch {
        /// Thread switched out.
        from: Option<ThreadId>,
        /// Thread switched in.
        to: Option<ThreadId>,
        /// Tick count at the switch.
        ticks: u64,
    },

    /// A waiting thread was woken.
    Wakeup {
        /// Woken thread.
        thread: ThreadId,
        /// Why it woke.
        reason: WakeupReason,
        /// Object that signalled it, if any.
        object: Option<WaitObjectId>,
    },

    /// A thread's effective priority changed through inheritance.
    PriorityChange {
        /// Affected thread.
        thread: ThreadId,
        /// Nominal priority.
        nominal: Priority,
        /// New current priority.
        current: Priority,
    },

    /// A system-core thread was pushed down by load shedding.
    Throttle {
        /// Affected thread.
        thread: ThreadId,
        /// New current priority.
        priority: Priority,
    },

    /// A thread was stopped.
    ThreadStopped {
        /// Stopped thread.
        thread: ThreadId,
    },
}

impl SchedulerEvent {
    /// Converts the event to a JSON object on one line.
    #[must_use]
    pub fn to_json(&self) -> String {
        self.to_json_with_context(None)
    }

    /// Converts the event to JSON, adding a leading `context` field when given.
    #[must_use]
    pub fn to_json_with_context(&self, context: Option<&str>) -> String {
        let context_prefix = context
            .map(|c| format!(r#""context":"{}","#, escape_json(c)))
            .unwrap_or_default();

        match self {
            SchedulerEvent::ThreadCreated {
                thread,
                process,
                priority,
                processor_id,
                entry_point,
                tls_address,
            } => format!(
                r#"{{{}"type":"create","thread":{},"process":{},"priority":{},"processor":{},"entry":"0x{:08X}","tls":"0x{:08X}"}}"#,
                context_prefix,
                thread.value(),
                process.value(),
                priority,
                processor_id,
                entry_point,
                tls_address
            ),
            SchedulerEvent::ContextSwitch { from, to, ticks } => format!(
                r#"{{{}"type":"switch","from":{},"to":{},"ticks":{}}}"#,
                context_prefix,
                json_thread(*from),
                json_thread(*to),
                ticks
            ),
            SchedulerEvent::Wakeup {
                thread,
                reason,
                object,
            } => {
                let object_str = object
                    .map(|o| format!(r#","object":"{}""#, escape_json(&o.to_string())))
                    .unwrap_or_default();
                format!(
                    r#"{{{}"type":"wakeup","thread":{},"reason":"{}"{}}}"#,
                    context_prefix,
                    thread.value(),
                    reason,
                    object_str
                )
            }
            SchedulerEvent::PriorityChange {
                thread,
                nominal,
                current,
            } => format!(
                r#"{{{}"type":"priority","thread":{},"nominal":{},"current":{}}}"#,
                context_prefix,
                thread.value(),
                nominal,
                current
            ),
            SchedulerEvent::Throttle { thread, priority } => format!(
                r#"{{{}"type":"throttle","thread":{},"priority":{}}}"#,
                context_prefix,
                thread.value(),
                priority
            ),
            SchedulerEvent::ThreadStopped { thread } => format!(
                r#"{{{}"type":"stop","thread":{}}}"#,
                context_prefix,
                thread.value()
            ),
        }
    }
}

fn json_thread(thread: Option<ThreadId>) -> String {
    thread.map_or_else(|| "null".to_string(), |t| t.value().to_string())
}

/// Escapes a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(result, "\\u{:04X}", c as u32);
            }
            c => result.push(c),
        }
    }
    result
}

/// Destination for [`SchedulerEvent`]s.
///
/// Owned by the kernel and written from its single driving thread, so no
/// internal locking is needed.
pub struct TraceWriter {
    file: Option<BufWriter<File>>,
    buffer: Option<VecDeque<SchedulerEvent>>,
    /// Maximum buffer size (0 = unlimited).
    max_entries: usize,
    event_count: u64,
    context: Option<String>,
}

impl TraceWriter {
    /// Creates a writer appending NDJSON lines to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened.
    pub fn new_file<P: AsRef<Path>>(path: P, context: Option<String>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            buffer: None,
            max_entries: 0,
            event_count: 0,
            context,
        })
    }

    /// Creates a writer keeping at most `max_entries` events in memory
    /// (0 for unlimited).
    #[must_use]
    pub fn new_memory(max_entries: usize, context: Option<String>) -> Self {
        Self {
            file: None,
            buffer: Some(VecDeque::with_capacity(max_entries.min(10_000))),
            max_entries,
            event_count: 0,
            context,
        }
    }

    /// Builds the writer described by `config`, or `None` when tracing is off.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured output file cannot be opened.
    pub fn from_config(config: &TracingConfig) -> std::io::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        match &config.output_path {
            Some(path) => Self::new_file(path, config.context.clone()).map(Some),
            None => Ok(Some(Self::new_memory(
                config.max_entries,
                config.context.clone(),
            ))),
        }
    }

    /// Returns the context field, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Records one event.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the trace file fails.
    pub fn write(&mut self, event: SchedulerEvent) -> std::io::Result<()> {
        self.event_count += 1;

        if let Some(file) = &mut self.file {
            let json = event.to_json_with_context(self.context.as_deref());
            writeln!(file, "{json}")?;
        } else if let Some(buffer) = &mut self.buffer {
            if self.max_entries > 0 && buffer.len() >= self.max_entries {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }
        Ok(())
    }

    /// Flushes buffered file output.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Returns the number of events recorded, including dropped ones.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Returns the buffered events, oldest first. Empty for file writers.
    pub fn events(&self) -> impl Iterator<Item = &SchedulerEvent> {
        self.buffer.iter().flatten()
    }

    /// Drains the in-memory buffer. Returns `None` for file writers.
    pub fn take_buffer(&mut self) -> Option<Vec<SchedulerEvent>> {
        self.buffer.as_mut().map(|b| b.drain(..).collect())
    }
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("is_file_based", &self.file.is_some())
            .field("max_entries", &self.max_entries)
            .field("event_count", &self.event_count)
            .finish_non_exhaustive()
    }
}
