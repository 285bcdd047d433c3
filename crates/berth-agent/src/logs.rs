//! Per-server log capture: bounded buffers fed by runtime log streams.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use berth_types::{ServerEvent, ServerId};
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    events::EventSink,
    runtime::{ContainerRuntime, LogOptions},
    support::{format_error_chain, short_id},
};

pub const CLEARED_MARKER: &str = "[Logs cleared]";

/// Where a new attachment starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFrom {
    Beginning,
    Now,
    Tail(usize),
}

impl LogFrom {
    fn options(self) -> LogOptions {
        let mut options = LogOptions::default();
        match self {
            LogFrom::Beginning => {}
            LogFrom::Now => options.since = Some(Utc::now().timestamp()),
            LogFrom::Tail(n) => options.tail = Some(n),
        }
        options
    }
}

struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }
}

fn stamp(line: &str) -> String {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("[{ts}] {}", line.trim_end_matches(['\r', '\n']))
}

#[derive(Clone)]
struct LogStore {
    capacity: usize,
    buffers: Arc<Mutex<HashMap<ServerId, LogBuffer>>>,
}

impl LogStore {
    fn with<T>(&self, f: impl FnOnce(&mut HashMap<ServerId, LogBuffer>) -> T) -> T {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut buffers)
    }

    fn push(&self, server_id: &ServerId, line: String) {
        let capacity = self.capacity;
        self.with(|b| {
            b.entry(server_id.clone())
                .or_insert_with(|| LogBuffer::new(capacity))
                .push_line(line)
        });
    }
}

struct Attachment {
    id: u64,
    task: JoinHandle<()>,
}

/// Captures container output into per-server ring buffers and republishes every chunk.
#[derive(Clone)]
pub struct LogAggregator {
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<dyn EventSink>,
    store: LogStore,
    attachments: Arc<Mutex<HashMap<ServerId, Attachment>>>,
    next_attachment: Arc<AtomicU64>,
}

impl LogAggregator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<dyn EventSink>,
        capacity: usize,
    ) -> Self {
        Self {
            runtime,
            events,
            store: LogStore {
                capacity,
                buffers: Arc::new(Mutex::new(HashMap::new())),
            },
            attachments: Arc::new(Mutex::new(HashMap::new())),
            next_attachment: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Follows `handle`'s output for `server_id`, replacing any previous attachment.
    pub fn attach(&self, server_id: &ServerId, handle: &str, from: LogFrom) {
        let id = self.next_attachment.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.runtime.logs(handle, from.options());
        let store = self.store.clone();
        let events = self.events.clone();
        let attachments = self.attachments.clone();
        let sid = server_id.clone();
        let span = tracing::info_span!(
            "log_stream",
            server_id = %server_id,
            container = %short_id(handle)
        );

        // Held across spawn so a stream that ends immediately cannot race the insert below.
        let mut current = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(
            async move {
                tracing::debug!(?from, "log stream attached");
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            store.push(&sid, stamp(&chunk));
                            events.publish(&ServerEvent::Log {
                                server_id: sid.clone(),
                                message: chunk,
                            });
                        }
                        Err(e) => {
                            let msg = format_error_chain(&e);
                            tracing::warn!(error = %msg, "log stream failed");
                            let line = format!("[ERROR] Log stream error: {msg}");
                            store.push(&sid, stamp(&line));
                            break;
                        }
                    }
                }
                tracing::debug!("log stream ended");

                let mut attachments = attachments.lock().unwrap_or_else(PoisonError::into_inner);
                if attachments.get(&sid).is_some_and(|a| a.id == id) {
                    attachments.remove(&sid);
                }
            }
            .instrument(span),
        );

        let previous = current.insert(server_id.clone(), Attachment { id, task });
        drop(current);
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Stops following; returns whether an attachment existed.
    pub fn detach(&self, server_id: &ServerId) -> bool {
        let removed = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        match removed {
            Some(a) => {
                a.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn detach_all(&self) {
        let drained: Vec<Attachment> = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, a)| a)
            .collect();
        for a in drained {
            a.task.abort();
        }
    }

    pub fn is_attached(&self, server_id: &ServerId) -> bool {
        self.attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .is_some_and(|a| !a.task.is_finished())
    }

    pub fn attached_count(&self) -> usize {
        self.attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|a| !a.task.is_finished())
            .count()
    }

    /// Most recent `lines` entries, oldest first.
    pub fn get_logs(&self, server_id: &ServerId, lines: usize) -> Vec<String> {
        self.store
            .with(|b| b.get(server_id).map(|buf| buf.tail(lines)))
            .unwrap_or_default()
    }

    pub fn clear_logs(&self, server_id: &ServerId) {
        let capacity = self.store.capacity;
        self.store.with(|b| {
            let mut buf = LogBuffer::new(capacity);
            buf.push_line(stamp(CLEARED_MARKER));
            b.insert(server_id.clone(), buf);
        });
    }

    /// Appends an already formatted line with the current timestamp.
    pub fn append(&self, server_id: &ServerId, line: &str) {
        self.store.push(server_id, stamp(line));
    }

    /// Detaches and drops the buffer.
    pub fn remove(&self, server_id: &ServerId) {
        self.detach(server_id);
        self.store.with(|b| b.remove(server_id));
    }

    pub fn has_buffer(&self, server_id: &ServerId) -> bool {
        self.store.with(|b| b.contains_key(server_id))
    }
}
