//! In-memory batching of job output between uploads.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::scheduler::job::LogStream;

/// Key of one uploaded chunk. Sorts lexicographically in upload order: UTC
/// time down to the millisecond, then a per-stream sequence number so two
/// uploads in the same millisecond never collide.
pub fn chunk_key(at: DateTime<Utc>, seq: u64) -> String {
    format!("{}-{:06}", at.format("%Y-%m-%d-%H-%M-%S-%3f"), seq)
}

#[derive(Debug, Default)]
struct StreamBuffer {
    pending: VecDeque<String>,
    bytes: usize,
    seq: u64,
    dropped_lines: u64,
}

impl StreamBuffer {
    fn push(&mut self, line: String, max_bytes: usize) {
        self.bytes += line.len();
        self.pending.push_back(line);
        while self.bytes > max_bytes && self.pending.len() > 1 {
            if let Some(old) = self.pending.pop_front() {
                self.bytes -= old.len();
                self.dropped_lines += 1;
            }
        }
    }

    fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text: String = self.pending.drain(..).collect();
        self.bytes = 0;
        Some(text)
    }
}

/// Output of both streams waiting to be uploaded.
#[derive(Debug)]
pub struct LogBuffers {
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    max_bytes: usize,
}

/// One batch ready to be merged into a stream's log document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: LogStream,
    pub key: String,
    pub text: String,
}

impl LogBuffers {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            stdout: StreamBuffer::default(),
            stderr: StreamBuffer::default(),
            max_bytes,
        }
    }

    fn buffer(&mut self, stream: LogStream) -> &mut StreamBuffer {
        match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }

    pub fn push(&mut self, stream: LogStream, line: String) {
        let max = self.max_bytes;
        self.buffer(stream).push(line, max);
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.pending.is_empty() && self.stderr.pending.is_empty()
    }

    /// Drain a stream into a chunk keyed at `now`. `None` if nothing is buffered.
    pub fn take_chunk(&mut self, stream: LogStream, now: DateTime<Utc>) -> Option<LogChunk> {
        let buffer = self.buffer(stream);
        let text = buffer.take()?;
        buffer.seq += 1;
        Some(LogChunk {
            stream,
            key: chunk_key(now, buffer.seq),
            text,
        })
    }

    /// Put back a chunk whose upload failed, ahead of anything buffered since.
    pub fn restore(&mut self, chunk: LogChunk) {
        let max = self.max_bytes;
        let buffer = self.buffer(chunk.stream);
        buffer.bytes += chunk.text.len();
        buffer.pending.push_front(chunk.text);
        while buffer.bytes > max && buffer.pending.len() > 1 {
            if let Some(old) = buffer.pending.pop_front() {
                buffer.bytes -= old.len();
                buffer.dropped_lines += 1;
            }
        }
    }

    /// Lines discarded so far because uploads kept failing.
    pub fn dropped_lines(&self, stream: LogStream) -> u64 {
        match stream {
            LogStream::Stdout => self.stdout.dropped_lines,
            LogStream::Stderr => self.stderr.dropped_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn chunk_key_format() {
        assert_eq!(chunk_key(at(26), 3), "2023-11-14-22-13-20-026-000003");
    }

    #[test]
    fn chunk_keys_sort_in_upload_order() {
        let mut buffers = LogBuffers::new(1024);
        let mut keys = Vec::new();
        for (i, ms) in [0, 0, 1, 999, 1000].into_iter().enumerate() {
            buffers.push(LogStream::Stdout, format!("{}\n", i));
            keys.push(buffers.take_chunk(LogStream::Stdout, at(ms)).unwrap().key);
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), keys.len());
    }

    #[test]
    fn take_chunk_drains_one_stream() {
        let mut buffers = LogBuffers::new(1024);
        buffers.push(LogStream::Stdout, "a\n".to_string());
        buffers.push(LogStream::Stdout, "b\n".to_string());
        buffers.push(LogStream::Stderr, "oops\n".to_string());

        let chunk = buffers.take_chunk(LogStream::Stdout, at(0)).unwrap();
        assert_eq!(chunk.text, "a\nb\n");
        assert_eq!(chunk.stream, LogStream::Stdout);
        assert!(buffers.take_chunk(LogStream::Stdout, at(1)).is_none());
        assert!(!buffers.is_empty());

        let chunk = buffers.take_chunk(LogStream::Stderr, at(1)).unwrap();
        assert_eq!(chunk.text, "oops\n");
        assert!(buffers.is_empty());
    }

    #[test]
    fn restored_chunk_goes_first() {
        let mut buffers = LogBuffers::new(1024);
        buffers.push(LogStream::Stdout, "a\n".to_string());
        let chunk = buffers.take_chunk(LogStream::Stdout, at(0)).unwrap();
        buffers.push(LogStream::Stdout, "b\n".to_string());
        buffers.restore(chunk);

        let chunk = buffers.take_chunk(LogStream::Stdout, at(1)).unwrap();
        assert_eq!(chunk.text, "a\nb\n");
    }

    #[test]
    fn oldest_lines_dropped_past_cap() {
        let mut buffers = LogBuffers::new(4);
        for line in ["1\n", "2\n", "3\n"] {
            buffers.push(LogStream::Stderr, line.to_string());
        }
        assert_eq!(buffers.dropped_lines(LogStream::Stderr), 1);
        let chunk = buffers.take_chunk(LogStream::Stderr, at(0)).unwrap();
        assert_eq!(chunk.text, "2\n3\n");
    }
}
