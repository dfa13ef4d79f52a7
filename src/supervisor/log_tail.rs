//! Bounded buffer of recent child output

use std::collections::VecDeque;
use std::sync::Mutex;

/// Longest line kept verbatim; the rest is cut
const MAX_LINE_CHARS: usize = 2000;

/// Ring buffer of output lines; the oldest line is dropped when full
#[derive(Debug)]
pub struct LogTail {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut line = line.into();
        if line.chars().count() > MAX_LINE_CHARS {
            line = line.chars().take(MAX_LINE_CHARS).collect();
        }

        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
