//! Progress reporting for multi-path loads

use std::io::{self, Write};

/// Per-path progress written to stderr
pub struct ProgressReporter {
    total: usize,
    processed: usize,
    items: usize,
    enabled: bool,
}

impl ProgressReporter {
    pub fn new(total: usize, enabled: bool) -> Self {
        Self {
            total,
            processed: 0,
            items: 0,
            enabled,
        }
    }

    pub fn set_message(&self, msg: &str) {
        if self.enabled {
            eprint!("\r[{}/{}] {:<50}", self.processed + 1, self.total, msg);
            io::stderr().flush().ok();
        }
    }

    pub fn increment(&mut self, items: usize) {
        self.processed += 1;
        self.items += items;
    }

    pub fn items(&self) -> usize {
        self.items
    }

    pub fn finish(&self) {
        if self.enabled {
            eprintln!(
                "\rDone ({}/{} paths, {} items)                    ",
                self.processed, self.total, self.items
            );
        }
    }
}
