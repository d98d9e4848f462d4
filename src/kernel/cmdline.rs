// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Command Line Parsing
//!
//! Boot arguments are parsed into `key=value` entries that the IPC layer
//! reads its tunables from.
//!
//! # Design
//!
//! - Spaces separate entries
//! - Invalid characters converted to '.', tabs and newlines act as spaces
//! - A key without a value is stored as `key=` (empty value)
//! - Later entries override earlier entries with the same key
//!
//! # Usage
//!
//! ```rust
//! let mut cmdline = Cmdline::new();
//! cmdline.append("ipc.requests_max=256 ipc.srp_link_diagnostics");
//!
//! let max = cmdline.get_uint32("ipc.requests_max", 4096);
//! let diag = cmdline.get_bool("ipc.srp_link_diagnostics", false);
//! ```

use alloc::string::String;
use alloc::vec::Vec;

/// Maximum command line size
const CMDLINE_MAX: usize = 4096;

/// Parsed kernel command line
#[derive(Debug, Default, Clone)]
pub struct Cmdline {
    /// Entries in the order they were appended
    entries: Vec<(String, String)>,

    /// Bytes consumed so far (bounded by CMDLINE_MAX)
    size: usize,
}

impl Cmdline {
    /// Create an empty command line
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            size: 0,
        }
    }

    /// Parse a complete command line
    pub fn parse(data: &str) -> Self {
        let mut cmdline = Self::new();
        cmdline.append(data);
        cmdline
    }

    /// Append data to the command line
    ///
    /// Data beyond the command line limit is dropped.
    pub fn append(&mut self, data: &str) {
        let room = CMDLINE_MAX.saturating_sub(self.size);
        let mut current = String::new();

        for &c in data.as_bytes().iter().take(room) {
            self.size += 1;
            let c = match c {
                b'\n' | b'\r' | b'\t' => b' ',
                c if c < b' ' || c > 127 => b'.',
                c => c,
            };
            if c == b' ' {
                self.finish_entry(&mut current);
            } else {
                current.push(c as char);
            }
        }
        self.finish_entry(&mut current);
    }

    fn finish_entry(&mut self, current: &mut String) {
        if current.is_empty() {
            return;
        }
        let entry = core::mem::take(current);
        let (key, value) = match entry.split_once('=') {
            Some((k, v)) => (String::from(k), String::from(v)),
            None => (entry, String::new()),
        };
        self.entries.push((key, value));
    }

    /// Get a value from the command line
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get a boolean value from the command line
    ///
    /// Returns false if the value is "0", "false", or "off", true for any
    /// other value (including a bare key).
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => !matches!(v, "0" | "false" | "off"),
        }
    }

    /// Get a uint32 value from the command line (decimal or 0x-prefixed hex)
    pub fn get_uint32(&self, key: &str, default: u32) -> u32 {
        u32::try_from(self.get_uint64(key, u64::from(default))).unwrap_or(default)
    }

    /// Get a uint64 value from the command line (decimal or 0x-prefixed hex)
    pub fn get_uint64(&self, key: &str, default: u64) -> u64 {
        let v = match self.get(key) {
            None | Some("") => return default,
            Some(v) => v,
        };
        let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => v.parse::<u64>(),
        };
        parsed.unwrap_or(default)
    }

    /// Get the number of command line entries
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_empty() {
        let cmdline = Cmdline::new();
        assert!(cmdline.get("test").is_none());
        assert_eq!(cmdline.count(), 0);
    }

    #[test]
    fn test_cmdline_append_simple() {
        let cmdline = Cmdline::parse("test=value");
        assert_eq!(cmdline.get("test"), Some("value"));
    }

    #[test]
    fn test_cmdline_separators_and_bare_keys() {
        let cmdline = Cmdline::parse("  a=1\tb \n c=x=y ");
        assert_eq!(cmdline.count(), 3);
        assert_eq!(cmdline.get("a"), Some("1"));
        assert_eq!(cmdline.get("b"), Some(""));
        assert_eq!(cmdline.get("c"), Some("x=y"));
    }

    #[test]
    fn test_cmdline_get_bool() {
        let cmdline = Cmdline::parse("flag1=true flag2=false flag3=1 flag4");

        assert!(cmdline.get_bool("flag1", false));
        assert!(!cmdline.get_bool("flag2", true));
        assert!(cmdline.get_bool("flag3", false));
        assert!(cmdline.get_bool("flag4", false));

        // Test default for missing key
        assert!(cmdline.get_bool("missing", true));
    }

    #[test]
    fn test_cmdline_get_numbers() {
        let mut cmdline = Cmdline::parse("dec=42 hex=0x1F bad=12z");
        assert_eq!(cmdline.get_uint32("dec", 0), 42);
        assert_eq!(cmdline.get_uint64("hex", 0), 0x1f);
        assert_eq!(cmdline.get_uint32("bad", 7), 7);
        assert_eq!(cmdline.get_uint32("missing", 9), 9);

        cmdline.append("dec=43");
        assert_eq!(cmdline.get_uint32("dec", 0), 43);
    }

    #[test]
    fn test_cmdline_control_chars() {
        let cmdline = Cmdline::parse("k=a\u{1}b");
        assert_eq!(cmdline.get("k"), Some("a.b"));
    }
}
