// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IPC Tunables
//!
//! Limits and diagnostics switches for the port layer, read from the
//! kernel command line at boot.
//!
//! | Option                     | Default | Meaning                                  |
//! |----------------------------|---------|------------------------------------------|
//! | `ipc.requests_max`         | 4096    | Usable request-table slots per port      |
//! | `ipc.qlimit_default`       | 5       | Queue limit of a freshly allocated port  |
//! | `ipc.qlimit_max`           | 1024    | Largest queue limit a port may be given  |
//! | `ipc.srp_link_diagnostics` | off     | Record unexpected special-reply unlinks  |

use crate::kernel::cmdline::Cmdline;

/// Request table size catalog (usable slots per size class)
pub const REQUEST_TABLE_SIZES: [usize; 11] = [4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Default queue limit
pub const QLIMIT_DEFAULT: usize = 5;

/// Maximum queue limit
pub const QLIMIT_MAX: usize = 1024;

/// IPC configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    /// Hard cap on usable request-table slots
    pub requests_max: usize,

    /// Queue limit of new ports
    pub qlimit_default: usize,

    /// Largest accepted queue limit
    pub qlimit_max: usize,

    /// Flag special reply ports that lose their link before a reply was sent
    pub srp_link_diagnostics: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            requests_max: REQUEST_TABLE_SIZES[REQUEST_TABLE_SIZES.len() - 1],
            qlimit_default: QLIMIT_DEFAULT,
            qlimit_max: QLIMIT_MAX,
            srp_link_diagnostics: cfg!(feature = "srp_diagnostics"),
        }
    }
}

impl IpcConfig {
    /// Build the configuration from boot options
    ///
    /// Out-of-range values are clamped rather than rejected.
    pub fn from_cmdline(cmdline: &Cmdline) -> Self {
        let defaults = Self::default();

        let qlimit_max = (cmdline.get_uint64("ipc.qlimit_max", defaults.qlimit_max as u64) as usize)
            .clamp(1, QLIMIT_MAX);
        let qlimit_default = (cmdline
            .get_uint64("ipc.qlimit_default", defaults.qlimit_default as u64)
            as usize)
            .clamp(1, qlimit_max);
        let requests_max = (cmdline.get_uint64("ipc.requests_max", defaults.requests_max as u64)
            as usize)
            .clamp(REQUEST_TABLE_SIZES[0], defaults.requests_max);

        Self {
            requests_max,
            qlimit_default,
            qlimit_max,
            srp_link_diagnostics: cmdline
                .get_bool("ipc.srp_link_diagnostics", defaults.srp_link_diagnostics),
        }
    }

    /// Get the usable slot count of a request table size class
    ///
    /// Returns None once the catalog (or the configured cap) is exhausted.
    pub fn request_size_class(&self, class: usize) -> Option<usize> {
        REQUEST_TABLE_SIZES
            .get(class)
            .copied()
            .filter(|&size| size <= self.requests_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = IpcConfig::from_cmdline(&Cmdline::new());
        assert_eq!(config.qlimit_default, QLIMIT_DEFAULT);
        assert_eq!(config.requests_max, 4096);
        assert_eq!(config.request_size_class(0), Some(4));
        assert_eq!(config.request_size_class(REQUEST_TABLE_SIZES.len()), None);
    }

    #[test]
    fn test_config_from_cmdline() {
        let cmdline = Cmdline::parse(
            "ipc.requests_max=16 ipc.qlimit_max=8 ipc.qlimit_default=100 ipc.srp_link_diagnostics",
        );
        let config = IpcConfig::from_cmdline(&cmdline);
        assert_eq!(config.qlimit_max, 8);
        assert_eq!(config.qlimit_default, 8);
        assert!(config.srp_link_diagnostics);
        assert_eq!(config.request_size_class(2), Some(16));
        assert_eq!(config.request_size_class(3), None);
    }

    #[test]
    fn test_config_clamps_requests_max() {
        let config = IpcConfig::from_cmdline(&Cmdline::parse("ipc.requests_max=1"));
        assert_eq!(config.requests_max, REQUEST_TABLE_SIZES[0]);
    }
}
