// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        // RUST_LOG wins so russh internals can be traced selectively
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("sshkit=warn"),
            1 => EnvFilter::new("sshkit=info"),
            // -vv: session engine and transport debug logs
            2 => EnvFilter::new("sshkit=debug,russh=debug"),
            _ => EnvFilter::new("sshkit=trace,russh=trace,russh_sftp=debug"),
        }
    }
}

/// Initialize console logging to stderr.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_env_filter() {
        for verbosity in 0..4 {
            let _ = create_env_filter(verbosity);
        }
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(0);
        init_logging(2);
    }
}
