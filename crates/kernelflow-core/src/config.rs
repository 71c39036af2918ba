//! Engine configuration.
//!
//! ```ignore
//! let config = EngineConfig::builder()
//!     .loop_count(8)
//!     .run_timeout(Duration::from_secs(5))
//!     .check_leaks(true)
//!     .build()?;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Actor-graph dump settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpConfig {
    /// Write the dump when the engine is built.
    pub enabled: bool,
    /// Output directory.
    pub dir: PathBuf,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("./kernelflow_dump"),
        }
    }
}

/// Configuration for an [`ActorEngine`](crate::engine::ActorEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Sink iterations per `execute` call.
    pub loop_count: u64,
    /// Worker threads of the engine-owned runtime.
    pub worker_threads: usize,
    /// Abort runs that take longer than this.
    pub run_timeout: Option<Duration>,
    /// Verify that no transient tensor survives a run.
    pub check_leaks: bool,
    /// Record per-actor timings.
    pub profile: bool,
    /// Actor-graph dump settings.
    pub dump: DumpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_count: 1,
            worker_threads: 4,
            run_timeout: None,
            check_leaks: true,
            profile: false,
            dump: DumpConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Development preset: leak checks, profiling and a dump on build.
    pub fn development() -> Self {
        Self {
            check_leaks: true,
            profile: true,
            dump: DumpConfig {
                enabled: true,
                ..DumpConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production preset: no per-run bookkeeping beyond what correctness needs.
    pub fn production() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            run_timeout: Some(Duration::from_secs(60)),
            check_leaks: false,
            profile: false,
            ..Self::default()
        }
    }

    /// Multi-step preset running `loop_count` iterations per call.
    pub fn sink(loop_count: u64) -> Self {
        Self {
            loop_count,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.loop_count == 0 {
            return Err(EngineError::InvalidConfig(
                "loop_count must be at least 1".to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.run_timeout == Some(Duration::ZERO) {
            return Err(EngineError::InvalidConfig(
                "run_timeout must be non-zero".to_string(),
            ));
        }
        if self.dump.enabled && self.dump.dir.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig(
                "dump directory must be set when dumping is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sink loop count.
    pub fn loop_count(mut self, count: u64) -> Self {
        self.config.loop_count = count;
        self
    }

    /// Set the worker thread count.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Set the run timeout.
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = Some(timeout);
        self
    }

    /// Enable or disable leak checking.
    pub fn check_leaks(mut self, enable: bool) -> Self {
        self.config.check_leaks = enable;
        self
    }

    /// Enable or disable profiling.
    pub fn profile(mut self, enable: bool) -> Self {
        self.config.profile = enable;
        self
    }

    /// Write the actor-graph dump into `dir` at build time.
    pub fn dump_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dump = DumpConfig {
            enabled: true,
            dir: dir.into(),
        };
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.loop_count, 1);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .loop_count(5)
            .worker_threads(2)
            .run_timeout(Duration::from_millis(250))
            .profile(true)
            .build()
            .unwrap();
        assert_eq!(config.loop_count, 5);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.run_timeout, Some(Duration::from_millis(250)));
        assert!(config.profile);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            EngineConfig::builder().loop_count(0).build(),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(EngineConfig::builder().worker_threads(0).build().is_err());
        assert!(EngineConfig::builder()
            .run_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(EngineConfig::sink(10).loop_count, 10);
        assert!(EngineConfig::development().dump.enabled);
        assert!(!EngineConfig::production().check_leaks);
        assert!(EngineConfig::production().validate().is_ok());
    }
}
