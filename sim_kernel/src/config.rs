//! Kernel configuration
//!
//! Table sizes, boot parameters and object sizes of the simulated kernel.
//! Configurations can be built in code or loaded from JSON; either way they
//! are validated before a kernel boots with them.

use core_types::TaskNo;
use kernel_api::{Duration, Prio};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Boot task {boot_task} outside of {max_tasks} task slots")]
    BootTaskOutOfRange { boot_task: TaskNo, max_tasks: u16 },

    #[error("Boot task must not use the reserved kernel slot")]
    BootTaskIsKernel,

    #[error("At most 255 threads per task are addressable, got {0}")]
    TooManyThreads(u16),

    #[error("Boot priority {prio} exceeds boot mcp {mcp}")]
    BootPrioAboveMcp { prio: Prio, mcp: Prio },

    #[error("Scheduler granularity must be non-zero")]
    ZeroGranularity,

    #[error("task_new needs at least one attempt")]
    ZeroRetryLimit,

    #[error("Boot quota of {quota} bytes cannot hold the boot task ({required} bytes)")]
    BootQuotaTooSmall { quota: u64, required: u64 },
}

/// Simulated kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of task slots, including the reserved kernel slot 0
    pub max_tasks: u16,
    /// Local thread numbers per task
    pub max_threads_per_task: u16,
    /// Slot of the root task
    pub boot_task: TaskNo,
    pub boot_prio: Prio,
    pub boot_mcp: Prio,
    /// Root of the RAM quota tree, in bytes
    pub boot_quota: u64,
    /// Quantum of newly created home timeslices
    pub default_quantum: Duration,
    /// Quanta are rounded up to a multiple of this
    pub scheduler_granularity: Duration,
    /// First address above user space
    pub user_max: u64,
    /// Bytes charged per thread control block
    pub tcb_size: u64,
    /// Bytes charged per task object
    pub task_size: u64,
    /// Attempts before `task_new` gives up on a contended slot
    pub task_new_retry_limit: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: 256,
            max_threads_per_task: 128,
            boot_task: TaskNo(4),
            boot_prio: 0x10,
            boot_mcp: 0xff,
            boot_quota: 16 * 1024 * 1024,
            default_quantum: Duration::from_millis(10),
            scheduler_granularity: Duration::from_micros(1_000),
            user_max: 0xc000_0000,
            tcb_size: 2048,
            task_size: 4096,
            task_new_retry_limit: 8,
        }
    }
}

impl KernelConfig {
    /// Parses and validates a JSON configuration
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.boot_task == TaskNo::KERNEL {
            return Err(ConfigError::BootTaskIsKernel);
        }
        if self.boot_task.0 >= self.max_tasks {
            return Err(ConfigError::BootTaskOutOfRange {
                boot_task: self.boot_task,
                max_tasks: self.max_tasks,
            });
        }
        if self.max_threads_per_task > u8::MAX as u16 {
            return Err(ConfigError::TooManyThreads(self.max_threads_per_task));
        }
        if self.boot_prio > self.boot_mcp {
            return Err(ConfigError::BootPrioAboveMcp {
                prio: self.boot_prio,
                mcp: self.boot_mcp,
            });
        }
        if self.scheduler_granularity.is_zero() {
            return Err(ConfigError::ZeroGranularity);
        }
        if self.task_new_retry_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit);
        }
        let required = self.task_size.saturating_add(self.tcb_size);
        if self.boot_quota < required {
            return Err(ConfigError::BootQuotaTooSmall {
                quota: self.boot_quota,
                required,
            });
        }
        Ok(())
    }

    /// True if `task` names an addressable slot
    pub fn task_in_range(&self, task: TaskNo) -> bool {
        task.0 < self.max_tasks
    }

    pub fn lthread_in_range(&self, lthread: u8) -> bool {
        (lthread as u16) < self.max_threads_per_task
    }
}
