//! Engine configuration.
//!
//! Every number the engine uses to size queues or bound a wait lives here. Timeouts are stored in
//! milliseconds so the struct round-trips cleanly through serde; the accessors return
//! [`Duration`]s.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a thread waiting for a command reply learns that the reply arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// The waiter drains the reply FIFO itself between condvar slices.
    #[default]
    Polled,
    /// Something else (an interrupt handler or [`crate::Ioc::spawn_reply_worker`]) drains the
    /// reply FIFO; waiters only sleep on the condvar.
    External,
}

impl FromStr for CompletionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "polled" => Ok(Self::Polled),
            "external" => Ok(Self::External),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IocConfig {
    /// Upper bound on the request frame size in bytes; the controller may negotiate it down.
    pub frame_size: usize,
    pub max_request_depth: u16,
    pub max_reply_depth: u16,
    /// Reply frame size in bytes.
    pub reply_frame_size: u16,
    /// Chain buffers available per request frame.
    pub max_chain_depth: u8,

    pub handshake_ack_timeout_ms: u64,
    pub facts_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub port_enable_timeout_ms: u64,
    pub fw_upload_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub operational_timeout_ms: u64,
    pub command_timeout_ms: u64,

    pub reset_poll_interval_ms: u64,
    pub reset_timeout_ms: u64,
    pub write_sequence_retries: u32,
    pub facts_retries: u32,

    /// Sleep between checks of a register or reply slot.
    pub poll_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// Whether a command timeout triggers a controller recovery.
    pub escalate_timeouts: bool,

    pub completion: CompletionMode,
    pub event_log_size: usize,
}

impl Default for IocConfig {
    fn default() -> Self {
        Self {
            frame_size: 128,
            max_request_depth: 255,
            max_reply_depth: 128,
            reply_frame_size: 80,
            max_chain_depth: 16,

            handshake_ack_timeout_ms: 5_000,
            facts_timeout_ms: 5_000,
            init_timeout_ms: 10_000,
            port_enable_timeout_ms: 30_000,
            fw_upload_timeout_ms: 65_000,
            ready_timeout_ms: 15_000,
            operational_timeout_ms: 60_000,
            command_timeout_ms: 30_000,

            reset_poll_interval_ms: 100,
            reset_timeout_ms: 3_000,
            write_sequence_retries: 20,
            facts_retries: 5,

            poll_interval_ms: 1,
            health_check_interval_ms: 1_000,
            escalate_timeouts: true,

            completion: CompletionMode::Polled,
            event_log_size: 50,
        }
    }
}

fn env_override<T: FromStr>(var: &'static str, slot: &mut T) -> Result<(), ConfigError> {
    match std::env::var(var) {
        Ok(raw) => {
            *slot = raw
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidEnv(var))?;
            Ok(())
        }
        Err(std::env::VarError::NotPresent) => Ok(()),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnv(var)),
    }
}

impl IocConfig {
    /// Defaults overlaid with any `MPT_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        env_override("MPT_FRAME_SIZE", &mut cfg.frame_size)?;
        env_override("MPT_MAX_REQUEST_DEPTH", &mut cfg.max_request_depth)?;
        env_override("MPT_MAX_REPLY_DEPTH", &mut cfg.max_reply_depth)?;
        env_override("MPT_REPLY_FRAME_SIZE", &mut cfg.reply_frame_size)?;
        env_override("MPT_MAX_CHAIN_DEPTH", &mut cfg.max_chain_depth)?;
        env_override("MPT_HANDSHAKE_ACK_TIMEOUT_MS", &mut cfg.handshake_ack_timeout_ms)?;
        env_override("MPT_FACTS_TIMEOUT_MS", &mut cfg.facts_timeout_ms)?;
        env_override("MPT_INIT_TIMEOUT_MS", &mut cfg.init_timeout_ms)?;
        env_override("MPT_PORT_ENABLE_TIMEOUT_MS", &mut cfg.port_enable_timeout_ms)?;
        env_override("MPT_FW_UPLOAD_TIMEOUT_MS", &mut cfg.fw_upload_timeout_ms)?;
        env_override("MPT_READY_TIMEOUT_MS", &mut cfg.ready_timeout_ms)?;
        env_override("MPT_OPERATIONAL_TIMEOUT_MS", &mut cfg.operational_timeout_ms)?;
        env_override("MPT_COMMAND_TIMEOUT_MS", &mut cfg.command_timeout_ms)?;
        env_override("MPT_RESET_POLL_INTERVAL_MS", &mut cfg.reset_poll_interval_ms)?;
        env_override("MPT_RESET_TIMEOUT_MS", &mut cfg.reset_timeout_ms)?;
        env_override("MPT_WRITE_SEQUENCE_RETRIES", &mut cfg.write_sequence_retries)?;
        env_override("MPT_FACTS_RETRIES", &mut cfg.facts_retries)?;
        env_override("MPT_POLL_INTERVAL_MS", &mut cfg.poll_interval_ms)?;
        env_override("MPT_HEALTH_CHECK_INTERVAL_MS", &mut cfg.health_check_interval_ms)?;
        env_override("MPT_ESCALATE_TIMEOUTS", &mut cfg.escalate_timeouts)?;
        env_override("MPT_COMPLETION", &mut cfg.completion)?;
        env_override("MPT_EVENT_LOG_SIZE", &mut cfg.event_log_size)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &'static str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, reason })
        }

        if self.frame_size < 64 || self.frame_size > 1024 || self.frame_size % 4 != 0 {
            return invalid("frame_size", "must be a multiple of 4 between 64 and 1024");
        }
        if self.max_request_depth == 0 {
            return invalid("max_request_depth", "must be non-zero");
        }
        if self.max_reply_depth == 0 {
            return invalid("max_reply_depth", "must be non-zero");
        }
        if self.reply_frame_size < 20 || self.reply_frame_size % 4 != 0 {
            return invalid("reply_frame_size", "must be a multiple of 4 of at least 20");
        }
        let timeouts = [
            ("handshake_ack_timeout_ms", self.handshake_ack_timeout_ms),
            ("facts_timeout_ms", self.facts_timeout_ms),
            ("init_timeout_ms", self.init_timeout_ms),
            ("port_enable_timeout_ms", self.port_enable_timeout_ms),
            ("fw_upload_timeout_ms", self.fw_upload_timeout_ms),
            ("ready_timeout_ms", self.ready_timeout_ms),
            ("operational_timeout_ms", self.operational_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("reset_timeout_ms", self.reset_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return invalid(field, "must be non-zero");
            }
        }
        if self.reset_poll_interval_ms > self.reset_timeout_ms {
            return invalid("reset_poll_interval_ms", "must not exceed reset_timeout_ms");
        }
        if self.write_sequence_retries == 0 {
            return invalid("write_sequence_retries", "must be non-zero");
        }
        if self.facts_retries == 0 {
            return invalid("facts_retries", "must be non-zero");
        }
        if self.event_log_size == 0 {
            return invalid("event_log_size", "must be non-zero");
        }
        Ok(())
    }

    pub fn handshake_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_ack_timeout_ms)
    }

    pub fn facts_timeout(&self) -> Duration {
        Duration::from_millis(self.facts_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn port_enable_timeout(&self) -> Duration {
        Duration::from_millis(self.port_enable_timeout_ms)
    }

    pub fn fw_upload_timeout(&self) -> Duration {
        Duration::from_millis(self.fw_upload_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn operational_timeout(&self) -> Duration {
        Duration::from_millis(self.operational_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reset_poll_interval_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}
