//! Lock manager server side: request dispatch, reboot handling and the
//! collaborators it resolves files through.

mod exports;
mod manager;
mod messages;

pub use exports::{ExportResolver, MemExports, VfsError};
pub use manager::LockManager;
pub use messages::{
    CancelArgs, Cookie, GrantedArgs, LockArgs, NlmLock, NlmStat, NotifyArgs,
    RequestCtx, Res, TestArgs, TestHolder, TestRes, UnlockArgs,
};

use serde::Deserialize;

/// Configuration parameters of the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LockdConfig {
    /// Length of the post-start grace period in secs.
    pub grace_period_secs: u64,

    /// A host counts as idle after this many secs without a request.
    pub idle_timeout_secs: u64,

    /// Minimum spacing between idle sweeps in secs.
    pub idle_period_secs: u64,

    /// Lifetime of a cached outbound client in secs.
    pub rpc_stale_secs: u64,

    /// Longest accepted caller name.
    pub max_name_len: usize,

    /// Our own name in status monitor requests.
    pub local_name: String,
}

impl Default for LockdConfig {
    fn default() -> Self {
        LockdConfig {
            grace_period_secs: 0,
            idle_timeout_secs: 30,
            idle_period_secs: 5,
            rpc_stale_secs: 2 * 60,
            max_name_len: 1024,
            local_name: "localhost".into(),
        }
    }
}

impl LockdConfig {
    /// Parses the config from an optional TOML string over the defaults,
    /// then validates it.
    pub fn from_toml(
        config_str: Option<&str>,
    ) -> Result<Self, crate::NlmError> {
        let config = parsed_config!(config_str => LockdConfig;
                                    grace_period_secs, idle_timeout_secs,
                                    idle_period_secs, rpc_stale_secs,
                                    max_name_len, local_name)?;
        if config.idle_timeout_secs == 0 {
            return logged_err!(
                "invalid config.idle_timeout_secs '{}'",
                config.idle_timeout_secs
            );
        }
        if config.idle_period_secs == 0 {
            return logged_err!(
                "invalid config.idle_period_secs '{}'",
                config.idle_period_secs
            );
        }
        if config.rpc_stale_secs == 0 {
            return logged_err!(
                "invalid config.rpc_stale_secs '{}'",
                config.rpc_stale_secs
            );
        }
        if config.max_name_len == 0 {
            return logged_err!(
                "invalid config.max_name_len '{}'",
                config.max_name_len
            );
        }
        if config.local_name.is_empty() {
            return logged_err!(
                "invalid config.local_name '{}'",
                config.local_name
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::NlmError;

    #[test]
    fn defaults() -> Result<(), NlmError> {
        let config = LockdConfig::from_toml(None)?;
        assert_eq!(config, LockdConfig::default());
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.rpc_stale_secs, 120);
        Ok(())
    }

    #[test]
    fn overrides() -> Result<(), NlmError> {
        let config = LockdConfig::from_toml(Some(
            "grace_period_secs = 45\nlocal_name = 'nfs1'",
        ))?;
        assert_eq!(config.grace_period_secs, 45);
        assert_eq!(config.local_name, "nfs1");
        assert_eq!(config.idle_period_secs, 5);
        Ok(())
    }

    #[test]
    fn rejects_invalid() {
        assert!(LockdConfig::from_toml(Some("idle_period_secs = 0")).is_err());
        assert!(LockdConfig::from_toml(Some("local_name = ''")).is_err());
        assert!(LockdConfig::from_toml(Some("unknown_knob = 1")).is_err());
        assert!(LockdConfig::from_toml(Some("max_name_len = -1")).is_err());
    }
}
