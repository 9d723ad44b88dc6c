//! Config struct composition from defaults plus an optional TOML string.

/// Builds a `$config_type` from its `Default`, then overrides the listed
/// fields with the values found in the TOML string, if one is given. A key
/// that is not among the listed fields is an error, as is a value of the
/// wrong type. Evaluates to `Result<$config_type, NlmError>`.
///
/// Example:
/// ```no_run
/// # use nlockd::{parsed_config, LockdConfig, NlmError};
/// # fn main() -> Result<(), NlmError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => LockdConfig;
///                             grace_period_secs, local_name)?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;
        (|| -> Result<$config_type, $crate::NlmError> {
            let mut config = <$config_type>::default();
            let mut table = match config_str {
                Some(s) => s.parse::<toml::Table>()?,
                None => return Ok(config),
            };

            const KNOWN: &[&str] = &[$(stringify!($field)),+];
            let unknown = table.keys().find(|k| !KNOWN.contains(&k.as_str()));
            if let Some(key) = unknown {
                return Err($crate::NlmError::msg(format!(
                    "unknown config key '{}'",
                    key
                )));
            }

            $(if let Some(value) = table.remove(stringify!($field)) {
                config.$field = value.try_into().map_err(|e| {
                    $crate::NlmError::msg(format!(
                        "config key '{}': {}",
                        stringify!($field),
                        e
                    ))
                })?;
            })+
            Ok(config)
        })()
    }};
}
