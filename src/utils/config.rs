//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(PaxbootError)` on parser failure or
/// when the string contains a field not in the given list.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; stagger_ms, exe)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::PaxbootError> {
            let mut config: $config_type = Default::default();
            let mut table = match config_str {
                None => return Ok(config),
                Some(s) => s.parse::<toml::Table>()?,
            };

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // any key left over is not an expected field hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::PaxbootError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
