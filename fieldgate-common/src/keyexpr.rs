use crate::error::{Error, Result};

/// Default key expression prefix for the Modbus gateway.
pub const KEY_PREFIX: &str = "fieldgate/modbus";

/// Builder for the gateway's key expressions.
///
/// Telemetry lands on `<prefix>/<device>/<tag>`; gateway metadata lives under
/// `<prefix>/@/...` so wildcard telemetry subscribers never see it.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for one point value.
    ///
    /// # Example
    /// ```
    /// use fieldgate_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::default();
    /// assert_eq!(
    ///     builder.telemetry("boiler-1", "supply temp"),
    ///     "fieldgate/modbus/boiler-1/supply_temp"
    /// );
    /// ```
    pub fn telemetry(&self, device: &str, tag: &str) -> String {
        format!(
            "{}/{}/{}",
            self.prefix,
            sanitize_segment(device),
            sanitize_segment(tag)
        )
    }

    /// Wildcard over every point of one device.
    pub fn device_wildcard(&self, device: &str) -> String {
        format!("{}/{}/**", self.prefix, sanitize_segment(device))
    }

    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    pub fn health_key(&self) -> String {
        format!("{}/@/health", self.prefix)
    }

    /// Liveliness token held while a device link is up.
    pub fn alive_key(&self, device: &str) -> String {
        format!("{}/@/alive/{}", self.prefix, sanitize_segment(device))
    }

    pub fn alive_wildcard(&self) -> String {
        format!("{}/@/alive/*", self.prefix)
    }

    /// Queryable accepting control command carriers.
    pub fn control_key(&self) -> String {
        format!("{}/@/commands/control", self.prefix)
    }
}

/// Replace characters that carry meaning in key expressions.
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '*' | '$' | '?' | '#' | '@' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Validate a configured key prefix.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.starts_with('/') {
        return Err(Error::KeyPrefix(prefix.to_string()));
    }
    if prefix
        .split('/')
        .any(|chunk| chunk.is_empty() || sanitize_segment(chunk) != chunk)
    {
        return Err(Error::KeyPrefix(prefix.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys() {
        let builder = KeyExprBuilder::new("plant/a/");
        assert_eq!(builder.prefix(), "plant/a");
        assert_eq!(builder.status_key(), "plant/a/@/status");
        assert_eq!(builder.health_key(), "plant/a/@/health");
        assert_eq!(builder.control_key(), "plant/a/@/commands/control");
        assert_eq!(builder.alive_key("dev 1"), "plant/a/@/alive/dev_1");
        assert_eq!(builder.alive_wildcard(), "plant/a/@/alive/*");
    }

    #[test]
    fn test_telemetry_keys() {
        let builder = KeyExprBuilder::default();
        assert_eq!(
            builder.telemetry("7", "pressure/in"),
            "fieldgate/modbus/7/pressure_in"
        );
        assert_eq!(builder.device_wildcard("7"), "fieldgate/modbus/7/**");
    }

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("fieldgate/modbus").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("/abs").is_err());
        assert!(validate_prefix("a//b").is_err());
        assert!(validate_prefix("a/*/b").is_err());
    }
}
