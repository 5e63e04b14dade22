//! Broker channel naming
//!
//! ```text
//! commands.{app}.com              command queue shared by all instances of an app
//! commands.{app}.res.{instance}   reply queue of a single instance
//! commands.{app}.err              undeliverable / undecodable messages
//! ```

/// Command queue consumed by every instance of `app`
pub fn commands(app: &str) -> String {
    format!("commands.{app}.com")
}

/// Reply queue of one application instance
pub fn results(app: &str, instance_id: &str) -> String {
    format!("commands.{app}.res.{}", normalize(instance_id))
}

/// Error queue of `app`
pub fn errors(app: &str) -> String {
    format!("commands.{app}.err")
}

/// Replace everything outside `[A-Za-z0-9_-]` with `_`
fn normalize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(commands("billing"), "commands.billing.com");
        assert_eq!(errors("billing"), "commands.billing.err");
        assert_eq!(results("billing", "node-1"), "commands.billing.res.node-1");
    }

    #[test]
    fn test_instance_id_is_normalized() {
        assert_eq!(
            results("billing", "10.0.0.7:8080/a"),
            "commands.billing.res.10_0_0_7_8080_a"
        );
    }
}
