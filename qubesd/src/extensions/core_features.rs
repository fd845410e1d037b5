//! Handles `features-request` calls from guests.
//!
//! Everything a guest sends is untrusted. Only known keys with sane
//! values are stored; anything else is silently dropped so a hostile
//! guest learns nothing from the reaction.

use crate::app::App;
use crate::extensions::Extension;
use log::debug;
use qubesd_common::{async_trait, Event, QubesResult};

/// Keys a guest may legitimately report about itself.
const ACCEPTED_FEATURES: &[&str] = &["gui", "qrexec", "os", "os-distribution", "vendor", "version"];

const MAX_VALUE_LEN: usize = 128;

pub struct CoreFeaturesExtension;

fn untrusted_value_ok(value: &str) -> bool {
    value.len() <= MAX_VALUE_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
}

#[async_trait]
impl Extension for CoreFeaturesExtension {
    fn name(&self) -> &'static str {
        "core-features"
    }

    async fn handle_event(&self, app: &App, subject: &str, event: &Event) -> QubesResult<()> {
        if event.name != "features-request" {
            return Ok(());
        }
        for (key, untrusted_value) in &event.kwargs {
            let untrusted_name = match key.strip_prefix("untrusted_") {
                Some(n) => n,
                None => continue,
            };
            let accepted = ACCEPTED_FEATURES.contains(&untrusted_name)
                || untrusted_name.starts_with("supported-service.");
            if !accepted || !untrusted_value_ok(untrusted_value) {
                debug!(
                    "ignoring feature request {:?} from {}",
                    untrusted_name, subject
                );
                continue;
            }
            // validated above
            let name = untrusted_name;
            let value = untrusted_value.as_str();
            app.feature_set(subject, name, value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_validation() {
        assert!(untrusted_value_ok("debian 12.4"));
        assert!(untrusted_value_ok(""));
        assert!(!untrusted_value_ok("evil\nvalue"));
        assert!(!untrusted_value_ok(&"x".repeat(300)));
    }
}
