//! Per-domain feature store.
//!
//! A feature maps a string key to a string value. The empty string reads
//! as boolean false, any other value as true; an absent key means
//! "inherit from the template, or fall back to the extension's default".

use qubesd_common::{QubesError, QubesResult};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    values: BTreeMap<String, String>,
}

pub fn validate_feature_name(name: &str) -> QubesResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(QubesError::invalid_value(format!(
            "invalid feature name: {:?}",
            name
        )))
    }
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) -> QubesResult<Option<String>> {
        validate_feature_name(name)?;
        Ok(self.values.insert(name.to_string(), value.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Boolean interpretation of a present value.
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| !v.is_empty())
    }

    /// Resolve through this store first, then through the template's.
    pub fn check_with_template<'a>(
        &'a self,
        name: &str,
        template: Option<&'a Features>,
    ) -> Option<&'a str> {
        self.get(name).or_else(|| template.and_then(|t| t.get(name)))
    }

    /// Keys starting with `service.`, with the service name and enabled
    /// flag extracted.
    pub fn services(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().filter_map(|(k, v)| {
            k.strip_prefix("service.").map(|name| (name, !v.is_empty()))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, String)> for Features {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_interpretation() {
        let mut f = Features::new();
        f.set("service.crond", "1").unwrap();
        f.set("service.cups", "").unwrap();
        assert_eq!(f.is_enabled("service.crond"), Some(true));
        assert_eq!(f.is_enabled("service.cups"), Some(false));
        assert_eq!(f.is_enabled("service.missing"), None);
    }

    #[test]
    fn template_fallback() {
        let mut own = Features::new();
        let mut tpl = Features::new();
        tpl.set("supported-service.cups", "1").unwrap();
        tpl.set("qrexec", "1").unwrap();
        own.set("qrexec", "").unwrap();

        assert_eq!(
            own.check_with_template("supported-service.cups", Some(&tpl)),
            Some("1")
        );
        // own value shadows the template's
        assert_eq!(own.check_with_template("qrexec", Some(&tpl)), Some(""));
        assert_eq!(own.check_with_template("absent", Some(&tpl)), None);
    }

    #[test]
    fn service_extraction() {
        let mut f = Features::new();
        f.set("service.crond", "1").unwrap();
        f.set("service.cups", "").unwrap();
        f.set("qrexec", "1").unwrap();
        let services: Vec<_> = f.services().collect();
        assert_eq!(services, vec![("crond", true), ("cups", false)]);
    }

    #[test]
    fn name_validation() {
        let mut f = Features::new();
        assert!(f.set("os", "linux").is_ok());
        assert!(f.set("", "x").is_err());
        assert!(f.set("bad name", "x").is_err());
    }
}
