//! Label incrementers.

use cadence_core::plugin::PluginSpec;
use cadence_core::ports::LabelIncrementer;

const DEFAULT_SEPARATOR: &str = ".";
const DEFAULT_PREFIX: &str = "build";

/// Increments the number after the last separator: `1.2.2` → `1.2.3`.
#[derive(Debug, Clone)]
pub struct DefaultLabelIncrementer {
    separator: String,
    prefix: String,
}

impl Default for DefaultLabelIncrementer {
    fn default() -> Self {
        Self::with_separator(DEFAULT_SEPARATOR)
    }
}

impl DefaultLabelIncrementer {
    pub fn with_separator(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Reads optional `separator` and `prefix` parameters.
    pub fn from_spec(spec: &PluginSpec) -> Self {
        Self {
            separator: spec
                .get_str("separator")
                .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            prefix: spec
                .get_str("prefix")
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        }
    }

    /// The label's prefix and its successor number. A number with no
    /// successor makes the label invalid.
    fn split<'a>(&self, label: &'a str) -> Option<(&'a str, u64)> {
        if self.separator.is_empty() {
            return None;
        }
        let (prefix, suffix) = label.rsplit_once(self.separator.as_str())?;
        let n: u64 = suffix.parse().ok()?;
        n.checked_add(1).map(|next| (prefix, next))
    }
}

impl LabelIncrementer for DefaultLabelIncrementer {
    fn increment(&self, label: &str) -> String {
        match self.split(label) {
            Some((prefix, next)) => format!("{}{}{}", prefix, self.separator, next),
            None => label.to_string(),
        }
    }

    fn is_valid_label(&self, label: &str) -> bool {
        self.split(label).is_some()
    }

    fn default_label(&self) -> String {
        format!("{}{}1", self.prefix, self.separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_last_component() {
        let inc = DefaultLabelIncrementer::default();
        assert_eq!(inc.increment("1.2.2"), "1.2.3");
        assert_eq!(inc.increment("build.9"), "build.10");
    }

    #[test]
    fn test_label_at_counter_limit_is_left_alone() {
        let inc = DefaultLabelIncrementer::default();
        let last = format!("build.{}", u64::MAX);
        assert!(!inc.is_valid_label(&last));
        assert_eq!(inc.increment(&last), last);
        assert_eq!(
            inc.increment(&format!("build.{}", u64::MAX - 1)),
            format!("build.{}", u64::MAX)
        );
    }

    #[test]
    fn test_validity_depends_on_separator() {
        let inc = DefaultLabelIncrementer::default();
        assert!(inc.is_valid_label("build.1"));
        assert!(!inc.is_valid_label("build_0"));
        assert!(!inc.is_valid_label("build.x"));

        let underscore = DefaultLabelIncrementer::with_separator("_");
        assert!(underscore.is_valid_label("build_0"));
        assert_eq!(underscore.increment("build_0"), "build_1");
    }

    #[test]
    fn test_default_label_uses_configured_parts() {
        let spec = PluginSpec::new("default")
            .with_param("separator", "-")
            .with_param("prefix", "rel");
        let inc = DefaultLabelIncrementer::from_spec(&spec);
        assert_eq!(inc.default_label(), "rel-1");
        assert!(inc.is_valid_label(&inc.default_label()));
    }
}
