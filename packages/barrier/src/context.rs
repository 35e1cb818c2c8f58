use readiness_shared_cell::Isolation;

use crate::config::ConfigError;

pub const DEFAULT_NAME: &str = "readiness";

/// State shared by every component of one barrier, built once by the caller and passed down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    isolation: Isolation,
    name: String,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Isolation::CrossThread)
    }
}

impl Context {
    #[must_use]
    pub fn new(isolation: Isolation) -> Self {
        Self {
            isolation,
            name: DEFAULT_NAME.to_string(),
        }
    }

    /// Reads `READINESS_CROSS_THREAD_ISOLATED` (`true`/`false`, `1`/`0`). Unset means isolated.
    ///
    /// # Errors
    ///
    /// * If the variable holds anything else
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// # Errors
    ///
    /// * If `READINESS_CROSS_THREAD_ISOLATED` holds an unrecognized value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = lookup("READINESS_CROSS_THREAD_ISOLATED");
        let isolation = match raw.as_deref().map(str::trim) {
            None | Some("1" | "true") => Isolation::CrossThread,
            Some("0" | "false") => Isolation::Unisolated,
            Some(value) => {
                return Err(ConfigError::InvalidValue {
                    name: "READINESS_CROSS_THREAD_ISOLATED",
                    value: value.to_string(),
                });
            }
        };
        Ok(Self::new(isolation))
    }

    /// Prefix used for worker thread names.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn isolation(&self) -> Isolation {
        self.isolation
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn isolation_from_lookup() {
        let isolated = Context::from_lookup(|_| None).unwrap();
        assert_eq!(isolated.isolation(), Isolation::CrossThread);

        let unisolated = Context::from_lookup(|_| Some("false".to_string())).unwrap();
        assert_eq!(unisolated.isolation(), Isolation::Unisolated);

        let padded = Context::from_lookup(|_| Some(" 0\n".to_string())).unwrap();
        assert_eq!(padded.isolation(), Isolation::Unisolated);

        assert!(Context::from_lookup(|_| Some("maybe".to_string())).is_err());
    }

    #[test_log::test]
    fn name_defaults_and_overrides() {
        assert_eq!(Context::default().name(), DEFAULT_NAME);
        assert_eq!(Context::default().with_name("demo").name(), "demo");
    }
}
