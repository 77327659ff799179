use anyhow::{Context, Result};
use regex::Regex;
use std::env;
use tracing::{debug, warn};

const PLACEHOLDER_PATTERN: &str = r"\$\{(\w+)\}";

/// Substitute environment variables written as `${VAR_NAME}`.
///
/// Unset variables keep their placeholder so the validator can report them.
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(PLACEHOLDER_PATTERN).context("invalid placeholder pattern")?;
    let mut missing_vars = Vec::new();

    let result = re.replace_all(content, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => {
                debug!("Substituting environment variable: {}", var_name);
                value
            }
            Err(_) => {
                warn!("Environment variable '{}' not set", var_name);
                missing_vars.push(var_name.to_string());
                caps[0].to_string()
            }
        }
    });

    if !missing_vars.is_empty() {
        debug!(
            "Environment variables not set (may use defaults or fail validation): {:?}",
            missing_vars
        );
    }

    Ok(result.into_owned())
}

/// Check if a string still contains an unresolved placeholder
pub fn has_unresolved_env_vars(content: &str) -> bool {
    Regex::new(PLACEHOLDER_PATTERN)
        .map(|re| re.is_match(content))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_set_variable() {
        env::set_var("DISPATCH_TEST_DB_HOST", "db.internal");
        let out = substitute_env_vars("host: ${DISPATCH_TEST_DB_HOST}\nport: 5432").unwrap();
        assert_eq!(out, "host: db.internal\nport: 5432");
    }

    #[test]
    fn test_keeps_unset_placeholder() {
        let out = substitute_env_vars("password: ${DISPATCH_TEST_SURELY_UNSET}").unwrap();
        assert_eq!(out, "password: ${DISPATCH_TEST_SURELY_UNSET}");
        assert!(has_unresolved_env_vars(&out));
    }

    #[test]
    fn test_plain_dollar_is_untouched() {
        let out = substitute_env_vars("note: costs $5").unwrap();
        assert_eq!(out, "note: costs $5");
        assert!(!has_unresolved_env_vars(&out));
    }
}
