use std::sync::OnceLock;

use regex::Regex;

/// Expand `${VAR}` and `${VAR:default}` placeholders in a string
///
/// Expansion happens against the process environment at spawn time, not at
/// config load. A missing variable with no default expands to the empty
/// string and logs a warning, matching the documented config contract.
pub fn expand_vars(input: &str) -> String {
    fn re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        // Group 1: the variable name. Group 2: optional default after `:`.
        RE.get_or_init(|| {
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("must be valid regex")
        })
    }

    let mut output = String::with_capacity(input.len());
    let mut last_end = 0;

    for captures in re().captures_iter(input) {
        let overall = captures.get(0).expect("capture 0 always present");
        let var_name = captures.get(1).expect("group 1 always present").as_str();
        let default_value = captures.get(2).map(|m| m.as_str());

        output.push_str(&input[last_end..overall.start()]);

        match std::env::var(var_name) {
            Ok(value) => output.push_str(&value),
            Err(_) => match default_value {
                Some(default) => output.push_str(default),
                None => {
                    tracing::warn!(
                        variable = var_name,
                        "environment variable not set and no default given, expanding to empty"
                    );
                }
            },
        }

        last_end = overall.end();
    }

    output.push_str(&input[last_end..]);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(expand_vars("no placeholders here"), "no placeholders here");
    }

    #[test]
    fn set_variable_expands() {
        temp_env::with_var("BRIDGE_TEST_VAR", Some("hello"), || {
            assert_eq!(expand_vars("token=${BRIDGE_TEST_VAR}"), "token=hello");
        });
    }

    #[test]
    fn missing_variable_expands_to_empty() {
        temp_env::with_var_unset("BRIDGE_MISSING_VAR", || {
            assert_eq!(expand_vars("token=${BRIDGE_MISSING_VAR}"), "token=");
        });
    }

    #[test]
    fn default_used_when_missing() {
        temp_env::with_var_unset("BRIDGE_MISSING_VAR", || {
            assert_eq!(expand_vars("${BRIDGE_MISSING_VAR:false}"), "false");
        });
    }

    #[test]
    fn default_ignored_when_set() {
        temp_env::with_var("BRIDGE_TEST_VAR", Some("actual"), || {
            assert_eq!(expand_vars("${BRIDGE_TEST_VAR:fallback}"), "actual");
        });
    }

    #[test]
    fn multiple_placeholders_in_one_value() {
        let vars = [("BRIDGE_A", Some("1")), ("BRIDGE_B", Some("2"))];
        temp_env::with_vars(vars, || {
            assert_eq!(expand_vars("${BRIDGE_A}:${BRIDGE_B}:${BRIDGE_C:3}"), "1:2:3");
        });
    }

    #[test]
    fn empty_default_is_allowed() {
        temp_env::with_var_unset("BRIDGE_MISSING_VAR", || {
            assert_eq!(expand_vars("[${BRIDGE_MISSING_VAR:}]"), "[]");
        });
    }
}
