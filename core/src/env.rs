//! Environment variable substitution and per-session environment
//! materialization.
//!
//! Commands carry an ordered list of directives. `Required` and `Optional`
//! directives are satisfied by the caller when it has the variable set;
//! `Inherited` directives are satisfied on the server side and deliberately
//! ignore anything the caller sent. Order matters: a directive's default
//! may reference variables established by earlier directives.

use std::collections::HashMap;

use tracing::debug;
use tracing::warn;

use crate::config::DirectiveKind;
use crate::config::EnvDirective;

/// Snapshot of the current process environment, used as the fallback for
/// substitutions and inherited directives.
pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Substitutes `${NAME}` and `${NAME:-fallback}` references.
///
/// `overrides` win over `env`. An undefined reference without a fallback
/// substitutes an empty string and logs a warning; a reference that never
/// closes is copied through verbatim.
pub fn substitute(
    input: &str,
    overrides: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> String {
    let lookup = |name: &str| -> Option<&String> { overrides.get(name).or_else(|| env.get(name)) };

    let bytes = input.as_bytes();
    let mut result = String::with_capacity(input.len());
    let mut at = 0;

    while let Some(dollar) = input[at..].find("${").map(|p| p + at) {
        result.push_str(&input[at..dollar]);

        let name_start = dollar + 2;
        let mut end = name_start;
        while end < bytes.len() && is_name_byte(bytes[end]) {
            end += 1;
        }

        if end < bytes.len() && bytes[end] == b'}' {
            let name = &input[name_start..end];
            match lookup(name) {
                Some(value) => result.push_str(value),
                None => warn!(
                    "environment variable \"{name}\" is not defined, substituting an empty string"
                ),
            }
            at = end + 1;
        } else if bytes.get(end) == Some(&b':') && bytes.get(end + 1) == Some(&b'-') {
            let name = &input[name_start..end];
            match input[end + 2..].find('}') {
                Some(close) => {
                    let fallback = &input[end + 2..end + 2 + close];
                    match lookup(name) {
                        Some(value) => result.push_str(value),
                        None => result.push_str(fallback),
                    }
                    at = end + 2 + close + 1;
                }
                None => {
                    // Unterminated reference, keep the raw text.
                    result.push_str(&input[dollar..]);
                    return result;
                }
            }
        } else {
            // Not a well-formed reference, keep the raw text up to here and
            // continue scanning after the `${`.
            result.push_str(&input[dollar..name_start]);
            at = name_start;
        }
    }

    result.push_str(&input[at..]);
    result
}

fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.' || byte == b'-'
}

/// Materializes the child environment from the command's directives and the
/// variables the caller sent during the prelude.
///
/// Returns `NAME=VALUE` pairs in directive order; each name appears at most
/// once, and directives that resolve to no value are omitted.
pub fn resolve_environment(
    directives: &[EnvDirective],
    received: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> Vec<(String, String)> {
    // Accumulate values in directive order; later directives may reference
    // earlier ones through their defaults.
    let mut resolved: HashMap<String, Option<String>> = HashMap::new();
    let mut defined: HashMap<String, String> = HashMap::new();

    for directive in directives {
        let value = match directive.kind {
            // Inherited variables take their value from this process (or
            // the expanded default); a caller-sent value is ignored.
            DirectiveKind::Inherited => {
                if received.contains_key(&directive.name) {
                    debug!(
                        "ignoring caller value for inherited variable \"{}\"",
                        directive.name
                    );
                }
                if directive.default.is_empty() {
                    env.get(&directive.name).cloned()
                } else {
                    Some(substitute(&directive.default, &defined, env))
                }
            }
            DirectiveKind::Optional => match received.get(&directive.name) {
                Some(value) => Some(value.clone()),
                None if directive.default.is_empty() => defined
                    .get(&directive.name)
                    .or_else(|| env.get(&directive.name))
                    .cloned(),
                None => Some(substitute(&directive.default, &defined, env)),
            },
            DirectiveKind::Required => match received.get(&directive.name) {
                Some(value) => Some(value.clone()),
                None => Some(substitute(&directive.default, &defined, env)),
            },
        };

        if let Some(value) = &value {
            defined.insert(directive.name.clone(), value.clone());
        }
        resolved.insert(directive.name.clone(), value);
    }

    // Emit in directive order, one entry per name.
    let mut environment = Vec::with_capacity(directives.len());
    for directive in directives {
        if let Some(Some(value)) = resolved.remove(&directive.name) {
            environment.push((directive.name.clone(), value));
        }
    }

    environment
}
