//! Layered variable resolution.
//!
//! Scopes stack as predefined > global > stage > job > rule-injected, with
//! later layers overriding earlier ones by key. Values may reference other
//! variables with `$NAME` or `${NAME}`; references are expanded in a single
//! fixed-point pass over the merged map. Resolution is a pure function of
//! the scopes; cyclic references fail with a configuration error.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// Compiled once; the pattern is a literal and cannot fail.
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// The variable scopes visible to one job.
#[derive(Debug, Clone, Default)]
pub struct VariableScopes {
    /// Engine-provided context variables (CI_COMMIT_REF_NAME etc.) plus
    /// secrets admitted for this ref.
    pub predefined: HashMap<String, String>,
    /// Pipeline-level `variables:` block.
    pub global: HashMap<String, String>,
    /// Stage-level overrides for the job's stage.
    pub stage: HashMap<String, String>,
    /// Job-level `variables:` block.
    pub job: HashMap<String, String>,
    /// Variables injected by the matched rule.
    pub rule: HashMap<String, String>,
}

impl VariableScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten the scopes and expand inter-variable references.
    pub fn resolve(&self) -> Result<HashMap<String, String>> {
        let mut merged: HashMap<String, String> = HashMap::new();
        for layer in [
            &self.predefined,
            &self.global,
            &self.stage,
            &self.job,
            &self.rule,
        ] {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }

        let mut resolved: HashMap<String, String> = HashMap::new();
        for key in merged.keys() {
            if !resolved.contains_key(key) {
                let mut stack = Vec::new();
                expand(key, &merged, &mut resolved, &mut stack)?;
            }
        }

        Ok(resolved)
    }
}

/// Expand a single string against an already-resolved variable map.
/// Unknown references are left as written.
pub fn interpolate(input: &str, variables: &HashMap<String, String>) -> String {
    REFERENCE.replace_all(input, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        variables
            .get(name)
            .cloned()
            .unwrap_or_else(|| caps.get(0).map_or("", |m| m.as_str()).to_string())
    })
    .to_string()
}

fn expand(
    key: &str,
    merged: &HashMap<String, String>,
    resolved: &mut HashMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String> {
    if let Some(value) = resolved.get(key) {
        return Ok(value.clone());
    }
    if stack.iter().any(|k| k == key) {
        stack.push(key.to_string());
        return Err(Error::Configuration(format!(
            "cyclic variable reference: {}",
            stack.join(" -> ")
        )));
    }

    let raw = match merged.get(key) {
        Some(v) => v.clone(),
        // Reference to a variable that does not exist: keep it literal.
        None => return Ok(format!("${{{}}}", key)),
    };

    stack.push(key.to_string());

    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(&raw) {
        let Some(m) = caps.get(0) else { continue };
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |c| c.as_str());
        out.push_str(&raw[last..m.start()]);
        if merged.contains_key(name) {
            out.push_str(&expand(name, merged, resolved, stack)?);
        } else {
            out.push_str(m.as_str());
        }
        last = m.end();
    }
    out.push_str(&raw[last..]);

    stack.pop();
    resolved.insert(key.to_string(), out.clone());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_later_layers_override() {
        let scopes = VariableScopes {
            predefined: map(&[("LEVEL", "predefined")]),
            global: map(&[("LEVEL", "global"), ("G", "g")]),
            job: map(&[("LEVEL", "job")]),
            ..Default::default()
        };
        let vars = scopes.resolve().unwrap();
        assert_eq!(vars["LEVEL"], "job");
        assert_eq!(vars["G"], "g");
    }

    #[test]
    fn test_nested_reference_expansion() {
        let scopes = VariableScopes {
            global: map(&[
                ("IMAGE", "registry.example.com/${PROJECT}:${TAG}"),
                ("PROJECT", "gantry"),
                ("TAG", "v$VERSION"),
                ("VERSION", "1.2.3"),
            ]),
            ..Default::default()
        };
        let vars = scopes.resolve().unwrap();
        assert_eq!(vars["IMAGE"], "registry.example.com/gantry:v1.2.3");
    }

    #[test]
    fn test_unknown_reference_left_literal() {
        let scopes = VariableScopes {
            global: map(&[("CMD", "echo $UNDEFINED")]),
            ..Default::default()
        };
        let vars = scopes.resolve().unwrap();
        assert_eq!(vars["CMD"], "echo $UNDEFINED");
    }

    #[test]
    fn test_cycle_is_configuration_error() {
        let scopes = VariableScopes {
            global: map(&[("A", "$B"), ("B", "$C"), ("C", "$A")]),
            ..Default::default()
        };
        let err = scopes.resolve().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("cyclic variable reference"));
    }

    #[test]
    fn test_self_reference_is_configuration_error() {
        let scopes = VariableScopes {
            global: map(&[("PATH_EXT", "$PATH_EXT:/usr/local/bin")]),
            ..Default::default()
        };
        assert!(scopes.resolve().is_err());
    }

    #[test]
    fn test_resolution_is_pure() {
        let scopes = VariableScopes {
            global: map(&[("A", "$B"), ("B", "x")]),
            ..Default::default()
        };
        assert_eq!(scopes.resolve().unwrap(), scopes.resolve().unwrap());
    }

    #[test]
    fn test_interpolate_string() {
        let vars = map(&[("NAME", "world")]);
        assert_eq!(interpolate("hello ${NAME}", &vars), "hello world");
        assert_eq!(interpolate("hello $NAME", &vars), "hello world");
        assert_eq!(interpolate("hello $OTHER", &vars), "hello $OTHER");
    }
}
