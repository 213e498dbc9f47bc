// `${{ ... }}` interpolation and `if` gates
// Interpolation is pure text substitution against the scope chain.
// Gates are not parsed here at all: the interpolated expression is
// handed to the selected shell and its exit status is the verdict.

use regex::Regex;

use std::sync::LazyLock;

use crate::error::StepError;
use crate::runners::{Backend, ExecRequest};

static EXPR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([A-Za-z_.][A-Za-z0-9_.\-]*)\s*\}\}").expect("hard-coded pattern")
});

/// Substituted values may themselves contain references; expansion
/// loops until the text is stable, bounded by this depth.
const MAX_EXPANSION_DEPTH: usize = 10;

/// Name lookup against the layered scopes. Resolvers cross task
/// boundaries inside spawned job instances, hence the bounds.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

impl Resolver for std::collections::HashMap<String, String> {
    fn resolve(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Replace every `${{ name }}` in `text` with its resolved value.
///
/// A reference that resolves to nothing is an error, not an empty
/// substitution.
pub fn interpolate(text: &str, scope: &dyn Resolver) -> Result<String, StepError> {
    let mut current = text.to_string();
    for _ in 0..MAX_EXPANSION_DEPTH {
        if !EXPR_RE.is_match(&current) {
            return Ok(current);
        }
        let mut expanded = String::with_capacity(current.len());
        let mut last = 0;
        for caps in EXPR_RE.captures_iter(&current) {
            let token = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            let name = &caps[1];
            let value = scope
                .resolve(name)
                .ok_or_else(|| StepError::UnresolvedVariable(name.to_string()))?;
            expanded.push_str(&current[last..token.0]);
            expanded.push_str(&value);
            last = token.1;
        }
        expanded.push_str(&current[last..]);
        current = expanded;
    }

    // Still unstable after the depth limit: self-referential values.
    match EXPR_RE.captures(&current) {
        Some(caps) => Err(StepError::UnresolvedVariable(caps[1].to_string())),
        None => Ok(current),
    }
}

/// Evaluate an `if` gate: interpolate, run it through the shell, exit
/// status zero means the gate is open.
pub async fn evaluate_gate(
    expression: &str,
    scope: &dyn Resolver,
    backend: &dyn Backend,
    shell: &str,
) -> Result<bool, StepError> {
    let script = interpolate(expression, scope)?;
    let output = backend.execute(&ExecRequest::new(script, shell)).await?;
    Ok(output.success())
}
