//! `${VAR}` placeholder substitution for config strings and skill templates.

/// Replace `${ENV_VAR}` placeholders using the process environment.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Replace `${VAR}` placeholders using a custom lookup function.
///
/// Skill template rendering uses this with the refreshed secrets map so the
/// process environment is never consulted (or mutated) on that path.
pub fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(val) => out.push_str(&val),
                    // Leave unresolved placeholder as-is.
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after[end + 1..];
            },
            // Malformed (`${}` or unclosed): emit the rest literally.
            _ => {
                out.push_str("${");
                rest = after;
            },
        }
    }

    out.push_str(rest);
    out
}
