//! The app registry: patterns mapped to commands, resolved from a requested
//! app name (or SSH username). A pattern may carry `{name}` placeholders,
//! each matching a non-slash span; captures are appended to the command,
//! shell-quoted, and exported to the app as `WHISP_PARAM_<NAME>`.

use log::debug;
use regex::Regex;

/// One registered pattern.
#[derive(Debug, Clone)]
struct AppPattern {
    pattern: String,
    command: String,
    /// Compiled only for parameterized patterns.
    regex: Option<Regex>,
    param_names: Vec<String>,
}

/// Name → command mapping, scanned in insertion order.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: Vec<AppPattern>,
}

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApp {
    /// The pattern that matched, e.g. `chat-{room}`.
    pub pattern: String,
    /// The registered command, without parameters.
    pub command: String,
    /// Captured parameters in capture order.
    pub params: Vec<(String, String)>,
}

impl ResolvedApp {
    /// The full command line: the registered command with every captured
    /// parameter appended, shell-quoted, in capture order.
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for (_, value) in &self.params {
            line.push(' ');
            line.push_str(&shell_quote(value));
        }
        line
    }
}

impl AppRegistry {
    pub fn new() -> Self {
        AppRegistry::default()
    }

    /// Register `pattern` to launch `command`. Patterns are tried in
    /// registration order; the name `default` is the fallback app.
    pub fn register(&mut self, pattern: impl Into<String>, command: impl Into<String>) {
        let pattern = pattern.into();
        let (regex, param_names) = compile_pattern(&pattern);
        self.apps.push(AppPattern {
            pattern,
            command: command.into(),
            regex,
            param_names,
        });
    }

    /// Whether `name` resolves to anything (used for username routing).
    pub fn matches(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Resolve a requested name: exact pattern match first, then the first
    /// parameterized pattern that matches, then `default`.
    pub fn resolve(&self, name: &str) -> Option<ResolvedApp> {
        if let Some(resolved) = self.lookup(name) {
            return Some(resolved);
        }
        debug!("no app matches {:?}, falling back to default", name);
        self.lookup("default")
    }

    fn lookup(&self, name: &str) -> Option<ResolvedApp> {
        if let Some(app) = self.apps.iter().find(|a| a.pattern == name) {
            return Some(ResolvedApp {
                pattern: app.pattern.clone(),
                command: app.command.clone(),
                params: Vec::new(),
            });
        }
        for app in &self.apps {
            let Some(ref regex) = app.regex else {
                continue;
            };
            if let Some(captures) = regex.captures(name) {
                let params = app
                    .param_names
                    .iter()
                    .enumerate()
                    .filter_map(|(i, param)| {
                        captures
                            .get(i + 1)
                            .map(|m| (param.clone(), m.as_str().to_string()))
                    })
                    .collect();
                return Some(ResolvedApp {
                    pattern: app.pattern.clone(),
                    command: app.command.clone(),
                    params,
                });
            }
        }
        None
    }
}

/// Compile a `{name}`-style pattern into an anchored regex where each
/// placeholder captures a non-slash span. Literal-only patterns stay
/// uncompiled and match by equality.
#[allow(clippy::indexing_slicing)] // offsets come from find() on the same str
fn compile_pattern(pattern: &str) -> (Option<Regex>, Vec<String>) {
    if !pattern.contains('{') {
        return (None, Vec::new());
    }
    let mut regex = String::from("^");
    let mut params = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        regex.push_str(&regex::escape(literal));
        match tail[1..].find('}') {
            Some(close) => {
                let param = &tail[1..1 + close];
                params.push(param.to_string());
                regex.push_str("([^/]+)");
                rest = &tail[close + 2..];
            }
            None => {
                // Unbalanced brace, treat the rest literally.
                regex.push_str(&regex::escape(tail));
                rest = "";
            }
        }
    }
    regex.push_str(&regex::escape(rest));
    regex.push('$');
    (Regex::new(&regex).ok(), params)
}

/// Single-quote `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// The environment variable a captured parameter is exported under.
pub(crate) fn param_env_name(param: &str) -> String {
    format!("WHISP_PARAM_{}", param.to_uppercase().replace('-', "_"))
}
