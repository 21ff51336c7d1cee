//! Template rendering for parametric upstreams.
//!
//! Template servers carry `{{a.b.c}}` placeholders in their string fields,
//! filled from a per-session context at connect time. Only substring
//! substitution over dotted paths is supported; a missing path renders as
//! the empty string. Rendering is pure, so the gateway can key connections
//! by a hash of the rendered params and share them across sessions.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::config::params::ServerParams;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap();
}

/// Per-session context values for template rendering: project path, user,
/// session id, environment, whatever else the session supplied at connect
/// time.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: Value,
}

impl TemplateContext {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Look up a dotted path (`project.path`) in the context. Non-string
    /// leaves are rendered through their JSON form; objects and arrays are
    /// treated as missing.
    pub fn lookup(&self, path: &str) -> Option<String> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        match current {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Replace every `{{path}}` placeholder in `input`.
    pub fn render_str(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &regex::Captures<'_>| {
                self.lookup(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }

    /// Render every string field of a template's params. The `name` is left
    /// untouched: sessions always see the template under its configured
    /// name, never a per-rendering alias.
    pub fn render_params(&self, params: &ServerParams) -> ServerParams {
        let mut rendered = params.clone();
        rendered.command = params.command.as_deref().map(|c| self.render_str(c));
        rendered.args = params.args.iter().map(|a| self.render_str(a)).collect();
        rendered.env = params
            .env
            .iter()
            .map(|(k, v)| (k.clone(), self.render_str(v)))
            .collect::<BTreeMap<_, _>>();
        rendered.cwd = params.cwd.as_deref().map(|c| self.render_str(c));
        rendered.url = params.url.as_deref().map(|u| self.render_str(u));
        rendered.headers = params
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), self.render_str(v)))
            .collect::<BTreeMap<_, _>>();
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    use crate::config::params::TransportKind;

    fn template(args: Vec<&str>) -> ServerParams {
        ServerParams {
            name: "t".into(),
            kind: TransportKind::Stdio,
            command: Some("run-server".into()),
            args: args.into_iter().map(String::from).collect(),
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            tags: BTreeSet::new(),
            disabled: false,
            oauth: None,
            template: true,
        }
    }

    #[test]
    fn dotted_path_lookup() {
        let ctx = TemplateContext::new(json!({
            "project": {"path": "/work/app"},
            "user": "dev",
            "port": 8080
        }));
        assert_eq!(ctx.lookup("project.path").as_deref(), Some("/work/app"));
        assert_eq!(ctx.lookup("user").as_deref(), Some("dev"));
        assert_eq!(ctx.lookup("port").as_deref(), Some("8080"));
        assert_eq!(ctx.lookup("project.missing"), None);
        assert_eq!(ctx.lookup("project"), None);
    }

    #[test]
    fn missing_path_renders_empty() {
        let ctx = TemplateContext::new(json!({}));
        assert_eq!(ctx.render_str("--project={{project.path}}"), "--project=");
    }

    #[test]
    fn renders_args_and_keeps_name() {
        let ctx = TemplateContext::new(json!({"project": {"path": "/p1"}}));
        let params = template(vec!["--project", "{{project.path}}"]);
        let rendered = ctx.render_params(&params);
        assert_eq!(rendered.args, vec!["--project", "/p1"]);
        assert_eq!(rendered.name, "t");
    }

    #[test]
    fn identical_contexts_render_identically() {
        let params = template(vec!["{{ project.path }}"]);
        let a = TemplateContext::new(json!({"project": {"path": "/p1"}})).render_params(&params);
        let b = TemplateContext::new(json!({"project": {"path": "/p1"}})).render_params(&params);
        let c = TemplateContext::new(json!({"project": {"path": "/p2"}})).render_params(&params);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.canonical_json(), b.canonical_json());
    }
}
