//! Template engine over a read-only template tree
//!
//! Uses minijinja with strict undefined handling: referencing a field that
//! doesn't exist fails the render instead of printing an empty string.

use std::io::Write;

use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;
use tracing::debug;

use super::fs::TemplateFs;
use super::helpers;
use crate::{Error, Result};

/// Every file of a template tree, parsed and ready to render
///
/// Read-only after construction; rendering takes `&self` so one engine can
/// be shared between tasks.
pub struct TemplateEngine {
    env: Environment<'static>,
    names: Vec<String>,
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("names", &self.names)
            .finish()
    }
}

impl TemplateEngine {
    /// Load and parse every file below `prefix` in `fs`
    ///
    /// Template names are paths relative to `prefix`. A file that doesn't
    /// parse fails with `TemplateRender` naming it.
    pub fn new(fs: &dyn TemplateFs, prefix: &str) -> Result<Self> {
        Self::from_files(fs.files(prefix)?)
    }

    /// Build an engine from `(name, source)` pairs
    pub fn from_files(files: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_function("execute", helpers::execute);
        env.add_function("base64", helpers::base64);
        env.add_function("json", helpers::json);
        env.add_function("uuid", helpers::uuid);
        env.add_function("data", helpers::data);
        env.add_filter("base64", helpers::base64);
        env.add_filter("json", helpers::json);

        let mut names = Vec::new();
        for (name, source) in files {
            env.add_template_owned(name.clone(), source)
                .map_err(|e| Error::template_render(&name, format!("{:#}", e)))?;
            names.push(name);
        }
        names.sort();
        debug!(templates = names.len(), "Loaded templates");

        Ok(Self { env, names })
    }

    /// Names of all registered templates, sorted
    pub fn names(&self) -> Vec<String> {
        self.names.clone()
    }

    /// True if a template called `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// Render template `name` with `data` and return the output
    pub fn render<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> Result<String> {
        let template = self.env.get_template(name).map_err(|_| Error::TemplateNotFound {
            name: name.to_string(),
        })?;
        template
            .render(helpers::scope(Value::from_serialize(data)))
            .map_err(|e| helpers::convert_error(name, &e))
    }

    /// Render template `name` with `data` into `writer`
    pub fn execute<W, T>(&self, writer: &mut W, name: &str, data: &T) -> Result<()>
    where
        W: Write + ?Sized,
        T: Serialize + ?Sized,
    {
        let output = self.render(name, data)?;
        writer
            .write_all(output.as_bytes())
            .map_err(|e| Error::template_render(name, format!("failed to write output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MemoryFs;
    use serde_json::json;

    fn engine(files: &[(&str, &str)]) -> TemplateEngine {
        TemplateEngine::from_files(
            files
                .iter()
                .map(|(n, s)| (n.to_string(), s.to_string())),
        )
        .unwrap()
    }

    // =========================================================================
    // Story: helpers compose inside templates
    // =========================================================================

    #[test]
    fn story_base64_filter_and_function() {
        let e = engine(&[
            ("filter", r#"{{ "hi" | base64 }}"#),
            ("function", r#"{{ base64("hi") }}"#),
        ]);
        assert_eq!(e.render("filter", &()).unwrap(), "aGk=");
        assert_eq!(e.render("function", &()).unwrap(), "aGk=");
    }

    #[test]
    fn story_execute_renders_another_template() {
        let e = engine(&[
            ("outer", r#"{{ execute("inner", 42) }}"#),
            ("inner", "{{ this }}"),
        ]);
        assert_eq!(e.render("outer", &()).unwrap(), "42");
    }

    #[test]
    fn story_execute_chains_through_several_templates() {
        let e = engine(&[
            ("a", r#"a({{ execute("b", this) }})"#),
            ("b", r#"b({{ execute("c", this) }})"#),
            ("c", "{{ Name }}"),
        ]);
        assert_eq!(e.render("a", &json!({"Name": "sno"})).unwrap(), "a(b(sno))");
    }

    #[test]
    fn story_data_builds_a_mapping() {
        let e = engine(&[
            ("outer", r#"{{ execute("inner", data("a", 1, "b", 2)) }}"#),
            ("inner", "{{ a }}+{{ b }}"),
        ]);
        assert_eq!(e.render("outer", &()).unwrap(), "1+2");
    }

    #[test]
    fn story_base64_round_trip() {
        let e = engine(&[("t", r#"{{ this | base64 }}"#)]);
        let once = e.render("t", &"pull-secret").unwrap();
        assert_eq!(once, "cHVsbC1zZWNyZXQ=");
    }

    #[test]
    fn story_json_helper() {
        let e = engine(&[("t", r#"{{ json(this) }}"#)]);
        assert_eq!(e.render("t", &json!({"a": [1, 2]})).unwrap(), r#"{"a":[1,2]}"#);
    }

    // =========================================================================
    // Story: failures are typed
    // =========================================================================

    #[test]
    fn story_unknown_template_is_not_found() {
        let e = engine(&[("outer", r#"{{ execute("missing", 1) }}"#)]);
        assert!(matches!(
            e.render("nope", &()).unwrap_err(),
            Error::TemplateNotFound { .. }
        ));
        match e.render("outer", &()).unwrap_err() {
            Error::TemplateNotFound { name } => assert_eq!(name, "missing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn story_data_errors_surface_through_execute() {
        let e = engine(&[
            ("odd", r#"{{ data("a") }}"#),
            ("key", r#"{{ data(1, 2) }}"#),
            ("nested", r#"{{ execute("odd", 0) }}"#),
        ]);
        assert!(matches!(e.render("odd", &()).unwrap_err(), Error::TemplateArity { .. }));
        assert!(matches!(e.render("key", &()).unwrap_err(), Error::TemplateType { .. }));
        assert!(matches!(e.render("nested", &()).unwrap_err(), Error::TemplateArity { .. }));
    }

    #[test]
    fn story_undefined_field_fails_render() {
        let e = engine(&[("t", "{{ Cluster.Nope.Deeper }}")]);
        let err = e.render("t", &json!({"Cluster": {}})).unwrap_err();
        match err {
            Error::TemplateRender { template, .. } => assert_eq!(template, "t"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn story_syntax_error_names_the_file() {
        let err = TemplateEngine::from_files([("bad.yaml".to_string(), "{% if %}".to_string())])
            .unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }

    // =========================================================================
    // Loading from a tree
    // =========================================================================

    #[test]
    fn test_names_and_execute_to_writer() {
        let fs = MemoryFs::new()
            .with_file("objects/b.yaml", "kind: {{ kind }}")
            .with_file("objects/a.yaml", "a");
        let e = TemplateEngine::new(&fs, "objects").unwrap();
        assert_eq!(e.names(), vec!["a.yaml", "b.yaml"]);
        assert!(e.contains("b.yaml"));

        let mut out = Vec::new();
        e.execute(&mut out, "b.yaml", &json!({"kind": "Secret"})).unwrap();
        assert_eq!(out, b"kind: Secret");
    }

    #[test]
    fn test_loops_and_conditionals() {
        let e = engine(&[(
            "t",
            "{% for n in Nodes %}{% if n.Kind == 'ControlPlane' %}{{ n.Name }} {% endif %}{% endfor %}",
        )]);
        let data = json!({"Nodes": [
            {"Name": "master0", "Kind": "ControlPlane"},
            {"Name": "worker0", "Kind": "Worker"}
        ]});
        assert_eq!(e.render("t", &data).unwrap(), "master0 ");
    }
}
