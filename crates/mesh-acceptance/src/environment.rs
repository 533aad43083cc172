//! Per-run test environment.
//!
//! A [`TestEnvironment`] owns the working directory of one run and the
//! namespace everything is deployed into. The directory is a [`TempDir`], so
//! it is removed on drop unless [`TestEnvironment::keep`] persists it.

use crate::errors::HarnessError;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};
use uuid::Uuid;

/// Prefix of generated namespaces and working directories.
pub const RUN_PREFIX: &str = "mesh-e2e-";

/// Placeholder values substituted into rendered templates.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub namespace: String,
    pub hub: String,
    pub tag: String,
}

impl TemplateVars {
    /// Substitute `{{NAMESPACE}}`, `{{HUB}}` and `{{TAG}}`. Other
    /// placeholders are left untouched.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{{NAMESPACE}}", &self.namespace)
            .replace("{{HUB}}", &self.hub)
            .replace("{{TAG}}", &self.tag)
    }
}

pub struct TestEnvironment {
    namespace: String,
    workdir: TempDir,
}

impl TestEnvironment {
    /// Create the working directory and its sub-directories.
    ///
    /// `namespace` is used as given; when `None` a fresh one is generated.
    pub fn create(namespace: Option<String>) -> Result<Self, HarnessError> {
        let workdir = tempfile::Builder::new()
            .prefix(RUN_PREFIX)
            .tempdir()
            .map_err(|e| HarnessError::io(std::env::temp_dir(), e))?;

        let env = Self {
            namespace: namespace.unwrap_or_else(generate_namespace),
            workdir,
        };

        for dir in [env.control_plane_dir(), env.app_dir(), env.rules_dir()] {
            fs::create_dir_all(&dir).map_err(|e| HarnessError::io(&dir, e))?;
        }

        info!(
            namespace = %env.namespace,
            workdir = %env.root().display(),
            "Test environment created"
        );
        Ok(env)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn root(&self) -> &Path {
        self.workdir.path()
    }

    pub fn control_plane_dir(&self) -> PathBuf {
        self.root().join("control-plane")
    }

    pub fn app_dir(&self) -> PathBuf {
        self.root().join("app")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.root().join("rules")
    }

    /// Persist the working directory past the end of the run.
    pub fn keep(self) -> PathBuf {
        self.workdir.keep()
    }

    /// Remove the working directory now, reporting failures.
    pub fn remove(self) -> Result<(), HarnessError> {
        let path = self.root().to_path_buf();
        self.workdir.close().map_err(|e| HarnessError::io(path, e))
    }
}

/// Generate a namespace of the form `mesh-e2e-<8 hex chars>`.
pub fn generate_namespace() -> String {
    let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{RUN_PREFIX}{id}")
}

/// Render every `*.yaml`/`*.yml` file of `source` into `target`.
///
/// Files are processed in name order so the apply order is stable. A missing
/// or manifest-free template directory is an error.
pub fn render_templates(
    source: &Path,
    target: &Path,
    vars: &TemplateVars,
) -> Result<Vec<PathBuf>, HarnessError> {
    let entries = fs::read_dir(source).map_err(|e| HarnessError::Template {
        path: source.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut templates = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| HarnessError::io(source, e))?.path();
        if path.is_file() && is_manifest(&path) {
            templates.push(path);
        }
    }
    templates.sort();

    if templates.is_empty() {
        return Err(HarnessError::Template {
            path: source.to_path_buf(),
            message: "no *.yaml or *.yml templates found".to_string(),
        });
    }

    let mut rendered = Vec::with_capacity(templates.len());
    for template in templates {
        let contents =
            fs::read_to_string(&template).map_err(|e| HarnessError::io(&template, e))?;
        let Some(name) = template.file_name() else {
            continue;
        };
        let out = target.join(name);
        fs::write(&out, vars.render(&contents)).map_err(|e| HarnessError::io(&out, e))?;
        debug!(template = %template.display(), rendered = %out.display(), "Rendered template");
        rendered.push(out);
    }

    Ok(rendered)
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::validate_namespace;

    fn vars() -> TemplateVars {
        TemplateVars {
            namespace: "mesh-e2e-test".to_string(),
            hub: "registry.local/mesh".to_string(),
            tag: "0.2.4".to_string(),
        }
    }

    #[test]
    fn test_generated_namespace_is_valid() {
        let ns = generate_namespace();
        assert!(ns.starts_with(RUN_PREFIX));
        assert_eq!(ns.len(), RUN_PREFIX.len() + 8);
        assert!(validate_namespace(&ns).is_ok());
        assert_ne!(ns, generate_namespace());
    }

    #[test]
    fn test_render_substitutes_known_placeholders_only() {
        let out = vars().render("image: {{HUB}}/pilot:{{TAG}}\nnamespace: {{NAMESPACE}}\n{{OTHER}}");
        assert_eq!(
            out,
            "image: registry.local/mesh/pilot:0.2.4\nnamespace: mesh-e2e-test\n{{OTHER}}"
        );
    }

    #[test]
    fn test_create_lays_out_directories() {
        let env = TestEnvironment::create(Some("given-ns".to_string())).unwrap();

        assert_eq!(env.namespace(), "given-ns");
        assert!(env.control_plane_dir().is_dir());
        assert!(env.app_dir().is_dir());
        assert!(env.rules_dir().is_dir());
    }

    #[test]
    fn test_drop_removes_workdir_and_keep_persists_it() {
        let env = TestEnvironment::create(None).unwrap();
        let dropped_root = env.root().to_path_buf();
        drop(env);
        assert!(!dropped_root.exists());

        let env = TestEnvironment::create(None).unwrap();
        let kept = env.keep();
        assert!(kept.is_dir());
        fs::remove_dir_all(kept).unwrap();
    }

    #[test]
    fn test_remove_deletes_workdir() {
        let env = TestEnvironment::create(None).unwrap();
        let root = env.root().to_path_buf();
        env.remove().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_render_templates_in_name_order() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::write(source.path().join("b-app.yaml"), "ns: {{NAMESPACE}}").unwrap();
        fs::write(source.path().join("a-crd.yml"), "tag: {{TAG}}").unwrap();
        fs::write(source.path().join("README.md"), "ignored").unwrap();

        let rendered = render_templates(source.path(), target.path(), &vars()).unwrap();

        let names: Vec<_> = rendered
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a-crd.yml", "b-app.yaml"]);
        assert_eq!(
            fs::read_to_string(target.path().join("b-app.yaml")).unwrap(),
            "ns: mesh-e2e-test"
        );
        assert!(!target.path().join("README.md").exists());
    }

    #[test]
    fn test_render_templates_missing_dir_is_error() {
        let target = tempfile::tempdir().unwrap();
        let result = render_templates(Path::new("/nonexistent/templates"), target.path(), &vars());
        assert!(matches!(result, Err(HarnessError::Template { .. })));
    }

    #[test]
    fn test_render_templates_empty_dir_is_error() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let result = render_templates(source.path(), target.path(), &vars());
        assert!(
            matches!(result, Err(HarnessError::Template { message, .. }) if message.contains("no *.yaml"))
        );
    }
}
