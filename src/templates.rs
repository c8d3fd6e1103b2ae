//! Embedded templates rendered into working directories.

use std::collections::HashMap;
use std::path::Path;

use tera::Tera;

use crate::error::{BootstrapError, Result};

const CERT_CA_CNF: &str = r#"[ca]
default_ca = CA_default

[CA_default]
new_certs_dir = ./new_certs
database = index.txt
serial = serial.dat
private_key = ca.key.pem
certificate = ca.cert.pem
policy = policy_catapult
default_md = sha256
default_days = 7300

[policy_catapult]
commonName = supplied

[req]
prompt = no
distinguished_name = dn
default_md = sha256

[dn]
CN = {{ name }}-account
"#;

const CERT_NODE_CNF: &str = r#"[req]
prompt = no
distinguished_name = dn
default_md = sha256

[dn]
CN = {{ name }}-node
"#;

/// Templates compiled into the binary. Names are paths relative to the
/// template root so they stay stable across renders.
pub const ALL_TEMPLATES: &[(&str, &str)] = &[
    ("cert/ca.cnf", CERT_CA_CNF),
    ("cert/node.cnf", CERT_NODE_CNF),
];

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Build a renderer over the embedded template set.
    pub fn from_embedded() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(ALL_TEMPLATES.to_vec())
            .map_err(|e| BootstrapError::Template(format!("Failed to load templates: {}", e)))?;
        Ok(Self { tera })
    }

    pub fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let mut context = tera::Context::new();
        for (key, value) in vars {
            context.insert(key, value);
        }
        self.tera
            .render(name, &context)
            .map_err(|e| BootstrapError::Template(format!("Failed to render {}: {}", name, e)))
    }

    pub fn render_to_file(
        &self,
        name: &str,
        vars: &HashMap<String, String>,
        target: &Path,
    ) -> Result<()> {
        let rendered = self.render(name, vars)?;
        tracing::debug!("[TemplateRenderer] Writing {} to {:?}", name, target);
        std::fs::write(target, rendered)?;
        Ok(())
    }
}
