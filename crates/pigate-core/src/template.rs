//! `{{KEY}}` templates and the built-in template set.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{Settings, SECRET_KEYS};
use crate::error::TemplateError;
use crate::install::{install_file, RenderOutcome, PUBLIC_MODE, SECRET_MODE};

/// The templates pigate ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateName {
    HostapdConf,
    DnsmasqConf,
    DhcpcdStatic,
    HostapdDefault,
    SysctlForwarding,
    RulesV4,
}

impl TemplateName {
    pub const ALL: [TemplateName; 6] = [
        TemplateName::HostapdConf,
        TemplateName::DnsmasqConf,
        TemplateName::DhcpcdStatic,
        TemplateName::HostapdDefault,
        TemplateName::SysctlForwarding,
        TemplateName::RulesV4,
    ];

    /// File name used when looking for an override.
    pub fn file_name(&self) -> &'static str {
        match self {
            TemplateName::HostapdConf => "hostapd.conf.tmpl",
            TemplateName::DnsmasqConf => "dnsmasq.conf.tmpl",
            TemplateName::DhcpcdStatic => "dhcpcd-static.tmpl",
            TemplateName::HostapdDefault => "hostapd-default.tmpl",
            TemplateName::SysctlForwarding => "sysctl-forwarding.tmpl",
            TemplateName::RulesV4 => "rules.v4.tmpl",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            TemplateName::HostapdConf => include_str!("../templates/hostapd.conf.tmpl"),
            TemplateName::DnsmasqConf => include_str!("../templates/dnsmasq.conf.tmpl"),
            TemplateName::DhcpcdStatic => include_str!("../templates/dhcpcd-static.tmpl"),
            TemplateName::HostapdDefault => include_str!("../templates/hostapd-default.tmpl"),
            TemplateName::SysctlForwarding => include_str!("../templates/sysctl-forwarding.tmpl"),
            TemplateName::RulesV4 => include_str!("../templates/rules.v4.tmpl"),
        }
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Where templates come from: built-ins, optionally overridden per file
/// from a directory.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    override_dir: Option<PathBuf>,
}

impl TemplateSet {
    pub fn builtin() -> Self {
        Self::default()
    }

    pub fn with_overrides(dir: impl Into<PathBuf>) -> Self {
        Self {
            override_dir: Some(dir.into()),
        }
    }

    pub fn get(&self, name: TemplateName) -> Result<Template, TemplateError> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(name.file_name());
            if path.is_file() {
                tracing::debug!(template = %name, path = %path.display(), "Using template override");
                return Template::load(&path);
            }
        }
        Ok(Template::new(name.file_name(), name.builtin()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Key(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    source: String,
}

impl Template {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path)
            .map_err(|_| TemplateError::NotFound(path.to_path_buf()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, source })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn segments(&self) -> Result<Vec<Segment>, TemplateError> {
        let mut segments = Vec::new();

        for (idx, line) in self.source.split_inclusive('\n').enumerate() {
            let mut rest = line;
            while let Some(open) = rest.find("{{") {
                segments.push(Segment::Text(rest[..open].to_string()));
                let after = &rest[open + 2..];
                let close = after.find("}}").ok_or_else(|| self.malformed(idx + 1))?;
                let key = after[..close].trim();
                if key.is_empty()
                    || !key
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(self.malformed(idx + 1));
                }
                segments.push(Segment::Key(key.to_string()));
                rest = &after[close + 2..];
            }
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(segments)
    }

    fn malformed(&self, line: usize) -> TemplateError {
        TemplateError::MalformedPlaceholder {
            template: self.name.clone(),
            line,
        }
    }

    /// Keys referenced by this template, in first-use order.
    pub fn keys(&self) -> Result<Vec<String>, TemplateError> {
        let mut keys: Vec<String> = Vec::new();
        for segment in self.segments()? {
            if let Segment::Key(key) = segment {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Whether rendering would embed a secret value.
    pub fn references_secret(&self) -> Result<bool, TemplateError> {
        Ok(self
            .keys()?
            .iter()
            .any(|key| SECRET_KEYS.contains(&key.as_str())))
    }

    /// Substitute every placeholder.
    ///
    /// All keys missing from `settings` are reported together; nothing is
    /// ever substituted with an empty string.
    pub fn render(&self, settings: &Settings) -> Result<String, TemplateError> {
        let segments = self.segments()?;

        let mut unresolved: Vec<String> = Vec::new();
        for segment in &segments {
            if let Segment::Key(key) = segment {
                if settings.get(key).is_none() && !unresolved.contains(key) {
                    unresolved.push(key.clone());
                }
            }
        }
        if !unresolved.is_empty() {
            return Err(TemplateError::Unresolved {
                template: self.name.clone(),
                keys: unresolved,
            });
        }

        let mut out = String::with_capacity(self.source.len());
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(&text),
                Segment::Key(key) => out.push_str(settings.get(&key).unwrap_or_default()),
            }
        }
        Ok(out)
    }

    /// Render and atomically install at `dest`, 0600 if a secret is embedded.
    pub fn install(&self, dest: &Path, settings: &Settings) -> Result<RenderOutcome, TemplateError> {
        let content = self.render(settings)?;
        let mode = if self.references_secret()? {
            SECRET_MODE
        } else {
            PUBLIC_MODE
        };
        install_file(dest, &content, mode)
    }
}

/// Render the template file at `template_path` into `dest`.
pub fn render(
    template_path: &Path,
    dest: &Path,
    settings: &Settings,
) -> Result<RenderOutcome, TemplateError> {
    Template::load(template_path)?.install(dest, settings)
}
