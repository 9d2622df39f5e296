use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::error::ManifestError;
use crate::module::{InstallSpec, Module, RunAs, Step, VerifiedInstaller, MAX_PHASE, MIN_PHASE};
use crate::version::ReleaseVersion;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

const MANIFEST_KEYS: &[&str] = &["version", "defaults", "modules", "upgrade"];
const DEFAULTS_KEYS: &[&str] = &["user", "workspace_root", "mode"];
const UPGRADE_KEYS: &[&str] = &["releases", "target"];
const MODULE_KEYS: &[&str] = &[
    "id",
    "phase",
    "run_as",
    "description",
    "dependencies",
    "tags",
    "optional",
    "enabled_by_default",
    "installed_check",
    "install",
    "installer",
    "verify",
];
const STEP_KEYS: &[&str] = &["command", "run_as"];
const INSTALLER_KEYS: &[&str] = &["tool", "url", "runner", "args"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    #[default]
    Full,
    Minimal,
}

impl InstallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "minimal" => Some(Self::Minimal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub user: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub mode: InstallMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSettings {
    pub releases: Vec<ReleaseVersion>,
    pub target: Option<ReleaseVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub defaults: Defaults,
    pub modules: Vec<Module>,
    pub upgrade: Option<UpgradeSettings>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            kind: "manifest",
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ManifestError> {
        let mut document: Table =
            toml::from_str(input).map_err(|source| ManifestError::Parse {
                kind: "manifest",
                source,
            })?;
        reject_unknown_keys(&document, MANIFEST_KEYS, |key| {
            ManifestError::document(key, "unknown field")
        })?;

        let version = match document.remove("version") {
            Some(value) => value
                .try_into::<u32>()
                .map_err(|err| ManifestError::document("version", err.to_string().trim()))?,
            None => return Err(ManifestError::document("version", "missing field")),
        };
        if version != MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::document(
                "version",
                format!("unsupported manifest version {version}; expected {MANIFEST_SCHEMA_VERSION}"),
            ));
        }

        let defaults = match document.remove("defaults") {
            Some(Value::Table(table)) => parse_defaults(table)?,
            Some(_) => return Err(ManifestError::document("defaults", "expected a table")),
            None => Defaults::default(),
        };

        let upgrade = match document.remove("upgrade") {
            Some(Value::Table(table)) => Some(parse_upgrade(table)?),
            Some(_) => return Err(ManifestError::document("upgrade", "expected a table")),
            None => None,
        };

        let modules = match document.remove("modules") {
            Some(Value::Array(entries)) => entries
                .into_iter()
                .enumerate()
                .map(|(index, entry)| match entry {
                    Value::Table(table) => parse_module(index, table),
                    _ => Err(ManifestError::schema(
                        format!("#{index}"),
                        "modules",
                        "expected a table",
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(ManifestError::document("modules", "expected an array of tables")),
            None => Vec::new(),
        };

        Ok(Self {
            version,
            defaults,
            modules,
            upgrade,
        })
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.id == id)
    }

    /// Declaration index of a module; the deterministic tie-break for ordering.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.modules.iter().position(|module| module.id == id)
    }
}

fn parse_defaults(mut table: Table) -> Result<Defaults, ManifestError> {
    reject_unknown_keys(&table, DEFAULTS_KEYS, |key| {
        ManifestError::document(format!("defaults.{key}"), "unknown field")
    })?;
    let field = |table: &mut Table, key: &str| -> Result<Option<String>, ManifestError> {
        match table.remove(key) {
            Some(value) => value
                .try_into::<String>()
                .map(Some)
                .map_err(|err| ManifestError::document(format!("defaults.{key}"), err.to_string().trim())),
            None => Ok(None),
        }
    };

    let user = field(&mut table, "user")?;
    if user.as_deref().is_some_and(|user| user.trim().is_empty()) {
        return Err(ManifestError::document("defaults.user", "must not be empty"));
    }
    let workspace_root = field(&mut table, "workspace_root")?.map(PathBuf::from);
    let mode = match field(&mut table, "mode")? {
        Some(raw) => InstallMode::parse(&raw).ok_or_else(|| {
            ManifestError::document(
                "defaults.mode",
                format!("unknown install mode '{raw}'; supported: full, minimal"),
            )
        })?,
        None => InstallMode::default(),
    };

    Ok(Defaults {
        user,
        workspace_root,
        mode,
    })
}

fn parse_upgrade(mut table: Table) -> Result<UpgradeSettings, ManifestError> {
    reject_unknown_keys(&table, UPGRADE_KEYS, |key| {
        ManifestError::document(format!("upgrade.{key}"), "unknown field")
    })?;
    let releases = match table.remove("releases") {
        Some(value) => {
            let raw = value.try_into::<Vec<String>>().map_err(|err| {
                ManifestError::document("upgrade.releases", err.to_string().trim())
            })?;
            raw.iter()
                .map(|entry| ReleaseVersion::parse(entry))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| ManifestError::document("upgrade.releases", err.to_string()))?
        }
        None => Vec::new(),
    };
    if releases.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(ManifestError::document(
            "upgrade.releases",
            "releases must be listed in strictly ascending order",
        ));
    }
    let target = match table.remove("target") {
        Some(value) => {
            let raw = value.try_into::<String>().map_err(|err| {
                ManifestError::document("upgrade.target", err.to_string().trim())
            })?;
            Some(
                ReleaseVersion::parse(&raw)
                    .map_err(|err| ManifestError::document("upgrade.target", err.to_string()))?,
            )
        }
        None => None,
    };
    Ok(UpgradeSettings { releases, target })
}

fn parse_module(index: usize, mut table: Table) -> Result<Module, ManifestError> {
    let fallback_label = format!("#{index}");
    let id = match table.remove("id") {
        Some(Value::String(id)) => id,
        Some(_) => {
            return Err(ManifestError::schema(
                &fallback_label,
                "id",
                "expected a string",
            ))
        }
        None => return Err(ManifestError::schema(&fallback_label, "id", "missing field")),
    };
    validate_module_id(&id).map_err(|message| ManifestError::schema(&fallback_label, "id", message))?;
    let module_id = id.as_str();

    reject_unknown_keys(&table, MODULE_KEYS, |key| {
        ManifestError::schema(module_id, key, "unknown field")
    })?;

    let phase = take_required::<i64>(&mut table, module_id, "phase")?;
    if phase < i64::from(MIN_PHASE) || phase > i64::from(MAX_PHASE) {
        return Err(ManifestError::schema(
            module_id,
            "phase",
            format!("phase {phase} is outside {MIN_PHASE}..={MAX_PHASE}"),
        ));
    }
    let phase = phase as u8;

    let run_as = match take_field::<String>(&mut table, module_id, "run_as")? {
        Some(raw) => parse_run_as(&raw, module_id, "run_as")?,
        None => return Err(ManifestError::schema(module_id, "run_as", "missing field")),
    };
    let description = take_field::<String>(&mut table, module_id, "description")?;

    let dependencies = take_field::<Vec<String>>(&mut table, module_id, "dependencies")?
        .unwrap_or_default();
    let mut seen = BTreeSet::new();
    for dependency in &dependencies {
        if dependency.trim().is_empty() {
            return Err(ManifestError::schema(
                module_id,
                "dependencies",
                "dependency ids must not be empty",
            ));
        }
        if !seen.insert(dependency.as_str()) {
            return Err(ManifestError::schema(
                module_id,
                "dependencies",
                format!("duplicate dependency '{dependency}'"),
            ));
        }
    }

    let tags = take_field::<Vec<String>>(&mut table, module_id, "tags")?
        .unwrap_or_default()
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .collect::<BTreeSet<_>>();
    if tags.iter().any(String::is_empty) {
        return Err(ManifestError::schema(module_id, "tags", "tags must not be empty"));
    }

    let optional = take_field::<bool>(&mut table, module_id, "optional")?.unwrap_or(false);
    let enabled_by_default =
        take_field::<bool>(&mut table, module_id, "enabled_by_default")?.unwrap_or(true);

    let installed_check = match table.remove("installed_check") {
        Some(value) => Some(parse_step(value, run_as, module_id, "installed_check")?),
        None => None,
    };

    let steps = match table.remove("install") {
        Some(value) => Some(parse_steps(value, run_as, module_id, "install")?),
        None => None,
    };
    let installer = match table.remove("installer") {
        Some(Value::Table(table)) => Some(parse_installer(table, module_id)?),
        Some(_) => {
            return Err(ManifestError::schema(
                module_id,
                "installer",
                "expected a table",
            ))
        }
        None => None,
    };
    let install = match (steps, installer) {
        (Some(_), Some(_)) => {
            return Err(ManifestError::schema(
                module_id,
                "installer",
                "declare either install steps or a verified installer, not both",
            ))
        }
        (Some(steps), None) => InstallSpec::Steps(steps),
        (None, Some(installer)) => InstallSpec::Verified(installer),
        (None, None) => InstallSpec::Steps(Vec::new()),
    };

    let verify = match table.remove("verify") {
        Some(value) => parse_steps(value, run_as, module_id, "verify")?,
        None => Vec::new(),
    };
    if verify.is_empty() {
        return Err(ManifestError::schema(
            module_id,
            "verify",
            "at least one verify command is required",
        ));
    }

    Ok(Module {
        id,
        phase,
        run_as,
        description,
        dependencies,
        tags,
        optional,
        enabled_by_default,
        installed_check,
        install,
        verify,
    })
}

fn parse_installer(mut table: Table, module_id: &str) -> Result<VerifiedInstaller, ManifestError> {
    reject_unknown_keys(&table, INSTALLER_KEYS, |key| {
        ManifestError::schema(module_id, format!("installer.{key}"), "unknown field")
    })?;
    let mut required = |key: &str| -> Result<String, ManifestError> {
        let value = take_required::<String>(&mut table, module_id, &format!("installer.{key}"))?;
        if value.trim().is_empty() {
            return Err(ManifestError::schema(
                module_id,
                format!("installer.{key}"),
                "must not be empty",
            ));
        }
        Ok(value)
    };
    let tool = required("tool")?;
    let url = required("url")?;
    let runner = required("runner")?;
    let args = match table.remove("args") {
        Some(value) => value.try_into::<Vec<String>>().map_err(|err| {
            ManifestError::schema(module_id, "installer.args", err.to_string().trim())
        })?,
        None => Vec::new(),
    };
    Ok(VerifiedInstaller {
        tool,
        url,
        runner,
        args,
    })
}

fn parse_steps(
    value: Value,
    default_run_as: RunAs,
    module_id: &str,
    field: &str,
) -> Result<Vec<Step>, ManifestError> {
    let Value::Array(entries) = value else {
        return Err(ManifestError::schema(module_id, field, "expected an array"));
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            parse_step(entry, default_run_as, module_id, &format!("{field}[{index}]"))
        })
        .collect()
}

fn parse_step(
    value: Value,
    default_run_as: RunAs,
    module_id: &str,
    field: &str,
) -> Result<Step, ManifestError> {
    let step = match value {
        Value::String(command) => Step {
            run_as: default_run_as,
            command,
        },
        Value::Table(mut table) => {
            reject_unknown_keys(&table, STEP_KEYS, |key| {
                ManifestError::schema(module_id, format!("{field}.{key}"), "unknown field")
            })?;
            let command = match table.remove("command") {
                Some(Value::String(command)) => command,
                Some(_) => {
                    return Err(ManifestError::schema(
                        module_id,
                        format!("{field}.command"),
                        "expected a string",
                    ))
                }
                None => {
                    return Err(ManifestError::schema(
                        module_id,
                        format!("{field}.command"),
                        "missing field",
                    ))
                }
            };
            let run_as = match table.remove("run_as") {
                Some(Value::String(raw)) => parse_run_as(&raw, module_id, &format!("{field}.run_as"))?,
                Some(_) => {
                    return Err(ManifestError::schema(
                        module_id,
                        format!("{field}.run_as"),
                        "expected a string",
                    ))
                }
                None => default_run_as,
            };
            Step { run_as, command }
        }
        _ => {
            return Err(ManifestError::schema(
                module_id,
                field,
                "expected a command string or a table with 'command'",
            ))
        }
    };
    if step.command.trim().is_empty() {
        return Err(ManifestError::schema(module_id, field, "command must not be empty"));
    }
    Ok(step)
}

fn parse_run_as(raw: &str, module_id: &str, field: &str) -> Result<RunAs, ManifestError> {
    RunAs::parse(raw).ok_or_else(|| {
        ManifestError::schema(
            module_id,
            field,
            format!(
                "unknown execution context '{raw}'; supported: root, target_user, target_user_no_shell, invoking_user"
            ),
        )
    })
}

fn take_field<T: DeserializeOwned>(
    table: &mut Table,
    module_id: &str,
    field: &str,
) -> Result<Option<T>, ManifestError> {
    let key = field.rsplit('.').next().unwrap_or(field);
    match table.remove(key) {
        Some(value) => value
            .try_into::<T>()
            .map(Some)
            .map_err(|err| ManifestError::schema(module_id, field, err.to_string().trim())),
        None => Ok(None),
    }
}

fn take_required<T: DeserializeOwned>(
    table: &mut Table,
    module_id: &str,
    field: &str,
) -> Result<T, ManifestError> {
    take_field(table, module_id, field)?
        .ok_or_else(|| ManifestError::schema(module_id, field, "missing field"))
}

fn reject_unknown_keys<F>(table: &Table, known: &[&str], error: F) -> Result<(), ManifestError>
where
    F: Fn(&str) -> ManifestError,
{
    match table.keys().find(|key| !known.contains(&key.as_str())) {
        Some(key) => Err(error(key)),
        None => Ok(()),
    }
}

fn validate_module_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("module id must not be empty".to_string());
    }
    if id.split('.').any(str::is_empty) {
        return Err(format!("module id '{id}' has an empty dotted segment"));
    }
    let starts_valid = id
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first.is_ascii_digit());
    if !starts_valid
        || !id
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
    {
        return Err(format!(
            "module id '{id}' must use lowercase ASCII letters, digits, '.', '_' or '-'"
        ));
    }
    Ok(())
}
