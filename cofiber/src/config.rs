//! Process-wide registry of named tunables.
//!
//! Tunables are declared with [`Config::lookup`], which registers a default on first use and
//! returns the shared handle afterwards. Values can be overridden in code through the handle or
//! in bulk from a TOML document, where nested tables map to dotted names
//! (`[fiber] stack_size = 65536` updates `fiber.stack_size`).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::ConfigError;

/// Type-erased view of a [`ConfigVar`].
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn value_string(&self) -> String;

    /// Parses `value` without storing it. Calling the returned closure stores it.
    fn stage(&self, value: &str) -> Result<Box<dyn FnOnce() + '_>, ConfigError>;

    fn set_from_str(&self, value: &str) -> Result<(), ConfigError> {
        self.stage(value).map(|apply| apply())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
}

impl<T> ConfigVar<T>
where
    T: Clone + Display + FromStr + Send + Sync + 'static,
{
    fn new(name: String, value: T, description: &str) -> Self {
        Self {
            name,
            description: description.to_string(),
            value: RwLock::new(value),
        }
    }

    pub fn value(&self) -> T {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_value(&self, value: T) {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

impl<T> ConfigVarBase for ConfigVar<T>
where
    T: Clone + Display + FromStr + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn value_string(&self) -> String {
        self.value().to_string()
    }

    fn stage(&self, value: &str) -> Result<Box<dyn FnOnce() + '_>, ConfigError> {
        let parsed = value.trim().parse::<T>().map_err(|_| ConfigError::Parse {
            name: self.name.clone(),
            value: value.to_string(),
        })?;
        Ok(Box::new(move || self.set_value(parsed)))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> fmt::Debug for ConfigVar<T>
where
    T: Clone + Display + FromStr + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &self.value_string())
            .finish()
    }
}

static CONFIGS: LazyLock<RwLock<BTreeMap<String, Arc<dyn ConfigVarBase>>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

pub struct Config;

impl Config {
    /// Registers `name` with `default`, or returns the var already registered under it.
    pub fn lookup<T>(
        name: &str,
        default: T,
        description: &str,
    ) -> Result<Arc<ConfigVar<T>>, ConfigError>
    where
        T: Clone + Display + FromStr + Send + Sync + 'static,
    {
        let name = normalize(name)?;
        let mut configs = CONFIGS.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = configs.get(&name) {
            tracing::debug!(target: "cofiber::config", name = %name, "lookup found existing var");
            return existing
                .clone()
                .into_any()
                .downcast::<ConfigVar<T>>()
                .map_err(|_| ConfigError::TypeMismatch { name });
        }

        let var = Arc::new(ConfigVar::new(name.clone(), default, description));
        configs.insert(name, var.clone());
        Ok(var)
    }

    /// Typed access to an already registered var.
    pub fn get<T>(name: &str) -> Option<Arc<ConfigVar<T>>>
    where
        T: Clone + Display + FromStr + Send + Sync + 'static,
    {
        Self::lookup_base(name)?
            .into_any()
            .downcast::<ConfigVar<T>>()
            .ok()
    }

    pub fn lookup_base(name: &str) -> Option<Arc<dyn ConfigVarBase>> {
        let configs = CONFIGS.read().unwrap_or_else(|e| e.into_inner());
        configs.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Calls `f` for every registered var, in name order.
    ///
    /// Works on a snapshot, so `f` may register or look up vars itself.
    pub fn visit<F>(mut f: F)
    where
        F: FnMut(&dyn ConfigVarBase),
    {
        let vars: Vec<_> = CONFIGS
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for var in &vars {
            f(var.as_ref());
        }
    }

    /// Applies a TOML document to the registered vars. Unknown keys are skipped.
    ///
    /// Every value is parsed before any is stored, so a failing document changes nothing.
    pub fn load_from_toml(src: &str) -> Result<(), ConfigError> {
        let table = src.parse::<toml::Table>()?;
        let mut entries = Vec::new();
        flatten("", &table, &mut entries);

        let known: Vec<_> = entries
            .into_iter()
            .filter_map(|(key, value)| Self::lookup_base(&key).map(|var| (key, value, var)))
            .collect();
        let staged = known
            .iter()
            .map(|(_, value, var)| var.stage(value))
            .collect::<Result<Vec<_>, _>>()?;

        for (apply, (key, value, _)) in staged.into_iter().zip(&known) {
            apply();
            tracing::debug!(target: "cofiber::config", name = %key, value = %value, "config updated");
        }
        Ok(())
    }
}

fn normalize(name: &str) -> Result<String, ConfigError> {
    let name = name.to_ascii_lowercase();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');
    if !valid {
        tracing::error!(target: "cofiber::config", name = %name, "lookup name invalid");
        return Err(ConfigError::InvalidName(name));
    }
    Ok(name)
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut Vec<(String, String)>) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.to_ascii_lowercase()
        } else {
            format!("{prefix}.{}", key.to_ascii_lowercase())
        };
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out),
            toml::Value::String(s) => out.push((key, s.clone())),
            other => out.push((key, other.to_string())),
        }
    }
}
