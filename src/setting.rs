//! Runtime settings: environment selection, credentials and data paths.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Setting filename
pub const SETTING_FILENAME: &str = "bt_setting.json";

/// Folder searched for the setting file
const SETTING_FOLDER: &str = ".bt";

/// Default settings
fn default_settings() -> HashMap<String, SettingValue> {
    let mut settings = HashMap::new();

    settings.insert("data.root".to_string(), SettingValue::String(".".to_string()));

    // Log settings
    settings.insert("log.level".to_string(), SettingValue::Int(20)); // INFO level
    settings.insert("log.console".to_string(), SettingValue::Bool(true));
    settings.insert("log.file".to_string(), SettingValue::Bool(false));

    // Datafeed settings
    settings.insert(
        "datafeed.host".to_string(),
        SettingValue::String("https://hist.databento.com".to_string()),
    );
    settings.insert("datafeed.dataset".to_string(), SettingValue::String("GLBX.MDP3".to_string()));
    settings.insert("datafeed.schema".to_string(), SettingValue::String("ohlcv-1m".to_string()));
    settings.insert("datafeed.symbols".to_string(), SettingValue::String("ES.v.0".to_string()));
    settings.insert("datafeed.stype_in".to_string(), SettingValue::String("continuous".to_string()));

    settings
}

/// Setting value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SettingValue {
    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Deployment environment, selected with `ENVIRONMENT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Production,
    #[default]
    Development,
    Testing,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
            Environment::Testing => "testing",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(Environment::Production),
            "development" => Ok(Environment::Development),
            "testing" => Ok(Environment::Testing),
            other => Err(Error::Config(format!("Invalid environment: {}", other))),
        }
    }
}

/// Resolved settings for one process
#[derive(Debug, Clone)]
pub struct Settings {
    environment: Environment,
    databento_api_key: String,
    values: HashMap<String, SettingValue>,
}

impl Settings {
    /// Load from the process environment and the optional setting file
    pub fn load() -> Result<Self> {
        let mut settings = Self::from_lookup(|key| env::var(key).ok())?;
        if let Some(file_settings) = load_settings_from_file(&setting_file_path())? {
            settings.update(file_settings);
        }
        Ok(settings)
    }

    /// Build from defaults using `lookup` for environment variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("ENVIRONMENT") {
            Some(value) if !value.is_empty() => value.parse()?,
            _ => Environment::default(),
        };

        Ok(Self {
            environment,
            databento_api_key: lookup("DATABENTO_API_KEY").unwrap_or_default(),
            values: default_settings(),
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn is_testing(&self) -> bool {
        self.environment == Environment::Testing
    }

    pub fn databento_api_key(&self) -> &str {
        &self.databento_api_key
    }

    /// Get a setting value
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Get a string setting
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    /// Get an integer setting
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_int())
    }

    /// Get a float setting
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_float())
    }

    /// Get a bool setting
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Set a setting value
    pub fn set(&mut self, key: impl Into<String>, value: SettingValue) {
        self.values.insert(key.into(), value);
    }

    /// Update settings from a map
    pub fn update(&mut self, new_settings: HashMap<String, SettingValue>) {
        self.values.extend(new_settings);
    }

    /// Root folder for everything the CLI writes
    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(self.get_string("data.root").unwrap_or_else(|| ".".to_string()))
    }

    pub fn price_data_dir(&self) -> PathBuf {
        self.data_root().join("price_data").join(self.environment.as_str())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_root().join("results").join(self.environment.as_str())
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_root().join("reports").join(self.environment.as_str())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_root().join("log")
    }
}

/// Folder holding the setting file: `./.bt` when present, else `~/.bt`
pub fn setting_folder() -> PathBuf {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let local = cwd.join(SETTING_FOLDER);
    if local.exists() {
        return local;
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(SETTING_FOLDER)
}

/// Get path of the setting file
pub fn setting_file_path() -> PathBuf {
    setting_folder().join(SETTING_FILENAME)
}

/// Load settings from a JSON file; a missing file is not an error
pub fn load_settings_from_file(filepath: &Path) -> Result<Option<HashMap<String, SettingValue>>> {
    if !filepath.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(filepath).map_err(|e| Error::io_read(filepath, e))?;
    let settings = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", filepath.display(), e)))?;
    Ok(Some(settings))
}
