//! Settings read from a json file, with a set of defaults underneath.
//!
//! Lookup order for every getter: the file, then the fallback passed to the
//! getter, then the defaults the Config was built with.
use json::JsonValue;
use log::{info, warn};
use regex::Regex;
use std::{error::Error, fmt, io::ErrorKind};

#[derive(Debug)]
pub struct MissingConfigError {
    key: String,
}

impl fmt::Display for MissingConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Required configuration value '{}' is missing", self.key)
    }
}

impl Error for MissingConfigError {}

pub struct Config {
    filename: Option<String>,
    settings: JsonValue,
    defaults: JsonValue,
}

impl Config {
    /// Load settings from filename.  A missing or unparsable file leaves you with the defaults.
    pub fn build(filename: &str, defaults: JsonValue) -> Result<Config, std::io::Error> {
        let valid_name = Regex::new(r"^[a-zA-Z0-9_\-\./]+\.json$")
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        if !valid_name.is_match(filename) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "Invalid filename - letters, numbers, underscore, dash, dot, slash and ending in .json",
            ));
        }
        let settings = match std::fs::read_to_string(filename) {
            Ok(raw) => match json::parse(&raw) {
                Ok(parsed) => {
                    info!("Loaded settings from {}: {}", filename, parsed.dump());
                    parsed
                }
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", filename, e);
                    json::object! {}
                }
            },
            Err(e) => {
                warn!("Using default settings, {}: {}", filename, e);
                json::object! {}
            }
        };
        Ok(Config {
            filename: Some(filename.to_string()),
            settings,
            defaults,
        })
    }

    /// Only defaults, no file behind it
    pub fn from_defaults(defaults: JsonValue) -> Config {
        Config {
            filename: None,
            settings: json::object! {},
            defaults,
        }
    }

    /// Settings from a json string (handy for tests and command line overrides)
    pub fn from_str(raw: &str, defaults: JsonValue) -> Result<Config, json::Error> {
        Ok(Config {
            filename: None,
            settings: json::parse(raw)?,
            defaults,
        })
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn lookup<T, F>(&self, key: &str, fallback: Option<T>, extract: F) -> Result<T, MissingConfigError>
    where
        F: Fn(&JsonValue) -> Option<T>,
    {
        extract(&self.settings[key])
            .or(fallback)
            .or_else(|| extract(&self.defaults[key]))
            .ok_or_else(|| MissingConfigError {
                key: key.to_string(),
            })
    }

    pub fn get_str_value(&self, key: &str, default: Option<String>) -> Result<String, MissingConfigError> {
        self.lookup(key, default, |v| v.as_str().map(String::from))
    }

    pub fn get_bool_value(&self, key: &str, default: Option<bool>) -> Result<bool, MissingConfigError> {
        self.lookup(key, default, JsonValue::as_bool)
    }

    pub fn get_u32_value(&self, key: &str, default: Option<u32>) -> Result<u32, MissingConfigError> {
        self.lookup(key, default, JsonValue::as_u32)
    }

    /// Optional string, empty strings count as not set
    pub fn get_opt_str_value(&self, key: &str) -> Option<String> {
        self.get_str_value(key, None).ok().filter(|s| !s.is_empty())
    }

    pub fn set_value(&mut self, key: &str, val: impl Into<JsonValue>) -> Result<(), String> {
        let json_val = val.into();
        match json_val {
            JsonValue::Short(_) | JsonValue::String(_) | JsonValue::Boolean(_) | JsonValue::Number(_) => {
                self.settings[key] = json_val;
                Ok(())
            }
            _ => Err(format!("Unsupported value type for key: {}", key)),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ file: {:?}, settings: {}, defaults: {} }}",
            self.filename,
            self.settings.dump(),
            self.defaults.dump()
        )
    }
}

#[cfg(test)]
mod test_config {
    use super::*;

    fn test_defaults() -> JsonValue {
        json::object! {
            "port": 7777,
            "fec": true,
            "key": ""
        }
    }

    #[test]
    fn missing_file_uses_defaults() {
        // It should fall back to the defaults when the file is not there
        let config = Config::build("no_such_netmix_file.json", test_defaults()).unwrap();
        assert_eq!(config.get_u32_value("port", None).unwrap(), 7777);
        assert_eq!(config.get_bool_value("fec", None).unwrap(), true);
        assert_eq!(config.filename(), Some("no_such_netmix_file.json"));
    }
    #[test]
    fn invalid_name() {
        // It should refuse filenames with odd characters
        match Config::build("I'm_;,`all_{jacked}_up", test_defaults()) {
            Ok(_) => assert!(false, "Expected error for invalid filename"),
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidInput),
        }
    }
    #[test]
    fn settings_override_defaults() {
        let config = Config::from_str(r#"{ "port": 9000, "fec": false }"#, test_defaults()).unwrap();
        assert_eq!(config.get_u32_value("port", None).unwrap(), 9000);
        assert_eq!(config.get_bool_value("fec", Some(true)).unwrap(), false);
    }
    #[test]
    fn explicit_fallback_beats_defaults() {
        let config = Config::from_defaults(test_defaults());
        assert_eq!(config.get_u32_value("port", Some(1)).unwrap(), 1);
        assert_eq!(config.get_u32_value("nothing", Some(99)).unwrap(), 99);
    }
    #[test]
    fn missing_key() {
        let config = Config::from_defaults(test_defaults());
        let boom = config.get_str_value("i_dont_exist", None);
        assert_eq!(
            boom.err().unwrap().to_string(),
            "Required configuration value 'i_dont_exist' is missing"
        );
        // empty string is not a key
        assert!(config.get_opt_str_value("key").is_none());
    }
    #[test]
    fn set_value() {
        let mut config = Config::from_defaults(test_defaults());
        config.set_value("key", "secret.key").unwrap();
        assert_eq!(config.get_opt_str_value("key").unwrap(), "secret.key");
        assert!(config.set_value("list", json::array![1, 2]).is_err());
    }
}
