//! Runtime parameters
//!
//! Named settings that can be read and changed while the server runs, via URL
//! parameters of the same name (`?cache-max-size=8GB`). Each parameter can
//! carry an action that is run after every successful update; this is how the
//! cache learns about new bounds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::QueryError;
use crate::units::{MemorySize, TimeLimit};

pub const CACHE_MAX_NUM_ENTRIES: &str = "cache-max-num-entries";
pub const CACHE_MAX_SIZE: &str = "cache-max-size";
pub const CACHE_MAX_SIZE_SINGLE_ENTRY: &str = "cache-max-size-single-entry";
pub const DEFAULT_QUERY_TIMEOUT: &str = "default-query-timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterValue {
    Count(usize),
    Memory(MemorySize),
    Duration(TimeLimit),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Count(n) => write!(f, "{n}"),
            ParameterValue::Memory(size) => write!(f, "{size}"),
            ParameterValue::Duration(limit) => write!(f, "{limit}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("No runtime parameter with name \"{0}\" exists")]
    Unknown(String),

    #[error("Could not set runtime parameter \"{name}\" to \"{value}\": {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

impl From<ParameterError> for QueryError {
    fn from(e: ParameterError) -> Self {
        QueryError::BadRequest(e.to_string())
    }
}

pub type UpdateAction = Arc<dyn Fn(ParameterValue) + Send + Sync>;

struct Parameter {
    value: ParameterValue,
    strictly_positive: bool,
    on_update: Option<UpdateAction>,
}

impl Parameter {
    fn new(value: ParameterValue) -> Self {
        Parameter {
            value,
            strictly_positive: false,
            on_update: None,
        }
    }

    fn strictly_positive(mut self) -> Self {
        self.strictly_positive = true;
        self
    }

    fn parse(&self, name: &str, text: &str) -> Result<ParameterValue, ParameterError> {
        let invalid = |reason: String| ParameterError::Invalid {
            name: name.to_string(),
            value: text.to_string(),
            reason,
        };
        let value = match self.value {
            ParameterValue::Count(_) => text
                .trim()
                .parse::<usize>()
                .map(ParameterValue::Count)
                .map_err(|e| invalid(e.to_string()))?,
            ParameterValue::Memory(_) => MemorySize::parse(text)
                .map(ParameterValue::Memory)
                .map_err(|e| invalid(e.to_string()))?,
            ParameterValue::Duration(_) => TimeLimit::parse(text)
                .map(ParameterValue::Duration)
                .map_err(|e| invalid(e.to_string()))?,
        };
        if self.strictly_positive && is_zero(value) {
            return Err(invalid("the value must be strictly positive".to_string()));
        }
        Ok(value)
    }
}

fn is_zero(value: ParameterValue) -> bool {
    match value {
        ParameterValue::Count(n) => n == 0,
        ParameterValue::Memory(size) => size.get_bytes() == 0,
        ParameterValue::Duration(limit) => limit.duration().is_zero(),
    }
}

pub struct RuntimeParameters {
    parameters: RwLock<BTreeMap<&'static str, Parameter>>,
}

impl RuntimeParameters {
    pub fn from_config(config: &Config) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            CACHE_MAX_NUM_ENTRIES,
            Parameter::new(ParameterValue::Count(config.cache.max_num_entries)),
        );
        parameters.insert(
            CACHE_MAX_SIZE,
            Parameter::new(ParameterValue::Memory(config.cache.max_size)),
        );
        parameters.insert(
            CACHE_MAX_SIZE_SINGLE_ENTRY,
            Parameter::new(ParameterValue::Memory(config.cache.max_size_single_entry)),
        );
        parameters.insert(
            DEFAULT_QUERY_TIMEOUT,
            Parameter::new(ParameterValue::Duration(config.query.default_timeout))
                .strictly_positive(),
        );
        RuntimeParameters {
            parameters: RwLock::new(parameters),
        }
    }

    /// Parse `text` for parameter `name`, store it and run the update action.
    ///
    /// The action runs while the write lock is held, so concurrent setters
    /// apply their actions in the order the values were stored. Actions must
    /// not call back into these parameters.
    pub fn set(&self, name: &str, text: &str) -> Result<ParameterValue, ParameterError> {
        let mut parameters = self.parameters.write();
        let parameter = parameters
            .get_mut(name)
            .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
        let value = parameter.parse(name, text)?;
        parameter.value = value;
        if let Some(action) = &parameter.on_update {
            action(value);
        }
        drop(parameters);
        tracing::info!(parameter = name, value = %value, "runtime_parameter_set");
        Ok(value)
    }

    /// Register the action run after each update of `name`.
    /// It is also run once right away with the current value.
    pub fn set_on_update_action(
        &self,
        name: &str,
        action: UpdateAction,
    ) -> Result<(), ParameterError> {
        let mut parameters = self.parameters.write();
        let parameter = parameters
            .get_mut(name)
            .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
        action(parameter.value);
        parameter.on_update = Some(action);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ParameterValue> {
        self.parameters.read().get(name).map(|p| p.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.read().contains_key(name)
    }

    pub fn get_keys(&self) -> Vec<&'static str> {
        self.parameters.read().keys().copied().collect()
    }

    /// Every parameter printed the way it can be set again
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.parameters
            .read()
            .iter()
            .map(|(name, p)| ((*name).to_string(), p.value.to_string()))
            .collect()
    }

    pub fn default_query_timeout(&self) -> TimeLimit {
        match self.get(DEFAULT_QUERY_TIMEOUT) {
            Some(ParameterValue::Duration(limit)) => limit,
            _ => TimeLimit::from_secs(30),
        }
    }
}

impl fmt::Debug for RuntimeParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.to_map()).finish()
    }
}
