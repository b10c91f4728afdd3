use crate::hardware::HardwareInformation;
use crate::stack_entry::StreamStackEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use streamer_base::hashing::HashMap;
use streamer_base::{StreamerError, StreamerResult};
use type_uuid::TypeUuid;
use uuid::Uuid;

const TYPE_KEY: &str = "$type";
const VERSION_KEY: &str = "$version";

/// Describes one stage of the stream stack and knows how to build it for the hardware at hand.
/// Configurations are stored as JSON tagged with the type's uuid and version.
pub trait StreamerStackConfig: std::fmt::Debug + Send + Sync {
    fn type_uuid(&self) -> Uuid;
    fn version(&self) -> u32;
    fn to_json(&self) -> StreamerResult<serde_json::Value>;

    /// Clamps values that are out of range after loading
    fn sanitize(&mut self) {}

    /// Adds zero or more entries on top of `parent` and returns the new top of the stack
    fn add_stream_stack_entry(
        &self,
        hardware: &HardwareInformation,
        parent: Option<Box<dyn StreamStackEntry>>,
    ) -> Option<Box<dyn StreamStackEntry>>;
}

/// Logs and clamps a configuration value
pub fn clamp_config_value<T: PartialOrd + Copy + std::fmt::Display>(
    config_name: &str,
    field_name: &str,
    value: &mut T,
    min: T,
    max: T,
) {
    let clamped = if *value < min {
        min
    } else if *value > max {
        max
    } else {
        *value
    };
    if clamped != *value {
        log::warn!(
            "{}.{} is {} but has to be between {} and {}, using {}",
            config_name,
            field_name,
            value,
            min,
            max,
            clamped
        );
        *value = clamped;
    }
}

type DeserializeConfigFn = fn(serde_json::Value) -> StreamerResult<Box<dyn StreamerStackConfig>>;

fn deserialize_config<T>(value: serde_json::Value) -> StreamerResult<Box<dyn StreamerStackConfig>>
where
    T: StreamerStackConfig + DeserializeOwned + 'static,
{
    let mut config: T = serde_json::from_value(value)?;
    config.sanitize();
    Ok(Box::new(config))
}

/// Maps the type uuids found in configuration files to the types that load them
#[derive(Default)]
pub struct StackConfigRegistry {
    deserializers: HashMap<Uuid, DeserializeConfigFn>,
}

impl StackConfigRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registry that knows about all the stack configurations in this crate
    pub fn with_builtin_configs() -> Self {
        let mut registry = StackConfigRegistry::new();
        registry.register::<crate::drive_config::StorageDriveConfig>();
        registry.register::<crate::drive_config::AsyncStorageDriveConfig>();
        registry.register::<crate::read_splitter::ReadSplitterConfig>();
        registry
    }

    pub fn register<T>(&mut self)
    where
        T: StreamerStackConfig + TypeUuid + DeserializeOwned + 'static,
    {
        let old = self
            .deserializers
            .insert(Uuid::from_bytes(T::UUID), deserialize_config::<T>);
        assert!(old.is_none(), "Stack config type registered twice.");
    }

    pub fn is_registered(
        &self,
        type_uuid: &Uuid,
    ) -> bool {
        self.deserializers.contains_key(type_uuid)
    }

    fn load_stack_config(
        &self,
        value: serde_json::Value,
    ) -> StreamerResult<Option<Box<dyn StreamerStackConfig>>> {
        let mut fields = match value {
            serde_json::Value::Object(fields) => fields,
            _ => return Err("Stack config entries must be objects".into()),
        };

        let type_uuid = fields
            .remove(TYPE_KEY)
            .and_then(|value| value.as_str().and_then(|s| Uuid::parse_str(s).ok()))
            .ok_or_else(|| StreamerError::from(format!("Stack config entry has no valid {}", TYPE_KEY)))?;
        let version = fields
            .remove(VERSION_KEY)
            .and_then(|value| value.as_u64())
            .unwrap_or(1);

        let deserialize = match self.deserializers.get(&type_uuid) {
            Some(deserialize) => deserialize,
            None => {
                log::warn!("Skipping stack config of unknown type {}", type_uuid);
                return Ok(None);
            }
        };

        let config = (deserialize)(serde_json::Value::Object(fields))?;
        if version > config.version() as u64 {
            log::warn!(
                "Stack config {:?} was saved with version {} but only version {} is supported",
                config,
                version,
                config.version()
            );
        }
        Ok(Some(config))
    }

    pub fn load_config_from_str(
        &self,
        json: &str,
    ) -> StreamerResult<StreamerConfig> {
        let config_json: StreamerConfigJson = serde_json::from_str(json)?;
        let mut stack_config = Vec::with_capacity(config_json.stack_config.len());
        for value in config_json.stack_config {
            if let Some(config) = self.load_stack_config(value)? {
                stack_config.push(config);
            }
        }

        Ok(StreamerConfig { stack_config })
    }

    pub fn load_config_from_file(
        &self,
        path: &std::path::Path,
    ) -> StreamerResult<StreamerConfig> {
        let json = std::fs::read_to_string(path)?;
        self.load_config_from_str(&json)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamerConfigJson {
    #[serde(default)]
    stack_config: Vec<serde_json::Value>,
}

/// The stack configuration, from the bottom of the stack up
#[derive(Debug, Default)]
pub struct StreamerConfig {
    pub stack_config: Vec<Box<dyn StreamerStackConfig>>,
}

impl StreamerConfig {
    /// A generic drive at the bottom, the hardware specific drives on top of it and a read splitter
    /// at the top
    pub fn default_stack() -> Self {
        StreamerConfig {
            stack_config: vec![
                Box::new(crate::drive_config::StorageDriveConfig::default()),
                Box::new(crate::drive_config::AsyncStorageDriveConfig::default()),
                Box::new(crate::read_splitter::ReadSplitterConfig::default()),
            ],
        }
    }

    /// Builds the stack by letting every config add its entries on top of the previous ones.
    /// Returns the top entry.
    pub fn build_stack(
        &self,
        hardware: &HardwareInformation,
    ) -> Option<Box<dyn StreamStackEntry>> {
        profiling::scope!("StreamerConfig::build_stack");
        let mut top = None;
        for config in &self.stack_config {
            top = config.add_stream_stack_entry(hardware, top);
        }

        match &top {
            Some(top) => log::info!(
                "Built stream stack: {}",
                crate::stack_entry::stack_entry_names(&**top).join(" -> ")
            ),
            None => log::warn!("The stack config didn't produce any stream stack entries"),
        }
        top
    }

    pub fn to_json_string(&self) -> StreamerResult<String> {
        let mut stack_config = Vec::with_capacity(self.stack_config.len());
        for config in &self.stack_config {
            let mut value = config.to_json()?;
            match &mut value {
                serde_json::Value::Object(fields) => {
                    fields.insert(
                        TYPE_KEY.to_string(),
                        serde_json::Value::String(config.type_uuid().to_string()),
                    );
                    fields.insert(VERSION_KEY.to_string(), config.version().into());
                }
                _ => return Err("Stack configs must serialize to objects".into()),
            }
            stack_config.push(value);
        }

        Ok(serde_json::to_string_pretty(&StreamerConfigJson { stack_config })?)
    }
}
