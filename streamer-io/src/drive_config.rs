use crate::async_storage_drive::{AsyncStorageDrive, MAX_IO_CHANNELS};
use crate::file_io::FileOpenOptions;
use crate::hardware::HardwareInformation;
use crate::stack_config::{clamp_config_value, StreamerStackConfig};
use crate::stack_entry::StreamStackEntry;
use crate::storage_drive::StorageDrive;
use serde::{Deserialize, Serialize};
use streamer_base::StreamerResult;
use type_uuid::TypeUuid;
use uuid::Uuid;

const MAX_CACHE_SIZE: u32 = 16 * 1024;

/// Generic drive that can read any file, used as the fallback at the bottom of the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypeUuid)]
#[uuid = "a5b0d1de-4b3c-4f24-9a4f-3e6a1d0f6a11"]
#[serde(rename_all = "PascalCase", default)]
pub struct StorageDriveConfig {
    pub max_file_handles: u32,
    pub max_meta_data_cache: u32,
}

impl Default for StorageDriveConfig {
    fn default() -> Self {
        StorageDriveConfig {
            max_file_handles: 32,
            max_meta_data_cache: 64,
        }
    }
}

impl StreamerStackConfig for StorageDriveConfig {
    fn type_uuid(&self) -> Uuid {
        Uuid::from_bytes(Self::UUID)
    }

    fn version(&self) -> u32 {
        1
    }

    fn to_json(&self) -> StreamerResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn sanitize(&mut self) {
        clamp_config_value("StorageDriveConfig", "MaxFileHandles", &mut self.max_file_handles, 1, MAX_CACHE_SIZE);
        clamp_config_value("StorageDriveConfig", "MaxMetaDataCache", &mut self.max_meta_data_cache, 1, MAX_CACHE_SIZE);
    }

    fn add_stream_stack_entry(
        &self,
        _hardware: &HardwareInformation,
        parent: Option<Box<dyn StreamStackEntry>>,
    ) -> Option<Box<dyn StreamStackEntry>> {
        let mut drive = StorageDrive::new(self.max_file_handles, self.max_meta_data_cache);
        drive.set_next(parent);
        Some(Box::new(drive))
    }
}

/// One drive scheduler per physical drive found in the hardware information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypeUuid)]
#[uuid = "3f9e7c52-8d0b-4e61-b2a7-5c14e9d8f0b3"]
#[serde(rename_all = "PascalCase", default)]
pub struct AsyncStorageDriveConfig {
    pub max_file_handles: u32,
    pub max_meta_data_cache: u32,
    // Extra requests a drive accepts beyond its io channels so there's always one ready to issue
    pub overcommit: u32,
    pub enable_file_sharing: bool,
    pub enable_unbuffered_reads: bool,
}

impl Default for AsyncStorageDriveConfig {
    fn default() -> Self {
        AsyncStorageDriveConfig {
            max_file_handles: 1024,
            max_meta_data_cache: 1024,
            overcommit: 8,
            enable_file_sharing: false,
            enable_unbuffered_reads: true,
        }
    }
}

impl StreamerStackConfig for AsyncStorageDriveConfig {
    fn type_uuid(&self) -> Uuid {
        Uuid::from_bytes(Self::UUID)
    }

    fn version(&self) -> u32 {
        1
    }

    fn to_json(&self) -> StreamerResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn sanitize(&mut self) {
        clamp_config_value("AsyncStorageDriveConfig", "MaxFileHandles", &mut self.max_file_handles, 1, MAX_CACHE_SIZE);
        clamp_config_value("AsyncStorageDriveConfig", "MaxMetaDataCache", &mut self.max_meta_data_cache, 1, MAX_CACHE_SIZE);
        clamp_config_value("AsyncStorageDriveConfig", "Overcommit", &mut self.overcommit, 0, 4 * MAX_IO_CHANNELS);
    }

    fn add_stream_stack_entry(
        &self,
        hardware: &HardwareInformation,
        parent: Option<Box<dyn StreamStackEntry>>,
    ) -> Option<Box<dyn StreamStackEntry>> {
        let drives = match hardware.drive_list() {
            Some(drives) if !drives.is_empty() => drives,
            _ => {
                log::warn!("No drives found to create storage drives for, using the previous stack entry instead");
                return parent;
            }
        };

        let options = FileOpenOptions {
            unbuffered: self.enable_unbuffered_reads,
            enable_sharing: self.enable_file_sharing,
        };

        let mut parent = parent;
        for drive in drives {
            let mut entry = AsyncStorageDrive::new(
                drive,
                self.max_file_handles,
                self.max_meta_data_cache,
                self.overcommit,
                options,
            );
            entry.set_next(parent);
            parent = Some(Box::new(entry));
        }
        parent
    }
}
