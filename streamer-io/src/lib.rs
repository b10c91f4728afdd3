pub mod async_storage_drive;
pub mod context;
pub mod drive_config;
mod file_io;
pub mod file_request;
pub mod hardware;
pub mod read_splitter;
mod scheduler;
pub mod scheduling;
pub mod stack_config;
pub mod stack_entry;
pub mod storage_drive;
mod streamer;
pub mod thread_sync;

pub use crate::async_storage_drive::AsyncStorageDrive;
pub use crate::context::StreamerContext;
pub use crate::drive_config::{AsyncStorageDriveConfig, StorageDriveConfig};
pub use crate::file_io::FileOpenOptions;
pub use crate::file_request::{
    FileMetaData, FileRequest, FileRequestCommand, FileRequestHandle, Priority, ReadCompletion,
    RequestId, RequestStatus,
};
pub use crate::hardware::{
    collect_io_hardware_information, DriveInformation, DriveList, HardwareInformation,
};
pub use crate::read_splitter::{ReadSplitter, ReadSplitterConfig};
pub use crate::scheduler::Scheduler;
pub use crate::stack_config::{StackConfigRegistry, StreamerConfig, StreamerStackConfig};
pub use crate::stack_entry::{StreamStackEntry, StreamStackStatus, Statistic};
pub use crate::storage_drive::StorageDrive;
pub use crate::streamer::{ReadRequest, Streamer, StreamerSettings};
pub use crate::thread_sync::{EventHandle, StreamerContextThreadSync, MAXIMUM_WAIT_OBJECTS};

pub use streamer_base::*;

#[cfg(test)]
mod tests;
