use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use streamer_base::{
    BufferWindow, RequestBuffer, RequestMemoryAllocator, RequestPath, StreamerError,
    StreamerResult,
};

/// Identifies a request. Children created by stack entries get their own id but keep the id of the
/// client request they were created for as their root id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Higher values are serviced first. Waiting requests gain priority over time so that a steady
/// stream of high priority requests can't starve lower priority ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const LOW: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(128);
    pub const HIGH: Priority = Priority(192);
    pub const HIGHEST: Priority = Priority(255);

    /// Distance between the named priority levels. Aging boosts a request by one step per interval.
    pub const STEP: u32 = 64;
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    // Created but not yet seen by the streamer thread
    Pending = 0,
    // Waiting in a queue for its turn
    Queued = 1,
    // Handed to a stack entry that is working on it
    Processing = 2,
    Completed = 3,
    Canceled = 4,
    Failed = 5,
}

impl RequestStatus {
    fn from_u8(value: u8) -> RequestStatus {
        match value {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Queued,
            2 => RequestStatus::Processing,
            3 => RequestStatus::Completed,
            4 => RequestStatus::Canceled,
            _ => RequestStatus::Failed,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed
        )
    }
}

/// Delivered to the callback of a read once it's done
#[derive(Debug)]
pub struct ReadCompletion {
    pub request_id: RequestId,
    pub result: StreamerResult<RequestBuffer>,
    // The read finished but only after its deadline had passed
    pub completed_past_deadline: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileMetaData {
    pub file_size: u64,
}

pub type ReadCallback = Box<dyn FnOnce(ReadCompletion) + Send>;
pub type FileExistsCallback = Box<dyn FnOnce(RequestId, StreamerResult<bool>) + Send>;
pub type FileMetaDataCallback = Box<dyn FnOnce(RequestId, StreamerResult<FileMetaData>) + Send>;

/// A read as the client asked for it. The scheduler allocates the buffer and turns it into a
/// low-level `Read` child.
pub struct ReadRequestData {
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
    pub allocator: Arc<dyn RequestMemoryAllocator>,
    pub buffer: Option<RequestBuffer>,
    pub callback: Option<ReadCallback>,
}

/// A read of a byte range into memory that is owned by a parent request
#[derive(Debug)]
pub struct ReadData {
    // Always resolved
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
    // Data must exist in the file up to this offset, anything read beyond it is alignment padding
    pub required_end: u64,
    pub output: Option<BufferWindow>,
}

#[derive(Debug)]
pub struct CancelData {
    pub target: RequestId,
}

#[derive(Debug)]
pub struct RescheduleData {
    pub target: RequestId,
    pub priority: Priority,
    pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct FlushData {
    pub path: RequestPath,
}

pub struct FileExistsCheckData {
    pub path: RequestPath,
    pub found: bool,
    pub callback: Option<FileExistsCallback>,
}

pub struct FileMetaDataRetrievalData {
    pub path: RequestPath,
    pub file_size: u64,
    pub callback: Option<FileMetaDataCallback>,
}

pub enum FileRequestCommand {
    ReadRequest(ReadRequestData),
    Read(ReadData),
    Cancel(CancelData),
    Reschedule(RescheduleData),
    // Close any cached handles and metadata for a file
    Flush(FlushData),
    FlushAll,
    FileExistsCheck(FileExistsCheckData),
    FileMetaDataRetrieval(FileMetaDataRetrievalData),
}

impl FileRequestCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FileRequestCommand::ReadRequest(_) => "ReadRequest",
            FileRequestCommand::Read(_) => "Read",
            FileRequestCommand::Cancel(_) => "Cancel",
            FileRequestCommand::Reschedule(_) => "Reschedule",
            FileRequestCommand::Flush(_) => "Flush",
            FileRequestCommand::FlushAll => "FlushAll",
            FileRequestCommand::FileExistsCheck(_) => "FileExistsCheck",
            FileRequestCommand::FileMetaDataRetrieval(_) => "FileMetaDataRetrieval",
        }
    }

    /// The file the command is about, if any
    pub fn path(&self) -> Option<&RequestPath> {
        match self {
            FileRequestCommand::ReadRequest(data) => Some(&data.path),
            FileRequestCommand::Read(data) => Some(&data.path),
            FileRequestCommand::Flush(data) => Some(&data.path),
            FileRequestCommand::FileExistsCheck(data) => Some(&data.path),
            FileRequestCommand::FileMetaDataRetrieval(data) => Some(&data.path),
            FileRequestCommand::Cancel(_)
            | FileRequestCommand::Reschedule(_)
            | FileRequestCommand::FlushAll => None,
        }
    }

    pub fn path_mut(&mut self) -> Option<&mut RequestPath> {
        match self {
            FileRequestCommand::ReadRequest(data) => Some(&mut data.path),
            FileRequestCommand::Read(data) => Some(&mut data.path),
            FileRequestCommand::Flush(data) => Some(&mut data.path),
            FileRequestCommand::FileExistsCheck(data) => Some(&mut data.path),
            FileRequestCommand::FileMetaDataRetrieval(data) => Some(&mut data.path),
            FileRequestCommand::Cancel(_)
            | FileRequestCommand::Reschedule(_)
            | FileRequestCommand::FlushAll => None,
        }
    }

    /// Commands that every stack entry gets to see, as opposed to commands that are serviced by
    /// the one entry responsible for the file
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            FileRequestCommand::Cancel(_)
                | FileRequestCommand::Reschedule(_)
                | FileRequestCommand::Flush(_)
                | FileRequestCommand::FlushAll
        )
    }
}

/// A unit of work flowing through the stream stack
pub struct FileRequest {
    id: RequestId,
    root_id: RequestId,
    parent: Option<RequestId>,
    command: FileRequestCommand,
    priority: Priority,
    deadline: Option<Instant>,
    created: Instant,
    status: RequestStatus,
    error: Option<StreamerError>,
    // Visible to the client through a FileRequestHandle, only set on client requests
    shared_status: Option<Arc<AtomicU8>>,
}

impl FileRequest {
    pub fn new(
        id: RequestId,
        command: FileRequestCommand,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Self {
        FileRequest {
            id,
            root_id: id,
            parent: None,
            command,
            priority,
            deadline,
            created: Instant::now(),
            status: RequestStatus::Pending,
            error: None,
            shared_status: None,
        }
    }

    /// Creates a request that does part of the work for `parent`. It inherits the scheduling
    /// properties of the parent.
    pub fn new_child(
        id: RequestId,
        parent: &FileRequest,
        command: FileRequestCommand,
    ) -> Self {
        FileRequest {
            id,
            root_id: parent.root_id,
            parent: Some(parent.id),
            command,
            priority: parent.priority,
            deadline: parent.deadline,
            created: parent.created,
            status: RequestStatus::Pending,
            error: None,
            shared_status: None,
        }
    }

    pub fn with_shared_status(
        mut self,
        shared_status: Arc<AtomicU8>,
    ) -> Self {
        shared_status.store(self.status as u8, Ordering::Release);
        self.shared_status = Some(shared_status);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_created(
        mut self,
        created: Instant,
    ) -> Self {
        self.created = created;
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn root_id(&self) -> RequestId {
        self.root_id
    }

    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    pub fn command(&self) -> &FileRequestCommand {
        &self.command
    }

    pub fn command_mut(&mut self) -> &mut FileRequestCommand {
        &mut self.command
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn reschedule(
        &mut self,
        priority: Priority,
        deadline: Option<Instant>,
    ) {
        self.priority = priority;
        self.deadline = deadline;
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn set_status(
        &mut self,
        status: RequestStatus,
    ) {
        self.status = status;
        if let Some(shared_status) = &self.shared_status {
            shared_status.store(status as u8, Ordering::Release);
        }
    }

    pub fn error(&self) -> Option<&StreamerError> {
        self.error.as_ref()
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Records the failure. The first failure wins, later ones are ignored.
    pub fn fail(
        &mut self,
        error: StreamerError,
    ) {
        if self.error.is_none() {
            let status = if error.is_canceled() {
                RequestStatus::Canceled
            } else {
                RequestStatus::Failed
            };
            log::debug!(
                "Request {:?} ({}) failed: {}",
                self.id,
                self.command.name(),
                error
            );
            self.error = Some(error);
            self.set_status(status);
        }
    }

    pub fn is_past_deadline(
        &self,
        now: Instant,
    ) -> bool {
        self.deadline.map_or(false, |deadline| now > deadline)
    }

    /// Hands the outcome to whoever asked for it. Called by the context once the request and all of
    /// its children are done.
    pub(crate) fn complete(mut self) {
        if self.error.is_none() {
            self.set_status(RequestStatus::Completed);
        }

        let id = self.id;
        let completed_past_deadline = self.is_past_deadline(Instant::now());
        let error = self.error.clone();
        match &mut self.command {
            FileRequestCommand::ReadRequest(data) => {
                if let Some(callback) = data.callback.take() {
                    let result = match (error, data.buffer.take()) {
                        (Some(error), _) => Err(error),
                        (None, Some(buffer)) => Ok(buffer),
                        (None, None) => Err(StreamerError::StringError(
                            "Read completed without a buffer".to_string(),
                        )),
                    };
                    (callback)(ReadCompletion {
                        request_id: id,
                        result,
                        completed_past_deadline,
                    });
                }
            }
            FileRequestCommand::FileExistsCheck(data) => {
                if let Some(callback) = data.callback.take() {
                    (callback)(id, error.map_or(Ok(data.found), Err));
                }
            }
            FileRequestCommand::FileMetaDataRetrieval(data) => {
                if let Some(callback) = data.callback.take() {
                    let file_size = data.file_size;
                    (callback)(id, error.map_or(Ok(FileMetaData { file_size }), Err));
                }
            }
            _ => {}
        }
    }
}

impl Drop for FileRequest {
    // Requests that never completed (the streamer was shut down) still report back
    fn drop(&mut self) {
        let id = self.id;
        match &mut self.command {
            FileRequestCommand::ReadRequest(data) => {
                if let Some(callback) = data.callback.take() {
                    (callback)(ReadCompletion {
                        request_id: id,
                        result: Err(StreamerError::ShuttingDown),
                        completed_past_deadline: false,
                    });
                }
            }
            FileRequestCommand::FileExistsCheck(data) => {
                if let Some(callback) = data.callback.take() {
                    (callback)(id, Err(StreamerError::ShuttingDown));
                }
            }
            FileRequestCommand::FileMetaDataRetrieval(data) => {
                if let Some(callback) = data.callback.take() {
                    (callback)(id, Err(StreamerError::ShuttingDown));
                }
            }
            _ => {}
        }

        if let Some(shared_status) = &self.shared_status {
            if !RequestStatus::from_u8(shared_status.load(Ordering::Acquire)).is_finished() {
                shared_status.store(RequestStatus::Canceled as u8, Ordering::Release);
            }
        }
    }
}

impl std::fmt::Debug for FileRequest {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id)
            .field("root_id", &self.root_id)
            .field("parent", &self.parent)
            .field("command", &self.command.name())
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish()
    }
}

/// Ticket returned to clients for every request they submit
#[derive(Clone, Debug)]
pub struct FileRequestHandle {
    id: RequestId,
    status: Arc<AtomicU8>,
}

impl FileRequestHandle {
    pub(crate) fn new(id: RequestId) -> (Self, Arc<AtomicU8>) {
        let status = Arc::new(AtomicU8::new(RequestStatus::Pending as u8));
        (
            FileRequestHandle {
                id,
                status: status.clone(),
            },
            status,
        )
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }
}
