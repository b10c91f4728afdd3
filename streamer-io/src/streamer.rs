use crate::context::StreamerContext;
use crate::file_request::{
    CancelData, FileExistsCheckData, FileMetaData, FileMetaDataRetrievalData, FileRequest,
    FileRequestCommand, FileRequestHandle, FlushData, Priority, ReadCompletion, ReadRequestData,
    RequestId, RescheduleData,
};
use crate::hardware::HardwareInformation;
use crate::scheduler::Scheduler;
use crate::scheduling::DEFAULT_AGING_INTERVAL;
use crate::stack_config::StreamerConfig;
use crate::stack_entry::{StreamStackEntry, StreamStackStatus, Statistic};
use crate::thread_sync::EventHandle;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use streamer_base::{
    DefaultRequestMemoryAllocator, FileIoAliases, RequestMemoryAllocator, RequestPath,
    StreamerError, StreamerResult,
};

#[derive(Clone, Debug)]
pub struct StreamerSettings {
    pub thread_name: String,
    // Queued requests gain one priority step each time this much time passes
    pub aging_interval: Duration,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        StreamerSettings {
            thread_name: "Streamer".to_string(),
            aging_interval: DEFAULT_AGING_INTERVAL,
        }
    }
}

/// A read for `Streamer::read`
pub struct ReadRequest {
    path: RequestPath,
    offset: u64,
    size: u64,
    priority: Priority,
    deadline: Option<Instant>,
    allocator: Option<Arc<dyn RequestMemoryAllocator>>,
}

impl ReadRequest {
    pub fn new(
        path: RequestPath,
        offset: u64,
        size: u64,
    ) -> Self {
        ReadRequest {
            path,
            offset,
            size,
            priority: Priority::default(),
            deadline: None,
            allocator: None,
        }
    }

    pub fn with_priority(
        mut self,
        priority: Priority,
    ) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(
        mut self,
        deadline: Instant,
    ) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Memory for the read comes from this allocator instead of the streamer's default one
    pub fn with_allocator(
        mut self,
        allocator: Arc<dyn RequestMemoryAllocator>,
    ) -> Self {
        self.allocator = Some(allocator);
        self
    }
}

enum StreamerMessage {
    Request(FileRequest),
    CollectStatistics(Sender<Vec<Statistic>>),
    Shutdown,
}

/// Runs a stream stack on its own thread. Requests can be queued from any thread and complete
/// through callbacks that are called on the streamer thread.
pub struct Streamer {
    request_tx: Sender<StreamerMessage>,
    resume: EventHandle,
    request_ids: Arc<AtomicU64>,
    default_allocator: Arc<dyn RequestMemoryAllocator>,
    join_handle: Option<JoinHandle<()>>,
}

impl Streamer {
    /// Builds the stack described by `config`. Falls back to the default stack if the config
    /// doesn't produce any entries.
    pub fn new(
        config: &StreamerConfig,
        hardware: &HardwareInformation,
        aliases: Arc<FileIoAliases>,
        settings: StreamerSettings,
    ) -> StreamerResult<Self> {
        let stack = match config.build_stack(hardware) {
            Some(stack) => stack,
            None => {
                log::warn!("Falling back to the default stream stack");
                StreamerConfig::default_stack()
                    .build_stack(hardware)
                    .ok_or(StreamerError::NoStorageAvailable)?
            }
        };

        Self::with_stack(stack, aliases, settings)
    }

    pub fn with_stack(
        stack: Box<dyn StreamStackEntry>,
        aliases: Arc<FileIoAliases>,
        settings: StreamerSettings,
    ) -> StreamerResult<Self> {
        let request_ids = Arc::new(AtomicU64::new(1));
        let context = StreamerContext::new(request_ids.clone());
        let resume = context.thread_sync().resume_handle();
        let scheduler = Scheduler::new(aliases, settings.aging_interval, &*stack);
        let (request_tx, request_rx) = crossbeam_channel::unbounded();

        let thread_name = settings.thread_name.clone();
        let join_handle = std::thread::Builder::new()
            .name(settings.thread_name)
            .spawn(move || {
                profiling::register_thread!(&thread_name);
                run_streamer_thread(stack, scheduler, context, request_rx);
            })?;

        Ok(Streamer {
            request_tx,
            resume,
            request_ids,
            default_allocator: Arc::new(DefaultRequestMemoryAllocator::new()),
            join_handle: Some(join_handle),
        })
    }

    pub fn default_allocator(&self) -> &Arc<dyn RequestMemoryAllocator> {
        &self.default_allocator
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(
            self.request_ids
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }

    fn queue_request(
        &self,
        command: FileRequestCommand,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> FileRequestHandle {
        let (handle, status) = FileRequestHandle::new(self.next_request_id());
        let request = FileRequest::new(handle.id(), command, priority, deadline)
            .with_shared_status(status);

        // If the thread is gone the request is dropped here, which reports ShuttingDown
        if self
            .request_tx
            .send(StreamerMessage::Request(request))
            .is_err()
        {
            log::warn!("Request {:?} queued after the streamer stopped", handle.id());
        }
        self.resume.signal();
        handle
    }

    /// Reads a range of a file into memory from the request's allocator. The callback is called
    /// exactly once, on the streamer thread.
    pub fn read(
        &self,
        request: ReadRequest,
        callback: impl FnOnce(ReadCompletion) + Send + 'static,
    ) -> FileRequestHandle {
        let allocator = request
            .allocator
            .unwrap_or_else(|| self.default_allocator.clone());
        self.queue_request(
            FileRequestCommand::ReadRequest(ReadRequestData {
                path: request.path,
                offset: request.offset,
                size: request.size,
                allocator,
                buffer: None,
                callback: Some(Box::new(callback)),
            }),
            request.priority,
            request.deadline,
        )
    }

    /// Cancels the request if it hasn't completed yet. Requests that are already being read from
    /// disk complete as canceled once the read finishes.
    pub fn cancel(
        &self,
        target: &FileRequestHandle,
    ) -> FileRequestHandle {
        self.queue_request(
            FileRequestCommand::Cancel(CancelData {
                target: target.id(),
            }),
            Priority::HIGHEST,
            None,
        )
    }

    pub fn reschedule(
        &self,
        target: &FileRequestHandle,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> FileRequestHandle {
        self.queue_request(
            FileRequestCommand::Reschedule(RescheduleData {
                target: target.id(),
                priority,
                deadline,
            }),
            Priority::HIGHEST,
            None,
        )
    }

    /// Closes cached handles and forgets cached metadata for the file, for instance because it's
    /// about to be modified
    pub fn flush(
        &self,
        path: RequestPath,
    ) -> FileRequestHandle {
        self.queue_request(
            FileRequestCommand::Flush(FlushData { path }),
            Priority::HIGHEST,
            None,
        )
    }

    pub fn flush_all(&self) -> FileRequestHandle {
        self.queue_request(FileRequestCommand::FlushAll, Priority::HIGHEST, None)
    }

    pub fn file_exists(
        &self,
        path: RequestPath,
        callback: impl FnOnce(RequestId, StreamerResult<bool>) + Send + 'static,
    ) -> FileRequestHandle {
        self.queue_request(
            FileRequestCommand::FileExistsCheck(FileExistsCheckData {
                path,
                found: false,
                callback: Some(Box::new(callback)),
            }),
            Priority::MEDIUM,
            None,
        )
    }

    pub fn file_meta_data(
        &self,
        path: RequestPath,
        callback: impl FnOnce(RequestId, StreamerResult<FileMetaData>) + Send + 'static,
    ) -> FileRequestHandle {
        self.queue_request(
            FileRequestCommand::FileMetaDataRetrieval(FileMetaDataRetrievalData {
                path,
                file_size: 0,
                callback: Some(Box::new(callback)),
            }),
            Priority::MEDIUM,
            None,
        )
    }

    /// Blocks until the streamer thread has gathered statistics from every stack entry
    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let (statistics_tx, statistics_rx) = crossbeam_channel::bounded(1);
        if self
            .request_tx
            .send(StreamerMessage::CollectStatistics(statistics_tx))
            .is_err()
        {
            return Vec::default();
        }
        self.resume.signal();
        statistics_rx.recv().unwrap_or_default()
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        let _ = self.request_tx.send(StreamerMessage::Shutdown);
        self.resume.signal();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::error!("Streamer thread panicked");
            }
        }
    }
}

fn run_streamer_thread(
    mut stack: Box<dyn StreamStackEntry>,
    mut scheduler: Scheduler,
    mut context: StreamerContext,
    request_rx: Receiver<StreamerMessage>,
) {
    log::info!("Streamer thread started");
    'running: loop {
        profiling::scope!("Streamer loop");

        loop {
            match request_rx.try_recv() {
                Ok(StreamerMessage::Request(request)) => {
                    scheduler.queue_request(request, &mut *stack, &mut context)
                }
                Ok(StreamerMessage::CollectStatistics(statistics_tx)) => {
                    let mut statistics = vec![Statistic::new(
                        "Streamer",
                        "Completed requests",
                        context.num_completed_requests() as f64,
                    )];
                    scheduler.collect_statistics(&mut statistics);
                    stack.collect_statistics(&mut statistics);
                    let _ = statistics_tx.send(statistics);
                }
                Ok(StreamerMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                    break 'running
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let mut did_work = scheduler.dispatch_requests(&mut *stack, &mut context);
        did_work |= stack.execute_requests(&mut context);
        did_work |= context.finalize_completed_requests();

        if !did_work {
            let mut status = StreamStackStatus::default();
            stack.update_status(&mut status);
            status.include_deadline(scheduler.next_deadline());
            context.suspend_until(status.next_deadline);
        }
    }

    log::info!("Streamer thread shutting down");
    scheduler.shutdown(&mut context);
    context.finalize_completed_requests();

    // The stack goes first so reads still running finish before the buffers they write to are
    // released. Requests that never completed report ShuttingDown when they're dropped.
    drop(stack);
    drop(context);
}
