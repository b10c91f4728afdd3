use crate::context::StreamerContext;
use crate::drive_config::{AsyncStorageDriveConfig, StorageDriveConfig};
use crate::file_request::{
    CancelData, FileRequest, FileRequestCommand, FileRequestHandle, Priority, ReadCompletion,
    ReadRequestData, RequestId, RequestStatus, RescheduleData,
};
use crate::hardware::{DriveInformation, HardwareInformation};
use crate::read_splitter::ReadSplitterConfig;
use crate::scheduler::Scheduler;
use crate::stack_config::{StreamerConfig, StreamerStackConfig};
use crate::stack_entry::{StreamStackEntry, StreamStackStatus};
use crate::storage_drive::StorageDrive;
use crate::streamer::{ReadRequest, Streamer, StreamerSettings};
use crossbeam_channel::Receiver;
use std::alloc::{GlobalAlloc, Layout};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use streamer_base::{
    DefaultRequestMemoryAllocator, FileIoAliases, RequestMemoryAllocator, RequestPath,
    StreamerError,
};
use uuid::Uuid;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Directory with test files that is removed when the test ends
struct TestDirectory {
    path: PathBuf,
}

impl TestDirectory {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("streamer-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        TestDirectory { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(
        &self,
        name: &str,
        contents: &[u8],
    ) {
        std::fs::write(self.path.join(name), contents).unwrap();
    }

    fn aliases(&self) -> Arc<FileIoAliases> {
        let mut aliases = FileIoAliases::new();
        aliases.set_alias("@assets@", self.path.to_string_lossy().to_string());
        Arc::new(aliases)
    }
}

impl Drop for TestDirectory {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn hardware_for(directory: &TestDirectory) -> HardwareInformation {
    let mut hardware = HardwareInformation::default();
    hardware.max_transfer = 64 * 1024;
    hardware.set_drive_list(vec![DriveInformation {
        paths: vec![directory.path().to_string_lossy().to_string()],
        io_channel_count: 2,
        physical_sector_size: 4096,
        logical_sector_size: 4096,
        has_seek_penalty: false,
        ..Default::default()
    }]);
    hardware
}

fn async_stack_config(split_size: u64) -> StreamerConfig {
    StreamerConfig {
        stack_config: vec![
            Box::new(StorageDriveConfig::default()),
            Box::new(AsyncStorageDriveConfig::default()),
            Box::new(ReadSplitterConfig { split_size }),
        ],
    }
}

fn read_and_wait(
    streamer: &Streamer,
    request: ReadRequest,
) -> (FileRequestHandle, ReadCompletion) {
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let handle = streamer.read(request, move |completion| {
        result_tx.send(completion).unwrap();
    });
    let completion = result_rx.recv_timeout(RECEIVE_TIMEOUT).unwrap();
    (handle, completion)
}

fn wait_until_finished(handle: &FileRequestHandle) {
    let timeout = Instant::now() + RECEIVE_TIMEOUT;
    while !handle.is_finished() {
        assert!(Instant::now() < timeout, "Request {:?} didn't finish", handle.id());
        std::thread::sleep(Duration::from_millis(1));
    }
}

//
// End to end runs through the streamer thread
//

#[test]
fn read_with_generic_stack() {
    init_logging();
    let directory = TestDirectory::new();
    let contents = test_data(1000);
    directory.write_file("data.bin", &contents);

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (handle, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), 3, 10),
    );
    assert_eq!(completion.request_id, handle.id());
    assert!(!completion.completed_past_deadline);
    let buffer = completion.result.unwrap();
    assert_eq!(buffer.data(), &contents[3..13]);
    assert_eq!(handle.status(), RequestStatus::Completed);
}

#[test]
fn read_with_async_drive_and_splitter() {
    init_logging();
    let directory = TestDirectory::new();
    let contents = test_data(100_000);
    directory.write_file("large.bin", &contents);

    let streamer = Streamer::new(
        &async_stack_config(8192),
        &hardware_for(&directory),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("@assets@/large.bin"), 0, 100_000),
    );
    assert_eq!(completion.result.unwrap().data(), contents.as_slice());

    // Unaligned range in the middle of the file
    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("large.bin"), 1234, 30_000),
    );
    assert_eq!(completion.result.unwrap().data(), &contents[1234..31234]);

    // Unaligned range that ends at the end of the file
    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("large.bin"), 99_000, 1000),
    );
    assert_eq!(completion.result.unwrap().data(), &contents[99_000..]);

    let statistics = streamer.collect_statistics();
    let drive_name = format!("Storage drive ({})", directory.path().to_string_lossy());
    let drive_reads = statistics
        .iter()
        .find(|statistic| statistic.owner == drive_name && statistic.name == "Reads")
        .map(|statistic| statistic.value)
        .unwrap();
    assert!(drive_reads >= 3.0);
    let generic_reads = statistics
        .iter()
        .find(|statistic| statistic.owner == "Storage drive (generic)" && statistic.name == "Reads")
        .map(|statistic| statistic.value)
        .unwrap();
    assert_eq!(generic_reads, 0.0);
}

#[test]
fn many_concurrent_reads() {
    init_logging();
    let directory = TestDirectory::new();
    let contents = test_data(64 * 1024);
    directory.write_file("data.bin", &contents);

    let streamer = Streamer::new(
        &async_stack_config(4096),
        &hardware_for(&directory),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let count = 200;
    for i in 0..count {
        let result_tx = result_tx.clone();
        let offset = (i * 317) % 60_000;
        streamer.read(
            ReadRequest::new(RequestPath::from_relative_path("data.bin"), offset as u64, 1000),
            move |completion| {
                result_tx.send((offset, completion)).unwrap();
            },
        );
    }

    for _ in 0..count {
        let (offset, completion) = result_rx.recv_timeout(RECEIVE_TIMEOUT).unwrap();
        assert_eq!(
            completion.result.unwrap().data(),
            &contents[offset..offset + 1000]
        );
    }
}

#[test]
fn read_errors() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("small.bin", &test_data(100));

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (handle, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("@unknown@/small.bin"), 0, 10),
    );
    assert!(matches!(completion.result, Err(StreamerError::InvalidPath(_))));
    assert_eq!(handle.status(), RequestStatus::Failed);

    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("missing.bin"), 0, 10),
    );
    assert!(matches!(completion.result, Err(StreamerError::FileNotFound(_))));

    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("small.bin"), 50, 100),
    );
    assert!(matches!(
        completion.result,
        Err(StreamerError::ReadPastEndOfFile { .. })
    ));

    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("small.bin"), 200, 10),
    );
    assert!(matches!(
        completion.result,
        Err(StreamerError::ReadPastEndOfFile { .. })
    ));
}

#[test]
fn out_of_range_read_fails_without_stopping_the_streamer() {
    init_logging();
    let directory = TestDirectory::new();
    let contents = test_data(100);
    directory.write_file("data.bin", &contents);

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (handle, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), u64::MAX - 2, 10),
    );
    assert!(matches!(
        completion.result,
        Err(StreamerError::InvalidRange {
            offset,
            size: 10
        }) if offset == u64::MAX - 2
    ));
    assert_eq!(handle.status(), RequestStatus::Failed);

    // The streamer thread is still serving requests
    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), 3, 10),
    );
    assert_eq!(completion.result.unwrap().data(), &contents[3..13]);
}

#[test]
fn zero_size_read_completes() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(10));

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), 5, 0),
    );
    assert!(completion.result.unwrap().data().is_empty());
}

#[test]
fn expired_deadline_is_never_read() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(10));

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let deadline = Instant::now();
    std::thread::sleep(Duration::from_millis(5));
    let (handle, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), 0, 10).with_deadline(deadline),
    );
    assert!(matches!(completion.result, Err(StreamerError::DeadlineExceeded)));
    assert_eq!(handle.status(), RequestStatus::Failed);
}

// Backing allocator that never has memory available
struct ExhaustedAllocator;

unsafe impl GlobalAlloc for ExhaustedAllocator {
    unsafe fn alloc(
        &self,
        _layout: Layout,
    ) -> *mut u8 {
        std::ptr::null_mut()
    }

    unsafe fn dealloc(
        &self,
        _ptr: *mut u8,
        _layout: Layout,
    ) {
    }
}

#[test]
fn out_of_memory() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(10));

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let allocator: Arc<dyn RequestMemoryAllocator> =
        Arc::new(DefaultRequestMemoryAllocator::with_allocator(ExhaustedAllocator));
    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), 0, 10)
            .with_allocator(allocator.clone()),
    );
    assert!(matches!(
        completion.result,
        Err(StreamerError::OutOfMemory { .. })
    ));
    assert_eq!(allocator.num_locks(), 0);
}

#[test]
fn buffers_are_returned_to_their_allocator() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(5000));

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let allocator = Arc::new(DefaultRequestMemoryAllocator::new());
    let (_, completion) = read_and_wait(
        &streamer,
        ReadRequest::new(RequestPath::from_relative_path("data.bin"), 100, 4000)
            .with_allocator(allocator.clone()),
    );
    let buffer = completion.result.unwrap();
    assert_eq!(allocator.num_locks(), 1);
    assert_eq!(allocator.allocation_count(), 1);

    drop(buffer);
    assert_eq!(allocator.num_locks(), 0);
    assert_eq!(allocator.allocation_count(), 0);
}

#[test]
fn file_queries_and_flushes() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(1234));

    let streamer = Streamer::new(
        &async_stack_config(0),
        &hardware_for(&directory),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let tx = result_tx.clone();
    streamer.file_exists(RequestPath::from_relative_path("data.bin"), move |_, result| {
        tx.send(result).unwrap()
    });
    let tx = result_tx.clone();
    streamer.file_exists(RequestPath::from_relative_path("missing.bin"), move |_, result| {
        tx.send(result).unwrap()
    });
    let tx = result_tx;
    streamer.file_exists(RequestPath::from_relative_path("@nope@/data.bin"), move |_, result| {
        tx.send(result).unwrap()
    });
    let mut results: Vec<bool> = (0..3)
        .map(|_| result_rx.recv_timeout(RECEIVE_TIMEOUT).unwrap().unwrap())
        .collect();
    results.sort();
    assert_eq!(results, vec![false, false, true]);

    let (size_tx, size_rx) = crossbeam_channel::bounded(1);
    streamer.file_meta_data(RequestPath::from_relative_path("data.bin"), move |_, result| {
        size_tx.send(result).unwrap()
    });
    assert_eq!(
        size_rx.recv_timeout(RECEIVE_TIMEOUT).unwrap().unwrap().file_size,
        1234
    );

    let flush = streamer.flush(RequestPath::from_relative_path("data.bin"));
    let flush_all = streamer.flush_all();
    wait_until_finished(&flush);
    wait_until_finished(&flush_all);
    assert_eq!(flush.status(), RequestStatus::Completed);
    assert_eq!(flush_all.status(), RequestStatus::Completed);
}

#[test]
fn dropping_streamer_reports_unfinished_requests() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(1000));

    let streamer = Streamer::new(
        &StreamerConfig::default_stack(),
        &HardwareInformation::default(),
        directory.aliases(),
        StreamerSettings::default(),
    )
    .unwrap();

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    for _ in 0..50 {
        let result_tx = result_tx.clone();
        streamer.read(
            ReadRequest::new(RequestPath::from_relative_path("data.bin"), 0, 1000),
            move |completion| result_tx.send(completion).unwrap(),
        );
    }
    drop(streamer);

    // Every request got an answer, either the data or a shutdown notice
    let completions: Vec<ReadCompletion> = result_rx.try_iter().collect();
    assert_eq!(completions.len(), 50);
    for completion in completions {
        match completion.result {
            Ok(buffer) => assert_eq!(buffer.len(), 1000),
            Err(e) => assert!(matches!(e, StreamerError::ShuttingDown)),
        }
    }
}

//
// Driving the stack by hand, so the order of events is deterministic
//

struct StackHarness {
    stack: Box<dyn StreamStackEntry>,
    scheduler: Scheduler,
    context: StreamerContext,
    allocator: Arc<dyn RequestMemoryAllocator>,
}

impl StackHarness {
    fn new(
        stack: Box<dyn StreamStackEntry>,
        aliases: Arc<FileIoAliases>,
    ) -> Self {
        // Long aging interval so priorities don't change while a test runs
        let scheduler = Scheduler::new(aliases, Duration::from_secs(3600), &*stack);
        StackHarness {
            stack,
            scheduler,
            context: StreamerContext::new(Arc::new(AtomicU64::new(1))),
            allocator: Arc::new(DefaultRequestMemoryAllocator::new()),
        }
    }

    fn queue(
        &mut self,
        command: FileRequestCommand,
        priority: Priority,
    ) -> RequestId {
        let request = FileRequest::new(self.context.next_request_id(), command, priority, None);
        let id = request.id();
        self.scheduler
            .queue_request(request, &mut *self.stack, &mut self.context);
        id
    }

    fn queue_read(
        &mut self,
        path: &str,
        offset: u64,
        size: u64,
        priority: Priority,
        results: &Arc<Mutex<Vec<ReadCompletion>>>,
    ) -> RequestId {
        self.queue_read_with_deadline(path, offset, size, priority, None, results)
    }

    fn queue_read_with_deadline(
        &mut self,
        path: &str,
        offset: u64,
        size: u64,
        priority: Priority,
        deadline: Option<Instant>,
        results: &Arc<Mutex<Vec<ReadCompletion>>>,
    ) -> RequestId {
        let results = results.clone();
        let command = FileRequestCommand::ReadRequest(ReadRequestData {
            path: RequestPath::from_relative_path(path),
            offset,
            size,
            allocator: self.allocator.clone(),
            buffer: None,
            callback: Some(Box::new(move |completion| {
                results.lock().unwrap().push(completion)
            })),
        });
        let request = FileRequest::new(self.context.next_request_id(), command, priority, deadline);
        let id = request.id();
        self.scheduler
            .queue_request(request, &mut *self.stack, &mut self.context);
        id
    }

    fn step(&mut self) -> bool {
        let mut did_work = self
            .scheduler
            .dispatch_requests(&mut *self.stack, &mut self.context);
        did_work |= self.stack.execute_requests(&mut self.context);
        did_work |= self.context.finalize_completed_requests();
        did_work
    }

    fn is_idle(&self) -> bool {
        let mut status = StreamStackStatus::default();
        self.stack.update_status(&mut status);
        status.is_idle
            && self.scheduler.num_pending() == 0
            && self.context.num_parked_requests() == 0
            && !self.context.has_pending_completions()
    }

    fn run_until_idle(&mut self) {
        let timeout = Instant::now() + RECEIVE_TIMEOUT;
        while !self.is_idle() {
            assert!(Instant::now() < timeout, "Stream stack didn't become idle");
            if !self.step() {
                self.context
                    .suspend_until(Some(Instant::now() + Duration::from_millis(10)));
            }
        }
    }
}

fn generic_stack() -> Box<dyn StreamStackEntry> {
    Box::new(StorageDrive::new(8, 8))
}

fn async_stack(directory: &TestDirectory) -> Box<dyn StreamStackEntry> {
    async_stack_config(0)
        .build_stack(&hardware_for(directory))
        .unwrap()
}

fn completed_ids(results: &Arc<Mutex<Vec<ReadCompletion>>>) -> Vec<RequestId> {
    results
        .lock()
        .unwrap()
        .iter()
        .map(|completion| completion.request_id)
        .collect()
}

#[test]
fn higher_priority_reads_complete_first() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100));
    let mut harness = StackHarness::new(generic_stack(), directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    let low = harness.queue_read("data.bin", 0, 10, Priority::LOW, &results);
    let high = harness.queue_read("data.bin", 10, 10, Priority::HIGH, &results);
    let medium = harness.queue_read("data.bin", 20, 10, Priority::MEDIUM, &results);
    harness.run_until_idle();

    assert_eq!(completed_ids(&results), vec![high, medium, low]);
}

#[test]
fn rescheduled_read_moves_ahead() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100));
    let mut harness = StackHarness::new(generic_stack(), directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    let first = harness.queue_read("data.bin", 0, 10, Priority::MEDIUM, &results);
    let second = harness.queue_read("data.bin", 10, 10, Priority::LOW, &results);
    harness.queue(
        FileRequestCommand::Reschedule(RescheduleData {
            target: second,
            priority: Priority::HIGHEST,
            deadline: None,
        }),
        Priority::HIGHEST,
    );
    harness.run_until_idle();

    assert_eq!(completed_ids(&results), vec![second, first]);
}

#[test]
fn cancel_queued_read() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100));
    let mut harness = StackHarness::new(generic_stack(), directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    let canceled = harness.queue_read("data.bin", 0, 10, Priority::MEDIUM, &results);
    let kept = harness.queue_read("data.bin", 10, 10, Priority::MEDIUM, &results);
    harness.queue(
        FileRequestCommand::Cancel(CancelData { target: canceled }),
        Priority::HIGHEST,
    );
    harness.run_until_idle();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    for completion in results.iter() {
        if completion.request_id == canceled {
            assert!(matches!(completion.result, Err(StreamerError::Canceled)));
        } else {
            assert_eq!(completion.request_id, kept);
            assert!(completion.result.is_ok());
        }
    }
}

#[test]
fn cancel_read_waiting_in_drive() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100));
    let mut harness = StackHarness::new(generic_stack(), directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    let target = harness.queue_read("data.bin", 0, 10, Priority::MEDIUM, &results);
    // Hand the read to the drive without executing it
    harness
        .scheduler
        .dispatch_requests(&mut *harness.stack, &mut harness.context);
    assert_eq!(harness.context.num_parked_requests(), 1);

    harness.queue(
        FileRequestCommand::Cancel(CancelData { target }),
        Priority::HIGHEST,
    );
    harness.run_until_idle();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].result, Err(StreamerError::Canceled)));
}

#[test]
fn cancel_read_in_flight() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100_000));
    let mut harness = StackHarness::new(async_stack(&directory), directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    let target = harness.queue_read("data.bin", 0, 100_000, Priority::MEDIUM, &results);
    harness
        .scheduler
        .dispatch_requests(&mut *harness.stack, &mut harness.context);
    // Issues the read to a worker, its result is only picked up by the next execute
    harness.stack.execute_requests(&mut harness.context);
    assert!(harness.context.thread_sync().event_handle_count() > 0);

    harness.queue(
        FileRequestCommand::Cancel(CancelData { target }),
        Priority::HIGHEST,
    );
    harness.run_until_idle();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].result, Err(StreamerError::Canceled)));
    assert_eq!(harness.context.thread_sync().event_handle_count(), 0);
}

#[test]
fn async_drive_respects_its_channel_count() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100_000));
    let stack = AsyncStorageDriveConfig::default()
        .add_stream_stack_entry(&hardware_for(&directory), None)
        .unwrap();
    let mut harness = StackHarness::new(stack, directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20 {
        harness.queue_read("data.bin", i * 1000, 1000, Priority::MEDIUM, &results);
    }
    harness
        .scheduler
        .dispatch_requests(&mut *harness.stack, &mut harness.context);
    // Two io channels plus the default overcommit of eight
    assert_eq!(harness.scheduler.num_pending(), 10);

    harness.stack.execute_requests(&mut harness.context);
    assert!(harness.context.thread_sync().event_handle_count() <= 2);

    harness.run_until_idle();
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|completion| completion.result.is_ok()));
}

#[test]
fn deadlines_waiting_in_drive_are_reported_upward() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100));
    let stack = AsyncStorageDriveConfig::default()
        .add_stream_stack_entry(&hardware_for(&directory), None)
        .unwrap();
    let mut harness = StackHarness::new(stack, directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    let soon = Instant::now() + Duration::from_millis(50);
    let later = soon + Duration::from_secs(60);
    harness.queue_read_with_deadline("data.bin", 0, 10, Priority::MEDIUM, Some(later), &results);
    harness.queue_read_with_deadline("data.bin", 10, 10, Priority::MEDIUM, Some(soon), &results);
    harness.queue_read("data.bin", 20, 10, Priority::MEDIUM, &results);
    harness
        .scheduler
        .dispatch_requests(&mut *harness.stack, &mut harness.context);
    assert_eq!(harness.scheduler.num_pending(), 0);
    assert_eq!(harness.scheduler.next_deadline(), None);

    // Queued in the drive, not issued yet
    let mut status = StreamStackStatus::default();
    harness.stack.update_status(&mut status);
    assert_eq!(status.next_deadline, Some(soon));

    harness.run_until_idle();
    let mut status = StreamStackStatus::default();
    harness.stack.update_status(&mut status);
    assert_eq!(status.next_deadline, None);
}

#[test]
fn request_without_storage_fails() {
    init_logging();
    let directory = TestDirectory::new();
    directory.write_file("data.bin", &test_data(100));
    // Only the async drive, for a directory the file isn't in
    let other_directory = TestDirectory::new();
    let stack = AsyncStorageDriveConfig::default()
        .add_stream_stack_entry(&hardware_for(&other_directory), None)
        .unwrap();
    let mut harness = StackHarness::new(stack, directory.aliases());

    let results = Arc::new(Mutex::new(Vec::new()));
    harness.queue_read("data.bin", 0, 10, Priority::MEDIUM, &results);
    harness.run_until_idle();

    let results = results.lock().unwrap();
    assert!(matches!(
        results[0].result,
        Err(StreamerError::NoStorageAvailable)
    ));
}

#[test]
fn dropped_request_reports_shutting_down() {
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let request = FileRequest::new(
        RequestId(1),
        FileRequestCommand::ReadRequest(ReadRequestData {
            path: RequestPath::from_relative_path("data.bin"),
            offset: 0,
            size: 10,
            allocator: Arc::new(DefaultRequestMemoryAllocator::new()),
            buffer: None,
            callback: Some(Box::new(move |completion| {
                result_tx.send(completion).unwrap()
            })),
        }),
        Priority::MEDIUM,
        None,
    );
    drop(request);

    let completion: ReadCompletion = receive_now(&result_rx);
    assert!(matches!(completion.result, Err(StreamerError::ShuttingDown)));
}

fn receive_now<T>(receiver: &Receiver<T>) -> T {
    receiver.try_recv().unwrap()
}
