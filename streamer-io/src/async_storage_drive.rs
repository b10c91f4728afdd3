use crate::context::StreamerContext;
use crate::file_io::{open_for_read, read_at, FileHandleCache, FileOpenOptions, OpenFile};
use crate::file_request::{FileRequest, FileRequestCommand, RequestId, RequestStatus};
use crate::hardware::DriveInformation;
use crate::scheduling::{earliest_deadline, select_next_request, ReadPosition, SchedulingPolicy};
use crate::stack_entry::{
    forward_request, is_request_for, StreamStackEntry, StreamStackStatus, Statistic,
};
use crate::storage_drive::{check_read_result, handle_meta_data_request};
use crate::thread_sync::EventHandle;
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Instant;
use streamer_base::hashing::HashMap;
use streamer_base::{BufferWindow, Recommendations, RequestPath, StreamerError};

/// Upper limit on concurrent reads per drive. Every in-flight read holds one of the streamer's
/// event slots.
pub const MAX_IO_CHANNELS: u32 = 16;

struct ReadJob {
    request_id: RequestId,
    path: String,
    file: OpenFile,
    // Used to reopen the file if the unbuffered read gets rejected
    options: FileOpenOptions,
    offset: u64,
    size: usize,
    output: BufferWindow,
    event: EventHandle,
}

struct ReadJobResult {
    request_id: RequestId,
    result: std::io::Result<usize>,
}

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct ReadWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ReadWorkerThread {
    fn new(
        drive_name: &str,
        request_rx: Receiver<ReadJob>,
        result_tx: Sender<ReadJobResult>,
        thread_index: usize,
    ) -> std::io::Result<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let thread_name = format!("{} IO {}", drive_name, thread_index);
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                profiling::register_thread!(&thread_name);
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let mut job = match msg {
                                Ok(job) => job,
                                Err(_) => return,
                            };

                            profiling::scope!("ReadJob");
                            log::trace!("Start read {:?} at {} ({} bytes)", job.request_id, job.offset, job.size);
                            let result = run_read_job(&mut job);

                            // Send before signaling so the streamer thread finds the result when it wakes up
                            if result_tx.send(ReadJobResult {
                                request_id: job.request_id,
                                result,
                            }).is_err() {
                                return;
                            }
                            job.event.signal();
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(ReadWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

fn run_read_job(job: &mut ReadJob) -> std::io::Result<usize> {
    // SAFETY: The request that owns the buffer is parked until this job's result is received, and
    // windows handed to jobs never overlap
    let buffer = unsafe { job.output.as_mut_slice() };
    let size = job.size.min(buffer.len());
    let result = read_at(&job.file.file, job.offset, &mut buffer[..size]);

    // Some file systems accept unbuffered handles but then reject the reads
    match result {
        Err(e) if job.file.unbuffered && e.kind() == std::io::ErrorKind::InvalidInput => {
            log::debug!("Unbuffered read of '{}' rejected ({}), retrying buffered", job.path, e);
            let file = open_for_read(&job.path, job.options.buffered())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            read_at(&file.file, job.offset, &mut buffer[..size])
        }
        result => result,
    }
}

// Spans N threads, proxies jobs to them, and stops the threads when the pool is dropped
struct ReadWorkerPool {
    worker_threads: Vec<ReadWorkerThread>,
    request_tx: Sender<ReadJob>,
}

impl ReadWorkerPool {
    fn new(
        drive_name: &str,
        thread_count: usize,
        result_tx: Sender<ReadJobResult>,
    ) -> std::io::Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ReadJob>();
        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            worker_threads.push(ReadWorkerThread::new(
                drive_name,
                request_rx.clone(),
                result_tx.clone(),
                thread_index,
            )?);
        }

        Ok(ReadWorkerPool {
            worker_threads,
            request_tx,
        })
    }

    fn add_job(
        &self,
        job: ReadJob,
    ) -> bool {
        self.request_tx.send(job).is_ok()
    }
}

impl Drop for ReadWorkerPool {
    // Jobs that already started run to completion, the ones still queued are dropped
    fn drop(&mut self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads.drain(..) {
            if worker_thread.join_handle.join().is_err() {
                log::error!("Read worker thread panicked");
            }
        }
    }
}

struct InFlightRead {
    request: FileRequest,
    event: EventHandle,
    file_size: u64,
    cancel_requested: bool,
}

/// Drive that serves the files under its mount points with a pool of worker threads, keeping up to
/// `io_channel_count` reads in flight at a time.
pub struct AsyncStorageDrive {
    name: String,
    next: Option<Box<dyn StreamStackEntry>>,
    drive_paths: Vec<PathBuf>,
    physical_sector_size: u32,
    logical_sector_size: u32,
    max_in_flight: usize,
    overcommit: usize,
    policy: SchedulingPolicy,
    pending: Vec<FileRequest>,
    in_flight: HashMap<RequestId, InFlightRead>,
    file_cache: FileHandleCache,
    // Started on the first read so drives that are never used don't cost any threads
    workers: Option<ReadWorkerPool>,
    result_tx: Sender<ReadJobResult>,
    result_rx: Receiver<ReadJobResult>,
    last_position: Option<ReadPosition>,
    num_reads: u64,
    bytes_read: u64,
    num_canceled: u64,
    num_deadlines_missed: u64,
}

impl AsyncStorageDrive {
    pub fn new(
        drive: &DriveInformation,
        max_file_handles: u32,
        max_meta_data_cache: u32,
        overcommit: u32,
        options: FileOpenOptions,
    ) -> Self {
        assert!(!drive.paths.is_empty(), "Expected at least one drive path.");

        let io_channel_count = drive.io_channel_count.clamp(1, MAX_IO_CHANNELS);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let name = format!("Storage drive ({})", drive.paths[0]);
        log::info!(
            "Created {} with {} io channels, overcommit {}, unbuffered reads: {}",
            name,
            io_channel_count,
            overcommit,
            options.unbuffered
        );

        AsyncStorageDrive {
            name,
            next: None,
            drive_paths: drive.paths.iter().map(PathBuf::from).collect(),
            physical_sector_size: drive.physical_sector_size.max(1),
            logical_sector_size: drive.logical_sector_size.max(1),
            max_in_flight: io_channel_count as usize,
            overcommit: overcommit as usize,
            policy: SchedulingPolicy {
                has_seek_penalty: drive.has_seek_penalty,
                ..Default::default()
            },
            pending: Vec::default(),
            in_flight: HashMap::default(),
            file_cache: FileHandleCache::new(max_file_handles, max_meta_data_cache, options),
            workers: None,
            result_tx,
            result_rx,
            last_position: None,
            num_reads: 0,
            bytes_read: 0,
            num_canceled: 0,
            num_deadlines_missed: 0,
        }
    }

    pub fn drive_paths(&self) -> &[PathBuf] {
        &self.drive_paths
    }

    fn serves_path(
        &self,
        path: &RequestPath,
    ) -> bool {
        match path.resolved_absolute_path() {
            Some(absolute_path) => self
                .drive_paths
                .iter()
                .any(|drive_path| Path::new(absolute_path).starts_with(drive_path)),
            None => false,
        }
    }

    fn sector_alignment(&self) -> usize {
        self.physical_sector_size.max(self.logical_sector_size) as usize
    }

    fn workers(&mut self) -> Option<&ReadWorkerPool> {
        if self.workers.is_none() {
            match ReadWorkerPool::new(&self.name, self.max_in_flight, self.result_tx.clone()) {
                Ok(workers) => self.workers = Some(workers),
                Err(e) => {
                    log::error!("Failed to start read threads for {}: {}", self.name, e);
                    return None;
                }
            }
        }
        self.workers.as_ref()
    }

    fn expire_pending_requests(
        &mut self,
        now: Instant,
        context: &mut StreamerContext,
    ) {
        let (expired, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|request| request.is_past_deadline(now));
        self.pending = remaining;
        for mut request in expired {
            self.num_deadlines_missed += 1;
            request.fail(StreamerError::DeadlineExceeded);
            context.mark_request_as_completed(request);
        }
    }

    fn issue_read(
        &mut self,
        mut request: FileRequest,
        context: &mut StreamerContext,
    ) {
        profiling::scope!("AsyncStorageDrive::issue_read");
        let alignment = self.sector_alignment();
        let data = match request.command_mut() {
            FileRequestCommand::Read(data) => data,
            _ => {
                forward_request(self.next.as_deref_mut(), request, context);
                return;
            }
        };

        let file_size = match self.file_cache.file_size(&data.path) {
            Ok(file_size) => file_size,
            Err(e) => {
                request.fail(e);
                context.mark_request_as_completed(request);
                return;
            }
        };
        if data.offset >= file_size && data.required_end > data.offset {
            let error = StreamerError::ReadPastEndOfFile {
                file_size,
                offset: data.offset,
                size: data.size,
            };
            request.fail(error);
            context.mark_request_as_completed(request);
            return;
        }

        let mut file = match self.file_cache.open(&data.path) {
            Ok(file) => file,
            Err(e) => {
                request.fail(e);
                context.mark_request_as_completed(request);
                return;
            }
        };

        let output = match data.output.take() {
            Some(output) => output,
            None => {
                request.fail("Read request has no output buffer".into());
                context.mark_request_as_completed(request);
                return;
            }
        };

        // Unbuffered handles can only serve sector aligned reads
        let aligned = data.offset % alignment as u64 == 0
            && output.len() % alignment == 0
            && output.is_aligned(alignment);
        if file.unbuffered && !aligned {
            log::debug!(
                "Read of '{}' at {} isn't sector aligned, reading buffered",
                data.path,
                data.offset
            );
            let options = self.file_cache.options().buffered();
            match data
                .path
                .resolved_absolute_path()
                .map(|path| open_for_read(path, options))
            {
                Some(Ok(buffered)) => file = buffered,
                Some(Err(e)) => {
                    request.fail(e);
                    context.mark_request_as_completed(request);
                    return;
                }
                None => {
                    let error = StreamerError::InvalidPath(data.path.to_string());
                    request.fail(error);
                    context.mark_request_as_completed(request);
                    return;
                }
            }
        }

        let size = if file.unbuffered {
            output.len()
        } else {
            (data.size as usize).min(output.len())
        };
        let offset = data.offset;
        self.last_position = Some(ReadPosition {
            path_hash: data.path.cached_hash(),
            end_offset: data.offset.saturating_add(data.size),
        });

        let path = data.path.to_string();
        let event = context.thread_sync_mut().create_event_handle();
        let job = ReadJob {
            request_id: request.id(),
            path,
            file,
            options: self.file_cache.options(),
            offset,
            size,
            output,
            event: event.clone(),
        };

        let added = match self.workers() {
            Some(workers) => workers.add_job(job),
            None => false,
        };
        if !added {
            context.thread_sync_mut().destroy_event_handle(&event);
            request.fail("Unable to hand the read to a worker thread".into());
            context.mark_request_as_completed(request);
            return;
        }

        request.set_status(RequestStatus::Processing);
        self.in_flight.insert(
            request.id(),
            InFlightRead {
                request,
                event,
                file_size,
                cancel_requested: false,
            },
        );
    }

    fn complete_read(
        &mut self,
        result: ReadJobResult,
        context: &mut StreamerContext,
    ) {
        let in_flight = match self.in_flight.remove(&result.request_id) {
            Some(in_flight) => in_flight,
            None => {
                log::error!("Received a read result for unknown request {:?}", result.request_id);
                return;
            }
        };
        context.thread_sync_mut().destroy_event_handle(&in_flight.event);

        let mut request = in_flight.request;
        if in_flight.cancel_requested {
            self.num_canceled += 1;
            request.fail(StreamerError::Canceled);
        } else {
            match result.result {
                Ok(bytes_read) => {
                    self.num_reads += 1;
                    self.bytes_read += bytes_read as u64;
                    if let FileRequestCommand::Read(data) = request.command() {
                        log::trace!("Read {} bytes at {} from '{}'", bytes_read, data.offset, data.path);
                        if let Err(e) = check_read_result(data, bytes_read, in_flight.file_size) {
                            request.fail(e);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Read {:?} failed: {}", request.id(), e);
                    request.fail(e.into());
                }
            }
        }

        context.mark_request_as_completed(request);
    }

    fn cancel_requests(
        &mut self,
        cancel: &FileRequest,
        context: &mut StreamerContext,
    ) {
        let (canceled, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| is_request_for(pending, cancel.command()));
        self.pending = remaining;
        for mut request in canceled {
            self.num_canceled += 1;
            request.fail(StreamerError::Canceled);
            context.mark_request_as_completed(request);
        }

        // Reads on the workers can't be stopped, they complete as canceled when they come back
        for in_flight in self.in_flight.values_mut() {
            if is_request_for(&in_flight.request, cancel.command()) {
                in_flight.cancel_requested = true;
            }
        }
    }
}

impl StreamStackEntry for AsyncStorageDrive {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_next(
        &mut self,
        next: Option<Box<dyn StreamStackEntry>>,
    ) {
        self.next = next;
    }

    fn next(&self) -> Option<&(dyn StreamStackEntry + 'static)> {
        self.next.as_deref()
    }

    fn next_mut(&mut self) -> Option<&mut (dyn StreamStackEntry + 'static)> {
        self.next.as_deref_mut()
    }

    fn queue_request(
        &mut self,
        request: FileRequest,
        context: &mut StreamerContext,
    ) {
        // Broadcast commands like Flush have a path too, but every drive has to see those
        let serves_request = !request.command().is_broadcast()
            && request
                .command()
                .path()
                .map_or(false, |path| self.serves_path(path));

        if serves_request {
            let mut request =
                match handle_meta_data_request(request, &mut self.file_cache, context) {
                    Some(request) => request,
                    None => return,
                };
            request.set_status(RequestStatus::Queued);
            self.pending.push(request);
            return;
        }

        match request.command() {
            FileRequestCommand::Cancel(_) => self.cancel_requests(&request, context),
            FileRequestCommand::Reschedule(data) => {
                for pending in &mut self.pending {
                    if pending.root_id() == data.target {
                        pending.reschedule(data.priority, data.deadline);
                    }
                }
            }
            FileRequestCommand::Flush(data) => self.file_cache.flush(&data.path),
            FileRequestCommand::FlushAll => self.file_cache.flush_all(),
            _ => {}
        }

        forward_request(self.next.as_deref_mut(), request, context);
    }

    fn execute_requests(
        &mut self,
        context: &mut StreamerContext,
    ) -> bool {
        profiling::scope!("AsyncStorageDrive::execute_requests");
        let mut did_work = false;

        while let Ok(result) = self.result_rx.try_recv() {
            self.complete_read(result, context);
            did_work = true;
        }

        let now = Instant::now();
        let pending_before = self.pending.len();
        self.expire_pending_requests(now, context);
        did_work |= self.pending.len() != pending_before;

        while self.in_flight.len() < self.max_in_flight
            && context.thread_sync().are_event_handles_available()
        {
            let index = match select_next_request(
                &self.pending,
                now,
                &self.policy,
                self.last_position.as_ref(),
            ) {
                Some(index) => index,
                None => break,
            };
            let request = self.pending.swap_remove(index);
            self.issue_read(request, context);
            did_work = true;
        }

        match self.next.as_deref_mut() {
            Some(next) => next.execute_requests(context) || did_work,
            None => did_work,
        }
    }

    fn update_status(
        &self,
        status: &mut StreamStackStatus,
    ) {
        let capacity = (self.max_in_flight + self.overcommit) as i64;
        let in_use = (self.pending.len() + self.in_flight.len()) as i64;
        status.num_available_slots = status.num_available_slots.min(capacity - in_use);
        status.is_idle &= self.pending.is_empty() && self.in_flight.is_empty();
        status.include_deadline(earliest_deadline(self.pending.iter()));
        if let Some(next) = self.next() {
            next.update_status(status);
        }
    }

    fn update_recommendations(
        &self,
        recommendations: &mut Recommendations,
    ) {
        if self.file_cache.options().unbuffered {
            let alignment = self.sector_alignment();
            recommendations.memory_alignment = recommendations.memory_alignment.max(alignment);
            recommendations.size_alignment = recommendations.size_alignment.max(alignment as u64);
        }
        recommendations.max_concurrent_requests = recommendations
            .max_concurrent_requests
            .max((self.max_in_flight + self.overcommit) as u64);
        if let Some(next) = self.next() {
            next.update_recommendations(recommendations);
        }
    }

    fn collect_statistics(
        &self,
        statistics: &mut Vec<Statistic>,
    ) {
        statistics.push(Statistic::new(&self.name, "Reads", self.num_reads as f64));
        statistics.push(Statistic::new(&self.name, "Bytes read", self.bytes_read as f64));
        statistics.push(Statistic::new(&self.name, "Pending", self.pending.len() as f64));
        statistics.push(Statistic::new(&self.name, "In flight", self.in_flight.len() as f64));
        statistics.push(Statistic::new(&self.name, "Canceled", self.num_canceled as f64));
        statistics.push(Statistic::new(
            &self.name,
            "Deadlines missed",
            self.num_deadlines_missed as f64,
        ));
        statistics.push(Statistic::new(
            &self.name,
            "Open file handles",
            self.file_cache.num_open_handles() as f64,
        ));
        if let Some(next) = self.next() {
            next.collect_statistics(statistics);
        }
    }
}

impl Drop for AsyncStorageDrive {
    fn drop(&mut self) {
        // Wait for reads still running on the workers before the requests that own their buffers go
        self.workers.take();
    }
}
