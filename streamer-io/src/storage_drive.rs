use crate::context::StreamerContext;
use crate::file_io::{read_at, FileHandleCache, FileOpenOptions};
use crate::file_request::{FileRequest, FileRequestCommand, ReadData, RequestStatus};
use crate::scheduling::{earliest_deadline, select_next_request, ReadPosition, SchedulingPolicy};
use crate::stack_entry::{
    forward_request, is_request_for, StreamStackEntry, StreamStackStatus, Statistic,
};
use std::time::Instant;
use streamer_base::{Recommendations, StreamerError, StreamerResult};

/// Fails reads that didn't get all the bytes the client asked for. Bytes past the required end are
/// alignment padding and may be missing at the end of the file.
pub(crate) fn check_read_result(
    data: &ReadData,
    bytes_read: usize,
    file_size: u64,
) -> StreamerResult<()> {
    let required = data.required_end.min(data.offset.saturating_add(data.size));
    if data.offset.saturating_add(bytes_read as u64) < required {
        return Err(StreamerError::ReadPastEndOfFile {
            file_size,
            offset: data.offset,
            size: required.saturating_sub(data.offset),
        });
    }
    Ok(())
}

/// Handles the commands that concern cached file state. Returns the request back if it's something
/// else.
pub(crate) fn handle_meta_data_request(
    request: FileRequest,
    file_cache: &mut FileHandleCache,
    context: &mut StreamerContext,
) -> Option<FileRequest> {
    let mut request = request;
    match request.command_mut() {
        FileRequestCommand::FileExistsCheck(data) => match file_cache.exists(&data.path) {
            Ok(found) => data.found = found,
            Err(e) => request.fail(e),
        },
        FileRequestCommand::FileMetaDataRetrieval(data) => match file_cache.file_size(&data.path) {
            Ok(file_size) => data.file_size = file_size,
            Err(e) => request.fail(e),
        },
        _ => return Some(request),
    }

    context.mark_request_as_completed(request);
    None
}

/// Drive that serves any file with plain synchronous reads on the streamer thread. Used at the
/// bottom of the stack so every request has somewhere to go, and as the whole stack on platforms
/// without hardware information.
pub struct StorageDrive {
    name: String,
    next: Option<Box<dyn StreamStackEntry>>,
    pending: Vec<FileRequest>,
    file_cache: FileHandleCache,
    policy: SchedulingPolicy,
    last_position: Option<ReadPosition>,
    num_reads: u64,
    bytes_read: u64,
}

impl StorageDrive {
    pub fn new(
        max_file_handles: u32,
        max_meta_data_cache: u32,
    ) -> Self {
        StorageDrive {
            name: "Storage drive (generic)".to_string(),
            next: None,
            pending: Vec::default(),
            file_cache: FileHandleCache::new(
                max_file_handles,
                max_meta_data_cache,
                FileOpenOptions::default(),
            ),
            policy: SchedulingPolicy::default(),
            last_position: None,
            num_reads: 0,
            bytes_read: 0,
        }
    }

    fn read_file(
        &mut self,
        request: &mut FileRequest,
    ) -> StreamerResult<()> {
        profiling::scope!("StorageDrive::read_file");
        let data = match request.command_mut() {
            FileRequestCommand::Read(data) => data,
            _ => return Err("StorageDrive can only read Read requests".into()),
        };

        let file_size = self.file_cache.file_size(&data.path)?;
        if data.offset >= file_size && data.required_end > data.offset {
            return Err(StreamerError::ReadPastEndOfFile {
                file_size,
                offset: data.offset,
                size: data.size,
            });
        }

        let open_file = self.file_cache.open(&data.path)?;
        let mut output = data
            .output
            .take()
            .ok_or_else(|| StreamerError::from("Read request has no output buffer"))?;
        // SAFETY: The parent that owns the buffer is parked until this request completes and the
        // window doesn't overlap any other in-flight window
        let buffer = unsafe { output.as_mut_slice() };
        let len = (data.size as usize).min(buffer.len());
        let bytes_read = read_at(&open_file.file, data.offset, &mut buffer[..len])?;
        log::trace!(
            "Read {} bytes at {} from '{}'",
            bytes_read,
            data.offset,
            data.path
        );

        self.num_reads += 1;
        self.bytes_read += bytes_read as u64;
        self.last_position = Some(ReadPosition {
            path_hash: data.path.cached_hash(),
            end_offset: data.offset.saturating_add(bytes_read as u64),
        });
        check_read_result(data, bytes_read, file_size)
    }
}

impl StreamStackEntry for StorageDrive {
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
        let mut request = match handle_meta_data_request(request, &mut self.file_cache, context) {
            Some(request) => request,
            None => return,
        };

        if matches!(request.command(), FileRequestCommand::Read(_)) {
            request.set_status(RequestStatus::Queued);
            self.pending.push(request);
            return;
        }

        match request.command() {
            FileRequestCommand::Cancel(_) => {
                let (canceled, remaining) = std::mem::take(&mut self.pending)
                    .into_iter()
                    .partition(|pending| is_request_for(pending, request.command()));
                self.pending = remaining;
                for mut pending in canceled {
                    pending.fail(StreamerError::Canceled);
                    context.mark_request_as_completed(pending);
                }
            }
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
        let now = Instant::now();
        let mut did_work = false;
        if let Some(index) =
            select_next_request(&self.pending, now, &self.policy, self.last_position.as_ref())
        {
            let mut request = self.pending.swap_remove(index);
            if request.is_past_deadline(now) {
                request.fail(StreamerError::DeadlineExceeded);
            } else {
                request.set_status(RequestStatus::Processing);
                if let Err(e) = self.read_file(&mut request) {
                    log::error!("Read {:?} failed: {}", request.id(), e);
                    request.fail(e);
                }
            }
            context.mark_request_as_completed(request);
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
        // One read at a time, with one extra queued so there's always work ready
        let available = 2 - self.pending.len() as i64;
        status.num_available_slots = status.num_available_slots.min(available);
        status.is_idle &= self.pending.is_empty();
        status.include_deadline(earliest_deadline(self.pending.iter()));
        if let Some(next) = self.next() {
            next.update_status(status);
        }
    }

    fn update_recommendations(
        &self,
        recommendations: &mut Recommendations,
    ) {
        recommendations.max_concurrent_requests = recommendations.max_concurrent_requests.max(2);
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
