use crate::context::StreamerContext;
use crate::file_request::{FileRequest, FileRequestCommand, ReadData, RequestId, RequestStatus};
use crate::scheduling::{earliest_deadline, select_next_request, SchedulingPolicy};
use crate::stack_entry::{StreamStackEntry, StreamStackStatus, Statistic};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamer_base::{FileIoAliases, Recommendations, RequestBuffer, StreamerError};

/// Sits on top of the stream stack. Holds on to client reads until the stack has room for them,
/// then allocates their memory and sends them down as low-level reads.
pub struct Scheduler {
    aliases: Arc<FileIoAliases>,
    pending: Vec<FileRequest>,
    policy: SchedulingPolicy,
    recommendations: Recommendations,
    num_dispatched: u64,
    num_deadlines_missed: u64,
    num_out_of_memory: u64,
}

impl Scheduler {
    pub fn new(
        aliases: Arc<FileIoAliases>,
        aging_interval: Duration,
        stack: &dyn StreamStackEntry,
    ) -> Self {
        let mut recommendations = Recommendations::default();
        stack.update_recommendations(&mut recommendations);
        log::debug!("Stream stack recommendations: {:?}", recommendations);

        Scheduler {
            aliases,
            pending: Vec::default(),
            policy: SchedulingPolicy {
                aging_interval,
                has_seek_penalty: false,
            },
            recommendations,
            num_dispatched: 0,
            num_deadlines_missed: 0,
            num_out_of_memory: 0,
        }
    }

    pub fn recommendations(&self) -> &Recommendations {
        &self.recommendations
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// When the streamer thread has to wake up to expire a queued request
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest_deadline(self.pending.iter())
    }

    pub fn queue_request(
        &mut self,
        mut request: FileRequest,
        stack: &mut dyn StreamStackEntry,
        context: &mut StreamerContext,
    ) {
        profiling::scope!("Scheduler::queue_request");
        log::debug!(
            "Queued {} request {:?}",
            request.command().name(),
            request.id()
        );

        let aliases = &self.aliases;
        let resolved = request
            .command_mut()
            .path_mut()
            .map_or(true, |path| path.resolve(aliases));
        if !resolved {
            match request.command_mut() {
                FileRequestCommand::FileExistsCheck(data) => data.found = false,
                // Nothing can be cached for a path that doesn't resolve
                FileRequestCommand::Flush(_) => {}
                command => {
                    let path = command.path().map(|path| path.to_string()).unwrap_or_default();
                    request.fail(StreamerError::InvalidPath(path));
                }
            }
            context.mark_request_as_completed(request);
            return;
        }

        if let FileRequestCommand::ReadRequest(data) = request.command_mut() {
            if data.offset.checked_add(data.size).is_none() {
                let error = StreamerError::InvalidRange {
                    offset: data.offset,
                    size: data.size,
                };
                request.fail(error);
                context.mark_request_as_completed(request);
            } else if data.size == 0 {
                data.buffer = RequestBuffer::allocate(data.allocator.clone(), 0, 0, 1);
                context.mark_request_as_completed(request);
            } else {
                request.set_status(RequestStatus::Queued);
                self.pending.push(request);
            }
            return;
        }

        match request.command() {
            FileRequestCommand::Cancel(data) => self.cancel_requests(data.target, context),
            FileRequestCommand::Reschedule(data) => {
                for pending in &mut self.pending {
                    if pending.root_id() == data.target {
                        pending.reschedule(data.priority, data.deadline);
                    }
                }
            }
            _ => {}
        }

        stack.queue_request(request, context);
    }

    fn cancel_requests(
        &mut self,
        target: RequestId,
        context: &mut StreamerContext,
    ) {
        let (canceled, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|request| request.root_id() == target);
        self.pending = remaining;
        for mut request in canceled {
            request.fail(StreamerError::Canceled);
            context.mark_request_as_completed(request);
        }

        context.cancel_parked_requests(target);
    }

    /// Fails queued reads whose deadline has passed and sends as many of the remaining ones down the
    /// stack as it has room for. Returns true if any request was handled.
    pub fn dispatch_requests(
        &mut self,
        stack: &mut dyn StreamStackEntry,
        context: &mut StreamerContext,
    ) -> bool {
        profiling::scope!("Scheduler::dispatch_requests");
        let now = Instant::now();
        let mut did_work = false;

        let (expired, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|request| request.is_past_deadline(now));
        self.pending = remaining;
        for mut request in expired {
            self.num_deadlines_missed += 1;
            request.fail(StreamerError::DeadlineExceeded);
            context.mark_request_as_completed(request);
            did_work = true;
        }

        if self.pending.is_empty() {
            return did_work;
        }

        let mut status = StreamStackStatus::default();
        stack.update_status(&mut status);
        let mut available_slots = status.num_available_slots;
        while available_slots > 0 {
            let index = match select_next_request(&self.pending, now, &self.policy, None) {
                Some(index) => index,
                None => break,
            };
            let request = self.pending.swap_remove(index);
            self.dispatch_read(request, stack, context);
            available_slots -= 1;
            did_work = true;
        }

        did_work
    }

    fn dispatch_read(
        &mut self,
        mut request: FileRequest,
        stack: &mut dyn StreamStackEntry,
        context: &mut StreamerContext,
    ) {
        let recommendations = self.recommendations;
        let data = match request.command_mut() {
            FileRequestCommand::ReadRequest(data) => data,
            _ => unreachable!("Only client reads are queued in the scheduler"),
        };

        let offset = data.offset;
        let size = data.size;
        let aligned_offset = recommendations.aligned_read_offset(offset);
        let recommended_size = recommendations.calculate_recommended_memory_size(size, offset);
        let mut buffer = match RequestBuffer::allocate(
            data.allocator.clone(),
            size,
            recommended_size,
            recommendations.memory_alignment,
        ) {
            Some(buffer) if buffer.allocated_size() as u64 >= size => buffer,
            _ => {
                log::warn!(
                    "Unable to allocate {} bytes to read '{}'",
                    recommended_size,
                    data.path
                );
                self.num_out_of_memory += 1;
                request.fail(StreamerError::OutOfMemory {
                    requested: recommended_size,
                });
                context.mark_request_as_completed(request);
                return;
            }
        };

        // The allocator may only have provided the minimal size, in which case the read can't be aligned
        let (read_offset, read_size) = if buffer.allocated_size() as u64 >= recommended_size {
            buffer.set_data_range((offset - aligned_offset) as usize, size as usize);
            (aligned_offset, recommended_size)
        } else {
            buffer.set_data_range(0, size as usize);
            (offset, size)
        };

        let (output, _) = buffer.window().split_at(read_size as usize);
        let path = data.path.clone();
        data.buffer = Some(buffer);

        let child = FileRequest::new_child(
            context.next_request_id(),
            &request,
            FileRequestCommand::Read(ReadData {
                path,
                offset: read_offset,
                size: read_size,
                required_end: offset.saturating_add(size),
                output: Some(output),
            }),
        );

        self.num_dispatched += 1;
        context.park_parent(request, 1);
        stack.queue_request(child, context);
    }

    /// Fails everything that is still queued, used when the streamer shuts down
    pub fn shutdown(
        &mut self,
        context: &mut StreamerContext,
    ) {
        for mut request in self.pending.drain(..) {
            request.fail(StreamerError::ShuttingDown);
            context.mark_request_as_completed(request);
        }
    }

    pub fn collect_statistics(
        &self,
        statistics: &mut Vec<Statistic>,
    ) {
        statistics.push(Statistic::new("Scheduler", "Pending", self.pending.len() as f64));
        statistics.push(Statistic::new("Scheduler", "Dispatched", self.num_dispatched as f64));
        statistics.push(Statistic::new(
            "Scheduler",
            "Deadlines missed",
            self.num_deadlines_missed as f64,
        ));
        statistics.push(Statistic::new(
            "Scheduler",
            "Out of memory",
            self.num_out_of_memory as f64,
        ));
    }
}
