use crate::context::StreamerContext;
use crate::file_request::{FileRequest, FileRequestCommand};
use std::time::Instant;
use streamer_base::{Recommendations, StreamerError};

/// Load of the stream stack as seen from the top
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamStackStatus {
    // How many more requests can be queued before the stack is saturated. Can go negative when
    // entries split requests up.
    pub num_available_slots: i64,
    pub is_idle: bool,
    // Earliest deadline of a request waiting somewhere in the stack, the streamer thread has to wake
    // up by then to expire it
    pub next_deadline: Option<Instant>,
}

impl Default for StreamStackStatus {
    fn default() -> Self {
        StreamStackStatus {
            num_available_slots: i64::MAX,
            is_idle: true,
            next_deadline: None,
        }
    }
}

impl StreamStackStatus {
    pub fn include_deadline(
        &mut self,
        deadline: Option<Instant>,
    ) {
        self.next_deadline = match (self.next_deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Statistic {
    pub owner: String,
    pub name: &'static str,
    pub value: f64,
}

impl Statistic {
    pub fn new(
        owner: &str,
        name: &'static str,
        value: f64,
    ) -> Self {
        Statistic {
            owner: owner.to_string(),
            name,
            value,
        }
    }
}

/// A stage in the stream stack. Requests enter at the top and travel down through `next` until an
/// entry takes ownership of them. An entry either services a request, creates child requests for
/// it, or passes it on.
///
/// All methods are called from the streamer thread only.
pub trait StreamStackEntry: Send {
    fn name(&self) -> &str;

    fn set_next(
        &mut self,
        next: Option<Box<dyn StreamStackEntry>>,
    );
    fn next(&self) -> Option<&(dyn StreamStackEntry + 'static)>;
    fn next_mut(&mut self) -> Option<&mut (dyn StreamStackEntry + 'static)>;

    fn queue_request(
        &mut self,
        request: FileRequest,
        context: &mut StreamerContext,
    ) {
        forward_request(self.next_mut(), request, context);
    }

    /// Makes progress on queued work. Returns true if anything was done.
    fn execute_requests(
        &mut self,
        context: &mut StreamerContext,
    ) -> bool {
        match self.next_mut() {
            Some(next) => next.execute_requests(context),
            None => false,
        }
    }

    fn update_status(
        &self,
        status: &mut StreamStackStatus,
    ) {
        if let Some(next) = self.next() {
            next.update_status(status);
        }
    }

    fn update_recommendations(
        &self,
        recommendations: &mut Recommendations,
    ) {
        if let Some(next) = self.next() {
            next.update_recommendations(recommendations);
        }
    }

    fn collect_statistics(
        &self,
        statistics: &mut Vec<Statistic>,
    ) {
        if let Some(next) = self.next() {
            next.collect_statistics(statistics);
        }
    }
}

/// Passes a request to the next entry. Broadcast commands that reach the bottom of the stack are
/// done, anything else wasn't claimed by any entry and fails.
pub fn forward_request(
    next: Option<&mut (dyn StreamStackEntry + 'static)>,
    mut request: FileRequest,
    context: &mut StreamerContext,
) {
    match next {
        Some(next) => next.queue_request(request, context),
        None => {
            if !request.command().is_broadcast() {
                log::warn!(
                    "No storage available to service {} request {:?}",
                    request.command().name(),
                    request.id()
                );
                request.fail(StreamerError::NoStorageAvailable);
            }
            context.mark_request_as_completed(request);
        }
    }
}

/// Names of the entries from the top of the stack down
pub fn stack_entry_names(top: &dyn StreamStackEntry) -> Vec<String> {
    let mut names = vec![top.name().to_string()];
    let mut entry = top.next();
    while let Some(current) = entry {
        names.push(current.name().to_string());
        entry = current.next();
    }
    names
}

/// True if the request is for work that `target` asked for
pub(crate) fn is_request_for(
    request: &FileRequest,
    command: &FileRequestCommand,
) -> bool {
    match command {
        FileRequestCommand::Cancel(data) => request.root_id() == data.target,
        FileRequestCommand::Reschedule(data) => request.root_id() == data.target,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_keeps_earliest_deadline() {
        let now = Instant::now();
        let mut status = StreamStackStatus::default();
        status.include_deadline(None);
        assert_eq!(status.next_deadline, None);

        status.include_deadline(Some(now + Duration::from_secs(2)));
        status.include_deadline(Some(now + Duration::from_secs(1)));
        status.include_deadline(Some(now + Duration::from_secs(3)));
        status.include_deadline(None);
        assert_eq!(status.next_deadline, Some(now + Duration::from_secs(1)));
    }
}
