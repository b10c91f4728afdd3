use crate::file_request::{FileRequest, RequestId, RequestStatus};
use crate::thread_sync::StreamerContextThreadSync;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use streamer_base::hashing::HashMap;
use streamer_base::StreamerError;

// A request that is waiting on the children that do its work
struct ParkedRequest {
    request: FileRequest,
    outstanding_children: usize,
}

/// State shared by all stack entries on the streamer thread: the completion queue, requests waiting
/// on their children and the primitive used to sleep until there's work.
pub struct StreamerContext {
    thread_sync: StreamerContextThreadSync,
    request_ids: Arc<AtomicU64>,
    completed: VecDeque<FileRequest>,
    parked: HashMap<RequestId, ParkedRequest>,
    num_completed_requests: u64,
}

impl StreamerContext {
    pub fn new(request_ids: Arc<AtomicU64>) -> Self {
        StreamerContext {
            thread_sync: StreamerContextThreadSync::new(),
            request_ids,
            completed: Default::default(),
            parked: Default::default(),
            num_completed_requests: 0,
        }
    }

    pub fn thread_sync(&self) -> &StreamerContextThreadSync {
        &self.thread_sync
    }

    pub fn thread_sync_mut(&mut self) -> &mut StreamerContextThreadSync {
        &mut self.thread_sync
    }

    /// Ids are shared with the clients that create requests so they never collide
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.request_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues a request that is done, successfully or not. The outcome is delivered in
    /// `finalize_completed_requests`.
    pub fn mark_request_as_completed(
        &mut self,
        request: FileRequest,
    ) {
        log::trace!("Request {:?} marked as completed", request.id());
        self.completed.push_back(request);
    }

    /// Holds on to a request until `outstanding_children` child requests have completed. Parking a
    /// request without children completes it right away.
    pub fn park_parent(
        &mut self,
        mut request: FileRequest,
        outstanding_children: usize,
    ) {
        if outstanding_children == 0 {
            self.mark_request_as_completed(request);
            return;
        }

        request.set_status(RequestStatus::Processing);
        self.parked.insert(
            request.id(),
            ParkedRequest {
                request,
                outstanding_children,
            },
        );
    }

    pub fn num_parked_requests(&self) -> usize {
        self.parked.len()
    }

    /// Flags every parked request that belongs to the client request `target`. They complete as
    /// canceled once their children are done.
    pub fn cancel_parked_requests(
        &mut self,
        target: RequestId,
    ) {
        for parked in self.parked.values_mut() {
            if parked.request.root_id() == target {
                parked.request.fail(StreamerError::Canceled);
            }
        }
    }

    /// True if there are completed requests that still need to be finalized
    pub fn has_pending_completions(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Delivers completed requests. Children report to their parents, parents with no outstanding
    /// children left complete in turn, and client requests invoke their callbacks. Returns true if
    /// any request was finalized.
    pub fn finalize_completed_requests(&mut self) -> bool {
        profiling::scope!("StreamerContext::finalize_completed_requests");
        let mut finalized_any = false;
        while let Some(request) = self.completed.pop_front() {
            finalized_any = true;
            self.num_completed_requests += 1;

            let parent_id = match request.parent() {
                Some(parent_id) => parent_id,
                None => {
                    log::debug!(
                        "Request {:?} ({}) finished with status {:?}",
                        request.id(),
                        request.command().name(),
                        request.status()
                    );
                    request.complete();
                    continue;
                }
            };

            let parent_done = match self.parked.get_mut(&parent_id) {
                Some(parked) => {
                    if let Some(error) = request.error() {
                        parked.request.fail(error.clone());
                    }
                    parked.outstanding_children -= 1;
                    parked.outstanding_children == 0
                }
                None => {
                    log::warn!(
                        "Request {:?} completed but its parent {:?} isn't waiting for it",
                        request.id(),
                        parent_id
                    );
                    false
                }
            };

            if parent_done {
                if let Some(parked) = self.parked.remove(&parent_id) {
                    self.completed.push_back(parked.request);
                }
            }
        }

        finalized_any
    }

    pub fn num_completed_requests(&self) -> u64 {
        self.num_completed_requests
    }

    /// Sleeps until any registered event or the resume event fires, or `wake_at` passes
    pub fn suspend_until(
        &self,
        wake_at: Option<Instant>,
    ) {
        self.thread_sync.suspend_until(wake_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_request::{FileRequestCommand, FlushData, Priority};
    use std::sync::Mutex;
    use streamer_base::RequestPath;

    fn context() -> StreamerContext {
        StreamerContext::new(Arc::new(AtomicU64::new(1)))
    }

    fn exists_request(
        context: &StreamerContext,
        results: Arc<Mutex<Vec<Result<bool, StreamerError>>>>,
    ) -> FileRequest {
        FileRequest::new(
            context.next_request_id(),
            FileRequestCommand::FileExistsCheck(crate::file_request::FileExistsCheckData {
                path: RequestPath::from_absolute_path("/a"),
                found: true,
                callback: Some(Box::new(move |_, result| {
                    results.lock().unwrap().push(result)
                })),
            }),
            Priority::MEDIUM,
            None,
        )
    }

    fn flush_child(
        context: &StreamerContext,
        parent: &FileRequest,
    ) -> FileRequest {
        FileRequest::new_child(
            context.next_request_id(),
            parent,
            FileRequestCommand::Flush(FlushData {
                path: RequestPath::from_absolute_path("/a"),
            }),
        )
    }

    #[test]
    fn parent_completes_after_all_children() {
        let mut context = context();
        let results = Arc::new(Mutex::new(Vec::new()));
        let parent = exists_request(&context, results.clone());
        let first = flush_child(&context, &parent);
        let second = flush_child(&context, &parent);
        context.park_parent(parent, 2);

        context.mark_request_as_completed(first);
        context.finalize_completed_requests();
        assert!(results.lock().unwrap().is_empty());
        assert_eq!(context.num_parked_requests(), 1);

        context.mark_request_as_completed(second);
        assert!(context.finalize_completed_requests());
        assert_eq!(results.lock().unwrap().as_slice().len(), 1);
        assert!(matches!(results.lock().unwrap()[0], Ok(true)));
        assert_eq!(context.num_parked_requests(), 0);
    }

    #[test]
    fn child_failure_fails_parent() {
        let mut context = context();
        let results = Arc::new(Mutex::new(Vec::new()));
        let parent = exists_request(&context, results.clone());
        let mut first = flush_child(&context, &parent);
        let second = flush_child(&context, &parent);
        context.park_parent(parent, 2);

        first.fail(StreamerError::FileNotFound("/a".to_string()));
        context.mark_request_as_completed(first);
        context.mark_request_as_completed(second);
        context.finalize_completed_requests();

        let results = results.lock().unwrap();
        assert!(matches!(results[0], Err(StreamerError::FileNotFound(_))));
    }

    #[test]
    fn canceled_parent_reports_canceled() {
        let mut context = context();
        let results = Arc::new(Mutex::new(Vec::new()));
        let parent = exists_request(&context, results.clone());
        let parent_id = parent.id();
        let child = flush_child(&context, &parent);
        context.park_parent(parent, 1);

        context.cancel_parked_requests(parent_id);
        context.mark_request_as_completed(child);
        context.finalize_completed_requests();

        assert!(matches!(
            results.lock().unwrap()[0],
            Err(StreamerError::Canceled)
        ));
    }

    #[test]
    fn nothing_to_finalize() {
        let mut context = context();
        assert!(!context.finalize_completed_requests());
    }
}
