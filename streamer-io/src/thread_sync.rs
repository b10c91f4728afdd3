use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Number of events the streamer thread can wait on at the same time. The first one is reserved for
/// waking the thread up when new requests are queued.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

const RESUME_EVENT_INDEX: usize = 0;

// Manual reset events, all guarded by one mutex so a single condvar can wait on any of them
struct EventSet {
    signaled: Mutex<[bool; MAXIMUM_WAIT_OBJECTS]>,
    condvar: Condvar,
}

impl EventSet {
    fn reset(
        &self,
        index: usize,
    ) {
        self.signaled.lock().unwrap()[index] = false;
    }
}

/// An event a stack entry or client can signal to wake up the streamer thread. Cheap to clone and
/// safe to signal from any thread.
#[derive(Clone)]
pub struct EventHandle {
    index: usize,
    events: Arc<EventSet>,
}

impl EventHandle {
    pub fn signal(&self) {
        self.events.signaled.lock().unwrap()[self.index] = true;
        self.events.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.events.signaled.lock().unwrap()[self.index]
    }
}

impl PartialEq for EventHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.index == other.index && Arc::ptr_eq(&self.events, &other.events)
    }
}

impl Eq for EventHandle {}

impl std::fmt::Debug for EventHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("index", &self.index)
            .finish()
    }
}

/// Lets the streamer thread sleep until there's something to do: either a client queued new work
/// (resume) or one of the registered events completed.
///
/// Slot 0 always holds the resume event. Slots `1..handle_count` hold the events that are currently
/// registered, in no particular order.
pub struct StreamerContextThreadSync {
    events: Arc<EventSet>,
    handles: [usize; MAXIMUM_WAIT_OBJECTS],
    handle_count: usize,
}

impl Default for StreamerContextThreadSync {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamerContextThreadSync {
    pub fn new() -> Self {
        let mut handles = [0; MAXIMUM_WAIT_OBJECTS];
        for (slot, handle) in handles.iter_mut().enumerate() {
            *handle = slot;
        }

        StreamerContextThreadSync {
            events: Arc::new(EventSet {
                signaled: Mutex::new([false; MAXIMUM_WAIT_OBJECTS]),
                condvar: Condvar::new(),
            }),
            handles,
            handle_count: 1,
        }
    }

    /// Blocks until any live event is signaled and resets that event
    pub fn suspend(&self) {
        self.suspend_until(None);
    }

    /// Like `suspend`, but also returns once `wake_at` has passed. Returns false on timeout.
    pub fn suspend_until(
        &self,
        wake_at: Option<Instant>,
    ) -> bool {
        profiling::scope!("StreamerContextThreadSync::suspend");
        let mut signaled = self.events.signaled.lock().unwrap();
        loop {
            for &event in &self.handles[..self.handle_count] {
                if signaled[event] {
                    signaled[event] = false;
                    return true;
                }
            }

            signaled = match wake_at {
                Some(wake_at) => {
                    let now = Instant::now();
                    if now >= wake_at {
                        return false;
                    }
                    self.events
                        .condvar
                        .wait_timeout(signaled, wake_at - now)
                        .unwrap()
                        .0
                }
                None => self.events.condvar.wait(signaled).unwrap(),
            };
        }
    }

    /// Wakes up the streamer thread
    pub fn resume(&self) {
        self.resume_handle().signal();
    }

    /// Handle to the resume event, for threads that queue work
    pub fn resume_handle(&self) -> EventHandle {
        EventHandle {
            index: RESUME_EVENT_INDEX,
            events: self.events.clone(),
        }
    }

    /// Registers a new event the streamer thread will wake up for. Callers must check
    /// `are_event_handles_available` first, running out of slots is a programming error.
    pub fn create_event_handle(&mut self) -> EventHandle {
        assert!(
            self.handle_count < MAXIMUM_WAIT_OBJECTS,
            "There are no more slots available to allocate a new IO event in."
        );

        let index = self.handles[self.handle_count];
        self.handle_count += 1;
        self.events.reset(index);
        EventHandle {
            index,
            events: self.events.clone(),
        }
    }

    pub fn destroy_event_handle(
        &mut self,
        handle: &EventHandle,
    ) {
        assert!(
            self.handle_count > 1,
            "There are no more IO events that can be destroyed."
        );
        assert!(
            Arc::ptr_eq(&self.events, &handle.events),
            "IO event belongs to another streamer."
        );
        assert_ne!(
            handle.index, RESUME_EVENT_INDEX,
            "The resume event can't be destroyed."
        );

        let slot = (1..self.handle_count)
            .find(|&slot| self.handles[slot] == handle.index)
            .unwrap_or_else(|| panic!("IO event couldn't be destroyed as it wasn't found."));

        self.handle_count -= 1;
        self.handles.swap(slot, self.handle_count);
        self.events.reset(handle.index);
    }

    /// Number of registered events, not counting the resume event
    pub fn event_handle_count(&self) -> usize {
        self.handle_count - 1
    }

    pub fn are_event_handles_available(&self) -> bool {
        self.handle_count < MAXIMUM_WAIT_OBJECTS
    }
}
