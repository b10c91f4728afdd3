use crate::file_request::{FileRequest, FileRequestCommand, Priority};
use std::cmp::Reverse;
use std::time::{Duration, Instant};

/// Waiting requests gain one priority step per interval
pub const DEFAULT_AGING_INTERVAL: Duration = Duration::from_millis(250);

/// Where the last read on a drive ended, used to prefer reads that continue from there
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPosition {
    pub path_hash: u64,
    pub end_offset: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct SchedulingPolicy {
    pub aging_interval: Duration,
    pub has_seek_penalty: bool,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy {
            aging_interval: DEFAULT_AGING_INTERVAL,
            has_seek_penalty: false,
        }
    }
}

/// Declared priority plus one step for every aging interval the request has been waiting, capped at
/// the highest priority.
pub fn effective_priority(
    request: &FileRequest,
    now: Instant,
    aging_interval: Duration,
) -> u32 {
    let base = request.priority().0 as u32;
    if aging_interval.is_zero() {
        return base;
    }

    let waited = now.saturating_duration_since(request.created());
    let steps = (waited.as_nanos() / aging_interval.as_nanos()).min(u32::MAX as u128) as u32;
    base.saturating_add(steps.saturating_mul(Priority::STEP))
        .min(Priority::HIGHEST.0 as u32)
}

fn read_location(request: &FileRequest) -> Option<(u64, u64)> {
    match request.command() {
        FileRequestCommand::Read(data) => Some((data.path.cached_hash(), data.offset)),
        FileRequestCommand::ReadRequest(data) => Some((data.path.cached_hash(), data.offset)),
        _ => None,
    }
}

/// Picks the request that should be serviced next: highest effective priority, then the earliest
/// deadline, then (on drives that pay for seeking) the read closest ahead of the last one in the
/// same file, then the oldest request.
pub fn select_next_request(
    pending: &[FileRequest],
    now: Instant,
    policy: &SchedulingPolicy,
    last_position: Option<&ReadPosition>,
) -> Option<usize> {
    pending
        .iter()
        .enumerate()
        .max_by_key(|(index, request)| {
            let priority = effective_priority(request, now, policy.aging_interval);
            let deadline = request.deadline().map(Reverse);

            // 1 for a read that continues forward in the file the drive is already in
            let (locality, distance) = match (policy.has_seek_penalty, last_position, read_location(request)) {
                (true, Some(last), Some((path_hash, offset)))
                    if path_hash == last.path_hash && offset >= last.end_offset =>
                {
                    (1u8, Reverse(offset - last.end_offset))
                }
                _ => (0u8, Reverse(0)),
            };

            (
                priority,
                deadline,
                locality,
                distance,
                Reverse(request.created()),
                Reverse(*index),
            )
        })
        .map(|(index, _)| index)
}

/// Earliest deadline among the requests, used to wake up the streamer thread in time to expire them
pub fn earliest_deadline<'a>(requests: impl Iterator<Item = &'a FileRequest>) -> Option<Instant> {
    requests.filter_map(|request| request.deadline()).min()
}
