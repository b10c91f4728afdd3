use crate::context::StreamerContext;
use crate::file_request::{FileRequest, FileRequestCommand, ReadData};
use crate::hardware::HardwareInformation;
use crate::stack_config::{clamp_config_value, StreamerStackConfig};
use crate::stack_entry::{forward_request, StreamStackEntry, Statistic};
use serde::{Deserialize, Serialize};
use streamer_base::{Recommendations, StreamerResult};
use type_uuid::TypeUuid;
use uuid::Uuid;

const MAX_SPLIT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypeUuid)]
#[uuid = "c2d84f61-0e7a-4b59-9f13-6ab7e2c5d904"]
#[serde(rename_all = "PascalCase", default)]
pub struct ReadSplitterConfig {
    // Size in bytes of the reads large reads are split into. Zero uses the largest transfer size the
    // hardware supports.
    pub split_size: u64,
}

impl Default for ReadSplitterConfig {
    fn default() -> Self {
        ReadSplitterConfig { split_size: 0 }
    }
}

impl ReadSplitterConfig {
    /// The split size for the hardware, a multiple of the sector size so split reads stay aligned
    pub fn effective_split_size(
        &self,
        hardware: &HardwareInformation,
    ) -> u64 {
        let sector_size = hardware
            .max_physical_sector_size
            .max(hardware.max_logical_sector_size)
            .max(1) as u64;
        let split_size = if self.split_size == 0 {
            hardware.max_transfer as u64
        } else {
            self.split_size
        };
        (split_size / sector_size).max(1) * sector_size
    }
}

impl StreamerStackConfig for ReadSplitterConfig {
    fn type_uuid(&self) -> Uuid {
        Uuid::from_bytes(Self::UUID)
    }

    fn version(&self) -> u32 {
        1
    }

    fn to_json(&self) -> StreamerResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn sanitize(&mut self) {
        clamp_config_value("ReadSplitterConfig", "SplitSize", &mut self.split_size, 0, MAX_SPLIT_SIZE);
    }

    fn add_stream_stack_entry(
        &self,
        hardware: &HardwareInformation,
        parent: Option<Box<dyn StreamStackEntry>>,
    ) -> Option<Box<dyn StreamStackEntry>> {
        let mut splitter = ReadSplitter::new(self.effective_split_size(hardware));
        splitter.set_next(parent);
        Some(Box::new(splitter))
    }
}

/// Breaks large reads into reads of at most `split_size` bytes so a single big read doesn't hold up
/// a drive and several drives or channels can work on it at once. The children write into disjoint
/// parts of the parent's buffer and the parent completes once they all have.
pub struct ReadSplitter {
    name: String,
    next: Option<Box<dyn StreamStackEntry>>,
    split_size: u64,
    num_split_reads: u64,
    num_child_reads: u64,
}

impl ReadSplitter {
    pub fn new(split_size: u64) -> Self {
        assert!(split_size > 0, "Read splitter needs a split size.");
        ReadSplitter {
            name: "Read splitter".to_string(),
            next: None,
            split_size,
            num_split_reads: 0,
            num_child_reads: 0,
        }
    }

    pub fn split_size(&self) -> u64 {
        self.split_size
    }

    fn split_read(
        &mut self,
        mut request: FileRequest,
        context: &mut StreamerContext,
    ) {
        profiling::scope!("ReadSplitter::split_read");
        let (path, offset, size, required_end, output) = match request.command_mut() {
            FileRequestCommand::Read(data) => (
                data.path.clone(),
                data.offset,
                data.size,
                data.required_end,
                data.output.take(),
            ),
            _ => unreachable!("Only reads are split"),
        };

        let mut remaining_output = match output {
            Some(output) => output,
            None => {
                request.fail("Read request has no output buffer".into());
                context.mark_request_as_completed(request);
                return;
            }
        };

        let mut children = Vec::new();
        let mut child_offset = offset;
        let end = offset.saturating_add(size);
        while child_offset < end {
            let child_size = self.split_size.min(end - child_offset);
            let split = (child_size as usize).min(remaining_output.len());
            let (child_output, rest) = remaining_output.split_at(split);
            remaining_output = rest;

            children.push(FileRequest::new_child(
                context.next_request_id(),
                &request,
                FileRequestCommand::Read(ReadData {
                    path: path.clone(),
                    offset: child_offset,
                    size: child_size,
                    required_end,
                    output: Some(child_output),
                }),
            ));
            child_offset += child_size;
        }

        log::trace!(
            "Split read {:?} of {} bytes into {} reads",
            request.id(),
            size,
            children.len()
        );
        self.num_split_reads += 1;
        self.num_child_reads += children.len() as u64;

        context.park_parent(request, children.len());
        for child in children {
            forward_request(self.next.as_deref_mut(), child, context);
        }
    }
}

impl StreamStackEntry for ReadSplitter {
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
        let needs_split = match request.command() {
            FileRequestCommand::Read(data) => data.size > self.split_size,
            _ => false,
        };

        if needs_split {
            self.split_read(request, context);
        } else {
            forward_request(self.next.as_deref_mut(), request, context);
        }
    }

    fn update_recommendations(
        &self,
        recommendations: &mut Recommendations,
    ) {
        recommendations.granularity = recommendations.granularity.min(self.split_size);
        if let Some(next) = self.next() {
            next.update_recommendations(recommendations);
        }
    }

    fn collect_statistics(
        &self,
        statistics: &mut Vec<Statistic>,
    ) {
        statistics.push(Statistic::new(&self.name, "Split reads", self.num_split_reads as f64));
        statistics.push(Statistic::new(&self.name, "Child reads", self.num_child_reads as f64));
        if let Some(next) = self.next() {
            next.collect_statistics(statistics);
        }
    }
}
