use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use streamer::io::{
    collect_io_hardware_information, FileIoAliases, HardwareInformation, Priority, ReadRequest,
    RequestPath, StackConfigRegistry, Streamer, StreamerConfig, StreamerSettings,
};

// The file is requested in reads of this size
const CHUNK_SIZE: u64 = 256 * 1024;

#[derive(StructOpt, Debug)]
struct DemoStreamerArgs {
    /// File to stream, relative to the assets root
    #[structopt(name = "file")]
    file: String,
    /// Directory the @assets@ alias points at, defaults to the current directory
    #[structopt(name = "assets-root", long, parse(from_os_str))]
    assets_root: Option<PathBuf>,
    /// JSON file describing the stream stack
    #[structopt(name = "stack-config", long, parse(from_os_str))]
    stack_config: Option<PathBuf>,
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    profiling::register_thread!("Main Thread");

    let args = DemoStreamerArgs::from_args();
    let relative_path = args.file.clone();
    let assets_root = match args.assets_root.clone() {
        Some(assets_root) => assets_root,
        None => match std::env::current_dir() {
            Ok(current_dir) => current_dir,
            Err(e) => {
                log::error!("Couldn't determine the current directory: {}", e);
                return;
            }
        },
    };

    let mut aliases = FileIoAliases::new();
    aliases.set_alias("@assets@", assets_root.to_string_lossy().to_string());
    let aliases = Arc::new(aliases);

    let hardware = collect_io_hardware_information(&aliases, false).unwrap_or_else(|| {
        log::warn!("Couldn't collect hardware information, using generic settings");
        HardwareInformation::default()
    });
    for drive in hardware.drive_list().into_iter().flatten() {
        log::info!(
            "Drive {:?}: {} io channels, sector size {}, seek penalty {}",
            drive.paths,
            drive.io_channel_count,
            drive.physical_sector_size,
            drive.has_seek_penalty
        );
    }

    let config = match &args.stack_config {
        Some(config_path) => {
            match StackConfigRegistry::with_builtin_configs().load_config_from_file(config_path) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Couldn't load stack config {:?}: {}", config_path, e);
                    return;
                }
            }
        }
        None => StreamerConfig::default_stack(),
    };
    match config.to_json_string() {
        Ok(json) => log::debug!("Stack config:\n{}", json),
        Err(e) => log::warn!("Couldn't serialize the stack config: {}", e),
    }

    let streamer = match Streamer::new(&config, &hardware, aliases, StreamerSettings::default()) {
        Ok(streamer) => streamer,
        Err(e) => {
            log::error!("Couldn't start the streamer: {}", e);
            return;
        }
    };

    let (exists_tx, exists_rx) = crossbeam_channel::bounded(1);
    streamer.file_exists(
        RequestPath::from_relative_path(relative_path.clone()),
        move |_, result| exists_tx.send(result).unwrap(),
    );
    if !exists_rx.recv().unwrap().unwrap_or(false) {
        log::error!("File '{}' not found under {:?}", relative_path, assets_root);
        return;
    }

    let (size_tx, size_rx) = crossbeam_channel::bounded(1);
    streamer.file_meta_data(
        RequestPath::from_relative_path(relative_path.clone()),
        move |_, result| size_tx.send(result).unwrap(),
    );
    let file_size = size_rx.recv().unwrap().unwrap().file_size;

    let start = Instant::now();
    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let mut offset = 0;
    let mut num_reads = 0;
    while offset < file_size {
        let size = CHUNK_SIZE.min(file_size - offset);
        // Front of the file is most urgent
        let priority = if offset == 0 {
            Priority::HIGH
        } else {
            Priority::MEDIUM
        };
        let result_tx = result_tx.clone();
        streamer.read(
            ReadRequest::new(
                RequestPath::from_relative_path(relative_path.clone()),
                offset,
                size,
            )
            .with_priority(priority)
            .with_deadline(Instant::now() + Duration::from_secs(5)),
            move |completion| result_tx.send(completion).unwrap(),
        );
        offset += size;
        num_reads += 1;
    }

    let mut bytes_read = 0;
    for _ in 0..num_reads {
        let completion = result_rx.recv().unwrap();
        match completion.result {
            Ok(buffer) => {
                if completion.completed_past_deadline {
                    log::warn!("Read {:?} completed past its deadline", completion.request_id);
                }
                bytes_read += buffer.len();
            }
            Err(e) => log::error!("Read {:?} failed: {}", completion.request_id, e),
        }
    }

    let elapsed = start.elapsed();
    log::info!(
        "Streamed {} bytes in {} reads in {:.2}ms",
        bytes_read,
        num_reads,
        elapsed.as_secs_f64() * 1000.0
    );

    for statistic in streamer.collect_statistics() {
        log::info!("{}: {} = {}", statistic.owner, statistic.name, statistic.value);
    }
}
