//! This example program captures frames from the software loopback driver,
//! going through the whole camera lifecycle: discovery, open, stream
//! configuration, buffer allocation, capture and close.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_adapter::{
    adapter::{AdapterConfig, StreamConfig},
    driver::{
        loopback::{Dispatch, LoopbackConfig, LoopbackDriver, ResultOrder},
        CaptureDriver, DriverError, HalPixelFormat,
    },
    memory::{BufferGeometry, CameraBuffer, DmaBufMapper, MemoryType},
    registry::{
        AvailableStreamConfig, CameraModule, CameraRegistry, Facing, ModuleCameraInfo,
        StreamDirection,
    },
    settings::Parameters,
    PixelFormat, StreamId,
};

use clap::{App, Arg};
use nix::errno::Errno;

const STREAM: StreamId = StreamId(0);

/// A module exposing a single loopback camera.
struct LoopbackModule {
    config: LoopbackConfig,
}

impl CameraModule for LoopbackModule {
    fn number_of_cameras(&self) -> u32 {
        1
    }

    fn camera_info(&self, id: u32) -> Result<ModuleCameraInfo, DriverError> {
        if id != 0 {
            return Err(Errno::ENODEV.into());
        }

        let stream_configs = [(640, 480), (1280, 720), (1920, 1080)]
            .iter()
            .map(|&(width, height)| AvailableStreamConfig {
                format: HalPixelFormat::YCbCr420_888,
                width,
                height,
                direction: StreamDirection::Output,
            })
            .collect();

        Ok(ModuleCameraInfo {
            facing: Facing::External,
            orientation: 0,
            stream_configs,
        })
    }

    fn open_device(&self, id: u32) -> Result<Arc<dyn CaptureDriver>, DriverError> {
        if id != 0 {
            return Err(Errno::ENODEV.into());
        }

        Ok(Arc::new(LoopbackDriver::new(self.config.clone())))
    }
}

fn main() {
    env_logger::init();

    let matches = App::new("Loopback capture")
        .arg(
            Arg::with_name("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after capturing this number of frames"),
        )
        .arg(
            Arg::with_name("frame_size")
                .long("frame_size")
                .required(false)
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to capture (e.g. \"640x480\")"),
        )
        .arg(
            Arg::with_name("fps")
                .long("fps")
                .required(false)
                .takes_value(true)
                .default_value("30")
                .help("Frame rate of the loopback driver"),
        )
        .arg(
            Arg::with_name("num_buffers")
                .long("num_buffers")
                .required(false)
                .takes_value(true)
                .default_value("4")
                .help("Number of buffers to cycle between the client and the driver"),
        )
        .arg(
            Arg::with_name("capture_mem")
                .long("capture_mem")
                .required(false)
                .takes_value(true)
                .default_value("mmap")
                .help("Type of capture memory to use (mmap or user)"),
        )
        .arg(
            Arg::with_name("order")
                .long("order")
                .required(false)
                .takes_value(true)
                .default_value("alternate")
                .help("Order of the driver results (metadata, buffer or alternate)"),
        )
        .arg(
            Arg::with_name("inline")
                .long("inline")
                .help("Complete requests from the submitting thread"),
        )
        .get_matches();

    let stop_after = matches
        .value_of("num_frames")
        .map(|s| s.parse::<usize>().expect("Invalid value for stop_after"));

    let (width, height) = matches
        .value_of("frame_size")
        .map(|s| {
            const ERROR_MSG: &str = "Invalid parameter for frame_size";
            let split: Vec<&str> = s.split('x').collect();
            if split.len() != 2 {
                panic!("{}", ERROR_MSG);
            }
            let width: u32 = split[0].parse().expect(ERROR_MSG);
            let height: u32 = split[1].parse().expect(ERROR_MSG);

            (width, height)
        })
        .unwrap();

    let fps: f32 = matches
        .value_of("fps")
        .unwrap()
        .parse()
        .expect("Invalid value for fps");
    let num_buffers: usize = matches
        .value_of("num_buffers")
        .unwrap()
        .parse()
        .expect("Invalid value for num_buffers");

    let capture_mem = match matches.value_of("capture_mem") {
        Some("mmap") => MemoryType::Mmap,
        Some("user") => MemoryType::UserPtr,
        _ => panic!("Invalid value for capture_mem"),
    };
    let order = match matches.value_of("order") {
        Some("metadata") => ResultOrder::MetadataFirst,
        Some("buffer") => ResultOrder::BufferFirst,
        Some("alternate") => ResultOrder::Alternate,
        _ => panic!("Invalid value for order"),
    };
    let dispatch = if matches.is_present("inline") {
        Dispatch::Inline
    } else {
        Dispatch::Threaded
    };

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let module = Arc::new(LoopbackModule {
        config: LoopbackConfig::new()
            .dispatch(dispatch)
            .order(order)
            .frame_interval(Duration::from_secs_f32(1.0 / fps)),
    });
    let mapper = Arc::new(DmaBufMapper::new());
    let mut registry = CameraRegistry::new(module, mapper, AdapterConfig::new());

    let info = registry
        .camera_info(0)
        .expect("Failed to get camera information");
    println!(
        "Found {} ({:?}, version {})",
        info.name, info.facing, info.device_version
    );
    for stream in &info.streams {
        println!("  {} {}x{}", stream.format, stream.width, stream.height);
    }

    let adapter = registry.open(0).expect("Failed to open camera");
    adapter
        .set_parameters(Parameters {
            fps,
            ..Default::default()
        })
        .expect("Failed to set parameters");

    let geometry = BufferGeometry::nv12(width, height);
    // Backing memory of user pointer buffers, which must outlive the camera.
    let mut user_memory: Vec<Vec<u8>> = Vec::new();
    let buffers: Vec<CameraBuffer> = match capture_mem {
        MemoryType::Mmap => (0..num_buffers)
            .map(|_| adapter.allocate_memory(&geometry))
            .collect::<Result<_, _>>()
            .expect("Failed to allocate buffers"),
        MemoryType::UserPtr => {
            let size = geometry.size().expect("Unsupported frame format");
            user_memory.resize_with(num_buffers, || vec![0u8; size]);
            user_memory
                .iter_mut()
                .map(|memory| CameraBuffer::user_ptr(memory.as_mut_ptr() as usize, geometry))
                .collect()
        }
        MemoryType::DmaBuf => unreachable!(),
    };

    adapter
        .configure_streams(&[StreamConfig {
            stream_id: STREAM,
            width,
            height,
            format: PixelFormat::NV12,
            memory: capture_mem,
        }])
        .expect("Failed to configure stream");

    for buffer in buffers {
        adapter.qbuf(STREAM, buffer).expect("Failed to queue buffer");
    }
    adapter.start().expect("Failed to start capture");

    let start_time = Instant::now();
    let mut num_frames = 0usize;
    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(max_frames) = stop_after {
            if num_frames >= max_frames {
                break;
            }
        }

        let mut buffer = match adapter.dqbuf() {
            Ok(buffer) => buffer,
            Err(e) => {
                eprintln!("Failed to dequeue buffer: {}", e);
                break;
            }
        };
        num_frames += 1;

        let elapsed = start_time.elapsed();
        let fps = num_frames as f32 / elapsed.as_millis() as f32 * 1000.0;
        print!(
            "\rCaptured frame {:4} ({}) at {:>12} ns, {:.2} fps",
            buffer.sequence().unwrap_or_default(),
            buffer.identity(),
            buffer.timestamp(),
            fps
        );
        if !buffer.flags().is_empty() {
            print!(" {:?}", buffer.flags());
        }

        buffer.recycle();
        adapter.qbuf(STREAM, buffer).expect("Failed to queue buffer");
    }
    println!();

    let canceled = adapter.stop().expect("Failed to stop capture");
    println!("{} requests canceled on stop", canceled.len());

    let returned = registry.close(0).expect("Failed to close camera");
    println!("{} buffers returned on close", returned.len());
    drop(user_memory);
}
