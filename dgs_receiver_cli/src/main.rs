//! # dgs_receiver_cli
//!
//! Part of the dgs_receiver crate family.
//!
//! Command-line front end for the digital Gammasphere data receiver. Loads a
//! YAML configuration, wires ctrl-c to a cooperative stop flag, and runs the
//! receive loop on a worker thread until the run completes or the user
//! interrupts it.
//!
//! ```bash
//! # make a template configuration
//! dgs_receiver_cli --path config.yml new
//! # receive a run
//! dgs_receiver_cli --path config.yml
//! ```

use clap::{Arg, Command};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libdgs_receiver::config::Config;
use libdgs_receiver::process::run;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Log to the terminal and to a file; the log file is the record of what
/// happened to a run, so keep it next to the data.
fn setup_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./dgs_receiver.log"))
            .truncate(true)
            .build()
            .expect("Could not create log file sink!"),
    );
    let mut sinks = spdlog::default_logger().sinks().to_vec();
    sinks.push(file_sink);
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sinks(sinks)
            .build()
            .expect("Could not create logger!"),
    );
    spdlog::set_default_logger(logger);
}

fn main() {
    // Create a cli
    let matches = Command::new("dgs_receiver_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the configuration file"),
        )
        .get_matches();

    setup_logging();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        spdlog::info!("Done.");
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Server: {}", config.server_endpoint());
    spdlog::info!("Run Name: {}", config.run_name);
    spdlog::info!("Output Path: {}", config.output_path.to_string_lossy());
    spdlog::info!("Output Mode: {:?}", config.output_mode);
    spdlog::info!(
        "Data Format: {}",
        if config.geb_header_enabled {
            "GEB"
        } else {
            "RAW"
        }
    );
    spdlog::info!("Max Chunk Size: {} bytes", config.max_chunk_bytes);
    spdlog::info!("Trigger Profile: {:?}", config.trigger_profile);

    if !config.is_server_valid() || !config.is_run_name_valid() {
        spdlog::error!("Server address and run name must be set in the config.");
        return;
    }

    // Catch ctrl-c so open files can be closed out properly
    let running = Arc::new(AtomicBool::new(true));
    let interrupt_flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        interrupt_flag.store(false, Ordering::SeqCst);
    }) {
        spdlog::error!("Could not install the interrupt handler: {e}");
        return;
    }

    // Spawn the task!
    let loop_flag = running.clone();
    let handle = std::thread::spawn(move || run(&config, loop_flag));

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(_) => spdlog::info!("Receiver finished cleanly."),
                    Err(e) => spdlog::error!("Receiver stopped with error: {e}"),
                },
                Err(_) => spdlog::error!("Failed to join the receiver task!"),
            }
            break;
        }
    }

    spdlog::info!("Done.");
}
