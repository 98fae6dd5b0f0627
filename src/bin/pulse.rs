use std::path::PathBuf;

use anyhow::Error;

const DEFAULT_DATA_DIR: &str = "/var/lib/pulse";

/// Exit codes: 0 normal, 2 config load failure, 3 encryption-key
/// mismatch.
fn main() {
    init_logger();

    let data_dir = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PULSE_DATA_DIR").ok())
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let data_dir = PathBuf::from(data_dir);

    let config = match pulse::daemon::load(&data_dir) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("pulse: unable to load configuration: {:#}", err);
            let code = if err.downcast_ref::<pulse_config::CryptoFailure>().is_some() {
                3
            } else {
                2
            };
            std::process::exit(code);
        }
    };

    if let Err(err) = run(config) {
        eprintln!("pulse: {:#}", err);
        std::process::exit(1);
    }
}

fn run(config: pulse::daemon::LoadedConfig) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(pulse::daemon::run(config))
}

fn init_logger() {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    builder.format_timestamp_millis();
    builder.init();
}
